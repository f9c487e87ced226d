//! WickBridge - Async bindings to the wick downloader engine
//!
//! The wick downloader is a native library that lists, opens, decrypts and
//! reads game archives (paks) from a remote content distribution network.
//! This crate wraps its C interface in owned, typed handles and turns its
//! completion callbacks into futures.
//!
//! # Overview
//!
//! - [`Engine`] owns an engine instance: lists archives, opens them, downloads
//!   files and reads file contents.
//! - [`Archive`] owns an opened archive: lists files and reports its mount
//!   path.
//! - Every engine-owned resource lives in a [`handle::Handle`] that releases
//!   it exactly once, on disposal or drop.
//! - Engine failures surface as [`EngineError`] values carrying the engine's
//!   status code category and diagnostic message.
//!
//! The engine can be bound at runtime ([`ffi::NativeEngine`]) or, with the
//! `scripted` feature, simulated in process (`ffi::scripted`).
//!
//! # Example
//!
//! ```ignore
//! use wickbridge::{BridgeConfig, Engine};
//!
//! wickbridge::logging::init(wickbridge::logging::DEFAULT_FILTER)?;
//! let engine = Engine::start(&BridgeConfig::load()?).await?;
//! let archive = engine.open_archive("pakchunk0", None).await?;
//! let readme = engine.read_file_bytes(&archive, "readme.txt").await?;
//! ```

pub mod archive;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod gate;
pub mod handle;
pub mod logging;

pub use archive::Archive;
pub use bridge::{CallToken, Completion, CompletionRegistry};
pub use config::{BridgeConfig, ManifestPaths};
pub use engine::Engine;
pub use error::{BridgeError, BridgeResult, EngineError, ErrorKind};
pub use ffi::{AsyncCall, EngineApi};
pub use gate::CallPolicy;
