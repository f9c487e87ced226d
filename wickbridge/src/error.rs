//! Error types for the engine bridge.
//!
//! The native engine reports failures as a small positive status code plus an
//! out-of-band "last error" string. [`EngineError`] is the translated, immutable
//! form of one such failure. [`BridgeError`] is the crate-wide error type: it
//! wraps engine failures and adds the failures that can happen on this side of
//! the boundary (bad arguments, released handles, library loading).

use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::ffi::EngineApi;
use crate::handle::StringHandle;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Message used when the engine reports a failure but has no diagnostic text.
pub const NO_DIAGNOSTIC_MESSAGE: &str = "no diagnostic message";

/// Category of an engine failure, keyed by the engine's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// HTTP transport failure (code 1).
    Http,
    /// Malformed header string (code 2).
    HeaderString,
    /// HTTP request construction or execution failure (code 3).
    HttpRequest,
    /// Invalid UTF-8 in engine data (code 4).
    Utf8,
    /// Manifest JSON could not be parsed (code 5).
    Json,
    /// Archive reader failure (code 6).
    Reader,
    /// Engine async runtime failure (code 7).
    Async,
    /// Archive wire protocol (JWP) failure (code 8).
    ArchiveWireProtocol,
    /// Missing or malformed archive key (code 9).
    Key,
    /// Archive decryption failed, usually a wrong key (code 10).
    Decrypt,
    /// Hex decoding failure (code 11).
    Hex,
    /// Any other nonzero status code.
    Unknown(u32),
}

impl ErrorKind {
    /// Maps an engine status code to a kind.
    ///
    /// Returns `None` for `0`, which is the success status and never denotes
    /// an error.
    pub fn from_status(status: u32) -> Option<Self> {
        NonZeroU32::new(status).map(Self::from_code)
    }

    /// Maps a nonzero status code to a kind.
    pub fn from_code(code: NonZeroU32) -> Self {
        match code.get() {
            1 => Self::Http,
            2 => Self::HeaderString,
            3 => Self::HttpRequest,
            4 => Self::Utf8,
            5 => Self::Json,
            6 => Self::Reader,
            7 => Self::Async,
            8 => Self::ArchiveWireProtocol,
            9 => Self::Key,
            10 => Self::Decrypt,
            11 => Self::Hex,
            other => Self::Unknown(other),
        }
    }

    /// The status code this kind was derived from.
    pub fn code(&self) -> u32 {
        match self {
            Self::Http => 1,
            Self::HeaderString => 2,
            Self::HttpRequest => 3,
            Self::Utf8 => 4,
            Self::Json => 5,
            Self::Reader => 6,
            Self::Async => 7,
            Self::ArchiveWireProtocol => 8,
            Self::Key => 9,
            Self::Decrypt => 10,
            Self::Hex => 11,
            Self::Unknown(code) => *code,
        }
    }

    /// Human-readable name used as the prefix of error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Http => "HTTP Error",
            Self::HeaderString => "Header String Error",
            Self::HttpRequest => "HTTP Request Error",
            Self::Utf8 => "UTF-8 Error",
            Self::Json => "JSON Error",
            Self::Reader => "Reader Error",
            Self::Async => "Async Error",
            Self::ArchiveWireProtocol => "JWP Error",
            Self::Key => "Key Error",
            Self::Decrypt => "Decrypt Error",
            Self::Hex => "Hex Error",
            Self::Unknown(_) => "Unknown Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failure reported by the native engine.
///
/// Constructed once per failure and never mutated. Displays as
/// `"<kind name>: <message>"`, e.g. `"Decrypt Error: bad key"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
}

impl EngineError {
    /// Translates a nonzero status code and its diagnostic message.
    pub fn translate(status: NonZeroU32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_code(status),
            message: message.into(),
        }
    }

    /// The failure category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The raw status code reported by the engine.
    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    /// The engine's diagnostic message, without the kind prefix.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Checks an engine status code.
///
/// Status `0` short-circuits to `Ok(())` without touching the engine. Any
/// other status queries the engine's last error message (releasing the
/// returned string immediately) and translates it.
pub fn check_status(api: &Arc<dyn EngineApi>, status: u32) -> Result<(), EngineError> {
    match NonZeroU32::new(status) {
        None => Ok(()),
        Some(code) => Err(EngineError::translate(code, last_error_message(api))),
    }
}

/// Reads and releases the engine's last diagnostic string.
fn last_error_message(api: &Arc<dyn EngineApi>) -> String {
    let handle = StringHandle::wrap(Arc::clone(api), api.get_last_error_message());
    handle
        .into_string()
        .unwrap_or_else(|| NO_DIAGNOSTIC_MESSAGE.to_string())
}

/// Errors that can occur when driving the engine through the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The engine reported a failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A string argument could not be passed as a C string.
    #[error("{what} contains an interior NUL byte")]
    InteriorNul { what: &'static str },

    /// A path argument is not valid UTF-8.
    #[error("path is not valid UTF-8: {}", path.display())]
    NonUtf8Path { path: PathBuf },

    /// The handle is null or has already been released.
    #[error("{0} handle is invalid or has been released")]
    Released(&'static str),

    /// The engine reported success but returned no resource.
    #[error("engine returned a null {0} with a success status")]
    NullResult(&'static str),

    /// A call on the handle is still outstanding and calls are serialized.
    #[error("{0} handle is busy with an outstanding call")]
    Busy(&'static str),

    /// The completion was torn down without the engine calling back.
    #[error("call was abandoned before the engine called back")]
    Abandoned,

    /// The native engine library could not be loaded.
    #[error("failed to load engine library {}: {reason}", path.display())]
    LibraryLoad { path: PathBuf, reason: String },

    /// The native engine library lacks a required export.
    #[error("engine library is missing symbol `{symbol}`: {reason}")]
    MissingSymbol { symbol: &'static str, reason: String },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The logging subscriber could not be installed.
    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

impl BridgeError {
    /// Returns the engine error kind if this error came from the engine.
    pub fn engine_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Engine(err) => Some(err.kind()),
            _ => None,
        }
    }
}
