//! The engine's foreign call surface.
//!
//! [`EngineApi`] mirrors the fixed C ABI exported by the wick downloader
//! engine. It is a trait so the facades can be driven by either binding:
//!
//! - [`NativeEngine`] loads the real engine library at runtime and routes its
//!   callbacks through `extern "C"` trampolines.
//! - `ScriptedEngine` (feature `scripted`) is an in-process engine with
//!   scripted archives and controllable callback dispatch, for tests.
//!
//! # Callback routing
//!
//! Asynchronous entry points receive a [`CallToken`]. When the engine calls
//! back, the binding hands the raw callback arguments to
//! [`EngineApi::completions`] together with that token. The engine's
//! callbacks carry no context of their own, so a binding that cannot tell two
//! outstanding calls of the same [`AsyncCall`] apart closes its
//! [`EngineApi::call_lane`] for that call until the callback has fired.

pub mod native;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;

pub use native::NativeEngine;
#[cfg(any(test, feature = "scripted"))]
pub use scripted::ScriptedEngine;

use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use crate::bridge::{CallToken, CompletionRegistry};
use crate::error::{BridgeError, BridgeResult};
use crate::gate::CallGate;

static UNGATED: CallGate = CallGate::ungated("call");

/// Opaque engine-owned reference. Null means "no resource".
pub type RawHandle = *mut c_void;

/// Converts a string argument for the C ABI.
///
/// Fails before any foreign call is made if `value` contains a NUL byte.
pub(crate) fn c_string(value: &str, what: &'static str) -> BridgeResult<CString> {
    CString::new(value).map_err(|_| BridgeError::InteriorNul { what })
}

/// Asynchronous entry points, grouped by the callback that answers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncCall {
    /// `initialize` and `initialize_with_manifest`.
    Initialize,
    OpenArchive,
    DownloadFile,
    GetFileBytes,
}

impl AsyncCall {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::OpenArchive => "open_archive",
            Self::DownloadFile => "download_file",
            Self::GetFileBytes => "get_file_bytes",
        }
    }
}

/// The engine's call surface.
///
/// Methods that take a [`RawHandle`] are `unsafe`: the reference must have
/// been produced by the same engine and must not have been released.
/// Asynchronous entry points return `Err` only when the call could not be
/// started; otherwise the engine calls back exactly once with the token.
pub trait EngineApi: Send + Sync {
    /// Registry that this binding delivers callbacks to.
    fn completions(&self) -> &Arc<CompletionRegistry>;

    /// Gate a caller must hold from before issuing `call` until its callback
    /// has fired.
    ///
    /// Bindings that route every callback to its own token need no gate.
    fn call_lane(&self, _call: AsyncCall) -> &CallGate {
        &UNGATED
    }

    /// Starts the engine with its built-in manifests.
    fn initialize(&self, token: CallToken) -> BridgeResult<()>;

    /// Starts the engine from manifest files on disk.
    fn initialize_with_manifest(
        &self,
        app_manifest: &CStr,
        chunk_manifest: &CStr,
        token: CallToken,
    ) -> BridgeResult<()>;

    /// Destroys an engine instance.
    ///
    /// # Safety
    ///
    /// `engine` must be a live engine reference.
    unsafe fn destroy(&self, engine: RawHandle);

    /// Frees an archive.
    ///
    /// # Safety
    ///
    /// `archive` must be a live archive reference.
    unsafe fn free_archive(&self, archive: RawHandle);

    /// Frees a string collection.
    ///
    /// # Safety
    ///
    /// `collection` must be a live collection reference.
    unsafe fn free_string_collection(&self, collection: RawHandle);

    /// Frees a string.
    ///
    /// # Safety
    ///
    /// `string` must be a live string reference.
    unsafe fn free_string(&self, string: RawHandle);

    /// Lists the names of all archives known to the engine.
    ///
    /// # Safety
    ///
    /// `engine` must be a live engine reference.
    unsafe fn get_archive_names(&self, engine: RawHandle) -> RawHandle;

    /// Opens an archive by name, optionally with a decryption key.
    ///
    /// # Safety
    ///
    /// `engine` must be a live engine reference.
    unsafe fn open_archive(
        &self,
        engine: RawHandle,
        name: &CStr,
        key: Option<&CStr>,
        token: CallToken,
    ) -> BridgeResult<()>;

    /// Downloads one file of an archive to the engine's storage.
    ///
    /// # Safety
    ///
    /// `engine` must be a live engine reference.
    unsafe fn download_file(
        &self,
        engine: RawHandle,
        archive_name: &CStr,
        file_name: &CStr,
        token: CallToken,
    ) -> BridgeResult<()>;

    /// Returns the archive's mount path.
    ///
    /// # Safety
    ///
    /// `archive` must be a live archive reference.
    unsafe fn get_archive_mount_path(&self, archive: RawHandle) -> RawHandle;

    /// Lists the file names contained in an archive.
    ///
    /// # Safety
    ///
    /// `archive` must be a live archive reference.
    unsafe fn get_file_names(&self, archive: RawHandle) -> RawHandle;

    /// Reads the contents of one file of an archive.
    ///
    /// # Safety
    ///
    /// `engine` and `archive` must be live references.
    unsafe fn get_file_bytes(
        &self,
        engine: RawHandle,
        archive: RawHandle,
        file_name: &CStr,
        token: CallToken,
    ) -> BridgeResult<()>;

    /// Advances a string collection. Returns null at the end.
    ///
    /// # Safety
    ///
    /// `collection` must be a live collection reference.
    unsafe fn string_collection_next(&self, collection: RawHandle) -> RawHandle;

    /// Returns the engine's most recent diagnostic message, or null.
    fn get_last_error_message(&self) -> RawHandle;
}
