//! Engine facade.
//!
//! [`Engine`] is the entry point of the bridge. It owns one engine instance
//! and exposes the engine's operations as plain methods (synchronous queries)
//! and `async` methods (calls the engine answers through a callback).
//!
//! # Example
//!
//! ```ignore
//! use wickbridge::{BridgeConfig, Engine};
//!
//! let engine = Engine::start(&BridgeConfig::load()?).await?;
//! for name in engine.list_archive_names()? {
//!     println!("{name}");
//! }
//!
//! let archive = engine.open_archive("pakchunk0", Some("0x1234...")).await?;
//! for file in archive.list_file_names()? {
//!     let bytes = engine.read_file_bytes(&archive, &file).await?;
//!     println!("{file}: {} bytes", bytes.len());
//! }
//! ```
//!
//! # Failure scoping
//!
//! A failed call only fails that call; the engine stays usable. A failed
//! initialization leaves no engine behind: a reference delivered together
//! with an error status is released before the error is returned.

use std::fmt;
use std::slice;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::config::{BridgeConfig, ManifestPaths};
use crate::error::{check_status, BridgeError, BridgeResult};
use crate::ffi::{c_string, AsyncCall, EngineApi, NativeEngine};
use crate::gate::{CallGate, CallPolicy, GatePass};
use crate::handle::{ArchiveKind, EngineKind, Handle, ResourceKind, StringCursor};

/// A running engine instance.
pub struct Engine {
    handle: Handle<EngineKind>,
    gate: CallGate,
    policy: CallPolicy,
}

impl Engine {
    /// Initialize an engine with its built-in manifests.
    pub async fn initialize(api: Arc<dyn EngineApi>) -> BridgeResult<Self> {
        Self::initialize_with(api, None, CallPolicy::default()).await
    }

    /// Initialize an engine from manifest files.
    pub async fn initialize_with_manifests(
        api: Arc<dyn EngineApi>,
        manifests: &ManifestPaths,
    ) -> BridgeResult<Self> {
        Self::initialize_with(api, Some(manifests), CallPolicy::default()).await
    }

    /// Initialize an engine, optionally from manifest files, under `policy`.
    pub async fn initialize_with(
        api: Arc<dyn EngineApi>,
        manifests: Option<&ManifestPaths>,
        policy: CallPolicy,
    ) -> BridgeResult<Self> {
        let manifest_args = manifests.map(ManifestPaths::to_c_strings).transpose()?;
        let callback_api = Arc::clone(&api);

        let lane = api.call_lane(AsyncCall::Initialize).enter().await;

        let completion = api.completions().issue(
            "initialize",
            |token| match &manifest_args {
                Some((app, chunk)) => api.initialize_with_manifest(app, chunk, token),
                None => api.initialize(token),
            },
            move |args| {
                let _lane = lane;
                let handle = Handle::<EngineKind>::wrap(Arc::clone(&callback_api), args.resource());
                if let Err(err) = check_status(&callback_api, args.status()) {
                    if handle.is_valid() {
                        warn!(error = %err, "Disposing engine delivered with a failure status");
                    }
                    return Err(err.into());
                }
                if !handle.is_valid() {
                    return Err(BridgeError::NullResult(EngineKind::NAME));
                }
                Ok(handle)
            },
        );
        let handle = completion.await?;

        info!(
            manifests = manifests.is_some(),
            policy = %policy,
            "Engine initialized"
        );
        Ok(Self {
            handle,
            gate: CallGate::new(EngineKind::NAME, policy),
            policy,
        })
    }

    /// Load the native engine library named by `config` and initialize it.
    pub async fn start(config: &BridgeConfig) -> BridgeResult<Self> {
        let api: Arc<dyn EngineApi> = Arc::new(NativeEngine::load(&config.library_path)?);
        Self::initialize_with(api, config.manifests.as_ref(), config.call_policy).await
    }

    /// Returns true until the engine is disposed.
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Call policy of this engine and the archives it opens.
    pub fn policy(&self) -> CallPolicy {
        self.policy
    }

    /// Names of all archives known to the engine.
    pub fn list_archive_names(&self) -> BridgeResult<Vec<String>> {
        let raw = self.handle.raw()?;
        let _pass = self.gate.try_enter()?;
        let api = self.handle.api();
        // SAFETY: `raw` stays live while `self.handle` owns it.
        let collection = unsafe { api.get_archive_names(raw) };
        Ok(StringCursor::new(Arc::clone(api), collection).drain())
    }

    /// Open an archive, with its decryption key if it is encrypted.
    pub async fn open_archive(&self, name: &str, key: Option<&str>) -> BridgeResult<Archive> {
        let c_name = c_string(name, "archive name")?;
        let c_key = key.map(|key| c_string(key, "archive key")).transpose()?;

        let pass = self.gate.enter().await;
        let lane = self.lane(AsyncCall::OpenArchive).await;
        let completion = {
            let engine = self.handle.raw()?;
            let api = self.handle.api();
            let callback_api = Arc::clone(api);
            api.completions().issue(
                "open_archive",
                // SAFETY: `engine` is live; the pass keeps other calls off it.
                |token| unsafe { api.open_archive(engine, &c_name, c_key.as_deref(), token) },
                move |args| {
                    let _passes = (pass, lane);
                    let handle =
                        Handle::<ArchiveKind>::wrap(Arc::clone(&callback_api), args.resource());
                    check_status(&callback_api, args.status())?;
                    if !handle.is_valid() {
                        return Err(BridgeError::NullResult(ArchiveKind::NAME));
                    }
                    Ok(handle)
                },
            )
        };
        let handle = completion.await?;

        debug!(archive = name, encrypted = key.is_some(), "Opened archive");
        Ok(Archive::new(handle, name.to_string(), self.policy))
    }

    /// Download one file of an archive into the engine's storage.
    pub async fn download_file(&self, archive_name: &str, file_name: &str) -> BridgeResult<()> {
        let c_archive = c_string(archive_name, "archive name")?;
        let c_file = c_string(file_name, "file name")?;

        let pass = self.gate.enter().await;
        let lane = self.lane(AsyncCall::DownloadFile).await;
        let completion = {
            let engine = self.handle.raw()?;
            let api = self.handle.api();
            let callback_api = Arc::clone(api);
            api.completions().issue(
                "download_file",
                // SAFETY: `engine` is live; the pass keeps other calls off it.
                |token| unsafe { api.download_file(engine, &c_archive, &c_file, token) },
                move |args| {
                    let _passes = (pass, lane);
                    check_status(&callback_api, args.status())?;
                    Ok(())
                },
            )
        };
        completion.await?;

        debug!(archive = archive_name, file = file_name, "Downloaded file");
        Ok(())
    }

    /// Read the contents of one file of `archive`.
    ///
    /// The engine lends the buffer only for the duration of its callback, so
    /// the contents are copied into the returned [`Bytes`].
    pub async fn read_file_bytes(&self, archive: &Archive, file_name: &str) -> BridgeResult<Bytes> {
        let c_file = c_string(file_name, "file name")?;

        let engine_pass = self.gate.enter().await;
        let archive_pass = archive.gate().enter().await;
        let lane = self.lane(AsyncCall::GetFileBytes).await;
        let completion = {
            let engine = self.handle.raw()?;
            let archive_raw = archive.handle().raw()?;
            let api = self.handle.api();
            let callback_api = Arc::clone(api);
            api.completions().issue(
                "get_file_bytes",
                // SAFETY: both references are live; the passes keep other
                // calls off them.
                |token| unsafe { api.get_file_bytes(engine, archive_raw, &c_file, token) },
                move |args| {
                    let _passes = (engine_pass, archive_pass, lane);
                    check_status(&callback_api, args.status())?;
                    let (data, len) = args.data();
                    copy_lent_bytes(data, len)
                },
            )
        };
        let bytes = completion.await?;

        debug!(
            archive = archive.name(),
            file = file_name,
            len = bytes.len(),
            "Read file bytes"
        );
        Ok(bytes)
    }

    /// Waits until the binding can route a callback for `call`.
    async fn lane(&self, call: AsyncCall) -> GatePass {
        self.handle.api().call_lane(call).enter().await
    }

    /// Destroy the engine instance.
    ///
    /// Archives opened from this engine should be disposed first.
    pub fn dispose(mut self) {
        debug!("Disposing engine");
        self.handle.release();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("handle", &self.handle)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Copies a buffer lent to a data callback.
fn copy_lent_bytes(data: *const u8, len: usize) -> BridgeResult<Bytes> {
    if len == 0 {
        return Ok(Bytes::new());
    }
    if data.is_null() {
        return Err(BridgeError::NullResult("file data"));
    }
    // SAFETY: the engine guarantees `len` readable bytes at `data` until the
    // callback returns, and this runs inside the callback.
    let lent = unsafe { slice::from_raw_parts(data, len) };
    Ok(Bytes::copy_from_slice(lent))
}
