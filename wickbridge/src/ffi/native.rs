//! Runtime binding to the native wick downloader library.
//!
//! The library is opened with `libloading` and every export is resolved up
//! front, so a missing symbol fails [`NativeEngine::load`] instead of the
//! first call that needs it.
//!
//! # Callbacks
//!
//! The engine's callbacks receive only their result: `(resource, status)`,
//! `(status)` or `(data, length, status)`. Nothing identifies the call they
//! answer, so each [`AsyncCall`] gets one process-wide lane:
//!
//! - a serialized [`CallGate`], returned from [`EngineApi::call_lane`], that
//!   the facades hold until the callback has fired;
//! - a slot holding the [`CallToken`] of the one outstanding call, armed
//!   right before the export is invoked.
//!
//! The `extern "C"` trampoline for a lane takes the token out of the slot and
//! forwards into the process-wide [`CompletionRegistry`]. Calls of different
//! kinds still overlap freely; two calls of the same kind queue on the lane
//! whatever the handle's [`CallPolicy`](crate::CallPolicy). Panics are caught
//! at the trampoline so they never unwind into engine frames.

use std::ffi::{c_char, CStr, CString};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use libloading::Library;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{AsyncCall, EngineApi, RawHandle};
use crate::bridge::{CallToken, CallbackArgs, CompletionRegistry};
use crate::error::{BridgeError, BridgeResult};
use crate::gate::{CallGate, CallPolicy};

/// Base name of the engine library; see [`libloading::library_filename`].
pub const LIBRARY_NAME: &str = "wick_downloader";

type ResourceCallback = extern "C" fn(resource: RawHandle, status: u32);
type StatusCallback = extern "C" fn(status: u32);
type DataCallback = extern "C" fn(data: *mut u8, length: u32, status: u32);

type InitializeFn = unsafe extern "C" fn(callback: ResourceCallback);
type InitializeWithManifestFn = unsafe extern "C" fn(
    app_manifest: *const c_char,
    chunk_manifest: *const c_char,
    callback: ResourceCallback,
);
type ReleaseFn = unsafe extern "C" fn(resource: RawHandle);
type QueryFn = unsafe extern "C" fn(resource: RawHandle) -> RawHandle;
type OpenArchiveFn = unsafe extern "C" fn(
    engine: RawHandle,
    name: *const c_char,
    key: *const c_char,
    callback: ResourceCallback,
);
type DownloadFileFn = unsafe extern "C" fn(
    engine: RawHandle,
    archive_name: *const c_char,
    file_name: *const c_char,
    callback: StatusCallback,
);
type GetFileBytesFn = unsafe extern "C" fn(
    engine: RawHandle,
    archive: RawHandle,
    file_name: *const c_char,
    callback: DataCallback,
);
type LastErrorFn = unsafe extern "C" fn() -> RawHandle;

/// Resolved exports. Only valid while the owning [`Library`] is loaded.
struct Exports {
    initialize: InitializeFn,
    initialize_with_manifest: InitializeWithManifestFn,
    destroy: ReleaseFn,
    free_archive: ReleaseFn,
    free_string_collection: ReleaseFn,
    free_string: ReleaseFn,
    get_archive_names: QueryFn,
    open_archive: OpenArchiveFn,
    download_file: DownloadFileFn,
    get_archive_mount_path: QueryFn,
    get_file_names: QueryFn,
    get_file_bytes: GetFileBytesFn,
    string_collection_next: QueryFn,
    get_last_error_message: LastErrorFn,
}

impl Exports {
    /// # Safety
    ///
    /// The library must export each symbol with the signature declared above.
    unsafe fn resolve(library: &Library) -> BridgeResult<Self> {
        Ok(Self {
            initialize: symbol(library, "initialize")?,
            initialize_with_manifest: symbol(library, "initialize_with_manifest")?,
            destroy: symbol(library, "destroy")?,
            free_archive: symbol(library, "free_pak")?,
            free_string_collection: symbol(library, "free_vec_string")?,
            free_string: symbol(library, "free_string")?,
            get_archive_names: symbol(library, "get_pak_names")?,
            open_archive: symbol(library, "get_pak")?,
            download_file: symbol(library, "download_file")?,
            get_archive_mount_path: symbol(library, "get_pak_mount")?,
            get_file_names: symbol(library, "get_file_names")?,
            get_file_bytes: symbol(library, "get_file_data")?,
            string_collection_next: symbol(library, "vec_string_get_next")?,
            get_last_error_message: symbol(library, "get_last_error")?,
        })
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &'static str) -> BridgeResult<T> {
    library
        .get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|err| BridgeError::MissingSymbol {
            symbol: name,
            reason: err.to_string(),
        })
}

/// Matches the context-free callbacks of one [`AsyncCall`] to their token.
struct Lane {
    call: AsyncCall,
    gate: CallGate,
    armed: Mutex<Option<CallToken>>,
}

impl Lane {
    fn new(call: AsyncCall) -> Self {
        Self {
            call,
            gate: CallGate::new(call.as_str(), CallPolicy::Serialized),
            armed: Mutex::new(None),
        }
    }

    /// Record the token the next callback on this lane answers.
    fn arm(&self, token: CallToken) {
        if let Some(stale) = self.armed.lock().replace(token) {
            warn!(
                call = self.call.as_str(),
                stale = stale.id(),
                token = token.id(),
                "Lane armed while a call was still unanswered"
            );
        }
    }

    fn take(&self) -> Option<CallToken> {
        self.armed.lock().take()
    }
}

struct Lanes {
    initialize: Lane,
    open_archive: Lane,
    download_file: Lane,
    get_file_bytes: Lane,
}

impl Lanes {
    fn get(&self, call: AsyncCall) -> &Lane {
        match call {
            AsyncCall::Initialize => &self.initialize,
            AsyncCall::OpenArchive => &self.open_archive,
            AsyncCall::DownloadFile => &self.download_file,
            AsyncCall::GetFileBytes => &self.get_file_bytes,
        }
    }
}

/// Lanes shared by every loaded library, since the trampolines are static.
fn lanes() -> &'static Lanes {
    static LANES: OnceLock<Lanes> = OnceLock::new();
    LANES.get_or_init(|| Lanes {
        initialize: Lane::new(AsyncCall::Initialize),
        open_archive: Lane::new(AsyncCall::OpenArchive),
        download_file: Lane::new(AsyncCall::DownloadFile),
        get_file_bytes: Lane::new(AsyncCall::GetFileBytes),
    })
}

/// [`EngineApi`] backed by the native engine library.
pub struct NativeEngine {
    exports: Exports,
    path: PathBuf,
    // Keeps the resolved function pointers valid. `None` for exports that
    // live in this process.
    _library: Option<Library>,
}

impl NativeEngine {
    /// Load the engine library at `path` and resolve its exports.
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initialisers. The engine
        // library is trusted not to have unsound ones.
        let library = unsafe { Library::new(path) }.map_err(|err| BridgeError::LibraryLoad {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        // SAFETY: the exports are declared with the engine's C signatures.
        let exports = unsafe { Exports::resolve(&library)? };

        info!(path = %path.display(), "Loaded engine library");
        Ok(Self {
            exports,
            path: path.to_path_buf(),
            _library: Some(library),
        })
    }

    #[cfg(test)]
    fn in_process(exports: Exports) -> Self {
        Self {
            exports,
            path: PathBuf::new(),
            _library: None,
        }
    }

    /// Path the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEngine")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

extern "C" fn on_initialized(engine: RawHandle, status: u32) {
    deliver(
        AsyncCall::Initialize,
        CallbackArgs::Resource {
            raw: engine,
            status,
        },
    );
}

extern "C" fn on_archive_opened(archive: RawHandle, status: u32) {
    deliver(
        AsyncCall::OpenArchive,
        CallbackArgs::Resource {
            raw: archive,
            status,
        },
    );
}

extern "C" fn on_download_finished(status: u32) {
    deliver(AsyncCall::DownloadFile, CallbackArgs::Status { status });
}

extern "C" fn on_file_data(data: *mut u8, length: u32, status: u32) {
    deliver(
        AsyncCall::GetFileBytes,
        CallbackArgs::Data {
            data: data.cast_const(),
            len: length as usize,
            status,
        },
    );
}

fn deliver(call: AsyncCall, args: CallbackArgs) {
    let token = match lanes().get(call).take() {
        Some(token) => token,
        None => {
            warn!(
                call = call.as_str(),
                status = args.status(),
                "Engine callback with no outstanding call"
            );
            return;
        }
    };
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
        CompletionRegistry::global().complete(token, args)
    }));
    if delivered.is_err() {
        error!(
            call = call.as_str(),
            token = token.id(),
            status = args.status(),
            "Panic while completing engine callback"
        );
    }
}

impl EngineApi for NativeEngine {
    fn completions(&self) -> &Arc<CompletionRegistry> {
        CompletionRegistry::global()
    }

    fn call_lane(&self, call: AsyncCall) -> &CallGate {
        &lanes().get(call).gate
    }

    fn initialize(&self, token: CallToken) -> BridgeResult<()> {
        lanes().initialize.arm(token);
        // SAFETY: export resolved from the loaded library; the callback is a
        // static trampoline.
        unsafe { (self.exports.initialize)(on_initialized) };
        Ok(())
    }

    fn initialize_with_manifest(
        &self,
        app_manifest: &CStr,
        chunk_manifest: &CStr,
        token: CallToken,
    ) -> BridgeResult<()> {
        lanes().initialize.arm(token);
        // SAFETY: both strings are NUL-terminated and outlive the call; the
        // engine copies them before returning.
        unsafe {
            (self.exports.initialize_with_manifest)(
                app_manifest.as_ptr(),
                chunk_manifest.as_ptr(),
                on_initialized,
            )
        };
        Ok(())
    }

    unsafe fn destroy(&self, engine: RawHandle) {
        (self.exports.destroy)(engine)
    }

    unsafe fn free_archive(&self, archive: RawHandle) {
        (self.exports.free_archive)(archive)
    }

    unsafe fn free_string_collection(&self, collection: RawHandle) {
        (self.exports.free_string_collection)(collection)
    }

    unsafe fn free_string(&self, string: RawHandle) {
        (self.exports.free_string)(string)
    }

    unsafe fn get_archive_names(&self, engine: RawHandle) -> RawHandle {
        (self.exports.get_archive_names)(engine)
    }

    unsafe fn open_archive(
        &self,
        engine: RawHandle,
        name: &CStr,
        key: Option<&CStr>,
        token: CallToken,
    ) -> BridgeResult<()> {
        // The export reads the key unconditionally; no key is an empty one.
        let no_key = CString::default();
        let key = key.unwrap_or(no_key.as_c_str());
        lanes().open_archive.arm(token);
        (self.exports.open_archive)(engine, name.as_ptr(), key.as_ptr(), on_archive_opened);
        Ok(())
    }

    unsafe fn download_file(
        &self,
        engine: RawHandle,
        archive_name: &CStr,
        file_name: &CStr,
        token: CallToken,
    ) -> BridgeResult<()> {
        lanes().download_file.arm(token);
        (self.exports.download_file)(
            engine,
            archive_name.as_ptr(),
            file_name.as_ptr(),
            on_download_finished,
        );
        Ok(())
    }

    unsafe fn get_archive_mount_path(&self, archive: RawHandle) -> RawHandle {
        (self.exports.get_archive_mount_path)(archive)
    }

    unsafe fn get_file_names(&self, archive: RawHandle) -> RawHandle {
        (self.exports.get_file_names)(archive)
    }

    unsafe fn get_file_bytes(
        &self,
        engine: RawHandle,
        archive: RawHandle,
        file_name: &CStr,
        token: CallToken,
    ) -> BridgeResult<()> {
        lanes().get_file_bytes.arm(token);
        (self.exports.get_file_bytes)(engine, archive, file_name.as_ptr(), on_file_data);
        Ok(())
    }

    unsafe fn string_collection_next(&self, collection: RawHandle) -> RawHandle {
        (self.exports.string_collection_next)(collection)
    }

    fn get_last_error_message(&self) -> RawHandle {
        // SAFETY: takes no arguments; returns an engine-owned string or null.
        unsafe { (self.exports.get_last_error_message)() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManifestPaths;
    use crate::engine::Engine;
    use crate::error::ErrorKind;
    use futures::FutureExt;
    use std::future::Future;
    use std::ptr;
    use std::time::Duration;

    /// Exports with the engine's C signatures and no per-call context.
    mod fake {
        use super::*;
        use std::sync::Mutex;
        use std::thread;

        pub(super) const ENGINE: usize = 0x5000;
        pub(super) const ARCHIVE: usize = 0x7000;

        pub(super) static DESTROYED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        pub(super) static FREED_ARCHIVES: Mutex<Vec<usize>> = Mutex::new(Vec::new());

        /// Calls back before returning.
        unsafe extern "C" fn initialize(callback: ResourceCallback) {
            callback(ENGINE as RawHandle, 0);
        }

        unsafe extern "C" fn initialize_with_manifest(
            _app: *const c_char,
            _chunk: *const c_char,
            callback: ResourceCallback,
        ) {
            thread::spawn(move || callback(ENGINE as RawHandle, 0));
        }

        unsafe extern "C" fn destroy(engine: RawHandle) {
            DESTROYED.lock().unwrap().push(engine as usize);
        }

        unsafe extern "C" fn free_pak(archive: RawHandle) {
            FREED_ARCHIVES.lock().unwrap().push(archive as usize);
        }

        unsafe extern "C" fn release(_resource: RawHandle) {}

        unsafe extern "C" fn empty(_resource: RawHandle) -> RawHandle {
            ptr::null_mut()
        }

        /// Empty key: status 9. Key `0xBAD`: status 10.
        unsafe extern "C" fn get_pak(
            _engine: RawHandle,
            _name: *const c_char,
            key: *const c_char,
            callback: ResourceCallback,
        ) {
            let status = match CStr::from_ptr(key).to_bytes() {
                b"" => 9,
                b"0xBAD" => 10,
                _ => 0,
            };
            thread::spawn(move || {
                if status == 0 {
                    callback(ARCHIVE as RawHandle, 0)
                } else {
                    callback(ptr::null_mut(), status)
                }
            });
        }

        unsafe extern "C" fn download_file(
            _engine: RawHandle,
            _archive_name: *const c_char,
            _file_name: *const c_char,
            callback: StatusCallback,
        ) {
            callback(0);
        }

        /// Lends the file's own name as its contents.
        unsafe extern "C" fn get_file_data(
            _engine: RawHandle,
            _archive: RawHandle,
            file_name: *const c_char,
            callback: DataCallback,
        ) {
            let mut contents = CStr::from_ptr(file_name).to_bytes().to_vec();
            thread::spawn(move || {
                callback(contents.as_mut_ptr(), contents.len() as u32, 0);
            });
        }

        unsafe extern "C" fn get_last_error() -> RawHandle {
            ptr::null_mut()
        }

        pub(super) fn exports() -> Exports {
            Exports {
                initialize,
                initialize_with_manifest,
                destroy,
                free_archive: free_pak,
                free_string_collection: release,
                free_string: release,
                get_archive_names: empty,
                open_archive: get_pak,
                download_file,
                get_archive_mount_path: empty,
                get_file_names: empty,
                get_file_bytes: get_file_data,
                string_collection_next: empty,
                get_last_error_message: get_last_error,
            }
        }
    }

    fn fake_engine() -> Arc<dyn EngineApi> {
        Arc::new(NativeEngine::in_process(fake::exports()))
    }

    async fn within<F: Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("engine callback was not routed to its call")
    }

    #[test]
    fn test_load_nonexistent_library_fails() {
        let err = NativeEngine::load("/nonexistent/libwick_downloader_missing.so").unwrap_err();

        match err {
            BridgeError::LibraryLoad { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/libwick_downloader_missing.so"));
            }
            other => panic!("expected LibraryLoad, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initialize_resolves_from_inline_callback() {
        let engine = within(Engine::initialize(fake_engine())).await.unwrap();
        assert!(engine.is_valid());

        engine.dispose();

        assert!(fake::DESTROYED.lock().unwrap().contains(&fake::ENGINE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_calls_resolve_from_engine_threads() {
        let manifests = ManifestPaths::new("app.manifest", "chunk.manifest");
        let engine = within(Engine::initialize_with_manifests(fake_engine(), &manifests))
            .await
            .unwrap();

        let archive = within(engine.open_archive("pakchunk0", Some("0x1234")))
            .await
            .unwrap();
        let bytes = within(engine.read_file_bytes(&archive, "readme.txt"))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"readme.txt");
        within(engine.download_file("pakchunk0", "readme.txt"))
            .await
            .unwrap();

        archive.dispose();
        assert!(fake::FREED_ARCHIVES.lock().unwrap().contains(&fake::ARCHIVE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_same_kind_calls_never_swap_results() {
        let engine = within(Engine::initialize_with(
            fake_engine(),
            None,
            CallPolicy::Concurrent,
        ))
        .await
        .unwrap();
        let archive = within(engine.open_archive("pakchunk0", Some("0x1234")))
            .await
            .unwrap();

        let (first, second) = within(async {
            tokio::join!(
                engine.read_file_bytes(&archive, "first.bin"),
                engine.read_file_bytes(&archive, "second.bin"),
            )
        })
        .await;

        assert_eq!(&first.unwrap()[..], b"first.bin");
        assert_eq!(&second.unwrap()[..], b"second.bin");
    }

    #[tokio::test]
    async fn test_open_failures_translate_status() {
        let engine = within(Engine::initialize(fake_engine())).await.unwrap();

        let err = within(engine.open_archive("pakchunk0", Some("0xBAD")))
            .await
            .unwrap_err();
        assert_eq!(err.engine_kind(), Some(ErrorKind::Decrypt));
        assert_eq!(err.to_string(), "Decrypt Error: no diagnostic message");

        // A missing key crosses as an empty string.
        let err = within(engine.open_archive("pakchunk0", None))
            .await
            .unwrap_err();
        assert_eq!(err.engine_kind(), Some(ErrorKind::Key));
    }

    #[tokio::test]
    async fn test_callback_without_outstanding_call_is_ignored() {
        let lane = &lanes().download_file;
        // Holding the gate keeps every other caller from arming the lane.
        let _pass = lane.gate.enter().await;

        on_download_finished(0);

        assert!(lane.take().is_none());
    }

    #[tokio::test]
    async fn test_data_trampoline_passes_lent_buffer() {
        let lane = &lanes().get_file_bytes;
        let _pass = lane.gate.enter().await;
        let completion = CompletionRegistry::global().issue(
            "get_file_bytes",
            |token| {
                lane.arm(token);
                Ok(())
            },
            |args| {
                let (data, len) = args.data();
                Ok(unsafe { std::slice::from_raw_parts(data, len) }.to_vec())
            },
        );

        let mut buffer = *b"pak";
        on_file_data(buffer.as_mut_ptr(), 3, 0);

        assert_eq!(completion.now_or_never().unwrap().unwrap(), b"pak".to_vec());
    }

    #[tokio::test]
    async fn test_trampoline_contains_panics() {
        let lane = &lanes().open_archive;
        let _pass = lane.gate.enter().await;
        let completion = CompletionRegistry::global().issue::<(), _, _>(
            "open_archive",
            |token| {
                lane.arm(token);
                Ok(())
            },
            |_| panic!("completion handler failure"),
        );

        on_archive_opened(ptr::null_mut(), 0);

        assert!(matches!(
            completion.now_or_never(),
            Some(Err(BridgeError::Abandoned))
        ));
    }
}
