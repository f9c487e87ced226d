//! Deterministic in-process engine.
//!
//! [`ScriptedEngine`] implements [`EngineApi`] against a fixed script of
//! archives and files, so the facades can be exercised without the native
//! library. Beyond answering calls it keeps books on every resource it hands
//! out: releases of unknown or already released references are recorded as
//! contract violations instead of corrupting memory, and [`ResourceStats`]
//! reports what is still alive.
//!
//! # Callback dispatch
//!
//! | [`Dispatch`] | callback fires |
//! |---|---|
//! | `Inline` | before the foreign call returns, on the caller's thread |
//! | `Thread` | on a freshly spawned thread |
//! | `Deferred` | when the test calls [`ScriptedEngine::fire_next`] and friends |
//!
//! # Example
//!
//! ```ignore
//! let scripted = ScriptedEngine::new(
//!     EngineScript::new().with_archive(
//!         ArchiveScript::new("base").with_key("0xABCD").with_file("readme.txt", "hi"),
//!     ),
//! );
//! let engine = Engine::initialize(scripted.clone()).await?;
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{EngineApi, RawHandle};
use crate::bridge::{CallToken, CallbackArgs, CompletionRegistry};
use crate::error::BridgeResult;

const STATUS_OK: u32 = 0;
const STATUS_READER: u32 = 6;
const STATUS_ASYNC: u32 = 7;
const STATUS_KEY: u32 = 9;
const STATUS_DECRYPT: u32 = 10;

thread_local! {
    // The engine's last error is per thread: it is set on the thread that
    // delivers a callback, right before the callback runs.
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// When scripted callbacks are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// Before the foreign call returns.
    #[default]
    Inline,
    /// On a spawned thread.
    Thread,
    /// Queued until the test fires it.
    Deferred,
}

/// One archive known to a scripted engine.
#[derive(Debug, Clone)]
pub struct ArchiveScript {
    name: String,
    key: Option<String>,
    mount_path: String,
    files: Vec<(String, Arc<[u8]>)>,
    open_failure: Option<Failure>,
}

impl ArchiveScript {
    /// An unencrypted, empty archive mounted at `../../../<name>/`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mount_path = format!("../../../{}/", name);
        Self {
            name,
            key: None,
            mount_path,
            files: Vec::new(),
            open_failure: None,
        }
    }

    /// Require `key` to open the archive.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the mount path.
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    /// Add a file. Files are listed in insertion order.
    pub fn with_file(mut self, name: impl Into<String>, contents: impl AsRef<[u8]>) -> Self {
        self.files.push((name.into(), Arc::from(contents.as_ref())));
        self
    }

    /// Make every open of this archive fail with `status` and `message`.
    ///
    /// With `with_handle`, the engine also delivers a live archive reference
    /// alongside the error status.
    pub fn failing_open(
        mut self,
        status: u32,
        message: impl Into<String>,
        with_handle: bool,
    ) -> Self {
        self.open_failure = Some(Failure {
            status,
            message: message.into(),
            with_handle,
        });
        self
    }

    fn file(&self, name: &str) -> Option<&Arc<[u8]>> {
        self.files
            .iter()
            .find(|(file, _)| file == name)
            .map(|(_, contents)| contents)
    }
}

#[derive(Debug, Clone)]
struct Failure {
    status: u32,
    message: String,
    with_handle: bool,
}

/// Behaviour of a [`ScriptedEngine`].
#[derive(Debug, Clone, Default)]
pub struct EngineScript {
    archives: Vec<ArchiveScript>,
    init_failure: Option<Failure>,
    dispatch: Dispatch,
}

impl EngineScript {
    /// An engine with no archives and inline dispatch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an archive. Archive names are listed in insertion order.
    pub fn with_archive(mut self, archive: ArchiveScript) -> Self {
        self.archives.push(archive);
        self
    }

    /// Make initialization fail with `status` and `message`.
    ///
    /// With `with_handle`, the engine also delivers a live engine reference
    /// alongside the error status.
    pub fn failing_initialize(
        mut self,
        status: u32,
        message: impl Into<String>,
        with_handle: bool,
    ) -> Self {
        self.init_failure = Some(Failure {
            status,
            message: message.into(),
            with_handle,
        });
        self
    }

    /// Set when callbacks are delivered.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    fn archive_index(&self, name: &str) -> Option<usize> {
        self.archives.iter().position(|archive| archive.name == name)
    }
}

/// Resource bookkeeping of a [`ScriptedEngine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub live_engines: usize,
    pub live_archives: usize,
    pub live_strings: usize,
    pub live_collections: usize,
    pub engines_freed: usize,
    pub archives_freed: usize,
    pub strings_freed: usize,
    pub collections_freed: usize,
}

impl ResourceStats {
    /// Number of resources of any kind not yet released.
    pub fn live_total(&self) -> usize {
        self.live_engines + self.live_archives + self.live_strings + self.live_collections
    }
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    Resource,
    Status,
    Data,
}

#[derive(Debug)]
enum Outcome {
    Resource { raw: usize, status: u32 },
    Status { status: u32 },
    Data { bytes: Option<Arc<[u8]>>, status: u32 },
}

impl Shape {
    fn failed(self, status: u32) -> Outcome {
        match self {
            Self::Resource => Outcome::Resource { raw: 0, status },
            Self::Status => Outcome::Status { status },
            Self::Data => Outcome::Data {
                bytes: None,
                status,
            },
        }
    }
}

struct Reply {
    outcome: Outcome,
    message: Option<String>,
}

impl Reply {
    fn ok(outcome: Outcome) -> Self {
        Self {
            outcome,
            message: None,
        }
    }

    fn failed(shape: Shape, status: u32, message: impl Into<String>) -> Self {
        Self {
            outcome: shape.failed(status),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug)]
struct ScriptedCall {
    token: CallToken,
    operation: &'static str,
    outcome: Outcome,
    message: Option<String>,
}

#[derive(Default)]
struct State {
    next_id: usize,
    engines: HashSet<usize>,
    archives: HashMap<usize, usize>,
    strings: HashSet<usize>,
    collections: HashMap<usize, VecDeque<String>>,
    engines_freed: usize,
    archives_freed: usize,
    strings_freed: usize,
    collections_freed: usize,
    violations: Vec<String>,
    pending: VecDeque<ScriptedCall>,
    forced_failures: VecDeque<(u32, String)>,
    downloads: Vec<(String, String)>,
    manifests: Option<(String, String)>,
}

impl State {
    /// Opaque, never dereferenced reference for engines, archives and
    /// collections.
    fn mint(&mut self) -> usize {
        self.next_id += 1;
        self.next_id << 4
    }

    fn alloc_string(&mut self, value: &str) -> RawHandle {
        let c_string = CString::new(value.replace('\0', "")).unwrap_or_default();
        let raw = c_string.into_raw();
        self.strings.insert(raw as usize);
        raw.cast()
    }

    fn alloc_collection(&mut self, items: VecDeque<String>) -> RawHandle {
        let id = self.mint();
        self.collections.insert(id, items);
        id as RawHandle
    }

    fn violation(&mut self, message: String) {
        warn!(%message, "Scripted engine contract violation");
        self.violations.push(message);
    }

    fn engine_live(&mut self, operation: &str, engine: RawHandle) -> bool {
        if self.engines.contains(&(engine as usize)) {
            return true;
        }
        self.violation(format!("{} on unknown engine {:p}", operation, engine));
        false
    }

    fn archive_index(&mut self, operation: &str, archive: RawHandle) -> Option<usize> {
        let index = self.archives.get(&(archive as usize)).copied();
        if index.is_none() {
            self.violation(format!("{} on unknown archive {:p}", operation, archive));
        }
        index
    }
}

/// In-process [`EngineApi`] driven by an [`EngineScript`].
pub struct ScriptedEngine {
    script: EngineScript,
    completions: Arc<CompletionRegistry>,
    state: Mutex<State>,
}

impl ScriptedEngine {
    /// Create an engine with its own completion registry.
    pub fn new(script: EngineScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            completions: Arc::new(CompletionRegistry::new()),
            state: Mutex::new(State::default()),
        })
    }

    /// Allocate an engine-owned string, as if returned by the engine.
    ///
    /// NUL bytes are dropped from `value`.
    pub fn allocate_string(&self, value: &str) -> RawHandle {
        self.state.lock().alloc_string(value)
    }

    /// Allocate an engine-owned string collection.
    pub fn allocate_collection<I, S>(&self, items: I) -> RawHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.state.lock().alloc_collection(items)
    }

    /// Current resource bookkeeping.
    pub fn stats(&self) -> ResourceStats {
        let state = self.state.lock();
        ResourceStats {
            live_engines: state.engines.len(),
            live_archives: state.archives.len(),
            live_strings: state.strings.len(),
            live_collections: state.collections.len(),
            engines_freed: state.engines_freed,
            archives_freed: state.archives_freed,
            strings_freed: state.strings_freed,
            collections_freed: state.collections_freed,
        }
    }

    /// Contract violations observed so far, such as double frees.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// `(archive, file)` pairs successfully downloaded, in call order.
    pub fn downloads(&self) -> Vec<(String, String)> {
        self.state.lock().downloads.clone()
    }

    /// Manifest paths passed to the last manifest initialization.
    pub fn manifests(&self) -> Option<(String, String)> {
        self.state.lock().manifests.clone()
    }

    /// Make the next asynchronous call of any kind fail with `status`.
    pub fn fail_next_call(&self, status: u32, message: impl Into<String>) {
        self.state
            .lock()
            .forced_failures
            .push_back((status, message.into()));
    }

    /// Number of deferred callbacks not yet delivered.
    pub fn pending_calls(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Deliver the oldest deferred callback.
    pub fn fire_next(&self) -> bool {
        let call = self.state.lock().pending.pop_front();
        match call {
            Some(call) => {
                self.deliver(call);
                true
            }
            None => false,
        }
    }

    /// Deliver the most recent deferred callback.
    pub fn fire_latest(&self) -> bool {
        let call = self.state.lock().pending.pop_back();
        match call {
            Some(call) => {
                self.deliver(call);
                true
            }
            None => false,
        }
    }

    /// Deliver every deferred callback, oldest first.
    pub fn fire_all(&self) -> usize {
        let mut fired = 0;
        while self.fire_next() {
            fired += 1;
        }
        fired
    }

    fn deliver(&self, call: ScriptedCall) {
        deliver(&self.completions, call);
    }

    /// Runs one asynchronous call: computes its reply under the state lock,
    /// then dispatches the callback with the lock released.
    fn run(
        &self,
        operation: &'static str,
        shape: Shape,
        token: CallToken,
        body: impl FnOnce(&mut State) -> Reply,
    ) -> BridgeResult<()> {
        let call = {
            let mut state = self.state.lock();
            let reply = match state.forced_failures.pop_front() {
                Some((status, message)) => Reply::failed(shape, status, message),
                None => body(&mut state),
            };
            ScriptedCall {
                token,
                operation,
                outcome: reply.outcome,
                message: reply.message,
            }
        };
        debug!(
            operation,
            token = token.id(),
            dispatch = ?self.script.dispatch,
            "Scripted engine accepted call"
        );

        match self.script.dispatch {
            Dispatch::Inline => self.deliver(call),
            Dispatch::Thread => {
                let completions = Arc::clone(&self.completions);
                thread::spawn(move || deliver(&completions, call));
            }
            Dispatch::Deferred => self.state.lock().pending.push_back(call),
        }
        Ok(())
    }

    fn start_engine(&self, state: &mut State) -> Reply {
        match &self.script.init_failure {
            Some(failure) => {
                let raw = if failure.with_handle {
                    let id = state.mint();
                    state.engines.insert(id);
                    id
                } else {
                    0
                };
                Reply {
                    outcome: Outcome::Resource {
                        raw,
                        status: failure.status,
                    },
                    message: Some(failure.message.clone()),
                }
            }
            None => {
                let id = state.mint();
                state.engines.insert(id);
                Reply::ok(Outcome::Resource {
                    raw: id,
                    status: STATUS_OK,
                })
            }
        }
    }
}

fn deliver(completions: &CompletionRegistry, call: ScriptedCall) {
    debug!(
        operation = call.operation,
        token = call.token.id(),
        "Scripted engine delivering callback"
    );
    LAST_ERROR.with(|slot| *slot.borrow_mut() = call.message);

    let args = match &call.outcome {
        Outcome::Resource { raw, status } => CallbackArgs::Resource {
            raw: *raw as RawHandle,
            status: *status,
        },
        Outcome::Status { status } => CallbackArgs::Status { status: *status },
        Outcome::Data { bytes, status } => match bytes {
            Some(bytes) => CallbackArgs::Data {
                data: bytes.as_ptr(),
                len: bytes.len(),
                status: *status,
            },
            None => CallbackArgs::Data {
                data: ptr::null(),
                len: 0,
                status: *status,
            },
        },
    };
    // `call.outcome` keeps any byte buffer alive until the callback returns.
    completions.complete(call.token, args);
}

impl EngineApi for ScriptedEngine {
    fn completions(&self) -> &Arc<CompletionRegistry> {
        &self.completions
    }

    fn initialize(&self, token: CallToken) -> BridgeResult<()> {
        self.run("initialize", Shape::Resource, token, |state| {
            self.start_engine(state)
        })
    }

    fn initialize_with_manifest(
        &self,
        app_manifest: &CStr,
        chunk_manifest: &CStr,
        token: CallToken,
    ) -> BridgeResult<()> {
        let manifests = (
            app_manifest.to_string_lossy().into_owned(),
            chunk_manifest.to_string_lossy().into_owned(),
        );
        self.run("initialize_with_manifest", Shape::Resource, token, |state| {
            state.manifests = Some(manifests);
            self.start_engine(state)
        })
    }

    unsafe fn destroy(&self, engine: RawHandle) {
        let mut state = self.state.lock();
        if state.engines.remove(&(engine as usize)) {
            state.engines_freed += 1;
        } else {
            state.violation(format!("destroy of unknown engine {:p}", engine));
        }
    }

    unsafe fn free_archive(&self, archive: RawHandle) {
        let mut state = self.state.lock();
        if state.archives.remove(&(archive as usize)).is_some() {
            state.archives_freed += 1;
        } else {
            state.violation(format!("free_archive of unknown archive {:p}", archive));
        }
    }

    unsafe fn free_string_collection(&self, collection: RawHandle) {
        let mut state = self.state.lock();
        if state.collections.remove(&(collection as usize)).is_some() {
            state.collections_freed += 1;
        } else {
            state.violation(format!(
                "free_string_collection of unknown collection {:p}",
                collection
            ));
        }
    }

    unsafe fn free_string(&self, string: RawHandle) {
        let mut state = self.state.lock();
        if state.strings.remove(&(string as usize)) {
            // SAFETY: the address was produced by `CString::into_raw` in
            // `alloc_string` and has just been removed from the live set.
            drop(CString::from_raw(string.cast::<c_char>()));
            state.strings_freed += 1;
        } else {
            state.violation(format!("free_string of unknown string {:p}", string));
        }
    }

    unsafe fn get_archive_names(&self, engine: RawHandle) -> RawHandle {
        let mut state = self.state.lock();
        if !state.engine_live("get_archive_names", engine) {
            return ptr::null_mut();
        }
        let names = self
            .script
            .archives
            .iter()
            .map(|archive| archive.name.clone())
            .collect();
        state.alloc_collection(names)
    }

    unsafe fn open_archive(
        &self,
        engine: RawHandle,
        name: &CStr,
        key: Option<&CStr>,
        token: CallToken,
    ) -> BridgeResult<()> {
        let name = name.to_string_lossy().into_owned();
        let key = key.map(|key| key.to_string_lossy().into_owned());
        let shape = Shape::Resource;

        self.run("open_archive", shape, token, |state| {
            if !state.engine_live("open_archive", engine) {
                return Reply::failed(shape, STATUS_ASYNC, "engine instance is not live");
            }
            let Some(index) = self.script.archive_index(&name) else {
                return Reply::failed(shape, STATUS_READER, format!("archive '{}' not found", name));
            };
            if let Some(failure) = &self.script.archives[index].open_failure {
                let raw = if failure.with_handle {
                    let id = state.mint();
                    state.archives.insert(id, index);
                    id
                } else {
                    0
                };
                return Reply {
                    outcome: Outcome::Resource {
                        raw,
                        status: failure.status,
                    },
                    message: Some(failure.message.clone()),
                };
            }
            match (&self.script.archives[index].key, &key) {
                (Some(_), None) => Reply::failed(
                    shape,
                    STATUS_KEY,
                    format!("archive '{}' requires a key", name),
                ),
                (Some(expected), Some(given)) if expected != given => Reply::failed(
                    shape,
                    STATUS_DECRYPT,
                    format!("wrong key for archive '{}'", name),
                ),
                _ => {
                    let id = state.mint();
                    state.archives.insert(id, index);
                    Reply::ok(Outcome::Resource {
                        raw: id,
                        status: STATUS_OK,
                    })
                }
            }
        })
    }

    unsafe fn download_file(
        &self,
        engine: RawHandle,
        archive_name: &CStr,
        file_name: &CStr,
        token: CallToken,
    ) -> BridgeResult<()> {
        let archive_name = archive_name.to_string_lossy().into_owned();
        let file_name = file_name.to_string_lossy().into_owned();
        let shape = Shape::Status;

        self.run("download_file", shape, token, |state| {
            if !state.engine_live("download_file", engine) {
                return Reply::failed(shape, STATUS_ASYNC, "engine instance is not live");
            }
            let found = self
                .script
                .archive_index(&archive_name)
                .map(|index| &self.script.archives[index])
                .and_then(|archive| archive.file(&file_name))
                .is_some();
            if !found {
                return Reply::failed(
                    shape,
                    STATUS_READER,
                    format!("file '{}' not found in archive '{}'", file_name, archive_name),
                );
            }
            state.downloads.push((archive_name, file_name));
            Reply::ok(Outcome::Status { status: STATUS_OK })
        })
    }

    unsafe fn get_archive_mount_path(&self, archive: RawHandle) -> RawHandle {
        let mut state = self.state.lock();
        match state.archive_index("get_archive_mount_path", archive) {
            Some(index) => state.alloc_string(&self.script.archives[index].mount_path),
            None => ptr::null_mut(),
        }
    }

    unsafe fn get_file_names(&self, archive: RawHandle) -> RawHandle {
        let mut state = self.state.lock();
        match state.archive_index("get_file_names", archive) {
            Some(index) => {
                let names = self.script.archives[index]
                    .files
                    .iter()
                    .map(|(name, _)| name.clone())
                    .collect();
                state.alloc_collection(names)
            }
            None => ptr::null_mut(),
        }
    }

    unsafe fn get_file_bytes(
        &self,
        engine: RawHandle,
        archive: RawHandle,
        file_name: &CStr,
        token: CallToken,
    ) -> BridgeResult<()> {
        let file_name = file_name.to_string_lossy().into_owned();
        let shape = Shape::Data;

        self.run("get_file_bytes", shape, token, |state| {
            if !state.engine_live("get_file_bytes", engine) {
                return Reply::failed(shape, STATUS_ASYNC, "engine instance is not live");
            }
            let Some(index) = state.archive_index("get_file_bytes", archive) else {
                return Reply::failed(shape, STATUS_ASYNC, "archive is not open");
            };
            let archive = &self.script.archives[index];
            match archive.file(&file_name) {
                Some(contents) => Reply::ok(Outcome::Data {
                    bytes: Some(Arc::clone(contents)),
                    status: STATUS_OK,
                }),
                None => Reply::failed(
                    shape,
                    STATUS_READER,
                    format!("file '{}' not found in archive '{}'", file_name, archive.name),
                ),
            }
        })
    }

    unsafe fn string_collection_next(&self, collection: RawHandle) -> RawHandle {
        let mut state = self.state.lock();
        let next = match state.collections.get_mut(&(collection as usize)) {
            Some(items) => items.pop_front(),
            None => {
                state.violation(format!(
                    "string_collection_next on unknown collection {:p}",
                    collection
                ));
                return ptr::null_mut();
            }
        };
        match next {
            Some(item) => state.alloc_string(&item),
            None => ptr::null_mut(),
        }
    }

    fn get_last_error_message(&self) -> RawHandle {
        match LAST_ERROR.with(|slot| slot.borrow_mut().take()) {
            Some(message) => self.state.lock().alloc_string(&message),
            None => ptr::null_mut(),
        }
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for raw in state.strings.drain() {
            // SAFETY: every live string address came from `CString::into_raw`.
            unsafe { drop(CString::from_raw(raw as *mut c_char)) }
        }
    }
}
