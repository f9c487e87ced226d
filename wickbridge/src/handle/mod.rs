//! Ownership-tracked wrappers around engine-owned resources.
//!
//! Every raw reference the engine hands back is wrapped in a [`Handle`] the
//! moment it crosses the boundary. A handle:
//!
//! - is invalid when its raw reference is null, and every operation on an
//!   invalid handle short-circuits;
//! - runs its kind's foreign release routine at most once, either through an
//!   explicit [`Handle::release`] or when it is dropped;
//! - is moved, never cloned, so ownership transfers without duplication.
//!
//! # Kinds
//!
//! ```text
//! Handle<EngineKind>            ──► destroy
//! Handle<ArchiveKind>           ──► free_archive
//! Handle<StringKind>            ──► free_string
//! Handle<StringCollectionKind>  ──► free_string_collection
//! ```

mod cursor;

pub use cursor::StringCursor;

use std::ffi::{c_void, CStr};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::{EngineApi, RawHandle};

/// A category of engine-owned resource with its own release routine.
pub trait ResourceKind: 'static {
    /// Short name used in logs and errors.
    const NAME: &'static str;

    /// Returns the resource to the engine.
    ///
    /// # Safety
    ///
    /// `raw` must be a non-null reference of this kind obtained from `api`
    /// that has not been released yet.
    unsafe fn release(api: &dyn EngineApi, raw: RawHandle);
}

/// An engine instance.
pub enum EngineKind {}

/// An opened archive.
pub enum ArchiveKind {}

/// A single NUL-terminated string.
pub enum StringKind {}

/// A forward-only collection of strings.
pub enum StringCollectionKind {}

impl ResourceKind for EngineKind {
    const NAME: &'static str = "engine";

    unsafe fn release(api: &dyn EngineApi, raw: RawHandle) {
        api.destroy(raw)
    }
}

impl ResourceKind for ArchiveKind {
    const NAME: &'static str = "archive";

    unsafe fn release(api: &dyn EngineApi, raw: RawHandle) {
        api.free_archive(raw)
    }
}

impl ResourceKind for StringKind {
    const NAME: &'static str = "string";

    unsafe fn release(api: &dyn EngineApi, raw: RawHandle) {
        api.free_string(raw)
    }
}

impl ResourceKind for StringCollectionKind {
    const NAME: &'static str = "string collection";

    unsafe fn release(api: &dyn EngineApi, raw: RawHandle) {
        api.free_string_collection(raw)
    }
}

/// Owned reference to one engine-allocated resource.
pub struct Handle<K: ResourceKind> {
    raw: AtomicPtr<c_void>,
    api: Arc<dyn EngineApi>,
    _kind: PhantomData<fn() -> K>,
}

/// Handle to an engine-owned string.
pub type StringHandle = Handle<StringKind>;

impl<K: ResourceKind> Handle<K> {
    /// Takes ownership of a raw reference returned by `api`.
    ///
    /// Never fails: a null reference produces an invalid handle.
    pub fn wrap(api: Arc<dyn EngineApi>, raw: RawHandle) -> Self {
        Self {
            raw: AtomicPtr::new(raw),
            api,
            _kind: PhantomData,
        }
    }

    /// Returns true while the handle holds a live reference.
    pub fn is_valid(&self) -> bool {
        !self.raw.load(Ordering::Acquire).is_null()
    }

    /// The raw reference, or null once released.
    pub fn as_raw(&self) -> RawHandle {
        self.raw.load(Ordering::Acquire)
    }

    /// The raw reference, failing if the handle is invalid.
    pub fn raw(&self) -> BridgeResult<RawHandle> {
        let raw = self.as_raw();
        if raw.is_null() {
            return Err(BridgeError::Released(K::NAME));
        }
        Ok(raw)
    }

    /// The call surface this handle belongs to.
    pub fn api(&self) -> &Arc<dyn EngineApi> {
        &self.api
    }

    /// Returns the resource to the engine.
    ///
    /// Idempotent: the release routine runs only for the first call on a
    /// valid handle; later calls and calls on invalid handles do nothing.
    pub fn release(&mut self) {
        let raw = std::mem::replace(self.raw.get_mut(), ptr::null_mut());
        if raw.is_null() {
            return;
        }
        trace!(kind = K::NAME, ?raw, "Releasing handle");
        // SAFETY: `raw` came from `self.api`, is non-null, and was swapped out
        // above so no other path can release it again.
        unsafe { K::release(self.api.as_ref(), raw) }
    }
}

impl<K: ResourceKind> Drop for Handle<K> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<K: ResourceKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &K::NAME)
            .field("raw", &self.as_raw())
            .finish()
    }
}

impl Handle<StringKind> {
    /// Decodes the string without releasing it.
    ///
    /// Invalid UTF-8 sequences are replaced. Returns `None` for an invalid
    /// handle.
    pub fn to_string_lossy(&self) -> Option<String> {
        let raw = self.as_raw();
        if raw.is_null() {
            return None;
        }
        // SAFETY: the engine contract guarantees string references point at
        // NUL-terminated buffers that stay valid until `free_string`.
        let c_str = unsafe { CStr::from_ptr(raw as *const libc::c_char) };
        Some(c_str.to_string_lossy().into_owned())
    }

    /// Decodes the string and releases it.
    pub fn into_string(mut self) -> Option<String> {
        let value = self.to_string_lossy();
        self.release();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::scripted::{EngineScript, ScriptedEngine};

    fn engine() -> (Arc<ScriptedEngine>, Arc<dyn EngineApi>) {
        let scripted = ScriptedEngine::new(EngineScript::new());
        let api: Arc<dyn EngineApi> = scripted.clone();
        (scripted, api)
    }

    #[test]
    fn test_null_handle_is_invalid() {
        let (scripted, api) = engine();
        let mut handle = Handle::<ArchiveKind>::wrap(api, ptr::null_mut());

        assert!(!handle.is_valid());
        assert!(matches!(handle.raw(), Err(BridgeError::Released("archive"))));

        handle.release();
        assert_eq!(scripted.stats().archives_freed, 0);
    }

    #[test]
    fn test_double_release_frees_once() {
        let (scripted, api) = engine();
        let raw = scripted.allocate_string("hello");
        let mut handle = StringHandle::wrap(api, raw);

        handle.release();
        handle.release();
        assert!(!handle.is_valid());
        drop(handle);

        let stats = scripted.stats();
        assert_eq!(stats.strings_freed, 1);
        assert_eq!(stats.live_strings, 0);
        assert!(scripted.violations().is_empty());
    }

    #[test]
    fn test_drop_releases() {
        let (scripted, api) = engine();
        {
            let _handle = StringHandle::wrap(api, scripted.allocate_string("scoped"));
            assert_eq!(scripted.stats().live_strings, 1);
        }
        assert_eq!(scripted.stats().live_strings, 0);
    }

    #[test]
    fn test_string_decodes_then_releases() {
        let (scripted, api) = engine();
        let handle = StringHandle::wrap(api, scripted.allocate_string("/Game/Content"));

        assert_eq!(handle.to_string_lossy().as_deref(), Some("/Game/Content"));
        assert_eq!(handle.into_string().as_deref(), Some("/Game/Content"));
        assert_eq!(scripted.stats().strings_freed, 1);
    }

    #[test]
    fn test_handle_release_from_another_thread() {
        let (scripted, api) = engine();
        let handle = StringHandle::wrap(api, scripted.allocate_string("moved"));

        std::thread::spawn(move || drop(handle)).join().unwrap();

        assert_eq!(scripted.stats().strings_freed, 1);
    }
}
