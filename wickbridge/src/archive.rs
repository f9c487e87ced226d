//! Archive facade.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::gate::{CallGate, CallPolicy};
use crate::handle::{ArchiveKind, Handle, ResourceKind, StringCursor, StringHandle};

/// An opened archive (pak) of an [`Engine`](crate::Engine).
///
/// Obtained from [`Engine::open_archive`](crate::Engine::open_archive). The
/// archive is returned to the engine when it is disposed or dropped. Reading
/// file contents goes through [`Engine::read_file_bytes`](crate::Engine::read_file_bytes),
/// which needs both handles.
pub struct Archive {
    handle: Handle<ArchiveKind>,
    gate: CallGate,
    name: String,
}

impl Archive {
    pub(crate) fn new(handle: Handle<ArchiveKind>, name: String, policy: CallPolicy) -> Self {
        Self {
            handle,
            gate: CallGate::new(ArchiveKind::NAME, policy),
            name,
        }
    }

    /// Name the archive was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true until the archive is disposed.
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Names of all files in the archive, in engine order.
    pub fn list_file_names(&self) -> BridgeResult<Vec<String>> {
        let raw = self.handle.raw()?;
        let _pass = self.gate.try_enter()?;
        let api = self.handle.api();
        // SAFETY: `raw` stays live while `self.handle` owns it.
        let collection = unsafe { api.get_file_names(raw) };
        Ok(StringCursor::new(Arc::clone(api), collection).drain())
    }

    /// The archive's mount path.
    pub fn mount_path(&self) -> BridgeResult<String> {
        let raw = self.handle.raw()?;
        let _pass = self.gate.try_enter()?;
        let api = self.handle.api();
        // SAFETY: `raw` stays live while `self.handle` owns it.
        let mount_path = unsafe { api.get_archive_mount_path(raw) };
        StringHandle::wrap(Arc::clone(api), mount_path)
            .into_string()
            .ok_or(BridgeError::NullResult("mount path"))
    }

    /// Return the archive to the engine.
    pub fn dispose(mut self) {
        debug!(archive = %self.name, "Disposing archive");
        self.handle.release();
    }

    pub(crate) fn handle(&self) -> &Handle<ArchiveKind> {
        &self.handle
    }

    pub(crate) fn gate(&self) -> &CallGate {
        &self.gate
    }
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("policy", &self.gate.policy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::scripted::{ArchiveScript, Dispatch, EngineScript, ScriptedEngine};
    use crate::Engine;
    use futures::FutureExt;

    fn script() -> EngineScript {
        EngineScript::new().with_archive(
            ArchiveScript::new("base")
                .with_mount_path("../../../Game/Content/Paks/")
                .with_file("readme.txt", "hello")
                .with_file("data.bin", [0u8, 1, 2]),
        )
    }

    #[tokio::test]
    async fn test_list_file_names_in_order() {
        let scripted = ScriptedEngine::new(script());
        let engine = Engine::initialize(scripted.clone()).await.unwrap();
        let archive = engine.open_archive("base", None).await.unwrap();

        assert_eq!(archive.list_file_names().unwrap(), vec!["readme.txt", "data.bin"]);
        assert_eq!(scripted.stats().live_strings, 0);
    }

    #[tokio::test]
    async fn test_mount_path() {
        let scripted = ScriptedEngine::new(script());
        let engine = Engine::initialize(scripted.clone()).await.unwrap();
        let archive = engine.open_archive("base", None).await.unwrap();

        assert_eq!(archive.mount_path().unwrap(), "../../../Game/Content/Paks/");
        assert_eq!(scripted.stats().live_strings, 0);
    }

    #[tokio::test]
    async fn test_dispose_releases_once() {
        let scripted = ScriptedEngine::new(script());
        let engine = Engine::initialize(scripted.clone()).await.unwrap();
        let archive = engine.open_archive("base", None).await.unwrap();
        assert!(archive.is_valid());

        archive.dispose();

        let stats = scripted.stats();
        assert_eq!(stats.live_archives, 0);
        assert_eq!(stats.archives_freed, 1);
        assert!(scripted.violations().is_empty());
    }

    /// Polls `future` until it waits on a deferred callback, fires it, and
    /// finishes the future.
    async fn fired<F: std::future::Future>(scripted: &ScriptedEngine, future: F) -> F::Output {
        let mut future = Box::pin(future);
        assert!(future.as_mut().now_or_never().is_none());
        scripted.fire_next();
        future.await
    }

    #[tokio::test]
    async fn test_queries_are_busy_while_read_outstanding() {
        let scripted = ScriptedEngine::new(script().with_dispatch(Dispatch::Deferred));
        let engine = fired(&scripted, Engine::initialize(scripted.clone())).await.unwrap();
        let reading = fired(&scripted, engine.open_archive("base", None)).await.unwrap();
        let idle = fired(&scripted, engine.open_archive("base", None)).await.unwrap();

        let mut read = Box::pin(engine.read_file_bytes(&reading, "readme.txt"));
        assert!(read.as_mut().now_or_never().is_none());

        assert!(matches!(reading.list_file_names(), Err(BridgeError::Busy("archive"))));
        assert!(matches!(reading.mount_path(), Err(BridgeError::Busy("archive"))));
        assert!(idle.list_file_names().is_ok());

        scripted.fire_next();
        assert_eq!(&read.await.unwrap()[..], b"hello");
        assert_eq!(reading.list_file_names().unwrap().len(), 2);
    }
}
