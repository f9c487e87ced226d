//! Registration table mapping call tokens to completion closures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{CallToken, CallbackArgs, Completion, Resolution};
use crate::error::BridgeResult;

// `DashMap` is only `Sync` for `Sync` values.
type PendingCall = Box<dyn FnOnce(Resolution) + Send + Sync>;

/// Table of outstanding engine calls.
///
/// Each entry is inserted right before the foreign call is made and removed
/// exactly when the callback fires (or when the call fails to start). The
/// closure runs after removal, so no map lock is held while it executes and a
/// repeated callback for the same token finds nothing to run.
pub struct CompletionRegistry {
    pending: DashMap<usize, PendingCall>,
    next_token: AtomicUsize,
}

impl Default for CompletionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_token: AtomicUsize::new(1),
        }
    }

    /// Process-wide registry used by the native binding's trampolines.
    pub fn global() -> &'static Arc<CompletionRegistry> {
        static GLOBAL: OnceLock<Arc<CompletionRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CompletionRegistry::new()))
    }

    /// Issue one engine call.
    ///
    /// Registers `on_complete` under a fresh token, then calls `start` with
    /// that token to make the foreign call. When the engine calls back,
    /// `on_complete` converts the raw callback arguments into the result the
    /// returned [`Completion`] resolves to.
    ///
    /// If `start` fails, the entry is removed and the completion resolves
    /// with that error.
    pub fn issue<T, S, F>(&self, operation: &'static str, start: S, on_complete: F) -> Completion<T>
    where
        T: Send + 'static,
        S: FnOnce(CallToken) -> BridgeResult<()>,
        F: FnOnce(CallbackArgs) -> BridgeResult<T> + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = CallToken::new(self.next_token.fetch_add(1, Ordering::Relaxed));

        let pending: PendingCall = Box::new(move |resolution| {
            let result = match resolution {
                Resolution::Callback(args) => on_complete(args),
                Resolution::NotStarted(err) => Err(err),
            };
            if tx.send(result).is_err() {
                // Nobody is waiting; dropping the result releases whatever
                // the call produced.
                debug!(operation, "Completion abandoned, discarding result");
            }
        });
        self.pending.insert(token.id(), pending);

        debug!(operation, token = token.id(), "Issuing engine call");
        if let Err(err) = start(token) {
            warn!(operation, token = token.id(), error = %err, "Engine call failed to start");
            self.resolve(token, Resolution::NotStarted(err));
        }

        Completion::new(operation, rx)
    }

    /// Deliver an engine callback.
    ///
    /// Returns `false` if no call is outstanding under `token`, which happens
    /// when the engine calls back twice or after a failed start.
    pub fn complete(&self, token: CallToken, args: CallbackArgs) -> bool {
        self.resolve(token, Resolution::Callback(args))
    }

    /// Number of calls still waiting for their callback.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn resolve(&self, token: CallToken, resolution: Resolution) -> bool {
        match self.pending.remove(&token.id()) {
            Some((_, pending)) => {
                debug!(token = token.id(), "Engine call completed");
                pending(resolution);
                true
            }
            None => {
                warn!(
                    token = token.id(),
                    "Ignoring callback for unknown or already completed call"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BridgeError, EngineError};
    use futures::FutureExt;
    use std::num::NonZeroU32;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn status_of(args: CallbackArgs) -> BridgeResult<u32> {
        match args.status() {
            0 => Ok(0),
            status => Err(EngineError::translate(
                NonZeroU32::new(status).unwrap(),
                "scripted",
            )
            .into()),
        }
    }

    /// Issues a call whose token is captured for the test to complete later.
    fn issue_deferred(registry: &CompletionRegistry) -> (CallToken, Completion<u32>) {
        let slot = Mutex::new(None);
        let completion = registry.issue(
            "download_file",
            |token| {
                *slot.lock().unwrap() = Some(token);
                Ok(())
            },
            status_of,
        );
        let token = slot.into_inner().unwrap().unwrap();
        (token, completion)
    }

    #[tokio::test]
    async fn test_callback_resolves_completion() {
        let registry = CompletionRegistry::new();
        let (token, completion) = issue_deferred(&registry);
        assert_eq!(registry.outstanding(), 1);

        assert!(registry.complete(token, CallbackArgs::Status { status: 0 }));

        assert_eq!(completion.await.unwrap(), 0);
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_error_status_resolves_error() {
        let registry = CompletionRegistry::new();
        let (token, completion) = issue_deferred(&registry);

        registry.complete(token, CallbackArgs::Status { status: 10 });

        let err = completion.await.unwrap_err();
        assert_eq!(err.to_string(), "Decrypt Error: scripted");
    }

    #[tokio::test]
    async fn test_start_failure_resolves_instead_of_hanging() {
        let registry = CompletionRegistry::new();
        let completion: Completion<u32> = registry.issue(
            "open_archive",
            |_| Err(BridgeError::InteriorNul { what: "archive name" }),
            status_of,
        );

        assert_eq!(registry.outstanding(), 0);
        assert!(matches!(
            completion.await,
            Err(BridgeError::InteriorNul { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_callback_is_ignored() {
        let registry = CompletionRegistry::new();
        let (token, completion) = issue_deferred(&registry);

        assert!(registry.complete(token, CallbackArgs::Status { status: 0 }));
        assert!(!registry.complete(token, CallbackArgs::Status { status: 6 }));

        assert_eq!(completion.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_independent_calls_resolve_independently() {
        let registry = CompletionRegistry::new();
        let (first_token, mut first) = issue_deferred(&registry);
        let (second_token, second) = issue_deferred(&registry);
        assert_ne!(first_token, second_token);

        registry.complete(second_token, CallbackArgs::Status { status: 0 });
        assert_eq!(second.await.unwrap(), 0);

        assert!((&mut first).now_or_never().is_none());
        assert_eq!(registry.outstanding(), 1);

        registry.complete(first_token, CallbackArgs::Status { status: 3 });
        assert!(first.await.is_err());
    }

    #[test]
    fn test_abandoned_call_keeps_closure_until_callback() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let registry = CompletionRegistry::new();
        let dropped = Arc::new(AtomicUsize::new(0));
        let slot = Mutex::new(None);
        let produced = Arc::clone(&dropped);
        let completion = registry.issue(
            "open_archive",
            |token| {
                *slot.lock().unwrap() = Some(token);
                Ok(())
            },
            move |_| Ok(Tracked(produced)),
        );
        drop(completion);

        assert_eq!(registry.outstanding(), 1);
        let token = slot.into_inner().unwrap().unwrap();
        assert!(registry.complete(token, CallbackArgs::Status { status: 0 }));

        assert_eq!(registry.outstanding(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_from_foreign_thread() {
        let registry = Arc::new(CompletionRegistry::new());
        let (token, completion) = issue_deferred(&registry);

        let remote = Arc::clone(&registry);
        std::thread::spawn(move || remote.complete(token, CallbackArgs::Status { status: 0 }))
            .join()
            .unwrap();

        assert_eq!(completion.await.unwrap(), 0);
    }

    #[test]
    fn test_tokens_are_unique_and_nonzero() {
        let registry = CompletionRegistry::new();
        let (a, _ca) = issue_deferred(&registry);
        let (b, _cb) = issue_deferred(&registry);
        assert_ne!(a.id(), 0);
        assert_ne!(a, b);
    }
}
