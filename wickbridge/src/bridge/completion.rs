//! Awaitable side of an outstanding engine call.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::{BridgeError, BridgeResult};

/// Future resolved by the engine's callback for one call.
///
/// Resolves exactly once. Dropping it before resolution does not cancel the
/// engine call: the registry keeps the callback's closure until the engine
/// calls back, and whatever the call produced is released then.
#[must_use = "engine calls report their outcome through the completion"]
#[derive(Debug)]
pub struct Completion<T> {
    operation: &'static str,
    receiver: oneshot::Receiver<BridgeResult<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(operation: &'static str, receiver: oneshot::Receiver<BridgeResult<T>>) -> Self {
        Self {
            operation,
            receiver,
        }
    }

    /// Name of the engine operation this completion belongs to.
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl<T> Future for Completion<T> {
    type Output = BridgeResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a value: the registry went away with the
            // call still outstanding.
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_sender_is_abandoned() {
        let (tx, rx) = oneshot::channel::<BridgeResult<()>>();
        let completion = Completion::new("download_file", rx);
        drop(tx);

        assert!(matches!(completion.await, Err(BridgeError::Abandoned)));
    }

    #[tokio::test]
    async fn test_resolves_with_sent_value() {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new("open_archive", rx);
        assert_eq!(completion.operation(), "open_archive");

        tx.send(Ok(7u32)).unwrap();
        assert_eq!(completion.await.unwrap(), 7);
    }
}
