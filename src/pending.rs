//! Pending operation handles
//!
//! Every provisioning operation resolves later, when a matching firmware
//! acknowledgement arrives or a timeout fires. [`Pending`] wraps the
//! completion side of that handshake as a oneshot channel, so callers can
//! poll from an event loop (`try_take`) or block a worker thread (`wait`).

use crate::error::{LinkError, Result};
use tokio::sync::oneshot;

/// Create a linked completion/pending pair
pub(crate) fn pending<T>() -> (Completion<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx: Some(tx) }, Pending { rx })
}

/// Host-internal side: fulfilled exactly once by the board
pub(crate) struct Completion<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Completion<T> {
    /// Resolve the pending operation. Later calls are no-ops; the receiver
    /// may also have gone away, which is fine.
    pub(crate) fn resolve(&mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

/// Caller-facing handle to an operation still in flight
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Non-blocking poll. `None` while the operation is still in flight.
    /// A dropped board resolves as [`LinkError::Disconnected`].
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(LinkError::Disconnected)),
        }
    }

    /// Block the calling thread until the operation resolves.
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<T> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(LinkError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_take_lifecycle() {
        let (mut done, mut pending) = pending::<u32>();
        assert!(pending.try_take().is_none());
        assert!(!done.is_resolved());

        done.resolve(Ok(7));
        assert!(done.is_resolved());
        assert!(matches!(pending.try_take(), Some(Ok(7))));
    }

    #[test]
    fn test_dropped_completion_reads_as_disconnect() {
        let (done, mut pending) = pending::<u32>();
        drop(done);
        assert!(matches!(
            pending.try_take(),
            Some(Err(LinkError::Disconnected))
        ));
    }

    #[test]
    fn test_double_resolve_is_noop() {
        let (mut done, mut pending) = pending::<u32>();
        done.resolve(Ok(1));
        done.resolve(Ok(2));
        assert!(matches!(pending.try_take(), Some(Ok(1))));
    }
}
