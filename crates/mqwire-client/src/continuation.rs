//! One-shot rendezvous between a blocked synchronous caller and the
//! receive loop.
//!
//! A continuation is created before its request frame is sent, parked in
//! the channel's FIFO, and resolved exactly once from the reader thread:
//! either with the reply method or with a shutdown cause. Extra resolution
//! attempts are ignored, and a resolution after the waiter gave up (timed
//! out) is ignored too; the continuation still consumes its FIFO slot so
//! later replies stay matched to later calls.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use mqwire_frame::Method;

use crate::error::{Error, Result};
use crate::shutdown::ShutdownCause;

/// What a continuation resolves to.
#[derive(Debug, Clone)]
pub(crate) enum RpcOutcome {
    Reply(Method),
    ShutDown(ShutdownCause),
}

/// The resolving half, held in the channel's continuation FIFO.
#[derive(Debug, Clone)]
pub(crate) struct Continuation {
    tx: Sender<RpcOutcome>,
}

/// The waiting half, held by the calling thread.
#[derive(Debug)]
pub(crate) struct ContinuationWaiter {
    rx: Receiver<RpcOutcome>,
}

pub(crate) fn continuation() -> (Continuation, ContinuationWaiter) {
    let (tx, rx) = bounded(1);
    (Continuation { tx }, ContinuationWaiter { rx })
}

impl Continuation {
    /// Resolve with an outcome. At most one resolution takes effect;
    /// later attempts are no-ops.
    pub(crate) fn resolve(&self, outcome: RpcOutcome) {
        let _ = self.tx.try_send(outcome);
    }
}

impl ContinuationWaiter {
    /// Block until resolved.
    pub(crate) fn wait(self) -> Result<Method> {
        match self.rx.recv() {
            Ok(outcome) => outcome.into_result(),
            // The resolving half is dropped only through shutdown teardown.
            Err(_) => Err(Error::ShutDown(ShutdownCause::connection_error(
                "continuation dropped without resolution",
            ))),
        }
    }

    /// Block until resolved or the wait bound elapses.
    pub(crate) fn wait_timeout(self, timeout: Duration) -> Result<Method> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome.into_result(),
            Err(RecvTimeoutError::Timeout) => Err(Error::RpcTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ShutDown(
                ShutdownCause::connection_error("continuation dropped without resolution"),
            )),
        }
    }
}

impl RpcOutcome {
    fn into_result(self) -> Result<Method> {
        match self {
            RpcOutcome::Reply(method) => Ok(method),
            RpcOutcome::ShutDown(cause) => Err(Error::ShutDown(cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn resolves_with_reply() {
        let (cont, waiter) = continuation();
        cont.resolve(RpcOutcome::Reply(Method::ChannelOpenOk));
        assert_eq!(waiter.wait().unwrap(), Method::ChannelOpenOk);
    }

    #[test]
    fn resolves_with_shutdown_cause() {
        let (cont, waiter) = continuation();
        cont.resolve(RpcOutcome::ShutDown(ShutdownCause::connection_error(
            "reader died",
        )));
        assert!(matches!(waiter.wait(), Err(Error::ShutDown(_))));
    }

    #[test]
    fn second_resolution_is_ignored() {
        let (cont, waiter) = continuation();
        cont.resolve(RpcOutcome::Reply(Method::BasicQosOk));
        cont.resolve(RpcOutcome::ShutDown(ShutdownCause::connection_error(
            "late cause",
        )));
        // First resolution wins.
        assert_eq!(waiter.wait().unwrap(), Method::BasicQosOk);
    }

    #[test]
    fn resolution_after_abandoned_wait_is_ignored() {
        let (cont, waiter) = continuation();
        let err = waiter
            .wait_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, Error::RpcTimeout(_)));
        // Waiter is gone; this must not panic or block.
        cont.resolve(RpcOutcome::Reply(Method::BasicRecoverOk));
    }

    #[test]
    fn wakes_a_blocked_thread() {
        let (cont, waiter) = continuation();
        let waiting = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(20));
        cont.resolve(RpcOutcome::Reply(Method::ConnectionCloseOk));
        assert_eq!(waiting.join().unwrap().unwrap(), Method::ConnectionCloseOk);
    }
}
