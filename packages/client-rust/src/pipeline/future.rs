//! The future handed back for every submitted operation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use fnstate_core::StateError;
use futures_util::task::AtomicWaker;
use tokio::sync::oneshot;

use super::dispatch::Reply;
use super::Lane;
use crate::telemetry::METRIC_CANCELLED;

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, StateError>>;
type ReplyReceiver = oneshot::Receiver<Result<Reply, StateError>>;

#[derive(Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    waker: AtomicWaker,
}

/// Links a pending future back to its queued operation.
pub(crate) struct Ticket {
    seq: u64,
    lane: Weak<Lane>,
    signal: Arc<CancelSignal>,
}

impl Ticket {
    pub(crate) fn new(seq: u64, lane: &Arc<Lane>) -> Self {
        Self {
            seq,
            lane: Arc::downgrade(lane),
            signal: Arc::default(),
        }
    }
}

enum State<T> {
    Ready(Result<T, StateError>),
    Pending {
        rx: ReplyReceiver,
        map: fn(Reply) -> Result<T, StateError>,
    },
    Done,
}

/// Result of a submitted state operation.
///
/// Resolves with the backend's answer in per-key submission order. Async
/// operations never fail at the call site: validation errors and
/// `Unsupported` are delivered through this future.
///
/// Dropping an `OpFuture` does not cancel the operation; call
/// [`cancel`](Self::cancel) for that.
#[must_use = "an OpFuture does nothing unless awaited or cancelled"]
pub struct OpFuture<T> {
    state: State<T>,
    ticket: Option<Ticket>,
}

impl<T> OpFuture<T> {
    /// A future that is already resolved with `result`.
    pub fn ready(result: Result<T, StateError>) -> Self {
        Self {
            state: State::Ready(result),
            ticket: None,
        }
    }

    /// A future that is already resolved with `err`.
    pub fn failed(err: StateError) -> Self {
        Self::ready(Err(err))
    }

    pub(crate) fn pending(
        rx: ReplyReceiver,
        ticket: Ticket,
        map: fn(Reply) -> Result<T, StateError>,
    ) -> Self {
        Self {
            state: State::Pending { rx, map },
            ticket: Some(ticket),
        }
    }

    /// Cancels the operation. The future resolves `Cancelled`.
    ///
    /// Returns `true` if the operation was still queued and has been
    /// removed, so it never reaches the backend. Once dispatched, the
    /// backend call runs to completion and its result is discarded.
    pub fn cancel(&self) -> bool {
        let Some(ticket) = &self.ticket else {
            return false;
        };
        if ticket.signal.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        ticket.signal.waker.wake();

        let removed = ticket
            .lane
            .upgrade()
            .and_then(|lane| lane.remove(ticket.seq))
            .is_some();
        if removed {
            metrics::counter!(METRIC_CANCELLED).increment(1);
            tracing::debug!(seq = ticket.seq, "queued operation cancelled");
        }
        removed
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ticket
            .as_ref()
            .is_some_and(|ticket| ticket.signal.cancelled.load(Ordering::Acquire))
    }
}

impl<T> Unpin for OpFuture<T> {}

impl<T> Future for OpFuture<T> {
    type Output = Result<T, StateError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(ticket) = &this.ticket {
            ticket.signal.waker.register(cx.waker());
            if ticket.signal.cancelled.load(Ordering::Acquire)
                && !matches!(this.state, State::Done)
            {
                this.state = State::Done;
                return Poll::Ready(Err(StateError::Cancelled));
            }
        }

        match std::mem::replace(&mut this.state, State::Done) {
            State::Ready(result) => Poll::Ready(result),
            State::Pending { mut rx, map } => match Pin::new(&mut rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result.and_then(map)),
                // The sender is dropped only when the operation was discarded
                // without running.
                Poll::Ready(Err(_closed)) => Poll::Ready(Err(StateError::Cancelled)),
                Poll::Pending => {
                    this.state = State::Pending { rx, map };
                    Poll::Pending
                }
            },
            State::Done => panic!("OpFuture polled after completion"),
        }
    }
}

impl<T> fmt::Debug for OpFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Ready(_) => "ready",
            State::Pending { .. } => "pending",
            State::Done => "done",
        };
        f.debug_struct("OpFuture")
            .field("state", &state)
            .field("seq", &self.ticket.as_ref().map(|ticket| ticket.seq))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_future_resolves_immediately() {
        let fut = OpFuture::ready(Ok(5_i64));
        assert_eq!(fut.await.unwrap(), 5);

        let fut: OpFuture<()> = OpFuture::failed(StateError::unsupported("no backend"));
        assert_eq!(
            fut.await.unwrap_err(),
            StateError::unsupported("no backend")
        );
    }

    #[tokio::test]
    async fn reply_is_mapped() {
        let lane = Arc::new(Lane::default());
        let (tx, rx) = oneshot::channel();
        let fut = OpFuture::pending(rx, Ticket::new(1, &lane), Reply::into_counter);

        tx.send(Ok(Reply::Counter(9))).unwrap();
        assert_eq!(fut.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn dropped_sender_resolves_cancelled() {
        let lane = Arc::new(Lane::default());
        let (tx, rx) = oneshot::channel();
        let fut = OpFuture::pending(rx, Ticket::new(1, &lane), Reply::into_ack);

        drop(tx);
        assert_eq!(fut.await.unwrap_err(), StateError::Cancelled);
    }

    #[test]
    fn cancel_resolves_a_pending_future() {
        let lane = Arc::new(Lane::default());
        let (_tx, rx) = oneshot::channel();
        let mut fut = OpFuture::pending(rx, Ticket::new(1, &lane), Reply::into_value);
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());

        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());

        // Not queued in the lane, so nothing is removed.
        assert!(!fut.cancel());
        assert!(fut.is_cancelled());
        assert!(matches!(
            Pin::new(&mut fut).poll(&mut cx),
            Poll::Ready(Err(StateError::Cancelled))
        ));
    }

    #[test]
    fn cancelling_a_ready_future_is_a_no_op() {
        let fut = OpFuture::ready(Ok(()));
        assert!(!fut.cancel());
        assert!(!fut.is_cancelled());
    }
}
