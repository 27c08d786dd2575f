//! Request pipeline: per-key FIFO lanes in front of the dispatch stack.
//!
//! Every store handle owns one [`RequestPipeline`]. Operations on the same
//! key complete their backend round trip in submission order; operations on
//! different keys run concurrently. Each lane is drained by at most one
//! tokio task at a time, spawned on demand and exiting once the lane is
//! empty, at which point the lane itself is removed.
//!
//! - [`dispatch`]: The unit of work and the leaf backend service
//! - [`middleware`]: Tower layers wrapped around every backend call
//! - [`OpFuture`]: Cancellable handle to a submitted operation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use fnstate_core::{OperationKind, StateError, StoreKey};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Service, ServiceExt};
use tracing::{debug, trace, warn};

use crate::backend::CallOptions;

pub mod dispatch;
mod future;
pub mod middleware;

pub use dispatch::{BackendService, Dispatch, Reply};
pub use future::OpFuture;
pub use middleware::{build_dispatch_stack, DispatchService};

use future::{ReplySender, Ticket};

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

/// An operation waiting in its lane.
struct PendingOperation {
    seq: u64,
    dispatch: Dispatch,
    reply: ReplySender,
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<PendingOperation>,
    /// Sequence number of the operation currently at the backend.
    in_flight: Option<u64>,
    /// Whether a drainer task owns this lane.
    draining: bool,
}

impl LaneState {
    fn outstanding(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none() && !self.draining
    }
}

/// FIFO queue of operations for one key.
#[derive(Default)]
pub(crate) struct Lane {
    state: Mutex<LaneState>,
    /// Notified whenever an operation leaves the lane.
    capacity: Notify,
}

impl Lane {
    /// Removes a still-queued operation. Returns `None` once it has been
    /// dispatched or has already left the lane.
    fn remove(&self, seq: u64) -> Option<Dispatch> {
        let removed = {
            let mut state = self.state.lock();
            let index = state.queue.iter().position(|op| op.seq == seq)?;
            state.queue.remove(index)
        };
        self.capacity.notify_waiters();
        // Dropping the sender resolves the future `Cancelled`.
        removed.map(|op| op.dispatch)
    }

    fn fail_queued(&self, err: &StateError) -> usize {
        let drained: Vec<PendingOperation> = self.state.lock().queue.drain(..).collect();
        let count = drained.len();
        for op in drained {
            let _ = op.reply.send(Err(err.clone()));
        }
        self.capacity.notify_waiters();
        count
    }

    fn outstanding(&self) -> usize {
        self.state.lock().outstanding()
    }
}

// ---------------------------------------------------------------------------
// RequestPipeline
// ---------------------------------------------------------------------------

struct PipelineInner {
    store: StoreKey,
    lanes: DashMap<Bytes, Arc<Lane>>,
    service: Mutex<DispatchService>,
    watermark: usize,
    runtime: Handle,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_seq: AtomicU64,
}

/// Per-store queue of operations in front of the dispatch stack.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<PipelineInner>,
}

impl RequestPipeline {
    /// Creates a pipeline whose drainer tasks run on `runtime`.
    ///
    /// `watermark` bounds outstanding operations per key for blocking
    /// callers (see [`wait_for_capacity`](Self::wait_for_capacity)). The
    /// pipeline counts as shut down once `runtime` shuts down.
    #[must_use]
    pub fn new(store: StoreKey, service: DispatchService, watermark: usize, runtime: Handle) -> Self {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        // Dropped with the runtime's tasks, which cancels the token.
        let guard = shutdown.clone().drop_guard();
        let stopped = shutdown.clone();
        tracker.spawn_on(
            async move {
                stopped.cancelled().await;
                drop(guard);
            },
            &runtime,
        );

        Self {
            inner: Arc::new(PipelineInner {
                store,
                lanes: DashMap::new(),
                service: Mutex::new(service),
                watermark: watermark.max(1),
                runtime,
                shutdown,
                tracker,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &StoreKey {
        &self.inner.store
    }

    /// Enqueues an operation on the lane for `key` and returns its future.
    ///
    /// Never blocks and never fails at the call site. Submissions past the
    /// per-key watermark are still queued.
    pub fn submit(&self, key: Bytes, kind: OperationKind, options: CallOptions) -> OpFuture<Reply> {
        self.submit_with(key, kind, options, Ok)
    }

    /// Like [`submit`](Self::submit), converting the reply with `map`.
    pub fn submit_with<T>(
        &self,
        key: Bytes,
        kind: OperationKind,
        options: CallOptions,
        map: fn(Reply) -> Result<T, StateError>,
    ) -> OpFuture<T> {
        if self.inner.shutdown.is_cancelled() {
            return OpFuture::failed(StateError::Cancelled);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let dispatch = Dispatch {
            store: self.inner.store.clone(),
            key: key.clone(),
            kind,
            options,
        };
        trace!(store = %self.inner.store, seq, kind = dispatch.kind.name(), "submit");

        // The map shard stays locked until the operation is queued, so an
        // idle lane cannot be removed between lookup and push.
        let lane_ref = self.inner.lanes.entry(key.clone()).or_default();
        let lane = Arc::clone(lane_ref.value());
        let spawn_drainer = {
            let mut state = lane.state.lock();
            state.queue.push_back(PendingOperation {
                seq,
                dispatch,
                reply: tx,
            });
            if state.outstanding() == self.inner.watermark + 1 {
                warn!(
                    store = %self.inner.store,
                    watermark = self.inner.watermark,
                    "per-key watermark exceeded, operations are queueing"
                );
            }
            !std::mem::replace(&mut state.draining, true)
        };
        drop(lane_ref);

        if spawn_drainer {
            let inner = Arc::clone(&self.inner);
            let drained = Arc::clone(&lane);
            self.inner
                .tracker
                .spawn_on(drain(inner, key, drained), &self.inner.runtime);
        }

        OpFuture::pending(rx, Ticket::new(seq, &lane), map)
    }

    /// Waits until the lane for `key` is below the watermark.
    ///
    /// Returns immediately when the pipeline is shut down; the following
    /// submission then fails `Cancelled`.
    pub async fn wait_for_capacity(&self, key: &[u8]) {
        loop {
            let Some(lane) = self.inner.lanes.get(key).map(|lane| Arc::clone(lane.value())) else {
                return;
            };
            let notified = lane.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if lane.outstanding() < self.inner.watermark {
                return;
            }
            tokio::select! {
                () = self.inner.shutdown.cancelled() => return,
                () = notified => {}
            }
        }
    }

    /// Operations queued or in flight across all keys.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner
            .lanes
            .iter()
            .map(|lane| lane.value().outstanding())
            .sum()
    }

    /// Operations queued or in flight for `key`.
    #[must_use]
    pub fn pending_for(&self, key: &[u8]) -> usize {
        self.inner
            .lanes
            .get(key)
            .map_or(0, |lane| lane.value().outstanding())
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stops the pipeline: queued operations resolve `Cancelled` right away,
    /// in-flight calls are abandoned and resolve `Cancelled`, and later
    /// submissions fail `Cancelled`.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        let cancelled: usize = self
            .inner
            .lanes
            .iter()
            .map(|lane| lane.value().fail_queued(&StateError::Cancelled))
            .sum();
        debug!(store = %self.inner.store, cancelled, "pipeline shut down");
    }

    /// Waits for every drainer task to exit. Call after [`shutdown`](Self::shutdown).
    pub async fn closed(&self) {
        self.inner.tracker.wait().await;
    }
}

/// Dispatches the operations of one lane, one at a time, until it is empty.
async fn drain(inner: Arc<PipelineInner>, key: Bytes, lane: Arc<Lane>) {
    loop {
        let next = {
            let mut state = lane.state.lock();
            let op = if inner.shutdown.is_cancelled() {
                None
            } else {
                state.queue.pop_front()
            };
            state.in_flight = op.as_ref().map(|op| op.seq);
            // Released under the same lock that saw the queue empty, so a
            // concurrent submit either is popped here or spawns a new drainer.
            if op.is_none() {
                state.draining = false;
            }
            op
        };
        let Some(PendingOperation {
            seq,
            dispatch,
            reply,
        }) = next
        else {
            break;
        };

        let mut service = inner.service.lock().clone();
        let result = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => Err(StateError::Cancelled),
            result = async {
                service.ready().await?;
                service.call(dispatch).await
            } => result,
        };
        if reply.send(result).is_err() {
            trace!(store = %inner.store, seq, "reply discarded, future dropped");
        }

        lane.state.lock().in_flight = None;
        lane.capacity.notify_waiters();
    }

    if inner.shutdown.is_cancelled() {
        lane.fail_queued(&StateError::Cancelled);
    }
    lane.capacity.notify_waiters();

    inner
        .lanes
        .remove_if(&key, |_, current| Arc::ptr_eq(current, &lane) && current.state.lock().is_idle());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fnstate_core::ErrorKind;

    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::config::StateConfig;
    use crate::testing::ScriptedBackend;

    fn pipeline_over(backend: Arc<dyn Backend>, watermark: usize) -> RequestPipeline {
        let config = StateConfig::default();
        RequestPipeline::new(
            StoreKey::new("acme", "default", "pipeline").unwrap(),
            build_dispatch_stack(backend, &config),
            watermark,
            Handle::current(),
        )
    }

    fn opts() -> CallOptions {
        CallOptions::new(Duration::from_secs(5))
    }

    fn key(k: &'static str) -> Bytes {
        Bytes::from_static(k.as_bytes())
    }

    fn put(v: &'static str) -> OperationKind {
        OperationKind::Put(Bytes::from_static(v.as_bytes()))
    }

    #[tokio::test]
    async fn same_key_operations_complete_in_submission_order() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_key(b"k", Duration::from_millis(20));
        let pipeline = pipeline_over(backend.clone(), 64);

        let first = pipeline.submit(key("k"), put("a"), opts());
        let second = pipeline.submit(key("k"), put("b"), opts());
        let read = pipeline.submit_with(key("k"), OperationKind::Get, opts(), Reply::into_value);

        assert_eq!(read.await.unwrap(), Some(key("b")));
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(backend.calls_for(b"k"), vec!["put", "put", "get"]);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_wait_for_each_other() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_key(b"slow", Duration::from_secs(5));
        let pipeline = pipeline_over(backend, 64);

        let slow = pipeline.submit(key("slow"), put("x"), opts());
        let fast = pipeline.submit(key("fast"), put("y"), opts());

        tokio::time::timeout(Duration::from_secs(1), fast)
            .await
            .expect("fast key was held up by the slow key")
            .unwrap();
        assert_eq!(pipeline.pending_for(b"slow"), 1);
        assert!(!slow.cancel());
    }

    #[tokio::test]
    async fn cancel_before_dispatch_removes_the_operation() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_key(b"k", Duration::from_millis(100));
        let pipeline = pipeline_over(backend.clone(), 64);

        let in_flight = pipeline.submit(key("k"), put("a"), opts());
        let queued = pipeline.submit(key("k"), put("b"), opts());
        tokio::task::yield_now().await;

        assert!(queued.cancel());
        assert_eq!(queued.await.unwrap_err(), StateError::Cancelled);
        in_flight.await.unwrap();

        assert_eq!(backend.calls_for(b"k"), vec!["put"]);
        assert_eq!(
            backend.memory().snapshot(pipeline.store()),
            vec![(key("k"), key("a"))]
        );
    }

    #[tokio::test]
    async fn cancel_after_dispatch_discards_the_result() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_key(b"k", Duration::from_millis(100));
        let pipeline = pipeline_over(backend.clone(), 64);

        let op = pipeline.submit(key("k"), put("a"), opts());
        while backend.calls_for(b"k").is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(!op.cancel());
        assert_eq!(op.await.unwrap_err(), StateError::Cancelled);
    }

    #[tokio::test]
    async fn dropping_the_future_does_not_cancel() {
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = pipeline_over(backend.clone(), 64);

        drop(pipeline.submit(key("k"), put("kept"), opts()));
        let read = pipeline.submit_with(key("k"), OperationKind::Get, opts(), Reply::into_value);
        assert_eq!(read.await.unwrap(), Some(key("kept")));
    }

    #[tokio::test]
    async fn idle_lanes_are_removed() {
        let pipeline = pipeline_over(Arc::new(MemoryBackend::new()), 64);

        pipeline.submit(key("k"), put("v"), opts()).await.unwrap();
        for _ in 0..100 {
            if pipeline.inner.lanes.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(pipeline.inner.lanes.is_empty());
        assert_eq!(pipeline.pending(), 0);
    }

    #[tokio::test]
    async fn async_submissions_past_the_watermark_are_queued() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_key(b"k", Duration::from_millis(20));
        let pipeline = pipeline_over(backend, 2);

        let ops: Vec<_> = (0..5)
            .map(|_| pipeline.submit(key("k"), OperationKind::IncrBy(1), opts()))
            .collect();
        assert_eq!(pipeline.pending_for(b"k"), 5);

        let mut last = 0;
        for op in ops {
            last = op.await.unwrap().into_counter().unwrap();
        }
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn wait_for_capacity_blocks_at_the_watermark() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_key(b"k", Duration::from_millis(50));
        let pipeline = pipeline_over(backend, 2);

        // Below the watermark there is nothing to wait for.
        tokio::time::timeout(Duration::from_millis(10), pipeline.wait_for_capacity(b"k"))
            .await
            .unwrap();

        let first = pipeline.submit(key("k"), put("a"), opts());
        let second = pipeline.submit(key("k"), put("b"), opts());
        assert!(
            tokio::time::timeout(Duration::from_millis(10), pipeline.wait_for_capacity(b"k"))
                .await
                .is_err()
        );

        tokio::time::timeout(Duration::from_secs(2), pipeline.wait_for_capacity(b"k"))
            .await
            .unwrap();
        assert!(pipeline.pending_for(b"k") < 2);
        first.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_and_in_flight_work() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.delay_key(b"k", Duration::from_secs(5));
        let pipeline = pipeline_over(backend.clone(), 64);

        let in_flight = pipeline.submit(key("k"), put("a"), opts());
        let queued = pipeline.submit(key("k"), put("b"), opts());
        while backend.calls_for(b"k").is_empty() {
            tokio::task::yield_now().await;
        }

        pipeline.shutdown();
        assert_eq!(queued.await.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(in_flight.await.unwrap_err().kind(), ErrorKind::Cancelled);

        tokio::time::timeout(Duration::from_secs(1), pipeline.closed())
            .await
            .unwrap();
        let late = pipeline.submit(key("k"), put("c"), opts());
        assert_eq!(late.await.unwrap_err(), StateError::Cancelled);
        assert_eq!(backend.calls_for(b"k"), vec!["put"]);
    }
}
