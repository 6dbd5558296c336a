use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_channel::{Receiver, Sender};
#[cfg(not(target_arch = "wasm32"))]
use futures::future::BoxFuture;
#[cfg(target_arch = "wasm32")]
use futures::future::LocalBoxFuture;

use crate::firestore::error::{cancelled, internal_error, FirestoreResult};
use crate::platform::runtime::{sleep, spawn_detached, MaybeSend};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

#[cfg(not(target_arch = "wasm32"))]
pub type QueueFuture<T> = BoxFuture<'static, T>;
#[cfg(target_arch = "wasm32")]
pub type QueueFuture<T> = LocalBoxFuture<'static, T>;

#[cfg(not(target_arch = "wasm32"))]
type QueueTask = Box<dyn FnOnce() -> QueueFuture<()> + Send>;
#[cfg(target_arch = "wasm32")]
type QueueTask = Box<dyn FnOnce() -> QueueFuture<()>>;

#[cfg(not(target_arch = "wasm32"))]
type RetryableTask = Box<dyn FnMut() -> QueueFuture<FirestoreResult<()>> + Send>;
#[cfg(target_arch = "wasm32")]
type RetryableTask = Box<dyn FnMut() -> QueueFuture<FirestoreResult<()>>>;

pub fn box_queue_future<F, T>(future: F) -> QueueFuture<T>
where
    F: Future<Output = T> + MaybeSend + 'static,
{
    Box::pin(future)
}

/// Well-known delayed operations. Tests fast-forward the queue up to one of
/// these with [`AsyncQueue::run_delayed_operations_until`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Matches every delayed operation.
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    TransactionRetry,
    AsyncQueueRetry,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time_millis: i64,
    task: Option<QueueTask>,
}

struct RetryableState {
    ops: VecDeque<RetryableTask>,
    backoff: ExponentialBackoff,
}

struct QueueInner {
    sender: Sender<QueueTask>,
    delayed: Mutex<Vec<DelayedEntry>>,
    next_delayed_id: AtomicU64,
    retryable: Mutex<RetryableState>,
    shutting_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-consumer FIFO queue all client state changes run on.
///
/// Operations are executed one at a time in enqueue order; an operation's
/// future runs to completion before the next one starts. Work that needs to
/// wait for I/O owned by another component spawns that I/O and enqueues its
/// continuation instead of awaiting it inline.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_retry_backoff(BackoffConfig::default())
    }

    pub fn with_retry_backoff(config: BackoffConfig) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let inner = Arc::new(QueueInner {
            sender,
            delayed: Mutex::new(Vec::new()),
            next_delayed_id: AtomicU64::new(1),
            retryable: Mutex::new(RetryableState {
                ops: VecDeque::new(),
                backoff: ExponentialBackoff::new(config),
            }),
            shutting_down: AtomicBool::new(false),
        });
        spawn_detached(run_worker(receiver));
        Self { inner }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Schedules `op` and drops its completion.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + MaybeSend + 'static,
        Fut: Future<Output = ()> + MaybeSend + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("async queue is shutting down; dropping operation");
            return;
        }
        self.push(Box::new(move || box_queue_future(op())));
    }

    /// Schedules `op` and waits for its result. Must not be awaited from an
    /// operation already running on this queue.
    pub async fn enqueue<T, F, Fut>(&self, op: F) -> FirestoreResult<T>
    where
        T: MaybeSend + 'static,
        F: FnOnce() -> Fut + MaybeSend + 'static,
        Fut: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
    {
        if self.is_shutting_down() {
            return Err(cancelled("The client has already been terminated."));
        }
        self.enqueue_internal(op).await
    }

    /// Schedules `op` even after shutdown began. Used by the shutdown path
    /// itself.
    pub async fn enqueue_even_while_restricted<T, F, Fut>(&self, op: F) -> FirestoreResult<T>
    where
        T: MaybeSend + 'static,
        F: FnOnce() -> Fut + MaybeSend + 'static,
        Fut: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
    {
        self.enqueue_internal(op).await
    }

    /// Schedules `op` as the last regular operation; everything enqueued
    /// afterwards is rejected.
    pub async fn enqueue_and_initiate_shutdown<T, F, Fut>(&self, op: F) -> FirestoreResult<T>
    where
        T: MaybeSend + 'static,
        F: FnOnce() -> Fut + MaybeSend + 'static,
        Fut: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
    {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(cancelled("The client has already been terminated."));
        }
        lock(&self.inner.delayed).clear();
        self.enqueue_internal(op).await
    }

    async fn enqueue_internal<T, F, Fut>(&self, op: F) -> FirestoreResult<T>
    where
        T: MaybeSend + 'static,
        F: FnOnce() -> Fut + MaybeSend + 'static,
        Fut: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
    {
        let (result_tx, result_rx) = async_channel::bounded(1);
        self.push(Box::new(move || {
            box_queue_future(async move {
                let result = op().await;
                let _ = result_tx.send(result).await;
            })
        }));
        result_rx
            .recv()
            .await
            .map_err(|_| internal_error("async queue dropped an operation before it completed"))?
    }

    /// Runs `op` on the queue after `delay` unless the returned handle is
    /// cancelled first.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + MaybeSend + 'static,
        Fut: Future<Output = ()> + MaybeSend + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let target_time_millis = now_millis() + delay.as_millis() as i64;
        lock(&self.inner.delayed).push(DelayedEntry {
            id,
            timer_id,
            target_time_millis,
            task: Some(Box::new(move || box_queue_future(op()))),
        });

        let weak = Arc::downgrade(&self.inner);
        spawn_detached(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                fire_delayed(&inner, id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            queue: Arc::downgrade(&self.inner),
        }
    }

    /// Resolves once a delayed operation tagged `timer_id` fires after
    /// `delay`. Intended for callers outside the queue that back off between
    /// attempts (transactions).
    pub async fn sleep(&self, timer_id: TimerId, delay: Duration) {
        let (tx, rx) = async_channel::bounded::<()>(1);
        let _handle = self.enqueue_after_delay(timer_id, delay, move || async move {
            let _ = tx.send(()).await;
        });
        let _ = rx.recv().await;
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        lock(&self.inner.delayed)
            .iter()
            .any(|entry| entry.timer_id == timer_id && entry.task.is_some())
    }

    /// Waits for everything currently enqueued, then runs pending delayed
    /// operations in due-time order until one tagged `last_timer_id` has run
    /// (or all of them for [`TimerId::All`]).
    pub async fn run_delayed_operations_until(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.enqueue_internal(move || async move {
            let mut due: Vec<(i64, u64, TimerId)> = lock(&inner.delayed)
                .iter()
                .map(|entry| (entry.target_time_millis, entry.id, entry.timer_id))
                .collect();
            due.sort();
            for (_, id, timer_id) in due {
                if let Some(task) = take_delayed(&inner, id) {
                    task().await;
                }
                if last_timer_id != TimerId::All && timer_id == last_timer_id {
                    break;
                }
            }
            Ok(())
        })
        .await
    }

    /// Queues an operation that is retried with backoff while it fails with a
    /// transient storage error. Later retryable operations wait until it
    /// succeeds; other queue work continues to interleave.
    pub fn enqueue_retryable<F, Fut>(&self, mut op: F)
    where
        F: FnMut() -> Fut + MaybeSend + 'static,
        Fut: Future<Output = FirestoreResult<()>> + MaybeSend + 'static,
    {
        let should_schedule = {
            let mut state = lock(&self.inner.retryable);
            state.ops.push_back(Box::new(move || box_queue_future(op())));
            state.ops.len() == 1
        };
        if should_schedule {
            let queue = self.clone();
            self.enqueue_and_forget(move || async move { queue.retry_next_op().await });
        }
    }

    async fn retry_next_op(&self) {
        let future = {
            let mut state = lock(&self.inner.retryable);
            match state.ops.front_mut() {
                Some(op) => op(),
                None => return,
            }
        };

        match future.await {
            Ok(()) => {
                let mut state = lock(&self.inner.retryable);
                state.ops.pop_front();
                state.backoff.reset();
            }
            Err(err) if err.is_storage_transaction_failure() => {
                log::debug!("Operation failed with retryable error: {err}");
            }
            Err(err) => {
                log::error!("Retryable operation failed with a permanent error: {err}");
                lock(&self.inner.retryable).ops.pop_front();
            }
        }

        let delay = {
            let mut state = lock(&self.inner.retryable);
            if state.ops.is_empty() {
                return;
            }
            let delay = state.backoff.next_delay();
            state.backoff.mark_attempt();
            delay
        };
        let queue = self.clone();
        self.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move || async move {
            queue.retry_next_op_boxed().await
        });
    }

    fn retry_next_op_boxed(&self) -> QueueFuture<()> {
        let queue = self.clone();
        box_queue_future(async move { queue.retry_next_op().await })
    }

    fn push(&self, task: QueueTask) {
        if self.inner.sender.try_send(task).is_err() {
            log::warn!("async queue worker is gone; dropping operation");
        }
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: Weak<QueueInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. No-op once it ran.
    pub fn cancel(&self) {
        if let Some(inner) = self.queue.upgrade() {
            lock(&inner.delayed).retain(|entry| entry.id != self.id);
        }
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

async fn run_worker(receiver: Receiver<QueueTask>) {
    while let Ok(task) = receiver.recv().await {
        task().await;
    }
}

fn take_delayed(inner: &QueueInner, id: u64) -> Option<QueueTask> {
    let mut delayed = lock(&inner.delayed);
    let position = delayed.iter().position(|entry| entry.id == id)?;
    delayed.remove(position).task.take()
}

fn fire_delayed(inner: &Arc<QueueInner>, id: u64) {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    let weak = Arc::downgrade(inner);
    let task: QueueTask = Box::new(move || {
        box_queue_future(async move {
            let task = weak.upgrade().and_then(|inner| take_delayed(&inner, id));
            if let Some(task) = task {
                task().await;
            }
        })
    });
    let _ = inner.sender.try_send(task);
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::storage_transaction_failed;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |entry: &str| sink.lock().unwrap().push(entry.to_string()))
    }

    #[tokio::test]
    async fn runs_operations_in_enqueue_order() {
        let queue = AsyncQueue::new();
        let (log, record) = recorder();
        for index in 0..5 {
            let record = record.clone();
            queue.enqueue_and_forget(move || async move {
                sleep(Duration::from_millis(5 - index)).await;
                record(&format!("op{index}"));
            });
        }
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["op0", "op1", "op2", "op3", "op4"]
        );
    }

    #[tokio::test]
    async fn enqueue_returns_result() {
        let queue = AsyncQueue::new();
        let value = queue.enqueue(|| async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::new();
        let (log, record) = recorder();
        let first = record.clone();
        let handle = queue.enqueue_after_delay(
            TimerId::ListenStreamIdle,
            Duration::from_secs(60),
            move || async move { first("idle") },
        );
        queue.enqueue_after_delay(
            TimerId::WriteStreamIdle,
            Duration::from_secs(60),
            move || async move { record("write-idle") },
        );
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        handle.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));

        queue.run_delayed_operations_until(TimerId::All).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["write-idle"]);
    }

    #[tokio::test]
    async fn fast_forward_stops_at_requested_timer() {
        let queue = AsyncQueue::new();
        let (log, record) = recorder();
        for (timer, delay, name) in [
            (TimerId::ListenStreamConnectionBackoff, 10, "backoff"),
            (TimerId::OnlineStateTimeout, 20, "online"),
            (TimerId::LruGarbageCollection, 30, "gc"),
        ] {
            let record = record.clone();
            queue.enqueue_after_delay(timer, Duration::from_secs(delay), move || async move {
                record(name)
            });
        }
        queue
            .run_delayed_operations_until(TimerId::OnlineStateTimeout)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["backoff", "online"]);
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
    }

    #[tokio::test]
    async fn failed_retryable_operation_blocks_later_ones() {
        let queue = AsyncQueue::new();
        let (log, record) = recorder();
        let attempts = Arc::new(AtomicUsize::new(0));

        let first_attempts = Arc::clone(&attempts);
        let first = record.clone();
        queue.enqueue_retryable(move || {
            let attempts = Arc::clone(&first_attempts);
            let record = first.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(storage_transaction_failed("busy"));
                }
                record("first");
                Ok(())
            }
        });
        let second = record.clone();
        queue.enqueue_retryable(move || {
            let record = second.clone();
            async move {
                record("second");
                Ok(())
            }
        });
        queue.enqueue_and_forget(move || async move { record("regular") });

        for _ in 0..50 {
            if log.lock().unwrap().len() == 3 {
                break;
            }
            queue
                .run_delayed_operations_until(TimerId::All)
                .await
                .unwrap();
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["regular", "first", "second"]
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_operations() {
        let queue = AsyncQueue::new();
        queue
            .enqueue_and_initiate_shutdown(|| async { Ok(()) })
            .await
            .unwrap();
        let err = queue.enqueue(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Cancelled);
        queue
            .enqueue_even_while_restricted(|| async { Ok(()) })
            .await
            .unwrap();
    }
}
