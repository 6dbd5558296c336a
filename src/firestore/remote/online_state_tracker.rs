use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::firestore::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::types::OnlineState;
use crate::firestore::error::FirestoreError;

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    /// Consecutive watch stream failures without a message in between.
    watch_stream_failures: usize,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

/// Derives the client's [`OnlineState`] from the health of the watch
/// stream.
///
/// A connection attempt puts the client into `Unknown`. It becomes `Offline`
/// when the attempt fails `max_failures` times in a row, or when no
/// message arrives within the timeout; it becomes `Online` once the remote
/// store reports a healthy stream via [`set`](Self::set).
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<Mutex<TrackerState>>,
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    timeout: Duration,
    max_failures: usize,
}

impl OnlineStateTracker {
    pub fn new(
        queue: AsyncQueue,
        handler: OnlineStateHandler,
        timeout: Duration,
        max_failures: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            })),
            queue,
            handler,
            timeout,
            max_failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    /// The remote store is trying to connect the watch stream.
    pub fn handle_watch_stream_start(&self) {
        let broadcast = {
            let mut inner = self.lock();
            if inner.watch_stream_failures != 0 {
                return;
            }
            let broadcast = Self::transition(&mut inner, OnlineState::Unknown);

            let tracker = self.clone();
            inner.online_state_timer = Some(self.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                self.timeout,
                move || async move { tracker.on_timeout() },
            ));
            broadcast
        };
        self.broadcast(broadcast);
    }

    fn on_timeout(&self) {
        let broadcast = {
            let mut inner = self.lock();
            inner.online_state_timer = None;
            if inner.state != OnlineState::Unknown {
                return;
            }
            Self::log_offline_warning(
                &mut inner,
                &format!(
                    "Backend didn't respond within {} seconds.",
                    self.timeout.as_secs()
                ),
            );
            Self::transition(&mut inner, OnlineState::Offline)
        };
        self.broadcast(broadcast);
    }

    /// The watch stream failed. Once online, a failure only means the state
    /// is unknown again; before that, repeated failures mean offline.
    pub fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        let broadcast = {
            let mut inner = self.lock();
            if inner.state == OnlineState::Online {
                Self::transition(&mut inner, OnlineState::Unknown)
            } else {
                inner.watch_stream_failures += 1;
                if inner.watch_stream_failures < self.max_failures {
                    return;
                }
                if let Some(timer) = inner.online_state_timer.take() {
                    timer.cancel();
                }
                let reason = match error {
                    Some(err) => format!(
                        "Connection failed {} times. Most recent error: {err}",
                        self.max_failures
                    ),
                    None => format!("Connection failed {} times.", self.max_failures),
                };
                Self::log_offline_warning(&mut inner, &reason);
                Self::transition(&mut inner, OnlineState::Offline)
            }
        };
        self.broadcast(broadcast);
    }

    /// Explicitly sets the state, e.g. `Online` after the first watch
    /// message or `Offline` when the network is disabled.
    pub fn set(&self, new_state: OnlineState) {
        let broadcast = {
            let mut inner = self.lock();
            if let Some(timer) = inner.online_state_timer.take() {
                timer.cancel();
            }
            inner.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                inner.should_warn_client_is_offline = false;
            }
            Self::transition(&mut inner, new_state)
        };
        self.broadcast(broadcast);
    }

    pub fn shutdown(&self) {
        if let Some(timer) = self.lock().online_state_timer.take() {
            timer.cancel();
        }
    }

    fn transition(inner: &mut TrackerState, new_state: OnlineState) -> Option<OnlineState> {
        if inner.state == new_state {
            return None;
        }
        inner.state = new_state;
        Some(new_state)
    }

    fn broadcast(&self, state: Option<OnlineState>) {
        if let Some(state) = state {
            (self.handler)(state);
        }
    }

    fn log_offline_warning(inner: &mut TrackerState, details: &str) {
        let message = format!(
            "Could not reach the Firestore backend. {details}\nThis typically indicates that your device does not have a healthy Internet connection at the moment. The client will operate in offline mode until it is able to successfully connect to the backend."
        );
        if inner.should_warn_client_is_offline {
            log::warn!("{message}");
            inner.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker(max_failures: usize) -> (OnlineStateTracker, Arc<Mutex<Vec<OnlineState>>>, AsyncQueue) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let queue = AsyncQueue::new();
        let tracker = OnlineStateTracker::new(
            queue.clone(),
            Arc::new(move |state| sink.lock().unwrap().push(state)),
            Duration::from_secs(10),
            max_failures,
        );
        (tracker, seen, queue)
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let (tracker, seen, _queue) = tracker(1);
        tracker.handle_watch_stream_start();
        assert_eq!(tracker.state(), OnlineState::Unknown);
        tracker.handle_watch_stream_failure(Some(&unavailable("down")));
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn timeout_goes_offline() {
        let (tracker, seen, queue) = tracker(3);
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        queue
            .run_delayed_operations_until(TimerId::OnlineStateTimeout)
            .await
            .unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn online_failure_only_resets_to_unknown() {
        let (tracker, seen, queue) = tracker(1);
        tracker.handle_watch_stream_start();
        tracker.set(OnlineState::Online);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        tracker.handle_watch_stream_failure(None);
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown]
        );
    }
}
