use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::firestore::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::error::{unknown, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::{StreamHandle, StreamingDatastore};
use crate::firestore::remote::network::{StreamCredentialProvider, StreamCredentials};
use crate::platform::runtime;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    fn label(self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }

    fn idle_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }
}

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial --start--> Starting --opened--> Open
///    ^                  |                   |
///    |                  +------error--------+--> Error --start--> Backoff
///    +-------------------- stop / backoff elapsed ------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    Initial,
    Starting,
    Open,
    Error,
    Backoff,
}

/// Protocol-specific half of a stream. Every callback runs on the async
/// queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait PersistentStreamDelegate: Send + Sync + 'static {
    async fn on_open(&self, stream: &PersistentStream);

    async fn on_message(&self, stream: &PersistentStream, payload: Vec<u8>) -> FirestoreResult<()>;

    /// `error` is `None` when the stream was stopped on purpose.
    async fn on_close(&self, stream: &PersistentStream, error: Option<FirestoreError>);
}

struct StreamCore {
    state: PersistentStreamState,
    /// Bumped on every close; callbacks from an older incarnation of the
    /// stream carry a stale value and are dropped.
    close_count: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
}

/// A long-lived RPC that is reopened on demand, backs off after failures
/// and closes itself after a period of idleness.
pub struct PersistentStream {
    kind: StreamKind,
    queue: AsyncQueue,
    datastore: Arc<dyn StreamingDatastore>,
    credentials: StreamCredentialProvider,
    idle_timeout: Duration,
    delegate: Arc<dyn PersistentStreamDelegate>,
    this: Weak<PersistentStream>,
    core: Mutex<StreamCore>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: StreamCredentialProvider,
        backoff: BackoffConfig,
        idle_timeout: Duration,
        delegate: Arc<dyn PersistentStreamDelegate>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            kind,
            queue,
            datastore,
            credentials,
            idle_timeout,
            delegate,
            this: this.clone(),
            core: Mutex::new(StreamCore {
                state: PersistentStreamState::Initial,
                close_count: 0,
                handle: None,
                backoff: ExponentialBackoff::new(backoff),
                idle_timer: None,
                backoff_timer: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> PersistentStreamState {
        self.lock().state
    }

    /// True from `start` until the stream is closed, including while it
    /// connects or backs off.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting
                | PersistentStreamState::Open
                | PersistentStreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistentStreamState::Open
    }

    /// Starts connecting. After an error the connection attempt is delayed
    /// by the backoff. Must be called on the async queue.
    pub fn start(&self) {
        let close_count = {
            let mut core = self.lock();
            let state = core.state;
            match state {
                PersistentStreamState::Error => {
                    drop(core);
                    self.perform_backoff();
                    return;
                }
                PersistentStreamState::Initial => {}
                state => {
                    log::debug!("{} stream already started ({state:?})", self.kind.label());
                    return;
                }
            }
            core.state = PersistentStreamState::Starting;
            core.close_count
        };

        let this = self.this.clone();
        let credentials = self.credentials.clone();
        let queue = self.queue.clone();
        runtime::spawn_detached(async move {
            let result = credentials.fetch().await;
            queue.enqueue_and_forget(move || async move {
                if let Some(stream) = this.upgrade() {
                    stream.on_credentials(close_count, result).await;
                }
            });
        });
    }

    /// Closes the stream without an error. The next `start` connects
    /// immediately.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    /// After an error, lets the next `start` skip the backoff delay.
    pub fn inhibit_backoff(&self) {
        let mut core = self.lock();
        debug_assert!(
            !matches!(
                core.state,
                PersistentStreamState::Starting
                    | PersistentStreamState::Open
                    | PersistentStreamState::Backoff
            ),
            "inhibit_backoff on a started stream"
        );
        core.state = PersistentStreamState::Initial;
        core.backoff.reset();
    }

    /// Schedules an idle close unless traffic arrives in the meantime.
    pub fn mark_idle(&self) {
        let mut core = self.lock();
        if core.state != PersistentStreamState::Open || core.idle_timer.is_some() {
            return;
        }
        let this = self.this.clone();
        core.idle_timer = Some(self.queue.enqueue_after_delay(
            self.kind.idle_timer(),
            self.idle_timeout,
            move || async move {
                if let Some(stream) = this.upgrade() {
                    stream.handle_idle_close_timer().await;
                }
            },
        ));
    }

    pub(crate) fn reset_backoff(&self) {
        self.lock().backoff.reset();
    }

    /// Sends one message on the open stream.
    pub async fn send(&self, payload: Vec<u8>) {
        let handle = {
            let mut core = self.lock();
            if let Some(timer) = core.idle_timer.take() {
                timer.cancel();
            }
            core.handle.clone()
        };
        let Some(handle) = handle else {
            log::debug!("{} stream dropped a message: not open", self.kind.label());
            return;
        };
        if let Err(err) = handle.send(payload).await {
            log::debug!("{} stream failed to send: {err}", self.kind.label());
        }
    }

    fn is_current(&self, close_count: u64) -> bool {
        self.lock().close_count == close_count
    }

    async fn on_credentials(
        &self,
        close_count: u64,
        result: FirestoreResult<StreamCredentials>,
    ) {
        if !self.is_current(close_count) {
            return;
        }
        let credentials = match result {
            Ok(credentials) => credentials,
            Err(err) => {
                let error = unknown(format!("Fetching auth token failed: {}", err.message()));
                self.close(PersistentStreamState::Error, Some(error)).await;
                return;
            }
        };

        let this = self.this.clone();
        let datastore = Arc::clone(&self.datastore);
        let queue = self.queue.clone();
        let kind = self.kind;
        runtime::spawn_detached(async move {
            let opened = match kind {
                StreamKind::Listen => datastore.open_listen_stream(&credentials).await,
                StreamKind::Write => datastore.open_write_stream(&credentials).await,
            };
            queue.enqueue_and_forget(move || async move {
                if let Some(stream) = this.upgrade() {
                    stream.on_stream_opened(close_count, opened).await;
                }
            });
        });
    }

    async fn on_stream_opened(
        &self,
        close_count: u64,
        opened: FirestoreResult<Arc<dyn StreamHandle>>,
    ) {
        let handle = match opened {
            Ok(handle) => handle,
            Err(err) => {
                if self.is_current(close_count) {
                    self.close(PersistentStreamState::Error, Some(err)).await;
                }
                return;
            }
        };
        let current = {
            let mut core = self.lock();
            let current = core.close_count == close_count;
            if current {
                core.state = PersistentStreamState::Open;
                core.handle = Some(Arc::clone(&handle));
            }
            current
        };
        if !current {
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
            return;
        }
        log::debug!("{} stream open", self.kind.label());
        self.spawn_reader(close_count, handle);
        self.delegate.on_open(self).await;
    }

    fn spawn_reader(&self, close_count: u64, handle: Arc<dyn StreamHandle>) {
        let this = self.this.clone();
        let queue = self.queue.clone();
        runtime::spawn_detached(async move {
            loop {
                let next = handle.next().await;
                let finished = !matches!(next, Some(Ok(_)));
                let weak = this.clone();
                queue.enqueue_and_forget(move || async move {
                    let Some(stream) = weak.upgrade() else {
                        return;
                    };
                    match next {
                        Some(Ok(payload)) => stream.on_message(close_count, payload).await,
                        Some(Err(err)) => stream.handle_stream_close(close_count, Some(err)).await,
                        None => stream.handle_stream_close(close_count, None).await,
                    }
                });
                if finished {
                    break;
                }
                let stale = this
                    .upgrade()
                    .map_or(true, |stream| !stream.is_current(close_count));
                if stale {
                    break;
                }
            }
        });
    }

    async fn on_message(&self, close_count: u64, payload: Vec<u8>) {
        if !self.is_current(close_count) {
            return;
        }
        if let Err(err) = self.delegate.on_message(self, payload).await {
            log::warn!("{} stream received a bad message: {err}", self.kind.label());
            self.close(PersistentStreamState::Error, Some(err)).await;
        }
    }

    async fn handle_stream_close(&self, close_count: u64, error: Option<FirestoreError>) {
        if !self.is_current(close_count) {
            return;
        }
        if let Some(err) = &error {
            log::debug!("{} stream closed with error: {err}", self.kind.label());
        }
        // A server-side close still counts as a failure for backoff purposes.
        self.close(PersistentStreamState::Error, error).await;
    }

    async fn handle_idle_close_timer(&self) {
        let open = {
            let mut core = self.lock();
            core.idle_timer = None;
            core.state == PersistentStreamState::Open
        };
        if open {
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    async fn close(&self, final_state: PersistentStreamState, error: Option<FirestoreError>) {
        let (handle, invalidate) = {
            let mut core = self.lock();
            if let Some(timer) = core.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = core.backoff_timer.take() {
                timer.cancel();
            }
            core.close_count += 1;

            let mut invalidate = false;
            if final_state != PersistentStreamState::Error {
                core.backoff.reset();
            } else if let Some(err) = &error {
                match err.code {
                    FirestoreErrorCode::ResourceExhausted => {
                        log::debug!("using maximum backoff delay to prevent overloading the backend");
                        core.backoff.reset_to_max();
                    }
                    FirestoreErrorCode::Unauthenticated
                        if core.state != PersistentStreamState::Open =>
                    {
                        invalidate = true;
                    }
                    _ => {}
                }
            }
            core.state = final_state;
            (core.handle.take(), invalidate)
        };

        if invalidate {
            self.credentials.invalidate();
        }
        if let Some(handle) = handle {
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
        }
        self.delegate.on_close(self, error).await;
    }

    fn perform_backoff(&self) {
        let mut core = self.lock();
        core.state = PersistentStreamState::Backoff;
        let delay = core.backoff.next_delay();
        let this = self.this.clone();
        core.backoff_timer = Some(self.queue.enqueue_after_delay(
            self.kind.backoff_timer(),
            delay,
            move || async move {
                if let Some(stream) = this.upgrade() {
                    stream.after_backoff();
                }
            },
        ));
    }

    fn after_backoff(&self) {
        {
            let mut core = self.lock();
            if core.state != PersistentStreamState::Backoff {
                return;
            }
            core.backoff_timer = None;
            core.backoff.mark_attempt();
            core.state = PersistentStreamState::Initial;
        }
        self.start();
    }
}
