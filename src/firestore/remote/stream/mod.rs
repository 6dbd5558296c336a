use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub mod persistent;

/// Request metadata sent with the frame that opens a stream.
pub type StreamHeaders = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamHeaders),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, headers: StreamHeaders) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(headers),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// A bidirectional frame pipe carrying any number of logical streams.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamTable = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

fn lock_streams(streams: &StreamTable) -> MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multiplexes logical streams over one [`StreamTransport`].
///
/// The opening side picks the stream id; the other side learns about the
/// stream from its `Open` frame and receives it through [`accept`].
///
/// [`accept`]: MultiplexedConnection::accept
pub struct MultiplexedConnection {
    transport: Arc<dyn StreamTransport>,
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
    accepted_rx: Receiver<MultiplexedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            transport: Arc::clone(&transport),
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams: Arc::clone(&streams),
            accepted_rx,
        };

        manager.start_outbound_loop(outbound_rx);
        manager.start_inbound_loop(streams, accepted_tx);
        manager
    }

    fn start_outbound_loop(&self, outbound_rx: Receiver<TransportFrame>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(&self, streams: StreamTable, accepted_tx: Sender<MultiplexedStream>) {
        let transport = Arc::clone(&self.transport);
        let handle = self.clone_handle();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err}");
                        fail_all_streams(&streams, err).await;
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                let event = frame.kind().clone();
                let maybe_sender = lock_streams(&streams).get(&stream_id).cloned();

                match (maybe_sender, event) {
                    (None, FrameKind::Open(headers)) => {
                        let (inbound_tx, inbound_rx) = async_channel::unbounded();
                        lock_streams(&streams).insert(stream_id, inbound_tx);
                        let stream = MultiplexedStream {
                            id: stream_id,
                            headers,
                            outbound: handle.outbound_tx.clone(),
                            inbound: inbound_rx,
                            manager: handle.clone(),
                        };
                        if accepted_tx.send(stream).await.is_err() {
                            log::debug!("no acceptor for stream {}", stream_id.value());
                        }
                    }
                    (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                        let _ = sender.send(event).await;
                        lock_streams(&streams).remove(&stream_id);
                    }
                    (Some(sender), event) => {
                        if sender.send(event).await.is_err() {
                            log::debug!(
                                "dropping inbound frame for closed stream {}",
                                stream_id.value()
                            );
                        }
                    }
                    (None, _) => {
                        log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    }
                }
            }
        });
    }

    /// Opens a new logical stream, announcing it to the peer with `headers`.
    pub async fn open_stream(&self, headers: StreamHeaders) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock_streams(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, headers.clone()))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            headers,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            manager: self.clone_handle(),
        })
    }

    /// Waits for the peer to open a stream.
    pub async fn accept(&self) -> FirestoreResult<MultiplexedStream> {
        self.accepted_rx
            .recv()
            .await
            .map_err(|_| unavailable("connection closed"))
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

async fn fail_all_streams(streams: &StreamTable, error: FirestoreError) {
    let senders: Vec<Sender<FrameKind>> = lock_streams(streams).drain().map(|(_, s)| s).collect();
    for sender in senders {
        let _ = sender.send(FrameKind::Error(error.clone())).await;
    }
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
}

impl MultiplexedConnectionHandle {
    pub fn close_stream(&self, stream_id: StreamId) {
        let registered = lock_streams(&self.streams).remove(&stream_id).is_some();
        if registered {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    headers: StreamHeaders,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Headers the stream was opened with.
    pub fn headers(&self) -> &StreamHeaders {
        &self.headers
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    /// Ends the stream with an error delivered to the peer.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }

    /// Next payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.manager.close_stream(self.id);
        Ok(())
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}
