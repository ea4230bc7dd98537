//! Multiplexed relay connection
//!
//! One authenticated connection carries many logical streams, framed per
//! `vmrelay-proto`. A reader task demultiplexes inbound frames to
//! per-stream channels; a writer task serializes outbound frames. Byte
//! order is preserved per stream and direction; the reader keeps at most
//! one inbound frame in flight, so a slow session backpressures the
//! connection rather than buffering unboundedly.

use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use vmrelay_proto::{Frame, FrameFlags, FrameHeader, FrameType, RelayMessage, StreamId};

/// Marker trait for the underlying duplex byte channel (TCP or TLS).
pub(crate) trait RelayIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayIo for T {}

/// Read one frame; `Ok(None)` on clean EOF at a frame boundary.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> TransportResult<Option<Frame>> {
    let mut header = [0u8; FrameHeader::SIZE];
    if let Err(e) = io.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(TransportError::ConnectionFailed(e.to_string()));
    }

    let header = FrameHeader::decode(&header)
        .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;

    let mut payload = vec![0u8; header.payload_len as usize];
    io.read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    Ok(Some(Frame {
        stream_id: header.stream_id,
        frame_type: header.frame_type,
        flags: header.flags,
        payload: Bytes::from(payload),
    }))
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    io: &mut W,
    frame: &Frame,
) -> TransportResult<()> {
    let encoded = frame
        .encode()
        .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
    io.write_all(&encoded)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
}

pub(crate) fn control_frame(message: &RelayMessage) -> TransportResult<Frame> {
    let payload = message
        .encode()
        .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
    Ok(Frame::control(Bytes::from(payload)))
}

/// Empty chunk on a stream's inbound channel signals end of stream.
/// Data frames with empty payloads are never sent.
const EOF_SENTINEL: Bytes = Bytes::new();

struct ConnectionShared {
    outbound: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<StreamId, mpsc::Sender<Bytes>>>,
    pending_opens: Mutex<HashMap<StreamId, oneshot::Sender<TransportResult<()>>>>,
    closed_tx: watch::Sender<Option<TransportError>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionShared {
    /// Record the first close reason, fail pending opens, end all streams.
    fn mark_closed(&self, reason: TransportError) {
        let mut first = false;
        self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                first = true;
                true
            } else {
                false
            }
        });

        if first {
            debug!("Relay connection closed: {}", reason);
            self.streams.lock().unwrap().clear();
            for (_, ack) in self.pending_opens.lock().unwrap().drain() {
                let _ = ack.send(Err(reason.clone()));
            }
        }
    }
}

/// An open, authenticated connection to the relay endpoint.
///
/// Cheap to clone; all clones share the same underlying connection.
/// `close()` is idempotent and the only way the transport handle is
/// released.
#[derive(Clone)]
pub struct RelayConnection {
    shared: Arc<ConnectionShared>,
    session_id: String,
    next_stream_id: Arc<AtomicU32>,
    closed_rx: watch::Receiver<Option<TransportError>>,
    stream_open_timeout: Duration,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl RelayConnection {
    pub(crate) fn start(
        io: Box<dyn RelayIo>,
        session_id: String,
        stream_open_timeout: Duration,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(64);
        let (closed_tx, closed_rx) = watch::channel(None);

        let shared = Arc::new(ConnectionShared {
            outbound: outbound_tx,
            streams: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(run_writer(write_half, outbound_rx, shared.clone()));
        let reader = tokio::spawn(run_reader(read_half, shared.clone()));
        shared.tasks.lock().unwrap().extend([writer, reader]);

        Self {
            shared,
            session_id,
            next_stream_id: Arc::new(AtomicU32::new(1)),
            closed_rx,
            stream_open_timeout,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.closed_rx.borrow().is_none()
    }

    /// Watch that resolves to the close reason once the connection dies.
    pub fn closed(&self) -> watch::Receiver<Option<TransportError>> {
        self.closed_rx.clone()
    }

    /// Open one logical stream to the target, confirmed end to end by
    /// the relay before any bytes flow.
    pub async fn open_stream(&self) -> TransportResult<RelayStream> {
        if let Some(reason) = self.closed_rx.borrow().clone() {
            return Err(reason);
        }

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel::<Bytes>(32);
        let (ack_tx, ack_rx) = oneshot::channel();

        self.shared
            .streams
            .lock()
            .unwrap()
            .insert(stream_id, data_tx);
        self.shared
            .pending_opens
            .lock()
            .unwrap()
            .insert(stream_id, ack_tx);

        let open = control_frame(&RelayMessage::OpenStream { stream_id })?;
        if self.shared.outbound.send(open).await.is_err() {
            self.forget_stream(stream_id);
            return Err(TransportError::ConnectionClosed);
        }

        let ack = tokio::time::timeout(self.stream_open_timeout, ack_rx).await;
        match ack {
            Err(_) => {
                self.forget_stream(stream_id);
                Err(TransportError::ConnectionFailed(
                    "Stream open timed out".to_string(),
                ))
            }
            Ok(Err(_)) => {
                // Connection driver went away before answering.
                self.forget_stream(stream_id);
                Err(self
                    .closed_rx
                    .borrow()
                    .clone()
                    .unwrap_or(TransportError::ConnectionClosed))
            }
            Ok(Ok(Err(e))) => {
                self.forget_stream(stream_id);
                Err(e)
            }
            Ok(Ok(Ok(()))) => {
                trace!("Opened relay stream {}", stream_id);
                Ok(RelayStream {
                    tx: RelayStreamSender {
                        stream_id,
                        outbound: self.shared.outbound.clone(),
                        closed: false,
                    },
                    rx: RelayStreamReceiver {
                        stream_id,
                        rx: data_rx,
                        eof: false,
                    },
                })
            }
        }
    }

    fn forget_stream(&self, stream_id: StreamId) {
        self.shared.streams.lock().unwrap().remove(&stream_id);
        self.shared.pending_opens.lock().unwrap().remove(&stream_id);
    }

    /// Close the connection and release transport resources. Idempotent.
    pub fn close(&self) {
        self.shared.mark_closed(TransportError::ConnectionClosed);
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn run_writer(
    mut write_half: WriteHalf<Box<dyn RelayIo>>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    shared: Arc<ConnectionShared>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            shared.mark_closed(e);
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn run_reader(mut read_half: ReadHalf<Box<dyn RelayIo>>, shared: Arc<ConnectionShared>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => {
                if let Err(e) = dispatch_frame(&shared, frame).await {
                    shared.mark_closed(e);
                    return;
                }
            }
            Ok(None) => {
                shared.mark_closed(TransportError::ConnectionClosed);
                return;
            }
            Err(e) => {
                shared.mark_closed(e);
                return;
            }
        }
    }
}

async fn dispatch_frame(shared: &Arc<ConnectionShared>, frame: Frame) -> TransportResult<()> {
    match frame.frame_type {
        FrameType::Control => {
            let message = RelayMessage::decode(&frame.payload)
                .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
            dispatch_control(shared, message).await
        }
        FrameType::Data => {
            if frame.payload.is_empty() {
                return Ok(());
            }
            let sender = shared
                .streams
                .lock()
                .unwrap()
                .get(&frame.stream_id)
                .cloned();
            match sender {
                // Receiver gone means the session ended locally; drop.
                Some(tx) => {
                    let _ = tx.send(frame.payload).await;
                }
                None => trace!("Data for unknown stream {}, dropping", frame.stream_id),
            }
            Ok(())
        }
        FrameType::Close => {
            let sender = shared.streams.lock().unwrap().remove(&frame.stream_id);
            if let Some(tx) = sender {
                let _ = tx.send(EOF_SENTINEL).await;
            }
            Ok(())
        }
    }
}

async fn dispatch_control(
    shared: &Arc<ConnectionShared>,
    message: RelayMessage,
) -> TransportResult<()> {
    match message {
        RelayMessage::StreamOpened { stream_id } => {
            if let Some(ack) = shared.pending_opens.lock().unwrap().remove(&stream_id) {
                let _ = ack.send(Ok(()));
            }
        }
        RelayMessage::StreamRefused { stream_id, reason } => {
            shared.streams.lock().unwrap().remove(&stream_id);
            if let Some(ack) = shared.pending_opens.lock().unwrap().remove(&stream_id) {
                let _ = ack.send(Err(TransportError::ConnectionFailed(reason)));
            }
        }
        RelayMessage::Ping { timestamp } => {
            let pong = control_frame(&RelayMessage::Pong { timestamp })?;
            let _ = shared.outbound.send(pong).await;
        }
        other => {
            warn!("Unexpected control message: {:?}", other);
        }
    }
    Ok(())
}

/// One logical stream over the relay connection, paired 1:1 with a
/// local socket by the tunnel layer.
pub struct RelayStream {
    tx: RelayStreamSender,
    rx: RelayStreamReceiver,
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStream")
            .field("stream_id", &self.tx.stream_id)
            .finish_non_exhaustive()
    }
}

impl RelayStream {
    pub fn stream_id(&self) -> StreamId {
        self.tx.stream_id
    }

    pub async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        self.tx.send(data).await
    }

    /// Receive the next chunk; `None` on end of stream.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Clean end of stream (FIN). Idempotent.
    pub async fn finish(&mut self) -> TransportResult<()> {
        self.tx.finish().await
    }

    /// Split into independently owned send/receive halves, one per
    /// byte-pump direction.
    pub fn split(self) -> (RelayStreamSender, RelayStreamReceiver) {
        (self.tx, self.rx)
    }
}

/// Send half of a [`RelayStream`].
pub struct RelayStreamSender {
    stream_id: StreamId,
    outbound: mpsc::Sender<Frame>,
    closed: bool,
}

impl RelayStreamSender {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }
        for chunk in data.chunks(vmrelay_proto::MAX_FRAME_SIZE as usize) {
            let frame = Frame::data(self.stream_id, Bytes::copy_from_slice(chunk));
            self.outbound
                .send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Clean end of stream (FIN). Idempotent.
    pub async fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = Frame::close(self.stream_id).with_flags(FrameFlags::new().with_fin());
        let _ = self.outbound.send(frame).await;
        Ok(())
    }

    /// Abortive close (RST). Idempotent.
    pub async fn reset(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = Frame::close(self.stream_id).with_flags(FrameFlags::new().with_rst());
        let _ = self.outbound.send(frame).await;
        Ok(())
    }
}

impl Drop for RelayStreamSender {
    fn drop(&mut self) {
        // Best effort so the relay does not hold the stream open.
        if !self.closed {
            let frame = Frame::close(self.stream_id).with_flags(FrameFlags::new().with_rst());
            let _ = self.outbound.try_send(frame);
        }
    }
}

/// Receive half of a [`RelayStream`].
pub struct RelayStreamReceiver {
    stream_id: StreamId,
    rx: mpsc::Receiver<Bytes>,
    eof: bool,
}

impl RelayStreamReceiver {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Receive the next chunk; `None` on end of stream or connection loss.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.eof {
            return None;
        }
        match self.rx.recv().await {
            Some(chunk) if chunk.is_empty() => {
                self.eof = true;
                None
            }
            Some(chunk) => Some(chunk),
            None => {
                self.eof = true;
                None
            }
        }
    }
}
