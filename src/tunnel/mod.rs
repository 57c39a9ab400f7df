//! Relay tunnels to the remote worker.
//!
//! An [`EstablishedTunnel`] owns one worker connection and carries any number
//! of sub-streams over it. Outbound frames go through a single writer task so
//! frames never interleave; a reader task demultiplexes inbound frames to the
//! sub-stream they belong to.

pub mod connector;
pub mod key;
pub mod mux;
pub mod registry;
pub mod worker;

pub use connector::{WebSocketConnector, WorkerConnector};
pub use key::{ClientSession, TunnelKey};
pub use mux::{Frame, FrameType, StreamId, StreamKind, TargetAddr};
pub use registry::{RegistryConfig, TunnelRegistry};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use mux::{MAX_FRAME_PAYLOAD, STATUS_OK};

/// Byte stream a tunnel can run over.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Boxed worker connection.
pub type BoxedIo = Box<dyn AsyncIo>;

type StreamSenders = Arc<Mutex<HashMap<StreamId, mpsc::Sender<Frame>>>>;

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// I/O deadlines applied to a tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TunnelTimeouts {
    /// How long to wait for the worker to acknowledge a sub-stream open
    pub read: Duration,
    /// Upper bound on writing one frame to the worker connection
    pub write: Duration,
}

impl Default for TunnelTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            write: Duration::from_secs(10),
        }
    }
}

struct Activity {
    last: Instant,
    closed: bool,
}

/// One live worker connection.
pub struct EstablishedTunnel {
    id: u64,
    key: String,
    frame_tx: mpsc::Sender<Frame>,
    streams: StreamSenders,
    next_stream_id: AtomicU32,
    activity: Mutex<Activity>,
    cancel: CancellationToken,
    timeouts: TunnelTimeouts,
}

impl EstablishedTunnel {
    /// Take ownership of `io` and start the writer and reader tasks.
    pub fn spawn(key: &str, io: BoxedIo, timeouts: TunnelTimeouts) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(256);

        let tunnel = Arc::new(Self {
            id: NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed),
            key: key.to_string(),
            frame_tx,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_stream_id: AtomicU32::new(1),
            activity: Mutex::new(Activity {
                last: Instant::now(),
                closed: false,
            }),
            cancel: CancellationToken::new(),
            timeouts,
        });

        tokio::spawn(tunnel_writer(
            write_half,
            frame_rx,
            tunnel.cancel.clone(),
            timeouts.write,
        ));
        tokio::spawn(tunnel_reader(read_half, Arc::downgrade(&tunnel)));

        tracing::debug!("tunnel {} established for {}", tunnel.id, tunnel.key);
        tunnel
    }

    /// Process-unique tunnel number, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Registry key this tunnel was created for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Refresh last activity.
    pub fn touch(&self) {
        self.activity.lock().last = Instant::now();
    }

    /// Time since the last read or write.
    pub fn idle_for(&self) -> Duration {
        self.activity.lock().last.elapsed()
    }

    /// Whether the worker connection is gone or the tunnel was closed.
    pub fn is_closed(&self) -> bool {
        self.activity.lock().closed
    }

    /// Claim the tunnel for use: refreshes activity unless it is closed or
    /// has already been idle for `idle_timeout`.
    pub fn try_acquire(&self, idle_timeout: Duration) -> bool {
        let mut activity = self.activity.lock();
        if activity.closed || activity.last.elapsed() >= idle_timeout {
            return false;
        }
        activity.last = Instant::now();
        true
    }

    /// Mark the tunnel closed if it has been idle for `idle_timeout`.
    /// Returns true when this call expired it.
    pub fn expire_if_idle(&self, idle_timeout: Duration) -> bool {
        let mut activity = self.activity.lock();
        if activity.closed || activity.last.elapsed() < idle_timeout {
            return false;
        }
        activity.closed = true;
        true
    }

    /// Close the worker connection. Open sub-streams observe
    /// [`Error::TunnelClosed`].
    pub fn close(&self) {
        self.activity.lock().closed = true;
        self.cancel.cancel();
    }

    /// Resolves once the tunnel has been closed for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Number of open sub-streams.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Open a sub-stream of `kind` to `target` and wait for the worker to
    /// acknowledge it.
    pub async fn open_stream(
        self: &Arc<Self>,
        kind: StreamKind,
        target: &TargetAddr,
    ) -> Result<SubStream> {
        if self.is_closed() {
            return Err(Error::TunnelClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let open = Frame::stream_open(stream_id, kind, target)?;

        // Register before sending so the ack cannot race past us
        let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(64);
        self.streams.lock().insert(stream_id, reply_tx);

        let handle = Arc::new(StreamHandle {
            tunnel: Arc::clone(self),
            stream_id,
        });
        self.send_frame(open).await?;

        let ack = match timeout(self.timeouts.read, reply_rx.recv()).await {
            Ok(Some(frame)) if frame.frame_type == FrameType::StreamOpenAck => frame,
            Ok(Some(frame)) => {
                return Err(Error::tunnel(format!(
                    "unexpected {:?} while opening stream {}",
                    frame.frame_type, stream_id
                )))
            }
            Ok(None) => return Err(Error::TunnelClosed),
            Err(_) => return Err(Error::Timeout(self.timeouts.read.as_millis() as u64)),
        };

        if ack.payload.first() != Some(&STATUS_OK) {
            return Err(Error::dial(target, "worker could not reach destination"));
        }

        tracing::trace!("tunnel {} opened stream {} to {}", self.id, stream_id, target);
        Ok(SubStream {
            kind,
            rx: reply_rx,
            handle,
            finished: false,
        })
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TunnelClosed);
        }
        self.touch();
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| Error::TunnelClosed)
    }

    fn mark_failed(&self) {
        let was_open = {
            let mut activity = self.activity.lock();
            !std::mem::replace(&mut activity.closed, true)
        };
        if was_open {
            tracing::debug!("tunnel {} to worker lost", self.id);
        }
        self.cancel.cancel();
    }
}

impl Drop for EstablishedTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Send mux frames over the worker connection.
async fn tunnel_writer(
    mut writer: WriteHalf<BoxedIo>,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let data = frame.encode();
        let write = async {
            writer.write_all(&data).await?;
            writer.flush().await
        };
        match timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("tunnel write failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::debug!("tunnel write timed out");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
}

/// Read mux frames from the worker and dispatch them to sub-streams.
async fn tunnel_reader(mut reader: ReadHalf<BoxedIo>, tunnel: Weak<EstablishedTunnel>) {
    let (cancel, streams) = match tunnel.upgrade() {
        Some(t) => (t.cancel.clone(), Arc::clone(&t.streams)),
        None => return,
    };

    loop {
        let frame = tokio::select! {
            frame = Frame::read_from(&mut reader) => frame,
            _ = cancel.cancelled() => break,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("tunnel read failed: {}", e);
                break;
            }
        };

        if let Some(t) = tunnel.upgrade() {
            t.touch();
        }

        let sender = streams.lock().get(&frame.stream_id).cloned();
        if let Some(tx) = sender {
            let stream_id = frame.stream_id;
            let terminal = matches!(
                frame.frame_type,
                FrameType::StreamClose | FrameType::StreamReset
            );
            if tx.send(frame).await.is_err() || terminal {
                streams.lock().remove(&stream_id);
            }
        }
    }

    if let Some(t) = tunnel.upgrade() {
        t.mark_failed();
    }
    // Wake every sub-stream still waiting on this tunnel
    streams.lock().clear();
}

struct StreamHandle {
    tunnel: Arc<EstablishedTunnel>,
    stream_id: StreamId,
}

impl StreamHandle {
    async fn send(&self, kind: StreamKind, data: &[u8]) -> Result<()> {
        match kind {
            StreamKind::Udp => {
                if data.len() > MAX_FRAME_PAYLOAD {
                    return Err(Error::InvalidMessage(format!(
                        "datagram of {} bytes exceeds frame limit",
                        data.len()
                    )));
                }
                self.tunnel
                    .send_frame(Frame::stream_data(self.stream_id, data))
                    .await
            }
            StreamKind::Tcp => {
                for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
                    self.tunnel
                        .send_frame(Frame::stream_data(self.stream_id, chunk))
                        .await?;
                }
                Ok(())
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let removed = self.tunnel.streams.lock().remove(&self.stream_id).is_some();
        if removed && !self.tunnel.is_closed() {
            let _ = self
                .tunnel
                .frame_tx
                .try_send(Frame::stream_close(self.stream_id));
        }
    }
}

/// A logical connection carried inside a tunnel.
///
/// Dropping it (or both halves after [`SubStream::split`]) closes the
/// stream on the worker.
pub struct SubStream {
    kind: StreamKind,
    rx: mpsc::Receiver<Frame>,
    handle: Arc<StreamHandle>,
    finished: bool,
}

impl SubStream {
    /// Stream id within its tunnel.
    pub fn id(&self) -> StreamId {
        self.handle.stream_id
    }

    /// The tunnel carrying this stream.
    pub fn tunnel(&self) -> &Arc<EstablishedTunnel> {
        &self.handle.tunnel
    }

    /// Send bytes (TCP) or one datagram (UDP).
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.handle.send(self.kind, data).await
    }

    /// Receive the next chunk or datagram; `Ok(None)` once the worker closed
    /// the stream.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        recv_frame(&mut self.rx, &self.handle, &mut self.finished).await
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (SubStreamSender, SubStreamReceiver) {
        (
            SubStreamSender {
                kind: self.kind,
                handle: Arc::clone(&self.handle),
            },
            SubStreamReceiver {
                rx: self.rx,
                handle: self.handle,
                finished: self.finished,
            },
        )
    }
}

/// Sending half of a [`SubStream`].
pub struct SubStreamSender {
    kind: StreamKind,
    handle: Arc<StreamHandle>,
}

impl SubStreamSender {
    /// The tunnel carrying this stream.
    pub fn tunnel(&self) -> &Arc<EstablishedTunnel> {
        &self.handle.tunnel
    }

    /// Send bytes (TCP) or one datagram (UDP).
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.handle.send(self.kind, data).await
    }
}

/// Receiving half of a [`SubStream`].
pub struct SubStreamReceiver {
    rx: mpsc::Receiver<Frame>,
    handle: Arc<StreamHandle>,
    finished: bool,
}

impl SubStreamReceiver {
    /// Receive the next chunk or datagram; `Ok(None)` once the worker closed
    /// the stream.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        recv_frame(&mut self.rx, &self.handle, &mut self.finished).await
    }
}

async fn recv_frame(
    rx: &mut mpsc::Receiver<Frame>,
    handle: &StreamHandle,
    finished: &mut bool,
) -> Result<Option<Vec<u8>>> {
    if *finished {
        return Ok(None);
    }
    loop {
        match rx.recv().await {
            Some(frame) => match frame.frame_type {
                FrameType::StreamData => return Ok(Some(frame.payload)),
                FrameType::StreamClose => {
                    *finished = true;
                    return Ok(None);
                }
                FrameType::StreamReset => {
                    *finished = true;
                    return Err(Error::tunnel(format!(
                        "stream {} reset by worker",
                        handle.stream_id
                    )));
                }
                _ => {}
            },
            None => {
                *finished = true;
                return Err(Error::TunnelClosed);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::{BoxedIo, WorkerConnector};
    use crate::error::{Error, Result};

    /// Connector backed by in-memory pipes served by [`super::worker::serve`].
    #[derive(Default)]
    pub struct LocalWorker {
        pub dials: AtomicUsize,
        pub fail: bool,
    }

    impl LocalWorker {
        pub fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkerConnector for LocalWorker {
        async fn connect(&self, _key: &str) -> Result<BoxedIo> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            // Let concurrent callers pile up behind the dial
            tokio::task::yield_now().await;
            if self.fail {
                return Err(Error::tunnel("worker unreachable"));
            }
            let (near, far) = tokio::io::duplex(64 * 1024);
            tokio::spawn(super::worker::serve(far));
            Ok(Box::new(near))
        }
    }
}
