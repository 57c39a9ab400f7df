//! Worker side of a tunnel.
//!
//! Reads mux frames from the gateway, opens TCP connections or connected UDP
//! sockets to the requested destinations and relays data back as frames.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use super::mux::{
    Frame, FrameType, StreamId, StreamKind, TargetAddr, STATUS_BAD_REQUEST, STATUS_OK,
    STATUS_UNREACHABLE,
};
use crate::error::{Error, Result};

/// Read size for TCP destinations.
const TCP_CHUNK: usize = 16 * 1024;
/// Largest UDP datagram accepted from a destination.
const UDP_CHUNK: usize = 64 * 1024;

/// Serve one gateway connection until it closes.
pub async fn serve<S>(stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);

    // Channel for frames going back to the gateway
    let (tx, rx) = mpsc::channel::<Frame>(256);

    let writer_handle = tokio::spawn(relay_writer(write_half, rx));
    let reader_result = relay_reader(read_half, tx).await;

    // Writer exits when all tx senders are dropped
    let _ = writer_handle.await;

    reader_result
}

async fn relay_writer<S>(mut writer: WriteHalf<S>, mut rx: mpsc::Receiver<Frame>) -> Result<()>
where
    S: AsyncWrite,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame.encode()).await?;
        writer.flush().await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn relay_reader<S>(mut reader: ReadHalf<S>, reply_tx: mpsc::Sender<Frame>) -> Result<()>
where
    S: AsyncRead,
{
    let mut streams: HashMap<StreamId, mpsc::Sender<Vec<u8>>> = HashMap::new();

    while let Some(frame) = Frame::read_from(&mut reader).await? {
        match frame.frame_type {
            FrameType::StreamOpen => {
                let stream_id = frame.stream_id;
                let (kind, target) = match frame.open_target() {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("stream {}: bad open: {}", stream_id, e);
                        let _ = reply_tx
                            .send(Frame::stream_open_ack(stream_id, STATUS_BAD_REQUEST))
                            .await;
                        continue;
                    }
                };

                let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(64);
                streams.insert(stream_id, data_tx);

                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let result = match kind {
                        StreamKind::Tcp => open_tcp(stream_id, &target, data_rx, reply_tx).await,
                        StreamKind::Udp => open_udp(stream_id, &target, data_rx, reply_tx).await,
                    };
                    if let Err(e) = result {
                        tracing::debug!("stream {} to {} ended: {}", stream_id, target, e);
                    }
                });
            }
            FrameType::StreamData => {
                if let Some(tx) = streams.get(&frame.stream_id) {
                    if tx.send(frame.payload).await.is_err() {
                        streams.remove(&frame.stream_id);
                    }
                }
            }
            FrameType::StreamClose | FrameType::StreamReset => {
                streams.remove(&frame.stream_id);
            }
            FrameType::StreamOpenAck => {}
        }
    }

    Ok(())
}

async fn connect_target(target: &TargetAddr) -> Result<TcpStream> {
    let stream = match target {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    };
    stream.map_err(|e| Error::dial(target, e))
}

async fn open_tcp(
    stream_id: StreamId,
    target: &TargetAddr,
    data_rx: mpsc::Receiver<Vec<u8>>,
    reply_tx: mpsc::Sender<Frame>,
) -> Result<()> {
    let target_stream = match connect_target(target).await {
        Ok(s) => s,
        Err(e) => {
            let _ = reply_tx
                .send(Frame::stream_open_ack(stream_id, STATUS_UNREACHABLE))
                .await;
            return Err(e);
        }
    };
    reply_tx
        .send(Frame::stream_open_ack(stream_id, STATUS_OK))
        .await
        .map_err(|_| Error::TunnelClosed)?;

    relay_tcp(stream_id, target_stream, data_rx, reply_tx).await
}

/// Relay data between a mux stream and a target TCP connection.
async fn relay_tcp(
    stream_id: StreamId,
    target: TcpStream,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    reply_tx: mpsc::Sender<Frame>,
) -> Result<()> {
    let (mut target_reader, mut target_writer) = target.into_split();

    // Target → gateway
    let reply_tx2 = reply_tx.clone();
    let mut read_task = tokio::spawn(async move {
        let mut buf = vec![0u8; TCP_CHUNK];
        loop {
            match target_reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if reply_tx2
                        .send(Frame::stream_data(stream_id, &buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Gateway → target
    let mut write_task = tokio::spawn(async move {
        while let Some(data) = data_rx.recv().await {
            if target_writer.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    // Either direction ending closes the stream
    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }
    let _ = reply_tx.send(Frame::stream_close(stream_id)).await;
    Ok(())
}

async fn bind_udp(target: &TargetAddr) -> Result<UdpSocket> {
    let addr: SocketAddr = match target {
        TargetAddr::Ip(addr) => *addr,
        TargetAddr::Domain(host, port) => lookup_host((host.as_str(), *port))
            .await
            .map_err(|e| Error::resolve(host.as_str(), e))?
            .next()
            .ok_or_else(|| Error::resolve(host.as_str(), "no addresses"))?,
    };
    let bind: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

async fn open_udp(
    stream_id: StreamId,
    target: &TargetAddr,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    reply_tx: mpsc::Sender<Frame>,
) -> Result<()> {
    let socket = match bind_udp(target).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            let _ = reply_tx
                .send(Frame::stream_open_ack(stream_id, STATUS_UNREACHABLE))
                .await;
            return Err(e);
        }
    };
    reply_tx
        .send(Frame::stream_open_ack(stream_id, STATUS_OK))
        .await
        .map_err(|_| Error::TunnelClosed)?;

    // Destination → gateway, one frame per datagram
    let recv_socket = Arc::clone(&socket);
    let reply_tx2 = reply_tx.clone();
    let read_task = tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_CHUNK];
        loop {
            match recv_socket.recv(&mut buf).await {
                Ok(n) => {
                    if reply_tx2
                        .send(Frame::stream_data(stream_id, &buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::trace!("stream {}: udp recv: {}", stream_id, e);
                }
            }
        }
    });

    while let Some(datagram) = data_rx.recv().await {
        if let Err(e) = socket.send(&datagram).await {
            tracing::trace!("stream {}: udp send: {}", stream_id, e);
        }
    }

    read_task.abort();
    let _ = reply_tx.send(Frame::stream_close(stream_id)).await;
    Ok(())
}
