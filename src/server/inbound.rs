//! SOCKS inbound adapter.
//!
//! Reads the client greeting and request off an accepted TCP connection and
//! turns it into a [`ConnectRequest`] whose reply is still pending. SOCKS5
//! messages are parsed with `socks5-impl`; SOCKS4 and 4a are small enough to
//! read by hand.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use socks5_impl::protocol::{
    handshake, Address, AuthMethod, Command as SocksCommand, Reply, Request, Response,
    StreamOperation, UdpHeader,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ReplyCode, Result};
use crate::pool::{BufferPool, PooledBuf};
use crate::transport::{
    ClientHandle, Command, ConnectRequest, DatagramChannel, PendingDatagram, PendingStream,
};
use crate::tunnel::{BoxedIo, TargetAddr};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

/// Longest greeting or request we wait for before giving up.
const MAX_HANDSHAKE: usize = 1024;
/// Null-terminated SOCKS4 fields longer than this are rejected.
const MAX_SOCKS4_FIELD: usize = 255;
/// Largest datagram accepted from the client.
const MAX_DATAGRAM: usize = 64 * 1024;
/// Idle receive buffers kept for future associations.
const DATAGRAM_POOL_IDLE: usize = 64;

/// Pool of receive buffers sized for the largest client datagram.
///
/// Each UDP association borrows one block for its lifetime.
pub fn datagram_pool() -> BufferPool {
    BufferPool::new(MAX_DATAGRAM, DATAGRAM_POOL_IDLE)
}

/// Read one request off `stream`.
///
/// On success the client is waiting for the reply carried in the returned
/// request's [`ClientHandle`]. Requests the gateway never serves (BIND,
/// unknown versions) are answered here and returned as errors.
pub async fn accept(
    stream: TcpStream,
    peer: SocketAddr,
    udp_bind_address: IpAddr,
    datagram_pool: &Arc<BufferPool>,
) -> Result<ConnectRequest> {
    let mut version = [0u8; 1];
    if stream.peek(&mut version).await? == 0 {
        return Err(Error::Network(io::ErrorKind::UnexpectedEof.into()));
    }

    match version[0] {
        SOCKS5_VERSION => accept_socks5(stream, peer, udp_bind_address, datagram_pool).await,
        SOCKS4_VERSION => accept_socks4(stream, peer).await,
        v => Err(Error::InvalidMessage(format!("unknown SOCKS version {}", v))),
    }
}

/// Buffered reader for SOCKS5 messages of unknown length.
struct HandshakeReader {
    stream: TcpStream,
    buf: BytesMut,
}

impl HandshakeReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(512),
        }
    }

    async fn read<T: StreamOperation>(&mut self) -> Result<T> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = &self.buf[..];
                match T::retrieve_from_stream(&mut cursor) {
                    Ok(message) => {
                        let used = self.buf.len() - cursor.len();
                        self.buf.advance(used);
                        return Ok(message);
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
                    Err(e) => return Err(Error::InvalidMessage(e.to_string())),
                }
            }
            if self.buf.len() >= MAX_HANDSHAKE {
                return Err(Error::InvalidMessage("SOCKS5 message too long".into()));
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::Network(io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    async fn write<T: StreamOperation>(&mut self, message: &T) -> Result<()> {
        write_message(&mut self.stream, message).await
    }

    fn into_parts(self) -> (TcpStream, BytesMut) {
        (self.stream, self.buf)
    }
}

async fn write_message<T: StreamOperation>(stream: &mut TcpStream, message: &T) -> Result<()> {
    let mut out = Vec::with_capacity(message.len());
    message.write_to_stream(&mut out)?;
    stream.write_all(&out).await?;
    Ok(())
}

async fn accept_socks5(
    stream: TcpStream,
    peer: SocketAddr,
    udp_bind_address: IpAddr,
    datagram_pool: &Arc<BufferPool>,
) -> Result<ConnectRequest> {
    let mut reader = HandshakeReader::new(stream);

    let greeting: handshake::Request = reader.read().await?;
    if !greeting.evaluate_method(AuthMethod::NoAuth) {
        reader
            .write(&handshake::Response::new(AuthMethod::NoAcceptableMethods))
            .await?;
        return Err(Error::Unsupported("client offers no usable auth method".into()));
    }
    reader
        .write(&handshake::Response::new(AuthMethod::NoAuth))
        .await?;

    let request: Request = reader.read().await?;
    let destination = target_of(request.address);
    let (mut stream, pending) = reader.into_parts();

    let (command, client) = match request.command {
        SocksCommand::Connect => (
            Command::Connect,
            ClientHandle::Stream(Box::new(Socks5Stream { stream, pending })),
        ),
        SocksCommand::UdpAssociate => (
            Command::Associate,
            ClientHandle::Datagram(Box::new(Socks5Associate {
                stream,
                peer,
                udp_bind_address,
                datagram_pool: Arc::clone(datagram_pool),
            })),
        ),
        SocksCommand::Bind => {
            write_message(
                &mut stream,
                &Response::new(Reply::CommandNotSupported, Address::unspecified()),
            )
            .await?;
            return Err(Error::Unsupported("BIND".into()));
        }
    };

    tracing::trace!("SOCKS5 {:?} to {} from {}", command, destination, peer);
    Ok(ConnectRequest {
        destination,
        command,
        client_addr: peer,
        client,
    })
}

async fn read_null_terminated(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut field = Vec::new();
    loop {
        let b = stream.read_u8().await?;
        if b == 0 {
            return Ok(field);
        }
        if field.len() >= MAX_SOCKS4_FIELD {
            return Err(Error::InvalidMessage("SOCKS4 field too long".into()));
        }
        field.push(b);
    }
}

async fn accept_socks4(mut stream: TcpStream, peer: SocketAddr) -> Result<ConnectRequest> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let command = header[1];
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);

    // User ID is read and ignored
    read_null_terminated(&mut stream).await?;

    // 0.0.0.x with x != 0 announces a 4a domain after the user ID
    let octets = ip.octets();
    let destination = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let domain = read_null_terminated(&mut stream).await?;
        let domain = String::from_utf8(domain)
            .map_err(|_| Error::InvalidMessage("SOCKS4a domain is not UTF-8".into()))?;
        TargetAddr::Domain(domain, port)
    } else {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    };

    if command != SOCKS4_CONNECT {
        write_socks4_reply(&mut stream, SOCKS4_REJECTED, None).await?;
        return Err(Error::Unsupported(format!("SOCKS4 command {}", command)));
    }

    tracing::trace!("SOCKS4 CONNECT to {} from {}", destination, peer);
    Ok(ConnectRequest {
        destination,
        command: Command::Socks4Connect,
        client_addr: peer,
        client: ClientHandle::Stream(Box::new(Socks4Stream { stream })),
    })
}

async fn write_socks4_reply(
    stream: &mut TcpStream,
    status: u8,
    bound: Option<SocketAddr>,
) -> Result<()> {
    let mut reply = [0u8; 8];
    reply[1] = status;
    if let Some(SocketAddr::V4(v4)) = bound {
        reply[2..4].copy_from_slice(&v4.port().to_be_bytes());
        reply[4..8].copy_from_slice(&v4.ip().octets());
    }
    stream.write_all(&reply).await?;
    Ok(())
}

fn target_of(address: Address) -> TargetAddr {
    match address {
        Address::SocketAddress(addr) => TargetAddr::Ip(addr),
        Address::DomainAddress(host, port) => TargetAddr::Domain(host, port),
    }
}

fn address_of(target: &TargetAddr) -> Address {
    match target {
        TargetAddr::Ip(addr) => Address::SocketAddress(*addr),
        TargetAddr::Domain(host, port) => Address::DomainAddress(host.clone(), *port),
    }
}

fn socks5_reply(code: ReplyCode) -> Reply {
    match code {
        ReplyCode::Succeeded => Reply::Succeeded,
        ReplyCode::GeneralFailure => Reply::GeneralFailure,
        ReplyCode::NetworkUnreachable => Reply::NetworkUnreachable,
        ReplyCode::HostUnreachable => Reply::HostUnreachable,
        ReplyCode::ConnectionRefused => Reply::ConnectionRefused,
        ReplyCode::TtlExpired => Reply::TtlExpired,
        ReplyCode::CommandNotSupported => Reply::CommandNotSupported,
    }
}

/// Pending SOCKS5 CONNECT.
struct Socks5Stream {
    stream: TcpStream,
    pending: BytesMut,
}

#[async_trait]
impl PendingStream for Socks5Stream {
    async fn reply_success(mut self: Box<Self>, bound: SocketAddr) -> Result<BoxedIo> {
        write_message(&mut self.stream, &Response::new(Reply::Succeeded, bound.into())).await?;
        let Socks5Stream { stream, pending } = *self;
        Ok(Box::new(Prefixed::new(stream, pending)))
    }

    async fn reply_failure(mut self: Box<Self>, code: ReplyCode) -> Result<()> {
        write_message(
            &mut self.stream,
            &Response::new(socks5_reply(code), Address::unspecified()),
        )
        .await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Pending SOCKS4 CONNECT.
struct Socks4Stream {
    stream: TcpStream,
}

#[async_trait]
impl PendingStream for Socks4Stream {
    async fn reply_success(mut self: Box<Self>, bound: SocketAddr) -> Result<BoxedIo> {
        write_socks4_reply(&mut self.stream, SOCKS4_GRANTED, Some(bound)).await?;
        Ok(Box::new(self.stream))
    }

    async fn reply_failure(mut self: Box<Self>, _code: ReplyCode) -> Result<()> {
        write_socks4_reply(&mut self.stream, SOCKS4_REJECTED, None).await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Pending SOCKS5 UDP ASSOCIATE.
struct Socks5Associate {
    stream: TcpStream,
    peer: SocketAddr,
    udp_bind_address: IpAddr,
    datagram_pool: Arc<BufferPool>,
}

#[async_trait]
impl PendingDatagram for Socks5Associate {
    async fn reply_success(self: Box<Self>) -> Result<Box<dyn DatagramChannel>> {
        let Socks5Associate {
            mut stream,
            peer,
            udp_bind_address,
            datagram_pool,
        } = *self;

        let socket = match UdpSocket::bind((udp_bind_address, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                let failure = Response::new(Reply::GeneralFailure, Address::unspecified());
                let _ = write_message(&mut stream, &failure).await;
                return Err(e.into());
            }
        };
        let mut bound = socket.local_addr()?;
        if bound.ip().is_unspecified() {
            if let Ok(local) = stream.local_addr() {
                bound.set_ip(local.ip());
            }
        }
        write_message(&mut stream, &Response::new(Reply::Succeeded, bound.into())).await?;
        tracing::debug!("UDP relay for {} on {}", peer, bound);

        let closed = CancellationToken::new();
        let watcher = tokio::spawn(watch_control(stream, closed.clone()));

        Ok(Box::new(UdpAssociation {
            socket,
            client_ip: peer.ip(),
            client: Mutex::new(None),
            recv_buf: AsyncMutex::new(datagram_pool.get()),
            closed,
            watcher,
        }))
    }

    async fn reply_failure(mut self: Box<Self>, code: ReplyCode) -> Result<()> {
        write_message(
            &mut self.stream,
            &Response::new(socks5_reply(code), Address::unspecified()),
        )
        .await?;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

/// Holds the control connection; the association ends with it.
async fn watch_control(mut stream: TcpStream, closed: CancellationToken) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    closed.cancel();
}

/// Established SOCKS5 UDP relay socket.
struct UdpAssociation {
    socket: UdpSocket,
    client_ip: IpAddr,
    client: Mutex<Option<SocketAddr>>,
    recv_buf: AsyncMutex<PooledBuf>,
    closed: CancellationToken,
    watcher: JoinHandle<()>,
}

#[async_trait]
impl DatagramChannel for UdpAssociation {
    async fn recv(&self) -> Result<Option<(TargetAddr, Vec<u8>)>> {
        let mut buf = self.recv_buf.lock().await;
        loop {
            let (n, from) = tokio::select! {
                r = self.socket.recv_from(&mut buf[..]) => r?,
                _ = self.closed.cancelled() => return Ok(None),
            };
            if from.ip() != self.client_ip {
                tracing::debug!("dropping datagram from stranger {}", from);
                continue;
            }

            let header = match UdpHeader::retrieve_from_stream(&mut &buf[..n]) {
                Ok(header) => header,
                Err(e) => {
                    tracing::debug!("bad SOCKS5 UDP header from {}: {}", from, e);
                    continue;
                }
            };
            if header.frag != 0 {
                // Reassembly is not supported
                continue;
            }

            *self.client.lock() = Some(from);
            let payload = buf[header.len()..n].to_vec();
            return Ok(Some((target_of(header.address), payload)));
        }
    }

    async fn send(&self, source: &TargetAddr, data: &[u8]) -> Result<()> {
        let client = match *self.client.lock() {
            Some(client) => client,
            None => return Ok(()),
        };

        let header = UdpHeader::new(0, address_of(source));
        let mut out = Vec::with_capacity(header.len() + data.len());
        header.write_to_stream(&mut out)?;
        out.extend_from_slice(data);
        self.socket.send_to(&out, client).await?;
        Ok(())
    }
}

impl Drop for UdpAssociation {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Stream that first yields bytes read ahead during the handshake.
struct Prefixed<S> {
    inner: S,
    prefix: BytesMut,
}

impl<S> Prefixed<S> {
    fn new(inner: S, prefix: BytesMut) -> Self {
        Self { inner, prefix }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::net::TcpListener;

    use super::*;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Connect a raw client and run `accept` on the server side.
    async fn connect() -> (TcpStream, JoinHandle<Result<ConnectRequest>>) {
        connect_with_pool(Arc::new(datagram_pool())).await
    }

    async fn connect_with_pool(
        pool: Arc<BufferPool>,
    ) -> (TcpStream, JoinHandle<Result<ConnectRequest>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            accept(stream, peer, LOOPBACK, &pool).await
        });
        let client = TcpStream::connect(addr).await.unwrap();
        (client, server)
    }

    fn stream_handle(request: ConnectRequest) -> Box<dyn PendingStream> {
        match request.client {
            ClientHandle::Stream(pending) => pending,
            other => panic!("expected a stream handle, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_socks5_connect_domain() {
        let (mut client, server) = connect().await;

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 12];
        request.extend_from_slice(b"example.test");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let request = server.await.unwrap().unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(
            request.destination,
            TargetAddr::Domain("example.test".into(), 443)
        );

        let mut io = stream_handle(request)
            .reply_success("127.0.0.1:5555".parse().unwrap())
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x15, 0xB3]);

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_socks5_early_data_is_kept() {
        let (mut client, server) = connect().await;

        let mut burst = vec![0x05, 0x01, 0x00];
        burst.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50]);
        burst.extend_from_slice(b"early");
        client.write_all(&burst).await.unwrap();

        let request = server.await.unwrap().unwrap();
        assert_eq!(
            request.destination,
            TargetAddr::Ip("10.0.0.1:80".parse().unwrap())
        );

        let mut io = stream_handle(request)
            .reply_success("0.0.0.0:0".parse().unwrap())
            .await
            .unwrap();
        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();

        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn test_socks5_failure_reply_code() {
        let (mut client, server) = connect().await;

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 0, 2, 1, 0x01, 0xBB])
            .await
            .unwrap();

        let request = server.await.unwrap().unwrap();
        stream_handle(request)
            .reply_failure(ReplyCode::HostUnreachable)
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x04);
    }

    #[tokio::test]
    async fn test_socks5_bind_is_rejected() {
        let (mut client, server) = connect().await;

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);
    }

    #[tokio::test]
    async fn test_socks4a_domain_and_rejection() {
        let (mut client, server) = connect().await;

        let mut request = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
        request.extend_from_slice(b"user\0host.test\0");
        client.write_all(&request).await.unwrap();

        let request = server.await.unwrap().unwrap();
        assert_eq!(request.command, Command::Socks4Connect);
        assert_eq!(request.destination, TargetAddr::Domain("host.test".into(), 80));

        stream_handle(request)
            .reply_failure(ReplyCode::HostUnreachable)
            .await
            .unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x00, SOCKS4_REJECTED]);
    }

    #[tokio::test]
    async fn test_socks4_granted_reply() {
        let (mut client, server) = connect().await;

        client
            .write_all(&[0x04, 0x01, 0x01, 0xBB, 10, 0, 0, 2, 0])
            .await
            .unwrap();
        let request = server.await.unwrap().unwrap();
        assert_eq!(
            request.destination,
            TargetAddr::Ip("10.0.0.2:443".parse().unwrap())
        );

        let _io = stream_handle(request)
            .reply_success("127.0.0.1:80".parse().unwrap())
            .await
            .unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, SOCKS4_GRANTED, 0x00, 0x50, 127, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_udp_associate_channel() {
        let (mut client, server) = connect().await;

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let request = server.await.unwrap().unwrap();
        assert_eq!(request.command, Command::Associate);
        let channel = match request.client {
            ClientHandle::Datagram(pending) => pending.reply_success().await.unwrap(),
            other => panic!("expected a datagram handle, got {:?}", other),
        };

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..4], [0x05, 0x00, 0x00, 0x01]);
        let relay = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7])),
            u16::from_be_bytes([reply[8], reply[9]]),
        );

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(&[0, 0, 0, 0x01, 10, 0, 0, 9, 0, 53, b'q'], relay)
            .await
            .unwrap();
        let (destination, payload) = channel.recv().await.unwrap().unwrap();
        assert_eq!(destination, TargetAddr::Ip("10.0.0.9:53".parse().unwrap()));
        assert_eq!(payload, b"q");

        channel.send(&destination, b"answer").await.unwrap();
        let mut buf = [0u8; 64];
        let n = udp.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..10], &[0, 0, 0, 0x01, 10, 0, 0, 9, 0, 53]);
        assert_eq!(&buf[10..n], b"answer");

        drop(client);
        assert!(channel.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_udp_association_reuses_receive_buffer() {
        let pool = Arc::new(datagram_pool());
        let (mut client, server) = connect_with_pool(Arc::clone(&pool)).await;

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let channel = match server.await.unwrap().unwrap().client {
            ClientHandle::Datagram(pending) => pending.reply_success().await.unwrap(),
            other => panic!("expected a datagram handle, got {:?}", other),
        };
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        let relay = SocketAddr::new(LOOPBACK, u16::from_be_bytes([reply[8], reply[9]]));
        assert_eq!(pool.idle(), 0);

        // A long datagram followed by a short one must not leak stale bytes
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut long = vec![0, 0, 0, 0x01, 10, 0, 0, 9, 0, 53];
        long.extend_from_slice(&[b'x'; 1500]);
        udp.send_to(&long, relay).await.unwrap();
        let (_, payload) = channel.recv().await.unwrap().unwrap();
        assert_eq!(payload.len(), 1500);

        udp.send_to(&[0, 0, 0, 0x01, 10, 0, 0, 9, 0, 53, b'y'], relay)
            .await
            .unwrap();
        let (_, payload) = channel.recv().await.unwrap().unwrap();
        assert_eq!(payload, b"y");
        assert_eq!(pool.idle(), 0);

        drop(channel);
        assert_eq!(pool.idle(), 1);
    }
}
