//! Worker connections over WebSocket.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::key::ClientSession;
use super::BoxedIo;
use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::fragment::FragmentConfig;
use crate::resolve::Resolver;

/// Opens the byte stream a tunnel runs over.
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    /// Connect to the worker on behalf of the tunnel identified by `key`.
    async fn connect(&self, key: &str) -> Result<BoxedIo>;
}

/// Connects to a worker at a `ws://` or `wss://` URL.
pub struct WebSocketConnector {
    url: Uri,
    host: String,
    port: u16,
    secure: bool,
    ip_port: Option<SocketAddr>,
    dialer: Dialer,
    resolver: Arc<Resolver>,
    fragment: Option<FragmentConfig>,
    session: ClientSession,
}

impl WebSocketConnector {
    /// Create a connector for `worker_address`.
    ///
    /// When `ip_port` is set the TCP connection goes there and the URL host is
    /// only used for SNI and the `Host` header.
    pub fn new(
        worker_address: &str,
        ip_port: Option<SocketAddr>,
        dialer: Dialer,
        resolver: Arc<Resolver>,
        fragment: Option<FragmentConfig>,
        session: ClientSession,
    ) -> Result<Self> {
        let url: Uri = worker_address
            .parse()
            .map_err(|e| Error::config(format!("invalid worker address {}: {}", worker_address, e)))?;
        let secure = match url.scheme_str() {
            Some("wss") | Some("https") => true,
            Some("ws") | Some("http") => false,
            _ => {
                return Err(Error::config(format!(
                    "worker address must be ws:// or wss://: {}",
                    worker_address
                )))
            }
        };
        let host = url
            .host()
            .ok_or_else(|| Error::config(format!("worker address has no host: {}", worker_address)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self {
            url,
            host,
            port,
            secure,
            ip_port,
            dialer,
            resolver,
            fragment,
            session,
        })
    }

    /// Handshake URL, carrying the user session.
    pub fn request_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let authority = self
            .url
            .authority()
            .map(|a| a.as_str())
            .unwrap_or(self.host.as_str());
        let path = self.url.path();
        let sep = match self.url.query() {
            Some(q) if !q.is_empty() => format!("?{}&", q),
            _ => "?".to_string(),
        };
        format!(
            "{}://{}{}{}session={}",
            scheme,
            authority,
            path,
            sep,
            self.session.user_session()
        )
    }

    async fn dial(&self) -> Result<tokio::net::TcpStream> {
        if let Some(addr) = self.ip_port {
            return self.dialer.tcp_dial(addr).await;
        }
        let addrs = self
            .resolver
            .resolve(&CancellationToken::new(), &self.host)
            .await?;
        self.dialer.tcp_dial_any(&addrs, self.port).await
    }
}

#[async_trait]
impl WorkerConnector for WebSocketConnector {
    async fn connect(&self, key: &str) -> Result<BoxedIo> {
        let tcp = self.dial().await?;
        let request = self
            .request_url()
            .into_client_request()
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let io: BoxedIo = if self.secure {
            let tls = self
                .dialer
                .tls_handshake(tcp, &self.host, self.fragment)
                .await?;
            let (ws, response) = tokio_tungstenite::client_async(request, tls)
                .await
                .map_err(|e| Error::WebSocket(format!("handshake failed: {}", e)))?;
            tracing::debug!("worker handshake for {}: {}", key, response.status());
            Box::new(WsStream::new(ws))
        } else {
            let (ws, response) = tokio_tungstenite::client_async(request, tcp)
                .await
                .map_err(|e| Error::WebSocket(format!("handshake failed: {}", e)))?;
            tracing::debug!("worker handshake for {}: {}", key, response.status());
            Box::new(WsStream::new(ws))
        };

        Ok(io)
    }
}

/// `AsyncRead + AsyncWrite` over binary WebSocket messages.
///
/// Each write becomes one binary message; reads concatenate message payloads.
/// A close frame or end of stream reads as EOF.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buffer: Vec<u8>,
    read_offset: usize,
}

impl<S> WsStream<S> {
    /// Wrap an established WebSocket.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buffer: Vec::new(),
            read_offset: 0,
        }
    }

    fn fill(&mut self, data: Vec<u8>, buf: &mut ReadBuf<'_>) {
        let to_copy = data.len().min(buf.remaining());
        buf.put_slice(&data[..to_copy]);
        if to_copy < data.len() {
            self.read_buffer = data;
            self.read_offset = to_copy;
        }
    }
}

fn ws_io_error(e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("websocket: {}", e))
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_offset < self.read_buffer.len() {
            let start = self.read_offset;
            let to_copy = (self.read_buffer.len() - start).min(buf.remaining());
            buf.put_slice(&self.read_buffer[start..start + to_copy]);
            self.read_offset += to_copy;
            if self.read_offset >= self.read_buffer.len() {
                self.read_buffer.clear();
                self.read_offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.fill(data, buf);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    tracing::trace!("worker sent a text frame, treating as binary");
                    self.fill(text.into_bytes(), buf);
                    return Poll::Ready(Ok(()));
                }
                // Pings are answered by tungstenite on the next flush
                Poll::Ready(Some(Ok(Message::Ping(_)))) | Poll::Ready(Some(Ok(Message::Pong(_)))) => {
                    continue
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()))
                }
                Poll::Ready(Some(Ok(Message::Frame(_)))) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "unexpected raw websocket frame",
                    )))
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_io_error(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => match self.inner.start_send_unpin(Message::Binary(buf.to_vec())) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(ws_io_error(e))),
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(ws_io_error(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(ws_io_error)
    }
}
