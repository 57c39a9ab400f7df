//! Request handlers, chosen once at startup.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ReplyCode, Result};
use crate::transport::{Command, ConnectRequest, Transport};

/// What the dispatcher can do with a parsed request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// SOCKS5 CONNECT.
    async fn handle_connect(&self, cancel: &CancellationToken, request: ConnectRequest)
        -> Result<()>;

    /// SOCKS4/4a CONNECT.
    async fn handle_socks4_connect(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()>;

    /// SOCKS5 UDP ASSOCIATE.
    async fn handle_associate(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()>;

    /// Route `request` by its command.
    async fn dispatch(&self, cancel: &CancellationToken, request: ConnectRequest) -> Result<()> {
        match request.command {
            Command::Connect => self.handle_connect(cancel, request).await,
            Command::Socks4Connect => self.handle_socks4_connect(cancel, request).await,
            Command::Associate => self.handle_associate(cancel, request).await,
        }
    }
}

/// Direct egress with Client Hello chunking. No UDP.
pub struct FragmentHandler {
    transport: Arc<Transport>,
}

impl FragmentHandler {
    /// Create a handler over `transport`.
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl RequestHandler for FragmentHandler {
    async fn handle_connect(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()> {
        self.transport.handle_tcp(cancel, request, false).await
    }

    async fn handle_socks4_connect(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()> {
        self.transport.handle_tcp(cancel, request, false).await
    }

    async fn handle_associate(
        &self,
        _cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()> {
        let _ = request
            .client
            .reply_failure(ReplyCode::CommandNotSupported)
            .await;
        Err(Error::Unsupported("UDP ASSOCIATE needs the worker".into()))
    }
}

/// Relay egress through worker tunnels, TCP and UDP.
pub struct TunnelHandler {
    transport: Arc<Transport>,
}

impl TunnelHandler {
    /// Create a handler over `transport`, which must carry a registry.
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl RequestHandler for TunnelHandler {
    async fn handle_connect(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()> {
        self.transport.handle_tcp(cancel, request, true).await
    }

    async fn handle_socks4_connect(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()> {
        self.transport.handle_tcp(cancel, request, true).await
    }

    async fn handle_associate(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
    ) -> Result<()> {
        self.transport.handle_udp(cancel, request).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::dialer::{Dialer, DialerConfig};
    use crate::fragment::FragmentConfig;
    use crate::resolve::{LocalResolver, Resolver};
    use crate::transport::request::testing::{associate_request, stream_request, Reply};
    use crate::transport::TransportConfig;
    use crate::tunnel::testing::LocalWorker;
    use crate::tunnel::{ClientSession, RegistryConfig, TargetAddr, TunnelRegistry};

    fn transport() -> Transport {
        let resolver = Resolver::new(
            LocalResolver::default(),
            Duration::from_secs(30),
            Arc::new(LocalResolver::default()),
        );
        Transport::new(
            Dialer::new(DialerConfig::default()).unwrap(),
            Arc::new(resolver),
            FragmentConfig::disabled(),
            ClientSession::from_parts("00000002", "hndlrs"),
            TransportConfig::default(),
        )
    }

    async fn echo_server() -> TargetAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        TargetAddr::Ip(addr)
    }

    #[tokio::test]
    async fn test_fragment_handler_rejects_associate() {
        let handler = FragmentHandler::new(Arc::new(transport()));
        let (request, _to_router, _from_router) = associate_request();

        let err = handler
            .dispatch(&CancellationToken::new(), request)
            .await
            .unwrap_err();
        assert_eq!(err.reply_code(), ReplyCode::CommandNotSupported);
    }

    #[tokio::test]
    async fn test_fragment_handler_connects_directly() {
        let handler = FragmentHandler::new(Arc::new(transport()));
        let echo = echo_server().await;
        let (mut request, mut client, reply) = stream_request(echo);
        request.command = Command::Socks4Connect;

        let serve = tokio::spawn(async move {
            handler.dispatch(&CancellationToken::new(), request).await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(*reply.lock(), Some(Reply::Success));

        drop(client);
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_handler_relays_connect() {
        let worker = Arc::new(LocalWorker::default());
        let registry = TunnelRegistry::new(worker.clone(), RegistryConfig::default());
        let transport = transport().with_registry(Arc::clone(&registry));
        let handler = TunnelHandler::new(Arc::new(transport));
        let echo = echo_server().await;
        let (request, mut client, _reply) = stream_request(echo);

        let serve = tokio::spawn(async move {
            handler.dispatch(&CancellationToken::new(), request).await
        });

        client.write_all(b"relayed").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"relayed");
        assert_eq!(worker.dials(), 1);
        assert_eq!(registry.len(), 1);

        drop(client);
        serve.await.unwrap().unwrap();
    }
}
