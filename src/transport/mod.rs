//! Egress routing.
//!
//! A [`Transport`] serves one request at a time per caller: either it dials
//! the destination directly and fragments the first outbound record, or it
//! carries the request through a worker tunnel from the registry.

pub mod copy;
pub mod request;
mod udp;

pub use copy::{CopyEnd, CopyStats};
pub use request::{
    ClientHandle, Command, ConnectRequest, DatagramChannel, PendingDatagram, PendingStream,
};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::dialer::Dialer;
use crate::error::{Error, ReplyCode, Result};
use crate::fragment::{FragmentConfig, FragmentingStream};
use crate::metrics::ServerMetrics;
use crate::pool::BufferPool;
use crate::resolve::Resolver;
use crate::tunnel::{
    ClientSession, EstablishedTunnel, StreamKind, SubStream, TargetAddr, TunnelKey,
    TunnelRegistry,
};

/// Idle policy for relayed traffic.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Close a TCP copy after this long without traffic either way
    pub tcp_idle_timeout: Duration,
    /// Close a UDP association after this long without a datagram
    pub udp_link_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_idle_timeout: Duration::from_secs(300),
            udp_link_idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Routes requests to their destinations.
pub struct Transport {
    dialer: Dialer,
    resolver: Arc<Resolver>,
    fragment: FragmentConfig,
    registry: Option<Arc<TunnelRegistry>>,
    session: ClientSession,
    pool: Arc<BufferPool>,
    metrics: Arc<ServerMetrics>,
    config: TransportConfig,
}

fn unspecified() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

async fn fail<T>(pending: Box<dyn PendingStream>, err: Error) -> Result<T> {
    if let Err(e) = pending.reply_failure(err.reply_code()).await {
        tracing::debug!("failure reply not delivered: {}", e);
    }
    Err(err)
}

impl Transport {
    /// Create a transport without relay support.
    pub fn new(
        dialer: Dialer,
        resolver: Arc<Resolver>,
        fragment: FragmentConfig,
        session: ClientSession,
        config: TransportConfig,
    ) -> Self {
        Self {
            dialer,
            resolver,
            fragment,
            registry: None,
            session,
            pool: Arc::new(BufferPool::default()),
            metrics: Arc::new(ServerMetrics::new()),
            config,
        }
    }

    /// Enable relay egress through `registry`.
    pub fn with_registry(mut self, registry: Arc<TunnelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use a specific buffer pool.
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Tunnel registry, when relay egress is enabled.
    pub fn registry(&self) -> Option<&Arc<TunnelRegistry>> {
        self.registry.as_ref()
    }

    /// Resolution chain used for direct egress.
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Metrics collector.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Serve a CONNECT-style request, directly or through a tunnel.
    pub async fn handle_tcp(
        &self,
        cancel: &CancellationToken,
        request: ConnectRequest,
        use_relay: bool,
    ) -> Result<()> {
        let ConnectRequest {
            destination,
            client_addr,
            client,
            ..
        } = request;

        let pending = match client {
            ClientHandle::Stream(pending) => pending,
            other => {
                let _ = other.reply_failure(ReplyCode::CommandNotSupported).await;
                return Err(Error::Unsupported("datagram request on a stream route".into()));
            }
        };

        let result = if use_relay {
            self.relay_tcp(cancel, destination, client_addr, pending).await
        } else {
            self.direct_tcp(cancel, destination, pending).await
        };

        if let Err(e) = &result {
            self.metrics.record_failure(e);
        }
        result
    }

    async fn dial_direct(
        &self,
        cancel: &CancellationToken,
        destination: &TargetAddr,
    ) -> Result<TcpStream> {
        let dial = async {
            match destination {
                TargetAddr::Ip(addr) => self.dialer.tcp_dial(*addr).await,
                TargetAddr::Domain(host, port) => {
                    let addrs = self.resolver.resolve(cancel, host).await?;
                    self.dialer.tcp_dial_any(&addrs, *port).await
                }
            }
        };
        tokio::select! {
            result = dial => result,
            _ = cancel.cancelled() => Err(Error::dial(destination, "cancelled")),
        }
    }

    async fn direct_tcp(
        &self,
        cancel: &CancellationToken,
        destination: TargetAddr,
        pending: Box<dyn PendingStream>,
    ) -> Result<()> {
        let upstream = match self.dial_direct(cancel, &destination).await {
            Ok(stream) => stream,
            Err(e) => return fail(pending, e).await,
        };
        let bound = upstream.local_addr().unwrap_or_else(|_| unspecified());
        let upstream = FragmentingStream::new(upstream, self.fragment)
            .with_record_split(self.dialer.config().tls_record_split);

        let client = pending.reply_success(bound).await?;
        self.metrics.increment_direct();
        tracing::debug!("direct connection to {}", destination);

        let stats = copy::copy_streams(
            client,
            upstream,
            &self.pool,
            self.config.tcp_idle_timeout,
            cancel,
        )
        .await;
        self.record(&destination, &stats);
        Ok(())
    }

    /// Get the tunnel for `key` and open a sub-stream on it.
    ///
    /// A tunnel failure drops that tunnel from the registry. An open the
    /// worker never acknowledged only fails this sub-stream.
    async fn open_relay(
        &self,
        key: &TunnelKey,
        kind: StreamKind,
        destination: &TargetAddr,
    ) -> Result<SubStream> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| Error::Unsupported("relay egress is disabled".into()))?;

        let tunnel = registry.get_or_create(key.as_str()).await?;
        match tunnel.open_stream(kind, destination).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                if e.is_tunnel_failure() {
                    registry.remove_if(key.as_str(), &tunnel);
                }
                Err(e)
            }
        }
    }

    /// Drop `tunnel` from the registry after it failed mid-copy.
    fn drop_failed_tunnel(&self, key: &TunnelKey, tunnel: &Arc<EstablishedTunnel>) {
        if let Some(registry) = &self.registry {
            registry.remove_if(key.as_str(), tunnel);
        }
    }

    async fn relay_tcp(
        &self,
        cancel: &CancellationToken,
        destination: TargetAddr,
        client_addr: SocketAddr,
        pending: Box<dyn PendingStream>,
    ) -> Result<()> {
        let key = self.session.tunnel_key(client_addr.ip(), &destination);
        let stream = match self.open_relay(&key, StreamKind::Tcp, &destination).await {
            Ok(stream) => stream,
            Err(e) => return fail(pending, e).await,
        };

        let client = pending.reply_success(unspecified()).await?;
        let tunnel = Arc::clone(stream.tunnel());
        self.metrics.increment_relayed();
        tracing::debug!(
            "relayed connection to {} over tunnel {}",
            destination,
            tunnel.id()
        );

        match copy::copy_substream(
            client,
            stream,
            &self.pool,
            self.config.tcp_idle_timeout,
            cancel,
        )
        .await
        {
            Ok(stats) => {
                self.record(&destination, &stats);
                Ok(())
            }
            Err(e) => {
                if e.is_tunnel_failure() {
                    self.drop_failed_tunnel(&key, &tunnel);
                }
                Err(e)
            }
        }
    }

    fn record(&self, destination: &TargetAddr, stats: &CopyStats) {
        self.metrics.add_bytes_up(stats.up);
        self.metrics.add_bytes_down(stats.down);
        tracing::debug!(
            "{} closed ({:?}): {} bytes up, {} bytes down",
            destination,
            stats.end,
            stats.up,
            stats.down
        );
    }
}
