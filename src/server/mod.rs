//! Gateway server.
//!
//! Accepts SOCKS clients, parses each request and hands it to the request
//! handler chosen at startup:
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌────────────────────────────┐
//! │ SOCKS        │──▶│ RequestHandler│──▶│ Transport                  │
//! │ listener     │   │ (fragment or  │   │  direct: Dialer + chunking │
//! │ (inbound.rs) │   │  tunnel)      │   │  relay:  TunnelRegistry    │
//! └──────────────┘   └───────────────┘   └────────────────────────────┘
//! ```

pub mod config;
pub mod handler;
pub mod inbound;

pub use config::{ServerConfig, ServerConfigFile};
pub use handler::{FragmentHandler, RequestHandler, TunnelHandler};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::metrics::ServerMetrics;
use crate::pool::BufferPool;
use crate::resolve::Resolver;
use crate::transport::Transport;
use crate::tunnel::{ClientSession, TunnelRegistry, WebSocketConnector};

/// Clients that do not finish the SOCKS handshake in time are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Main gateway instance.
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn RequestHandler>,
    transport: Arc<Transport>,
    metrics: Arc<ServerMetrics>,
    datagram_pool: Arc<BufferPool>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    janitors: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Build the gateway from its configuration.
    ///
    /// Session identifiers are generated here, once per process.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let session = ClientSession::generate();
        let dialer = Dialer::new(config.dialer.clone())?;
        let resolver = Arc::new(Resolver::from_remote_addr(
            &config.remote_dns_addr,
            Arc::new(config.hosts.clone()),
            config.dns_cache_ttl,
            dialer.clone(),
            config.dns_fragment(),
        )?);

        let mut transport = Transport::new(
            dialer.clone(),
            Arc::clone(&resolver),
            config.fragment,
            session.clone(),
            config.transport,
        );

        if config.relay_enabled() {
            let connector = WebSocketConnector::new(
                &config.worker_address,
                config.worker_ip_port_address,
                dialer,
                resolver,
                config.worker_fragment(),
                session.clone(),
            )?;
            let registry = TunnelRegistry::new(Arc::new(connector), config.registry);
            transport = transport.with_registry(registry);
            tracing::info!("Relaying through worker {}", config.worker_address);
        }

        tracing::debug!(
            "Session {} / client {}",
            session.user_session(),
            session.short_client_id()
        );
        Ok(Self::with_transport(config, transport))
    }

    /// Build the gateway around an existing transport.
    pub fn with_transport(config: ServerConfig, transport: Transport) -> Self {
        let metrics = Arc::clone(transport.metrics());
        let transport = Arc::new(transport);

        let handler: Arc<dyn RequestHandler> = if config.relay_enabled() {
            if transport.registry().is_none() {
                tracing::warn!("Relay enabled without a tunnel registry");
            }
            Arc::new(TunnelHandler::new(Arc::clone(&transport)))
        } else {
            Arc::new(FragmentHandler::new(Arc::clone(&transport)))
        };

        Self {
            config: Arc::new(config),
            handler,
            transport,
            metrics,
            datagram_pool: Arc::new(inbound::datagram_pool()),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            janitors: Mutex::new(Vec::new()),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve clients from `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!("bepass listening on {}", local);

        if !self.is_shut_down() {
            let mut janitors = self.janitors.lock();
            janitors.push(
                self.transport
                    .resolver()
                    .spawn_cache_purger(self.shutdown.clone()),
            );
            if let Some(registry) = self.transport.registry() {
                janitors.push(registry.spawn_janitor());
            }
        }

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let handler = Arc::clone(&self.handler);
                    let metrics = Arc::clone(&self.metrics);
                    let udp_bind = self.config.udp_bind_address;
                    let datagram_pool = Arc::clone(&self.datagram_pool);
                    let cancel = self.shutdown.child_token();

                    tokio::spawn(async move {
                        metrics.increment_connections();

                        if let Err(e) = Self::handle_connection(
                            handler,
                            stream,
                            peer_addr,
                            udp_bind,
                            &datagram_pool,
                            cancel,
                        )
                        .await
                        {
                            tracing::debug!("Connection error from {}: {}", peer_addr, e);
                        }

                        metrics.decrement_connections();
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                }
            }
        }

        tracing::info!("Listener on {} closed", local);
        Ok(())
    }

    async fn handle_connection(
        handler: Arc<dyn RequestHandler>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        udp_bind: IpAddr,
        datagram_pool: &Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true)?;

        let request = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            inbound::accept(stream, peer_addr, udp_bind, datagram_pool),
        )
        .await
        .map_err(|_| Error::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))??;

        handler.dispatch(&cancel, request).await
    }

    /// Stop accepting, cancel in-flight requests and close every tunnel.
    ///
    /// Safe to call more than once; only the first call does anything.
    /// In-flight requests are cancelled, not drained.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        for janitor in self.janitors.lock().drain(..) {
            janitor.abort();
        }

        let (created, evicted) = match self.transport.registry() {
            Some(registry) => {
                registry.shutdown();
                (registry.created_count(), registry.evicted_count())
            }
            None => (0, 0),
        };
        tracing::info!("{}", self.metrics.format_report(created, evicted));
    }

    /// Whether [`Server::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Get gateway metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Tunnel registry, when relaying.
    pub fn registry(&self) -> Option<&Arc<TunnelRegistry>> {
        self.transport.registry()
    }
}
