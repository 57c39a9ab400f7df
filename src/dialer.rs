//! Outbound connection establishment.
//!
//! TCP connects with a bounded timeout, optional socket tuning, and client
//! TLS over a [`FragmentingStream`] so that DoH and worker handshakes can be
//! chunked the same way direct traffic is.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::fragment::{FragmentConfig, FragmentingStream};

/// Keepalive idle time applied when low-level socket tuning is on.
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
/// Keepalive interval applied when low-level socket tuning is on.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Dialer settings.
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Upper bound on a single TCP connect
    pub connect_timeout: Duration,
    /// Set TCP_NODELAY and keepalive on outbound sockets
    pub low_level_sockets: bool,
    /// Re-frame outgoing Client Hellos into records of this many bytes
    pub tls_record_split: Option<usize>,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            low_level_sockets: false,
            tls_record_split: None,
        }
    }
}

/// Opens outbound TCP and TLS connections.
#[derive(Clone)]
pub struct Dialer {
    config: DialerConfig,
    tls: Arc<ClientConfig>,
}

impl Dialer {
    /// Create a dialer trusting the bundled web PKI roots.
    pub fn new(config: DialerConfig) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self::with_tls_config(config, Arc::new(tls)))
    }

    /// Create a dialer with a caller-supplied TLS configuration.
    pub fn with_tls_config(config: DialerConfig, tls: Arc<ClientConfig>) -> Self {
        Self { config, tls }
    }

    /// Dialer settings.
    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Connect to a single address within the connect timeout.
    pub async fn tcp_dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::dial(addr, e)),
            Err(_) => {
                return Err(Error::dial(
                    addr,
                    format!("timed out after {}ms", self.config.connect_timeout.as_millis()),
                ))
            }
        };

        if self.config.low_level_sockets {
            self.tune(&stream);
        }

        Ok(stream)
    }

    /// Try each address in order, returning the first connection that
    /// succeeds or the last error.
    pub async fn tcp_dial_any(&self, addrs: &[IpAddr], port: u16) -> Result<TcpStream> {
        let mut last_err = None;

        for ip in addrs {
            match self.tcp_dial(SocketAddr::new(*ip, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("{}", e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::dial(format!("port {}", port), "no addresses")))
    }

    /// Run a client TLS handshake over `stream`.
    ///
    /// With `fragment` set the Client Hello is chunked on the way out; the
    /// dialer's record split setting applies either way.
    pub async fn tls_handshake<S>(
        &self,
        stream: S,
        server_name: &str,
        fragment: Option<FragmentConfig>,
    ) -> Result<TlsStream<FragmentingStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::tls(format!("invalid server name {}: {}", server_name, e)))?;

        let wrapped = match fragment {
            Some(config) => FragmentingStream::new(stream, config),
            None => FragmentingStream::passthrough(stream),
        }
        .with_record_split(self.config.tls_record_split);

        let connector = TlsConnector::from(Arc::clone(&self.tls));
        let handshake = connector.connect(name, wrapped);
        match timeout(self.config.connect_timeout, handshake).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(Error::tls(format!("handshake with {} failed: {}", server_name, e))),
            Err(_) => Err(Error::Timeout(self.config.connect_timeout.as_millis() as u64)),
        }
    }

    fn tune(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }
        let sock = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            tracing::debug!("set_tcp_keepalive failed: {}", e);
        }
    }
}
