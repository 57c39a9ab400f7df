//! Conventional DNS upstream: UDP with TCP fallback on truncation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use super::message::{build_query, parse_answer, Answer, LOOKUP_TYPES};
use super::Resolve;
use crate::error::{Error, Result};

const MAX_UDP_RESPONSE: usize = 4096;
const ATTEMPTS: usize = 2;

/// Plain DNS resolver talking to a single upstream server.
pub struct UdpDnsClient {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpDnsClient {
    /// Create a client for `server`.
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: Duration::from_secs(3),
        }
    }

    /// Parse `host[:port]` (port 53 by default).
    pub fn from_address(addr: &str) -> Result<Self> {
        if let Ok(sa) = addr.parse::<SocketAddr>() {
            return Ok(Self::new(sa));
        }
        if let Ok(ip) = addr.parse::<IpAddr>() {
            return Ok(Self::new(SocketAddr::new(ip, 53)));
        }
        Err(Error::config(format!(
            "DNS server must be an IP address with optional port: {}",
            addr
        )))
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query_udp(&self, id: u16, host: &str, query: &[u8]) -> Result<Answer> {
        let bind: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;

        let mut last_err = None;
        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        for _ in 0..ATTEMPTS {
            socket.send(query).await?;
            match timeout(self.timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => match parse_answer(host, id, &buf[..n]) {
                    // Stray datagram from an earlier attempt
                    Err(Error::Dns(e)) if e.contains("does not match") => {
                        last_err = Some(Error::Dns(e));
                    }
                    other => return other,
                },
                Ok(Err(e)) => last_err = Some(Error::Network(e)),
                Err(_) => last_err = Some(Error::Timeout(self.timeout.as_millis() as u64)),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::resolve(host, "no response")))
    }

    async fn query_tcp(&self, id: u16, host: &str, query: &[u8]) -> Result<Answer> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.server).await?;
            let mut framed = Vec::with_capacity(query.len() + 2);
            framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
            framed.extend_from_slice(query);
            stream.write_all(&framed).await?;

            let len = stream.read_u16().await? as usize;
            let mut response = vec![0u8; len];
            stream.read_exact(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };

        let response = timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(self.timeout.as_millis() as u64))??;
        parse_answer(host, id, &response)
    }
}

#[async_trait]
impl Resolve for UdpDnsClient {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let mut addrs = Vec::new();
        let mut last_err = None;

        for rtype in LOOKUP_TYPES {
            let id = rand::random::<u16>();
            let query = build_query(id, host, rtype)?;

            let answer = match self.query_udp(id, host, &query).await {
                Ok(answer) if answer.truncated => self.query_tcp(id, host, &query).await,
                other => other,
            };
            match answer {
                Ok(answer) => addrs.extend(answer.addrs),
                Err(e) => last_err = Some(e),
            }
        }

        if addrs.is_empty() {
            return Err(match last_err {
                Some(e @ Error::Resolve { .. }) => e,
                Some(e) => Error::resolve(host, e),
                None => Error::resolve(host, "no records"),
            });
        }
        Ok(addrs)
    }
}
