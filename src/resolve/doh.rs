//! DNS-over-HTTPS client (RFC 8484, POST over HTTP/1.1).
//!
//! The TLS connection to the endpoint goes through the shared [`Dialer`],
//! optionally with the Client Hello fragmented, and the endpoint's own
//! hostname is resolved by a [`LocalResolver`] only. One idle connection is
//! kept between lookups.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{Request, Uri};
use hickory_proto::rr::RecordType;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::local::LocalResolver;
use super::message::{build_query, parse_answer, LOOKUP_TYPES};
use super::Resolve;
use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::fragment::FragmentConfig;

const DNS_MESSAGE: &str = "application/dns-message";

type DohSender = http1::SendRequest<Full<Bytes>>;

/// HTTP/1.1 connection to the endpoint.
struct Connection {
    sender: DohSender,
    driver: JoinHandle<()>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed() && !self.driver.is_finished()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// DoH upstream.
pub struct DohClient {
    path: String,
    host: String,
    port: u16,
    dialer: Dialer,
    local: LocalResolver,
    fragment: Option<FragmentConfig>,
    timeout: Duration,
    idle: Mutex<Option<Connection>>,
}

impl DohClient {
    /// Create a client for an `https://` endpoint URL.
    pub fn new(
        url: &str,
        dialer: Dialer,
        local: LocalResolver,
        fragment: Option<FragmentConfig>,
    ) -> Result<Self> {
        let endpoint: Uri = url
            .parse()
            .map_err(|e| Error::config(format!("invalid DoH URL {}: {}", url, e)))?;
        if endpoint.scheme_str() != Some("https") {
            return Err(Error::config(format!("DoH URL must be https: {}", url)));
        }
        let host = endpoint
            .host()
            .ok_or_else(|| Error::config(format!("DoH URL has no host: {}", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = endpoint.port_u16().unwrap_or(443);
        let path = endpoint
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            path,
            host,
            port,
            dialer,
            local,
            fragment,
            timeout: Duration::from_secs(10),
            idle: Mutex::new(None),
        })
    }

    /// Override the per-lookup timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Endpoint host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> Result<Connection> {
        let endpoint_addrs = self.local.resolve(&self.host).await?;
        let tcp = self.dialer.tcp_dial_any(&endpoint_addrs, self.port).await?;
        let tls = self
            .dialer
            .tls_handshake(tcp, &self.host, self.fragment)
            .await?;

        let (sender, conn) = http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("DoH connection closed: {}", e);
            }
        });
        Ok(Connection { sender, driver })
    }

    fn take_idle(&self) -> Option<Connection> {
        self.idle.lock().take().filter(Connection::is_open)
    }

    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>> {
        let (mut conn, reused) = match self.take_idle() {
            Some(conn) => (conn, true),
            None => (self.connect().await?, false),
        };

        let mut result = exchange(&mut conn.sender, &self.path, &self.host, name).await;
        if result.is_err() && reused && !conn.is_open() {
            // The endpoint dropped the idle connection
            conn = self.connect().await?;
            result = exchange(&mut conn.sender, &self.path, &self.host, name).await;
        }

        if conn.is_open() {
            *self.idle.lock() = Some(conn);
        }
        result
    }
}

/// Ask for every lookup type over one connection.
///
/// A type that fails does not discard the answers of the others; the lookup
/// fails only when no type produced an address.
async fn exchange(
    sender: &mut DohSender,
    path: &str,
    authority: &str,
    name: &str,
) -> Result<Vec<IpAddr>> {
    let mut addrs = Vec::new();
    let mut last_err = None;
    for (i, rtype) in LOOKUP_TYPES.iter().enumerate() {
        let id = rand::random::<u16>().wrapping_add(i as u16);
        match query(sender, path, authority, name, id, *rtype).await {
            Ok(found) => addrs.extend(found),
            Err(e) => {
                tracing::debug!("DoH {} query for {} failed: {}", rtype, name, e);
                last_err = Some(e);
            }
        }
    }

    if addrs.is_empty() {
        return Err(last_err.unwrap_or_else(|| Error::resolve(name, "no records")));
    }
    Ok(addrs)
}

async fn query(
    sender: &mut DohSender,
    path: &str,
    authority: &str,
    name: &str,
    id: u16,
    rtype: RecordType,
) -> Result<Vec<IpAddr>> {
    let message = build_query(id, name, rtype)?;

    sender
        .ready()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    let request = Request::post(path)
        .header(HOST, authority)
        .header(CONTENT_TYPE, DNS_MESSAGE)
        .header(ACCEPT, DNS_MESSAGE)
        .body(Full::new(Bytes::from(message)))
        .map_err(|e| Error::Http(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Http(format!("DoH status {}", response.status())));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Http(e.to_string()))?
        .to_bytes();

    Ok(parse_answer(name, id, &body)?.addrs)
}

#[async_trait]
impl Resolve for DohClient {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        match timeout(self.timeout, self.lookup(host)).await {
            Ok(result) => result,
            Err(_) => Err(Error::resolve(
                host,
                format!("DoH lookup timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::dialer::DialerConfig;
    use crate::resolve::message::testing::answer_query;

    fn dialer() -> Dialer {
        Dialer::new(DialerConfig::default()).unwrap()
    }

    #[test]
    fn test_endpoint_parsing() {
        let client = DohClient::new(
            "https://dns.example.test:8443/dns-query",
            dialer(),
            LocalResolver::default(),
            None,
        )
        .unwrap();
        assert_eq!(client.host(), "dns.example.test");
        assert_eq!(client.port, 8443);
        assert_eq!(client.path, "/dns-query");

        let client = DohClient::new(
            "https://1.1.1.1/dns-query",
            dialer(),
            LocalResolver::default(),
            None,
        )
        .unwrap();
        assert_eq!(client.port, 443);
    }

    #[test]
    fn test_rejects_plain_http() {
        assert!(DohClient::new(
            "http://dns.example.test/dns-query",
            dialer(),
            LocalResolver::default(),
            None
        )
        .is_err());
    }

    /// Read one HTTP/1.1 request and return its body.
    async fn read_request(stream: &mut TcpStream) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Some(buf[head_end..head_end + length].to_vec())
    }

    async fn write_response(stream: &mut TcpStream, status: &str, body: &[u8]) {
        let head = format!(
            "HTTP/1.1 {}\r\ncontent-type: {}\r\ncontent-length: {}\r\n\r\n",
            status,
            DNS_MESSAGE,
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();
    }

    /// Plain HTTP/1.1 sender to a local endpoint.
    async fn sender_to(addr: std::net::SocketAddr) -> DohSender {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let (sender, conn) = http1::handshake(TokioIo::new(tcp)).await.unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });
        sender
    }

    #[tokio::test]
    async fn test_lost_connection_keeps_earlier_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let v4: IpAddr = "192.0.2.7".parse().unwrap();

        // Answers the A query, then hangs up before the AAAA query
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let query = read_request(&mut stream).await.unwrap();
            write_response(&mut stream, "200 OK", &answer_query(&query, &[v4])).await;
        });

        let mut sender = sender_to(addr).await;
        let addrs = exchange(&mut sender, "/dns-query", "dns.example.test", "example.com")
            .await
            .unwrap();
        assert_eq!(addrs, vec![v4]);
    }

    #[tokio::test]
    async fn test_error_status_keeps_other_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let v6: IpAddr = "2001:db8::7".parse().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await.unwrap();
            write_response(&mut stream, "503 Service Unavailable", b"").await;
            let query = read_request(&mut stream).await.unwrap();
            write_response(&mut stream, "200 OK", &answer_query(&query, &[v6])).await;
        });

        let mut sender = sender_to(addr).await;
        let addrs = exchange(&mut sender, "/dns-query", "dns.example.test", "example.com")
            .await
            .unwrap();
        assert_eq!(addrs, vec![v6]);
    }

    #[tokio::test]
    async fn test_all_types_failing_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while read_request(&mut stream).await.is_some() {
                write_response(&mut stream, "502 Bad Gateway", b"").await;
            }
        });

        let mut sender = sender_to(addr).await;
        let err = exchange(&mut sender, "/dns-query", "dns.example.test", "example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "{:?}", err);
    }
}
