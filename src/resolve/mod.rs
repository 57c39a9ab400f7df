//! Hostname resolution chain.
//!
//! Lookup order, first hit wins:
//!
//! 1. static hosts map (exact match, never cached)
//! 2. IP literal
//! 3. TTL cache
//! 4. live upstream ([`DohClient`] or [`UdpDnsClient`]); successes are
//!    cached, failures are not

pub mod cache;
pub mod doh;
pub mod local;
pub mod message;
pub mod udp;

pub use cache::DnsCache;
pub use doh::DohClient;
pub use local::{HostsMap, LocalResolver};
pub use udp::UdpDnsClient;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::fragment::FragmentConfig;

const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Something that turns a hostname into addresses.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve `host` to one or more addresses.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Hosts map, cache, then upstream.
pub struct Resolver {
    local: LocalResolver,
    cache: DnsCache,
    upstream: Arc<dyn Resolve>,
}

impl Resolver {
    /// Build a chain over an explicit upstream.
    pub fn new(local: LocalResolver, cache_ttl: Duration, upstream: Arc<dyn Resolve>) -> Self {
        Self {
            local,
            cache: DnsCache::new(cache_ttl),
            upstream,
        }
    }

    /// Build a chain whose upstream is chosen from `remote_dns_addr`:
    /// `https://` selects DoH, anything else a conventional DNS server.
    pub fn from_remote_addr(
        remote_dns_addr: &str,
        hosts: Arc<HostsMap>,
        cache_ttl: Duration,
        dialer: Dialer,
        doh_fragment: Option<FragmentConfig>,
    ) -> Result<Self> {
        let local = LocalResolver::new(hosts);

        let upstream: Arc<dyn Resolve> = if remote_dns_addr.starts_with("https://") {
            tracing::info!("using DoH resolver {}", remote_dns_addr);
            Arc::new(DohClient::new(
                remote_dns_addr,
                dialer,
                local.clone(),
                doh_fragment,
            )?)
        } else {
            tracing::info!("using DNS resolver {}", remote_dns_addr);
            Arc::new(UdpDnsClient::from_address(remote_dns_addr)?)
        };

        Ok(Self::new(local, cache_ttl, upstream))
    }

    /// Resolve `host`, observing `cancel`.
    pub async fn resolve(&self, cancel: &CancellationToken, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.local.lookup_hosts(host) {
            return Ok(addrs);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(addrs) = self.cache.get(host) {
            tracing::trace!("cache hit for {}", host);
            return Ok(addrs);
        }

        let addrs = tokio::select! {
            result = self.upstream.resolve(host) => result.map_err(|e| match e {
                e @ Error::Resolve { .. } => e,
                e => Error::resolve(host, e),
            })?,
            _ = cancel.cancelled() => return Err(Error::resolve(host, "cancelled")),
        };
        if addrs.is_empty() {
            return Err(Error::resolve(host, "no addresses"));
        }

        self.cache.insert(host, addrs.clone());
        Ok(addrs)
    }

    /// The cache backing this chain.
    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Drop expired cache entries once per TTL, until `cancel` fires or the
    /// resolver is dropped. Hosts looked up only once would otherwise stay
    /// cached forever.
    pub fn spawn_cache_purger(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let resolver = Arc::downgrade(self);
        let period = self.cache.ttl().max(MIN_PURGE_INTERVAL);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                let Some(resolver) = resolver.upgrade() else {
                    break;
                };
                let n = resolver.cache.purge_expired();
                if n > 0 {
                    tracing::debug!("Purged {} expired DNS entries", n);
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::Resolve;
    use crate::error::{Error, Result};

    /// Upstream with canned answers that counts every call.
    #[derive(Default)]
    pub struct CountingUpstream {
        pub answers: HashMap<String, Vec<IpAddr>>,
        pub calls: AtomicUsize,
    }

    impl CountingUpstream {
        pub fn with(host: &str, addr: &str) -> Self {
            let mut answers = HashMap::new();
            answers.insert(host.to_string(), vec![addr.parse().unwrap()]);
            Self {
                answers,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// Upstream whose transport is broken.
    pub struct FailingUpstream;

    #[async_trait]
    impl Resolve for FailingUpstream {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Err(Error::Http("503 Service Unavailable".into()))
        }
    }

    #[async_trait]
    impl Resolve for CountingUpstream {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(host)
                .cloned()
                .ok_or_else(|| Error::resolve(host, "nxdomain"))
        }
    }
}
