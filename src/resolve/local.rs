//! Resolution that never leaves the machine's own resolver path.
//!
//! Used by the DoH client to find its own endpoint, so that it can never
//! recurse into itself.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::Resolve;
use crate::error::{Error, Result};

/// Static hostname table.
pub type HostsMap = HashMap<String, Vec<IpAddr>>;

/// Hosts map, then IP literal, then the operating system resolver.
#[derive(Clone, Default)]
pub struct LocalResolver {
    hosts: Arc<HostsMap>,
}

impl LocalResolver {
    /// Create a local resolver over `hosts`.
    pub fn new(hosts: Arc<HostsMap>) -> Self {
        Self { hosts }
    }

    /// Exact-match hosts lookup. Keys are expected in lowercase.
    pub fn lookup_hosts(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.hosts
            .get(host)
            .or_else(|| self.hosts.get(&host.to_ascii_lowercase()))
            .filter(|addrs| !addrs.is_empty())
            .cloned()
    }
}

#[async_trait]
impl Resolve for LocalResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.lookup_hosts(host) {
            return Ok(addrs);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::resolve(host, e))?
            .map(|sa| sa.ip())
            .collect();

        if addrs.is_empty() {
            return Err(Error::resolve(host, "no addresses"));
        }
        Ok(addrs)
    }
}
