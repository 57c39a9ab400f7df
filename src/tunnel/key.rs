//! Session identifiers and tunnel keys.

use std::fmt;
use std::net::IpAddr;

use rand::distributions::Alphanumeric;
use rand::Rng;

use super::mux::TargetAddr;

/// Identifiers generated once per process and threaded through key
/// derivation and worker URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    user_session: String,
    short_client_id: String,
}

impl ClientSession {
    /// Generate fresh identifiers.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let user_session = format!("{:08}", rng.gen_range(0..100_000_000u32));
        let short_client_id: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        Self {
            user_session,
            short_client_id,
        }
    }

    /// Build from known values.
    pub fn from_parts(user_session: impl Into<String>, short_client_id: impl Into<String>) -> Self {
        Self {
            user_session: user_session.into(),
            short_client_id: short_client_id.into(),
        }
    }

    /// 8-digit session number sent to the worker.
    pub fn user_session(&self) -> &str {
        &self.user_session
    }

    /// 6-character client identifier used in tunnel keys.
    pub fn short_client_id(&self) -> &str {
        &self.short_client_id
    }

    /// Key for the tunnel serving `client_ip` when it talks to `destination`.
    pub fn tunnel_key(&self, client_ip: IpAddr, destination: &TargetAddr) -> TunnelKey {
        TunnelKey(format!(
            "{}-{}-{}",
            self.short_client_id, client_ip, destination
        ))
    }
}

/// Registry key of an established tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey(String);

impl TunnelKey {
    /// Key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
