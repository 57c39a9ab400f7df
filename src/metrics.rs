//! Gateway metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Gateway metrics collector.
pub struct ServerMetrics {
    /// Gateway start time
    start_time: Instant,
    /// Total requests accepted
    total_connections: AtomicU64,
    /// Requests currently being served
    active_connections: AtomicU64,
    /// Requests sent straight to the destination
    direct_connections: AtomicU64,
    /// Requests carried through a worker tunnel
    relayed_connections: AtomicU64,
    /// Bytes from clients towards destinations
    bytes_up: AtomicU64,
    /// Bytes from destinations towards clients
    bytes_down: AtomicU64,
    /// Outbound dials that failed
    dial_failures: AtomicU64,
    /// Hostnames that could not be resolved
    resolve_failures: AtomicU64,
    /// Worker tunnels that failed mid-request
    tunnel_failures: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            direct_connections: AtomicU64::new(0),
            relayed_connections: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            resolve_failures: AtomicU64::new(0),
            tunnel_failures: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a request served directly.
    pub fn increment_direct(&self) {
        self.direct_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request served through a tunnel.
    pub fn increment_relayed(&self) {
        self.relayed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Add client→destination bytes.
    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add destination→client bytes.
    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed request by its error kind.
    pub fn record_failure(&self, err: &crate::Error) {
        match err {
            crate::Error::Dial { .. } => {
                self.dial_failures.fetch_add(1, Ordering::Relaxed);
            }
            crate::Error::Resolve { .. } | crate::Error::Dns(_) => {
                self.resolve_failures.fetch_add(1, Ordering::Relaxed);
            }
            e if e.is_tunnel_failure() => {
                self.tunnel_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            direct_connections: self.direct_connections.load(Ordering::Relaxed),
            relayed_connections: self.relayed_connections.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            tunnel_failures: self.tunnel_failures.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report, adding registry counters.
    pub fn format_report(&self, tunnels_created: u64, tunnels_evicted: u64) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"bepass metrics
==============
Uptime: {} seconds

Connections:
  Total:    {}
  Active:   {}
  Direct:   {}
  Relayed:  {}

Tunnels:
  Created:  {}
  Evicted:  {}

Traffic:
  Up:       {} bytes
  Down:     {} bytes

Errors:
  Dial:     {}
  Resolve:  {}
  Tunnel:   {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.direct_connections,
            snapshot.relayed_connections,
            tunnels_created,
            tunnels_evicted,
            snapshot.bytes_up,
            snapshot.bytes_down,
            snapshot.dial_failures,
            snapshot.resolve_failures,
            snapshot.tunnel_failures,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub direct_connections: u64,
    pub relayed_connections: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub dial_failures: u64,
    pub resolve_failures: u64,
    pub tunnel_failures: u64,
}

impl MetricsSnapshot {
    /// Share of requests that went through a tunnel.
    pub fn relay_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.relayed_connections as f64 / self.total_connections as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_up + self.bytes_down) as f64 / self.uptime_secs as f64
        }
    }
}
