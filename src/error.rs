//! Error types for the bepass gateway.

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SOCKS-level reply codes reported back to the client.
///
/// The inbound adapter maps these onto the wire encoding of the protocol
/// version the client spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// Request granted
    Succeeded,
    /// General server failure
    GeneralFailure,
    /// Network unreachable
    NetworkUnreachable,
    /// Host unreachable (dial or resolution failure)
    HostUnreachable,
    /// Connection refused by destination
    ConnectionRefused,
    /// TTL expired / dial timed out
    TtlExpired,
    /// Command not supported in the active mode
    CommandNotSupported,
}

/// Errors that can occur while serving a request.
#[derive(Error, Debug)]
pub enum Error {
    /// Outbound connection to the destination failed
    #[error("dial {target} failed: {reason}")]
    Dial {
        /// Destination that was dialed
        target: String,
        /// Underlying failure
        reason: String,
    },

    /// Hostname could not be resolved through any chain link
    #[error("resolve {host} failed: {reason}")]
    Resolve {
        /// Hostname being resolved
        host: String,
        /// Underlying failure
        reason: String,
    },

    /// Worker tunnel transport failed (connect, read or write)
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Tunnel was closed before or during the operation
    #[error("tunnel closed")]
    TunnelClosed,

    /// Operation timed out
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// DNS message error
    #[error("DNS error: {0}")]
    Dns(String),

    /// HTTP error talking to a DoH endpoint
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket handshake or framing error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Request kind not handled in the active mode
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Create a new dial error
    pub fn dial(target: impl ToString, reason: impl ToString) -> Self {
        Error::Dial {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a new resolution error
    pub fn resolve(host: impl Into<String>, reason: impl ToString) -> Self {
        Error::Resolve {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Error::Tunnel(msg.into())
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new DNS error
    pub fn dns(msg: impl Into<String>) -> Self {
        Error::Dns(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error means the worker tunnel must be torn down
    pub fn is_tunnel_failure(&self) -> bool {
        matches!(self, Error::Tunnel(_) | Error::TunnelClosed | Error::WebSocket(_))
    }

    /// SOCKS reply code reported to the client for this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Error::Dial { reason, .. } if reason.contains("refused") => {
                ReplyCode::ConnectionRefused
            }
            Error::Dial { .. } | Error::Resolve { .. } | Error::Dns(_) => {
                ReplyCode::HostUnreachable
            }
            Error::Timeout(_) => ReplyCode::TtlExpired,
            Error::Network(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
                std::io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
                _ => ReplyCode::NetworkUnreachable,
            },
            Error::Unsupported(_) => ReplyCode::CommandNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TunnelClosed;
        assert_eq!(err.to_string(), "tunnel closed");

        let err = Error::Timeout(5000);
        assert_eq!(err.to_string(), "timeout after 5000ms");

        let err = Error::dial("10.0.0.1:443", "connection refused");
        assert_eq!(err.to_string(), "dial 10.0.0.1:443 failed: connection refused");
    }

    #[test]
    fn test_tunnel_failure() {
        assert!(Error::tunnel("reset").is_tunnel_failure());
        assert!(Error::TunnelClosed.is_tunnel_failure());
        assert!(!Error::resolve("example.com", "nxdomain").is_tunnel_failure());
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(
            Error::dial("a:1", "connection refused").reply_code(),
            ReplyCode::ConnectionRefused
        );
        assert_eq!(
            Error::resolve("a", "nxdomain").reply_code(),
            ReplyCode::HostUnreachable
        );
        assert_eq!(
            Error::Unsupported("associate".into()).reply_code(),
            ReplyCode::CommandNotSupported
        );
        assert_eq!(Error::TunnelClosed.reply_code(), ReplyCode::GeneralFailure);
    }
}
