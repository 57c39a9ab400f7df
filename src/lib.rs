//! # bepass
//!
//! A local SOCKS gateway that gets traffic past DPI-based filtering in one of
//! two ways:
//!
//! - **direct egress**: the outbound TCP connection is dialed locally and the
//!   first TLS record (the Client Hello) is written in small, delayed chunks
//!   split around the Server Name Indication;
//! - **relay egress**: the request travels through a persistent WebSocket
//!   tunnel to a remote worker, which opens the real connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Server: SOCKS4/5 listener, request handler             │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transport: direct or relay routing, pooled copies      │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Fragment engine + Dialer  │  Tunnel registry + mux     │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Resolver: hosts map, TTL cache, DoH / DNS upstream     │
//! └─────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod dialer;
pub mod error;
pub mod fragment;
pub mod metrics;
pub mod pool;
pub mod resolve;
pub mod transport;
pub mod tunnel;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, ReplyCode, Result};
