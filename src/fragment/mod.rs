//! Client Hello fragmentation.
//!
//! DPI boxes commonly match the SNI inside the first TLS record of a flow.
//! The engine here writes that record in small, spaced-out pieces:
//!
//! ```text
//!  ┌───────────── before SNI ─────────────┬──── SNI + rest ────────────┐
//!  │ ≤BSL │ ≤BSL │ ≤BSL │ ...             │ ≤ASL │ ≤ASL │ ...          │
//!  └──────┴──────┴──────┴─────────────────┴──────┴──────┴──────────────┘
//!           delay between every write
//! ```
//!
//! When no SNI can be found the boundary falls back to the middle of the
//! record. Only the first record is touched; [`FragmentingStream`] passes
//! everything after it through unchanged.

pub mod stream;
pub mod tls;

pub use stream::FragmentingStream;

use std::ops::Range;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::sleep;

use crate::error::Result;

/// Chunking parameters, shared by every fragmented write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentConfig {
    /// Maximum chunk length before the SNI boundary (BSL)
    pub before_sni: usize,
    /// Maximum chunk length from the SNI boundary on (ASL)
    pub after_sni: usize,
    /// Pause between two chunk writes
    pub delay: Duration,
}

impl FragmentConfig {
    /// Build a config from signed lengths; zero or negative disables chunking.
    pub fn new(before_sni: i64, after_sni: i64, delay: Duration) -> Self {
        Self {
            before_sni: before_sni.max(0) as usize,
            after_sni: after_sni.max(0) as usize,
            delay,
        }
    }

    /// A config that never splits.
    pub fn disabled() -> Self {
        Self::new(0, 0, Duration::ZERO)
    }

    /// Whether writes are actually split.
    pub fn is_enabled(&self) -> bool {
        self.before_sni > 0 && self.after_sni > 0
    }
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            before_sni: 10,
            after_sni: 20,
            delay: Duration::from_millis(5),
        }
    }
}

/// Split boundary for `data`: the SNI extension offset, or the midpoint.
pub fn split_boundary(data: &[u8]) -> usize {
    match tls::find_sni_offset(data) {
        Some(offset) => offset,
        None => {
            tracing::trace!("SNI not found in {} byte record, splitting at midpoint", data.len());
            data.len() / 2
        }
    }
}

/// Compute the byte ranges written for a `len` byte record split at `boundary`.
///
/// Ranges are contiguous, cover `0..len` exactly, and never cross the
/// boundary.
pub fn plan_chunks(len: usize, boundary: usize, config: &FragmentConfig) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    if !config.is_enabled() || len <= config.before_sni.min(config.after_sni) {
        return vec![0..len];
    }

    let boundary = boundary.min(len);
    let mut chunks = Vec::with_capacity(
        boundary / config.before_sni + (len - boundary) / config.after_sni + 2,
    );

    let mut pos = 0;
    while pos < boundary {
        let end = (pos + config.before_sni).min(boundary);
        chunks.push(pos..end);
        pos = end;
    }
    while pos < len {
        let end = (pos + config.after_sni).min(len);
        chunks.push(pos..end);
        pos = end;
    }

    chunks
}

/// Write `data` in chunks around its SNI boundary.
pub async fn write_fragmented<W>(writer: &mut W, data: &[u8], config: &FragmentConfig) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_split(writer, data, split_boundary(data), config).await
}

/// Write `data` in chunks around an explicit boundary.
pub async fn write_split<W>(
    writer: &mut W,
    data: &[u8],
    boundary: usize,
    config: &FragmentConfig,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let chunks = plan_chunks(data.len(), boundary, config);
    let last = chunks.len().saturating_sub(1);

    for (i, range) in chunks.into_iter().enumerate() {
        writer.write_all(&data[range]).await?;
        writer.flush().await?;
        if i != last && !config.delay.is_zero() {
            sleep(config.delay).await;
        }
    }

    Ok(())
}
