//! Bidirectional copies with an idle watchdog.
//!
//! Both directions run concurrently on pooled buffers. The copy ends when
//! either direction finishes, the request is cancelled, or nothing moved in
//! either direction for the idle period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::tunnel::SubStream;

/// How a copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// One side closed or failed
    Closed,
    /// No traffic for the idle period
    Idle,
    /// The request context was cancelled
    Cancelled,
}

/// Bytes moved by one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    /// Client → destination
    pub up: u64,
    /// Destination → client
    pub down: u64,
    /// Why the copy stopped
    pub end: CopyEnd,
}

/// Last-traffic clock shared by both directions.
pub(crate) struct Activity {
    last: Mutex<Instant>,
    up: AtomicU64,
    down: AtomicU64,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    fn record_up(&self, n: usize) {
        self.up.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    fn record_down(&self, n: usize) {
        self.down.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Resolves once nothing was touched for `idle`.
    pub(crate) async fn idle(&self, idle: Duration) {
        loop {
            let deadline = *self.last.lock() + idle;
            sleep_until(deadline).await;
            if self.last.lock().elapsed() >= idle {
                return;
            }
        }
    }

    fn stats(&self, end: CopyEnd) -> CopyStats {
        CopyStats {
            up: self.up.load(Ordering::Relaxed),
            down: self.down.load(Ordering::Relaxed),
            end,
        }
    }
}

async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    pool: &Arc<BufferPool>,
    record: impl Fn(usize),
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        record(n);
    }
}

/// Copy between the client and a destination stream.
pub async fn copy_streams<C, D>(
    client: C,
    destination: D,
    pool: &Arc<BufferPool>,
    idle: Duration,
    cancel: &CancellationToken,
) -> CopyStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (dest_r, dest_w) = tokio::io::split(destination);
    let activity = Activity::new();

    let up = pipe(client_r, dest_w, pool, |n| activity.record_up(n));
    let down = pipe(dest_r, client_w, pool, |n| activity.record_down(n));

    let end = tokio::select! {
        r = up => {
            if let Err(e) = r {
                tracing::trace!("client side ended: {}", e);
            }
            CopyEnd::Closed
        }
        r = down => {
            if let Err(e) = r {
                tracing::trace!("destination side ended: {}", e);
            }
            CopyEnd::Closed
        }
        _ = activity.idle(idle) => CopyEnd::Idle,
        _ = cancel.cancelled() => CopyEnd::Cancelled,
    };

    activity.stats(end)
}

/// Copy between the client and a tunnel sub-stream.
///
/// A tunnel failure is returned as an error so the caller can drop the
/// tunnel; the client closing is a normal end.
pub async fn copy_substream<C>(
    client: C,
    stream: SubStream,
    pool: &Arc<BufferPool>,
    idle: Duration,
    cancel: &CancellationToken,
) -> Result<CopyStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (sender, mut receiver) = stream.split();
    let activity = Activity::new();

    let up = async {
        let mut buf = pool.get();
        loop {
            let n = match client_r.read(&mut buf).await {
                Ok(0) | Err(_) => return Ok::<(), Error>(()),
                Ok(n) => n,
            };
            sender.send(&buf[..n]).await?;
            activity.record_up(n);
        }
    };

    let down = async {
        while let Some(data) = receiver.recv().await? {
            if client_w.write_all(&data).await.is_err() || client_w.flush().await.is_err() {
                return Ok(());
            }
            activity.record_down(data.len());
        }
        let _ = client_w.shutdown().await;
        Ok::<(), Error>(())
    };

    let end = tokio::select! {
        r = up => r.map(|_| CopyEnd::Closed),
        r = down => r.map(|_| CopyEnd::Closed),
        _ = activity.idle(idle) => Ok(CopyEnd::Idle),
        _ = cancel.cancelled() => Ok(CopyEnd::Cancelled),
    }?;

    Ok(activity.stats(end))
}
