//! Fixed-size byte buffer pool for copy loops.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default block size handed out by the pool (32 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// Default number of idle blocks kept around.
pub const DEFAULT_MAX_IDLE: usize = 256;

/// Lends reusable fixed-size buffers.
///
/// Buffers go back to the pool when the [`PooledBuf`] handle drops, so a
/// block is never shared between two borrowers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    block_size: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a new pool handing out `block_size` byte blocks.
    pub fn new(block_size: usize, max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            block_size,
            max_idle,
        }
    }

    /// Block size of every buffer this pool lends.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Borrow a buffer, allocating when the pool is empty.
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.block_size]);

        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, buf: Vec<u8>) {
        // Foreign-sized blocks are dropped rather than pooled
        if buf.len() != self.block_size {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle {
            buffers.push(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_IDLE)
    }
}

/// A buffer borrowed from a [`BufferPool`].
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_reuse() {
        let pool = Arc::new(BufferPool::new(1024, 4));
        assert_eq!(pool.idle(), 0);

        {
            let buf = pool.get();
            assert_eq!(buf.len(), 1024);
        }
        assert_eq!(pool.idle(), 1);

        let _a = pool.get();
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_distinct_borrowers() {
        let pool = Arc::new(BufferPool::new(16, 4));
        let mut a = pool.get();
        let mut b = pool.get();
        a[0] = 1;
        b[0] = 2;
        assert_eq!(a[0], 1);
        assert_eq!(b[0], 2);
    }

    #[test]
    fn test_idle_limit() {
        let pool = Arc::new(BufferPool::new(16, 2));
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.idle(), 2);
    }
}
