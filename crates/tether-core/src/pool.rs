use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use zeroize::Zeroize;

const DEFAULT_MAX_RETAINED: usize = 64;

/// Thread-safe pool of reusable payload buffers.
///
/// Frame reads borrow a buffer instead of allocating per packet. Returned
/// buffers are zeroized before they go back on the shelf: they may have held
/// handshake material or ciphertext.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    shelf: Mutex<Vec<Vec<u8>>>,
    max_retained: usize,
}

impl BufferPool {
    pub fn new(max_retained: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                shelf: Mutex::new(Vec::new()),
                max_retained,
            }),
        }
    }

    /// Take a buffer resized to exactly `len` bytes.
    pub fn take(&self, len: usize) -> PooledBuf {
        let mut buf = self.inner.shelf.lock().pop().unwrap_or_default();
        buf.resize(len, 0);
        PooledBuf {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED)
    }
}

/// A buffer checked out of a [`BufferPool`]; wiped and returned on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.buf.zeroize();
        let mut shelf = self.pool.shelf.lock();
        if shelf.len() < self.pool.max_retained {
            shelf.push(std::mem::take(&mut self.buf));
        }
    }
}
