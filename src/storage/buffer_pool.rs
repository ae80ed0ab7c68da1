//! # Block Buffer Pool
//!
//! Process-wide pool of reusable block-sized buffers. Block I/O acquires a
//! buffer, fills it, and lets RAII return it on drop, keeping steady-state
//! reads and writes allocation-free.
//!
//! Pools are keyed by block size: every store with the same block size
//! shares one pool for the life of the process. The pool counts how many
//! buffers it has created but never shrinks.

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

static REGISTRY: OnceLock<Mutex<HashMap<usize, BufferPool>>> = OnceLock::new();

/// A pool of reusable buffers of one fixed block size.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    block_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    created: AtomicUsize,
}

impl BufferPool {
    /// The process-wide pool for `block_size` buffers.
    pub fn shared(block_size: usize) -> BufferPool {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        registry
            .lock()
            .entry(block_size)
            .or_insert_with(|| BufferPool::new(block_size))
            .clone()
    }

    fn new(block_size: usize) -> BufferPool {
        BufferPool {
            inner: Arc::new(PoolInner {
                block_size,
                free: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Acquire a zeroed buffer, reusing a pooled one when available.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = self.inner.free.lock().pop();
        let mut buf = recycled.unwrap_or_else(|| {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.inner.block_size].into_boxed_slice()
        });
        buf.fill(0);
        PooledBuffer {
            buf: ManuallyDrop::new(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers this pool has ever allocated.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Number of buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A block buffer that returns to its pool when dropped.
pub struct PooledBuffer {
    buf: ManuallyDrop<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // SAFETY: take() runs exactly once, in drop; the field is never
        // touched afterwards.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        self.pool.free.lock().push(buf);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_return() {
        let pool = BufferPool::new(128);
        assert_eq!(pool.available(), 0);

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.created(), 2);
        assert_eq!(a.len(), 128);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);

        let _c = pool.acquire();
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn recycled_buffers_come_back_zeroed() {
        let pool = BufferPool::new(64);
        {
            let mut buf = pool.acquire();
            buf.fill(0xAB);
        }
        let buf = pool.acquire();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn shared_pools_are_keyed_by_block_size() {
        let a = BufferPool::shared(4096);
        let b = BufferPool::shared(4096);
        let c = BufferPool::shared(8192);

        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
    }
}
