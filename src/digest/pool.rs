//! Process-wide digest buffer pool.
//!
//! A single instance, internally synchronized, keyed by buffer size. Caps
//! retained buffers per size bucket so the pool amortises allocation across
//! thousands of files without growing unbounded under bursty concurrency.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Maximum buffers retained per size bucket; excess is simply dropped.
const MAX_RETAINED_PER_BUCKET: usize = 2;

struct BufferPool {
    buckets: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn acquire(&self, size: usize) -> Vec<u8> {
        let mut buckets = self.buckets.lock().expect("buffer pool poisoned");
        if let Some(bucket) = buckets.get_mut(&size) {
            if let Some(mut buf) = bucket.pop() {
                buf.resize(size, 0);
                return buf;
            }
        }
        vec![0u8; size]
    }

    fn release(&self, mut buf: Vec<u8>, size: usize) {
        let mut buckets = self.buckets.lock().expect("buffer pool poisoned");
        let bucket = buckets.entry(size).or_default();
        if bucket.len() < MAX_RETAINED_PER_BUCKET {
            buf.clear();
            buf.resize(size, 0);
            bucket.push(buf);
        }
        // else: drop the excess buffer, releasing its memory.
    }
}

fn pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

/// A buffer checked out of the process-wide pool. Scoped acquisition: the
/// buffer is returned to the pool when this guard is dropped, on every exit
/// path including an early return or a panic unwind.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    size: usize,
}

impl PooledBuffer {
    pub fn acquire(size: usize) -> Self {
        Self {
            buf: Some(pool().acquire(size)),
            size,
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            pool().release(buf, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquired_buffer_has_requested_size() {
        let buf = PooledBuffer::acquire(4096);
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn buffers_are_reused_across_acquisitions() {
        {
            let buf = PooledBuffer::acquire(8192);
            assert_eq!(buf.len(), 8192);
        }
        // The buffer above was released back into the pool; a fresh
        // acquisition of the same size should succeed without panicking
        // and still report the requested length.
        let buf = PooledBuffer::acquire(8192);
        assert_eq!(buf.len(), 8192);
    }

    #[test]
    fn excess_buffers_beyond_cap_are_simply_dropped() {
        let mut guards = Vec::new();
        for _ in 0..(MAX_RETAINED_PER_BUCKET + 5) {
            guards.push(PooledBuffer::acquire(1024));
        }
        drop(guards);
        let buf = PooledBuffer::acquire(1024);
        assert_eq!(buf.len(), 1024);
    }
}
