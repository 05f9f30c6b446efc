//! Reusable byte buffers for cache encoding

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Buffers larger than this are dropped instead of returned to the pool
const MAX_RETAINED_CAPACITY: usize = 1 << 20;

/// Pool of cleared `Vec<u8>` buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    max_idle: usize,
}

impl BufferPool {
    /// Creates a pool keeping at most `max_idle` buffers around
    pub fn new(max_idle: usize) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(Vec::new())),
            max_idle,
        }
    }

    /// Takes an empty buffer, allocating one if the pool is empty
    pub fn checkout(&self) -> PooledBuffer {
        let buffer = self.buffers.lock().pop().unwrap_or_default();
        PooledBuffer {
            buffer,
            pool: self.clone(),
        }
    }

    /// Idle buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn give_back(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buffer.clear();

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle {
            buffers.push(buffer);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Buffer checked out of a [`BufferPool`], returned on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffer));
    }
}
