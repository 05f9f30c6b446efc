//! Persistent cache for API responses
//!
//! This module provides a TTL cache store that prefixes every record with its
//! absolute expiry time and keeps it in a pluggable key-value engine. The file
//! engine persists records under the XDG cache directory; the memory engine
//! keeps them in-process.

mod engine;
mod file;
mod pool;
mod store;

pub use engine::{EngineError, KvEngine, MemoryEngine};
pub use file::FileEngine;
pub use pool::{BufferPool, PooledBuffer};
pub use store::{
    CacheError, CacheStore, CachedData, CACHE_EXPIRE_LONG, CACHE_EXPIRE_MEDIUM,
    CACHE_EXPIRE_SHORT, EXPIRY_PREFIX_LEN,
};
