//! Raw key-value storage capability behind the cache store

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Errors raised by a storage engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Get/set/delete of raw bytes by key
#[async_trait]
pub trait KvEngine: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), EngineError>;
    async fn delete(&self, key: &str) -> Result<(), EngineError>;
}

/// In-process engine
#[derive(Debug, Default)]
pub struct MemoryEngine {
    data: DashMap<String, Vec<u8>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

#[async_trait]
impl KvEngine for MemoryEngine {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.data.get(key).map(|value| value.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), EngineError> {
        self.data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.data.remove(key);
        Ok(())
    }
}
