//! TTL cache on top of a raw key-value engine
//!
//! Every stored record is the absolute UNIX expiry time as exactly ten ASCII
//! digits, followed by the payload:
//!
//! ```text
//! 1767225600{"key":"...","value":...}
//! ```
//!
//! An expiry of `0000000000` never expires. Expired records are reported as
//! [`CacheError::Expired`] and deleted in the background. Writes and background
//! deletes of the same key are serialized, and a delete only removes a record
//! that is still expired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use super::engine::{EngineError, KvEngine};
use super::pool::BufferPool;
use crate::config::CacheSettings;
use crate::locker::KeyLocker;
use crate::trace::CacheTrace;

/// Length of the expiry prefix in bytes
pub const EXPIRY_PREFIX_LEN: usize = 10;

/// Largest expiry representable in the prefix
const MAX_EXPIRY: i64 = 9_999_999_999;

pub const CACHE_EXPIRE_SHORT: Duration = Duration::from_secs(24 * 60 * 60);
pub const CACHE_EXPIRE_MEDIUM: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const CACHE_EXPIRE_LONG: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors from cache store operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache store is closed")]
    Closed,

    #[error("Caching is disabled")]
    Disabled,

    #[error("Cached data is empty")]
    Empty,

    #[error("Cached data is too short: {0} bytes")]
    TooShort(usize),

    #[error("No cached data found")]
    NotFound,

    #[error("Cached data is expired")]
    Expired,

    #[error("Can't encode the value: {0}")]
    Encoding(String),

    #[error("Can't decode cached data: {0}")]
    Decoding(String),

    #[error("Operation not supported by the cache store: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Result of reading a record regardless of its freshness
#[derive(Debug, Clone, PartialEq)]
pub struct CachedData<T> {
    pub data: T,
    /// `None` for records that never expire
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

#[derive(Serialize)]
struct StoreItemRef<'a, T: ?Sized> {
    key: &'a str,
    value: &'a T,
}

#[derive(Deserialize)]
struct StoreItem<T> {
    #[allow(dead_code)]
    key: String,
    value: T,
}

/// Writes the expiry prefix and `payload` into `out`
fn encode_record(out: &mut Vec<u8>, payload: &[u8], ttl: Duration, now: i64) {
    let expires = if ttl.is_zero() {
        0
    } else {
        let ttl = i64::try_from(ttl.as_secs().max(1)).unwrap_or(MAX_EXPIRY);
        now.saturating_add(ttl).min(MAX_EXPIRY)
    };

    out.reserve(EXPIRY_PREFIX_LEN + payload.len());
    out.extend_from_slice(format!("{:010}", expires).as_bytes());
    out.extend_from_slice(payload);
}

/// Splits a stored record into its expiry and payload
fn decode_record(data: &[u8]) -> Result<(i64, &[u8]), CacheError> {
    if data.is_empty() {
        return Err(CacheError::Empty);
    }
    if data.len() < EXPIRY_PREFIX_LEN {
        return Err(CacheError::TooShort(data.len()));
    }

    let (prefix, payload) = data.split_at(EXPIRY_PREFIX_LEN);
    let expires = std::str::from_utf8(prefix)
        .ok()
        .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse::<i64>().ok())
        .ok_or_else(|| CacheError::Decoding("invalid expiry prefix".to_string()))?;

    Ok((expires, payload))
}

fn is_expired(expires: i64, now: i64) -> bool {
    expires > 0 && expires < now
}

fn decode_item<T: DeserializeOwned>(data: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice::<StoreItem<T>>(data)
        .map(|item| item.value)
        .map_err(|e| CacheError::Decoding(e.to_string()))
}

/// TTL cache store shared by the whole process
pub struct CacheStore {
    engine: Arc<dyn KvEngine>,
    settings: CacheSettings,
    closed: AtomicBool,
    buffers: BufferPool,
    /// Orders writes against background deletes
    writes: KeyLocker,
}

impl CacheStore {
    pub fn new(engine: Arc<dyn KvEngine>, settings: CacheSettings) -> Self {
        Self {
            engine,
            settings,
            closed: AtomicBool::new(false),
            buffers: BufferPool::default(),
            writes: KeyLocker::new(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Rejects all further operations
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        self.check_open()?;
        if !self.settings.writes_enabled() {
            return Err(CacheError::Disabled);
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<(), CacheError> {
        self.check_open()?;
        if !self.settings.reads_enabled() {
            return Err(CacheError::Disabled);
        }
        Ok(())
    }

    fn log_trace(&self, mut trace: CacheTrace) {
        if self.settings.tracing {
            trace.tracer.complete();
            debug!("{}", trace);
        }
    }

    /// Stores `value` under `key`, expiring after `ttl`
    ///
    /// A zero `ttl` stores the record without expiry.
    pub async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.check_writable()?;

        let mut trace = CacheTrace::start("SetBytes", key);
        trace.size(value.len());

        let mut record = self.buffers.checkout();
        encode_record(&mut record, value, ttl, Utc::now().timestamp());
        let guard = self.writes.lock(key).await;
        let result = self.engine.set(key, &record).await.map_err(CacheError::from);
        guard.unlock();

        trace.stage("SetBytes");
        self.log_trace(trace);
        result
    }

    /// Serializes `value` and stores it under `key`
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check_writable()?;

        let mut trace = CacheTrace::start("Set", key);
        let mut buffer = self.buffers.checkout();
        let encoded = serde_json::to_writer(&mut *buffer, &StoreItemRef { key, value })
            .map_err(|e| CacheError::Encoding(e.to_string()));
        trace.stage("Marshal");
        trace.size(buffer.len());

        if let Err(e) = encoded {
            self.log_trace(trace);
            return Err(e);
        }

        let result = self.set_bytes(key, &buffer, ttl).await;
        trace.stage("SetBytes");
        self.log_trace(trace);
        result
    }

    pub async fn add<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        self.set(key, value, ttl).await
    }

    pub async fn replace<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        self.set(key, value, ttl).await
    }

    /// Reads the payload stored under `key`
    ///
    /// Expired records fail with [`CacheError::Expired`] and are deleted
    /// without waiting for the deletion.
    pub async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let cached = self.read_record(key, "GetBytes").await?;
        if cached.is_expired {
            self.schedule_delete(key);
            return Err(CacheError::Expired);
        }
        Ok(cached.data)
    }

    /// Reads and deserializes the value stored under `key`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, CacheError> {
        let mut trace = CacheTrace::start("Get", key);
        let data = self.get_bytes(key).await;
        trace.stage("GetBytes");

        let result = data.and_then(|data| {
            trace.size(data.len());
            decode_item(&data)
        });
        trace.stage("Unmarshal");
        self.log_trace(trace);
        result
    }

    /// Reads the payload under `key` even if it expired, without deleting it
    pub async fn get_bytes_allow_stale(&self, key: &str) -> Result<CachedData<Vec<u8>>, CacheError> {
        self.read_record(key, "GetBytesStale").await
    }

    /// Reads and deserializes the value under `key` even if it expired
    pub async fn get_allow_stale<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<CachedData<T>, CacheError> {
        let cached = self.read_record(key, "GetStale").await?;
        Ok(CachedData {
            data: decode_item(&cached.data)?,
            expires_at: cached.expires_at,
            is_expired: cached.is_expired,
        })
    }

    async fn read_record(
        &self,
        key: &str,
        action: &'static str,
    ) -> Result<CachedData<Vec<u8>>, CacheError> {
        self.check_readable()?;

        let mut trace = CacheTrace::start(action, key);
        let result = self.engine.get(key).await;
        trace.stage("GetBytes");

        let result = match result {
            Ok(Some(data)) => {
                trace.size(data.len());
                let decoded = decode_record(&data).map(|(expires, payload)| {
                    let now = Utc::now().timestamp();
                    CachedData {
                        data: payload.to_vec(),
                        expires_at: (expires > 0)
                            .then(|| DateTime::from_timestamp(expires, 0))
                            .flatten(),
                        is_expired: is_expired(expires, now),
                    }
                });
                trace.stage("Parse");
                decoded
            }
            Ok(None) => Err(CacheError::NotFound),
            Err(e) => Err(e.into()),
        };

        self.log_trace(trace);
        result
    }

    fn schedule_delete(&self, key: &str) {
        let engine = self.engine.clone();
        let writes = self.writes.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let _guard = writes.lock(key.as_str()).await;

            // The key may have been rewritten since it was read
            let still_expired = match engine.get(&key).await {
                Ok(Some(data)) => decode_record(&data)
                    .map(|(expires, _)| is_expired(expires, Utc::now().timestamp()))
                    .unwrap_or(false),
                Ok(None) => false,
                Err(e) => {
                    debug!("Failed to re-read expired cache key {}: {}", key, e);
                    false
                }
            };

            if still_expired {
                if let Err(e) = engine.delete(&key).await {
                    debug!("Failed to delete expired cache key {}: {}", key, e);
                }
            }
        });
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_open()?;
        self.engine.delete(key).await.map_err(CacheError::from)
    }

    pub async fn increment(&self, _key: &str, _delta: u64) -> Result<u64, CacheError> {
        Err(CacheError::Unsupported("increment"))
    }

    pub async fn decrement(&self, _key: &str, _delta: u64) -> Result<u64, CacheError> {
        Err(CacheError::Unsupported("decrement"))
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        Err(CacheError::Unsupported("flush"))
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("settings", &self.settings)
            .field("closed", &self.is_closed())
            .finish()
    }
}
