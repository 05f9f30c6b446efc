//! Coalesced, cached and rate-limited API requests
//!
//! A [`Request`] describes one call to an upstream API. The [`Client`] runs it
//! through the full lifecycle:
//!
//! 1. resolve the URL and default method,
//! 2. lock the request key so identical requests run one at a time,
//! 3. answer from the cache when possible,
//! 4. otherwise call upstream through the API's rate limiter, retrying 403s,
//! 5. cache successful and not-found responses, then unlock.
//!
//! Waiters queued behind the lock therefore find the cache already written.

mod client;
mod error;
mod response;
mod trace;

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;

use crate::api::{Api, ApiIdent};
use crate::transport::{Headers, HttpRequest};

pub use client::Client;
pub use error::RequestError;
pub use response::Response;
pub(crate) use response::CacheEntry;
pub use trace::RequestTrace;

/// One logical call to an upstream API
#[derive(Debug, Clone)]
pub struct Request {
    pub api: ApiIdent,
    /// Defaults to POST when a payload is set, GET otherwise
    pub method: Option<Method>,
    /// Path relative to the API endpoint, or an absolute URL
    pub url: String,
    pub params: BTreeMap<String, String>,
    pub headers: Headers,
    pub payload: Option<Vec<u8>>,
    /// Human-readable label used in logs
    pub description: String,
    pub cache: bool,
    /// Defaults to [`crate::cache::CACHE_EXPIRE_MEDIUM`]
    pub cache_ttl: Option<Duration>,
    /// Skip the cache read but still write the fresh result
    pub force_refresh: bool,
    /// Serve an expired cache entry when the refresh fails
    pub stale_fallback: bool,
    /// Upper bound for the network phase
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(api: ApiIdent, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            api,
            method: None,
            description: url.clone(),
            url,
            params: BTreeMap::new(),
            headers: Headers::new(),
            payload: None,
            cache: false,
            cache_ttl: None,
            force_refresh: false,
            stale_fallback: false,
            timeout: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Adds a header value; names are case-insensitive
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets a JSON payload and content type
    pub fn json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, RequestError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| RequestError::Encoding(e.to_string()))?;
        Ok(self.header("content-type", "application/json").payload(payload))
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Caches the result for `ttl`
    pub fn cached(mut self, ttl: Duration) -> Self {
        self.cache = true;
        self.cache_ttl = Some(ttl);
        self
    }

    /// Caches the result for the default TTL
    pub fn cached_default(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn stale_fallback(mut self) -> Self {
        self.stale_fallback = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Key shared by identical requests, used for locking and caching
    pub fn key(&self, api: &Api) -> String {
        request_key(api.ident(), &api.url(&self.url), &self.params)
    }

    pub(crate) fn prepare(&self, api: &Api) -> Prepared {
        let url = api.url(&self.url);
        let method = self.method.clone().unwrap_or(if self.payload.is_some() {
            Method::POST
        } else {
            Method::GET
        });

        Prepared {
            key: request_key(api.ident(), &url, &self.params),
            http: HttpRequest {
                method,
                url,
                params: self.params.clone(),
                headers: self.headers.clone(),
                payload: self.payload.clone(),
            },
        }
    }
}

/// Request resolved against its API
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub key: String,
    pub http: HttpRequest,
}

/// Sorted, unescaped query string
pub(crate) fn query_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn request_key(ident: ApiIdent, url: &str, params: &BTreeMap<String, String>) -> String {
    format!("{}.reqapi.{}?{}", ident, url, query_string(params))
}
