//! Registry of upstream metadata services
//!
//! Each upstream gets one [`Api`] descriptor for the lifetime of the process:
//! its base endpoint, its own [`RateLimiter`] and its retry budget for
//! `403 Forbidden` responses.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::RateLimiter;

/// Errors from building a registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown API: '{0}'. Valid APIs: tmdb, trakt, fanart")]
    UnknownApi(String),

    #[error("Failed to read registry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse registry: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Identity of an upstream service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiIdent {
    Tmdb,
    Trakt,
    Fanart,
}

impl ApiIdent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiIdent::Tmdb => "tmdb",
            ApiIdent::Trakt => "trakt",
            ApiIdent::Fanart => "fanart",
        }
    }
}

impl fmt::Display for ApiIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiIdent {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tmdb" => Ok(ApiIdent::Tmdb),
            "trakt" => Ok(ApiIdent::Trakt),
            "fanart" | "fanarttv" => Ok(ApiIdent::Fanart),
            _ => Err(RegistryError::UnknownApi(s.to_string())),
        }
    }
}

/// How 403 retries are accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryScope {
    /// Every request starts with the full allowance
    #[default]
    PerRequest,
    /// One budget for all requests to the API; once spent it stays spent
    Shared,
}

/// Static configuration of one upstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub ident: ApiIdent,
    pub endpoint: String,
    /// Calls allowed per `burst_time`
    pub burst_rate: usize,
    #[serde(with = "duration_millis", rename = "burst_time_ms")]
    pub burst_time: Duration,
    /// Calls allowed in flight at once
    pub concurrent: usize,
    /// 403 retries allowed
    pub retries: u32,
    #[serde(default)]
    pub retry_scope: RetryScope,
    /// Delay before the first 403 retry, doubled for every further one
    #[serde(
        default = "default_retry_backoff",
        with = "duration_millis",
        rename = "retry_backoff_ms"
    )]
    pub retry_backoff: Duration,
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

impl ApiConfig {
    pub fn tmdb() -> Self {
        Self {
            ident: ApiIdent::Tmdb,
            endpoint: "https://api.themoviedb.org/3".to_string(),
            burst_rate: 50,
            burst_time: Duration::from_secs(1),
            concurrent: 50,
            retries: 3,
            retry_scope: RetryScope::default(),
            retry_backoff: default_retry_backoff(),
        }
    }

    pub fn trakt() -> Self {
        Self {
            ident: ApiIdent::Trakt,
            endpoint: "https://api.trakt.tv".to_string(),
            burst_rate: 100,
            burst_time: Duration::from_secs(10),
            concurrent: 25,
            retries: 3,
            retry_scope: RetryScope::default(),
            retry_backoff: default_retry_backoff(),
        }
    }

    pub fn fanart() -> Self {
        Self {
            ident: ApiIdent::Fanart,
            endpoint: "http://webservice.fanart.tv/v3".to_string(),
            burst_rate: 100,
            burst_time: Duration::from_secs(10),
            concurrent: 25,
            retries: 3,
            retry_scope: RetryScope::default(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

/// Retry allowance for 403 responses
#[derive(Debug)]
pub struct RetryBudget {
    remaining: AtomicU32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self {
            remaining: AtomicU32::new(retries),
        }
    }

    /// Takes one retry; `false` once the budget is spent
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Runtime descriptor of an upstream service
#[derive(Debug)]
pub struct Api {
    pub config: ApiConfig,
    pub limiter: RateLimiter,
    shared_retries: RetryBudget,
}

impl Api {
    pub fn new(config: ApiConfig) -> Self {
        let limiter = RateLimiter::new(config.burst_rate, config.burst_time, config.concurrent);
        let shared_retries = RetryBudget::new(config.retries);
        Self {
            config,
            limiter,
            shared_retries,
        }
    }

    pub fn ident(&self) -> ApiIdent {
        self.config.ident
    }

    /// Resolves `url` against the endpoint; absolute URLs pass through
    pub fn url(&self, url: &str) -> String {
        let endpoint = &self.config.endpoint;
        if url.starts_with("http") {
            url.to_string()
        } else if url.starts_with('/') && endpoint.ends_with('/') {
            format!("{}{}", endpoint, &url[1..])
        } else if url.starts_with('/') || endpoint.ends_with('/') {
            format!("{}{}", endpoint, url)
        } else {
            format!("{}/{}", endpoint, url)
        }
    }

    /// Budget shared by every request to this API
    pub fn shared_retries(&self) -> &RetryBudget {
        &self.shared_retries
    }
}

/// All configured upstream services
#[derive(Debug, Default)]
pub struct ApiRegistry {
    apis: HashMap<ApiIdent, Arc<Api>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with TMDB, Trakt and Fanart at their published limits
    pub fn with_defaults() -> Self {
        Self::from_configs([ApiConfig::tmdb(), ApiConfig::trakt(), ApiConfig::fanart()])
    }

    pub fn from_configs(configs: impl IntoIterator<Item = ApiConfig>) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config);
        }
        registry
    }

    /// Parses a JSON array of [`ApiConfig`] entries
    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let configs: Vec<ApiConfig> = serde_json::from_str(json)?;
        Ok(Self::from_configs(configs))
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Adds or replaces the descriptor for `config.ident`
    pub fn register(&mut self, config: ApiConfig) -> Arc<Api> {
        let api = Arc::new(Api::new(config));
        self.apis.insert(api.ident(), api.clone());
        api
    }

    pub fn get(&self, ident: ApiIdent) -> Option<Arc<Api>> {
        self.apis.get(&ident).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Api>> {
        self.apis.values()
    }

    /// Closes every limiter
    pub fn close(&self) {
        for api in self.apis.values() {
            api.limiter.close();
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(endpoint: &str) -> Api {
        Api::new(ApiConfig {
            endpoint: endpoint.to_string(),
            ..ApiConfig::tmdb()
        })
    }

    #[test]
    fn test_url_joins_with_single_slash() {
        assert_eq!(api("https://x/3").url("movie/1"), "https://x/3/movie/1");
        assert_eq!(api("https://x/3").url("/movie/1"), "https://x/3/movie/1");
        assert_eq!(api("https://x/3/").url("movie/1"), "https://x/3/movie/1");
        assert_eq!(api("https://x/3/").url("/movie/1"), "https://x/3/movie/1");
    }

    #[test]
    fn test_absolute_url_passes_through() {
        assert_eq!(
            api("https://x/3").url("https://image.tmdb.org/t/p/w500/a.jpg"),
            "https://image.tmdb.org/t/p/w500/a.jpg"
        );
    }

    #[test]
    fn test_defaults_registered() {
        let registry = ApiRegistry::with_defaults();

        let tmdb = registry.get(ApiIdent::Tmdb).unwrap();
        assert_eq!(tmdb.config.burst_rate, 50);
        assert_eq!(tmdb.config.burst_time, Duration::from_secs(1));

        let trakt = registry.get(ApiIdent::Trakt).unwrap();
        assert_eq!(trakt.config.concurrent, 25);
        assert_eq!(trakt.config.endpoint, "https://api.trakt.tv");

        assert!(registry.get(ApiIdent::Fanart).is_some());
    }

    #[test]
    fn test_unregistered_api_is_none() {
        let registry = ApiRegistry::from_configs([ApiConfig::trakt()]);
        assert!(registry.get(ApiIdent::Tmdb).is_none());
    }

    #[test]
    fn test_ident_parsing() {
        assert_eq!("tmdb".parse::<ApiIdent>().unwrap(), ApiIdent::Tmdb);
        assert_eq!("TRAKT".parse::<ApiIdent>().unwrap(), ApiIdent::Trakt);
        assert_eq!("fanart".parse::<ApiIdent>().unwrap(), ApiIdent::Fanart);
        let err = "imdb".parse::<ApiIdent>().unwrap_err();
        assert!(err.to_string().contains("imdb"));
    }

    #[test]
    fn test_retry_budget_stops_at_zero() {
        let budget = RetryBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_retry_budget_concurrent_consumers_never_overdraw() {
        let budget = Arc::new(RetryBudget::new(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || (0..50).filter(|_| budget.try_consume()).count())
            })
            .collect();

        let taken: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(taken, 100);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_registry_from_json() {
        let json = r#"[
            {
                "ident": "tmdb",
                "endpoint": "http://localhost:8080/3",
                "burst_rate": 5,
                "burst_time_ms": 2000,
                "concurrent": 2,
                "retries": 1,
                "retry_scope": "shared"
            }
        ]"#;

        let registry = ApiRegistry::from_json(json).unwrap();
        let tmdb = registry.get(ApiIdent::Tmdb).unwrap();

        assert_eq!(tmdb.config.endpoint, "http://localhost:8080/3");
        assert_eq!(tmdb.config.burst_time, Duration::from_secs(2));
        assert_eq!(tmdb.config.retry_scope, RetryScope::Shared);
        assert_eq!(tmdb.config.retry_backoff, Duration::from_millis(500));
        assert_eq!(tmdb.shared_retries().remaining(), 1);
        assert!(registry.get(ApiIdent::Trakt).is_none());
    }

    #[test]
    fn test_close_closes_limiters() {
        let registry = ApiRegistry::with_defaults();
        registry.close();
        assert!(registry.iter().all(|api| api.limiter.is_closed()));
    }
}
