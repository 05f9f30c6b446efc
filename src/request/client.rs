use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;

use super::{CacheEntry, Prepared, Request, RequestError, RequestTrace, Response};
use crate::api::{Api, ApiRegistry, RetryBudget, RetryScope};
use crate::cache::{CacheError, CacheStore, CACHE_EXPIRE_MEDIUM};
use crate::locker::{KeyGuard, KeyLocker};
use crate::transport::Transport;

/// Result of the network phase
enum Outcome {
    Success(Response),
    Failed {
        error: RequestError,
        response: Option<Response>,
    },
}

impl Outcome {
    fn failed(error: RequestError) -> Self {
        Outcome::Failed {
            error,
            response: None,
        }
    }
}

enum CacheLookup {
    Fresh(Response),
    Stale(Response),
}

/// Restores the outcome of a cached response and decodes it
fn decode_response<T, F>(response: Response, decode: &F) -> Result<(Response, T), RequestError>
where
    F: Fn(&Response) -> Result<T, RequestError>,
{
    let response = response.into_result()?;
    let value = decode(&response)?;
    Ok((response, value))
}

/// Runs requests against the registered APIs
///
/// All collaborators are injected so several clients can share one cache store
/// or one registry. Cloning is cheap; clones share the lock registry and the
/// pending cache writes.
#[derive(Clone)]
pub struct Client {
    registry: Arc<ApiRegistry>,
    cache: Arc<CacheStore>,
    locker: KeyLocker,
    transport: Arc<dyn Transport>,
    writes: Arc<Mutex<JoinSet<()>>>,
    request_tracing: bool,
}

impl Client {
    pub fn new(
        registry: Arc<ApiRegistry>,
        cache: Arc<CacheStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            registry,
            cache,
            locker: KeyLocker::new(),
            transport,
            writes: Arc::new(Mutex::new(JoinSet::new())),
            request_tracing: false,
        }
    }

    /// Logs a full trace of every request at debug level
    pub fn with_request_tracing(mut self, enabled: bool) -> Self {
        self.request_tracing = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<ApiRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn locker(&self) -> &KeyLocker {
        &self.locker
    }

    /// Closes every API limiter, waits for pending cache writes, then closes
    /// the cache store
    ///
    /// Requests already past admission finish; new ones fail with
    /// [`RequestError::Shutdown`] or skip the cache.
    pub async fn shutdown(&self) {
        self.registry.close();

        loop {
            let mut pending = std::mem::take(&mut *self.writes.lock());
            if pending.is_empty() {
                break;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(err) = joined {
                    warn!("Cache write task failed: {}", err);
                }
            }
        }

        self.cache.close();
    }

    /// Runs `request` and deserializes the JSON body
    ///
    /// Bodies that do not decode into `T` are not cached, and a cached body
    /// that does not decode counts as a miss.
    pub async fn fetch<T: DeserializeOwned>(&self, request: Request) -> Result<T, RequestError> {
        self.run(request, |response: &Response| response.json::<T>())
            .await
            .map(|(_, value)| value)
    }

    /// Runs `request` and returns the raw response
    pub async fn execute(&self, request: Request) -> Result<Response, RequestError> {
        self.run(request, |_: &Response| Ok(()))
            .await
            .map(|(response, ())| response)
    }

    async fn run<T, F>(&self, request: Request, decode: F) -> Result<(Response, T), RequestError>
    where
        F: Fn(&Response) -> Result<T, RequestError>,
    {
        let mut trace = RequestTrace::start(&request);

        let Some(api) = self.registry.get(request.api) else {
            let err = RequestError::ApiNotConfigured(request.api);
            trace.error(&err);
            self.log_trace(trace);
            return Err(err);
        };

        let prepared = request.prepare(&api);
        trace.prepared(&prepared);
        trace.stage("Prepare");

        // Identical requests wait here; when caching is on, the holder only
        // releases the key after its cache write.
        let guard = self.locker.lock(prepared.key.clone()).await;
        trace.stage("Lock");

        let mut stale = None;
        if request.cache && !request.force_refresh {
            let lookup = self.read_cache(&prepared.key, request.stale_fallback).await;
            trace.stage("CacheRead");

            match lookup {
                Ok(CacheLookup::Fresh(response)) => {
                    trace.response(&response);
                    match decode_response(response, &decode) {
                        Err(RequestError::Decoding(err)) => {
                            debug!("Cached body for {} does not decode: {}", prepared.key, err)
                        }
                        result => {
                            if let Err(err) = &result {
                                trace.error(err);
                            }
                            guard.unlock();
                            self.log_trace(trace);
                            return result;
                        }
                    }
                }
                Ok(CacheLookup::Stale(response)) => stale = Some(response),
                Err(err) => debug!("Cache miss for {}: {}", prepared.key, err),
            }
        }

        let outcome = match request.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.send(&api, &request, &prepared, &mut trace))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("Request for {} on {} timed out", request.description, prepared.http.url);
                        Outcome::failed(RequestError::Timeout(limit))
                    }
                }
            }
            None => self.send(&api, &request, &prepared, &mut trace).await,
        };
        trace.stage("Response");

        // Only successes that decode and not-found answers are cached
        let mut entry = None;
        let result = match outcome {
            Outcome::Success(response) => {
                let decoded = decode(&response);
                if decoded.is_ok() && request.cache {
                    entry = Some(CacheEntry::from(&response));
                }
                decoded.map(|value| (response, value))
            }
            Outcome::Failed { error, response } => {
                if let (RequestError::NotFound, Some(response)) = (&error, &response) {
                    if request.cache {
                        entry = Some(CacheEntry::from(response));
                    }
                }
                Err(error)
            }
        };

        let result = match (result, stale) {
            (Err(error), Some(stale)) if !matches!(error, RequestError::NotFound) => {
                match decode_response(stale, &decode) {
                    Ok(served) => {
                        warn!(
                            "Serving stale cache for {} on {} after: {}",
                            request.description, prepared.http.url, error
                        );
                        Ok(served)
                    }
                    Err(RequestError::NotFound) => {
                        warn!(
                            "Stale cache for {} on {} is not found, after: {}",
                            request.description, prepared.http.url, error
                        );
                        Err(RequestError::NotFound)
                    }
                    Err(_) => Err(error),
                }
            }
            (result, _) => result,
        };
        if let Err(err) = &result {
            trace.error(err);
        }

        match entry {
            Some(entry) => {
                let ttl = request.cache_ttl.unwrap_or(CACHE_EXPIRE_MEDIUM);
                self.write_cache_then_unlock(guard, entry, ttl, trace);
            }
            None => {
                guard.unlock();
                self.log_trace(trace);
            }
        }

        result
    }

    async fn read_cache(&self, key: &str, allow_stale: bool) -> Result<CacheLookup, CacheError> {
        if allow_stale {
            let cached = self.cache.get_allow_stale::<CacheEntry>(key).await?;
            let response = Response::from_cache(cached.data, cached.is_expired);
            return Ok(if cached.is_expired {
                CacheLookup::Stale(response)
            } else {
                CacheLookup::Fresh(response)
            });
        }

        let entry = self.cache.get::<CacheEntry>(key).await?;
        Ok(CacheLookup::Fresh(Response::from_cache(entry, false)))
    }

    /// Calls upstream until a final answer, retrying 403 while budget remains
    async fn send(
        &self,
        api: &Api,
        request: &Request,
        prepared: &Prepared,
        trace: &mut RequestTrace,
    ) -> Outcome {
        let local = RetryBudget::new(api.config.retries);
        let retries = match api.config.retry_scope {
            RetryScope::PerRequest => &local,
            RetryScope::Shared => api.shared_retries(),
        };
        let mut backoff = api.config.retry_backoff;
        let url = &prepared.http.url;
        let params = &prepared.http.params;

        loop {
            let sent = api
                .limiter
                .call(|| self.transport.send(&prepared.http))
                .await;
            trace.stage("Request");

            let response = match sent {
                Err(_) => return Outcome::failed(RequestError::Shutdown),
                Ok(Err(err)) => {
                    error!(
                        "Failed to make request to {} for {} with {:?}: {}",
                        url, request.description, params, err
                    );
                    return Outcome::failed(RequestError::Transport(err));
                }
                Ok(Ok(response)) => Response::from(response),
            };
            trace.response(&response);

            match response.status {
                429 => {
                    warn!(
                        "Rate limit exceeded getting {} with {:?} on {}, cooling down...",
                        request.description, params, url
                    );
                    api.limiter.cool_down(&response.headers);
                    return Outcome::Failed {
                        error: RequestError::RateLimited,
                        response: Some(response),
                    };
                }
                404 => {
                    warn!(
                        "Not found getting {} with {:?} on {}: {}",
                        request.description, params, url, response.status_text
                    );
                    return Outcome::Failed {
                        error: RequestError::NotFound,
                        response: Some(response),
                    };
                }
                403 if retries.try_consume() => {
                    warn!(
                        "Not authorized to get {} with {:?} on {}, having {} retries left ...",
                        request.description,
                        params,
                        url,
                        retries.remaining()
                    );
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                    trace.stage("Retry");
                }
                403 => {
                    error!(
                        "Not authorized to get {} with {:?} on {}, no retries left",
                        request.description, params, url
                    );
                    return Outcome::Failed {
                        error: RequestError::Unauthorized,
                        response: Some(response),
                    };
                }
                status if !(200..300).contains(&status) => {
                    error!(
                        "Bad status getting {} with {:?} on {}: {}",
                        request.description, params, url, response.status_text
                    );
                    return Outcome::Failed {
                        error: RequestError::Http(status),
                        response: Some(response),
                    };
                }
                _ => return Outcome::Success(response),
            }
        }
    }

    /// Writes the cache entry, then releases the key
    ///
    /// Runs as its own task so the caller gets its result right away, while
    /// waiters on the key stay blocked until the entry is readable. The task is
    /// tracked until [`Client::shutdown`] joins it; dropping the last clone of
    /// the client aborts writes still pending.
    fn write_cache_then_unlock(
        &self,
        guard: KeyGuard,
        entry: CacheEntry,
        ttl: Duration,
        mut trace: RequestTrace,
    ) {
        let cache = self.cache.clone();
        let request_tracing = self.request_tracing;

        let mut writes = self.writes.lock();
        while writes.try_join_next().is_some() {}
        writes.spawn(async move {
            if let Err(err) = cache.set(guard.key(), &entry, ttl).await {
                debug!("Cache write skipped for {}: {}", guard.key(), err);
            }
            trace.stage("CacheWrite");
            guard.unlock();

            if request_tracing {
                trace.tracer.complete();
                debug!("{}", trace);
            }
        });
    }

    fn log_trace(&self, mut trace: RequestTrace) {
        if self.request_tracing {
            trace.tracer.complete();
            debug!("{}", trace);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("request_tracing", &self.request_tracing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiConfig, ApiIdent};
    use crate::cache::{KvEngine, MemoryEngine};
    use crate::config::CacheSettings;
    use crate::transport::{Headers, HttpRequest, HttpResponse, TransportError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedTransport {
        status: u16,
        body: &'static str,
        calls: AtomicUsize,
    }

    impl FixedTransport {
        fn new(status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: self.status,
                status_text: self.status.to_string(),
                headers: Headers::new(),
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    fn client_with(transport: Arc<FixedTransport>) -> (Client, Arc<MemoryEngine>) {
        let engine = Arc::new(MemoryEngine::new());
        let cache = Arc::new(CacheStore::new(engine.clone(), CacheSettings::default()));
        let registry = Arc::new(ApiRegistry::from_configs([ApiConfig {
            endpoint: "http://upstream.test/3".to_string(),
            retry_backoff: Duration::ZERO,
            ..ApiConfig::tmdb()
        }]));
        (Client::new(registry, cache, transport), engine)
    }

    async fn seed_expired(client: &Client, engine: &MemoryEngine, request: &Request, body: &str) {
        seed_expired_status(client, engine, request, 200, body).await
    }

    async fn seed_expired_status(
        client: &Client,
        engine: &MemoryEngine,
        request: &Request,
        status: u16,
        body: &str,
    ) {
        let api = client.registry().get(request.api).unwrap();
        let key = request.key(&api);
        let entry = serde_json::json!({
            "key": key,
            "value": {
                "header": {},
                "body": body.as_bytes(),
                "status": status.to_string(),
                "statuscode": status
            }
        });
        let mut record = format!("{:010}", Utc::now().timestamp() - 60).into_bytes();
        record.extend_from_slice(&serde_json::to_vec(&entry).unwrap());
        engine.set(&key, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_entry_served_when_refresh_fails() {
        let transport = FixedTransport::new(503, "unavailable");
        let (client, engine) = client_with(transport.clone());
        let request = Request::new(ApiIdent::Tmdb, "movie/550")
            .cached_default()
            .stale_fallback();
        seed_expired(&client, &engine, &request, "old body").await;

        let response = client.execute(request).await.unwrap();

        assert_eq!(transport.calls(), 1);
        assert!(response.stale);
        assert!(response.from_cache);
        assert_eq!(response.text(), "old body");
    }

    #[tokio::test]
    async fn test_stale_not_found_entry_stays_not_found() {
        let transport = FixedTransport::new(503, "unavailable");
        let (client, engine) = client_with(transport.clone());
        let request = Request::new(ApiIdent::Tmdb, "movie/0")
            .cached_default()
            .stale_fallback();
        seed_expired_status(&client, &engine, &request, 404, "").await;

        let result = client.execute(request).await;

        assert!(matches!(result, Err(RequestError::NotFound)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_that_does_not_decode_keeps_refresh_error() {
        let transport = FixedTransport::new(503, "unavailable");
        let (client, engine) = client_with(transport.clone());
        let request = Request::new(ApiIdent::Tmdb, "movie/550")
            .cached_default()
            .stale_fallback();
        seed_expired(&client, &engine, &request, "<html>").await;

        let result = client.fetch::<serde_json::Value>(request).await;

        assert!(matches!(result, Err(RequestError::Http(503))));
    }

    #[tokio::test]
    async fn test_stale_entry_replaced_when_refresh_succeeds() {
        let transport = FixedTransport::new(200, "new body");
        let (client, engine) = client_with(transport.clone());
        let request = Request::new(ApiIdent::Tmdb, "movie/550")
            .cached_default()
            .stale_fallback();
        seed_expired(&client, &engine, &request, "old body").await;

        let first = client.execute(request.clone()).await.unwrap();
        let second = client.execute(request).await.unwrap();

        assert_eq!(first.text(), "new body");
        assert!(!first.stale);
        assert!(second.from_cache);
        assert_eq!(second.text(), "new body");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_without_fallback_is_refetched() {
        let transport = FixedTransport::new(503, "unavailable");
        let (client, engine) = client_with(transport.clone());
        let request = Request::new(ApiIdent::Tmdb, "movie/550").cached_default();
        seed_expired(&client, &engine, &request, "old body").await;

        let result = client.execute(request).await;

        assert!(matches!(result, Err(RequestError::Http(503))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_skips_cache_read() {
        let transport = FixedTransport::new(200, "{}");
        let (client, _engine) = client_with(transport.clone());
        let request = Request::new(ApiIdent::Tmdb, "movie/550").cached_default();

        client.execute(request.clone()).await.unwrap();
        client.execute(request.clone()).await.unwrap();
        client.execute(request.force_refresh()).await.unwrap();

        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_api_is_reported() {
        let transport = FixedTransport::new(200, "{}");
        let (client, _engine) = client_with(transport.clone());

        let result = client.execute(Request::new(ApiIdent::Trakt, "movies/trending")).await;

        assert!(matches!(result, Err(RequestError::ApiNotConfigured(ApiIdent::Trakt))));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_requests() {
        let transport = FixedTransport::new(200, "{}");
        let (client, _engine) = client_with(transport.clone());

        client.shutdown().await;
        let result = client.execute(Request::new(ApiIdent::Tmdb, "movie/550")).await;

        assert!(matches!(result, Err(RequestError::Shutdown)));
        assert!(client.cache().is_closed());
        assert!(client.locker().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_pending_cache_write() {
        let transport = FixedTransport::new(200, "{}");
        let (client, engine) = client_with(transport.clone());
        let request = Request::new(ApiIdent::Tmdb, "movie/550").cached_default();
        let key = request.key(&client.registry().get(ApiIdent::Tmdb).unwrap());

        client.execute(request).await.unwrap();
        client.shutdown().await;

        assert!(engine.contains_key(&key));
        assert!(client.cache().is_closed());
        assert!(client.locker().is_empty());
    }
}
