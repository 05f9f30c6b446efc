use std::time::Duration;

use thiserror::Error;

use crate::api::ApiIdent;
use crate::transport::TransportError;

/// Errors returned to callers of the request client
#[derive(Debug, Error)]
pub enum RequestError {
    /// No descriptor registered for the API
    #[error("API not configured: {0}")]
    ApiNotConfigured(ApiIdent),

    /// The request never got a response
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Upstream answered 429; the API is cooling down
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Upstream answered 404, possibly from cache
    #[error("Resource not found")]
    NotFound,

    /// Upstream kept answering 403 until the retry budget ran out
    #[error("Not authorized")]
    Unauthorized,

    /// Any other non-2xx status
    #[error("Bad HTTP status: {0}")]
    Http(u16),

    /// Request body could not be serialized
    #[error("Can't encode request body: {0}")]
    Encoding(String),

    /// Body could not be deserialized into the requested type
    #[error("Can't decode response: {0}")]
    Decoding(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The client or the API's limiter was shut down
    #[error("Client is shut down")]
    Shutdown,
}

impl RequestError {
    /// Whether a later identical request could reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RequestError::Transport(_) | RequestError::RateLimited | RequestError::Timeout(_)
        ) || matches!(self, RequestError::Http(status) if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RequestError::RateLimited.is_transient());
        assert!(RequestError::Http(503).is_transient());
        assert!(RequestError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!RequestError::Http(400).is_transient());
        assert!(!RequestError::NotFound.is_transient());
        assert!(!RequestError::Unauthorized.is_transient());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            RequestError::ApiNotConfigured(ApiIdent::Fanart).to_string(),
            "API not configured: fanart"
        );
        assert_eq!(RequestError::Http(502).to_string(), "Bad HTTP status: 502");
    }
}
