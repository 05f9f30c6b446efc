use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::RequestError;
use crate::transport::{Headers, HttpResponse};

/// Response returned by the request client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Served from the cache without a network call
    pub from_cache: bool,
    /// Served from an expired cache entry because the refresh failed
    pub stale: bool,
}

impl Response {
    /// Deserializes the JSON body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_slice(&self.body).map_err(|e| RequestError::Decoding(e.to_string()))
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub(crate) fn from_cache(entry: CacheEntry, stale: bool) -> Self {
        Self {
            status: entry.status_code,
            status_text: entry.status,
            headers: entry.header,
            body: entry.body,
            from_cache: true,
            stale,
        }
    }

    /// Turns a cached response back into the outcome it had when fetched
    pub(crate) fn into_result(self) -> Result<Response, RequestError> {
        match self.status {
            404 => Err(RequestError::NotFound),
            _ => Ok(self),
        }
    }
}

impl From<HttpResponse> for Response {
    fn from(response: HttpResponse) -> Self {
        Self {
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body: response.body,
            from_cache: false,
            stale: false,
        }
    }
}

/// Cached form of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub header: Headers,
    pub body: Vec<u8>,
    pub status: String,
    #[serde(rename = "statuscode")]
    pub status_code: u16,
}

impl From<&Response> for CacheEntry {
    fn from(response: &Response) -> Self {
        Self {
            header: response.headers.clone(),
            body: response.body.clone(),
            status: response.status_text.clone(),
            status_code: response.status,
        }
    }
}
