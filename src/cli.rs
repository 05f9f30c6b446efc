//! Command-line interface parsing for metafetch
//!
//! Global flags map onto [`Settings`]; the positional API and paths plus the
//! per-request options map onto one [`Request`] per path.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use reqwest::Method;
use thiserror::Error;

use crate::api::ApiIdent;
use crate::config::{CacheSettings, Settings};
use crate::request::Request;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The API name is not one of the known services
    #[error("Invalid API: '{0}'. Valid APIs: tmdb, trakt, fanart")]
    InvalidApi(String),

    /// A `-p` argument without `=`
    #[error("Invalid parameter: '{0}'. Expected key=value")]
    InvalidParam(String),

    /// A `-H` argument without `:`
    #[error("Invalid header: '{0}'. Expected name:value")]
    InvalidHeader(String),

    #[error("Invalid HTTP method: '{0}'")]
    InvalidMethod(String),
}

/// metafetch - Coalesced, cached and rate-limited metadata API requests
#[derive(Parser, Debug)]
#[command(name = "metafetch")]
#[command(about = "Fetch TMDB, Trakt and Fanart metadata through a shared cache")]
#[command(version)]
pub struct Cli {
    /// Upstream service: tmdb, trakt or fanart
    #[arg(value_name = "API")]
    pub api: String,

    /// Paths relative to the API endpoint, or absolute URLs
    ///
    /// Examples:
    ///   metafetch tmdb movie/550 -p api_key=KEY
    ///   metafetch trakt movies/trending -H trakt-api-version:2
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<String>,

    /// Query parameter, repeatable
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Request header, repeatable
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
    pub headers: Vec<String>,

    /// Request body; the method defaults to POST when set
    #[arg(long, value_name = "BODY")]
    pub data: Option<String>,

    #[arg(long, value_name = "METHOD")]
    pub method: Option<String>,

    /// Neither read nor write the cache for this request
    #[arg(long)]
    pub no_cache: bool,

    /// Skip the cache read but store the fresh result
    #[arg(long)]
    pub refresh: bool,

    /// Cache lifetime in seconds; 0 never expires
    #[arg(long, value_name = "SECS")]
    pub ttl: Option<u64>,

    /// Serve an expired cache entry when upstream fails
    #[arg(long)]
    pub stale_fallback: bool,

    /// Give up on the network phase after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Label used in logs and traces
    #[arg(long, value_name = "TEXT")]
    pub description: Option<String>,

    /// Disable cache reads and writes
    #[arg(long)]
    pub disable_cache: bool,

    #[arg(long)]
    pub disable_cache_get: bool,

    #[arg(long)]
    pub disable_cache_set: bool,

    /// Log a trace for every cache action (debug level)
    #[arg(long)]
    pub enable_cache_tracing: bool,

    /// Log a trace for every request (debug level)
    #[arg(long)]
    pub enable_request_tracing: bool,

    /// Proxy for all outbound requests
    #[arg(long, value_name = "URL")]
    pub proxy_url: Option<String>,

    /// Cache directory, defaults to the XDG cache dir
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// JSON file replacing the built-in API registry
    #[arg(long, value_name = "FILE")]
    pub registry: Option<PathBuf>,
}

/// Parses an API name argument
pub fn parse_api_arg(s: &str) -> Result<ApiIdent, CliError> {
    ApiIdent::from_str(s).map_err(|_| CliError::InvalidApi(s.to_string()))
}

/// Parses `key=value`; the value may itself contain `=`
pub fn parse_param(s: &str) -> Result<(String, String), CliError> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(CliError::InvalidParam(s.to_string())),
    }
}

/// Parses `name:value`, trimming whitespace around the value
pub fn parse_header(s: &str) -> Result<(String, String), CliError> {
    match s.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(CliError::InvalidHeader(s.to_string())),
    }
}

pub fn parse_method(s: &str) -> Result<Method, CliError> {
    Method::from_bytes(s.to_ascii_uppercase().as_bytes())
        .map_err(|_| CliError::InvalidMethod(s.to_string()))
}

impl Cli {
    /// Process-wide settings from the global flags
    pub fn settings(&self) -> Settings {
        Settings {
            cache: CacheSettings {
                disabled: self.disable_cache,
                disable_get: self.disable_cache_get,
                disable_set: self.disable_cache_set,
                tracing: self.enable_cache_tracing,
            },
            request_tracing: self.enable_request_tracing,
            proxy_url: self.proxy_url.clone(),
            cache_dir: self.cache_dir.clone(),
            registry: self.registry.clone(),
        }
    }

    /// One request per path, all sharing the per-request options
    pub fn requests(&self) -> Result<Vec<Request>, CliError> {
        let api = parse_api_arg(&self.api)?;
        let params = self
            .params
            .iter()
            .map(|p| parse_param(p))
            .collect::<Result<Vec<_>, _>>()?;
        let headers = self
            .headers
            .iter()
            .map(|h| parse_header(h))
            .collect::<Result<Vec<_>, _>>()?;
        let method = self.method.as_deref().map(parse_method).transpose()?;

        let requests = self
            .paths
            .iter()
            .map(|path| {
                let mut request = Request::new(api, path.as_str());
                for (key, value) in &params {
                    request = request.param(key.as_str(), value.as_str());
                }
                for (name, value) in &headers {
                    request = request.header(name, value.as_str());
                }
                if let Some(data) = &self.data {
                    request = request.payload(data.as_bytes().to_vec());
                }
                if let Some(method) = &method {
                    request = request.method(method.clone());
                }
                if !self.no_cache {
                    request = match self.ttl {
                        Some(secs) => request.cached(Duration::from_secs(secs)),
                        None => request.cached_default(),
                    };
                }
                if self.refresh {
                    request = request.force_refresh();
                }
                if self.stale_fallback {
                    request = request.stale_fallback();
                }
                if let Some(secs) = self.timeout {
                    request = request.timeout(Duration::from_secs(secs));
                }
                if let Some(description) = &self.description {
                    request = request.description(description.as_str());
                }
                request
            })
            .collect();

        Ok(requests)
    }
}
