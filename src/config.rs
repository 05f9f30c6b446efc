//! Runtime switches shared by the cache store and the request client

use std::path::PathBuf;

use serde::Deserialize;

/// Global cache switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Disables both reads and writes
    pub disabled: bool,
    /// Disables reads only
    pub disable_get: bool,
    /// Disables writes only
    pub disable_set: bool,
    /// Logs a trace for every cache action
    pub tracing: bool,
}

impl CacheSettings {
    pub fn reads_enabled(&self) -> bool {
        !(self.disabled || self.disable_get)
    }

    pub fn writes_enabled(&self) -> bool {
        !(self.disabled || self.disable_set)
    }
}

/// Process-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    /// Logs a full trace for every request
    pub request_tracing: bool,
    /// Proxy for all outbound calls
    pub proxy_url: Option<String>,
    /// Cache directory; the XDG cache dir when unset
    pub cache_dir: Option<PathBuf>,
    /// JSON file replacing the built-in API registry
    pub registry: Option<PathBuf>,
}
