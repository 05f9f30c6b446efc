use std::fmt;

use super::{human_bytes, Tracer};

/// Trace of a single cache store action
#[derive(Debug, Clone)]
pub struct CacheTrace {
    pub tracer: Tracer,
    pub action: &'static str,
    pub key: String,
    size: u64,
}

impl CacheTrace {
    /// Starts a trace for `action` on `key`
    pub fn start(action: &'static str, key: &str) -> Self {
        Self {
            tracer: Tracer::started(),
            action,
            key: key.to_string(),
            size: 0,
        }
    }

    pub fn stage(&mut self, name: &str) {
        self.tracer.stage(name);
    }

    pub fn size(&mut self, size: usize) {
        self.size = size as u64;
    }

    pub fn reset(&mut self) {
        self.tracer.reset();
        self.size = 0;
    }
}

impl fmt::Display for CacheTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trace for action {} on key: {}", self.action, self.key)?;
        writeln!(f, "{}", self.tracer)?;
        write!(f, "{:>18}: {}", "Size", human_bytes(self.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_action_key_and_size() {
        let mut trace = CacheTrace::start("GetBytes", "tmdb.reqapi.movie");
        trace.size(2048);
        trace.stage("GetBytes");
        trace.tracer.complete();

        let rendered = trace.to_string();
        assert!(rendered.contains("GetBytes"));
        assert!(rendered.contains("tmdb.reqapi.movie"));
        assert!(rendered.contains("2.0 kB"));
    }

    #[test]
    fn test_reset_clears_size() {
        let mut trace = CacheTrace::start("Set", "key");
        trace.size(10);
        trace.reset();
        assert!(trace.to_string().contains("0 B"));
    }
}
