//! Stage timer shared by cache and request traces

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::Instant;

/// Records named timing stages between creation and completion of an operation
///
/// Every call to [`Tracer::stage`] stores the time elapsed since the previous
/// stage boundary (or since [`Tracer::create`] for the first stage).
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    created_at: Option<DateTime<Local>>,
    created: Option<Instant>,
    current: Option<Instant>,
    completed: Option<Instant>,
    stages: Vec<(String, Duration)>,
}

impl Tracer {
    /// Creates a tracer that is already started
    pub fn started() -> Self {
        let mut tracer = Self::default();
        tracer.create();
        tracer
    }

    /// Resets the tracer and starts timing
    pub fn create(&mut self) {
        self.reset();
        let now = Instant::now();
        self.created_at = Some(Local::now());
        self.created = Some(now);
        self.current = Some(now);
    }

    /// Appends a stage sample for `name` and restarts the stage clock
    pub fn stage(&mut self, name: impl Into<String>) {
        let now = Instant::now();
        let elapsed = self
            .current
            .map(|current| now.saturating_duration_since(current))
            .unwrap_or_default();
        self.stages.push((name.into(), elapsed));
        self.current = Some(now);
    }

    /// Stops timing
    pub fn complete(&mut self) {
        let now = Instant::now();
        self.completed = Some(now);
        self.current = Some(now);
    }

    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }

    /// Clears all stages and timestamps
    pub fn reset(&mut self) {
        self.created_at = None;
        self.created = None;
        self.current = None;
        self.completed = None;
        self.stages.clear();
    }

    /// Recorded stages in order
    pub fn stages(&self) -> &[(String, Duration)] {
        &self.stages
    }

    /// Total time between creation and completion, or until now if still running
    pub fn elapsed(&self) -> Duration {
        match self.created {
            Some(created) => self
                .completed
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(created),
            None => Duration::ZERO,
        }
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let created = self
            .created_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        writeln!(f, "{:>18}: {}", "Created", created)?;
        for (name, elapsed) in &self.stages {
            writeln!(f, "{:>18}: {:?}", name, elapsed)?;
        }
        write!(f, "{:>18}: {:?}", "Complete", self.elapsed())
    }
}

/// Formats a byte count the way traces report payload sizes
pub fn human_bytes(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

    if size < 1000 {
        return format!("{} B", size);
    }

    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
