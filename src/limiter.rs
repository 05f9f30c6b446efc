//! Outbound call limiter for one upstream service
//!
//! Three independent gates apply to every call:
//! - at most `concurrent` calls in flight,
//! - at most `burst_rate` calls admitted within any rolling `burst_time` window,
//! - no admissions at all while a server-requested cooldown is active.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, Instant};

use crate::transport::Headers;

/// Cooldown applied when the server doesn't say how long to wait
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(30);

/// Header carrying the server's retry hint, in seconds
const RETRY_AFTER: &str = "retry-after";

/// Returned when calling through a limiter that has been closed
#[derive(Debug, Error)]
#[error("Rate limiter is closed")]
pub struct LimiterClosed;

#[derive(Debug, Default)]
struct LimiterState {
    /// Admission times inside the current window, oldest first
    calls: VecDeque<Instant>,
    cool_down_until: Option<Instant>,
}

/// Burst-window rate limiter with a concurrency cap and cooldown override
#[derive(Debug)]
pub struct RateLimiter {
    burst_rate: usize,
    burst_time: Duration,
    slots: Semaphore,
    state: Mutex<LimiterState>,
    default_cool_down: Duration,
}

impl RateLimiter {
    /// Creates a limiter allowing `burst_rate` calls per `burst_time`, with at
    /// most `concurrent` calls running at once
    ///
    /// A `burst_rate` of zero disables window accounting.
    pub fn new(burst_rate: usize, burst_time: Duration, concurrent: usize) -> Self {
        Self {
            burst_rate,
            burst_time,
            slots: Semaphore::new(concurrent.max(1)),
            state: Mutex::new(LimiterState::default()),
            default_cool_down: DEFAULT_COOL_DOWN,
        }
    }

    /// Overrides the cooldown used when no retry hint is available
    pub fn with_default_cool_down(mut self, cool_down: Duration) -> Self {
        self.default_cool_down = cool_down;
        self
    }

    /// Waits for admission, then runs `f`
    ///
    /// The concurrency slot is held until `f` completes.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, LimiterClosed>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.slots.acquire().await.map_err(|_| LimiterClosed)?;
        self.admit().await;
        Ok(f().await)
    }

    async fn admit(&self) {
        loop {
            match self.try_admit(Instant::now()) {
                None => return,
                Some(deadline) => sleep_until(deadline).await,
            }
        }
    }

    /// Records an admission at `now`, or returns the instant to retry at
    fn try_admit(&self, now: Instant) -> Option<Instant> {
        let mut state = self.state.lock();

        if let Some(until) = state.cool_down_until {
            if until > now {
                return Some(until);
            }
            state.cool_down_until = None;
        }

        if self.burst_rate == 0 {
            return None;
        }

        while let Some(&oldest) = state.calls.front() {
            if now.saturating_duration_since(oldest) >= self.burst_time {
                state.calls.pop_front();
            } else {
                break;
            }
        }

        if state.calls.len() < self.burst_rate {
            state.calls.push_back(now);
            return None;
        }

        state.calls.front().map(|&oldest| oldest + self.burst_time)
    }

    /// Blocks all admissions for the period the server asked for
    ///
    /// Reads `Retry-After` as whole seconds and falls back to the default
    /// cooldown when the header is missing or unparsable. An already pending
    /// longer cooldown is kept.
    pub fn cool_down(&self, headers: &Headers) {
        let hint = headers
            .get(RETRY_AFTER)
            .and_then(|values| values.first())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let delay = match hint {
            Some(delay) => delay,
            None => {
                debug!(
                    "No usable retry hint, cooling down for {:?}",
                    self.default_cool_down
                );
                self.default_cool_down
            }
        };

        self.cool_down_for(delay);
    }

    /// Blocks all admissions for `delay`
    pub fn cool_down_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut state = self.state.lock();
        if state.cool_down_until.map_or(true, |current| current < until) {
            warn!("Cooling down for {:?}", delay);
            state.cool_down_until = Some(until);
        }
    }

    /// Remaining cooldown, if one is active
    pub fn cooling_down(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .cool_down_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Free concurrency slots
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Refuses all further calls; calls already admitted finish normally
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}
