use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use maestro_core::config::RateLimitConfig;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after: Duration,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }
}

/// Sliding-window limiter: at most `max_calls` admissions per identifier in
/// any trailing `window`.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_calls: usize,
    window: Duration,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_calls,
            window,
            enabled: true,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(config.max_calls, Duration::from_secs(config.window_secs))
        }
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            ..Self::new(usize::MAX, Duration::ZERO)
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check and, when allowed, record one call for `identifier`.
    pub fn admit(&self, identifier: &str) -> Admission {
        if !self.enabled {
            return Admission::allowed();
        }
        let now = Instant::now();
        let mut windows = self.lock();
        let timestamps = windows.entry(identifier.to_string()).or_default();
        Self::prune(timestamps, now, self.window);

        if timestamps.len() >= self.max_calls {
            let retry_after = timestamps
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            debug!(identifier, calls = timestamps.len(), ?retry_after, "Rate limit hit");
            return Admission {
                allowed: false,
                retry_after,
            };
        }

        timestamps.push_back(now);
        Admission::allowed()
    }

    /// Calls recorded for `identifier` in the current window.
    pub fn current_calls(&self, identifier: &str) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        match windows.get_mut(identifier) {
            Some(timestamps) => {
                Self::prune(timestamps, now, self.window);
                timestamps.len()
            }
            None => 0,
        }
    }

    pub fn reset(&self, identifier: &str) {
        self.lock().remove(identifier);
    }

    /// Drop identifiers with no calls left in their window. Returns how many
    /// were dropped.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, timestamps| {
            Self::prune(timestamps, now, window);
            !timestamps.is_empty()
        });
        before - windows.len()
    }
}
