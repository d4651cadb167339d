use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use maestro_core::types::HandlerId;

/// Per-handler request counters for one orchestrator.
///
/// Cache hits are counted separately and take part in the overall totals.
pub struct RequestMetrics {
    state: Mutex<MetricsState>,
}

struct MetricsState {
    started_at: Instant,
    handlers: BTreeMap<HandlerId, HandlerCounters>,
    cache_hits: u64,
}

#[derive(Default)]
struct HandlerCounters {
    requests: u64,
    errors: u64,
    total_duration: Duration,
    last_called: Option<DateTime<Utc>>,
}

/// Point-in-time view of `RequestMetrics`. Rates are percentages.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub cache_hits: u64,
    pub handlers: BTreeMap<String, HandlerMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerMetrics {
    pub requests: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
    pub last_called: Option<DateTime<Utc>>,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MetricsState {
                started_at: Instant::now(),
                handlers: BTreeMap::new(),
                cache_hits: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one finished run against the handler that answered it.
    pub fn record(&self, handler: &HandlerId, elapsed: Duration, success: bool) {
        let mut state = self.lock();
        let counters = state.handlers.entry(handler.clone()).or_default();
        counters.requests += 1;
        counters.total_duration += elapsed;
        counters.last_called = Some(Utc::now());
        if !success {
            counters.errors += 1;
        }
    }

    pub fn record_cache_hit(&self) {
        self.lock().cache_hits += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let handlers: BTreeMap<String, HandlerMetrics> = state
            .handlers
            .iter()
            .map(|(id, c)| {
                let avg_duration_ms = if c.requests == 0 {
                    0.0
                } else {
                    c.total_duration.as_secs_f64() * 1000.0 / c.requests as f64
                };
                let metrics = HandlerMetrics {
                    requests: c.requests,
                    errors: c.errors,
                    avg_duration_ms,
                    error_rate: percent(c.errors, c.requests),
                    last_called: c.last_called,
                };
                (id.to_string(), metrics)
            })
            .collect();

        let handled: u64 = handlers.values().map(|h| h.requests).sum();
        let total_errors: u64 = handlers.values().map(|h| h.errors).sum();
        let total_requests = handled + state.cache_hits;

        MetricsSnapshot {
            uptime_secs: state.started_at.elapsed().as_secs_f64(),
            total_requests,
            total_errors,
            error_rate: percent(total_errors, total_requests),
            cache_hits: state.cache_hits,
            handlers,
        }
    }

    /// Zero every counter and restart the uptime clock.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.started_at = Instant::now();
        state.handlers.clear();
        state.cache_hits = 0;
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let snapshot = RequestMetrics::new().snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert!(snapshot.handlers.is_empty());
    }

    #[test]
    fn test_per_handler_counts_and_rates() {
        let metrics = RequestMetrics::new();
        let chat = HandlerId::new("chat");
        metrics.record(&chat, Duration::from_millis(100), true);
        metrics.record(&chat, Duration::from_millis(300), false);
        metrics.record(&HandlerId::new("grading"), Duration::from_millis(50), true);
        metrics.record_cache_hit();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.error_rate, 25.0);

        let chat = &snapshot.handlers["chat"];
        assert_eq!(chat.requests, 2);
        assert_eq!(chat.errors, 1);
        assert_eq!(chat.error_rate, 50.0);
        assert!((chat.avg_duration_ms - 200.0).abs() < 1e-6);
        assert!(chat.last_called.is_some());
        assert_eq!(snapshot.handlers["grading"].errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_and_reset() {
        let metrics = RequestMetrics::new();
        metrics.record(&HandlerId::new("chat"), Duration::from_millis(10), true);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(metrics.snapshot().uptime_secs >= 30.0);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.uptime_secs < 1.0);
    }
}
