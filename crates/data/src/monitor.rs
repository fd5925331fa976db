//! Query performance tracking.
//!
//! Records store query durations, cache hits, and query errors in a bounded
//! ring buffer and rolls them up into a [`PerformanceSummary`].
//!
//! Cache hits are recorded with a duration of 0 and errors with -1; both are
//! excluded from the average. The hit rate is computed over cacheable lookups
//! (hits plus completed store queries); errors are reported separately.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MonitorConfig;

/// Duration recorded for a cache hit.
pub const CACHE_HIT_DURATION_MS: i64 = 0;

/// Duration recorded for a failed query.
pub const ERROR_DURATION_MS: i64 = -1;

/// Number of entries in [`PerformanceSummary::slow_queries`].
const SLOW_QUERY_LIST_LEN: usize = 10;

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetric {
    pub query_name: String,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
    pub cache_hit: bool,
    pub error: Option<String>,
}

impl QueryMetric {
    /// A completed store query (not a cache hit, not an error).
    #[must_use]
    pub const fn is_completed_query(&self) -> bool {
        !self.cache_hit && self.error.is_none()
    }
}

/// A query listed in [`PerformanceSummary::slow_queries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQuery {
    pub query_name: String,
    pub duration_ms: i64,
}

/// Rolled-up view of the recorded metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    /// Events in the buffer (queries, hits, and errors).
    pub total_events: usize,
    pub completed_queries: usize,
    pub cache_hits: usize,
    pub errors: usize,
    /// Mean duration of completed queries, 0 if there are none.
    pub average_duration_ms: f64,
    /// Up to 10 slowest queries above the slow threshold, slowest first.
    pub slow_queries: Vec<SlowQuery>,
    /// Cache hits as a percentage of hits plus completed queries.
    pub cache_hit_rate: f64,
}

/// Bounded recorder of query metrics.
#[derive(Debug)]
pub struct PerformanceMonitor {
    metrics: Mutex<VecDeque<QueryMetric>>,
    capacity: usize,
    slow_query_ms: i64,
    very_slow_query_ms: i64,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(&MonitorConfig::default())
    }
}

impl PerformanceMonitor {
    #[must_use]
    pub fn new(config: &MonitorConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            metrics: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            slow_query_ms: millis(config.slow_query),
            very_slow_query_ms: millis(config.very_slow_query),
        }
    }

    fn record(&self, metric: QueryMetric) {
        let mut metrics = self.metrics.lock();
        if metrics.len() == self.capacity {
            metrics.pop_front();
        }
        metrics.push_back(metric);
    }

    /// Record a store query that ran from `start` to `end`.
    pub fn track_query_performance(&self, query_name: &str, start: Instant, end: Instant) {
        let duration_ms = millis(end.saturating_duration_since(start));

        if duration_ms > self.slow_query_ms {
            warn!(query = query_name, duration_ms, "Slow query detected");
        }
        if duration_ms > self.very_slow_query_ms {
            warn!(
                query = query_name,
                duration_ms, "Very slow query, check that a composite index covers it"
            );
        }

        self.record(QueryMetric {
            query_name: query_name.to_owned(),
            duration_ms,
            timestamp: Utc::now(),
            cache_hit: false,
            error: None,
        });
    }

    /// Record a lookup served from cache.
    pub fn track_cache_hit(&self, cache_key: &str) {
        debug!(key = cache_key, "Cache hit");
        self.record(QueryMetric {
            query_name: cache_key.to_owned(),
            duration_ms: CACHE_HIT_DURATION_MS,
            timestamp: Utc::now(),
            cache_hit: true,
            error: None,
        });
    }

    /// Record a failed store query.
    pub fn track_query_error(&self, query_name: &str, error: &dyn Display) {
        let message = error.to_string();
        warn!(query = query_name, error = %message, "Query failed");
        self.record(QueryMetric {
            query_name: query_name.to_owned(),
            duration_ms: ERROR_DURATION_MS,
            timestamp: Utc::now(),
            cache_hit: false,
            error: Some(message),
        });
    }

    /// Run `operation`, recording its duration on success or its error on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns whatever `operation` returns.
    pub async fn measure<T, E, F>(&self, query_name: &str, operation: F) -> Result<T, E>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let result = operation.await;
        match &result {
            Ok(_) => self.track_query_performance(query_name, start, Instant::now()),
            Err(e) => self.track_query_error(query_name, e),
        }
        result
    }

    /// Summarize the buffered metrics.
    #[must_use]
    pub fn get_performance_summary(&self) -> PerformanceSummary {
        let metrics = self.metrics.lock();

        let completed: Vec<&QueryMetric> =
            metrics.iter().filter(|m| m.is_completed_query()).collect();
        let cache_hits = metrics.iter().filter(|m| m.cache_hit).count();
        let errors = metrics.iter().filter(|m| m.error.is_some()).count();

        let total_ms: i64 = completed.iter().map(|m| m.duration_ms).sum();
        let average_duration_ms = if completed.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let avg = total_ms as f64 / completed.len() as f64;
            avg
        };

        let mut slow_queries: Vec<SlowQuery> = completed
            .iter()
            .filter(|m| m.duration_ms > self.slow_query_ms)
            .map(|m| SlowQuery {
                query_name: m.query_name.clone(),
                duration_ms: m.duration_ms,
            })
            .collect();
        slow_queries.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        slow_queries.truncate(SLOW_QUERY_LIST_LEN);

        PerformanceSummary {
            total_events: metrics.len(),
            completed_queries: completed.len(),
            cache_hits,
            errors,
            average_duration_ms,
            slow_queries,
            cache_hit_rate: ratio(cache_hits, cache_hits + completed.len()) * 100.0,
        }
    }

    /// Copy of the buffered metrics, oldest first.
    #[must_use]
    pub fn metrics(&self) -> Vec<QueryMetric> {
        self.metrics.lock().iter().cloned().collect()
    }

    /// Drop all buffered metrics.
    pub fn clear(&self) {
        self.metrics.lock().clear();
    }
}
