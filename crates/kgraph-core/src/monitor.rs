//! Performance monitor: per-operation timings, slow-query log, telemetry.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;

const SLOW_LOG_CAPACITY: usize = 100;
const SAMPLE_CAPACITY: usize = 1_024;

/// One structured measurement.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub operation: String,
    pub tenant: Option<String>,
    pub duration: Duration,
    pub rows: usize,
    pub success: bool,
}

/// Receives every measurement the monitor records.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}

/// Default sink: emits a `tracing` debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: &TelemetryEvent) {
        debug!(
            operation = %event.operation,
            tenant = event.tenant.as_deref().unwrap_or("-"),
            duration_us = event.duration.as_micros() as u64,
            rows = event.rows,
            success = event.success,
            "telemetry"
        );
    }
}

/// A recorded slow call.
#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub operation: String,
    pub tenant: Option<String>,
    pub duration: Duration,
    pub rows: usize,
}

/// Aggregated timings for one operation name.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub operation: String,
    pub count: u64,
    pub errors: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

#[derive(Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    total: Duration,
    max: Duration,
    /// Most recent samples, bounded.
    samples: VecDeque<f64>,
}

/// Collects timings and forwards them to a [`TelemetrySink`].
pub struct PerformanceMonitor {
    sink: Arc<dyn TelemetrySink>,
    slow_threshold: Duration,
    stats: Mutex<HashMap<String, OperationStats>>,
    slow_log: Mutex<VecDeque<SlowQuery>>,
}

impl PerformanceMonitor {
    pub fn new(sink: Arc<dyn TelemetrySink>, slow_threshold: Duration) -> Self {
        Self {
            sink,
            slow_threshold,
            stats: Mutex::new(HashMap::new()),
            slow_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Monitor backed by [`TracingSink`].
    #[must_use]
    pub fn with_tracing(slow_threshold: Duration) -> Self {
        Self::new(Arc::new(TracingSink), slow_threshold)
    }

    /// Record one measurement.
    pub fn record(
        &self,
        operation: &str,
        tenant: Option<&str>,
        duration: Duration,
        rows: usize,
        success: bool,
    ) {
        {
            let mut stats = self.stats.lock();
            let entry = stats.entry(operation.to_string()).or_default();
            entry.count += 1;
            if !success {
                entry.errors += 1;
            }
            entry.total += duration;
            entry.max = entry.max.max(duration);
            if entry.samples.len() == SAMPLE_CAPACITY {
                entry.samples.pop_front();
            }
            entry.samples.push_back(duration.as_secs_f64() * 1_000.0);
        }

        if duration >= self.slow_threshold {
            warn!(
                operation,
                tenant = tenant.unwrap_or("-"),
                duration_ms = duration.as_millis() as u64,
                rows,
                "slow query"
            );
            let mut log = self.slow_log.lock();
            if log.len() == SLOW_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(SlowQuery {
                operation: operation.to_string(),
                tenant: tenant.map(str::to_string),
                duration,
                rows,
            });
        }

        self.sink.record(&TelemetryEvent {
            operation: operation.to_string(),
            tenant: tenant.map(str::to_string),
            duration,
            rows,
            success,
        });
    }

    /// Time a fallible future. `rows` extracts the row count from a success.
    ///
    /// # Errors
    ///
    /// Returns whatever the future returns.
    pub async fn track<T, F, R>(
        &self,
        operation: &str,
        tenant: Option<&str>,
        fut: F,
        rows: R,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        R: FnOnce(&T) -> usize,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        match &result {
            Ok(value) => self.record(operation, tenant, elapsed, rows(value), true),
            Err(_) => self.record(operation, tenant, elapsed, 0, false),
        }
        result
    }

    /// Per-operation summaries, sorted by operation name.
    #[must_use]
    pub fn summary(&self) -> Vec<OperationSummary> {
        let stats = self.stats.lock();
        let mut out: Vec<OperationSummary> = stats
            .iter()
            .map(|(name, s)| {
                let mut sorted: Vec<f64> = s.samples.iter().copied().collect();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                OperationSummary {
                    operation: name.clone(),
                    count: s.count,
                    errors: s.errors,
                    mean_ms: if s.count == 0 {
                        0.0
                    } else {
                        s.total.as_secs_f64() * 1_000.0 / s.count as f64
                    },
                    p50_ms: percentile(&sorted, 50.0),
                    p95_ms: percentile(&sorted, 95.0),
                    max_ms: s.max.as_secs_f64() * 1_000.0,
                }
            })
            .collect();
        out.sort_by(|a, b| a.operation.cmp(&b.operation));
        out
    }

    /// Most recent slow calls, oldest first.
    #[must_use]
    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        self.slow_log.lock().iter().cloned().collect()
    }

    pub fn reset(&self) {
        self.stats.lock().clear();
        self.slow_log.lock().clear();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::with_tracing(Duration::from_millis(500))
    }
}

/// Nearest-rank percentile over an ascending slice.
#[must_use]
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KgError;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl TelemetrySink for CollectingSink {
        fn record(&self, event: &TelemetryEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn percentile_nearest_rank() {
        let data: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&data, 50.0), 50.0);
        assert_eq!(percentile(&data, 95.0), 95.0);
        assert_eq!(percentile(&data, 100.0), 100.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn records_summary_and_slow_log() {
        let monitor = PerformanceMonitor::with_tracing(Duration::from_millis(10));
        monitor.record("search", Some("acme"), Duration::from_millis(2), 5, true);
        monitor.record("search", Some("acme"), Duration::from_millis(20), 1, true);
        monitor.record("search", None, Duration::from_millis(1), 0, false);

        let summary = monitor.summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].count, 3);
        assert_eq!(summary[0].errors, 1);
        assert!(summary[0].max_ms >= 20.0);

        let slow = monitor.slow_queries();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].tenant.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn track_forwards_events_to_sink() {
        let sink = Arc::new(CollectingSink::default());
        let monitor = PerformanceMonitor::new(sink.clone(), Duration::from_secs(60));

        let ok: Result<Vec<u32>> = monitor
            .track("query", Some("acme"), async { Ok(vec![1, 2, 3]) }, Vec::len)
            .await;
        assert_eq!(ok.unwrap().len(), 3);

        let err: Result<Vec<u32>> = monitor
            .track(
                "query",
                Some("acme"),
                async { Err(KgError::validation("seeds", "empty")) },
                Vec::len,
            )
            .await;
        assert!(err.is_err());

        let events = sink.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].rows, 3);
        assert!(events[0].success);
        assert!(!events[1].success);
    }
}
