//! Registered health probes with interval caching
//!
//! Probes are polled through [`HealthChecker::run_all`]. A probe whose
//! interval has not elapsed since its last run answers from cache, so status
//! commands can poll aggressively without hammering dependencies. Probe
//! failures, timeouts and panics are captured in the report, never raised.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// One health check against a dependency.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` carries arbitrary detail fields for status output, `Err` a
    /// human-readable reason the dependency is down.
    async fn check(&self) -> std::result::Result<Value, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Outcome of one probe run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub status: HealthStatus,
    pub timestamp_ms: i64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// True when every report in a [`HealthChecker::run_all`] result is healthy.
pub fn all_healthy(reports: &BTreeMap<String, ProbeReport>) -> bool {
    reports.values().all(ProbeReport::is_healthy)
}

struct Check {
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    last: Option<(i64, ProbeReport)>,
}

/// Named probes, each with its own re-check interval.
pub struct HealthChecker {
    probe_timeout: Duration,
    checks: Mutex<BTreeMap<String, Check>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::with_probe_timeout(Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS))
    }

    pub fn with_probe_timeout(probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            checks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a probe. An interval of zero disables caching for it.
    /// Re-registering a name replaces the probe and drops its cache.
    pub async fn register(
        &self,
        name: impl Into<String>,
        interval_secs: u64,
        probe: Arc<dyn HealthProbe>,
    ) {
        let name = name.into();
        debug!("health probe '{}' registered, interval {}s", name, interval_secs);
        self.checks.lock().await.insert(
            name,
            Check {
                probe,
                interval: Duration::from_secs(interval_secs),
                last: None,
            },
        );
    }

    /// Run every registered probe, answering from cache where the interval
    /// has not elapsed. Keys come back in name order.
    pub async fn run_all(&self) -> BTreeMap<String, ProbeReport> {
        self.run_all_at(Utc::now().timestamp_millis()).await
    }

    pub async fn run_all_at(&self, now_ms: i64) -> BTreeMap<String, ProbeReport> {
        let mut reports = BTreeMap::new();
        let mut checks = self.checks.lock().await;
        for (name, check) in checks.iter_mut() {
            if let Some((last_ms, cached)) = &check.last {
                if now_ms.saturating_sub(*last_ms) < check.interval.as_millis() as i64 {
                    debug!("health probe '{}' answered from cache", name);
                    reports.insert(name.clone(), cached.clone());
                    continue;
                }
            }
            let report = self.run_probe(name, check.probe.clone(), now_ms).await;
            check.last = Some((now_ms, report.clone()));
            reports.insert(name.clone(), report);
        }
        reports
    }

    async fn run_probe(
        &self,
        name: &str,
        probe: Arc<dyn HealthProbe>,
        now_ms: i64,
    ) -> ProbeReport {
        let started = Instant::now();
        let handle = tokio::spawn(async move { probe.check().await });
        let abort = handle.abort_handle();
        let outcome = tokio::time::timeout(self.probe_timeout, handle).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, details, error) = match outcome {
            Err(_) => {
                abort.abort();
                let reason = format!("timed out after {}ms", self.probe_timeout.as_millis());
                warn!("health probe '{}' {}", name, reason);
                (HealthStatus::Unhealthy, None, Some(reason))
            }
            Ok(Err(join_err)) => {
                let reason = if join_err.is_panic() {
                    "probe panicked".to_string()
                } else {
                    "probe cancelled".to_string()
                };
                warn!("health probe '{}' {}", name, reason);
                (HealthStatus::Unhealthy, None, Some(reason))
            }
            Ok(Ok(Ok(details))) => (HealthStatus::Healthy, Some(details), None),
            Ok(Ok(Err(reason))) => {
                warn!("health probe '{}' unhealthy: {}", name, reason);
                (HealthStatus::Unhealthy, None, Some(reason))
            }
        };

        ProbeReport {
            status,
            timestamp_ms: now_ms,
            duration_ms,
            details,
            error,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    const T0: i64 = 1_700_000_000_000;

    struct OkProbe;

    #[async_trait]
    impl HealthProbe for OkProbe {
        async fn check(&self) -> std::result::Result<Value, String> {
            Ok(json!({"latency_ms": 5}))
        }
    }

    struct FailProbe;

    #[async_trait]
    impl HealthProbe for FailProbe {
        async fn check(&self) -> std::result::Result<Value, String> {
            Err("connection refused".to_string())
        }
    }

    struct CountingProbe {
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn check(&self) -> std::result::Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    struct SlowProbe;

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn check(&self) -> std::result::Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    struct PanicProbe;

    #[async_trait]
    impl HealthProbe for PanicProbe {
        async fn check(&self) -> std::result::Result<Value, String> {
            panic!("probe blew up");
        }
    }

    // ============ Report Tests ============

    #[tokio::test]
    async fn test_healthy_probe_reports_details() {
        let checker = HealthChecker::new();
        checker.register("store", 60, Arc::new(OkProbe)).await;

        let reports = checker.run_all_at(T0).await;
        let report = &reports["store"];
        assert!(report.is_healthy());
        assert_eq!(report.timestamp_ms, T0);
        assert_eq!(report.details.as_ref().unwrap()["latency_ms"], 5);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_failing_probe_reports_error() {
        let checker = HealthChecker::new();
        checker.register("store", 60, Arc::new(FailProbe)).await;

        let reports = checker.run_all_at(T0).await;
        let report = &reports["store"];
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.error.as_deref(), Some("connection refused"));
        assert!(report.details.is_none());
    }

    #[tokio::test]
    async fn test_empty_checker_reports_nothing() {
        let checker = HealthChecker::new();
        assert!(checker.run_all_at(T0).await.is_empty());
    }

    #[tokio::test]
    async fn test_reports_keyed_in_name_order() {
        let checker = HealthChecker::new();
        checker.register("zeta", 60, Arc::new(OkProbe)).await;
        checker.register("alpha", 60, Arc::new(OkProbe)).await;

        let reports = checker.run_all_at(T0).await;
        let names: Vec<&str> = reports.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    // ============ Caching Tests ============

    #[tokio::test]
    async fn test_interval_caches_results() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicU32::new(0),
        });
        let checker = HealthChecker::new();
        checker.register("db", 60, probe.clone()).await;

        checker.run_all_at(T0).await;
        checker.run_all_at(T0 + 1_000).await;
        checker.run_all_at(T0 + 59_999).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        checker.run_all_at(T0 + 60_000).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_interval_never_caches() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicU32::new(0),
        });
        let checker = HealthChecker::new();
        checker.register("db", 0, probe.clone()).await;

        checker.run_all_at(T0).await;
        checker.run_all_at(T0).await;
        checker.run_all_at(T0).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cached_report_keeps_original_timestamp() {
        let checker = HealthChecker::new();
        checker.register("store", 60, Arc::new(OkProbe)).await;

        checker.run_all_at(T0).await;
        let reports = checker.run_all_at(T0 + 5_000).await;
        assert_eq!(reports["store"].timestamp_ms, T0);
    }

    #[tokio::test]
    async fn test_reregister_replaces_probe_and_cache() {
        let checker = HealthChecker::new();
        checker.register("store", 60, Arc::new(OkProbe)).await;
        checker.run_all_at(T0).await;

        checker.register("store", 60, Arc::new(FailProbe)).await;
        let reports = checker.run_all_at(T0 + 1_000).await;
        assert_eq!(reports["store"].status, HealthStatus::Unhealthy);
    }

    // ============ Containment Tests ============

    #[tokio::test]
    async fn test_slow_probe_times_out() {
        let checker = HealthChecker::with_probe_timeout(Duration::from_millis(50));
        checker.register("slow", 0, Arc::new(SlowProbe)).await;

        let reports = checker.run_all_at(T0).await;
        let report = &reports["slow"];
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_probe_is_contained() {
        let checker = HealthChecker::new();
        checker.register("explosive", 0, Arc::new(PanicProbe)).await;
        checker.register("fine", 0, Arc::new(OkProbe)).await;

        let reports = checker.run_all_at(T0).await;
        assert_eq!(reports["explosive"].status, HealthStatus::Unhealthy);
        assert_eq!(
            reports["explosive"].error.as_deref(),
            Some("probe panicked")
        );
        // A blown probe must not poison the rest of the sweep
        assert!(reports["fine"].is_healthy());
    }

    // ============ Aggregation Tests ============

    #[tokio::test]
    async fn test_all_healthy_helper() {
        let checker = HealthChecker::new();
        checker.register("a", 60, Arc::new(OkProbe)).await;
        checker.register("b", 60, Arc::new(OkProbe)).await;
        assert!(all_healthy(&checker.run_all_at(T0).await));

        checker.register("c", 60, Arc::new(FailProbe)).await;
        assert!(!all_healthy(&checker.run_all_at(T0 + 100_000).await));
    }

    #[test]
    fn test_status_display_and_serde() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
    }
}
