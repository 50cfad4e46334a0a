//! SAMGUARD command implementations

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use samguard_admission::AdmissionController;
use samguard_breaker::{BreakerSnapshot, CircuitState};
use samguard_config::GuardConfig;
use samguard_pipeline::Services;
use samguard_sentinel::{all_healthy, ErrorStats, ErrorTracker, HealthChecker, HealthProbe};
use samguard_store::{KvStore, MemoryStore};

/// Load guard parameters from an explicit path, or from the usual places.
async fn load_config(path: Option<PathBuf>) -> Result<GuardConfig> {
    match path {
        Some(path) => GuardConfig::load_required(&path)
            .await
            .with_context(|| format!("reading config from {}", path.display())),
        None => GuardConfig::load().await.context("reading config"),
    }
}

/// Open the error archive the way a deployment does: durable SQLite when
/// configured, bounded in-memory ring otherwise.
fn open_tracker(config: &GuardConfig) -> Result<Arc<ErrorTracker>> {
    if config.tracker.persistent {
        let db_path = config.resolved_db_path();
        let tracker = ErrorTracker::open(&db_path)
            .with_context(|| format!("opening error archive at {}", db_path.display()))?;
        Ok(Arc::new(tracker))
    } else {
        Ok(Arc::new(ErrorTracker::in_memory(
            config.tracker.max_memory_records,
        )))
    }
}

/// Assemble the full service set over an in-process store.
fn build_services(config: &GuardConfig) -> Result<Services> {
    let tracker = open_tracker(config)?;
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    Ok(Services::from_config(config, store, tracker))
}

/// Probe that round-trips the admission store.
struct StoreProbe {
    store: Arc<dyn KvStore>,
}

#[async_trait]
impl HealthProbe for StoreProbe {
    async fn check(&self) -> std::result::Result<Value, String> {
        let started = Instant::now();
        self.store.ping().await.map_err(|e| e.to_string())?;
        Ok(json!({ "latency_ms": started.elapsed().as_millis() as u64 }))
    }
}

/// Probe that queries the error archive.
struct ArchiveProbe {
    tracker: Arc<ErrorTracker>,
}

#[async_trait]
impl HealthProbe for ArchiveProbe {
    async fn check(&self) -> std::result::Result<Value, String> {
        self.tracker.ping().await.map_err(|e| e.to_string())?;
        let stats = self
            .tracker
            .get_error_stats(24)
            .await
            .map_err(|e| e.to_string())?;
        let mut details = json!({ "recent_errors": stats.total_errors });
        if let Some(bytes) = self
            .tracker
            .db_size_bytes()
            .await
            .map_err(|e| e.to_string())?
        {
            details["db_size_bytes"] = json!(bytes);
        }
        Ok(details)
    }
}

/// Probe that reports whether admission control is failing open.
struct AdmissionProbe {
    admission: Arc<AdmissionController>,
}

#[async_trait]
impl HealthProbe for AdmissionProbe {
    async fn check(&self) -> std::result::Result<Value, String> {
        if self.admission.is_degraded() {
            Err(format!(
                "failing open after {} store errors",
                self.admission.store_error_count()
            ))
        } else {
            Ok(json!({ "store_errors": self.admission.store_error_count() }))
        }
    }
}

/// Epoch millis as a readable UTC timestamp.
fn format_ts(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

fn print_severity_counts(stats: &ErrorStats) {
    for (severity, count) in &stats.severity_counts {
        println!("  {:<9} {}", severity, count);
    }
}

fn print_snapshot(snap: &BreakerSnapshot) {
    let mark = match snap.state {
        CircuitState::Closed => "✓",
        _ => "✗",
    };
    println!(
        "  {} {:<20} {} ({}/{} failures, opened {}, rejected {})",
        mark,
        snap.name,
        snap.state,
        snap.failure_count,
        snap.failure_threshold,
        snap.opened_count,
        snap.rejected_count
    );
}

/// Show component health, recent errors and circuit state
pub async fn status_command(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path).await?;
    let services = build_services(&config)?;

    println!("◆ SAMGUARD System Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let checker =
        HealthChecker::with_probe_timeout(Duration::from_secs(config.health.probe_timeout_secs));
    checker
        .register(
            "admission",
            0,
            Arc::new(AdmissionProbe {
                admission: Arc::clone(&services.admission),
            }),
        )
        .await;
    checker
        .register(
            "archive",
            0,
            Arc::new(ArchiveProbe {
                tracker: Arc::clone(&services.tracker),
            }),
        )
        .await;
    checker
        .register(
            "store",
            0,
            Arc::new(StoreProbe {
                store: Arc::clone(&services.store),
            }),
        )
        .await;

    let reports = checker.run_all().await;
    for (name, report) in &reports {
        if report.is_healthy() {
            println!("  ✓ {}", name);
            if let Some(Value::Object(details)) = &report.details {
                for (key, value) in details {
                    println!("      {}: {}", key, value);
                }
            }
        } else {
            println!(
                "  ✗ {}: {}",
                name,
                report.error.as_deref().unwrap_or("unhealthy")
            );
        }
    }

    let stats = services
        .tracker
        .get_error_stats(24)
        .await
        .context("querying error archive")?;
    println!();
    if stats.total_errors == 0 {
        println!("No errors in the last 24h");
    } else {
        println!("{} errors in the last 24h", stats.total_errors);
        print_severity_counts(&stats);
        if !stats.recent_critical_errors.is_empty() {
            println!("Recent critical:");
            for err in stats.recent_critical_errors.iter().take(3) {
                println!(
                    "  {} [{}] {}",
                    format_ts(err.ts_ms),
                    err.component,
                    err.message
                );
            }
        }
    }

    let snapshots = services.breakers.snapshot_all().await;
    println!();
    if snapshots.is_empty() {
        println!("Circuits: none registered");
    } else {
        println!("Circuits:");
        for snap in &snapshots {
            print_snapshot(snap);
        }
    }

    let unhealthy = reports.values().filter(|r| !r.is_healthy()).count();
    if all_healthy(&reports) && stats.total_errors == 0 {
        println!("\n◆ All systems nominal");
        Ok(())
    } else {
        println!("\n◆ Attention required");
        anyhow::bail!(
            "{} unhealthy component(s), {} error(s) in the last 24h",
            unhealthy,
            stats.total_errors
        )
    }
}

/// Show error archive statistics
pub async fn errors_command(config_path: Option<PathBuf>, hours: u32, json: bool) -> Result<()> {
    let config = load_config(config_path).await?;
    let tracker = open_tracker(&config)?;

    let stats = tracker
        .get_error_stats(hours)
        .await
        .context("querying error archive")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("◆ Error Report (last {}h)", hours);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Total: {}", stats.total_errors);

    if !stats.severity_counts.is_empty() {
        println!("\nBy severity:");
        print_severity_counts(&stats);
    }

    if !stats.component_counts.is_empty() {
        println!("\nBy component:");
        for entry in &stats.component_counts {
            println!("  {:<20} {}", entry.component, entry.count);
        }
    }

    if !stats.recent_critical_errors.is_empty() {
        println!("\nRecent critical:");
        for err in &stats.recent_critical_errors {
            println!(
                "  {} [{}] {}: {}",
                format_ts(err.ts_ms),
                err.component,
                err.error_type,
                err.message
            );
        }
    }

    Ok(())
}

/// Show the bucket for an identifier
pub async fn limits_info_command(
    config_path: Option<PathBuf>,
    identifier: String,
    category: String,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let services = build_services(&config)?;

    let info = services
        .admission
        .info(&identifier, &category)
        .await
        .context("reading bucket state")?;

    println!("◆ Rate Limit {}:{}", category, identifier);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Limit:     {} per {}s", info.limit, info.window_secs);
    println!("Remaining: {}", info.remaining);
    println!("Admitted:  {}", info.total_requests);
    if let Some(secs) = info.retry_after_secs {
        println!("Retry in:  {}s", secs);
    }
    if info.degraded {
        println!("Mode:      degraded (failing open)");
    }

    Ok(())
}

/// Drop the bucket for an identifier
pub async fn limits_reset_command(
    config_path: Option<PathBuf>,
    identifier: String,
    category: String,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let services = build_services(&config)?;

    if services
        .admission
        .reset(&identifier, &category)
        .await
        .context("dropping bucket")?
    {
        println!("✓ Rate limit {}:{} reset", category, identifier);
    } else {
        println!("✗ No bucket for {}:{}", category, identifier);
    }

    Ok(())
}

/// Show circuit snapshots
pub async fn breakers_status_command(config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let config = load_config(config_path).await?;
    let services = build_services(&config)?;

    let snapshots = services.breakers.snapshot_all().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    println!("◆ Circuit Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if snapshots.is_empty() {
        println!("No circuits registered");
    } else {
        for snap in &snapshots {
            print_snapshot(snap);
        }
    }

    Ok(())
}

/// Force circuits closed
pub async fn breakers_reset_command(
    config_path: Option<PathBuf>,
    name: Option<String>,
) -> Result<()> {
    let config = load_config(config_path).await?;
    let services = build_services(&config)?;

    match name {
        Some(name) => {
            if services.breakers.reset(&name).await {
                println!("✓ Circuit {} closed", name);
            } else {
                println!("✗ No circuit named {}", name);
            }
        }
        None => {
            let count = services.breakers.reset_all().await;
            println!("✓ {} circuit(s) closed", count);
        }
    }

    Ok(())
}

/// Purge old errors and compact the archive
pub async fn maintenance_command(config_path: Option<PathBuf>, days: Option<u32>) -> Result<()> {
    let config = load_config(config_path).await?;
    let tracker = open_tracker(&config)?;
    let days = days.unwrap_or(config.tracker.retention_days);

    println!("◆ Archive Maintenance");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let before = tracker.db_size_bytes().await.context("sizing archive")?;
    match before {
        Some(bytes) => println!("Archive size: {} bytes", bytes),
        None => println!("Archive: in memory"),
    }

    let removed = tracker
        .cleanup_old_errors(days)
        .await
        .context("purging archive")?;
    println!("✓ Purged {} entries older than {} days", removed, days);

    tracker.vacuum().await.context("compacting archive")?;
    let after = tracker.db_size_bytes().await.context("sizing archive")?;
    if let (Some(before), Some(after)) = (before, after) {
        println!(
            "✓ Compacted to {} bytes ({} reclaimed)",
            after,
            before.saturating_sub(after)
        );
    }

    println!("\n◆ Maintenance complete");
    Ok(())
}
