//! Error archive with severity-aware logging
//!
//! Every recorded error is emitted through tracing at a level matching its
//! severity, then persisted for later stats queries. Persistence is
//! best-effort: a failed write is logged and dropped, never surfaced to the
//! caller.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::Result;

const COMPONENT_LIMIT: usize = 10;
const CRITICAL_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error report handed to the tracker.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub error_type: String,
    pub message: String,
    pub severity: Severity,
    pub component: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub context: Option<Value>,
    pub stack_trace: Option<String>,
}

impl ErrorRecord {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        component: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            severity,
            component: component.into(),
            session_id: None,
            user_id: None,
            context: None,
            stack_trace: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }
}

/// Archived error row returned from stats queries.
#[derive(Debug, Clone, Serialize)]
pub struct StoredError {
    pub id: i64,
    pub ts_ms: i64,
    pub error_type: String,
    pub message: String,
    pub severity: Severity,
    pub component: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentCount {
    pub component: String,
    pub count: u64,
}

/// Aggregate view over a trailing window of archived errors.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub time_window_hours: u32,
    pub total_errors: u64,
    pub severity_counts: BTreeMap<String, u64>,
    /// Busiest components first, at most ten.
    pub component_counts: Vec<ComponentCount>,
    /// Newest first, at most five.
    pub recent_critical_errors: Vec<StoredError>,
}

struct MemoryEntry {
    id: i64,
    ts_ms: i64,
    record: ErrorRecord,
}

struct MemoryLog {
    capacity: usize,
    next_id: i64,
    entries: VecDeque<MemoryEntry>,
}

enum Backend {
    Sqlite {
        conn: Mutex<Connection>,
        path: PathBuf,
    },
    Memory(Mutex<MemoryLog>),
}

/// Error archive backed by SQLite, or by a bounded in-memory ring when no
/// database path is configured.
pub struct ErrorTracker {
    backend: Backend,
}

impl ErrorTracker {
    /// Open or create the archive database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                error_type TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                component TEXT NOT NULL,
                session_id TEXT,
                user_id TEXT,
                context TEXT,
                stack_trace TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_errors_ts ON errors(ts_ms);
            CREATE INDEX IF NOT EXISTS idx_errors_component ON errors(component);
            CREATE INDEX IF NOT EXISTS idx_errors_severity ON errors(severity);
            CREATE INDEX IF NOT EXISTS idx_errors_user_ts ON errors(user_id, ts_ms);
            ",
        )?;
        info!("error archive ready at {}", path.display());
        Ok(Self {
            backend: Backend::Sqlite {
                conn: Mutex::new(conn),
                path: path.to_path_buf(),
            },
        })
    }

    /// Archive held entirely in memory, keeping at most `capacity` entries.
    pub fn in_memory(capacity: usize) -> Self {
        debug!("error archive running in memory, capacity {}", capacity);
        Self {
            backend: Backend::Memory(Mutex::new(MemoryLog {
                capacity,
                next_id: 1,
                entries: VecDeque::new(),
            })),
        }
    }

    /// Record an error. Emits a log line at the severity's level and
    /// persists the entry. Never fails: a write error is absorbed after a
    /// warning so error handling can never take the caller down with it.
    pub async fn log_error(&self, record: ErrorRecord) {
        self.log_error_at(record, Utc::now().timestamp_millis()).await
    }

    pub async fn log_error_at(&self, record: ErrorRecord, ts_ms: i64) {
        match record.severity {
            Severity::Critical => error!(
                "CRITICAL [{}] {}: {}",
                record.component, record.error_type, record.message
            ),
            Severity::High => error!(
                "[{}] {}: {}",
                record.component, record.error_type, record.message
            ),
            Severity::Medium => warn!(
                "[{}] {}: {}",
                record.component, record.error_type, record.message
            ),
            Severity::Low => debug!(
                "[{}] {}: {}",
                record.component, record.error_type, record.message
            ),
        }

        if let Err(e) = self.persist(record, ts_ms).await {
            warn!("error archive write failed, entry dropped: {}", e);
        }
    }

    async fn persist(&self, record: ErrorRecord, ts_ms: i64) -> Result<()> {
        match &self.backend {
            Backend::Sqlite { conn, .. } => {
                let context = record.context.as_ref().map(|v| v.to_string());
                let conn = conn.lock().await;
                conn.execute(
                    "INSERT INTO errors
                        (ts_ms, error_type, message, severity, component,
                         session_id, user_id, context, stack_trace)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        ts_ms,
                        record.error_type,
                        record.message,
                        record.severity.as_str(),
                        record.component,
                        record.session_id,
                        record.user_id,
                        context,
                        record.stack_trace,
                    ],
                )?;
                Ok(())
            }
            Backend::Memory(log) => {
                let mut log = log.lock().await;
                if log.capacity == 0 {
                    return Ok(());
                }
                while log.entries.len() >= log.capacity {
                    log.entries.pop_front();
                }
                let id = log.next_id;
                log.next_id += 1;
                log.entries.push_back(MemoryEntry { id, ts_ms, record });
                Ok(())
            }
        }
    }

    /// Aggregate stats over the trailing `hours_back` hours.
    pub async fn get_error_stats(&self, hours_back: u32) -> Result<ErrorStats> {
        self.get_error_stats_at(hours_back, Utc::now().timestamp_millis())
            .await
    }

    pub async fn get_error_stats_at(&self, hours_back: u32, now_ms: i64) -> Result<ErrorStats> {
        let cutoff_ms = now_ms - i64::from(hours_back) * 3_600_000;
        match &self.backend {
            Backend::Sqlite { conn, .. } => {
                let conn = conn.lock().await;

                let total_errors: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM errors WHERE ts_ms >= ?1",
                    params![cutoff_ms],
                    |row| row.get(0),
                )?;

                let mut severity_counts = BTreeMap::new();
                let mut stmt = conn.prepare(
                    "SELECT severity, COUNT(*) FROM errors WHERE ts_ms >= ?1 GROUP BY severity",
                )?;
                let rows = stmt.query_map(params![cutoff_ms], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (severity, count) = row?;
                    severity_counts.insert(severity, count as u64);
                }

                let mut component_counts = Vec::new();
                let mut stmt = conn.prepare(
                    "SELECT component, COUNT(*) AS n FROM errors WHERE ts_ms >= ?1
                     GROUP BY component ORDER BY n DESC, component ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![cutoff_ms, COMPONENT_LIMIT as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (component, count) = row?;
                    component_counts.push(ComponentCount {
                        component,
                        count: count as u64,
                    });
                }

                let mut recent_critical_errors = Vec::new();
                let mut stmt = conn.prepare(
                    "SELECT id, ts_ms, error_type, message, severity, component
                     FROM errors WHERE ts_ms >= ?1 AND severity = 'critical'
                     ORDER BY ts_ms DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![cutoff_ms, CRITICAL_LIMIT as i64], |row| {
                    Ok(StoredError {
                        id: row.get(0)?,
                        ts_ms: row.get(1)?,
                        error_type: row.get(2)?,
                        message: row.get(3)?,
                        // Unknown severity text in a hand-edited db maps to medium
                        severity: Severity::parse(&row.get::<_, String>(4)?)
                            .unwrap_or(Severity::Medium),
                        component: row.get(5)?,
                    })
                })?;
                for row in rows {
                    recent_critical_errors.push(row?);
                }

                Ok(ErrorStats {
                    time_window_hours: hours_back,
                    total_errors: total_errors as u64,
                    severity_counts,
                    component_counts,
                    recent_critical_errors,
                })
            }
            Backend::Memory(log) => {
                let log = log.lock().await;
                let in_window: Vec<&MemoryEntry> = log
                    .entries
                    .iter()
                    .filter(|e| e.ts_ms >= cutoff_ms)
                    .collect();

                let mut severity_counts: BTreeMap<String, u64> = BTreeMap::new();
                let mut by_component: BTreeMap<String, u64> = BTreeMap::new();
                for entry in &in_window {
                    *severity_counts
                        .entry(entry.record.severity.as_str().to_string())
                        .or_insert(0) += 1;
                    *by_component
                        .entry(entry.record.component.clone())
                        .or_insert(0) += 1;
                }

                let mut component_counts: Vec<ComponentCount> = by_component
                    .into_iter()
                    .map(|(component, count)| ComponentCount { component, count })
                    .collect();
                component_counts
                    .sort_by(|a, b| b.count.cmp(&a.count).then(a.component.cmp(&b.component)));
                component_counts.truncate(COMPONENT_LIMIT);

                let mut recent_critical_errors: Vec<StoredError> = in_window
                    .iter()
                    .filter(|e| e.record.severity == Severity::Critical)
                    .map(|e| StoredError {
                        id: e.id,
                        ts_ms: e.ts_ms,
                        error_type: e.record.error_type.clone(),
                        message: e.record.message.clone(),
                        severity: e.record.severity,
                        component: e.record.component.clone(),
                    })
                    .collect();
                recent_critical_errors.sort_by(|a, b| b.ts_ms.cmp(&a.ts_ms).then(b.id.cmp(&a.id)));
                recent_critical_errors.truncate(CRITICAL_LIMIT);

                Ok(ErrorStats {
                    time_window_hours: hours_back,
                    total_errors: in_window.len() as u64,
                    severity_counts,
                    component_counts,
                    recent_critical_errors,
                })
            }
        }
    }

    /// Delete entries older than `days_old` days. Zero wipes everything
    /// recorded before now. Returns how many entries were removed.
    pub async fn cleanup_old_errors(&self, days_old: u32) -> Result<u64> {
        self.cleanup_old_errors_at(days_old, Utc::now().timestamp_millis())
            .await
    }

    pub async fn cleanup_old_errors_at(&self, days_old: u32, now_ms: i64) -> Result<u64> {
        let cutoff_ms = now_ms - i64::from(days_old) * 86_400_000;
        let removed = match &self.backend {
            Backend::Sqlite { conn, .. } => {
                let conn = conn.lock().await;
                conn.execute("DELETE FROM errors WHERE ts_ms < ?1", params![cutoff_ms])? as u64
            }
            Backend::Memory(log) => {
                let mut log = log.lock().await;
                let before = log.entries.len();
                log.entries.retain(|e| e.ts_ms >= cutoff_ms);
                (before - log.entries.len()) as u64
            }
        };
        if removed > 0 {
            info!("purged {} archived errors older than {} days", removed, days_old);
        }
        Ok(removed)
    }

    /// Quick liveness check against the backing store.
    pub async fn ping(&self) -> Result<()> {
        match &self.backend {
            Backend::Sqlite { conn, .. } => {
                let conn = conn.lock().await;
                let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
                Ok(())
            }
            Backend::Memory(_) => Ok(()),
        }
    }

    /// Reclaim space from deleted rows. No-op for the in-memory archive.
    pub async fn vacuum(&self) -> Result<()> {
        match &self.backend {
            Backend::Sqlite { conn, .. } => {
                let conn = conn.lock().await;
                conn.execute_batch("VACUUM")?;
                info!("error archive vacuumed");
                Ok(())
            }
            Backend::Memory(_) => Ok(()),
        }
    }

    /// On-disk size of the archive, `None` for the in-memory backend.
    pub async fn db_size_bytes(&self) -> Result<Option<u64>> {
        match &self.backend {
            Backend::Sqlite { path, .. } => {
                let meta = tokio::fs::metadata(path).await?;
                Ok(Some(meta.len()))
            }
            Backend::Memory(_) => Ok(None),
        }
    }
}
