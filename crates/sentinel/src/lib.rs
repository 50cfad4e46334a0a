//! SENTINEL: Error tracking and health surveillance
//!
//! Persistent error archive with severity-aware logging, plus registered
//! health probes that cache results between check intervals.

use thiserror::Error;

pub mod health;
pub mod tracker;

pub use health::{all_healthy, HealthChecker, HealthProbe, HealthStatus, ProbeReport};
pub use tracker::{ComponentCount, ErrorRecord, ErrorStats, ErrorTracker, Severity, StoredError};

/// Surveillance errors
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("ARCHIVE ERROR: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("DATA LINK ERROR: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SentinelError>;
