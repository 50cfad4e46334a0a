//! BLOCKADE: Circuit breakers for failing downstream resources
//!
//! Consecutive failures against a named resource trip its circuit open.
//! An open circuit rejects calls until the recovery timeout passes, then
//! admits exactly one trial call to probe the resource before closing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Circuit rejection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError {
    #[error("ALERT MODE: circuit '{name}' is open, retry in {retry_in_secs}s")]
    Open { name: String, retry_in_secs: u64 },
}

pub type Result<T> = std::result::Result<T, BreakerError>;

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

/// Tripping policy for one circuit. Immutable after load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit rejects calls before probing again.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs,
        }
    }

    fn recovery_timeout_ms(&self) -> i64 {
        self.recovery_timeout_secs as i64 * 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one circuit, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_ms: Option<i64>,
    pub opened_count: u64,
    pub rejected_count: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    /// Epoch ms of the most recent failure, 0 if none yet.
    last_failure_ms: i64,
    /// Set while a half-open trial call is in flight.
    trial_started_ms: Option<i64>,
    opened_count: u64,
    rejected_count: u64,
}

/// Circuit breaker for one named resource.
///
/// Callers ask for a permit with [`try_acquire`](Self::try_acquire) before
/// touching the resource, then report the outcome with
/// [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). All transitions happen under a
/// single lock, so a half-open circuit hands out at most one trial permit.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_ms: 0,
                trial_started_ms: None,
                opened_count: 0,
                rejected_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Ask for permission to call the resource.
    pub async fn try_acquire(&self) -> Result<()> {
        self.try_acquire_at(Utc::now().timestamp_millis()).await
    }

    pub async fn try_acquire_at(&self, now_ms: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed_ms = now_ms.saturating_sub(inner.last_failure_ms);
                let recovery_ms = self.config.recovery_timeout_ms();
                if elapsed_ms >= recovery_ms {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started_ms = Some(now_ms);
                    info!("circuit '{}' probing: admitting one trial call", self.name);
                    Ok(())
                } else {
                    inner.rejected_count += 1;
                    let remaining_ms = recovery_ms - elapsed_ms;
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_in_secs: ((remaining_ms + 999) / 1000) as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                // A trial whose caller never reported back must not wedge the
                // circuit; after a full recovery window it is up for grabs.
                let abandoned = inner.trial_started_ms.map_or(true, |started| {
                    now_ms.saturating_sub(started) >= self.config.recovery_timeout_ms()
                });
                if abandoned {
                    inner.trial_started_ms = Some(now_ms);
                    warn!("circuit '{}' trial went unreported, admitting a new trial", self.name);
                    Ok(())
                } else {
                    inner.rejected_count += 1;
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_in_secs: 1,
                    })
                }
            }
        }
    }

    /// Report a successful call. Closes the circuit and clears the failure
    /// streak regardless of the state it was in.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        let was = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_started_ms = None;
        if was != CircuitState::Closed {
            info!("circuit '{}' recovered, closing", self.name);
        }
    }

    /// Report a failed call.
    pub async fn record_failure(&self) {
        self.record_failure_at(Utc::now().timestamp_millis()).await
    }

    pub async fn record_failure_at(&self, now_ms: i64) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;
        inner.last_failure_ms = now_ms;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial_started_ms = None;
                inner.opened_count += 1;
                warn!("circuit '{}' trial failed, reopening", self.name);
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_count += 1;
                warn!(
                    "circuit '{}' opened after {} consecutive failures",
                    self.name, inner.failure_count
                );
            }
            _ => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout_secs,
            last_failure_ms: (inner.last_failure_ms != 0).then_some(inner.last_failure_ms),
            opened_count: inner.opened_count,
            rejected_count: inner.rejected_count,
        }
    }

    /// Force the circuit closed and clear the failure streak. Lifetime
    /// counters survive so status output still shows history.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            info!("circuit '{}' manually reset", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_started_ms = None;
    }
}

/// Shared set of circuits, one per resource name, created on first use.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the circuit for a resource, creating it on first use.
    pub async fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().await;
        map.entry(name.to_string())
            .or_insert_with(|| {
                debug!("circuit '{}' registered", name);
                Arc::new(CircuitBreaker::new(name, self.default_config))
            })
            .clone()
    }

    pub async fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.lock().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset one circuit by name. Returns false if it was never created.
    pub async fn reset(&self, name: &str) -> bool {
        let breaker = self.breakers.lock().await.get(name).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    /// Reset every circuit, returning how many were reset.
    pub async fn reset_all(&self) -> usize {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.lock().await.values().cloned().collect();
        let count = breakers.len();
        for breaker in &breakers {
            breaker.reset().await;
        }
        if count > 0 {
            info!("reset {} circuits", count);
        }
        count
    }
}
