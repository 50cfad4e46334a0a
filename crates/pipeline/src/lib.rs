//! FOXHOUND: Layered interception for tool invocations
//!
//! Every registered action is wrapped at registration time in an ordered
//! chain of resilience layers: call logging, token-bucket admission,
//! circuit breaking, and retry with backoff. Dispatch walks the chain
//! outermost-first, so an admission denial or an open circuit rejects the
//! call before any attempt runs, and the retry layer sits directly around
//! the action itself.

use samguard_admission::AdmissionInfo;
use samguard_breaker::BreakerError;
use thiserror::Error;

pub mod admission;
pub mod assemble;
pub mod breaker;
pub mod chain;
pub mod context;
pub mod logging;
pub mod retry;

pub use admission::{AdmissionInterceptor, IDENTIFIER_ARG};
pub use assemble::{build_dispatcher, Services};
pub use breaker::BreakerInterceptor;
pub use chain::{Action, CallFuture, Dispatcher, InterceptPolicy, Interceptor, Next};
pub use context::CallContext;
pub use logging::LoggingInterceptor;
pub use retry::{Backoff, RetryInterceptor};

/// Substrings that mark an action error as worth retrying.
pub const TRANSIENT_INDICATORS: [&str; 8] = [
    "timeout",
    "connection",
    "network",
    "temporary",
    "rate limit",
    "server error",
    "5xx",
    "unavailable",
];

/// Pipeline errors
#[derive(Error, Debug)]
pub enum GuardError {
    /// Caller error. Retrying cannot change the outcome.
    #[error("INVALID ORDERS: {0}")]
    Validation(String),

    /// Failure that may clear on its own (network, timeout, overload).
    #[error("SIGNAL LOST: {0}")]
    Transient(String),

    /// Failure reported by the action itself.
    #[error("OPERATION FAILED: {0}")]
    Action(String),

    /// Admission denial with a wait hint. Not retried by the chain.
    #[error("STAMINA DEPLETED: '{category}' limit reached for '{identifier}', retry in {}s", .info.retry_after_secs.unwrap_or(0))]
    RateLimited {
        category: String,
        identifier: String,
        info: AdmissionInfo,
    },

    /// Fail-fast rejection; the action was never invoked.
    #[error("ALERT MODE: circuit '{resource}' is open, retry in {retry_in_secs}s")]
    CircuitOpen { resource: String, retry_in_secs: u64 },

    /// Terminal failure after the full retry budget.
    #[error("MISSION FAILED: '{action}' gave up after {attempts} attempts")]
    RetriesExhausted {
        action: String,
        attempts: u32,
        #[source]
        source: Box<GuardError>,
    },

    /// The caller abandoned the call between retry attempts.
    #[error("MISSION ABORTED")]
    Cancelled,

    #[error("UNKNOWN OPERATION: {0}")]
    UnknownAction(String),
}

impl GuardError {
    /// True when a retry might change the outcome.
    ///
    /// [`GuardError::Transient`] always qualifies; [`GuardError::Action`]
    /// qualifies when its message carries one of the
    /// [`TRANSIENT_INDICATORS`]. Everything else, including an exhausted
    /// retry sequence, is terminal for the retry layer.
    pub fn is_transient(&self) -> bool {
        match self {
            GuardError::Transient(_) => true,
            GuardError::Action(message) => {
                let message = message.to_lowercase();
                TRANSIENT_INDICATORS
                    .iter()
                    .any(|indicator| message.contains(indicator))
            }
            _ => false,
        }
    }

    /// True for caller errors that no resilience layer should absorb.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GuardError::Validation(_) | GuardError::UnknownAction(_)
        )
    }

    /// True when the failure says something about the downstream resource.
    ///
    /// Caller errors and the chain's own rejections leave circuit breakers
    /// untouched.
    pub fn is_resource_failure(&self) -> bool {
        !matches!(
            self,
            GuardError::Validation(_)
                | GuardError::UnknownAction(_)
                | GuardError::RateLimited { .. }
                | GuardError::CircuitOpen { .. }
                | GuardError::Cancelled
        )
    }
}

impl From<BreakerError> for GuardError {
    fn from(err: BreakerError) -> Self {
        match err {
            BreakerError::Open {
                name,
                retry_in_secs,
            } => GuardError::CircuitOpen {
                resource: name,
                retry_in_secs,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
