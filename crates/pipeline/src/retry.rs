//! Retry layer with exponential backoff.

use crate::chain::{InterceptPolicy, Interceptor, Next};
use crate::context::CallContext;
use crate::GuardError;
use samguard_sentinel::{ErrorRecord, ErrorTracker, Severity};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Backoff schedule. The delay before retry `n` (1-indexed) is
/// `base_delay * backoff_factor^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl Backoff {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
        }
    }

    /// Delay before retry `n` (1-indexed).
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.base_delay
            .mul_f64(self.backoff_factor.powi(retry as i32 - 1))
    }
}

/// Innermost layer: re-runs the action on transient failure.
///
/// Only errors classified transient are retried; validation-class errors
/// propagate after a single attempt since retrying cannot change the
/// outcome. Sleeps between attempts are cooperative and are the only
/// cancellation point; once an attempt is dispatched it runs to
/// completion under the action's own contract. An exhausted sequence is
/// reported to the error tracker best-effort and surfaced as
/// [`GuardError::RetriesExhausted`] carrying the attempt count and last
/// error.
pub struct RetryInterceptor {
    backoff: Backoff,
    policy: InterceptPolicy,
    tracker: Option<Arc<ErrorTracker>>,
}

impl RetryInterceptor {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            policy: InterceptPolicy::all(),
            tracker: None,
        }
    }

    pub fn with_policy(mut self, policy: InterceptPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record exhausted sequences in the error archive.
    pub fn with_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

/// Sleep for `delay`, waking early if the caller cancels.
async fn backoff_sleep(ctx: &CallContext, delay: Duration) -> bool {
    match &ctx.cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => true,
                _ = sleep(delay) => false,
            }
        }
        None => {
            sleep(delay).await;
            false
        }
    }
}

impl Interceptor for RetryInterceptor {
    fn name(&self) -> &str {
        "retry"
    }

    fn policy(&self) -> &InterceptPolicy {
        &self.policy
    }

    fn wrap(&self, action: &str, next: Next) -> Next {
        let action = action.to_string();
        let backoff = self.backoff;
        let tracker = self.tracker.clone();

        Arc::new(move |args, ctx| {
            let action = action.clone();
            let tracker = tracker.clone();
            let next = Arc::clone(&next);

            Box::pin(async move {
                let total = backoff.max_retries + 1;
                let mut attempt = 1u32;

                loop {
                    match next(args.clone(), Arc::clone(&ctx)).await {
                        Ok(value) => {
                            if attempt > 1 {
                                info!("'{}' recovered on attempt {}/{}", action, attempt, total);
                            }
                            return Ok(value);
                        }
                        Err(err) if err.is_transient() && attempt < total => {
                            let delay = backoff.delay_before(attempt);
                            warn!(
                                "'{}' attempt {}/{} failed: {}, retrying in {:?}",
                                action, attempt, total, err, delay
                            );
                            if backoff_sleep(&ctx, delay).await {
                                info!("'{}' abandoned between attempts", action);
                                return Err(GuardError::Cancelled);
                            }
                            attempt += 1;
                        }
                        Err(err) if err.is_transient() => {
                            let failure = GuardError::RetriesExhausted {
                                action: action.clone(),
                                attempts: attempt,
                                source: Box::new(err),
                            };
                            error!("{}", failure);
                            if let Some(tracker) = &tracker {
                                report_exhaustion(tracker, &action, attempt, &failure, &ctx)
                                    .await;
                            }
                            return Err(failure);
                        }
                        Err(err) => return Err(err),
                    }
                }
            })
        })
    }
}

/// Best-effort archive write; the tracker absorbs its own failures.
async fn report_exhaustion(
    tracker: &ErrorTracker,
    action: &str,
    attempts: u32,
    failure: &GuardError,
    ctx: &CallContext,
) {
    let mut record = ErrorRecord::new(
        "RetriesExhausted",
        failure.to_string(),
        Severity::High,
        action,
    )
    .with_context(json!({ "attempts": attempts }));

    if let Some(session_id) = &ctx.session_id {
        record = record.with_session_id(session_id.clone());
    }
    if let Some(caller_id) = &ctx.caller_id {
        record = record.with_user_id(caller_id.clone());
    }

    tracker.log_error(record).await;
}
