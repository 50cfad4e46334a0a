//! Call logging layer.

use crate::chain::{InterceptPolicy, Interceptor, Next};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outermost layer: stamps each dispatch with a short call ID and logs
/// start, outcome, and duration. Argument and result payloads stay out of
/// the logs unless explicitly switched on; they may carry addresses or
/// signed payloads.
pub struct LoggingInterceptor {
    policy: InterceptPolicy,
    include_args: bool,
    include_result: bool,
}

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self {
            policy: InterceptPolicy::all(),
            include_args: false,
            include_result: false,
        }
    }

    pub fn with_policy(mut self, policy: InterceptPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn include_args(mut self, on: bool) -> Self {
        self.include_args = on;
        self
    }

    pub fn include_result(mut self, on: bool) -> Self {
        self.include_result = on;
        self
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    fn policy(&self) -> &InterceptPolicy {
        &self.policy
    }

    fn wrap(&self, action: &str, next: Next) -> Next {
        let action = action.to_string();
        let include_args = self.include_args;
        let include_result = self.include_result;

        Arc::new(move |args, ctx| {
            let action = action.clone();
            let next = Arc::clone(&next);

            Box::pin(async move {
                let call_id = short_call_id();
                if include_args {
                    debug!("[{}] {} called with args {}", call_id, action, args);
                } else {
                    debug!("[{}] {} called", call_id, action);
                }

                let started = Instant::now();
                let result = next(args, ctx).await;
                let elapsed = started.elapsed();

                match &result {
                    Ok(value) if include_result => {
                        info!("[{}] {} completed in {:?}: {}", call_id, action, elapsed, value);
                    }
                    Ok(_) => {
                        info!("[{}] {} completed in {:?}", call_id, action, elapsed);
                    }
                    Err(err) => {
                        warn!("[{}] {} failed after {:?}: {}", call_id, action, elapsed, err);
                    }
                }

                result
            })
        })
    }
}

fn short_call_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_call_id_shape() {
        let id = short_call_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_call_ids_are_distinct() {
        assert_ne!(short_call_id(), short_call_id());
    }
}
