//! Circuit-breaking layer guarding repeatedly failing actions.

use crate::chain::{InterceptPolicy, Interceptor, Next};
use samguard_breaker::BreakerRegistry;
use std::sync::Arc;

/// Wraps the retry layer, so one completed retry sequence records exactly
/// one breaker outcome. An open circuit rejects before any attempt runs.
/// Caller errors and the chain's own rejections leave the breaker
/// untouched; only resource failures count against the threshold.
pub struct BreakerInterceptor {
    registry: Arc<BreakerRegistry>,
    policy: InterceptPolicy,
}

impl BreakerInterceptor {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self {
            registry,
            policy: InterceptPolicy::all(),
        }
    }

    pub fn with_policy(mut self, policy: InterceptPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Interceptor for BreakerInterceptor {
    fn name(&self) -> &str {
        "breaker"
    }

    fn policy(&self) -> &InterceptPolicy {
        &self.policy
    }

    fn wrap(&self, action: &str, next: Next) -> Next {
        let registry = Arc::clone(&self.registry);
        let action = action.to_string();

        Arc::new(move |args, ctx| {
            let registry = Arc::clone(&registry);
            let action = action.clone();
            let next = Arc::clone(&next);

            Box::pin(async move {
                let breaker = registry.breaker(&action).await;
                breaker.try_acquire().await?;

                let result = next(args, ctx).await;
                match &result {
                    Ok(_) => breaker.record_success().await,
                    Err(err) if err.is_resource_failure() => breaker.record_failure().await,
                    Err(_) => {}
                }
                result
            })
        })
    }
}
