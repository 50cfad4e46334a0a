//! Admission layer bridging the chain to the token-bucket controller.

use crate::chain::{InterceptPolicy, Interceptor, Next};
use crate::context::CallContext;
use crate::GuardError;
use samguard_admission::{Admission, AdmissionController};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Argument key checked first when resolving the bucket identifier.
pub const IDENTIFIER_ARG: &str = "identifier";

/// Charges one token per call before anything downstream runs.
///
/// The bucket identifier comes from the call itself: an `identifier`
/// argument if present, else the context's caller, else its session, else
/// a shared anonymous bucket. Actions map to policy categories through an
/// explicit table; unmapped actions bucket under their own name.
pub struct AdmissionInterceptor {
    controller: Arc<AdmissionController>,
    categories: BTreeMap<String, String>,
    policy: InterceptPolicy,
}

impl AdmissionInterceptor {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self {
            controller,
            categories: BTreeMap::new(),
            policy: InterceptPolicy::all(),
        }
    }

    pub fn with_policy(mut self, policy: InterceptPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Map one action name to a policy category.
    pub fn with_category(
        mut self,
        action: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        self.categories.insert(action.into(), category.into());
        self
    }

    /// Replace the whole action-to-category table.
    pub fn with_categories(mut self, categories: BTreeMap<String, String>) -> Self {
        self.categories = categories;
        self
    }

    fn category_for(&self, action: &str) -> String {
        self.categories
            .get(action)
            .cloned()
            .unwrap_or_else(|| action.to_string())
    }
}

/// Pick the identity this call is charged against.
fn resolve_identifier(args: &Value, ctx: &CallContext) -> String {
    if let Some(id) = args.get(IDENTIFIER_ARG).and_then(Value::as_str) {
        return id.to_string();
    }
    if let Some(id) = &ctx.caller_id {
        return id.clone();
    }
    if let Some(id) = &ctx.session_id {
        return id.clone();
    }
    "anonymous".to_string()
}

impl Interceptor for AdmissionInterceptor {
    fn name(&self) -> &str {
        "admission"
    }

    fn policy(&self) -> &InterceptPolicy {
        &self.policy
    }

    fn wrap(&self, action: &str, next: Next) -> Next {
        let controller = Arc::clone(&self.controller);
        let category = self.category_for(action);

        Arc::new(move |args, ctx| {
            let controller = Arc::clone(&controller);
            let category = category.clone();
            let next = Arc::clone(&next);

            Box::pin(async move {
                let identifier = resolve_identifier(&args, &ctx);
                match controller.check_and_consume(&identifier, &category).await {
                    Admission::Allowed(info) => {
                        if info.degraded {
                            warn!(
                                "limiter degraded, '{}' admitted unchecked for {}",
                                category, identifier
                            );
                        } else {
                            debug!(
                                "'{}' admitted for {}, {} of {} remaining",
                                category, identifier, info.remaining, info.limit
                            );
                        }
                        next(args, ctx).await
                    }
                    Admission::Denied(info) => {
                        warn!(
                            "'{}' denied for {}, retry in {}s",
                            category,
                            identifier,
                            info.retry_after_secs.unwrap_or(0)
                        );
                        Err(GuardError::RateLimited {
                            category,
                            identifier,
                            info,
                        })
                    }
                }
            })
        })
    }
}
