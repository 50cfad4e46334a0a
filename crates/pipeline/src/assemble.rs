//! Service wiring and chain composition.
//!
//! Everything here is constructed explicitly and passed by handle; there
//! are no process-wide singletons. The CLI and tests build one
//! [`Services`] set, then compose a [`Dispatcher`] from configuration.

use crate::admission::AdmissionInterceptor;
use crate::breaker::BreakerInterceptor;
use crate::chain::{Dispatcher, InterceptPolicy, Interceptor};
use crate::logging::LoggingInterceptor;
use crate::retry::{Backoff, RetryInterceptor};
use samguard_admission::{AdmissionController, PolicyTable, RateLimitPolicy};
use samguard_breaker::{BreakerConfig, BreakerRegistry};
use samguard_config::GuardConfig;
use samguard_sentinel::ErrorTracker;
use samguard_store::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared service handles behind the chain, also used directly by the
/// administrative CLI.
pub struct Services {
    pub store: Arc<dyn KvStore>,
    pub admission: Arc<AdmissionController>,
    pub breakers: Arc<BreakerRegistry>,
    pub tracker: Arc<ErrorTracker>,
}

impl Services {
    /// Wire the service set from configuration. Config policies override
    /// the built-in category table; unnamed categories keep the built-in
    /// defaults.
    pub fn from_config(
        config: &GuardConfig,
        store: Arc<dyn KvStore>,
        tracker: Arc<ErrorTracker>,
    ) -> Self {
        let mut policies = PolicyTable::builtin();
        for (category, entry) in &config.admission.policies {
            policies.insert(
                category.clone(),
                RateLimitPolicy::new(entry.requests, entry.window_secs, entry.burst),
            );
        }

        let admission = Arc::new(AdmissionController::new(Arc::clone(&store), policies));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::new(
            config.breaker.failure_threshold,
            config.breaker.recovery_timeout_secs,
        )));

        Self {
            store,
            admission,
            breakers,
            tracker,
        }
    }
}

/// Compose the interceptor list from configuration.
///
/// Layer order is fixed: logging outermost, then admission, then circuit
/// breaking, then one retry layer per configured policy. Later retry
/// policies sit closer to the action, so when two policies name the same
/// action the later one performs the retries and the earlier one passes
/// its terminal failure straight through.
pub fn build_dispatcher(config: &GuardConfig, services: &Services) -> Dispatcher {
    let mut layers: Vec<Arc<dyn Interceptor>> = Vec::new();

    layers.push(Arc::new(
        LoggingInterceptor::new()
            .include_args(config.logging.include_args)
            .include_result(config.logging.include_result)
            .with_policy(InterceptPolicy::excluding(config.logging.exclude.clone())),
    ));

    if config.admission.enabled {
        layers.push(Arc::new(
            AdmissionInterceptor::new(Arc::clone(&services.admission))
                .with_categories(config.admission.categories.clone()),
        ));
    }

    if config.breaker.enabled {
        layers.push(Arc::new(BreakerInterceptor::new(Arc::clone(
            &services.breakers,
        ))));
    }

    for section in &config.retry {
        let policy = match &section.only {
            Some(names) => InterceptPolicy::only(names.iter().cloned()),
            None => InterceptPolicy::all(),
        }
        .and_excluding(section.exclude.iter().cloned());

        let backoff = Backoff::new(
            section.max_retries,
            Duration::from_millis(section.base_delay_ms),
            section.backoff_factor,
        );
        layers.push(Arc::new(
            RetryInterceptor::new(backoff)
                .with_policy(policy)
                .with_tracker(Arc::clone(&services.tracker)),
        ));
    }

    info!(
        "◆ GUARD CHAIN ASSEMBLED: {} layers ({} retry policies)",
        layers.len(),
        config.retry.len()
    );
    Dispatcher::new(layers)
}
