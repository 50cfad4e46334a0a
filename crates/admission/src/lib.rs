//! STAMINA: Token-bucket admission control for outbound tool calls.
//!
//! Each (category, identifier) pair owns a bucket seeded with `burst` tokens
//! that refills continuously at `requests / window` per second. Every allowed
//! call burns one token. Bucket state lives in the shared [`KvStore`] with a
//! TTL of twice the window, so idle buckets evaporate on their own and
//! multiple processes sharing a networked store observe the same counters.
//!
//! If the store drops off the radar the controller fails OPEN: the call is
//! allowed, the admission info is flagged degraded, and the outage is
//! visible through [`AdmissionController::is_degraded`]. Availability of the
//! protected action outranks strict limiting during store outages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use samguard_store::{KvStore, Result as StoreResult};

/// Swap attempts before giving up on a contended bucket. Losing a swap means
/// another caller updated the bucket since our read, so each retry starts
/// from fresh state; exhaustion denies rather than over-admitting.
const MAX_CAS_ATTEMPTS: u32 = 32;

/// Rate limit policy for one category. Immutable after load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Sustained requests per window.
    pub requests: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Bucket capacity: calls allowed back-to-back from a cold start.
    pub burst: u32,
}

impl RateLimitPolicy {
    pub fn new(requests: u32, window_secs: u64, burst: u32) -> Self {
        Self {
            requests,
            window_secs,
            burst,
        }
    }

    /// Refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests) / self.window_secs.max(1) as f64
    }

    /// Stored-bucket TTL: twice the window, so idle buckets self-expire.
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.window_secs.max(1) * 2)
    }
}

/// Per-category policies with a default fallback.
///
/// Lookup is by exact category name only; unknown categories get the
/// default. The table is built once at startup and never mutates.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<String, RateLimitPolicy>,
    default: RateLimitPolicy,
}

impl PolicyTable {
    pub fn new(
        default: RateLimitPolicy,
        entries: impl IntoIterator<Item = (String, RateLimitPolicy)>,
    ) -> Self {
        Self {
            policies: entries.into_iter().collect(),
            default,
        }
    }

    /// Built-in deployment defaults.
    pub fn builtin() -> Self {
        let entries = [
            ("rpc", RateLimitPolicy::new(100, 60, 10)),
            ("quote", RateLimitPolicy::new(60, 60, 10)),
            ("fetch", RateLimitPolicy::new(300, 60, 20)),
            ("search", RateLimitPolicy::new(30, 60, 5)),
            ("transfer", RateLimitPolicy::new(5, 60, 2)),
            ("trade", RateLimitPolicy::new(10, 60, 2)),
        ];
        Self::new(
            RateLimitPolicy::new(60, 60, 10),
            entries.map(|(name, policy)| (name.to_string(), policy)),
        )
    }

    pub fn policy_for(&self, category: &str) -> RateLimitPolicy {
        self.policies.get(category).copied().unwrap_or(self.default)
    }

    /// Add or replace the policy for a category.
    pub fn insert(&mut self, category: impl Into<String>, policy: RateLimitPolicy) {
        self.policies.insert(category.into(), policy);
    }

    pub fn default_policy(&self) -> RateLimitPolicy {
        self.default
    }

    pub fn contains(&self, category: &str) -> bool {
        self.policies.contains_key(category)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Persisted bucket record. Invariant: `0 <= tokens <= burst`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
    pub total_requests: u64,
}

impl BucketState {
    /// Fresh bucket seeded with the full burst.
    pub fn fresh(policy: RateLimitPolicy, now_ms: i64) -> Self {
        Self {
            tokens: f64::from(policy.burst),
            last_refill_ms: now_ms,
            total_requests: 0,
        }
    }

    /// Add tokens for the wall-clock time elapsed since the last refill,
    /// capped at `burst`. A clock that runs backwards adds nothing.
    pub fn refill(&mut self, policy: RateLimitPolicy, now_ms: i64) {
        let elapsed_ms = (now_ms - self.last_refill_ms).max(0);
        let gained = elapsed_ms as f64 / 1000.0 * policy.refill_rate();
        self.tokens = (self.tokens + gained).clamp(0.0, f64::from(policy.burst));
        self.last_refill_ms = now_ms;
    }

    /// Burn one token if a whole one is available.
    pub fn try_consume(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.total_requests += 1;
            true
        } else {
            false
        }
    }

    /// Seconds until one whole token is available again.
    pub fn retry_after_secs(&self, policy: RateLimitPolicy) -> u64 {
        let deficit = (1.0 - self.tokens).max(0.0);
        (deficit / policy.refill_rate()).ceil() as u64
    }
}

/// Snapshot returned with every admission decision.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionInfo {
    /// Sustained limit (requests per window) for the category.
    pub limit: u32,
    /// Whole tokens left in the bucket right now.
    pub remaining: u32,
    pub window_secs: u64,
    /// Present on denials: seconds until the next token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Calls this bucket has admitted over its lifetime.
    pub total_requests: u64,
    /// True when the decision was made without the store (fail-open).
    pub degraded: bool,
}

/// Outcome of [`AdmissionController::check_and_consume`].
///
/// A denial is not an error; it carries the same info as an allowance plus
/// a retry hint. Callers must match, so a denial can never be mistaken for
/// a green light.
#[derive(Debug, Clone)]
pub enum Admission {
    Allowed(AdmissionInfo),
    Denied(AdmissionInfo),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }

    pub fn info(&self) -> &AdmissionInfo {
        match self {
            Admission::Allowed(info) | Admission::Denied(info) => info,
        }
    }

    pub fn into_info(self) -> AdmissionInfo {
        match self {
            Admission::Allowed(info) | Admission::Denied(info) => info,
        }
    }
}

/// Token-bucket admission controller over a shared [`KvStore`].
///
/// All bucket updates go through compare-and-swap, so concurrent callers
/// hammering the same identifier never double-spend a token; contention on
/// one bucket does not touch any other bucket.
pub struct AdmissionController {
    store: Arc<dyn KvStore>,
    policies: PolicyTable,
    degraded: AtomicBool,
    store_errors: AtomicU64,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn KvStore>, policies: PolicyTable) -> Self {
        info!(
            "◆ ADMISSION CONTROL ONLINE: {} categories + default",
            policies.len()
        );
        Self {
            store,
            policies,
            degraded: AtomicBool::new(false),
            store_errors: AtomicU64::new(0),
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// True while the shared store is (or was last seen) unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Store failures observed since startup.
    pub fn store_error_count(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }

    fn bucket_key(category: &str, identifier: &str) -> String {
        format!("ratelimit:{}:{}", category, identifier)
    }

    /// Check the bucket for (category, identifier) and consume one token if
    /// available.
    pub async fn check_and_consume(&self, identifier: &str, category: &str) -> Admission {
        self.check_and_consume_at(identifier, category, Utc::now().timestamp_millis())
            .await
    }

    /// Clock-explicit variant of [`check_and_consume`](Self::check_and_consume).
    pub async fn check_and_consume_at(
        &self,
        identifier: &str,
        category: &str,
        now_ms: i64,
    ) -> Admission {
        let policy = self.policies.policy_for(category);
        let key = Self::bucket_key(category, identifier);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = match self.store.get(&key).await {
                Ok(raw) => raw,
                Err(e) => return self.fail_open(policy, &key, &e),
            };

            let mut bucket = match raw.as_deref() {
                Some(json) => match serde_json::from_str::<BucketState>(json) {
                    Ok(bucket) => bucket,
                    Err(e) => {
                        warn!("Corrupt bucket state at {}, reseeding: {}", key, e);
                        BucketState::fresh(policy, now_ms)
                    }
                },
                None => BucketState::fresh(policy, now_ms),
            };
            bucket.refill(policy, now_ms);

            if bucket.try_consume() {
                let serialized = match serde_json::to_string(&bucket) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to encode bucket state for {}: {}", key, e);
                        return self.allow_degraded(policy);
                    }
                };
                match self
                    .store
                    .compare_and_swap(&key, raw.as_deref(), serialized, policy.ttl())
                    .await
                {
                    Ok(true) => {
                        self.mark_store_healthy();
                        return Admission::Allowed(Self::as_info(&bucket, policy, None, false));
                    }
                    Ok(false) => continue,
                    Err(e) => return self.fail_open(policy, &key, &e),
                }
            } else {
                let retry_after = bucket.retry_after_secs(policy);
                // The refill itself is persisted on denial; losing this swap
                // just means another caller already wrote newer state.
                if let Ok(serialized) = serde_json::to_string(&bucket) {
                    match self
                        .store
                        .compare_and_swap(&key, raw.as_deref(), serialized, policy.ttl())
                        .await
                    {
                        Ok(_) => self.mark_store_healthy(),
                        Err(e) => self.note_store_error(&key, &e),
                    }
                }
                debug!(
                    "Denied {} ({}): retry in {}s",
                    identifier, category, retry_after
                );
                return Admission::Denied(Self::as_info(
                    &bucket,
                    policy,
                    Some(retry_after),
                    false,
                ));
            }
        }

        warn!(
            "Bucket {} still contended after {} swap attempts, denying",
            key, MAX_CAS_ATTEMPTS
        );
        Admission::Denied(AdmissionInfo {
            limit: policy.requests,
            remaining: 0,
            window_secs: policy.window_secs,
            retry_after_secs: Some(1),
            total_requests: 0,
            degraded: false,
        })
    }

    /// Current bucket status without consuming a token.
    pub async fn info(&self, identifier: &str, category: &str) -> StoreResult<AdmissionInfo> {
        self.info_at(identifier, category, Utc::now().timestamp_millis())
            .await
    }

    /// Clock-explicit variant of [`info`](Self::info).
    pub async fn info_at(
        &self,
        identifier: &str,
        category: &str,
        now_ms: i64,
    ) -> StoreResult<AdmissionInfo> {
        let policy = self.policies.policy_for(category);
        let key = Self::bucket_key(category, identifier);

        let mut bucket = match self.store.get(&key).await? {
            Some(json) => {
                serde_json::from_str(&json).unwrap_or_else(|_| BucketState::fresh(policy, now_ms))
            }
            None => BucketState::fresh(policy, now_ms),
        };
        bucket.refill(policy, now_ms);

        let retry_after = if bucket.tokens >= 1.0 {
            None
        } else {
            Some(bucket.retry_after_secs(policy))
        };
        Ok(Self::as_info(&bucket, policy, retry_after, self.is_degraded()))
    }

    /// Drop the bucket for (category, identifier). Other buckets are
    /// untouched. Returns whether a bucket existed.
    pub async fn reset(&self, identifier: &str, category: &str) -> StoreResult<bool> {
        let key = Self::bucket_key(category, identifier);
        let existed = self.store.delete(&key).await?;
        info!("Reset rate limit for {}:{}", category, identifier);
        Ok(existed)
    }

    fn as_info(
        bucket: &BucketState,
        policy: RateLimitPolicy,
        retry_after_secs: Option<u64>,
        degraded: bool,
    ) -> AdmissionInfo {
        AdmissionInfo {
            limit: policy.requests,
            remaining: bucket.tokens.floor() as u32,
            window_secs: policy.window_secs,
            retry_after_secs,
            total_requests: bucket.total_requests,
            degraded,
        }
    }

    fn fail_open(
        &self,
        policy: RateLimitPolicy,
        key: &str,
        err: &samguard_store::StoreError,
    ) -> Admission {
        self.note_store_error(key, err);
        self.allow_degraded(policy)
    }

    fn allow_degraded(&self, policy: RateLimitPolicy) -> Admission {
        Admission::Allowed(AdmissionInfo {
            limit: policy.requests,
            remaining: 0,
            window_secs: policy.window_secs,
            retry_after_secs: None,
            total_requests: 0,
            degraded: true,
        })
    }

    fn note_store_error(&self, key: &str, err: &samguard_store::StoreError) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!("STORE LINK DOWN, failing open ({}): {}", key, err);
        }
    }

    fn mark_store_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("STORE LINK RESTORED, admission control back to strict mode");
        }
    }
}
