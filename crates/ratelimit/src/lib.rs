//! nova_ratelimit
//!
//! Atomic sliding-window rate limiting with three layered scopes:
//! per-provider, per-user-per-provider, per-user-per-tier-global.
//!
//! The combined provider+user decision is atomic: if the user-scope check
//! fails after the provider slot was taken, the provider slot is rolled back.
//!
//! Tier limiting adds escalation: five violations inside the rolling window
//! block the user for 15 minutes; a critical abuse signal blocks for 60.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use nova_common::{Clock, SystemClock};

pub const ESCALATION_VIOLATIONS: u32 = 5;
pub const VIOLATION_BLOCK_MILLIS: u64 = 15 * 60 * 1_000;
pub const CRITICAL_BLOCK_MILLIS: u64 = 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_millis: u64,
}

impl RateLimitConfig {
    pub const fn new(max_requests: u32, window_millis: u64) -> Self {
        Self { max_requests, window_millis }
    }
}

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current: u32,
    pub limit: u32,
    pub reset_in_ms: u64,
    /// Present only on denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Bucket {
    /// Admission timestamps inside the window, oldest first.
    timestamps: Vec<u64>,
    window_start: u64,
}

/// One sliding-window limiter over `(scope key) -> bucket`.
/// All state mutations happen under a single lock; hold time is O(1) amortized.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, buckets: Mutex::new(HashMap::new()), clock }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn try_acquire(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now_millis();
        let window = self.config.window_millis;
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            timestamps: Vec::new(),
            window_start: now,
        });

        // Purge expired admissions.
        let cutoff = now.saturating_sub(window);
        bucket.timestamps.retain(|t| *t > cutoff);

        let current = bucket.timestamps.len() as u32;
        if current >= self.config.max_requests {
            let oldest = bucket.timestamps.first().copied().unwrap_or(now);
            let retry_after = (oldest + window).saturating_sub(now);
            return RateLimitDecision {
                allowed: false,
                current,
                limit: self.config.max_requests,
                reset_in_ms: retry_after,
                retry_after_ms: Some(retry_after),
            };
        }

        bucket.timestamps.push(now);
        bucket.window_start = now;
        let oldest = bucket.timestamps.first().copied().unwrap_or(now);
        RateLimitDecision {
            allowed: true,
            current: current + 1,
            limit: self.config.max_requests,
            reset_in_ms: (oldest + window).saturating_sub(now),
            retry_after_ms: None,
        }
    }

    /// Remove the newest admission for `key`. Used to undo a provider-scope
    /// slot when the layered user-scope check denies.
    pub fn rollback(&self, key: &str) {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.timestamps.pop();
        }
    }

    /// Drop buckets idle for more than two windows.
    pub fn evict_stale(&self) -> usize {
        let now = self.clock.now_millis();
        let horizon = self.config.window_millis.saturating_mul(2);
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_sub(b.window_start) <= horizon);
        before - buckets.len()
    }

    #[cfg(test)]
    fn bucket_len(&self, key: &str) -> usize {
        self.buckets.lock().get(key).map(|b| b.timestamps.len()).unwrap_or(0)
    }
}

// ----------------------------
// Layered provider/user limiting
// ----------------------------

/// Provider-scope plus user-per-provider-scope, checked in that order.
pub struct LayeredLimiter {
    provider: SlidingWindowLimiter,
    user: SlidingWindowLimiter,
}

impl LayeredLimiter {
    pub fn new(provider_config: RateLimitConfig, user_config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider: SlidingWindowLimiter::with_clock(provider_config, clock.clone()),
            user: SlidingWindowLimiter::with_clock(user_config, clock),
        }
    }

    /// Acquire both scopes atomically. A user-scope denial rolls back the
    /// provider slot so the provider count is unchanged by the failed attempt.
    pub fn try_acquire(&self, provider: &str, user_id: Option<&str>) -> RateLimitDecision {
        let provider_decision = self.provider.try_acquire(provider);
        if !provider_decision.allowed {
            return provider_decision;
        }
        let Some(user) = user_id else {
            return provider_decision;
        };

        let user_key = format!("{user}:{provider}");
        let user_decision = self.user.try_acquire(&user_key);
        if !user_decision.allowed {
            self.provider.rollback(provider);
            tracing::debug!(target: "ratelimit", provider, user, "user scope denied, provider slot rolled back");
            return user_decision;
        }
        // Report the tighter of the two views.
        if user_decision.limit - user_decision.current < provider_decision.limit - provider_decision.current {
            user_decision
        } else {
            provider_decision
        }
    }

    pub fn evict_stale(&self) -> usize {
        self.provider.evict_stale() + self.user.evict_stale()
    }
}

// ----------------------------
// Tier limiter with escalation
// ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierLimits {
    pub free: RateLimitConfig,
    pub pro: RateLimitConfig,
    pub enterprise: RateLimitConfig,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: RateLimitConfig::new(30, 60_000),
            pro: RateLimitConfig::new(120, 60_000),
            enterprise: RateLimitConfig::new(600, 60_000),
        }
    }
}

impl TierLimits {
    fn for_tier(&self, tier: Tier) -> RateLimitConfig {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockState {
    pub until_millis: u64,
    pub reason: String,
}

#[derive(Debug, Default)]
struct ViolationRecord {
    timestamps: Vec<u64>,
}

/// Global per-user limiter used at admission, with violation escalation and
/// a blocked-user table consulted before any window math.
pub struct TierLimiter {
    limits: TierLimits,
    limiters: HashMap<Tier, SlidingWindowLimiter>,
    violations: Mutex<HashMap<String, ViolationRecord>>,
    blocked: Mutex<HashMap<String, BlockState>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub enum TierDecision {
    Allowed(RateLimitDecision),
    Limited(RateLimitDecision),
    Blocked(BlockState),
}

impl TierLimiter {
    pub fn new(limits: TierLimits, clock: Arc<dyn Clock>) -> Self {
        let mut limiters = HashMap::new();
        for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
            limiters.insert(tier, SlidingWindowLimiter::with_clock(limits.for_tier(tier), clock.clone()));
        }
        Self { limits, limiters, violations: Mutex::new(HashMap::new()), blocked: Mutex::new(HashMap::new()), clock }
    }

    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    pub fn check(&self, user_id: &str, tier: Tier) -> TierDecision {
        let now = self.clock.now_millis();
        {
            let mut blocked = self.blocked.lock();
            match blocked.get(user_id) {
                Some(state) if state.until_millis > now => {
                    return TierDecision::Blocked(state.clone());
                }
                Some(_) => {
                    blocked.remove(user_id);
                }
                None => {}
            }
        }

        let limiter = &self.limiters[&tier];
        let decision = limiter.try_acquire(&format!("{}:{user_id}", tier.as_str()));
        if decision.allowed {
            return TierDecision::Allowed(decision);
        }

        // Violation escalation: five denials inside the window block the user.
        let window = self.limits.for_tier(tier).window_millis;
        let mut violations = self.violations.lock();
        let record = violations.entry(user_id.to_string()).or_default();
        let cutoff = now.saturating_sub(window);
        record.timestamps.retain(|t| *t > cutoff);
        record.timestamps.push(now);

        if record.timestamps.len() as u32 >= ESCALATION_VIOLATIONS {
            record.timestamps.clear();
            let state = BlockState {
                until_millis: now + VIOLATION_BLOCK_MILLIS,
                reason: "repeated rate limit violations".to_string(),
            };
            self.blocked.lock().insert(user_id.to_string(), state.clone());
            tracing::warn!(target: "ratelimit", user_id, "user blocked after repeated violations");
            return TierDecision::Blocked(state);
        }

        TierDecision::Limited(decision)
    }

    /// Immediate long block on a critical abuse signal (sanitizer critical hit).
    pub fn block_for_abuse(&self, user_id: &str, reason: &str) -> BlockState {
        let state = BlockState {
            until_millis: self.clock.now_millis() + CRITICAL_BLOCK_MILLIS,
            reason: reason.to_string(),
        };
        self.blocked.lock().insert(user_id.to_string(), state.clone());
        tracing::warn!(target: "ratelimit", user_id, reason, "user blocked for abuse");
        state
    }

    pub fn is_blocked(&self, user_id: &str) -> Option<BlockState> {
        let now = self.clock.now_millis();
        self.blocked
            .lock()
            .get(user_id)
            .filter(|s| s.until_millis > now)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_common::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(1_000_000))
    }

    #[test]
    fn window_admits_up_to_limit_then_denies() {
        let c = clock();
        let limiter = SlidingWindowLimiter::with_clock(RateLimitConfig::new(3, 1_000), c.clone());
        for _ in 0..3 {
            assert!(limiter.try_acquire("p").allowed);
        }
        let denied = limiter.try_acquire("p");
        assert!(!denied.allowed);
        assert_eq!(denied.current, 3);
        assert_eq!(denied.retry_after_ms, Some(1_000));

        // Window slides: after the oldest expires a slot frees up.
        c.advance(1_001);
        assert!(limiter.try_acquire("p").allowed);
    }

    #[test]
    fn retry_after_tracks_oldest_admission() {
        let c = clock();
        let limiter = SlidingWindowLimiter::with_clock(RateLimitConfig::new(2, 1_000), c.clone());
        limiter.try_acquire("p");
        c.advance(400);
        limiter.try_acquire("p");
        c.advance(100);
        let denied = limiter.try_acquire("p");
        // Oldest at t0, window 1000, now t0+500.
        assert_eq!(denied.retry_after_ms, Some(500));
    }

    #[test]
    fn user_denial_rolls_back_provider_slot() {
        let c = clock();
        let layered = LayeredLimiter::new(
            RateLimitConfig::new(100, 1_000),
            RateLimitConfig::new(1, 1_000),
            c.clone(),
        );
        assert!(layered.try_acquire("finnhub", Some("u1")).allowed);
        let denied = layered.try_acquire("finnhub", Some("u1"));
        assert!(!denied.allowed);
        // Provider count must be unchanged by the failed attempt.
        assert_eq!(layered.provider.bucket_len("finnhub"), 1);
    }

    #[test]
    fn anonymous_skips_user_scope() {
        let c = clock();
        let layered = LayeredLimiter::new(
            RateLimitConfig::new(2, 1_000),
            RateLimitConfig::new(1, 1_000),
            c,
        );
        assert!(layered.try_acquire("finnhub", None).allowed);
        assert!(layered.try_acquire("finnhub", None).allowed);
        assert!(!layered.try_acquire("finnhub", None).allowed);
    }

    #[test]
    fn stale_buckets_are_evicted() {
        let c = clock();
        let limiter = SlidingWindowLimiter::with_clock(RateLimitConfig::new(3, 1_000), c.clone());
        limiter.try_acquire("a");
        limiter.try_acquire("b");
        c.advance(2_001);
        assert_eq!(limiter.evict_stale(), 2);
    }

    #[test]
    fn five_violations_escalate_to_block() {
        let c = clock();
        let tiers = TierLimiter::new(
            TierLimits {
                free: RateLimitConfig::new(1, 60_000),
                ..Default::default()
            },
            c.clone(),
        );
        assert!(matches!(tiers.check("u", Tier::Free), TierDecision::Allowed(_)));
        for _ in 0..4 {
            assert!(matches!(tiers.check("u", Tier::Free), TierDecision::Limited(_)));
        }
        // Fifth violation escalates.
        let blocked = tiers.check("u", Tier::Free);
        assert!(matches!(blocked, TierDecision::Blocked(_)));

        // Block expires after 15 minutes.
        c.advance(VIOLATION_BLOCK_MILLIS + 60_001);
        assert!(matches!(tiers.check("u", Tier::Free), TierDecision::Allowed(_)));
    }

    #[test]
    fn abuse_block_lasts_an_hour() {
        let c = clock();
        let tiers = TierLimiter::new(TierLimits::default(), c.clone());
        tiers.block_for_abuse("u", "critical injection pattern");
        assert!(tiers.is_blocked("u").is_some());
        c.advance(CRITICAL_BLOCK_MILLIS - 1);
        assert!(tiers.is_blocked("u").is_some());
        c.advance(2);
        assert!(tiers.is_blocked("u").is_none());
    }
}
