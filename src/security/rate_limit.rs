//! Token bucket rate limiting per (actor, action class)
//!
//! Buckets refill continuously at `bucket_size / window` tokens per second and
//! start full, so an actor can burst up to `bucket_size` calls and is then
//! held to the steady rate.

use crate::config::RateLimitRule;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Action classes used by the layer services
pub mod action {
    pub const TOOL_INVOKE: &str = "tool.invoke";
    pub const AGENT_MESSAGE: &str = "agent.message";
    pub const TASK_DELEGATION: &str = "task.delegation";
    pub const WORKFLOW_CONTROL: &str = "workflow.control";
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rule: RateLimitRule, now: Instant) -> Self {
        let max = f64::from(rule.bucket_size.max(1));
        let window = rule.window_secs.max(1) as f64;
        Self {
            tokens: max,
            max_tokens: max,
            refill_rate: max / window,
            last_refill: now,
        }
    }

    /// Refilled to capacity, so indistinguishable from a fresh bucket
    fn is_full_at(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * self.refill_rate >= self.max_tokens
    }

    fn try_consume(&mut self, now: Instant) -> RateDecision {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = self.last_refill.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateDecision::Allowed {
                remaining: self.tokens.floor() as u32,
            }
        } else {
            let deficit = 1.0 - self.tokens;
            RateDecision::Denied {
                retry_after: Duration::from_secs_f64(deficit / self.refill_rate),
            }
        }
    }
}

/// Rate limiter keyed by actor and action class
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<(String, String), TokenBucket>,
    default_rule: RateLimitRule,
    rules: HashMap<String, RateLimitRule>,
}

impl RateLimiter {
    pub fn new(default_rule: RateLimitRule, rules: HashMap<String, RateLimitRule>) -> Self {
        Self {
            buckets: DashMap::new(),
            default_rule,
            rules,
        }
    }

    fn rule_for(&self, action: &str) -> RateLimitRule {
        self.rules.get(action).copied().unwrap_or(self.default_rule)
    }

    /// Take one token for `actor` performing `action`
    pub fn check(&self, actor: &str, action: &str) -> RateDecision {
        self.check_at(actor, action, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading
    pub fn check_at(&self, actor: &str, action: &str, now: Instant) -> RateDecision {
        let rule = self.rule_for(action);
        let decision = self
            .buckets
            .entry((actor.to_string(), action.to_string()))
            .or_insert_with(|| TokenBucket::new(rule, now))
            .try_consume(now);

        if let RateDecision::Denied { retry_after } = decision {
            debug!(actor, action, ?retry_after, "Rate limit denied");
        }
        decision
    }

    /// Number of tracked (actor, action) buckets
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Forget buckets that have refilled completely; returns how many went
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        before.saturating_sub(self.buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(bucket_size: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimitRule {
                bucket_size,
                window_secs,
            },
            HashMap::new(),
        )
    }

    #[test]
    fn test_prune_drops_only_refilled_buckets() {
        let limiter = limiter(2, 10);
        let now = Instant::now();
        limiter.check_at("idle", "tool.invoke", now);
        limiter.check_at("busy", "tool.invoke", now + Duration::from_secs(9));
        limiter.check_at("busy", "tool.invoke", now + Duration::from_secs(9));
        assert_eq!(limiter.tracked(), 2);

        // "idle" regained its token after 5s; "busy" is still drained
        assert_eq!(limiter.prune_at(now + Duration::from_secs(10)), 1);
        assert_eq!(limiter.tracked(), 1);
        assert!(!limiter
            .check_at("busy", "tool.invoke", now + Duration::from_secs(10))
            .is_allowed());
    }

    #[test]
    fn test_burst_then_deny() {
        let limiter = limiter(3, 60);
        let now = Instant::now();

        assert_eq!(
            limiter.check_at("a", action::TOOL_INVOKE, now),
            RateDecision::Allowed { remaining: 2 }
        );
        assert!(limiter.check_at("a", action::TOOL_INVOKE, now).is_allowed());
        assert!(limiter.check_at("a", action::TOOL_INVOKE, now).is_allowed());

        match limiter.check_at("a", action::TOOL_INVOKE, now) {
            RateDecision::Denied { retry_after } => {
                let secs = retry_after.as_secs_f64();
                assert!((19.9..=20.1).contains(&secs), "retry_after was {secs}");
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_continuous_refill() {
        let limiter = limiter(2, 2);
        let start = Instant::now();
        assert!(limiter.check_at("a", "x", start).is_allowed());
        assert!(limiter.check_at("a", "x", start).is_allowed());
        assert!(!limiter.check_at("a", "x", start).is_allowed());

        let later = start + Duration::from_millis(1000);
        assert!(limiter.check_at("a", "x", later).is_allowed());
        assert!(!limiter.check_at("a", "x", later).is_allowed());
    }

    #[test]
    fn test_buckets_are_per_actor_and_action() {
        let limiter = limiter(1, 60);
        let now = Instant::now();
        assert!(limiter.check_at("a", "x", now).is_allowed());
        assert!(limiter.check_at("b", "x", now).is_allowed());
        assert!(limiter.check_at("a", "y", now).is_allowed());
        assert!(!limiter.check_at("a", "x", now).is_allowed());
        assert_eq!(limiter.tracked(), 3);
    }

    #[test]
    fn test_action_class_override() {
        let mut rules = HashMap::new();
        rules.insert(
            action::WORKFLOW_CONTROL.to_string(),
            RateLimitRule {
                bucket_size: 1,
                window_secs: 60,
            },
        );
        let limiter = RateLimiter::new(
            RateLimitRule {
                bucket_size: 100,
                window_secs: 60,
            },
            rules,
        );
        let now = Instant::now();
        assert!(limiter.check_at("a", action::WORKFLOW_CONTROL, now).is_allowed());
        assert!(!limiter.check_at("a", action::WORKFLOW_CONTROL, now).is_allowed());
        assert!(limiter.check_at("a", action::TOOL_INVOKE, now).is_allowed());
    }

    proptest! {
        #[test]
        fn admits_at_most_bucket_size_per_window(bucket in 1u32..50, window in 1u64..120, extra in 1u32..20) {
            let limiter = limiter(bucket, window);
            let now = Instant::now();

            let admitted = (0..bucket + extra)
                .filter(|_| limiter.check_at("actor", "action", now).is_allowed())
                .count();
            prop_assert_eq!(admitted as u32, bucket);

            match limiter.check_at("actor", "action", now) {
                RateDecision::Denied { retry_after } => prop_assert!(retry_after >= Duration::ZERO),
                RateDecision::Allowed { .. } => prop_assert!(false, "bucket should be empty"),
            }
        }
    }
}
