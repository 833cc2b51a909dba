//! Rate limiting decision engine.
//!
//! Every inbound request flows through [`RateLimiter::check_rate_limit`],
//! which consults the block map, the rule configuration, the per-rule access
//! lists, and the fixed-window counters, escalating rejections through the
//! violation ledger and feeding admissions to the attack detectors.
//!
//! The engine is an explicit, dependency-injected component: all state is
//! owned by the instance and instances never share anything. It is
//! defense-in-depth, not the sole control, so every internal failure is
//! converted to a fail-open allow carrying a diagnostic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use metrics::{gauge, increment_counter};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::clock::{Clock, SystemClock};
use crate::core::detector::{AttackDetector, DetectionConfig};
use crate::core::violations::ViolationTracker;
use crate::core::{read_guard, write_guard};
use crate::models::{
    AttackSignature, RateLimitConfig, RateLimitDecision, RateLimitRule, RateLimitStatus,
    RuleUsage, Violation,
};
use crate::utils::{format_counter_key, parse_counter_key, window_start};

/// Violations returned by a status query
const STATUS_VIOLATION_LIMIT: usize = 10;

/// Longest manual block accepted, in minutes (one year). Requested durations
/// beyond this are clamped; `chrono::Duration::minutes` panics far past it.
const MAX_BLOCK_MINUTES: u64 = 60 * 24 * 365;

/// Errors that can occur inside the engine
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// A store lock could not be acquired within the bounded wait
    #[error("store '{0}' is unavailable: lock wait timed out")]
    StorageUnavailable(&'static str),
    /// A corrupt entry was found during cleanup; discarded, never raised
    #[error("malformed state discarded: {0}")]
    MalformedState(String),
}

/// Adaptive rate limiting and attack detection engine
pub struct RateLimiter {
    /// Per-rule limiting parameters and access lists
    configs: RwLock<HashMap<RateLimitRule, RateLimitConfig>>,
    /// Fixed-window counters keyed by "{rule}:{ip}:{window_start}"
    counters: RwLock<HashMap<String, u32>>,
    /// Global temporary denials: ip -> blocked until
    blocks: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Violation history feeding penalties and adaptive thresholds
    violations: ViolationTracker,
    /// Rolling timeline and attack classifiers
    detector: AttackDetector,
    /// Time source
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create an engine using the wall clock.
    pub fn new(
        configs: HashMap<RateLimitRule, RateLimitConfig>,
        detection: DetectionConfig,
    ) -> Self {
        Self::with_clock(configs, detection, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(
        configs: HashMap<RateLimitRule, RateLimitConfig>,
        detection: DetectionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            configs: RwLock::new(configs),
            counters: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
            violations: ViolationTracker::new(),
            detector: AttackDetector::new(detection),
            clock,
        }
    }

    /// Decide whether a request is admitted.
    ///
    /// # Arguments
    ///
    /// * `rule` - The protected operation class being exercised
    /// * `ip` - Source IP of the request
    /// * `user_id` - Authenticated user, when known; recorded with violations
    /// * `endpoint` - Request path; admissions carrying one feed the detectors
    ///
    /// Internal failures never reject: they surface as an allow decision with
    /// the `error` field set.
    pub async fn check_rate_limit(
        &self,
        rule: RateLimitRule,
        ip: &str,
        user_id: Option<&str>,
        endpoint: Option<&str>,
    ) -> RateLimitDecision {
        let decision = match self.check_inner(rule, ip, user_id, endpoint).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    "rate limit check failed open: rule={} ip={} error={}",
                    rule.as_str(),
                    ip,
                    e
                );
                RateLimitDecision::fail_open(e)
            }
        };

        let result = if decision.error.is_some() {
            "error"
        } else if decision.allowed {
            if decision.whitelisted {
                "whitelisted"
            } else {
                "allowed"
            }
        } else {
            match decision.reason.as_deref() {
                Some("blocked") => "blocked",
                Some("blacklisted") => "blacklisted",
                _ => "rate_limited",
            }
        };
        increment_counter!("rate_shield_decisions_total", "result" => result);

        decision
    }

    async fn check_inner(
        &self,
        rule: RateLimitRule,
        ip: &str,
        user_id: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now = self.clock.now();

        // 1. Global block map, before any rule logic.
        if let Some(retry_after) = self.active_block_seconds(ip, now).await? {
            let mut decision = RateLimitDecision::reject("blocked");
            decision.retry_after = Some(retry_after);
            return Ok(decision);
        }

        // 2. An unconfigured rule is not limited.
        let config = {
            let configs = read_guard(&self.configs, "configs").await?;
            match configs.get(&rule) {
                Some(config) => config.clone(),
                None => {
                    debug!("no config for rule {}, allowing", rule.as_str());
                    return Ok(RateLimitDecision::allow());
                }
            }
        };

        // 3. Whitelist wins over blacklist; checked first on purpose.
        if config.whitelist.contains(ip) {
            let mut decision = RateLimitDecision::allow();
            decision.whitelisted = true;
            return Ok(decision);
        }

        // 4. Rule-scoped blacklist.
        if config.blacklist.contains(ip) {
            let mut decision = RateLimitDecision::reject("blacklisted");
            decision.blacklisted = true;
            return Ok(decision);
        }

        // 5-6. Current window count against the effective limit.
        let effective_limit = self.violations.effective_limit(&config, ip, now).await?;
        let key = format_counter_key(
            rule,
            ip,
            window_start(now.timestamp(), config.window_size_seconds),
        );

        // 7-8. Check-then-increment is atomic per key: the write guard is
        // held across the read, the comparison, and the insert.
        let mut counters = write_guard(&self.counters, "counters").await?;
        let count = counters.get(&key).copied().unwrap_or(0);
        if count >= effective_limit {
            drop(counters);
            self.handle_rejection(rule, &config, ip, user_id, count, now)
                .await?;
            let mut decision = RateLimitDecision::reject("rate limit exceeded");
            decision.current_count = Some(count);
            decision.limit = Some(effective_limit);
            decision.remaining = Some(0);
            decision.retry_after = Some(config.window_size_seconds);
            return Ok(decision);
        }
        counters.insert(key, count + 1);
        drop(counters);

        if let Some(endpoint) = endpoint {
            self.detector.record_request(ip, endpoint, now).await?;
        }

        let mut decision = RateLimitDecision::allow();
        decision.current_count = Some(count + 1);
        decision.limit = Some(effective_limit);
        decision.remaining = Some(effective_limit.saturating_sub(count + 1));
        Ok(decision)
    }

    /// Record a violation and apply a progressive penalty when earned.
    ///
    /// The rejected request is NOT counted into the window.
    async fn handle_rejection(
        &self,
        rule: RateLimitRule,
        config: &RateLimitConfig,
        ip: &str,
        user_id: Option<&str>,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitError> {
        warn!(
            "rate limit exceeded: rule={} ip={} count={}",
            rule.as_str(),
            ip,
            count
        );
        increment_counter!("rate_shield_violations_total", "rule" => rule.as_str());

        self.violations
            .record(
                Violation {
                    rule,
                    ip: ip.to_string(),
                    user_id: user_id.map(String::from),
                    timestamp: now,
                    requests_count: count,
                },
                now,
            )
            .await?;

        if config.progressive_penalty {
            if let Some(duration) = self.violations.penalty_duration(ip, now).await? {
                let block_until = now + duration;
                let mut blocks = write_guard(&self.blocks, "blocks").await?;
                blocks.insert(ip.to_string(), block_until);
                gauge!("rate_shield_active_blocks", blocks.len() as f64);
                info!(
                    "progressive penalty: ip={} blocked until {}",
                    ip, block_until
                );
            }
        }
        Ok(())
    }

    /// Seconds remaining on an active block, removing stale entries lazily.
    async fn active_block_seconds(
        &self,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, RateLimitError> {
        let mut blocks = write_guard(&self.blocks, "blocks").await?;
        match blocks.get(ip) {
            Some(&until) if until > now => Ok(Some((until - now).num_seconds().max(0) as u64)),
            Some(_) => {
                blocks.remove(ip);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Exempt an IP from the targeted rules (all rules when `None`).
    ///
    /// Idempotent: whitelisting the same IP twice changes nothing.
    pub async fn whitelist_ip(
        &self,
        ip: &str,
        rules: Option<&[RateLimitRule]>,
    ) -> Result<(), RateLimitError> {
        let targets: Vec<RateLimitRule> = match rules {
            Some(rules) => rules.to_vec(),
            None => RateLimitRule::ALL.to_vec(),
        };
        let mut configs = write_guard(&self.configs, "configs").await?;
        for rule in &targets {
            if let Some(config) = configs.get_mut(rule) {
                config.whitelist.insert(ip.to_string());
            }
        }
        info!("whitelisted ip={} for {} rule(s)", ip, targets.len());
        Ok(())
    }

    /// Block an IP globally for the given number of minutes.
    ///
    /// This writes the global block map consulted before any rule logic; it
    /// is distinct from a rule's persistent blacklist set.
    pub async fn blacklist_ip(&self, ip: &str, duration_minutes: u64) -> Result<(), RateLimitError> {
        let minutes = duration_minutes.min(MAX_BLOCK_MINUTES);
        let block_until = self.clock.now() + Duration::minutes(minutes as i64);
        let mut blocks = write_guard(&self.blocks, "blocks").await?;
        blocks.insert(ip.to_string(), block_until);
        gauge!("rate_shield_active_blocks", blocks.len() as f64);
        info!("blacklisted ip={} until {}", ip, block_until);
        Ok(())
    }

    /// Read-only status snapshot for one IP.
    pub async fn get_rate_limit_status(&self, ip: &str) -> Result<RateLimitStatus, RateLimitError> {
        let now = self.clock.now();

        let block_expires = {
            let blocks = read_guard(&self.blocks, "blocks").await?;
            blocks.get(ip).copied().filter(|&until| until > now)
        };
        let recent_violations = self.violations.recent_for(ip, STATUS_VIOLATION_LIMIT).await?;
        let configs = {
            let configs = read_guard(&self.configs, "configs").await?;
            configs.clone()
        };

        let mut rules = HashMap::new();
        for (rule, config) in &configs {
            let limit = self.violations.effective_limit(config, ip, now).await?;
            let key = format_counter_key(
                *rule,
                ip,
                window_start(now.timestamp(), config.window_size_seconds),
            );
            let current_count = {
                let counters = read_guard(&self.counters, "counters").await?;
                counters.get(&key).copied().unwrap_or(0)
            };
            rules.insert(
                *rule,
                RuleUsage {
                    current_count,
                    limit,
                    remaining: limit.saturating_sub(current_count),
                    window_size_seconds: config.window_size_seconds,
                },
            );
        }

        Ok(RateLimitStatus {
            ip: ip.to_string(),
            blocked: block_expires.is_some(),
            block_expires,
            recent_violations,
            rules,
        })
    }

    /// Attack signatures on record, optionally filtered to active ones.
    pub async fn get_attack_signatures(
        &self,
        active_only: bool,
    ) -> Result<Vec<AttackSignature>, RateLimitError> {
        self.detector.get_signatures(active_only).await
    }

    /// Sweep expired state from every store.
    ///
    /// Invoked by the host scheduler; the engine never schedules itself.
    /// Only provably-expired entries are removed, and malformed counter keys
    /// are discarded silently.
    pub async fn cleanup_expired_data(&self) -> Result<(), RateLimitError> {
        let now = self.clock.now();

        let configs = {
            let configs = read_guard(&self.configs, "configs").await?;
            configs.clone()
        };

        let removed_counters = {
            let mut counters = write_guard(&self.counters, "counters").await?;
            let before = counters.len();
            counters.retain(|key, _| match parse_counter_key(key) {
                Some((rule, _, start)) => {
                    let window = configs
                        .get(&rule)
                        .map(|c| c.window_size_seconds)
                        .unwrap_or(0);
                    now.timestamp() - start < 2 * window as i64
                }
                None => {
                    debug!("cleanup: {}", RateLimitError::MalformedState(key.clone()));
                    false
                }
            });
            before - counters.len()
        };

        let removed_blocks = {
            let mut blocks = write_guard(&self.blocks, "blocks").await?;
            let before = blocks.len();
            blocks.retain(|_, until| *until > now);
            gauge!("rate_shield_active_blocks", blocks.len() as f64);
            before - blocks.len()
        };

        let removed_violations = self.violations.prune_expired(now).await?;
        let deactivated = self.detector.deactivate_stale(now).await?;

        info!(
            "cleanup: removed {} counters, {} blocks, {} violations; deactivated {} signatures",
            removed_counters, removed_blocks, removed_violations, deactivated
        );
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn inject_counter(&self, key: &str, count: u32) {
        self.counters.write().await.insert(key.to_string(), count);
    }

    #[cfg(test)]
    pub(crate) async fn counter_len(&self) -> usize {
        self.counters.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn hold_counters(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, HashMap<String, u32>> {
        self.counters.write().await
    }
}
