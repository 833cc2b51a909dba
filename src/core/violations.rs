//! Violation ledger, progressive penalties, and adaptive thresholds.
//!
//! Rejected requests are recorded per IP and pruned to the last 24 hours.
//! The same per-IP history feeds two escalation mechanisms: progressive
//! penalties (temporary blocks after repeated offenses) and adaptive
//! thresholds (shrinking a rule's effective limit for recent offenders).
//!
//! Violation scoping is per IP across all rules: a violation on one rule
//! throttles every rule for that IP.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::core::limiter::RateLimitError;
use crate::core::{read_guard, write_guard};
use crate::models::{RateLimitConfig, Violation};

/// How long violations are retained
const RETENTION_HOURS: i64 = 24;
/// Lookback window for penalty and threshold computations
const ESCALATION_WINDOW_MINUTES: i64 = 60;
/// Violations within the lookback window before a block is applied
const PENALTY_TRIGGER_COUNT: usize = 3;
/// Block minutes added per violation
const PENALTY_MINUTES_PER_VIOLATION: i64 = 5;
/// Longest block a progressive penalty can impose
const PENALTY_CAP_MINUTES: i64 = 60;
/// Effective-limit reduction per recent violation
const ADAPTIVE_PENALTY_STEP: f64 = 0.2;
/// Largest fraction of the base limit the adaptive threshold may remove
const ADAPTIVE_PENALTY_CAP: f64 = 0.8;

/// Time-pruned, per-IP history of rejected requests
pub struct ViolationTracker {
    violations: RwLock<HashMap<String, Vec<Violation>>>,
}

impl ViolationTracker {
    pub fn new() -> Self {
        Self {
            violations: RwLock::new(HashMap::new()),
        }
    }

    /// Append a violation and prune the IP's history to the retention window.
    pub async fn record(&self, violation: Violation, now: DateTime<Utc>) -> Result<(), RateLimitError> {
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        let mut violations = write_guard(&self.violations, "violations").await?;
        let entries = violations.entry(violation.ip.clone()).or_default();
        entries.push(violation);
        entries.retain(|v| v.timestamp > cutoff);
        Ok(())
    }

    /// Violations recorded for `ip` within the escalation lookback window.
    pub async fn recent_count(&self, ip: &str, now: DateTime<Utc>) -> Result<usize, RateLimitError> {
        let cutoff = now - Duration::minutes(ESCALATION_WINDOW_MINUTES);
        let violations = read_guard(&self.violations, "violations").await?;
        Ok(violations
            .get(ip)
            .map(|entries| entries.iter().filter(|v| v.timestamp > cutoff).count())
            .unwrap_or(0))
    }

    /// Block duration earned by `ip`'s recent offenses, if any.
    ///
    /// The third violation within the lookback window earns a block of
    /// `violations * 5` minutes, capped at 60.
    pub async fn penalty_duration(
        &self,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, RateLimitError> {
        let count = self.recent_count(ip, now).await?;
        if count < PENALTY_TRIGGER_COUNT {
            return Ok(None);
        }
        let minutes = (count as i64 * PENALTY_MINUTES_PER_VIOLATION).min(PENALTY_CAP_MINUTES);
        Ok(Some(Duration::minutes(minutes)))
    }

    /// Limit to enforce for `ip` under `config`.
    ///
    /// Without adaptive thresholds this is the configured limit. With them,
    /// each recent violation removes 20% of the base limit (capped at 80%),
    /// floored at `min_requests`.
    pub async fn effective_limit(
        &self,
        config: &RateLimitConfig,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, RateLimitError> {
        if !config.adaptive_threshold {
            return Ok(config.requests_per_window);
        }
        let count = self.recent_count(ip, now).await?;
        let penalty_factor = (count as f64 * ADAPTIVE_PENALTY_STEP).min(ADAPTIVE_PENALTY_CAP);
        let shrunk = (config.requests_per_window as f64 * (1.0 - penalty_factor)).floor() as u32;
        Ok(shrunk.max(config.min_requests))
    }

    /// Most recent violations for `ip`, oldest first, capped at `limit`.
    pub async fn recent_for(&self, ip: &str, limit: usize) -> Result<Vec<Violation>, RateLimitError> {
        let violations = read_guard(&self.violations, "violations").await?;
        let entries = match violations.get(ip) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }

    /// Drop entries older than the retention window across every IP.
    ///
    /// Returns the number of violations removed.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, RateLimitError> {
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        let mut violations = write_guard(&self.violations, "violations").await?;
        let mut removed = 0;
        violations.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|v| v.timestamp > cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        Ok(removed)
    }
}

impl Default for ViolationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{default_rule_configs, RateLimitRule};
    use chrono::TimeZone;

    fn violation(rule: RateLimitRule, ip: &str, timestamp: DateTime<Utc>) -> Violation {
        Violation {
            rule,
            ip: ip.to_string(),
            user_id: None,
            timestamp,
            requests_count: 5,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_prunes_old_entries() {
        let tracker = ViolationTracker::new();
        let now = base_time();
        let stale = now - Duration::hours(25);

        tracker
            .record(violation(RateLimitRule::LoginAttempts, "1.1.1.1", stale), stale)
            .await
            .unwrap();
        tracker
            .record(violation(RateLimitRule::LoginAttempts, "1.1.1.1", now), now)
            .await
            .unwrap();

        let recent = tracker.recent_for("1.1.1.1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].timestamp, now);
    }

    #[tokio::test]
    async fn test_penalty_starts_at_third_violation() {
        let tracker = ViolationTracker::new();
        let now = base_time();

        for _ in 0..2 {
            tracker
                .record(violation(RateLimitRule::LoginAttempts, "2.2.2.2", now), now)
                .await
                .unwrap();
        }
        assert_eq!(tracker.penalty_duration("2.2.2.2", now).await.unwrap(), None);

        tracker
            .record(violation(RateLimitRule::LoginAttempts, "2.2.2.2", now), now)
            .await
            .unwrap();
        assert_eq!(
            tracker.penalty_duration("2.2.2.2", now).await.unwrap(),
            Some(Duration::minutes(15))
        );
    }

    #[tokio::test]
    async fn test_penalty_is_capped_at_one_hour() {
        let tracker = ViolationTracker::new();
        let now = base_time();

        for _ in 0..20 {
            tracker
                .record(violation(RateLimitRule::ApiRequests, "3.3.3.3", now), now)
                .await
                .unwrap();
        }
        assert_eq!(
            tracker.penalty_duration("3.3.3.3", now).await.unwrap(),
            Some(Duration::minutes(60))
        );
    }

    #[tokio::test]
    async fn test_violations_count_across_rules() {
        let tracker = ViolationTracker::new();
        let now = base_time();

        tracker
            .record(violation(RateLimitRule::LoginAttempts, "4.4.4.4", now), now)
            .await
            .unwrap();
        tracker
            .record(violation(RateLimitRule::ApiRequests, "4.4.4.4", now), now)
            .await
            .unwrap();
        tracker
            .record(violation(RateLimitRule::ReservationRequests, "4.4.4.4", now), now)
            .await
            .unwrap();

        assert_eq!(tracker.recent_count("4.4.4.4", now).await.unwrap(), 3);
        assert!(tracker.penalty_duration("4.4.4.4", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_effective_limit_shrinks_with_violations() {
        let tracker = ViolationTracker::new();
        let now = base_time();
        let config = default_rule_configs()
            .remove(&RateLimitRule::ApiRequests)
            .unwrap();
        assert_eq!(config.requests_per_window, 100);

        assert_eq!(
            tracker.effective_limit(&config, "5.5.5.5", now).await.unwrap(),
            100
        );

        for _ in 0..2 {
            tracker
                .record(violation(RateLimitRule::ApiRequests, "5.5.5.5", now), now)
                .await
                .unwrap();
        }
        assert_eq!(
            tracker.effective_limit(&config, "5.5.5.5", now).await.unwrap(),
            60
        );

        // Penalty factor caps at 0.8 no matter how many violations pile up.
        for _ in 0..10 {
            tracker
                .record(violation(RateLimitRule::ApiRequests, "5.5.5.5", now), now)
                .await
                .unwrap();
        }
        assert_eq!(
            tracker.effective_limit(&config, "5.5.5.5", now).await.unwrap(),
            20
        );
    }

    #[tokio::test]
    async fn test_effective_limit_respects_min_requests() {
        let tracker = ViolationTracker::new();
        let now = base_time();
        let mut config = default_rule_configs()
            .remove(&RateLimitRule::ApiRequests)
            .unwrap();
        config.min_requests = 30;

        for _ in 0..4 {
            tracker
                .record(violation(RateLimitRule::ApiRequests, "6.6.6.6", now), now)
                .await
                .unwrap();
        }
        assert_eq!(
            tracker.effective_limit(&config, "6.6.6.6", now).await.unwrap(),
            30
        );
    }

    #[tokio::test]
    async fn test_non_adaptive_rule_keeps_base_limit() {
        let tracker = ViolationTracker::new();
        let now = base_time();
        let config = default_rule_configs()
            .remove(&RateLimitRule::LoginAttempts)
            .unwrap();

        for _ in 0..5 {
            tracker
                .record(violation(RateLimitRule::LoginAttempts, "7.7.7.7", now), now)
                .await
                .unwrap();
        }
        assert_eq!(
            tracker.effective_limit(&config, "7.7.7.7", now).await.unwrap(),
            config.requests_per_window
        );
    }

    #[tokio::test]
    async fn test_prune_expired_reports_removed_count() {
        let tracker = ViolationTracker::new();
        let now = base_time();
        let stale = now - Duration::hours(30);

        // Record stale entries with a matching "now" so they survive the
        // append-time prune, then sweep with the real clock.
        for _ in 0..3 {
            tracker
                .record(violation(RateLimitRule::ApiRequests, "8.8.8.8", stale), stale)
                .await
                .unwrap();
        }
        tracker
            .record(violation(RateLimitRule::ApiRequests, "9.9.9.9", now), now)
            .await
            .unwrap();

        let removed = tracker.prune_expired(now).await.unwrap();
        assert_eq!(removed, 3);
        assert!(tracker.recent_for("8.8.8.8", 10).await.unwrap().is_empty());
        assert_eq!(tracker.recent_for("9.9.9.9", 10).await.unwrap().len(), 1);
    }
}
