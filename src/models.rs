use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::DetectionConfig;

/// Protected operation classes. Each rule maps 1:1 to a [`RateLimitConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitRule {
    /// Login attempts against the authentication endpoints
    LoginAttempts,
    /// Generic API requests
    ApiRequests,
    /// Reservation submissions
    ReservationRequests,
    /// Availability lookups
    AvailabilityChecks,
    /// Credential brute-force protection
    BruteForceProtection,
}

impl RateLimitRule {
    /// All known rules, in a stable order.
    pub const ALL: [RateLimitRule; 5] = [
        RateLimitRule::LoginAttempts,
        RateLimitRule::ApiRequests,
        RateLimitRule::ReservationRequests,
        RateLimitRule::AvailabilityChecks,
        RateLimitRule::BruteForceProtection,
    ];

    /// Stable identifier used in counter keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitRule::LoginAttempts => "login_attempts",
            RateLimitRule::ApiRequests => "api_requests",
            RateLimitRule::ReservationRequests => "reservation_requests",
            RateLimitRule::AvailabilityChecks => "availability_checks",
            RateLimitRule::BruteForceProtection => "brute_force_protection",
        }
    }

    /// Parse the identifier produced by [`RateLimitRule::as_str`].
    pub fn parse(s: &str) -> Option<RateLimitRule> {
        RateLimitRule::ALL.iter().copied().find(|r| r.as_str() == s)
    }
}

/// Limiting parameters for a single rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per fixed window
    pub requests_per_window: u32,
    /// Window size in seconds
    pub window_size_seconds: u64,
    /// Extra requests tolerated in a burst (reserved for future admission modes)
    pub burst_allowance: u32,
    /// Whether repeated violations escalate into temporary IP blocks
    pub progressive_penalty: bool,
    /// Whether the effective limit shrinks for recently violating IPs
    pub adaptive_threshold: bool,
    /// Floor for the adaptive effective limit
    pub min_requests: u32,
    /// Ceiling on admissions for this rule
    pub max_requests: u32,
    /// IPs exempt from this rule
    pub whitelist: HashSet<String>,
    /// IPs always rejected by this rule
    pub blacklist: HashSet<String>,
}

impl RateLimitConfig {
    fn new(
        requests_per_window: u32,
        window_size_seconds: u64,
        burst_allowance: u32,
        progressive_penalty: bool,
        adaptive_threshold: bool,
        min_requests: u32,
    ) -> Self {
        Self {
            requests_per_window,
            window_size_seconds,
            burst_allowance,
            progressive_penalty,
            adaptive_threshold,
            min_requests,
            max_requests: requests_per_window + burst_allowance,
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
        }
    }
}

/// Recommended per-rule defaults for engine construction
pub fn default_rule_configs() -> HashMap<RateLimitRule, RateLimitConfig> {
    let mut configs = HashMap::new();
    configs.insert(
        RateLimitRule::LoginAttempts,
        RateLimitConfig::new(5, 300, 0, true, false, 5),
    );
    configs.insert(
        RateLimitRule::ApiRequests,
        RateLimitConfig::new(100, 60, 20, false, true, 20),
    );
    configs.insert(
        RateLimitRule::ReservationRequests,
        RateLimitConfig::new(10, 300, 0, true, false, 10),
    );
    configs.insert(
        RateLimitRule::AvailabilityChecks,
        RateLimitConfig::new(50, 60, 0, false, true, 10),
    );
    configs.insert(
        RateLimitRule::BruteForceProtection,
        RateLimitConfig::new(3, 600, 0, true, false, 3),
    );
    configs
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Rejection reason ("blocked", "blacklisted", "rate limit exceeded")
    pub reason: Option<String>,
    /// Requests counted in the current window, including this one when admitted
    pub current_count: Option<u32>,
    /// Effective limit applied to this check
    pub limit: Option<u32>,
    /// Admissions left in the current window
    pub remaining: Option<u32>,
    /// Seconds until the caller should retry
    pub retry_after: Option<u64>,
    /// The IP matched the rule's whitelist
    pub whitelisted: bool,
    /// The IP matched the rule's blacklist
    pub blacklisted: bool,
    /// Internal diagnostic when the engine failed open
    pub error: Option<String>,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            current_count: None,
            limit: None,
            remaining: None,
            retry_after: None,
            whitelisted: false,
            blacklisted: false,
            error: None,
        }
    }

    pub fn reject(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            ..Self::allow()
        }
    }

    /// Fail-open decision carrying the internal failure as a diagnostic
    pub fn fail_open(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::allow()
        }
    }
}

/// A rejected request, retained for penalty and threshold computations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule: RateLimitRule,
    pub ip: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Window count observed at the moment of rejection
    pub requests_count: u32,
}

/// Attack classification emitted by the detectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackType {
    Volumetric,
    Distributed,
    ApplicationLayer,
}

impl AttackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackType::Volumetric => "volumetric",
            AttackType::Distributed => "distributed",
            AttackType::ApplicationLayer => "application_layer",
        }
    }
}

/// A classified, scored anomalous-traffic pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackSignature {
    pub attack_id: String,
    pub attack_type: AttackType,
    pub source_ips: HashSet<String>,
    pub request_count: u64,
    pub unique_endpoints: HashSet<String>,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Detector confidence in [0, 1]
    pub confidence_score: f64,
    /// Cleared by cleanup once the signature has been idle for an hour
    pub is_active: bool,
}

/// Live per-rule usage numbers for one IP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleUsage {
    pub current_count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub window_size_seconds: u64,
}

/// Read-only status snapshot for one IP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub ip: String,
    pub blocked: bool,
    pub block_expires: Option<DateTime<Utc>>,
    /// Most recent violations, newest last, capped at 10
    pub recent_violations: Vec<Violation>,
    pub rules: HashMap<RateLimitRule, RuleUsage>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Cleanup scheduling configuration for the host-side sweep task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Seconds between cleanup sweeps
    pub interval_seconds: u64,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Attack detection thresholds
    pub detection: DetectionConfig,
    /// Cleanup scheduling
    pub cleanup: CleanupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            detection: DetectionConfig::default(),
            cleanup: CleanupConfig {
                interval_seconds: 300,
            },
        }
    }
}
