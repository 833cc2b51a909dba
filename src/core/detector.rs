//! Attack detection over a shared rolling request timeline.
//!
//! Admitted, endpoint-tagged requests are appended to a five-minute timeline.
//! Three independent classifiers run on every append and emit
//! [`AttackSignature`] records: volumetric (request flood), distributed
//! (many source IPs), and application-layer (one IP probing many endpoints).
//!
//! Signatures are created once and retained for historical queries; cleanup
//! deactivates idle ones but never deletes them. There is no dedup window
//! beyond a single detection tick, so a sustained attack can produce
//! near-duplicate signatures.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use log::warn;
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::limiter::RateLimitError;
use crate::core::{read_guard, write_guard};
use crate::models::{AttackSignature, AttackType};

/// Seconds a signature may sit idle before cleanup deactivates it
const SIGNATURE_IDLE_SECONDS: i64 = 3600;

/// Attack detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Requests observed in the volumetric window before a flood is flagged
    pub volumetric_request_threshold: u32,
    /// Volumetric observation window (seconds)
    pub volumetric_window_seconds: u32,
    /// Distinct source IPs before a distributed attack is flagged
    pub distributed_ip_threshold: u32,
    /// Distributed observation window (seconds)
    pub distributed_window_seconds: u32,
    /// Per-IP request count before application-layer analysis applies
    pub app_layer_request_threshold: u32,
    /// Per-IP distinct endpoints before an application-layer attack is flagged
    pub app_layer_endpoint_threshold: u32,
    /// Endpoint count that maps to full application-layer confidence
    pub app_layer_confidence_divisor: f64,
    /// How long timeline entries are retained (seconds)
    pub timeline_retention_seconds: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            volumetric_request_threshold: 1000,
            volumetric_window_seconds: 60,
            distributed_ip_threshold: 100,
            distributed_window_seconds: 120,
            app_layer_request_threshold: 50,
            app_layer_endpoint_threshold: 10,
            app_layer_confidence_divisor: 20.0,
            timeline_retention_seconds: 300,
        }
    }
}

/// One admitted, endpoint-tagged request
#[derive(Debug, Clone)]
struct TimelineEntry {
    timestamp: DateTime<Utc>,
    ip: String,
    endpoint: String,
}

/// Rolling request timeline and the three classifiers that read it
pub struct AttackDetector {
    config: DetectionConfig,
    timeline: RwLock<VecDeque<TimelineEntry>>,
    signatures: RwLock<Vec<AttackSignature>>,
}

impl AttackDetector {
    /// Create a new detector instance
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            timeline: RwLock::new(VecDeque::new()),
            signatures: RwLock::new(Vec::new()),
        }
    }

    /// Record an admitted request and run all three classifiers.
    ///
    /// Returns the number of signatures created by this tick.
    pub async fn record_request(
        &self,
        ip: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, RateLimitError> {
        let mut created = Vec::new();
        {
            let retention = Duration::seconds(self.config.timeline_retention_seconds as i64);
            let mut timeline = write_guard(&self.timeline, "timeline").await?;
            let cutoff = now - retention;
            timeline.retain(|entry| entry.timestamp > cutoff);
            timeline.push_back(TimelineEntry {
                timestamp: now,
                ip: ip.to_string(),
                endpoint: endpoint.to_string(),
            });

            if let Some(sig) = self.detect_volumetric(&timeline, now) {
                created.push(sig);
            }
            if let Some(sig) = self.detect_distributed(&timeline, now) {
                created.push(sig);
            }
            created.extend(self.detect_application_layer(&timeline, now));
        }

        if created.is_empty() {
            return Ok(0);
        }

        let count = created.len();
        let mut signatures = write_guard(&self.signatures, "signatures").await?;
        for sig in created {
            warn!(
                "attack detected: type={} sources={} confidence={:.2}",
                sig.attack_type.as_str(),
                sig.source_ips.len(),
                sig.confidence_score
            );
            increment_counter!(
                "rate_shield_attacks_detected_total",
                "attack_type" => sig.attack_type.as_str()
            );
            signatures.push(sig);
        }
        Ok(count)
    }

    /// Request flood: too many admissions inside the volumetric window.
    fn detect_volumetric(
        &self,
        timeline: &VecDeque<TimelineEntry>,
        now: DateTime<Utc>,
    ) -> Option<AttackSignature> {
        let cutoff = now - Duration::seconds(self.config.volumetric_window_seconds as i64);
        let recent: Vec<&TimelineEntry> =
            timeline.iter().filter(|e| e.timestamp > cutoff).collect();
        let threshold = self.config.volumetric_request_threshold;
        if recent.len() <= threshold as usize {
            return None;
        }
        let source_ips: HashSet<String> = recent.iter().map(|e| e.ip.clone()).collect();
        let confidence = (recent.len() as f64 / threshold as f64).min(1.0);
        Some(self.signature(
            AttackType::Volumetric,
            source_ips,
            recent.len() as u64,
            HashSet::new(),
            confidence,
            now,
        ))
    }

    /// Distributed attack: too many distinct source IPs in the window.
    fn detect_distributed(
        &self,
        timeline: &VecDeque<TimelineEntry>,
        now: DateTime<Utc>,
    ) -> Option<AttackSignature> {
        let cutoff = now - Duration::seconds(self.config.distributed_window_seconds as i64);
        let mut source_ips = HashSet::new();
        let mut request_count = 0u64;
        for entry in timeline.iter().filter(|e| e.timestamp > cutoff) {
            source_ips.insert(entry.ip.clone());
            request_count += 1;
        }
        let threshold = self.config.distributed_ip_threshold;
        if source_ips.len() <= threshold as usize {
            return None;
        }
        let confidence = (source_ips.len() as f64 / threshold as f64).min(1.0);
        Some(self.signature(
            AttackType::Distributed,
            source_ips,
            request_count,
            HashSet::new(),
            confidence,
            now,
        ))
    }

    /// Endpoint probing: one IP hammering many distinct endpoints.
    fn detect_application_layer(
        &self,
        timeline: &VecDeque<TimelineEntry>,
        now: DateTime<Utc>,
    ) -> Vec<AttackSignature> {
        let mut per_ip: HashMap<&str, (u64, HashSet<&str>)> = HashMap::new();
        for entry in timeline.iter() {
            let slot = per_ip.entry(entry.ip.as_str()).or_default();
            slot.0 += 1;
            slot.1.insert(entry.endpoint.as_str());
        }

        let mut signatures = Vec::new();
        for (ip, (requests, endpoints)) in per_ip {
            if requests <= self.config.app_layer_request_threshold as u64
                || endpoints.len() <= self.config.app_layer_endpoint_threshold as usize
            {
                continue;
            }
            let confidence =
                (endpoints.len() as f64 / self.config.app_layer_confidence_divisor).min(1.0);
            let unique_endpoints = endpoints.iter().map(|e| e.to_string()).collect();
            signatures.push(self.signature(
                AttackType::ApplicationLayer,
                HashSet::from([ip.to_string()]),
                requests,
                unique_endpoints,
                confidence,
                now,
            ));
        }
        signatures
    }

    fn signature(
        &self,
        attack_type: AttackType,
        source_ips: HashSet<String>,
        request_count: u64,
        unique_endpoints: HashSet<String>,
        confidence_score: f64,
        now: DateTime<Utc>,
    ) -> AttackSignature {
        AttackSignature {
            attack_id: Uuid::new_v4().to_string(),
            attack_type,
            source_ips,
            request_count,
            unique_endpoints,
            start_time: now,
            last_activity: now,
            confidence_score,
            is_active: true,
        }
    }

    /// Signatures on record, optionally filtered to active ones.
    pub async fn get_signatures(
        &self,
        active_only: bool,
    ) -> Result<Vec<AttackSignature>, RateLimitError> {
        let signatures = read_guard(&self.signatures, "signatures").await?;
        Ok(signatures
            .iter()
            .filter(|sig| !active_only || sig.is_active)
            .cloned()
            .collect())
    }

    /// Deactivate signatures that have been idle past the grace period.
    ///
    /// Signatures are never deleted; they stay queryable as history.
    pub async fn deactivate_stale(&self, now: DateTime<Utc>) -> Result<usize, RateLimitError> {
        let mut signatures = write_guard(&self.signatures, "signatures").await?;
        let mut deactivated = 0;
        for sig in signatures.iter_mut() {
            if sig.is_active && (now - sig.last_activity).num_seconds() > SIGNATURE_IDLE_SECONDS {
                sig.is_active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn small_config() -> DetectionConfig {
        DetectionConfig {
            volumetric_request_threshold: 10,
            distributed_ip_threshold: 5,
            app_layer_request_threshold: 8,
            app_layer_endpoint_threshold: 3,
            ..DetectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_volumetric_flood_from_distinct_ips() {
        let detector = AttackDetector::new(DetectionConfig::default());
        let now = base_time();

        // 1001 admissions within the 60s window from unique sources.
        for i in 0..1001u32 {
            let ip = format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256);
            detector
                .record_request(&ip, "/api/login", now + Duration::milliseconds(i as i64 * 50))
                .await
                .unwrap();
        }

        let signatures = detector.get_signatures(true).await.unwrap();
        let volumetric: Vec<_> = signatures
            .iter()
            .filter(|s| s.attack_type == AttackType::Volumetric)
            .collect();
        assert!(!volumetric.is_empty());
        let sig = volumetric.last().unwrap();
        assert_eq!(sig.confidence_score, 1.0);
        assert!(sig.is_active);
        assert!(sig.source_ips.len() > 1000);

        // 1001 distinct sources also trips the distributed classifier.
        assert!(signatures
            .iter()
            .any(|s| s.attack_type == AttackType::Distributed));
    }

    #[tokio::test]
    async fn test_volumetric_triggers_past_threshold() {
        let detector = AttackDetector::new(small_config());
        let now = base_time();

        for i in 0..11 {
            detector
                .record_request("10.0.0.1", "/api", now + Duration::milliseconds(i * 10))
                .await
                .unwrap();
        }

        let signatures = detector.get_signatures(true).await.unwrap();
        let sig = signatures
            .iter()
            .find(|s| s.attack_type == AttackType::Volumetric)
            .expect("volumetric signature");
        assert_eq!(sig.confidence_score, 1.0);
        assert_eq!(sig.request_count, 11);
    }

    #[tokio::test]
    async fn test_distributed_requires_distinct_sources() {
        let detector = AttackDetector::new(small_config());
        let now = base_time();

        // Six distinct IPs beats the threshold of five.
        for i in 0..6 {
            detector
                .record_request(
                    &format!("172.16.0.{}", i),
                    "/api",
                    now + Duration::seconds(i),
                )
                .await
                .unwrap();
        }

        let signatures = detector.get_signatures(true).await.unwrap();
        let sig = signatures
            .iter()
            .find(|s| s.attack_type == AttackType::Distributed)
            .expect("distributed signature");
        assert_eq!(sig.source_ips.len(), 6);
        assert_eq!(sig.confidence_score, 1.0);
    }

    #[test]
    fn test_application_layer_probing() {
        tokio_test::block_on(async {
            let detector = AttackDetector::new(small_config());
            let now = base_time();

            // One IP, nine requests over four distinct endpoints.
            for i in 0..9i64 {
                let endpoint = format!("/api/resource/{}", i % 4);
                detector
                    .record_request("192.168.1.50", &endpoint, now + Duration::seconds(i))
                    .await
                    .unwrap();
            }

            let signatures = detector.get_signatures(true).await.unwrap();
            let sig = signatures
                .iter()
                .find(|s| s.attack_type == AttackType::ApplicationLayer)
                .expect("application-layer signature");
            assert_eq!(sig.source_ips, HashSet::from(["192.168.1.50".to_string()]));
            assert_eq!(sig.unique_endpoints.len(), 4);
            assert_eq!(sig.confidence_score, 4.0 / 20.0);
        });
    }

    #[tokio::test]
    async fn test_timeline_entries_expire() {
        let detector = AttackDetector::new(small_config());
        let now = base_time();

        for i in 0..11 {
            detector
                .record_request("10.0.0.9", "/api", now + Duration::milliseconds(i))
                .await
                .unwrap();
        }
        let before = detector.get_signatures(false).await.unwrap().len();
        assert!(before > 0);

        // Six minutes later the timeline has rolled over; a lone request
        // must not retrigger anything.
        detector
            .record_request("10.0.0.9", "/api", now + Duration::minutes(6))
            .await
            .unwrap();
        let after = detector.get_signatures(false).await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_stale_signatures_are_deactivated_not_deleted() {
        let detector = AttackDetector::new(small_config());
        let now = base_time();

        for i in 0..11 {
            detector
                .record_request("10.0.0.7", "/api", now + Duration::milliseconds(i))
                .await
                .unwrap();
        }
        assert!(!detector.get_signatures(true).await.unwrap().is_empty());

        let later = now + Duration::seconds(SIGNATURE_IDLE_SECONDS + 61);
        let deactivated = detector.deactivate_stale(later).await.unwrap();
        assert!(deactivated > 0);

        assert!(detector.get_signatures(true).await.unwrap().is_empty());
        assert!(!detector.get_signatures(false).await.unwrap().is_empty());
    }
}
