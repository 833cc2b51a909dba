//! Core functionality of the rate limiting engine.
//!
//! This module contains the engine components: the decision engine with its
//! window counters and block map, the violation ledger with progressive
//! penalties and adaptive thresholds, the attack detectors, and the
//! injectable clock.

pub mod clock;
pub mod detector;
pub mod limiter;
pub mod violations;

use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::timeout;

pub use clock::{Clock, SystemClock};
pub use detector::{AttackDetector, DetectionConfig};
pub use limiter::{RateLimitError, RateLimiter};
pub use violations::ViolationTracker;

/// Longest a decision call will wait on any store lock. Waits past this are
/// treated as `StorageUnavailable`, which the decision path converts to a
/// fail-open allow.
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Acquire a read guard, failing with `StorageUnavailable` on a stuck lock.
pub(crate) async fn read_guard<'a, T>(
    lock: &'a RwLock<T>,
    store: &'static str,
) -> Result<RwLockReadGuard<'a, T>, RateLimitError> {
    timeout(LOCK_WAIT_TIMEOUT, lock.read())
        .await
        .map_err(|_| RateLimitError::StorageUnavailable(store))
}

/// Acquire a write guard, failing with `StorageUnavailable` on a stuck lock.
pub(crate) async fn write_guard<'a, T>(
    lock: &'a RwLock<T>,
    store: &'static str,
) -> Result<RwLockWriteGuard<'a, T>, RateLimitError> {
    timeout(LOCK_WAIT_TIMEOUT, lock.write())
        .await
        .map_err(|_| RateLimitError::StorageUnavailable(store))
}
