//! Per-volume serialization and circuit breaking.
//!
//! Every operation that mutates appliance or kernel state for a volume
//! acquires that volume's lock first. Lock acquisition takes the
//! manager-wide mutex only long enough to look up (or insert) the
//! per-volume mutex and MUST release it before awaiting the per-volume
//! lock; holding it across the await would serialize the whole driver
//! behind one slow volume.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

/// Consecutive failures before a volume's breaker opens.
const BREAKER_THRESHOLD: u32 = 3;

#[derive(Error, Debug)]
#[error("circuit breaker open for volume '{0}' after repeated failures")]
pub struct BreakerOpen(pub String);

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    open: bool,
}

pub struct VolumeLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    breakers: RwLock<HashMap<String, BreakerState>>,
    threshold: u32,
}

impl Default for VolumeLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            threshold: BREAKER_THRESHOLD,
        }
    }

    /// Acquire the per-volume lock, creating it lazily on first use.
    pub async fn lock(&self, volume_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(volume_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        // Manager-wide mutex is released; only this volume waits here.
        mutex.lock_owned().await
    }

    /// Gate an operation on the volume's circuit breaker.
    pub fn check_breaker(&self, volume_id: &str) -> Result<(), BreakerOpen> {
        let breakers = self.breakers.read();
        match breakers.get(volume_id) {
            Some(state) if state.open => Err(BreakerOpen(volume_id.to_string())),
            _ => Ok(()),
        }
    }

    pub fn record_success(&self, volume_id: &str) {
        let mut breakers = self.breakers.write();
        if let Some(state) = breakers.get_mut(volume_id) {
            state.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self, volume_id: &str) {
        let mut breakers = self.breakers.write();
        let state = breakers.entry(volume_id.to_string()).or_default();
        state.consecutive_failures += 1;
        if !state.open && state.consecutive_failures >= self.threshold {
            state.open = true;
            warn!(
                volume_id,
                failures = state.consecutive_failures,
                "volume circuit breaker opened; reset annotation required"
            );
        }
    }

    /// Operator-triggered reset (driven by the `reset-circuit-breaker`
    /// annotation on the persistent volume).
    pub fn reset_breaker(&self, volume_id: &str) {
        let mut breakers = self.breakers.write();
        if breakers.remove(volume_id).is_some_and(|s| s.open) {
            info!(volume_id, "volume circuit breaker reset");
        }
    }

    /// Drop lock and breaker state for a deleted volume.
    pub fn forget(&self, volume_id: &str) {
        self.locks.lock().remove(volume_id);
        self.breakers.write().remove(volume_id);
    }
}
