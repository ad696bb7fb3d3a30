//! Session circuit breaker.
//!
//! After a run of consecutive command failures the breaker opens and calls
//! fail fast with a retriable error instead of queueing onto a session that
//! is misbehaving. Once the cooldown elapses a single probe call is let
//! through; its outcome closes or re-opens the breaker.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug)]
struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Gate a call. `Err(())` means the breaker is open and the call must
    /// fail fast; `Ok(())` admits the call (possibly as the half-open probe).
    pub fn try_acquire(&self) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        match inner.opened_at {
            None => Ok(()),
            Some(opened) if opened.elapsed() < self.cooldown => Err(()),
            Some(_) => {
                // Cooldown elapsed: admit exactly one probe.
                if inner.probe_in_flight {
                    Err(())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        inner.consecutive_failures += 1;
        if inner.opened_at.is_some() {
            // Failed probe: restart the cooldown.
            inner.opened_at = Some(Instant::now());
        } else if inner.consecutive_failures >= self.threshold {
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "appliance session circuit breaker opened"
            );
            inner.opened_at = Some(Instant::now());
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.inner.lock().opened_at.is_some()
    }
}
