//! Control-server adapter.
//!
//! [`client::ApiClient`] wraps every HTTP call to the control server;
//! [`types`] holds the wire payloads. All calls carry the device bearer
//! token and a 30 s deadline. Poll and heartbeat failures are absorbed with
//! [`Backoff`] - they log and retry, never reaching the orchestrator.

pub mod client;
pub mod types;

pub use client::ApiClient;
pub use types::{
    AgentHeartbeatInfo, EventKind, HeartbeatPayload, MessageData, MessagesResponse,
    NotificationKind, NotificationPayload, RegisterResponse, SessionKey, WorkItem,
};

use std::time::Duration;

use rand::Rng;

use crate::constants::{BACKOFF_BASE, BACKOFF_CAP};

/// Exponential backoff with jitter for server-call retries.
///
/// Base 500 ms, factor 2, cap 30 s. Each delay is jittered to
/// `[delay/2, delay)` so a fleet of hubs does not retry in lockstep.
#[derive(Debug)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    /// Fresh backoff with no recorded failures.
    #[must_use]
    pub fn new() -> Self {
        Self { failures: 0 }
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);

        let raw = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(exp))
            .min(BACKOFF_CAP);

        let millis = raw.as_millis() as u64;
        let half = millis / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=half.max(1));
        Duration::from_millis(jittered)
    }

    /// Clear the failure count after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Number of consecutive failures recorded.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        assert!(first >= BACKOFF_BASE / 2);
        assert!(first <= BACKOFF_BASE);

        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d <= BACKOFF_CAP);
        }
        // After many failures the delay sits at the jittered cap.
        let settled = backoff.next_delay();
        assert!(settled >= BACKOFF_CAP / 2);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            let _ = backoff.next_delay();
        }
        assert_eq!(backoff.failures(), 5);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() <= BACKOFF_BASE);
    }
}
