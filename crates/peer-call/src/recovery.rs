//! Connection recovery
//!
//! When an initiator connection reports `Failed`, the service schedules an
//! ICE restart after an exponential backoff. A failed responder waits for
//! the initiator's restart offers instead, bounded by
//! [`RecoveryPolicy::restart_window`]. [`RecoveryController`] keeps the
//! per-peer counters and decides whether another attempt is allowed; the
//! service owns the timers and the actual offer.

use crate::session::PeerKey;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for ICE-restart recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Maximum number of recovery attempts per failure streak (default: 5)
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add 0-25% jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RecoveryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.backoff_initial_ms == 0 {
            return Err(Error::InvalidConfig(
                "recovery.backoff_initial_ms must be greater than zero".to_string(),
            ));
        }

        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "recovery.backoff_max_ms ({}) must be >= backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }

        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "recovery.backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        Ok(())
    }

    /// Backoff before the given attempt (0-indexed)
    ///
    /// `initial * multiplier^attempt`, clamped to `backoff_max_ms`, plus up to
    /// 25% jitter when enabled.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self.base_backoff_ms(attempt);

        let final_ms = if self.jitter_enabled {
            backoff_ms + rand_jitter(backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Longest time a remote initiator can spend on all of its attempts
    ///
    /// Every attempt waits its backoff with the largest jitter, then up to
    /// `offer_timeout` for the answer. One more `offer_timeout` covers the
    /// first restart offer arriving late.
    pub fn restart_window(&self, offer_timeout: Duration) -> Duration {
        let attempts: Duration = (0..self.max_retries)
            .map(|attempt| {
                let backoff_ms = self.base_backoff_ms(attempt);
                let backoff_ms = if self.jitter_enabled {
                    backoff_ms * 1.25
                } else {
                    backoff_ms
                };
                Duration::from_millis(backoff_ms.ceil() as u64) + offer_timeout
            })
            .sum();
        attempts + offer_timeout
    }

    fn base_backoff_ms(&self, attempt: u32) -> f64 {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        backoff_ms.min(self.backoff_max_ms as f64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Time-seeded jitter in `[0, max)`
fn rand_jitter(max: f64) -> f64 {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as f64;
    (seed % 1000.0) / 1000.0 * max
}

/// What to do about a failed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Run attempt number `attempt` (1-based) after `delay`
    Schedule { attempt: u32, delay: Duration },
    /// An attempt is already waiting on its backoff
    AlreadyPending,
    /// No attempts left; reported once per failure streak
    Exhausted { attempts: u32 },
    /// Exhaustion was already reported for this failure streak
    GaveUp,
}

/// One failure streak of a connection, from `Failed` until `Connected`
#[derive(Debug)]
struct RecoveryEntry {
    streak: u64,
    attempts: u32,
    pending: bool,
    exhausted: bool,
}

/// Per-peer recovery bookkeeping
pub struct RecoveryController {
    policy: RecoveryPolicy,
    entries: Mutex<HashMap<PeerKey, RecoveryEntry>>,
    next_streak: AtomicU64,
}

impl RecoveryController {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
            next_streak: AtomicU64::new(1),
        }
    }

    fn entry<'a>(
        &self,
        entries: &'a mut HashMap<PeerKey, RecoveryEntry>,
        key: &PeerKey,
    ) -> &'a mut RecoveryEntry {
        entries.entry(key.clone()).or_insert_with(|| RecoveryEntry {
            streak: self.next_streak.fetch_add(1, Ordering::Relaxed),
            attempts: 0,
            pending: false,
            exhausted: false,
        })
    }

    /// Record a transition to `Failed` of an initiator connection
    pub fn on_failed(&self, key: &PeerKey) -> RecoveryDecision {
        let mut entries = self.entries.lock();
        let entry = self.entry(&mut entries, key);

        if entry.exhausted {
            return RecoveryDecision::GaveUp;
        }

        if entry.pending {
            debug!(participant = %key.participant, "Recovery already pending");
            return RecoveryDecision::AlreadyPending;
        }

        if !self.policy.should_retry(entry.attempts) {
            warn!(
                participant = %key.participant,
                attempts = entry.attempts,
                "Recovery attempts exhausted"
            );
            entry.exhausted = true;
            return RecoveryDecision::Exhausted {
                attempts: entry.attempts,
            };
        }

        let delay = self.policy.calculate_backoff(entry.attempts);
        entry.attempts += 1;
        entry.pending = true;

        RecoveryDecision::Schedule {
            attempt: entry.attempts,
            delay,
        }
    }

    /// The backoff elapsed and the attempt is running
    pub fn attempt_started(&self, key: &PeerKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.pending = false;
        }
    }

    /// Record a transition to `Failed` of a responder connection
    ///
    /// Returns the failure streak and how long to wait for the initiator's
    /// restart offers, or `None` when a wait is already running or the
    /// streak was given up.
    pub fn on_remote_failed(&self, key: &PeerKey, offer_timeout: Duration) -> Option<(u64, Duration)> {
        let mut entries = self.entries.lock();
        let entry = self.entry(&mut entries, key);
        if entry.pending || entry.exhausted {
            return None;
        }
        entry.pending = true;
        Some((entry.streak, self.policy.restart_window(offer_timeout)))
    }

    /// Count a restart offer received while waiting
    pub fn on_remote_offer(&self, key: &PeerKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            if entry.pending {
                entry.attempts += 1;
            }
        }
    }

    /// The responder wait of `streak` ran out
    ///
    /// Returns the restart offers seen if the streak is still the current
    /// one, and gives it up.
    pub fn remote_wait_expired(&self, key: &PeerKey, streak: u64) -> Option<u32> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key).filter(|e| e.streak == streak && e.pending)?;
        entry.pending = false;
        entry.exhausted = true;
        Some(entry.attempts)
    }

    /// Record a transition to `Connected`; resets the counter
    pub fn on_connected(&self, key: &PeerKey) {
        if let Some(entry) = self.entries.lock().remove(key) {
            if entry.attempts > 0 {
                debug!(
                    participant = %key.participant,
                    attempts = entry.attempts,
                    "Connection recovered"
                );
            }
        }
    }

    pub fn attempts(&self, key: &PeerKey) -> u32 {
        self.entries.lock().get(key).map(|e| e.attempts).unwrap_or(0)
    }

    pub fn forget(&self, key: &PeerKey) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
