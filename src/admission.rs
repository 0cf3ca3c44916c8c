//! Admission gate for incoming error events.
//!
//! Combines a severity threshold, a global cooldown after the last successful
//! patch and a per-message retry budget. Rejections are logged by the caller,
//! never surfaced as session failures.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::PolicyConfig;
use crate::monitor::{ErrorEvent, Severity};

/// Why an event was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Disabled,
    BelowThreshold {
        severity: Severity,
        threshold: Severity,
    },
    CoolingDown {
        remaining: Duration,
    },
    RetryBudgetExhausted {
        attempts: u32,
        max: u32,
    },
    AlreadyInFlight,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "guardian disabled"),
            Self::BelowThreshold {
                severity,
                threshold,
            } => write!(f, "severity {} below threshold {}", severity, threshold),
            Self::CoolingDown { remaining } => {
                write!(f, "cooling down for another {}ms", remaining.as_millis())
            }
            Self::RetryBudgetExhausted { attempts, max } => {
                write!(f, "retry budget exhausted ({}/{})", attempts, max)
            }
            Self::AlreadyInFlight => write!(f, "a session for this error is already active"),
        }
    }
}

#[derive(Default)]
struct GateState {
    retries: HashMap<String, u32>,
    last_success: Option<Instant>,
}

/// Retry counters are keyed by error message, not event id, so repeats of
/// the same failure share one budget.
#[derive(Default)]
pub struct AdmissionGate {
    state: Mutex<GateState>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate one event against the current policy.
    pub fn check(
        &self,
        event: &ErrorEvent,
        policy: &PolicyConfig,
        in_flight: bool,
    ) -> Result<(), Rejection> {
        if !policy.enabled {
            return Err(Rejection::Disabled);
        }
        if !event.severity.meets(policy.severity_threshold) {
            return Err(Rejection::BelowThreshold {
                severity: event.severity,
                threshold: policy.severity_threshold,
            });
        }

        let state = self.state();
        if let Some(last) = state.last_success {
            let elapsed = last.elapsed();
            let cooldown = policy.cooldown();
            if elapsed < cooldown {
                return Err(Rejection::CoolingDown {
                    remaining: cooldown - elapsed,
                });
            }
        }

        let attempts = state.retries.get(&event.message).copied().unwrap_or(0);
        if attempts >= policy.max_retries {
            return Err(Rejection::RetryBudgetExhausted {
                attempts,
                max: policy.max_retries,
            });
        }

        if in_flight {
            return Err(Rejection::AlreadyInFlight);
        }
        Ok(())
    }

    /// Count a failed attempt. Returns the new attempt count.
    pub fn record_failure(&self, message: &str) -> u32 {
        let mut state = self.state();
        let count = state.retries.entry(message.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Clear the message's retry counter and restart the cooldown clock.
    pub fn record_success(&self, message: &str) {
        let mut state = self.state();
        state.retries.remove(message);
        state.last_success = Some(Instant::now());
    }

    pub fn attempts(&self, message: &str) -> u32 {
        self.state().retries.get(message).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        let mut state = self.state();
        state.retries.clear();
        state.last_success = None;
    }
}
