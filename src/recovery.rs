//! Maps a fault taxonomy to remediation attempts with capped retries.
//!
//! A per-fault-class attempt counter with a max of 3 attempts and a
//! "reset attempts on success" rule. Platform-specific remediation (Npcap
//! reinstall, service restart, admin-privilege checks) is left as injectable
//! closures rather than hard-coded subprocess calls, since the concrete
//! mechanism is itself an external collaborator the coordinator supplies.

use std::time::Duration;

use dashmap::DashMap;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecoveryFault {
    CaptureBackendMissing,
    CaptureServiceStopped,
    InsufficientPrivileges,
    NoInterfaces,
    ModelLoadFailed,
    CaptureOpenTransient,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Remediation succeeded; the caller should retry the original operation.
    Recovered,
    /// Remediation attempted and failed, but attempts remain.
    AttemptFailed,
    /// The fault has no strategy to run, or the failure is unconditionally fatal.
    Fatal { remediation: String },
    /// `max_attempts` reached for this fault class.
    AttemptsExhausted,
}

/// Injectable backend-specific hooks. None of these are wired to a concrete
/// platform mechanism here; the coordinator supplies closures appropriate to
/// its deployment, since the capture backend is itself an external
/// collaborator.
pub struct RecoveryHooks {
    pub install_backend: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    pub start_service: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    pub reenumerate_interfaces: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    pub reload_model: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    pub load_fallback_model: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

impl Default for RecoveryHooks {
    fn default() -> Self {
        RecoveryHooks {
            install_backend: None,
            start_service: None,
            reenumerate_interfaces: None,
            reload_model: None,
            load_fallback_model: None,
        }
    }
}

/// Exponential backoff schedule for `CaptureOpenTransient` retries.
pub const CAPTURE_OPEN_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1_000),
];

/// Per-fault-class attempt counters, independent of one another. Backed by
/// `dashmap` since independent keys genuinely benefit from sharded concurrent
/// access and this map never sits inside the extractor-mutex critical
/// section.
pub struct RecoveryPolicy {
    attempts: DashMap<RecoveryFault, u32>,
    max_attempts: u32,
    hooks: RecoveryHooks,
}

impl RecoveryPolicy {
    pub fn new(hooks: RecoveryHooks) -> Self {
        Self::with_max_attempts(hooks, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(hooks: RecoveryHooks, max_attempts: u32) -> Self {
        RecoveryPolicy {
            attempts: DashMap::new(),
            max_attempts,
            hooks,
        }
    }

    pub fn attempts_for(&self, fault: &RecoveryFault) -> u32 {
        self.attempts.get(fault).map(|v| *v).unwrap_or(0)
    }

    /// The configurable attempt budget every fault class is capped at.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Resets the attempt counter for `fault`, called on the next successful
    /// operation of the same class.
    pub fn reset(&self, fault: &RecoveryFault) {
        self.attempts.remove(fault);
    }

    /// Attempts remediation for `fault`. Increments the attempt counter
    /// before running the strategy: record the attempt, then try.
    pub fn attempt_recovery(&self, fault: RecoveryFault) -> RecoveryOutcome {
        let attempts_before = {
            let mut entry = self.attempts.entry(fault.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts_before > self.max_attempts {
            return RecoveryOutcome::AttemptsExhausted;
        }

        let succeeded = match &fault {
            RecoveryFault::CaptureBackendMissing => self
                .hooks
                .install_backend
                .as_ref()
                .map(|hook| hook())
                .unwrap_or(false),
            RecoveryFault::CaptureServiceStopped => self
                .hooks
                .start_service
                .as_ref()
                .map(|hook| hook())
                .unwrap_or(false),
            RecoveryFault::InsufficientPrivileges => {
                return RecoveryOutcome::Fatal {
                    remediation: "re-run with capture privileges (CAP_NET_RAW or administrator)"
                        .to_string(),
                };
            }
            RecoveryFault::NoInterfaces => self
                .hooks
                .reenumerate_interfaces
                .as_ref()
                .map(|hook| hook())
                .unwrap_or(false),
            RecoveryFault::ModelLoadFailed => {
                let reloaded = self
                    .hooks
                    .reload_model
                    .as_ref()
                    .map(|hook| hook())
                    .unwrap_or(false);
                if reloaded {
                    true
                } else {
                    self.hooks
                        .load_fallback_model
                        .as_ref()
                        .map(|hook| hook())
                        .unwrap_or(false)
                }
            }
            RecoveryFault::CaptureOpenTransient => true,
        };

        if succeeded {
            self.reset(&fault);
            RecoveryOutcome::Recovered
        } else if attempts_before >= self.max_attempts {
            RecoveryOutcome::AttemptsExhausted
        } else {
            RecoveryOutcome::AttemptFailed
        }
    }

    /// Backoff duration for the `attempt`-th (1-indexed) `CaptureOpenTransient`
    /// retry, clamped to the last configured step.
    pub fn capture_open_backoff(attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(CAPTURE_OPEN_BACKOFF.len() - 1);
        CAPTURE_OPEN_BACKOFF[idx]
    }
}
