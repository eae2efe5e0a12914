//! Dead-man's switch
//!
//! Once armed with the required authentication factors, the monitor expects
//! a heartbeat at least every `heartbeat_timeout`. A missed deadline or an
//! explicit trigger destroys key material, records the event and shuts the
//! vault down. Triggering is terminal and happens at most once.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{FailsafeConfig, Strictness};
use crate::error::{FailsafeError, VaultError, VaultResult};
use crate::model::{AuthFactor, FactorSet, LogLevel, Timestamp};
use crate::ports::{AuditSink, Clock, DestructiveAction, ShutdownHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailsafeState {
    Disarmed,
    Arming,
    Armed,
    Triggered,
}

impl fmt::Display for FailsafeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailsafeState::Disarmed => "disarmed",
            FailsafeState::Arming => "arming",
            FailsafeState::Armed => "armed",
            FailsafeState::Triggered => "triggered",
        };
        f.write_str(name)
    }
}

/// Snapshot of the heartbeat state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatState {
    pub state: FailsafeState,
    pub last_heartbeat: Option<Timestamp>,
    pub armed: bool,
    /// Set when the failsafe fires; never cleared
    pub emergency_mode: bool,
    pub satisfied_factors: FactorSet,
}

struct MonitorState {
    state: FailsafeState,
    last_heartbeat: Option<Timestamp>,
    emergency_mode: bool,
    satisfied_factors: FactorSet,
}

pub struct FailsafeMonitor {
    config: FailsafeConfig,
    explicit_factors: FactorSet,
    clock: Arc<dyn Clock>,
    destructive: Arc<dyn DestructiveAction>,
    audit: Arc<dyn AuditSink>,
    shutdown: Arc<dyn ShutdownHook>,
    inner: Mutex<MonitorState>,
}

impl FailsafeMonitor {
    pub fn new(
        config: FailsafeConfig,
        clock: Arc<dyn Clock>,
        destructive: Arc<dyn DestructiveAction>,
        audit: Arc<dyn AuditSink>,
        shutdown: Arc<dyn ShutdownHook>,
    ) -> Self {
        let explicit_factors = config.explicit_trigger_factors();
        Self {
            config,
            explicit_factors,
            clock,
            destructive,
            audit,
            shutdown,
            inner: Mutex::new(MonitorState {
                state: FailsafeState::Disarmed,
                last_heartbeat: None,
                emergency_mode: false,
                satisfied_factors: FactorSet::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> FailsafeState {
        self.inner().state
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.config.heartbeat_timeout()
    }

    pub fn status(&self) -> HeartbeatState {
        let inner = self.inner();
        HeartbeatState {
            state: inner.state,
            last_heartbeat: inner.last_heartbeat,
            armed: inner.state == FailsafeState::Armed,
            emergency_mode: inner.emergency_mode,
            satisfied_factors: inner.satisfied_factors.clone(),
        }
    }

    /// `Disarmed -> Arming`
    pub fn begin_arming(&self) -> VaultResult<FailsafeState> {
        let mut inner = self.inner();
        let state = inner.state;
        match state {
            FailsafeState::Triggered => Err(FailsafeError::Triggered.into()),
            FailsafeState::Disarmed => {
                inner.state = FailsafeState::Arming;
                drop(inner);
                info!("Failsafe arming started");
                self.record(LogLevel::Info, "failsafe arming started");
                Ok(FailsafeState::Arming)
            }
            state => Ok(state),
        }
    }

    /// Arm with the presented factors
    ///
    /// A proper subset of the required factors leaves the monitor in
    /// `Arming` and records the attempt. Arming also counts as a heartbeat.
    pub fn arm(&self, presented: &FactorSet) -> VaultResult<FailsafeState> {
        let now = self.clock.now();
        let mut inner = self.inner();
        if inner.state == FailsafeState::Triggered {
            return Err(FailsafeError::Triggered.into());
        }
        if inner.state == FailsafeState::Disarmed {
            inner.state = FailsafeState::Arming;
        }

        let missing = presented.missing_from(&self.config.required_factors);
        if !missing.is_empty() {
            // An armed switch keeps its full factor set.
            if inner.state == FailsafeState::Arming {
                inner.satisfied_factors = presented
                    .iter()
                    .filter(|f| self.config.required_factors.contains(*f))
                    .collect();
            }
            let state = inner.state;
            drop(inner);
            let missing = join_factors(&missing);
            warn!("Failsafe arming attempt missing factors: {}", missing);
            self.record(
                LogLevel::Warning,
                &format!("failsafe arming attempt missing factors: {missing}"),
            );
            return Ok(state);
        }
        inner.satisfied_factors = self.config.required_factors.clone();

        let was_armed = inner.state == FailsafeState::Armed;
        inner.state = FailsafeState::Armed;
        inner.last_heartbeat = Some(now);
        drop(inner);

        if !was_armed {
            info!("Failsafe armed");
            self.record(
                LogLevel::Info,
                &format!(
                    "failsafe armed, heartbeat timeout {}s",
                    self.config.heartbeat_timeout_secs
                ),
            );
        }
        Ok(FailsafeState::Armed)
    }

    /// Return to `Disarmed`; needs the full arming factor set
    pub fn disarm(&self, presented: &FactorSet) -> VaultResult<FailsafeState> {
        let mut inner = self.inner();
        let state = inner.state;
        match state {
            FailsafeState::Triggered => return Err(FailsafeError::Triggered.into()),
            FailsafeState::Disarmed => return Ok(FailsafeState::Disarmed),
            FailsafeState::Arming | FailsafeState::Armed => {}
        }

        let missing = presented.missing_from(&self.config.required_factors);
        if !missing.is_empty() {
            drop(inner);
            warn!("Failsafe disarm rejected, missing factors: {}", join_factors(&missing));
            self.record(LogLevel::Warning, "failsafe disarm rejected: insufficient factors");
            return Err(insufficient(&missing));
        }

        inner.state = FailsafeState::Disarmed;
        inner.last_heartbeat = None;
        inner.satisfied_factors = FactorSet::new();
        drop(inner);

        info!("Failsafe disarmed");
        self.record(LogLevel::Info, "failsafe disarmed");
        Ok(FailsafeState::Disarmed)
    }

    /// Reset the deadline
    ///
    /// Only meaningful while armed; otherwise ignored or rejected depending
    /// on the configured strictness.
    pub fn heartbeat(&self) -> VaultResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner();
        let state = inner.state;
        match state {
            FailsafeState::Armed => {
                inner.last_heartbeat = Some(now);
                debug!("Heartbeat at {}", now);
                Ok(())
            }
            FailsafeState::Triggered => Err(FailsafeError::Triggered.into()),
            state => match self.config.strictness {
                Strictness::Lenient => {
                    debug!("Ignoring heartbeat while {}", state);
                    Ok(())
                }
                Strictness::Strict => Err(FailsafeError::NotArmed {
                    state: state.to_string(),
                }
                .into()),
            },
        }
    }

    /// Check the deadline at `now`
    ///
    /// Fires when armed and more than the timeout has passed since the last
    /// heartbeat. Only the call that performs the transition fires.
    pub fn tick(&self, now: Timestamp) -> FailsafeState {
        let mut inner = self.inner();
        if inner.state != FailsafeState::Armed {
            return inner.state;
        }
        let Some(last) = inner.last_heartbeat else {
            return inner.state;
        };
        let silence = now.saturating_since(last);
        if silence <= self.config.heartbeat_timeout() {
            return inner.state;
        }

        inner.state = FailsafeState::Triggered;
        inner.emergency_mode = true;
        drop(inner);

        self.fire(&format!(
            "heartbeat timeout: no heartbeat for {}s",
            silence.as_secs()
        ));
        FailsafeState::Triggered
    }

    /// Fire immediately if the presented factors cover the explicit set
    pub fn trigger_explicit(&self, presented: &FactorSet) -> VaultResult<()> {
        let mut inner = self.inner();
        if inner.state == FailsafeState::Triggered {
            return Err(FailsafeError::Triggered.into());
        }

        let missing = presented.missing_from(&self.explicit_factors);
        if !missing.is_empty() {
            drop(inner);
            warn!("Explicit trigger rejected, missing factors: {}", join_factors(&missing));
            self.record(
                LogLevel::Warning,
                "failsafe explicit trigger rejected: insufficient factors",
            );
            return Err(insufficient(&missing));
        }

        inner.state = FailsafeState::Triggered;
        inner.emergency_mode = true;
        drop(inner);

        self.fire("explicit trigger");
        Ok(())
    }

    /// Record, destroy, shut down; never blocks on a failed step
    ///
    /// The entry is written first: once the keys are destroyed the log can
    /// no longer sign.
    fn fire(&self, reason: &str) {
        error!("Failsafe triggered: {}", reason);
        self.record(LogLevel::Critical, &format!("failsafe triggered: {reason}"));

        if let Err(e) = self.destructive.destroy() {
            error!("Destructive action failed: {}", e);
            self.record(
                LogLevel::Critical,
                &format!("failsafe destructive action failed: {e}"),
            );
        }

        self.shutdown.shutdown(&format!("failsafe triggered: {reason}"));
    }

    /// Best-effort audit entry
    fn record(&self, level: LogLevel, message: &str) {
        if let Err(e) = self.audit.record(level, message) {
            warn!("Could not record failsafe event '{}': {}", message, e);
        }
    }
}

fn join_factors(factors: &[AuthFactor]) -> String {
    factors
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn insufficient(missing: &[AuthFactor]) -> VaultError {
    FailsafeError::InsufficientFactors {
        missing: missing.iter().map(|f| f.as_str().to_string()).collect(),
    }
    .into()
}
