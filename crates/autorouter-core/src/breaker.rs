use std::sync::{Arc, Mutex};

use autorouter_storage::BreakerPersist;
use time::OffsetDateTime;

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            "half_open" => Some(BreakerState::HalfOpen),
            _ => None,
        }
    }
}

/// Why the gate refused a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSkip {
    Open,
    ProbeBusy,
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub upstream_id: i64,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub opened_at: Option<OffsetDateTime>,
    pub last_probe_at: Option<OffsetDateTime>,
    pub config: CircuitConfig,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<OffsetDateTime>,
    opened_at: Option<OffsetDateTime>,
    last_probe_at: Option<OffsetDateTime>,
    probe_in_flight: bool,
}

/// Per-upstream gate; every update runs under the one row lock so
/// transitions are totally ordered per upstream (no cross-upstream locks).
#[derive(Debug)]
pub struct CircuitBreaker {
    upstream_id: i64,
    config: CircuitConfig,
    core: Mutex<BreakerCore>,
}

/// Handle for one admitted attempt. Probe admissions hold the single
/// half-open slot until resolved; dropping an unresolved guard frees it.
#[derive(Debug)]
pub struct BreakerGuard {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    resolved: bool,
}

impl CircuitBreaker {
    pub fn new(upstream_id: i64, config: CircuitConfig) -> Self {
        Self {
            upstream_id,
            config,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                opened_at: None,
                last_probe_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Rebuilds a breaker from its persisted tuple; `opened_at` keeps its
    /// wall-clock meaning across restarts.
    pub fn restore(
        upstream_id: i64,
        config: CircuitConfig,
        state: BreakerState,
        failure_count: u32,
        success_count: u32,
        last_failure_at: Option<OffsetDateTime>,
        opened_at: Option<OffsetDateTime>,
        last_probe_at: Option<OffsetDateTime>,
    ) -> Self {
        // A persisted half_open had a probe in flight that died with the
        // process; re-enter open so the next admission is a fresh probe.
        let (state, opened_at) = match state {
            BreakerState::HalfOpen => (BreakerState::Open, opened_at.or(last_probe_at)),
            other => (other, opened_at),
        };
        Self {
            upstream_id,
            config,
            core: Mutex::new(BreakerCore {
                state,
                failure_count,
                success_count,
                last_failure_at,
                opened_at,
                last_probe_at,
                probe_in_flight: false,
            }),
        }
    }

    pub fn upstream_id(&self) -> i64 {
        self.upstream_id
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.lock();
        BreakerSnapshot {
            upstream_id: self.upstream_id,
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            last_failure_at: core.last_failure_at,
            opened_at: core.opened_at,
            last_probe_at: core.last_probe_at,
            config: self.config,
        }
    }

    /// Non-mutating availability check the selector uses while ordering
    /// candidates. The authoritative decision happens in `try_acquire`.
    pub fn would_admit(&self, now: OffsetDateTime) -> Result<(), BreakerSkip> {
        let core = self.lock();
        match core.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if self.open_elapsed(&core, now) && !core.probe_in_flight {
                    Ok(())
                } else {
                    Err(BreakerSkip::Open)
                }
            }
            BreakerState::HalfOpen => {
                if core.probe_in_flight {
                    Err(BreakerSkip::ProbeBusy)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Gates one attempt. An `Ok` in open/half-open state means this
    /// attempt owns the probe slot.
    pub fn try_acquire(
        self: &Arc<Self>,
        now: OffsetDateTime,
    ) -> Result<(BreakerGuard, Option<BreakerPersist>), BreakerSkip> {
        let mut core = self.lock();
        match core.state {
            BreakerState::Closed => Ok((self.guard(false), None)),
            BreakerState::Open => {
                if !self.open_elapsed(&core, now) || core.probe_in_flight {
                    return Err(BreakerSkip::Open);
                }
                core.state = BreakerState::HalfOpen;
                core.probe_in_flight = true;
                core.last_probe_at = Some(now);
                let persist = self.persist(&core, now);
                drop(core);
                Ok((self.guard(true), Some(persist)))
            }
            BreakerState::HalfOpen => {
                if core.probe_in_flight {
                    return Err(BreakerSkip::ProbeBusy);
                }
                core.probe_in_flight = true;
                core.last_probe_at = Some(now);
                let persist = self.persist(&core, now);
                drop(core);
                Ok((self.guard(true), Some(persist)))
            }
        }
    }

    /// Admin override; legal from any state, counters zeroed.
    pub fn force_open(&self, now: OffsetDateTime) -> BreakerPersist {
        let mut core = self.lock();
        core.state = BreakerState::Open;
        core.opened_at = Some(now);
        core.failure_count = 0;
        core.success_count = 0;
        core.probe_in_flight = false;
        self.persist(&core, now)
    }

    pub fn force_close(&self, now: OffsetDateTime) -> BreakerPersist {
        let mut core = self.lock();
        core.state = BreakerState::Closed;
        core.opened_at = None;
        core.failure_count = 0;
        core.success_count = 0;
        core.probe_in_flight = false;
        self.persist(&core, now)
    }

    fn on_success(&self, probe: bool, now: OffsetDateTime) -> Option<BreakerPersist> {
        let mut core = self.lock();
        if probe {
            core.probe_in_flight = false;
        }
        match core.state {
            BreakerState::Closed => {
                if core.failure_count == 0 {
                    return None;
                }
                core.failure_count = 0;
                Some(self.persist(&core, now))
            }
            BreakerState::HalfOpen => {
                core.success_count += 1;
                if core.success_count >= self.config.success_threshold {
                    core.state = BreakerState::Closed;
                    core.failure_count = 0;
                    core.success_count = 0;
                    core.opened_at = None;
                }
                Some(self.persist(&core, now))
            }
            // Forced open while the attempt was in flight; the gate stays
            // shut regardless of this outcome.
            BreakerState::Open => None,
        }
    }

    fn on_failure(&self, probe: bool, now: OffsetDateTime) -> Option<BreakerPersist> {
        let mut core = self.lock();
        if probe {
            core.probe_in_flight = false;
        }
        core.last_failure_at = Some(now);
        match core.state {
            BreakerState::Closed => {
                core.failure_count += 1;
                if core.failure_count >= self.config.failure_threshold {
                    core.state = BreakerState::Open;
                    core.opened_at = Some(now);
                    core.failure_count = 0;
                    core.success_count = 0;
                }
                Some(self.persist(&core, now))
            }
            BreakerState::HalfOpen => {
                core.state = BreakerState::Open;
                core.opened_at = Some(now);
                core.failure_count = 0;
                core.success_count = 0;
                Some(self.persist(&core, now))
            }
            BreakerState::Open => Some(self.persist(&core, now)),
        }
    }

    fn release_probe(&self) {
        let mut core = self.lock();
        core.probe_in_flight = false;
    }

    fn open_elapsed(&self, core: &BreakerCore, now: OffsetDateTime) -> bool {
        match core.opened_at {
            Some(opened_at) => now - opened_at >= self.config.open_duration,
            None => true,
        }
    }

    fn guard(self: &Arc<Self>, probe: bool) -> BreakerGuard {
        BreakerGuard {
            breaker: self.clone(),
            probe,
            resolved: false,
        }
    }

    fn persist(&self, core: &BreakerCore, now: OffsetDateTime) -> BreakerPersist {
        BreakerPersist {
            upstream_id: self.upstream_id,
            state: core.state.as_str().to_string(),
            failure_count: core.failure_count as i32,
            success_count: core.success_count as i32,
            last_failure_at: core.last_failure_at,
            opened_at: core.opened_at,
            last_probe_at: core.last_probe_at,
            config_json: self.config.to_json(),
            updated_at: now,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BreakerGuard {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn on_success(mut self, now: OffsetDateTime) -> Option<BreakerPersist> {
        self.resolved = true;
        self.breaker.on_success(self.probe, now)
    }

    pub fn on_failure(mut self, now: OffsetDateTime) -> Option<BreakerPersist> {
        self.resolved = true;
        self.breaker.on_failure(self.probe, now)
    }
}

impl Drop for BreakerGuard {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}
