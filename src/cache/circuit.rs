//! Circuit breaker guarding the remote store
//!
//! A single remote failure opens the circuit for a fixed cooldown. Once the
//! cooldown elapses exactly one probe call is admitted: success closes the
//! circuit, failure restarts the cooldown.
//!
//! Every admission carries a `Permit` stamped with the breaker generation.
//! The generation moves on each transition, so a slow call admitted before
//! the circuit opened cannot close it again when it finally succeeds.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Proof of admission, handed back with the call's success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
}

/// Outcome of asking the breaker whether a remote call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal traffic
    Allowed(Permit),
    /// Cooldown elapsed; this caller carries the single probe
    Probe(Permit),
    /// Circuit open (or a probe is already in flight)
    Rejected,
}

impl Admission {
    pub fn is_probe(self) -> bool {
        matches!(self, Admission::Probe(_))
    }

    pub fn permit(self) -> Option<Permit> {
        match self {
            Admission::Allowed(permit) | Admission::Probe(permit) => Some(permit),
            Admission::Rejected => None,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    generation: u64,
    open_until: Option<Instant>,
    probe_started: Option<Instant>,
    failures: u64,
    trips: u64,
}

impl BreakerInner {
    fn advance(&mut self) -> Permit {
        self.generation += 1;
        Permit {
            generation: self.generation,
        }
    }

    fn current(&self) -> Permit {
        Permit {
            generation: self.generation,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                open_until: None,
                probe_started: None,
                failures: 0,
                trips: 0,
            }),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Decide whether a remote call may go out right now.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed(inner.current()),
            CircuitState::HalfOpen => {
                // A probe whose caller went away never reports back
                let stale = inner
                    .probe_started
                    .map(|started| started.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if stale {
                    inner.probe_started = Some(Instant::now());
                    Admission::Probe(inner.advance())
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(Instant::now());
                    Admission::Probe(inner.advance())
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Report a successful call. Only the current probe closes an open
    /// circuit; successes from earlier generations are ignored.
    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.inner.lock();
        if permit != inner.current() {
            debug!(
                permit_generation = permit.generation,
                generation = inner.generation,
                "Ignoring success from a superseded remote call"
            );
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(
                    failures = inner.failures,
                    "Remote cache circuit closed (probe succeeded)"
                );
                inner.state = CircuitState::Closed;
                inner.open_until = None;
                inner.probe_started = None;
                inner.failures = 0;
                inner.advance();
            }
            // Opening always advances the generation
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        let was_probe = inner.state == CircuitState::HalfOpen;
        if inner.state != CircuitState::Open {
            inner.trips += 1;
        }
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + self.cooldown);
        inner.probe_started = None;
        inner.advance();

        if was_probe {
            warn!(
                reason,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Remote cache probe failed; circuit re-opened"
            );
        } else {
            warn!(
                reason,
                cooldown_secs = self.cooldown.as_secs_f64(),
                "Remote cache circuit opened"
            );
        }
    }

    /// Current state. An open circuit whose cooldown has elapsed still
    /// reports `Open` until the next call converts it into a probe.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() != CircuitState::Closed
    }

    pub fn trips(&self) -> u64 {
        self.inner.lock().trips
    }
}
