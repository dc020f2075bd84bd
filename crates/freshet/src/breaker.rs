//! Circuit breaker guarding the message bus.
//!
//! Closed: every publish is admitted and failures are counted in a window
//! that restarts once it elapses. Reaching the threshold opens the circuit.
//! Open: publishes are rejected until the cooldown has passed, then the
//! breaker goes half-open and admits a limited number of trial publishes.
//! A trial success closes the circuit and resets the cooldown. A trial
//! failure reopens it with the cooldown multiplied, up to a ceiling.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use freshet_core::emit;
use freshet_core::metrics::events::CircuitStateChanged;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 closed, 1 half-open, 2 open.
    pub fn level(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    /// Failures in the current window while closed.
    pub failure_count: u32,
    pub window_start: Instant,
    pub last_transition: Instant,
    /// Times the circuit has opened.
    pub trips: u32,
    /// Cooldown applied the next time the circuit is open.
    pub cooldown: Duration,
    trials_in_flight: u32,
}

/// Proof that a publish was admitted. Hand it back with the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    trial: bool,
}

impl Admission {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    base_cooldown: Duration,
    multiplier: f64,
    max_cooldown: Duration,
    half_open_trials: u32,
    state: Mutex<CircuitBreakerState>,
    target: String,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig, target: impl Into<String>) -> Self {
        let now = Instant::now();
        let base_cooldown = Duration::from_secs(config.cooldown_secs);
        let breaker = Self {
            threshold: config.failure_threshold.max(1),
            window: Duration::from_secs(config.window_secs),
            base_cooldown,
            multiplier: config.cooldown_multiplier.max(1.0),
            max_cooldown: Duration::from_secs(config.max_cooldown_secs).max(base_cooldown),
            half_open_trials: config.half_open_trials.max(1),
            state: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                window_start: now,
                last_transition: now,
                trips: 0,
                cooldown: base_cooldown,
                trials_in_flight: 0,
            }),
            target: target.into(),
        };
        breaker.report(CircuitState::Closed);
        breaker
    }

    /// Ask to publish. `None` means the circuit is rejecting publishes.
    pub fn try_acquire(&self) -> Option<Admission> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Some(Admission { trial: false }),
            CircuitState::Open => {
                if state.last_transition.elapsed() < state.cooldown {
                    return None;
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                state.trials_in_flight = 1;
                Some(Admission { trial: true })
            }
            CircuitState::HalfOpen => {
                if state.trials_in_flight >= self.half_open_trials {
                    return None;
                }
                state.trials_in_flight += 1;
                Some(Admission { trial: true })
            }
        }
    }

    pub fn record_success(&self, admission: Admission) {
        let mut state = self.state.lock();
        if admission.trial && state.state == CircuitState::HalfOpen {
            state.cooldown = self.base_cooldown;
            state.failure_count = 0;
            state.window_start = Instant::now();
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                if state.window_start.elapsed() > self.window {
                    state.window_start = Instant::now();
                    state.failure_count = 0;
                }
                state.failure_count += 1;
                if state.failure_count >= self.threshold {
                    state.trips += 1;
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if admission.trial => {
                let grown = state.cooldown.mul_f64(self.multiplier);
                state.cooldown = grown.min(self.max_cooldown);
                state.trips += 1;
                self.transition(&mut state, CircuitState::Open);
            }
            // Late results from publishes admitted before the circuit opened.
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.lock().clone()
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.last_transition = Instant::now();
        state.trials_in_flight = 0;

        match to {
            CircuitState::Open => warn!(
                target = %self.target,
                from = from.as_str(),
                cooldown_secs = state.cooldown.as_secs_f64(),
                trips = state.trips,
                "Circuit breaker opened"
            ),
            _ => info!(
                target = %self.target,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state changed"
            ),
        }
        self.report(to);
    }

    fn report(&self, state: CircuitState) {
        emit!(CircuitStateChanged {
            state: state.as_str(),
            level: state.level(),
            target: self.target.clone(),
        });
    }
}
