//! Three-state circuit breaker.
//!
//! State rules: CLOSED trips to OPEN after `failure_threshold` consecutive
//! failures; OPEN admits a probe once `timeout` has elapsed since the
//! transition (HALF_OPEN); HALF_OPEN closes after `success_threshold`
//! consecutive successes and re-opens on any failure. A success in CLOSED
//! resets the failure count, a failure resets the success count.
//!
//! The inner state is a value that is replaced wholesale on every
//! transition, never field-mutated in place.

use std::{
	sync::RwLock,
	time::{Duration, Instant},
};

use vf_primitives::{CircuitState, CircuitStatus};

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
	pub failure_threshold: u32,
	pub timeout: Duration,
	pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self { failure_threshold: 5, timeout: Duration::from_secs(60), success_threshold: 3 }
	}
}

#[derive(Debug, Clone, Copy)]
struct BreakerState {
	state: CircuitState,
	consecutive_failures: u32,
	consecutive_successes: u32,
	last_transition: Instant,
}

impl BreakerState {
	fn closed() -> Self {
		Self {
			state: CircuitState::Closed,
			consecutive_failures: 0,
			consecutive_successes: 0,
			last_transition: Instant::now(),
		}
	}

	fn with_state(self, state: CircuitState) -> Self {
		Self {
			state,
			consecutive_failures: 0,
			consecutive_successes: 0,
			last_transition: Instant::now(),
		}
	}
}

pub struct CircuitBreaker {
	name: String,
	config: CircuitBreakerConfig,
	inner: RwLock<BreakerState>,
}

impl CircuitBreaker {
	pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
		Self { name: name.into(), config, inner: RwLock::new(BreakerState::closed()) }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Whether a call may proceed right now. An OPEN circuit whose timeout
	/// has elapsed transitions to HALF_OPEN and admits the caller as the
	/// probe.
	pub fn check(&self) -> bool {
		{
			let state = self.inner.read().expect("circuit lock poisoned");
			match state.state {
				CircuitState::Closed | CircuitState::HalfOpen => return true,
				CircuitState::Open
					if state.last_transition.elapsed() < self.config.timeout =>
					return false,
				CircuitState::Open => {},
			}
		}
		let mut state = self.inner.write().expect("circuit lock poisoned");
		// Someone else may have probed between the two locks.
		if state.state == CircuitState::Open
			&& state.last_transition.elapsed() >= self.config.timeout
		{
			tracing::info!(circuit = %self.name, "circuit OPEN -> HALF_OPEN, admitting probe");
			*state = state.with_state(CircuitState::HalfOpen);
		}
		state.state != CircuitState::Open
	}

	pub fn record_success(&self) {
		let mut state = self.inner.write().expect("circuit lock poisoned");
		*state = match state.state {
			CircuitState::Closed => BreakerState {
				consecutive_failures: 0,
				consecutive_successes: state.consecutive_successes + 1,
				..*state
			},
			CircuitState::HalfOpen => {
				if state.consecutive_successes + 1 >= self.config.success_threshold {
					tracing::info!(circuit = %self.name, "circuit HALF_OPEN -> CLOSED");
					state.with_state(CircuitState::Closed)
				} else {
					BreakerState {
						consecutive_successes: state.consecutive_successes + 1,
						consecutive_failures: 0,
						..*state
					}
				}
			},
			// A success while OPEN means a call raced the trip. Ignore it.
			CircuitState::Open => *state,
		};
	}

	pub fn record_failure(&self) {
		let mut state = self.inner.write().expect("circuit lock poisoned");
		*state = match state.state {
			CircuitState::Closed => {
				if state.consecutive_failures + 1 >= self.config.failure_threshold {
					tracing::warn!(
						circuit = %self.name,
						failures = state.consecutive_failures + 1,
						"circuit CLOSED -> OPEN"
					);
					state.with_state(CircuitState::Open)
				} else {
					BreakerState {
						consecutive_failures: state.consecutive_failures + 1,
						consecutive_successes: 0,
						..*state
					}
				}
			},
			CircuitState::HalfOpen => {
				tracing::warn!(circuit = %self.name, "probe failed, circuit HALF_OPEN -> OPEN");
				state.with_state(CircuitState::Open)
			},
			CircuitState::Open => *state,
		};
	}

	pub fn state(&self) -> CircuitState {
		self.inner.read().expect("circuit lock poisoned").state
	}

	pub fn status(&self) -> CircuitStatus {
		let state = self.inner.read().expect("circuit lock poisoned");
		CircuitStatus {
			state: state.state,
			consecutive_failures: state.consecutive_failures,
			consecutive_successes: state.consecutive_successes,
		}
	}
}
