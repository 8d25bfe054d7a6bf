//! Per-target circuit breakers for the storage layer.

use std::collections::HashMap;

use vf_primitives::{CircuitStatus, DbTarget};
use vf_utilities::{CircuitBreaker, CircuitBreakerConfig};

pub struct CircuitBreakerService {
	breakers: HashMap<DbTarget, CircuitBreaker>,
}

impl CircuitBreakerService {
	pub fn new(config: CircuitBreakerConfig) -> Self {
		Self {
			breakers: HashMap::from([
				(DbTarget::Primary, CircuitBreaker::new("primary", config)),
				(DbTarget::Replica, CircuitBreaker::new("replica", config)),
			]),
		}
	}

	pub fn get(&self, target: DbTarget) -> &CircuitBreaker {
		self.breakers.get(&target).expect("both targets have a breaker")
	}

	pub fn status(&self, target: DbTarget) -> CircuitStatus {
		self.get(target).status()
	}

	pub fn register_failure(&self, target: DbTarget) {
		self.get(target).record_failure();
	}

	pub fn register_success(&self, target: DbTarget) {
		self.get(target).record_success();
	}
}
