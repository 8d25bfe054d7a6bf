//! Query routing: write traffic to the primary, read traffic to the
//! replica when its circuit allows, all under the failover handler and the
//! per-target circuit breakers, with the query's own deadline applied.

use std::{collections::HashMap, sync::Arc, time::Instant};

use vf_primitives::{DbTarget, QueryParams, QueryResult, QueryType};
use vf_rpc_apis::VoteflowError;

use super::{circuits::CircuitBreakerService, failover::FailoverHandler, storage::StorageAdapter};

pub struct QueryRouter {
	adapters: HashMap<DbTarget, Arc<dyn StorageAdapter>>,
	pub failover: FailoverHandler,
	pub circuits: CircuitBreakerService,
}

impl QueryRouter {
	pub fn new(
		primary: Arc<dyn StorageAdapter>,
		replica: Arc<dyn StorageAdapter>,
		failover: FailoverHandler,
		circuits: CircuitBreakerService,
	) -> Self {
		Self {
			adapters: HashMap::from([
				(DbTarget::Primary, primary),
				(DbTarget::Replica, replica),
			]),
			failover,
			circuits,
		}
	}

	fn preferred_target(&self, query_type: QueryType) -> DbTarget {
		match query_type {
			QueryType::Insert | QueryType::Update => DbTarget::Primary,
			// Reads go to the replica while its circuit admits calls.
			QueryType::Select =>
				if self.circuits.get(DbTarget::Replica).check() {
					DbTarget::Replica
				} else {
					DbTarget::Primary
				},
		}
	}

	pub async fn route(&self, params: &QueryParams) -> Result<QueryResult, VoteflowError> {
		let preferred = self.preferred_target(params.query_type);
		let target = self.failover.get_connection(preferred)?;

		if params.query_type.is_write() && target != DbTarget::Primary {
			return Err(VoteflowError::DbConnection {
				target: DbTarget::Primary.to_string(),
				message: "writes require the primary".to_string(),
			});
		}
		if !self.circuits.get(target).check() {
			return Err(VoteflowError::CircuitOpen(target.to_string()));
		}

		let adapter = self.adapters.get(&target).expect("both targets have an adapter");
		let started = Instant::now();
		match tokio::time::timeout(params.timeout(), adapter.execute(params)).await {
			Err(_elapsed) => {
				self.record_failure(target);
				Err(VoteflowError::QueryTimeout)
			},
			Ok(Err(error)) => {
				self.record_failure(target);
				Err(error)
			},
			Ok(Ok(result)) => {
				self.circuits.register_success(target);
				self.failover.register_success(target);
				tracing::debug!(
					query = %params.query,
					%target,
					latency_millis = started.elapsed().as_millis() as u64,
					"query routed"
				);
				Ok(result)
			},
		}
	}

	fn record_failure(&self, target: DbTarget) {
		self.circuits.register_failure(target);
		self.failover.register_failure(target);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dbproxy::failover::ConnectionInfo;
	use async_trait::async_trait;
	use std::time::Duration;
	use vf_utilities::CircuitBreakerConfig;

	/// Adapter stub with a fixed latency and failure switch.
	struct StubAdapter {
		target: DbTarget,
		latency: Duration,
		fail: std::sync::atomic::AtomicBool,
		calls: std::sync::atomic::AtomicU32,
	}

	impl StubAdapter {
		fn new(target: DbTarget, latency: Duration) -> Arc<Self> {
			Arc::new(Self {
				target,
				latency,
				fail: Default::default(),
				calls: Default::default(),
			})
		}

		fn calls(&self) -> u32 {
			self.calls.load(std::sync::atomic::Ordering::Relaxed)
		}
	}

	#[async_trait]
	impl StorageAdapter for StubAdapter {
		fn target(&self) -> DbTarget {
			self.target
		}

		async fn execute(&self, _params: &QueryParams) -> Result<QueryResult, VoteflowError> {
			self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			tokio::time::sleep(self.latency).await;
			if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
				Err(VoteflowError::Storage("stub failure".to_string()))
			} else {
				Ok(QueryResult::ok(vec![self.target.to_string()]))
			}
		}
	}

	fn router_with(
		primary: Arc<StubAdapter>,
		replica: Arc<StubAdapter>,
	) -> QueryRouter {
		QueryRouter::new(
			primary,
			replica,
			FailoverHandler::new(
				ConnectionInfo::active("primary-node", "127.0.0.1", 9851),
				ConnectionInfo::active("replica-node", "127.0.0.1", 9852),
				Duration::from_secs(30),
			),
			CircuitBreakerService::new(CircuitBreakerConfig::default()),
		)
	}

	fn select() -> QueryParams {
		QueryParams::new("COUNT_VOTES", "", QueryType::Select, 1_000)
	}

	fn insert() -> QueryParams {
		QueryParams::new("INSERT_VOTE", "v|c|t|h", QueryType::Insert, 1_000)
	}

	#[tokio::test]
	async fn reads_prefer_the_replica_and_writes_the_primary() {
		let primary = StubAdapter::new(DbTarget::Primary, Duration::ZERO);
		let replica = StubAdapter::new(DbTarget::Replica, Duration::ZERO);
		let router = router_with(primary.clone(), replica.clone());

		assert_eq!(router.route(&select()).await.unwrap().rows, vec!["replica".to_string()]);
		assert_eq!(router.route(&insert()).await.unwrap().rows, vec!["primary".to_string()]);
		assert_eq!(primary.calls(), 1);
		assert_eq!(replica.calls(), 1);
	}

	#[tokio::test]
	async fn reads_fall_back_to_the_primary_when_the_replica_circuit_is_open() {
		let primary = StubAdapter::new(DbTarget::Primary, Duration::ZERO);
		let replica = StubAdapter::new(DbTarget::Replica, Duration::ZERO);
		let router = router_with(primary.clone(), replica.clone());

		for _ in 0..5 {
			router.circuits.register_failure(DbTarget::Replica);
		}
		assert_eq!(router.route(&select()).await.unwrap().rows, vec!["primary".to_string()]);
		assert_eq!(replica.calls(), 0);
	}

	#[tokio::test]
	async fn writes_never_fail_over_to_the_replica() {
		let primary = StubAdapter::new(DbTarget::Primary, Duration::ZERO);
		let replica = StubAdapter::new(DbTarget::Replica, Duration::ZERO);
		let router = router_with(primary, replica.clone());

		router.failover.register_failure(DbTarget::Primary);
		assert!(matches!(
			router.route(&insert()).await,
			Err(VoteflowError::DbConnection { .. })
		));
		assert_eq!(replica.calls(), 0);
	}

	#[tokio::test]
	async fn a_slow_adapter_surfaces_as_query_timeout_and_counts_as_a_failure() {
		let primary = StubAdapter::new(DbTarget::Primary, Duration::from_millis(200));
		let replica = StubAdapter::new(DbTarget::Replica, Duration::ZERO);
		let router = router_with(primary, replica);

		let mut query = insert();
		query.timeout_millis = 20;
		assert!(matches!(router.route(&query).await, Err(VoteflowError::QueryTimeout)));

		let status = router.circuits.status(DbTarget::Primary);
		assert_eq!(status.consecutive_failures, 1);
		assert_eq!(
			router.failover.connection(DbTarget::Primary).state,
			crate::dbproxy::failover::ConnectionState::Failed
		);
	}

	#[tokio::test]
	async fn adapter_errors_propagate_and_trip_the_circuit() {
		let primary = StubAdapter::new(DbTarget::Primary, Duration::ZERO);
		let replica = StubAdapter::new(DbTarget::Replica, Duration::ZERO);
		primary.fail.store(true, std::sync::atomic::Ordering::Relaxed);
		let router = router_with(primary, replica);

		for _ in 0..5 {
			let _ = router.route(&insert()).await;
		}
		// The circuit is now open; the call fails fast.
		assert!(matches!(
			router.route(&insert()).await,
			Err(VoteflowError::CircuitOpen(_)) | Err(VoteflowError::DbConnection { .. })
		));
	}
}
