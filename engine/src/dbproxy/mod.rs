//! The database proxy: single point of access to the primary/replica
//! stores, combining query routing, per-target circuit breaking, failover
//! and a TTL-bounded result cache behind one RPC gateway.

mod cache;
mod circuits;
mod failover;
mod router;
mod storage;

pub use cache::CacheService;
pub use circuits::CircuitBreakerService;
pub use failover::{ConnectionInfo, ConnectionState, FailoverHandler};
pub use router::QueryRouter;
pub use storage::{NodeStore, PrimaryAdapter, ReplicaAdapter, StorageAdapter};

use std::{
	path::Path,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, RwLock,
	},
	time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use itertools::Itertools;
use uuid::Uuid;
use vf_primitives::{
	format_timestamp, Candidate, CandidateTally, CircuitStatus, DbTarget, QueryParams,
	QueryResult, QueryType, VoteState,
};
use vf_rpc_apis::{dbproxy::DbProxyRpcApiServer, RpcResult, VoteflowError};
use vf_utilities::{is_clean_field, AuditLog, CircuitBreakerConfig};

use crate::constants::{
	CANDIDATES_CACHE_TTL, DEFAULT_QUERY_TIMEOUT, TURNOUT_CACHE_TTL, VOTE_STATE_CACHE_TTL,
};

pub struct DbProxy {
	pub router: QueryRouter,
	pub cache: Arc<CacheService>,
	primary: Arc<PrimaryAdapter>,
	replica: Arc<ReplicaAdapter>,
	/// Last results version each registered trigger has seen.
	triggers: RwLock<std::collections::HashMap<String, u64>>,
	results_version: AtomicU64,
}

impl DbProxy {
	pub fn new(
		data_dir: &Path,
		circuit_config: CircuitBreakerConfig,
		cache_max_size: usize,
		cache_default_ttl: Duration,
		recovery_timeout: Duration,
	) -> anyhow::Result<Self> {
		let audit = AuditLog::open(data_dir, "dbproxy")?;
		let replica =
			Arc::new(ReplicaAdapter::new(NodeStore::open(data_dir, DbTarget::Replica)?));
		let primary = Arc::new(PrimaryAdapter::new(
			NodeStore::open(data_dir, DbTarget::Primary)?,
			replica.clone(),
			audit,
		));

		let router = QueryRouter::new(
			primary.clone(),
			replica.clone(),
			FailoverHandler::new(
				ConnectionInfo::active("primary-node", "localhost", 0),
				ConnectionInfo::active("replica-node", "localhost", 0),
				recovery_timeout,
			),
			CircuitBreakerService::new(circuit_config),
		);
		let cache = Arc::new(CacheService::open(data_dir, cache_max_size, cache_default_ttl)?);

		Ok(Self {
			router,
			cache,
			primary,
			replica,
			triggers: RwLock::new(std::collections::HashMap::new()),
			results_version: AtomicU64::new(0),
		})
	}

	/// Routes one gateway-built query and turns a logical failure into
	/// `StorageError`.
	async fn run(&self, params: QueryParams) -> Result<QueryResult, VoteflowError> {
		let result = self.router.route(&params).await?;
		if result.successful {
			Ok(result)
		} else {
			Err(VoteflowError::Storage(
				result.error.unwrap_or_else(|| format!("{} failed", params.query)),
			))
		}
	}

	pub async fn save_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		timestamp: NaiveDateTime,
		hash: String,
	) -> Result<(), VoteflowError> {
		if [&candidate_id, &hash]
			.iter()
			.any(|field| field.is_empty() || !is_clean_field(field))
		{
			return Err(VoteflowError::Storage(
				"candidate id and hash must be non-empty and delimiter-free".to_string(),
			));
		}
		self.run(QueryParams::new(
			storage::INSERT_VOTE,
			format!("{vote_id}|{candidate_id}|{}|{hash}", format_timestamp(timestamp)),
			QueryType::Insert,
			DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
		))
		.await?;

		self.results_version.fetch_add(1, Ordering::SeqCst);
		// The stored tallies and turnout just changed.
		self.cache.invalidate("turnout_*");
		self.cache.invalidate(&format!("voteState_{vote_id}"));
		Ok(())
	}

	pub async fn verify_vote_state(
		&self,
		vote_id: Uuid,
	) -> Result<Option<VoteState>, VoteflowError> {
		let key = format!("voteState_{vote_id}");
		if let Some(cached) = self.cache.get(&key) {
			return Ok(cached.parse().ok());
		}

		let result = self
			.run(QueryParams::new(
				storage::VERIFY_VOTE_STATE,
				vote_id.to_string(),
				QueryType::Select,
				DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
			))
			.await?;
		let state: Option<VoteState> =
			result.rows.first().and_then(|row| row.parse().ok());
		if let Some(state) = state {
			self.cache.set(&key, state.to_string(), VOTE_STATE_CACHE_TTL);
		}
		Ok(state)
	}

	pub async fn save_candidates(
		&self,
		candidates: Vec<Candidate>,
	) -> Result<(), VoteflowError> {
		if candidates.is_empty() {
			return Err(VoteflowError::Storage("empty candidate catalog".to_string()));
		}
		for candidate in &candidates {
			if [&candidate.candidate_id, &candidate.name, &candidate.party]
				.iter()
				.any(|field| {
					field.is_empty() || field.contains([';', ',']) || !is_clean_field(field)
				}) {
				return Err(VoteflowError::Storage(format!(
					"invalid candidate fields for `{}`",
					candidate.candidate_id
				)));
			}
		}

		let params = candidates
			.iter()
			.map(|candidate| {
				format!("{},{},{}", candidate.candidate_id, candidate.name, candidate.party)
			})
			.join(";");
		self.run(QueryParams::new(
			storage::INSERT_CANDIDATES,
			params,
			QueryType::Insert,
			DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
		))
		.await?;
		self.cache.invalidate("candidates_*");
		Ok(())
	}

	pub async fn get_candidates(&self) -> Result<Vec<Candidate>, VoteflowError> {
		if let Some(cached) = self.cache.get("candidates_all") {
			if let Ok(candidates) = serde_json::from_str(&cached) {
				return Ok(candidates);
			}
		}

		let result = self
			.run(QueryParams::new(
				storage::SELECT_CANDIDATES,
				"",
				QueryType::Select,
				DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
			))
			.await?;
		let candidates: Vec<Candidate> = result
			.rows
			.iter()
			.filter_map(|row| {
				row.split('|').collect_tuple().map(|(candidate_id, name, party)| Candidate {
					candidate_id: candidate_id.to_string(),
					name: name.to_string(),
					party: party.to_string(),
				})
			})
			.collect();

		if let Ok(serialized) = serde_json::to_string(&candidates) {
			self.cache.set("candidates_all", serialized, CANDIDATES_CACHE_TTL);
		}
		Ok(candidates)
	}

	pub fn register_update_trigger(&self, trigger_id: String) -> Result<(), VoteflowError> {
		if trigger_id.is_empty() {
			return Err(VoteflowError::Storage("empty trigger id".to_string()));
		}
		// Version 0 means the trigger has seen nothing yet, so its first
		// fetch always returns the current tallies.
		self.triggers.write().expect("triggers lock poisoned").insert(trigger_id, 0);
		Ok(())
	}

	pub async fn get_updated_results(
		&self,
		trigger_id: String,
	) -> Result<Option<Vec<CandidateTally>>, VoteflowError> {
		let current = self.results_version.load(Ordering::SeqCst);
		{
			let triggers = self.triggers.read().expect("triggers lock poisoned");
			match triggers.get(&trigger_id) {
				None =>
					return Err(VoteflowError::Storage(format!(
						"unknown trigger `{trigger_id}`"
					))),
				Some(seen) if *seen == current => return Ok(None),
				Some(_) => {},
			}
		}

		let result = self
			.run(QueryParams::new(
				storage::COUNT_VOTES_BY_CANDIDATE,
				"",
				QueryType::Select,
				DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
			))
			.await?;
		let tallies: Vec<CandidateTally> = result
			.rows
			.iter()
			.filter_map(|row| {
				row.split('|').collect_tuple().and_then(|(candidate_id, votes)| {
					Some(CandidateTally {
						candidate_id: candidate_id.to_string(),
						votes: votes.parse().ok()?,
					})
				})
			})
			.collect();

		self.triggers
			.write()
			.expect("triggers lock poisoned")
			.insert(trigger_id, current);
		Ok(Some(tallies))
	}

	pub async fn get_turnout_percentage(&self) -> Result<f64, VoteflowError> {
		if let Some(cached) = self.cache.get("turnout_percentage") {
			if let Ok(turnout) = cached.parse() {
				return Ok(turnout);
			}
		}

		let votes: u64 = self
			.run(QueryParams::new(
				storage::COUNT_VOTES,
				"",
				QueryType::Select,
				DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
			))
			.await?
			.rows
			.first()
			.and_then(|row| row.parse().ok())
			.unwrap_or_default();
		let electorate: u64 = self
			.run(QueryParams::new(
				storage::GET_META,
				"electorate_size",
				QueryType::Select,
				DEFAULT_QUERY_TIMEOUT.as_millis() as u64,
			))
			.await?
			.rows
			.first()
			.and_then(|row| row.parse().ok())
			.unwrap_or_default();

		let turnout = if electorate == 0 {
			0.0
		} else {
			votes as f64 * 100.0 / electorate as f64
		};
		self.cache.set("turnout_percentage", turnout.to_string(), TURNOUT_CACHE_TTL);
		Ok(turnout)
	}

	pub async fn route_query(
		&self,
		params: QueryParams,
	) -> Result<QueryResult, VoteflowError> {
		if params.query.is_empty() {
			return Err(VoteflowError::Storage("empty query".to_string()));
		}
		self.router.route(&params).await
	}

	pub fn circuit_status(&self, target: DbTarget) -> CircuitStatus {
		self.router.circuits.status(target)
	}

	/// Test and maintenance hooks for simulating node loss.
	pub fn set_node_available(&self, target: DbTarget, available: bool) {
		match target {
			DbTarget::Primary => self.primary.set_available(available),
			DbTarget::Replica => self.replica.set_available(available),
		}
	}
}

pub struct DbProxyRpcServerImpl {
	proxy: Arc<DbProxy>,
}

impl DbProxyRpcServerImpl {
	pub fn new(proxy: Arc<DbProxy>) -> Self {
		Self { proxy }
	}
}

#[async_trait]
impl DbProxyRpcApiServer for DbProxyRpcServerImpl {
	async fn save_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		timestamp: NaiveDateTime,
		hash: String,
	) -> RpcResult<()> {
		Ok(self.proxy.save_vote(vote_id, candidate_id, timestamp, hash).await?)
	}

	async fn verify_vote_state(&self, vote_id: Uuid) -> RpcResult<Option<VoteState>> {
		Ok(self.proxy.verify_vote_state(vote_id).await?)
	}

	async fn save_candidates(&self, candidates: Vec<Candidate>) -> RpcResult<()> {
		Ok(self.proxy.save_candidates(candidates).await?)
	}

	async fn get_candidates(&self) -> RpcResult<Vec<Candidate>> {
		Ok(self.proxy.get_candidates().await?)
	}

	async fn register_update_trigger(&self, trigger_id: String) -> RpcResult<()> {
		Ok(self.proxy.register_update_trigger(trigger_id)?)
	}

	async fn get_updated_results(
		&self,
		trigger_id: String,
	) -> RpcResult<Option<Vec<CandidateTally>>> {
		Ok(self.proxy.get_updated_results(trigger_id).await?)
	}

	async fn get_turnout_percentage(&self) -> RpcResult<f64> {
		Ok(self.proxy.get_turnout_percentage().await?)
	}

	async fn route_query(&self, params: QueryParams) -> RpcResult<QueryResult> {
		Ok(self.proxy.route_query(params).await?)
	}

	async fn circuit_status(&self, target: DbTarget) -> RpcResult<CircuitStatus> {
		Ok(self.proxy.circuit_status(target))
	}

	async fn register_failure(&self, target: DbTarget) -> RpcResult<()> {
		self.proxy.router.circuits.register_failure(target);
		self.proxy.router.failover.register_failure(target);
		Ok(())
	}

	async fn register_success(&self, target: DbTarget) -> RpcResult<()> {
		self.proxy.router.circuits.register_success(target);
		self.proxy.router.failover.register_success(target);
		Ok(())
	}
}
