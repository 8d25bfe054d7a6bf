use crate::RpcResult;

use chrono::NaiveDateTime;
use jsonrpsee::proc_macros::rpc;
use uuid::Uuid;
use vf_primitives::{
	Candidate, CandidateTally, CircuitStatus, DbTarget, QueryParams, QueryResult, VoteState,
};

/// Gateway to the primary/replica stores.
///
/// Writes go to the primary (with best-effort replication); reads are routed
/// to the replica when its circuit allows. Results are cached per operation
/// with the TTLs fixed in the gateway.
#[rpc(server, client, namespace = "dbproxy")]
pub trait DbProxyRpcApi {
	#[method(name = "save_vote")]
	async fn save_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		timestamp: NaiveDateTime,
		hash: String,
	) -> RpcResult<()>;

	#[method(name = "verify_vote_state")]
	async fn verify_vote_state(&self, vote_id: Uuid) -> RpcResult<Option<VoteState>>;

	#[method(name = "save_candidates")]
	async fn save_candidates(&self, candidates: Vec<Candidate>) -> RpcResult<()>;

	#[method(name = "get_candidates")]
	async fn get_candidates(&self) -> RpcResult<Vec<Candidate>>;

	/// Register interest in result updates. Subsequent
	/// `get_updated_results` calls with the same trigger id return tallies
	/// only when they changed since that trigger last asked.
	#[method(name = "register_update_trigger")]
	async fn register_update_trigger(&self, trigger_id: String) -> RpcResult<()>;

	#[method(name = "get_updated_results")]
	async fn get_updated_results(&self, trigger_id: String)
		-> RpcResult<Option<Vec<CandidateTally>>>;

	#[method(name = "get_turnout_percentage")]
	async fn get_turnout_percentage(&self) -> RpcResult<f64>;

	/// Raw routing entry point. Errors: StorageError, QueryTimeout,
	/// DBConnection, CircuitOpen.
	#[method(name = "route_query")]
	async fn route_query(&self, params: QueryParams) -> RpcResult<QueryResult>;

	#[method(name = "circuit_status")]
	async fn circuit_status(&self, target: DbTarget) -> RpcResult<CircuitStatus>;

	/// Feed an externally observed failure into the target's circuit.
	#[method(name = "register_failure")]
	async fn register_failure(&self, target: DbTarget) -> RpcResult<()>;

	#[method(name = "register_success")]
	async fn register_success(&self, target: DbTarget) -> RpcResult<()>;
}
