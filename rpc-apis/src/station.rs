use crate::RpcResult;

use jsonrpsee::proc_macros::rpc;
use uuid::Uuid;
use vf_primitives::StationVoteStatus;

/// Submission surface of a polling-station agent. The front-of-house
/// terminal (out of scope here) drives these two methods.
#[rpc(server, client, namespace = "station")]
pub trait StationRpcApi {
	/// Record a ballot and start dispatching it. Errors: StorageError.
	#[method(name = "submit_vote")]
	async fn submit_vote(&self, candidate_id: String, voter_id: String) -> RpcResult<Uuid>;

	/// Local status of a previously submitted ballot.
	#[method(name = "vote_status")]
	async fn vote_status(&self, vote_id: Uuid) -> RpcResult<Option<StationVoteStatus>>;
}
