use crate::RpcResult;

use jsonrpsee::proc_macros::rpc;
use uuid::Uuid;
use vf_primitives::VoteState;

/// Surface of the consolidation server.
#[rpc(server, client, namespace = "central")]
pub trait CentralRpcApi {
	/// Consolidate one vote. The hash is the sender's payload digest, used
	/// for duplicate suppression of payload-identical re-sends.
	/// Errors: DuplicateVote, StorageError.
	#[method(name = "receive_vote_from_station")]
	async fn receive_vote_from_station(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		station_id: String,
		hash: String,
	) -> RpcResult<()>;

	#[method(name = "vote_state")]
	async fn vote_state(&self, vote_id: Uuid) -> RpcResult<Option<VoteState>>;
}
