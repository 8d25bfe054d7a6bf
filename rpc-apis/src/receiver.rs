use crate::RpcResult;

use jsonrpsee::proc_macros::rpc;
use uuid::Uuid;
use vf_primitives::{ReceiveOutcome, Vote, VoteState};

/// Surface of the receiving center.
///
/// Stations hand over the vote envelope together with the voter's identity
/// as an out-of-band argument; the identity is used for duplicate-voter
/// suppression only and never persisted with the vote. Confirmation follows
/// the pull model: stations poll `vote_status` with the vote id as the
/// correlation key.
#[rpc(server, client, namespace = "receiver")]
pub trait ReceiverRpcApi {
	#[method(name = "receive_vote")]
	async fn receive_vote(&self, vote: Vote, voter_id: Option<String>)
		-> RpcResult<ReceiveOutcome>;

	#[method(name = "vote_status")]
	async fn vote_status(&self, vote_id: Uuid) -> RpcResult<Option<VoteState>>;
}
