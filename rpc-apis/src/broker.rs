use crate::RpcResult;

use jsonrpsee::proc_macros::rpc;
use uuid::Uuid;
use vf_primitives::{PendingVote, Priority};

/// Surface of the durable vote broker.
#[rpc(server, client, namespace = "broker")]
pub trait BrokerRpcApi {
	/// Stage a vote for delivery. Errors: QueueFull, StorageError.
	#[method(name = "enqueue_vote")]
	async fn enqueue_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		priority: Priority,
	) -> RpcResult<()>;

	/// Pop the next deliverable vote, respecting priority then age.
	/// Intended for drain tooling; the broker's own dispatcher owns the
	/// pull side in a deployed topology.
	#[method(name = "next_pending_vote")]
	async fn next_pending_vote(&self) -> RpcResult<Option<PendingVote>>;

	#[method(name = "queue_depth")]
	async fn queue_depth(&self) -> RpcResult<usize>;
}
