//! Polling-station agent: accepts ballots, persists them transiently, and
//! dispatches them to the receiving center until each one is confirmed.

use std::{
	path::Path,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use jsonrpsee::http_client::HttpClient;
use rand::Rng;
use uuid::Uuid;
use vf_primitives::{ReceiveOutcome, StationVoteStatus, Vote, VoteState};
use vf_rpc_apis::{
	receiver::ReceiverRpcApiClient, station::StationRpcApiServer, RpcResult, VoteflowError,
};
use vf_utilities::is_clean_field;

use crate::{
	constants::{STATION_STATUS_POLL_ATTEMPTS, STATION_STATUS_POLL_INTERVAL},
	shutdown::ShutdownSignal,
	vote_store::{VoteRecord, VoteStore},
};

/// The station's view of the receiving center. A seam so the agent can be
/// exercised without a network.
#[async_trait]
pub trait CenterClient: Send + Sync + 'static {
	async fn receive_vote(
		&self,
		vote: Vote,
		voter_id: Option<String>,
	) -> Result<ReceiveOutcome, jsonrpsee::core::ClientError>;

	async fn vote_status(
		&self,
		vote_id: Uuid,
	) -> Result<Option<VoteState>, jsonrpsee::core::ClientError>;
}

/// The production client: a jsonrpsee HTTP client against the receiver.
pub struct RemoteCenter {
	client: HttpClient,
}

impl RemoteCenter {
	pub fn new(client: HttpClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl CenterClient for RemoteCenter {
	async fn receive_vote(
		&self,
		vote: Vote,
		voter_id: Option<String>,
	) -> Result<ReceiveOutcome, jsonrpsee::core::ClientError> {
		ReceiverRpcApiClient::receive_vote(&self.client, vote, voter_id).await
	}

	async fn vote_status(
		&self,
		vote_id: Uuid,
	) -> Result<Option<VoteState>, jsonrpsee::core::ClientError> {
		ReceiverRpcApiClient::vote_status(&self.client, vote_id).await
	}
}

#[derive(Default)]
pub struct StationMetrics {
	pub submitted: AtomicU64,
	pub confirmed: AtomicU64,
	pub rejected: AtomicU64,
}

pub struct StationAgent<C> {
	station_id: String,
	store: VoteStore<StationVoteStatus>,
	center: C,
	pub metrics: StationMetrics,
}

impl<C: CenterClient> StationAgent<C> {
	pub fn new(station_id: String, data_dir: &Path, center: C) -> anyhow::Result<Self> {
		Ok(Self {
			station_id,
			store: VoteStore::open(data_dir, "transient")?,
			center,
			metrics: StationMetrics::default(),
		})
	}

	/// Records a ballot as PENDING and returns its fresh vote id. The
	/// record survives until the center acknowledges it; dispatch happens
	/// separately.
	pub fn submit(&self, candidate_id: &str, voter_id: &str) -> Result<Uuid, VoteflowError> {
		if candidate_id.is_empty() || voter_id.is_empty() {
			return Err(VoteflowError::Storage(
				"candidate id and voter id must not be empty".to_string(),
			));
		}
		if !is_clean_field(candidate_id) || !is_clean_field(voter_id) {
			return Err(VoteflowError::Storage(
				"candidate id and voter id must not contain delimiters".to_string(),
			));
		}
		let record = VoteRecord {
			vote: Vote::new(candidate_id.to_string(), self.station_id.clone()),
			state: StationVoteStatus::Pending,
			voter_id: Some(voter_id.to_string()),
		};
		self.store.append(&record).map_err(VoteflowError::storage)?;
		self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
		tracing::info!(vote_id = %record.vote.vote_id, candidate_id, "ballot recorded");
		Ok(record.vote.vote_id)
	}

	/// Sends one vote to the center and settles the local record according
	/// to the outcome. Transport failures leave the record PENDING; the
	/// retry sweep picks it up again.
	pub async fn dispatch(&self, vote: Vote, voter_id: Option<String>) {
		let vote_id = vote.vote_id;
		match self.center.receive_vote(vote, voter_id).await {
			Ok(ReceiveOutcome::Accepted) => {
				self.poll_confirmation(vote_id).await;
			},
			Ok(ReceiveOutcome::AlreadyProcessed) => {
				// The center has this one already. Success from our side.
				self.mark(vote_id, StationVoteStatus::Confirmed);
			},
			Ok(ReceiveOutcome::RejectedVoter) => {
				tracing::warn!(%vote_id, "voter already voted, ballot rejected");
				self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
				self.mark(vote_id, StationVoteStatus::Error);
			},
			Err(error) => {
				tracing::warn!(%vote_id, %error, "dispatch failed, leaving record pending");
			},
		}
	}

	/// Polls the center's status for an accepted vote. Gives up after a few
	/// rounds and leaves the record to the sweep.
	async fn poll_confirmation(&self, vote_id: Uuid) {
		for _ in 0..STATION_STATUS_POLL_ATTEMPTS {
			let jitter =
				Duration::from_millis(rand::thread_rng().gen_range(0..100));
			tokio::time::sleep(STATION_STATUS_POLL_INTERVAL + jitter).await;

			match self.center.vote_status(vote_id).await {
				Ok(Some(VoteState::Processed)) => {
					self.mark(vote_id, StationVoteStatus::Confirmed);
					return;
				},
				Ok(Some(VoteState::Error)) => {
					// Keep the record pending; the sweep retries it.
					tracing::warn!(%vote_id, "center reported ERROR, will retry");
					return;
				},
				Ok(_) => {},
				Err(error) => {
					tracing::debug!(%vote_id, %error, "status poll failed");
				},
			}
		}
		tracing::debug!(%vote_id, "vote not confirmed yet, leaving to the retry sweep");
	}

	fn mark(&self, vote_id: Uuid, status: StationVoteStatus) {
		if status == StationVoteStatus::Confirmed {
			self.metrics.confirmed.fetch_add(1, Ordering::Relaxed);
		}
		match self.store.update_state(vote_id, status) {
			Ok(true) => {},
			Ok(false) => tracing::warn!(%vote_id, "ack for unknown vote"),
			// Confirmation-path storage failures are not fatal: the record
			// stays in its previous state and the sweep reconciles it.
			Err(error) => tracing::error!(%vote_id, %error, "failed to update local record"),
		}
	}

	pub fn local_status(&self, vote_id: Uuid) -> Result<Option<StationVoteStatus>, VoteflowError> {
		Ok(self
			.store
			.get(vote_id)
			.map_err(VoteflowError::storage)?
			.map(|record| record.state))
	}

	/// Re-dispatches every PENDING record, oldest first.
	pub async fn sweep_once(&self) -> anyhow::Result<usize> {
		let pending: Vec<VoteRecord<StationVoteStatus>> = self
			.store
			.load_all()?
			.into_iter()
			.filter(|record| record.state == StationVoteStatus::Pending)
			.collect();
		let count = pending.len();
		for record in pending {
			self.dispatch(record.vote, record.voter_id).await;
		}
		Ok(count)
	}

	/// The periodic retry sweep. Runs until shutdown.
	pub async fn run_retry_sweep(
		self: Arc<Self>,
		interval: Duration,
		mut shutdown: ShutdownSignal,
	) {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				() = shutdown.wait() => return,
				_ = ticker.tick() => {
					match self.sweep_once().await {
						Ok(0) => {},
						Ok(count) => tracing::info!(count, "retry sweep re-dispatched pending votes"),
						Err(error) => tracing::error!(%error, "retry sweep failed"),
					}
				},
			}
		}
	}
}

/// RPC front of the agent, driven by the station's front-of-house terminal.
pub struct StationRpcServerImpl<C> {
	agent: Arc<StationAgent<C>>,
}

impl<C> StationRpcServerImpl<C> {
	pub fn new(agent: Arc<StationAgent<C>>) -> Self {
		Self { agent }
	}
}

#[async_trait]
impl<C: CenterClient> StationRpcApiServer for StationRpcServerImpl<C> {
	async fn submit_vote(&self, candidate_id: String, voter_id: String) -> RpcResult<Uuid> {
		let vote_id = self.agent.submit(&candidate_id, &voter_id)?;
		let record = self
			.agent
			.store
			.get(vote_id)
			.map_err(VoteflowError::storage)?
			.ok_or_else(|| VoteflowError::Storage("submitted record not found".to_string()))?;
		let agent = self.agent.clone();
		tokio::spawn(async move {
			agent.dispatch(record.vote, record.voter_id).await;
		});
		Ok(vote_id)
	}

	async fn vote_status(&self, vote_id: Uuid) -> RpcResult<Option<StationVoteStatus>> {
		Ok(self.agent.local_status(vote_id)?)
	}
}
