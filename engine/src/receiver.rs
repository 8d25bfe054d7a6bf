//! Receiving center: accepts votes from stations, guarantees uniqueness by
//! vote id and by voter id, and hands accepted votes on for consolidation.

use std::{
	collections::{HashMap, HashSet},
	path::Path,
	sync::{Arc, RwLock},
	time::Duration,
};

use async_trait::async_trait;
use jsonrpsee::http_client::HttpClient;
use uuid::Uuid;
use vf_primitives::{Priority, ReceiveOutcome, Vote, VoteState};
use vf_rpc_apis::{
	broker::BrokerRpcApiClient, central::CentralRpcApiClient, receiver::ReceiverRpcApiServer,
	remote_error_code, RpcResult, VfErrorCode, VoteflowError,
};
use vf_utilities::{is_clean_field, AuditLog};

use crate::{
	central::payload_hash,
	shutdown::ShutdownSignal,
	vote_store::{VoteRecord, VoteStore},
};

/// Voter id assumed when a station sends none. Never entered into the
/// voter registry.
const UNKNOWN_VOTER: &str = "UNKNOWN";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
	/// The consolidation side already has this vote. Success for us.
	#[error("vote already consolidated")]
	AlreadyConsolidated,
	#[error("transport failure: {0}")]
	Transport(String),
}

/// Where accepted votes go next: straight to the central server, or staged
/// through the broker when it is enabled. The broker is then the sole
/// dispatcher towards the center.
#[async_trait]
pub trait ConsolidationClient: Send + Sync + 'static {
	async fn forward(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		station_id: String,
	) -> Result<(), ForwardError>;
}

#[async_trait]
impl ConsolidationClient for Box<dyn ConsolidationClient> {
	async fn forward(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		station_id: String,
	) -> Result<(), ForwardError> {
		(**self).forward(vote_id, candidate_id, station_id).await
	}
}

pub struct DirectCentral {
	client: HttpClient,
}

impl DirectCentral {
	pub fn new(client: HttpClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl ConsolidationClient for DirectCentral {
	async fn forward(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		station_id: String,
	) -> Result<(), ForwardError> {
		let hash = payload_hash(vote_id, &candidate_id);
		match CentralRpcApiClient::receive_vote_from_station(
			&self.client,
			vote_id,
			candidate_id,
			station_id,
			hash,
		)
		.await
		{
			Ok(()) => Ok(()),
			Err(error) if remote_error_code(&error) == Some(VfErrorCode::DuplicateVote) =>
				Err(ForwardError::AlreadyConsolidated),
			Err(error) => Err(ForwardError::Transport(error.to_string())),
		}
	}
}

pub struct BrokeredCentral {
	client: HttpClient,
}

impl BrokeredCentral {
	pub fn new(client: HttpClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl ConsolidationClient for BrokeredCentral {
	async fn forward(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		_station_id: String,
	) -> Result<(), ForwardError> {
		BrokerRpcApiClient::enqueue_vote(&self.client, vote_id, candidate_id, Priority::Normal)
			.await
			.map_err(|error| ForwardError::Transport(error.to_string()))
	}
}

#[derive(Default)]
struct DedupSets {
	received: HashSet<Uuid>,
	voters: HashSet<String>,
}

pub struct CenterReceiver<F> {
	store: VoteStore<VoteState>,
	dedup: RwLock<DedupSets>,
	states: RwLock<HashMap<Uuid, VoteState>>,
	counters: RwLock<HashMap<String, u64>>,
	forwarder: F,
	audit: AuditLog,
}

impl<F: ConsolidationClient> CenterReceiver<F> {
	/// Opens the received store and rebuilds the dedup sets, state map and
	/// counters by scanning it.
	pub fn new(data_dir: &Path, forwarder: F) -> anyhow::Result<Self> {
		let store = VoteStore::open(data_dir, "received")?;
		let audit = AuditLog::open(data_dir, "receiver")?;

		let mut dedup = DedupSets::default();
		let mut states = HashMap::new();
		let mut counters: HashMap<String, u64> = HashMap::new();
		for record in store.load_all()? {
			dedup.received.insert(record.vote.vote_id);
			if let Some(voter_id) = &record.voter_id {
				if voter_id != UNKNOWN_VOTER {
					dedup.voters.insert(voter_id.clone());
				}
			}
			states.insert(record.vote.vote_id, record.state);
			if record.state == VoteState::Processed {
				*counters.entry(record.vote.candidate_id.clone()).or_default() += 1;
			}
		}
		tracing::info!(
			votes = dedup.received.len(),
			voters = dedup.voters.len(),
			"receiver state rebuilt from store"
		);

		Ok(Self {
			store,
			dedup: RwLock::new(dedup),
			states: RwLock::new(states),
			counters: RwLock::new(counters),
			forwarder,
			audit,
		})
	}

	/// The dedup check and the outcome for one incoming vote. Both sets are
	/// consulted and, on acceptance, marked under the same guard so a
	/// duplicate can never slip through between check and mutation.
	pub fn receive_vote(
		self: Arc<Self>,
		vote: Vote,
		voter_id: Option<String>,
	) -> Result<ReceiveOutcome, VoteflowError> {
		let voter_id = voter_id.unwrap_or_else(|| UNKNOWN_VOTER.to_string());

		for field in [&vote.candidate_id, &vote.station_origin, &voter_id] {
			if !is_clean_field(field) {
				return Err(VoteflowError::Storage(format!(
					"field `{field}` contains a reserved delimiter"
				)));
			}
		}

		{
			let dedup = self.dedup.read().expect("dedup lock poisoned");
			if dedup.received.contains(&vote.vote_id) {
				self.audit.record("DUPLICATE_VOTE_ID", &vote.vote_id.to_string(), "");
				return Ok(ReceiveOutcome::AlreadyProcessed);
			}
			if voter_id != UNKNOWN_VOTER && dedup.voters.contains(&voter_id) {
				return Ok(self.reject_voter(&vote));
			}
		}

		{
			let mut dedup = self.dedup.write().expect("dedup lock poisoned");
			// Re-check under the writer guard: another request may have won
			// the race between the two locks.
			if dedup.received.contains(&vote.vote_id) {
				return Ok(ReceiveOutcome::AlreadyProcessed);
			}
			if voter_id != UNKNOWN_VOTER && dedup.voters.contains(&voter_id) {
				return Ok(self.reject_voter(&vote));
			}
			dedup.received.insert(vote.vote_id);
			if voter_id != UNKNOWN_VOTER {
				dedup.voters.insert(voter_id.clone());
			}
		}

		let record = VoteRecord {
			vote: vote.clone(),
			state: VoteState::Received,
			voter_id: Some(voter_id.clone()),
		};
		if let Err(error) = self.store.append(&record) {
			// Writer-path storage failure is fatal for the operation. Undo
			// the reservation so a retry can succeed.
			let mut dedup = self.dedup.write().expect("dedup lock poisoned");
			dedup.received.remove(&vote.vote_id);
			if voter_id != UNKNOWN_VOTER {
				dedup.voters.remove(&voter_id);
			}
			return Err(VoteflowError::storage(error));
		}

		self.states
			.write()
			.expect("states lock poisoned")
			.insert(vote.vote_id, VoteState::Received);

		let receiver = self.clone();
		tokio::spawn(async move {
			receiver.process(vote.vote_id, vote.candidate_id, vote.station_origin).await;
		});

		Ok(ReceiveOutcome::Accepted)
	}

	fn reject_voter(&self, vote: &Vote) -> ReceiveOutcome {
		self.audit.record("DUPLICATE_VOTER", &vote.vote_id.to_string(), "voter already voted");
		self.states
			.write()
			.expect("states lock poisoned")
			.insert(vote.vote_id, VoteState::Error);
		ReceiveOutcome::RejectedVoter
	}

	/// Completes one accepted vote: forwards it for consolidation, then
	/// marks it PROCESSED and counts it. A transport failure leaves the
	/// record RECEIVED for the sweeper.
	async fn process(&self, vote_id: Uuid, candidate_id: String, station_id: String) {
		match self.forwarder.forward(vote_id, candidate_id.clone(), station_id).await {
			Ok(()) | Err(ForwardError::AlreadyConsolidated) => {},
			Err(ForwardError::Transport(message)) => {
				tracing::warn!(%vote_id, %message, "consolidation failed, record stays RECEIVED");
				return;
			},
		}

		match self.store.update_state(vote_id, VoteState::Processed) {
			Ok(true) => {},
			Ok(false) => {
				tracing::error!(%vote_id, "processed a vote that is not in the store");
				return;
			},
			Err(error) => {
				// The forward went through; the sweeper will re-run this
				// record and the center deduplicates the re-send.
				tracing::error!(%vote_id, %error, "could not mark record PROCESSED");
				return;
			},
		}

		*self
			.counters
			.write()
			.expect("counters lock poisoned")
			.entry(candidate_id)
			.or_default() += 1;
		self.states
			.write()
			.expect("states lock poisoned")
			.insert(vote_id, VoteState::Processed);
		self.audit.record("PROCESSED", &vote_id.to_string(), "");
	}

	pub fn vote_status(&self, vote_id: Uuid) -> Option<VoteState> {
		self.states.read().expect("states lock poisoned").get(&vote_id).copied()
	}

	pub fn tally(&self, candidate_id: &str) -> u64 {
		self.counters
			.read()
			.expect("counters lock poisoned")
			.get(candidate_id)
			.copied()
			.unwrap_or_default()
	}

	/// Re-runs processing for every record still in RECEIVED.
	pub async fn sweep_once(&self) -> anyhow::Result<usize> {
		let stuck: Vec<VoteRecord<VoteState>> = self
			.store
			.load_all()?
			.into_iter()
			.filter(|record| record.state == VoteState::Received)
			.collect();
		let count = stuck.len();
		for record in stuck {
			self.process(
				record.vote.vote_id,
				record.vote.candidate_id,
				record.vote.station_origin,
			)
			.await;
		}
		Ok(count)
	}

	pub async fn run_reprocess_sweep(
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
						Ok(count) => tracing::info!(count, "re-ran processing for stuck votes"),
						Err(error) => tracing::error!(%error, "reprocess sweep failed"),
					}
				},
			}
		}
	}
}

pub struct ReceiverRpcServerImpl<F> {
	receiver: Arc<CenterReceiver<F>>,
}

impl<F> ReceiverRpcServerImpl<F> {
	pub fn new(receiver: Arc<CenterReceiver<F>>) -> Self {
		Self { receiver }
	}
}

#[async_trait]
impl<F: ConsolidationClient> ReceiverRpcApiServer for ReceiverRpcServerImpl<F> {
	async fn receive_vote(
		&self,
		vote: Vote,
		voter_id: Option<String>,
	) -> RpcResult<ReceiveOutcome> {
		Ok(self.receiver.clone().receive_vote(vote, voter_id)?)
	}

	async fn vote_status(&self, vote_id: Uuid) -> RpcResult<Option<VoteState>> {
		Ok(self.receiver.vote_status(vote_id))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	#[derive(Default)]
	struct ScriptedForwarder {
		// Outcomes consumed front to back; empty means success.
		outcomes: Mutex<Vec<Result<(), ForwardError>>>,
		forwarded: Mutex<Vec<Uuid>>,
	}

	impl ScriptedForwarder {
		fn fail_next(&self) {
			self.outcomes
				.lock()
				.unwrap()
				.push(Err(ForwardError::Transport("unreachable".to_string())));
		}
	}

	#[async_trait]
	impl ConsolidationClient for Arc<ScriptedForwarder> {
		async fn forward(
			&self,
			vote_id: Uuid,
			_candidate_id: String,
			_station_id: String,
		) -> Result<(), ForwardError> {
			self.forwarded.lock().unwrap().push(vote_id);
			self.outcomes.lock().unwrap().pop().unwrap_or(Ok(()))
		}
	}

	fn receiver_in(
		dir: &std::path::Path,
	) -> (Arc<CenterReceiver<Arc<ScriptedForwarder>>>, Arc<ScriptedForwarder>) {
		let forwarder = Arc::new(ScriptedForwarder::default());
		let receiver = Arc::new(CenterReceiver::new(dir, forwarder.clone()).unwrap());
		(receiver, forwarder)
	}

	fn vote(candidate_id: &str) -> Vote {
		Vote::new(candidate_id.to_string(), "Station01".to_string())
	}

	async fn settle() {
		// Lets the spawned processing task run.
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	#[tokio::test]
	async fn accepted_vote_is_processed_and_counted_once() {
		let dir = tempfile::tempdir().unwrap();
		let (receiver, forwarder) = receiver_in(dir.path());

		let vote = vote("C001");
		let outcome = receiver.clone().receive_vote(vote.clone(), Some("V1".to_string())).unwrap();
		assert_eq!(outcome, ReceiveOutcome::Accepted);

		settle().await;
		assert_eq!(receiver.vote_status(vote.vote_id), Some(VoteState::Processed));
		assert_eq!(receiver.tally("C001"), 1);
		assert_eq!(forwarder.forwarded.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn replayed_vote_id_reports_already_processed() {
		let dir = tempfile::tempdir().unwrap();
		let (receiver, _forwarder) = receiver_in(dir.path());

		let vote = vote("C001");
		receiver.clone().receive_vote(vote.clone(), Some("V1".to_string())).unwrap();
		settle().await;

		let replay = receiver.clone().receive_vote(vote, Some("V1".to_string())).unwrap();
		assert_eq!(replay, ReceiveOutcome::AlreadyProcessed);
		assert_eq!(receiver.tally("C001"), 1);
	}

	#[tokio::test]
	async fn second_vote_from_the_same_voter_is_rejected_before_any_state_change() {
		let dir = tempfile::tempdir().unwrap();
		let (receiver, _forwarder) = receiver_in(dir.path());

		receiver.clone().receive_vote(vote("C001"), Some("V1".to_string())).unwrap();
		settle().await;

		let second = vote("C002");
		let outcome = receiver.clone().receive_vote(second.clone(), Some("V1".to_string())).unwrap();
		assert_eq!(outcome, ReceiveOutcome::RejectedVoter);
		assert_eq!(receiver.vote_status(second.vote_id), Some(VoteState::Error));
		assert_eq!(receiver.tally("C002"), 0);
		// The rejected vote never reached the store.
		assert!(receiver.store.get(second.vote_id).unwrap().is_none());
	}

	#[tokio::test]
	async fn fields_with_reserved_delimiters_are_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let (receiver, _forwarder) = receiver_in(dir.path());

		let mut bad = vote("C001");
		bad.candidate_id = "C0|01".to_string();
		assert!(receiver.clone().receive_vote(bad, Some("V1".to_string())).is_err());
		assert!(receiver
			.clone()
			.receive_vote(vote("C001"), Some("V|1".to_string()))
			.is_err());

		assert_eq!(receiver.tally("C001"), 0);
		assert!(receiver.store.load_all().unwrap().is_empty());
	}

	#[tokio::test]
	async fn unknown_voter_is_not_registered_for_dedup() {
		let dir = tempfile::tempdir().unwrap();
		let (receiver, _forwarder) = receiver_in(dir.path());

		assert_eq!(
			receiver.clone().receive_vote(vote("C001"), None).unwrap(),
			ReceiveOutcome::Accepted
		);
		// A second anonymous submission is not treated as a repeat voter.
		assert_eq!(
			receiver.clone().receive_vote(vote("C001"), None).unwrap(),
			ReceiveOutcome::Accepted
		);
	}

	#[tokio::test]
	async fn failed_forward_leaves_the_record_for_the_sweeper() {
		let dir = tempfile::tempdir().unwrap();
		let (receiver, forwarder) = receiver_in(dir.path());

		forwarder.fail_next();
		let vote = vote("C001");
		receiver.clone().receive_vote(vote.clone(), Some("V1".to_string())).unwrap();
		settle().await;

		assert_eq!(receiver.vote_status(vote.vote_id), Some(VoteState::Received));
		assert_eq!(receiver.tally("C001"), 0);

		// The sweep retries and the forward now succeeds.
		let swept = receiver.sweep_once().await.unwrap();
		assert_eq!(swept, 1);
		assert_eq!(receiver.vote_status(vote.vote_id), Some(VoteState::Processed));
		assert_eq!(receiver.tally("C001"), 1);
	}

	#[tokio::test]
	async fn state_is_rebuilt_from_the_store_on_restart() {
		let dir = tempfile::tempdir().unwrap();
		let first_vote = vote("C001");
		{
			let (receiver, _forwarder) = receiver_in(dir.path());
			receiver
				.clone()
				.receive_vote(first_vote.clone(), Some("V1".to_string()))
				.unwrap();
			settle().await;
		}

		let (receiver, _forwarder) = receiver_in(dir.path());
		assert_eq!(
			receiver.clone().receive_vote(first_vote, Some("V9".to_string())).unwrap(),
			ReceiveOutcome::AlreadyProcessed
		);
		assert_eq!(
			receiver.clone().receive_vote(vote("C002"), Some("V1".to_string())).unwrap(),
			ReceiveOutcome::RejectedVoter
		);
		assert_eq!(receiver.tally("C001"), 1);
	}
}
