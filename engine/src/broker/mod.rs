//! Durable, priority-aware staging between the receiving center and the
//! central server: priority and retry queues, persistent replay across
//! restarts, and a circuit-broken dispatcher towards the center.

mod queues;

pub use queues::{PrimaryQueue, RetryQueue};

use std::{
	path::Path,
	str::FromStr,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use async_trait::async_trait;
use itertools::Itertools;
use jsonrpsee::http_client::HttpClient;
use tokio::sync::Notify;
use uuid::Uuid;
use vf_primitives::{PendingVote, Priority};
use vf_rpc_apis::{
	broker::BrokerRpcApiServer, central::CentralRpcApiClient, remote_error_code, RpcResult,
	VfErrorCode, VoteflowError,
};
use vf_utilities::{is_clean_field, CircuitBreaker, CircuitBreakerConfig, LineStore};

use crate::{
	central::payload_hash,
	constants::{BROKER_DISPATCH_IDLE, BROKER_DISPATCH_TIMEOUT},
	settings::QueueSettings,
	shutdown::ShutdownSignal,
};

/// Station identifier the broker presents when consolidating on behalf of
/// the field.
const BROKER_ORIGIN: &str = "BROKER";

/// Retry delay for the n-th delivery attempt (1-based): the base delay
/// doubles per attempt, capped at four doublings and at `max`.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
	std::cmp::min(base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(4))), max)
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
	/// The center already consolidated this vote. Delivery is done.
	#[error("vote already consolidated")]
	AlreadyConsolidated,
	#[error("transport failure: {0}")]
	Transport(String),
}

/// The broker's downstream: the central consolidation server.
#[async_trait]
pub trait CentralDispatch: Send + Sync + 'static {
	async fn forward(&self, vote_id: Uuid, candidate_id: String) -> Result<(), DispatchError>;
}

pub struct RemoteCentralDispatch {
	client: HttpClient,
}

impl RemoteCentralDispatch {
	pub fn new(client: HttpClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl CentralDispatch for RemoteCentralDispatch {
	async fn forward(&self, vote_id: Uuid, candidate_id: String) -> Result<(), DispatchError> {
		let hash = payload_hash(vote_id, &candidate_id);
		match CentralRpcApiClient::receive_vote_from_station(
			&self.client,
			vote_id,
			candidate_id,
			BROKER_ORIGIN.to_string(),
			hash,
		)
		.await
		{
			Ok(()) => Ok(()),
			Err(error) if remote_error_code(&error) == Some(VfErrorCode::DuplicateVote) =>
				Err(DispatchError::AlreadyConsolidated),
			Err(error) => Err(DispatchError::Transport(error.to_string())),
		}
	}
}

struct BrokerQueues {
	primary: PrimaryQueue,
	retry: RetryQueue,
	persisted: std::collections::HashSet<Uuid>,
}

pub struct VoteBroker<D> {
	queues: Mutex<BrokerQueues>,
	/// One line per undelivered vote: `vote_id|candidate_id|priority`.
	persistence: LineStore,
	circuit: CircuitBreaker,
	dispatch: D,
	settings: QueueSettings,
	/// Wakes the dispatcher when new work arrives.
	notify: Notify,
}

impl<D: CentralDispatch> VoteBroker<D> {
	/// Opens the persistence store and reloads every undelivered vote into
	/// the primary queue with its recorded priority, so no ballot is lost
	/// across restarts.
	pub fn new(
		data_dir: &Path,
		settings: QueueSettings,
		circuit_config: CircuitBreakerConfig,
		dispatch: D,
	) -> anyhow::Result<Self> {
		let persistence = LineStore::open(data_dir, "pending")?;

		let mut queues = BrokerQueues {
			primary: PrimaryQueue::new(settings.max_size),
			retry: RetryQueue::new(),
			persisted: std::collections::HashSet::new(),
		};
		let mut recovered = 0;
		for line in persistence.read_all()? {
			let Some((vote_id, candidate_id, priority)) = line.split('|').collect_tuple()
			else {
				tracing::warn!(%line, "skipping malformed persistence record");
				continue;
			};
			let (Ok(vote_id), Ok(priority)) =
				(Uuid::parse_str(vote_id), Priority::from_str(priority))
			else {
				tracing::warn!(%line, "skipping malformed persistence record");
				continue;
			};
			if !queues.persisted.insert(vote_id) {
				continue;
			}
			queues
				.primary
				.enqueue(PendingVote {
					vote_id,
					candidate_id: candidate_id.to_string(),
					priority,
					attempt_count: 0,
					enqueued_at: chrono::Local::now().naive_local(),
				})
				.map_err(|error| anyhow::anyhow!("recovery overflowed the queue: {error}"))?;
			recovered += 1;
		}
		if recovered > 0 {
			tracing::info!(recovered, "reloaded undelivered votes from persistence");
		}

		Ok(Self {
			queues: Mutex::new(queues),
			persistence,
			circuit: CircuitBreaker::new("central", circuit_config),
			dispatch,
			settings,
			notify: Notify::new(),
		})
	}

	/// Stages a vote for delivery. A vote id already queued is re-inserted
	/// with the new priority.
	pub fn enqueue(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		priority: Priority,
	) -> Result<(), VoteflowError> {
		if candidate_id.is_empty() || !is_clean_field(&candidate_id) {
			return Err(VoteflowError::Storage(
				"candidate id must be non-empty and delimiter-free".to_string(),
			));
		}
		{
			let mut queues = self.queues.lock().expect("queue lock poisoned");
			queues.primary.enqueue(PendingVote {
				vote_id,
				candidate_id: candidate_id.clone(),
				priority,
				attempt_count: 0,
				enqueued_at: chrono::Local::now().naive_local(),
			})?;

			if queues.persisted.insert(vote_id) {
				let line = format!("{vote_id}|{candidate_id}|{priority}");
				if let Err(error) = self.persistence.append(&vote_id.to_string(), &line) {
					// Without the persistence record the vote would not
					// survive a restart; refuse the enqueue.
					queues.persisted.remove(&vote_id);
					queues.primary.remove(vote_id);
					return Err(VoteflowError::storage(error));
				}
			}
		}
		self.notify.notify_one();
		Ok(())
	}

	/// Schedules a failed delivery for retry with exponential backoff.
	pub fn enqueue_retry(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		priority: Priority,
		previous_attempts: u32,
	) {
		let attempt = previous_attempts + 1;
		let delay = backoff(
			attempt,
			Duration::from_secs(self.settings.retry_base_seconds),
			Duration::from_secs(self.settings.retry_max_seconds),
		);
		tracing::debug!(%vote_id, attempt, ?delay, "scheduling delivery retry");
		self.queues.lock().expect("queue lock poisoned").retry.push(
			PendingVote {
				vote_id,
				candidate_id,
				priority,
				attempt_count: attempt,
				enqueued_at: chrono::Local::now().naive_local(),
			},
			Instant::now() + delay,
		);
	}

	/// Pops the next deliverable vote, respecting priority then age.
	pub fn dequeue(&self) -> Option<PendingVote> {
		self.queues.lock().expect("queue lock poisoned").primary.dequeue()
	}

	pub fn queue_depth(&self) -> usize {
		let queues = self.queues.lock().expect("queue lock poisoned");
		queues.primary.len() + queues.retry.len()
	}

	pub fn circuit_status(&self) -> vf_primitives::CircuitStatus {
		self.circuit.status()
	}

	fn remove_persistence(&self, vote_id: Uuid) {
		let prefix = format!("{vote_id}|");
		if let Err(error) = self.persistence.rewrite("DELIVERED", &vote_id.to_string(), |line| {
			(!line.starts_with(&prefix)).then(|| line.to_owned())
		}) {
			tracing::error!(%vote_id, %error, "could not drop delivered vote from persistence");
			return;
		}
		self.queues.lock().expect("queue lock poisoned").persisted.remove(&vote_id);
	}

	/// One dispatcher step: take the next vote and forward it to the
	/// center under a per-item deadline. Fails fast with `CircuitOpen`
	/// without contacting the center while the circuit rejects calls.
	pub async fn try_dispatch_next(&self) -> Result<Option<Uuid>, VoteflowError> {
		if !self.circuit.check() {
			return Err(VoteflowError::CircuitOpen(self.circuit.name().to_string()));
		}
		let Some(vote) = self.dequeue() else {
			return Ok(None);
		};

		let forward = self.dispatch.forward(vote.vote_id, vote.candidate_id.clone());
		let outcome = match tokio::time::timeout(BROKER_DISPATCH_TIMEOUT, forward).await {
			Ok(outcome) => outcome,
			Err(_elapsed) => Err(DispatchError::Transport("delivery timed out".to_string())),
		};

		match outcome {
			Ok(()) | Err(DispatchError::AlreadyConsolidated) => {
				self.circuit.record_success();
				// Only now is the vote safe to forget.
				self.remove_persistence(vote.vote_id);
				tracing::info!(vote_id = %vote.vote_id, "vote delivered to the center");
			},
			Err(DispatchError::Transport(message)) => {
				self.circuit.record_failure();
				tracing::warn!(vote_id = %vote.vote_id, %message, "delivery failed");
				self.enqueue_retry(
					vote.vote_id,
					vote.candidate_id,
					vote.priority,
					vote.attempt_count,
				);
			},
		}
		Ok(Some(vote.vote_id))
	}

	/// The delivery pull loop. Runs until shutdown.
	pub async fn run_dispatcher(self: Arc<Self>, mut shutdown: ShutdownSignal) {
		loop {
			if shutdown.is_shutdown() {
				return;
			}
			match self.try_dispatch_next().await {
				Ok(Some(_)) => {},
				Ok(None) => {
					tokio::select! {
						() = shutdown.wait() => return,
						() = self.notify.notified() => {},
						() = tokio::time::sleep(BROKER_DISPATCH_IDLE) => {},
					}
				},
				Err(_circuit_open) => {
					tokio::select! {
						() = shutdown.wait() => return,
						() = tokio::time::sleep(BROKER_DISPATCH_IDLE) => {},
					}
				},
			}
		}
	}

	/// Moves retry items whose backoff has elapsed back into the primary
	/// queue, escalated to HIGH (CRITICAL items keep their urgency).
	pub async fn run_retry_mover(self: Arc<Self>, mut shutdown: ShutdownSignal) {
		loop {
			let sleep_for = {
				let queues = self.queues.lock().expect("queue lock poisoned");
				queues
					.retry
					.next_ready_at()
					.map(|ready_at| ready_at.saturating_duration_since(Instant::now()))
					.unwrap_or(BROKER_DISPATCH_IDLE)
			};
			tokio::select! {
				() = shutdown.wait() => return,
				() = tokio::time::sleep(sleep_for) => self.move_ready_retries(),
			}
		}
	}

	fn move_ready_retries(&self) {
		let mut moved = 0;
		{
			let mut queues = self.queues.lock().expect("queue lock poisoned");
			let now = Instant::now();
			while let Some(mut vote) = queues.retry.pop_ready(now) {
				vote.priority = vote.priority.min(Priority::High);
				if let Err(error) = queues.primary.enqueue(vote.clone()) {
					// Queue full: push the item back and try again later.
					tracing::warn!(vote_id = %vote.vote_id, %error, "primary queue full, delaying retry");
					queues.retry.push(vote, now + BROKER_DISPATCH_IDLE);
					break;
				}
				moved += 1;
			}
		}
		if moved > 0 {
			tracing::debug!(moved, "moved retry items into the primary queue");
			self.notify.notify_one();
		}
	}
}

pub struct BrokerRpcServerImpl<D> {
	broker: Arc<VoteBroker<D>>,
}

impl<D> BrokerRpcServerImpl<D> {
	pub fn new(broker: Arc<VoteBroker<D>>) -> Self {
		Self { broker }
	}
}

#[async_trait]
impl<D: CentralDispatch> BrokerRpcApiServer for BrokerRpcServerImpl<D> {
	async fn enqueue_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		priority: Priority,
	) -> RpcResult<()> {
		Ok(self.broker.enqueue(vote_id, candidate_id, priority)?)
	}

	async fn next_pending_vote(&self) -> RpcResult<Option<PendingVote>> {
		Ok(self.broker.dequeue())
	}

	async fn queue_depth(&self) -> RpcResult<usize> {
		Ok(self.broker.queue_depth())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{
		atomic::{AtomicU32, Ordering},
		Mutex as StdMutex,
	};
	use vf_primitives::CircuitState;

	#[derive(Default)]
	struct ScriptedDispatch {
		outcomes: StdMutex<Vec<Result<(), String>>>,
		calls: AtomicU32,
	}

	impl ScriptedDispatch {
		fn script(&self, outcomes: Vec<Result<(), &str>>) {
			*self.outcomes.lock().unwrap() =
				outcomes.into_iter().rev().map(|o| o.map_err(str::to_owned)).collect();
		}

		fn calls(&self) -> u32 {
			self.calls.load(Ordering::Relaxed)
		}
	}

	#[async_trait]
	impl CentralDispatch for Arc<ScriptedDispatch> {
		async fn forward(
			&self,
			_vote_id: Uuid,
			_candidate_id: String,
		) -> Result<(), DispatchError> {
			self.calls.fetch_add(1, Ordering::Relaxed);
			match self.outcomes.lock().unwrap().pop() {
				Some(Ok(())) | None => Ok(()),
				Some(Err(message)) => Err(DispatchError::Transport(message)),
			}
		}
	}

	fn queue_settings() -> QueueSettings {
		QueueSettings { max_size: 10_000, retry_base_seconds: 30, retry_max_seconds: 300 }
	}

	fn broker_in(
		dir: &std::path::Path,
		circuit: CircuitBreakerConfig,
	) -> (Arc<VoteBroker<Arc<ScriptedDispatch>>>, Arc<ScriptedDispatch>) {
		let dispatch = Arc::new(ScriptedDispatch::default());
		let broker = Arc::new(
			VoteBroker::new(dir, queue_settings(), circuit, dispatch.clone()).unwrap(),
		);
		(broker, dispatch)
	}

	#[test]
	fn backoff_follows_the_published_schedule() {
		let base = Duration::from_secs(30);
		let max = Duration::from_secs(300);
		let delays: Vec<u64> =
			(1..=7).map(|attempt| backoff(attempt, base, max).as_secs()).collect();
		assert_eq!(delays, vec![30, 60, 120, 240, 300, 300, 300]);
	}

	#[tokio::test]
	async fn votes_survive_a_restart_in_priority_order() {
		let dir = tempfile::tempdir().unwrap();
		let high = Uuid::new_v4();
		let normal = Uuid::new_v4();
		let critical = Uuid::new_v4();
		{
			let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());
			broker.enqueue(high, "C001".to_string(), Priority::High).unwrap();
			broker.enqueue(normal, "C002".to_string(), Priority::Normal).unwrap();
			broker.enqueue(critical, "C003".to_string(), Priority::Critical).unwrap();
			// Killed before any dequeue.
		}

		let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());
		assert_eq!(broker.dequeue().unwrap().vote_id, critical);
		assert_eq!(broker.dequeue().unwrap().vote_id, high);
		assert_eq!(broker.dequeue().unwrap().vote_id, normal);
		assert!(broker.dequeue().is_none());
	}

	#[tokio::test]
	async fn recovered_votes_carry_their_real_candidate_id() {
		let dir = tempfile::tempdir().unwrap();
		let vote_id = Uuid::new_v4();
		{
			let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());
			broker.enqueue(vote_id, "C042".to_string(), Priority::Normal).unwrap();
		}
		let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());
		assert_eq!(broker.dequeue().unwrap().candidate_id, "C042");
	}

	#[tokio::test]
	async fn enqueue_rejects_candidate_ids_with_delimiters() {
		let dir = tempfile::tempdir().unwrap();
		let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());

		assert!(broker
			.enqueue(Uuid::new_v4(), "C0|01".to_string(), Priority::Normal)
			.is_err());
		assert_eq!(broker.queue_depth(), 0);
	}

	#[tokio::test]
	async fn delivered_votes_leave_the_persistence_store() {
		let dir = tempfile::tempdir().unwrap();
		let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());

		let vote_id = Uuid::new_v4();
		broker.enqueue(vote_id, "C001".to_string(), Priority::Normal).unwrap();
		broker.try_dispatch_next().await.unwrap();

		let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());
		assert!(broker.dequeue().is_none());
	}

	#[tokio::test]
	async fn failed_deliveries_keep_their_persistence_record() {
		let dir = tempfile::tempdir().unwrap();
		let (broker, dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());
		dispatch.script(vec![Err("unreachable")]);

		let vote_id = Uuid::new_v4();
		broker.enqueue(vote_id, "C001".to_string(), Priority::Normal).unwrap();
		broker.try_dispatch_next().await.unwrap();

		// The vote sits in the retry queue and is still persisted.
		assert_eq!(broker.queue_depth(), 1);
		let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());
		assert_eq!(broker.dequeue().unwrap().vote_id, vote_id);
	}

	#[tokio::test]
	async fn circuit_opens_after_threshold_failures_and_recovers() {
		let dir = tempfile::tempdir().unwrap();
		let circuit = CircuitBreakerConfig {
			failure_threshold: 3,
			timeout: Duration::from_millis(50),
			success_threshold: 3,
		};
		let (broker, dispatch) = broker_in(dir.path(), circuit);
		dispatch.script(vec![Err("down"), Err("down"), Err("down")]);

		for index in 0..3 {
			broker
				.enqueue(Uuid::new_v4(), format!("C{index}"), Priority::Normal)
				.unwrap();
			broker.try_dispatch_next().await.unwrap();
		}
		assert_eq!(dispatch.calls(), 3);

		// Call 4 fails fast without contacting the center.
		assert!(matches!(
			broker.try_dispatch_next().await,
			Err(VoteflowError::CircuitOpen(_))
		));
		assert_eq!(dispatch.calls(), 3);

		// After the timeout a probe and two more successes close it again.
		tokio::time::sleep(Duration::from_millis(60)).await;
		for index in 0..3 {
			broker
				.enqueue(Uuid::new_v4(), format!("D{index}"), Priority::Normal)
				.unwrap();
			broker.try_dispatch_next().await.unwrap();
		}
		assert_eq!(broker.circuit_status().state, CircuitState::Closed);
	}

	#[tokio::test]
	async fn ready_retries_move_back_escalated_to_high() {
		let dir = tempfile::tempdir().unwrap();
		let (broker, _dispatch) = broker_in(dir.path(), CircuitBreakerConfig::default());

		let low = Uuid::new_v4();
		let critical = Uuid::new_v4();
		{
			let mut queues = broker.queues.lock().unwrap();
			let now = Instant::now();
			queues.retry.push(
				PendingVote {
					vote_id: low,
					candidate_id: "C001".to_string(),
					priority: Priority::Low,
					attempt_count: 1,
					enqueued_at: chrono::Local::now().naive_local(),
				},
				now,
			);
			queues.retry.push(
				PendingVote {
					vote_id: critical,
					candidate_id: "C002".to_string(),
					priority: Priority::Critical,
					attempt_count: 2,
					enqueued_at: chrono::Local::now().naive_local(),
				},
				now,
			);
		}

		broker.move_ready_retries();

		let first = broker.dequeue().unwrap();
		let second = broker.dequeue().unwrap();
		// CRITICAL keeps its urgency; LOW is escalated to HIGH.
		assert_eq!(first.vote_id, critical);
		assert_eq!(first.priority, Priority::Critical);
		assert_eq!(second.vote_id, low);
		assert_eq!(second.priority, Priority::High);
		assert_eq!(second.attempt_count, 1);
	}
}
