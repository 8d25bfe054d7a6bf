//! End-to-end pipeline tests: station through receiver and central server
//! down to the proxied stores, wired in-process.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use jsonrpsee::server::ServerBuilder;
use uuid::Uuid;
use vf_primitives::{
	DbTarget, QueryParams, QueryType, ReceiveOutcome, StationVoteStatus, Vote, VoteState,
};
use vf_rpc_apis::{receiver::ReceiverRpcApiServer, VoteflowError};
use vf_utilities::CircuitBreakerConfig;
use voteflow_engine::{
	central::{CentralServer, VoteDatabase},
	dbproxy::DbProxy,
	receiver::{CenterReceiver, ConsolidationClient, ForwardError, ReceiverRpcServerImpl},
	station::{CenterClient, RemoteCenter, StationAgent},
};

/// Central's database handle, bound directly to an in-process proxy.
struct LocalDb(Arc<DbProxy>);

#[async_trait]
impl VoteDatabase for LocalDb {
	async fn save_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		timestamp: NaiveDateTime,
		hash: String,
	) -> Result<(), String> {
		self.0
			.save_vote(vote_id, candidate_id, timestamp, hash)
			.await
			.map_err(|error| error.to_string())
	}
}

/// Receiver's consolidation handle, bound directly to an in-process
/// central server.
struct LocalCentral(Arc<CentralServer<LocalDb>>);

#[async_trait]
impl ConsolidationClient for LocalCentral {
	async fn forward(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		station_id: String,
	) -> Result<(), ForwardError> {
		let hash = voteflow_engine::central::payload_hash(vote_id, &candidate_id);
		match self.0.clone().receive_vote_from_station(vote_id, candidate_id, station_id, hash)
		{
			Ok(()) => Ok(()),
			Err(VoteflowError::DuplicateVote { .. }) => Err(ForwardError::AlreadyConsolidated),
			Err(error) => Err(ForwardError::Transport(error.to_string())),
		}
	}
}

/// Station's center handle, bound directly to an in-process receiver.
struct LocalReceiver(Arc<CenterReceiver<LocalCentral>>);

#[async_trait]
impl CenterClient for LocalReceiver {
	async fn receive_vote(
		&self,
		vote: Vote,
		voter_id: Option<String>,
	) -> Result<ReceiveOutcome, jsonrpsee::core::ClientError> {
		self.0
			.clone()
			.receive_vote(vote, voter_id)
			.map_err(|error| jsonrpsee::core::ClientError::Custom(error.to_string()))
	}

	async fn vote_status(
		&self,
		vote_id: Uuid,
	) -> Result<Option<VoteState>, jsonrpsee::core::ClientError> {
		Ok(self.0.vote_status(vote_id))
	}
}

struct Pipeline {
	proxy: Arc<DbProxy>,
	central: Arc<CentralServer<LocalDb>>,
	receiver: Arc<CenterReceiver<LocalCentral>>,
	station: Arc<StationAgent<LocalReceiver>>,
}

/// Builds the whole pipeline in dependency order: proxy, central server,
/// receiver, station.
fn pipeline(dir: &Path) -> Pipeline {
	let proxy = Arc::new(
		DbProxy::new(
			&dir.join("dbproxy"),
			CircuitBreakerConfig::default(),
			1_000,
			Duration::from_secs(60),
			Duration::from_secs(30),
		)
		.unwrap(),
	);
	let central =
		Arc::new(CentralServer::new(&dir.join("central"), LocalDb(proxy.clone())).unwrap());
	let receiver = Arc::new(
		CenterReceiver::new(&dir.join("receiver"), LocalCentral(central.clone())).unwrap(),
	);
	let station = Arc::new(
		StationAgent::new(
			"Station01".to_string(),
			&dir.join("station"),
			LocalReceiver(receiver.clone()),
		)
		.unwrap(),
	);
	Pipeline { proxy, central, receiver, station }
}

async fn submit_and_dispatch(pipeline: &Pipeline, candidate_id: &str, voter_id: &str) -> Uuid {
	let vote_id = pipeline.station.submit(candidate_id, voter_id).unwrap();
	pipeline.station.sweep_once().await.unwrap();
	vote_id
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
	for _ in 0..100 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn happy_path_lands_exactly_one_anonymized_vote() {
	let dir = tempfile::tempdir().unwrap();
	let pipeline = pipeline(dir.path());

	let vote_id = submit_and_dispatch(&pipeline, "C001", "V1").await;

	wait_for("the vote to confirm", || {
		pipeline.station.local_status(vote_id).unwrap() == Some(StationVoteStatus::Confirmed)
	})
	.await;
	wait_for("the central server to finish processing", || {
		pipeline.central.vote_state(vote_id) == Some(VoteState::Processed)
	})
	.await;

	assert_eq!(pipeline.receiver.tally("C001"), 1);
	assert_eq!(
		pipeline.proxy.verify_vote_state(vote_id).await.unwrap(),
		Some(VoteState::Processed)
	);

	// Exactly one line in the anonymized store, and it carries neither the
	// station nor the voter identity.
	let rows = pipeline
		.proxy
		.route_query(QueryParams::new("COUNT_VOTES", "", QueryType::Select, 5_000))
		.await
		.unwrap()
		.rows;
	assert_eq!(rows, vec!["1".to_string()]);
	let votes_file = dir.path().join("dbproxy").join("primary").join("votes.dat");
	let contents = std::fs::read_to_string(votes_file).unwrap();
	assert!(contents.contains(&vote_id.to_string()));
	assert!(!contents.contains("Station01"));
	assert!(!contents.contains("V1"));
}

#[tokio::test]
async fn replaying_a_vote_does_not_double_count() {
	let dir = tempfile::tempdir().unwrap();
	let pipeline = pipeline(dir.path());

	let vote_id = submit_and_dispatch(&pipeline, "C001", "V1").await;
	wait_for("the vote to confirm", || {
		pipeline.station.local_status(vote_id).unwrap() == Some(StationVoteStatus::Confirmed)
	})
	.await;

	// Replay the same vote envelope, as a crashed station would on resume.
	let record = pipeline
		.receiver
		.clone()
		.receive_vote(
			Vote {
				vote_id,
				candidate_id: "C001".to_string(),
				station_origin: "Station01".to_string(),
				timestamp: chrono::Local::now().naive_local(),
			},
			Some("V1".to_string()),
		)
		.unwrap();
	assert_eq!(record, ReceiveOutcome::AlreadyProcessed);

	assert_eq!(pipeline.receiver.tally("C001"), 1);
	let rows = pipeline
		.proxy
		.route_query(QueryParams::new("COUNT_VOTES", "", QueryType::Select, 5_000))
		.await
		.unwrap()
		.rows;
	assert_eq!(rows, vec!["1".to_string()]);
}

#[tokio::test]
async fn a_voter_cannot_vote_twice() {
	let dir = tempfile::tempdir().unwrap();
	let pipeline = pipeline(dir.path());

	let first = submit_and_dispatch(&pipeline, "C001", "V1").await;
	wait_for("the first vote to confirm", || {
		pipeline.station.local_status(first).unwrap() == Some(StationVoteStatus::Confirmed)
	})
	.await;

	// Same voter, different ballot: terminal rejection at the station.
	let second = submit_and_dispatch(&pipeline, "C002", "V1").await;
	wait_for("the second vote to be rejected", || {
		pipeline.station.local_status(second).unwrap() == Some(StationVoteStatus::Error)
	})
	.await;

	assert_eq!(pipeline.receiver.tally("C002"), 0);
	assert_eq!(pipeline.receiver.tally("C001"), 1);
}

#[tokio::test]
async fn votes_flow_over_the_rpc_surface_too() {
	let dir = tempfile::tempdir().unwrap();
	let pipeline = pipeline(dir.path());

	// Serve the receiver over real jsonrpsee and point a station at it.
	let server = ServerBuilder::default().build("127.0.0.1:0").await.unwrap();
	let address = server.local_addr().unwrap();
	let _server_handle =
		server.start(ReceiverRpcServerImpl::new(pipeline.receiver.clone()).into_rpc());

	let client = jsonrpsee::http_client::HttpClientBuilder::default()
		.build(format!("http://{address}"))
		.unwrap();
	let remote_station = Arc::new(
		StationAgent::new(
			"Station02".to_string(),
			&dir.path().join("station-rpc"),
			RemoteCenter::new(client),
		)
		.unwrap(),
	);

	let vote_id = remote_station.submit("C003", "V7").unwrap();
	remote_station.sweep_once().await.unwrap();

	wait_for("the remote vote to confirm", || {
		remote_station.local_status(vote_id).unwrap() == Some(StationVoteStatus::Confirmed)
	})
	.await;
	wait_for("the central server to finish processing", || {
		pipeline.central.vote_state(vote_id) == Some(VoteState::Processed)
	})
	.await;
	assert_eq!(pipeline.receiver.tally("C003"), 1);
	assert_eq!(
		pipeline.proxy.verify_vote_state(vote_id).await.unwrap(),
		Some(VoteState::Processed)
	);
}

#[tokio::test]
async fn central_journals_votes_while_the_database_is_down() {
	let dir = tempfile::tempdir().unwrap();
	let pipeline = pipeline(dir.path());

	// Take the whole storage layer down.
	pipeline.proxy.set_node_available(DbTarget::Primary, false);
	pipeline.proxy.set_node_available(DbTarget::Replica, false);

	let vote_id = submit_and_dispatch(&pipeline, "C001", "V1").await;
	wait_for("the vote to confirm via the journal", || {
		pipeline.station.local_status(vote_id).unwrap() == Some(StationVoteStatus::Confirmed)
	})
	.await;
	wait_for("the central server to finish processing", || {
		pipeline.central.vote_state(vote_id) == Some(VoteState::Processed)
	})
	.await;
	let journal = dir.path().join("central").join("anonymized-journal.dat");
	assert!(std::fs::read_to_string(journal).unwrap().contains(&vote_id.to_string()));

	pipeline.proxy.set_node_available(DbTarget::Primary, true);
	pipeline.proxy.set_node_available(DbTarget::Replica, true);
	assert_eq!(pipeline.proxy.verify_vote_state(vote_id).await.unwrap(), None);
}
