//! Domain types shared by every voteflow service.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timestamp format used in store lines and audit journals.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub fn format_timestamp(ts: NaiveDateTime) -> String {
	ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
	NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
}

/// The domain envelope for a single ballot.
///
/// The voter's identity is deliberately not part of this type: it travels
/// out-of-band on dispatch and is never written to any persisted vote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
	pub vote_id: Uuid,
	pub candidate_id: String,
	pub station_origin: String,
	pub timestamp: NaiveDateTime,
}

impl Vote {
	pub fn new(candidate_id: String, station_origin: String) -> Self {
		Self {
			vote_id: Uuid::new_v4(),
			candidate_id,
			station_origin,
			timestamp: chrono::Local::now().naive_local(),
		}
	}
}

/// Lifecycle of a vote as seen by the pipeline.
///
/// Transitions are monotonic: `Pending -> Received -> Processed`, with a
/// terminal `Error` branch reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteState {
	Pending,
	Received,
	Processed,
	Error,
}

impl VoteState {
	fn rank(self) -> u8 {
		match self {
			VoteState::Pending => 0,
			VoteState::Received => 1,
			VoteState::Processed => 2,
			VoteState::Error => 3,
		}
	}

	/// Whether moving to `next` respects the state machine. Self-transitions
	/// are allowed so redelivered acks are harmless.
	pub fn can_transition_to(self, next: VoteState) -> bool {
		match (self, next) {
			(VoteState::Error, _) => false,
			(VoteState::Processed, VoteState::Error) => false,
			(_, VoteState::Error) => true,
			(from, to) => from.rank() <= to.rank(),
		}
	}
}

impl std::fmt::Display for VoteState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			VoteState::Pending => "PENDING",
			VoteState::Received => "RECEIVED",
			VoteState::Processed => "PROCESSED",
			VoteState::Error => "ERROR",
		};
		f.write_str(s)
	}
}

impl std::str::FromStr for VoteState {
	type Err = ParsePrimitiveError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(VoteState::Pending),
			"RECEIVED" => Ok(VoteState::Received),
			"PROCESSED" => Ok(VoteState::Processed),
			"ERROR" => Ok(VoteState::Error),
			other => Err(ParsePrimitiveError::VoteState(other.to_string())),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ParsePrimitiveError {
	#[error("unknown vote state `{0}`")]
	VoteState(String),
	#[error("unknown station vote status `{0}`")]
	StationVoteStatus(String),
	#[error("unknown priority `{0}`")]
	Priority(String),
}

/// A vote's status in the station's transient store. CONFIRMED means the
/// center acknowledged PROCESSED and the record left the dispatch backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationVoteStatus {
	Pending,
	Confirmed,
	Error,
}

impl std::fmt::Display for StationVoteStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			StationVoteStatus::Pending => "PENDING",
			StationVoteStatus::Confirmed => "CONFIRMED",
			StationVoteStatus::Error => "ERROR",
		};
		f.write_str(s)
	}
}

impl std::str::FromStr for StationVoteStatus {
	type Err = ParsePrimitiveError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"PENDING" => Ok(StationVoteStatus::Pending),
			"CONFIRMED" => Ok(StationVoteStatus::Confirmed),
			"ERROR" => Ok(StationVoteStatus::Error),
			other => Err(ParsePrimitiveError::StationVoteStatus(other.to_string())),
		}
	}
}

/// Broker queue priority. Lower discriminant dequeues first.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
	Critical = 0,
	High = 1,
	Normal = 2,
	Low = 3,
}

impl std::fmt::Display for Priority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Priority::Critical => "CRITICAL",
			Priority::High => "HIGH",
			Priority::Normal => "NORMAL",
			Priority::Low => "LOW",
		};
		f.write_str(s)
	}
}

impl std::str::FromStr for Priority {
	type Err = ParsePrimitiveError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"CRITICAL" => Ok(Priority::Critical),
			"HIGH" => Ok(Priority::High),
			"NORMAL" => Ok(Priority::Normal),
			"LOW" => Ok(Priority::Low),
			other => Err(ParsePrimitiveError::Priority(other.to_string())),
		}
	}
}

/// A vote staged in the broker: payload plus scheduling metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVote {
	pub vote_id: Uuid,
	pub candidate_id: String,
	pub priority: Priority,
	pub attempt_count: u32,
	pub enqueued_at: NaiveDateTime,
}

/// The only shape a vote takes in the consolidated store. Carries no station
/// origin and no voter identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymizedVote {
	pub vote_id: Uuid,
	pub candidate_id: String,
	pub timestamp: NaiveDateTime,
	pub hash: String,
}

/// Outcome of handing a vote to the receiving center.
///
/// Duplicate detection is an ordinary outcome of the protocol, not a
/// transport failure, so it is modelled as a variant rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveOutcome {
	/// The vote was stored and queued for processing.
	Accepted,
	/// This vote id has already completed processing. Safe to confirm.
	AlreadyProcessed,
	/// The voter behind this submission has already voted. Terminal.
	RejectedVoter,
}

/// Storage targets behind the database proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbTarget {
	Primary,
	Replica,
}

impl DbTarget {
	/// The failover alternative for this target.
	pub fn alternative(self) -> DbTarget {
		match self {
			DbTarget::Primary => DbTarget::Replica,
			DbTarget::Replica => DbTarget::Primary,
		}
	}
}

impl std::fmt::Display for DbTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			DbTarget::Primary => f.write_str("primary"),
			DbTarget::Replica => f.write_str("replica"),
		}
	}
}

/// Three-state guard around a failure-prone dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

impl std::fmt::Display for CircuitState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			CircuitState::Closed => "CLOSED",
			CircuitState::Open => "OPEN",
			CircuitState::HalfOpen => "HALF_OPEN",
		};
		f.write_str(s)
	}
}

/// Point-in-time view of one circuit, as reported over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStatus {
	pub state: CircuitState,
	pub consecutive_failures: u32,
	pub consecutive_successes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
	Insert,
	Update,
	Select,
}

impl QueryType {
	pub fn is_write(self) -> bool {
		matches!(self, QueryType::Insert | QueryType::Update)
	}
}

/// A routable storage operation: operation name, pipe-delimited parameters,
/// kind, and a deadline in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
	pub query: String,
	pub params: String,
	pub query_type: QueryType,
	pub timeout_millis: u64,
}

impl QueryParams {
	pub fn new(
		query: impl Into<String>,
		params: impl Into<String>,
		query_type: QueryType,
		timeout_millis: u64,
	) -> Self {
		Self { query: query.into(), params: params.into(), query_type, timeout_millis }
	}

	pub fn timeout(&self) -> std::time::Duration {
		std::time::Duration::from_millis(self.timeout_millis)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
	pub successful: bool,
	pub rows: Vec<String>,
	pub error: Option<String>,
}

impl QueryResult {
	pub fn ok(rows: Vec<String>) -> Self {
		Self { successful: true, rows, error: None }
	}

	pub fn failed(error: impl Into<String>) -> Self {
		Self { successful: false, rows: Vec::new(), error: Some(error.into()) }
	}
}

/// Catalog entry for a choice on the ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
	pub candidate_id: String,
	pub name: String,
	pub party: String,
}

/// Per-candidate consolidated tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTally {
	pub candidate_id: String,
	pub votes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
	Pending,
	Confirmed,
	Failed,
}

/// Emitted by the primary adapter for every write, then offered to the
/// replica for confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
	pub transaction_id: Uuid,
	pub data: String,
	pub timestamp: NaiveDateTime,
	pub state: TransactionState,
}

impl TransactionInfo {
	pub fn pending(data: impl Into<String>) -> Self {
		Self {
			transaction_id: Uuid::new_v4(),
			data: data.into(),
			timestamp: chrono::Local::now().naive_local(),
			state: TransactionState::Pending,
		}
	}
}
