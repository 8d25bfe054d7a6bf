//! Primary/replica storage adapters.
//!
//! The platform's data lives in the line-store layer; each node owns a
//! votes store (the anonymized store), a candidate catalog and a metadata
//! store, and executes a small dialect of named queries against them.
//! Writes on the primary are replicated to the replica best-effort: a
//! replication failure is audited and the write still succeeds locally.

use std::{
	path::Path,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use itertools::Itertools;
use vf_primitives::{DbTarget, QueryParams, QueryResult, TransactionInfo};
use vf_rpc_apis::VoteflowError;
use vf_utilities::{is_clean_field, AuditLog, LineStore};

pub const INSERT_VOTE: &str = "INSERT_VOTE";
pub const VERIFY_VOTE_STATE: &str = "VERIFY_VOTE_STATE";
pub const INSERT_CANDIDATES: &str = "INSERT_CANDIDATES";
pub const SELECT_CANDIDATES: &str = "SELECT_CANDIDATES";
pub const COUNT_VOTES: &str = "COUNT_VOTES";
pub const COUNT_VOTES_BY_CANDIDATE: &str = "COUNT_VOTES_BY_CANDIDATE";
pub const SET_META: &str = "SET_META";
pub const GET_META: &str = "GET_META";

#[async_trait]
pub trait StorageAdapter: Send + Sync + 'static {
	fn target(&self) -> DbTarget;
	async fn execute(&self, params: &QueryParams) -> Result<QueryResult, VoteflowError>;
}

/// One node's stores plus the query dialect over them.
pub struct NodeStore {
	target: DbTarget,
	votes: LineStore,
	candidates: LineStore,
	meta: LineStore,
	/// Simulates node loss in tests and maintenance windows in deployment.
	available: AtomicBool,
}

impl NodeStore {
	pub fn open(data_dir: &Path, target: DbTarget) -> anyhow::Result<Self> {
		let dir = data_dir.join(target.to_string());
		Ok(Self {
			target,
			votes: LineStore::open(&dir, "votes")?,
			candidates: LineStore::open(&dir, "candidates")?,
			meta: LineStore::open(&dir, "meta")?,
			available: AtomicBool::new(true),
		})
	}

	pub fn set_available(&self, available: bool) {
		self.available.store(available, Ordering::SeqCst);
	}

	pub fn execute(&self, params: &QueryParams) -> Result<QueryResult, VoteflowError> {
		if !self.available.load(Ordering::SeqCst) {
			return Err(VoteflowError::DbConnection {
				target: self.target.to_string(),
				message: "node is unavailable".to_string(),
			});
		}

		match params.query.as_str() {
			INSERT_VOTE => self.insert_vote(&params.params),
			VERIFY_VOTE_STATE => self.verify_vote_state(&params.params),
			INSERT_CANDIDATES => self.insert_candidates(&params.params),
			SELECT_CANDIDATES => Ok(QueryResult::ok(
				self.candidates.read_all().map_err(VoteflowError::storage)?,
			)),
			COUNT_VOTES => Ok(QueryResult::ok(vec![self
				.votes
				.read_all()
				.map_err(VoteflowError::storage)?
				.len()
				.to_string()])),
			COUNT_VOTES_BY_CANDIDATE => self.count_votes_by_candidate(),
			SET_META => self.set_meta(&params.params),
			GET_META => self.get_meta(&params.params),
			unknown => Ok(QueryResult::failed(format!("unknown query `{unknown}`"))),
		}
	}

	/// Line schema: `vote_id|candidate_id|timestamp|hash`. A vote id can
	/// land at most once; a re-insert of a present id is a no-op so journal
	/// drains and replication replays stay idempotent.
	fn insert_vote(&self, params: &str) -> Result<QueryResult, VoteflowError> {
		let Some((vote_id, candidate_id, timestamp, hash)) =
			params.split('|').collect_tuple()
		else {
			return Ok(QueryResult::failed("INSERT_VOTE expects 4 parameters"));
		};
		if ![vote_id, candidate_id, timestamp, hash].iter().all(|field| is_clean_field(field)) {
			return Ok(QueryResult::failed("vote fields must not contain line breaks"));
		}
		let prefix = format!("{vote_id}|");
		let exists = self
			.votes
			.read_all()
			.map_err(VoteflowError::storage)?
			.iter()
			.any(|line| line.starts_with(&prefix));
		if !exists {
			self.votes.append(vote_id, params).map_err(VoteflowError::storage)?;
		}
		Ok(QueryResult::ok(Vec::new()))
	}

	fn verify_vote_state(&self, params: &str) -> Result<QueryResult, VoteflowError> {
		let prefix = format!("{params}|");
		let exists = self
			.votes
			.read_all()
			.map_err(VoteflowError::storage)?
			.iter()
			.any(|line| line.starts_with(&prefix));
		Ok(QueryResult::ok(if exists {
			vec!["PROCESSED".to_string()]
		} else {
			Vec::new()
		}))
	}

	/// Params: `id,name,party` rows joined with `;`. Incoming ids replace
	/// existing catalog entries.
	fn insert_candidates(&self, params: &str) -> Result<QueryResult, VoteflowError> {
		let mut rows = Vec::new();
		for row in params.split(';').filter(|row| !row.is_empty()) {
			let Some((id, name, party)) = row.split(',').collect_tuple() else {
				return Ok(QueryResult::failed(format!("malformed candidate row `{row}`")));
			};
			if ![id, name, party].iter().all(|field| is_clean_field(field)) {
				return Ok(QueryResult::failed(format!("malformed candidate row `{row}`")));
			}
			rows.push((id.to_string(), format!("{id}|{name}|{party}")));
		}

		let incoming_ids: std::collections::HashSet<String> =
			rows.iter().map(|(id, _)| format!("{id}|")).collect();
		self.candidates
			.rewrite("UPSERT_CANDIDATES", "catalog", |line| {
				(!incoming_ids.iter().any(|prefix| line.starts_with(prefix)))
					.then(|| line.to_owned())
			})
			.map_err(VoteflowError::storage)?;
		for (id, line) in &rows {
			self.candidates.append(id, line).map_err(VoteflowError::storage)?;
		}
		Ok(QueryResult::ok(Vec::new()))
	}

	fn count_votes_by_candidate(&self) -> Result<QueryResult, VoteflowError> {
		let mut tallies: std::collections::BTreeMap<String, u64> =
			std::collections::BTreeMap::new();
		for line in self.votes.read_all().map_err(VoteflowError::storage)? {
			if let Some(candidate_id) = line.split('|').nth(1) {
				*tallies.entry(candidate_id.to_string()).or_default() += 1;
			}
		}
		Ok(QueryResult::ok(
			tallies
				.into_iter()
				.map(|(candidate_id, votes)| format!("{candidate_id}|{votes}"))
				.collect(),
		))
	}

	fn set_meta(&self, params: &str) -> Result<QueryResult, VoteflowError> {
		let Some((key, value)) = params.split('|').collect_tuple() else {
			return Ok(QueryResult::failed("SET_META expects 2 parameters"));
		};
		if !is_clean_field(key) || !is_clean_field(value) {
			return Ok(QueryResult::failed("meta fields must not contain line breaks"));
		}
		let prefix = format!("{key}|");
		self.meta
			.rewrite("SET_META", key, |line| {
				(!line.starts_with(&prefix)).then(|| line.to_owned())
			})
			.map_err(VoteflowError::storage)?;
		self.meta
			.append(key, &format!("{key}|{value}"))
			.map_err(VoteflowError::storage)?;
		Ok(QueryResult::ok(Vec::new()))
	}

	fn get_meta(&self, params: &str) -> Result<QueryResult, VoteflowError> {
		let prefix = format!("{params}|");
		Ok(QueryResult::ok(
			self.meta
				.read_all()
				.map_err(VoteflowError::storage)?
				.iter()
				.find(|line| line.starts_with(&prefix))
				.and_then(|line| line.splitn(2, '|').nth(1))
				.map(|value| vec![value.to_string()])
				.unwrap_or_default(),
		))
	}
}

pub struct ReplicaAdapter {
	store: NodeStore,
}

impl ReplicaAdapter {
	pub fn new(store: NodeStore) -> Self {
		Self { store }
	}

	pub fn set_available(&self, available: bool) {
		self.store.set_available(available);
	}

	/// Applies a replicated write from the primary.
	pub fn confirm_replication(
		&self,
		transaction: &TransactionInfo,
		params: &QueryParams,
	) -> Result<(), VoteflowError> {
		self.store
			.execute(params)
			.and_then(|result| {
				if result.successful {
					Ok(())
				} else {
					Err(VoteflowError::Storage(
						result.error.unwrap_or_else(|| "replication write failed".to_string()),
					))
				}
			})
			.map_err(|error| VoteflowError::Replication {
				transaction_id: transaction.transaction_id.to_string(),
				message: error.to_string(),
			})
	}
}

#[async_trait]
impl StorageAdapter for ReplicaAdapter {
	fn target(&self) -> DbTarget {
		DbTarget::Replica
	}

	async fn execute(&self, params: &QueryParams) -> Result<QueryResult, VoteflowError> {
		self.store.execute(params)
	}
}

pub struct PrimaryAdapter {
	store: NodeStore,
	replica: Arc<ReplicaAdapter>,
	audit: AuditLog,
}

impl PrimaryAdapter {
	pub fn new(
		store: NodeStore,
		replica: Arc<ReplicaAdapter>,
		audit: AuditLog,
	) -> Self {
		Self { store, replica, audit }
	}

	pub fn set_available(&self, available: bool) {
		self.store.set_available(available);
	}
}

#[async_trait]
impl StorageAdapter for PrimaryAdapter {
	fn target(&self) -> DbTarget {
		DbTarget::Primary
	}

	async fn execute(&self, params: &QueryParams) -> Result<QueryResult, VoteflowError> {
		let result = self.store.execute(params)?;

		if params.query_type.is_write() && result.successful {
			let transaction =
				TransactionInfo::pending(format!("{}:{}", params.query, params.params));
			match self.replica.confirm_replication(&transaction, params) {
				Ok(()) => {},
				Err(error) => {
					// The local write stands; the divergence is audited.
					tracing::warn!(
						transaction_id = %transaction.transaction_id,
						%error,
						"replication not confirmed"
					);
					self.audit.record(
						"REPLICATION_FAILED",
						&transaction.transaction_id.to_string(),
						&error.to_string(),
					);
				},
			}
		}

		Ok(result)
	}
}
