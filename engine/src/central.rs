//! Consolidation server: deduplicates votes arriving from the field,
//! anonymizes them, and persists them through the database proxy.

use std::{
	collections::{HashMap, HashSet},
	path::Path,
	sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use jsonrpsee::http_client::HttpClient;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use vf_primitives::{format_timestamp, VoteState};
use vf_rpc_apis::{central::CentralRpcApiServer, dbproxy::DbProxyRpcApiClient, RpcResult, VoteflowError};
use vf_utilities::{is_clean_field, AuditLog, LineStore};

/// Digest a station (or the receiver on its behalf) attaches to a
/// consolidated vote, used to suppress payload-identical re-sends.
pub fn payload_hash(vote_id: Uuid, candidate_id: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(vote_id.to_string().as_bytes());
	hasher.update(candidate_id.as_bytes());
	hex::encode(hasher.finalize())
}

/// The anonymization recipe: SHA-256 over vote id, candidate id and the
/// processing timestamp. Station and voter identifiers never feed into it.
pub fn anonymization_hash(
	vote_id: Uuid,
	candidate_id: &str,
	processing_timestamp: NaiveDateTime,
) -> String {
	let mut hasher = Sha256::new();
	hasher.update(vote_id.to_string().as_bytes());
	hasher.update(candidate_id.as_bytes());
	hasher.update(format_timestamp(processing_timestamp).as_bytes());
	hex::encode(hasher.finalize())
}

/// The central server's view of the persistence gateway.
#[async_trait]
pub trait VoteDatabase: Send + Sync + 'static {
	async fn save_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		timestamp: NaiveDateTime,
		hash: String,
	) -> Result<(), String>;
}

pub struct RemoteDatabase {
	client: HttpClient,
}

impl RemoteDatabase {
	pub fn new(client: HttpClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl VoteDatabase for RemoteDatabase {
	async fn save_vote(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		timestamp: NaiveDateTime,
		hash: String,
	) -> Result<(), String> {
		DbProxyRpcApiClient::save_vote(&self.client, vote_id, candidate_id, timestamp, hash)
			.await
			.map_err(|error| error.to_string())
	}
}

pub struct CentralServer<D> {
	/// Vote ids seen on this surface; guards against transport-level
	/// duplicates.
	received_cache: RwLock<HashSet<Uuid>>,
	/// Payload digests seen; guards against payload-identical re-sends.
	hash_cache: RwLock<HashSet<String>>,
	states: RwLock<HashMap<Uuid, VoteState>>,
	/// Vote ids registered anonymously, serialized behind one writer lock.
	registered: tokio::sync::Mutex<HashSet<Uuid>>,
	/// Fallback journal for anonymized votes the proxy could not take.
	journal: LineStore,
	/// Durable record of accepted votes, one `vote_id|payload_hash` line
	/// each, so both dedup caches survive a restart.
	hash_store: LineStore,
	audit: AuditLog,
	db: D,
}

impl<D: VoteDatabase> CentralServer<D> {
	pub fn new(data_dir: &Path, db: D) -> anyhow::Result<Self> {
		let journal = LineStore::open(data_dir, "anonymized-journal")?;
		let hash_store = LineStore::open(data_dir, "payload-hashes")?;
		let audit = AuditLog::open(data_dir, "central")?;

		// Journaled votes are registered votes: rehydrate so a restart does
		// not double-journal them.
		let mut registered = HashSet::new();
		for line in journal.read_all()? {
			if let Some(vote_id) =
				line.split('|').next().and_then(|field| Uuid::parse_str(field).ok())
			{
				registered.insert(vote_id);
			}
		}

		// Every accepted vote left a `vote_id|payload_hash` line; replayed
		// ids and payload-identical re-sends stay duplicates across a
		// restart.
		let mut received_cache = registered.clone();
		let mut hash_cache = HashSet::new();
		for line in hash_store.read_all()? {
			let Some((vote_id, hash)) = line.split_once('|') else {
				continue;
			};
			let Ok(vote_id) = Uuid::parse_str(vote_id) else {
				continue;
			};
			received_cache.insert(vote_id);
			hash_cache.insert(hash.to_string());
		}

		Ok(Self {
			received_cache: RwLock::new(received_cache),
			hash_cache: RwLock::new(hash_cache),
			states: RwLock::new(HashMap::new()),
			registered: tokio::sync::Mutex::new(registered),
			journal,
			hash_store,
			audit,
			db,
		})
	}

	/// Entry point for consolidated votes. Validates, deduplicates, and
	/// kicks off asynchronous processing.
	pub fn receive_vote_from_station(
		self: Arc<Self>,
		vote_id: Uuid,
		candidate_id: String,
		station_id: String,
		hash: String,
	) -> Result<(), VoteflowError> {
		for field in [&candidate_id, &station_id, &hash] {
			if field.is_empty() || !is_clean_field(field) {
				return Err(VoteflowError::Storage(
					"candidate id, station id and hash must be non-empty and delimiter-free"
						.to_string(),
				));
			}
		}

		{
			let mut received = self.received_cache.write().expect("cache lock poisoned");
			let mut hashes = self.hash_cache.write().expect("cache lock poisoned");
			if received.contains(&vote_id) {
				return Err(VoteflowError::DuplicateVote {
					vote_id: vote_id.to_string(),
					reason: "vote id already received".to_string(),
				});
			}
			if hashes.contains(&hash) {
				return Err(VoteflowError::DuplicateVote {
					vote_id: vote_id.to_string(),
					reason: "payload already received".to_string(),
				});
			}
			received.insert(vote_id);
			hashes.insert(hash.clone());
		}

		if let Err(error) = self
			.hash_store
			.append(&vote_id.to_string(), &format!("{vote_id}|{hash}"))
		{
			// Without the durable record the dedup would not survive a
			// restart; undo the reservation and surface the failure.
			self.received_cache.write().expect("cache lock poisoned").remove(&vote_id);
			self.hash_cache.write().expect("cache lock poisoned").remove(&hash);
			return Err(VoteflowError::storage(error));
		}

		self.states
			.write()
			.expect("states lock poisoned")
			.insert(vote_id, VoteState::Received);
		self.audit.record("RECEIVED", &vote_id.to_string(), &format!("station={station_id}"));

		let central = self.clone();
		tokio::spawn(async move {
			central.process(vote_id, candidate_id).await;
		});

		Ok(())
	}

	async fn process(&self, vote_id: Uuid, candidate_id: String) {
		let processing_timestamp = chrono::Local::now().naive_local();
		let hash = anonymization_hash(vote_id, &candidate_id, processing_timestamp);

		match self
			.register_anonymous(vote_id, &candidate_id, processing_timestamp, &hash)
			.await
		{
			Ok(()) => self.confirm_persistence(vote_id, VoteState::Processed),
			Err(error) => {
				tracing::error!(%vote_id, %error, "could not register anonymized vote");
				self.confirm_persistence(vote_id, VoteState::Error);
			},
		}
	}

	/// Persists one anonymized vote, preferring the proxy and falling back
	/// to the local journal. The journal write still counts as success; it
	/// is drained into the database out of band.
	pub async fn register_anonymous(
		&self,
		vote_id: Uuid,
		candidate_id: &str,
		timestamp: NaiveDateTime,
		hash: &str,
	) -> Result<(), VoteflowError> {
		let mut registered = self.registered.lock().await;
		if registered.contains(&vote_id) {
			return Err(VoteflowError::DuplicateVote {
				vote_id: vote_id.to_string(),
				reason: "already registered".to_string(),
			});
		}

		if let Err(error) = self
			.db
			.save_vote(vote_id, candidate_id.to_string(), timestamp, hash.to_string())
			.await
		{
			tracing::warn!(%vote_id, %error, "proxy write failed, journaling locally");
			let line = format!(
				"{vote_id}|{candidate_id}|{}|{hash}",
				format_timestamp(timestamp)
			);
			self.journal
				.append(&vote_id.to_string(), &line)
				.map_err(VoteflowError::storage)?;
			self.audit.record("JOURNAL_FALLBACK", &vote_id.to_string(), &error);
		}

		registered.insert(vote_id);
		self.audit.record("REGISTERED", &vote_id.to_string(), "");
		Ok(())
	}

	/// Updates the vote's state map entry and writes an audit line. Never
	/// moves a state backwards.
	pub fn confirm_persistence(&self, vote_id: Uuid, state: VoteState) {
		let mut states = self.states.write().expect("states lock poisoned");
		let current = states.get(&vote_id).copied();
		match current {
			Some(existing) if !existing.can_transition_to(state) => {
				tracing::warn!(%vote_id, %existing, %state, "ignoring backwards state transition");
				return;
			},
			_ => {
				states.insert(vote_id, state);
			},
		}
		drop(states);
		self.audit.record("CONFIRM", &vote_id.to_string(), &state.to_string());
	}

	pub fn vote_state(&self, vote_id: Uuid) -> Option<VoteState> {
		self.states.read().expect("states lock poisoned").get(&vote_id).copied()
	}
}

pub struct CentralRpcServerImpl<D> {
	central: Arc<CentralServer<D>>,
}

impl<D> CentralRpcServerImpl<D> {
	pub fn new(central: Arc<CentralServer<D>>) -> Self {
		Self { central }
	}
}

#[async_trait]
impl<D: VoteDatabase> CentralRpcApiServer for CentralRpcServerImpl<D> {
	async fn receive_vote_from_station(
		&self,
		vote_id: Uuid,
		candidate_id: String,
		station_id: String,
		hash: String,
	) -> RpcResult<()> {
		Ok(self
			.central
			.clone()
			.receive_vote_from_station(vote_id, candidate_id, station_id, hash)?)
	}

	async fn vote_state(&self, vote_id: Uuid) -> RpcResult<Option<VoteState>> {
		Ok(self.central.vote_state(vote_id))
	}
}
