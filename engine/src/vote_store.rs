//! Typed vote records over the line-store layer.
//!
//! Line schema: `vote_id|candidate_id|station_origin|timestamp|state` with
//! an optional trailing `voter_id` column (written when known; absence is
//! tolerated on read). The station and the receiver share this schema with
//! different state alphabets, so the store is generic over the state type.

use std::{fmt::Display, marker::PhantomData, path::Path, str::FromStr};

use anyhow::{anyhow, Result};
use uuid::Uuid;
use vf_primitives::{format_timestamp, parse_timestamp, Vote};
use vf_utilities::LineStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRecord<S> {
	pub vote: Vote,
	pub state: S,
	pub voter_id: Option<String>,
}

impl<S: Display> VoteRecord<S> {
	fn to_line(&self) -> String {
		let mut line = format!(
			"{}|{}|{}|{}|{}",
			self.vote.vote_id,
			self.vote.candidate_id,
			self.vote.station_origin,
			format_timestamp(self.vote.timestamp),
			self.state
		);
		if let Some(voter_id) = &self.voter_id {
			line.push('|');
			line.push_str(voter_id);
		}
		line
	}
}

impl<S: FromStr> VoteRecord<S>
where
	S::Err: std::error::Error + Send + Sync + 'static,
{
	fn parse(line: &str) -> Result<Self> {
		let fields: Vec<&str> = line.split('|').collect();
		if fields.len() < 5 {
			return Err(anyhow!("vote record has {} fields, expected at least 5", fields.len()));
		}
		let (vote_id, candidate_id, station_origin, timestamp, state) =
			(fields[0], fields[1], fields[2], fields[3], fields[4]);
		Ok(Self {
			vote: Vote {
				vote_id: Uuid::parse_str(vote_id)?,
				candidate_id: candidate_id.to_string(),
				station_origin: station_origin.to_string(),
				timestamp: parse_timestamp(timestamp)?,
			},
			state: state.parse()?,
			voter_id: fields.get(5).map(|voter_id| voter_id.to_string()),
		})
	}
}

pub struct VoteStore<S> {
	store: LineStore,
	_state: PhantomData<S>,
}

impl<S> VoteStore<S>
where
	S: Display + FromStr + Copy + PartialEq,
	S::Err: std::error::Error + Send + Sync + 'static,
{
	pub fn open(dir: &Path, name: &str) -> Result<Self> {
		Ok(Self { store: LineStore::open(dir, name)?, _state: PhantomData })
	}

	pub fn append(&self, record: &VoteRecord<S>) -> Result<()> {
		self.store.append(&record.vote.vote_id.to_string(), &record.to_line())
	}

	/// Every parseable record in the store. Malformed lines are logged and
	/// skipped rather than poisoning the scan.
	pub fn load_all(&self) -> Result<Vec<VoteRecord<S>>> {
		Ok(self
			.store
			.read_all()?
			.iter()
			.filter_map(|line| match VoteRecord::parse(line) {
				Ok(record) => Some(record),
				Err(error) => {
					tracing::warn!(%error, line, "skipping malformed vote record");
					None
				},
			})
			.collect())
	}

	pub fn get(&self, vote_id: Uuid) -> Result<Option<VoteRecord<S>>> {
		Ok(self.load_all()?.into_iter().find(|record| record.vote.vote_id == vote_id))
	}

	/// Rewrites the record's state column in place. Returns whether a
	/// record with this id was present.
	pub fn update_state(&self, vote_id: Uuid, new_state: S) -> Result<bool> {
		let prefix = format!("{vote_id}|");
		let mut found = false;
		self.store.rewrite("UPDATE_STATE", &vote_id.to_string(), |line| {
			if line.starts_with(&prefix) {
				found = true;
				match VoteRecord::<S>::parse(line) {
					Ok(mut record) => {
						record.state = new_state;
						Some(record.to_line())
					},
					Err(_) => Some(line.to_owned()),
				}
			} else {
				Some(line.to_owned())
			}
		})?;
		Ok(found)
	}
}
