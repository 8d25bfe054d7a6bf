//! TTL-bounded result cache.
//!
//! Expired entries are dropped lazily on read and eagerly by a periodic
//! sweep. The sweep also snapshots live entries to disk so hot entries
//! survive a restart; snapshot lines carry a wall-clock expiry and anything
//! already expired is dropped on load.

use std::{
	collections::HashMap,
	fs,
	path::{Path, PathBuf},
	sync::{Arc, RwLock},
	time::{Duration, Instant},
};

use chrono::NaiveDateTime;
use vf_primitives::{format_timestamp, parse_timestamp};

use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
struct CacheEntry {
	value: String,
	expires_at: Instant,
	expires_at_wall: NaiveDateTime,
}

impl CacheEntry {
	fn new(value: String, ttl: Duration) -> Self {
		Self {
			value,
			expires_at: Instant::now() + ttl,
			expires_at_wall: chrono::Local::now().naive_local()
				+ chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
		}
	}

	fn is_expired(&self) -> bool {
		Instant::now() >= self.expires_at
	}
}

pub struct CacheService {
	entries: RwLock<HashMap<String, CacheEntry>>,
	max_size: usize,
	default_ttl: Duration,
	snapshot_path: PathBuf,
}

impl CacheService {
	/// Opens the cache, reloading any still-live entries from the snapshot
	/// file.
	pub fn open(data_dir: &Path, max_size: usize, default_ttl: Duration) -> anyhow::Result<Self> {
		fs::create_dir_all(data_dir)?;
		let snapshot_path = data_dir.join("cache.dat");

		let mut entries = HashMap::new();
		if snapshot_path.exists() {
			let now_wall = chrono::Local::now().naive_local();
			for line in fs::read_to_string(&snapshot_path)?.lines() {
				// `expires_at|key|value`; the value may itself contain pipes.
				let mut fields = line.splitn(3, '|');
				let (Some(expires), Some(key), Some(value)) =
					(fields.next(), fields.next(), fields.next())
				else {
					continue;
				};
				let Ok(expires_at_wall) = parse_timestamp(expires) else {
					continue;
				};
				if expires_at_wall <= now_wall {
					continue;
				}
				let remaining = (expires_at_wall - now_wall)
					.to_std()
					.unwrap_or(Duration::ZERO);
				entries.insert(
					key.to_string(),
					CacheEntry {
						value: value.to_string(),
						expires_at: Instant::now() + remaining,
						expires_at_wall,
					},
				);
			}
		}

		Ok(Self { entries: RwLock::new(entries), max_size, default_ttl, snapshot_path })
	}

	pub fn default_ttl(&self) -> Duration {
		self.default_ttl
	}

	/// Returns the live value for `key`. An expired entry is removed and
	/// reported as a miss.
	pub fn get(&self, key: &str) -> Option<String> {
		{
			let entries = self.entries.read().expect("cache lock poisoned");
			match entries.get(key) {
				Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
				Some(_expired) => {},
				None => return None,
			}
		}
		self.entries.write().expect("cache lock poisoned").remove(key);
		None
	}

	pub fn set(&self, key: &str, value: String, ttl: Duration) {
		let mut entries = self.entries.write().expect("cache lock poisoned");
		if !entries.contains_key(key) && entries.len() >= self.max_size {
			entries.retain(|_, entry| !entry.is_expired());
			if entries.len() >= self.max_size {
				// Still full: displace the entry closest to expiry.
				if let Some(victim) = entries
					.iter()
					.min_by_key(|(_, entry)| entry.expires_at)
					.map(|(key, _)| key.clone())
				{
					entries.remove(&victim);
				}
			}
		}
		entries.insert(key.to_string(), CacheEntry::new(value, ttl));
	}

	/// Removes all keys matching `pattern`: a trailing `*` makes it a
	/// prefix glob, otherwise the match is exact. Returns how many entries
	/// were dropped.
	pub fn invalidate(&self, pattern: &str) -> usize {
		let mut entries = self.entries.write().expect("cache lock poisoned");
		let before = entries.len();
		match pattern.strip_suffix('*') {
			Some(prefix) => entries.retain(|key, _| !key.starts_with(prefix)),
			None => {
				entries.remove(pattern);
			},
		}
		before - entries.len()
	}

	pub fn len(&self) -> usize {
		self.entries.read().expect("cache lock poisoned").len()
	}

	/// Drops expired entries and snapshots the survivors.
	pub fn sweep(&self) {
		let snapshot: Vec<String> = {
			let mut entries = self.entries.write().expect("cache lock poisoned");
			entries.retain(|_, entry| !entry.is_expired());
			entries
				.iter()
				.map(|(key, entry)| {
					format!(
						"{}|{}|{}",
						format_timestamp(entry.expires_at_wall),
						key,
						entry.value
					)
				})
				.collect()
		};
		if let Err(error) = fs::write(&self.snapshot_path, snapshot.join("\n") + "\n") {
			tracing::warn!(%error, "could not snapshot cache");
		}
	}

	pub async fn run_sweeper(
		self: Arc<Self>,
		interval: Duration,
		mut shutdown: ShutdownSignal,
	) {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				() = shutdown.wait() => {
					// Final snapshot so hot entries survive the restart.
					self.sweep();
					return;
				},
				_ = ticker.tick() => self.sweep(),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cache_in(dir: &Path) -> CacheService {
		CacheService::open(dir, 100, Duration::from_secs(60)).unwrap()
	}

	#[test]
	fn entries_are_served_until_their_ttl_and_not_after() {
		let dir = tempfile::tempdir().unwrap();
		let cache = cache_in(dir.path());

		cache.set("voteState_v1", "PROCESSED".to_string(), Duration::from_millis(40));
		assert_eq!(cache.get("voteState_v1"), Some("PROCESSED".to_string()));

		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(cache.get("voteState_v1"), None);
		// The expired entry was dropped on read.
		assert_eq!(cache.len(), 0);
	}

	#[test]
	fn set_overwrites_the_previous_value() {
		let dir = tempfile::tempdir().unwrap();
		let cache = cache_in(dir.path());
		cache.set("turnout", "40.0".to_string(), Duration::from_secs(60));
		cache.set("turnout", "41.5".to_string(), Duration::from_secs(60));
		assert_eq!(cache.get("turnout"), Some("41.5".to_string()));
	}

	#[test]
	fn prefix_glob_invalidation_removes_matching_keys_only() {
		let dir = tempfile::tempdir().unwrap();
		let cache = cache_in(dir.path());
		cache.set("candidates_all", "[]".to_string(), Duration::from_secs(60));
		cache.set("candidates_region7", "[]".to_string(), Duration::from_secs(60));
		cache.set("turnout", "40.0".to_string(), Duration::from_secs(60));

		assert_eq!(cache.invalidate("candidates_*"), 2);
		assert_eq!(cache.get("candidates_all"), None);
		assert_eq!(cache.get("turnout"), Some("40.0".to_string()));
	}

	#[test]
	fn exact_invalidation_without_glob() {
		let dir = tempfile::tempdir().unwrap();
		let cache = cache_in(dir.path());
		cache.set("turnout", "40.0".to_string(), Duration::from_secs(60));
		assert_eq!(cache.invalidate("turnout"), 1);
		assert_eq!(cache.get("turnout"), None);
	}

	#[test]
	fn full_cache_displaces_the_entry_closest_to_expiry() {
		let dir = tempfile::tempdir().unwrap();
		let cache = CacheService::open(dir.path(), 2, Duration::from_secs(60)).unwrap();
		cache.set("short", "a".to_string(), Duration::from_secs(10));
		cache.set("long", "b".to_string(), Duration::from_secs(600));
		cache.set("new", "c".to_string(), Duration::from_secs(60));

		assert_eq!(cache.len(), 2);
		assert_eq!(cache.get("short"), None);
		assert_eq!(cache.get("long"), Some("b".to_string()));
		assert_eq!(cache.get("new"), Some("c".to_string()));
	}

	#[test]
	fn live_entries_survive_a_restart_via_the_snapshot() {
		let dir = tempfile::tempdir().unwrap();
		{
			let cache = cache_in(dir.path());
			cache.set("candidates_all", "[\"C001|A|P\"]".to_string(), Duration::from_secs(600));
			cache.set("gone", "x".to_string(), Duration::from_millis(1));
			std::thread::sleep(Duration::from_millis(5));
			cache.sweep();
		}

		let cache = cache_in(dir.path());
		// Pipes inside the value survive the snapshot round trip.
		assert_eq!(cache.get("candidates_all"), Some("[\"C001|A|P\"]".to_string()));
		assert_eq!(cache.get("gone"), None);
	}
}
