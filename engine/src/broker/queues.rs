//! The broker's two internal queues, built on explicit binary heaps.
//!
//! `PrimaryQueue` orders by `(priority, enqueued_at)` with an insertion
//! sequence breaking ties, so the oldest vote wins within a priority class.
//! Re-enqueueing a vote id supersedes the previous entry, which is skipped
//! lazily when it surfaces. `RetryQueue` orders by readiness time; the
//! mover task migrates ready items back into the primary queue.

use std::{
	cmp::Reverse,
	collections::{BinaryHeap, HashMap},
	time::Instant,
};

use chrono::NaiveDateTime;
use uuid::Uuid;
use vf_primitives::{PendingVote, Priority};
use vf_rpc_apis::VoteflowError;

#[derive(PartialEq, Eq)]
struct PrimaryEntry {
	priority: Priority,
	enqueued_at: NaiveDateTime,
	seq: u64,
	vote: PendingVote,
}

impl Ord for PrimaryEntry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.priority, self.enqueued_at, self.seq).cmp(&(
			other.priority,
			other.enqueued_at,
			other.seq,
		))
	}
}

impl PartialOrd for PrimaryEntry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

pub struct PrimaryQueue {
	heap: BinaryHeap<Reverse<PrimaryEntry>>,
	/// Live sequence number per vote id; heap entries with a stale sequence
	/// have been superseded and are dropped when they surface.
	live: HashMap<Uuid, u64>,
	next_seq: u64,
	capacity: usize,
}

impl PrimaryQueue {
	pub fn new(capacity: usize) -> Self {
		Self { heap: BinaryHeap::new(), live: HashMap::new(), next_seq: 0, capacity }
	}

	/// Inserts a vote. A vote id already present is re-inserted with the
	/// new priority; a full queue rejects new ids with `QueueFull`.
	pub fn enqueue(&mut self, vote: PendingVote) -> Result<(), VoteflowError> {
		if !self.live.contains_key(&vote.vote_id) && self.live.len() >= self.capacity {
			return Err(VoteflowError::QueueFull(self.capacity));
		}
		self.next_seq += 1;
		self.live.insert(vote.vote_id, self.next_seq);
		self.heap.push(Reverse(PrimaryEntry {
			priority: vote.priority,
			enqueued_at: vote.enqueued_at,
			seq: self.next_seq,
			vote,
		}));
		Ok(())
	}

	pub fn dequeue(&mut self) -> Option<PendingVote> {
		while let Some(Reverse(entry)) = self.heap.pop() {
			if self.live.get(&entry.vote.vote_id) == Some(&entry.seq) {
				self.live.remove(&entry.vote.vote_id);
				return Some(entry.vote);
			}
			// Superseded entry, drop it.
		}
		None
	}

	/// Drops a vote id from the queue. The heap entry is skipped lazily.
	pub fn remove(&mut self, vote_id: Uuid) {
		self.live.remove(&vote_id);
	}

	pub fn len(&self) -> usize {
		self.live.len()
	}
}

struct RetryEntry {
	ready_at: Instant,
	seq: u64,
	vote: PendingVote,
}

impl PartialEq for RetryEntry {
	fn eq(&self, other: &Self) -> bool {
		(self.ready_at, self.seq) == (other.ready_at, other.seq)
	}
}
impl Eq for RetryEntry {}

impl Ord for RetryEntry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
	}
}

impl PartialOrd for RetryEntry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

pub struct RetryQueue {
	heap: BinaryHeap<Reverse<RetryEntry>>,
	next_seq: u64,
}

impl RetryQueue {
	pub fn new() -> Self {
		Self { heap: BinaryHeap::new(), next_seq: 0 }
	}

	pub fn push(&mut self, vote: PendingVote, ready_at: Instant) {
		self.next_seq += 1;
		self.heap.push(Reverse(RetryEntry { ready_at, seq: self.next_seq, vote }));
	}

	/// Pops the next item whose readiness time has passed.
	pub fn pop_ready(&mut self, now: Instant) -> Option<PendingVote> {
		if self.heap.peek().is_some_and(|Reverse(entry)| entry.ready_at <= now) {
			self.heap.pop().map(|Reverse(entry)| entry.vote)
		} else {
			None
		}
	}

	/// When the earliest item becomes ready, if any.
	pub fn next_ready_at(&self) -> Option<Instant> {
		self.heap.peek().map(|Reverse(entry)| entry.ready_at)
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn pending(priority: Priority, enqueued_at: NaiveDateTime) -> PendingVote {
		PendingVote {
			vote_id: Uuid::new_v4(),
			candidate_id: "C001".to_string(),
			priority,
			attempt_count: 0,
			enqueued_at,
		}
	}

	fn at(seconds: u32) -> NaiveDateTime {
		chrono::NaiveDate::from_ymd_opt(2026, 3, 14)
			.unwrap()
			.and_hms_opt(9, 0, seconds)
			.unwrap()
	}

	#[test]
	fn dequeues_by_priority_then_age() {
		let mut queue = PrimaryQueue::new(100);
		let normal = pending(Priority::Normal, at(0));
		let critical = pending(Priority::Critical, at(2));
		let high_old = pending(Priority::High, at(1));
		let high_new = pending(Priority::High, at(3));

		for vote in [&normal, &critical, &high_old, &high_new] {
			queue.enqueue(vote.clone()).unwrap();
		}

		assert_eq!(queue.dequeue().unwrap().vote_id, critical.vote_id);
		assert_eq!(queue.dequeue().unwrap().vote_id, high_old.vote_id);
		assert_eq!(queue.dequeue().unwrap().vote_id, high_new.vote_id);
		assert_eq!(queue.dequeue().unwrap().vote_id, normal.vote_id);
		assert!(queue.dequeue().is_none());
	}

	#[test]
	fn reinserting_a_vote_id_applies_the_new_priority() {
		let mut queue = PrimaryQueue::new(100);
		let mut vote = pending(Priority::Low, at(0));
		queue.enqueue(vote.clone()).unwrap();

		let competitor = pending(Priority::Normal, at(1));
		queue.enqueue(competitor.clone()).unwrap();

		vote.priority = Priority::Critical;
		queue.enqueue(vote.clone()).unwrap();

		assert_eq!(queue.len(), 2);
		assert_eq!(queue.dequeue().unwrap().vote_id, vote.vote_id);
		assert_eq!(queue.dequeue().unwrap().vote_id, competitor.vote_id);
		assert!(queue.dequeue().is_none());
	}

	#[test]
	fn rejects_new_ids_beyond_capacity() {
		let mut queue = PrimaryQueue::new(2);
		let first = pending(Priority::Normal, at(0));
		queue.enqueue(first.clone()).unwrap();
		queue.enqueue(pending(Priority::Normal, at(1))).unwrap();

		assert!(matches!(
			queue.enqueue(pending(Priority::Normal, at(2))),
			Err(VoteflowError::QueueFull(2))
		));
		// Re-inserting an existing id is not a capacity violation.
		queue.enqueue(first).unwrap();
	}

	#[test]
	fn retry_items_become_eligible_at_their_ready_time() {
		let mut queue = RetryQueue::new();
		let now = Instant::now();
		let soon = pending(Priority::Normal, at(0));
		let later = pending(Priority::Normal, at(1));
		queue.push(later.clone(), now + Duration::from_secs(60));
		queue.push(soon.clone(), now + Duration::from_secs(30));

		assert!(queue.pop_ready(now).is_none());
		assert_eq!(queue.next_ready_at(), Some(now + Duration::from_secs(30)));

		let in_45s = now + Duration::from_secs(45);
		assert_eq!(queue.pop_ready(in_45s).unwrap().vote_id, soon.vote_id);
		assert!(queue.pop_ready(in_45s).is_none());

		let in_90s = now + Duration::from_secs(90);
		assert_eq!(queue.pop_ready(in_90s).unwrap().vote_id, later.vote_id);
	}
}
