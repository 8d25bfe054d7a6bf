//! Per-target connection tracking and failover selection.
//!
//! `ConnectionInfo` is a value object: every state change replaces the map
//! entry rather than mutating it in place. A FAILED target is probed with
//! live traffic once `recovery_timeout` has elapsed since the last attempt;
//! the outcome of that call settles the connection via `register_success`
//! or `register_failure`.

use std::{
	collections::HashMap,
	sync::RwLock,
	time::{Duration, Instant},
};

use vf_primitives::DbTarget;
use vf_rpc_apis::VoteflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Active,
	Failed,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub node_id: String,
	pub host: String,
	pub port: u16,
	pub state: ConnectionState,
	pub last_activity: Instant,
}

impl ConnectionInfo {
	pub fn active(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
		Self {
			node_id: node_id.into(),
			host: host.into(),
			port,
			state: ConnectionState::Active,
			last_activity: Instant::now(),
		}
	}

	fn with_state(&self, state: ConnectionState) -> Self {
		Self { state, last_activity: Instant::now(), ..self.clone() }
	}
}

pub struct FailoverHandler {
	connections: RwLock<HashMap<DbTarget, ConnectionInfo>>,
	recovery_timeout: Duration,
}

impl FailoverHandler {
	pub fn new(
		primary: ConnectionInfo,
		replica: ConnectionInfo,
		recovery_timeout: Duration,
	) -> Self {
		Self {
			connections: RwLock::new(HashMap::from([
				(DbTarget::Primary, primary),
				(DbTarget::Replica, replica),
			])),
			recovery_timeout,
		}
	}

	pub fn register_failure(&self, target: DbTarget) {
		let mut connections = self.connections.write().expect("connections lock poisoned");
		let info = connections.get(&target).expect("both targets are registered");
		if info.state == ConnectionState::Active {
			tracing::warn!(%target, node_id = %info.node_id, "marking connection FAILED");
		}
		let replacement = info.with_state(ConnectionState::Failed);
		connections.insert(target, replacement);
	}

	pub fn register_success(&self, target: DbTarget) {
		let mut connections = self.connections.write().expect("connections lock poisoned");
		let info = connections.get(&target).expect("both targets are registered");
		if info.state == ConnectionState::Failed {
			tracing::info!(%target, node_id = %info.node_id, "connection recovered");
		}
		let replacement = info.with_state(ConnectionState::Active);
		connections.insert(target, replacement);
	}

	/// Picks the target to actually use for a call aimed at `target`:
	/// the target itself when ACTIVE or due a recovery probe, otherwise
	/// the alternative, otherwise `DBConnection`.
	pub fn get_connection(&self, target: DbTarget) -> Result<DbTarget, VoteflowError> {
		let mut connections = self.connections.write().expect("connections lock poisoned");

		let info = connections.get(&target).expect("both targets are registered");
		match info.state {
			ConnectionState::Active => return Ok(target),
			ConnectionState::Failed
				if info.last_activity.elapsed() >= self.recovery_timeout =>
			{
				// Admit one recovery probe; stamping last_activity spaces
				// the probes recovery_timeout apart.
				tracing::info!(%target, "probing failed connection");
				let replacement = info.with_state(ConnectionState::Failed);
				connections.insert(target, replacement);
				return Ok(target);
			},
			ConnectionState::Failed => {},
		}

		let alternative = target.alternative();
		if connections
			.get(&alternative)
			.expect("both targets are registered")
			.state == ConnectionState::Active
		{
			tracing::debug!(%target, %alternative, "failing over");
			Ok(alternative)
		} else {
			Err(VoteflowError::DbConnection {
				target: target.to_string(),
				message: "no usable connection to any target".to_string(),
			})
		}
	}

	pub fn connection(&self, target: DbTarget) -> ConnectionInfo {
		self.connections
			.read()
			.expect("connections lock poisoned")
			.get(&target)
			.expect("both targets are registered")
			.clone()
	}
}
