//! Graceful-shutdown plumbing shared by the service binaries and the
//! background sweeps.

use std::time::Duration;

use tokio::sync::watch;

/// Cloneable handle a task selects on to learn it should stop.
#[derive(Clone)]
pub struct ShutdownSignal {
	receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
	/// Resolves when shutdown has been requested.
	pub async fn wait(&mut self) {
		// An error means the sender is gone, which also means shut down.
		while !*self.receiver.borrow() {
			if self.receiver.changed().await.is_err() {
				return;
			}
		}
	}

	pub fn is_shutdown(&self) -> bool {
		*self.receiver.borrow()
	}
}

pub struct ShutdownHandle {
	sender: watch::Sender<bool>,
}

impl ShutdownHandle {
	pub fn new() -> (Self, ShutdownSignal) {
		let (sender, receiver) = watch::channel(false);
		(Self { sender }, ShutdownSignal { receiver })
	}

	pub fn signal(&self) {
		let _ = self.sender.send(true);
	}
}

/// Runs `task` until it completes or the grace period expires.
pub async fn with_grace_period<F: std::future::Future>(task: F, grace: Duration) {
	if tokio::time::timeout(grace, task).await.is_err() {
		tracing::warn!("in-flight work did not finish within {:?}, exiting anyway", grace);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn signal_releases_all_waiters() {
		let (handle, signal) = ShutdownHandle::new();
		let mut waiter_a = signal.clone();
		let mut waiter_b = signal;

		let task = tokio::spawn(async move {
			waiter_a.wait().await;
		});

		handle.signal();
		waiter_b.wait().await;
		tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn dropping_the_handle_counts_as_shutdown() {
		let (handle, mut signal) = ShutdownHandle::new();
		drop(handle);
		tokio::time::timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
	}
}
