//! Health monitor for a voteflow service, allowing external supervisors to
//! check it is online. Returns HTTP 200 to any request on
//! `{hostname}:{port}/health`.

use anyhow::Context;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
};

use crate::{settings, shutdown::ShutdownSignal};

pub struct HealthChecker {
	listener: TcpListener,
}

// Split into new and run so the listener is known to be bound before the
// caller proceeds.
impl HealthChecker {
	pub async fn new(health_check_settings: &settings::HealthCheck) -> anyhow::Result<Self> {
		let bind_address =
			format!("{}:{}", health_check_settings.hostname, health_check_settings.port);
		tracing::info!(%bind_address, "starting health checker");

		Ok(Self {
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind TCP listener to {bind_address}"))?,
		})
	}

	pub async fn run(self, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
		loop {
			tokio::select! {
				() = shutdown.wait() => return Ok(()),
				accepted = self.listener.accept() => match accepted {
					Ok((mut stream, _address)) => {
						let mut buffer = [0; 1024];
						let read = stream
							.read(&mut buffer)
							.await
							.context("Couldn't read stream into buffer")?;

						let request = String::from_utf8_lossy(&buffer[..read]);
						let path = request
							.lines()
							.next()
							.and_then(|request_line| request_line.split(' ').nth(1));

						if path == Some("/health") {
							stream
								.write_all(b"HTTP/1.1 200 OK\r\n\r\n")
								.await
								.context("Could not write to health check stream")?;
							stream
								.flush()
								.await
								.context("Could not flush health check TCP stream")?;
						} else {
							tracing::warn!(?path, "requested health at invalid path");
						}
					},
					Err(error) => {
						tracing::error!(%error, "could not open health check TCP stream");
					},
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::shutdown::ShutdownHandle;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn health_check_responds_200_on_the_health_path() {
		let settings =
			settings::HealthCheck { hostname: "127.0.0.1".to_string(), port: 0 };
		let checker = HealthChecker::new(&settings).await.unwrap();
		let address = checker.listener.local_addr().unwrap();

		let (handle, signal) = ShutdownHandle::new();
		tokio::spawn(checker.run(signal));

		let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
		stream.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();
		let mut response = vec![0; 64];
		let read = stream.read(&mut response).await.unwrap();
		assert!(String::from_utf8_lossy(&response[..read]).starts_with("HTTP/1.1 200 OK"));

		handle.signal();
	}
}
