use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use jsonrpsee::{http_client::HttpClientBuilder, server::ServerBuilder};
use vf_rpc_apis::station::StationRpcApiServer;
use voteflow_engine::{
	constants::{RPC_REQUEST_TIMEOUT, SHUTDOWN_GRACE},
	health::HealthChecker,
	settings::{StationOptions, StationSettings, VfSettings},
	shutdown::{with_grace_period, ShutdownHandle},
	station::{RemoteCenter, StationAgent, StationRpcServerImpl},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = StationOptions::parse();
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init()
		.expect("setting default subscriber failed");

	let config_path = opts.config_path.clone();
	let settings = StationSettings::load(config_path.as_deref(), opts)?;

	let center_client = HttpClientBuilder::default()
		.request_timeout(RPC_REQUEST_TIMEOUT)
		.build(&settings.center.endpoint)?;
	let agent = Arc::new(StationAgent::new(
		settings.station.id.clone(),
		Path::new(&settings.station.data_dir),
		RemoteCenter::new(center_client),
	)?);

	let (shutdown_handle, shutdown) = ShutdownHandle::new();

	if let Some(health_check) = &settings.health_check {
		let checker = HealthChecker::new(health_check).await?;
		tokio::spawn(checker.run(shutdown.clone()));
	}

	let sweep = tokio::spawn(agent.clone().run_retry_sweep(
		Duration::from_secs(settings.station.retry_interval_seconds),
		shutdown.clone(),
	));

	let server = ServerBuilder::default()
		.build(format!("0.0.0.0:{}", settings.station.port))
		.await?;
	let server_addr = server.local_addr()?;
	let server_handle = server.start(StationRpcServerImpl::new(agent).into_rpc());
	tracing::info!(station_id = %settings.station.id, region_id = %settings.region.id, %server_addr, "station is listening");

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutting down");
	shutdown_handle.signal();
	let _ = server_handle.stop();
	with_grace_period(
		async {
			let _ = sweep.await;
			server_handle.stopped().await;
		},
		SHUTDOWN_GRACE,
	)
	.await;
	Ok(())
}
