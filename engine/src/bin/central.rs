use std::{path::Path, sync::Arc};

use clap::Parser;
use jsonrpsee::{http_client::HttpClientBuilder, server::ServerBuilder};
use vf_rpc_apis::central::CentralRpcApiServer;
use voteflow_engine::{
	central::{CentralRpcServerImpl, CentralServer, RemoteDatabase},
	constants::{RPC_REQUEST_TIMEOUT, SHUTDOWN_GRACE},
	health::HealthChecker,
	settings::{CentralOptions, CentralSettings, VfSettings},
	shutdown::{with_grace_period, ShutdownHandle},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = CentralOptions::parse();
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init()
		.expect("setting default subscriber failed");

	let config_path = opts.config_path.clone();
	let settings = CentralSettings::load(config_path.as_deref(), opts)?;

	let database_client = HttpClientBuilder::default()
		.request_timeout(RPC_REQUEST_TIMEOUT)
		.build(&settings.database.endpoint)?;
	let central = Arc::new(CentralServer::new(
		Path::new(&settings.central.data_dir),
		RemoteDatabase::new(database_client),
	)?);

	let (shutdown_handle, shutdown) = ShutdownHandle::new();

	if let Some(health_check) = &settings.health_check {
		let checker = HealthChecker::new(health_check).await?;
		tokio::spawn(checker.run(shutdown.clone()));
	}

	let server = ServerBuilder::default()
		.build(format!("0.0.0.0:{}", settings.central.port))
		.await?;
	let server_addr = server.local_addr()?;
	let server_handle = server.start(CentralRpcServerImpl::new(central).into_rpc());
	tracing::info!(%server_addr, "central server is listening");

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutting down");
	shutdown_handle.signal();
	let _ = server_handle.stop();
	with_grace_period(server_handle.stopped(), SHUTDOWN_GRACE).await;
	Ok(())
}
