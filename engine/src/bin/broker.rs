use std::{path::Path, sync::Arc};

use clap::Parser;
use jsonrpsee::{http_client::HttpClientBuilder, server::ServerBuilder};
use vf_rpc_apis::broker::BrokerRpcApiServer;
use voteflow_engine::{
	broker::{BrokerRpcServerImpl, RemoteCentralDispatch, VoteBroker},
	constants::{RPC_REQUEST_TIMEOUT, SHUTDOWN_GRACE},
	health::HealthChecker,
	settings::{BrokerOptions, BrokerSettings, VfSettings},
	shutdown::{with_grace_period, ShutdownHandle},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = BrokerOptions::parse();
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init()
		.expect("setting default subscriber failed");

	let config_path = opts.config_path.clone();
	let settings = BrokerSettings::load(config_path.as_deref(), opts)?;

	let central_client = HttpClientBuilder::default()
		.request_timeout(RPC_REQUEST_TIMEOUT)
		.build(&settings.central.endpoint)?;
	let broker = Arc::new(VoteBroker::new(
		Path::new(&settings.broker.data_dir),
		settings.queue,
		settings.circuit.into(),
		RemoteCentralDispatch::new(central_client),
	)?);

	let (shutdown_handle, shutdown) = ShutdownHandle::new();

	if let Some(health_check) = &settings.health_check {
		let checker = HealthChecker::new(health_check).await?;
		tokio::spawn(checker.run(shutdown.clone()));
	}

	let dispatcher = tokio::spawn(broker.clone().run_dispatcher(shutdown.clone()));
	let mover = tokio::spawn(broker.clone().run_retry_mover(shutdown.clone()));

	let server = ServerBuilder::default()
		.build(format!("0.0.0.0:{}", settings.broker.port))
		.await?;
	let server_addr = server.local_addr()?;
	let server_handle = server.start(BrokerRpcServerImpl::new(broker).into_rpc());
	tracing::info!(%server_addr, "broker is listening");

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutting down");
	shutdown_handle.signal();
	let _ = server_handle.stop();
	with_grace_period(
		async {
			let _ = futures::future::join_all([dispatcher, mover]).await;
			server_handle.stopped().await;
		},
		SHUTDOWN_GRACE,
	)
	.await;
	Ok(())
}
