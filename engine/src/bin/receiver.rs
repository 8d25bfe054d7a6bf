use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use jsonrpsee::{http_client::HttpClientBuilder, server::ServerBuilder};
use vf_rpc_apis::receiver::ReceiverRpcApiServer;
use voteflow_engine::{
	constants::{RPC_REQUEST_TIMEOUT, SHUTDOWN_GRACE},
	health::HealthChecker,
	receiver::{
		BrokeredCentral, CenterReceiver, ConsolidationClient, DirectCentral,
		ReceiverRpcServerImpl,
	},
	settings::{ReceiverOptions, ReceiverSettings, VfSettings},
	shutdown::{with_grace_period, ShutdownHandle},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = ReceiverOptions::parse();
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init()
		.expect("setting default subscriber failed");

	let config_path = opts.config_path.clone();
	let settings = ReceiverSettings::load(config_path.as_deref(), opts)?;

	// When the broker is enabled it is the sole dispatcher towards the
	// center; otherwise consolidation goes straight to the central server.
	let forwarder: Box<dyn ConsolidationClient> = if settings.receiver.use_broker {
		Box::new(BrokeredCentral::new(
			HttpClientBuilder::default()
				.request_timeout(RPC_REQUEST_TIMEOUT)
				.build(&settings.broker.endpoint)?,
		))
	} else {
		Box::new(DirectCentral::new(
			HttpClientBuilder::default()
				.request_timeout(RPC_REQUEST_TIMEOUT)
				.build(&settings.central.endpoint)?,
		))
	};

	let receiver =
		Arc::new(CenterReceiver::new(Path::new(&settings.receiver.data_dir), forwarder)?);

	let (shutdown_handle, shutdown) = ShutdownHandle::new();

	if let Some(health_check) = &settings.health_check {
		let checker = HealthChecker::new(health_check).await?;
		tokio::spawn(checker.run(shutdown.clone()));
	}

	let sweep = tokio::spawn(receiver.clone().run_reprocess_sweep(
		Duration::from_secs(settings.receiver.sweep_interval_seconds),
		shutdown.clone(),
	));

	let server = ServerBuilder::default()
		.build(format!("0.0.0.0:{}", settings.receiver.port))
		.await?;
	let server_addr = server.local_addr()?;
	let server_handle = server.start(ReceiverRpcServerImpl::new(receiver).into_rpc());
	tracing::info!(%server_addr, use_broker = settings.receiver.use_broker, "receiver is listening");

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
