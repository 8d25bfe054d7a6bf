use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use jsonrpsee::server::ServerBuilder;
use vf_rpc_apis::dbproxy::DbProxyRpcApiServer;
use voteflow_engine::{
	constants::{CACHE_SWEEP_INTERVAL, SHUTDOWN_GRACE},
	dbproxy::{DbProxy, DbProxyRpcServerImpl},
	health::HealthChecker,
	settings::{DbProxyOptions, DbProxySettings, VfSettings},
	shutdown::{with_grace_period, ShutdownHandle},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = DbProxyOptions::parse();
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.try_init()
		.expect("setting default subscriber failed");

	let config_path = opts.config_path.clone();
	let settings = DbProxySettings::load(config_path.as_deref(), opts)?;

	let proxy = Arc::new(DbProxy::new(
		Path::new(&settings.database.data_dir),
		settings.circuit.into(),
		settings.cache.max_size,
		Duration::from_secs(settings.cache.default_ttl_seconds),
		Duration::from_secs(settings.database.recovery_timeout_seconds),
	)?);

	let (shutdown_handle, shutdown) = ShutdownHandle::new();

	if let Some(health_check) = &settings.health_check {
		let checker = HealthChecker::new(health_check).await?;
		tokio::spawn(checker.run(shutdown.clone()));
	}

	let sweeper =
		tokio::spawn(proxy.cache.clone().run_sweeper(CACHE_SWEEP_INTERVAL, shutdown.clone()));

	let server = ServerBuilder::default()
		.build(format!("0.0.0.0:{}", settings.database.port))
		.await?;
	let server_addr = server.local_addr()?;
	let server_handle = server.start(DbProxyRpcServerImpl::new(proxy).into_rpc());
	tracing::info!(%server_addr, "database proxy is listening");

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutting down");
	shutdown_handle.signal();
	let _ = server_handle.stop();
	with_grace_period(
		async {
			let _ = sweeper.await;
			server_handle.stopped().await;
		},
		SHUTDOWN_GRACE,
	)
	.await;
	Ok(())
}
