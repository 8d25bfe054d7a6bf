//! Settings loading for the voteflow services.
//!
//! Each binary merges, in order of increasing precedence: built-in defaults,
//! an optional TOML file, environment variables (prefix `VF`, `__`
//! separator), and command-line options exposed as a [`config::Source`].

use std::collections::HashMap;

use config::{
	builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File, Map, Source,
	Value,
};
use serde::{de::DeserializeOwned, Deserialize};

pub trait VfSettings: DeserializeOwned + Sized {
	type CommandLineOptions: Source + Send + Sync + Clone + 'static;

	fn set_defaults(
		config_builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError>;

	fn validate_settings(&self) -> Result<(), ConfigError> {
		Ok(())
	}

	fn load(
		config_path: Option<&str>,
		opts: Self::CommandLineOptions,
	) -> Result<Self, ConfigError> {
		let mut builder = Self::set_defaults(Config::builder())?;
		if let Some(path) = config_path {
			builder = builder.add_source(File::with_name(path));
		}
		let settings: Self = builder
			.add_source(Environment::with_prefix("VF").separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;
		settings.validate_settings()?;
		Ok(settings)
	}
}

/// Copies a `Some` command-line value into the config map under `key`.
pub fn insert_command_line_option<T: Into<Value> + Clone>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) {
	if let Some(value) = option {
		map.insert(key.to_string(), value.clone().into());
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheck {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Endpoint {
	pub endpoint: String,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CircuitSettings {
	pub failure_threshold: u32,
	pub timeout_seconds: u64,
	pub success_threshold: u32,
}

impl From<CircuitSettings> for vf_utilities::CircuitBreakerConfig {
	fn from(settings: CircuitSettings) -> Self {
		Self {
			failure_threshold: settings.failure_threshold,
			timeout: std::time::Duration::from_secs(settings.timeout_seconds),
			success_threshold: settings.success_threshold,
		}
	}
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct QueueSettings {
	pub max_size: usize,
	pub retry_base_seconds: u64,
	pub retry_max_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CacheSettings {
	pub max_size: usize,
	pub default_ttl_seconds: u64,
}

fn circuit_defaults(
	builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
	builder
		.set_default("circuit.failure_threshold", 5)?
		.set_default("circuit.timeout_seconds", 60)?
		.set_default("circuit.success_threshold", 3)
}

// ======= Station =======

#[derive(Debug, Deserialize, Clone)]
pub struct StationSection {
	pub id: String,
	pub port: u16,
	pub data_dir: String,
	pub retry_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegionSection {
	pub id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StationSettings {
	pub station: StationSection,
	pub region: RegionSection,
	pub center: Endpoint,
	pub health_check: Option<HealthCheck>,
}

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct StationOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,
	#[clap(long = "station.id")]
	station_id: Option<String>,
	#[clap(long = "station.port")]
	station_port: Option<u16>,
	#[clap(long = "station.data_dir")]
	station_data_dir: Option<String>,
	#[clap(long = "center.endpoint")]
	center_endpoint: Option<String>,
}

impl Source for StationOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(&mut map, "station.id", &self.station_id);
		insert_command_line_option(
			&mut map,
			"station.port",
			&self.station_port.map(|port| port as i64),
		);
		insert_command_line_option(&mut map, "station.data_dir", &self.station_data_dir);
		insert_command_line_option(&mut map, "center.endpoint", &self.center_endpoint);
		Ok(map)
	}
}

impl VfSettings for StationSettings {
	type CommandLineOptions = StationOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		builder
			.set_default("station.id", "Station01")?
			.set_default("station.port", 9810)?
			.set_default("station.data_dir", "./data/station")?
			.set_default("station.retry_interval_seconds", 30)?
			.set_default("region.id", "Region01")?
			.set_default("center.endpoint", "http://127.0.0.1:9820")
	}

	fn validate_settings(&self) -> Result<(), ConfigError> {
		if self.station.id.is_empty() {
			return Err(ConfigError::Message("station.id must not be empty".to_string()));
		}
		Ok(())
	}
}

// ======= Receiver =======

#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverSection {
	pub port: u16,
	pub data_dir: String,
	pub sweep_interval_seconds: u64,
	/// When set, consolidation goes through the broker instead of straight
	/// to the central server.
	pub use_broker: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverSettings {
	pub receiver: ReceiverSection,
	pub central: Endpoint,
	pub broker: Endpoint,
	pub health_check: Option<HealthCheck>,
}

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct ReceiverOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,
	#[clap(long = "receiver.port")]
	receiver_port: Option<u16>,
	#[clap(long = "receiver.data_dir")]
	receiver_data_dir: Option<String>,
	#[clap(long = "receiver.use_broker")]
	receiver_use_broker: Option<bool>,
	#[clap(long = "central.endpoint")]
	central_endpoint: Option<String>,
	#[clap(long = "broker.endpoint")]
	broker_endpoint: Option<String>,
}

impl Source for ReceiverOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(
			&mut map,
			"receiver.port",
			&self.receiver_port.map(|port| port as i64),
		);
		insert_command_line_option(&mut map, "receiver.data_dir", &self.receiver_data_dir);
		insert_command_line_option(&mut map, "receiver.use_broker", &self.receiver_use_broker);
		insert_command_line_option(&mut map, "central.endpoint", &self.central_endpoint);
		insert_command_line_option(&mut map, "broker.endpoint", &self.broker_endpoint);
		Ok(map)
	}
}

impl VfSettings for ReceiverSettings {
	type CommandLineOptions = ReceiverOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		builder
			.set_default("receiver.port", 9820)?
			.set_default("receiver.data_dir", "./data/receiver")?
			.set_default("receiver.sweep_interval_seconds", 60)?
			.set_default("receiver.use_broker", false)?
			.set_default("central.endpoint", "http://127.0.0.1:9840")?
			.set_default("broker.endpoint", "http://127.0.0.1:9830")
	}
}

// ======= Broker =======

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSection {
	pub port: u16,
	pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
	pub broker: BrokerSection,
	pub queue: QueueSettings,
	pub circuit: CircuitSettings,
	pub central: Endpoint,
	pub health_check: Option<HealthCheck>,
}

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct BrokerOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,
	#[clap(long = "broker.port")]
	broker_port: Option<u16>,
	#[clap(long = "broker.data_dir")]
	broker_data_dir: Option<String>,
	#[clap(long = "queue.max_size")]
	queue_max_size: Option<i64>,
	#[clap(long = "central.endpoint")]
	central_endpoint: Option<String>,
}

impl Source for BrokerOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(
			&mut map,
			"broker.port",
			&self.broker_port.map(|port| port as i64),
		);
		insert_command_line_option(&mut map, "broker.data_dir", &self.broker_data_dir);
		insert_command_line_option(&mut map, "queue.max_size", &self.queue_max_size);
		insert_command_line_option(&mut map, "central.endpoint", &self.central_endpoint);
		Ok(map)
	}
}

impl VfSettings for BrokerSettings {
	type CommandLineOptions = BrokerOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		circuit_defaults(builder)?
			.set_default("broker.port", 9830)?
			.set_default("broker.data_dir", "./data/broker")?
			.set_default("queue.max_size", 10_000)?
			.set_default("queue.retry_base_seconds", 30)?
			.set_default("queue.retry_max_seconds", 300)?
			.set_default("central.endpoint", "http://127.0.0.1:9840")
	}
}

// ======= Central =======

#[derive(Debug, Deserialize, Clone)]
pub struct CentralSection {
	pub port: u16,
	pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CentralSettings {
	pub central: CentralSection,
	pub database: Endpoint,
	pub health_check: Option<HealthCheck>,
}

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct CentralOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,
	#[clap(long = "central.port")]
	central_port: Option<u16>,
	#[clap(long = "central.data_dir")]
	central_data_dir: Option<String>,
	#[clap(long = "database.endpoint")]
	database_endpoint: Option<String>,
}

impl Source for CentralOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(
			&mut map,
			"central.port",
			&self.central_port.map(|port| port as i64),
		);
		insert_command_line_option(&mut map, "central.data_dir", &self.central_data_dir);
		insert_command_line_option(&mut map, "database.endpoint", &self.database_endpoint);
		Ok(map)
	}
}

impl VfSettings for CentralSettings {
	type CommandLineOptions = CentralOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		builder
			.set_default("central.port", 9840)?
			.set_default("central.data_dir", "./data/central")?
			.set_default("database.endpoint", "http://127.0.0.1:9850")
	}
}

// ======= DBProxy =======

#[derive(Debug, Deserialize, Clone)]
pub struct DbProxySection {
	pub port: u16,
	pub data_dir: String,
	pub recovery_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbProxySettings {
	pub database: DbProxySection,
	pub circuit: CircuitSettings,
	pub cache: CacheSettings,
	pub health_check: Option<HealthCheck>,
}

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct DbProxyOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,
	#[clap(long = "database.port")]
	database_port: Option<u16>,
	#[clap(long = "database.data_dir")]
	database_data_dir: Option<String>,
	#[clap(long = "cache.default_ttl_seconds")]
	cache_default_ttl_seconds: Option<i64>,
}

impl Source for DbProxyOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();
		insert_command_line_option(
			&mut map,
			"database.port",
			&self.database_port.map(|port| port as i64),
		);
		insert_command_line_option(&mut map, "database.data_dir", &self.database_data_dir);
		insert_command_line_option(
			&mut map,
			"cache.default_ttl_seconds",
			&self.cache_default_ttl_seconds,
		);
		Ok(map)
	}
}

impl VfSettings for DbProxySettings {
	type CommandLineOptions = DbProxyOptions;

	fn set_defaults(
		builder: ConfigBuilder<DefaultState>,
	) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
		circuit_defaults(builder)?
			.set_default("database.port", 9850)?
			.set_default("database.data_dir", "./data/dbproxy")?
			.set_default("database.recovery_timeout_seconds", 30)?
			.set_default("cache.max_size", 10_000)?
			.set_default("cache.default_ttl_seconds", 60)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[test]
	fn defaults_deserialize_for_every_service() {
		StationSettings::load(None, StationOptions::default()).unwrap();
		ReceiverSettings::load(None, ReceiverOptions::default()).unwrap();
		BrokerSettings::load(None, BrokerOptions::default()).unwrap();
		CentralSettings::load(None, CentralOptions::default()).unwrap();
		DbProxySettings::load(None, DbProxyOptions::default()).unwrap();
	}

	#[test]
	fn command_line_options_override_defaults() {
		let opts = StationOptions::parse_from([
			"vf-station",
			"--station.id",
			"Station07",
			"--center.endpoint",
			"http://10.0.0.7:9820",
		]);
		let settings = StationSettings::load(None, opts).unwrap();
		assert_eq!(settings.station.id, "Station07");
		assert_eq!(settings.center.endpoint, "http://10.0.0.7:9820");
		// Untouched keys keep their defaults.
		assert_eq!(settings.station.retry_interval_seconds, 30);
	}

	#[test]
	fn broker_defaults_match_the_published_limits() {
		let settings = BrokerSettings::load(None, BrokerOptions::default()).unwrap();
		assert_eq!(settings.queue.max_size, 10_000);
		assert_eq!(settings.queue.retry_base_seconds, 30);
		assert_eq!(settings.queue.retry_max_seconds, 300);
		assert_eq!(settings.circuit.failure_threshold, 5);
		assert_eq!(settings.circuit.timeout_seconds, 60);
		assert_eq!(settings.circuit.success_threshold, 3);
	}

	#[test]
	fn settings_file_overrides_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("Receiver.toml");
		std::fs::write(
			&path,
			"[receiver]\nport = 19820\nuse_broker = true\n",
		)
		.unwrap();
		let settings =
			ReceiverSettings::load(Some(path.to_str().unwrap()), ReceiverOptions::default())
				.unwrap();
		assert_eq!(settings.receiver.port, 19820);
		assert!(settings.receiver.use_broker);
		assert_eq!(settings.central.endpoint, "http://127.0.0.1:9840");
	}
}
