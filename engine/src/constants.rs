use std::time::Duration;

// ======= Station =======

/// Cadence of the station's confirmation poll after an accepted dispatch.
pub const STATION_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Polls per dispatch before handing the record back to the retry sweep.
pub const STATION_STATUS_POLL_ATTEMPTS: u32 = 10;

// ======= Broker =======

/// Per-item deadline the dispatcher applies to a forward to the center.
pub const BROKER_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the dispatcher idles when its circuit is open or the queue is
/// empty before looking again.
pub const BROKER_DISPATCH_IDLE: Duration = Duration::from_secs(1);

// ======= DBProxy =======

pub const VOTE_STATE_CACHE_TTL: Duration = Duration::from_secs(30);
pub const CANDIDATES_CACHE_TTL: Duration = Duration::from_secs(300);
pub const TURNOUT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Cadence of the eager expired-entry sweep.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline carried by gateway-built queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

// ======= Shared =======

/// Deadline for remote calls made by the pipeline components.
pub const RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight work before giving up.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
