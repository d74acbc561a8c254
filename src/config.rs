//! Configuration types.

use std::time::Duration;

/// Core configuration for the sync service.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Interval between heartbeat frames on live channels.
    pub heartbeat_interval: Duration,
    /// Grace period after a run reaches a terminal phase before it is reaped.
    pub reap_grace: Duration,
    /// Interval between reap sweeps.
    pub reap_interval: Duration,
    /// Maximum number of entries retained in a run's event log (oldest dropped).
    pub event_log_cap: usize,
    /// Minimum length of a proof string for the Completion Heuristic.
    pub min_proof_len: usize,
    /// Buffered capacity of a live delivery channel.
    pub channel_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            port: 5001,
            heartbeat_interval: Duration::from_secs(15),
            reap_grace: Duration::from_secs(300), // 5 minutes
            reap_interval: Duration::from_secs(60),
            event_log_cap: 500,
            min_proof_len: 12,
            channel_capacity: 64,
        }
    }
}

impl CoreConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env_parse("ONBOARD_SYNC_PORT", defaults.port);
        let heartbeat_interval = Duration::from_secs(env_parse(
            "ONBOARD_SYNC_HEARTBEAT_SECS",
            defaults.heartbeat_interval.as_secs(),
        ));
        let reap_grace = Duration::from_secs(env_parse(
            "ONBOARD_SYNC_REAP_GRACE_SECS",
            defaults.reap_grace.as_secs(),
        ));
        let reap_interval = Duration::from_secs(env_parse(
            "ONBOARD_SYNC_REAP_INTERVAL_SECS",
            defaults.reap_interval.as_secs(),
        ));
        let event_log_cap = env_parse("ONBOARD_SYNC_EVENT_LOG_CAP", defaults.event_log_cap);
        let min_proof_len = env_parse("ONBOARD_SYNC_MIN_PROOF_LEN", defaults.min_proof_len);
        let channel_capacity =
            env_parse("ONBOARD_SYNC_CHANNEL_CAPACITY", defaults.channel_capacity);

        Self {
            port,
            heartbeat_interval,
            reap_grace,
            reap_interval,
            event_log_cap,
            min_proof_len,
            channel_capacity,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
