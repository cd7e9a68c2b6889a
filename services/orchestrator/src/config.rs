use std::time::Duration;

use anyhow::Result;

use crate::store::PgStoreConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub scheduler_interval: Duration,
    pub event_poll_interval: Duration,
    pub janitor_interval: Duration,
    pub node_heartbeat_timeout: Duration,
    pub database: PgStoreConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let scheduler_interval = duration_env("FLEET_SCHEDULER_INTERVAL_SECS", 5)?;
        let event_poll_interval = duration_env("FLEET_EVENT_POLL_INTERVAL_SECS", 1)?;
        let janitor_interval = duration_env("FLEET_JANITOR_INTERVAL_SECS", 30)?;
        let node_heartbeat_timeout = duration_env("FLEET_NODE_HEARTBEAT_TIMEOUT_SECS", 600)?;

        let database = PgStoreConfig::from_env();

        Ok(Self {
            log_level,
            dev_mode,
            scheduler_interval,
            event_poll_interval,
            janitor_interval,
            node_heartbeat_timeout,
            database,
        })
    }
}

fn duration_env(name: &str, default_secs: u64) -> Result<Duration> {
    let secs = match std::env::var(name) {
        Ok(value) => value.parse()?,
        Err(_) => default_secs,
    };
    Ok(Duration::from_secs(secs))
}
