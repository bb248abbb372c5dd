use std::env;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub feed_url: String,
    pub reconnect_delay_secs: u64,
    pub benchmark: bool,
    pub rust_log: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let feed_url =
            env::var("WEATHER_FEED_URL").unwrap_or_else(|_| "ws://localhost:8765".to_string());

        validate_feed_url(&feed_url)?;

        let reconnect_delay_secs = match env::var("FEED_RECONNECT_DELAY_SECS") {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "FEED_RECONNECT_DELAY_SECS must be a whole number of seconds, got '{}'",
                    raw
                ))
            })?,
            Err(_) => 5,
        };

        let benchmark = env::var("FEED_BENCHMARK")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            .parse::<bool>()
            .unwrap_or(false);

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            feed_url,
            reconnect_delay_secs,
            benchmark,
            rust_log,
        })
    }
}

fn validate_feed_url(url: &str) -> Result<(), ConfigError> {
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(ConfigError::InvalidValue(
            "WEATHER_FEED_URL must start with ws:// or wss://".to_string(),
        ));
    }

    Ok(())
}
