use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Reconnection delay policy for the feed
///
/// Every attempt waits the same delay and there is no attempt cap: the feed
/// is expected to come back eventually.
#[derive(Debug)]
pub struct FixedBackoff {
    delay: Duration,
    current_attempt: u32,
}

impl FixedBackoff {
    pub fn new(delay_secs: u64) -> Self {
        Self {
            delay: Duration::from_secs(delay_secs),
            current_attempt: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub async fn sleep(&mut self) {
        self.current_attempt = self.current_attempt.saturating_add(1);

        log::warn!(
            "⏳ Reconnect attempt {} in {}s",
            self.current_attempt,
            self.delay.as_secs()
        );

        sleep(self.delay).await;
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
