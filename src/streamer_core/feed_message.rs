//! Wire format of the inbound weather feed
//!
//! One JSON object per WebSocket message:
//! `{"city": "Berlin", "timestamp": "2025-06-29T14:30", "temperature": 21.4,
//!   "windspeed": 12.0, "winddirection": 240.0}`

use super::error_handler::FeedError;
use crate::pipeline::types::Reading;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offset-less layouts the feed is known to emit; all read as UTC
const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMessage {
    pub city: String,
    pub timestamp: String,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windspeed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winddirection: Option<f64>,
}

impl FeedMessage {
    pub fn into_reading(self) -> Result<Reading, FeedError> {
        let city = self.city.trim();
        if city.is_empty() {
            return Err(FeedError::InvalidMessage("empty city".to_string()));
        }

        let timestamp = parse_feed_timestamp(&self.timestamp)?;

        Ok(Reading::new(city, timestamp, self.temperature))
    }
}

/// Decode one raw feed message into a reading
pub fn decode(raw: &str) -> Result<Reading, FeedError> {
    let message: FeedMessage = serde_json::from_str(raw)?;
    message.into_reading()
}

pub fn parse_feed_timestamp(raw: &str) -> Result<DateTime<Utc>, FeedError> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| FeedError::Timestamp(raw.to_string()))
}
