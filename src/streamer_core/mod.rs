pub mod config;
pub mod error_handler;
pub mod feed_message;
pub mod ws_client;

pub use config::RuntimeConfig;
pub use error_handler::FeedError;
pub use feed_message::FeedMessage;
pub use ws_client::WeatherFeedClient;
