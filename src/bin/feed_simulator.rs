//! Feed Simulator - local stand-in for the upstream weather feed
//!
//! Serves a WebSocket endpoint that pushes mock readings for the five
//! default cities to every connected client, with a day/night temperature
//! curve plus noise.
//!
//! Usage:
//!   cargo run --bin feed_simulator
//!
//! Environment variables:
//!   SIMULATOR_PORT - Listen port (default: 8765)
//!   SIMULATOR_EVENTS_PER_SECOND - Messages per client per second (default: 20)

use chrono::{Timelike, Utc};
use dotenv::dotenv;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use rand::Rng;
use std::env;
use std::f64::consts::PI;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use weatherflow::streamer_core::FeedMessage;

struct CityClimate {
    name: &'static str,
    base_temp: f64,
    temp_range: f64,
    wind_base: f64,
}

const CITIES: [CityClimate; 5] = [
    CityClimate { name: "Berlin", base_temp: 15.0, temp_range: 25.0, wind_base: 12.0 },
    CityClimate { name: "NewYork", base_temp: 18.0, temp_range: 30.0, wind_base: 10.0 },
    CityClimate { name: "Tokyo", base_temp: 20.0, temp_range: 28.0, wind_base: 8.0 },
    CityClimate { name: "SaoPaulo", base_temp: 22.0, temp_range: 15.0, wind_base: 6.0 },
    CityClimate { name: "CapeTown", base_temp: 17.0, temp_range: 20.0, wind_base: 15.0 },
];

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// One mock reading for a random city, minute precision like the real feed
fn mock_message() -> FeedMessage {
    let mut rng = rand::thread_rng();
    let climate = &CITIES[rng.gen_range(0..CITIES.len())];
    let now = Utc::now();

    // Peaks at 18:00, bottoms out at 06:00
    let hour = now.hour() as f64;
    let time_of_day = 0.5 + 0.5 * ((hour - 6.0) * PI / 12.0).sin();
    let noise = rng.gen_range(0.8..1.2);

    FeedMessage {
        city: climate.name.to_string(),
        timestamp: now.format("%Y-%m-%dT%H:%M").to_string(),
        temperature: round1(climate.base_temp + climate.temp_range * time_of_day * noise),
        windspeed: Some(round1(climate.wind_base * rng.gen_range(0.5..1.3))),
        winddirection: Some(rng.gen_range(0..360) as f64),
    }
}

async fn serve_client(tcp: TcpStream, peer: SocketAddr, events_per_second: u64) {
    let ws = match accept_async(tcp).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("⚠️  Handshake with {} failed: {}", peer, e);
            return;
        }
    };

    info!("🟢 Client connected: {}", peer);

    let (mut write, mut read) = ws.split();
    let mut ticker = interval(Duration::from_micros(1_000_000 / events_per_second));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let payload = match serde_json::to_string(&mock_message()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("❌ Failed to encode mock reading: {}", e);
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::Text(payload)).await {
                    warn!("⚠️  Send to {} failed: {}", peer, e);
                    break;
                }
            }

            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("⚠️  Read from {} failed: {}", peer, e);
                    break;
                }
            },
        }
    }

    info!("🔴 Client disconnected: {}", peer);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let port: u16 = env::var("SIMULATOR_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8765);

    let events_per_second: u64 = env::var("SIMULATOR_EVENTS_PER_SECOND")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n: &u64| *n > 0)
        .unwrap_or(20);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    info!("🌍 Weather feed simulator running at ws://localhost:{}", port);
    info!("   └─ {} events/sec per client", events_per_second);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    tokio::spawn(serve_client(tcp, peer, events_per_second));
                }
                Err(e) => error!("❌ Accept failed: {}", e),
            },

            _ = tokio::signal::ctrl_c() => {
                info!("⚠️  Received CTRL+C, shutting down...");
                break;
            }
        }
    }

    Ok(())
}
