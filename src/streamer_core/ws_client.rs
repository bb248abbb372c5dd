//! WebSocket client for the upstream weather feed
//!
//! One session task owns the socket. It decodes every message into a reading
//! and hands it to the ingestion buffer. When the connection drops it sleeps
//! the fixed reconnect delay and dials again, forever, until `disconnect()`
//! flips the shutdown channel.

use super::config::RuntimeConfig;
use super::error_handler::{FeedError, FixedBackoff};
use super::feed_message::decode;
use crate::pipeline::ingestion::IngestionBuffer;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BENCHMARK_INTERVAL: Duration = Duration::from_secs(10);

/// How a session ended
enum SessionEnd {
    Shutdown,
    Lost,
}

/// Everything the session task needs, cloned out of the client
#[derive(Clone)]
struct FeedContext {
    url: String,
    reconnect_delay_secs: u64,
    benchmark: bool,
    buffer: IngestionBuffer,
    connected: Arc<AtomicBool>,
}

pub struct WeatherFeedClient {
    ctx: FeedContext,
    shutdown_tx: watch::Sender<bool>,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl WeatherFeedClient {
    pub fn new(config: &RuntimeConfig, buffer: IngestionBuffer) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            ctx: FeedContext {
                url: config.feed_url.clone(),
                reconnect_delay_secs: config.reconnect_delay_secs,
                benchmark: config.benchmark,
                buffer,
                connected: Arc::new(AtomicBool::new(false)),
            },
            shutdown_tx,
            session: Mutex::new(None),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True while a session is open; false while dialing or waiting to redial
    pub fn is_connected(&self) -> bool {
        self.ctx.connected.load(Ordering::SeqCst)
    }

    /// Open the feed
    ///
    /// `Ok` means a session is open. Resolves once the handshake succeeds or
    /// fails; on failure the error is returned and the reconnect loop keeps
    /// trying in the background. Calling again while that loop runs returns
    /// [`FeedError::Connection`] until a session is back.
    pub async fn connect(&self) -> Result<(), FeedError> {
        if self
            .lock_session()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            if self.is_connected() {
                log::warn!("⚠️  Feed client already connected");
                return Ok(());
            }

            log::warn!("⚠️  Feed client is reconnecting in the background");
            return Err(FeedError::Connection(format!(
                "reconnect to {} in progress",
                self.ctx.url
            )));
        }

        self.shutdown_tx.send_replace(false);

        log::info!("🔗 Connecting to weather feed at {}", self.ctx.url);

        let (initial, result) = match connect_async(self.ctx.url.as_str()).await {
            Ok((stream, response)) => {
                log::info!("✅ Connected to weather feed (status {})", response.status());
                self.ctx.connected.store(true, Ordering::SeqCst);
                (Some(stream), Ok(()))
            }
            Err(e) => {
                log::error!("❌ Feed connection failed: {}", e);
                (None, Err(FeedError::from(e)))
            }
        };

        let ctx = self.ctx.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *self.lock_session() = Some(tokio::spawn(run_feed(ctx, initial, shutdown_rx)));

        result
    }

    /// Close the feed, then force a final flush of everything buffered
    pub async fn disconnect(&self) {
        log::info!("🛑 Disconnecting from weather feed");

        self.shutdown_tx.send_replace(true);

        let session = self.lock_session().take();
        if let Some(handle) = session {
            if let Err(e) = handle.await {
                log::error!("❌ Feed session task failed: {}", e);
            }
        }

        self.ctx.connected.store(false, Ordering::SeqCst);
        self.ctx.buffer.flush_all().await;

        log::info!("✅ Weather feed disconnected");
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        // Sender gone counts as shutdown
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_feed(
    ctx: FeedContext,
    initial: Option<FeedStream>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = FixedBackoff::new(ctx.reconnect_delay_secs);
    let mut stream = initial;

    loop {
        if let Some(ws) = stream.take() {
            backoff.reset();
            ctx.connected.store(true, Ordering::SeqCst);
            let end = run_session(ws, &ctx, &mut shutdown_rx).await;
            ctx.connected.store(false, Ordering::SeqCst);

            if let SessionEnd::Shutdown = end {
                return;
            }
        }

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => return,
            _ = backoff.sleep() => {}
        }

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => return,
            result = connect_async(ctx.url.as_str()) => match result {
                Ok((ws, _)) => {
                    log::info!("✅ Reconnected to weather feed after {} attempts", backoff.attempts());
                    stream = Some(ws);
                }
                Err(e) => {
                    log::error!("❌ Reconnect failed: {}", e);
                }
            },
        }
    }
}

async fn run_session(
    ws: FeedStream,
    ctx: &FeedContext,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let mut benchmark_ticker = interval_at(Instant::now() + BENCHMARK_INTERVAL, BENCHMARK_INTERVAL);
    let mut events_since_tick: u64 = 0;

    loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown_rx) => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    log::debug!("Close frame not delivered: {}", e);
                }
                return SessionEnd::Shutdown;
            }

            _ = benchmark_ticker.tick() => {
                if ctx.benchmark {
                    let per_sec = events_since_tick as f64 / BENCHMARK_INTERVAL.as_secs_f64();
                    log::info!("📈 Feed throughput: {:.1} events/sec", per_sec);
                }
                events_since_tick = 0;
            }

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if handle_payload(&text, ctx) {
                        events_since_tick += 1;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if handle_payload(text, ctx) {
                            events_since_tick += 1;
                        }
                    }
                    Err(e) => log::warn!("⚠️  Dropping non UTF-8 feed message: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    log::warn!("⚠️  Feed closed by server: {:?}", frame);
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("❌ Feed transport error: {}", e);
                    return SessionEnd::Lost;
                }
                None => {
                    log::warn!("⚠️  Feed stream ended");
                    return SessionEnd::Lost;
                }
            },
        }
    }
}

/// Decode and record one message; returns whether a reading was accepted
fn handle_payload(text: &str, ctx: &FeedContext) -> bool {
    match decode(text) {
        Ok(reading) => {
            ctx.buffer.record(reading);
            true
        }
        Err(e) => {
            log::warn!("⚠️  Dropping malformed feed message: {}", e);
            false
        }
    }
}
