// =============================================================================
// Connection Supervisor — one multiplexed WebSocket for the whole universe
// =============================================================================
//
// A single combined-stream connection carries every symbol's aggTrade,
// markPrice@1s, and kline subscriptions. The supervisor owns the socket:
// decoded events are pushed onto the engine's channel, reconnects use
// exponential backoff with a cap, and a unilateral ping keeps the link warm.
//
// The tick loop acts as the stale-feed watchdog: when no frame has arrived
// within the stale timeout it requests a forced close (code 4000) through
// `FeedHealth`; the supervisor honors the request at its next timer tick and
// reconnects.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, SymbolSpec};
use crate::market_data::event::{parse_frame, parse_market_event, DecodeError, MarketEvent};

/// USD-M futures combined-stream endpoint.
const FSTREAM_BASE: &str = "wss://fstream.binance.com";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// FeedHealth
// ---------------------------------------------------------------------------

/// Shared feed health handle: the supervisor writes, the tick loop and the
/// renderer read, the watchdog and shutdown path raise request flags.
#[derive(Debug)]
pub struct FeedHealth {
    last_message_at: AtomicI64,
    connected: AtomicBool,
    attempts: AtomicU32,
    reconnect_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self {
            last_message_at: AtomicI64::new(0),
            connected: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            reconnect_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    pub fn stamp(&self, now: i64) {
        self.last_message_at.store(now, Ordering::Relaxed);
    }

    pub fn last_message_at(&self) -> i64 {
        self.last_message_at.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// True when the feed is connected but has been silent past `timeout_ms`.
    pub fn is_stale(&self, now: i64, timeout_ms: u64) -> bool {
        let last = self.last_message_at();
        self.is_connected() && last > 0 && now - last > timeout_ms as i64
    }

    /// Ask the supervisor to force-close (code 4000) and reconnect.
    pub fn request_reconnect(&self) {
        self.reconnect_requested.store(true, Ordering::Relaxed);
    }

    fn take_reconnect_request(&self) -> bool {
        self.reconnect_requested.swap(false, Ordering::Relaxed)
    }

    /// Ask the supervisor to close gracefully (code 1000) and exit.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    pub fn set_error(&self, msg: impl Into<String>) {
        *self.last_error.write() = Some(msg.into());
    }

    pub fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// URL + backoff helpers
// ---------------------------------------------------------------------------

/// Build the combined-stream URL covering every symbol's three subscriptions.
pub fn stream_url(base: &str, specs: &[SymbolSpec], interval: &str) -> String {
    let mut streams = Vec::with_capacity(specs.len() * 3);
    for spec in specs {
        let lower = spec.market_lower();
        streams.push(format!("{lower}@aggTrade"));
        streams.push(format!("{lower}@markPrice@1s"));
        streams.push(format!("{lower}@kline_{interval}"));
    }
    format!("{base}/stream?streams={}", streams.join("/"))
}

/// Reconnect delay: `min(base * 2^attempt, max)`.
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

// ---------------------------------------------------------------------------
// Supervisor loop
// ---------------------------------------------------------------------------

/// Run the feed supervisor until shutdown is requested or the engine's event
/// channel closes.
pub async fn run_feed(cfg: EngineConfig, tx: mpsc::Sender<MarketEvent>, health: Arc<FeedHealth>) {
    let url = stream_url(FSTREAM_BASE, &cfg.symbols, &cfg.history_interval);
    let mut attempt: u32 = 0;

    loop {
        if health.shutdown_requested() {
            info!("feed supervisor exiting (shutdown requested)");
            return;
        }

        info!(url = %url, attempt, "connecting market data stream");
        match connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                attempt = 0;
                health.attempts.store(0, Ordering::Relaxed);
                health.set_connected(true);
                health.clear_error();
                health.stamp(now_ms());
                info!("market data stream connected");

                let session = run_session(&cfg, ws_stream, &tx, &health).await;
                health.set_connected(false);

                match session {
                    SessionEnd::Shutdown => {
                        info!("feed supervisor exiting (socket closed 1000)");
                        return;
                    }
                    SessionEnd::EngineGone => {
                        warn!("engine event channel closed — feed supervisor exiting");
                        return;
                    }
                    SessionEnd::Reconnect => {}
                }
            }
            Err(e) => {
                error!(error = %e, "market data stream connect failed");
                health.set_error(format!("ws connect: {e}"));
            }
        }

        let delay = backoff_delay(cfg.reconnect_base_ms, cfg.reconnect_max_ms, attempt);
        attempt = attempt.saturating_add(1);
        health.attempts.store(attempt, Ordering::Relaxed);
        debug!(delay_ms = delay.as_millis() as u64, attempt, "reconnect backoff");
        tokio::time::sleep(delay).await;
    }
}

enum SessionEnd {
    Reconnect,
    Shutdown,
    EngineGone,
}

/// Drive one connected session: forward frames, answer pings, send heartbeat
/// pings, honor reconnect/shutdown requests.
async fn run_session(
    cfg: &EngineConfig,
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tx: &mpsc::Sender<MarketEvent>,
    health: &FeedHealth,
) -> SessionEnd {
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval(Duration::from_millis(cfg.ws_ping_interval_ms));
    // Short control cadence so reconnect/shutdown requests are honored
    // promptly, independent of the ping interval.
    let mut control = tokio::time::interval(Duration::from_millis(500));
    // The first interval tick fires immediately; skip it.
    ping.tick().await;
    control.tick().await;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(msg)) => {
                    health.stamp(now_ms());
                    match msg {
                        Message::Text(text) => {
                            if let Some(end) = forward_decoded(parse_market_event(&text), tx, health).await {
                                return end;
                            }
                        }
                        Message::Binary(bytes) => {
                            if let Some(end) = forward_decoded(parse_frame(&bytes), tx, health).await {
                                return end;
                            }
                        }
                        Message::Ping(payload) => {
                            if write.send(Message::Pong(payload)).await.is_err() {
                                return SessionEnd::Reconnect;
                            }
                        }
                        Message::Pong(_) => {}
                        Message::Close(frame) => {
                            warn!(frame = ?frame, "server closed market data stream");
                            return SessionEnd::Reconnect;
                        }
                        Message::Frame(_) => {}
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "market data stream read error");
                    health.set_error(format!("ws read: {e}"));
                    return SessionEnd::Reconnect;
                }
                None => {
                    warn!("market data stream ended");
                    return SessionEnd::Reconnect;
                }
            },
            _ = control.tick() => {
                if health.shutdown_requested() {
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "shutdown".into(),
                        })))
                        .await;
                    return SessionEnd::Shutdown;
                }
                if health.take_reconnect_request() {
                    warn!("stale feed — forcing close (4000)");
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(4000),
                            reason: "stale feed".into(),
                        })))
                        .await;
                    return SessionEnd::Reconnect;
                }
            }
            _ = ping.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    return SessionEnd::Reconnect;
                }
            }
        }
    }
}

/// Push a decode result toward the engine. Returns `Some` when the session
/// must end (engine channel closed).
async fn forward_decoded(
    decoded: Result<Option<MarketEvent>, DecodeError>,
    tx: &mpsc::Sender<MarketEvent>,
    health: &FeedHealth,
) -> Option<SessionEnd> {
    match decoded {
        Ok(Some(event)) => {
            if tx.send(event).await.is_err() {
                return Some(SessionEnd::EngineGone);
            }
        }
        Ok(None) => {}
        Err(DecodeError::Venue { code, msg }) => {
            warn!(code, msg = %msg, "venue error on market data stream");
            health.set_error(format!("stream error {code}: {msg}"));
        }
        Err(DecodeError::Malformed(msg)) => {
            warn!(error = %msg, "undecodable frame dropped");
        }
    }
    None
}
