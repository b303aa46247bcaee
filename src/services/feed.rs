//! Binance trade-stream adapter
//! -----------------------------------------------------------------
//! ‣ one WebSocket session at a time; SUBSCRIBE / UNSUBSCRIBE follow the
//!   `FeedCommand`s issued by the tick buffer's handler ref-count
//! ‣ every `trade` frame becomes a `DispatchEvent::Tick`
//! ‣ every server ping triggers an opportunistic clock probe
//! ‣ on drop: exponential backoff, bounded attempts, then
//!   `FeedState::Unavailable` (the scheduler keeps firing regardless)
//! -----------------------------------------------------------------

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tungstenite::Message;

use crate::services::clock::ClockSynchronizer;
use crate::services::market_data::RawTick;
use crate::services::pipeline::DispatchEvent;
use crate::services::tick_buffer::FeedCommand;
use crate::utils::errors::{ApiError, FeedError};
use crate::utils::signature::verify_hmac_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum FeedState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Unavailable,
}

/* ─────────────────────────────────────────  Security toggle ────── */

/// Per-feed verification; default is `None` (public stream, unsigned).
#[derive(Debug, Clone, Default)]
pub enum FeedSecurity {
    #[default]
    None,
    /// HMAC SHA-256 (hex) carried in a top-level JSON field. The digest
    /// covers the frame re-serialised without that field (sorted keys).
    Hmac { field: String, secret: String },
}

impl FeedSecurity {
    /// Reads the shared secret from the env-var named in settings.
    pub fn from_env(secret_env: Option<&str>) -> Self {
        match secret_env {
            None => FeedSecurity::None,
            Some(var) => match std::env::var(var) {
                Ok(secret) if !secret.is_empty() => FeedSecurity::Hmac {
                    field: "sig".into(),
                    secret,
                },
                _ => {
                    log::warn!("feed: {var} is not set; accepting unsigned frames");
                    FeedSecurity::None
                }
            },
        }
    }
}

/// `true` = accept frame, `false` = drop + `warn!`.
pub fn frame_ok(sec: &FeedSecurity, text: &str) -> bool {
    let FeedSecurity::Hmac { field, secret } = sec else {
        return true;
    };
    let Ok(mut value) = serde_json::from_str::<Value>(text) else {
        log::warn!("feed frame is not JSON; cannot verify ({field})");
        return false;
    };
    let sig = value
        .as_object_mut()
        .and_then(|o| o.remove(field.as_str()))
        .and_then(|v| v.as_str().map(str::to_owned));
    let Some(sig_hex) = sig else {
        log::warn!("feed frame missing signature field ({field})");
        return false;
    };
    let Ok(body) = serde_json::to_vec(&value) else {
        return false;
    };
    if verify_hmac_bytes(&body, secret, &sig_hex) {
        true
    } else {
        log::warn!("feed frame failed HMAC check ({field})");
        false
    }
}

/* ─────────────────────────────────────────  Binance structs ─ */

#[derive(Debug, Deserialize)]
struct TradeEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// `/ws` delivers bare events, `/stream` wraps them in `{stream, data}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Frame {
    Wrapped { data: TradeEvent },
    Bare(TradeEvent),
}

/// Anything other than a well-formed trade (acks, other event types,
/// unparsable numbers) yields `None`.
pub fn parse_trade(text: &str) -> Option<RawTick> {
    let ev = match serde_json::from_str::<Frame>(text).ok()? {
        Frame::Wrapped { data } => data,
        Frame::Bare(ev) => ev,
    };
    if ev.event != "trade" {
        return None;
    }
    let price = ev.price.parse::<f64>().ok().filter(|p| p.is_finite())?;
    Some(RawTick {
        symbol: ev.symbol.to_uppercase(),
        price,
        timestamp: Some(ev.trade_time),
        volume: ev.quantity.parse::<f64>().ok(),
    })
}

pub fn subscription_frame(method: &str, symbols: &[String], id: u64) -> String {
    let params: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_lowercase()))
        .collect();
    json!({ "method": method, "params": params, "id": id }).to_string()
}

/// `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub security: FeedSecurity,
}

enum SessionEnd {
    /// Socket closed or failed; reconnect
    Dropped,
    /// Command or tick channel closed; stop for good
    Shutdown,
}

pub struct BinanceFeed {
    cfg: FeedConfig,
    clock: Arc<ClockSynchronizer>,
    out: UnboundedSender<DispatchEvent>,
    commands: UnboundedReceiver<FeedCommand>,
    state: watch::Sender<FeedState>,
    subscribed: BTreeSet<String>,
    attempt: u32,
    next_request_id: u64,
}

impl BinanceFeed {
    pub fn new(
        cfg: FeedConfig,
        clock: Arc<ClockSynchronizer>,
        out: UnboundedSender<DispatchEvent>,
        commands: UnboundedReceiver<FeedCommand>,
    ) -> (Self, watch::Receiver<FeedState>) {
        let (state, state_rx) = watch::channel(FeedState::Connecting);
        let feed = Self {
            cfg,
            clock,
            out,
            commands,
            state,
            subscribed: BTreeSet::new(),
            attempt: 0,
            next_request_id: 1,
        };
        (feed, state_rx)
    }

    /// Runs until shut down (`Ok`) or out of reconnect attempts.
    pub async fn run(mut self) -> Result<(), FeedError> {
        loop {
            match self.session().await {
                Ok(SessionEnd::Shutdown) => {
                    log::info!("feed: shutting down");
                    return Ok(());
                }
                Ok(SessionEnd::Dropped) => log::warn!("feed: connection closed by peer"),
                Err(e) => log::warn!("feed: connection error: {e}"),
            }

            self.attempt += 1;
            if self.attempt > self.cfg.max_retries {
                self.set_state(FeedState::Unavailable);
                log::error!("feed: giving up after {} attempts", self.cfg.max_retries);
                return Err(FeedError::Unavailable {
                    attempts: self.cfg.max_retries,
                });
            }
            let delay = backoff_delay(
                self.attempt - 1,
                self.cfg.backoff_base_ms,
                self.cfg.backoff_max_ms,
            );
            self.set_state(FeedState::Reconnecting {
                attempt: self.attempt,
            });
            tracing::info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "feed reconnect scheduled");
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(&mut self) -> Result<SessionEnd, ApiError> {
        if self.attempt == 0 {
            self.set_state(FeedState::Connecting);
        }
        let (ws, _) = connect_async(self.cfg.url.as_str()).await?;
        self.attempt = 0;
        self.set_state(FeedState::Connected);
        log::info!("feed: connected to {}", self.cfg.url);

        let (mut sink, mut stream) = ws.split();
        if !self.subscribed.is_empty() {
            let symbols: Vec<String> = self.subscribed.iter().cloned().collect();
            let frame = subscription_frame("SUBSCRIBE", &symbols, self.request_id());
            sink.send(Message::Text(frame.into())).await?;
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = sink.close().await;
                        return Ok(SessionEnd::Shutdown);
                    };
                    if let Some(frame) = self.apply_command(cmd) {
                        sink.send(Message::Text(frame.into())).await?;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(txt))) => {
                        if !self.on_text(&txt) {
                            let _ = sink.close().await;
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    // tungstenite answers the pong itself
                    Some(Ok(Message::Ping(_))) => self.clock.on_heartbeat(),
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    /// Returns the frame to send, if the subscription set changed.
    fn apply_command(&mut self, cmd: FeedCommand) -> Option<String> {
        let (method, symbol) = match cmd {
            FeedCommand::Subscribe(s) => {
                if !self.subscribed.insert(s.clone()) {
                    return None;
                }
                ("SUBSCRIBE", s)
            }
            FeedCommand::Unsubscribe(s) => {
                if !self.subscribed.remove(&s) {
                    return None;
                }
                ("UNSUBSCRIBE", s)
            }
        };
        log::info!("feed: {method} {symbol}");
        Some(subscription_frame(method, &[symbol], self.request_id()))
    }

    /// `false` once nobody consumes ticks any more.
    fn on_text(&self, txt: &str) -> bool {
        if !frame_ok(&self.cfg.security, txt) {
            return true;
        }
        match parse_trade(txt) {
            Some(tick) => self.out.send(DispatchEvent::Tick(tick)).is_ok(),
            None => {
                log::trace!("feed: ignoring frame {txt}");
                true
            }
        }
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn set_state(&self, state: FeedState) {
        self.state.send_replace(state);
    }
}
