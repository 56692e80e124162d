//! Market ticker WebSocket.
//!
//! Binary frames carry packed tick structs; text frames carry JSON order
//! postbacks. Both are decoded here and funneled into the engine's command
//! channel. The task reconnects forever with a capped backoff and asks the
//! engine for a reconcile after every reconnect (postbacks may have been
//! missed while disconnected).

use crate::application::engine::{EngineCommand, EngineHandle};
use crate::domain::trading::types::Tick;
use crate::infrastructure::kite::types::WireOrder;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

pub struct KiteTicker {
    ws_url: String,
    api_key: String,
    access_token: String,
    tokens: Vec<u32>,
    tz_offset_min: i32,
    handle: EngineHandle,
}

#[derive(Debug, Deserialize)]
struct TextFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl KiteTicker {
    pub fn new(
        ws_url: String,
        api_key: String,
        access_token: String,
        tokens: Vec<u32>,
        tz_offset_min: i32,
        handle: EngineHandle,
    ) -> Self {
        Self { ws_url, api_key, access_token, tokens, tz_offset_min, handle }
    }

    pub async fn run(self) {
        let mut backoff_ms = 1_000u64;
        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("KiteTicker: stream closed cleanly, reconnecting");
                    backoff_ms = 1_000;
                }
                Err(e) => {
                    error!("KiteTicker: stream error: {}; reconnecting in {}ms", e, backoff_ms);
                    sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                }
            }
            // Whatever happened while we were away, resync with the broker
            self.handle.send(EngineCommand::Reconcile).await;
        }
    }

    async fn connect_and_stream(&self) -> anyhow::Result<()> {
        let url = Url::parse_with_params(
            &self.ws_url,
            &[
                ("api_key", self.api_key.as_str()),
                ("access_token", self.access_token.as_str()),
            ],
        )?;
        info!("KiteTicker: connecting");
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        // Subscribe and switch to LTP mode
        let subscribe = json!({ "a": "subscribe", "v": self.tokens });
        write.send(Message::Text(subscribe.to_string().into())).await?;
        let mode = json!({ "a": "mode", "v": ["ltp", self.tokens] });
        write.send(Message::Text(mode.to_string().into())).await?;
        info!("KiteTicker: subscribed to {} tokens", self.tokens.len());

        while let Some(message) = read.next().await {
            match message? {
                Message::Binary(payload) => {
                    for tick in parse_binary_ticks(&payload) {
                        self.handle.send(EngineCommand::Tick(tick)).await;
                    }
                }
                Message::Text(text) => self.handle_text_frame(&text).await,
                Message::Ping(payload) => {
                    write.send(Message::Pong(payload)).await?;
                }
                Message::Close(frame) => {
                    warn!("KiteTicker: close frame: {:?}", frame);
                    return Ok(());
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_text_frame(&self, text: &str) {
        let frame: TextFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                debug!("KiteTicker: unparseable text frame: {}", e);
                return;
            }
        };
        match frame.kind.as_str() {
            "order" => {
                let wire: WireOrder = match serde_json::from_value(frame.data) {
                    Ok(w) => w,
                    Err(e) => {
                        warn!("KiteTicker: bad order postback: {}", e);
                        return;
                    }
                };
                match wire.into_broker_order(self.tz_offset_min) {
                    Some(order) => {
                        self.handle.send(EngineCommand::OrderUpdate(order)).await;
                    }
                    None => debug!("KiteTicker: dropped postback with transient status"),
                }
            }
            "error" => error!("KiteTicker: broker error frame: {}", frame.data),
            _ => debug!("KiteTicker: ignoring {} frame", frame.kind),
        }
    }
}

/// Frame layout: u16 packet count, then per packet a u16 length and that
/// many bytes. The first 8 bytes of every packet are the instrument token
/// and the last traded price in paise, both big-endian.
pub fn parse_binary_ticks(payload: &[u8]) -> Vec<Tick> {
    let mut ticks = Vec::new();
    if payload.len() < 2 {
        return ticks; // heartbeat
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut offset = 2;
    for _ in 0..count {
        if payload.len() < offset + 2 {
            break;
        }
        let length = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        if payload.len() < offset + length || length < 8 {
            break;
        }
        let packet = &payload[offset..offset + length];
        offset += length;

        let token = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let ltp_paise = i32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let last_price = Decimal::new(ltp_paise as i64, 2);
        ticks.push(Tick {
            instrument_token: token,
            last_price,
            ts: chrono::Utc::now().timestamp_millis(),
        });
    }
    ticks
}
