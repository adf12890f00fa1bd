//! Reconnecting live channel.
//!
//! Owns the WebSocket connection lifecycle: subscribe to the fixed topic set
//! on every (re)connect, re-announce identity when a session token is
//! present, reconnect after a fixed delay on close, and never crash the
//! caller on a malformed message. Parsed events go to the engine over an
//! mpsc; every named wire event is also published on the [`EventBus`] so
//! decoupled subsystems (chat, rewards, referrals) can listen without the
//! core knowing about them.

pub mod types;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use types::{parse_event, ChannelEvent};

/// How many recent trade-broadcast ids are remembered for deduplication.
const TRADE_DEDUP_WINDOW: usize = 256;

/// Typed publish/subscribe fanout keyed by event name. The core only
/// publishes; subscribers register by name and receive raw JSON payloads.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_type: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        topics
            .entry(event_type.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    pub fn publish(&self, event_type: &str, payload: serde_json::Value) {
        let topics = self.topics.lock().expect("event bus lock poisoned");
        if let Some(sender) = topics.get(event_type) {
            // No receivers is fine; lagging receivers drop old events.
            let _ = sender.send(payload);
        }
    }
}

/// Bounded window of recently seen ids, for duplicate-delivery tolerance.
#[derive(Debug, Default)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    /// Returns false if the id was already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= TRADE_DEDUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

pub struct LiveChannel {
    ws_url: String,
    topics: Vec<String>,
    session_token: Option<String>,
    reconnect_delay: Duration,
    bus: EventBus,
}

impl LiveChannel {
    pub fn new(
        ws_url: &str,
        topics: Vec<String>,
        session_token: Option<String>,
        reconnect_delay: Duration,
        bus: EventBus,
    ) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            topics,
            session_token,
            reconnect_delay,
            bus,
        }
    }

    /// Connect and run the channel until `shutdown` flips. Sends events on
    /// `tx`; reconnects after a fixed delay on every close or error.
    pub async fn run(
        &self,
        tx: mpsc::Sender<ChannelEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut seen_trades = RecentIds::default();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let reason = match self
                .connect_and_listen(&tx, &mut shutdown, &mut seen_trades)
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::warn!("live channel closed, reconnecting...");
                    "connection closed".to_string()
                }
                Err(e) => {
                    tracing::error!(
                        "live channel error: {:#}, reconnecting in {:?}",
                        e,
                        self.reconnect_delay
                    );
                    format!("{e:#}")
                }
            };
            // One Disconnected per physical connection, regardless of how
            // many close frames the server managed to send.
            let _ = tx.send(ChannelEvent::Disconnected(reason)).await;

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One connection's lifetime. Returns Ok(true) when shutdown was
    /// requested, Ok(false) on a server-side close.
    async fn connect_and_listen(
        &self,
        tx: &mpsc::Sender<ChannelEvent>,
        shutdown: &mut watch::Receiver<bool>,
        seen_trades: &mut RecentIds,
    ) -> Result<bool> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.ws_url.as_str())
            .await
            .context("WS connection failed")?;
        let (mut write, mut read) = ws_stream.split();
        tracing::debug!(url = %self.ws_url, "live channel connected");

        // (Re)subscribe and re-announce identity before reporting Connected,
        // so the engine's snapshot refetch races nothing.
        let sub = serde_json::json!({
            "cmd": "subscribe",
            "topics": self.topics,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("WS subscribe failed")?;

        if let Some(token) = &self.session_token {
            let identify = serde_json::json!({
                "cmd": "identify",
                "token": token,
            });
            write
                .send(Message::Text(identify.to_string()))
                .await
                .context("WS identify failed")?;
        }
        tracing::debug!(topics = self.topics.len(), "subscribed");

        let _ = tx.send(ChannelEvent::Connected).await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(false) };
                    match msg.context("WS read error")? {
                        Message::Text(text) => {
                            self.handle_message(&text, tx, seen_trades).await;
                        }
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Message::Close(_) => {
                            tracing::debug!("live channel received close frame");
                            return Ok(false);
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(true);
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        text: &str,
        tx: &mpsc::Sender<ChannelEvent>,
        seen_trades: &mut RecentIds,
    ) {
        let event = match parse_event(text) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::trace!("unhandled channel message type");
                return;
            }
            Err(e) => {
                tracing::warn!("channel message parse error: {:#}", e);
                return;
            }
        };

        // Trade broadcasts can arrive more than once; drop repeats by id.
        if let ChannelEvent::Trade(trade) = &event {
            if let Some(id) = trade.get("id").and_then(|v| v.as_str()) {
                if !seen_trades.insert(id) {
                    tracing::trace!(id, "duplicate trade broadcast dropped");
                    return;
                }
            }
        }

        self.publish_to_bus(&event);
        let _ = tx.send(event).await;
    }

    /// Named fanout for external subsystems; payloads mirror the wire shape.
    fn publish_to_bus(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Trade(trade) => self.bus.publish("trade", trade.clone()),
            ChannelEvent::Crash { final_multiplier } => self.bus.publish(
                "crash",
                serde_json::json!({ "finalMultiplier": final_multiplier.to_string() }),
            ),
            ChannelEvent::Round(update) => self.bus.publish(
                "round",
                serde_json::json!({
                    "id": update.id,
                    "status": update.status.as_str(),
                    "multiplier": update.multiplier.to_string(),
                }),
            ),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_ids_dedup() {
        let mut ids = RecentIds::default();
        assert!(ids.insert("t1"));
        assert!(!ids.insert("t1"));
        assert!(ids.insert("t2"));
    }

    #[test]
    fn test_recent_ids_window_evicts_oldest() {
        let mut ids = RecentIds::default();
        for i in 0..TRADE_DEDUP_WINDOW {
            assert!(ids.insert(&format!("t{i}")));
        }
        assert!(ids.insert("overflow"));
        // t0 was evicted, so it reads as new again
        assert!(ids.insert("t0"));
        // a recent one is still remembered
        assert!(!ids.insert("overflow"));
    }

    #[tokio::test]
    async fn test_event_bus_fanout() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("trade");
        let mut rx_b = bus.subscribe("trade");

        bus.publish("trade", serde_json::json!({"id": "t1"}));
        assert_eq!(rx_a.recv().await.unwrap()["id"], "t1");
        assert_eq!(rx_b.recv().await.unwrap()["id"], "t1");
    }

    #[test]
    fn test_event_bus_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("referral", serde_json::json!({}));
    }
}
