//! Wire event shapes and their conversion into engine events.
//!
//! The server sends JSON objects tagged by a `type` field. Numbers arrive as
//! floats and are converted to `Decimal` at the boundary; anything that does
//! not convert cleanly is treated as a malformed message and skipped.

use crate::round::RoundStatus;
use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

/// One authoritative price update for an active round.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub round_id: String,
    pub multiplier: Decimal,
    pub tick_count: u64,
    pub timestamp_ms: i64,
}

/// Round lifecycle update.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundUpdate {
    pub id: String,
    pub status: RoundStatus,
    pub multiplier: Decimal,
}

/// Events delivered by the live channel to the engine loop.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Emitted once per physical connection, after (re)subscription.
    Connected,
    /// Emitted at most once per physical connection.
    Disconnected(String),
    Tick(PriceTick),
    Round(RoundUpdate),
    Crash { final_multiplier: Decimal },
    /// Informational broadcast of another player's trade. Does not affect
    /// the local position; carried opaquely for bus subscribers.
    Trade(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTick {
    round_id: String,
    multiplier: f64,
    tick_count: u64,
    #[serde(default)]
    timestamp_ms: i64,
}

#[derive(Debug, Deserialize)]
struct WireRoundMsg {
    round: WireRound,
}

#[derive(Debug, Deserialize)]
struct WireRound {
    id: String,
    status: String,
    #[serde(default = "default_multiplier")]
    multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCrash {
    final_multiplier: f64,
}

fn to_decimal(value: f64, field: &'static str) -> Result<Decimal> {
    Decimal::from_f64(value).with_context(|| format!("non-finite {field}: {value}"))
}

/// Parse one channel message. `Ok(None)` means a well-formed message of a
/// type this engine does not consume; `Err` means malformed (the channel
/// logs and continues either way).
pub fn parse_event(text: &str) -> Result<Option<ChannelEvent>> {
    let value: serde_json::Value =
        serde_json::from_str(text).context("message is not valid JSON")?;
    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .context("message has no type field")?;

    match msg_type {
        "tick" => {
            let raw: WireTick =
                serde_json::from_value(value.clone()).context("malformed tick")?;
            Ok(Some(ChannelEvent::Tick(PriceTick {
                round_id: raw.round_id,
                multiplier: to_decimal(raw.multiplier, "tick multiplier")?,
                tick_count: raw.tick_count,
                timestamp_ms: raw.timestamp_ms,
            })))
        }
        "round" => {
            let raw: WireRoundMsg =
                serde_json::from_value(value.clone()).context("malformed round update")?;
            // An unrecognized status is an anomaly, not a transition.
            let Some(status) = RoundStatus::from_wire(&raw.round.status) else {
                tracing::debug!(status = %raw.round.status, "round update with unknown status dropped");
                return Ok(None);
            };
            Ok(Some(ChannelEvent::Round(RoundUpdate {
                id: raw.round.id,
                status,
                multiplier: to_decimal(raw.round.multiplier, "round multiplier")?,
            })))
        }
        "crash" => {
            let raw: WireCrash =
                serde_json::from_value(value.clone()).context("malformed crash event")?;
            Ok(Some(ChannelEvent::Crash {
                final_multiplier: to_decimal(raw.final_multiplier, "crash multiplier")?,
            }))
        }
        "trade" => {
            let trade = value
                .get("trade")
                .cloned()
                .context("trade event without trade payload")?;
            Ok(Some(ChannelEvent::Trade(trade)))
        }
        _ => Ok(None),
    }
}
