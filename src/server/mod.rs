//! Remote authority interface: snapshot fetch, trade submission, session
//! refresh. [`GameApi`] is the seam the engine and executor depend on;
//! [`rest::GameRest`] is the production implementation.

pub mod rest;

use crate::error::EngineError;
use crate::position::Position;
use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Authoritative round snapshot from the request/response API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub id: String,
    pub status: String,
    pub multiplier: f64,
    #[serde(default)]
    pub countdown_seconds: Option<u64>,
    /// Chart backfill for a mid-round join; no effect on pool or position.
    #[serde(default)]
    pub price_history: Option<Vec<f64>>,
}

impl RoundSnapshot {
    pub fn multiplier_decimal(&self) -> Decimal {
        Decimal::from_f64(self.multiplier).unwrap_or(Decimal::ONE)
    }

    pub fn price_history_decimals(&self) -> Vec<Decimal> {
        self.price_history
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|v| Decimal::from_f64(*v))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRequest {
    pub kind: &'static str,
    pub amount: Decimal,
}

impl TradeRequest {
    pub fn buy(amount: Decimal) -> Self {
        Self {
            kind: "buy",
            amount,
        }
    }

    pub fn sell(amount: Decimal) -> Self {
        Self {
            kind: "sell",
            amount,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub position: Option<WirePosition>,
    #[serde(default)]
    pub new_balance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    pub wagered: f64,
    pub entry_multiplier: f64,
    pub total_in: f64,
    pub total_out: f64,
}

impl WirePosition {
    pub fn to_position(&self) -> Option<Position> {
        Some(Position {
            wagered: Decimal::from_f64(self.wagered)?,
            entry_multiplier: Decimal::from_f64(self.entry_multiplier)?,
            total_in: Decimal::from_f64(self.total_in)?,
            total_out: Decimal::from_f64(self.total_out)?,
        })
    }
}

/// Confirmed result of a trade submission.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub position: Option<Position>,
    pub new_balance: Option<Decimal>,
}

#[async_trait]
pub trait GameApi: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<RoundSnapshot, EngineError>;
    async fn submit_trade(&self, request: &TradeRequest) -> Result<TradeOutcome, EngineError>;
    /// Obtain a fresh session credential (used by the executor's single
    /// retry after an auth-expiry response).
    async fn refresh_session(&self) -> Result<(), EngineError>;
}
