//! Trade submission with local validation and a bounded auth retry.
//!
//! The executor never mutates the position itself: confirmed outcomes flow
//! back to the caller, which hands them to `PositionTracker::reconcile`.

use crate::config::GameConfig;
use crate::error::EngineError;
use crate::round::RoundStatus;
use crate::server::{GameApi, TradeOutcome, TradeRequest};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Retry budget for auth-expiry responses. Explicit, not a hidden closure:
/// one transparent retry with a freshly obtained credential, then the
/// failure surfaces. No other failure class is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn auth_once(delay: Duration) -> Self {
        Self {
            max_attempts: 1,
            delay,
        }
    }
}

/// Read-only snapshot of engine state a trade is validated against.
#[derive(Debug, Clone, Copy)]
pub struct TradeContext {
    pub status: RoundStatus,
    pub balance: Decimal,
    pub has_position: bool,
    /// Current value of the position at the live multiplier; the most a
    /// sell can pay out.
    pub position_value: Decimal,
}

#[derive(Clone)]
pub struct TradeExecutor {
    api: Arc<dyn GameApi>,
    params: GameConfig,
    retry: RetryPolicy,
}

impl TradeExecutor {
    pub fn new(api: Arc<dyn GameApi>, params: GameConfig, retry: RetryPolicy) -> Self {
        Self { api, params, retry }
    }

    /// Pre-round wagers are allowed: buys validate during Countdown too.
    pub fn validate_buy(&self, amount: Decimal, ctx: &TradeContext) -> Result<(), EngineError> {
        if amount < self.params.min_trade {
            return Err(EngineError::BelowMinimum {
                amount,
                min: self.params.min_trade,
            });
        }
        if !matches!(ctx.status, RoundStatus::Active | RoundStatus::Countdown) {
            return Err(EngineError::RoundNotOpen {
                action: "buy",
                status: ctx.status.as_str(),
            });
        }
        if amount > ctx.balance {
            return Err(EngineError::InsufficientBalance {
                needed: amount,
                available: ctx.balance,
            });
        }
        Ok(())
    }

    pub fn validate_sell(&self, amount: Decimal, ctx: &TradeContext) -> Result<(), EngineError> {
        if amount < self.params.min_trade {
            return Err(EngineError::BelowMinimum {
                amount,
                min: self.params.min_trade,
            });
        }
        if ctx.status != RoundStatus::Active {
            return Err(EngineError::RoundNotOpen {
                action: "sell",
                status: ctx.status.as_str(),
            });
        }
        if !ctx.has_position {
            return Err(EngineError::NoPosition);
        }
        if amount > ctx.position_value {
            return Err(EngineError::InsufficientBalance {
                needed: amount,
                available: ctx.position_value,
            });
        }
        Ok(())
    }

    pub async fn buy(
        &self,
        amount: Decimal,
        ctx: &TradeContext,
    ) -> Result<TradeOutcome, EngineError> {
        self.validate_buy(amount, ctx)?;
        tracing::info!(amount = %amount, "submitting buy");
        self.submit(TradeRequest::buy(amount)).await
    }

    pub async fn sell(
        &self,
        amount: Decimal,
        ctx: &TradeContext,
    ) -> Result<TradeOutcome, EngineError> {
        self.validate_sell(amount, ctx)?;
        tracing::info!(amount = %amount, "submitting sell");
        self.submit(TradeRequest::sell(amount)).await
    }

    async fn submit(&self, request: TradeRequest) -> Result<TradeOutcome, EngineError> {
        let mut auth_retries_left = self.retry.max_attempts;
        loop {
            match self.api.submit_trade(&request).await {
                Err(EngineError::AuthExpired) if auth_retries_left > 0 => {
                    auth_retries_left -= 1;
                    tracing::warn!(
                        kind = request.kind,
                        "session expired, refreshing credential and retrying once"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                    self.api.refresh_session().await?;
                }
                Ok(outcome) => {
                    tracing::info!(kind = request.kind, amount = %request.amount, "trade confirmed");
                    return Ok(outcome);
                }
                Err(e) => {
                    tracing::warn!(kind = request.kind, error = %e, "trade failed");
                    return Err(e);
                }
            }
        }
    }
}
