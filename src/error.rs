//! Engine error taxonomy.
//!
//! Validation failures are detected locally before any network call and
//! returned synchronously with no state mutated. Transport and API errors
//! come back from the remote authority; `AuthExpired` is the one class the
//! executor retries (exactly once, with a fresh credential).

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Trade amount below the configured minimum.
    #[error("trade amount {amount} is below the minimum {min}")]
    BelowMinimum { amount: Decimal, min: Decimal },

    /// Buy larger than the available balance.
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    /// Sell against an empty pool.
    #[error("no liquidity")]
    NoLiquidity,

    /// Sell with no active position.
    #[error("no active position to sell")]
    NoPosition,

    /// Trade attempted outside the phases that allow it.
    #[error("round is not open for {action} (status: {status})")]
    RoundNotOpen {
        action: &'static str,
        status: &'static str,
    },

    /// Session credential rejected by the server (401-equivalent).
    #[error("session expired")]
    AuthExpired,

    /// Non-success response from the remote authority, surfaced verbatim.
    #[error("server rejected request: {0}")]
    Api(String),

    /// Connection-level failure (request never completed).
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl EngineError {
    /// Validation errors never leave the local process and mutate no state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::BelowMinimum { .. }
                | EngineError::InsufficientBalance { .. }
                | EngineError::NoLiquidity
                | EngineError::NoPosition
                | EngineError::RoundNotOpen { .. }
        )
    }
}
