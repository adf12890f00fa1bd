//! Player position tracking: optimistic trade application, authoritative
//! reconciliation, and derived PnL.
//!
//! The tracker is the sole owner of the [`Position`]. Optimistic updates are
//! predictions layered over the last confirmed state; reconciliation always
//! wins and discards any pending prediction.

use crate::pricing::{TradeKind, TradeQuote};
use rust_decimal::Decimal;

/// The player's wagered position for the current round.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Value currently at risk, measured at entry.
    pub wagered: Decimal,
    /// Multiplier at which the wager entered (weighted across buys).
    pub entry_multiplier: Decimal,
    /// Gross amount paid in across the round.
    pub total_in: Decimal,
    /// Net amount taken out across the round.
    pub total_out: Decimal,
}

impl Position {
    /// Value of the position at the given live multiplier.
    pub fn current_value(&self, multiplier: Decimal) -> Decimal {
        if self.entry_multiplier.is_zero() {
            return Decimal::ZERO;
        }
        self.wagered * (multiplier / self.entry_multiplier)
    }

    pub fn unrealized_pnl(&self, multiplier: Decimal) -> Decimal {
        self.current_value(multiplier) - self.wagered
    }
}

#[derive(Debug, Default)]
pub struct PositionTracker {
    confirmed: Option<Position>,
    /// Pending prediction from a submitted-but-unconfirmed trade. The outer
    /// Option is "is a prediction pending", the inner is the predicted
    /// position (None = predicted full exit).
    optimistic: Option<Option<Position>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The position as the player currently sees it (prediction first).
    pub fn current(&self) -> Option<&Position> {
        match &self.optimistic {
            Some(predicted) => predicted.as_ref(),
            None => self.confirmed.as_ref(),
        }
    }

    pub fn has_position(&self) -> bool {
        self.current().is_some()
    }

    /// Immediately reflect a submitted trade's predicted effect, ahead of
    /// server confirmation. `live_multiplier` is the multiplier published by
    /// the round state machine at submit time.
    pub fn apply_optimistic(&mut self, quote: &TradeQuote, live_multiplier: Decimal) {
        let base = self.current().cloned();
        let predicted = match quote.kind {
            TradeKind::Buy => Some(apply_buy(base, quote)),
            TradeKind::Sell => apply_sell(base, quote, live_multiplier),
        };
        self.optimistic = Some(predicted);
    }

    /// Authoritative update: replaces or clears both the confirmed state and
    /// any pending prediction.
    pub fn reconcile(&mut self, server: Option<Position>) {
        self.confirmed = server;
        self.optimistic = None;
    }

    /// Drop a pending prediction (e.g. the trade was rejected), reverting to
    /// the last confirmed state.
    pub fn rollback_optimistic(&mut self) {
        self.optimistic = None;
    }

    /// Clear everything. Called on every round-id change, on crash, and on
    /// wallet disconnect; a stale cross-round position must never leak into
    /// PnL display.
    pub fn reset(&mut self) {
        self.confirmed = None;
        self.optimistic = None;
    }

    /// Profit/loss for the round at the given live multiplier. Frozen at
    /// zero whenever the round is not active, even if a position still
    /// exists transiently during a transition.
    pub fn round_pnl(&self, live_multiplier: Decimal, round_active: bool) -> Decimal {
        if !round_active {
            return Decimal::ZERO;
        }
        match self.current() {
            Some(pos) => (pos.total_out + pos.current_value(live_multiplier)) - pos.total_in,
            None => Decimal::ZERO,
        }
    }

    pub fn unrealized_pnl(&self, live_multiplier: Decimal) -> Decimal {
        self.current()
            .map(|p| p.unrealized_pnl(live_multiplier))
            .unwrap_or(Decimal::ZERO)
    }
}

fn apply_buy(base: Option<Position>, quote: &TradeQuote) -> Position {
    match base {
        None => Position {
            wagered: quote.net_amount,
            entry_multiplier: quote.resulting_multiplier,
            total_in: quote.gross_amount,
            total_out: Decimal::ZERO,
        },
        Some(pos) => {
            // Weighted entry so current_value stays the sum of both lots:
            // value = m * sum(w_i / e_i) => combined e = W / sum(w_i / e_i).
            let units = pos.wagered / pos.entry_multiplier
                + quote.net_amount / quote.resulting_multiplier;
            let wagered = pos.wagered + quote.net_amount;
            Position {
                wagered,
                entry_multiplier: if units.is_zero() {
                    quote.resulting_multiplier
                } else {
                    wagered / units
                },
                total_in: pos.total_in + quote.gross_amount,
                total_out: pos.total_out,
            }
        }
    }
}

fn apply_sell(
    base: Option<Position>,
    quote: &TradeQuote,
    live_multiplier: Decimal,
) -> Option<Position> {
    let pos = base?;
    // Value leaving the pool maps back to entry-basis wager.
    let basis_out = if live_multiplier.is_zero() {
        pos.wagered
    } else {
        quote.gross_amount * pos.entry_multiplier / live_multiplier
    };
    let wagered = pos.wagered - basis_out;
    if wagered <= Decimal::ZERO {
        return None;
    }
    Some(Position {
        wagered,
        entry_multiplier: pos.entry_multiplier,
        total_in: pos.total_in,
        total_out: pos.total_out + quote.net_amount,
    })
}
