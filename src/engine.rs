//! The engine event loop.
//!
//! Single owner of the [`RoundStateMachine`] and [`PositionTracker`]. All
//! mutation happens on this task in response to channel events, command
//! requests, completed fetches, and a local clock, so the core needs no
//! locking. Snapshot fetches and trade submissions run as spawned tasks
//! reporting back over internal channels; a tick arriving while a trade is
//! outstanding is applied immediately.

use crate::channel::types::ChannelEvent;
use crate::config::Config;
use crate::error::EngineError;
use crate::execution::{RetryPolicy, TradeContext, TradeExecutor};
use crate::position::{Position, PositionTracker};
use crate::pricing::{self, Pool, TradeKind, TradeQuote};
use crate::round::{Action, Round, RoundStateMachine, RoundStatus, RoundTiming};
use crate::server::{GameApi, RoundSnapshot, TradeOutcome};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Chart backfill depth kept in the published state.
const PRICE_HISTORY_CAP: usize = 600;

/// Read-only view published over `watch` after every handled event.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub round_id: String,
    pub status: RoundStatus,
    pub multiplier: Decimal,
    pub remaining_seconds: u64,
    pub position: Option<Position>,
    pub balance: Decimal,
    pub round_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_crash_multiplier: Option<Decimal>,
    pub price_history: Vec<Decimal>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            round_id: String::new(),
            status: RoundStatus::Loading,
            multiplier: Decimal::ONE,
            remaining_seconds: 0,
            position: None,
            balance: Decimal::ZERO,
            round_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            connected: false,
            last_error: None,
            last_crash_multiplier: None,
            price_history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Buy { amount: Decimal },
    /// Sell specified by desired net payout, priced via the payout search.
    Sell { amount: Decimal },
    /// The wallet layer owns the balance; it pushes updates here so buy
    /// validation sees current funds.
    SyncBalance { balance: Decimal },
}

struct TradeResult {
    /// Round the trade was submitted against; a result landing after the
    /// round changed is stale and must not touch position or pool.
    round_id: String,
    quote: TradeQuote,
    prior_pool: Pool,
    result: Result<TradeOutcome, EngineError>,
}

pub struct Engine {
    machine: RoundStateMachine,
    positions: PositionTracker,
    executor: TradeExecutor,
    api: Arc<dyn GameApi>,
    config: Config,
    balance: Decimal,
    connected: bool,
    trade_error: Option<String>,
    trade_in_flight: bool,
    price_history: Vec<Decimal>,
    state_tx: watch::Sender<EngineState>,
    snapshot_tx: mpsc::Sender<Result<RoundSnapshot, EngineError>>,
    snapshot_rx: mpsc::Receiver<Result<RoundSnapshot, EngineError>>,
    trade_tx: mpsc::Sender<TradeResult>,
    trade_rx: mpsc::Receiver<TradeResult>,
}

impl Engine {
    pub fn new(
        api: Arc<dyn GameApi>,
        config: Config,
        state_tx: watch::Sender<EngineState>,
    ) -> Self {
        let timing = RoundTiming {
            countdown: Duration::from_secs(config.timing.countdown_seconds),
            crash_display: config.timing.crash_display(),
            error_retry: config.timing.error_retry(),
        };
        let executor = TradeExecutor::new(
            api.clone(),
            config.game.clone(),
            RetryPolicy::auth_once(config.timing.auth_retry_delay()),
        );
        let (snapshot_tx, snapshot_rx) = mpsc::channel(4);
        let (trade_tx, trade_rx) = mpsc::channel(4);
        Self {
            machine: RoundStateMachine::new(timing),
            positions: PositionTracker::new(),
            executor,
            api,
            config,
            balance: Decimal::ZERO,
            connected: false,
            trade_error: None,
            trade_in_flight: false,
            price_history: Vec::new(),
            state_tx,
            snapshot_tx,
            snapshot_rx,
            trade_tx,
            trade_rx,
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ChannelEvent>,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut clock = tokio::time::interval(self.config.timing.clock_interval());
        clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                Some(result) = self.snapshot_rx.recv() => self.handle_snapshot_result(result),
                Some(result) = self.trade_rx.recv() => self.handle_trade_result(result),
                Some(command) = commands.recv() => self.handle_command(command),
                _ = clock.tick() => {
                    let actions = self.machine.on_clock(Instant::now());
                    self.run_actions(actions);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("engine shutting down");
                        break;
                    }
                }
            }
            self.publish_state();
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.connected = true;
                // Exactly one authoritative refetch per (re)connection.
                if self.machine.begin_snapshot_refresh() {
                    self.spawn_snapshot_fetch();
                }
            }
            ChannelEvent::Disconnected(reason) => {
                tracing::warn!(reason = %reason, "channel disconnected");
                self.connected = false;
            }
            ChannelEvent::Tick(tick) => {
                if self.machine.apply_tick(&tick) {
                    self.push_history(tick.multiplier);
                }
            }
            ChannelEvent::Round(update) => {
                let actions = self.machine.apply_round_update(&update, Instant::now());
                self.run_actions(actions);
            }
            ChannelEvent::Crash { final_multiplier } => {
                let actions = self.machine.apply_crash(final_multiplier, Instant::now());
                self.run_actions(actions);
            }
            // Already published on the bus by the channel; nothing to do here.
            ChannelEvent::Trade(_) => {}
        }
    }

    fn handle_snapshot_result(&mut self, result: Result<RoundSnapshot, EngineError>) {
        match result {
            Ok(snap) => {
                let prior_id = self.machine.round().id.clone();
                let actions = self.machine.apply_snapshot(&snap, Instant::now());
                self.run_actions(actions);
                if self.machine.round().id != prior_id {
                    self.price_history = snap.price_history_decimals();
                    self.price_history.truncate(PRICE_HISTORY_CAP);
                }
            }
            Err(e) => {
                self.machine.snapshot_failed(e.to_string(), Instant::now());
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        if let EngineCommand::SyncBalance { balance } = command {
            self.balance = balance;
            return;
        }
        if self.trade_in_flight {
            self.trade_error = Some("a trade is already in flight".to_string());
            return;
        }
        let live = self.machine.round().price_multiplier;
        let ctx = TradeContext {
            status: self.machine.status(),
            balance: self.balance,
            has_position: self.positions.has_position(),
            position_value: self
                .positions
                .current()
                .map(|p| p.current_value(live))
                .unwrap_or(Decimal::ZERO),
        };
        let quoted = match command {
            EngineCommand::Buy { amount } => self
                .executor
                .validate_buy(amount, &ctx)
                .and_then(|_| pricing::quote_buy(self.machine.pool(), &self.config.game, amount)),
            EngineCommand::Sell { amount } => {
                self.executor.validate_sell(amount, &ctx).and_then(|_| {
                    pricing::quote_sell_for_payout(self.machine.pool(), &self.config.game, amount)
                })
            }
            EngineCommand::SyncBalance { .. } => return,
        };
        let quote = match quoted {
            Ok(q) => q,
            Err(e) => {
                // Validation failed locally: nothing was mutated.
                self.trade_error = Some(e.to_string());
                return;
            }
        };

        let prior_pool = self.machine.pool().clone();
        self.positions.apply_optimistic(&quote, live);
        self.machine.set_pool(quote.new_pool.clone());
        self.trade_error = None;
        self.trade_in_flight = true;

        let round_id = self.machine.round().id.clone();
        let executor = self.executor.clone();
        let trade_tx = self.trade_tx.clone();
        let submitted = quote.clone();
        tokio::spawn(async move {
            let result = match submitted.kind {
                TradeKind::Buy => executor.buy(submitted.gross_amount, &ctx).await,
                TradeKind::Sell => executor.sell(submitted.net_amount, &ctx).await,
            };
            let _ = trade_tx
                .send(TradeResult {
                    round_id,
                    quote: submitted,
                    prior_pool,
                    result,
                })
                .await;
        });
    }

    fn handle_trade_result(&mut self, outcome: TradeResult) {
        self.trade_in_flight = false;
        // The round moved on while the trade was in flight: its position was
        // already reset and its pool cleared, so neither the confirmation
        // nor a rollback may touch the new round's state.
        let stale = outcome.round_id != self.machine.round().id;
        match outcome.result {
            Ok(confirmed) => {
                if let Some(balance) = confirmed.new_balance {
                    self.balance = balance;
                }
                if stale {
                    tracing::debug!(
                        round = %outcome.round_id,
                        "trade confirmed for a superseded round, position discarded"
                    );
                } else {
                    self.positions.reconcile(confirmed.position);
                }
            }
            Err(e) => {
                if !stale {
                    // Revert the prediction and the pool it was quoted against.
                    self.positions.rollback_optimistic();
                    self.machine.set_pool(outcome.prior_pool);
                }
                tracing::warn!(error = %e, fee = %outcome.quote.fee, "trade rejected, prediction rolled back");
                self.trade_error = Some(e.to_string());
            }
        }
    }

    fn run_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::FetchSnapshot => self.spawn_snapshot_fetch(),
                Action::ResetPosition => {
                    self.positions.reset();
                    self.price_history.clear();
                }
            }
        }
    }

    fn spawn_snapshot_fetch(&self) {
        let api = self.api.clone();
        let tx = self.snapshot_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_snapshot().await;
            let _ = tx.send(result).await;
        });
    }

    fn push_history(&mut self, multiplier: Decimal) {
        if self.price_history.len() >= PRICE_HISTORY_CAP {
            self.price_history.remove(0);
        }
        self.price_history.push(multiplier);
    }

    fn publish_state(&self) {
        let round: &Round = self.machine.round();
        let active = round.status == RoundStatus::Active;
        let last_error = self
            .machine
            .error_message()
            .map(str::to_string)
            .or_else(|| self.trade_error.clone());
        let state = EngineState {
            round_id: round.id.clone(),
            status: round.status,
            multiplier: round.price_multiplier,
            remaining_seconds: self.machine.remaining_seconds(Instant::now()),
            position: self.positions.current().cloned(),
            balance: self.balance,
            round_pnl: self.positions.round_pnl(round.price_multiplier, active),
            unrealized_pnl: self.positions.unrealized_pnl(round.price_multiplier),
            connected: self.connected,
            last_error,
            last_crash_multiplier: self.machine.last_crash_multiplier(),
            price_history: self.price_history.clone(),
        };
        let _ = self.state_tx.send(state);
    }
}
