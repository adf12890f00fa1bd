use anyhow::Result;
use crashline::channel::{EventBus, LiveChannel};
use crashline::config::Config;
use crashline::engine::{Engine, EngineCommand, EngineState};
use crashline::server::rest::GameRest;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};

/// `buy <amount>` / `sell <amount>` / `balance <amount>` on stdin.
fn parse_command(line: &str) -> Option<EngineCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?;
    let amount: Decimal = parts.next()?.parse().ok()?;
    match verb {
        "buy" => Some(EngineCommand::Buy { amount }),
        "sell" => Some(EngineCommand::Sell { amount }),
        "balance" => Some(EngineCommand::SyncBalance { balance: amount }),
        _ => None,
    }
}

async fn read_commands(tx: mpsc::Sender<EngineCommand>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(cmd) => {
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
            None => {
                tracing::warn!(input = %line, "unrecognized command (buy/sell/balance <amount>)");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crashline=info".into()),
        )
        .init();

    let config = Config::load(Path::new("config.toml"))?;
    let session_token = Config::session_token();
    if session_token.is_none() {
        tracing::warn!("no session token set, running read-only (set CRASHLINE_SESSION_TOKEN)");
    }

    let api = Arc::new(GameRest::new(
        &config.server.api_base,
        session_token.clone(),
    )?);
    let bus = EventBus::new();
    let channel = LiveChannel::new(
        &config.server.ws_url,
        config.server.topics.clone(),
        session_token,
        config.timing.reconnect_delay(),
        bus.clone(),
    );

    let (state_tx, mut state_rx) = watch::channel(EngineState::default());
    let (event_tx, event_rx) = mpsc::channel(512);
    let (command_tx, command_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(read_commands(command_tx));

    let channel_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = channel.run(event_tx, channel_shutdown).await {
            tracing::error!("live channel task failed: {e:#}");
        }
    });

    let engine = Engine::new(api, config, state_tx);
    let engine_task = tokio::spawn(engine.run(event_rx, command_rx, shutdown_rx));

    // Log round transitions until interrupted.
    let mut last_status = None;
    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow().clone();
                if last_status != Some(state.status) {
                    tracing::info!(
                        round = %state.round_id,
                        status = state.status.as_str(),
                        multiplier = %state.multiplier,
                        connected = state.connected,
                        "round state"
                    );
                    last_status = Some(state.status);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_command() {
        assert!(matches!(
            parse_command("buy 10"),
            Some(EngineCommand::Buy { amount }) if amount == dec!(10)
        ));
        assert!(matches!(
            parse_command("sell 4.5"),
            Some(EngineCommand::Sell { amount }) if amount == dec!(4.5)
        ));
        assert!(matches!(
            parse_command("balance 250"),
            Some(EngineCommand::SyncBalance { balance }) if balance == dec!(250)
        ));
        assert!(parse_command("hodl 10").is_none());
        assert!(parse_command("buy").is_none());
        assert!(parse_command("buy ten").is_none());
    }
}
