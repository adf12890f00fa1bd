use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub game: GameConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Game economics. Decimal values are written as strings in the TOML file
/// so they never round-trip through binary floats.
#[derive(Debug, Deserialize, Clone)]
pub struct GameConfig {
    pub fee_rate: Decimal,
    pub min_trade: Decimal,
    pub base_price: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub api_base: String,
    pub ws_url: String,
    /// Topics subscribed on every (re)connect.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

fn default_topics() -> Vec<String> {
    vec![
        "ticks".to_string(),
        "rounds".to_string(),
        "trades".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Delay before the channel reconnects after a close.
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_delay_ms: u64,
    /// Countdown length used after a crash, before the next snapshot.
    #[serde(default = "default_countdown_s")]
    pub countdown_seconds: u64,
    /// How long the final crash multiplier stays on display.
    #[serde(default = "default_crash_display_ms")]
    pub crash_display_ms: u64,
    /// Retry interval while the round is in the Error state.
    #[serde(default = "default_error_retry_ms")]
    pub error_retry_ms: u64,
    /// Pause before the single retry after an auth-expiry response.
    #[serde(default = "default_auth_retry_ms")]
    pub auth_retry_delay_ms: u64,
    /// Local clock cadence driving the countdown and display timers.
    #[serde(default = "default_clock_ms")]
    pub clock_interval_ms: u64,
}

fn default_reconnect_ms() -> u64 {
    2_000
}
fn default_countdown_s() -> u64 {
    10
}
fn default_crash_display_ms() -> u64 {
    3_000
}
fn default_error_retry_ms() -> u64 {
    5_000
}
fn default_auth_retry_ms() -> u64 {
    500
}
fn default_clock_ms() -> u64 {
    250
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_ms(),
            countdown_seconds: default_countdown_s(),
            crash_display_ms: default_crash_display_ms(),
            error_retry_ms: default_error_retry_ms(),
            auth_retry_delay_ms: default_auth_retry_ms(),
            clock_interval_ms: default_clock_ms(),
        }
    }
}

impl TimingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
    pub fn crash_display(&self) -> Duration {
        Duration::from_millis(self.crash_display_ms)
    }
    pub fn error_retry(&self) -> Duration {
        Duration::from_millis(self.error_retry_ms)
    }
    pub fn auth_retry_delay(&self) -> Duration {
        Duration::from_millis(self.auth_retry_delay_ms)
    }
    pub fn clock_interval(&self) -> Duration {
        Duration::from_millis(self.clock_interval_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config TOML")?;
        Ok(config)
    }

    /// Session token comes from the environment; the engine never prompts.
    pub fn session_token() -> Option<String> {
        std::env::var("CRASHLINE_SESSION_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
        [game]
        fee_rate = "0.02"
        min_trade = "1"
        base_price = "0.1"

        [server]
        api_base = "https://game.example.com"
        ws_url = "wss://game.example.com/live"

        [timing]
        reconnect_delay_ms = 2000
    "#;

    #[test]
    fn test_config_parses() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.game.fee_rate, dec!(0.02));
        assert_eq!(config.game.min_trade, dec!(1));
        assert_eq!(config.game.base_price, dec!(0.1));
        assert_eq!(config.timing.reconnect_delay_ms, 2000);
        // unspecified timing fields fall back to defaults
        assert_eq!(config.timing.crash_display_ms, 3000);
        assert_eq!(config.server.topics, vec!["ticks", "rounds", "trades"]);
    }

    #[test]
    fn test_missing_game_section_is_an_error() {
        let result: Result<Config, _> =
            toml::from_str("[server]\napi_base = \"x\"\nws_url = \"y\"");
        assert!(result.is_err());
    }
}
