use super::{GameApi, RoundSnapshot, TradeOutcome, TradeRequest, TradeResponse};
use crate::error::EngineError;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::RwLock;

pub struct GameRest {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

impl GameRest {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(token),
        })
    }

    async fn bearer(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl GameApi for GameRest {
    async fn fetch_snapshot(&self) -> Result<RoundSnapshot, EngineError> {
        let resp = self
            .client
            .get(self.url("/api/round"))
            .send()
            .await
            .map_err(|e| EngineError::Transport(anyhow!(e).context("GET round failed")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api(format!(
                "snapshot fetch failed ({status}): {body}"
            )));
        }
        resp.json::<RoundSnapshot>()
            .await
            .map_err(|e| EngineError::Transport(anyhow!(e).context("malformed snapshot response")))
    }

    async fn submit_trade(&self, request: &TradeRequest) -> Result<TradeOutcome, EngineError> {
        let mut req = self.client.post(self.url("/api/trade")).json(request);
        if let Some(token) = self.bearer().await {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::Transport(anyhow!(e).context("trade request failed")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(EngineError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api(format!(
                "trade failed ({status}): {body}"
            )));
        }

        let parsed: TradeResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Transport(anyhow!(e).context("malformed trade response")))?;

        if !parsed.success {
            return Err(EngineError::Api(
                parsed.error.unwrap_or_else(|| "trade rejected".to_string()),
            ));
        }

        Ok(TradeOutcome {
            position: parsed.position.and_then(|p| p.to_position()),
            new_balance: parsed.new_balance.and_then(Decimal::from_f64),
        })
    }

    async fn refresh_session(&self) -> Result<(), EngineError> {
        let mut req = self.client.post(self.url("/api/session/refresh"));
        if let Some(token) = self.bearer().await {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::Transport(anyhow!(e).context("session refresh failed")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api(format!(
                "session refresh failed ({status}): {body}"
            )));
        }

        let session: SessionResponse = resp.json().await.map_err(|e| {
            EngineError::Transport(anyhow!(e).context("malformed session response"))
        })?;
        *self.token.write().await = Some(session.token);
        tracing::debug!("session credential refreshed");
        Ok(())
    }
}
