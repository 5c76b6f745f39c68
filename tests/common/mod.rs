//! Shared fixtures for integration tests.
//!
//! Provides deterministic `ModelBackend` and `MarketDataSource`
//! implementations — all in-memory, fully controllable from test
//! code, no external dependencies.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use quorum::backends::{AnalysisRequest, BackendError, ModelBackend};
use quorum::config::AppConfig;
use quorum::market::{MarketDataError, MarketDataSource};
use quorum::types::{
    Direction, FactorAssessment, Interpretation, MarketSnapshot, ModelTier, Pick, PickStatus,
    Timeframe,
};

/// A deterministic backend that always produces the same opinion, or
/// always fails, depending on how the test wires it.
pub struct ScriptedBackend {
    pub id: String,
    pub tier: ModelTier,
    pub direction: Direction,
    pub confidence: f64,
    pub cited_factor: Option<String>,
    pub fail: bool,
}

impl ScriptedBackend {
    pub fn succeeding(id: &str, tier: ModelTier, direction: Direction, confidence: f64) -> Self {
        Self {
            id: id.to_string(),
            tier,
            direction,
            confidence,
            cited_factor: Some("pe_ratio".to_string()),
            fail: false,
        }
    }

    pub fn failing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tier: ModelTier::Medium,
            direction: Direction::Hold,
            confidence: 0.0,
            cited_factor: None,
            fail: true,
        }
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Pick, BackendError> {
        if self.fail {
            return Err(BackendError::Parse("scripted failure".to_string()));
        }

        let entry = request.snapshot.price;
        let (target, stop) = match self.direction {
            Direction::Down => (entry * 0.90, entry * 1.05),
            _ => (entry * 1.10, entry * 0.95),
        };

        let factor_assessments = self
            .cited_factor
            .iter()
            .map(|factor| FactorAssessment {
                factor_id: factor.clone(),
                factor_name: factor.clone(),
                observed_value: "scripted".to_string(),
                interpretation: Interpretation::Bullish,
                confidence: self.confidence,
                reasoning: String::new(),
            })
            .collect();

        let now = Utc::now();
        Ok(Pick {
            id: uuid::Uuid::new_v4().to_string(),
            backend_id: self.id.clone(),
            symbol: request.symbol.clone(),
            sector: request.sector.clone(),
            direction: self.direction,
            confidence: self.confidence,
            timeframe: Timeframe::OneMonth,
            entry_price: entry,
            target_price: target,
            stop_loss: stop,
            thesis: format!("{} scripted thesis", self.id),
            full_reasoning: String::new(),
            factor_assessments,
            bullish_factors: vec!["scripted".to_string()],
            bearish_factors: vec![],
            risks: vec![],
            catalysts: vec![],
            status: PickStatus::Pending,
            created_at: now,
            expires_at: now + Timeframe::OneMonth.horizon(),
            closed_at: None,
            closed_price: None,
            actual_return: None,
            hit_target: false,
            hit_stop_loss: false,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> ModelTier {
        self.tier
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(500)
    }
}

/// Market source backed by a mutable price map, so tests can move the
/// market between sweeps.
pub struct ScriptedMarket {
    prices: Mutex<HashMap<String, f64>>,
}

impl ScriptedMarket {
    pub fn new(prices: &[(&str, f64)]) -> Self {
        Self {
            prices: Mutex::new(
                prices
                    .iter()
                    .map(|(symbol, price)| (symbol.to_string(), *price))
                    .collect(),
            ),
        }
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices
            .lock()
            .unwrap()
            .insert(symbol.to_string(), price);
    }

    /// Simulate a provider outage for one symbol.
    pub fn prices_remove(&self, symbol: &str) {
        self.prices.lock().unwrap().remove(symbol);
    }
}

#[async_trait]
impl MarketDataSource for ScriptedMarket {
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| MarketDataError::Unavailable {
                symbol: symbol.to_string(),
                reason: "no scripted quote".to_string(),
            })
    }

    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, MarketDataError> {
        let price = self.current_price(symbol).await?;
        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            previous_close: Some(price),
            volume: Some(1_000_000.0),
            pe_ratio: Some(25.0),
            market_cap: None,
            week52_high: None,
            week52_low: None,
            sector: Some("Technology".to_string()),
            summary: format!("{symbol}: ${price:.2} | P/E 25.0"),
            raw: serde_json::Value::Null,
            fetched_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Minimal config for wiring an `Engine` in tests.
pub fn test_config() -> AppConfig {
    toml::from_str(
        r#"
[service]
name = "QUORUM-TEST"
resolve_interval_secs = 3600
calibration_interval_secs = 86400
database_path = ":memory:"

[server]
enabled = false
port = 0

[market_data]
base_url = "http://localhost"
min_call_interval_ms = 0

[backends.claude]
enabled = true
provider = "anthropic"
tier = "large"
model = "claude-sonnet-4-20250514"
api_key_env = "ANTHROPIC_API_KEY"
timeout_secs = 45
"#,
    )
    .expect("static test config parses")
}
