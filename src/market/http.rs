//! HTTP quote provider.
//!
//! Talks to a REST quote service (`GET /v1/quote?symbol=...`) and maps
//! its payload into a `MarketSnapshot`. Handles retry with exponential
//! backoff on rate-limit / server errors and paces every outbound call
//! through the shared `CallPacer`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CallPacer, MarketDataError, MarketDataSource};
use crate::types::MarketSnapshot;

/// Maximum retries on rate limit / server errors.
const MAX_RETRIES: u32 = 2;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 500;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    symbol: String,
    price: f64,
    #[serde(default)]
    previous_close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    pe_ratio: Option<f64>,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    week_52_high: Option<f64>,
    #[serde(default)]
    week_52_low: Option<f64>,
    #[serde(default)]
    sector: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct HttpQuoteSource {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    pacer: CallPacer,
}

impl HttpQuoteSource {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        min_call_interval: Duration,
    ) -> Result<Self, MarketDataError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent("QUORUM/0.1.0")
            .build()
            .map_err(|e| MarketDataError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            pacer: CallPacer::new(min_call_interval),
        })
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteResponse, MarketDataError> {
        let url = format!(
            "{}/v1/quote?symbol={}",
            self.base_url,
            urlencoding::encode(symbol),
        );

        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, symbol, "Retrying quote fetch");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            self.pacer.pace().await;

            let mut request = self.http.get(&url);
            if let Some(key) = &self.api_key {
                request = request.header("x-api-key", key.expose_secret());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<QuoteResponse>()
                            .await
                            .map_err(|e| MarketDataError::Malformed(e.to_string()));
                    }

                    // Retryable: 429 (rate limit) and 5xx
                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        warn!(status = %status, attempt, symbol, "Retryable quote provider error");
                        last_error = format!("HTTP {status}");
                        continue;
                    }

                    // 404 and other client errors mean the symbol has no quote
                    return Err(MarketDataError::Unavailable {
                        symbol: symbol.to_string(),
                        reason: format!("HTTP {status}"),
                    });
                }
                Err(e) => {
                    warn!(attempt, symbol, error = %e, "Quote request failed");
                    last_error = e.to_string();
                    continue;
                }
            }
        }

        Err(MarketDataError::Unavailable {
            symbol: symbol.to_string(),
            reason: format!("exhausted retries: {last_error}"),
        })
    }

    /// One-line human-readable summary for backend prompts.
    fn summarize(quote: &QuoteResponse) -> String {
        let mut parts = vec![format!(
            "{} ({}): ${:.2}",
            quote.symbol,
            quote.name.as_deref().unwrap_or("unknown"),
            quote.price,
        )];

        if let Some(prev) = quote.previous_close {
            if prev > 0.0 {
                let change = (quote.price - prev) / prev * 100.0;
                parts.push(format!("{change:+.2}% vs prev close"));
            }
        }
        if let Some(vol) = quote.volume {
            parts.push(format!("vol {vol:.0}"));
        }
        if let Some(pe) = quote.pe_ratio {
            parts.push(format!("P/E {pe:.1}"));
        }
        if let (Some(hi), Some(lo)) = (quote.week_52_high, quote.week_52_low) {
            parts.push(format!("52w range {lo:.2}-{hi:.2}"));
        }

        parts.join(" | ")
    }
}

#[async_trait]
impl MarketDataSource for HttpQuoteSource {
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        let quote = self.fetch_quote(symbol).await?;
        if !quote.price.is_finite() || quote.price <= 0.0 {
            return Err(MarketDataError::Malformed(format!(
                "non-positive price {} for {symbol}",
                quote.price,
            )));
        }
        Ok(quote.price)
    }

    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, MarketDataError> {
        let quote = self.fetch_quote(symbol).await?;
        if !quote.price.is_finite() || quote.price <= 0.0 {
            return Err(MarketDataError::Malformed(format!(
                "non-positive price {} for {symbol}",
                quote.price,
            )));
        }

        let summary = Self::summarize(&quote);
        let raw = serde_json::json!({
            "symbol": quote.symbol,
            "price": quote.price,
            "previous_close": quote.previous_close,
            "volume": quote.volume,
            "pe_ratio": quote.pe_ratio,
            "market_cap": quote.market_cap,
            "week_52_high": quote.week_52_high,
            "week_52_low": quote.week_52_low,
            "sector": quote.sector,
            "name": quote.name,
        });

        Ok(MarketSnapshot {
            symbol: quote.symbol,
            price: quote.price,
            previous_close: quote.previous_close,
            volume: quote.volume,
            pe_ratio: quote.pe_ratio,
            market_cap: quote.market_cap,
            week52_high: quote.week_52_high,
            week52_low: quote.week_52_low,
            sector: quote.sector,
            summary,
            raw,
            fetched_at: Utc::now(),
        })
    }

    fn name(&self) -> &str {
        "http-quote"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
