//! Anthropic Claude backend.
//!
//! Implements the `ModelBackend` trait using the Anthropic Messages API.
//! Handles prompt construction, response parsing, cost tracking, and
//! rate limiting with exponential backoff.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{build_user_prompt, pick_from_response, system_prompt, AnalysisRequest, BackendError, ModelBackend};
use crate::types::{ModelTier, Pick};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Maximum retries on rate limit / server errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 1000;

/// Approximate cost per 1K input tokens (Sonnet).
const INPUT_COST_PER_1K: f64 = 0.003;
/// Approximate cost per 1K output tokens (Sonnet).
const OUTPUT_COST_PER_1K: f64 = 0.015;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AnthropicBackend {
    id: String,
    http: Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    tier: ModelTier,
    timeout: Duration,
    total_cost: std::sync::atomic::AtomicU64, // stored as cost * 1_000_000
    total_calls: std::sync::atomic::AtomicU64,
}

impl AnthropicBackend {
    pub fn new(
        id: String,
        api_key: SecretString,
        model: String,
        max_tokens: u32,
        tier: ModelTier,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            id,
            http,
            api_key,
            model,
            max_tokens,
            tier,
            timeout,
            total_cost: std::sync::atomic::AtomicU64::new(0),
            total_calls: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Send a messages request with retry + backoff. Returns the
    /// response text and the call's estimated cost.
    async fn call_api(&self, system: &str, user_message: &str) -> Result<(String, f64), BackendError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user".to_string(),
                content: user_message.to_string(),
            }],
            system: Some(system.to_string()),
        };

        let mut last_error = BackendError::Transport("no attempt made".to_string());

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying Anthropic API call");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: MessagesResponse = response
                            .json()
                            .await
                            .map_err(|e| BackendError::Parse(e.to_string()))?;

                        let text = body
                            .content
                            .iter()
                            .filter_map(|b| b.text.as_deref())
                            .collect::<Vec<_>>()
                            .join("");

                        let usage = body.usage.unwrap_or(Usage {
                            input_tokens: 0,
                            output_tokens: 0,
                        });
                        let cost = (usage.input_tokens as f64 / 1000.0) * INPUT_COST_PER_1K
                            + (usage.output_tokens as f64 / 1000.0) * OUTPUT_COST_PER_1K;

                        let cost_micro = (cost * 1_000_000.0) as u64;
                        self.total_cost
                            .fetch_add(cost_micro, std::sync::atomic::Ordering::Relaxed);
                        self.total_calls
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                        return Ok((text, cost));
                    }

                    // Retryable errors: 429 (rate limit), 500+, 529 (overloaded)
                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, error = %error_text, "Retryable Anthropic API error");
                        last_error = BackendError::Api {
                            status: status.as_u16(),
                            message: error_text,
                        };
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    return Err(BackendError::Api {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }
                Err(e) => {
                    if e.is_timeout() {
                        warn!(attempt, "Anthropic request timed out");
                        last_error = BackendError::Timeout(self.timeout);
                    } else {
                        warn!(attempt, error = %e, "Anthropic request failed");
                        last_error = BackendError::Transport(e.to_string());
                    }
                    continue;
                }
            }
        }

        Err(last_error)
    }

    /// Total cumulative cost across all calls.
    pub fn cumulative_cost(&self) -> f64 {
        self.total_cost.load(std::sync::atomic::Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Total number of successful API calls made.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ModelBackend implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ModelBackend for AnthropicBackend {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Pick, BackendError> {
        let system = system_prompt();
        let user_msg = build_user_prompt(request);

        debug!(
            symbol = %request.symbol,
            model = %self.model,
            calibrated = request.calibration.is_some(),
            "Requesting pick from Claude"
        );

        let (response_text, cost) = self.call_api(system, &user_msg).await?;
        let pick = pick_from_response(self.id(), request, &response_text)?;

        info!(
            symbol = %request.symbol,
            direction = %pick.direction,
            confidence = format!("{:.0}%", pick.confidence),
            timeframe = %pick.timeframe,
            cost = format!("${cost:.4}"),
            "Claude pick complete"
        );

        Ok(pick)
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> ModelTier {
        self.tier
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
