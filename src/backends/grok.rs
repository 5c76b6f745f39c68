//! Grok (xAI) backend.
//!
//! The xAI API is OpenAI-compatible, so this adapter mirrors the GPT
//! backend with a different base URL and live-search enabled — Grok's
//! edge is recency, which makes it a useful dissenting voice in the
//! consensus even at a lower trust tier.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{build_user_prompt, pick_from_response, system_prompt, AnalysisRequest, BackendError, ModelBackend};
use crate::types::{ModelTier, Pick};

const XAI_API_URL: &str = "https://api.x.ai/v1/chat/completions";

const MAX_RETRIES: u32 = 2;
const BASE_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
    search_parameters: SearchParameters,
}

#[derive(Debug, Serialize)]
struct SearchParameters {
    mode: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

pub struct GrokBackend {
    id: String,
    http: Client,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    tier: ModelTier,
    timeout: Duration,
}

impl GrokBackend {
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
        })
    }

    async fn call_api(&self, system: &str, user_message: &str) -> Result<String, BackendError> {
        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_message.to_string(),
                },
            ],
            search_parameters: SearchParameters { mode: "auto" },
        };

        let mut last_error = BackendError::Transport("no attempt made".to_string());

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying Grok API call");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(XAI_API_URL)
                .bearer_auth(self.api_key.expose_secret())
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: ChatResponse = response
                            .json()
                            .await
                            .map_err(|e| BackendError::Parse(e.to_string()))?;

                        return body
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message)
                            .map(|m| m.content)
                            .ok_or_else(|| {
                                BackendError::Parse("empty choices in response".to_string())
                            });
                    }

                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, error = %error_text, "Retryable Grok API error");
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
                        last_error = BackendError::Timeout(self.timeout);
                    } else {
                        warn!(attempt, error = %e, "Grok request failed");
                        last_error = BackendError::Transport(e.to_string());
                    }
                    continue;
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl ModelBackend for GrokBackend {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Pick, BackendError> {
        let user_msg = build_user_prompt(request);

        debug!(symbol = %request.symbol, model = %self.model, "Requesting pick from Grok");

        let response_text = self.call_api(system_prompt(), &user_msg).await?;
        let pick = pick_from_response(self.id(), request, &response_text)?;

        info!(
            symbol = %request.symbol,
            direction = %pick.direction,
            confidence = format!("{:.0}%", pick.confidence),
            "Grok pick complete"
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
