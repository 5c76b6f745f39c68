//! Forecasting backend integration.
//!
//! Defines the `ModelBackend` trait and provides implementations for
//! Claude (Anthropic), GPT (OpenAI), and Grok (xAI). Every backend has
//! a different transport and prompt shape but an identical output
//! contract: a structured pick or a typed failure. The orchestrator
//! depends only on the trait.

pub mod anthropic;
pub mod grok;
pub mod openai;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

use crate::types::{
    Calibration, Direction, FactorAssessment, Interpretation, MarketSnapshot, ModelTier, Pick,
    PickStatus, Timeframe,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed failure from one backend adapter. Adapters never raise past
/// their own boundary — the orchestrator drops failures and the batch
/// proceeds.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unparseable response: {0}")]
    Parse(String),

    #[error("invalid pick: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Everything a backend needs to produce one pick. The latest
/// calibration is an explicit read dependency — backends bias their
/// prompt from it, they never share weighting state.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub symbol: String,
    pub sector: String,
    pub snapshot: MarketSnapshot,
    pub calibration: Option<Calibration>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over forecasting backends.
///
/// Implementors send a market snapshot to their model and parse the
/// response into a structured `Pick`.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Produce one independent pick for the requested symbol.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Pick, BackendError>;

    /// Stable backend identifier ("claude", "gpt", "grok", ...).
    fn id(&self) -> &str;

    /// Trust tier for consensus weighting.
    fn tier(&self) -> ModelTier;

    /// Per-call timeout enforced by the orchestrator.
    fn timeout(&self) -> Duration;
}

// ---------------------------------------------------------------------------
// Shared prompt construction
// ---------------------------------------------------------------------------

/// System prompt shared by all providers. The output contract is a
/// single strict JSON object so one parser serves every backend.
pub fn system_prompt() -> &'static str {
    "You are an equity analyst producing one structured trading pick. \
     Analyze the market data you are given and commit to a direction.\n\n\
     CRITICAL RULES:\n\
     1. Reason from the data provided, not from memory of old prices.\n\
     2. Be genuinely calibrated: confidence 70 should win about 70% of the time.\n\
     3. Cite the specific factors (P/E ratio, volume trend, momentum, ...) you relied on.\n\
     4. Respond with EXACTLY ONE JSON object and nothing else, using this schema:\n\
     {\n\
       \"direction\": \"UP\" | \"DOWN\" | \"HOLD\",\n\
       \"confidence\": 0-100,\n\
       \"timeframe\": \"1W\" | \"2W\" | \"1M\",\n\
       \"target_price\": number,\n\
       \"stop_loss\": number,\n\
       \"thesis\": \"one-paragraph summary\",\n\
       \"full_reasoning\": \"complete reasoning\",\n\
       \"factor_assessments\": [{\"factor_id\": \"pe_ratio\", \"factor_name\": \"P/E Ratio\", \
        \"observed_value\": \"28.4\", \"interpretation\": \"BULLISH\" | \"BEARISH\" | \"NEUTRAL\", \
        \"confidence\": 0-100, \"reasoning\": \"...\"}],\n\
       \"bullish_factors\": [\"...\"],\n\
       \"bearish_factors\": [\"...\"],\n\
       \"risks\": [\"...\"],\n\
       \"catalysts\": [\"...\"]\n\
     }\n\
     5. For UP: target_price above the current price, stop_loss below it. For DOWN: mirrored."
}

/// Build the user prompt for one analysis request, folding in the
/// backend's latest calibration as behavioral guidance.
pub fn build_user_prompt(request: &AnalysisRequest) -> String {
    let mut prompt = String::with_capacity(1500);

    prompt.push_str(&format!("SYMBOL: {}\n", request.symbol));
    prompt.push_str(&format!("SECTOR: {}\n", request.sector));
    prompt.push_str(&format!(
        "CURRENT PRICE: ${:.2}\n",
        request.snapshot.price,
    ));
    prompt.push_str("\nMARKET DATA:\n");
    prompt.push_str(&request.snapshot.summary);
    prompt.push('\n');

    if let Some(cal) = &request.calibration {
        prompt.push_str(&calibration_bias(cal));
    }

    prompt.push_str("\nProduce your pick as the single JSON object described in the rules.\n");
    prompt
}

/// Render a calibration into prompt guidance. Fed into future calls so
/// the model can adjust — the feedback half of the loop.
pub fn calibration_bias(cal: &Calibration) -> String {
    let mut parts = vec![format!(
        "\nYOUR TRACK RECORD ({} settled picks, win rate {:.0}%):",
        cal.total_picks,
        cal.win_rate * 100.0,
    )];

    if cal.overconfidence_score > 15.0 {
        parts.push(format!(
            "- You have been overconfident by {:.0} points. Reduce stated confidence by 10-15%.",
            cal.overconfidence_score,
        ));
    }
    for sector in &cal.worst_sectors {
        parts.push(format!(
            "- Weak history in {sector}. Be more conservative there.",
        ));
    }
    for adj in &cal.adjustments {
        parts.push(format!("- {adj}"));
    }

    let mut out = parts.join("\n");
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawFactor {
    #[serde(default)]
    factor_id: Option<String>,
    factor_name: String,
    #[serde(default)]
    observed_value: String,
    interpretation: String,
    #[serde(default = "default_factor_confidence")]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

fn default_factor_confidence() -> f64 {
    50.0
}

#[derive(Debug, Deserialize)]
struct RawPick {
    direction: String,
    confidence: f64,
    timeframe: String,
    target_price: f64,
    stop_loss: f64,
    thesis: String,
    #[serde(default)]
    full_reasoning: String,
    #[serde(default)]
    factor_assessments: Vec<RawFactor>,
    #[serde(default)]
    bullish_factors: Vec<String>,
    #[serde(default)]
    bearish_factors: Vec<String>,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    catalysts: Vec<String>,
}

/// Extract the JSON object from a raw completion. Models occasionally
/// wrap the payload in prose or markdown fences; take the outermost
/// braces.
pub fn extract_json(text: &str) -> Result<&str, BackendError> {
    let start = text
        .find('{')
        .ok_or_else(|| BackendError::Parse("no JSON object in response".to_string()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| BackendError::Parse("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(BackendError::Parse("malformed JSON braces".to_string()));
    }
    Ok(&text[start..=end])
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Parse and validate a raw completion into a PENDING pick. The entry
/// price is stamped from the snapshot; expiry is derived once from the
/// timeframe. Any schema or range violation is a typed failure, never
/// a panic.
pub fn pick_from_response(
    backend_id: &str,
    request: &AnalysisRequest,
    text: &str,
) -> Result<Pick, BackendError> {
    let json = extract_json(text)?;
    let raw: RawPick =
        serde_json::from_str(json).map_err(|e| BackendError::Parse(e.to_string()))?;

    let direction: Direction = raw
        .direction
        .parse()
        .map_err(|_| BackendError::Invalid(format!("bad direction {:?}", raw.direction)))?;
    let timeframe: Timeframe = raw
        .timeframe
        .parse()
        .map_err(|_| BackendError::Invalid(format!("bad timeframe {:?}", raw.timeframe)))?;

    if !(0.0..=100.0).contains(&raw.confidence) {
        return Err(BackendError::Invalid(format!(
            "confidence {} out of [0,100]",
            raw.confidence,
        )));
    }
    if !raw.target_price.is_finite() || raw.target_price <= 0.0 {
        return Err(BackendError::Invalid(format!(
            "non-positive target price {}",
            raw.target_price,
        )));
    }
    if !raw.stop_loss.is_finite() || raw.stop_loss <= 0.0 {
        return Err(BackendError::Invalid(format!(
            "non-positive stop loss {}",
            raw.stop_loss,
        )));
    }

    let entry = request.snapshot.price;
    match direction {
        Direction::Up => {
            if raw.target_price <= entry || raw.stop_loss >= entry {
                return Err(BackendError::Invalid(format!(
                    "UP pick needs target > {entry} > stop, got target={} stop={}",
                    raw.target_price, raw.stop_loss,
                )));
            }
        }
        Direction::Down => {
            if raw.target_price >= entry || raw.stop_loss <= entry {
                return Err(BackendError::Invalid(format!(
                    "DOWN pick needs target < {entry} < stop, got target={} stop={}",
                    raw.target_price, raw.stop_loss,
                )));
            }
        }
        // HOLD carries a band rather than a trade plan; prices only
        // need to be positive.
        Direction::Hold => {}
    }

    let factors = raw
        .factor_assessments
        .into_iter()
        .map(|f| {
            let interpretation = match f.interpretation.to_uppercase().as_str() {
                "BULLISH" => Interpretation::Bullish,
                "BEARISH" => Interpretation::Bearish,
                "NEUTRAL" => Interpretation::Neutral,
                other => {
                    return Err(BackendError::Invalid(format!(
                        "bad factor interpretation {other:?}",
                    )))
                }
            };
            Ok(FactorAssessment {
                factor_id: f
                    .factor_id
                    .unwrap_or_else(|| slugify(&f.factor_name)),
                factor_name: f.factor_name,
                observed_value: f.observed_value,
                interpretation,
                confidence: f.confidence.clamp(0.0, 100.0),
                reasoning: f.reasoning,
            })
        })
        .collect::<Result<Vec<_>, BackendError>>()?;

    let now = Utc::now();
    Ok(Pick {
        id: uuid::Uuid::new_v4().to_string(),
        backend_id: backend_id.to_string(),
        symbol: request.symbol.clone(),
        sector: request.sector.clone(),
        direction,
        confidence: raw.confidence,
        timeframe,
        entry_price: entry,
        target_price: raw.target_price,
        stop_loss: raw.stop_loss,
        thesis: raw.thesis,
        full_reasoning: raw.full_reasoning,
        factor_assessments: factors,
        bullish_factors: raw.bullish_factors,
        bearish_factors: raw.bearish_factors,
        risks: raw.risks,
        catalysts: raw.catalysts,
        status: PickStatus::Pending,
        created_at: now,
        expires_at: now + timeframe.horizon(),
        closed_at: None,
        closed_price: None,
        actual_return: None,
        hit_target: false,
        hit_stop_loss: false,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_request(price: f64) -> AnalysisRequest {
        AnalysisRequest {
            symbol: "AAPL".into(),
            sector: "Technology".into(),
            snapshot: MarketSnapshot {
                symbol: "AAPL".into(),
                price,
                previous_close: Some(price * 0.99),
                volume: Some(50_000_000.0),
                pe_ratio: Some(28.4),
                market_cap: None,
                week52_high: None,
                week52_low: None,
                sector: Some("Technology".into()),
                summary: format!("AAPL: ${price:.2} | P/E 28.4"),
                raw: serde_json::Value::Null,
                fetched_at: Utc::now(),
            },
            calibration: None,
        }
    }

    const VALID_RESPONSE: &str = r#"{
        "direction": "UP",
        "confidence": 72,
        "timeframe": "1M",
        "target_price": 110.0,
        "stop_loss": 95.0,
        "thesis": "Earnings momentum",
        "full_reasoning": "Margins expanding, services mix improving.",
        "factor_assessments": [
            {"factor_name": "P/E Ratio", "observed_value": "28.4",
             "interpretation": "NEUTRAL", "confidence": 60, "reasoning": "in line with sector"}
        ],
        "bullish_factors": ["Services growth"],
        "bearish_factors": [],
        "risks": ["China demand"],
        "catalysts": ["Q3 earnings"]
    }"#;

    #[test]
    fn test_parse_valid_response() {
        let req = make_request(100.0);
        let pick = pick_from_response("claude", &req, VALID_RESPONSE).unwrap();
        assert_eq!(pick.backend_id, "claude");
        assert_eq!(pick.direction, Direction::Up);
        assert_eq!(pick.timeframe, Timeframe::OneMonth);
        assert!((pick.confidence - 72.0).abs() < 1e-10);
        assert!((pick.entry_price - 100.0).abs() < 1e-10);
        assert_eq!(pick.status, PickStatus::Pending);
        assert_eq!(pick.expires_at, pick.created_at + Timeframe::OneMonth.horizon());
        assert_eq!(pick.factor_assessments.len(), 1);
        // factor_id derived from the name when absent
        assert_eq!(pick.factor_assessments[0].factor_id, "p_e_ratio");
    }

    #[test]
    fn test_parse_response_with_prose_wrapper() {
        let wrapped = format!("Here is my analysis:\n```json\n{VALID_RESPONSE}\n```\nDone.");
        let req = make_request(100.0);
        let pick = pick_from_response("claude", &req, &wrapped).unwrap();
        assert_eq!(pick.direction, Direction::Up);
    }

    #[test]
    fn test_parse_rejects_missing_field() {
        let req = make_request(100.0);
        let result = pick_from_response("claude", &req, r#"{"direction": "UP"}"#);
        assert!(matches!(result, Err(BackendError::Parse(_))));
    }

    #[test]
    fn test_parse_rejects_bad_direction() {
        let bad = VALID_RESPONSE.replace("\"UP\"", "\"SIDEWAYS\"");
        let req = make_request(100.0);
        assert!(matches!(
            pick_from_response("claude", &req, &bad),
            Err(BackendError::Invalid(_)),
        ));
    }

    #[test]
    fn test_parse_rejects_confidence_out_of_range() {
        let bad = VALID_RESPONSE.replace("\"confidence\": 72", "\"confidence\": 140");
        let req = make_request(100.0);
        assert!(matches!(
            pick_from_response("claude", &req, &bad),
            Err(BackendError::Invalid(_)),
        ));
    }

    #[test]
    fn test_parse_rejects_inverted_up_levels() {
        // UP pick with target below entry
        let req = make_request(120.0);
        assert!(matches!(
            pick_from_response("claude", &req, VALID_RESPONSE),
            Err(BackendError::Invalid(_)),
        ));
    }

    #[test]
    fn test_parse_rejects_no_json() {
        let req = make_request(100.0);
        assert!(matches!(
            pick_from_response("claude", &req, "I cannot analyze this symbol."),
            Err(BackendError::Parse(_)),
        ));
    }

    #[test]
    fn test_parse_down_direction_levels() {
        let down = r#"{
            "direction": "DOWN", "confidence": 55, "timeframe": "2W",
            "target_price": 90.0, "stop_loss": 105.0,
            "thesis": "Deteriorating guidance"
        }"#;
        let req = make_request(100.0);
        let pick = pick_from_response("gpt", &req, down).unwrap();
        assert_eq!(pick.direction, Direction::Down);
        assert_eq!(pick.timeframe, Timeframe::TwoWeeks);
        assert!(pick.factor_assessments.is_empty());
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json(r#"x {"a": 1} y"#).unwrap(), r#"{"a": 1}"#);
        assert!(extract_json("no braces").is_err());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("P/E Ratio"), "p_e_ratio");
        assert_eq!(slugify("Volume Trend"), "volume_trend");
        assert_eq!(slugify("RSI(14)"), "rsi_14");
    }

    #[test]
    fn test_system_prompt_contract() {
        let sp = system_prompt();
        assert!(sp.contains("direction"));
        assert!(sp.contains("target_price"));
        assert!(sp.contains("factor_assessments"));
        assert!(sp.contains("calibrated"));
    }

    #[test]
    fn test_user_prompt_includes_calibration_bias() {
        let mut req = make_request(100.0);
        req.calibration = Some(Calibration {
            backend_id: "claude".into(),
            calibration_date: Utc::now(),
            total_picks: 20,
            wins: 9,
            losses: 11,
            win_rate: 0.45,
            avg_return: -0.005,
            avg_confidence: 71.0,
            confidence_accuracy_correlation: -0.1,
            overconfidence_score: 26.0,
            factor_performance: HashMap::new(),
            best_sectors: vec![],
            worst_sectors: vec!["Energy".into()],
            key_learnings: vec![],
            adjustments: vec!["Avoid factor: volume_trend".into()],
        });

        let prompt = build_user_prompt(&req);
        assert!(prompt.contains("TRACK RECORD"));
        assert!(prompt.contains("overconfident"));
        assert!(prompt.contains("Energy"));
        assert!(prompt.contains("volume_trend"));
    }

    #[test]
    fn test_user_prompt_without_calibration() {
        let prompt = build_user_prompt(&make_request(100.0));
        assert!(prompt.contains("SYMBOL: AAPL"));
        assert!(!prompt.contains("TRACK RECORD"));
    }
}
