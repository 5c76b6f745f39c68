//! Shared types for the QUORUM engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that backend, engine,
//! and storage modules can depend on them without circular references.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Predicted price direction for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Hold,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
            Direction::Hold => write!(f, "HOLD"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UP" | "LONG" | "BUY" => Ok(Direction::Up),
            "DOWN" | "SHORT" | "SELL" => Ok(Direction::Down),
            "HOLD" | "NEUTRAL" | "FLAT" => Ok(Direction::Hold),
            _ => Err(anyhow::anyhow!("Unknown direction: {s}")),
        }
    }
}

/// Prediction horizon. Fixed set — expiry is derived once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1W")]
    OneWeek,
    #[serde(rename = "2W")]
    TwoWeeks,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Timeframe {
    /// Wall-clock horizon for this timeframe.
    pub fn horizon(&self) -> Duration {
        match self {
            Timeframe::OneWeek => Duration::days(7),
            Timeframe::TwoWeeks => Duration::days(14),
            Timeframe::OneMonth => Duration::days(30),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::OneWeek => write!(f, "1W"),
            Timeframe::TwoWeeks => write!(f, "2W"),
            Timeframe::OneMonth => write!(f, "1M"),
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "1W" => Ok(Timeframe::OneWeek),
            "2W" => Ok(Timeframe::TwoWeeks),
            "1M" => Ok(Timeframe::OneMonth),
            _ => Err(anyhow::anyhow!("Unknown timeframe: {s}")),
        }
    }
}

/// Lifecycle status of a pick. PENDING moves to exactly one terminal
/// state and never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PickStatus {
    Pending,
    Win,
    Loss,
    Expired,
}

impl PickStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PickStatus::Pending)
    }
}

impl fmt::Display for PickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PickStatus::Pending => write!(f, "PENDING"),
            PickStatus::Win => write!(f, "WIN"),
            PickStatus::Loss => write!(f, "LOSS"),
            PickStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

impl std::str::FromStr for PickStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(PickStatus::Pending),
            "WIN" => Ok(PickStatus::Win),
            "LOSS" => Ok(PickStatus::Loss),
            "EXPIRED" => Ok(PickStatus::Expired),
            _ => Err(anyhow::anyhow!("Unknown pick status: {s}")),
        }
    }
}

/// How a backend read a qualitative factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Interpretation {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for Interpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interpretation::Bullish => write!(f, "BULLISH"),
            Interpretation::Bearish => write!(f, "BEARISH"),
            Interpretation::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// A priori trust class for a backend, expressed as a fixed weight
/// multiplier in consensus building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Large,
    Medium,
    Small,
}

impl ModelTier {
    /// Fixed consensus weight for this tier.
    pub fn weight(&self) -> f64 {
        match self {
            ModelTier::Large => 1.5,
            ModelTier::Medium => 1.0,
            ModelTier::Small => 0.7,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Large => write!(f, "large"),
            ModelTier::Medium => write!(f, "medium"),
            ModelTier::Small => write!(f, "small"),
        }
    }
}

/// Agreement-strength bucket for a consensus verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsensusStrength {
    Strong,
    Moderate,
    Weak,
    Split,
}

impl ConsensusStrength {
    /// Bucket the fraction of total weight behind the winning direction.
    pub fn from_weight_share(share: f64) -> Self {
        if share >= 0.8 {
            ConsensusStrength::Strong
        } else if share >= 0.6 {
            ConsensusStrength::Moderate
        } else if share >= 0.4 {
            ConsensusStrength::Weak
        } else {
            ConsensusStrength::Split
        }
    }

    /// Discount applied to weighted confidence when agreement is thin.
    /// The blended figure must never report more certainty than the
    /// agreement justifies.
    pub fn confidence_factor(&self) -> f64 {
        match self {
            ConsensusStrength::Strong | ConsensusStrength::Moderate => 1.0,
            ConsensusStrength::Weak => 0.85,
            ConsensusStrength::Split => 0.70,
        }
    }
}

impl fmt::Display for ConsensusStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusStrength::Strong => write!(f, "STRONG"),
            ConsensusStrength::Moderate => write!(f, "MODERATE"),
            ConsensusStrength::Weak => write!(f, "WEAK"),
            ConsensusStrength::Split => write!(f, "SPLIT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market snapshot
// ---------------------------------------------------------------------------

/// Point-in-time market data for one symbol, fetched from the market
/// data source and fed to backends. Opaque beyond the fields the
/// prompt needs; `raw` preserves the full provider response for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub previous_close: Option<f64>,
    pub volume: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub market_cap: Option<f64>,
    pub week52_high: Option<f64>,
    pub week52_low: Option<f64>,
    pub sector: Option<String>,
    /// Human-readable summary for backend prompts.
    pub summary: String,
    /// Full provider response (preserved for audit).
    pub raw: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Whether the snapshot is stale (older than the given duration).
    pub fn is_stale(&self, max_age: Duration) -> bool {
        Utc::now() - self.fetched_at > max_age
    }
}

impl fmt::Display for MarketSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ ${:.2}", self.symbol, self.price)
    }
}

// ---------------------------------------------------------------------------
// FactorAssessment
// ---------------------------------------------------------------------------

/// A named qualitative observation cited within a pick. Owned
/// exclusively by its parent pick, never shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorAssessment {
    pub factor_id: String,
    pub factor_name: String,
    pub observed_value: String,
    pub interpretation: Interpretation,
    /// Confidence in this specific reading (0–100).
    pub confidence: f64,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Pick
// ---------------------------------------------------------------------------

/// One backend's independent opinion on one symbol at one point in time.
///
/// Entry, target, and stop prices are fixed at creation and never
/// mutated. Status moves from PENDING to exactly one terminal state,
/// written once by the outcome resolver. Picks are never deleted —
/// they are the unit of historical truth for calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pick {
    pub id: String,
    pub backend_id: String,
    pub symbol: String,
    pub sector: String,
    pub direction: Direction,
    /// Self-reported confidence (0–100).
    pub confidence: f64,
    pub timeframe: Timeframe,
    /// Snapshot price at creation. Immutable.
    pub entry_price: f64,
    pub target_price: f64,
    pub stop_loss: f64,
    pub thesis: String,
    pub full_reasoning: String,
    pub factor_assessments: Vec<FactorAssessment>,
    pub bullish_factors: Vec<String>,
    pub bearish_factors: Vec<String>,
    pub risks: Vec<String>,
    pub catalysts: Vec<String>,
    pub status: PickStatus,
    pub created_at: DateTime<Utc>,
    /// created_at + horizon(timeframe), derived once.
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_price: Option<f64>,
    /// (closed − entry)/entry, sign-adjusted so positive means the
    /// pick paid off regardless of direction.
    pub actual_return: Option<f64>,
    pub hit_target: bool,
    pub hit_stop_loss: bool,
}

impl Pick {
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Apply a terminal outcome. Returns false (and leaves the pick
    /// untouched) if it is already settled — resolver sweeps must be
    /// idempotent.
    pub fn settle(&mut self, settlement: Settlement) -> bool {
        if self.is_settled() {
            return false;
        }
        self.status = settlement.status;
        self.closed_at = Some(settlement.closed_at);
        self.closed_price = settlement.closed_price;
        self.actual_return = settlement.actual_return;
        self.hit_target = settlement.hit_target;
        self.hit_stop_loss = settlement.hit_stop_loss;
        true
    }

    /// Helper to build a test pick with sensible defaults.
    #[cfg(test)]
    pub fn sample(backend_id: &str, symbol: &str) -> Self {
        let now = Utc::now();
        Pick {
            id: uuid::Uuid::new_v4().to_string(),
            backend_id: backend_id.to_string(),
            symbol: symbol.to_string(),
            sector: "Technology".to_string(),
            direction: Direction::Up,
            confidence: 70.0,
            timeframe: Timeframe::OneMonth,
            entry_price: 100.0,
            target_price: 110.0,
            stop_loss: 95.0,
            thesis: "Earnings momentum with expanding margins".to_string(),
            full_reasoning: String::new(),
            factor_assessments: Vec::new(),
            bullish_factors: vec!["Revenue growth".to_string()],
            bearish_factors: Vec::new(),
            risks: vec!["Multiple compression".to_string()],
            catalysts: vec!["Q3 earnings".to_string()],
            status: PickStatus::Pending,
            created_at: now,
            expires_at: now + Timeframe::OneMonth.horizon(),
            closed_at: None,
            closed_price: None,
            actual_return: None,
            hit_target: false,
            hit_stop_loss: false,
        }
    }
}

impl fmt::Display for Pick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} conf={:.0}% {} entry=${:.2} tgt=${:.2} stop=${:.2} ({})",
            self.backend_id,
            self.direction,
            self.symbol,
            self.confidence,
            self.timeframe,
            self.entry_price,
            self.target_price,
            self.stop_loss,
            self.status,
        )
    }
}

/// The one-time terminal outcome applied to a pick.
#[derive(Debug, Clone, Copy)]
pub struct Settlement {
    pub status: PickStatus,
    pub closed_at: DateTime<Utc>,
    pub closed_price: Option<f64>,
    pub actual_return: Option<f64>,
    pub hit_target: bool,
    pub hit_stop_loss: bool,
}

// ---------------------------------------------------------------------------
// ConsensusRecord
// ---------------------------------------------------------------------------

/// The blended verdict for one symbol derived from a set of
/// concurrently-valid picks. Only created when at least two picks
/// exist for the symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Backend ids whose direction matches the majority.
    pub agreeing_backends: Vec<String>,
    /// Canonical sorted set of agreeing backend ids, joined by "+".
    pub combination_key: String,
    pub strength: ConsensusStrength,
    /// Σ(weight×confidence)/Σ(weight) over agreeing picks.
    pub weighted_confidence: f64,
    /// Weighted confidence discounted by agreement strength.
    pub blended_confidence: f64,
    pub reasoning: String,
    /// Mirrors settlement of the underlying picks.
    pub status: PickStatus,
    /// Ids of every pick that fed this verdict (agreeing or not).
    pub pick_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ConsensusRecord {
    /// Canonical key for a set of backend ids: sorted, "+"-joined.
    pub fn combination_key_for(backends: &[String]) -> String {
        let mut sorted: Vec<&str> = backends.iter().map(|s| s.as_str()).collect();
        sorted.sort_unstable();
        sorted.join("+")
    }
}

impl fmt::Display for ConsensusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] conf={:.0}%/{:.0}% backends={}",
            self.symbol,
            self.direction,
            self.strength,
            self.weighted_confidence,
            self.blended_confidence,
            self.agreeing_backends.join("+"),
        )
    }
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Per-factor slice of a backend's settled history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorPerformance {
    pub times_used: u32,
    pub win_rate: f64,
}

/// One backend's point-in-time reliability snapshot. Immutable once
/// written; a newer calibration supersedes it for lookups but history
/// is retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    pub backend_id: String,
    pub calibration_date: DateTime<Utc>,
    pub total_picks: u32,
    pub wins: u32,
    pub losses: u32,
    /// wins / (wins + losses), in [0, 1]. Expired picks excluded.
    pub win_rate: f64,
    pub avg_return: f64,
    /// Mean self-reported confidence over the window (0–100).
    pub avg_confidence: f64,
    /// Pearson correlation between per-pick confidence and the binary
    /// win indicator over the window.
    pub confidence_accuracy_correlation: f64,
    /// avg_confidence − win_rate×100. Positive means the backend talks
    /// a bigger game than it delivers.
    pub overconfidence_score: f64,
    pub factor_performance: HashMap<String, FactorPerformance>,
    /// Top-3 sectors by win rate (min 3 picks to qualify).
    pub best_sectors: Vec<String>,
    /// Bottom-3 sectors by win rate (min 3 picks to qualify).
    pub worst_sectors: Vec<String>,
    pub key_learnings: Vec<String>,
    pub adjustments: Vec<String>,
}

impl Calibration {
    /// Consensus weight multiplier derived from the historical win
    /// rate. A 50% win rate is neutral (1.0); clamped so one hot or
    /// cold streak cannot dominate the tier weights.
    pub fn weight_multiplier(&self) -> f64 {
        (0.5 + self.win_rate).clamp(0.6, 1.4)
    }
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}W/{}L win_rate={:.0}% avg_conf={:.0}% overconf={:+.1}",
            self.backend_id,
            self.wins,
            self.losses,
            self.win_rate * 100.0,
            self.avg_confidence,
            self.overconfidence_score,
        )
    }
}

// ---------------------------------------------------------------------------
// CombinationStats
// ---------------------------------------------------------------------------

/// Accuracy of a specific set of backends when they agree. Updated
/// incrementally each time a consensus record settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationStats {
    pub combination_key: String,
    pub times_agreed: u32,
    pub times_correct: u32,
    pub accuracy_rate: f64,
    pub avg_confidence_when_correct: f64,
    pub avg_confidence_when_wrong: f64,
}

impl CombinationStats {
    pub fn new(combination_key: &str) -> Self {
        Self {
            combination_key: combination_key.to_string(),
            times_agreed: 0,
            times_correct: 0,
            accuracy_rate: 0.0,
            avg_confidence_when_correct: 0.0,
            avg_confidence_when_wrong: 0.0,
        }
    }

    /// Fold in one settled consensus. `confidence` is the record's
    /// weighted confidence at creation time.
    pub fn record_outcome(&mut self, correct: bool, confidence: f64) {
        self.times_agreed += 1;
        if correct {
            let n = (self.times_correct + 1) as f64;
            self.avg_confidence_when_correct +=
                (confidence - self.avg_confidence_when_correct) / n;
            self.times_correct += 1;
        } else {
            let wrong = (self.times_agreed - self.times_correct) as f64;
            self.avg_confidence_when_wrong +=
                (confidence - self.avg_confidence_when_wrong) / wrong;
        }
        self.accuracy_rate = self.times_correct as f64 / self.times_agreed as f64;
    }
}

impl fmt::Display for CombinationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] agreed={} correct={} accuracy={:.0}%",
            self.combination_key,
            self.times_agreed,
            self.times_correct,
            self.accuracy_rate * 100.0,
        )
    }
}

// ---------------------------------------------------------------------------
// FactorOutcome
// ---------------------------------------------------------------------------

/// One settled observation of a factor a backend cited: did the pick
/// that cited it win? Appended by the factor tracker, keyed by
/// (backend, factor, sector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorOutcome {
    pub backend_id: String,
    pub factor_id: String,
    pub factor_name: String,
    pub sector: String,
    pub won: bool,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for QUORUM.
#[derive(Debug, thiserror::Error)]
pub enum QuorumError {
    #[error("Backend error ({backend}): {message}")]
    Backend { backend: String, message: String },

    #[error("Market data unavailable for {symbol}: {message}")]
    MarketData { symbol: String, message: String },

    #[error("Consensus error: {0}")]
    Consensus(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
