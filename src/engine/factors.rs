//! Factor tracker — per-factor reliability, independent of the overall
//! pick.
//!
//! Every settled pick contributes one observation per factor it cited:
//! did the pick that leaned on this factor win? Aggregated per backend,
//! the win rates expose factors a backend consistently misreads, which
//! feed both the calibration report and "avoid" guidance in future
//! prompts.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::storage::Store;
use crate::types::{FactorOutcome, FactorPerformance, Pick, PickStatus, QuorumError};

/// Default threshold below which a factor is flagged "avoid".
const DEFAULT_AVOID_THRESHOLD: f64 = 0.40;

/// Default minimum observations before a factor can be flagged.
const DEFAULT_MIN_OBSERVATIONS: usize = 5;

/// Guidance derived from a backend's factor history.
#[derive(Debug, Clone, Default)]
pub struct FactorRecommendations {
    /// Factor ids whose win rate fell below the avoidance threshold.
    pub avoid_factors: Vec<String>,
    /// Short textual adjustments, ready for prompt or calibration use.
    pub adjustments: Vec<String>,
}

pub struct FactorTracker {
    store: Arc<Store>,
    avoid_threshold: f64,
    min_observations: usize,
}

impl FactorTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            avoid_threshold: DEFAULT_AVOID_THRESHOLD,
            min_observations: DEFAULT_MIN_OBSERVATIONS,
        }
    }

    pub fn with_thresholds(store: Arc<Store>, avoid_threshold: f64, min_observations: usize) -> Self {
        Self {
            store,
            avoid_threshold,
            min_observations,
        }
    }

    /// Record one observation per factor assessment inside a settled
    /// pick. EXPIRED picks are skipped — they say nothing about
    /// whether the factor reading was right.
    pub async fn record_outcomes(&self, pick: &Pick) -> Result<usize, QuorumError> {
        let won = match pick.status {
            PickStatus::Win => true,
            PickStatus::Loss => false,
            PickStatus::Pending | PickStatus::Expired => return Ok(0),
        };

        if pick.factor_assessments.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let outcomes: Vec<FactorOutcome> = pick
            .factor_assessments
            .iter()
            .map(|f| FactorOutcome {
                backend_id: pick.backend_id.clone(),
                factor_id: f.factor_id.clone(),
                factor_name: f.factor_name.clone(),
                sector: pick.sector.clone(),
                won,
                recorded_at: now,
            })
            .collect();

        self.store.insert_factor_outcomes(&outcomes).await?;
        debug!(
            pick_id = %pick.id,
            backend = %pick.backend_id,
            factors = outcomes.len(),
            won,
            "Factor outcomes recorded"
        );
        Ok(outcomes.len())
    }

    /// Per-factor usage counts and win rates for one backend.
    pub async fn aggregate(
        &self,
        backend_id: &str,
    ) -> Result<HashMap<String, FactorPerformance>, QuorumError> {
        let outcomes = self.store.factor_outcomes_for_backend(backend_id).await?;

        let mut counts: HashMap<String, (u32, u32)> = HashMap::new();
        for outcome in &outcomes {
            let entry = counts.entry(outcome.factor_id.clone()).or_insert((0, 0));
            entry.0 += 1;
            if outcome.won {
                entry.1 += 1;
            }
        }

        Ok(counts
            .into_iter()
            .map(|(factor_id, (used, wins))| {
                (
                    factor_id,
                    FactorPerformance {
                        times_used: used,
                        win_rate: wins as f64 / used as f64,
                    },
                )
            })
            .collect())
    }

    /// Reliability-weighted guidance: factors below the avoidance
    /// threshold with enough observations, plus adjustment strings.
    pub async fn recommendations(
        &self,
        backend_id: &str,
    ) -> Result<FactorRecommendations, QuorumError> {
        let performance = self.aggregate(backend_id).await?;

        let mut flagged: Vec<(String, FactorPerformance)> = performance
            .into_iter()
            .filter(|(_, perf)| {
                perf.times_used as usize >= self.min_observations
                    && perf.win_rate < self.avoid_threshold
            })
            .collect();
        flagged.sort_by(|a, b| {
            a.1.win_rate
                .partial_cmp(&b.1.win_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut recs = FactorRecommendations::default();
        for (factor_id, perf) in flagged {
            recs.adjustments.push(format!(
                "Factor '{}' wins only {:.0}% of the time over {} uses — stop leaning on it.",
                factor_id,
                perf.win_rate * 100.0,
                perf.times_used,
            ));
            recs.avoid_factors.push(factor_id);
        }

        Ok(recs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FactorAssessment, Interpretation, Settlement};

    fn pick_with_factors(backend: &str, factors: &[&str], status: PickStatus) -> Pick {
        let mut pick = Pick::sample(backend, "AAPL");
        pick.factor_assessments = factors
            .iter()
            .map(|name| FactorAssessment {
                factor_id: name.to_string(),
                factor_name: name.to_string(),
                observed_value: "x".into(),
                interpretation: Interpretation::Bullish,
                confidence: 60.0,
                reasoning: String::new(),
            })
            .collect();
        if status.is_terminal() {
            pick.settle(Settlement {
                status,
                closed_at: Utc::now(),
                closed_price: Some(100.0),
                actual_return: Some(0.0),
                hit_target: false,
                hit_stop_loss: false,
            });
        }
        pick
    }

    #[tokio::test]
    async fn test_record_outcomes_per_factor() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let tracker = FactorTracker::new(Arc::clone(&store));

        let pick = pick_with_factors("claude", &["pe_ratio", "volume_trend"], PickStatus::Win);
        let count = tracker.record_outcomes(&pick).await.unwrap();
        assert_eq!(count, 2);

        let stored = store.factor_outcomes_for_backend("claude").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|o| o.won));
        assert!(stored.iter().all(|o| o.sector == "Technology"));
    }

    #[tokio::test]
    async fn test_pending_and_expired_picks_record_nothing() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let tracker = FactorTracker::new(Arc::clone(&store));

        let pending = pick_with_factors("claude", &["pe_ratio"], PickStatus::Pending);
        assert_eq!(tracker.record_outcomes(&pending).await.unwrap(), 0);

        let expired = pick_with_factors("claude", &["pe_ratio"], PickStatus::Expired);
        assert_eq!(tracker.record_outcomes(&expired).await.unwrap(), 0);

        assert!(store
            .factor_outcomes_for_backend("claude")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_win_rates() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let tracker = FactorTracker::new(Arc::clone(&store));

        for status in [PickStatus::Win, PickStatus::Win, PickStatus::Loss] {
            let pick = pick_with_factors("claude", &["pe_ratio"], status);
            tracker.record_outcomes(&pick).await.unwrap();
        }

        let perf = tracker.aggregate("claude").await.unwrap();
        let pe = &perf["pe_ratio"];
        assert_eq!(pe.times_used, 3);
        assert!((pe.win_rate - 2.0 / 3.0).abs() < 1e-10);
    }

    #[tokio::test]
    async fn test_recommendations_flag_weak_factor_with_enough_observations() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let tracker = FactorTracker::new(Arc::clone(&store));

        // volume_trend: 1 win, 5 losses → 17% over 6 uses → flagged.
        for status in [
            PickStatus::Win,
            PickStatus::Loss,
            PickStatus::Loss,
            PickStatus::Loss,
            PickStatus::Loss,
            PickStatus::Loss,
        ] {
            let pick = pick_with_factors("claude", &["volume_trend"], status);
            tracker.record_outcomes(&pick).await.unwrap();
        }
        // pe_ratio: weak but only 2 observations → not flagged.
        for status in [PickStatus::Loss, PickStatus::Loss] {
            let pick = pick_with_factors("claude", &["pe_ratio"], status);
            tracker.record_outcomes(&pick).await.unwrap();
        }

        let recs = tracker.recommendations("claude").await.unwrap();
        assert_eq!(recs.avoid_factors, vec!["volume_trend".to_string()]);
        assert_eq!(recs.adjustments.len(), 1);
        assert!(recs.adjustments[0].contains("volume_trend"));
    }

    #[tokio::test]
    async fn test_recommendations_empty_for_healthy_backend() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let tracker = FactorTracker::new(Arc::clone(&store));

        for _ in 0..6 {
            let pick = pick_with_factors("claude", &["pe_ratio"], PickStatus::Win);
            tracker.record_outcomes(&pick).await.unwrap();
        }

        let recs = tracker.recommendations("claude").await.unwrap();
        assert!(recs.avoid_factors.is_empty());
        assert!(recs.adjustments.is_empty());
    }

    #[tokio::test]
    async fn test_recommendations_isolated_per_backend() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let tracker = FactorTracker::new(Arc::clone(&store));

        for _ in 0..6 {
            let pick = pick_with_factors("gpt", &["momentum"], PickStatus::Loss);
            tracker.record_outcomes(&pick).await.unwrap();
        }

        let claude = tracker.recommendations("claude").await.unwrap();
        assert!(claude.avoid_factors.is_empty());
        let gpt = tracker.recommendations("gpt").await.unwrap();
        assert_eq!(gpt.avoid_factors, vec!["momentum".to_string()]);
    }
}
