//! Calibration engine — mines a backend's settled history into a
//! reliability snapshot and behavioral adjustments.
//!
//! Stateless per call: each run reads settled picks in a trailing
//! window, computes the statistics, writes one immutable calibration
//! row, and returns. Cadence is decided outside (a timer or the
//! calibrate endpoint); `due_backends` encodes the trigger policy.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CalibrationConfig;
use crate::engine::factors::FactorTracker;
use crate::storage::Store;
use crate::types::{Calibration, Pick, PickStatus, QuorumError};

/// Per-backend outcome of a calibration batch.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationFailure {
    pub backend_id: String,
    pub error: String,
}

/// Batch report: which backends got a new calibration, which lacked
/// data, which errored. Never aborts on first failure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CalibrationRunReport {
    pub calibrated: Vec<String>,
    pub skipped: Vec<String>,
    pub failures: Vec<CalibrationFailure>,
}

pub struct CalibrationEngine {
    store: Arc<Store>,
    factors: FactorTracker,
    config: CalibrationConfig,
}

impl CalibrationEngine {
    pub fn new(store: Arc<Store>, config: CalibrationConfig) -> Self {
        let factors = FactorTracker::with_thresholds(
            Arc::clone(&store),
            config.factor_avoid_threshold,
            config.factor_min_observations,
        );
        Self {
            store,
            factors,
            config,
        }
    }

    /// Compute and persist a new calibration for one backend.
    ///
    /// Returns `Ok(None)` — informational, not an error — when the
    /// trailing window holds fewer decided picks than the minimum
    /// sample size. No row is written in that case.
    pub async fn run_calibration(
        &self,
        backend_id: &str,
    ) -> Result<Option<Calibration>, QuorumError> {
        let now = Utc::now();
        let since = now - Duration::days(self.config.window_days);
        let settled = self
            .store
            .settled_picks_for_backend(backend_id, since)
            .await?;

        // Expired picks are retained in the window total but carry no
        // win/loss signal.
        let decided: Vec<&Pick> = settled
            .iter()
            .filter(|p| matches!(p.status, PickStatus::Win | PickStatus::Loss))
            .collect();

        if decided.len() < self.config.min_picks {
            info!(
                backend = backend_id,
                decided = decided.len(),
                minimum = self.config.min_picks,
                "Insufficient data for calibration — skipping"
            );
            return Ok(None);
        }

        let wins = decided
            .iter()
            .filter(|p| p.status == PickStatus::Win)
            .count() as u32;
        let losses = decided.len() as u32 - wins;
        let win_rate = wins as f64 / decided.len() as f64;

        let avg_return = mean(
            &decided
                .iter()
                .filter_map(|p| p.actual_return)
                .collect::<Vec<_>>(),
        );
        let confidences: Vec<f64> = decided.iter().map(|p| p.confidence).collect();
        let outcomes: Vec<f64> = decided
            .iter()
            .map(|p| if p.status == PickStatus::Win { 1.0 } else { 0.0 })
            .collect();
        let avg_confidence = mean(&confidences);
        let correlation = pearson(&confidences, &outcomes);
        let overconfidence_score = avg_confidence - win_rate * 100.0;

        let (best_sectors, worst_sectors, sector_rates) = sector_breakdown(
            &decided,
            self.config.min_sector_picks,
        );

        let factor_performance = self.factors.aggregate(backend_id).await?;
        let factor_recs = self.factors.recommendations(backend_id).await?;

        let mut key_learnings = Vec::new();
        let mut adjustments = Vec::new();

        if win_rate > 0.65 {
            key_learnings.push(format!(
                "Strong performance: {:.0}% win rate over {} picks.",
                win_rate * 100.0,
                decided.len(),
            ));
        } else if win_rate < 0.45 {
            adjustments.push(
                "Win rate below break-even — raise the conviction bar before committing to a direction."
                    .to_string(),
            );
        }

        if overconfidence_score > 15.0 {
            adjustments.push(format!(
                "Overconfident by {overconfidence_score:.0} points — reduce stated confidence by 10-15%.",
            ));
        } else if overconfidence_score < -15.0 {
            key_learnings.push(
                "Confidence runs below realized accuracy — estimates can be stated more firmly."
                    .to_string(),
            );
        }

        if correlation < 0.0 {
            key_learnings.push(format!(
                "Confidence does not track outcomes (r={correlation:.2}); treat stated confidence with suspicion.",
            ));
        } else if correlation > 0.3 {
            key_learnings.push(format!(
                "Confidence is informative (r={correlation:.2}).",
            ));
        }

        for sector in &best_sectors {
            if let Some(rate) = sector_rates.get(sector) {
                if *rate > 0.7 {
                    adjustments.push(format!(
                        "Prioritize {sector}: {:.0}% win rate.",
                        rate * 100.0,
                    ));
                }
            }
        }
        for sector in &worst_sectors {
            if let Some(rate) = sector_rates.get(sector) {
                if *rate < 0.35 {
                    adjustments.push(format!(
                        "Avoid {sector}: {:.0}% win rate.",
                        rate * 100.0,
                    ));
                }
            }
        }

        adjustments.extend(factor_recs.adjustments);

        let calibration = Calibration {
            backend_id: backend_id.to_string(),
            calibration_date: now,
            total_picks: settled.len() as u32,
            wins,
            losses,
            win_rate,
            avg_return,
            avg_confidence,
            confidence_accuracy_correlation: correlation,
            overconfidence_score,
            factor_performance,
            best_sectors,
            worst_sectors,
            key_learnings,
            adjustments,
        };

        self.store.insert_calibration(&calibration).await?;
        info!(backend = backend_id, summary = %calibration, "Calibration persisted");

        Ok(Some(calibration))
    }

    /// Calibrate a set of backends, collecting per-backend results
    /// instead of aborting on the first failure.
    pub async fn run_all(&self, backend_ids: &[String]) -> CalibrationRunReport {
        let mut report = CalibrationRunReport::default();
        for backend_id in backend_ids {
            match self.run_calibration(backend_id).await {
                Ok(Some(_)) => report.calibrated.push(backend_id.clone()),
                Ok(None) => report.skipped.push(backend_id.clone()),
                Err(e) => {
                    warn!(backend = %backend_id, error = %e, "Calibration failed");
                    report.failures.push(CalibrationFailure {
                        backend_id: backend_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Trigger policy: a backend is due when it has settled history
    /// but no calibration yet, or when enough new settlements accrued
    /// inside the recent window since its last calibration.
    pub async fn due_backends(&self) -> Result<Vec<String>, QuorumError> {
        let now = Utc::now();
        let mut due = Vec::new();

        for backend_id in self.store.backends_with_settled_picks().await? {
            match self.store.latest_calibration(&backend_id).await? {
                None => due.push(backend_id),
                Some(last) => {
                    let window_start = now - Duration::days(self.config.due_window_days);
                    let since = last.calibration_date.max(window_start);
                    let fresh = self.store.count_settled_since(&backend_id, since).await?;
                    if fresh as usize >= self.config.due_settlements {
                        due.push(backend_id);
                    }
                }
            }
        }

        Ok(due)
    }
}

// ---------------------------------------------------------------------------
// Statistics helpers
// ---------------------------------------------------------------------------

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Pearson correlation coefficient. Returns 0.0 when either series is
/// constant (no variance means no linear relationship to measure).
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x < f64::EPSILON || var_y < f64::EPSILON {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

/// Per-sector win rates over decided picks. Only sectors with at
/// least `min_picks` qualify; best is top-3 by win rate, worst is
/// bottom-3 among the remaining qualified sectors.
fn sector_breakdown(
    decided: &[&Pick],
    min_picks: usize,
) -> (Vec<String>, Vec<String>, std::collections::HashMap<String, f64>) {
    let mut counts: std::collections::HashMap<String, (u32, u32)> = Default::default();
    for pick in decided {
        let entry = counts.entry(pick.sector.clone()).or_insert((0, 0));
        entry.0 += 1;
        if pick.status == PickStatus::Win {
            entry.1 += 1;
        }
    }

    let mut qualified: Vec<(String, f64)> = counts
        .iter()
        .filter(|(_, (n, _))| *n as usize >= min_picks)
        .map(|(sector, (n, wins))| (sector.clone(), *wins as f64 / *n as f64))
        .collect();
    qualified.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let best: Vec<String> = qualified.iter().take(3).map(|(s, _)| s.clone()).collect();
    let worst: Vec<String> = qualified
        .iter()
        .rev()
        .take(3)
        .map(|(s, _)| s.clone())
        .filter(|s| !best.contains(s))
        .collect();

    let rates = qualified.into_iter().collect();
    (best, worst, rates)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Settlement;

    fn settled_pick(
        backend: &str,
        sector: &str,
        confidence: f64,
        won: bool,
        days_ago: i64,
    ) -> Pick {
        let mut pick = Pick::sample(backend, "AAPL");
        pick.sector = sector.to_string();
        pick.confidence = confidence;
        pick.settle(Settlement {
            status: if won { PickStatus::Win } else { PickStatus::Loss },
            closed_at: Utc::now() - Duration::days(days_ago),
            closed_price: Some(if won { 112.0 } else { 93.0 }),
            actual_return: Some(if won { 0.12 } else { -0.07 }),
            hit_target: won,
            hit_stop_loss: !won,
        });
        pick
    }

    async fn engine() -> (CalibrationEngine, Arc<Store>) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let engine = CalibrationEngine::new(Arc::clone(&store), CalibrationConfig::default());
        (engine, store)
    }

    // -- pearson -------------------------------------------------------------

    #[test]
    fn test_pearson_perfect_positive() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [10.0, 20.0, 30.0, 40.0];
        assert!((pearson(&xs, &ys) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_pearson_perfect_negative() {
        let xs = [1.0, 2.0, 3.0];
        let ys = [3.0, 2.0, 1.0];
        assert!((pearson(&xs, &ys) + 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_pearson_constant_series_is_zero() {
        let xs = [75.0, 75.0, 75.0];
        let ys = [1.0, 0.0, 1.0];
        assert_eq!(pearson(&xs, &ys), 0.0);
    }

    #[test]
    fn test_pearson_mismatched_lengths() {
        assert_eq!(pearson(&[1.0, 2.0], &[1.0]), 0.0);
    }

    // -- run_calibration -----------------------------------------------------

    #[tokio::test]
    async fn test_calibration_arithmetic() {
        // 20 settled picks, 14 wins, every confidence 75:
        // win rate 0.70, overconfidence 75 − 70 = 5.
        let (engine, store) = engine().await;
        for i in 0..20 {
            let pick = settled_pick("claude", "Technology", 75.0, i < 14, 1);
            store.upsert_pick(&pick).await.unwrap();
        }

        let cal = engine.run_calibration("claude").await.unwrap().unwrap();
        assert_eq!(cal.total_picks, 20);
        assert_eq!(cal.wins, 14);
        assert_eq!(cal.losses, 6);
        assert!((cal.win_rate - 0.70).abs() < 1e-10);
        assert!((cal.avg_confidence - 75.0).abs() < 1e-10);
        assert!((cal.overconfidence_score - 5.0).abs() < 1e-10);
        // Constant confidence — correlation must degrade to 0, not NaN.
        assert_eq!(cal.confidence_accuracy_correlation, 0.0);
        // Persisted and visible as latest.
        assert!(store.latest_calibration("claude").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_calibration_insufficient_data_writes_nothing() {
        let (engine, store) = engine().await;
        for _ in 0..3 {
            let pick = settled_pick("claude", "Technology", 70.0, true, 1);
            store.upsert_pick(&pick).await.unwrap();
        }

        let result = engine.run_calibration("claude").await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.calibration_count("claude").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_calibration_window_excludes_old_picks() {
        let (engine, store) = engine().await;
        // 5 recent losses, 20 ancient wins: only the window counts.
        for _ in 0..5 {
            let pick = settled_pick("claude", "Technology", 70.0, false, 2);
            store.upsert_pick(&pick).await.unwrap();
        }
        for _ in 0..20 {
            let pick = settled_pick("claude", "Technology", 70.0, true, 90);
            store.upsert_pick(&pick).await.unwrap();
        }

        let cal = engine.run_calibration("claude").await.unwrap().unwrap();
        assert_eq!(cal.total_picks, 5);
        assert_eq!(cal.wins, 0);
        assert!((cal.win_rate - 0.0).abs() < 1e-10);
    }

    #[tokio::test]
    async fn test_calibration_overconfidence_adjustment() {
        let (engine, store) = engine().await;
        // Confidence 85 with a 40% win rate → overconfidence 45.
        for i in 0..10 {
            let pick = settled_pick("claude", "Technology", 85.0, i < 4, 1);
            store.upsert_pick(&pick).await.unwrap();
        }

        let cal = engine.run_calibration("claude").await.unwrap().unwrap();
        assert!(cal.overconfidence_score > 15.0);
        assert!(cal
            .adjustments
            .iter()
            .any(|a| a.contains("reduce stated confidence")));
        assert!(cal
            .adjustments
            .iter()
            .any(|a| a.contains("break-even")));
    }

    #[tokio::test]
    async fn test_calibration_sector_lists() {
        let (engine, store) = engine().await;
        // Technology: 4/4 wins. Energy: 0/4. Utilities: 2 picks — unqualified.
        for _ in 0..4 {
            store
                .upsert_pick(&settled_pick("claude", "Technology", 70.0, true, 1))
                .await
                .unwrap();
            store
                .upsert_pick(&settled_pick("claude", "Energy", 70.0, false, 1))
                .await
                .unwrap();
        }
        for _ in 0..2 {
            store
                .upsert_pick(&settled_pick("claude", "Utilities", 70.0, true, 1))
                .await
                .unwrap();
        }

        let cal = engine.run_calibration("claude").await.unwrap().unwrap();
        assert!(cal.best_sectors.contains(&"Technology".to_string()));
        assert!(cal.worst_sectors.contains(&"Energy".to_string()));
        assert!(!cal.best_sectors.contains(&"Utilities".to_string()));
        assert!(cal
            .adjustments
            .iter()
            .any(|a| a.contains("Prioritize Technology")));
        assert!(cal.adjustments.iter().any(|a| a.contains("Avoid Energy")));
    }

    #[tokio::test]
    async fn test_calibration_strong_performance_learning() {
        let (engine, store) = engine().await;
        for i in 0..10 {
            store
                .upsert_pick(&settled_pick("claude", "Technology", 70.0, i < 8, 1))
                .await
                .unwrap();
        }

        let cal = engine.run_calibration("claude").await.unwrap().unwrap();
        assert!((cal.win_rate - 0.8).abs() < 1e-10);
        assert!(cal
            .key_learnings
            .iter()
            .any(|l| l.contains("Strong performance")));
    }

    // -- run_all -------------------------------------------------------------

    #[tokio::test]
    async fn test_run_all_reports_per_backend() {
        let (engine, store) = engine().await;
        for i in 0..10 {
            store
                .upsert_pick(&settled_pick("claude", "Technology", 70.0, i < 6, 1))
                .await
                .unwrap();
        }
        // gpt has only 2 settled picks → skipped.
        for _ in 0..2 {
            store
                .upsert_pick(&settled_pick("gpt", "Technology", 70.0, true, 1))
                .await
                .unwrap();
        }

        let report = engine
            .run_all(&["claude".to_string(), "gpt".to_string()])
            .await;
        assert_eq!(report.calibrated, vec!["claude".to_string()]);
        assert_eq!(report.skipped, vec!["gpt".to_string()]);
        assert!(report.failures.is_empty());
    }

    // -- due_backends --------------------------------------------------------

    #[tokio::test]
    async fn test_due_when_never_calibrated() {
        let (engine, store) = engine().await;
        store
            .upsert_pick(&settled_pick("claude", "Technology", 70.0, true, 1))
            .await
            .unwrap();

        assert_eq!(engine.due_backends().await.unwrap(), vec!["claude".to_string()]);
    }

    #[tokio::test]
    async fn test_due_after_enough_new_settlements() {
        let (engine, store) = engine().await;
        for i in 0..10 {
            store
                .upsert_pick(&settled_pick("claude", "Technology", 70.0, i < 6, 1))
                .await
                .unwrap();
        }
        // Calibrate once — then no new settlements, so not due.
        engine.run_calibration("claude").await.unwrap().unwrap();
        assert!(engine.due_backends().await.unwrap().is_empty());

        // Ten fresh settlements since the calibration make it due again.
        for i in 0..10 {
            store
                .upsert_pick(&settled_pick("claude", "Technology", 70.0, i < 5, 0))
                .await
                .unwrap();
        }
        assert_eq!(engine.due_backends().await.unwrap(), vec!["claude".to_string()]);
    }
}
