//! Outcome resolver — the periodic sweep that settles pending picks.
//!
//! Selects every PENDING pick whose horizon has elapsed or whose price
//! has already crossed target/stop, fetches one price per symbol, and
//! applies the classification rules. Settlement is written exactly
//! once; re-running the sweep over settled data is a no-op, so an
//! interrupted sweep can always be retried.
//!
//! When the last pick behind a PENDING consensus settles, the
//! consensus itself settles and the matching combination stats are
//! updated — settlement happens-before both.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ResolutionConfig;
use crate::engine::factors::FactorTracker;
use crate::market::MarketDataSource;
use crate::storage::Store;
use crate::types::{ConsensusRecord, Direction, Pick, PickStatus, QuorumError, Settlement};

/// Per-sweep summary, returned to the scheduler or the HTTP caller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    pub processed: u32,
    pub wins: u32,
    pub losses: u32,
    pub expired: u32,
    /// Symbols whose price fetch failed this sweep; retried next time.
    pub skipped_symbols: Vec<String>,
}

pub struct OutcomeResolver {
    market: Arc<dyn MarketDataSource>,
    store: Arc<Store>,
    factors: FactorTracker,
    config: ResolutionConfig,
}

impl OutcomeResolver {
    pub fn new(
        market: Arc<dyn MarketDataSource>,
        store: Arc<Store>,
        config: ResolutionConfig,
    ) -> Self {
        let factors = FactorTracker::new(Arc::clone(&store));
        Self {
            market,
            store,
            factors,
            config,
        }
    }

    /// Run one settlement sweep over all pending picks.
    pub async fn resolve_expired(&self) -> Result<ResolutionReport, QuorumError> {
        let now = Utc::now();
        let pending = self.store.pending_picks().await?;

        // Group by symbol so each symbol costs one market-data call.
        // BTreeMap keeps sweep order deterministic.
        let mut by_symbol: BTreeMap<String, Vec<Pick>> = BTreeMap::new();
        for pick in pending {
            by_symbol.entry(pick.symbol.clone()).or_default().push(pick);
        }

        let mut report = ResolutionReport::default();

        for (symbol, picks) in by_symbol {
            match self.market.current_price(&symbol).await {
                Ok(price) => {
                    for mut pick in picks {
                        if let Some(settlement) = classify(&pick, price, now, &self.config) {
                            self.apply_settlement(&mut pick, settlement, &mut report)
                                .await?;
                        }
                    }
                }
                Err(e) => {
                    // One symbol's outage never blocks the rest of the
                    // sweep. Picks far past expiry with no obtainable
                    // price settle EXPIRED instead of lingering forever.
                    warn!(symbol = %symbol, error = %e, "Price fetch failed — skipping symbol this sweep");
                    let grace = Duration::days(self.config.expiry_grace_days);
                    let mut any_skipped = false;
                    for mut pick in picks {
                        if now >= pick.expires_at + grace {
                            let settlement = Settlement {
                                status: PickStatus::Expired,
                                closed_at: now,
                                closed_price: None,
                                actual_return: None,
                                hit_target: false,
                                hit_stop_loss: false,
                            };
                            self.apply_settlement(&mut pick, settlement, &mut report)
                                .await?;
                        } else {
                            any_skipped = true;
                        }
                    }
                    if any_skipped {
                        report.skipped_symbols.push(symbol);
                    }
                }
            }
        }

        info!(
            processed = report.processed,
            wins = report.wins,
            losses = report.losses,
            expired = report.expired,
            skipped = report.skipped_symbols.len(),
            "Resolution sweep complete"
        );

        Ok(report)
    }

    async fn apply_settlement(
        &self,
        pick: &mut Pick,
        settlement: Settlement,
        report: &mut ResolutionReport,
    ) -> Result<(), QuorumError> {
        // settle() refuses already-terminal picks, which keeps the
        // sweep idempotent even if statuses raced.
        if !pick.settle(settlement) {
            return Ok(());
        }
        self.store.upsert_pick(pick).await?;

        report.processed += 1;
        match pick.status {
            PickStatus::Win => report.wins += 1,
            PickStatus::Loss => report.losses += 1,
            PickStatus::Expired => report.expired += 1,
            PickStatus::Pending => {}
        }

        debug!(
            pick_id = %pick.id,
            symbol = %pick.symbol,
            status = %pick.status,
            closed_price = ?pick.closed_price,
            "Pick settled"
        );

        self.factors.record_outcomes(pick).await?;
        self.settle_consensus_for(pick).await?;
        Ok(())
    }

    /// If the settled pick belongs to a still-PENDING consensus whose
    /// underlying picks are now all terminal, settle the consensus and
    /// fold the result into its combination stats.
    async fn settle_consensus_for(&self, pick: &Pick) -> Result<(), QuorumError> {
        let pending = self.store.pending_consensus().await?;

        for mut record in pending
            .into_iter()
            .filter(|c| c.pick_ids.iter().any(|id| id == &pick.id))
        {
            let mut members = Vec::with_capacity(record.pick_ids.len());
            for id in &record.pick_ids {
                match self.store.get_pick(id).await? {
                    Some(p) => members.push(p),
                    None => {
                        warn!(consensus = %record.id, pick_id = %id, "Consensus references missing pick");
                    }
                }
            }
            if members.iter().any(|p| !p.is_settled()) {
                continue;
            }

            let correct = consensus_outcome(&record, &members);
            record.status = if correct {
                PickStatus::Win
            } else {
                PickStatus::Loss
            };
            self.store.upsert_consensus(&record).await?;

            let mut stats = self
                .store
                .get_combination_stats(&record.combination_key)
                .await?
                .unwrap_or_else(|| crate::types::CombinationStats::new(&record.combination_key));
            stats.record_outcome(correct, record.weighted_confidence);
            self.store.upsert_combination_stats(&stats).await?;

            info!(
                symbol = %record.symbol,
                combination = %record.combination_key,
                correct,
                accuracy = format!("{:.0}%", stats.accuracy_rate * 100.0),
                "Consensus settled"
            );
        }

        Ok(())
    }
}

/// Whether the consensus direction matched the settled outcome: the
/// majority of agreeing picks must have won. Expired picks carry no
/// directional information and count against.
fn consensus_outcome(record: &ConsensusRecord, members: &[Pick]) -> bool {
    let agreeing: Vec<&Pick> = members
        .iter()
        .filter(|p| p.direction == record.direction)
        .collect();
    if agreeing.is_empty() {
        return false;
    }
    let wins = agreeing
        .iter()
        .filter(|p| p.status == PickStatus::Win)
        .count();
    wins * 2 > agreeing.len()
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify a pending pick against the current price. Returns None
/// when the pick is not yet due (no crossing, horizon not elapsed).
///
/// The stored return is sign-adjusted for direction: positive always
/// means the pick paid off.
pub fn classify(
    pick: &Pick,
    price: f64,
    now: DateTime<Utc>,
    config: &ResolutionConfig,
) -> Option<Settlement> {
    let raw_return = (price - pick.entry_price) / pick.entry_price;

    // Target/stop crossing settles a directional pick before expiry.
    let crossed = match pick.direction {
        Direction::Up => {
            if price >= pick.target_price {
                Some((PickStatus::Win, true, false))
            } else if price <= pick.stop_loss {
                Some((PickStatus::Loss, false, true))
            } else {
                None
            }
        }
        Direction::Down => {
            if price <= pick.target_price {
                Some((PickStatus::Win, true, false))
            } else if price >= pick.stop_loss {
                Some((PickStatus::Loss, false, true))
            } else {
                None
            }
        }
        // HOLD has no trade plan to cross; it only settles at expiry.
        Direction::Hold => None,
    };

    let (status, hit_target, hit_stop_loss) = match crossed {
        Some(outcome) => outcome,
        None => {
            if !pick.is_expired(now) {
                return None;
            }
            let pct = raw_return * 100.0;
            let won = match pick.direction {
                Direction::Up => pct >= config.expiry_win_threshold_pct,
                Direction::Down => pct <= -config.expiry_win_threshold_pct,
                Direction::Hold => pct.abs() <= config.hold_band_pct,
            };
            (
                if won { PickStatus::Win } else { PickStatus::Loss },
                false,
                false,
            )
        }
    };

    let actual_return = match pick.direction {
        Direction::Down => -raw_return,
        _ => raw_return,
    };

    Some(Settlement {
        status,
        closed_at: now,
        closed_price: Some(price),
        actual_return: Some(actual_return),
        hit_target,
        hit_stop_loss,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
