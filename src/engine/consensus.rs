//! Consensus builder — turns a set of independent picks for one symbol
//! into a single weighted verdict.
//!
//! Each pick's weight is its backend's tier weight times a calibration
//! multiplier from the backend's latest win rate. The direction with
//! the most weight wins; the share of weight behind it sets the
//! strength bucket; confidence is blended so the verdict never sounds
//! more certain than the agreement is.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::types::{
    Calibration, ConsensusRecord, ConsensusStrength, Direction, ModelTier, Pick, PickStatus,
};

/// Per-direction accumulator.
#[derive(Debug, Default)]
struct DirectionTally {
    weight: f64,
    weighted_confidence_sum: f64,
    backends: Vec<String>,
    pick_ids: Vec<String>,
}

/// Build the weighted verdict for one symbol. Returns None when fewer
/// than two picks exist — a single backend's opinion is not a consensus.
pub fn build_consensus(
    symbol: &str,
    picks: &[Pick],
    tiers: &HashMap<String, ModelTier>,
    calibrations: &HashMap<String, Calibration>,
) -> Option<ConsensusRecord> {
    if picks.len() < 2 {
        debug!(symbol, count = picks.len(), "Not enough picks for consensus");
        return None;
    }

    let mut tallies: HashMap<Direction, DirectionTally> = HashMap::new();
    let mut total_weight = 0.0;

    for pick in picks {
        let weight = pick_weight(pick, tiers, calibrations);
        total_weight += weight;

        let tally = tallies.entry(pick.direction).or_default();
        tally.weight += weight;
        tally.weighted_confidence_sum += weight * pick.confidence;
        tally.backends.push(pick.backend_id.clone());
        tally.pick_ids.push(pick.id.clone());
    }

    if total_weight <= 0.0 {
        return None;
    }

    // Highest total weight wins; ties broken by higher total weighted
    // confidence.
    let (direction, winner) = tallies
        .iter()
        .max_by(|(_, a), (_, b)| {
            (a.weight, a.weighted_confidence_sum)
                .partial_cmp(&(b.weight, b.weighted_confidence_sum))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(d, t)| (*d, t))?;

    let share = winner.weight / total_weight;
    let strength = ConsensusStrength::from_weight_share(share);
    let weighted_confidence = winner.weighted_confidence_sum / winner.weight;
    let blended_confidence = weighted_confidence * strength.confidence_factor();

    // A backend may contribute more than one pick per batch
    // (at-least-once delivery); each pick carries weight but the
    // backend appears once in the agreeing set.
    let mut agreeing: Vec<String> = Vec::new();
    for backend in &winner.backends {
        if !agreeing.contains(backend) {
            agreeing.push(backend.clone());
        }
    }

    let dissenting: Vec<(String, Direction)> = picks
        .iter()
        .filter(|p| p.direction != direction)
        .map(|p| (p.backend_id.clone(), p.direction))
        .collect();

    let reasoning = render_reasoning(symbol, direction, strength, &agreeing, &dissenting, share);
    let combination_key = ConsensusRecord::combination_key_for(&agreeing);

    let record = ConsensusRecord {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        direction,
        agreeing_backends: agreeing,
        combination_key,
        strength,
        weighted_confidence,
        blended_confidence,
        reasoning,
        status: PickStatus::Pending,
        pick_ids: picks.iter().map(|p| p.id.clone()).collect(),
        created_at: chrono::Utc::now(),
    };

    info!(
        symbol,
        direction = %record.direction,
        strength = %record.strength,
        weighted = format!("{:.1}%", record.weighted_confidence),
        blended = format!("{:.1}%", record.blended_confidence),
        "Consensus built"
    );

    Some(record)
}

/// Weight for one pick: tier weight × calibration multiplier
/// (1.0 when the backend has no calibration yet).
fn pick_weight(
    pick: &Pick,
    tiers: &HashMap<String, ModelTier>,
    calibrations: &HashMap<String, Calibration>,
) -> f64 {
    let tier_weight = tiers
        .get(&pick.backend_id)
        .copied()
        .unwrap_or(ModelTier::Medium)
        .weight();
    let multiplier = calibrations
        .get(&pick.backend_id)
        .map(|c| c.weight_multiplier())
        .unwrap_or(1.0);
    tier_weight * multiplier
}

fn render_reasoning(
    symbol: &str,
    direction: Direction,
    strength: ConsensusStrength,
    agreeing: &[String],
    dissenting: &[(String, Direction)],
    share: f64,
) -> String {
    let mut out = format!(
        "{symbol}: {direction} verdict ({strength}, {:.0}% of weight) from {}",
        share * 100.0,
        agreeing.join(", "),
    );
    if dissenting.is_empty() {
        out.push_str(". No dissent.");
    } else {
        let list: Vec<String> = dissenting
            .iter()
            .map(|(b, d)| format!("{b} ({d})"))
            .collect();
        out.push_str(&format!(". Dissenting: {}.", list.join(", ")));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
