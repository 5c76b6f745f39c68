//! Orchestrator — fans one analysis request out to every enabled
//! backend, tolerates partial failure, and persists what comes back.
//!
//! The fan-out is the only latency-sensitive concurrent operation in
//! the engine: one task per backend, each under its own timeout, so
//! total wall-clock is bounded by the slowest single timeout rather
//! than the sum. A failing or slow backend never invalidates the
//! others.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::{AnalysisRequest, BackendError, ModelBackend};
use crate::engine::consensus::build_consensus;
use crate::market::MarketDataSource;
use crate::storage::Store;
use crate::types::{Calibration, ConsensusRecord, ModelTier, Pick, QuorumError};

/// One backend's failure in a batch, reported back to the caller
/// instead of failing the request.
#[derive(Debug, Clone, Serialize)]
pub struct BackendFault {
    pub backend_id: String,
    pub error: String,
}

/// Result of one analysis request: whichever picks succeeded, the
/// consensus if at least two did, and who failed.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub picks: Vec<Pick>,
    pub consensus: Option<ConsensusRecord>,
    pub failures: Vec<BackendFault>,
}

pub struct Orchestrator {
    backends: Vec<Arc<dyn ModelBackend>>,
    market: Arc<dyn MarketDataSource>,
    store: Arc<Store>,
}

impl Orchestrator {
    /// The enabled-backend set is fixed at construction — an explicit
    /// configuration input, not a module-level flag.
    pub fn new(
        backends: Vec<Arc<dyn ModelBackend>>,
        market: Arc<dyn MarketDataSource>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            backends,
            market,
            store,
        }
    }

    /// Fan out one analysis request, persist every successful pick as
    /// PENDING, and build a consensus when at least two backends
    /// delivered.
    ///
    /// Market-data failure is the only request-level error: without an
    /// entry price no pick can be created. Backend failures degrade
    /// the result instead.
    pub async fn generate_picks(&self, symbol: &str) -> Result<AnalysisOutcome, QuorumError> {
        let snapshot = self
            .market
            .snapshot(symbol)
            .await
            .map_err(|e| QuorumError::MarketData {
                symbol: symbol.to_string(),
                message: e.to_string(),
            })?;

        let sector = snapshot
            .sector
            .clone()
            .unwrap_or_else(|| "Unknown".to_string());

        info!(
            symbol,
            price = snapshot.price,
            backends = self.backends.len(),
            "Dispatching analysis fan-out"
        );

        // Latest calibrations are an explicit read dependency: loaded
        // here, passed in, never mutated by backends.
        let calibrations = self.load_calibrations().await;

        let calls = self.backends.iter().map(|backend| {
            let request = AnalysisRequest {
                symbol: symbol.to_string(),
                sector: sector.clone(),
                snapshot: snapshot.clone(),
                calibration: calibrations.get(backend.id()).cloned(),
            };
            let backend = Arc::clone(backend);
            async move {
                let id = backend.id().to_string();
                let result = match tokio::time::timeout(backend.timeout(), backend.analyze(&request))
                    .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(BackendError::Timeout(backend.timeout())),
                };
                (id, result)
            }
        });

        let results = join_all(calls).await;

        let mut picks = Vec::new();
        let mut failures = Vec::new();
        for (backend_id, result) in results {
            match result {
                Ok(pick) => picks.push(pick),
                Err(e) => {
                    warn!(backend = %backend_id, error = %e, "Backend failed — dropping from batch");
                    failures.push(BackendFault {
                        backend_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        // Persist before building consensus: each pick is an
        // independent observation and must survive regardless of what
        // the verdict stage does.
        for pick in &picks {
            self.store.upsert_pick(pick).await?;
        }

        let consensus = if picks.len() >= 2 {
            let tiers: HashMap<String, ModelTier> = self
                .backends
                .iter()
                .map(|b| (b.id().to_string(), b.tier()))
                .collect();
            match build_consensus(symbol, &picks, &tiers, &calibrations) {
                Some(record) => {
                    self.store.upsert_consensus(&record).await?;
                    Some(record)
                }
                None => None,
            }
        } else {
            None
        };

        info!(
            symbol,
            picks = picks.len(),
            failed = failures.len(),
            consensus = consensus.is_some(),
            "Analysis complete"
        );

        Ok(AnalysisOutcome {
            picks,
            consensus,
            failures,
        })
    }

    async fn load_calibrations(&self) -> HashMap<String, Calibration> {
        let mut calibrations = HashMap::new();
        for backend in &self.backends {
            match self.store.latest_calibration(backend.id()).await {
                Ok(Some(cal)) => {
                    calibrations.insert(backend.id().to_string(), cal);
                }
                Ok(None) => {}
                Err(e) => {
                    // A missing calibration only costs weighting
                    // accuracy; the batch proceeds.
                    warn!(backend = backend.id(), error = %e, "Failed to load calibration");
                }
            }
        }
        calibrations
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
