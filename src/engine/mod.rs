//! Core engine — fan-out, consensus, settlement, calibration.
//!
//! The orchestrator handles the latency-sensitive request path; the
//! resolver and calibration engine are idempotent background entry
//! points driven by an external scheduler (main's timers, or the
//! HTTP endpoints directly).

pub mod calibration;
pub mod consensus;
pub mod factors;
pub mod orchestrator;
pub mod resolver;

use std::sync::Arc;

use crate::backends::ModelBackend;
use crate::config::AppConfig;
use crate::market::MarketDataSource;
use crate::storage::Store;

/// Bundles the engine components around one store and one market data
/// source. This is what the HTTP server and the scheduler hold.
pub struct Engine {
    pub orchestrator: orchestrator::Orchestrator,
    pub resolver: resolver::OutcomeResolver,
    pub calibration: calibration::CalibrationEngine,
}

impl Engine {
    pub fn new(
        backends: Vec<Arc<dyn ModelBackend>>,
        market: Arc<dyn MarketDataSource>,
        store: Arc<Store>,
        config: &AppConfig,
    ) -> Self {
        Self {
            orchestrator: orchestrator::Orchestrator::new(
                backends,
                Arc::clone(&market),
                Arc::clone(&store),
            ),
            resolver: resolver::OutcomeResolver::new(
                Arc::clone(&market),
                Arc::clone(&store),
                config.resolution.clone(),
            ),
            calibration: calibration::CalibrationEngine::new(
                Arc::clone(&store),
                config.calibration.clone(),
            ),
        }
    }
}
