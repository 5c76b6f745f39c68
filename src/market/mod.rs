//! Market data source abstraction.
//!
//! Defines the `MarketDataSource` trait used by the orchestrator (entry
//! prices for new picks) and the outcome resolver (settlement prices),
//! plus the pacing primitive that keeps callers under the provider's
//! rate limit.

pub mod http;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::MarketSnapshot;

/// Errors a market data source can produce. `Unavailable` is the
/// recoverable case: the resolver skips the symbol and retries next
/// sweep; the orchestrator surfaces it to the caller.
#[derive(Debug, thiserror::Error)]
pub enum MarketDataError {
    #[error("quote unavailable for {symbol}: {reason}")]
    Unavailable { symbol: String, reason: String },

    #[error("market data transport error: {0}")]
    Transport(String),

    #[error("malformed quote payload: {0}")]
    Malformed(String),
}

/// Abstraction over the upstream quote provider.
///
/// Implementors must pace their own outbound calls — callers issue
/// requests back-to-back and rely on the source to respect the
/// provider's rate limit.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Latest trade price for a symbol.
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError>;

    /// Full snapshot (price, fundamentals, technicals) for a symbol.
    async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, MarketDataError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Serializes outbound calls with a fixed minimum inter-call delay.
///
/// The provider has no batch endpoint, so sweeps over many symbols
/// must not burst past its rate limit. Holding the mutex across the
/// sleep is deliberate: it is what serializes concurrent callers.
pub struct CallPacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until at least `min_interval` has elapsed since the
    /// previous `pace()` returned, then claim the slot.
    pub async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pacer_first_call_immediate() {
        let pacer = CallPacer::new(Duration::from_millis(200));
        let start = Instant::now();
        pacer.pace().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_enforces_minimum_gap() {
        let pacer = CallPacer::new(Duration::from_millis(500));
        pacer.pace().await;

        let start = Instant::now();
        pacer.pace().await;
        // With tokio's paused clock the sleep auto-advances; elapsed
        // virtual time must cover the full interval.
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_no_wait_after_interval_elapsed() {
        let pacer = CallPacer::new(Duration::from_millis(100));
        pacer.pace().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let start = Instant::now();
        pacer.pace().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_error_display() {
        let e = MarketDataError::Unavailable {
            symbol: "AAPL".into(),
            reason: "HTTP 429".into(),
        };
        assert!(format!("{e}").contains("AAPL"));
        assert!(format!("{e}").contains("429"));
    }
}
