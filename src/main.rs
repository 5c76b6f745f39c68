//! QUORUM — Multi-Model Consensus & Calibration Engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the backend roster and the engine, serves the API, and
//! drives the two background cadences (outcome resolution and
//! calibration) until shutdown. The engine components own no loops —
//! the timers here invoke their idempotent entry points, so each job
//! can equally be triggered from cron or the HTTP endpoints.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use quorum::backends::anthropic::AnthropicBackend;
use quorum::backends::grok::GrokBackend;
use quorum::backends::openai::OpenAiBackend;
use quorum::backends::ModelBackend;
use quorum::config::{AppConfig, BackendConfig};
use quorum::engine::Engine;
use quorum::market::http::HttpQuoteSource;
use quorum::server::routes::ServerState;
use quorum::server::spawn_server;
use quorum::storage::Store;

const BANNER: &str = r#"
  ___  _   _  ___  ____  _   _ __  __
 / _ \| | | |/ _ \|  _ \| | | |  \/  |
| | | | | | | | | | |_) | | | | |\/| |
| |_| | |_| | |_| |  _ <| |_| | |  | |
 \__\_\\___/ \___/|_| \_\\___/|_|  |_|

  Multi-Model Consensus & Calibration Engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        resolve_interval_secs = cfg.service.resolve_interval_secs,
        calibration_interval_secs = cfg.service.calibration_interval_secs,
        backends = cfg.enabled_backends().len(),
        "QUORUM starting up"
    );

    // -- Storage ----------------------------------------------------------

    let store = Arc::new(
        Store::open(&cfg.service.database_path)
            .await
            .context("Failed to open database")?,
    );

    // -- Market data source ------------------------------------------------

    let market_key = cfg
        .market_data
        .api_key_env
        .as_deref()
        .and_then(|env| AppConfig::resolve_secret(env).ok());
    if market_key.is_none() && cfg.market_data.api_key_env.is_some() {
        warn!("Market data API key env var not set — provider calls may be rejected");
    }

    let market = Arc::new(
        HttpQuoteSource::new(
            &cfg.market_data.base_url,
            market_key,
            Duration::from_millis(cfg.market_data.min_call_interval_ms),
        )
        .map_err(|e| anyhow::anyhow!("Failed to build market data source: {e}"))?,
    );

    // -- Backends ----------------------------------------------------------

    let backends = build_backends(&cfg);
    if backends.is_empty() {
        warn!("No usable backends — analyze requests will return degraded results");
    } else {
        info!(
            roster = ?backends.iter().map(|b| b.id()).collect::<Vec<_>>(),
            "Backend roster ready"
        );
    }

    // -- Engine + API server ------------------------------------------------

    let engine = Engine::new(backends, market, Arc::clone(&store), &cfg);
    let state = Arc::new(ServerState {
        engine,
        store: Arc::clone(&store),
    });

    if cfg.server.enabled {
        spawn_server(Arc::clone(&state), cfg.server.port)?;
    }

    // -- Background cadences -------------------------------------------------

    let mut resolve_tick =
        tokio::time::interval(Duration::from_secs(cfg.service.resolve_interval_secs));
    let mut calibration_tick =
        tokio::time::interval(Duration::from_secs(cfg.service.calibration_interval_secs));
    // Skip the immediate first tick of each interval.
    resolve_tick.tick().await;
    calibration_tick.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Entering scheduler loop. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = resolve_tick.tick() => {
                match state.engine.resolver.resolve_expired().await {
                    Ok(report) => info!(
                        processed = report.processed,
                        wins = report.wins,
                        losses = report.losses,
                        expired = report.expired,
                        skipped = report.skipped_symbols.len(),
                        "Scheduled resolution sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Resolution sweep failed — will retry next tick"),
                }
            }
            _ = calibration_tick.tick() => {
                match state.engine.calibration.due_backends().await {
                    Ok(due) if due.is_empty() => {
                        info!("No backends due for calibration");
                    }
                    Ok(due) => {
                        let report = state.engine.calibration.run_all(&due).await;
                        info!(
                            calibrated = ?report.calibrated,
                            skipped = ?report.skipped,
                            failures = report.failures.len(),
                            "Scheduled calibration complete"
                        );
                    }
                    Err(e) => error!(error = %e, "Calibration due-check failed"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("QUORUM shut down cleanly.");
    Ok(())
}

/// Build the enabled backend roster from config. A backend whose API
/// key is missing is skipped with a warning rather than failing
/// startup — the rest of the roster still serves.
fn build_backends(cfg: &AppConfig) -> Vec<Arc<dyn ModelBackend>> {
    let mut roster: Vec<Arc<dyn ModelBackend>> = Vec::new();

    let mut entries: Vec<(&String, &BackendConfig)> = cfg.backends.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (id, backend_cfg) in entries {
        if !backend_cfg.enabled {
            continue;
        }

        let api_key = match AppConfig::resolve_secret(&backend_cfg.api_key_env) {
            Ok(key) => key,
            Err(e) => {
                warn!(backend = %id, error = %e, "Skipping backend — API key unavailable");
                continue;
            }
        };

        let timeout = Duration::from_secs(backend_cfg.timeout_secs);
        let built: Result<Arc<dyn ModelBackend>, _> = match backend_cfg.provider.as_str() {
            "anthropic" => AnthropicBackend::new(
                id.clone(),
                api_key,
                backend_cfg.model.clone(),
                backend_cfg.max_tokens,
                backend_cfg.tier,
                timeout,
            )
            .map(|b| Arc::new(b) as Arc<dyn ModelBackend>),
            "openai" => OpenAiBackend::new(
                id.clone(),
                api_key,
                backend_cfg.model.clone(),
                backend_cfg.max_tokens,
                backend_cfg.tier,
                timeout,
            )
            .map(|b| Arc::new(b) as Arc<dyn ModelBackend>),
            "grok" => GrokBackend::new(
                id.clone(),
                api_key,
                backend_cfg.model.clone(),
                backend_cfg.max_tokens,
                backend_cfg.tier,
                timeout,
            )
            .map(|b| Arc::new(b) as Arc<dyn ModelBackend>),
            other => {
                warn!(backend = %id, provider = other, "Unknown provider — skipping backend");
                continue;
            }
        };

        match built {
            Ok(backend) => roster.push(backend),
            Err(e) => warn!(backend = %id, error = %e, "Failed to build backend — skipping"),
        }
    }

    roster
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quorum=info"));

    let json_logging = std::env::var("QUORUM_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
