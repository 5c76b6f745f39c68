//! HTTP server — Axum API exposing the engine to callers.
//!
//! A machine surface, not a presentation layer: analyze, query picks
//! and consensus, trigger the resolver sweep and calibration runs.
//! CORS enabled for local development.

pub mod routes;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use routes::AppState;

/// Start the API server. Spawns a background task — doesn't block.
pub fn spawn_server(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "API server starting on http://localhost:{port}");

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "API server error");
                }
            }
            Err(e) => tracing::error!(error = %e, port, "Failed to bind API port"),
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin("*".parse::<HeaderValue>().expect("static header value"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/analyze", post(routes::analyze))
        .route("/api/picks", get(routes::get_picks))
        .route("/api/consensus", get(routes::get_consensus))
        .route("/api/resolve-expired", post(routes::resolve_expired))
        .route("/api/calibrate", post(routes::calibrate))
        .route("/api/calibration", get(routes::get_calibration))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::routes::ServerState;
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::Engine;
    use crate::market::{MarketDataError, MarketDataSource};
    use crate::storage::Store;
    use crate::types::{MarketSnapshot, Pick, PickStatus, Settlement};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct StubMarket {
        price: f64,
    }

    #[async_trait]
    impl MarketDataSource for StubMarket {
        async fn current_price(&self, _symbol: &str) -> Result<f64, MarketDataError> {
            Ok(self.price)
        }

        async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, MarketDataError> {
            Ok(MarketSnapshot {
                symbol: symbol.to_string(),
                price: self.price,
                previous_close: None,
                volume: None,
                pe_ratio: None,
                market_cap: None,
                week52_high: None,
                week52_low: None,
                sector: Some("Technology".into()),
                summary: format!("{symbol}: ${:.2}", self.price),
                raw: serde_json::Value::Null,
                fetched_at: Utc::now(),
            })
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn test_config() -> AppConfig {
        toml::from_str(
            r#"
[service]
name = "QUORUM-TEST"
resolve_interval_secs = 3600
calibration_interval_secs = 86400
database_path = ":memory:"

[server]
enabled = true
port = 0

[market_data]
base_url = "http://localhost"
min_call_interval_ms = 0

[backends.claude]
enabled = true
provider = "anthropic"
tier = "large"
model = "claude-sonnet-4-20250514"
api_key_env = "ANTHROPIC_API_KEY"
timeout_secs = 45
"#,
        )
        .unwrap()
    }

    /// State with no backends: analyze degrades to an empty result,
    /// which is exactly what the route contract promises.
    async fn test_state() -> AppState {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let engine = Engine::new(
            vec![],
            Arc::new(StubMarket { price: 100.0 }),
            Arc::clone(&store),
            &test_config(),
        );
        Arc::new(ServerState { engine, store })
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_analyze_degraded_result_is_ok() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(post_json("/api/analyze", r#"{"symbol": "aapl"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["symbol"], "AAPL");
        assert!(json["picks"].as_array().unwrap().is_empty());
        assert!(json["consensus"].is_null());
    }

    #[tokio::test]
    async fn test_analyze_empty_symbol_rejected() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(post_json("/api/analyze", r#"{"symbol": "  "}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_picks_with_filters() {
        let state = test_state().await;
        let mut pick = Pick::sample("claude", "AAPL");
        pick.settle(Settlement {
            status: PickStatus::Win,
            closed_at: Utc::now(),
            closed_price: Some(112.0),
            actual_return: Some(0.12),
            hit_target: true,
            hit_stop_loss: false,
        });
        state.store.upsert_pick(&pick).await.unwrap();
        state
            .store
            .upsert_pick(&Pick::sample("gpt", "MSFT"))
            .await
            .unwrap();

        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/picks?symbol=AAPL&status=WIN")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let picks: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0]["backend_id"], "claude");
        assert_eq!(picks[0]["status"], "WIN");
    }

    #[tokio::test]
    async fn test_get_picks_bad_status_is_400() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/picks?status=BOGUS")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_consensus_missing_is_404() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/consensus?symbol=AAPL")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resolve_expired_endpoint_reports_counts() {
        let state = test_state().await;
        // One pick already past target at the stub price of 100? No —
        // entry 100, target 110. Use an expired pick instead.
        let mut pick = Pick::sample("claude", "AAPL");
        pick.created_at = Utc::now() - Duration::days(40);
        pick.expires_at = Utc::now() - Duration::days(5);
        state.store.upsert_pick(&pick).await.unwrap();

        let app = build_router(state);
        let resp = app
            .oneshot(post_json("/api/resolve-expired", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // Flat at entry: 0% return < 2% threshold → LOSS.
        assert_eq!(json["processed"], 1);
        assert_eq!(json["losses"], 1);
    }

    #[tokio::test]
    async fn test_calibrate_endpoint_skips_thin_backends() {
        let state = test_state().await;
        let mut pick = Pick::sample("claude", "AAPL");
        pick.settle(Settlement {
            status: PickStatus::Win,
            closed_at: Utc::now(),
            closed_price: Some(112.0),
            actual_return: Some(0.12),
            hit_target: true,
            hit_stop_loss: false,
        });
        state.store.upsert_pick(&pick).await.unwrap();

        let app = build_router(state);
        let resp = app
            .oneshot(post_json("/api/calibrate", r#"{"backend": "all"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // One settled pick is under the minimum sample — skipped, not an error.
        assert_eq!(json["skipped"].as_array().unwrap().len(), 1);
        assert!(json["failures"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_calibration_missing_is_404() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/calibration?backend=claude")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
