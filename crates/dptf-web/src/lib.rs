//! Axum JSON API exposing the daily tender report.
//!
//! Thin boundary over the engine: per-condition failures stay inside the
//! report's diagnostics and never change the status code; only a
//! catastrophic run failure yields a 500, and the body still carries the
//! partial report.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Local;
use dptf_engine::{run_report, EngineConfig};
use dptf_fetch::{HtmlTableFetcher, HttpClientConfig, TableFetcher};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub const CRATE_NAME: &str = "dptf-web";

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub fetcher: Arc<dyn TableFetcher>,
}

impl AppState {
    pub fn new(config: EngineConfig, fetcher: Arc<dyn TableFetcher>) -> Self {
        Self { config, fetcher }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/tenders", get(tenders_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("DPTF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let config = EngineConfig::from_env()?;
    let user_agent = std::env::var("DPTF_USER_AGENT")
        .unwrap_or_else(|_| HttpClientConfig::default().user_agent);
    let fetcher: Arc<dyn TableFetcher> = Arc::new(HtmlTableFetcher::new(HttpClientConfig {
        user_agent,
        ..HttpClientConfig::default()
    }));

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "tender report API listening");
    axum::serve(listener, app(AppState::new(config, fetcher))).await?;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "online",
        "message": "government procurement tender report API",
        "endpoints": {
            "/api/tenders": "today's procurement tenders (GET)"
        }
    }))
}

async fn tenders_handler(State(state): State<Arc<AppState>>) -> Response {
    let today = Local::now().date_naive();
    let report = run_report(state.fetcher.as_ref(), &state.config, today).await;
    let status = if report.succeeded {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}
