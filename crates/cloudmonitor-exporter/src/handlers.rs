//! HTTP request handlers: scrape endpoint, JSON API and landing page.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use tracing::{debug, error};

use cloudmonitor_core::catalog::Catalog;
use cloudmonitor_core::exposition::TEXT_CONTENT_TYPE;

use crate::state::AppState;

// ============================================================
// Scrape
// ============================================================

/// Runs one collection pass and returns it in the text exposition format.
///
/// Partial upstream failures still produce a 200 with the samples that could
/// be collected.
pub(crate) async fn handle_metrics(State(state): AppState) -> Response {
    let report = state.collector.collect().await;
    debug!(
        samples = report.samples.len(),
        failures = report.failures.len(),
        "scrape collected"
    );

    match state.exposition.render(&report) {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ============================================================
// Health
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Catalog
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/catalog",
    responses(
        (status = 200, description = "Enabled categories and their metric definitions", body = Catalog)
    )
)]
pub(crate) async fn handle_catalog(State(state): AppState) -> Json<Catalog> {
    Json(Catalog::clone(state.collector.catalog()))
}

// ============================================================
// Landing page
// ============================================================

pub(crate) async fn handle_index(State(state): AppState) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>CloudMonitor Exporter</title></head>\n\
         <body>\n\
         <h1>CloudMonitor Exporter</h1>\n\
         <p><a href=\"{path}\">Metrics</a></p>\n\
         <p><a href=\"/api/v1/catalog\">Catalog</a></p>\n\
         </body>\n\
         </html>\n",
        path = state.metrics_path
    ))
}
