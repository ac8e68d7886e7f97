//! Shared application state.

use std::sync::Arc;

use axum::extract::State;

use cloudmonitor_core::collector::Collector;
use cloudmonitor_core::exposition::Exposition;

pub(crate) struct ExporterState {
    pub(crate) collector: Collector,
    pub(crate) exposition: Exposition,
    // Path the scrape endpoint is mounted on, linked from the landing page.
    pub(crate) metrics_path: String,
}

pub(crate) type SharedState = Arc<ExporterState>;

pub(crate) type AppState = State<SharedState>;
