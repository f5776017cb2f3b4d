use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::context::AppContext;

mod bootstrap;
mod config_loader;
mod context;
mod control_api;
mod execution_bridge;
mod orchestration;

#[cfg(test)]
mod tests;

/// Shared by every control route.
#[derive(Clone)]
struct AppState {
    ctx: Arc<AppContext>,
    prometheus: PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::async_main().await
}
