use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    Some(guard)
}

pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    describe_service_metrics();

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

fn describe_service_metrics() {
    describe_counter!("gateway.requests", "ledger rpc attempts, labelled by method");
    describe_counter!("gateway.failures", "failed ledger rpc attempts");
    describe_counter!("gateway.failovers", "endpoint switches after failover-class errors");
    describe_counter!("gateway.circuit_open", "calls rejected while the breaker was open");
    describe_histogram!("gateway.latency_ms", Unit::Milliseconds, "ledger rpc latency");
    describe_counter!("fees.polls", "fee account polls");
    describe_counter!("fees.attributed_units", "base units attributed to tracked assets");
    describe_counter!("fees.unattributed", "positive deltas dropped without attribution");
    describe_counter!("fees.reconciliations", "divergence corrections");
    describe_gauge!("fees.pending_units", "sum of pending counters across assets");
    describe_counter!("cycle.started", "cycles that passed the in-progress guard");
    describe_counter!("cycle.completed", "cycles that reached finalize");
    describe_counter!("cycle.failed", "per-asset execution failures");
    describe_counter!("audit.appends", "audit chain entries written");
    describe_gauge!("dead_letter.pending", "dead letter entries awaiting retry");
    describe_counter!("dead_letter.appended", "per-asset failures parked for retry");
    describe_histogram!("cycle.duration_ms", Unit::Milliseconds, "wall time of finished cycles");
}

/// Short tag for log fields, e.g. `7xKX…9fQa`.
pub fn short_address(address: &str) -> String {
    let chars = address.chars().collect::<Vec<_>>();
    if chars.len() <= 10 {
        return address.to_string();
    }
    let head = chars[..4].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}…{tail}")
}
