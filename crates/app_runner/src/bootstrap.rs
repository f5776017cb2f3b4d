use std::net::SocketAddr;

use anyhow::Context;
use infra_clock::system_clock;
use observability::{init_metrics, init_tracing};
use tokio::sync::watch;

use crate::config_loader::load_service_config;
use crate::control_api::build_router;
use crate::execution_bridge::build_ledger_ports;
use crate::orchestration::{
    spawn_poll_loop, spawn_reconcile_loop, spawn_save_loop, wait_for_shutdown_signal,
};

use super::*;

pub(super) async fn async_main() -> Result<()> {
    let _guard = init_tracing("app_runner");
    let prometheus = init_metrics()?;

    let cfg = load_service_config().context("load service config")?;
    tracing::info!(
        network = %cfg.service.network,
        fee_account = %observability::short_address(&cfg.ledger.fee_account),
        dry_run = cfg.execution.mode.is_dry_run(),
        "configuration loaded"
    );

    let clock = system_clock();
    let ports = build_ledger_ports(&cfg, clock.clone())?;
    let control = cfg.control.clone();
    let ctx = Arc::new(AppContext::assemble(cfg, ports, clock)?);
    let startup = ctx.startup().await?;
    if let Some(recovery) = &startup.recovery {
        tracing::warn!(
            cycle_id = %recovery.cycle_id,
            disposition = %recovery.disposition,
            "previous cycle did not finish"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        spawn_poll_loop(ctx.clone(), shutdown_rx.clone()),
        spawn_save_loop(ctx.clone(), shutdown_rx.clone()),
        spawn_reconcile_loop(ctx.clone(), shutdown_rx.clone()),
    ];

    if control.enabled {
        let addr: SocketAddr = control
            .bind
            .parse()
            .with_context(|| format!("control.bind {:?} is not a socket address", control.bind))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind control api on {addr}"))?;
        let app = build_router(AppState {
            ctx: ctx.clone(),
            prometheus,
        });
        let mut stop = shutdown_rx.clone();
        tracing::info!(%addr, "control api listening");
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.changed().await;
                })
                .await;
            if let Err(err) = served {
                tracing::error!(?err, "control api stopped");
            }
        }));
    }

    let reason = wait_for_shutdown_signal().await;
    tracing::info!(reason, "shutdown requested");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(?err, "task ended abnormally");
        }
    }
    ctx.shutdown(reason).await;
    Ok(())
}
