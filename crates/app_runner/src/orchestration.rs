use std::time::Duration;

use cycle_orchestrator::CycleOutcome;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::*;

fn interval(period_ms: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Poll the fee account and run a cycle whenever readiness allows.
/// A tick in progress finishes before shutdown is observed.
pub(super) fn spawn_poll_loop(
    ctx: Arc<AppContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period_ms = ctx.config().service.poll_interval_ms;
    tokio::spawn(async move {
        let mut ticker = interval(period_ms);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tick = ctx.poll_tick().await;
                    if tick.poll.processed > 0 || tick.poll.errors > 0 {
                        tracing::debug!(
                            processed = tick.poll.processed,
                            attributed = tick.poll.attributed,
                            errors = tick.poll.errors,
                            "poll tick"
                        );
                    }
                    match tick.cycle {
                        Some(CycleOutcome::Finished(report)) => tracing::info!(
                            cycle_id = %report.cycle_id,
                            burned = report.success_count(),
                            failed = report.failure_count(),
                            "cycle finished"
                        ),
                        Some(CycleOutcome::Blocked { reason }) => {
                            tracing::info!(%reason, "cycle blocked")
                        }
                        Some(CycleOutcome::Skipped) | None => {}
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("poll loop stopped");
    })
}

pub(super) fn spawn_save_loop(
    ctx: Arc<AppContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period_ms = ctx.config().service.save_interval_ms;
    tokio::spawn(async move {
        let mut ticker = interval(period_ms);
        // skip the immediate first tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = ctx.save_state() {
                        tracing::warn!(?err, "periodic state save failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("save loop stopped");
    })
}

pub(super) fn spawn_reconcile_loop(
    ctx: Arc<AppContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period_ms = ctx.config().service.reconcile_interval_ms;
    tokio::spawn(async move {
        let mut ticker = interval(period_ms);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match ctx.periodic_reconciliation().await {
                        Ok(status) if !status.in_sync => tracing::warn!(
                            difference = %status.difference_units,
                            "reconciliation left counters out of sync"
                        ),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(?err, "periodic reconciliation failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("reconcile loop stopped");
    })
}

/// Resolves on SIGINT, or SIGTERM on unix. Returns the signal name.
pub(super) async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "sigint",
                    _ = term.recv() => "sigterm",
                }
            }
            Err(err) => {
                tracing::warn!(?err, "cannot install SIGTERM handler, waiting for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                "sigint"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "sigint"
    }
}
