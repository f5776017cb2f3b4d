use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use asset_registry::{AssetRegistry, RegistryConfig};
use audit_chain::{Attestation, AuditChain, EventKind};
use core_types::{FeeEvent, FeeTotals, LedgerRpc, TrackedAsset};
use cycle_orchestrator::{CycleOrchestrator, CycleOutcome, CycleStats, Readiness, RecoveryReport};
use dead_letter::DeadLetterQueue;
use fee_tracker::{FeeTracker, PollReport, SyncStatus, TrackerStats};
use infra_clock::SharedClock;
use ledger_gateway::{GatewayHealth, LedgerGateway};
use serde::Serialize;
use serde_json::json;
use state_store::{PersistedState, StateStore, SCHEMA_VERSION};

use crate::config_loader::ServiceConfig;
use crate::execution_bridge::LedgerPorts;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HealthSnapshot {
    pub(crate) status: &'static str,
    pub(crate) uptime_ms: i64,
    pub(crate) dry_run: bool,
    pub(crate) tracked_assets: usize,
    pub(crate) dead_letters_pending: usize,
    pub(crate) gateway: Option<GatewayHealth>,
    pub(crate) tracker: TrackerStats,
    pub(crate) cycle: CycleStats,
    pub(crate) attestation: Attestation,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FlushReport {
    pub(crate) poll: PollReport,
    pub(crate) saved_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StartupReport {
    pub(crate) restored_assets: usize,
    pub(crate) discovered_assets: usize,
    pub(crate) recovery: Option<RecoveryReport>,
    pub(crate) sync: Option<SyncStatus>,
}

/// What one poll tick did: the poll itself and, when ready, a cycle.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct TickReport {
    pub(crate) poll: PollReport,
    pub(crate) readiness: Readiness,
    pub(crate) cycle: Option<CycleOutcome>,
}

/// Every long-lived component of the service, wired once at startup.
pub(crate) struct AppContext {
    cfg: ServiceConfig,
    clock: SharedClock,
    ledger: Arc<dyn LedgerRpc>,
    gateway: Option<Arc<LedgerGateway>>,
    registry: Arc<AssetRegistry>,
    tracker: Arc<FeeTracker>,
    orchestrator: Arc<CycleOrchestrator>,
    dead_letters: Arc<DeadLetterQueue>,
    audit: Arc<AuditChain>,
    state_store: StateStore,
    started_at_ms: i64,
}

impl AppContext {
    /// Opens the on-disk documents. A broken audit chain is fatal here.
    pub(crate) fn assemble(
        cfg: ServiceConfig,
        ports: LedgerPorts,
        clock: SharedClock,
    ) -> Result<Self> {
        let storage = &cfg.storage;
        fs::create_dir_all(&storage.data_root).with_context(|| {
            format!("create data root {}", storage.data_root.display())
        })?;

        let audit = Arc::new(
            AuditChain::open(&storage.audit_path(), storage.audit_window, clock.clone())
                .context("open audit chain")?,
        );
        let registry = Arc::new(AssetRegistry::new(
            RegistryConfig {
                authority: cfg.ledger.authority.clone(),
                fee_account: cfg.ledger.fee_account.clone(),
                history_scan_limit: cfg.ledger.history_scan_limit,
            },
            ports.ledger.clone(),
            ports.pools.clone(),
            clock.clone(),
        ));
        let tracker = Arc::new(FeeTracker::new(
            cfg.tracker.clone(),
            ports.ledger.clone(),
            registry.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let dead_letters = Arc::new(
            DeadLetterQueue::open(
                cfg.dead_letter.clone(),
                storage.dead_letter_path(),
                clock.clone(),
            )
            .context("open dead letter queue")?,
        );
        let orchestrator = Arc::new(CycleOrchestrator::new(
            cfg.cycle.clone(),
            cfg.allocator.clone(),
            ports.ledger.clone(),
            ports.executor.clone(),
            registry.clone(),
            tracker.clone(),
            dead_letters.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let state_store = StateStore::new(storage.state_path(), storage.state_backups);
        let started_at_ms = clock.now_ms();

        Ok(Self {
            cfg,
            clock,
            ledger: ports.ledger,
            gateway: ports.gateway,
            registry,
            tracker,
            orchestrator,
            dead_letters,
            audit,
            state_store,
            started_at_ms,
        })
    }

    /// Restore, discover, recover, then align counters with the ledger.
    /// Only an unreadable state file is fatal; ledger trouble is logged.
    pub(crate) async fn startup(&self) -> Result<StartupReport> {
        let restored_assets = self.restore_state()?;

        let discovered_assets = match self.registry.discover().await {
            Ok(found) => found.len(),
            Err(err) => {
                tracing::warn!(?err, "asset discovery failed, continuing with restored set");
                0
            }
        };

        if let Some(root) = self.cfg.ledger.root_asset.as_deref() {
            if self.registry.contains(root) {
                self.registry.set_root(root)?;
            } else {
                self.registry.initialize_tracking(root, true).await;
            }
        }

        let recovery = self.orchestrator.recover_from_crash();

        let sync = match self.tracker.verify_sync_status().await {
            Ok(status) if status.in_sync => Some(status),
            Ok(status) => {
                tracing::info!(
                    difference = %status.difference_units,
                    "startup divergence, reconciling against ledger"
                );
                match self.tracker.reconcile().await {
                    Ok(_) => self.tracker.verify_sync_status().await.ok(),
                    Err(err) => {
                        tracing::warn!(?err, "startup reconciliation failed");
                        Some(status)
                    }
                }
            }
            Err(err) => {
                tracing::warn!(?err, "startup sync check failed");
                None
            }
        };

        let slot = self.ledger.get_slot().await.ok();
        self.audit.record(
            EventKind::ServiceStarted,
            json!({
                "authority": self.cfg.ledger.authority,
                "network": self.cfg.service.network,
                "dry_run": self.cfg.execution.mode.is_dry_run(),
                "tracked_assets": self.registry.len(),
                "restored_assets": restored_assets,
                "discovered_assets": discovered_assets,
            }),
            slot,
        );
        tracing::info!(
            tracked = self.registry.len(),
            restored = restored_assets,
            discovered = discovered_assets,
            "service started"
        );

        Ok(StartupReport {
            restored_assets,
            discovered_assets,
            recovery,
            sync,
        })
    }

    fn restore_state(&self) -> Result<usize> {
        let Some(state) = self.state_store.load().context("load persisted state")? else {
            tracing::info!(path = %self.state_store.path().display(), "no persisted state, fresh start");
            return Ok(0);
        };
        if state.authority_address != self.cfg.ledger.authority {
            tracing::warn!(
                persisted = %state.authority_address,
                configured = %self.cfg.ledger.authority,
                "persisted state belongs to another authority, ignoring it"
            );
            return Ok(0);
        }
        self.registry.restore(&state.tokens);
        self.tracker.restore_meta(state.fee_tracking_meta);
        Ok(state.tokens.len())
    }

    pub(crate) fn save_state(&self) -> Result<i64> {
        let now = self.clock.now_ms();
        let state = PersistedState {
            schema_version: SCHEMA_VERSION,
            saved_at_ms: now,
            authority_address: self.cfg.ledger.authority.clone(),
            network: self.cfg.service.network.clone(),
            tokens: self.registry.to_persisted(),
            fee_tracking_meta: self.tracker.snapshot_meta(),
        };
        self.state_store.save(&state).context("save state")?;
        tracing::debug!(assets = state.tokens.len(), "state saved");
        Ok(now)
    }

    /// Poll, then run a cycle if the orchestrator says it is ready.
    pub(crate) async fn poll_tick(&self) -> TickReport {
        let poll = self.tracker.poll().await;
        let readiness = self.orchestrator.check_cycle_readiness();
        let cycle = if readiness.ready {
            let outcome = self.orchestrator.execute_cycle().await;
            if matches!(outcome, CycleOutcome::Finished(_)) {
                if let Err(err) = self.save_state() {
                    tracing::warn!(?err, "state save after cycle failed");
                }
            }
            Some(outcome)
        } else {
            None
        };
        TickReport {
            poll,
            readiness,
            cycle,
        }
    }

    pub(crate) async fn periodic_reconciliation(&self) -> Result<SyncStatus> {
        self.tracker.periodic_reconciliation().await
    }

    /// Best effort: nothing here may keep the process from exiting.
    pub(crate) async fn shutdown(&self, reason: &str) {
        if let Err(err) = self.save_state() {
            tracing::warn!(?err, "final state save failed");
        }
        let slot = self.ledger.get_slot().await.ok();
        self.audit.record(
            EventKind::ServiceStopped,
            json!({
                "reason": reason,
                "uptime_ms": self.clock.now_ms() - self.started_at_ms,
                "tracked_assets": self.registry.len(),
            }),
            slot,
        );
        tracing::info!(reason, "service stopped");
    }

    pub(crate) fn get_totals(&self) -> FeeTotals {
        self.registry.totals()
    }

    pub(crate) fn get_fee_records(&self, limit: usize) -> Vec<FeeEvent> {
        self.tracker.recent_fees(limit)
    }

    pub(crate) fn get_tracked_assets(&self) -> Vec<TrackedAsset> {
        self.registry.snapshot()
    }

    pub(crate) fn get_attestation(&self) -> Attestation {
        self.audit.attestation()
    }

    pub(crate) fn check_cycle_readiness(&self) -> Readiness {
        self.orchestrator.check_cycle_readiness()
    }

    pub(crate) async fn execute_cycle(&self) -> CycleOutcome {
        let outcome = self.orchestrator.execute_cycle().await;
        if matches!(outcome, CycleOutcome::Finished(_)) {
            if let Err(err) = self.save_state() {
                tracing::warn!(?err, "state save after cycle failed");
            }
        }
        outcome
    }

    pub(crate) async fn verify_sync_status(&self) -> Result<SyncStatus> {
        self.tracker.verify_sync_status().await
    }

    pub(crate) async fn force_flush(&self) -> Result<FlushReport> {
        let poll = self.tracker.poll().await;
        let saved_at_ms = self.save_state()?;
        Ok(FlushReport { poll, saved_at_ms })
    }

    pub(crate) fn health(&self) -> HealthSnapshot {
        let gateway = self.gateway.as_ref().map(|g| g.health());
        let healthy = gateway.as_ref().map(|g| g.healthy).unwrap_or(true);
        HealthSnapshot {
            status: if healthy { "ok" } else { "degraded" },
            uptime_ms: self.clock.now_ms() - self.started_at_ms,
            dry_run: self.cfg.execution.mode.is_dry_run(),
            tracked_assets: self.registry.len(),
            dead_letters_pending: self.dead_letters.pending_count(),
            gateway,
            tracker: self.tracker.stats(),
            cycle: self.orchestrator.stats(),
            attestation: self.audit.attestation(),
        }
    }

    pub(crate) fn config(&self) -> &ServiceConfig {
        &self.cfg
    }
}
