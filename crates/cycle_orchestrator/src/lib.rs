use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use asset_registry::AssetRegistry;
use audit_chain::{units, AuditChain, EventKind};
use core_types::{
    is_swap_step_failure, is_transient_message, new_id, AssetAllocation, AssetRole, Confirmation,
    ExecutionRequest, LedgerExecutionClient, LedgerRpc, TrackedAsset, Units,
};
use dead_letter::DeadLetterQueue;
use fee_allocator::{
    calculate_dynamic_allocation, normalize, split_root_share, AllocationPlan, AllocatorConfig,
};
use fee_tracker::FeeTracker;
use infra_clock::SharedClock;
use observability::short_address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use token_selector::{eligible, select_for_cycle};

pub mod checkpoint;

pub use checkpoint::{CheckpointStore, CyclePhase, CycleProgress};

/// Floor for `CycleConfig::cooldown_ms`.
pub const MIN_COOLDOWN_MS: i64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CycleConfig {
    /// Minimum gap between cycle attempts.
    pub cooldown_ms: i64,
    /// A leftover checkpoint older than this is reported as stale.
    pub stale_checkpoint_ms: i64,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    /// Doubles per retry: 1 s, 2 s, 4 s.
    pub retry_base_delay_ms: u64,
    pub checkpoint_path: PathBuf,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: MIN_COOLDOWN_MS,
            stale_checkpoint_ms: 5 * 60 * 1000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            checkpoint_path: PathBuf::from("var/cycle_progress.json"),
        }
    }
}

/// Result of one per-asset execution. Exactly one of signature or error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TokenOutcome {
    Burned {
        signature: String,
        attempts: u32,
    },
    Failed {
        error: String,
        attempts: u32,
        swap_step: bool,
    },
}

impl TokenOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Burned { .. })
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            Self::Burned { signature, .. } => Some(signature),
            Self::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenResult {
    pub asset_address: String,
    pub symbol: String,
    pub role: AssetRole,
    pub allocation_units: Units,
    pub root_share_units: Units,
    pub outcome: TokenOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub fee_balance_units: Units,
    pub plan: AllocationPlan,
    pub results: Vec<TokenResult>,
}

impl CycleReport {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CycleOutcome {
    /// Another cycle held the in-progress flag.
    Skipped,
    Blocked { reason: String },
    Finished(CycleReport),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum NotReady {
    CycleRunning,
    Cooldown { remaining_ms: i64 },
    NoEligibleAssets,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Readiness {
    pub ready: bool,
    #[serde(default)]
    pub not_ready: Option<NotReady>,
    pub eligible_assets: usize,
    pub total_pending_units: Units,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryReport {
    pub cycle_id: String,
    pub phase: Option<CyclePhase>,
    pub completed_asset_addresses: Vec<String>,
    pub age_ms: i64,
    pub disposition: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CycleStats {
    pub running: bool,
    pub attempts: u64,
    pub completed: u64,
    pub blocked: u64,
    pub skipped: u64,
    pub tokens_burned: u64,
    pub tokens_failed: u64,
    pub last_attempt_at_ms: Option<i64>,
    pub last_completed_at_ms: Option<i64>,
    pub last_cycle_id: Option<String>,
}

/// Clears the in-progress flag however the cycle exits.
struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct CycleOrchestrator {
    cfg: CycleConfig,
    allocator: AllocatorConfig,
    ledger: Arc<dyn LedgerRpc>,
    executor: Arc<dyn LedgerExecutionClient>,
    registry: Arc<AssetRegistry>,
    tracker: Arc<FeeTracker>,
    dead_letters: Arc<DeadLetterQueue>,
    audit: Arc<AuditChain>,
    clock: SharedClock,
    checkpoint: CheckpointStore,
    running: AtomicBool,
    stats: Mutex<CycleStats>,
}

impl CycleOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: CycleConfig,
        allocator: AllocatorConfig,
        ledger: Arc<dyn LedgerRpc>,
        executor: Arc<dyn LedgerExecutionClient>,
        registry: Arc<AssetRegistry>,
        tracker: Arc<FeeTracker>,
        dead_letters: Arc<DeadLetterQueue>,
        audit: Arc<AuditChain>,
        clock: SharedClock,
    ) -> Self {
        let checkpoint = CheckpointStore::new(cfg.checkpoint_path.clone());
        Self {
            cfg,
            allocator,
            ledger,
            executor,
            registry,
            tracker,
            dead_letters,
            audit,
            clock,
            checkpoint,
            running: AtomicBool::new(false),
            stats: Mutex::new(CycleStats::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CycleStats {
        let mut stats = self.stats.lock().clone();
        stats.running = self.is_running();
        stats
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                flag: &self.running,
            })
    }

    /// Startup only. A leftover checkpoint is never resumed: it is reported,
    /// audited and removed.
    pub fn recover_from_crash(&self) -> Option<RecoveryReport> {
        let now = self.clock.now_ms();
        let report = match self.checkpoint.load() {
            Ok(None) => return None,
            Ok(Some(progress)) => {
                let age_ms = now.saturating_sub(progress.started_at_ms);
                let disposition = if age_ms > self.cfg.stale_checkpoint_ms {
                    "stale"
                } else {
                    "abandoned"
                };
                RecoveryReport {
                    cycle_id: progress.cycle_id,
                    phase: Some(progress.phase),
                    completed_asset_addresses: progress.completed_asset_addresses,
                    age_ms,
                    disposition: disposition.to_string(),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cycle checkpoint unreadable");
                RecoveryReport {
                    cycle_id: String::new(),
                    phase: None,
                    completed_asset_addresses: Vec::new(),
                    age_ms: 0,
                    disposition: "unreadable".to_string(),
                }
            }
        };

        tracing::warn!(
            cycle_id = %report.cycle_id,
            phase = ?report.phase,
            completed = report.completed_asset_addresses.len(),
            age_ms = report.age_ms,
            disposition = %report.disposition,
            "interrupted cycle found; discarding checkpoint"
        );
        self.audit.record(
            EventKind::CrashRecovery,
            json!({
                "cycle_id": report.cycle_id,
                "phase": report.phase.map(CyclePhase::as_str),
                "completed_asset_addresses": report.completed_asset_addresses,
                "age_ms": report.age_ms,
                "disposition": report.disposition,
            }),
            None,
        );
        if let Err(err) = self.checkpoint.clear() {
            tracing::error!(error = %err, "failed to remove cycle checkpoint");
        }
        Some(report)
    }

    pub fn check_cycle_readiness(&self) -> Readiness {
        let now = self.clock.now_ms();
        let assets = self.registry.snapshot();
        let total_pending_units = assets.iter().map(|a| a.pending_fee_units).sum();
        let eligible_assets = assets
            .iter()
            .filter(|a| a.pending_fee_units >= self.allocator.per_asset_reserve())
            .filter(|a| !self.dead_letters.is_blocked(&a.address, now))
            .count();

        let not_ready = if self.is_running() {
            Some(NotReady::CycleRunning)
        } else if let Some(remaining_ms) = self.cooldown_remaining_ms(now) {
            Some(NotReady::Cooldown { remaining_ms })
        } else if eligible_assets == 0 {
            Some(NotReady::NoEligibleAssets)
        } else {
            None
        };
        Readiness {
            ready: not_ready.is_none(),
            not_ready,
            eligible_assets,
            total_pending_units,
        }
    }

    fn cooldown_remaining_ms(&self, now: i64) -> Option<i64> {
        let last = self.stats.lock().last_attempt_at_ms?;
        let remaining = last + self.cfg.cooldown_ms - now;
        (remaining > 0).then_some(remaining)
    }

    /// Run one cycle. A call made while another is in flight is skipped; a
    /// call inside the cooldown is blocked and leaves the window unchanged.
    pub async fn execute_cycle(&self) -> CycleOutcome {
        let Some(_running) = self.try_begin() else {
            self.stats.lock().skipped += 1;
            tracing::info!("cycle already running; skipped");
            return CycleOutcome::Skipped;
        };
        let started_at_ms = self.clock.now_ms();
        if let Some(remaining_ms) = self.cooldown_remaining_ms(started_at_ms) {
            self.stats.lock().blocked += 1;
            tracing::info!(remaining_ms, "cycle cooldown active");
            return CycleOutcome::Blocked {
                reason: format!("cooldown active for another {remaining_ms} ms"),
            };
        }
        let cycle_id = new_id();
        {
            let mut stats = self.stats.lock();
            stats.attempts += 1;
            stats.last_attempt_at_ms = Some(started_at_ms);
            stats.last_cycle_id = Some(cycle_id.clone());
        }
        metrics::counter!("cycle.started").increment(1);

        let outcome = self.run_cycle(cycle_id, started_at_ms).await;
        match &outcome {
            CycleOutcome::Finished(report) => {
                let mut stats = self.stats.lock();
                stats.completed += 1;
                stats.last_completed_at_ms = Some(report.finished_at_ms);
                stats.tokens_burned += report.success_count() as u64;
                stats.tokens_failed += report.failure_count() as u64;
            }
            CycleOutcome::Blocked { reason } => {
                self.stats.lock().blocked += 1;
                tracing::warn!(%reason, "cycle blocked");
            }
            CycleOutcome::Skipped => {}
        }
        outcome
    }

    async fn run_cycle(&self, cycle_id: String, started_at_ms: i64) -> CycleOutcome {
        let due = self.dead_letters.process(started_at_ms);
        if !due.is_empty() {
            tracing::info!(due = due.len(), "dead letters due for retry this cycle");
        }

        match self.tracker.pre_cycle_verification().await {
            Ok(true) => {}
            Ok(false) => {
                return CycleOutcome::Blocked {
                    reason: "fee counters diverged from ledger and were reconciled".to_string(),
                }
            }
            Err(err) => {
                return CycleOutcome::Blocked {
                    reason: format!("pre-cycle verification failed: {err:#}"),
                }
            }
        }

        let mut progress = CycleProgress::new(cycle_id.clone(), started_at_ms);
        self.write_checkpoint(&mut progress, CyclePhase::Pre);

        let balance = match self.ledger.get_balance(self.tracker.fee_account()).await {
            Ok(balance) => balance,
            Err(err) => {
                self.clear_checkpoint();
                return CycleOutcome::Blocked {
                    reason: format!("fee balance unavailable: {err:#}"),
                };
            }
        };
        let collected = balance.saturating_sub(self.tracker.rent_floor_units());
        let assets = self.registry.snapshot();
        let allocations = assets.iter().map(AssetAllocation::from_asset).collect::<Vec<_>>();
        let plan = normalize(&allocations, collected, &self.allocator);

        let now = self.clock.now_ms();
        let root_alloc = plan.allocations.iter().find(|a| a.is_root).cloned();
        let root_viable = root_alloc.as_ref().filter(|a| !a.deferred).map(|a| a.allocated_units);
        let secondaries = plan
            .allocations
            .iter()
            .filter(|a| !a.is_root)
            .filter(|a| !self.dead_letters.is_blocked(&a.asset_address, now))
            .cloned()
            .collect::<Vec<_>>();
        // assets whose retry window opened get the slot before fresh candidates
        let due_addresses = due.iter().map(|e| e.asset_address.as_str()).collect::<HashSet<_>>();
        let retrying = secondaries
            .iter()
            .filter(|a| due_addresses.contains(a.asset_address.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        let reserve = self.allocator.per_asset_reserve();
        let candidates = if eligible(&retrying, reserve).is_empty() {
            &secondaries
        } else {
            &retrying
        };
        let slot = match self.ledger.get_slot().await {
            Ok(slot) => slot,
            Err(err) => {
                tracing::warn!(error = %err, "slot unavailable; selecting by clock");
                now.max(0) as u64
            }
        };
        let selection = select_for_cycle(candidates, slot, reserve);

        if selection.is_none() && root_viable.is_none() {
            self.clear_checkpoint();
            return CycleOutcome::Blocked {
                reason: format!(
                    "no viable allocation ({} deferred of {})",
                    plan.deferred_count,
                    plan.allocations.len()
                ),
            };
        }

        self.audit.record(
            EventKind::CycleStarted,
            json!({
                "cycle_id": cycle_id,
                "fee_balance_units": units(balance),
                "collected_units": units(collected),
                "viable": plan.viable_count,
                "deferred": plan.deferred_count,
                "selected": selection.as_ref().map(|s| s.asset_address.clone()),
            }),
            Some(slot),
        );
        tracing::info!(
            %cycle_id,
            balance = %balance,
            viable = plan.viable_count,
            deferred = plan.deferred_count,
            selected = ?selection.as_ref().map(|s| s.symbol.clone()),
            "cycle started"
        );

        let mut budget = selection.as_ref().map_or(0, |s| s.allocated_units) + root_viable.unwrap_or(0);
        let mut results = Vec::new();

        self.write_checkpoint(&mut progress, CyclePhase::Secondaries);
        if let Some(selected) = &selection {
            if let Some(asset) = assets.iter().find(|a| a.address == selected.asset_address) {
                let remaining_count = if root_viable.is_some() { 2 } else { 1 };
                let allocation = calculate_dynamic_allocation(
                    budget,
                    selected.allocated_units,
                    budget,
                    remaining_count,
                    &self.allocator,
                );
                let root_share = if self.registry.root().is_some() {
                    split_root_share(allocation, self.allocator.root_share_bps).1
                } else {
                    0
                };
                let request = self.request_for(&cycle_id, asset, allocation, root_share);
                let outcome = self.execute_token_with_retry(&request).await;
                budget -= if outcome.is_success() {
                    allocation
                } else {
                    // the failed asset keeps its share for a later cycle
                    selected.allocated_units.min(budget)
                };
                if outcome.is_success() {
                    progress.completed_asset_addresses.push(asset.address.clone());
                }
                results.push(result_for(&request, outcome));
            }
        }

        self.write_checkpoint(&mut progress, CyclePhase::Root);
        if let (Some(root), Some(_)) = (self.registry.root(), root_viable) {
            if budget >= self.allocator.minimum_viable_units() {
                let allocation = calculate_dynamic_allocation(
                    budget,
                    root.pending_fee_units,
                    root.pending_fee_units,
                    1,
                    &self.allocator,
                );
                let request = self.request_for(&cycle_id, &root, allocation, 0);
                let outcome = self.execute_token_with_retry(&request).await;
                if outcome.is_success() {
                    progress.completed_asset_addresses.push(root.address.clone());
                }
                results.push(result_for(&request, outcome));
            } else {
                tracing::info!(budget = %budget, "root share below minimum; deferred");
            }
        }

        self.write_checkpoint(&mut progress, CyclePhase::Finalize);
        for result in &results {
            self.finalize_token(&cycle_id, result);
        }

        let report = CycleReport {
            cycle_id: cycle_id.clone(),
            started_at_ms,
            finished_at_ms: self.clock.now_ms(),
            fee_balance_units: balance,
            plan,
            results,
        };
        let (kind, label) = if report.success_count() > 0 {
            (EventKind::CycleCompleted, "completed")
        } else {
            (EventKind::CycleFailed, "failed")
        };
        self.audit.record(
            kind,
            json!({
                "cycle_id": cycle_id,
                "burned": report.success_count(),
                "failed": report.failure_count(),
                "duration_ms": report.finished_at_ms - report.started_at_ms,
            }),
            None,
        );
        metrics::counter!("cycle.completed", "result" => label).increment(1);
        metrics::histogram!("cycle.duration_ms")
            .record((report.finished_at_ms - report.started_at_ms) as f64);
        tracing::info!(
            %cycle_id,
            burned = report.success_count(),
            failed = report.failure_count(),
            "cycle finished"
        );
        self.clear_checkpoint();
        CycleOutcome::Finished(report)
    }

    fn request_for(
        &self,
        cycle_id: &str,
        asset: &TrackedAsset,
        allocation: Units,
        root_share: Units,
    ) -> ExecutionRequest {
        ExecutionRequest {
            cycle_id: cycle_id.to_string(),
            asset_address: asset.address.clone(),
            symbol: asset.symbol.to_string(),
            role: asset.role(),
            pool_address: asset.pool_address.clone(),
            pool_kind: asset.pool_kind,
            allocation_units: allocation,
            root_share_units: root_share,
        }
    }

    /// Counters, dead letters and audit for one executed asset.
    fn finalize_token(&self, cycle_id: &str, result: &TokenResult) {
        match &result.outcome {
            TokenOutcome::Burned { signature, attempts } => {
                if let Err(err) = self.registry.reset_fees(
                    &result.asset_address,
                    result.allocation_units,
                    Some(signature.clone()),
                ) {
                    tracing::warn!(error = %err, "burned asset missing from registry");
                }
                self.dead_letters.mark_resolved(&result.asset_address);
                self.audit.record(
                    EventKind::TokenBurned,
                    json!({
                        "cycle_id": cycle_id,
                        "asset": result.asset_address,
                        "symbol": result.symbol,
                        "role": result.role,
                        "allocation_units": units(result.allocation_units),
                        "root_share_units": units(result.root_share_units),
                        "signature": signature,
                        "attempts": attempts,
                    }),
                    None,
                );
            }
            TokenOutcome::Failed {
                error,
                attempts,
                swap_step,
            } => {
                let pending = self
                    .registry
                    .get(&result.asset_address)
                    .map(|a| a.pending_fee_units)
                    .unwrap_or(0);
                let retry_count = self.dead_letters.retry_count_for(&result.asset_address) + 1;
                self.dead_letters.append(
                    &result.symbol,
                    &result.asset_address,
                    error,
                    pending,
                    result.allocation_units,
                    retry_count,
                );
                metrics::counter!("cycle.failed").increment(1);
                self.audit.record(
                    EventKind::TokenFailed,
                    json!({
                        "cycle_id": cycle_id,
                        "asset": result.asset_address,
                        "symbol": result.symbol,
                        "allocation_units": units(result.allocation_units),
                        "error": error,
                        "attempts": attempts,
                        "swap_step": swap_step,
                    }),
                    None,
                );
                self.audit.record(
                    EventKind::DeadLetter,
                    json!({
                        "asset": result.asset_address,
                        "retry_count": retry_count,
                        "transient": is_transient_message(error),
                    }),
                    None,
                );
            }
        }
    }

    /// Build, simulate, send and confirm one asset's transaction. Swap-step
    /// failures are final; transient ones are retried with doubling backoff.
    pub async fn execute_token_with_retry(&self, request: &ExecutionRequest) -> TokenOutcome {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let message = match self.attempt_once(request).await {
                Ok(signature) => {
                    tracing::info!(
                        asset = %short_address(&request.asset_address),
                        role = %request.role,
                        allocation = %request.allocation_units,
                        %signature,
                        attempts,
                        "burn confirmed"
                    );
                    return TokenOutcome::Burned {
                        signature,
                        attempts,
                    };
                }
                Err(message) => message,
            };

            let swap_step = is_swap_step_failure(&message);
            let retryable = !swap_step && is_transient_message(&message);
            if !retryable || attempts > self.cfg.max_retries {
                tracing::warn!(
                    asset = %short_address(&request.asset_address),
                    attempts,
                    swap_step,
                    error = %message,
                    "asset execution failed"
                );
                return TokenOutcome::Failed {
                    error: message,
                    attempts,
                    swap_step,
                };
            }

            let delay = self
                .cfg
                .retry_base_delay_ms
                .saturating_mul(1u64 << (attempts - 1).min(16));
            tracing::info!(
                asset = %short_address(&request.asset_address),
                attempt = attempts,
                delay_ms = delay,
                error = %message,
                "transient execution failure; retrying"
            );
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }

    async fn attempt_once(&self, request: &ExecutionRequest) -> Result<String, String> {
        let blockhash = self
            .ledger
            .get_latest_blockhash()
            .await
            .map_err(|e| format!("blockhash: {e:#}"))?;
        let prepared = self
            .executor
            .build_transaction(request, &blockhash)
            .await
            .map_err(|e| format!("build: {e:#}"))?;
        let simulation = self
            .ledger
            .simulate_transaction(&prepared.payload)
            .await
            .map_err(|e| format!("simulate: {e:#}"))?;
        if !simulation.is_ok() {
            return Err(format!("simulation failed: {}", simulation.failure_text()));
        }
        let signature = self
            .ledger
            .send_transaction(&prepared.payload)
            .await
            .map_err(|e| format!("send: {e:#}"))?;
        match self.ledger.confirm_transaction(&signature, &blockhash).await {
            Ok(Confirmation::Confirmed) => Ok(signature),
            Ok(Confirmation::Failed(err)) => Err(format!("transaction failed on ledger: {err}")),
            Ok(Confirmation::Expired) => {
                Err("transaction not confirmed: block height exceeded".to_string())
            }
            Err(err) => Err(format!("confirm: {err:#}")),
        }
    }

    fn write_checkpoint(&self, progress: &mut CycleProgress, phase: CyclePhase) {
        progress.phase = phase;
        progress.updated_at_ms = self.clock.now_ms();
        if let Err(err) = self.checkpoint.save(progress) {
            tracing::error!(error = %err, phase = phase.as_str(), "cycle checkpoint write failed");
        }
    }

    fn clear_checkpoint(&self) {
        if let Err(err) = self.checkpoint.clear() {
            tracing::error!(error = %err, "cycle checkpoint removal failed");
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }
}

fn result_for(request: &ExecutionRequest, outcome: TokenOutcome) -> TokenResult {
    TokenResult {
        asset_address: request.asset_address.clone(),
        symbol: request.symbol.clone(),
        role: request.role,
        allocation_units: request.allocation_units,
        root_share_units: request.root_share_units,
        outcome,
    }
}
