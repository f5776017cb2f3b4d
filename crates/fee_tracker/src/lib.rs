use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use asset_registry::AssetRegistry;
use audit_chain::{units, AuditChain, EventKind};
use core_types::{FeeEvent, FeeTrackingMeta, LedgerRpc, SignatureInfo, TransactionDetail, Units};
use infra_clock::SharedClock;
use observability::short_address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod attribution;
pub mod processed;

pub use attribution::{default_strategies, AttributionSource, AttributionStrategy};
pub use processed::ProcessedSignatureSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub fee_account: String,
    /// Signatures requested per poll.
    pub poll_limit: usize,
    pub processed_capacity: usize,
    pub recent_capacity: usize,
    /// Balance the fee account keeps that is never fee value.
    pub rent_floor_units: u64,
    pub divergence_tolerance_bps: u32,
    pub min_divergence_units: u64,
    pub dynamic_discovery: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            fee_account: String::new(),
            poll_limit: 100,
            processed_capacity: 10_000,
            recent_capacity: 500,
            rent_floor_units: 890_880,
            divergence_tolerance_bps: 100,
            min_divergence_units: 1_000_000,
            dynamic_discovery: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PollReport {
    pub fetched: usize,
    pub processed: usize,
    pub attributed: usize,
    pub unattributed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub in_sync: bool,
    pub balance_units: Units,
    pub attributable_units: Units,
    pub baseline_units: Units,
    pub expected_pending_units: Units,
    pub tracked_pending_units: Units,
    pub difference_units: Units,
    pub checked_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileReport {
    pub cleared_pending_units: Units,
    pub baseline_units: Units,
    pub signatures_marked: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerStats {
    pub poll_count: u64,
    pub error_count: u64,
    pub attributed_count: u64,
    pub unattributed_count: u64,
    pub unattributed_units: Units,
    pub processed_signatures: usize,
    pub last_processed_signature: Option<String>,
    pub baseline_units: Units,
    pub last_poll_at_ms: Option<i64>,
    pub last_sync: Option<SyncStatus>,
}

enum TxOutcome {
    NoFee,
    Attributed,
    Unattributed,
}

struct TrackerState {
    processed: ProcessedSignatureSet,
    last_processed: Option<String>,
    poll_count: u64,
    error_count: u64,
    attributed_count: u64,
    unattributed_count: u64,
    unattributed_units: Units,
    baseline_units: Units,
    recent: VecDeque<FeeEvent>,
    last_poll_at_ms: Option<i64>,
    last_sync: Option<SyncStatus>,
}

/// Watches the fee account and folds attributed deltas into registry counters.
pub struct FeeTracker {
    cfg: TrackerConfig,
    ledger: Arc<dyn LedgerRpc>,
    registry: Arc<AssetRegistry>,
    audit: Arc<AuditChain>,
    clock: SharedClock,
    strategies: Vec<Box<dyn AttributionStrategy>>,
    poll_lock: tokio::sync::Mutex<()>,
    state: Mutex<TrackerState>,
}

impl FeeTracker {
    pub fn new(
        cfg: TrackerConfig,
        ledger: Arc<dyn LedgerRpc>,
        registry: Arc<AssetRegistry>,
        audit: Arc<AuditChain>,
        clock: SharedClock,
    ) -> Self {
        let strategies = default_strategies(cfg.dynamic_discovery);
        let state = TrackerState {
            processed: ProcessedSignatureSet::new(cfg.processed_capacity),
            last_processed: None,
            poll_count: 0,
            error_count: 0,
            attributed_count: 0,
            unattributed_count: 0,
            unattributed_units: 0,
            baseline_units: 0,
            recent: VecDeque::new(),
            last_poll_at_ms: None,
            last_sync: None,
        };
        Self {
            cfg,
            ledger,
            registry,
            audit,
            clock,
            strategies,
            poll_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    pub fn fee_account(&self) -> &str {
        &self.cfg.fee_account
    }

    pub fn rent_floor_units(&self) -> Units {
        Units::from(self.cfg.rent_floor_units)
    }

    /// Inspect new fee-account signatures, oldest first. Never fails: errors
    /// are counted and the checkpoint stays at the last contiguous success.
    pub async fn poll(&self) -> PollReport {
        let _guard = self.poll_lock.lock().await;
        self.poll_locked().await
    }

    async fn poll_locked(&self) -> PollReport {
        let mut report = PollReport::default();
        let until = {
            let mut state = self.state.lock();
            state.poll_count += 1;
            state.last_poll_at_ms = Some(self.clock.now_ms());
            state.last_processed.clone()
        };
        metrics::counter!("fees.polls").increment(1);

        let signatures = match self
            .ledger
            .get_signatures_for_address(&self.cfg.fee_account, until.as_deref(), self.cfg.poll_limit)
            .await
        {
            Ok(signatures) => signatures,
            Err(err) => {
                self.state.lock().error_count += 1;
                report.errors += 1;
                tracing::warn!(error = %err, "fee poll failed");
                return report;
            }
        };
        report.fetched = signatures.len();

        // newest first from the ledger
        for info in signatures.into_iter().rev() {
            if self.state.lock().processed.contains(&info.signature) {
                self.advance_checkpoint(&info);
                continue;
            }
            if info.failed {
                self.mark_processed(&info);
                report.processed += 1;
                continue;
            }
            match self.ledger.get_transaction(&info.signature).await {
                Ok(Some(tx)) => {
                    match self.handle_transaction(&tx).await {
                        TxOutcome::Attributed => report.attributed += 1,
                        TxOutcome::Unattributed => report.unattributed += 1,
                        TxOutcome::NoFee => {}
                    }
                    self.mark_processed(&info);
                    report.processed += 1;
                }
                Ok(None) => {
                    // not served yet; retried next poll from the same checkpoint
                    tracing::debug!(signature = %info.signature, "transaction not yet available");
                    break;
                }
                Err(err) => {
                    self.state.lock().error_count += 1;
                    report.errors += 1;
                    tracing::warn!(signature = %info.signature, error = %err, "transaction fetch failed");
                    break;
                }
            }
        }

        metrics::gauge!("fees.pending_units").set(self.registry.totals().pending_units as f64);
        if report.attributed + report.unattributed > 0 {
            tracing::info!(
                fetched = report.fetched,
                attributed = report.attributed,
                unattributed = report.unattributed,
                "fee poll"
            );
        }
        report
    }

    fn mark_processed(&self, info: &SignatureInfo) {
        let mut state = self.state.lock();
        state.processed.insert(info.signature.clone());
        state.last_processed = Some(info.signature.clone());
    }

    fn advance_checkpoint(&self, info: &SignatureInfo) {
        self.state.lock().last_processed = Some(info.signature.clone());
    }

    async fn handle_transaction(&self, tx: &TransactionDetail) -> TxOutcome {
        let delta = match tx.balance_delta(&self.cfg.fee_account) {
            Some(delta) if delta > 0 => delta,
            _ => return TxOutcome::NoFee,
        };

        for strategy in &self.strategies {
            let Some(address) = strategy.attempt(tx, &self.registry).await else {
                continue;
            };
            let source = strategy.source();
            if source == AttributionSource::DynamicDiscovery {
                self.audit.record(
                    EventKind::AssetDiscovered,
                    json!({ "asset": address, "signature": tx.signature }),
                    Some(tx.slot),
                );
            }
            match self.registry.update_fees(&address, delta, tx.slot) {
                Ok(pending) => {
                    self.record_attributed(tx, &address, delta, source, pending);
                    return TxOutcome::Attributed;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "attributed asset vanished from registry");
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.unattributed_count += 1;
            state.unattributed_units = state.unattributed_units.saturating_add(delta.unsigned_abs());
        }
        metrics::counter!("fees.unattributed").increment(1);
        tracing::warn!(
            signature = %tx.signature,
            amount = %delta,
            "fee could not be attributed; dropped"
        );
        self.audit.record(
            EventKind::FeeUnattributed,
            json!({ "signature": tx.signature, "amount_units": units(delta.unsigned_abs()) }),
            Some(tx.slot),
        );
        TxOutcome::Unattributed
    }

    fn record_attributed(
        &self,
        tx: &TransactionDetail,
        address: &str,
        delta: i128,
        source: AttributionSource,
        pending: Units,
    ) {
        let event = FeeEvent {
            asset_address: address.to_string(),
            amount_units: delta,
            signature: tx.signature.clone(),
            slot: tx.slot,
            timestamp_ms: tx.block_time_ms.unwrap_or_else(|| self.clock.now_ms()),
        };
        {
            let mut state = self.state.lock();
            state.attributed_count += 1;
            state.recent.push_back(event);
            while state.recent.len() > self.cfg.recent_capacity {
                state.recent.pop_front();
            }
        }
        let amount = delta.unsigned_abs();
        metrics::counter!("fees.attributed_units", "source" => source.as_str())
            .increment(u64::try_from(amount).unwrap_or(u64::MAX));
        tracing::info!(
            asset = %short_address(address),
            amount = %amount,
            pending = %pending,
            source = source.as_str(),
            "fee attributed"
        );
        self.audit.record(
            EventKind::FeeDetected,
            json!({
                "asset": address,
                "signature": tx.signature,
                "amount_units": units(amount),
                "pending_units": units(pending),
                "source": source.as_str(),
            }),
            Some(tx.slot),
        );
    }

    /// Compare summed pending counters with what the fee account actually holds.
    pub async fn verify_sync_status(&self) -> Result<SyncStatus> {
        let balance = self
            .ledger
            .get_balance(&self.cfg.fee_account)
            .await
            .context("read fee account balance")?;
        let attributable = balance.saturating_sub(self.rent_floor_units());
        let tracked = self.registry.totals().pending_units;

        let mut state = self.state.lock();
        // spent baseline value no longer needs excluding
        state.baseline_units = state.baseline_units.min(attributable);
        let baseline = state.baseline_units;
        let expected = attributable - baseline;
        let difference = expected.abs_diff(tracked);
        let tolerance =
            expected.max(tracked).saturating_mul(self.cfg.divergence_tolerance_bps as Units) / 10_000;
        let significant = Units::from(self.cfg.min_divergence_units);
        let in_sync = difference <= tolerance || difference < significant;

        let status = SyncStatus {
            in_sync,
            balance_units: balance,
            attributable_units: attributable,
            baseline_units: baseline,
            expected_pending_units: expected,
            tracked_pending_units: tracked,
            difference_units: difference,
            checked_at_ms: self.clock.now_ms(),
        };
        state.last_sync = Some(status.clone());
        drop(state);

        if !in_sync {
            tracing::warn!(
                expected = %expected,
                tracked = %tracked,
                difference = %difference,
                "fee counters diverged from ledger"
            );
        }
        Ok(status)
    }

    /// Trust the ledger: zero pending counters, take the attributable balance
    /// as the new baseline and mark current signatures processed without crediting.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.poll_lock.lock().await;
        let balance = self
            .ledger
            .get_balance(&self.cfg.fee_account)
            .await
            .context("read fee account balance")?;
        let attributable = balance.saturating_sub(self.rent_floor_units());

        let until = self.state.lock().last_processed.clone();
        let signatures = self
            .ledger
            .get_signatures_for_address(&self.cfg.fee_account, until.as_deref(), self.cfg.poll_limit)
            .await
            .context("list signatures for reconcile")?;

        let cleared = self.registry.totals().pending_units;
        self.registry.zero_all_pending();
        let marked = signatures.len();
        {
            let mut state = self.state.lock();
            for info in signatures.iter().rev() {
                state.processed.insert(info.signature.clone());
            }
            if let Some(newest) = signatures.first() {
                state.last_processed = Some(newest.signature.clone());
            }
            state.baseline_units = attributable;
        }

        metrics::counter!("fees.reconciliations").increment(1);
        tracing::info!(
            cleared = %cleared,
            baseline = %attributable,
            marked,
            "fee counters reconciled"
        );
        self.audit.record(
            EventKind::Reconciled,
            json!({
                "cleared_pending_units": units(cleared),
                "baseline_units": units(attributable),
                "signatures_marked": marked,
            }),
            None,
        );
        Ok(ReconcileReport {
            cleared_pending_units: cleared,
            baseline_units: attributable,
            signatures_marked: marked,
        })
    }

    async fn correct_if_diverged(&self, status: &SyncStatus) -> Result<bool> {
        if status.in_sync {
            return Ok(false);
        }
        self.audit.record(
            EventKind::SyncDivergence,
            json!({
                "expected_pending_units": units(status.expected_pending_units),
                "tracked_pending_units": units(status.tracked_pending_units),
                "difference_units": units(status.difference_units),
            }),
            None,
        );
        self.reconcile().await?;
        Ok(true)
    }

    /// Timer entry point: poll, verify, reconcile on divergence. Returns the
    /// status as it stands afterwards.
    pub async fn periodic_reconciliation(&self) -> Result<SyncStatus> {
        self.poll().await;
        let status = self.verify_sync_status().await?;
        if self.correct_if_diverged(&status).await? {
            return self.verify_sync_status().await;
        }
        Ok(status)
    }

    /// Gate before a cycle. `Ok(false)` means counters had to be corrected and
    /// the cycle must not run on them.
    pub async fn pre_cycle_verification(&self) -> Result<bool> {
        self.poll().await;
        let status = self.verify_sync_status().await?;
        let corrected = self.correct_if_diverged(&status).await?;
        Ok(!corrected)
    }

    pub fn snapshot_meta(&self) -> FeeTrackingMeta {
        let state = self.state.lock();
        FeeTrackingMeta {
            processed_signatures: state.processed.to_vec(),
            last_processed_signature: state.last_processed.clone(),
            poll_count: state.poll_count,
            error_count: state.error_count,
        }
    }

    pub fn restore_meta(&self, meta: FeeTrackingMeta) {
        let mut state = self.state.lock();
        state.processed = ProcessedSignatureSet::from_signatures(
            self.cfg.processed_capacity,
            meta.processed_signatures,
        );
        state.last_processed = meta.last_processed_signature;
        state.poll_count = meta.poll_count;
        state.error_count = meta.error_count;
        tracing::info!(
            processed = state.processed.len(),
            checkpoint = ?state.last_processed,
            "fee tracking checkpoint restored"
        );
    }

    /// Newest last.
    pub fn recent_fees(&self, limit: usize) -> Vec<FeeEvent> {
        let state = self.state.lock();
        let skip = state.recent.len().saturating_sub(limit);
        state.recent.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> TrackerStats {
        let state = self.state.lock();
        TrackerStats {
            poll_count: state.poll_count,
            error_count: state.error_count,
            attributed_count: state.attributed_count,
            unattributed_count: state.unattributed_count,
            unattributed_units: state.unattributed_units,
            processed_signatures: state.processed.len(),
            last_processed_signature: state.last_processed.clone(),
            baseline_units: state.baseline_units,
            last_poll_at_ms: state.last_poll_at_ms,
            last_sync: state.last_sync.clone(),
        }
    }
}
