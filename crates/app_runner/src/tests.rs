use std::collections::HashMap;
use std::path::Path;

use audit_chain::{AuditEntry, EventKind};
use axum::extract::{Query, State};
use core_types::{
    AssetMetadata, AssetRecord, InstructionKind, PoolKind, PoolResolver, PreparedTransaction,
    TransactionDetail, Units,
};
use cycle_orchestrator::CycleOutcome;
use infra_clock::ManualClock;
use metrics_exporter_prometheus::PrometheusBuilder;
use paper_ledger::PaperLedger;
use state_store::{PersistedState, StateStore};
use tempfile::TempDir;

use super::*;
use crate::config_loader::{ConfigError, ExecutionMode, ExecutionSection, ServiceConfig};
use crate::execution_bridge::{check_prepared, HttpExecutionClient, LedgerPorts};

const AUTH: &str = "Authority1111111111111111111111";
const FEE: &str = "FeeVault11111111111111111111111";
const ROOT: &str = "MintA";
const SEC: &str = "MintB";
const RENT: Units = 890_880;
const M: i128 = 1_000_000;

const SHIPPED_CONFIG: &str = include_str!("../../../configs/service.toml");

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    move |key| map.get(key).cloned()
}

fn test_config(data_root: &Path) -> ServiceConfig {
    let mut cfg = ServiceConfig::default();
    cfg.ledger.authority = AUTH.to_string();
    cfg.ledger.fee_account = FEE.to_string();
    cfg.ledger.root_asset = Some(ROOT.to_string());
    cfg.gateway.endpoints = vec!["http://127.0.0.1:8899".to_string()];
    cfg.storage.data_root = data_root.to_path_buf();
    cfg.cycle.retry_base_delay_ms = 0;
    cfg.apply_derived();
    cfg.validate().expect("test config is valid");
    cfg
}

fn paper_ledger() -> Arc<PaperLedger> {
    let ledger = Arc::new(PaperLedger::new(FEE));
    ledger.set_balance(FEE, RENT);
    for address in [ROOT, SEC] {
        ledger.add_asset(
            AssetMetadata {
                address: address.to_string(),
                symbol: address.to_string(),
                name: format!("{address} token"),
                authorities: vec![AUTH.to_string()],
            },
            None,
        );
    }
    ledger
}

fn context(dir: &TempDir, ledger: &Arc<PaperLedger>, clock: &Arc<ManualClock>) -> AppContext {
    let ports = LedgerPorts {
        ledger: ledger.clone(),
        executor: ledger.clone(),
        pools: ledger.clone(),
        gateway: None,
    };
    AppContext::assemble(test_config(dir.path()), ports, clock.clone()).expect("assemble")
}

fn fund(ledger: &PaperLedger, asset: &str, amount: i128) -> String {
    let tx = TransactionDetail {
        account_keys: vec!["payer".to_string(), asset.to_string()],
        ..TransactionDetail::default()
    };
    ledger.push_fee_transaction(tx, amount)
}

fn audit_kinds(dir: &TempDir) -> Vec<EventKind> {
    let raw = std::fs::read_to_string(dir.path().join("audit").join("audit.jsonl"))
        .expect("audit log");
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str::<AuditEntry>(l).expect("entry").event_kind)
        .collect()
}

fn pending(ctx: &AppContext, asset: &str) -> Units {
    ctx.get_tracked_assets()
        .into_iter()
        .find(|a| a.address == asset)
        .map(|a| a.pending_fee_units)
        .unwrap_or(0)
}

#[test]
fn shipped_config_parses_to_defaults_and_needs_identity() {
    let cfg = ServiceConfig::parse(SHIPPED_CONFIG, Path::new("configs/service.toml"))
        .expect("shipped config parses");
    let defaults = ServiceConfig::default();
    assert_eq!(cfg.service, defaults.service);
    assert_eq!(cfg.gateway, defaults.gateway);
    assert_eq!(cfg.tracker, defaults.tracker);
    assert_eq!(cfg.allocator, defaults.allocator);
    assert_eq!(cfg.storage, defaults.storage);
    assert_eq!(cfg.execution.mode, ExecutionMode::Paper);

    let err = cfg.validate().expect_err("authority missing");
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("authority")));
}

#[test]
fn partial_sections_keep_remaining_defaults() {
    let raw = r#"
[gateway.breaker]
failure_threshold = 7

[tracker]
rent_floor_units = 2039280

[allocator]
root_share_bps = 5000
per_asset_reserve_units = 9000000
"#;
    let cfg = ServiceConfig::parse(raw, Path::new("inline.toml")).expect("parse");
    assert_eq!(cfg.gateway.breaker.failure_threshold, 7);
    assert_eq!(cfg.gateway.breaker.cooldown_ms, 30_000);
    assert_eq!(cfg.gateway.retry.max_retries, 3);
    assert_eq!(cfg.allocator.root_share_bps, 5_000);
    assert_eq!(cfg.allocator.minimum_trade_units, 10_000_000);
    assert_eq!(cfg.allocator.per_asset_reserve(), 9_000_000);
    assert_eq!(cfg.tracker.rent_floor_units, 2_039_280);
    assert_eq!(cfg.tracker.min_divergence_units, 1_000_000);
    assert_eq!(cfg.service.poll_interval_ms, 30_000);
}

#[test]
fn parse_errors_name_the_file() {
    let err = ServiceConfig::parse("[service\npoll_interval_ms = 1", Path::new("broken.toml"))
        .expect_err("invalid toml");
    assert!(err.to_string().contains("broken.toml"));
}

#[test]
fn env_overrides_win_and_derived_fields_follow() {
    let mut cfg = ServiceConfig::default();
    cfg.apply_env_overrides(env(&[
        ("BURN_RPC_ENDPOINTS", "https://a.example/rpc, ,https://b.example/rpc"),
        ("BURN_AUTHORITY", AUTH),
        ("BURN_FEE_ACCOUNT", FEE),
        ("BURN_ROOT_ASSET", ROOT),
        ("BURN_DATA_ROOT", "/tmp/burn"),
        ("BURN_DRY_RUN", "1"),
    ]));
    cfg.apply_derived();

    assert_eq!(
        cfg.gateway.endpoints,
        vec!["https://a.example/rpc", "https://b.example/rpc"]
    );
    assert_eq!(cfg.ledger.root_asset.as_deref(), Some(ROOT));
    assert_eq!(cfg.tracker.fee_account, FEE);
    assert_eq!(
        cfg.cycle.checkpoint_path,
        Path::new("/tmp/burn").join("cycle_progress.json")
    );
    assert!(cfg.execution.mode.is_dry_run());
    cfg.validate().expect("valid");
}

#[test]
fn live_mode_requires_a_builder_endpoint() {
    let mut cfg = ServiceConfig::default();
    cfg.apply_env_overrides(env(&[
        ("BURN_RPC_ENDPOINTS", "https://a.example/rpc"),
        ("BURN_AUTHORITY", AUTH),
        ("BURN_FEE_ACCOUNT", FEE),
        ("BURN_DRY_RUN", "false"),
    ]));
    assert_eq!(cfg.execution.mode, ExecutionMode::Live);
    assert!(cfg.validate().is_err());

    cfg.execution.builder_endpoint = "https://builder.example".to_string();
    cfg.validate().expect("valid once the builder is named");
}

#[test]
fn validation_rejects_out_of_range_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = test_config(dir.path());

    let mut cfg = base.clone();
    cfg.allocator.root_share_bps = 10_001;
    assert!(cfg.validate().is_err());

    let mut cfg = base.clone();
    cfg.service.poll_interval_ms = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = base.clone();
    cfg.gateway.endpoints = vec!["  ".to_string()];
    assert!(cfg.validate().is_err());

    let mut cfg = base.clone();
    cfg.gateway.breaker.failure_threshold = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = base.clone();
    cfg.cycle.cooldown_ms = 59_999;
    let err = cfg.validate().expect_err("cooldown below floor");
    assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("cooldown_ms")));

    let mut cfg = base;
    cfg.cycle.cooldown_ms = 60_000;
    cfg.validate().expect("cooldown at the floor");
}

#[test]
fn builder_responses_are_checked() {
    let good = PreparedTransaction {
        instructions: vec![InstructionKind::Buy, InstructionKind::Burn],
        payload: "AQID".to_string(),
        compute_unit_limit: None,
    };
    check_prepared(&good).expect("valid");

    let empty_plan = PreparedTransaction {
        instructions: Vec::new(),
        ..good.clone()
    };
    assert!(check_prepared(&empty_plan).is_err());

    let not_base64 = PreparedTransaction {
        payload: "***".to_string(),
        ..good
    };
    assert!(check_prepared(&not_base64).is_err());
}

#[test]
fn http_bridge_needs_an_endpoint_and_derives_pools_offline() {
    assert!(HttpExecutionClient::new(&ExecutionSection::default()).is_err());

    let bridge = HttpExecutionClient::new(&ExecutionSection {
        mode: ExecutionMode::Live,
        builder_endpoint: "https://builder.example/".to_string(),
        request_timeout_ms: 1_000,
    })
    .expect("bridge");
    let pool = bridge.derived_pool(SEC);
    assert_eq!(pool.kind, PoolKind::BondingCurve);
    assert_eq!(pool, bridge.derived_pool(SEC));
    assert!(pool.address.ends_with(SEC));
}

#[tokio::test]
async fn startup_discovers_assets_and_reconciles_existing_balance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::shared(1_700_000_000_000);
    let ledger = paper_ledger();
    fund(&ledger, SEC, 15 * M);
    fund(&ledger, SEC, 15 * M);

    let ctx = context(&dir, &ledger, &clock);
    let report = ctx.startup().await.expect("startup");
    assert_eq!(report.restored_assets, 0);
    assert_eq!(report.discovered_assets, 2);
    assert!(report.recovery.is_none());
    assert!(report.sync.expect("sync").in_sync);

    let assets = ctx.get_tracked_assets();
    let roots = assets.iter().filter(|a| a.is_root).collect::<Vec<_>>();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].address, ROOT);

    // history that predates the service is baseline, not pending
    let tick = ctx.poll_tick().await;
    assert_eq!(tick.poll.attributed, 0);
    assert_eq!(ctx.get_totals().pending_units, 0);
    assert!(!tick.readiness.ready);

    let kinds = audit_kinds(&dir);
    assert!(kinds.contains(&EventKind::Reconciled));
    assert_eq!(kinds.last(), Some(&EventKind::ServiceStarted));
}

#[tokio::test]
async fn poll_tick_runs_a_cycle_once_fees_are_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::shared(1_700_000_000_000);
    let ledger = paper_ledger();
    let ctx = context(&dir, &ledger, &clock);
    ctx.startup().await.expect("startup");

    fund(&ledger, ROOT, 100 * M);
    fund(&ledger, SEC, 200 * M);
    let tick = ctx.poll_tick().await;
    assert_eq!(tick.poll.attributed, 2);
    assert!(tick.readiness.ready);
    let report = match tick.cycle {
        Some(CycleOutcome::Finished(report)) => report,
        other => panic!("expected a finished cycle, got {other:?}"),
    };
    assert_eq!(report.success_count(), 2);
    assert_eq!(ledger.sends().len(), 2);

    assert_eq!(pending(&ctx, ROOT), 0);
    assert_eq!(pending(&ctx, SEC), 0);
    assert_eq!(ctx.get_totals().burned_units, 300_000_000);
    assert_eq!(ctx.get_fee_records(10).len(), 2);
    assert!(dir.path().join("burn_state.json").exists());

    // cooldown: the next tick polls but does not start another cycle
    let next = ctx.poll_tick().await;
    assert!(next.cycle.is_none());
    assert!(ctx.verify_sync_status().await.expect("verify").in_sync);
}

#[tokio::test]
async fn restart_restores_identity_without_double_counting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::shared(1_700_000_000_000);
    let ledger = paper_ledger();
    {
        let ctx = context(&dir, &ledger, &clock);
        ctx.startup().await.expect("startup");
        fund(&ledger, SEC, 5 * M);
        let flushed = ctx.force_flush().await.expect("flush");
        assert_eq!(flushed.poll.attributed, 1);
        assert_eq!(pending(&ctx, SEC), 5_000_000);
        ctx.shutdown("test").await;
    }
    assert_eq!(audit_kinds(&dir).last(), Some(&EventKind::ServiceStopped));

    // discovery finds nothing new on the second run
    let ctx = context(&dir, &ledger, &clock);
    let report = ctx.startup().await.expect("restart");
    assert_eq!(report.restored_assets, 2);
    assert_eq!(report.discovered_assets, 0);
    assert!(report.sync.expect("sync").in_sync);

    let root = ctx
        .get_tracked_assets()
        .into_iter()
        .find(|a| a.is_root)
        .expect("root");
    assert_eq!(root.address, ROOT);

    let tick = ctx.poll_tick().await;
    assert_eq!(tick.poll.attributed, 0);
    assert_eq!(pending(&ctx, SEC), 0);

    fund(&ledger, SEC, 2 * M);
    ctx.poll_tick().await;
    assert_eq!(pending(&ctx, SEC), 2_000_000);
}

#[tokio::test]
async fn state_from_another_authority_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::shared(1_700_000_000_000);
    let ledger = paper_ledger();
    let mut foreign = PersistedState::new("SomeoneElse1111111111111111111", "mainnet-beta");
    foreign.tokens = vec![AssetRecord::bare("MintZ", true)];
    StateStore::new(dir.path().join("burn_state.json"), 3)
        .save(&foreign)
        .expect("seed state");

    let ctx = context(&dir, &ledger, &clock);
    let report = ctx.startup().await.expect("startup");
    assert_eq!(report.restored_assets, 0);
    assert!(ctx.get_tracked_assets().iter().all(|a| a.address != "MintZ"));
}

#[tokio::test]
async fn unreadable_state_is_fatal_at_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::shared(1_700_000_000_000);
    let ledger = paper_ledger();
    std::fs::write(dir.path().join("burn_state.json"), b"{ not json").expect("write");

    let ctx = context(&dir, &ledger, &clock);
    assert!(ctx.startup().await.is_err());
}

#[tokio::test]
async fn control_handlers_serve_context_snapshots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::shared(1_700_000_000_000);
    let ledger = paper_ledger();
    let ctx = Arc::new(context(&dir, &ledger, &clock));
    ctx.startup().await.expect("startup");
    let state = AppState {
        ctx: ctx.clone(),
        prometheus: PrometheusBuilder::new().build_recorder().handle(),
    };

    let health = control_api::health(State(state.clone())).await.0;
    assert_eq!(health.status, "ok");
    assert!(health.dry_run);
    assert!(health.gateway.is_none());
    assert_eq!(health.tracked_assets, 2);
    assert_eq!(health.attestation, ctx.get_attestation());

    fund(&ledger, SEC, 3 * M);
    let flushed = control_api::flush(State(state.clone()))
        .await
        .expect("flush")
        .0;
    assert_eq!(flushed.poll.attributed, 1);

    let totals = control_api::totals(State(state.clone())).await.0;
    assert_eq!(totals.pending_units, 3_000_000);

    let fees = control_api::fees(
        State(state.clone()),
        Query(control_api::FeesQuery { limit: Some(0) }),
    )
    .await
    .0;
    assert_eq!(fees.len(), 1);
    assert_eq!(fees[0].asset_address, SEC);

    let readiness = control_api::readiness(State(state)).await.0;
    assert!(!readiness.ready);
}
