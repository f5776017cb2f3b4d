use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

/// Base units of the ledger's native value (the smallest indivisible amount).
pub type Units = u128;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    #[default]
    BondingCurve,
    Amm,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::BondingCurve => "bonding_curve",
            Self::Amm => "amm",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetRole {
    Root,
    Secondary,
}

impl fmt::Display for AssetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Root => "root",
            Self::Secondary => "secondary",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedAsset {
    pub address: String,
    pub symbol: SmolStr,
    pub name: String,
    pub is_root: bool,
    pub pool_address: String,
    pub pool_kind: PoolKind,
    pub pending_fee_units: Units,
    pub total_collected_units: Units,
    pub total_burned_units: Units,
    pub last_fee_update_slot: u64,
    #[serde(default)]
    pub last_burn_signature: Option<String>,
    pub discovered_at_ms: i64,
    pub last_updated_at_ms: i64,
}

impl TrackedAsset {
    pub fn role(&self) -> AssetRole {
        if self.is_root {
            AssetRole::Root
        } else {
            AssetRole::Secondary
        }
    }
}

/// Durable identity of a tracked asset. Counters are rebuilt from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetRecord {
    pub address: String,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_kind: Option<PoolKind>,
}

impl AssetRecord {
    pub fn bare(address: impl Into<String>, is_root: bool) -> Self {
        Self {
            address: address.into(),
            is_root,
            symbol: None,
            name: None,
            pool_address: None,
            pool_kind: None,
        }
    }
}

/// Poll checkpoint carried across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FeeTrackingMeta {
    #[serde(default)]
    pub processed_signatures: Vec<String>,
    #[serde(default)]
    pub last_processed_signature: Option<String>,
    #[serde(default)]
    pub poll_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

/// One attributed increase of the fee account, folded into counters and the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeeEvent {
    pub asset_address: String,
    pub amount_units: i128,
    pub signature: String,
    pub slot: u64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FeeTotals {
    pub pending_units: Units,
    pub collected_units: Units,
    pub burned_units: Units,
    pub asset_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetMetadata {
    pub address: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub authorities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolRef {
    pub address: String,
    pub kind: PoolKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub block_time_ms: Option<i64>,
}

/// The slice of a confirmed transaction the tracker needs for attribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransactionDetail {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub block_time_ms: Option<i64>,
    #[serde(default)]
    pub failed: bool,
    pub account_keys: Vec<String>,
    pub pre_balances: Vec<Units>,
    pub post_balances: Vec<Units>,
    /// Mints seen in pre/post token balances.
    #[serde(default)]
    pub token_mints: Vec<String>,
    /// Mints referenced by inner (nested) transfer instructions.
    #[serde(default)]
    pub inner_transfer_mints: Vec<String>,
}

impl TransactionDetail {
    /// Native balance change of `account` in this transaction, if it was touched.
    pub fn balance_delta(&self, account: &str) -> Option<i128> {
        let idx = self.account_keys.iter().position(|k| k == account)?;
        let pre = *self.pre_balances.get(idx)? as i128;
        let post = *self.post_balances.get(idx)? as i128;
        Some(post - pre)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blockhash {
    pub hash: String,
    pub last_valid_block_height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SimulationResult {
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub units_consumed: Option<u64>,
}

impl SimulationResult {
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }

    /// Error text plus logs, used for failure classification.
    pub fn failure_text(&self) -> String {
        let mut text = self.err.clone().unwrap_or_default();
        for line in &self.logs {
            text.push('\n');
            text.push_str(line);
        }
        text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum Confirmation {
    Confirmed,
    Failed(String),
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    ComputeBudget,
    CollectFees,
    Buy,
    FinalizeCycle,
    Burn,
    RootShareTransfer,
}

/// What the orchestrator hands to the execution client for one asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub cycle_id: String,
    pub asset_address: String,
    pub symbol: String,
    pub role: AssetRole,
    pub pool_address: String,
    pub pool_kind: PoolKind,
    pub allocation_units: Units,
    /// Portion of a secondary allocation forwarded to the root asset.
    #[serde(default)]
    pub root_share_units: Units,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreparedTransaction {
    pub instructions: Vec<InstructionKind>,
    /// Signed, serialized transaction (base64).
    pub payload: String,
    #[serde(default)]
    pub compute_unit_limit: Option<u32>,
}

/// Pending vs allocated value for one asset inside a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetAllocation {
    pub asset_address: String,
    pub symbol: String,
    pub is_root: bool,
    pub pending_units: Units,
    pub preliminary_units: Units,
    pub allocated_units: Units,
    pub deferred: bool,
}

impl AssetAllocation {
    pub fn from_asset(asset: &TrackedAsset) -> Self {
        Self {
            asset_address: asset.address.clone(),
            symbol: asset.symbol.to_string(),
            is_root: asset.is_root,
            pending_units: asset.pending_fee_units,
            preliminary_units: 0,
            allocated_units: 0,
            deferred: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    AttributionFailure,
    SimulationFailure,
    Divergence,
    Corruption,
    Configuration,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transient ledger failure: {0}")]
    Transient(String),
    #[error("fee could not be attributed: {0}")]
    Attribution(String),
    #[error("simulation failed: {0}")]
    Simulation(String),
    #[error("local state diverged from ledger: {0}")]
    Divergence(String),
    #[error("corrupted record: {0}")]
    Corruption(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Attribution(_) => ErrorClass::AttributionFailure,
            Self::Simulation(_) => ErrorClass::SimulationFailure,
            Self::Divergence(_) => ErrorClass::Divergence,
            Self::Corruption(_) => ErrorClass::Corruption,
            Self::Configuration(_) => ErrorClass::Configuration,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Corruption | ErrorClass::Configuration)
    }
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "socket hang up",
    "rate limit",
    "too many requests",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "network error",
    "network unreachable",
    "error sending request",
    "fetch failed",
    "node is behind",
    "blockhash not found",
    "block height exceeded",
    "circuit open",
    "temporarily unavailable",
];

/// Status codes count only right after `http` / `status` / `status code`,
/// never as a bare digit run inside an amount or program error code.
const TRANSIENT_STATUS_CODES: &[&str] = &["429", "502", "503", "504"];

const SWAP_STEP_PATTERNS: &[&str] = &[
    "slippage",
    "toomuchsolrequired",
    "toolittlesolreceived",
    "insufficient liquidity",
    "insufficientliquidity",
    "exceeds desired slippage",
    "bonding curve complete",
];

/// Network-style failures that clear up on their own.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) || has_transient_status(&lower)
}

fn has_transient_status(lower: &str) -> bool {
    let words = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    words.iter().enumerate().any(|(i, word)| {
        if i == 0 || !TRANSIENT_STATUS_CODES.contains(word) {
            return false;
        }
        match words[i - 1] {
            "http" | "status" => true,
            "code" => i >= 2 && words[i - 2] == "status",
            _ => false,
        }
    })
}

/// Buy/swap step failures: retrying could act on an inconsistent pool state.
pub fn is_swap_step_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    SWAP_STEP_PATTERNS.iter().any(|p| lower.contains(p))
}

#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn get_slot(&self) -> Result<u64>;
    async fn get_balance(&self, address: &str) -> Result<Units>;
    /// Newest first, stopping before `until` when given.
    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>>;
    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionDetail>>;
    async fn get_assets_by_authority(&self, authority: &str) -> Result<Vec<AssetMetadata>>;
    async fn get_asset_metadata(&self, address: &str) -> Result<Option<AssetMetadata>>;
    async fn get_latest_blockhash(&self) -> Result<Blockhash>;
    async fn simulate_transaction(&self, payload: &str) -> Result<SimulationResult>;
    async fn send_transaction(&self, payload: &str) -> Result<String>;
    async fn confirm_transaction(
        &self,
        signature: &str,
        blockhash: &Blockhash,
    ) -> Result<Confirmation>;
}

#[async_trait]
impl<T: LedgerRpc + ?Sized> LedgerRpc for Arc<T> {
    async fn get_slot(&self) -> Result<u64> {
        (**self).get_slot().await
    }

    async fn get_balance(&self, address: &str) -> Result<Units> {
        (**self).get_balance(address).await
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>> {
        (**self)
            .get_signatures_for_address(address, until, limit)
            .await
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionDetail>> {
        (**self).get_transaction(signature).await
    }

    async fn get_assets_by_authority(&self, authority: &str) -> Result<Vec<AssetMetadata>> {
        (**self).get_assets_by_authority(authority).await
    }

    async fn get_asset_metadata(&self, address: &str) -> Result<Option<AssetMetadata>> {
        (**self).get_asset_metadata(address).await
    }

    async fn get_latest_blockhash(&self) -> Result<Blockhash> {
        (**self).get_latest_blockhash().await
    }

    async fn simulate_transaction(&self, payload: &str) -> Result<SimulationResult> {
        (**self).simulate_transaction(payload).await
    }

    async fn send_transaction(&self, payload: &str) -> Result<String> {
        (**self).send_transaction(payload).await
    }

    async fn confirm_transaction(
        &self,
        signature: &str,
        blockhash: &Blockhash,
    ) -> Result<Confirmation> {
        (**self).confirm_transaction(signature, blockhash).await
    }
}

/// Builds and signs the batched buy/burn transaction for one asset.
#[async_trait]
pub trait LedgerExecutionClient: Send + Sync {
    async fn build_transaction(
        &self,
        request: &ExecutionRequest,
        blockhash: &Blockhash,
    ) -> Result<PreparedTransaction>;
}

#[async_trait]
pub trait PoolResolver: Send + Sync {
    async fn resolve_pool(&self, asset_address: &str) -> Result<PoolRef>;
    /// Deterministic, offline pool derivation used when resolution fails.
    fn derived_pool(&self, asset_address: &str) -> PoolRef;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_and_pool_display() {
        assert_eq!(AssetRole::Root.to_string(), "root");
        assert_eq!(PoolKind::BondingCurve.to_string(), "bonding_curve");
    }

    #[test]
    fn balance_delta_reads_matching_index() {
        let tx = TransactionDetail {
            signature: "sig".to_string(),
            slot: 9,
            account_keys: vec!["payer".to_string(), "vault".to_string()],
            pre_balances: vec![10_000, 500],
            post_balances: vec![7_000, 2_500],
            ..TransactionDetail::default()
        };
        assert_eq!(tx.balance_delta("vault"), Some(2_000));
        assert_eq!(tx.balance_delta("payer"), Some(-3_000));
        assert_eq!(tx.balance_delta("missing"), None);
    }

    #[test]
    fn message_classification() {
        assert!(is_transient_message("request Timed Out after 30s"));
        assert!(is_transient_message("HTTP 429 Too Many Requests"));
        assert!(is_transient_message("Unavailable: http 503: upstream busy"));
        assert!(is_transient_message("status code 502"));
        assert!(is_transient_message("503 Service Unavailable"));
        assert!(!is_transient_message("custom program error: 0x1"));
        assert!(is_swap_step_failure("Error: TooMuchSolRequired"));
        assert!(!is_swap_step_failure("blockhash not found"));
    }

    #[test]
    fn digits_inside_amounts_and_codes_are_not_status_codes() {
        for message in [
            "simulation failed: Transfer: insufficient lamports 4291000, need 12980160",
            "custom program error: 0x1504",
            "account 5029Xk4293 not found",
            "custom program error: 503",
            "invalid account data for instruction 2",
            "program network_registry failed",
        ] {
            assert!(!is_transient_message(message), "{message}");
        }
    }

    #[test]
    fn fatal_classes() {
        assert!(ServiceError::Corruption("x".into()).is_fatal());
        assert!(!ServiceError::Transient("x".into()).is_fatal());
        assert_eq!(
            ServiceError::Divergence("x".into()).class(),
            ErrorClass::Divergence
        );
    }

    #[test]
    fn confirmation_json_roundtrip() {
        let value = Confirmation::Failed("InstructionError".to_string());
        let raw = serde_json::to_string(&value).expect("serialize");
        let parsed: Confirmation = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, value);
    }
}
