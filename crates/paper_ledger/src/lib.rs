use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use core_types::{
    new_id, AssetMetadata, AssetRole, Blockhash, Confirmation, ExecutionRequest, InstructionKind,
    LedgerExecutionClient, LedgerRpc, PoolKind, PoolRef, PoolResolver, PreparedTransaction,
    SignatureInfo, SimulationResult, TransactionDetail, Units,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What a paper payload decodes to. Real payloads are opaque signed bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PaperPayload {
    request: ExecutionRequest,
    blockhash: String,
}

pub fn instruction_plan(request: &ExecutionRequest) -> Vec<InstructionKind> {
    let mut plan = vec![
        InstructionKind::ComputeBudget,
        InstructionKind::CollectFees,
        InstructionKind::Buy,
        InstructionKind::FinalizeCycle,
        InstructionKind::Burn,
    ];
    if request.role == AssetRole::Secondary && request.root_share_units > 0 {
        plan.push(InstructionKind::RootShareTransfer);
    }
    plan
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaperSend {
    pub signature: String,
    pub request: ExecutionRequest,
}

#[derive(Default)]
struct LedgerState {
    slot: u64,
    block_height: u64,
    balances: HashMap<String, Units>,
    /// Oldest first.
    history: Vec<TransactionDetail>,
    assets: HashMap<String, AssetMetadata>,
    pools: HashMap<String, PoolRef>,
    unresolvable_pools: HashSet<String>,
    simulation_failures: HashMap<String, VecDeque<String>>,
    injected_errors: VecDeque<String>,
    sends: Vec<PaperSend>,
    expire_next: usize,
}

/// In-memory ledger: serves reads from seeded state and applies sends to the
/// fee account balance. Used for dry runs and as the ledger in tests.
pub struct PaperLedger {
    fee_account: String,
    state: RwLock<LedgerState>,
}

impl PaperLedger {
    pub fn new(fee_account: impl Into<String>) -> Self {
        Self {
            fee_account: fee_account.into(),
            state: RwLock::new(LedgerState {
                slot: 1,
                block_height: 1,
                ..LedgerState::default()
            }),
        }
    }

    pub fn fee_account(&self) -> &str {
        &self.fee_account
    }

    pub fn set_slot(&self, slot: u64) {
        self.state.write().slot = slot;
    }

    pub fn set_balance(&self, address: &str, units: Units) {
        self.state.write().balances.insert(address.to_string(), units);
    }

    pub fn balance_of(&self, address: &str) -> Units {
        self.state.read().balances.get(address).copied().unwrap_or(0)
    }

    pub fn add_asset(&self, meta: AssetMetadata, pool: Option<PoolRef>) {
        let mut state = self.state.write();
        if let Some(pool) = pool {
            state.pools.insert(meta.address.clone(), pool);
        }
        state.assets.insert(meta.address.clone(), meta);
    }

    pub fn make_pool_unresolvable(&self, asset_address: &str) {
        self.state
            .write()
            .unresolvable_pools
            .insert(asset_address.to_string());
    }

    /// Record a transaction that moves `delta` into (or out of) the fee account.
    /// `account_keys` should already contain whatever attribution evidence the test wants.
    pub fn push_fee_transaction(&self, mut tx: TransactionDetail, delta: i128) -> String {
        let mut state = self.state.write();
        state.slot += 1;
        if tx.signature.is_empty() {
            tx.signature = new_id();
        }
        tx.slot = state.slot;
        let before = state.balances.get(&self.fee_account).copied().unwrap_or(0);
        let after = (before as i128 + delta).max(0) as Units;
        let idx = match tx.account_keys.iter().position(|k| k == &self.fee_account) {
            Some(idx) => idx,
            None => {
                tx.account_keys.push(self.fee_account.clone());
                tx.account_keys.len() - 1
            }
        };
        tx.pre_balances.resize(tx.account_keys.len(), 0);
        tx.post_balances.resize(tx.account_keys.len(), 0);
        tx.pre_balances[idx] = before;
        tx.post_balances[idx] = after;
        state.balances.insert(self.fee_account.clone(), after);
        let signature = tx.signature.clone();
        state.history.push(tx);
        signature
    }

    /// Next `times` simulations for this asset fail with `message`.
    pub fn fail_simulation(&self, asset_address: &str, message: &str, times: usize) {
        let mut state = self.state.write();
        let queue = state
            .simulation_failures
            .entry(asset_address.to_string())
            .or_default();
        for _ in 0..times {
            queue.push_back(message.to_string());
        }
    }

    /// Next `times` read calls fail with `message`.
    pub fn inject_errors(&self, message: &str, times: usize) {
        let mut state = self.state.write();
        for _ in 0..times {
            state.injected_errors.push_back(message.to_string());
        }
    }

    /// Next `times` confirmations report expiry.
    pub fn expire_next_confirmations(&self, times: usize) {
        self.state.write().expire_next = times;
    }

    pub fn sends(&self) -> Vec<PaperSend> {
        self.state.read().sends.clone()
    }

    fn take_injected(&self) -> Result<()> {
        match self.state.write().injected_errors.pop_front() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn decode_payload(payload: &str) -> Result<PaperPayload> {
        let bytes = B64.decode(payload).context("payload is not base64")?;
        serde_json::from_slice(&bytes).context("payload is not a paper transaction")
    }

    fn encode_payload(payload: &PaperPayload) -> Result<String> {
        let raw = serde_json::to_vec(payload).context("encode paper payload")?;
        Ok(B64.encode(raw))
    }

    fn apply_send(&self, payload: PaperPayload) -> String {
        let mut state = self.state.write();
        state.slot += 1;
        state.block_height += 1;
        let signature = format!("paper-{}", new_id());
        // collect + buy spend the allocation out of the fee account
        let spent = payload.request.allocation_units;
        let before = state.balances.get(&self.fee_account).copied().unwrap_or(0);
        let after = before.saturating_sub(spent);
        state.balances.insert(self.fee_account.clone(), after);
        let slot = state.slot;
        state.history.push(TransactionDetail {
            signature: signature.clone(),
            slot,
            account_keys: vec![self.fee_account.clone(), payload.request.asset_address.clone()],
            pre_balances: vec![before, 0],
            post_balances: vec![after, 0],
            token_mints: vec![payload.request.asset_address.clone()],
            ..TransactionDetail::default()
        });
        state.sends.push(PaperSend {
            signature: signature.clone(),
            request: payload.request,
        });
        signature
    }
}

#[async_trait]
impl LedgerRpc for PaperLedger {
    async fn get_slot(&self) -> Result<u64> {
        self.take_injected()?;
        Ok(self.state.read().slot)
    }

    async fn get_balance(&self, address: &str) -> Result<Units> {
        self.take_injected()?;
        Ok(self.balance_of(address))
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>> {
        self.take_injected()?;
        let state = self.state.read();
        let mut out = Vec::new();
        for tx in state.history.iter().rev() {
            if Some(tx.signature.as_str()) == until || out.len() >= limit {
                break;
            }
            if !tx.account_keys.iter().any(|k| k == address) {
                continue;
            }
            out.push(SignatureInfo {
                signature: tx.signature.clone(),
                slot: tx.slot,
                failed: tx.failed,
                block_time_ms: tx.block_time_ms,
            });
        }
        Ok(out)
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionDetail>> {
        self.take_injected()?;
        Ok(self
            .state
            .read()
            .history
            .iter()
            .find(|tx| tx.signature == signature)
            .cloned())
    }

    async fn get_assets_by_authority(&self, authority: &str) -> Result<Vec<AssetMetadata>> {
        self.take_injected()?;
        let mut assets = self
            .state
            .read()
            .assets
            .values()
            .filter(|a| a.authorities.iter().any(|x| x == authority))
            .cloned()
            .collect::<Vec<_>>();
        assets.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(assets)
    }

    async fn get_asset_metadata(&self, address: &str) -> Result<Option<AssetMetadata>> {
        self.take_injected()?;
        Ok(self.state.read().assets.get(address).cloned())
    }

    async fn get_latest_blockhash(&self) -> Result<Blockhash> {
        self.take_injected()?;
        let state = self.state.read();
        Ok(Blockhash {
            hash: format!("paper-blockhash-{}", state.slot),
            last_valid_block_height: state.block_height + 150,
        })
    }

    async fn simulate_transaction(&self, payload: &str) -> Result<SimulationResult> {
        let decoded = Self::decode_payload(payload)?;
        let failure = self
            .state
            .write()
            .simulation_failures
            .get_mut(&decoded.request.asset_address)
            .and_then(VecDeque::pop_front);
        Ok(match failure {
            Some(message) => SimulationResult {
                err: Some(message.clone()),
                logs: vec![format!("Program log: {message}")],
                units_consumed: Some(0),
            },
            None => SimulationResult {
                err: None,
                logs: vec!["Program log: paper simulation ok".to_string()],
                units_consumed: Some(180_000),
            },
        })
    }

    async fn send_transaction(&self, payload: &str) -> Result<String> {
        let decoded = Self::decode_payload(payload)?;
        Ok(self.apply_send(decoded))
    }

    async fn confirm_transaction(
        &self,
        signature: &str,
        _blockhash: &Blockhash,
    ) -> Result<Confirmation> {
        let mut state = self.state.write();
        if state.expire_next > 0 {
            state.expire_next -= 1;
            return Ok(Confirmation::Expired);
        }
        if state.sends.iter().any(|s| s.signature == signature) {
            Ok(Confirmation::Confirmed)
        } else {
            Ok(Confirmation::Failed(format!("unknown signature {signature}")))
        }
    }
}

#[async_trait]
impl LedgerExecutionClient for PaperLedger {
    async fn build_transaction(
        &self,
        request: &ExecutionRequest,
        blockhash: &Blockhash,
    ) -> Result<PreparedTransaction> {
        if request.allocation_units == 0 {
            bail!("refusing to build a zero allocation for {}", request.symbol);
        }
        let payload = Self::encode_payload(&PaperPayload {
            request: request.clone(),
            blockhash: blockhash.hash.clone(),
        })?;
        Ok(PreparedTransaction {
            instructions: instruction_plan(request),
            payload,
            compute_unit_limit: Some(400_000),
        })
    }
}

#[async_trait]
impl PoolResolver for PaperLedger {
    async fn resolve_pool(&self, asset_address: &str) -> Result<PoolRef> {
        let state = self.state.read();
        if state.unresolvable_pools.contains(asset_address) {
            bail!("pool lookup failed for {asset_address}");
        }
        Ok(state
            .pools
            .get(asset_address)
            .cloned()
            .unwrap_or_else(|| derive_pool(asset_address)))
    }

    fn derived_pool(&self, asset_address: &str) -> PoolRef {
        derive_pool(asset_address)
    }
}

/// Deterministic offline pool address for an asset.
pub fn derive_pool(asset_address: &str) -> PoolRef {
    PoolRef {
        address: format!("curve-{asset_address}"),
        kind: PoolKind::BondingCurve,
    }
}

/// Live reads, paper writes: simulate/send/confirm never leave the process.
pub struct DryRunLedger<L> {
    inner: L,
    paper: PaperLedger,
}

impl<L: LedgerRpc> DryRunLedger<L> {
    pub fn new(inner: L, fee_account: impl Into<String>) -> Self {
        Self {
            inner,
            paper: PaperLedger::new(fee_account),
        }
    }

    pub fn paper(&self) -> &PaperLedger {
        &self.paper
    }
}

#[async_trait]
impl<L: LedgerRpc> LedgerRpc for DryRunLedger<L> {
    async fn get_slot(&self) -> Result<u64> {
        self.inner.get_slot().await
    }

    async fn get_balance(&self, address: &str) -> Result<Units> {
        self.inner.get_balance(address).await
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>> {
        self.inner
            .get_signatures_for_address(address, until, limit)
            .await
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionDetail>> {
        self.inner.get_transaction(signature).await
    }

    async fn get_assets_by_authority(&self, authority: &str) -> Result<Vec<AssetMetadata>> {
        self.inner.get_assets_by_authority(authority).await
    }

    async fn get_asset_metadata(&self, address: &str) -> Result<Option<AssetMetadata>> {
        self.inner.get_asset_metadata(address).await
    }

    async fn get_latest_blockhash(&self) -> Result<Blockhash> {
        self.paper.get_latest_blockhash().await
    }

    async fn simulate_transaction(&self, payload: &str) -> Result<SimulationResult> {
        self.paper.simulate_transaction(payload).await
    }

    async fn send_transaction(&self, payload: &str) -> Result<String> {
        let signature = self.paper.send_transaction(payload).await?;
        tracing::info!(%signature, "dry run: transaction not submitted");
        Ok(signature)
    }

    async fn confirm_transaction(
        &self,
        signature: &str,
        blockhash: &Blockhash,
    ) -> Result<Confirmation> {
        self.paper.confirm_transaction(signature, blockhash).await
    }
}

#[async_trait]
impl<L: LedgerRpc> LedgerExecutionClient for DryRunLedger<L> {
    async fn build_transaction(
        &self,
        request: &ExecutionRequest,
        blockhash: &Blockhash,
    ) -> Result<PreparedTransaction> {
        self.paper.build_transaction(request, blockhash).await
    }
}

#[async_trait]
impl<L: LedgerRpc> PoolResolver for DryRunLedger<L> {
    async fn resolve_pool(&self, asset_address: &str) -> Result<PoolRef> {
        self.paper.resolve_pool(asset_address).await
    }

    fn derived_pool(&self, asset_address: &str) -> PoolRef {
        derive_pool(asset_address)
    }
}
