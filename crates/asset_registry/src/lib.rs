use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use core_types::{
    AssetMetadata, AssetRecord, FeeTotals, LedgerRpc, PoolResolver, TrackedAsset, Units,
};
use dashmap::DashMap;
use infra_clock::SharedClock;
use observability::short_address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("asset {0} is not tracked")]
    UnknownAsset(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    pub authority: String,
    pub fee_account: String,
    /// Signatures scanned by the history fallback of `discover`.
    pub history_scan_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            authority: String::new(),
            fee_account: String::new(),
            history_scan_limit: 100,
        }
    }
}

/// Address-derived metadata used when the ledger has none for an asset.
pub fn fallback_metadata(address: &str) -> AssetMetadata {
    let chars = address.chars().collect::<Vec<_>>();
    let head = chars.iter().take(4).collect::<String>();
    let tail = chars
        .iter()
        .skip(chars.len().saturating_sub(4))
        .collect::<String>();
    AssetMetadata {
        address: address.to_string(),
        symbol: head.to_uppercase(),
        name: format!("Asset {head}…{tail}"),
        authorities: Vec::new(),
    }
}

/// Set of assets being tracked plus their fee counters. Exactly one is root.
pub struct AssetRegistry {
    cfg: RegistryConfig,
    ledger: Arc<dyn LedgerRpc>,
    pools: Arc<dyn PoolResolver>,
    clock: SharedClock,
    assets: DashMap<String, TrackedAsset>,
    root: RwLock<Option<String>>,
    metadata_cache: DashMap<String, AssetMetadata>,
}

impl AssetRegistry {
    pub fn new(
        cfg: RegistryConfig,
        ledger: Arc<dyn LedgerRpc>,
        pools: Arc<dyn PoolResolver>,
        clock: SharedClock,
    ) -> Self {
        Self {
            cfg,
            ledger,
            pools,
            clock,
            assets: DashMap::new(),
            root: RwLock::new(None),
            metadata_cache: DashMap::new(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.cfg.authority
    }

    /// Find assets created by the authority and start tracking the new ones.
    /// Returns the newly tracked addresses.
    pub async fn discover(&self) -> Result<Vec<String>> {
        let mut found = match self.ledger.get_assets_by_authority(&self.cfg.authority).await {
            Ok(assets) => assets,
            Err(err) => {
                tracing::warn!(error = %err, "authority asset query failed; scanning history");
                Vec::new()
            }
        };
        if found.is_empty() {
            found = self.scan_fee_history().await?;
        }

        let mut added = Vec::new();
        for meta in found {
            if self.assets.contains_key(&meta.address) {
                continue;
            }
            let address = meta.address.clone();
            self.metadata_cache.insert(address.clone(), meta);
            self.initialize_tracking(&address, false).await;
            added.push(address);
        }
        if !added.is_empty() {
            tracing::info!(count = added.len(), "discovered assets");
        }
        Ok(added)
    }

    /// Mints seen in recent fee-account transactions whose metadata names our authority.
    async fn scan_fee_history(&self) -> Result<Vec<AssetMetadata>> {
        let sigs = self
            .ledger
            .get_signatures_for_address(&self.cfg.fee_account, None, self.cfg.history_scan_limit)
            .await?;
        let mut mints = BTreeSet::new();
        for sig in sigs.iter().filter(|s| !s.failed) {
            match self.ledger.get_transaction(&sig.signature).await {
                Ok(Some(tx)) => mints.extend(tx.token_mints),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(signature = %short_address(&sig.signature), error = %err, "history scan skipped tx")
                }
            }
        }

        let mut out = Vec::new();
        for mint in mints {
            if self.assets.contains_key(&mint) {
                continue;
            }
            if let Ok(Some(meta)) = self.ledger.get_asset_metadata(&mint).await {
                if meta.authorities.iter().any(|a| a == &self.cfg.authority) {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }

    /// Metadata from cache, then the ledger, then the address-derived fallback.
    pub async fn lookup_metadata(&self, address: &str) -> AssetMetadata {
        if let Some(meta) = self.metadata_cache.get(address) {
            return meta.clone();
        }
        let meta = match self.ledger.get_asset_metadata(address).await {
            Ok(Some(meta)) => meta,
            Ok(None) => fallback_metadata(address),
            Err(err) => {
                tracing::warn!(asset = %short_address(address), error = %err, "metadata lookup failed; using fallback");
                // not cached so a later lookup can still succeed
                return fallback_metadata(address);
            }
        };
        self.metadata_cache
            .insert(address.to_string(), meta.clone());
        meta
    }

    /// Start tracking `address`. Never fails: metadata and pool lookups degrade to
    /// deterministic fallbacks.
    pub async fn initialize_tracking(&self, address: &str, is_root: bool) -> TrackedAsset {
        if let Some(existing) = self.get(address) {
            if is_root && !existing.is_root {
                let _ = self.set_root(address);
            }
            return self.get(address).unwrap_or(existing);
        }

        let fallback = fallback_metadata(address);
        let mut meta = self.lookup_metadata(address).await;
        if meta.symbol.trim().is_empty() {
            meta.symbol = fallback.symbol;
        }
        if meta.name.trim().is_empty() {
            meta.name = fallback.name;
        }
        let pool = match self.pools.resolve_pool(address).await {
            Ok(pool) => pool,
            Err(err) => {
                tracing::warn!(asset = %short_address(address), error = %err, "pool resolution failed; deriving");
                self.pools.derived_pool(address)
            }
        };

        let now = self.clock.now_ms();
        let asset = TrackedAsset {
            address: address.to_string(),
            symbol: SmolStr::new(&meta.symbol),
            name: meta.name,
            is_root: false,
            pool_address: pool.address,
            pool_kind: pool.kind,
            pending_fee_units: 0,
            total_collected_units: 0,
            total_burned_units: 0,
            last_fee_update_slot: 0,
            last_burn_signature: None,
            discovered_at_ms: now,
            last_updated_at_ms: now,
        };
        self.assets.insert(address.to_string(), asset.clone());
        tracing::info!(asset = %short_address(address), symbol = %asset.symbol, is_root, "tracking asset");
        if is_root {
            let _ = self.set_root(address);
            return self.get(address).unwrap_or(asset);
        }
        asset
    }

    /// Make `address` the single root, demoting the previous one.
    pub fn set_root(&self, address: &str) -> Result<(), RegistryError> {
        if !self.assets.contains_key(address) {
            return Err(RegistryError::UnknownAsset(address.to_string()));
        }
        let mut root = self.root.write();
        if let Some(prev) = root.as_deref() {
            if prev != address {
                if let Some(mut old) = self.assets.get_mut(prev) {
                    old.is_root = false;
                    tracing::info!(asset = %short_address(prev), "root demoted");
                }
            }
        }
        if let Some(mut asset) = self.assets.get_mut(address) {
            asset.is_root = true;
        }
        *root = Some(address.to_string());
        Ok(())
    }

    /// Apply an attributed fee delta. Negative deltas only reduce pending.
    pub fn update_fees(&self, address: &str, delta: i128, slot: u64) -> Result<Units, RegistryError> {
        let mut asset = self
            .assets
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownAsset(address.to_string()))?;
        let magnitude = delta.unsigned_abs();
        if delta >= 0 {
            asset.pending_fee_units = asset.pending_fee_units.saturating_add(magnitude);
            asset.total_collected_units = asset.total_collected_units.saturating_add(magnitude);
        } else {
            asset.pending_fee_units = asset.pending_fee_units.saturating_sub(magnitude);
        }
        asset.last_fee_update_slot = asset.last_fee_update_slot.max(slot);
        asset.last_updated_at_ms = self.clock.now_ms();
        Ok(asset.pending_fee_units)
    }

    /// Clear pending after a successful burn and fold the burned amount into totals.
    pub fn reset_fees(
        &self,
        address: &str,
        burned_units: Units,
        signature: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut asset = self
            .assets
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownAsset(address.to_string()))?;
        asset.pending_fee_units = 0;
        asset.total_burned_units = asset.total_burned_units.saturating_add(burned_units);
        if signature.is_some() {
            asset.last_burn_signature = signature;
        }
        asset.last_updated_at_ms = self.clock.now_ms();
        Ok(())
    }

    pub fn zero_all_pending(&self) {
        let now = self.clock.now_ms();
        for mut asset in self.assets.iter_mut() {
            asset.pending_fee_units = 0;
            asset.last_updated_at_ms = now;
        }
    }

    pub fn get(&self, address: &str) -> Option<TrackedAsset> {
        self.assets.get(address).map(|a| a.clone())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.assets.contains_key(address)
    }

    pub fn root(&self) -> Option<TrackedAsset> {
        let root = self.root.read().clone()?;
        self.get(&root)
    }

    pub fn find_by_pool(&self, pool_address: &str) -> Option<TrackedAsset> {
        self.assets
            .iter()
            .find(|a| a.pool_address == pool_address)
            .map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// All assets, sorted by address.
    pub fn snapshot(&self) -> Vec<TrackedAsset> {
        let mut out = self.assets.iter().map(|a| a.clone()).collect::<Vec<_>>();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    pub fn totals(&self) -> FeeTotals {
        let asset_count = self.assets.len();
        self.assets.iter().fold(
            FeeTotals {
                asset_count,
                ..FeeTotals::default()
            },
            |mut acc, a| {
                acc.pending_units = acc.pending_units.saturating_add(a.pending_fee_units);
                acc.collected_units = acc.collected_units.saturating_add(a.total_collected_units);
                acc.burned_units = acc.burned_units.saturating_add(a.total_burned_units);
                acc
            },
        )
    }

    pub fn to_persisted(&self) -> Vec<AssetRecord> {
        self.snapshot()
            .into_iter()
            .map(|a| AssetRecord {
                address: a.address,
                is_root: a.is_root,
                symbol: Some(a.symbol.to_string()),
                name: Some(a.name),
                pool_address: Some(a.pool_address),
                pool_kind: Some(a.pool_kind),
            })
            .collect()
    }

    /// Rebuild tracked assets from persisted records without touching the ledger.
    /// Counters start at zero.
    pub fn restore(&self, records: &[AssetRecord]) {
        let now = self.clock.now_ms();
        let mut root = None;
        for rec in records {
            let fallback = fallback_metadata(&rec.address);
            let derived = self.pools.derived_pool(&rec.address);
            let asset = TrackedAsset {
                address: rec.address.clone(),
                symbol: SmolStr::new(rec.symbol.clone().unwrap_or(fallback.symbol)),
                name: rec.name.clone().unwrap_or(fallback.name),
                is_root: false,
                pool_address: rec.pool_address.clone().unwrap_or(derived.address),
                pool_kind: rec.pool_kind.unwrap_or(derived.kind),
                pending_fee_units: 0,
                total_collected_units: 0,
                total_burned_units: 0,
                last_fee_update_slot: 0,
                last_burn_signature: None,
                discovered_at_ms: now,
                last_updated_at_ms: now,
            };
            if rec.is_root {
                root = Some(rec.address.clone());
            }
            self.assets.insert(rec.address.clone(), asset);
        }
        if let Some(root) = root {
            let _ = self.set_root(&root);
        }
        tracing::info!(count = records.len(), "restored tracked assets");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{PoolKind, PoolRef, TransactionDetail};
    use infra_clock::ManualClock;
    use paper_ledger::PaperLedger;

    const AUTH: &str = "Authority1111111111111111111111";

    fn registry(ledger: Arc<PaperLedger>) -> AssetRegistry {
        AssetRegistry::new(
            RegistryConfig {
                authority: AUTH.to_string(),
                fee_account: "fees".to_string(),
                history_scan_limit: 50,
            },
            ledger.clone(),
            ledger,
            ManualClock::shared(1_000),
        )
    }

    fn meta(address: &str, symbol: &str) -> AssetMetadata {
        AssetMetadata {
            address: address.to_string(),
            symbol: symbol.to_string(),
            name: format!("{symbol} token"),
            authorities: vec![AUTH.to_string()],
        }
    }

    #[test]
    fn fallback_is_address_derived() {
        let meta = fallback_metadata("abcdEFGHijklMNOPqrst");
        assert_eq!(meta.symbol, "ABCD");
        assert_eq!(meta.name, "Asset abcd…qrst");
    }

    #[tokio::test]
    async fn discover_by_authority_tracks_new_assets_once() {
        let ledger = Arc::new(PaperLedger::new("fees"));
        ledger.add_asset(
            meta("MintB", "BBB"),
            Some(PoolRef {
                address: "amm-B".into(),
                kind: PoolKind::Amm,
            }),
        );
        ledger.add_asset(meta("MintA", "AAA"), None);
        let reg = registry(ledger);

        let added = reg.discover().await.expect("discover");
        assert_eq!(added, vec!["MintA", "MintB"]);
        assert!(reg.discover().await.expect("again").is_empty());

        let b = reg.get("MintB").expect("tracked");
        assert_eq!(b.pool_kind, PoolKind::Amm);
        assert_eq!(b.symbol, "BBB");
        assert_eq!(reg.get("MintA").expect("tracked").pool_address, "curve-MintA");
    }

    #[tokio::test]
    async fn discover_falls_back_to_fee_history() {
        let ledger = Arc::new(PaperLedger::new("fees"));
        let mut foreign = meta("MintM", "MIG");
        foreign.authorities = vec!["Other".to_string()];
        ledger.add_asset(foreign, None);
        ledger.add_asset(meta("MintN", "NEW"), None);
        ledger.push_fee_transaction(
            TransactionDetail {
                token_mints: vec!["MintM".into(), "MintN".into(), "MintX".into()],
                ..TransactionDetail::default()
            },
            1_000,
        );
        let reg = registry(ledger.clone());

        // authority index unavailable
        ledger.inject_errors("503 service unavailable", 1);
        let added = reg.discover().await.expect("discover");
        assert_eq!(added, vec!["MintN"]);
        assert_eq!(reg.get("MintN").expect("tracked").symbol, "NEW");
        assert!(!reg.contains("MintM"));
    }

    #[tokio::test]
    async fn tracking_never_fails_and_uses_fallbacks() {
        let ledger = Arc::new(PaperLedger::new("fees"));
        ledger.make_pool_unresolvable("ZzzzUnknownMint9999");
        ledger.inject_errors("connection reset", 1);
        let reg = registry(ledger);

        let asset = reg.initialize_tracking("ZzzzUnknownMint9999", false).await;
        assert_eq!(asset.symbol, "ZZZZ");
        assert_eq!(asset.pool_address, "curve-ZzzzUnknownMint9999");
        assert_eq!(asset.pool_kind, PoolKind::BondingCurve);
    }

    #[tokio::test]
    async fn single_root_is_enforced() {
        let ledger = Arc::new(PaperLedger::new("fees"));
        let reg = registry(ledger);
        reg.initialize_tracking("RootOne", true).await;
        reg.initialize_tracking("RootTwo", true).await;
        reg.initialize_tracking("Plain", false).await;

        let roots = reg.snapshot().into_iter().filter(|a| a.is_root).count();
        assert_eq!(roots, 1);
        assert_eq!(reg.root().expect("root").address, "RootTwo");
        assert_eq!(
            reg.set_root("missing"),
            Err(RegistryError::UnknownAsset("missing".into()))
        );
    }

    #[tokio::test]
    async fn counters_move_only_through_update_and_reset() {
        let ledger = Arc::new(PaperLedger::new("fees"));
        let reg = registry(ledger);
        reg.initialize_tracking("A", true).await;
        reg.initialize_tracking("B", false).await;

        assert_eq!(reg.update_fees("A", 500, 10).expect("update"), 500);
        assert_eq!(reg.update_fees("A", -200, 11).expect("update"), 300);
        assert_eq!(reg.update_fees("B", 100, 9).expect("update"), 100);
        assert!(reg.update_fees("C", 1, 1).is_err());

        let totals = reg.totals();
        assert_eq!(totals.pending_units, 400);
        assert_eq!(totals.collected_units, 600);
        assert_eq!(totals.asset_count, 2);

        reg.reset_fees("A", 300, Some("sig".into())).expect("reset");
        let a = reg.get("A").expect("a");
        assert_eq!(a.pending_fee_units, 0);
        assert_eq!(a.total_burned_units, 300);
        assert_eq!(a.last_burn_signature.as_deref(), Some("sig"));
        assert_eq!(a.last_fee_update_slot, 11);

        reg.zero_all_pending();
        assert_eq!(reg.totals().pending_units, 0);
    }

    #[tokio::test]
    async fn persisted_records_restore_identity() {
        let ledger = Arc::new(PaperLedger::new("fees"));
        let reg = registry(ledger.clone());
        reg.initialize_tracking("A", true).await;
        reg.initialize_tracking("B", false).await;
        let records = reg.to_persisted();

        let restored = registry(ledger);
        restored.restore(&records);
        assert_eq!(restored.root().expect("root").address, "A");
        assert_eq!(restored.snapshot().len(), 2);

        let bare = registry(Arc::new(PaperLedger::new("fees")));
        bare.restore(&[AssetRecord::bare("LegacyMint", true)]);
        let legacy = bare.root().expect("root");
        assert_eq!(legacy.symbol, "LEGA");
        assert_eq!(legacy.pool_address, "curve-LegacyMint");
    }
}
