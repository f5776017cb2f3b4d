use std::collections::BTreeSet;

use asset_registry::AssetRegistry;
use async_trait::async_trait;
use core_types::TransactionDetail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttributionSource {
    DirectMint,
    PoolAddress,
    InnerTransfer,
    Elimination,
    DynamicDiscovery,
}

impl AttributionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectMint => "direct_mint",
            Self::PoolAddress => "pool_address",
            Self::InnerTransfer => "inner_transfer",
            Self::Elimination => "elimination",
            Self::DynamicDiscovery => "dynamic_discovery",
        }
    }
}

/// One step of the attribution cascade. Returns the asset address only when
/// exactly one candidate matches; more than one is a decline.
#[async_trait]
pub trait AttributionStrategy: Send + Sync {
    fn source(&self) -> AttributionSource;
    async fn attempt(&self, tx: &TransactionDetail, registry: &AssetRegistry) -> Option<String>;
}

fn single(candidates: BTreeSet<String>, source: AttributionSource, tx: &TransactionDetail) -> Option<String> {
    if candidates.len() > 1 {
        tracing::debug!(
            signature = %tx.signature,
            source = source.as_str(),
            candidates = candidates.len(),
            "ambiguous attribution declined"
        );
        return None;
    }
    candidates.into_iter().next()
}

pub struct DirectMintMatch;

#[async_trait]
impl AttributionStrategy for DirectMintMatch {
    fn source(&self) -> AttributionSource {
        AttributionSource::DirectMint
    }

    async fn attempt(&self, tx: &TransactionDetail, registry: &AssetRegistry) -> Option<String> {
        let hits = tx
            .account_keys
            .iter()
            .filter(|k| registry.contains(k))
            .cloned()
            .collect::<BTreeSet<_>>();
        single(hits, self.source(), tx)
    }
}

pub struct PoolAddressMatch;

#[async_trait]
impl AttributionStrategy for PoolAddressMatch {
    fn source(&self) -> AttributionSource {
        AttributionSource::PoolAddress
    }

    async fn attempt(&self, tx: &TransactionDetail, registry: &AssetRegistry) -> Option<String> {
        let hits = tx
            .account_keys
            .iter()
            .filter_map(|k| registry.find_by_pool(k))
            .map(|a| a.address)
            .collect::<BTreeSet<_>>();
        single(hits, self.source(), tx)
    }
}

pub struct InnerTransferMint;

#[async_trait]
impl AttributionStrategy for InnerTransferMint {
    fn source(&self) -> AttributionSource {
        AttributionSource::InnerTransfer
    }

    async fn attempt(&self, tx: &TransactionDetail, registry: &AssetRegistry) -> Option<String> {
        let hits = tx
            .inner_transfer_mints
            .iter()
            .chain(tx.token_mints.iter())
            .filter(|m| registry.contains(m))
            .cloned()
            .collect::<BTreeSet<_>>();
        single(hits, self.source(), tx)
    }
}

pub struct SoleAssetElimination;

#[async_trait]
impl AttributionStrategy for SoleAssetElimination {
    fn source(&self) -> AttributionSource {
        AttributionSource::Elimination
    }

    async fn attempt(&self, _tx: &TransactionDetail, registry: &AssetRegistry) -> Option<String> {
        if registry.len() != 1 {
            return None;
        }
        registry.snapshot().into_iter().next().map(|a| a.address)
    }
}

/// Start tracking an unknown mint from the transaction when its metadata names our authority.
pub struct DynamicDiscovery;

#[async_trait]
impl AttributionStrategy for DynamicDiscovery {
    fn source(&self) -> AttributionSource {
        AttributionSource::DynamicDiscovery
    }

    async fn attempt(&self, tx: &TransactionDetail, registry: &AssetRegistry) -> Option<String> {
        let unknown = tx
            .token_mints
            .iter()
            .chain(tx.inner_transfer_mints.iter())
            .filter(|m| !registry.contains(m))
            .cloned()
            .collect::<BTreeSet<_>>();
        let mut ours = BTreeSet::new();
        for mint in unknown {
            let meta = registry.lookup_metadata(&mint).await;
            if meta.authorities.iter().any(|a| a == registry.authority()) {
                ours.insert(mint);
            }
        }
        let address = single(ours, self.source(), tx)?;
        registry.initialize_tracking(&address, false).await;
        Some(address)
    }
}

/// The cascade in evaluation order.
pub fn default_strategies(dynamic_discovery: bool) -> Vec<Box<dyn AttributionStrategy>> {
    let mut out: Vec<Box<dyn AttributionStrategy>> = vec![
        Box::new(DirectMintMatch),
        Box::new(PoolAddressMatch),
        Box::new(InnerTransferMint),
        Box::new(SoleAssetElimination),
    ];
    if dynamic_discovery {
        out.push(Box::new(DynamicDiscovery));
    }
    out
}
