//! Typed decoding of ledger JSON-RPC results into core records.
//!
//! Each response shape gets a narrow serde struct; anything the node sends
//! beyond these fields is ignored.

use core_types::{
    AssetMetadata, Blockhash, SignatureInfo, SimulationResult, TransactionDetail, Units,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::RpcError;

fn parse<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::decode(format!("{what}: {e}")))
}

#[derive(Deserialize)]
struct WithContext<T> {
    value: T,
}

pub fn slot(value: Value) -> Result<u64, RpcError> {
    parse("slot", value)
}

pub fn balance(value: Value) -> Result<Units, RpcError> {
    let wrapped: WithContext<u64> = parse("balance", value)?;
    Ok(wrapped.value as Units)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignature {
    signature: String,
    slot: u64,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    block_time: Option<i64>,
}

pub fn signatures(value: Value) -> Result<Vec<SignatureInfo>, RpcError> {
    let raw: Vec<RawSignature> = parse("signatures", value)?;
    Ok(raw
        .into_iter()
        .map(|r| SignatureInfo {
            signature: r.signature,
            slot: r.slot,
            failed: r.err.is_some_and(|e| !e.is_null()),
            block_time_ms: r.block_time.map(|s| s.saturating_mul(1_000)),
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAccountKey {
    Plain(String),
    Parsed { pubkey: String },
}

impl RawAccountKey {
    fn into_address(self) -> String {
        match self {
            Self::Plain(s) => s,
            Self::Parsed { pubkey } => pubkey,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default)]
    account_keys: Vec<RawAccountKey>,
}

#[derive(Deserialize)]
struct RawTxBody {
    message: RawMessage,
    #[serde(default)]
    signatures: Vec<String>,
}

#[derive(Deserialize)]
struct RawTokenBalance {
    mint: String,
}

#[derive(Deserialize, Default)]
struct RawLoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}

#[derive(Deserialize)]
struct RawInner {
    #[serde(default)]
    instructions: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Option<Vec<RawTokenBalance>>,
    #[serde(default)]
    post_token_balances: Option<Vec<RawTokenBalance>>,
    #[serde(default)]
    inner_instructions: Option<Vec<RawInner>>,
    #[serde(default)]
    loaded_addresses: Option<RawLoadedAddresses>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    slot: u64,
    #[serde(default)]
    block_time: Option<i64>,
    transaction: RawTxBody,
    meta: Option<RawMeta>,
}

fn push_unique(dst: &mut Vec<String>, value: String) {
    if !dst.contains(&value) {
        dst.push(value);
    }
}

/// Mint referenced by a parsed inner instruction (token transfers, mints, burns).
fn inner_mint(ix: &Value) -> Option<String> {
    let info = ix.get("parsed")?.get("info")?;
    info.get("mint")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn transaction(signature: &str, value: Value) -> Result<Option<TransactionDetail>, RpcError> {
    if value.is_null() {
        return Ok(None);
    }
    let raw: RawTransaction = parse("transaction", value)?;
    let meta = raw.meta.ok_or_else(|| RpcError::decode("transaction without meta"))?;

    let mut account_keys = raw
        .transaction
        .message
        .account_keys
        .into_iter()
        .map(RawAccountKey::into_address)
        .collect::<Vec<_>>();
    // v0 transactions list lookup-table accounts after the static keys
    let loaded = meta.loaded_addresses.unwrap_or_default();
    account_keys.extend(loaded.writable);
    account_keys.extend(loaded.readonly);

    let mut token_mints = Vec::new();
    for tb in meta
        .pre_token_balances
        .unwrap_or_default()
        .into_iter()
        .chain(meta.post_token_balances.unwrap_or_default())
    {
        push_unique(&mut token_mints, tb.mint);
    }

    let mut inner_transfer_mints = Vec::new();
    for inner in meta.inner_instructions.unwrap_or_default() {
        for ix in &inner.instructions {
            if let Some(mint) = inner_mint(ix) {
                push_unique(&mut inner_transfer_mints, mint);
            }
        }
    }

    let signature = raw
        .transaction
        .signatures
        .into_iter()
        .next()
        .unwrap_or_else(|| signature.to_string());

    Ok(Some(TransactionDetail {
        signature,
        slot: raw.slot,
        block_time_ms: raw.block_time.map(|s| s.saturating_mul(1_000)),
        failed: meta.err.is_some_and(|e| !e.is_null()),
        account_keys,
        pre_balances: meta.pre_balances.into_iter().map(Units::from).collect(),
        post_balances: meta.post_balances.into_iter().map(Units::from).collect(),
        token_mints,
        inner_transfer_mints,
    }))
}

#[derive(Deserialize, Default)]
struct RawAssetMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: String,
}

#[derive(Deserialize, Default)]
struct RawContent {
    #[serde(default)]
    metadata: RawAssetMeta,
}

#[derive(Deserialize)]
struct RawAuthority {
    address: String,
}

#[derive(Deserialize)]
struct RawAsset {
    id: String,
    #[serde(default)]
    content: RawContent,
    #[serde(default)]
    authorities: Vec<RawAuthority>,
}

impl From<RawAsset> for AssetMetadata {
    fn from(raw: RawAsset) -> Self {
        Self {
            address: raw.id,
            symbol: raw.content.metadata.symbol.trim().to_string(),
            name: raw.content.metadata.name.trim().to_string(),
            authorities: raw.authorities.into_iter().map(|a| a.address).collect(),
        }
    }
}

pub fn asset(value: Value) -> Result<Option<AssetMetadata>, RpcError> {
    if value.is_null() {
        return Ok(None);
    }
    let raw: RawAsset = parse("asset", value)?;
    Ok(Some(raw.into()))
}

#[derive(Deserialize)]
struct RawAssetPage {
    #[serde(default)]
    items: Vec<RawAsset>,
}

pub fn asset_page(value: Value) -> Result<Vec<AssetMetadata>, RpcError> {
    let page: RawAssetPage = parse("asset page", value)?;
    Ok(page.items.into_iter().map(AssetMetadata::from).collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlockhash {
    blockhash: String,
    last_valid_block_height: u64,
}

pub fn blockhash(value: Value) -> Result<Blockhash, RpcError> {
    let wrapped: WithContext<RawBlockhash> = parse("blockhash", value)?;
    Ok(Blockhash {
        hash: wrapped.value.blockhash,
        last_valid_block_height: wrapped.value.last_valid_block_height,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSimulation {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    logs: Option<Vec<String>>,
    #[serde(default)]
    units_consumed: Option<u64>,
}

pub fn simulation(value: Value) -> Result<SimulationResult, RpcError> {
    let wrapped: WithContext<RawSimulation> = parse("simulation", value)?;
    let raw = wrapped.value;
    Ok(SimulationResult {
        err: raw.err.filter(|e| !e.is_null()).map(|e| match e {
            Value::String(s) => s,
            other => other.to_string(),
        }),
        logs: raw.logs.unwrap_or_default(),
        units_consumed: raw.units_consumed,
    })
}

pub fn sent_signature(value: Value) -> Result<String, RpcError> {
    parse("send", value)
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub confirmation_status: Option<String>,
}

impl SignatureStatus {
    pub fn failure(&self) -> Option<String> {
        self.err
            .as_ref()
            .filter(|e| !e.is_null())
            .map(Value::to_string)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(
            self.confirmation_status.as_deref(),
            Some("confirmed") | Some("finalized")
        )
    }
}

pub fn signature_status(value: Value) -> Result<Option<SignatureStatus>, RpcError> {
    let wrapped: WithContext<Vec<Option<SignatureStatus>>> = parse("signature status", value)?;
    Ok(wrapped.value.into_iter().next().flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_signature_page() {
        let value = json!([
            {"signature": "s2", "slot": 11, "err": null, "blockTime": 1_700_000_001, "memo": null},
            {"signature": "s1", "slot": 10, "err": {"InstructionError": [0, "Custom"]}, "blockTime": null}
        ]);
        let sigs = signatures(value).expect("decode");
        assert_eq!(sigs.len(), 2);
        assert!(!sigs[0].failed);
        assert_eq!(sigs[0].block_time_ms, Some(1_700_000_001_000));
        assert!(sigs[1].failed);
    }

    #[test]
    fn decodes_parsed_transaction_with_lookup_tables() {
        let value = json!({
            "slot": 250,
            "blockTime": 1_700_000_000,
            "transaction": {
                "signatures": ["sigA"],
                "message": {
                    "accountKeys": [
                        {"pubkey": "payer", "signer": true, "writable": true},
                        {"pubkey": "vault", "signer": false, "writable": true}
                    ]
                }
            },
            "meta": {
                "err": null,
                "preBalances": [5_000_000, 100, 0],
                "postBalances": [4_000_000, 900, 0],
                "preTokenBalances": [{"mint": "MintA", "accountIndex": 2}],
                "postTokenBalances": [{"mint": "MintA"}, {"mint": "MintB"}],
                "innerInstructions": [
                    {"index": 0, "instructions": [
                        {"parsed": {"type": "transferChecked", "info": {"mint": "MintC", "amount": "1"}}},
                        {"programId": "x", "data": "abc"}
                    ]}
                ],
                "loadedAddresses": {"writable": ["pool"], "readonly": []}
            }
        });
        let tx = transaction("sigA", value).expect("decode").expect("present");
        assert_eq!(tx.account_keys, vec!["payer", "vault", "pool"]);
        assert_eq!(tx.balance_delta("vault"), Some(800));
        assert_eq!(tx.token_mints, vec!["MintA", "MintB"]);
        assert_eq!(tx.inner_transfer_mints, vec!["MintC"]);
        assert_eq!(tx.block_time_ms, Some(1_700_000_000_000));
        assert!(!tx.failed);
    }

    #[test]
    fn missing_transaction_is_none() {
        assert!(transaction("x", Value::Null).expect("decode").is_none());
    }

    #[test]
    fn decodes_asset_with_authorities() {
        let value = json!({
            "id": "Mint1",
            "content": {"metadata": {"name": " Alpha ", "symbol": "ALP"}},
            "authorities": [{"address": "Auth", "scopes": ["full"]}]
        });
        let meta = asset(value).expect("decode").expect("present");
        assert_eq!(meta.name, "Alpha");
        assert_eq!(meta.authorities, vec!["Auth"]);
    }

    #[test]
    fn decodes_simulation_error_object() {
        let value = json!({"context": {"slot": 1}, "value": {
            "err": {"InstructionError": [2, {"Custom": 6002}]},
            "logs": ["Program log: slippage exceeded"],
            "unitsConsumed": 120_000
        }});
        let sim = simulation(value).expect("decode");
        assert!(!sim.is_ok());
        assert!(sim.failure_text().contains("slippage"));
        assert_eq!(sim.units_consumed, Some(120_000));
    }

    #[test]
    fn decodes_status() {
        let value = json!({"context": {"slot": 1}, "value": [
            {"slot": 1, "confirmations": null, "err": null, "confirmationStatus": "finalized"}
        ]});
        let status = signature_status(value).expect("decode").expect("present");
        assert!(status.is_confirmed());
        assert!(status.failure().is_none());

        let empty = json!({"context": {"slot": 1}, "value": [null]});
        assert!(signature_status(empty).expect("decode").is_none());
    }
}
