use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use core_types::{AssetRecord, FeeTrackingMeta};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub mod atomic;

pub use atomic::{read_json, remove_if_exists, write_json_atomic};

pub const SCHEMA_VERSION: u32 = 3;
pub const DEFAULT_NETWORK: &str = "mainnet-beta";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(default)]
    pub saved_at_ms: i64,
    pub authority_address: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub tokens: Vec<AssetRecord>,
    #[serde(default)]
    pub fee_tracking_meta: FeeTrackingMeta,
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

impl PersistedState {
    pub fn new(authority_address: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            saved_at_ms: 0,
            authority_address: authority_address.into(),
            network: network.into(),
            tokens: Vec::new(),
            fee_tracking_meta: FeeTrackingMeta::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state document is not a JSON object")]
    NotAnObject,
    #[error("unsupported state schema version {0}")]
    UnsupportedVersion(u64),
    #[error("state is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("state does not match the current schema: {0}")]
    Shape(String),
    #[error("no readable state among {0} candidate files")]
    NoValidState(usize),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

fn detect_version(doc: &Map<String, Value>) -> u64 {
    doc.get("schema_version")
        .or_else(|| doc.get("version"))
        .and_then(Value::as_u64)
        .unwrap_or(1)
}

/// v1: `version`, `authority`, `tokens[{mint, root}]`, top-level signature list.
fn migrate_v1_to_v2(doc: Map<String, Value>) -> Map<String, Value> {
    let tokens = doc
        .get("tokens")
        .and_then(Value::as_array)
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|t| {
                    let address = t.get("mint").or_else(|| t.get("address"))?.as_str()?;
                    let is_root = t
                        .get("root")
                        .or_else(|| t.get("is_root"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let mut out = json!({"address": address, "is_root": is_root});
                    if let Some(symbol) = t.get("symbol").and_then(Value::as_str) {
                        out["symbol"] = json!(symbol);
                    }
                    Some(out)
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut out = Map::new();
    out.insert("schema_version".into(), json!(2));
    out.insert(
        "saved_at_ms".into(),
        doc.get("saved_at_ms")
            .or_else(|| doc.get("saved_at"))
            .cloned()
            .unwrap_or(json!(0)),
    );
    if let Some(authority) = doc.get("authority").or_else(|| doc.get("authority_address")) {
        out.insert("authority_address".into(), authority.clone());
    }
    out.insert(
        "network".into(),
        doc.get("network").cloned().unwrap_or(json!(DEFAULT_NETWORK)),
    );
    out.insert("tokens".into(), Value::Array(tokens));
    out.insert(
        "fee_tracking_meta".into(),
        json!({
            "processed_signatures": doc.get("processed_signatures").cloned().unwrap_or(json!([])),
            "last_processed_signature": doc.get("last_signature").cloned().unwrap_or(Value::Null),
        }),
    );
    out
}

/// v2 lacks the poll/error counters.
fn migrate_v2_to_v3(mut doc: Map<String, Value>) -> Map<String, Value> {
    let meta = doc
        .entry("fee_tracking_meta")
        .or_insert_with(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        meta.entry("poll_count").or_insert(json!(0));
        meta.entry("error_count").or_insert(json!(0));
        meta.entry("processed_signatures").or_insert(json!([]));
    }
    doc.insert("schema_version".into(), json!(3));
    doc
}

/// Bring any supported document up to the current schema. Pure and idempotent.
pub fn migrate(raw: Value) -> Result<PersistedState, StateError> {
    let Value::Object(mut doc) = raw else {
        return Err(StateError::NotAnObject);
    };
    let mut version = detect_version(&doc);
    if version == 0 || version > SCHEMA_VERSION as u64 {
        return Err(StateError::UnsupportedVersion(version));
    }
    if version == 1 {
        doc = migrate_v1_to_v2(doc);
        version = 2;
    }
    if version == 2 {
        doc = migrate_v2_to_v3(doc);
    }

    let state: PersistedState =
        serde_json::from_value(Value::Object(doc)).map_err(|e| StateError::Shape(e.to_string()))?;
    if state.authority_address.trim().is_empty() {
        return Err(StateError::MissingField("authority_address"));
    }
    Ok(state)
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    backups: usize,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, backups: usize) -> Self {
        Self {
            path: path.into(),
            backups,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{n}"));
        self.path.with_file_name(name)
    }

    fn candidates(&self) -> Vec<PathBuf> {
        std::iter::once(self.path.clone())
            .chain((1..=self.backups).map(|n| self.backup_path(n)))
            .collect()
    }

    /// Shift `.1..N-1` up one slot, then copy the current file to `.1`.
    fn rotate_backups(&self) -> anyhow::Result<()> {
        if self.backups == 0 || !self.path.exists() {
            return Ok(());
        }
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))
                    .with_context(|| format!("rotate {}", from.display()))?;
            }
        }
        fs::copy(&self.path, self.backup_path(1))
            .with_context(|| format!("backup {}", self.path.display()))?;
        Ok(())
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let mut state = state.clone();
        state.schema_version = SCHEMA_VERSION;
        let payload = serde_json::to_vec_pretty(&state).context("serialize state")?;
        if let Err(err) = self.rotate_backups() {
            tracing::warn!(error = %err, "state backup rotation failed");
        }
        atomic::write_bytes_atomic(&self.path, &payload)?;
        tracing::debug!(
            path = %self.path.display(),
            tokens = state.tokens.len(),
            signatures = state.fee_tracking_meta.processed_signatures.len(),
            "state saved"
        );
        Ok(())
    }

    /// First candidate (canonical, then backups) that parses and migrates.
    /// `Ok(None)` when no state has ever been written.
    pub fn load(&self) -> Result<Option<PersistedState>, StateError> {
        let candidates = self.candidates();
        let mut seen = 0usize;
        for path in &candidates {
            let raw: Value = match read_json(path) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    seen += 1;
                    tracing::warn!(path = %path.display(), error = %err, "unreadable state file");
                    continue;
                }
            };
            seen += 1;
            match migrate(raw) {
                Ok(state) => {
                    if path != &self.path {
                        tracing::warn!(path = %path.display(), "state restored from backup");
                    }
                    return Ok(Some(state));
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "rejected state file");
                }
            }
        }
        if seen == 0 {
            Ok(None)
        } else {
            Err(StateError::NoValidState(seen))
        }
    }
}
