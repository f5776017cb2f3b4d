use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use core_types::Units;
use infra_clock::SharedClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use state_store::{read_json, write_json_atomic};
use thiserror::Error;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
pub const METADATA_VERSION: u32 = 1;
const LOG_FILE: &str = "audit.jsonl";
const META_FILE: &str = "audit_meta.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServiceStarted,
    ServiceStopped,
    AssetDiscovered,
    FeeDetected,
    FeeUnattributed,
    SyncDivergence,
    Reconciled,
    CycleStarted,
    CycleCompleted,
    CycleFailed,
    TokenBurned,
    TokenFailed,
    CrashRecovery,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub sequence: u64,
    pub prev_hash: String,
    pub hash: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub slot: Option<u64>,
    pub event_kind: EventKind,
    pub payload: Value,
}

/// Hashed view of an entry; field order here is the canonical order.
#[derive(Serialize)]
struct EntryDigest<'a> {
    sequence: u64,
    prev_hash: &'a str,
    timestamp_ms: i64,
    slot: Option<u64>,
    event_kind: EventKind,
    payload: &'a Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainMetadata {
    pub version: u32,
    pub created_at_ms: i64,
    pub last_updated_ms: i64,
    pub total_entries: u64,
    pub latest_hash: String,
    pub total_fees_detected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attestation {
    pub latest_hash: String,
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub total_entries: u64,
    pub genesis_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainValidation {
    pub entries_checked: u64,
    pub latest_hash: String,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit chain broken at sequence {sequence}: {reason}")]
    Broken { sequence: u64, reason: String },
    #[error("audit log line {line} is not a valid entry: {message}")]
    Malformed { line: usize, message: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl AuditError {
    pub fn is_corruption(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Audit payloads carry amounts as decimal strings.
pub fn units(value: Units) -> Value {
    Value::String(value.to_string())
}

/// Rebuild every object with keys inserted in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn entry_hash(
    sequence: u64,
    prev_hash: &str,
    timestamp_ms: i64,
    slot: Option<u64>,
    event_kind: EventKind,
    payload: &Value,
) -> Result<String, AuditError> {
    let digest = EntryDigest {
        sequence,
        prev_hash,
        timestamp_ms,
        slot,
        event_kind,
        payload,
    };
    let encoded = serde_json::to_vec(&digest)
        .map_err(|e| AuditError::Io(anyhow::anyhow!("encode audit digest: {e}")))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Check one entry against the expected sequence and predecessor hash.
fn verify_entry(entry: &AuditEntry, expected_sequence: u64, expected_prev: &str) -> Result<(), AuditError> {
    if entry.sequence != expected_sequence {
        return Err(AuditError::Broken {
            sequence: entry.sequence,
            reason: format!("expected sequence {expected_sequence}"),
        });
    }
    if entry.prev_hash != expected_prev {
        return Err(AuditError::Broken {
            sequence: entry.sequence,
            reason: format!(
                "prev_hash {} does not match predecessor {}",
                entry.prev_hash, expected_prev
            ),
        });
    }
    let recomputed = entry_hash(
        entry.sequence,
        &entry.prev_hash,
        entry.timestamp_ms,
        entry.slot,
        entry.event_kind,
        &entry.payload,
    )?;
    if recomputed != entry.hash {
        return Err(AuditError::Broken {
            sequence: entry.sequence,
            reason: format!("stored hash {} recomputes to {}", entry.hash, recomputed),
        });
    }
    Ok(())
}

struct ScanResult {
    total: u64,
    latest_hash: String,
    latest_timestamp_ms: i64,
    fees_detected: u64,
    tail: VecDeque<AuditEntry>,
}

/// Walk the whole log from genesis, keeping the last `window` entries.
fn scan_log(path: &Path, window: usize) -> Result<ScanResult, AuditError> {
    let mut result = ScanResult {
        total: 0,
        latest_hash: GENESIS_HASH.to_string(),
        latest_timestamp_ms: 0,
        fees_detected: 0,
        tail: VecDeque::new(),
    };
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
        Err(err) => {
            return Err(AuditError::Io(
                anyhow::Error::new(err).context(format!("open {}", path.display())),
            ))
        }
    };
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| AuditError::Io(anyhow::Error::new(e).context("read audit log")))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| AuditError::Malformed {
            line: idx + 1,
            message: e.to_string(),
        })?;
        verify_entry(&entry, result.total + 1, &result.latest_hash)?;
        result.total = entry.sequence;
        result.latest_hash = entry.hash.clone();
        result.latest_timestamp_ms = entry.timestamp_ms;
        if entry.event_kind == EventKind::FeeDetected {
            result.fees_detected += 1;
        }
        result.tail.push_back(entry);
        while result.tail.len() > window {
            result.tail.pop_front();
        }
    }
    Ok(result)
}

struct ChainState {
    recent: VecDeque<AuditEntry>,
    next_sequence: u64,
    latest_hash: String,
    latest_timestamp_ms: i64,
    meta: ChainMetadata,
}

/// Append-only, hash-linked event log: a JSONL stream plus a rewritten metadata rollup.
pub struct AuditChain {
    log_path: PathBuf,
    meta_path: PathBuf,
    window: usize,
    clock: SharedClock,
    state: Mutex<ChainState>,
}

impl AuditChain {
    /// Open (or create) the chain under `dir`. The full log is validated; any
    /// break is returned as corruption.
    pub fn open(dir: &Path, window: usize, clock: SharedClock) -> Result<Self, AuditError> {
        fs::create_dir_all(dir)
            .map_err(|e| AuditError::Io(anyhow::Error::new(e).context(format!("create {}", dir.display()))))?;
        let log_path = dir.join(LOG_FILE);
        let meta_path = dir.join(META_FILE);
        let window = window.max(1);

        let scan = scan_log(&log_path, window)?;
        let now = clock.now_ms();
        let created_at_ms = match read_json::<ChainMetadata>(&meta_path) {
            Ok(Some(meta)) => meta.created_at_ms,
            Ok(None) => now,
            Err(err) => {
                tracing::warn!(error = %err, "audit metadata unreadable; rebuilding from log");
                now
            }
        };
        let meta = ChainMetadata {
            version: METADATA_VERSION,
            created_at_ms,
            last_updated_ms: if scan.total > 0 { scan.latest_timestamp_ms } else { now },
            total_entries: scan.total,
            latest_hash: scan.latest_hash.clone(),
            total_fees_detected: scan.fees_detected,
        };
        write_json_atomic(&meta_path, &meta)?;
        tracing::info!(entries = scan.total, latest = %short_hash(&scan.latest_hash), "audit chain verified");

        Ok(Self {
            log_path,
            meta_path,
            window,
            clock,
            state: Mutex::new(ChainState {
                recent: scan.tail,
                next_sequence: scan.total + 1,
                latest_hash: scan.latest_hash,
                latest_timestamp_ms: scan.latest_timestamp_ms,
                meta,
            }),
        })
    }

    /// The only write path.
    pub fn append(
        &self,
        kind: EventKind,
        payload: Value,
        slot: Option<u64>,
    ) -> Result<AuditEntry, AuditError> {
        let payload = canonicalize(&payload);
        let mut state = self.state.lock();
        // timestamps never run backwards within the chain
        let timestamp_ms = self.clock.now_ms().max(state.latest_timestamp_ms);
        let sequence = state.next_sequence;
        let hash = entry_hash(sequence, &state.latest_hash, timestamp_ms, slot, kind, &payload)?;
        let entry = AuditEntry {
            sequence,
            prev_hash: state.latest_hash.clone(),
            hash,
            timestamp_ms,
            slot,
            event_kind: kind,
            payload,
        };

        let line = serde_json::to_string(&entry)
            .map_err(|e| AuditError::Io(anyhow::anyhow!("encode audit entry: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| AuditError::Io(anyhow::Error::new(e).context("open audit log")))?;
        writeln!(file, "{line}")
            .and_then(|_| file.sync_data())
            .map_err(|e| AuditError::Io(anyhow::Error::new(e).context("append audit entry")))?;

        state.next_sequence += 1;
        state.latest_hash = entry.hash.clone();
        state.latest_timestamp_ms = timestamp_ms;
        state.recent.push_back(entry.clone());
        while state.recent.len() > self.window {
            state.recent.pop_front();
        }
        state.meta.total_entries = sequence;
        state.meta.latest_hash = entry.hash.clone();
        state.meta.last_updated_ms = timestamp_ms;
        if kind == EventKind::FeeDetected {
            state.meta.total_fees_detected += 1;
        }
        if let Err(err) = write_json_atomic(&self.meta_path, &state.meta) {
            // the log line is already durable; the rollup is rebuilt on open
            tracing::warn!(error = %err, "audit metadata write failed");
        }
        metrics::counter!("audit.appends").increment(1);
        Ok(entry)
    }

    /// Append, logging instead of failing. For paths that must not stop on audit I/O.
    pub fn record(&self, kind: EventKind, payload: Value, slot: Option<u64>) {
        if let Err(err) = self.append(kind, payload, slot) {
            tracing::error!(?kind, error = %err, "audit append failed");
        }
    }

    /// Verify linkage and hashes. `full` walks the on-disk log from genesis;
    /// otherwise only the in-memory window is checked.
    pub fn validate_chain(&self, full: bool) -> Result<ChainValidation, AuditError> {
        if full {
            let scan = scan_log(&self.log_path, 1)?;
            let state = self.state.lock();
            if scan.total + 1 != state.next_sequence {
                return Err(AuditError::Broken {
                    sequence: scan.total + 1,
                    reason: format!(
                        "log ends at {} but chain head is {}",
                        scan.total,
                        state.next_sequence - 1
                    ),
                });
            }
            return Ok(ChainValidation {
                entries_checked: scan.total,
                latest_hash: scan.latest_hash,
            });
        }

        let state = self.state.lock();
        let mut iter = state.recent.iter();
        let Some(first) = iter.next() else {
            return Ok(ChainValidation {
                entries_checked: 0,
                latest_hash: state.latest_hash.clone(),
            });
        };
        // the window's first predecessor is outside memory; take it as given
        verify_entry(first, first.sequence, &first.prev_hash)?;
        let mut prev = first;
        for entry in iter {
            verify_entry(entry, prev.sequence + 1, &prev.hash)?;
            prev = entry;
        }
        Ok(ChainValidation {
            entries_checked: state.recent.len() as u64,
            latest_hash: prev.hash.clone(),
        })
    }

    pub fn attestation(&self) -> Attestation {
        let state = self.state.lock();
        Attestation {
            latest_hash: state.latest_hash.clone(),
            sequence: state.next_sequence - 1,
            timestamp_ms: state.latest_timestamp_ms,
            total_entries: state.meta.total_entries,
            genesis_hash: GENESIS_HASH.to_string(),
        }
    }

    pub fn metadata(&self) -> ChainMetadata {
        self.state.lock().meta.clone()
    }

    /// Newest last.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let state = self.state.lock();
        let skip = state.recent.len().saturating_sub(limit);
        state.recent.iter().skip(skip).cloned().collect()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
