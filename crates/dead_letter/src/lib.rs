use std::path::PathBuf;

use anyhow::Result;
use core_types::{is_transient_message, Units};
use infra_clock::SharedClock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_store::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Resolved,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub timestamp_ms: i64,
    pub asset_symbol: String,
    pub asset_address: String,
    pub error_message: String,
    pub is_transient: bool,
    pub pending_fee_units_at_failure: Units,
    pub allocation_at_failure: Units,
    pub retry_count: u32,
    #[serde(default)]
    pub next_retry_at_ms: Option<i64>,
    pub status: DeadLetterStatus,
}

impl DeadLetterEntry {
    pub fn is_pending(&self) -> bool {
        self.status == DeadLetterStatus::Pending
    }

    fn is_due(&self, now_ms: i64) -> bool {
        self.is_pending()
            && self.is_transient
            && self.next_retry_at_ms.is_some_and(|at| at <= now_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub base_backoff_ms: i64,
    pub max_retries: u32,
    pub expiry_ms: i64,
    pub capacity: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: 5 * 60 * 1000,
            max_retries: 5,
            expiry_ms: 24 * 60 * 60 * 1000,
            capacity: 100,
        }
    }
}

impl DeadLetterConfig {
    /// base × 2^(retry_count − 1), with retry_count 0 treated as the first attempt.
    pub fn backoff_ms(&self, retry_count: u32) -> i64 {
        let exp = retry_count.saturating_sub(1).min(20);
        self.base_backoff_ms.saturating_mul(1_i64 << exp)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeadLetterDocument {
    #[serde(default)]
    entries: Vec<DeadLetterEntry>,
}

/// Failed per-asset burns awaiting retry, expiry or resolution.
pub struct DeadLetterQueue {
    cfg: DeadLetterConfig,
    path: Option<PathBuf>,
    clock: SharedClock,
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl DeadLetterQueue {
    pub fn in_memory(cfg: DeadLetterConfig, clock: SharedClock) -> Self {
        Self {
            cfg,
            path: None,
            clock,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Load the persisted queue when present.
    pub fn open(cfg: DeadLetterConfig, path: PathBuf, clock: SharedClock) -> Result<Self> {
        let entries = read_json::<DeadLetterDocument>(&path)?
            .map(|doc| doc.entries)
            .unwrap_or_default();
        if !entries.is_empty() {
            tracing::info!(entries = entries.len(), path = %path.display(), "dead letters loaded");
        }
        let queue = Self {
            cfg,
            path: Some(path),
            clock,
            entries: Mutex::new(entries),
        };
        queue.publish_gauge(&queue.entries.lock());
        Ok(queue)
    }

    /// Record a failure. An asset keeps at most one pending entry: a repeat
    /// failure rewrites it in place and moves it to the back of the queue.
    pub fn append(
        &self,
        asset_symbol: &str,
        asset_address: &str,
        error_message: &str,
        pending_units: Units,
        allocation_units: Units,
        retry_count: u32,
    ) -> DeadLetterEntry {
        let now = self.clock.now_ms();
        let is_transient = is_transient_message(error_message);
        let next_retry_at_ms = (is_transient && retry_count < self.cfg.max_retries)
            .then(|| now + self.cfg.backoff_ms(retry_count.max(1)));
        let mut entries = self.entries.lock();
        let existing_idx = entries
            .iter()
            .position(|e| e.asset_address == asset_address && e.is_pending());
        let existing = existing_idx.map(|idx| entries.remove(idx));
        let entry = DeadLetterEntry {
            // expiry counts from the first failure
            timestamp_ms: existing.map_or(now, |e| e.timestamp_ms),
            asset_symbol: asset_symbol.to_string(),
            asset_address: asset_address.to_string(),
            error_message: error_message.to_string(),
            is_transient,
            pending_fee_units_at_failure: pending_units,
            allocation_at_failure: allocation_units,
            retry_count,
            next_retry_at_ms,
            status: DeadLetterStatus::Pending,
        };

        entries.push(entry.clone());
        let overflow = entries.len().saturating_sub(self.cfg.capacity);
        if overflow > 0 {
            entries.drain(..overflow);
        }
        tracing::warn!(
            asset = %asset_symbol,
            transient = is_transient,
            retry_count,
            error = %error_message,
            "asset moved to dead letter queue"
        );
        metrics::counter!("dead_letter.appended").increment(1);
        self.persist(&entries);
        entry
    }

    /// Expire stale or exhausted entries and return the transient ones due for retry.
    pub fn process(&self, now_ms: i64) -> Vec<DeadLetterEntry> {
        let mut entries = self.entries.lock();
        let mut expired = 0usize;
        for entry in entries.iter_mut().filter(|e| e.is_pending()) {
            let too_old = now_ms - entry.timestamp_ms > self.cfg.expiry_ms;
            if too_old || entry.retry_count >= self.cfg.max_retries {
                entry.status = DeadLetterStatus::Expired;
                entry.next_retry_at_ms = None;
                expired += 1;
            }
        }
        let due = entries
            .iter()
            .filter(|e| e.is_due(now_ms))
            .cloned()
            .collect::<Vec<_>>();
        if expired > 0 {
            tracing::info!(expired, "dead letters expired");
            self.persist(&entries);
        }
        due
    }

    /// Pending entries whose retry window has not opened yet. Such assets sit out the cycle.
    pub fn is_blocked(&self, asset_address: &str, now_ms: i64) -> bool {
        self.entries.lock().iter().any(|e| {
            e.asset_address == asset_address
                && e.is_pending()
                && match e.next_retry_at_ms {
                    Some(at) => at > now_ms,
                    None => false,
                }
        })
    }

    /// Highest retry count among pending entries for the asset.
    pub fn retry_count_for(&self, asset_address: &str) -> u32 {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.asset_address == asset_address && e.is_pending())
            .map(|e| e.retry_count)
            .max()
            .unwrap_or(0)
    }

    /// Resolve every pending entry for the asset. Returns how many flipped.
    pub fn mark_resolved(&self, asset_address: &str) -> usize {
        let mut entries = self.entries.lock();
        let mut resolved = 0usize;
        for entry in entries
            .iter_mut()
            .filter(|e| e.asset_address == asset_address && e.is_pending())
        {
            entry.status = DeadLetterStatus::Resolved;
            entry.next_retry_at_ms = None;
            resolved += 1;
        }
        if resolved > 0 {
            tracing::info!(asset = %asset_address, resolved, "dead letters resolved");
            self.persist(&entries);
        }
        resolved
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.is_pending()).count()
    }

    fn publish_gauge(&self, entries: &[DeadLetterEntry]) {
        let pending = entries.iter().filter(|e| e.is_pending()).count();
        metrics::gauge!("dead_letter.pending").set(pending as f64);
    }

    fn persist(&self, entries: &[DeadLetterEntry]) {
        self.publish_gauge(entries);
        let Some(path) = &self.path else {
            return;
        };
        let doc = DeadLetterDocument {
            entries: entries.to_vec(),
        };
        if let Err(err) = write_json_atomic(path, &doc) {
            tracing::error!(error = %err, path = %path.display(), "dead letter write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infra_clock::{Clock, ManualClock};
    use std::sync::Arc;
    use std::time::Duration;

    const MIN: i64 = 60 * 1000;

    fn queue(clock: Arc<ManualClock>) -> DeadLetterQueue {
        DeadLetterQueue::in_memory(DeadLetterConfig::default(), clock)
    }

    #[test]
    fn backoff_doubles_from_five_minutes() {
        let cfg = DeadLetterConfig::default();
        assert_eq!(cfg.backoff_ms(1), 5 * MIN);
        assert_eq!(cfg.backoff_ms(2), 10 * MIN);
        assert_eq!(cfg.backoff_ms(3), 20 * MIN);
    }

    #[test]
    fn transient_entry_becomes_due_after_backoff() {
        let clock = ManualClock::shared(1_000_000);
        let dlq = queue(clock.clone());
        let entry = dlq.append("AAA", "MintA", "request timed out", 50, 40, 1);
        assert!(entry.is_transient);
        assert_eq!(entry.next_retry_at_ms, Some(1_000_000 + 5 * MIN));
        assert!(dlq.is_blocked("MintA", clock.now_ms()));
        assert!(dlq.process(clock.now_ms()).is_empty());

        clock.advance(Duration::from_secs(5 * 60));
        let due = dlq.process(clock.now_ms());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].asset_address, "MintA");
        assert!(!dlq.is_blocked("MintA", clock.now_ms()));
    }

    #[test]
    fn permanent_entry_is_never_due() {
        let clock = ManualClock::shared(0);
        let dlq = queue(clock.clone());
        let entry = dlq.append("BBB", "MintB", "custom program error: 0x1771", 10, 10, 1);
        assert!(!entry.is_transient);
        assert_eq!(entry.next_retry_at_ms, None);
        clock.advance(Duration::from_secs(3600));
        assert!(dlq.process(clock.now_ms()).is_empty());
        assert_eq!(dlq.pending_count(), 1);
    }

    #[test]
    fn expires_after_a_day_or_max_retries() {
        let clock = ManualClock::shared(0);
        let dlq = queue(clock.clone());
        dlq.append("AAA", "MintA", "503 service unavailable", 1, 1, 1);
        dlq.append("CCC", "MintC", "503 service unavailable", 1, 1, 5);
        let due = dlq.process(clock.now_ms());
        assert!(due.is_empty());
        let statuses = dlq.entries().iter().map(|e| e.status).collect::<Vec<_>>();
        assert_eq!(statuses, vec![DeadLetterStatus::Pending, DeadLetterStatus::Expired]);

        clock.advance(Duration::from_secs(24 * 3600 + 1));
        dlq.process(clock.now_ms());
        assert_eq!(dlq.pending_count(), 0);
    }

    #[test]
    fn resolve_flips_pending_entries_only() {
        let clock = ManualClock::shared(0);
        let dlq = queue(clock);
        dlq.append("AAA", "MintA", "timeout", 1, 1, 1);
        dlq.append("BBB", "MintB", "timeout", 1, 1, 1);
        assert_eq!(dlq.mark_resolved("MintA"), 1);
        assert_eq!(dlq.mark_resolved("MintA"), 0);
        assert_eq!(dlq.pending_count(), 1);

        // a later failure opens a fresh entry next to the resolved one
        dlq.append("AAA", "MintA", "timeout", 1, 1, 1);
        assert_eq!(dlq.entries().len(), 3);
        assert_eq!(dlq.pending_count(), 2);
    }

    #[test]
    fn repeat_failure_updates_the_pending_entry_in_place() {
        let clock = ManualClock::shared(0);
        let dlq = queue(clock.clone());
        dlq.append("AAA", "MintA", "timeout", 10, 8, 1);
        dlq.append("BBB", "MintB", "timeout", 1, 1, 1);
        clock.advance(Duration::from_secs(6 * 60));
        let entry = dlq.append("AAA", "MintA", "503 service unavailable", 20, 16, 2);

        assert_eq!(dlq.entries().len(), 2);
        assert_eq!(dlq.retry_count_for("MintA"), 2);
        assert_eq!(entry.timestamp_ms, 0);
        assert_eq!(entry.pending_fee_units_at_failure, 20);
        assert_eq!(entry.next_retry_at_ms, Some(6 * MIN + 10 * MIN));
        let order = dlq.entries().into_iter().map(|e| e.asset_address).collect::<Vec<_>>();
        assert_eq!(order, vec!["MintB", "MintA"]);

        let permanent = dlq.append(
            "AAA",
            "MintA",
            "simulation failed: insufficient lamports 4291000, need 12980160",
            20,
            16,
            3,
        );
        assert!(!permanent.is_transient);
        assert_eq!(permanent.next_retry_at_ms, None);
        assert_eq!(dlq.pending_count(), 2);
    }

    #[test]
    fn capped_and_persisted_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dead_letters.json");
        let clock = ManualClock::shared(0);
        let cfg = DeadLetterConfig {
            capacity: 3,
            ..DeadLetterConfig::default()
        };
        {
            let dlq = DeadLetterQueue::open(cfg.clone(), path.clone(), clock.clone()).expect("open");
            for i in 0..5 {
                dlq.append("AAA", &format!("Mint{i}"), "timeout", 1, 1, 1);
            }
            assert_eq!(dlq.entries().len(), 3);
        }
        let reopened = DeadLetterQueue::open(cfg, path, clock).expect("reopen");
        let addresses = reopened
            .entries()
            .into_iter()
            .map(|e| e.asset_address)
            .collect::<Vec<_>>();
        assert_eq!(addresses, vec!["Mint2", "Mint3", "Mint4"]);
    }
}
