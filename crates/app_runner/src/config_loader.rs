use std::fs;
use std::path::{Path, PathBuf};

use cycle_orchestrator::{CycleConfig, MIN_COOLDOWN_MS};
use dead_letter::DeadLetterConfig;
use fee_allocator::AllocatorConfig;
use fee_tracker::TrackerConfig;
use ledger_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) const CONFIG_PATH_ENV: &str = "BURN_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "configs/service.toml";

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct ServiceSection {
    pub(crate) network: String,
    pub(crate) poll_interval_ms: u64,
    pub(crate) save_interval_ms: u64,
    pub(crate) reconcile_interval_ms: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            network: state_store::DEFAULT_NETWORK.to_string(),
            poll_interval_ms: 30_000,
            save_interval_ms: 60_000,
            reconcile_interval_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct LedgerSection {
    pub(crate) authority: String,
    pub(crate) fee_account: String,
    /// Asset forced to root at startup, tracked first if needed.
    pub(crate) root_asset: Option<String>,
    pub(crate) history_scan_limit: usize,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            authority: String::new(),
            fee_account: String::new(),
            root_asset: None,
            history_scan_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct StorageSection {
    pub(crate) data_root: PathBuf,
    pub(crate) state_file: String,
    pub(crate) state_backups: usize,
    pub(crate) audit_dir: String,
    /// Entries kept in memory for `recent()`; the log itself is unbounded.
    pub(crate) audit_window: usize,
    pub(crate) dead_letter_file: String,
    pub(crate) checkpoint_file: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("var"),
            state_file: "burn_state.json".to_string(),
            state_backups: 3,
            audit_dir: "audit".to_string(),
            audit_window: 1_000,
            dead_letter_file: "dead_letters.json".to_string(),
            checkpoint_file: "cycle_progress.json".to_string(),
        }
    }
}

impl StorageSection {
    pub(crate) fn state_path(&self) -> PathBuf {
        self.data_root.join(&self.state_file)
    }

    pub(crate) fn audit_path(&self) -> PathBuf {
        self.data_root.join(&self.audit_dir)
    }

    pub(crate) fn dead_letter_path(&self) -> PathBuf {
        self.data_root.join(&self.dead_letter_file)
    }

    pub(crate) fn checkpoint_path(&self) -> PathBuf {
        self.data_root.join(&self.checkpoint_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct ControlSection {
    pub(crate) enabled: bool,
    pub(crate) bind: String,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ExecutionMode {
    #[default]
    Paper,
    Live,
}

impl ExecutionMode {
    pub(crate) fn is_dry_run(self) -> bool {
        self == Self::Paper
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub(crate) struct ExecutionSection {
    pub(crate) mode: ExecutionMode,
    /// Base URL of the external transaction builder (live mode only).
    pub(crate) builder_endpoint: String,
    pub(crate) request_timeout_ms: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Paper,
            builder_endpoint: String::new(),
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ServiceConfig {
    pub(crate) service: ServiceSection,
    pub(crate) ledger: LedgerSection,
    pub(crate) gateway: GatewayConfig,
    pub(crate) tracker: TrackerConfig,
    pub(crate) allocator: AllocatorConfig,
    pub(crate) cycle: CycleConfig,
    pub(crate) dead_letter: DeadLetterConfig,
    pub(crate) storage: StorageSection,
    pub(crate) control: ControlSection,
    pub(crate) execution: ExecutionSection,
}

impl ServiceConfig {
    pub(crate) fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `BURN_*` variables win over the file.
    pub(crate) fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = get("BURN_RPC_ENDPOINTS") {
            self.gateway.endpoints = raw
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(v) = get("BURN_AUTHORITY") {
            self.ledger.authority = v.trim().to_string();
        }
        if let Some(v) = get("BURN_FEE_ACCOUNT") {
            self.ledger.fee_account = v.trim().to_string();
        }
        if let Some(v) = get("BURN_ROOT_ASSET") {
            self.ledger.root_asset = Some(v.trim().to_string());
        }
        if let Some(v) = get("BURN_DATA_ROOT") {
            self.storage.data_root = PathBuf::from(v.trim());
        }
        if let Some(v) = get("BURN_DRY_RUN") {
            let v = v.trim();
            self.execution.mode = if v.eq_ignore_ascii_case("true") || v == "1" {
                ExecutionMode::Paper
            } else {
                ExecutionMode::Live
            };
        }
    }

    /// Copy the values several sections share from their owning section.
    pub(crate) fn apply_derived(&mut self) {
        self.tracker.fee_account = self.ledger.fee_account.clone();
        self.cycle.checkpoint_path = self.storage.checkpoint_path();
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.ledger.authority.trim().is_empty() {
            return invalid("ledger.authority is required");
        }
        if self.ledger.fee_account.trim().is_empty() {
            return invalid("ledger.fee_account is required");
        }
        if self.gateway.endpoints.iter().all(|e| e.trim().is_empty()) {
            return invalid("gateway.endpoints must name at least one rpc endpoint");
        }
        if self.service.poll_interval_ms == 0
            || self.service.save_interval_ms == 0
            || self.service.reconcile_interval_ms == 0
        {
            return invalid("service intervals must be positive");
        }
        if self.gateway.request_timeout_ms == 0 {
            return invalid("gateway.request_timeout_ms must be positive");
        }
        if self.gateway.breaker.failure_threshold == 0 {
            return invalid("gateway.breaker.failure_threshold must be positive");
        }
        if self.tracker.poll_limit == 0 || self.tracker.processed_capacity == 0 {
            return invalid("tracker.poll_limit and tracker.processed_capacity must be positive");
        }
        if self.tracker.divergence_tolerance_bps > 10_000 {
            return invalid("tracker.divergence_tolerance_bps must be within 0..=10000");
        }
        if self.allocator.root_share_bps > 10_000 {
            return invalid("allocator.root_share_bps must be within 0..=10000");
        }
        if self.allocator.minimum_trade_units == 0 {
            return invalid("allocator.minimum_trade_units must be positive");
        }
        if self.cycle.cooldown_ms < MIN_COOLDOWN_MS {
            return invalid("cycle.cooldown_ms must be at least 60000");
        }
        if self.cycle.stale_checkpoint_ms <= 0 {
            return invalid("cycle.stale_checkpoint_ms must be positive");
        }
        if self.dead_letter.capacity == 0 || self.dead_letter.base_backoff_ms <= 0 {
            return invalid("dead_letter.capacity and dead_letter.base_backoff_ms must be positive");
        }
        if self.execution.mode == ExecutionMode::Live
            && self.execution.builder_endpoint.trim().is_empty()
        {
            return invalid("execution.builder_endpoint is required in live mode");
        }
        Ok(())
    }
}

pub(crate) fn service_config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// File (or defaults when absent), then environment, then validation.
pub(crate) fn load_service_config() -> Result<ServiceConfig, ConfigError> {
    let path = service_config_path();
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        ServiceConfig::parse(&raw, &path)?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        ServiceConfig::default()
    };
    cfg.apply_env_overrides(|key| std::env::var(key).ok());
    cfg.apply_derived();
    cfg.validate()?;
    Ok(cfg)
}
