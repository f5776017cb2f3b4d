use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use state_store::{read_json, remove_if_exists, write_json_atomic};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Pre,
    Secondaries,
    Root,
    Finalize,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Secondaries => "secondaries",
            Self::Root => "root",
            Self::Finalize => "finalize",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleProgress {
    pub cycle_id: String,
    pub phase: CyclePhase,
    #[serde(default)]
    pub completed_asset_addresses: Vec<String>,
    pub started_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl CycleProgress {
    pub fn new(cycle_id: String, now_ms: i64) -> Self {
        Self {
            cycle_id,
            phase: CyclePhase::Pre,
            completed_asset_addresses: Vec::new(),
            started_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

/// The on-disk cycle checkpoint. Present only while a cycle runs (or after it crashed).
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, progress: &CycleProgress) -> Result<()> {
        write_json_atomic(&self.path, progress)
    }

    pub fn load(&self) -> Result<Option<CycleProgress>> {
        read_json(&self.path)
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
