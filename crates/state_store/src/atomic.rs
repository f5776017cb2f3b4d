use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Sibling temp path unique to this process and call.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let unique = format!(
        ".{name}.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    );
    target.with_file_name(unique)
}

pub fn write_bytes_atomic(target: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let tmp = temp_path_for(target);
    {
        let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(payload)
            .with_context(|| format!("write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", tmp.display()))?;
    }

    if let Err(err) = fs::rename(&tmp, target) {
        if target.exists() {
            let _ = fs::remove_file(target);
            if let Err(err) = fs::rename(&tmp, target) {
                let _ = fs::remove_file(&tmp);
                return Err(err).with_context(|| format!("replace {}", target.display()));
            }
        } else {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("rename into {}", target.display()));
        }
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and swap it into place.
pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize {}", target.display()))?;
    write_bytes_atomic(target, &payload)
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value = serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
