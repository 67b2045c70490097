use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub mod catalog;

pub const RESULT_FILENAME: &str = "result.json";
pub const TRAJECTORY_FILENAME: &str = "trajectory.json";
pub const EVENTS_FILENAME: &str = "events.jsonl";
pub const SUMMARY_FILENAME: &str = "summary.json";
pub const ARTIFACTS_DIRNAME: &str = "artifacts";

/// Durable file layout for one benchmark instance.
#[derive(Debug, Clone)]
pub struct InstanceLogPaths {
    pub dir: PathBuf,
    pub result: PathBuf,
    pub trajectory: PathBuf,
    pub events: PathBuf,
    pub artifacts_dir: PathBuf,
}

pub fn instance_log_paths(
    log_root: &Path,
    level: &str,
    category: &str,
    instance_idx: usize,
    target: &str,
) -> InstanceLogPaths {
    let dir = log_root.join(format!("{}_{}_{}_{}", level, category, instance_idx, target));
    InstanceLogPaths {
        result: dir.join(RESULT_FILENAME),
        trajectory: dir.join(TRAJECTORY_FILENAME),
        events: dir.join(EVENTS_FILENAME),
        artifacts_dir: dir.join(ARTIFACTS_DIRNAME),
        dir,
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write via a temp file + rename so readers never observe a torn file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}
