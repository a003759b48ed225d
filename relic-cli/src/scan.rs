//! Bulk image scanning with resumable checkpoints.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// A resumable scan position: the files still to do and the counters.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Files not yet scanned.
    pub remaining: Vec<PathBuf>,
    /// Total number of files in the original scan.
    pub total: usize,
    /// 1-based counter of the next file.
    pub counter: usize,
}

impl Checkpoint {
    /// Loads a checkpoint written by an interrupted scan.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("error reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("{}", path.display()))
    }

    /// Persists the checkpoint.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("error writing {}", path.display()))
    }
}

/// Collects the `.bin` files under `target` (a file or a directory).
pub fn collect_bins(target: &Path, recurse: bool) -> Vec<PathBuf> {
    let is_bin = |path: &Path| {
        path.extension()
            .map(|extension| extension.eq_ignore_ascii_case("bin"))
            .unwrap_or(false)
    };
    if target.is_file() {
        return if is_bin(target) {
            vec![target.to_owned()]
        } else {
            Vec::new()
        };
    }
    let depth = if recurse { usize::MAX } else { 1 };
    let mut bins: Vec<PathBuf> = WalkDir::new(target)
        .max_depth(depth)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_bin(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    bins.sort();
    bins
}

/// Shannon entropy of a byte buffer, in bits per byte.
pub fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut bucket = [0u64; 256];
    for &byte in data {
        bucket[byte as usize] += 1;
    }
    let size = data.len() as f64;
    let mut result = 0.0;
    for count in bucket {
        if count > 0 {
            let share = count as f64 / size;
            result -= share * share.log2();
        }
    }
    result
}

/// Appends one line to the scan log.
pub fn append_log(path: &Path, line: &str) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("error opening {}", path.display()))?;
    writeln!(file, "{line}")?;
    Ok(())
}
