use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionState {
    pub offset: usize,
    pub fingerprint: String,
    pub last_timestamp: i64,
}

/// Resumable progress for one candidate sequence, identified by the
/// fingerprint of the configuration that produced it.
///
/// A store file must only be used by one run at a time.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
    fingerprint: String,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>, fingerprint: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn load(&self) -> usize {
        load(&self.path, &self.fingerprint)
    }

    pub fn save(&self, offset: usize, last_timestamp: i64) -> Result<()> {
        save(&self.path, offset, &self.fingerprint, last_timestamp)
    }
}

/// Offset to resume from. Missing, unreadable and foreign state all count
/// as no progress.
pub fn load(path: &Path, fingerprint: &str) -> usize {
    if !path.exists() {
        return 0;
    }
    let state = match read_state(path) {
        Ok(state) => state,
        Err(err) => {
            warn!("Ignoring progress file: {err:#}");
            return 0;
        }
    };
    if state.fingerprint != fingerprint {
        warn!(
            "Ignoring progress file {}: recorded for a different configuration",
            path.display()
        );
        return 0;
    }
    debug!(
        "Resuming at offset {} (last timestamp {})",
        state.offset, state.last_timestamp
    );
    state.offset
}

fn read_state(path: &Path) -> Result<SubmissionState> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading progress at {}", path.display()))?;
    let state = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing progress at {}", path.display()))?;
    Ok(state)
}

/// Replaces the state file atomically: the new state is written and synced
/// to a sibling temporary file which is then renamed over the old one.
pub fn save(path: &Path, offset: usize, fingerprint: &str, last_timestamp: i64) -> Result<()> {
    let state = SubmissionState {
        offset,
        fingerprint: fingerprint.to_string(),
        last_timestamp,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed creating progress directory {}", dir.display()))?;
    let serialized =
        serde_json::to_string_pretty(&state).context("Failed serializing progress to JSON")?;
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed creating temporary file in {}", dir.display()))?;
    writeln!(file, "{serialized}").context("Failed writing progress")?;
    file.as_file()
        .sync_all()
        .context("Failed flushing progress")?;
    file.persist(path)
        .with_context(|| format!("Failed replacing progress at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_no_progress() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(load(&dir.path().join("state.json"), "abc"), 0);
    }

    #[test]
    fn resumes_with_matching_fingerprint() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        save(&path, 50, "abc", 1_700_000_000).unwrap();
        assert_eq!(load(&path, "abc"), 50);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["offset"], 50);
        assert_eq!(raw["fingerprint"], "abc");
        assert_eq!(raw["last_timestamp"], 1_700_000_000);
    }

    #[test]
    fn fingerprint_mismatch_restarts_from_zero() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        save(&path, 50, "abc", 1_700_000_000).unwrap();
        assert_eq!(load(&path, "def"), 0);
    }

    #[test]
    fn corrupt_file_restarts_from_zero() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"offset": 50, "finger"#).unwrap();
        assert_eq!(load(&path, "abc"), 0);
    }

    #[test]
    fn save_replaces_previous_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path().join("state.json"), "abc");
        store.save(50, 100).unwrap();
        store.save(100, 200).unwrap();
        assert_eq!(store.load(), 100);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
