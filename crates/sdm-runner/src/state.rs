use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sdm_core::{atomic_write_json_pretty, Result, SdmError};
use serde::{Deserialize, Serialize};

pub const TRIAL_STATE_FILE: &str = "trial_state.json";
pub const TRIAL_PREFIX: &str = "trial-";
pub const FINAL_TRIAL_ID: &str = "final";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Prepared,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialStateRecord {
    pub schema_version: String,
    pub trial_id: String,
    pub status: TrialStatus,
    pub exit_reason: Option<String>,
    pub updated_at: String,
}

pub fn trial_id(n: usize) -> String {
    format!("{}{}", TRIAL_PREFIX, n)
}

/// Numeric suffix of a `trial-N` id.
pub fn trial_number(trial_id: &str) -> Option<usize> {
    trial_id.strip_prefix(TRIAL_PREFIX)?.parse().ok()
}

pub fn write_trial_state(
    trial_dir: &Path,
    trial_id: &str,
    status: TrialStatus,
    exit_reason: Option<&str>,
) -> Result<()> {
    let record = TrialStateRecord {
        schema_version: "trial_state_v1".to_string(),
        trial_id: trial_id.to_string(),
        status,
        exit_reason: exit_reason.map(|s| s.to_string()),
        updated_at: Utc::now().to_rfc3339(),
    };
    atomic_write_json_pretty(&trial_dir.join(TRIAL_STATE_FILE), &record)
}

pub fn read_trial_state(trial_dir: &Path) -> Result<Option<TrialStateRecord>> {
    let path = trial_dir.join(TRIAL_STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path).map_err(|e| SdmError::io(&path, e))?;
    let record = serde_json::from_slice(&bytes).map_err(|e| {
        SdmError::io(
            &path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    Ok(Some(record))
}

/// Marks the trial failed with `aborted` unless `complete` was called.
pub struct TrialStateGuard {
    trial_dir: PathBuf,
    trial_id: String,
    done: bool,
}

impl TrialStateGuard {
    pub fn new(trial_dir: &Path, trial_id: &str) -> Self {
        Self {
            trial_dir: trial_dir.to_path_buf(),
            trial_id: trial_id.to_string(),
            done: false,
        }
    }

    pub fn complete(&mut self, status: TrialStatus, exit_reason: Option<&str>) -> Result<()> {
        write_trial_state(&self.trial_dir, &self.trial_id, status, exit_reason)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for TrialStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_trial_state(
                &self.trial_dir,
                &self.trial_id,
                TrialStatus::Failed,
                Some("aborted"),
            );
        }
    }
}

/// `trial-N` directories under `trials_dir` whose state is `completed`,
/// ordered by N.
pub fn discover_completed_trials(trials_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(trials_dir).map_err(|e| SdmError::io(trials_dir, e))?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SdmError::io(trials_dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(n) = trial_number(&name) else {
            continue;
        };
        match read_trial_state(&path)? {
            Some(record) if record.status == TrialStatus::Completed => found.push((n, name, path)),
            Some(record) => {
                tracing::debug!(trial_id = %name, status = ?record.status, "skipping trial")
            }
            None => tracing::debug!(trial_id = %name, "skipping trial without state file"),
        }
    }
    found.sort_by_key(|(n, _, _)| *n);
    Ok(found.into_iter().map(|(_, id, path)| (id, path)).collect())
}
