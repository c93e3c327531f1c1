use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sdm_core::{
    atomic_write_json_pretty, ensure_dir, sha256_file, CovariateImage, ObservationProvider,
    ObservationSet, Result, SdmError,
};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::state::{write_trial_state, TrialStatus};

pub const STAGING_DIR: &str = "asc";
pub const OUTPUT_DIR: &str = "output";
pub const INVENTORY_FILE: &str = "staged_inventory.json";

/// One isolated unit of fitter work.
#[derive(Debug, Clone)]
pub struct Trial {
    pub id: String,
    pub dir: PathBuf,
    pub observations: ObservationSet,
    pub covariates: Vec<CovariateImage>,
    /// Planned covariate indices; `None` for runs that are not sub-sampled.
    pub indices: Option<Vec<usize>>,
}

impl Trial {
    pub fn samples_path(&self) -> &Path {
        self.observations.path()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join(OUTPUT_DIR)
    }

    pub fn covariate_names(&self) -> Vec<String> {
        self.covariates.iter().map(|c| c.name()).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StagedInventory {
    schema_version: String,
    trial_id: String,
    files: BTreeMap<String, String>,
}

/// Materializes trial directories under one root.
#[derive(Debug, Clone)]
pub struct TrialWorkspace {
    root: PathBuf,
}

impl TrialWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trial_dir(&self, trial_id: &str) -> PathBuf {
        self.root.join(trial_id)
    }

    /// Trial record for a directory that could not be materialized.
    pub fn unprepared(
        &self,
        trial_id: &str,
        base: &ObservationSet,
        covariates: &[CovariateImage],
        indices: Option<Vec<usize>>,
    ) -> Trial {
        Trial {
            id: trial_id.to_string(),
            dir: self.trial_dir(trial_id),
            observations: base.clone(),
            covariates: covariates.to_vec(),
            indices,
        }
    }

    /// Create `<root>/<trial_id>` with its own copy of the observations, the
    /// chosen grids staged under `asc/`, and an empty `output/`.
    pub fn prepare(
        &self,
        trial_id: &str,
        base: &ObservationSet,
        covariates: &[CovariateImage],
        indices: Option<Vec<usize>>,
    ) -> Result<Trial> {
        let dir = self.trial_dir(trial_id);
        let ws_err = |path: &Path, e: std::io::Error| SdmError::workspace(trial_id, path, e);

        ensure_dir(&dir).map_err(|e| ws_err(&dir, e))?;
        let staging = dir.join(STAGING_DIR);
        ensure_dir(&staging).map_err(|e| ws_err(&staging, e))?;

        let file_name = base
            .path()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "samples.csv".into());
        let observations = base.copy_to(&dir.join(file_name)).map_err(|e| match e {
            SdmError::Io { path, source } => SdmError::workspace(trial_id, path, source),
            other => other,
        })?;

        for image in covariates {
            let target = staging.join(image.file_name());
            fs::copy(&image.path, &target).map_err(|e| ws_err(&target, e))?;
        }
        // Only a fully staged trial gets an output directory.
        let output = dir.join(OUTPUT_DIR);
        ensure_dir(&output).map_err(|e| ws_err(&output, e))?;

        let trial = Trial {
            id: trial_id.to_string(),
            dir,
            observations,
            covariates: covariates.to_vec(),
            indices,
        };
        write_inventory(&trial)?;
        write_trial_state(&trial.dir, trial_id, TrialStatus::Prepared, None)?;
        tracing::debug!(
            trial_id,
            dir = %trial.dir.display(),
            covariates = ?trial.covariate_names(),
            "prepared trial workspace"
        );
        Ok(trial)
    }
}

/// SHA-256 of every file under the staging directory, keyed by relative path.
pub fn staged_digests(trial: &Trial) -> Result<BTreeMap<String, String>> {
    let staging = trial.staging_dir();
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(&staging).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(&staging).to_path_buf();
            SdmError::workspace(&trial.id, path, std::io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(&staging)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        let digest =
            sha256_file(entry.path()).map_err(|e| SdmError::workspace(&trial.id, entry.path(), e))?;
        files.insert(rel, digest);
    }
    Ok(files)
}

fn write_inventory(trial: &Trial) -> Result<()> {
    let inventory = StagedInventory {
        schema_version: "staged_inventory_v1".to_string(),
        trial_id: trial.id.clone(),
        files: staged_digests(trial)?,
    };
    atomic_write_json_pretty(&trial.dir.join(INVENTORY_FILE), &inventory)
}

/// Staged files whose current digest differs from the recorded inventory,
/// including files that appeared or disappeared since staging.
pub fn verify_inventory(trial: &Trial) -> Result<Vec<String>> {
    let path = trial.dir.join(INVENTORY_FILE);
    let bytes = fs::read(&path).map_err(|e| SdmError::workspace(&trial.id, &path, e))?;
    let recorded: StagedInventory = serde_json::from_slice(&bytes).map_err(|e| {
        SdmError::workspace(
            &trial.id,
            &path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    let current = staged_digests(trial)?;

    let mut mismatched: Vec<String> = recorded
        .files
        .iter()
        .filter(|(name, digest)| current.get(*name) != Some(*digest))
        .map(|(name, _)| name.clone())
        .collect();
    mismatched.extend(
        current
            .keys()
            .filter(|name| !recorded.files.contains_key(*name))
            .cloned(),
    );
    mismatched.sort();
    Ok(mismatched)
}
