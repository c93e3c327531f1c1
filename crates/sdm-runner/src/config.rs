use std::fs;
use std::path::{Path, PathBuf};

use sdm_core::{Result, SdmError, DEFAULT_SRS};
use serde::{Deserialize, Serialize};

pub const SAMPLES_PLACEHOLDER: &str = "{samples}";
pub const LAYERS_PLACEHOLDER: &str = "{layers}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

pub const DEFAULT_RESULTS_FILE: &str = "maxentResults.csv";
pub const DEFAULT_CONTRIBUTION_MARKER: &str = "permutation importance";
pub const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    /// Randomized trials, contribution ranking, then a final run on the top-K.
    #[default]
    RankedTrials,
    /// One run over every available covariate.
    SingleRun,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::RankedTrials => "ranked_trials",
            Workflow::SingleRun => "single_run",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FitterConfig {
    pub program: PathBuf,
    #[serde(default = "default_fitter_args")]
    pub args: Vec<String>,
    #[serde(default = "default_results_file")]
    pub results_file: String,
    #[serde(default = "default_contribution_marker")]
    pub contribution_marker: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl FitterConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: default_fitter_args(),
            results_file: default_results_file(),
            contribution_marker: default_contribution_marker(),
            timeout_secs: None,
        }
    }

    /// Expand the argument template for one trial.
    pub fn render_args(&self, samples: &Path, layers: &Path, output: &Path) -> Vec<String> {
        let samples = samples.to_string_lossy();
        let layers = layers.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(SAMPLES_PLACEHOLDER, &samples)
                    .replace(LAYERS_PLACEHOLDER, &layers)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let program = self.program.to_string_lossy();
        if program.trim().is_empty() {
            return Err(SdmError::config("fitter.program must not be empty"));
        }
        if program_looks_like_path(&program) && !self.program.exists() {
            return Err(SdmError::config(format!(
                "fitter program not found: {}",
                self.program.display()
            )));
        }
        if self.results_file.trim().is_empty() {
            return Err(SdmError::config("fitter.results_file must not be empty"));
        }
        if self.contribution_marker.trim().is_empty() {
            return Err(SdmError::config(
                "fitter.contribution_marker must not be empty",
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(SdmError::config("fitter.timeout_secs must be positive"));
        }
        Ok(())
    }
}

fn default_fitter_args() -> Vec<String> {
    [
        "samplesfile={samples}",
        "environmentallayers={layers}",
        "outputdirectory={output}",
        "redoifexists",
        "autorun",
        "visible=false",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_results_file() -> String {
    DEFAULT_RESULTS_FILE.to_string()
}

fn default_contribution_marker() -> String {
    DEFAULT_CONTRIBUTION_MARKER.to_string()
}

fn default_srs() -> String {
    DEFAULT_SRS.to_string()
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn program_looks_like_path(program: &str) -> bool {
    program.starts_with('.') || program.starts_with('/') || program.contains('/')
}

/// Immutable parameters of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub species: String,
    pub observations: PathBuf,
    pub covariates_dir: PathBuf,
    #[serde(default = "default_srs")]
    pub default_srs: String,
    pub trials_dir: PathBuf,
    #[serde(default)]
    pub workflow: Workflow,
    /// Unused by `single_run`.
    #[serde(default)]
    pub num_trials: usize,
    #[serde(default)]
    pub num_predictors: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    pub fitter: FitterConfig,
}

impl RunConfig {
    /// Read a YAML run file; relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| SdmError::io(path, e))?;
        let mut config: RunConfig = serde_yaml::from_str(&raw).map_err(|e| {
            SdmError::config(format!("invalid run config {}: {}", path.display(), e))
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        config.resolve_relative_to(base);
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.observations);
        resolve(&mut self.covariates_dir);
        resolve(&mut self.trials_dir);
        if program_looks_like_path(&self.fitter.program.to_string_lossy()) {
            resolve(&mut self.fitter.program);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.species.trim().is_empty() {
            return Err(SdmError::config("species must not be empty"));
        }
        if self.workflow == Workflow::RankedTrials {
            if self.num_trials < 1 {
                return Err(SdmError::config("num_trials must be at least 1"));
            }
            if self.num_predictors < 1 {
                return Err(SdmError::config("num_predictors must be at least 1"));
            }
        }
        if self.top_k < 1 {
            return Err(SdmError::config("top_k must be at least 1"));
        }
        if self.max_in_flight == Some(0) {
            return Err(SdmError::config("max_in_flight must be at least 1 when set"));
        }
        self.fitter.validate()
    }
}
