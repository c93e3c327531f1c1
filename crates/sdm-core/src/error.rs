use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdmError>;

/// Failure taxonomy shared by every pipeline stage.
///
/// `Configuration`, `ObservationParse` and `ResultParse` abort a run.
/// `Workspace` and `FitterExecution` are confined to the trial they name and
/// end up recorded as a failed trial outcome.
#[derive(Debug, Error)]
pub enum SdmError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("workspace error for {trial_id} at {}: {source}", path.display())]
    Workspace {
        trial_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fitter execution failed for {trial_id}: {reason}")]
    FitterExecution { trial_id: String, reason: String },

    #[error("result parse error for {trial_id} ({}): {reason}", path.display())]
    ResultParse {
        trial_id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("observation parse error in {} line {line}: {reason}", path.display())]
    ObservationParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SdmError {
    pub fn config(msg: impl Into<String>) -> Self {
        SdmError::Configuration(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SdmError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn workspace(
        trial_id: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        SdmError::Workspace {
            trial_id: trial_id.into(),
            path: path.into(),
            source,
        }
    }

    /// True for failures that must stop the whole run rather than one trial.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            SdmError::Configuration(_)
                | SdmError::ResultParse { .. }
                | SdmError::ObservationParse { .. }
        )
    }
}
