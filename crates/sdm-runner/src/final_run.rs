use std::collections::HashSet;
use std::time::{Duration, Instant};

use sdm_core::{CovariateImage, CovariateProvider, ObservationSet, Result, SdmError};

use crate::aggregate::RankedPredictor;
use crate::coordinator::TrialReport;
use crate::executor::{CancelToken, TrialExecutor, TrialOutcome};
use crate::state::FINAL_TRIAL_ID;
use crate::workspace::TrialWorkspace;

/// Map ranked names back to images by substring match on the file name.
/// Names resolving to an already chosen image are dropped.
pub fn resolve_ranked(
    ranked: &[RankedPredictor],
    provider: &dyn CovariateProvider,
) -> Result<Vec<CovariateImage>> {
    let mut seen = HashSet::new();
    let mut images = Vec::with_capacity(ranked.len());
    for predictor in ranked {
        let image = provider.resolve_by_name(&predictor.name).ok_or_else(|| {
            SdmError::config(format!(
                "ranked covariate '{}' matches no available covariate image",
                predictor.name
            ))
        })?;
        if seen.insert(image.path.clone()) {
            images.push(image.clone());
        } else {
            tracing::warn!(
                covariate = %predictor.name,
                path = %image.path.display(),
                "ranked covariate resolved to an image already selected"
            );
        }
    }
    Ok(images)
}

/// Runs the single `final` trial over a fixed covariate list.
pub struct FinalRunner<'a> {
    workspace: &'a TrialWorkspace,
    executor: &'a dyn TrialExecutor,
    cancel: CancelToken,
}

impl<'a> FinalRunner<'a> {
    pub fn new(
        workspace: &'a TrialWorkspace,
        executor: &'a dyn TrialExecutor,
        cancel: CancelToken,
    ) -> Self {
        Self {
            workspace,
            executor,
            cancel,
        }
    }

    /// Resolve the ranked covariates and fit them once, synchronously.
    pub fn run_ranked(
        &self,
        ranked: &[RankedPredictor],
        base: &ObservationSet,
        provider: &dyn CovariateProvider,
    ) -> Result<TrialReport> {
        let images = resolve_ranked(ranked, provider)?;
        self.run_with(base, &images)
    }

    /// Staging failures are reported as a failed outcome, not an error.
    pub fn run_with(&self, base: &ObservationSet, images: &[CovariateImage]) -> Result<TrialReport> {
        let started = Instant::now();
        let trial = match self.workspace.prepare(FINAL_TRIAL_ID, base, images, None) {
            Ok(trial) => trial,
            Err(e) if !e.is_run_level() => {
                tracing::warn!(error = %e, "final workspace could not be prepared");
                return Ok(TrialReport {
                    trial: self.workspace.unprepared(FINAL_TRIAL_ID, base, images, None),
                    outcome: TrialOutcome::Failure(e.to_string()),
                    elapsed: Duration::ZERO,
                });
            }
            Err(e) => return Err(e),
        };
        let outcome = self.executor.execute(&trial, &self.cancel);
        Ok(TrialReport {
            trial,
            outcome,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{covariate_set, scratch_dir, write_observations};
    use crate::workspace::Trial;
    use sdm_core::ObservationProvider;
    use std::fs;
    use std::sync::Mutex;

    struct RecordingExecutor {
        seen: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl TrialExecutor for RecordingExecutor {
        fn execute(&self, trial: &Trial, _cancel: &CancelToken) -> TrialOutcome {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((trial.id.clone(), trial.covariate_names()));
            }
            TrialOutcome::Failure("model did not converge".to_string())
        }
    }

    fn predictor(name: &str, mean: f64) -> RankedPredictor {
        RankedPredictor {
            name: name.to_string(),
            mean_contribution: mean,
            samples: 1,
        }
    }

    #[test]
    fn final_run_uses_ranked_covariates_and_propagates_outcome() {
        let root = scratch_dir("final_run");
        let obs = write_observations(&root, "lynx", 3);
        let base = ObservationSet::open(&obs, "lynx").expect("open");
        let covariates = covariate_set(&root.join("climate"), 4);
        let ws = TrialWorkspace::new(root.join("trials"));
        let exec = RecordingExecutor {
            seen: Mutex::new(Vec::new()),
        };

        let ranked = vec![predictor("cov3", 9.0), predictor("cov1", 4.0)];
        let report = FinalRunner::new(&ws, &exec, CancelToken::new())
            .run_ranked(&ranked, &base, &covariates)
            .expect("final run");

        assert_eq!(report.trial.id, FINAL_TRIAL_ID);
        assert_eq!(
            report.outcome,
            TrialOutcome::Failure("model did not converge".to_string())
        );
        let seen = exec.seen.lock().expect("lock");
        assert_eq!(
            seen.as_slice(),
            &[("final".to_string(), vec!["cov3".to_string(), "cov1".to_string()])]
        );
        assert!(report.trial.staging_dir().join("cov3.asc").is_file());
        assert!(!report.trial.staging_dir().join("cov0.asc").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn final_staging_failure_becomes_a_failed_outcome() {
        let root = scratch_dir("final_staging");
        let obs = write_observations(&root, "lynx", 3);
        let base = ObservationSet::open(&obs, "lynx").expect("open");
        let covariates = covariate_set(&root.join("climate"), 2);
        fs::remove_file(root.join("climate").join("cov1.asc")).expect("remove grid");
        let ws = TrialWorkspace::new(root.join("trials"));
        let exec = RecordingExecutor {
            seen: Mutex::new(Vec::new()),
        };

        let report = FinalRunner::new(&ws, &exec, CancelToken::new())
            .run_with(&base, covariates.images())
            .expect("staging failure is not a run-level error");
        assert_eq!(report.trial.id, FINAL_TRIAL_ID);
        let reason = report.outcome.failure_reason().expect("final must fail");
        assert!(reason.contains("workspace error for final"), "unexpected reason: {}", reason);
        assert!(exec.seen.lock().expect("lock").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_ranked_name_is_a_configuration_error() {
        let root = scratch_dir("final_unknown");
        let covariates = covariate_set(&root.join("climate"), 2);
        let err = resolve_ranked(&[predictor("slope", 1.0)], &covariates)
            .expect_err("unknown name must fail");
        assert!(matches!(err, SdmError::Configuration(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicate_resolution_is_collapsed() {
        let root = scratch_dir("final_dupes");
        let covariates = covariate_set(&root.join("climate"), 2);
        let images = resolve_ranked(
            &[predictor("cov1", 3.0), predictor("cov1.asc", 2.0)],
            &covariates,
        )
        .expect("resolve");
        assert_eq!(images.len(), 1);
        let _ = fs::remove_dir_all(root);
    }
}
