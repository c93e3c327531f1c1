use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sdm_core::fsutil::dir_is_empty_or_missing;
use sdm_core::{
    atomic_write_json_pretty, ensure_dir, CovariateSet, ObservationProvider, ObservationSet,
    Result, SdmError,
};
use serde::Serialize;

use crate::aggregate::{successful_results, ContributionAggregator, RankedPredictors};
use crate::config::{RunConfig, Workflow};
use crate::coordinator::{TrialCoordinator, TrialReport};
use crate::executor::{CancelToken, ProcessExecutor, TrialExecutor, TrialOutcome};
use crate::final_run::FinalRunner;
use crate::planner::{TrialIndexSet, TrialPlanner};
use crate::state::{trial_id, trial_number};
use crate::workspace::TrialWorkspace;

pub const RUN_REPORT_FILE: &str = "run_report.json";

/// Mutable state threaded through the stages of one run.
#[derive(Debug)]
pub struct RunState {
    pub run_id: String,
    pub seed: u64,
    pub covariates: CovariateSet,
    pub observations: ObservationSet,
    pub plans: Vec<TrialIndexSet>,
    pub reports: Vec<TrialReport>,
    pub ranked: RankedPredictors,
    pub final_report: Option<TrialReport>,
}

impl RunState {
    /// Load stage. Reads `species`, `observations`, `covariates_dir`,
    /// `default_srs`; fills `covariates` and `observations`.
    pub fn load(config: &RunConfig, run_id: String, seed: u64) -> Result<Self> {
        let covariates = CovariateSet::from_directory(&config.covariates_dir, &config.default_srs)?;
        if covariates.is_empty() {
            return Err(SdmError::config(format!(
                "no covariate grids found in {}",
                config.covariates_dir.display()
            )));
        }
        let observations = ObservationSet::open_with_default_srs(
            &config.observations,
            &config.species,
            &config.default_srs,
        )?;
        if observations.is_empty() {
            return Err(SdmError::config(format!(
                "no observations for '{}' in {}",
                config.species,
                config.observations.display()
            )));
        }

        if covariates.srs() != Some(observations.srs()) {
            tracing::warn!(
                observations_srs = %observations.srs(),
                covariates_srs = ?covariates.srs(),
                "observation and covariate spatial references differ"
            );
        }
        if let (Some(obs_env), Some(cov_env)) = (observations.envelope(), covariates.envelope()) {
            if !obs_env.intersects(&cov_env) {
                tracing::warn!(?obs_env, ?cov_env, "observations fall outside every covariate grid");
            }
        }
        tracing::info!(
            species = %observations.species(),
            points = observations.len(),
            presences = observations.presence_count(),
            covariates = covariates.len(),
            "loaded run inputs"
        );

        Ok(Self {
            run_id,
            seed,
            covariates,
            observations,
            plans: Vec::new(),
            reports: Vec::new(),
            ranked: Vec::new(),
            final_report: None,
        })
    }

    pub fn attempted(&self) -> usize {
        self.reports.len()
    }

    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.is_success()).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTrial {
    pub trial_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub workflow: Workflow,
    pub species: String,
    pub seed: u64,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedTrial>,
    pub ranked: RankedPredictors,
    pub final_trial_dir: Option<PathBuf>,
    pub final_outcome: Option<TrialOutcome>,
    pub report_path: PathBuf,
    pub finished_at: String,
    /// Set when a run-level failure aborted the run after inputs loaded.
    pub error: Option<String>,
}

impl RunReport {
    fn from_state(config: &RunConfig, state: &RunState) -> Self {
        let failed = state
            .reports
            .iter()
            .filter_map(|r| {
                r.outcome.failure_reason().map(|reason| FailedTrial {
                    trial_id: r.trial.id.clone(),
                    reason: reason.to_string(),
                })
            })
            .collect();
        Self {
            schema_version: "run_report_v1".to_string(),
            run_id: state.run_id.clone(),
            workflow: config.workflow,
            species: state.observations.species().to_string(),
            seed: state.seed,
            attempted: state.attempted(),
            succeeded: state.succeeded(),
            failed,
            ranked: state.ranked.clone(),
            final_trial_dir: state.final_report.as_ref().map(|r| r.trial.dir.clone()),
            final_outcome: state.final_report.as_ref().map(|r| r.outcome.clone()),
            report_path: config.trials_dir.join(RUN_REPORT_FILE),
            finished_at: Utc::now().to_rfc3339(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedTrial {
    pub trial_id: String,
    pub indices: TrialIndexSet,
    pub covariates: Vec<String>,
}

/// Drives one run of the configured workflow.
pub struct Pipeline {
    config: RunConfig,
    executor: Arc<dyn TrialExecutor>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        let executor = Arc::new(ProcessExecutor::new(config.fitter.clone()));
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: RunConfig, executor: Arc<dyn TrialExecutor>) -> Self {
        Self {
            config,
            executor,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Cancelling stops queued trials and kills running fitters.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<RunReport> {
        self.config.validate()?;
        prepare_trials_dir(&self.config)?;

        let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let seed = self.config.seed.unwrap_or_else(rand::random);
        tracing::info!(
            run_id = %run_id,
            workflow = self.config.workflow.as_str(),
            seed,
            "starting run"
        );
        let mut state = RunState::load(&self.config, run_id, seed)?;

        let outcome = self.run_workflow(&mut state);
        let mut report = RunReport::from_state(&self.config, &state);
        if let Err(e) = &outcome {
            report.error = Some(e.to_string());
        }
        atomic_write_json_pretty(&report.report_path, &report)?;
        log_summary(&report);
        outcome.map(|()| report)
    }

    fn run_workflow(&self, state: &mut RunState) -> Result<()> {
        match self.config.workflow {
            Workflow::RankedTrials => {
                plan_trials(&self.config, state)?;
                run_trials(&self.config, &self.executor, &self.cancel, state)?;
                rank_predictors(&self.config, state)?;
                run_final(&self.config, self.executor.as_ref(), &self.cancel, state)
            }
            Workflow::SingleRun => {
                run_single(&self.config, self.executor.as_ref(), &self.cancel, state)
            }
        }
    }

    /// Planned covariate subsets for the configured seed, without running.
    pub fn preview_plan(&self) -> Result<(u64, Vec<PlannedTrial>)> {
        self.config.validate()?;
        let covariates =
            CovariateSet::from_directory(&self.config.covariates_dir, &self.config.default_srs)?;
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let plans = TrialPlanner::seeded(seed).plan(
            self.config.num_trials,
            self.config.num_predictors,
            covariates.len(),
        )?;
        let planned = plans
            .into_iter()
            .enumerate()
            .map(|(i, indices)| {
                let names: Vec<String> = covariates
                    .select(&indices)
                    .map(|images| images.iter().map(|c| c.name()).collect())
                    .unwrap_or_default();
                PlannedTrial {
                    trial_id: trial_id(i + 1),
                    indices,
                    covariates: names,
                }
            })
            .collect();
        Ok((seed, planned))
    }
}

/// The trials root must be empty (or absent) before a run starts.
fn prepare_trials_dir(config: &RunConfig) -> Result<()> {
    let dir = &config.trials_dir;
    let empty = dir_is_empty_or_missing(dir).map_err(|e| SdmError::io(dir, e))?;
    if !empty {
        return Err(SdmError::config(format!(
            "trials directory {} is not empty",
            dir.display()
        )));
    }
    ensure_dir(dir).map_err(|e| SdmError::io(dir, e))
}

/// Reads `num_trials`, `num_predictors`, `seed`, `covariates`; writes `plans`.
fn plan_trials(config: &RunConfig, state: &mut RunState) -> Result<()> {
    let mut planner = TrialPlanner::seeded(state.seed);
    state.plans = planner.plan(config.num_trials, config.num_predictors, state.covariates.len())?;
    tracing::debug!(plans = ?state.plans, "planned trials");
    Ok(())
}

/// Reads `plans`, `observations`, `covariates`; writes `reports`.
/// Trials whose workspace cannot be prepared are recorded as failures
/// without being dispatched.
fn run_trials(
    config: &RunConfig,
    executor: &Arc<dyn TrialExecutor>,
    cancel: &CancelToken,
    state: &mut RunState,
) -> Result<()> {
    let workspace = TrialWorkspace::new(&config.trials_dir);
    let mut prepared = Vec::with_capacity(state.plans.len());
    let mut reports = Vec::new();

    for (i, indices) in state.plans.iter().enumerate() {
        let id = trial_id(i + 1);
        let images = state.covariates.select(indices)?;
        match workspace.prepare(&id, &state.observations, &images, Some(indices.clone())) {
            Ok(trial) => prepared.push(trial),
            Err(e) if e.is_run_level() => return Err(e),
            Err(e) => {
                tracing::warn!(trial_id = %id, error = %e, "trial workspace could not be prepared");
                reports.push(TrialReport {
                    trial: workspace.unprepared(&id, &state.observations, &images, Some(indices.clone())),
                    outcome: TrialOutcome::Failure(e.to_string()),
                    elapsed: Duration::ZERO,
                });
            }
        }
    }

    let coordinator = TrialCoordinator::new(config.max_in_flight, cancel.clone());
    reports.extend(coordinator.run_all(Arc::clone(executor), prepared));
    reports.sort_by_key(|r| trial_number(&r.trial.id).unwrap_or(usize::MAX));
    state.reports = reports;
    Ok(())
}

/// Reads `reports`, `top_k`, fitter results settings; writes `ranked`.
fn rank_predictors(config: &RunConfig, state: &mut RunState) -> Result<()> {
    let results = successful_results(&state.reports);
    let aggregator = ContributionAggregator::from_fitter(&config.fitter, config.top_k);
    state.ranked = aggregator.aggregate(&results)?;
    for (rank, p) in state.ranked.iter().enumerate() {
        tracing::info!(
            rank = rank + 1,
            covariate = %p.name,
            mean_contribution = p.mean_contribution,
            samples = p.samples,
            "ranked predictor"
        );
    }
    Ok(())
}

/// Reads `ranked`, `observations`, `covariates`; writes `final_report`.
fn run_final(
    config: &RunConfig,
    executor: &dyn TrialExecutor,
    cancel: &CancelToken,
    state: &mut RunState,
) -> Result<()> {
    if state.ranked.is_empty() {
        tracing::warn!(
            attempted = state.attempted(),
            succeeded = state.succeeded(),
            "no covariate contributions collected, skipping final run"
        );
        return Ok(());
    }
    let workspace = TrialWorkspace::new(&config.trials_dir);
    let runner = FinalRunner::new(&workspace, executor, cancel.clone());
    let report = runner.run_ranked(&state.ranked, &state.observations, &state.covariates)?;
    state.final_report = Some(report);
    Ok(())
}

/// Reads `observations`, `covariates`; writes `final_report`.
fn run_single(
    config: &RunConfig,
    executor: &dyn TrialExecutor,
    cancel: &CancelToken,
    state: &mut RunState,
) -> Result<()> {
    let workspace = TrialWorkspace::new(&config.trials_dir);
    let runner = FinalRunner::new(&workspace, executor, cancel.clone());
    let report = runner.run_with(&state.observations, state.covariates.images())?;
    state.final_report = Some(report);
    Ok(())
}

fn log_summary(report: &RunReport) {
    for failed in &report.failed {
        tracing::warn!(trial_id = %failed.trial_id, reason = %failed.reason, "trial failed");
    }
    match &report.error {
        Some(error) => tracing::error!(
            run_id = %report.run_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            error = %error,
            report = %report.report_path.display(),
            "run aborted"
        ),
        None => tracing::info!(
            run_id = %report.run_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            final_outcome = ?report.final_outcome,
            report = %report.report_path.display(),
            "run finished"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FitterConfig;
    use crate::state::TRIAL_STATE_FILE;
    use crate::test_support::{covariate_set, scratch_dir, write_observations};
    use crate::workspace::Trial;
    use std::fs;
    use std::path::Path;

    /// Writes a results file giving each staged covariate `index + 1`.
    struct IndexScoringExecutor;

    impl TrialExecutor for IndexScoringExecutor {
        fn execute(&self, trial: &Trial, _cancel: &CancelToken) -> TrialOutcome {
            let names = trial.covariate_names();
            let header: Vec<String> = names
                .iter()
                .map(|n| format!("{} permutation importance", n))
                .collect();
            let values: Vec<String> = names
                .iter()
                .map(|n| {
                    let idx: usize = n.trim_start_matches("cov").parse().unwrap_or(0);
                    (idx + 1).to_string()
                })
                .collect();
            let body = format!("Species,{}\nlynx,{}\n", header.join(","), values.join(","));
            match fs::write(trial.output_dir().join("maxentResults.csv"), body) {
                Ok(()) => TrialOutcome::Success,
                Err(e) => TrialOutcome::Failure(e.to_string()),
            }
        }
    }

    fn config(root: &Path, covariates: usize) -> RunConfig {
        write_observations(&root.join("data"), "lynx", 4);
        covariate_set(&root.join("climate"), covariates);
        RunConfig {
            species: "lynx".to_string(),
            observations: root.join("data").join("occurrences.csv"),
            covariates_dir: root.join("climate"),
            default_srs: "EPSG:4326".to_string(),
            trials_dir: root.join("trials"),
            workflow: Workflow::RankedTrials,
            num_trials: 4,
            num_predictors: 2,
            top_k: 2,
            max_in_flight: Some(2),
            seed: Some(11),
            fitter: FitterConfig::new("maxent"),
        }
    }

    #[test]
    fn ranked_run_reports_counts_and_top_k() {
        let root = scratch_dir("pipeline_ranked");
        let cfg = config(&root, 5);
        let plans = TrialPlanner::seeded(11).plan(4, 2, 5).expect("plan");
        let mut seen: Vec<usize> = plans.iter().flatten().copied().collect();
        seen.sort_unstable();
        seen.dedup();
        let expected: Vec<String> = seen.iter().rev().take(2).map(|i| format!("cov{}", i)).collect();

        let report = Pipeline::with_executor(cfg.clone(), Arc::new(IndexScoringExecutor))
            .run()
            .expect("run");
        assert_eq!(report.attempted, 4);
        assert_eq!(report.succeeded, 4);
        let names: Vec<String> = report.ranked.iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, expected);
        assert_eq!(report.final_outcome, Some(TrialOutcome::Success));
        assert!(cfg.trials_dir.join(RUN_REPORT_FILE).is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn single_run_stages_every_covariate() {
        let root = scratch_dir("pipeline_single");
        let mut cfg = config(&root, 3);
        cfg.workflow = Workflow::SingleRun;
        let report = Pipeline::with_executor(cfg.clone(), Arc::new(IndexScoringExecutor))
            .run()
            .expect("run");
        assert_eq!(report.attempted, 0);
        assert!(report.ranked.is_empty());
        assert_eq!(report.final_outcome, Some(TrialOutcome::Success));
        let staged = cfg.trials_dir.join("final").join("asc");
        for i in 0..3 {
            assert!(staged.join(format!("cov{}.asc", i)).is_file());
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_empty_trials_dir_is_rejected_before_any_trial() {
        let root = scratch_dir("pipeline_dirty");
        let cfg = config(&root, 3);
        fs::create_dir_all(&cfg.trials_dir).expect("trials dir");
        fs::write(cfg.trials_dir.join("leftover"), "x").expect("leftover");
        let err = Pipeline::with_executor(cfg.clone(), Arc::new(IndexScoringExecutor))
            .run()
            .expect_err("dirty trials dir must fail");
        assert!(matches!(err, SdmError::Configuration(_)));
        assert!(!cfg.trials_dir.join("trial-1").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn too_many_predictors_is_a_configuration_error() {
        let root = scratch_dir("pipeline_oversample");
        let mut cfg = config(&root, 3);
        cfg.num_predictors = 4;
        let err = Pipeline::with_executor(cfg, Arc::new(IndexScoringExecutor))
            .run()
            .expect_err("must fail");
        assert!(matches!(err, SdmError::Configuration(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn preview_matches_seeded_planner() {
        let root = scratch_dir("pipeline_preview");
        let cfg = config(&root, 5);
        let (seed, planned) = Pipeline::new(cfg).preview_plan().expect("preview");
        assert_eq!(seed, 11);
        let plans = TrialPlanner::seeded(11).plan(4, 2, 5).expect("plan");
        assert_eq!(planned.len(), 4);
        for (p, indices) in planned.iter().zip(plans.iter()) {
            assert_eq!(&p.indices, indices);
            assert_eq!(p.covariates.len(), 2);
        }
        assert_eq!(planned[0].trial_id, "trial-1");
        let _ = fs::remove_dir_all(root);
    }

    /// Reports success without writing any results file.
    struct SilentExecutor;

    impl TrialExecutor for SilentExecutor {
        fn execute(&self, _trial: &Trial, _cancel: &CancelToken) -> TrialOutcome {
            TrialOutcome::Success
        }
    }

    #[test]
    fn staging_failure_only_fails_its_own_trial() {
        let root = scratch_dir("pipeline_staging");
        let cfg = config(&root, 4);
        let mut state = RunState::load(&cfg, "run_test".to_string(), 11).expect("load");
        state.plans = vec![vec![0, 1], vec![2, 3], vec![1, 0]];
        fs::remove_file(cfg.covariates_dir.join("cov3.asc")).expect("remove grid");

        let executor: Arc<dyn TrialExecutor> = Arc::new(IndexScoringExecutor);
        run_trials(&cfg, &executor, &CancelToken::new(), &mut state).expect("run trials");

        let ids: Vec<&str> = state.reports.iter().map(|r| r.trial_id()).collect();
        assert_eq!(ids, vec!["trial-1", "trial-2", "trial-3"]);
        assert_eq!(state.attempted(), 3);
        assert_eq!(state.succeeded(), 2);

        let failed = &state.reports[1];
        let reason = failed.outcome.failure_reason().expect("trial-2 must fail");
        assert!(reason.contains("workspace error for trial-2"), "unexpected reason: {}", reason);
        assert!(!failed.trial.dir.join(TRIAL_STATE_FILE).exists());
        assert!(!failed.trial.output_dir().exists());
        assert!(state.reports[0].outcome.is_success());
        assert!(state.reports[2].outcome.is_success());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_results_file_aborts_the_run() {
        let root = scratch_dir("pipeline_no_results");
        let cfg = config(&root, 5);
        let err = Pipeline::with_executor(cfg.clone(), Arc::new(SilentExecutor))
            .run()
            .expect_err("missing results must abort the run");
        match &err {
            SdmError::ResultParse { trial_id, path, .. } => {
                assert_eq!(trial_id, "trial-1");
                assert!(path.ends_with("trial-1/output/maxentResults.csv"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!cfg.trials_dir.join("final").exists());

        let written: serde_json::Value = serde_json::from_slice(
            &fs::read(cfg.trials_dir.join(RUN_REPORT_FILE)).expect("run report"),
        )
        .expect("report json");
        assert_eq!(written["attempted"], 4);
        assert_eq!(written["succeeded"], 4);
        assert!(written["final_outcome"].is_null());
        let recorded = written["error"].as_str().expect("error recorded");
        assert!(recorded.contains("trial-1"));
        let _ = fs::remove_dir_all(root);
    }
}
