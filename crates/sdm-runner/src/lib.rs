//! Trial orchestration: plan random covariate subsets, fit each in an
//! isolated directory, rank covariates by mean contribution, then fit the
//! top-ranked set once more.

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod final_run;
pub mod pipeline;
pub mod planner;
pub mod state;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use aggregate::{
    successful_results, ContributionAggregator, ContributionTable, RankedPredictor,
    RankedPredictors, TrialResults,
};
pub use config::{FitterConfig, RunConfig, Workflow};
pub use coordinator::{TrialCoordinator, TrialHandle, TrialPool, TrialReport};
pub use executor::{CancelToken, ProcessExecutor, TrialExecutor, TrialOutcome};
pub use final_run::{resolve_ranked, FinalRunner};
pub use pipeline::{FailedTrial, Pipeline, PlannedTrial, RunReport, RunState, RUN_REPORT_FILE};
pub use planner::{TrialIndexSet, TrialPlanner};
pub use state::{
    discover_completed_trials, read_trial_state, TrialStateRecord, TrialStatus, FINAL_TRIAL_ID,
};
pub use workspace::{staged_digests, verify_inventory, Trial, TrialWorkspace};
