use std::fs::File;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sdm_core::SdmError;
use serde::Serialize;

use crate::config::FitterConfig;
use crate::state::{write_trial_state, TrialStateGuard, TrialStatus};
use crate::workspace::Trial;

pub const STDOUT_LOG: &str = "fitter.stdout.log";
pub const STDERR_LOG: &str = "fitter.stderr.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TrialOutcome {
    Success,
    Failure(String),
}

impl TrialOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TrialOutcome::Success)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            TrialOutcome::Success => None,
            TrialOutcome::Failure(reason) => Some(reason),
        }
    }
}

/// Shared cancellation flag for a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs the model fitter for one prepared trial.
///
/// Implementations must not share mutable state between calls: the
/// coordinator invokes `execute` concurrently for different trials.
pub trait TrialExecutor: Send + Sync {
    fn execute(&self, trial: &Trial, cancel: &CancelToken) -> TrialOutcome;
}

/// Kills the child if it is still running when dropped.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => {
                let status = child.try_wait()?;
                if status.is_some() {
                    self.child = None;
                }
                Ok(status)
            }
            None => Ok(None),
        }
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Launches the configured fitter as one OS process per trial.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    fitter: FitterConfig,
    poll_interval: Duration,
}

impl ProcessExecutor {
    pub fn new(fitter: FitterConfig) -> Self {
        Self {
            fitter,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn fitter(&self) -> &FitterConfig {
        &self.fitter
    }

    pub fn command_for(&self, trial: &Trial) -> Command {
        let mut cmd = Command::new(&self.fitter.program);
        cmd.args(self.fitter.render_args(
            trial.samples_path(),
            &trial.staging_dir(),
            &trial.output_dir(),
        ));
        cmd.current_dir(&trial.dir);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn run(&self, trial: &Trial, cancel: &CancelToken) -> Result<(), SdmError> {
        let fail = |reason: String| SdmError::FitterExecution {
            trial_id: trial.id.clone(),
            reason,
        };

        let stdout = File::create(trial.dir.join(STDOUT_LOG))
            .map_err(|e| fail(format!("cannot open stdout log: {}", e)))?;
        let stderr = File::create(trial.dir.join(STDERR_LOG))
            .map_err(|e| fail(format!("cannot open stderr log: {}", e)))?;

        let mut cmd = self.command_for(trial);
        cmd.stdout(stdout).stderr(stderr);
        let child = cmd.spawn().map_err(|e| {
            fail(format!(
                "failed to spawn {}: {}",
                self.fitter.program.display(),
                e
            ))
        })?;
        let mut guard = ChildGuard { child: Some(child) };

        let timeout = self.fitter.timeout_secs.map(Duration::from_secs);
        let started = Instant::now();
        loop {
            match guard.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    let reason = match status.code() {
                        Some(code) => format!("fitter exited with status {}", code),
                        None => "fitter terminated by signal".to_string(),
                    };
                    return Err(fail(reason));
                }
                Ok(None) => {}
                Err(e) => {
                    guard.kill();
                    return Err(fail(format!("failed waiting for fitter: {}", e)));
                }
            }
            if cancel.is_cancelled() {
                guard.kill();
                return Err(fail("cancelled".to_string()));
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    guard.kill();
                    return Err(fail(format!("timed out after {}s", limit.as_secs())));
                }
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl TrialExecutor for ProcessExecutor {
    fn execute(&self, trial: &Trial, cancel: &CancelToken) -> TrialOutcome {
        if let Err(e) = write_trial_state(&trial.dir, &trial.id, TrialStatus::Running, None) {
            tracing::warn!(trial_id = %trial.id, error = %e, "could not record running state");
        }
        let mut guard = TrialStateGuard::new(&trial.dir, &trial.id);
        let started = Instant::now();
        tracing::info!(trial_id = %trial.id, covariates = ?trial.covariate_names(), "starting fitter");

        let outcome = match self.run(trial, cancel) {
            Ok(()) => TrialOutcome::Success,
            Err(SdmError::FitterExecution { reason, .. }) => TrialOutcome::Failure(reason),
            Err(other) => TrialOutcome::Failure(other.to_string()),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let recorded = match &outcome {
            TrialOutcome::Success => {
                tracing::info!(trial_id = %trial.id, elapsed_ms, "fitter finished");
                guard.complete(TrialStatus::Completed, None)
            }
            TrialOutcome::Failure(reason) => {
                tracing::warn!(trial_id = %trial.id, elapsed_ms, reason = %reason, "fitter failed");
                guard.complete(TrialStatus::Failed, Some(reason.as_str()))
            }
        };
        if let Err(e) = recorded {
            tracing::warn!(trial_id = %trial.id, error = %e, "could not record trial state");
        }
        outcome
    }
}
