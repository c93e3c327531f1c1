use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::executor::{CancelToken, TrialExecutor, TrialOutcome};
use crate::workspace::Trial;

#[derive(Debug, Clone)]
pub struct TrialReport {
    pub trial: Trial,
    pub outcome: TrialOutcome,
    pub elapsed: Duration,
}

impl TrialReport {
    pub fn trial_id(&self) -> &str {
        &self.trial.id
    }
}

struct Job {
    trial: Trial,
    reply: Sender<TrialReport>,
}

/// Pending result of one submitted trial.
pub struct TrialHandle {
    trial: Trial,
    rx: Receiver<TrialReport>,
}

impl TrialHandle {
    pub fn trial_id(&self) -> &str {
        &self.trial.id
    }

    /// Block until the trial reaches a terminal state.
    pub fn wait(self) -> TrialReport {
        match self.rx.recv() {
            Ok(report) => report,
            Err(_) => TrialReport {
                trial: self.trial,
                outcome: TrialOutcome::Failure("trial worker exited without a result".to_string()),
                elapsed: Duration::ZERO,
            },
        }
    }
}

/// Worker pool that runs each submitted trial on its own thread slot.
///
/// Without a cap every submission gets a fresh worker, so all trials start
/// immediately. With `max_in_flight = n` at most n workers exist and each
/// pulls the next queued trial as soon as its current one finishes.
pub struct TrialPool {
    executor: Arc<dyn TrialExecutor>,
    max_in_flight: Option<usize>,
    cancel: CancelToken,
    queue: Option<Sender<Job>>,
    pending: Arc<Mutex<Receiver<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl TrialPool {
    pub fn new(
        executor: Arc<dyn TrialExecutor>,
        max_in_flight: Option<usize>,
        cancel: CancelToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            executor,
            max_in_flight: max_in_flight.map(|n| n.max(1)),
            cancel,
            queue: Some(tx),
            pending: Arc::new(Mutex::new(rx)),
            workers: Vec::new(),
        }
    }

    pub fn submit(&mut self, trial: Trial) -> TrialHandle {
        let (reply, rx) = mpsc::channel();
        if self.max_in_flight.map_or(true, |cap| self.workers.len() < cap) {
            self.spawn_worker();
        }
        let handle = TrialHandle {
            trial: trial.clone(),
            rx,
        };
        if let Some(queue) = self.queue.as_ref() {
            // A send error drops `reply`, which `wait` reports as a failure.
            let _ = queue.send(Job { trial, reply });
        }
        handle
    }

    /// Close the queue, wait for every handle, then reap the workers.
    pub fn join_all(mut self, handles: Vec<TrialHandle>) -> Vec<TrialReport> {
        self.queue.take();
        let reports = handles.into_iter().map(TrialHandle::wait).collect();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        reports
    }

    fn spawn_worker(&mut self) {
        let executor = Arc::clone(&self.executor);
        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();
        let worker_id = self.workers.len();
        self.workers.push(thread::spawn(move || loop {
            let job = {
                let rx = match pending.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                rx.recv()
            };
            let Ok(Job { trial, reply }) = job else {
                tracing::debug!(worker_id, "trial queue closed");
                break;
            };

            let started = Instant::now();
            let outcome = if cancel.is_cancelled() {
                TrialOutcome::Failure("cancelled before dispatch".to_string())
            } else {
                panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&trial, &cancel)))
                    .unwrap_or_else(|_| TrialOutcome::Failure("trial executor panicked".to_string()))
            };
            let _ = reply.send(TrialReport {
                trial,
                outcome,
                elapsed: started.elapsed(),
            });
        }));
    }
}

/// Fans a batch of trials out over a [`TrialPool`] and joins on all of them.
#[derive(Debug, Clone, Default)]
pub struct TrialCoordinator {
    pub max_in_flight: Option<usize>,
    pub cancel: CancelToken,
}

impl TrialCoordinator {
    pub fn new(max_in_flight: Option<usize>, cancel: CancelToken) -> Self {
        Self {
            max_in_flight,
            cancel,
        }
    }

    /// One report per trial, in submission order. Returns only after every
    /// trial has succeeded or failed.
    pub fn run_all(&self, executor: Arc<dyn TrialExecutor>, trials: Vec<Trial>) -> Vec<TrialReport> {
        let mut pool = TrialPool::new(executor, self.max_in_flight, self.cancel.clone());
        let handles: Vec<TrialHandle> = trials.into_iter().map(|t| pool.submit(t)).collect();
        tracing::info!(
            trials = handles.len(),
            max_in_flight = ?self.max_in_flight,
            "dispatched trials"
        );
        let reports = pool.join_all(handles);
        let succeeded = reports.iter().filter(|r| r.outcome.is_success()).count();
        tracing::info!(attempted = reports.len(), succeeded, "all trials finished");
        reports
    }
}
