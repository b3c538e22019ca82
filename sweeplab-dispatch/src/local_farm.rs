//! An in-process worker farm.
//!
//! The reference implementation of the farm contract: a bounded pool of
//! engines on the blocking thread pool, outcomes held until pulled, and
//! a transport toggle so tests can exercise disconnection and the
//! cluster lab's retry budget. Real transports follow the same state
//! machine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use sweeplab_core::{Error, Harness, JobId, Result};

use crate::farm::{ExperimentRegistry, JobOutcome, TaskSpec, WorkerFarm};

#[derive(Default)]
struct FarmState {
    in_flight: HashMap<JobId, tokio::task::AbortHandle>,
    ready: Vec<JobOutcome>,
    finalized: HashSet<JobId>,
}

#[derive(Clone)]
pub struct LocalFarm {
    registry: Arc<ExperimentRegistry>,
    engines: usize,
    semaphore: Arc<Semaphore>,
    state: Arc<Mutex<FarmState>>,
    connected: Arc<AtomicBool>,
}

impl LocalFarm {
    pub fn new(registry: ExperimentRegistry, engines: usize) -> Self {
        let engines = engines.max(1);
        LocalFarm {
            registry: Arc::new(registry),
            engines,
            semaphore: Arc::new(Semaphore::new(engines)),
            state: Arc::new(Mutex::new(FarmState::default())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the transport going away (or coming back). While down,
    /// every farm operation fails; engines keep finishing work, exactly
    /// like a real cluster running disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn transport(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Dispatch("farm transport is down".into()))
        }
    }

    fn state(&self) -> MutexGuard<'_, FarmState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Outstanding work, for observability.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}

#[async_trait]
impl WorkerFarm for LocalFarm {
    async fn engine_count(&self) -> Result<usize> {
        self.transport()?;
        Ok(self.engines)
    }

    async fn submit(&self, task: TaskSpec) -> Result<JobId> {
        self.transport()?;
        if !self.registry.contains(&task.experiment) {
            return Err(Error::Dispatch(format!(
                "no engine can build experiment '{}'",
                task.experiment
            )));
        }

        let job_id = JobId::new();
        let registry = Arc::clone(&self.registry);
        let semaphore = Arc::clone(&self.semaphore);
        let state = Arc::clone(&self.state);
        let task_job_id = job_id.clone();

        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("engine semaphore is never closed");
            let joined = tokio::task::spawn_blocking(move || {
                let experiment = registry.build(&task.experiment, task.config)?;
                let mut harness = Harness::new(experiment);
                harness.set(task.parameters);
                Ok::<_, Error>(harness.run())
            })
            .await;

            let outcome = match joined {
                Ok(Ok(records)) => JobOutcome::completed(task_job_id.clone(), records),
                Ok(Err(err)) => JobOutcome::failed(task_job_id.clone(), err.to_string()),
                Err(join_err) => JobOutcome::failed(
                    task_job_id.clone(),
                    format!("engine crashed mid-run: {join_err}"),
                ),
            };

            let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.in_flight.remove(&task_job_id);
            if state.finalized.insert(task_job_id) {
                state.ready.push(outcome);
            }
        });

        let mut state = self.state();
        if !state.finalized.contains(&job_id) {
            state.in_flight.insert(job_id.clone(), handle.abort_handle());
        }
        debug!(job_id = %job_id, "task submitted");
        Ok(job_id)
    }

    async fn pull_ready(&self) -> Result<Vec<JobOutcome>> {
        self.transport()?;
        Ok(std::mem::take(&mut self.state().ready))
    }

    async fn cancel(&self, job_id: &JobId) -> Result<bool> {
        self.transport()?;
        let mut state = self.state();
        if state.finalized.contains(job_id) {
            return Ok(false);
        }
        let Some(handle) = state.in_flight.remove(job_id) else {
            return Ok(false);
        };
        handle.abort();
        state.finalized.insert(job_id.clone());
        state.ready.push(JobOutcome::cancelled(job_id.clone()));
        Ok(true)
    }

    async fn prepare(&self, requirements: &[String]) -> Result<()> {
        self.transport()?;
        for requirement in requirements {
            if !self.registry.contains(requirement) {
                return Err(Error::Dispatch(format!(
                    "engines cannot resolve experiment '{requirement}'"
                )));
            }
        }
        Ok(())
    }
}
