//! The cluster lab: asynchronous dispatch to a worker farm.
//!
//! `run_experiment` submits one task per design point, registers one
//! pending record per submission, and returns immediately. Observation
//! is explicit polling, never a background thread, so a client can
//! terminate between submit and update and another can pick the
//! notebook up from disk later. Every completed job resolves into its
//! submit-time set through the notebook-global job-id lookup, not into
//! whichever set happens to be selected when the update runs.
//!
//! Transient farm errors are retried with exponential backoff inside a
//! bounded budget and then surfaced with the dispatch error kind.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use sweeplab_core::{
    Design, Error, Experiment, JobId, Metadata, Result, ResultRecord, Results,
};
use sweeplab_storage::StoredNotebook;

use crate::farm::{JobOutcome, JobState, TaskSpec, WorkerFarm};
use crate::lab::{Lab, LabCore};

/// Bounded exponential backoff for farm round-trips.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

pub struct ClusterLab<F: WorkerFarm> {
    core: LabCore,
    farm: F,
    retry: RetryConfig,
    poll_interval: Duration,
}

impl<F: WorkerFarm> ClusterLab<F> {
    pub fn new(notebook: StoredNotebook, farm: F) -> Self {
        ClusterLab {
            core: LabCore::new(notebook),
            farm,
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_design(mut self, design: impl Design + 'static) -> Self {
        self.core = self.core.with_design(design);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Polling interval used by [`wait`](Self::wait).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn farm(&self) -> &F {
        &self.farm
    }

    /// Retry a farm round-trip within the backoff budget, then surface
    /// the failure as a dispatch error.
    async fn retrying<T, Fut, Op>(&self, what: &str, mut op: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.retry.initial_delay;
        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts.max(1) {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(attempt, error = %err, "{what} failed; will retry");
                    last_error = err.to_string();
                }
            }
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * self.retry.multiplier)
                        .min(self.retry.max_delay.as_secs_f64()),
                );
            }
        }
        Err(Error::Dispatch(format!(
            "{what} failed after {} attempts: {last_error}",
            self.retry.max_attempts.max(1)
        )))
    }

    /// Submit the experiment at every design point and return
    /// immediately, leaving one pending record per submitted point in
    /// the notebook's current set. Returns the number of submissions.
    pub async fn run_experiment<E>(&mut self, experiment: &E) -> Result<usize>
    where
        E: Experiment + Serialize,
    {
        let points = self.core.points()?;
        let requirements = vec![experiment.kind().to_string()];
        self.retrying("prepare", || self.farm.prepare(&requirements))
            .await?;
        info!(points = points.len(), kind = experiment.kind(), "submitting to farm");

        let mut submitted = 0;
        for point in points {
            let task = TaskSpec::for_experiment(experiment, point.clone())?;
            let job_id = self
                .retrying("submit", || self.farm.submit(task.clone()))
                .await?;
            self.core
                .notebook_mut()
                .add_pending_with_id(job_id, point)?;
            submitted += 1;
        }
        self.core.notebook_mut().commit()?;
        Ok(submitted)
    }

    /// Poll the farm and drain every terminal job into a real record in
    /// its submit-time set, then commit. Failed and cancelled jobs
    /// produce failed records; nothing is silently dropped. Returns the
    /// number of jobs resolved by this update.
    pub async fn update_results(&mut self) -> Result<usize> {
        let outcomes = self.retrying("pull results", || self.farm.pull_ready()).await?;

        let mut resolved = 0;
        for outcome in outcomes {
            if self.apply_outcome(outcome)? {
                resolved += 1;
            }
        }
        if resolved > 0 {
            debug!(resolved, "farm results reconciled");
        }
        self.core.notebook_mut().commit()?;
        Ok(resolved)
    }

    fn apply_outcome(&mut self, outcome: JobOutcome) -> Result<bool> {
        let notebook = self.core.notebook_mut();
        let job_id = outcome.job_id.clone();
        let Some(tag) = notebook.pending_tag(&job_id).map(str::to_string) else {
            // Already resolved or cancelled locally; drains are
            // idempotent from the notebook's point of view.
            warn!(job_id = %job_id, "dropping outcome for unknown job");
            return Ok(false);
        };

        match outcome.state {
            JobState::Completed => {
                let mut records = outcome.records;
                if records.is_empty() {
                    let parameters = pending_parameters(notebook, &tag, &job_id);
                    records.push(ResultRecord::new(
                        parameters,
                        Results::new(),
                        Metadata::failed("unknown", "engine returned no records", ""),
                    ));
                }
                let first = records.remove(0);
                let mut rest = records;
                notebook.resolve_pending(&job_id, first)?;
                if !rest.is_empty() {
                    for record in &mut rest {
                        record.metadata.job_id = Some(job_id.clone());
                    }
                    let set = notebook
                        .result_set_mut(&tag)
                        .ok_or_else(|| Error::NotFound(format!("result set '{tag}'")))?;
                    set.add_records(rest)?;
                }
            }
            JobState::Failed => {
                let parameters = pending_parameters(notebook, &tag, &job_id);
                let error = outcome
                    .error
                    .unwrap_or_else(|| "task failed on the farm".to_string());
                let record = ResultRecord::new(
                    parameters,
                    Results::new(),
                    Metadata::failed("unknown", &error, &error),
                );
                notebook.resolve_pending(&job_id, record)?;
            }
            JobState::Cancelled => {
                notebook.cancel_pending(&job_id)?;
            }
        }
        Ok(true)
    }

    /// True iff the selected result set has no pending records left.
    pub fn ready(&self) -> bool {
        self.core.notebook().current().ready()
    }

    /// Fraction of the selected set's submissions that have resolved.
    pub fn ready_fraction(&self) -> f64 {
        self.core.notebook().current().ready_fraction()
    }

    /// Outstanding pending records across the whole notebook.
    pub fn outstanding(&self) -> usize {
        self.core.notebook().pending_count()
    }

    /// Poll with a bounded interval until the selected set is ready or
    /// the timeout expires. Returns whether it became ready.
    pub async fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.update_results().await?;
            if self.ready() {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// Cancel one pending job: best-effort cancellation on the farm, and
    /// always the synthetic cancelled record locally. Idempotent: a job
    /// that is no longer pending returns false.
    pub async fn cancel_pending(&mut self, job_id: &JobId) -> Result<bool> {
        if let Err(err) = self.retrying("cancel", || self.farm.cancel(job_id)).await {
            warn!(job_id = %job_id, error = %err, "farm-side cancellation failed");
        }
        let cancelled = self.core.notebook_mut().cancel_pending(job_id)?;
        self.core.notebook_mut().commit()?;
        Ok(cancelled)
    }
}

fn pending_parameters(
    notebook: &sweeplab_storage::Notebook,
    tag: &str,
    job_id: &JobId,
) -> sweeplab_core::Parameters {
    notebook
        .result_set(tag)
        .and_then(|set| {
            set.pending_records()
                .iter()
                .find(|p| &p.job_id == job_id)
                .map(|p| p.parameters.clone())
        })
        .unwrap_or_default()
}

impl<F: WorkerFarm> Lab for ClusterLab<F> {
    fn core(&self) -> &LabCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LabCore {
        &mut self.core
    }
}
