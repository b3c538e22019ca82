//! The parallel lab: a local worker pool.
//!
//! Dispatch is synchronous from the caller's perspective; internally each
//! design point runs the experiment on its own blocking worker, bounded
//! by a pool size of `max(1, cores - 1)` by default and capped at the
//! host's core count. Workers execute cloned experiment values, so no
//! mutable state is shared with the lab: an experiment communicates with
//! the notebook exclusively through the (P, R, M) it returns. Records
//! land in completion order; individual failures and even panicking
//! payloads become failed records and never halt the pool.

use std::sync::Arc;
use std::thread::available_parallelism;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use sweeplab_core::{
    Design, Experiment, Harness, Metadata, Parameters, Result, ResultRecord, Results,
};
use sweeplab_storage::StoredNotebook;

use crate::lab::{panic_message, Lab, LabCore};

fn host_cores() -> usize {
    available_parallelism().map(usize::from).unwrap_or(1)
}

fn default_workers() -> usize {
    host_cores().saturating_sub(1).max(1)
}

pub struct ParallelLab {
    core: LabCore,
    workers: usize,
}

impl ParallelLab {
    pub fn new(notebook: StoredNotebook) -> Self {
        ParallelLab {
            core: LabCore::new(notebook),
            workers: default_workers(),
        }
    }

    pub fn with_design(mut self, design: impl Design + 'static) -> Self {
        self.core = self.core.with_design(design);
        self
    }

    /// Set the worker pool size, clamped to `1..=cores`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, host_cores());
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run an experiment at every design point across the worker pool,
    /// blocking until all points complete. Records are appended in
    /// completion order, which need not match the design order.
    pub async fn run_experiment<E>(&mut self, experiment: &E) -> Result<()>
    where
        E: Experiment + Clone + Send + 'static,
    {
        let points = self.core.points()?;
        let kind = experiment.kind().to_string();
        info!(
            points = points.len(),
            workers = self.workers,
            kind = %kind,
            "running experiment on worker pool"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut running = FuturesUnordered::new();
        for point in points {
            let semaphore = Arc::clone(&semaphore);
            let experiment = experiment.clone();
            let report_point = point.clone();
            running.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker pool semaphore is never closed");
                let joined = tokio::task::spawn_blocking(move || {
                    let mut harness = Harness::new(experiment);
                    harness.set(point);
                    harness.run()
                })
                .await;
                (report_point, joined)
            });
        }

        while let Some((point, joined)) = running.next().await {
            let records = match joined {
                Ok(records) => records,
                Err(join_err) => {
                    warn!(error = %join_err, "worker died; recording a failed result");
                    vec![crashed_record(&kind, point, join_err)]
                }
            };
            self.core.notebook_mut().add_results(records)?;
        }
        self.core.notebook_mut().commit()
    }
}

/// A worker that died (panicking payload) still yields a failed record
/// rather than silently dropping its point.
fn crashed_record(
    kind: &str,
    parameters: Parameters,
    join_err: tokio::task::JoinError,
) -> ResultRecord {
    let message = if join_err.is_panic() {
        panic_message(join_err.into_panic().as_ref())
    } else {
        join_err.to_string()
    };
    let metadata = Metadata::failed(kind, &message, &message);
    ResultRecord::new(parameters, Results::new(), metadata)
}

impl Lab for ParallelLab {
    fn core(&self) -> &LabCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LabCore {
        &mut self.core
    }
}
