//! The abstract worker-farm contract the cluster lab dispatches through.
//!
//! A farm ships experiment tasks to remote engines and hands completed
//! work back in whatever order it finishes. Rust closures do not
//! serialise, so a task travels as the experiment's registered kind name
//! plus its serialised configuration; engines rebuild the experiment
//! from a registry of constructors. An experiment whose configuration
//! cannot serialise fails submission with the dispatch error kind.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use sweeplab_core::{Error, Experiment, JobId, Parameters, Result, ResultRecord};

/// One task as it travels to an engine: which experiment to build, how
/// to configure it, and the parameter point to run it at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub experiment: String,
    pub config: serde_json::Value,
    pub parameters: Parameters,
}

impl TaskSpec {
    /// Package an experiment and a parameter point for shipping. Fails
    /// with the dispatch kind when the experiment's configuration cannot
    /// be serialised.
    pub fn for_experiment<E>(experiment: &E, parameters: Parameters) -> Result<TaskSpec>
    where
        E: Experiment + Serialize,
    {
        let config = serde_json::to_value(experiment).map_err(|err| {
            Error::Dispatch(format!(
                "experiment '{}' cannot be serialised for dispatch: {err}",
                experiment.kind()
            ))
        })?;
        Ok(TaskSpec {
            experiment: experiment.kind().to_string(),
            config,
            parameters,
        })
    }
}

/// Terminal states a farm reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Completed,
    Failed,
    Cancelled,
}

/// A drained job: its records when it completed, or the error text when
/// the engine failed before producing any.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub state: JobState,
    pub records: Vec<ResultRecord>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn completed(job_id: JobId, records: Vec<ResultRecord>) -> Self {
        JobOutcome {
            job_id,
            state: JobState::Completed,
            records,
            error: None,
        }
    }

    pub fn failed(job_id: JobId, error: impl Into<String>) -> Self {
        JobOutcome {
            job_id,
            state: JobState::Failed,
            records: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn cancelled(job_id: JobId) -> Self {
        JobOutcome {
            job_id,
            state: JobState::Cancelled,
            records: Vec::new(),
            error: None,
        }
    }
}

/// The farm contract. Implementations are transports; the semantics the
/// cluster lab relies on are: `submit` returns a job id immediately,
/// `pull_ready` drains terminal jobs exactly once, `cancel` is
/// best-effort, and `prepare` guarantees every engine can resolve the
/// named experiment kinds before anything is submitted.
#[async_trait]
pub trait WorkerFarm: Send + Sync {
    /// Number of engines available for work.
    async fn engine_count(&self) -> Result<usize>;

    /// Ship one task to some engine.
    async fn submit(&self, task: TaskSpec) -> Result<JobId>;

    /// Drain every job that has reached a terminal state.
    async fn pull_ready(&self) -> Result<Vec<JobOutcome>>;

    /// Best-effort cancellation; true when the job was still in flight.
    async fn cancel(&self, job_id: &JobId) -> Result<bool>;

    /// Ensure every engine can resolve these experiment kinds.
    async fn prepare(&self, requirements: &[String]) -> Result<()>;
}

type Constructor = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Experiment>> + Send + Sync>;

/// Engine-side registry mapping experiment kind names to constructors.
#[derive(Default)]
pub struct ExperimentRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        ExperimentRegistry {
            constructors: BTreeMap::new(),
        }
    }

    /// Register an experiment type under its kind name, rebuilding it
    /// from its serialised configuration.
    pub fn register<E>(mut self, kind: impl Into<String>) -> Self
    where
        E: Experiment + DeserializeOwned + 'static,
    {
        let kind = kind.into();
        let constructor: Constructor = Box::new(move |config| {
            let experiment: E = serde_json::from_value(config).map_err(|err| {
                Error::Dispatch(format!("cannot reconstruct experiment: {err}"))
            })?;
            Ok(Box::new(experiment))
        });
        self.constructors.insert(kind, constructor);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build an experiment from a shipped task configuration.
    pub fn build(&self, kind: &str, config: serde_json::Value) -> Result<Box<dyn Experiment>> {
        let constructor = self.constructors.get(kind).ok_or_else(|| {
            Error::Dispatch(format!("no experiment registered under '{kind}'"))
        })?;
        constructor(config)
    }
}
