//! Dispatch for sweeplab: the sequential, parallel worker-pool and
//! asynchronous cluster labs behind one contract, plus the worker-farm
//! seam the cluster lab submits through.

pub mod cluster;
pub mod farm;
pub mod lab;
pub mod local_farm;
pub mod parallel;

pub use cluster::{ClusterLab, RetryConfig};
pub use farm::{ExperimentRegistry, JobOutcome, JobState, TaskSpec, WorkerFarm};
pub use lab::{CreateOptions, Lab, LabCore, SequentialLab};
pub use local_farm::LocalFarm;
pub use parallel::ParallelLab;
