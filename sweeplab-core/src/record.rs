//! Result records: the (parameters, results, metadata) triples produced by
//! experiments, plus the pending records that stand in for work dispatched
//! asynchronously but not yet resolved.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// A complete assignment of values to parameter names.
pub type Parameters = BTreeMap<String, Value>;

/// The values an experiment reports back.
pub type Results = BTreeMap<String, Value>;

/// Token identifying one asynchronously dispatched task. Unique within a
/// notebook; issued at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// The metadata keys that live in typed [`Metadata`] fields rather than
/// its `extra` map.
pub const FIXED_METADATA: &[&str] = &[
    "status",
    "exception",
    "traceback",
    "start_time",
    "end_time",
    "setup_time",
    "experiment_time",
    "teardown_time",
    "experiment_class",
    "job_id",
];

/// Per-run metadata. The fixed keys are always present; anything an
/// experiment adds beyond them lives in `extra` and is flattened on the
/// wire alongside the fixed keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Whether the run completed without error.
    pub status: bool,
    /// Error message; empty when `status` is true.
    #[serde(default)]
    pub exception: String,
    /// Rendered error chain as text. Never a live stack object: records
    /// cross process and host boundaries.
    #[serde(default)]
    pub traceback: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Phase durations in seconds; phases never reached are zero.
    pub setup_time: f64,
    pub experiment_time: f64,
    pub teardown_time: f64,
    /// Identifier of the experiment kind that produced this record.
    #[serde(rename = "experiment_class")]
    pub experiment_kind: String,
    /// Present on records resolved from an asynchronous submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Additional experiment-supplied metadata.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Metadata {
    /// Fresh successful metadata for an experiment kind, with both
    /// timestamps at now and zero phase durations.
    pub fn new(experiment_kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Metadata {
            status: true,
            exception: String::new(),
            traceback: String::new(),
            start_time: now,
            end_time: now,
            setup_time: 0.0,
            experiment_time: 0.0,
            teardown_time: 0.0,
            experiment_kind: experiment_kind.into(),
            job_id: None,
            extra: BTreeMap::new(),
        }
    }

    /// Failed metadata carrying an exception message and rendered traceback.
    pub fn failed(
        experiment_kind: impl Into<String>,
        exception: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        let mut md = Metadata::new(experiment_kind);
        md.status = false;
        md.exception = exception.into();
        md.traceback = traceback.into();
        md
    }

    /// The metadata as named values, in the order used for schema
    /// inference and columnar storage. Timestamps render as ISO-8601 text;
    /// the columnar backend restores them to native timestamps.
    pub fn fields(&self) -> Vec<(String, Value)> {
        let mut fields = vec![
            ("status".to_string(), Value::Bool(self.status)),
            ("exception".to_string(), Value::Text(self.exception.clone())),
            ("traceback".to_string(), Value::Text(self.traceback.clone())),
            (
                "start_time".to_string(),
                Value::Text(self.start_time.to_rfc3339()),
            ),
            ("end_time".to_string(), Value::Text(self.end_time.to_rfc3339())),
            ("setup_time".to_string(), Value::Float(self.setup_time)),
            (
                "experiment_time".to_string(),
                Value::Float(self.experiment_time),
            ),
            ("teardown_time".to_string(), Value::Float(self.teardown_time)),
            (
                "experiment_class".to_string(),
                Value::Text(self.experiment_kind.clone()),
            ),
        ];
        if let Some(job_id) = &self.job_id {
            fields.push(("job_id".to_string(), Value::Text(job_id.to_string())));
        }
        for (name, value) in &self.extra {
            fields.push((name.clone(), value.clone()));
        }
        fields
    }

    /// Total elapsed wall-clock time for the run, in seconds.
    pub fn elapsed(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

/// One experiment invocation's worth of data: the parameter point it ran
/// at, the results it returned, and how the run went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub parameters: Parameters,
    pub results: Results,
    pub metadata: Metadata,
}

impl ResultRecord {
    pub fn new(parameters: Parameters, results: Results, metadata: Metadata) -> Self {
        ResultRecord {
            parameters,
            results,
            metadata,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.metadata.status
    }
}

/// A parameter point whose results have been dispatched but not yet
/// resolved. Either becomes a real record or is cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub job_id: JobId,
    pub parameters: Parameters,
}

impl PendingRecord {
    pub fn new(job_id: JobId, parameters: Parameters) -> Self {
        PendingRecord { job_id, parameters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> Parameters {
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(1));
        p.insert("y".into(), Value::Float(2.5));
        p
    }

    #[test]
    fn test_metadata_defaults_to_success() {
        let md = Metadata::new("test");
        assert!(md.status);
        assert!(md.exception.is_empty());
        assert_eq!(md.setup_time, 0.0);
    }

    #[test]
    fn test_failed_metadata() {
        let md = Metadata::failed("test", "boom", "trace");
        assert!(!md.status);
        assert_eq!(md.exception, "boom");
        assert_eq!(md.traceback, "trace");
    }

    #[test]
    fn test_record_serde_outer_keys() {
        let record = ResultRecord::new(params(), Results::new(), Metadata::new("test"));
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("parameters").is_some());
        assert!(json.get("results").is_some());
        assert!(json.get("metadata").is_some());
        assert!(json["metadata"].get("experiment_class").is_some());
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut md = Metadata::new("test");
        md.extra.insert("note".into(), Value::Text("hi".into()));
        md.job_id = Some(JobId::from("job-1"));
        let record = ResultRecord::new(params(), Results::new(), md);

        let json = serde_json::to_string(&record).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.parameters, record.parameters);
        assert_eq!(back.metadata.job_id, record.metadata.job_id);
        assert_eq!(back.metadata.extra, record.metadata.extra);
    }

    #[test]
    fn test_metadata_fields_order() {
        let md = Metadata::new("test");
        let names: Vec<String> = md.fields().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names[0], "status");
        assert!(names.contains(&"experiment_class".to_string()));
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
