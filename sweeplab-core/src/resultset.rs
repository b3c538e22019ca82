//! Typed, append-only result sets.
//!
//! A result set holds the records of one homogeneous experiment family,
//! the pending records for work dispatched but not yet resolved, and the
//! two inferred schemas (real fields and pending parameter fields).
//! Records are never mutated or deleted; the only destructive operation
//! is cancelling a still-pending record, which leaves a failed record
//! behind as an audit trail. Locking a set is absorbing.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::record::{
    JobId, Metadata, Parameters, PendingRecord, ResultRecord, Results, FIXED_METADATA,
};
use crate::schema::Schema;
use crate::value::Value;

/// Exception text recorded on a synthetic cancellation record.
pub const CANCELLED_EXCEPTION: &str = "pending result cancelled";

/// Experiment-kind identifier stamped on synthetic cancellation records.
const CANCELLED_KIND: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct ResultSet {
    description: String,
    locked: bool,
    attributes: BTreeMap<String, String>,
    records: Vec<ResultRecord>,
    pending: Vec<PendingRecord>,
    schema_real: Schema,
    schema_pending: Schema,
    parameter_fields: Vec<String>,
    result_fields: Vec<String>,
    metadata_fields: Vec<String>,
    dirty: bool,
    type_changed: bool,
}

impl ResultSet {
    pub fn new(description: impl Into<String>) -> Self {
        ResultSet {
            description: description.into(),
            locked: false,
            attributes: BTreeMap::new(),
            records: Vec::new(),
            pending: Vec::new(),
            schema_real: Schema::new(),
            schema_pending: Schema::new(),
            parameter_fields: Vec::new(),
            result_fields: Vec::new(),
            metadata_fields: Vec::new(),
            dirty: false,
            type_changed: false,
        }
    }

    /// Rebuild a set from persisted parts, re-inferring both schemas by
    /// replaying records in order. The lock flag is applied last so that
    /// locked sets can be reconstructed.
    pub fn from_parts(
        description: String,
        locked: bool,
        attributes: BTreeMap<String, String>,
        records: Vec<ResultRecord>,
        pending: Vec<PendingRecord>,
    ) -> Result<Self> {
        let mut set = ResultSet::new(description);
        set.attributes = attributes;
        for record in records {
            set.append(record)?;
        }
        for p in pending {
            set.schema_pending.observe_all(p.parameters.iter())?;
            set.pending.push(p);
        }
        set.locked = locked;
        set.dirty = false;
        set.type_changed = false;
        Ok(set)
    }

    // ----- description and attributes -----

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> Result<()> {
        self.refuse_if_locked()?;
        self.description = description.into();
        self.dirty = true;
        Ok(())
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.refuse_if_locked()?;
        self.attributes.insert(name.into(), value.into());
        self.dirty = true;
        Ok(())
    }

    // ----- appends -----

    /// Append one record: refuse when locked, infer and promote the
    /// schema, and retire any pending record carrying the same job id.
    pub fn add_record(&mut self, record: ResultRecord) -> Result<()> {
        self.refuse_if_locked()?;
        self.append(record)
    }

    /// Append several records as one batch.
    pub fn add_records(&mut self, records: Vec<ResultRecord>) -> Result<()> {
        self.refuse_if_locked()?;
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }

    fn append(&mut self, record: ResultRecord) -> Result<()> {
        let mut changed = false;
        for (name, value) in &record.parameters {
            changed |= self.schema_real.observe(name, value)?;
            note_field(&mut self.parameter_fields, name);
        }
        for (name, value) in &record.results {
            changed |= self.schema_real.observe(name, value)?;
            note_field(&mut self.result_fields, name);
        }
        for (name, value) in record.metadata.fields() {
            changed |= self.schema_real.observe(&name, &value)?;
            note_field(&mut self.metadata_fields, &name);
        }
        if changed {
            self.type_changed = true;
        }

        if let Some(job_id) = record.metadata.job_id.clone() {
            self.pending.retain(|p| p.job_id != job_id);
        }
        self.records.push(record);
        self.dirty = true;
        Ok(())
    }

    // ----- pending management -----

    /// Register a pending record for a parameter point, issuing a fresh
    /// job id.
    pub fn add_pending(&mut self, parameters: Parameters) -> Result<JobId> {
        let job_id = JobId::new();
        self.add_pending_with_id(job_id.clone(), parameters)?;
        Ok(job_id)
    }

    /// Register a pending record under a dispatcher-issued job id.
    pub fn add_pending_with_id(&mut self, job_id: JobId, parameters: Parameters) -> Result<()> {
        self.refuse_if_locked()?;
        if self.pending.iter().any(|p| p.job_id == job_id) {
            return Err(Error::PendingResult(format!(
                "job {job_id} is already pending"
            )));
        }
        self.schema_pending.observe_all(parameters.iter())?;
        self.pending.push(PendingRecord::new(job_id, parameters));
        self.dirty = true;
        Ok(())
    }

    /// Resolve a pending record into a real one. The record is stamped
    /// with the job id so the append path retires the pending entry; from
    /// the caller's perspective the job is either pending or real, never
    /// both.
    pub fn resolve_pending(&mut self, job_id: &JobId, mut record: ResultRecord) -> Result<()> {
        self.refuse_if_locked()?;
        if !self.pending.iter().any(|p| &p.job_id == job_id) {
            return Err(Error::PendingResult(format!("no pending job {job_id}")));
        }
        record.metadata.job_id = Some(job_id.clone());
        self.append(record)
    }

    /// Cancel a pending record, recording a synthetic failed record in its
    /// place so the audit trail survives.
    pub fn cancel_pending(&mut self, job_id: &JobId) -> Result<()> {
        self.refuse_if_locked()?;
        self.cancel_pending_inner(job_id)
    }

    fn cancel_pending_inner(&mut self, job_id: &JobId) -> Result<()> {
        let pending = self
            .pending
            .iter()
            .find(|p| &p.job_id == job_id)
            .cloned()
            .ok_or_else(|| Error::PendingResult(format!("no pending job {job_id}")))?;

        debug!(job_id = %job_id, "cancelling pending result");
        let mut metadata = Metadata::failed(
            CANCELLED_KIND,
            CANCELLED_EXCEPTION,
            Error::Cancelled(job_id.to_string()).to_string(),
        );
        metadata.job_id = Some(job_id.clone());
        self.append(ResultRecord::new(pending.parameters, Results::new(), metadata))
    }

    // ----- reads -----

    /// All real records, conformed to the promoted schema: values widened
    /// to the field kind and missing fields backfilled with zeros.
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.iter().map(|r| self.conform(r)).collect()
    }

    /// Records whose parameters match every entry of a partial parameter
    /// assignment. The wanted values are widened to the promoted field
    /// kinds first, so a query matches regardless of when the field's
    /// kind widened.
    pub fn records_for(&self, partial: &Parameters) -> Vec<ResultRecord> {
        self.records
            .iter()
            .map(|r| self.conform(r))
            .filter(|record| {
                partial.iter().all(|(name, want)| {
                    let want = match self.schema_real.kind_of(name) {
                        Some(kind) => want.coerce_to(kind),
                        None => want.clone(),
                    };
                    record.parameters.get(name) == Some(&want)
                })
            })
            .collect()
    }

    fn conform(&self, record: &ResultRecord) -> ResultRecord {
        let mut out = record.clone();
        out.parameters = self.conform_section(&self.parameter_fields, &record.parameters);
        out.results = self.conform_section(&self.result_fields, &record.results);
        for name in &self.metadata_fields {
            if FIXED_METADATA.contains(&name.as_str()) {
                continue;
            }
            let kind = match self.schema_real.kind_of(name) {
                Some(kind) => kind,
                None => continue,
            };
            let value = match record.metadata.extra.get(name) {
                Some(v) => v.coerce_to(kind),
                None => kind.zero(),
            };
            out.metadata.extra.insert(name.clone(), value);
        }
        out
    }

    fn conform_section(
        &self,
        names: &[String],
        values: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for name in names {
            let kind = match self.schema_real.kind_of(name) {
                Some(kind) => kind,
                None => continue,
            };
            let value = match values.get(name) {
                Some(v) => v.coerce_to(kind),
                None => kind.zero(),
            };
            out.insert(name.clone(), value);
        }
        out
    }

    /// The distinct observed values of one parameter, in first-seen order.
    pub fn parameter_range(&self, name: &str) -> Vec<Value> {
        let mut seen: Vec<Value> = Vec::new();
        for record in &self.records {
            if let Some(value) = record.parameters.get(name) {
                if !seen.contains(value) {
                    seen.push(value.clone());
                }
            }
        }
        seen
    }

    /// The distinct observed parameter tuples, in first-seen order.
    pub fn parameter_combinations(&self) -> Vec<Parameters> {
        let mut seen: Vec<Parameters> = Vec::new();
        for record in &self.records {
            if !seen.contains(&record.parameters) {
                seen.push(record.parameters.clone());
            }
        }
        seen
    }

    /// Parameter field names, in first-observed order.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_fields
    }

    /// Result field names, in first-observed order.
    pub fn result_names(&self) -> &[String] {
        &self.result_fields
    }

    /// Metadata field names, in first-observed order.
    pub fn metadata_names(&self) -> &[String] {
        &self.metadata_fields
    }

    pub fn pending_records(&self) -> &[PendingRecord] {
        &self.pending
    }

    pub fn pending_job_ids(&self) -> Vec<JobId> {
        self.pending.iter().map(|p| p.job_id.clone()).collect()
    }

    pub fn has_pending(&self, job_id: &JobId) -> bool {
        self.pending.iter().any(|p| &p.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True iff no pending records remain.
    pub fn ready(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fraction of submitted work that has resolved; 1 when nothing has
    /// been submitted at all.
    pub fn ready_fraction(&self) -> f64 {
        let real = self.records.len();
        let pending = self.pending.len();
        if real + pending == 0 {
            1.0
        } else {
            real as f64 / (real + pending) as f64
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema_real
    }

    pub fn pending_schema(&self) -> &Schema {
        &self.schema_pending
    }

    // ----- locking and dirtiness -----

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Cancel every outstanding pending record, then lock the set. A
    /// second finish is a no-op; the lock is absorbing.
    pub fn finish(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        for job_id in self.pending_job_ids() {
            self.cancel_pending_inner(&job_id)?;
        }
        self.locked = true;
        self.dirty = true;
        debug!(records = self.records.len(), "result set locked");
        Ok(())
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// True when a schema change since the last clear means persistence
    /// must rewrite typed storage rather than append.
    pub fn type_changed(&self) -> bool {
        self.type_changed
    }

    pub fn clear_type_changed(&mut self) {
        self.type_changed = false;
    }

    fn refuse_if_locked(&self) -> Result<()> {
        if self.locked {
            Err(Error::ResultSetLocked(
                "result set is locked and cannot be modified".into(),
            ))
        } else {
            Ok(())
        }
    }
}

fn note_field(fields: &mut Vec<String>, name: &str) {
    if !fields.iter().any(|f| f == name) {
        fields.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(x: i64, z: f64) -> ResultRecord {
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(x));
        let mut r = Results::new();
        r.insert("z".into(), Value::Float(z));
        ResultRecord::new(p, r, Metadata::new("test"))
    }

    #[test]
    fn test_append_and_read_back() {
        let mut set = ResultSet::new("test set");
        set.add_record(record(1, 0.5)).unwrap();
        let records = set.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].parameters["x"], Value::Int(1));
        assert_eq!(records[0].results["z"], Value::Float(0.5));
    }

    #[test]
    fn test_locked_set_refuses_appends() {
        let mut set = ResultSet::new("test set");
        set.add_record(record(1, 0.5)).unwrap();
        set.finish().unwrap();
        assert!(matches!(
            set.add_record(record(2, 1.0)),
            Err(Error::ResultSetLocked(_))
        ));
        assert!(matches!(
            set.set_attribute("a", "b"),
            Err(Error::ResultSetLocked(_))
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut set = ResultSet::new("test set");
        set.add_record(record(1, 0.5)).unwrap();
        set.finish().unwrap();
        let snapshot = set.records();
        set.finish().unwrap();
        assert_eq!(set.records(), snapshot);
    }

    #[test]
    fn test_pending_lifecycle() {
        let mut set = ResultSet::new("test set");
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(9));
        let job_id = set.add_pending(p.clone()).unwrap();
        assert!(!set.ready());
        assert_eq!(set.ready_fraction(), 0.0);

        set.resolve_pending(&job_id, record(9, 3.0)).unwrap();
        assert!(set.ready());
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].metadata.job_id, Some(job_id.clone()));
        // Resolution consumed the pending entry
        assert!(matches!(
            set.resolve_pending(&job_id, record(9, 3.0)),
            Err(Error::PendingResult(_))
        ));
    }

    #[test]
    fn test_cancel_pending_leaves_failed_record() {
        let mut set = ResultSet::new("test set");
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(4));
        let job_id = set.add_pending(p).unwrap();
        set.cancel_pending(&job_id).unwrap();

        assert!(set.ready());
        let records = set.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].metadata.status);
        assert_eq!(records[0].metadata.exception, CANCELLED_EXCEPTION);
        assert_eq!(records[0].parameters["x"], Value::Int(4));
    }

    #[test]
    fn test_finish_cancels_all_pending() {
        let mut set = ResultSet::new("test set");
        for x in 0..3 {
            let mut p = Parameters::new();
            p.insert("x".into(), Value::Int(x));
            set.add_pending(p).unwrap();
        }
        set.finish().unwrap();
        assert!(set.ready());
        assert_eq!(set.len(), 3);
        assert!(set.records().iter().all(|r| !r.metadata.status));
        assert!(set.locked());
    }

    #[test]
    fn test_type_promotion_backfills() {
        let mut set = ResultSet::new("test set");
        set.add_record(record(1, 0.5)).unwrap();

        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(2));
        let mut r = Results::new();
        r.insert("z".into(), Value::Int(7));
        r.insert("w".into(), Value::Int(1));
        set.add_record(ResultRecord::new(p, r, Metadata::new("test")))
            .unwrap();

        assert!(set.type_changed());
        let records = set.records();
        // z was float first, so the later int widens on retrieval
        assert_eq!(records[1].results["z"], Value::Float(7.0));
        // The earlier record backfills the new field with its zero
        assert_eq!(records[0].results["w"], Value::Int(0));
    }

    #[test]
    fn test_metadata_extras_backfill() {
        let mut set = ResultSet::new("test set");
        let mut md = Metadata::new("test");
        md.extra.insert("repetition_index".into(), Value::Int(0));
        set.add_record(ResultRecord::new(
            Parameters::new(),
            Results::new(),
            md,
        ))
        .unwrap();
        set.add_record(record(1, 0.5)).unwrap();

        let records = set.records();
        assert_eq!(records[1].metadata.extra["repetition_index"], Value::Int(0));
    }

    #[test]
    fn test_records_for_partial_match() {
        let mut set = ResultSet::new("test set");
        set.add_record(record(1, 0.5)).unwrap();
        set.add_record(record(2, 1.5)).unwrap();
        set.add_record(record(1, 2.5)).unwrap();

        let mut partial = Parameters::new();
        partial.insert("x".into(), Value::Int(1));
        assert_eq!(set.records_for(&partial).len(), 2);
    }

    #[test]
    fn test_parameter_range_and_combinations() {
        let mut set = ResultSet::new("test set");
        set.add_record(record(1, 0.5)).unwrap();
        set.add_record(record(2, 1.5)).unwrap();
        set.add_record(record(1, 2.5)).unwrap();

        assert_eq!(set.parameter_range("x"), vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(set.parameter_combinations().len(), 2);
    }

    #[test]
    fn test_ready_fraction_monotone() {
        let mut set = ResultSet::new("test set");
        let mut fractions = vec![set.ready_fraction()];
        let mut job_ids = Vec::new();
        for x in 0..4 {
            let mut p = Parameters::new();
            p.insert("x".into(), Value::Int(x));
            job_ids.push(set.add_pending(p).unwrap());
        }
        fractions.push(set.ready_fraction());
        for (i, job_id) in job_ids.iter().enumerate() {
            set.resolve_pending(job_id, record(i as i64, 0.0)).unwrap();
            fractions.push(set.ready_fraction());
        }
        // Monotone non-decreasing over the life of one submission batch
        for pair in fractions[1..].windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(*fractions.last().unwrap(), 1.0);
    }

    #[test]
    fn test_round_trip_through_parts() {
        let mut set = ResultSet::new("test set");
        set.add_record(record(1, 0.5)).unwrap();
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(2));
        set.add_pending(p).unwrap();

        let rebuilt = ResultSet::from_parts(
            set.description().to_string(),
            set.locked(),
            set.attributes().clone(),
            set.records(),
            set.pending_records().to_vec(),
        )
        .unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt.pending_records().len(), 1);
        assert_eq!(rebuilt.schema(), set.schema());
    }
}
