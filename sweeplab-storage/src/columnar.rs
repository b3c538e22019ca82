//! Columnar persistence for large notebooks.
//!
//! A columnar notebook is a container directory: `manifest.json` carries
//! the notebook- and set-level attributes, the inferred schemas and the
//! data file names; each set with records has one Parquet file with one
//! row per record and one typed column per field, and a second Parquet
//! file for pending records that exists only while pending records do.
//!
//! Type mapping: integers go to the smallest signed width that fits the
//! observed values (overridable per field), floats to `Float64`, booleans
//! to `Boolean`, text to `Utf8`, one-dimensional arrays to Arrow lists,
//! and the known timestamp metadata keys to microsecond UTC timestamp
//! columns restored to native timestamps on load. Complex values have no
//! Parquet type and are stored in their canonical text form; the
//! manifest's kind table restores them on read.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int16Array,
    Int32Array, Int64Array, Int64Builder, ListArray, ListBuilder, StringArray, StringBuilder,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sweeplab_core::{
    Error, JobId, Metadata, Parameters, PendingRecord, Result, ResultRecord, ResultSet, Results,
    ScalarKind, SchemaField, Value, ValueKind, FIXED_METADATA,
};

use crate::notebook::{swap_into_place, Notebook, NotebookBackend, FORMAT_VERSION};

const MANIFEST_FILE: &str = "manifest.json";
const JOB_ID_COLUMN: &str = "job_id";

/// Metadata keys stored as native timestamp columns.
const TIMESTAMP_KEYS: &[&str] = &["start_time", "end_time"];

/// Integer column widths. The default is the smallest width that fits
/// the observed values of the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntWidth {
    I16,
    I32,
    I64,
}

impl IntWidth {
    fn holds(self, min: i64, max: i64) -> bool {
        match self {
            IntWidth::I16 => min >= i64::from(i16::MIN) && max <= i64::from(i16::MAX),
            IntWidth::I32 => min >= i64::from(i32::MIN) && max <= i64::from(i32::MAX),
            IntWidth::I64 => true,
        }
    }
}

impl std::fmt::Display for IntWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntWidth::I16 => write!(f, "i16"),
            IntWidth::I32 => write!(f, "i32"),
            IntWidth::I64 => write!(f, "i64"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    name: String,
    description: String,
    current_tag: String,
    attributes: BTreeMap<String, String>,
    locked: bool,
    sets: Vec<SetEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SetEntry {
    tag: String,
    description: String,
    locked: bool,
    attributes: BTreeMap<String, String>,
    parameter_names: Vec<String>,
    result_names: Vec<String>,
    metadata_names: Vec<String>,
    schema: Vec<SchemaField>,
    pending_schema: Vec<SchemaField>,
    /// Data file name; absent for a set with no records yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    /// Pending file name; absent, not empty, when nothing is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_file: Option<String>,
}

/// Parquet/Arrow persistence over a container directory.
#[derive(Debug, Clone, Default)]
pub struct ColumnarBackend {
    widths: BTreeMap<String, IntWidth>,
}

impl ColumnarBackend {
    pub fn new() -> Self {
        ColumnarBackend {
            widths: BTreeMap::new(),
        }
    }

    /// Override the integer column width for one field, trading size
    /// against headroom for values beyond those observed so far.
    pub fn with_width(mut self, field: impl Into<String>, width: IntWidth) -> Self {
        self.widths.insert(field.into(), width);
        self
    }
}

impl NotebookBackend for ColumnarBackend {
    fn load(&self, path: &Path) -> Result<Notebook> {
        let manifest_text = fs::read_to_string(path.join(MANIFEST_FILE))?;
        let manifest: Manifest = serde_json::from_str(&manifest_text)?;
        if manifest.version != FORMAT_VERSION {
            return Err(Error::NotebookVersion(format!(
                "version {} is not supported",
                manifest.version
            )));
        }

        let mut sets = Vec::with_capacity(manifest.sets.len());
        for entry in &manifest.sets {
            let records = match &entry.file {
                Some(file) => read_records(&path.join(file), entry)?,
                None => Vec::new(),
            };
            let pending = match &entry.pending_file {
                Some(file) => read_pending(&path.join(file), entry)?,
                None => Vec::new(),
            };
            let set = ResultSet::from_parts(
                entry.description.clone(),
                entry.locked,
                entry.attributes.clone(),
                records,
                pending,
            )?;
            sets.push((entry.tag.clone(), set));
        }
        Notebook::from_parts(
            manifest.name,
            manifest.description,
            manifest.attributes,
            sets,
            manifest.current_tag,
            manifest.locked,
        )
    }

    fn save(&self, notebook: &Notebook, path: &Path) -> Result<()> {
        let staged = path.with_extension("staged");
        if staged.exists() {
            fs::remove_dir_all(&staged)?;
        }
        fs::create_dir_all(&staged)?;

        let mut entries = Vec::new();
        for (index, (tag, set)) in notebook.result_sets().enumerate() {
            let file = if set.is_empty() {
                None
            } else {
                let name = format!("set-{index:03}.parquet");
                write_records(set, &staged.join(&name), &self.widths)?;
                Some(name)
            };
            let pending_file = if set.pending_records().is_empty() {
                None
            } else {
                let name = format!("set-{index:03}-pending.parquet");
                write_pending(set, &staged.join(&name))?;
                Some(name)
            };
            entries.push(SetEntry {
                tag: tag.to_string(),
                description: set.description().to_string(),
                locked: set.locked(),
                attributes: set.attributes().clone(),
                parameter_names: set.parameter_names().to_vec(),
                result_names: set.result_names().to_vec(),
                metadata_names: set.metadata_names().to_vec(),
                schema: set.schema().iter().cloned().collect(),
                pending_schema: set.pending_schema().iter().cloned().collect(),
                file,
                pending_file,
            });
        }

        let manifest = Manifest {
            version: FORMAT_VERSION,
            name: notebook.name().to_string(),
            description: notebook.description().to_string(),
            current_tag: notebook.current_tag().to_string(),
            attributes: notebook.attributes().clone(),
            locked: notebook.locked(),
            sets: entries,
        };
        fs::write(
            staged.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        debug!(path = %path.display(), sets = manifest.sets.len(), "writing columnar notebook");
        swap_into_place(&staged, path)
    }
}

fn arrow_error(err: arrow::error::ArrowError) -> Error {
    Error::Serialization(err.to_string())
}

fn parquet_error(err: parquet::errors::ParquetError) -> Error {
    Error::Serialization(err.to_string())
}

// ----- writing -----

/// Flatten one record into a single name-to-value row across P, R and M.
fn record_row(record: &ResultRecord) -> BTreeMap<String, Value> {
    let mut row = record.parameters.clone();
    for (name, value) in &record.results {
        row.insert(name.clone(), value.clone());
    }
    for (name, value) in record.metadata.fields() {
        row.insert(name, value);
    }
    row
}

fn write_records(
    set: &ResultSet,
    path: &Path,
    widths: &BTreeMap<String, IntWidth>,
) -> Result<()> {
    let records = set.records();
    let rows: Vec<BTreeMap<String, Value>> = records.iter().map(record_row).collect();

    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    for schema_field in set.schema().iter() {
        let name = schema_field.name.as_str();
        let kind = schema_field.kind;
        let column: Vec<Value> = rows
            .iter()
            .map(|row| match row.get(name) {
                Some(value) => value.coerce_to(kind),
                None => kind.zero(),
            })
            .collect();
        let is_timestamp =
            TIMESTAMP_KEYS.contains(&name) && set.metadata_names().iter().any(|n| n.as_str() == name);
        let array = build_array(name, kind, &column, widths.get(name).copied(), is_timestamp)?;
        fields.push(Field::new(name, array.data_type().clone(), true));
        arrays.push(array);
    }
    write_batch(path, fields, arrays)
}

fn write_pending(set: &ResultSet, path: &Path) -> Result<()> {
    let pending = set.pending_records();

    let mut fields = Vec::new();
    let mut arrays: Vec<ArrayRef> = Vec::new();
    for schema_field in set.pending_schema().iter() {
        let name = schema_field.name.as_str();
        let kind = schema_field.kind;
        let column: Vec<Value> = pending
            .iter()
            .map(|p| match p.parameters.get(name) {
                Some(value) => value.coerce_to(kind),
                None => kind.zero(),
            })
            .collect();
        let array = build_array(name, kind, &column, None, false)?;
        fields.push(Field::new(name, array.data_type().clone(), true));
        arrays.push(array);
    }

    let job_ids: Vec<String> = pending.iter().map(|p| p.job_id.to_string()).collect();
    let job_array: ArrayRef = Arc::new(StringArray::from(job_ids));
    fields.push(Field::new(JOB_ID_COLUMN, job_array.data_type().clone(), true));
    arrays.push(job_array);

    write_batch(path, fields, arrays)
}

fn write_batch(path: &Path, fields: Vec<Field>, arrays: Vec<ArrayRef>) -> Result<()> {
    let schema = Arc::new(ArrowSchema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), arrays).map_err(arrow_error)?;
    let file = fs::File::create(path)?;
    let properties = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(properties)).map_err(parquet_error)?;
    writer.write(&batch).map_err(parquet_error)?;
    // The writer must be closed to write the footer
    writer.close().map_err(parquet_error)?;
    Ok(())
}

fn build_array(
    name: &str,
    kind: ValueKind,
    column: &[Value],
    width: Option<IntWidth>,
    is_timestamp: bool,
) -> Result<ArrayRef> {
    if is_timestamp {
        let micros: Vec<i64> = column.iter().map(timestamp_micros).collect();
        return Ok(Arc::new(
            TimestampMicrosecondArray::from(micros).with_timezone("UTC"),
        ));
    }
    let array: ArrayRef = match kind {
        ValueKind::Scalar(ScalarKind::Int) => {
            let values: Vec<i64> = column.iter().map(|v| v.as_i64().unwrap_or(0)).collect();
            return build_int_array(name, &values, width);
        }
        ValueKind::Scalar(ScalarKind::Float) => {
            let values: Vec<f64> = column.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect();
            Arc::new(Float64Array::from(values))
        }
        ValueKind::Scalar(ScalarKind::Bool) => {
            let values: Vec<bool> = column.iter().map(|v| v.as_bool().unwrap_or(false)).collect();
            Arc::new(BooleanArray::from(values))
        }
        ValueKind::Scalar(ScalarKind::Text) => {
            let values: Vec<String> = column
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect();
            Arc::new(StringArray::from(values))
        }
        ValueKind::Scalar(ScalarKind::Complex) => {
            let values: Vec<String> = column.iter().map(Value::to_text).collect();
            Arc::new(StringArray::from(values))
        }
        ValueKind::Array(elem) => build_list_array(elem, column),
    };
    Ok(array)
}

/// Observed-max-fit integer columns unless an override pins the width.
/// An override too narrow for the observed range is refused: wrapping
/// the values would hand back different data on reload.
fn build_int_array(name: &str, values: &[i64], width: Option<IntWidth>) -> Result<ArrayRef> {
    let min = values.iter().copied().min().unwrap_or(0);
    let max = values.iter().copied().max().unwrap_or(0);
    let width = match width {
        Some(width) => {
            if !width.holds(min, max) {
                return Err(Error::ResultsStructure(format!(
                    "column '{name}' holds values in {min}..={max}, outside its configured {width} width"
                )));
            }
            width
        }
        None => {
            if IntWidth::I16.holds(min, max) {
                IntWidth::I16
            } else if IntWidth::I32.holds(min, max) {
                IntWidth::I32
            } else {
                IntWidth::I64
            }
        }
    };
    let array: ArrayRef = match width {
        IntWidth::I16 => Arc::new(Int16Array::from(
            values.iter().map(|&v| v as i16).collect::<Vec<_>>(),
        )),
        IntWidth::I32 => Arc::new(Int32Array::from(
            values.iter().map(|&v| v as i32).collect::<Vec<_>>(),
        )),
        IntWidth::I64 => Arc::new(Int64Array::from(values.to_vec())),
    };
    Ok(array)
}

fn build_list_array(elem: ScalarKind, column: &[Value]) -> ArrayRef {
    match elem {
        ScalarKind::Int => {
            let mut builder = ListBuilder::new(Int64Builder::new());
            for value in column {
                for item in value.as_array().unwrap_or(&[]) {
                    builder.values().append_value(item.as_i64().unwrap_or(0));
                }
                builder.append(true);
            }
            Arc::new(builder.finish())
        }
        ScalarKind::Float => {
            let mut builder = ListBuilder::new(Float64Builder::new());
            for value in column {
                for item in value.as_array().unwrap_or(&[]) {
                    builder.values().append_value(item.as_f64().unwrap_or(0.0));
                }
                builder.append(true);
            }
            Arc::new(builder.finish())
        }
        ScalarKind::Bool => {
            let mut builder = ListBuilder::new(BooleanBuilder::new());
            for value in column {
                for item in value.as_array().unwrap_or(&[]) {
                    builder.values().append_value(item.as_bool().unwrap_or(false));
                }
                builder.append(true);
            }
            Arc::new(builder.finish())
        }
        ScalarKind::Text | ScalarKind::Complex => {
            let mut builder = ListBuilder::new(StringBuilder::new());
            for value in column {
                for item in value.as_array().unwrap_or(&[]) {
                    builder.values().append_value(item.to_text());
                }
                builder.append(true);
            }
            Arc::new(builder.finish())
        }
    }
}

fn timestamp_micros(value: &Value) -> i64 {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_micros())
        .unwrap_or(0)
}

// ----- reading -----

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(parquet_error)?
        .build()
        .map_err(parquet_error)?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(arrow_error)
}

fn read_records(path: &Path, entry: &SetEntry) -> Result<Vec<ResultRecord>> {
    let kinds: BTreeMap<&str, ValueKind> = entry
        .schema
        .iter()
        .map(|f| (f.name.as_str(), f.kind))
        .collect();

    let mut records = Vec::new();
    for batch in read_batches(path)? {
        for row in 0..batch.num_rows() {
            let mut values = BTreeMap::new();
            for field in &entry.schema {
                let Some(column) = batch.column_by_name(&field.name) else {
                    continue;
                };
                values.insert(
                    field.name.clone(),
                    column_value(column, row, kinds.get(field.name.as_str()).copied())?,
                );
            }
            records.push(row_to_record(&values, entry));
        }
    }
    Ok(records)
}

fn read_pending(path: &Path, entry: &SetEntry) -> Result<Vec<PendingRecord>> {
    let mut pending = Vec::new();
    for batch in read_batches(path)? {
        let job_ids = batch
            .column_by_name(JOB_ID_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>().cloned())
            .ok_or_else(|| {
                Error::Serialization("pending dataset is missing its job_id column".into())
            })?;
        for row in 0..batch.num_rows() {
            let mut parameters = Parameters::new();
            for field in &entry.pending_schema {
                let Some(column) = batch.column_by_name(&field.name) else {
                    continue;
                };
                parameters.insert(
                    field.name.clone(),
                    column_value(column, row, Some(field.kind))?,
                );
            }
            pending.push(PendingRecord::new(
                JobId::from(job_ids.value(row)),
                parameters,
            ));
        }
    }
    Ok(pending)
}

/// Pull one cell out of a column, mapping the Arrow type back onto the
/// value model. The inferred kind disambiguates text that encodes
/// complex values.
fn column_value(column: &ArrayRef, row: usize, kind: Option<ValueKind>) -> Result<Value> {
    let any = column.as_any();
    if let Some(a) = any.downcast_ref::<TimestampMicrosecondArray>() {
        let dt = DateTime::from_timestamp_micros(a.value(row)).unwrap_or(DateTime::UNIX_EPOCH);
        return Ok(Value::Text(dt.to_rfc3339()));
    }
    if let Some(a) = any.downcast_ref::<Int16Array>() {
        return Ok(Value::Int(i64::from(a.value(row))));
    }
    if let Some(a) = any.downcast_ref::<Int32Array>() {
        return Ok(Value::Int(i64::from(a.value(row))));
    }
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        return Ok(Value::Int(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<Float64Array>() {
        return Ok(Value::Float(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<BooleanArray>() {
        return Ok(Value::Bool(a.value(row)));
    }
    if let Some(a) = any.downcast_ref::<StringArray>() {
        let text = a.value(row);
        if kind == Some(ValueKind::Scalar(ScalarKind::Complex)) {
            return Ok(parse_complex(text));
        }
        return Ok(Value::Text(text.to_string()));
    }
    if let Some(a) = any.downcast_ref::<ListArray>() {
        let elem = match kind {
            Some(ValueKind::Array(elem)) => Some(elem),
            _ => None,
        };
        let inner = a.value(row);
        let mut items = Vec::with_capacity(inner.len());
        for i in 0..inner.len() {
            items.push(list_item(&inner, i, elem)?);
        }
        return Ok(Value::Array(items));
    }
    Err(Error::Serialization(format!(
        "unsupported column type {:?}",
        column.data_type()
    )))
}

fn list_item(inner: &ArrayRef, index: usize, elem: Option<ScalarKind>) -> Result<Value> {
    let any = inner.as_any();
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        return Ok(Value::Int(a.value(index)));
    }
    if let Some(a) = any.downcast_ref::<Float64Array>() {
        return Ok(Value::Float(a.value(index)));
    }
    if let Some(a) = any.downcast_ref::<BooleanArray>() {
        return Ok(Value::Bool(a.value(index)));
    }
    if let Some(a) = any.downcast_ref::<StringArray>() {
        let text = a.value(index);
        if elem == Some(ScalarKind::Complex) {
            return Ok(parse_complex(text));
        }
        return Ok(Value::Text(text.to_string()));
    }
    Err(Error::Serialization(format!(
        "unsupported list element type {:?}",
        inner.data_type()
    )))
}

fn parse_complex(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Complex(_)) => value,
        _ => Value::Text(text.to_string()),
    }
}

fn row_to_record(values: &BTreeMap<String, Value>, entry: &SetEntry) -> ResultRecord {
    let mut parameters = Parameters::new();
    for name in &entry.parameter_names {
        if let Some(value) = values.get(name) {
            parameters.insert(name.clone(), value.clone());
        }
    }
    let mut results = Results::new();
    for name in &entry.result_names {
        if let Some(value) = values.get(name) {
            results.insert(name.clone(), value.clone());
        }
    }

    let text = |name: &str| -> String {
        values
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let duration = |name: &str| -> f64 {
        values.get(name).and_then(Value::as_f64).unwrap_or(0.0)
    };
    let timestamp = |name: &str| -> DateTime<Utc> {
        values
            .get(name)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::UNIX_EPOCH)
    };

    let mut metadata = Metadata::new(text("experiment_class"));
    metadata.status = values
        .get("status")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    metadata.exception = text("exception");
    metadata.traceback = text("traceback");
    metadata.start_time = timestamp("start_time");
    metadata.end_time = timestamp("end_time");
    metadata.setup_time = duration("setup_time");
    metadata.experiment_time = duration("experiment_time");
    metadata.teardown_time = duration("teardown_time");
    let job_id = text(JOB_ID_COLUMN);
    if !job_id.is_empty() {
        metadata.job_id = Some(JobId::from(job_id));
    }
    for name in &entry.metadata_names {
        if FIXED_METADATA.contains(&name.as_str()) {
            continue;
        }
        if let Some(value) = values.get(name) {
            metadata.extra.insert(name.clone(), value.clone());
        }
    }

    ResultRecord::new(parameters, results, metadata)
}
