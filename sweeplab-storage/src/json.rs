//! Portable single-file JSON persistence.
//!
//! The format is a version-2 object of result sets keyed by tag. A
//! legacy version-1 file (one flat `results` list, no set grouping) is
//! accepted on read and migrated into the default set; writes always
//! emit version 2.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use sweeplab_core::{Error, Parameters, PendingRecord, Result, ResultRecord, ResultSet};

use crate::notebook::{
    swap_into_place, Notebook, NotebookBackend, DEFAULT_TAG, FORMAT_VERSION,
};

#[derive(Debug, Serialize, Deserialize)]
struct JsonNotebook {
    version: u32,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    current_tag: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    locked: bool,
    result_sets: BTreeMap<String, JsonResultSet>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonResultSet {
    #[serde(default)]
    description: String,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    results: Vec<ResultRecord>,
    #[serde(default)]
    pending: BTreeMap<String, Parameters>,
}

/// The legacy flat form: a bare list of records.
#[derive(Debug, Deserialize)]
struct JsonNotebookV1 {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    results: Vec<ResultRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBackend;

impl JsonBackend {
    pub fn new() -> Self {
        JsonBackend
    }
}

impl NotebookBackend for JsonBackend {
    fn load(&self, path: &Path) -> Result<Notebook> {
        let text = fs::read_to_string(path)?;
        let raw: serde_json::Value = serde_json::from_str(&text)?;

        let version = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);
        match version {
            1 => {
                debug!(path = %path.display(), "migrating version-1 notebook");
                let legacy: JsonNotebookV1 = serde_json::from_value(raw)?;
                let set = ResultSet::from_parts(
                    "default result set".to_string(),
                    false,
                    BTreeMap::new(),
                    legacy.results,
                    Vec::new(),
                )?;
                Notebook::from_parts(
                    legacy.name,
                    legacy.description,
                    BTreeMap::new(),
                    vec![(DEFAULT_TAG.to_string(), set)],
                    DEFAULT_TAG.to_string(),
                    false,
                )
            }
            2 => {
                let file: JsonNotebook = serde_json::from_value(raw)?;
                let mut sets = Vec::with_capacity(file.result_sets.len());
                for (tag, json_set) in file.result_sets {
                    let pending = json_set
                        .pending
                        .into_iter()
                        .map(|(job_id, parameters)| {
                            PendingRecord::new(job_id.into(), parameters)
                        })
                        .collect();
                    let set = ResultSet::from_parts(
                        json_set.description,
                        json_set.locked,
                        json_set.attributes,
                        json_set.results,
                        pending,
                    )?;
                    sets.push((tag, set));
                }
                Notebook::from_parts(
                    file.name,
                    file.description,
                    file.attributes,
                    sets,
                    file.current_tag,
                    file.locked,
                )
            }
            other => Err(Error::NotebookVersion(format!(
                "version {other} is not supported"
            ))),
        }
    }

    fn save(&self, notebook: &Notebook, path: &Path) -> Result<()> {
        let mut result_sets = BTreeMap::new();
        for (tag, set) in notebook.result_sets() {
            let pending = set
                .pending_records()
                .iter()
                .map(|p| (p.job_id.to_string(), p.parameters.clone()))
                .collect();
            result_sets.insert(
                tag.to_string(),
                JsonResultSet {
                    description: set.description().to_string(),
                    locked: set.locked(),
                    attributes: set.attributes().clone(),
                    results: set.records(),
                    pending,
                },
            );
        }
        let file = JsonNotebook {
            version: FORMAT_VERSION,
            name: notebook.name().to_string(),
            description: notebook.description().to_string(),
            current_tag: notebook.current_tag().to_string(),
            attributes: notebook.attributes().clone(),
            locked: notebook.locked(),
            result_sets,
        };

        let staged = path.with_extension("staged");
        fs::write(&staged, serde_json::to_string_pretty(&file)?)?;
        swap_into_place(&staged, path)
    }
}
