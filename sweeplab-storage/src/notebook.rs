//! Notebooks: transactional containers of named result sets.
//!
//! A notebook always holds at least one set (the default), exactly one of
//! which is current. Job ids are notebook-global: pending operations by
//! job id search every set, which is what lets asynchronously completed
//! work land in its submit-time set rather than the currently selected
//! one. [`StoredNotebook`] binds a notebook to a path and a persistence
//! backend and commits on every exit path.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use sweeplab_core::{
    Error, JobId, Parameters, Result, ResultRecord, ResultSet,
};

/// Tag of the result set every notebook starts with.
pub const DEFAULT_TAG: &str = "default";

/// The on-disk format version written by both backends.
pub const FORMAT_VERSION: u32 = 2;

/// Commits serialise process-wide: readers of the file see a consistent
/// snapshot. Two processes sharing one notebook file is a documented
/// precondition violation, not something enforced here.
static COMMIT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Debug, Clone)]
pub struct Notebook {
    name: String,
    description: String,
    attributes: BTreeMap<String, String>,
    sets: BTreeMap<String, ResultSet>,
    current: String,
    locked: bool,
    dirty: bool,
}

impl Notebook {
    /// An empty notebook holding a default result set.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(
            DEFAULT_TAG.to_string(),
            ResultSet::new("default result set"),
        );
        Notebook {
            name: name.into(),
            description: description.into(),
            attributes: BTreeMap::new(),
            sets,
            current: DEFAULT_TAG.to_string(),
            locked: false,
            dirty: false,
        }
    }

    /// Reassemble a notebook from persisted parts. A missing default set
    /// is recreated, and the current tag must name a set that exists.
    pub fn from_parts(
        name: String,
        description: String,
        attributes: BTreeMap<String, String>,
        sets: Vec<(String, ResultSet)>,
        current: String,
        locked: bool,
    ) -> Result<Self> {
        let mut map: BTreeMap<String, ResultSet> = sets.into_iter().collect();
        map.entry(DEFAULT_TAG.to_string())
            .or_insert_with(|| ResultSet::new("default result set"));
        if !map.contains_key(&current) {
            return Err(Error::NotFound(format!(
                "current result set '{current}' is not in the notebook"
            )));
        }
        Ok(Notebook {
            name,
            description,
            attributes,
            sets: map,
            current,
            locked,
            dirty: false,
        })
    }

    // ----- identity and attributes -----

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
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

    // ----- result-set management -----

    pub fn tags(&self) -> Vec<&str> {
        self.sets.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.sets.contains_key(tag)
    }

    pub fn result_set(&self, tag: &str) -> Option<&ResultSet> {
        self.sets.get(tag)
    }

    pub fn result_set_mut(&mut self, tag: &str) -> Option<&mut ResultSet> {
        self.sets.get_mut(tag)
    }

    pub fn result_sets(&self) -> impl Iterator<Item = (&str, &ResultSet)> {
        self.sets.iter().map(|(tag, set)| (tag.as_str(), set))
    }

    /// Create a new result set under a tag and select it.
    pub fn add_result_set(
        &mut self,
        tag: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<()> {
        self.refuse_if_locked()?;
        let tag = tag.into();
        if self.sets.contains_key(&tag) {
            return Err(Error::AlreadyExists(format!("result set '{tag}'")));
        }
        self.sets.insert(tag.clone(), ResultSet::new(description));
        self.current = tag;
        self.dirty = true;
        Ok(())
    }

    /// Insert an already-built result set under a tag and select it.
    /// Used when duplicating sets between notebooks.
    pub fn adopt_result_set(&mut self, tag: impl Into<String>, set: ResultSet) -> Result<()> {
        self.refuse_if_locked()?;
        let tag = tag.into();
        if self.sets.contains_key(&tag) {
            return Err(Error::AlreadyExists(format!("result set '{tag}'")));
        }
        self.sets.insert(tag.clone(), set);
        self.current = tag;
        self.dirty = true;
        Ok(())
    }

    /// Select an existing result set as current.
    pub fn select(&mut self, tag: &str) -> Result<()> {
        if !self.sets.contains_key(tag) {
            return Err(Error::NotFound(format!("result set '{tag}'")));
        }
        if self.current != tag {
            self.current = tag.to_string();
            self.dirty = true;
        }
        Ok(())
    }

    /// Select the tagged set, creating it first when absent. Returns
    /// whether the set already existed; repeated calls are no-ops after
    /// the first create.
    pub fn already(&mut self, tag: &str, description: impl Into<String>) -> Result<bool> {
        if self.contains(tag) {
            self.select(tag)?;
            Ok(true)
        } else {
            self.add_result_set(tag, description)?;
            Ok(false)
        }
    }

    /// Delete a result set. Deleting the current set falls back to the
    /// default; deleting the default set recreates it empty, so the
    /// notebook never drops below one set.
    pub fn delete_result_set(&mut self, tag: &str) -> Result<()> {
        self.refuse_if_locked()?;
        if !self.sets.contains_key(tag) {
            return Err(Error::NotFound(format!("result set '{tag}'")));
        }
        self.sets.remove(tag);
        if tag == DEFAULT_TAG {
            self.sets.insert(
                DEFAULT_TAG.to_string(),
                ResultSet::new("default result set"),
            );
        }
        if self.current == tag {
            self.current = DEFAULT_TAG.to_string();
        }
        self.dirty = true;
        Ok(())
    }

    pub fn current_tag(&self) -> &str {
        &self.current
    }

    pub fn current(&self) -> &ResultSet {
        &self.sets[&self.current]
    }

    pub fn current_mut(&mut self) -> &mut ResultSet {
        self.sets
            .get_mut(&self.current)
            .expect("current tag always names a set")
    }

    // ----- records and pending -----

    /// Append a record to the current set.
    pub fn add_result(&mut self, record: ResultRecord) -> Result<()> {
        self.refuse_if_locked()?;
        self.current_mut().add_record(record)
    }

    /// Append a batch of records to the current set.
    pub fn add_results(&mut self, records: Vec<ResultRecord>) -> Result<()> {
        self.refuse_if_locked()?;
        self.current_mut().add_records(records)
    }

    /// Register a pending record in the current set under a fresh job id.
    pub fn add_pending(&mut self, parameters: Parameters) -> Result<JobId> {
        self.refuse_if_locked()?;
        self.current_mut().add_pending(parameters)
    }

    /// Register a pending record in the current set under a
    /// dispatcher-issued job id.
    pub fn add_pending_with_id(&mut self, job_id: JobId, parameters: Parameters) -> Result<()> {
        self.refuse_if_locked()?;
        self.current_mut().add_pending_with_id(job_id, parameters)
    }

    /// Resolve a pending record wherever it lives: job ids are
    /// notebook-global, so completions land in their submit-time set.
    pub fn resolve_pending(&mut self, job_id: &JobId, record: ResultRecord) -> Result<()> {
        self.refuse_if_locked()?;
        for set in self.sets.values_mut() {
            if set.has_pending(job_id) {
                return set.resolve_pending(job_id, record);
            }
        }
        Err(Error::PendingResult(format!("no pending job {job_id}")))
    }

    /// Cancel a pending record wherever it lives. Idempotent: cancelling
    /// a job that is no longer pending returns false.
    pub fn cancel_pending(&mut self, job_id: &JobId) -> Result<bool> {
        self.refuse_if_locked()?;
        for set in self.sets.values_mut() {
            if set.has_pending(job_id) {
                set.cancel_pending(job_id)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The set a pending job was submitted against, if it is still
    /// pending anywhere.
    pub fn pending_tag(&self, job_id: &JobId) -> Option<&str> {
        self.sets
            .iter()
            .find(|(_, set)| set.has_pending(job_id))
            .map(|(tag, _)| tag.as_str())
    }

    /// Outstanding pending records across every set.
    pub fn pending_count(&self) -> usize {
        self.sets.values().map(|s| s.pending_records().len()).sum()
    }

    // ----- locking and dirtiness -----

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Cancel every pending record across all sets, lock every set, and
    /// lock the notebook itself.
    pub fn finish(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        for set in self.sets.values_mut() {
            set.finish()?;
        }
        self.locked = true;
        self.dirty = true;
        debug!(sets = self.sets.len(), "notebook locked");
        Ok(())
    }

    pub fn dirty(&self) -> bool {
        self.dirty || self.sets.values().any(|s| s.dirty())
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
        for set in self.sets.values_mut() {
            set.clear_dirty();
            set.clear_type_changed();
        }
    }

    fn refuse_if_locked(&self) -> Result<()> {
        if self.locked {
            Err(Error::NotebookLocked(
                "notebook is locked and cannot be modified".into(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Persistence backend: loads and saves whole notebooks at a path.
/// Implementations write atomically (fresh temp target, then swap).
pub trait NotebookBackend: Send {
    fn load(&self, path: &Path) -> Result<Notebook>;
    fn save(&self, notebook: &Notebook, path: &Path) -> Result<()>;
}

/// A notebook bound to a path and backend. Dereferences to [`Notebook`];
/// dropping it commits, so any open scope flushes on every exit path.
/// The ephemeral form has no backend and commits are no-ops.
pub struct StoredNotebook {
    notebook: Notebook,
    path: Option<PathBuf>,
    backend: Option<Box<dyn NotebookBackend>>,
}

impl StoredNotebook {
    /// An in-memory notebook; `commit` is a no-op.
    pub fn ephemeral(name: impl Into<String>, description: impl Into<String>) -> Self {
        StoredNotebook {
            notebook: Notebook::new(name, description),
            path: None,
            backend: None,
        }
    }

    /// Open a notebook at a path with the given backend, loading it when
    /// the path exists and creating it fresh otherwise.
    pub fn open(
        path: impl Into<PathBuf>,
        backend: Box<dyn NotebookBackend>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        let notebook = if path.exists() {
            backend.load(&path)?
        } else {
            let mut fresh = Notebook::new(name, description);
            fresh.dirty = true;
            fresh
        };
        Ok(StoredNotebook {
            notebook,
            path: Some(path),
            backend: Some(backend),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flush dirty state to persistence. Serialised process-wide so
    /// concurrent committers in one process cannot interleave writes.
    pub fn commit(&mut self) -> Result<()> {
        let (Some(path), Some(backend)) = (&self.path, &self.backend) else {
            return Ok(());
        };
        if !self.notebook.dirty() {
            return Ok(());
        }
        let _guard = COMMIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        backend.save(&self.notebook, path)?;
        self.notebook.clear_dirty();
        debug!(path = %path.display(), "notebook committed");
        Ok(())
    }

    /// Run a closure against the notebook and commit afterwards, whether
    /// or not the closure succeeded.
    pub fn with<T>(&mut self, f: impl FnOnce(&mut Notebook) -> Result<T>) -> Result<T> {
        let outcome = f(&mut self.notebook);
        let committed = self.commit();
        match outcome {
            Ok(value) => {
                committed?;
                Ok(value)
            }
            Err(err) => {
                if let Err(commit_err) = committed {
                    warn!(error = %commit_err, "commit failed while unwinding");
                }
                Err(err)
            }
        }
    }

    /// Commit and consume the notebook, surfacing any commit error that a
    /// plain drop would only log.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }
}

impl Deref for StoredNotebook {
    type Target = Notebook;

    fn deref(&self) -> &Notebook {
        &self.notebook
    }
}

impl DerefMut for StoredNotebook {
    fn deref_mut(&mut self) -> &mut Notebook {
        &mut self.notebook
    }
}

impl Drop for StoredNotebook {
    fn drop(&mut self) {
        if let Err(err) = self.commit() {
            warn!(error = %err, "commit on drop failed");
        }
    }
}

/// Atomically replace `target` with `staged`: the previous state is
/// parked alongside, the staged state renamed in, and the parked state
/// removed. Readers never observe a partially written notebook.
pub(crate) fn swap_into_place(staged: &Path, target: &Path) -> Result<()> {
    let parked = target.with_extension("old");
    if parked.exists() {
        remove_path(&parked)?;
    }
    if target.exists() {
        std::fs::rename(target, &parked)?;
    }
    std::fs::rename(staged, target)?;
    if parked.exists() {
        remove_path(&parked)?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sweeplab_core::{Metadata, Results, Value};

    fn record(x: i64) -> ResultRecord {
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(x));
        ResultRecord::new(p, Results::new(), Metadata::new("test"))
    }

    #[test]
    fn test_new_notebook_has_default_current() {
        let nb = Notebook::new("nb", "a notebook");
        assert_eq!(nb.current_tag(), DEFAULT_TAG);
        assert_eq!(nb.tags(), vec![DEFAULT_TAG]);
    }

    #[test]
    fn test_add_result_set_selects_it() {
        let mut nb = Notebook::new("nb", "");
        nb.add_result_set("sweep", "a sweep").unwrap();
        assert_eq!(nb.current_tag(), "sweep");
        assert!(matches!(
            nb.add_result_set("sweep", "again"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_already_is_idempotent() {
        let mut nb = Notebook::new("nb", "");
        assert!(!nb.already("sweep", "a sweep").unwrap());
        nb.add_result(record(1)).unwrap();
        assert!(nb.already("sweep", "a sweep").unwrap());
        assert_eq!(nb.current().len(), 1);
    }

    #[test]
    fn test_delete_current_falls_back_to_default() {
        let mut nb = Notebook::new("nb", "");
        nb.add_result_set("sweep", "").unwrap();
        nb.delete_result_set("sweep").unwrap();
        assert_eq!(nb.current_tag(), DEFAULT_TAG);
        assert!(!nb.contains("sweep"));
    }

    #[test]
    fn test_delete_default_recreates_it_empty() {
        let mut nb = Notebook::new("nb", "");
        nb.add_result(record(1)).unwrap();
        nb.delete_result_set(DEFAULT_TAG).unwrap();
        assert!(nb.contains(DEFAULT_TAG));
        assert!(nb.current().is_empty());
    }

    #[test]
    fn test_results_go_to_current_set() {
        let mut nb = Notebook::new("nb", "");
        nb.add_result(record(1)).unwrap();
        nb.add_result_set("sweep", "").unwrap();
        nb.add_result(record(2)).unwrap();
        assert_eq!(nb.result_set(DEFAULT_TAG).unwrap().len(), 1);
        assert_eq!(nb.result_set("sweep").unwrap().len(), 1);
    }

    #[test]
    fn test_pending_resolution_crosses_sets() {
        let mut nb = Notebook::new("nb", "");
        nb.add_result_set("alpha", "").unwrap();
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(7));
        let job_id = nb.add_pending(p).unwrap();

        // Completion arrives while a different set is selected
        nb.add_result_set("beta", "").unwrap();
        nb.resolve_pending(&job_id, record(7)).unwrap();

        assert_eq!(nb.result_set("alpha").unwrap().len(), 1);
        assert!(nb.result_set("beta").unwrap().is_empty());
    }

    #[test]
    fn test_cancel_pending_is_idempotent() {
        let mut nb = Notebook::new("nb", "");
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(7));
        let job_id = nb.add_pending(p).unwrap();
        assert!(nb.cancel_pending(&job_id).unwrap());
        assert!(!nb.cancel_pending(&job_id).unwrap());
    }

    #[test]
    fn test_finish_locks_everything() {
        let mut nb = Notebook::new("nb", "");
        nb.add_result_set("sweep", "").unwrap();
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(1));
        nb.add_pending(p).unwrap();

        nb.finish().unwrap();
        assert!(nb.locked());
        assert_eq!(nb.pending_count(), 0);
        assert!(matches!(nb.add_result(record(1)), Err(Error::NotebookLocked(_))));
        assert!(matches!(
            nb.add_result_set("more", ""),
            Err(Error::NotebookLocked(_))
        ));
    }

    #[test]
    fn test_ephemeral_commit_is_noop() {
        let mut nb = StoredNotebook::ephemeral("nb", "");
        nb.add_result(record(1)).unwrap();
        nb.commit().unwrap();
        assert_eq!(nb.current().len(), 1);
    }
}
