//! The common lab contract and the sequential lab.
//!
//! A lab holds parameter ranges, a design, and a notebook, and runs an
//! experiment across every point the design enumerates. The three lab
//! variants differ only in dispatch; range mutation, design application
//! and the compute-or-reuse `create_with` path are the shared [`Lab`]
//! surface.

use tracing::{debug, info};

use sweeplab_core::{
    Design, Experiment, Factorial, Harness, ParameterRange, Parameters, RangeMap, Result,
};
use sweeplab_storage::StoredNotebook;

/// The state every lab variant owns.
pub struct LabCore {
    ranges: RangeMap,
    design: Box<dyn Design>,
    notebook: StoredNotebook,
}

impl LabCore {
    pub fn new(notebook: StoredNotebook) -> Self {
        LabCore {
            ranges: RangeMap::new(),
            design: Box::new(Factorial),
            notebook,
        }
    }

    pub fn with_design(mut self, design: impl Design + 'static) -> Self {
        self.design = Box::new(design);
        self
    }

    pub fn ranges(&self) -> &RangeMap {
        &self.ranges
    }

    pub fn ranges_mut(&mut self) -> &mut RangeMap {
        &mut self.ranges
    }

    pub fn design(&self) -> &dyn Design {
        self.design.as_ref()
    }

    pub fn notebook(&self) -> &StoredNotebook {
        &self.notebook
    }

    pub fn notebook_mut(&mut self) -> &mut StoredNotebook {
        &mut self.notebook
    }

    pub fn points(&self) -> Result<Vec<Parameters>> {
        self.design.points(&self.ranges)
    }
}

/// Options for [`Lab::create_with`].
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    /// Finish (lock) the set once the constructor succeeds.
    pub lock_after: bool,
    /// Clear the lab's ranges before invoking the constructor.
    pub reset_ranges: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            lock_after: true,
            reset_ranges: true,
        }
    }
}

/// The dispatcher-independent lab surface.
pub trait Lab {
    fn core(&self) -> &LabCore;
    fn core_mut(&mut self) -> &mut LabCore;

    /// Set or replace one parameter range.
    fn set_range(&mut self, name: impl Into<String>, range: impl Into<ParameterRange>)
    where
        Self: Sized,
    {
        self.core_mut().ranges.insert(name.into(), range.into());
    }

    /// Remove one parameter range.
    fn remove_range(&mut self, name: &str) {
        self.core_mut().ranges.remove(name);
    }

    /// Forget every parameter range.
    fn clear_ranges(&mut self) {
        self.core_mut().ranges.clear();
    }

    /// Apply the design to the current ranges, producing the ordered list
    /// of parameter points one run of an experiment will visit.
    fn experiments(&self) -> Result<Vec<Parameters>> {
        self.core().points()
    }

    fn notebook(&self) -> &StoredNotebook {
        self.core().notebook()
    }

    fn notebook_mut(&mut self) -> &mut StoredNotebook {
        self.core_mut().notebook_mut()
    }

    /// Compute-or-reuse: when the notebook already contains the tag,
    /// select it and return; otherwise create and select the set, run the
    /// constructor, and lock the set on success. A failing constructor
    /// deletes the partially-filled set before the error propagates, so
    /// the operation is idempotent. Returns whether the set was computed
    /// (false when reused).
    fn create_with(
        &mut self,
        tag: &str,
        description: &str,
        options: CreateOptions,
        ctor: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<bool>
    where
        Self: Sized,
    {
        if self.core().notebook.contains(tag) {
            debug!(tag, "reusing existing result set");
            self.core_mut().notebook.select(tag)?;
            return Ok(false);
        }

        self.core_mut().notebook.add_result_set(tag, description)?;
        if options.reset_ranges {
            self.core_mut().ranges.clear();
        }

        match ctor(self) {
            Ok(()) => {
                let core = self.core_mut();
                core.notebook.select(tag)?;
                if options.lock_after {
                    core.notebook.current_mut().finish()?;
                }
                core.notebook.commit()?;
                Ok(true)
            }
            Err(err) => {
                let core = self.core_mut();
                core.notebook.delete_result_set(tag)?;
                core.notebook.commit()?;
                Err(err)
            }
        }
    }
}

/// Synchronous single-threaded dispatch: iterates the design order and
/// preserves it end-to-end in the selected result set.
pub struct SequentialLab {
    core: LabCore,
}

impl SequentialLab {
    pub fn new(notebook: StoredNotebook) -> Self {
        SequentialLab {
            core: LabCore::new(notebook),
        }
    }

    pub fn with_design(mut self, design: impl Design + 'static) -> Self {
        self.core = self.core.with_design(design);
        self
    }

    /// Run an experiment at every design point, appending each run's
    /// records to the notebook's current set, then commit.
    pub fn run_experiment<E: Experiment>(&mut self, experiment: E) -> Result<()> {
        let points = self.core.points()?;
        info!(points = points.len(), kind = experiment.kind(), "running experiment");

        let mut harness = Harness::new(experiment);
        for point in points {
            harness.set(point);
            let records = harness.run();
            self.core.notebook.add_results(records)?;
        }
        self.core.notebook.commit()
    }
}

impl Lab for SequentialLab {
    fn core(&self) -> &LabCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LabCore {
        &mut self.core
    }
}

/// Surface a payload panic message as text for a failed record.
pub(crate) fn panic_message(err: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "experiment panicked".to_string()
    }
}

