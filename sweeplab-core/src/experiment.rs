//! The experiment lifecycle.
//!
//! An experiment is polymorphic over five capabilities. `configure` /
//! `deconfigure` bracket parameter-change boundaries (expensive per-point
//! setup); `set_up` / `tear_down` bracket each individual run. Only
//! `perform` must be supplied; the rest default to no-ops. Payload errors
//! use [`anyhow::Error`] so user code can fail with anything, and the
//! harness converts every failure into a failed record rather than an
//! error: structural problems surface, payload problems are data.

use std::time::Instant;

use chrono::Utc;

use crate::record::{Metadata, Parameters, ResultRecord, Results};

/// What one `perform` invocation hands back to the harness.
#[derive(Debug, Clone)]
pub enum Produced {
    /// A single results mapping; the harness supplies parameters and
    /// metadata.
    Results(Results),
    /// Several results mappings treated as a repetition bundle: flattened
    /// into separate records sharing the run's parameters and timings.
    Bundle(Vec<Results>),
    /// Fully-formed records from a nested experiment. Passed through the
    /// harness unchanged; combinators use this to keep per-repetition
    /// metadata.
    Records(Vec<ResultRecord>),
}

impl From<Results> for Produced {
    fn from(results: Results) -> Self {
        Produced::Results(results)
    }
}

impl From<Vec<Results>> for Produced {
    fn from(bundle: Vec<Results>) -> Self {
        Produced::Bundle(bundle)
    }
}

/// The capability set experiments implement.
pub trait Experiment: Send {
    /// Identifier of the experiment kind, recorded in every record's
    /// metadata.
    fn kind(&self) -> &str;

    /// Expensive per-parameter-point setup; runs once per `set`.
    fn configure(&mut self, _params: &Parameters) -> anyhow::Result<()> {
        Ok(())
    }

    /// Undo `configure`; runs when parameters change or the experiment is
    /// discarded.
    fn deconfigure(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Cheap per-run setup. May mutate the parameters; the mutation is
    /// visible only in the record produced by this run.
    fn set_up(&mut self, _params: &mut Parameters) -> anyhow::Result<()> {
        Ok(())
    }

    /// The experiment payload.
    fn perform(&mut self, params: &mut Parameters) -> anyhow::Result<Produced>;

    /// Cheap per-run cleanup; runs whenever `set_up` succeeded.
    fn tear_down(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E: Experiment + ?Sized> Experiment for Box<E> {
    fn kind(&self) -> &str {
        (**self).kind()
    }

    fn configure(&mut self, params: &Parameters) -> anyhow::Result<()> {
        (**self).configure(params)
    }

    fn deconfigure(&mut self) -> anyhow::Result<()> {
        (**self).deconfigure()
    }

    fn set_up(&mut self, params: &mut Parameters) -> anyhow::Result<()> {
        (**self).set_up(params)
    }

    fn perform(&mut self, params: &mut Parameters) -> anyhow::Result<Produced> {
        (**self).perform(params)
    }

    fn tear_down(&mut self) -> anyhow::Result<()> {
        (**self).tear_down()
    }
}

/// Render a payload error's message and chain as text. Records cross
/// process and host boundaries, so the chain is captured eagerly.
fn render_error(err: &anyhow::Error) -> (String, String) {
    (err.to_string(), format!("{err:?}"))
}

/// Drives an experiment through its lifecycle at successive parameter
/// points, timing each phase and packaging records.
pub struct Harness<E: Experiment> {
    experiment: E,
    params: Parameters,
    configured: bool,
    configure_error: Option<(String, String)>,
    last: Vec<ResultRecord>,
}

impl<E: Experiment> Harness<E> {
    pub fn new(experiment: E) -> Self {
        Harness {
            experiment,
            params: Parameters::new(),
            configured: false,
            configure_error: None,
            last: Vec::new(),
        }
    }

    pub fn experiment(&self) -> &E {
        &self.experiment
    }

    pub fn experiment_mut(&mut self) -> &mut E {
        &mut self.experiment
    }

    /// Replace the experiment's parameters. Deconfigures first when
    /// parameters were previously set, then configures at the new point.
    /// A configuration failure is captured and surfaces as a failed
    /// record on the next `run`.
    pub fn set(&mut self, params: Parameters) {
        if self.configured {
            if let Err(err) = self.experiment.deconfigure() {
                self.configure_error = Some(render_error(&err));
            }
            self.configured = false;
        }
        self.params = params;
        match self.experiment.configure(&self.params) {
            Ok(()) => {
                self.configured = true;
                self.configure_error = None;
            }
            Err(err) => {
                self.configure_error = Some(render_error(&err));
            }
        }
    }

    /// Deconfigure and forget the current parameters.
    pub fn clear(&mut self) {
        if self.configured {
            let _ = self.experiment.deconfigure();
            self.configured = false;
        }
        self.params = Parameters::new();
        self.configure_error = None;
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Run the experiment once at the current parameters: `set_up`,
    /// `perform`, `tear_down`, each timed. Failures in any phase produce a
    /// failed record; `run` itself never fails. Each run restarts from the
    /// parameters given to `set`: mutations made by `set_up` or `perform`
    /// are visible only in the record they produced.
    pub fn run(&mut self) -> Vec<ResultRecord> {
        let kind = self.experiment.kind().to_string();
        let start_time = Utc::now();
        let mut params = self.params.clone();

        let mut metadata = Metadata::new(&kind);
        metadata.start_time = start_time;

        // A failure captured at set() time short-circuits the run.
        if let Some((exception, traceback)) = self.configure_error.clone() {
            let mut md = Metadata::failed(&kind, exception, traceback);
            md.start_time = start_time;
            md.end_time = Utc::now();
            let record = ResultRecord::new(params, Results::new(), md);
            self.last = vec![record.clone()];
            return self.last.clone();
        }

        let mut failure: Option<(String, String)> = None;
        let mut produced: Option<Produced> = None;

        let setup_started = Instant::now();
        let setup_ok = match self.experiment.set_up(&mut params) {
            Ok(()) => true,
            Err(err) => {
                failure = Some(render_error(&err));
                false
            }
        };
        metadata.setup_time = setup_started.elapsed().as_secs_f64();

        if setup_ok {
            let perform_started = Instant::now();
            match self.experiment.perform(&mut params) {
                Ok(p) => produced = Some(p),
                Err(err) => failure = Some(render_error(&err)),
            }
            metadata.experiment_time = perform_started.elapsed().as_secs_f64();

            // tear_down runs whenever set_up succeeded, even after a
            // payload failure; its own failure also fails the run.
            let teardown_started = Instant::now();
            if let Err(err) = self.experiment.tear_down() {
                if failure.is_none() {
                    failure = Some(render_error(&err));
                    produced = None;
                }
            }
            metadata.teardown_time = teardown_started.elapsed().as_secs_f64();
        }

        metadata.end_time = Utc::now();
        if let Some((exception, traceback)) = failure {
            metadata.status = false;
            metadata.exception = exception;
            metadata.traceback = traceback;
        }

        self.last = match produced {
            None => vec![ResultRecord::new(params, Results::new(), metadata)],
            Some(Produced::Results(results)) => {
                vec![ResultRecord::new(params, results, metadata)]
            }
            Some(Produced::Bundle(bundle)) => bundle
                .into_iter()
                .map(|results| ResultRecord::new(params.clone(), results, metadata.clone()))
                .collect(),
            Some(Produced::Records(records)) => records,
        };
        self.last.clone()
    }

    /// The records from the most recent run.
    pub fn last_records(&self) -> &[ResultRecord] {
        &self.last
    }

    pub fn last_record(&self) -> Option<&ResultRecord> {
        self.last.first()
    }

    pub fn last_parameters(&self) -> Option<&Parameters> {
        self.last.first().map(|r| &r.parameters)
    }

    pub fn last_results(&self) -> Option<&Results> {
        self.last.first().map(|r| &r.results)
    }

    pub fn last_metadata(&self) -> Option<&Metadata> {
        self.last.first().map(|r| &r.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use anyhow::bail;
    use pretty_assertions::assert_eq;

    /// Counts lifecycle transitions so tests can assert bracket phasing.
    #[derive(Default)]
    struct Probe {
        configures: usize,
        deconfigures: usize,
        setups: usize,
        teardowns: usize,
        fail_in: Option<&'static str>,
    }

    impl Experiment for Probe {
        fn kind(&self) -> &str {
            "probe"
        }

        fn configure(&mut self, _params: &Parameters) -> anyhow::Result<()> {
            self.configures += 1;
            if self.fail_in == Some("configure") {
                bail!("configure failed");
            }
            Ok(())
        }

        fn deconfigure(&mut self) -> anyhow::Result<()> {
            self.deconfigures += 1;
            Ok(())
        }

        fn set_up(&mut self, _params: &mut Parameters) -> anyhow::Result<()> {
            self.setups += 1;
            if self.fail_in == Some("set_up") {
                bail!("set_up failed");
            }
            Ok(())
        }

        fn perform(&mut self, params: &mut Parameters) -> anyhow::Result<Produced> {
            if self.fail_in == Some("perform") {
                bail!("perform failed");
            }
            let x = params.get("x").and_then(Value::as_f64).unwrap_or(0.0);
            let mut results = Results::new();
            results.insert("y".into(), Value::Float(x * 2.0));
            Ok(results.into())
        }

        fn tear_down(&mut self) -> anyhow::Result<()> {
            self.teardowns += 1;
            if self.fail_in == Some("tear_down") {
                bail!("tear_down failed");
            }
            Ok(())
        }
    }

    fn point(x: f64) -> Parameters {
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Float(x));
        p
    }

    #[test]
    fn test_successful_run() {
        let mut harness = Harness::new(Probe::default());
        harness.set(point(3.0));
        let records = harness.run();
        assert_eq!(records.len(), 1);
        assert!(records[0].metadata.status);
        assert_eq!(records[0].results["y"], Value::Float(6.0));
        assert_eq!(records[0].metadata.experiment_kind, "probe");
    }

    #[test]
    fn test_repeated_runs_do_not_reconfigure() {
        let mut harness = Harness::new(Probe::default());
        harness.set(point(1.0));
        harness.run();
        harness.run();
        harness.run();
        assert_eq!(harness.experiment().configures, 1);
        assert_eq!(harness.experiment().setups, 3);
        assert_eq!(harness.experiment().teardowns, 3);
    }

    #[test]
    fn test_set_reconfigures_once_per_point() {
        let mut harness = Harness::new(Probe::default());
        harness.set(point(1.0));
        harness.set(point(2.0));
        assert_eq!(harness.experiment().configures, 2);
        assert_eq!(harness.experiment().deconfigures, 1);
    }

    #[test]
    fn test_perform_failure_yields_failed_record() {
        let mut harness = Harness::new(Probe {
            fail_in: Some("perform"),
            ..Probe::default()
        });
        harness.set(point(1.0));
        let records = harness.run();
        assert_eq!(records.len(), 1);
        assert!(!records[0].metadata.status);
        assert_eq!(records[0].metadata.exception, "perform failed");
        assert!(!records[0].metadata.traceback.is_empty());
        // tear_down still ran
        assert_eq!(harness.experiment().teardowns, 1);
    }

    #[test]
    fn test_set_up_failure_skips_perform_and_teardown() {
        let mut harness = Harness::new(Probe {
            fail_in: Some("set_up"),
            ..Probe::default()
        });
        harness.set(point(1.0));
        let records = harness.run();
        assert!(!records[0].metadata.status);
        assert_eq!(records[0].metadata.experiment_time, 0.0);
        assert_eq!(records[0].metadata.teardown_time, 0.0);
        assert_eq!(harness.experiment().teardowns, 0);
    }

    #[test]
    fn test_configure_failure_surfaces_on_run() {
        let mut harness = Harness::new(Probe {
            fail_in: Some("configure"),
            ..Probe::default()
        });
        harness.set(point(1.0));
        let records = harness.run();
        assert!(!records[0].metadata.status);
        assert_eq!(records[0].metadata.exception, "configure failed");
        assert_eq!(harness.experiment().setups, 0);
    }

    #[test]
    fn test_parameter_mutation_scoped_to_record() {
        struct Mutator;
        impl Experiment for Mutator {
            fn kind(&self) -> &str {
                "mutator"
            }
            fn perform(&mut self, params: &mut Parameters) -> anyhow::Result<Produced> {
                let x = params.get("x").and_then(Value::as_i64).unwrap_or(0);
                params.insert("x".into(), Value::Int(x + 1));
                Ok(Results::new().into())
            }
        }

        let mut harness = Harness::new(Mutator);
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Int(0));
        harness.set(p);

        let first = harness.run();
        assert_eq!(first[0].parameters["x"], Value::Int(1));
        // The next run restarts from the design point, not the mutation
        let second = harness.run();
        assert_eq!(second[0].parameters["x"], Value::Int(1));
    }

    #[test]
    fn test_bundle_flattens_with_shared_parameters() {
        struct Bundler;
        impl Experiment for Bundler {
            fn kind(&self) -> &str {
                "bundler"
            }
            fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
                let bundle: Vec<Results> = (0..3)
                    .map(|i| {
                        let mut r = Results::new();
                        r.insert("i".into(), Value::Int(i));
                        r
                    })
                    .collect();
                Ok(bundle.into())
            }
        }

        let mut harness = Harness::new(Bundler);
        harness.set(point(5.0));
        let records = harness.run();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.parameters["x"], Value::Float(5.0));
        }
    }

    #[test]
    fn test_timing_is_recorded() {
        struct Sleeper;
        impl Experiment for Sleeper {
            fn kind(&self) -> &str {
                "sleeper"
            }
            fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(Results::new().into())
            }
        }

        let mut harness = Harness::new(Sleeper);
        harness.set(Parameters::new());
        let records = harness.run();
        let md = &records[0].metadata;
        assert!(md.experiment_time >= 0.02);
        assert!(md.end_time >= md.start_time);
    }
}
