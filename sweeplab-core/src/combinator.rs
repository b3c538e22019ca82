//! Experiment combinators: experiments that wrap another experiment and
//! structure its runs. `Summarise(Repeat(e, n))` is the idiomatic stack.

use crate::experiment::{Experiment, Harness, Produced};
use crate::record::{Parameters, ResultRecord, Results};
use crate::value::Value;

/// Metadata key recording the requested repetition count.
pub const REPETITIONS: &str = "repetitions";
/// Metadata key recording a record's position within its bundle.
pub const REPETITION_INDEX: &str = "repetition_index";

/// Runs its inner experiment a fixed number of times per parameter point
/// and returns the flattened, ordered list of the inner records, each
/// stamped with the repetition count and its index.
pub struct Repeat {
    inner: Harness<Box<dyn Experiment>>,
    repetitions: usize,
    label: String,
}

impl Repeat {
    pub fn new(inner: impl Experiment + 'static, repetitions: usize) -> Self {
        let label = format!("repeat({})", inner.kind());
        Repeat {
            inner: Harness::new(Box::new(inner)),
            repetitions,
            label,
        }
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }
}

impl Experiment for Repeat {
    fn kind(&self) -> &str {
        &self.label
    }

    fn configure(&mut self, params: &Parameters) -> anyhow::Result<()> {
        self.inner.set(params.clone());
        Ok(())
    }

    fn deconfigure(&mut self) -> anyhow::Result<()> {
        self.inner.clear();
        Ok(())
    }

    fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
        let mut records: Vec<ResultRecord> = Vec::new();
        for _ in 0..self.repetitions {
            records.extend(self.inner.run());
        }
        for (index, record) in records.iter_mut().enumerate() {
            record
                .metadata
                .extra
                .insert(REPETITIONS.to_string(), Value::from(self.repetitions));
            record
                .metadata
                .extra
                .insert(REPETITION_INDEX.to_string(), Value::from(index));
        }
        Ok(Produced::Records(records))
    }
}

/// Summary statistics over the numeric values of one result field.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FieldSummary {
    mean: f64,
    median: f64,
    variance: f64,
    min: f64,
    max: f64,
}

fn summarise_values(values: &[f64]) -> FieldSummary {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let n = values.len() as f64;
    let sum: f64 = values.iter().sum();
    let mean = sum / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let median = if sorted.len() % 2 == 1 {
        sorted[sorted.len() / 2]
    } else {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    };

    FieldSummary {
        mean,
        median,
        variance,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
    }
}

/// Runs its inner experiment once per point (typically a [`Repeat`]) and
/// reduces the named result fields of the sub-records to summary
/// statistics with stable `_mean`, `_median`, `_variance`, `_min`, `_max`
/// suffixes, plus counts of underlying and underlying successful records.
pub struct Summarise {
    inner: Harness<Box<dyn Experiment>>,
    fields: Vec<String>,
    keep_on_failure: bool,
    label: String,
}

impl Summarise {
    pub fn new<S: Into<String>>(
        inner: impl Experiment + 'static,
        fields: impl IntoIterator<Item = S>,
    ) -> Self {
        let label = format!("summarise({})", inner.kind());
        Summarise {
            inner: Harness::new(Box::new(inner)),
            fields: fields.into_iter().map(Into::into).collect(),
            keep_on_failure: false,
            label,
        }
    }

    /// Include failed sub-records in the summary instead of filtering
    /// them out.
    pub fn keep_on_failure(mut self, keep: bool) -> Self {
        self.keep_on_failure = keep;
        self
    }
}

impl Experiment for Summarise {
    fn kind(&self) -> &str {
        &self.label
    }

    fn configure(&mut self, params: &Parameters) -> anyhow::Result<()> {
        self.inner.set(params.clone());
        Ok(())
    }

    fn deconfigure(&mut self) -> anyhow::Result<()> {
        self.inner.clear();
        Ok(())
    }

    fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
        let records = self.inner.run();
        let successful = records.iter().filter(|r| r.metadata.status).count();
        let used: Vec<&ResultRecord> = records
            .iter()
            .filter(|r| self.keep_on_failure || r.metadata.status)
            .collect();

        let mut out = Results::new();
        for field in &self.fields {
            let values: Vec<f64> = used
                .iter()
                .filter_map(|r| r.results.get(field).and_then(Value::as_f64))
                .collect();
            if values.is_empty() {
                continue;
            }
            let summary = summarise_values(&values);
            out.insert(format!("{field}_mean"), Value::Float(summary.mean));
            out.insert(format!("{field}_median"), Value::Float(summary.median));
            out.insert(format!("{field}_variance"), Value::Float(summary.variance));
            out.insert(format!("{field}_min"), Value::Float(summary.min));
            out.insert(format!("{field}_max"), Value::Float(summary.max));
        }
        out.insert("underlying_results".to_string(), Value::from(records.len()));
        out.insert(
            "underlying_successful_results".to_string(),
            Value::from(successful),
        );
        Ok(Produced::Results(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Harness;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    struct Doubler;

    impl Experiment for Doubler {
        fn kind(&self) -> &str {
            "doubler"
        }
        fn perform(&mut self, params: &mut Parameters) -> anyhow::Result<Produced> {
            let x = params.get("x").and_then(Value::as_f64).unwrap_or(0.0);
            let mut r = Results::new();
            r.insert("y".into(), Value::Float(2.0 * x));
            Ok(r.into())
        }
    }

    fn point(x: f64) -> Parameters {
        let mut p = Parameters::new();
        p.insert("x".into(), Value::Float(x));
        p
    }

    #[test]
    fn test_repeat_produces_n_records() {
        let mut harness = Harness::new(Repeat::new(Doubler, 5));
        harness.set(point(1.5));
        let records = harness.run();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.results["y"], Value::Float(3.0));
            assert_eq!(record.metadata.extra[REPETITIONS], Value::Int(5));
            assert_eq!(record.metadata.extra[REPETITION_INDEX], Value::Int(i as i64));
        }
    }

    #[test]
    fn test_repeat_flattens_inner_bundles() {
        struct Bundler;
        impl Experiment for Bundler {
            fn kind(&self) -> &str {
                "bundler"
            }
            fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
                let bundle: Vec<Results> = (0..2)
                    .map(|i| {
                        let mut r = Results::new();
                        r.insert("i".into(), Value::Int(i));
                        r
                    })
                    .collect();
                Ok(bundle.into())
            }
        }

        let mut harness = Harness::new(Repeat::new(Bundler, 3));
        harness.set(Parameters::new());
        let records = harness.run();
        // M inner records times N repetitions, indices over the flattening
        assert_eq!(records.len(), 6);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.metadata.extra[REPETITION_INDEX], Value::Int(i as i64));
        }
    }

    #[test]
    fn test_summarise_statistics() {
        struct Sequence {
            values: Vec<f64>,
            next: usize,
        }
        impl Experiment for Sequence {
            fn kind(&self) -> &str {
                "sequence"
            }
            fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
                let v = self.values[self.next % self.values.len()];
                self.next += 1;
                let mut r = Results::new();
                r.insert("v".into(), Value::Float(v));
                Ok(r.into())
            }
        }

        let inner = Sequence {
            values: vec![1.0, 2.0, 3.0, 4.0],
            next: 0,
        };
        let mut harness = Harness::new(Summarise::new(Repeat::new(inner, 4), ["v"]));
        harness.set(Parameters::new());
        let records = harness.run();
        assert_eq!(records.len(), 1);

        let results = &records[0].results;
        assert_relative_eq!(results["v_mean"].as_f64().unwrap(), 2.5);
        assert_relative_eq!(results["v_median"].as_f64().unwrap(), 2.5);
        assert_relative_eq!(results["v_variance"].as_f64().unwrap(), 1.25);
        assert_relative_eq!(results["v_min"].as_f64().unwrap(), 1.0);
        assert_relative_eq!(results["v_max"].as_f64().unwrap(), 4.0);
        assert_eq!(results["underlying_results"], Value::Int(4));
        assert_eq!(results["underlying_successful_results"], Value::Int(4));
    }

    #[test]
    fn test_summarise_filters_failures() {
        struct Flaky {
            runs: usize,
        }
        impl Experiment for Flaky {
            fn kind(&self) -> &str {
                "flaky"
            }
            fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
                self.runs += 1;
                if self.runs % 2 == 0 {
                    anyhow::bail!("even runs fail");
                }
                let mut r = Results::new();
                r.insert("v".into(), Value::Float(10.0));
                Ok(r.into())
            }
        }

        let mut harness = Harness::new(Summarise::new(Repeat::new(Flaky { runs: 0 }, 6), ["v"]));
        harness.set(Parameters::new());
        let records = harness.run();
        let results = &records[0].results;
        assert_eq!(results["underlying_results"], Value::Int(6));
        assert_eq!(results["underlying_successful_results"], Value::Int(3));
        assert_relative_eq!(results["v_mean"].as_f64().unwrap(), 10.0);
        assert_relative_eq!(results["v_variance"].as_f64().unwrap(), 0.0);
    }

    #[test]
    fn test_gaussian_summary_is_plausible() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use statrs::distribution::Normal;

        struct Gaussian {
            rng: StdRng,
            dist: Normal,
        }
        impl Experiment for Gaussian {
            fn kind(&self) -> &str {
                "gaussian"
            }
            fn perform(&mut self, _params: &mut Parameters) -> anyhow::Result<Produced> {
                let mut r = Results::new();
                r.insert("v".into(), Value::Float(self.rng.sample(self.dist)));
                Ok(r.into())
            }
        }

        let inner = Gaussian {
            rng: StdRng::seed_from_u64(42),
            dist: Normal::new(0.0, 1.0).unwrap(),
        };
        let mut harness = Harness::new(Summarise::new(Repeat::new(inner, 1000), ["v"]));
        harness.set(Parameters::new());
        let records = harness.run();
        let results = &records[0].results;

        assert_eq!(results["underlying_results"], Value::Int(1000));
        assert_eq!(results["underlying_successful_results"], Value::Int(1000));
        for suffix in ["_mean", "_median", "_variance", "_min", "_max"] {
            assert!(results.contains_key(&format!("v{suffix}")));
        }
        assert!(results["v_mean"].as_f64().unwrap().abs() < 0.2);
        let variance = results["v_variance"].as_f64().unwrap();
        assert!((variance - 1.0).abs() < 0.3);
    }
}
