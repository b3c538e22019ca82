//! Designs: pure mappings from parameter ranges to ordered lists of
//! parameter points.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::record::Parameters;
use crate::value::Value;

/// One parameter's range: a single value, or an ordered finite sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterRange {
    Singleton(Value),
    Sequence(Vec<Value>),
}

impl ParameterRange {
    pub fn len(&self) -> usize {
        match self {
            ParameterRange::Singleton(_) => 1,
            ParameterRange::Sequence(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_singleton(&self) -> bool {
        matches!(self, ParameterRange::Singleton(_))
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            ParameterRange::Singleton(value) => {
                if index == 0 {
                    Some(value)
                } else {
                    None
                }
            }
            ParameterRange::Sequence(values) => values.get(index),
        }
    }

    pub fn values(&self) -> Vec<Value> {
        match self {
            ParameterRange::Singleton(value) => vec![value.clone()],
            ParameterRange::Sequence(values) => values.clone(),
        }
    }
}

impl From<Value> for ParameterRange {
    fn from(value: Value) -> Self {
        match value {
            // An array value used as a range means "sweep these values"
            Value::Array(items) => ParameterRange::Sequence(items),
            scalar => ParameterRange::Singleton(scalar),
        }
    }
}

impl From<Vec<Value>> for ParameterRange {
    fn from(values: Vec<Value>) -> Self {
        ParameterRange::Sequence(values)
    }
}

impl From<i64> for ParameterRange {
    fn from(v: i64) -> Self {
        ParameterRange::Singleton(Value::Int(v))
    }
}

impl From<i32> for ParameterRange {
    fn from(v: i32) -> Self {
        ParameterRange::Singleton(Value::Int(i64::from(v)))
    }
}

impl From<f64> for ParameterRange {
    fn from(v: f64) -> Self {
        ParameterRange::Singleton(Value::Float(v))
    }
}

impl From<bool> for ParameterRange {
    fn from(v: bool) -> Self {
        ParameterRange::Singleton(Value::Bool(v))
    }
}

impl From<&str> for ParameterRange {
    fn from(v: &str) -> Self {
        ParameterRange::Singleton(Value::Text(v.to_string()))
    }
}

impl From<Vec<i64>> for ParameterRange {
    fn from(values: Vec<i64>) -> Self {
        ParameterRange::Sequence(values.into_iter().map(Value::Int).collect())
    }
}

impl From<Vec<i32>> for ParameterRange {
    fn from(values: Vec<i32>) -> Self {
        ParameterRange::Sequence(values.into_iter().map(|v| Value::Int(i64::from(v))).collect())
    }
}

impl From<Vec<f64>> for ParameterRange {
    fn from(values: Vec<f64>) -> Self {
        ParameterRange::Sequence(values.into_iter().map(Value::Float).collect())
    }
}

/// The ranges a lab holds, keyed by parameter name. `BTreeMap` gives the
/// lexicographic name ordering factorial enumeration relies on.
pub type RangeMap = BTreeMap<String, ParameterRange>;

/// A rule mapping parameter ranges to an ordered list of parameter
/// points. Designs are pure functions of the range map; they never
/// observe execution state.
pub trait Design: Send + Sync {
    fn points(&self, ranges: &RangeMap) -> Result<Vec<Parameters>>;
}

/// The Cartesian product of every range, in lexicographic parameter-name
/// order with the index within each range varying fastest rightmost.
/// Singletons contribute a factor of size one; any empty range collapses
/// the whole space to zero points.
#[derive(Debug, Clone, Copy, Default)]
pub struct Factorial;

impl Design for Factorial {
    fn points(&self, ranges: &RangeMap) -> Result<Vec<Parameters>> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<&String> = ranges.keys().collect();
        let sizes: Vec<usize> = names.iter().map(|n| ranges[*n].len()).collect();
        if sizes.iter().any(|&s| s == 0) {
            return Ok(Vec::new());
        }

        let total: usize = sizes.iter().product();
        let mut points = Vec::with_capacity(total);
        let mut indices = vec![0usize; names.len()];
        loop {
            let mut point = Parameters::new();
            for (i, name) in names.iter().enumerate() {
                let value = ranges[*name]
                    .get(indices[i])
                    .expect("index within range length")
                    .clone();
                point.insert((*name).clone(), value);
            }
            points.push(point);

            // Odometer increment, last name fastest
            let mut position = names.len();
            loop {
                if position == 0 {
                    return Ok(points);
                }
                position -= 1;
                indices[position] += 1;
                if indices[position] < sizes[position] {
                    break;
                }
                indices[position] = 0;
            }
        }
    }
}

/// Zips corresponding positions across all ranges. Every non-singleton
/// range must share one length; singletons broadcast to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pointwise;

impl Design for Pointwise {
    fn points(&self, ranges: &RangeMap) -> Result<Vec<Parameters>> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }

        let mut length: Option<usize> = None;
        for (name, range) in ranges {
            if range.is_singleton() {
                continue;
            }
            match length {
                None => length = Some(range.len()),
                Some(expected) if range.len() == expected => {}
                Some(expected) => {
                    return Err(Error::Design(format!(
                        "pointwise range '{name}' has length {} but {expected} was expected",
                        range.len()
                    )))
                }
            }
        }
        let length = length.unwrap_or(1);

        let mut points = Vec::with_capacity(length);
        for index in 0..length {
            let mut point = Parameters::new();
            for (name, range) in ranges {
                let value = if range.is_singleton() {
                    range.get(0).expect("singleton has one value").clone()
                } else {
                    range.get(index).expect("index below shared length").clone()
                };
                point.insert(name.clone(), value);
            }
            points.push(point);
        }
        Ok(points)
    }
}

/// Evenly spaced floating-point values over a closed interval, in the
/// order written. Convenience for building sweep ranges.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<Value> {
    match count {
        0 => Vec::new(),
        1 => vec![Value::Float(start)],
        _ => (0..count)
            .map(|i| {
                let t = i as f64 / (count - 1) as f64;
                Value::Float(start + t * (stop - start))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ranges(entries: Vec<(&str, ParameterRange)>) -> RangeMap {
        entries
            .into_iter()
            .map(|(n, r)| (n.to_string(), r))
            .collect()
    }

    #[test]
    fn test_factorial_counts_are_products() {
        let map = ranges(vec![
            ("a", ParameterRange::Sequence(vec![1.into(), 2.into()])),
            (
                "b",
                ParameterRange::Sequence(vec![1.into(), 2.into(), 3.into()]),
            ),
            ("c", ParameterRange::Singleton(9.into())),
        ]);
        let points = Factorial.points(&map).unwrap();
        assert_eq!(points.len(), 6);
        // Every point carries the singleton
        assert!(points.iter().all(|p| p["c"] == Value::Int(9)));
    }

    #[test]
    fn test_factorial_order_is_lexicographic_then_index() {
        let map = ranges(vec![
            ("b", ParameterRange::Sequence(vec![10.into(), 20.into()])),
            ("a", ParameterRange::Sequence(vec![1.into(), 2.into()])),
        ]);
        let points = Factorial.points(&map).unwrap();
        let pairs: Vec<(i64, i64)> = points
            .iter()
            .map(|p| {
                (
                    p["a"].as_i64().unwrap(),
                    p["b"].as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(pairs, vec![(1, 10), (1, 20), (2, 10), (2, 20)]);
    }

    #[test]
    fn test_factorial_empty_range_produces_no_points() {
        let map = ranges(vec![
            ("a", ParameterRange::Sequence(vec![])),
            ("b", ParameterRange::Sequence(vec![1.into()])),
        ]);
        assert!(Factorial.points(&map).unwrap().is_empty());
    }

    #[test]
    fn test_factorial_no_ranges_produces_no_points() {
        assert!(Factorial.points(&RangeMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_pointwise_zips_and_broadcasts() {
        let map = ranges(vec![
            (
                "a",
                ParameterRange::Sequence(vec![1.into(), 2.into(), 3.into()]),
            ),
            (
                "b",
                ParameterRange::Sequence(vec![10.into(), 20.into(), 30.into()]),
            ),
            ("c", ParameterRange::Singleton(4.into())),
        ]);
        let points = Pointwise.points(&map).unwrap();
        assert_eq!(points.len(), 3);
        for (i, point) in points.iter().enumerate() {
            assert_eq!(point["a"].as_i64().unwrap(), i as i64 + 1);
            assert_eq!(point["b"].as_i64().unwrap(), (i as i64 + 1) * 10);
            assert_eq!(point["c"], Value::Int(4));
        }
    }

    #[test]
    fn test_pointwise_length_mismatch_is_design_error() {
        let map = ranges(vec![
            ("a", ParameterRange::Sequence(vec![1.into(), 2.into()])),
            (
                "b",
                ParameterRange::Sequence(vec![1.into(), 2.into(), 3.into()]),
            ),
        ]);
        assert!(matches!(
            Pointwise.points(&map),
            Err(Error::Design(_))
        ));
    }

    #[test]
    fn test_pointwise_all_singletons_is_one_point() {
        let map = ranges(vec![
            ("a", ParameterRange::Singleton(1.into())),
            ("b", ParameterRange::Singleton(2.into())),
        ]);
        assert_eq!(Pointwise.points(&map).unwrap().len(), 1);
    }

    #[test]
    fn test_linspace_endpoints() {
        let values = linspace(-1.0, 1.0, 5);
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], Value::Float(-1.0));
        assert_eq!(values[4], Value::Float(1.0));
        assert_eq!(values[2], Value::Float(0.0));
    }
}
