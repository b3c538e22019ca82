//! The safe scalar and array values that parameters and results may take.
//!
//! Values are a closed tagged variant: `i64`, `f64`, `Complex64`, `bool`,
//! text, or a one-dimensional homogeneous array of one of those scalars.
//! Strings are scalars, never iterable. Kinds form a small lattice
//! (`Int < Float < Complex`, with `Bool` and `Text` disjoint) used for
//! schema inference and promotion.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A parameter, result or metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(Complex64),
    Text(String),
    Array(Vec<Value>),
}

/// Scalar kinds, ordered within the numeric lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    Complex,
    Text,
}

/// The kind of a value: a scalar, or a one-dimensional array of a scalar kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Scalar(ScalarKind),
    Array(ScalarKind),
}

impl ScalarKind {
    /// Unify two scalar kinds: widen within `Int < Float < Complex`,
    /// otherwise fall back to `Text`, the weakest kind accepting both.
    pub fn unify(self, other: ScalarKind) -> ScalarKind {
        use ScalarKind::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Int, Float) | (Float, Int) => Float,
            (Int, Complex) | (Complex, Int) | (Float, Complex) | (Complex, Float) => Complex,
            _ => Text,
        }
    }

    pub fn zero(self) -> Value {
        match self {
            ScalarKind::Bool => Value::Bool(false),
            ScalarKind::Int => Value::Int(0),
            ScalarKind::Float => Value::Float(0.0),
            ScalarKind::Complex => Value::Complex(Complex64::new(0.0, 0.0)),
            ScalarKind::Text => Value::Text(String::new()),
        }
    }
}

impl ValueKind {
    /// Unify two kinds under the promotion lattice. Array kinds unify
    /// element-wise; a scalar/array conflict falls back to scalar text.
    pub fn unify(self, other: ValueKind) -> ValueKind {
        match (self, other) {
            (ValueKind::Scalar(a), ValueKind::Scalar(b)) => ValueKind::Scalar(a.unify(b)),
            (ValueKind::Array(a), ValueKind::Array(b)) => ValueKind::Array(a.unify(b)),
            _ => ValueKind::Scalar(ScalarKind::Text),
        }
    }

    /// The zero value used to backfill records that predate a field.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Scalar(k) => k.zero(),
            ValueKind::Array(_) => Value::Array(Vec::new()),
        }
    }

    pub fn is_array(self) -> bool {
        matches!(self, ValueKind::Array(_))
    }
}

impl Value {
    /// Infer the kind of this value. Arrays must be one-dimensional; the
    /// element kind is the unification of all element kinds. An empty
    /// array infers as an integer array and widens on later observations.
    pub fn kind(&self) -> Result<ValueKind> {
        match self {
            Value::Bool(_) => Ok(ValueKind::Scalar(ScalarKind::Bool)),
            Value::Int(_) => Ok(ValueKind::Scalar(ScalarKind::Int)),
            Value::Float(_) => Ok(ValueKind::Scalar(ScalarKind::Float)),
            Value::Complex(_) => Ok(ValueKind::Scalar(ScalarKind::Complex)),
            Value::Text(_) => Ok(ValueKind::Scalar(ScalarKind::Text)),
            Value::Array(items) => {
                let mut elem: Option<ScalarKind> = None;
                for item in items {
                    let k = match item.kind()? {
                        ValueKind::Scalar(k) => k,
                        ValueKind::Array(_) => {
                            return Err(Error::ResultsStructure(
                                "arrays of rank greater than one are not supported".into(),
                            ))
                        }
                    };
                    elem = Some(match elem {
                        Some(e) => e.unify(k),
                        None => k,
                    });
                }
                Ok(ValueKind::Array(elem.unwrap_or(ScalarKind::Int)))
            }
        }
    }

    /// Coerce this value to a (promoted) kind. Callers guarantee the kind
    /// came from unification with this value's own kind, so the only
    /// conversions are numeric widening and rendering to text.
    pub fn coerce_to(&self, kind: ValueKind) -> Value {
        match kind {
            ValueKind::Scalar(k) => self.coerce_scalar(k),
            ValueKind::Array(k) => match self {
                Value::Array(items) => {
                    Value::Array(items.iter().map(|v| v.coerce_scalar(k)).collect())
                }
                other => Value::Text(other.to_text()),
            },
        }
    }

    fn coerce_scalar(&self, kind: ScalarKind) -> Value {
        match (self, kind) {
            (Value::Int(i), ScalarKind::Float) => Value::Float(*i as f64),
            (Value::Int(i), ScalarKind::Complex) => Value::Complex(Complex64::new(*i as f64, 0.0)),
            (Value::Float(f), ScalarKind::Complex) => Value::Complex(Complex64::new(*f, 0.0)),
            (v, ScalarKind::Text) => Value::Text(v.to_text()),
            (v, _) => v.clone(),
        }
    }

    /// Render this value as text. Non-text values render as their JSON
    /// form, so the coercion is loss-free and mechanically reversible.
    pub fn to_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_complex(&self) -> Option<Complex64> {
        match self {
            Value::Int(i) => Some(Complex64::new(*i as f64, 0.0)),
            Value::Float(f) => Some(Complex64::new(*f, 0.0)),
            Value::Complex(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Complex64> for Value {
    fn from(c: Complex64) -> Self {
        Value::Complex(c)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_kind_inference() {
        assert_eq!(
            Value::Int(3).kind().unwrap(),
            ValueKind::Scalar(ScalarKind::Int)
        );
        assert_eq!(
            Value::from(vec![1.0, 2.0]).kind().unwrap(),
            ValueKind::Array(ScalarKind::Float)
        );
        // Mixed numeric arrays widen their element kind
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Float(2.0)]).kind().unwrap(),
            ValueKind::Array(ScalarKind::Float)
        );
    }

    #[test]
    fn test_nested_array_rejected() {
        let nested = Value::Array(vec![Value::Array(vec![Value::Int(1)])]);
        assert!(matches!(
            nested.kind(),
            Err(crate::error::Error::ResultsStructure(_))
        ));
    }

    #[test_case(ScalarKind::Int, ScalarKind::Float, ScalarKind::Float ; "int widens to float")]
    #[test_case(ScalarKind::Float, ScalarKind::Complex, ScalarKind::Complex ; "float widens to complex")]
    #[test_case(ScalarKind::Int, ScalarKind::Complex, ScalarKind::Complex ; "int widens to complex")]
    #[test_case(ScalarKind::Bool, ScalarKind::Int, ScalarKind::Text ; "disjoint kinds fall back to text")]
    #[test_case(ScalarKind::Text, ScalarKind::Float, ScalarKind::Text ; "text absorbs everything")]
    fn test_unify_is_commutative(a: ScalarKind, b: ScalarKind, expected: ScalarKind) {
        assert_eq!(a.unify(b), expected);
        assert_eq!(b.unify(a), expected);
    }

    #[test]
    fn test_unify_arrays() {
        let a = ValueKind::Array(ScalarKind::Int);
        let b = ValueKind::Array(ScalarKind::Float);
        assert_eq!(a.unify(b), ValueKind::Array(ScalarKind::Float));

        // Scalar/array conflicts fall back to text
        let s = ValueKind::Scalar(ScalarKind::Int);
        assert_eq!(a.unify(s), ValueKind::Scalar(ScalarKind::Text));
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(ValueKind::Scalar(ScalarKind::Int).zero(), Value::Int(0));
        assert_eq!(
            ValueKind::Scalar(ScalarKind::Complex).zero(),
            Value::Complex(Complex64::new(0.0, 0.0))
        );
        assert_eq!(ValueKind::Array(ScalarKind::Float).zero(), Value::Array(vec![]));
    }

    #[test]
    fn test_coercion() {
        assert_eq!(
            Value::Int(2).coerce_to(ValueKind::Scalar(ScalarKind::Float)),
            Value::Float(2.0)
        );
        assert_eq!(
            Value::Float(1.5).coerce_to(ValueKind::Scalar(ScalarKind::Complex)),
            Value::Complex(Complex64::new(1.5, 0.0))
        );
        assert_eq!(
            Value::Bool(true).coerce_to(ValueKind::Scalar(ScalarKind::Text)),
            Value::Text("true".into())
        );
    }

    #[test]
    fn test_serde_untagged_round_trip() {
        for v in [
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(2.5),
            Value::Complex(Complex64::new(1.0, -2.0)),
            Value::Text("hello".into()),
            Value::from(vec![1i64, 2, 3]),
        ] {
            let json = serde_json::to_string(&v).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_integers_stay_integers_through_serde() {
        let back: Value = serde_json::from_str("42").unwrap();
        assert_eq!(back, Value::Int(42));
        let back: Value = serde_json::from_str("42.5").unwrap();
        assert_eq!(back, Value::Float(42.5));
    }
}
