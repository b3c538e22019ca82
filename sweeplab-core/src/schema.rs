//! Inferred result-set schemas.
//!
//! A schema is an explicit ordered vector of `(name, kind)` pairs. Fields
//! are added as first observed and widened in place on later observations
//! under the promotion lattice in [`crate::value`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::value::{Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub kind: ValueKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new() -> Self {
        Schema { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn kind_of(&self, name: &str) -> Option<ValueKind> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.kind)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaField> {
        self.fields.iter()
    }

    /// Observe one named value, inferring its kind and widening the schema
    /// where needed. Returns true when the schema changed, either because
    /// the field is new or because an existing field's kind was promoted.
    pub fn observe(&mut self, name: &str, value: &Value) -> Result<bool> {
        let observed = value.kind()?;
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => {
                let widened = field.kind.unify(observed);
                if widened != field.kind {
                    field.kind = widened;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => {
                self.fields.push(SchemaField {
                    name: name.to_string(),
                    kind: observed,
                });
                Ok(true)
            }
        }
    }

    /// Observe every field of a named-value sequence.
    pub fn observe_all<'a, I>(&mut self, fields: I) -> Result<bool>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut changed = false;
        for (name, value) in fields {
            changed |= self.observe(name, value)?;
        }
        Ok(changed)
    }

    /// Project a value map onto this schema: fields missing from the map
    /// are filled with the kind's zero value, and present values are
    /// coerced up to the promoted field kind.
    pub fn conform(&self, values: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for field in &self.fields {
            let value = match values.get(&field.name) {
                Some(v) => v.coerce_to(field.kind),
                None => field.kind.zero(),
            };
            out.insert(field.name.clone(), value);
        }
        // Values for fields the schema has not seen pass through untouched;
        // the caller's observe step makes this unreachable in practice.
        for (name, value) in values {
            out.entry(name.clone()).or_insert_with(|| value.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_observation_sets_kind() {
        let mut schema = Schema::new();
        assert!(schema.observe("x", &Value::Int(1)).unwrap());
        assert_eq!(schema.kind_of("x"), Some(ValueKind::Scalar(ScalarKind::Int)));
    }

    #[test]
    fn test_promotion_is_flagged() {
        let mut schema = Schema::new();
        schema.observe("x", &Value::Int(1)).unwrap();
        assert!(!schema.observe("x", &Value::Int(2)).unwrap());
        assert!(schema.observe("x", &Value::Float(2.5)).unwrap());
        assert_eq!(
            schema.kind_of("x"),
            Some(ValueKind::Scalar(ScalarKind::Float))
        );
    }

    #[test]
    fn test_disjoint_kinds_promote_to_text() {
        let mut schema = Schema::new();
        schema.observe("x", &Value::Bool(true)).unwrap();
        schema.observe("x", &Value::Int(3)).unwrap();
        assert_eq!(
            schema.kind_of("x"),
            Some(ValueKind::Scalar(ScalarKind::Text))
        );
    }

    #[test]
    fn test_conform_backfills_zero() {
        let mut schema = Schema::new();
        schema.observe("x", &Value::Int(1)).unwrap();
        schema.observe("y", &Value::Float(1.0)).unwrap();

        let mut partial = BTreeMap::new();
        partial.insert("x".to_string(), Value::Int(5));
        let full = schema.conform(&partial);
        assert_eq!(full["x"], Value::Int(5));
        assert_eq!(full["y"], Value::Float(0.0));
    }

    #[test]
    fn test_conform_coerces_promoted_fields() {
        let mut schema = Schema::new();
        schema.observe("x", &Value::Int(1)).unwrap();
        schema.observe("x", &Value::Float(0.5)).unwrap();

        let mut values = BTreeMap::new();
        values.insert("x".to_string(), Value::Int(2));
        assert_eq!(schema.conform(&values)["x"], Value::Float(2.0));
    }

    #[test]
    fn test_field_order_is_first_observation_order() {
        let mut schema = Schema::new();
        schema.observe("zeta", &Value::Int(1)).unwrap();
        schema.observe("alpha", &Value::Int(1)).unwrap();
        let names: Vec<&str> = schema.names().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }
}
