//! Core types for sweeplab: typed values and schemas, result records and
//! sets, the experiment lifecycle, combinators, and designs.

pub mod combinator;
pub mod design;
pub mod error;
pub mod experiment;
pub mod record;
pub mod resultset;
pub mod schema;
pub mod value;

pub use combinator::{Repeat, Summarise};
pub use design::{linspace, Design, Factorial, ParameterRange, Pointwise, RangeMap};
pub use error::{Error, Result};
pub use experiment::{Experiment, Harness, Produced};
pub use record::{
    JobId, Metadata, Parameters, PendingRecord, ResultRecord, Results, FIXED_METADATA,
};
pub use resultset::ResultSet;
pub use schema::{Schema, SchemaField};
pub use value::{ScalarKind, Value, ValueKind};
