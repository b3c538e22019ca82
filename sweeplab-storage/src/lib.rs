//! Persistence for sweeplab notebooks: the notebook container itself, a
//! portable JSON backend, and a columnar Parquet backend for large data.

pub mod columnar;
pub mod json;
pub mod notebook;

pub use columnar::{ColumnarBackend, IntWidth};
pub use json::JsonBackend;
pub use notebook::{
    Notebook, NotebookBackend, StoredNotebook, DEFAULT_TAG, FORMAT_VERSION,
};
