use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Pending result cancelled: {0}")]
    Cancelled(String),

    #[error("Result set is locked: {0}")]
    ResultSetLocked(String),

    #[error("Notebook is locked: {0}")]
    NotebookLocked(String),

    #[error("Unknown pending result: {0}")]
    PendingResult(String),

    #[error("Record structure incompatible with result set: {0}")]
    ResultsStructure(String),

    #[error("Unsupported notebook format version: {0}")]
    NotebookVersion(String),

    #[error("Design cannot enumerate parameter space: {0}")]
    Design(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
