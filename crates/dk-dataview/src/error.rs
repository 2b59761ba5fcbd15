use dk_core::TxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataViewError {
    #[error("Row not found: {0}")]
    RowNotFound(String),
    #[error("Row {0} has not been created on the server yet")]
    TemporaryRow(String),
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),
    #[error("Invalid value for filter {0}")]
    InvalidFilterValue(String),
    #[error("Commit failed: {0}")]
    CommitFailed(String),
    #[error("Request failed: {0:#}")]
    Client(#[from] anyhow::Error),
    #[error(transparent)]
    Transaction(#[from] TxError),
}

pub type Result<T> = std::result::Result<T, DataViewError>;
