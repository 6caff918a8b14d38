use datafusion::parquet::errors::ParquetError;
use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use thiserror::Error;

/// Coarse classification handed back to the host adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The trigger event itself could not be understood.
    Event,
    /// The object could not be downloaded.
    Fetch,
    /// The file content did not have the expected shape.
    Parse,
    /// A delete or append against the warehouse failed.
    Merge,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet: {0}")]
    Parquet(#[from] ParquetError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object store responded with error: {0}")]
    FetchFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("Object name '{name}' is not of the form dataset/account/.../table.ext")]
    InvalidObjectName { name: String },

    #[error("Object gs://{bucket}/{name} not found")]
    ObjectNotFound { bucket: String, name: String },

    #[error("Malformed JSON export: {message}")]
    MalformedJson { message: String },

    #[error("File contains no header row")]
    EmptyFile,

    #[error("Malformed CSV export: {message}")]
    MalformedCsv { message: String },

    #[error("Column '{column}' is missing")]
    MissingColumn { column: String },

    #[error("No {field} values to derive a range from for table {table}")]
    EmptyPartitionRange { table: String, field: String },

    #[error("Batch for table {table} has no account_api_id")]
    MissingAccountId { table: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidObjectName { .. } => ErrorKind::Event,
            Error::FetchFailure(_) | Error::UrlParsingFailed(_) | Error::ObjectNotFound { .. } => {
                ErrorKind::Fetch
            }
            Error::Csv(_)
            | Error::Json(_)
            | Error::MalformedJson { .. }
            | Error::MalformedCsv { .. }
            | Error::EmptyFile
            | Error::MissingColumn { .. } => ErrorKind::Parse,
            Error::DataFusion(_)
            | Error::Arrow(_)
            | Error::Parquet(_)
            | Error::Io(_)
            | Error::EmptyPartitionRange { .. }
            | Error::MissingAccountId { .. } => ErrorKind::Merge,
        }
    }
}
