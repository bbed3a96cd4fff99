use diesel::result::DatabaseErrorKind;
use diesel_async::pooled_connection::deadpool::PoolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Dataset not found: {dataset_id}")]
    DatasetNotFound { dataset_id: String },

    #[error("Invalid dataset id {value:?}: expected four alphanumerics, a dash and four alphanumerics")]
    InvalidDatasetId { value: String },

    #[error("Unsupported asset for dataset {dataset_id}: {message}")]
    UnsupportedAsset { dataset_id: String, message: String },

    #[error("{field} should be {expected} type -- got {actual} instead")]
    TypeCoercion {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("The field \"{field}\" is too long")]
    ColumnNameTooLong { field: String },

    #[error("Download of {url} exceeded {limit} bytes")]
    DownloadTooLarge { url: String, limit: u64 },

    #[error("Malformed upstream data: {message}")]
    Parse { message: String },

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {message}")]
    Pool { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PipelineError {
    /// Returns `true` if the error means the store itself is unusable.
    ///
    /// Fatal errors stop a worker loop. Everything else is a per-dataset
    /// failure that gets charged against the queue entry's retry counter.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Pool { .. } | PipelineError::Migration { .. } => true,
            PipelineError::Database(err) => matches!(
                err,
                diesel::result::Error::BrokenTransactionManager
                    | diesel::result::Error::AlreadyInTransaction
                    | diesel::result::Error::DatabaseError(DatabaseErrorKind::ClosedConnection, _)
            ),
            _ => false,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io {
            message: err.to_string(),
        }
    }
}

impl From<PoolError> for PipelineError {
    fn from(err: PoolError) -> Self {
        PipelineError::Pool {
            message: format!("Failed to get database connection: {}", err),
        }
    }
}
