use std::path::PathBuf;

use crate::extract::ExtractionError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("full-text index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("indexing run was cancelled")]
    Cancelled,

    #[error("index run failed: {0}")]
    IndexFailed(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether this error comes from the persistent store (records or
    /// full-text index) rather than from configuration or a source file.
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Redb(_)
                | Error::RedbDatabase(_)
                | Error::RedbStorage(_)
                | Error::RedbTransaction(_)
                | Error::RedbTable(_)
                | Error::RedbCommit(_)
                | Error::Tantivy(_)
                | Error::Serialization(_)
        )
    }
}
