//! Store error type shared by every persistence contract

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// A row expected to exist is missing
    #[error("Row not found: {0}")]
    RowNotFound(String),

    /// A row could not be decoded into a domain value
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::RowNotFound(_) => "ROW_NOT_FOUND",
            StoreError::Corrupt(_) => "CORRUPT_ROW",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
