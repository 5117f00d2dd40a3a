//! Cash-in error types

use thiserror::Error;

use crate::core_types::TxId;
use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum CashInError {
    /// Missing row, or the update predicate matched nothing
    #[error("Transaction not found: {0}")]
    NotFound(TxId),

    /// A concurrent operator action closed the row first
    #[error("Transaction changed concurrently: {0}")]
    LostRace(TxId),

    #[error("Invalid machine transaction: {0}")]
    InvalidMachineTx(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CashInError {
    pub fn code(&self) -> &'static str {
        match self {
            CashInError::NotFound(_) => "NOT_FOUND",
            CashInError::LostRace(_) => "LOST_RACE",
            CashInError::InvalidMachineTx(_) => "INVALID_MACHINE_TX",
            CashInError::Store(e) => e.code(),
        }
    }

    /// HTTP status suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            CashInError::NotFound(_) => 404,
            CashInError::LostRace(_) => 409,
            CashInError::InvalidMachineTx(_) => 400,
            CashInError::Store(_) => 500,
        }
    }
}

impl From<sqlx::Error> for CashInError {
    fn from(e: sqlx::Error) -> Self {
        CashInError::Store(e.into())
    }
}
