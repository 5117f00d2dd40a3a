//! Risk-control error types

use thiserror::Error;

use super::limits::Role;
use crate::adapters::CollaboratorError;
use crate::core_types::CustomerId;
use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum RiskError {
    /// No role-default row and no configured policy floor
    #[error("No default limits configured for role {0}")]
    MissingRoleDefault(Role),

    #[error("Customer not found: {0}")]
    CustomerNotFound(CustomerId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl RiskError {
    pub fn code(&self) -> &'static str {
        match self {
            RiskError::MissingRoleDefault(_) => "MISSING_ROLE_DEFAULT",
            RiskError::CustomerNotFound(_) => "CUSTOMER_NOT_FOUND",
            RiskError::Store(e) => e.code(),
            RiskError::Collaborator(_) => "COLLABORATOR_ERROR",
        }
    }
}

impl From<sqlx::Error> for RiskError {
    fn from(e: sqlx::Error) -> Self {
        RiskError::Store(e.into())
    }
}
