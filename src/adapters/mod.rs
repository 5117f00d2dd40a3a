//! Collaborator Adapters
//!
//! Contracts for the external services the core drives: the exchange /
//! wallet plugin, the notification transport, the invoice provider and the
//! customer directory. Implementations live outside this crate; the core
//! only holds them as `Arc<dyn Trait>`.
//!
//! Every call is a potential suspension point and may fail. Only the
//! exchange's `send_coins` result feeds the state machine directly; all
//! other failures are logged by the caller and never abort a transaction.

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cash_in::types::{Bill, CashInTransaction, SendRecord, SendResult};
use crate::core_types::{CustomerId, DeviceId, TxId};

/// Failure reported by a collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Transport-level failure (timeout, connection refused...)
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    /// The collaborator answered and refused the request
    #[error("{service} rejected request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },

    #[error("Customer not found: {0}")]
    CustomerNotFound(CustomerId),
}

/// Chain-analysis verdict for a destination address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletScore {
    pub score: i32,
    pub is_valid: bool,
}

/// Exchange / wallet plugin
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    /// Register the purchase backing one accepted bill
    async fn buy(&self, bill: &Bill, tx: &CashInTransaction) -> Result<(), CollaboratorError>;

    /// Send the coins for a transaction.
    ///
    /// Implementations classify failures: `Rejected` only when funds are
    /// guaranteed not to have left the wallet, `Indeterminate` otherwise.
    async fn send_coins(&self, tx: &CashInTransaction) -> SendResult;

    /// Operator toggle for wallet scoring
    async fn is_wallet_scoring_enabled(
        &self,
        tx: &CashInTransaction,
    ) -> Result<bool, CollaboratorError>;

    async fn rate_address(
        &self,
        crypto_code: &str,
        address: &str,
    ) -> Result<WalletScore, CollaboratorError>;
}

/// Compliance event pushed to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComplianceAction {
    Blocked,
    Suspended,
    PendingCompliance,
}

impl ComplianceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceAction::Blocked => "BLOCKED",
            ComplianceAction::Suspended => "SUSPENDED",
            ComplianceAction::PendingCompliance => "PENDING_COMPLIANCE",
        }
    }
}

/// Notification transport (SMS / e-mail / webhook fan-out is the implementor's job)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_operator(
        &self,
        tx: &CashInTransaction,
        record: &SendRecord,
    ) -> Result<(), CollaboratorError>;

    /// A destination hit the blacklist or was reused
    async fn notify_blacklisted(
        &self,
        tx: &CashInTransaction,
        is_address_reuse: bool,
    ) -> Result<(), CollaboratorError>;

    async fn compliance_notify(
        &self,
        customer: &Customer,
        device_id: DeviceId,
        action: ComplianceAction,
        period_days: Option<u32>,
    ) -> Result<(), CollaboratorError>;
}

/// Invoice returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedInvoice {
    pub invoice_no: String,
    pub invoice_date: Option<NaiveDate>,
    pub random_number: String,
    /// Provider response as received
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait InvoiceIssuer: Send + Sync {
    async fn issue_invoice(
        &self,
        tx_id: TxId,
        customer_id: CustomerId,
        email: Option<&str>,
        amount: Decimal,
    ) -> Result<IssuedInvoice, CollaboratorError>;
}

/// Operator override on a customer's authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizedOverride {
    Automatic,
    Verified,
    Blocked,
}

/// Customer as seen by the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub suspended_until: Option<DateTime<Utc>>,
    pub authorized_override: Option<AuthorizedOverride>,
    /// CIB caution-list expiry as a Minguo date (`YYYMMDD`)
    pub cib_expire_date: Option<u32>,
}

/// Partial update applied through the directory
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustomerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_override: Option<AuthorizedOverride>,
}

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn get_by_id(&self, id: CustomerId) -> Result<Option<Customer>, CollaboratorError>;

    async fn update(
        &self,
        id: CustomerId,
        patch: CustomerPatch,
    ) -> Result<Customer, CollaboratorError>;
}
