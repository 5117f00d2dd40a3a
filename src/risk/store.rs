//! Risk-control persistence contract

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use super::limits::{CustomerLimitSetting, LimitTable, Role};
use crate::core_types::{CustomerId, TxId};
use crate::store::StoreError;

/// Change-log actor id for automatic (non-operator) changes
pub const SYSTEM_OPERATOR_ID: i64 = -1;
/// Change-log operation type for an update
pub const OPERATION_UPDATE: i16 = 2;
pub const LIMIT_SETTINGS_TABLE: &str = "btm_risk_control_customer_limit_settings";

/// Immutable before/after audit record of a limit setting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeLogEntry {
    pub customer_id: CustomerId,
    pub operation_user_id: i64,
    pub table_name: &'static str,
    pub operation_type: i16,
    pub before_value: serde_json::Value,
    pub after_value: serde_json::Value,
}

impl ChangeLogEntry {
    /// System-initiated update of a limit setting
    pub fn limit_update(
        before: &CustomerLimitSetting,
        after: &CustomerLimitSetting,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            customer_id: after.customer_id,
            operation_user_id: SYSTEM_OPERATOR_ID,
            table_name: LIMIT_SETTINGS_TABLE,
            operation_type: OPERATION_UPDATE,
            before_value: serde_json::to_value(before)?,
            after_value: serde_json::to_value(after)?,
        })
    }
}

/// Issued invoice, or the provider's error payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceRecord {
    pub customer_id: CustomerId,
    pub tx_id: TxId,
    pub invoice_no: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub random_number: Option<String>,
    pub raw_resp: serde_json::Value,
}

/// Snapshot of one risk assessment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationLog {
    pub customer_id: CustomerId,
    pub tx_id: TxId,
    pub daily_sum: Decimal,
    pub monthly_sum: Decimal,
    /// Effective limits and window starts used
    pub limit_config: serde_json::Value,
}

#[async_trait]
pub trait RiskStore: Send + Sync {
    async fn get_limit_setting(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<CustomerLimitSetting>, StoreError>;

    /// Insert `setting` unless a row exists; returns the stored row either way
    async fn create_limit_setting(
        &self,
        setting: &CustomerLimitSetting,
    ) -> Result<CustomerLimitSetting, StoreError>;

    /// Move the customer to the Blacklist role tagged with `edd_type`.
    ///
    /// Only the role and EDD columns are written. The before-image is read
    /// under the same row lock, so other columns keep whatever an operator
    /// last wrote. Returns `(before, after)`.
    async fn escalate_to_edd(
        &self,
        customer_id: CustomerId,
        edd_type: &str,
    ) -> Result<(CustomerLimitSetting, CustomerLimitSetting), StoreError>;

    async fn fetch_default_limit(&self, role: Role) -> Result<Option<LimitTable>, StoreError>;

    async fn insert_change_log(&self, entry: &ChangeLogEntry) -> Result<(), StoreError>;

    async fn record_invoice(&self, record: &InvoiceRecord) -> Result<(), StoreError>;

    async fn record_evaluation(&self, log: &EvaluationLog) -> Result<(), StoreError>;
}
