//! Fiat Ledger Aggregator
//!
//! Rolling sums and counts of a customer's historical cash-in volume.
//! Window starts are UTC instants (callers compute them on the business
//! calendar) and are exclusive: a row counts when `created > start`.
//!
//! A row contributes only when it carries fiat, has no error (cancelled rows
//! always carry one) and is not expired.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::cash_in::types::CashInTransaction;
use crate::core_types::CustomerId;
use crate::store::StoreError;

#[async_trait]
pub trait FiatLedger: Send + Sync {
    /// Decimal sum of `fiat` over counted rows created after `start`
    async fn sum_fiat_since(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
    ) -> Result<Decimal, StoreError>;

    /// Number of counted rows created after `start`
    async fn count_since(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
}

/// In-process rendition of the ledger row filter
pub fn counts_toward_volume(
    tx: &CashInTransaction,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    pending_interval: Duration,
) -> bool {
    tx.created > start
        && !tx.fiat.is_zero()
        && tx.error.is_none()
        && !tx.is_expired(now, pending_interval)
}
