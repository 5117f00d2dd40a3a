//! Cash-in persistence contract
//!
//! Every mutating method is a single isolated operation against the store.
//! Conditional updates report whether their predicate matched so callers
//! can tell a lost race from success.

use async_trait::async_trait;
use chrono::Duration;

use super::types::{CashInAction, CashInTransaction, MachineTx, MergeResult, SendRecord};
use crate::address::RejectReason;
use crate::core_types::TxId;
use crate::store::StoreError;

#[async_trait]
pub trait CashInStore: Send + Sync {
    /// Create or lock the row, append unseen bills, recompute `fiat` and OR in `send`.
    ///
    /// Concurrent merges for the same id serialize. The merge that finds the
    /// gates open takes the claim and reports it in `gates_claimed`.
    async fn merge(&self, machine_tx: &MachineTx) -> Result<MergeResult, StoreError>;

    async fn get(&self, id: TxId) -> Result<Option<CashInTransaction>, StoreError>;

    /// Terminal compliance rejection (`operator_completed`, error, error code).
    ///
    /// Applies only while the gates are claimed and nothing was sent or
    /// closed; `None` when the predicate matched nothing.
    async fn complete_with_rejection(
        &self,
        id: TxId,
        reason: RejectReason,
        wallet_score: Option<i32>,
    ) -> Result<Option<CashInTransaction>, StoreError>;

    /// Record that the address gates passed; `None` if the row was closed meanwhile
    async fn mark_compliance_cleared(
        &self,
        id: TxId,
        wallet_score: Option<i32>,
    ) -> Result<Option<CashInTransaction>, StoreError>;

    /// Drop an unfinished gates claim so a later post runs the gates again
    async fn release_gates(&self, id: TxId) -> Result<(), StoreError>;

    /// Set `send_pending` iff the row is clear to send; `None` when the claim lost
    async fn claim_send(
        &self,
        id: TxId,
        pending_interval: Duration,
    ) -> Result<Option<CashInTransaction>, StoreError>;

    /// Write back the outcome of a claimed send
    async fn record_send(
        &self,
        id: TxId,
        record: &SendRecord,
    ) -> Result<CashInTransaction, StoreError>;

    /// Unsent, unclaimed, open rows created within `pending_interval`, oldest first
    async fn find_pending(
        &self,
        pending_interval: Duration,
        limit: usize,
    ) -> Result<Vec<CashInTransaction>, StoreError>;

    /// Operator cancel; `false` when nothing matched
    async fn cancel(&self, id: TxId) -> Result<bool, StoreError>;

    async fn log_action(&self, action: &CashInAction) -> Result<(), StoreError>;
}
