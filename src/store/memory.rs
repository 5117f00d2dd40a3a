//! In-process store
//!
//! A single mutex guards all state, so every operation is serialized and
//! trivially atomic. Used by tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::StoreError;
use crate::address::{AddressPolicyStore, BlacklistEntry, RejectReason, WhitelistEntry};
use crate::cash_in::state::default_pending_interval;
use crate::cash_in::store::CashInStore;
use crate::cash_in::types::{
    Bill, CashInAction, CashInTransaction, MachineTx, MergeResult, OPERATOR_CANCEL_CODE,
    OPERATOR_CANCEL_ERROR, SendRecord,
};
use crate::clock::Clock;
use crate::core_types::{CustomerId, TxId};
use crate::ledger::{FiatLedger, counts_toward_volume};
use crate::risk::limits::{CustomerLimitSetting, LimitTable, Role};
use crate::risk::store::{ChangeLogEntry, EvaluationLog, InvoiceRecord, RiskStore};

#[derive(Default)]
struct State {
    txs: HashMap<TxId, CashInTransaction>,
    bills: HashMap<TxId, Vec<Bill>>,
    bill_ids: HashSet<Uuid>,
    actions: Vec<CashInAction>,
    blacklist: Vec<BlacklistEntry>,
    whitelist: Vec<WhitelistEntry>,
    settings: HashMap<CustomerId, CustomerLimitSetting>,
    role_defaults: HashMap<Role, LimitTable>,
    change_logs: Vec<ChangeLogEntry>,
    invoices: Vec<InvoiceRecord>,
    evaluations: Vec<EvaluationLog>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    pending_interval: Duration,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            pending_interval: default_pending_interval(),
        }
    }

    /// Expiry horizon used by the ledger filter
    pub fn with_pending_interval(mut self, pending_interval: Duration) -> Self {
        self.pending_interval = pending_interval;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // === Seeding / inspection ===

    /// Insert or replace a transaction row as-is
    pub fn insert_tx(&self, tx: CashInTransaction) {
        self.state().txs.insert(tx.id, tx);
    }

    pub fn tx(&self, id: TxId) -> Option<CashInTransaction> {
        self.state().txs.get(&id).cloned()
    }

    pub fn bills(&self, id: TxId) -> Vec<Bill> {
        self.state().bills.get(&id).cloned().unwrap_or_default()
    }

    pub fn actions(&self, id: TxId) -> Vec<CashInAction> {
        self.state()
            .actions
            .iter()
            .filter(|a| a.tx_id == id)
            .cloned()
            .collect()
    }

    pub fn add_blacklist(&self, entry: BlacklistEntry) {
        self.state().blacklist.push(entry);
    }

    pub fn add_whitelist(&self, entry: WhitelistEntry) {
        self.state().whitelist.push(entry);
    }

    pub fn set_role_default(&self, role: Role, table: LimitTable) {
        self.state().role_defaults.insert(role, table);
    }

    pub fn put_limit_setting(&self, setting: CustomerLimitSetting) {
        self.state().settings.insert(setting.customer_id, setting);
    }

    pub fn limit_setting(&self, customer_id: CustomerId) -> Option<CustomerLimitSetting> {
        self.state().settings.get(&customer_id).cloned()
    }

    pub fn change_logs(&self) -> Vec<ChangeLogEntry> {
        self.state().change_logs.clone()
    }

    pub fn invoices(&self) -> Vec<InvoiceRecord> {
        self.state().invoices.clone()
    }

    pub fn evaluation_logs(&self) -> Vec<EvaluationLog> {
        self.state().evaluations.clone()
    }

    fn update_tx<F>(&self, id: TxId, f: F) -> Result<CashInTransaction, StoreError>
    where
        F: FnOnce(&mut CashInTransaction),
    {
        let mut state = self.state();
        let tx = state
            .txs
            .get_mut(&id)
            .ok_or_else(|| StoreError::RowNotFound(format!("cash_in_txs {id}")))?;
        f(tx);
        Ok(tx.clone())
    }
}

#[async_trait]
impl CashInStore for MemoryStore {
    async fn merge(&self, machine_tx: &MachineTx) -> Result<MergeResult, StoreError> {
        let now = self.now();
        let mut state = self.state();
        let State {
            txs,
            bills,
            bill_ids,
            ..
        } = &mut *state;

        let tx = txs
            .entry(machine_tx.id)
            .or_insert_with(|| CashInTransaction::from_machine_tx(machine_tx, now));
        let gates_claimed = tx.gates_open();
        tx.gates_claimed |= gates_claimed;

        let recorded = bills.entry(machine_tx.id).or_default();
        let mut new_bills = Vec::new();
        for bill in &machine_tx.bills {
            if bill_ids.insert(bill.id) {
                recorded.push(bill.clone());
                new_bills.push(bill.clone());
            }
        }

        tx.fiat = recorded.iter().map(|b| b.fiat).sum();
        tx.crypto_atoms = recorded.iter().map(|b| b.crypto_atoms).sum();
        tx.send |= machine_tx.send;

        Ok(MergeResult {
            tx: tx.clone(),
            new_bills,
            gates_claimed,
        })
    }

    async fn get(&self, id: TxId) -> Result<Option<CashInTransaction>, StoreError> {
        Ok(self.tx(id))
    }

    async fn complete_with_rejection(
        &self,
        id: TxId,
        reason: RejectReason,
        wallet_score: Option<i32>,
    ) -> Result<Option<CashInTransaction>, StoreError> {
        let mut state = self.state();
        Ok(match state.txs.get_mut(&id) {
            Some(tx)
                if tx.gates_claimed
                    && !tx.compliance_cleared
                    && !tx.send_confirmed
                    && !tx.send_pending
                    && !tx.operator_completed =>
            {
                tx.operator_completed = true;
                tx.error = Some(reason.message().to_string());
                tx.error_code = Some(reason.code().to_string());
                tx.wallet_score = wallet_score;
                Some(tx.clone())
            }
            _ => None,
        })
    }

    async fn mark_compliance_cleared(
        &self,
        id: TxId,
        wallet_score: Option<i32>,
    ) -> Result<Option<CashInTransaction>, StoreError> {
        let mut state = self.state();
        Ok(match state.txs.get_mut(&id) {
            Some(tx) if tx.gates_claimed && !tx.operator_completed && tx.error.is_none() => {
                tx.compliance_cleared = true;
                tx.wallet_score = wallet_score;
                Some(tx.clone())
            }
            _ => None,
        })
    }

    async fn release_gates(&self, id: TxId) -> Result<(), StoreError> {
        if let Some(tx) = self.state().txs.get_mut(&id)
            && !tx.compliance_cleared
            && !tx.operator_completed
        {
            tx.gates_claimed = false;
        }
        Ok(())
    }

    async fn claim_send(
        &self,
        id: TxId,
        pending_interval: Duration,
    ) -> Result<Option<CashInTransaction>, StoreError> {
        let now = self.now();
        let mut state = self.state();
        Ok(match state.txs.get_mut(&id) {
            Some(tx) if tx.is_clear_to_send(now, pending_interval) => {
                tx.send_pending = true;
                tx.send_time = Some(now);
                Some(tx.clone())
            }
            _ => None,
        })
    }

    async fn record_send(
        &self,
        id: TxId,
        record: &SendRecord,
    ) -> Result<CashInTransaction, StoreError> {
        let now = self.now();
        self.update_tx(id, |tx| {
            tx.send_confirmed = record.send_confirmed;
            tx.send_pending = record.send_pending;
            tx.batched = record.batched;
            tx.tx_hash = record.tx_hash.clone();
            tx.fee = record.fee;
            tx.error = record.error.clone();
            tx.error_code = record.error_code.clone();
            if record.send_confirmed {
                tx.confirmed_at = Some(now);
            }
        })
    }

    async fn find_pending(
        &self,
        pending_interval: Duration,
        limit: usize,
    ) -> Result<Vec<CashInTransaction>, StoreError> {
        let horizon = self.now() - pending_interval;
        let mut rows: Vec<_> = self
            .state()
            .txs
            .values()
            .filter(|tx| {
                tx.send
                    && !tx.send_confirmed
                    && !tx.send_pending
                    && !tx.operator_completed
                    && tx.error.is_none()
                    && tx.created > horizon
            })
            .cloned()
            .collect();
        rows.sort_by_key(|tx| tx.created);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn cancel(&self, id: TxId) -> Result<bool, StoreError> {
        let mut state = self.state();
        let Some(tx) = state.txs.get_mut(&id) else {
            return Ok(false);
        };
        let already_cancelled =
            tx.operator_completed && tx.error.as_deref() == Some(OPERATOR_CANCEL_ERROR);
        if tx.send_confirmed || already_cancelled {
            return Ok(false);
        }
        tx.operator_completed = true;
        tx.error = Some(OPERATOR_CANCEL_ERROR.to_string());
        tx.error_code = Some(OPERATOR_CANCEL_CODE.to_string());
        tx.batched = false;
        Ok(true)
    }

    async fn log_action(&self, action: &CashInAction) -> Result<(), StoreError> {
        self.state().actions.push(action.clone());
        Ok(())
    }
}

#[async_trait]
impl AddressPolicyStore for MemoryStore {
    async fn blacklisted(
        &self,
        address: &str,
        crypto_code: &str,
    ) -> Result<Option<BlacklistEntry>, StoreError> {
        Ok(self
            .state()
            .blacklist
            .iter()
            .find(|e| e.address == address && e.crypto_code == crypto_code)
            .cloned())
    }

    async fn whitelisted(
        &self,
        customer_id: CustomerId,
        address: &str,
        crypto_code: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .state()
            .whitelist
            .iter()
            .any(|e| e.matches(customer_id, address, crypto_code)))
    }

    async fn address_reused(&self, tx_id: TxId, address: &str) -> Result<bool, StoreError> {
        Ok(self
            .state()
            .txs
            .values()
            .any(|tx| tx.id != tx_id && tx.to_address == address))
    }
}

#[async_trait]
impl FiatLedger for MemoryStore {
    async fn sum_fiat_since(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
    ) -> Result<Decimal, StoreError> {
        let now = self.now();
        Ok(self
            .state()
            .txs
            .values()
            .filter(|tx| tx.customer_id == customer_id)
            .filter(|tx| counts_toward_volume(tx, start, now, self.pending_interval))
            .map(|tx| tx.fiat)
            .sum())
    }

    async fn count_since(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let now = self.now();
        let count = self
            .state()
            .txs
            .values()
            .filter(|tx| tx.customer_id == customer_id)
            .filter(|tx| counts_toward_volume(tx, start, now, self.pending_interval))
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl RiskStore for MemoryStore {
    async fn get_limit_setting(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<CustomerLimitSetting>, StoreError> {
        Ok(self.limit_setting(customer_id))
    }

    async fn create_limit_setting(
        &self,
        setting: &CustomerLimitSetting,
    ) -> Result<CustomerLimitSetting, StoreError> {
        Ok(self
            .state()
            .settings
            .entry(setting.customer_id)
            .or_insert_with(|| setting.clone())
            .clone())
    }

    async fn escalate_to_edd(
        &self,
        customer_id: CustomerId,
        edd_type: &str,
    ) -> Result<(CustomerLimitSetting, CustomerLimitSetting), StoreError> {
        let mut state = self.state();
        let row = state
            .settings
            .get_mut(&customer_id)
            .ok_or_else(|| StoreError::RowNotFound(format!("limit setting {customer_id}")))?;
        let before = row.clone();
        row.role = Role::Blacklist;
        row.is_edd = true;
        row.edd_type = Some(edd_type.to_string());
        Ok((before, row.clone()))
    }

    async fn fetch_default_limit(&self, role: Role) -> Result<Option<LimitTable>, StoreError> {
        Ok(self.state().role_defaults.get(&role).copied())
    }

    async fn insert_change_log(&self, entry: &ChangeLogEntry) -> Result<(), StoreError> {
        self.state().change_logs.push(entry.clone());
        Ok(())
    }

    async fn record_invoice(&self, record: &InvoiceRecord) -> Result<(), StoreError> {
        self.state().invoices.push(record.clone());
        Ok(())
    }

    async fn record_evaluation(&self, log: &EvaluationLog) -> Result<(), StoreError> {
        self.state().evaluations.push(log.clone());
        Ok(())
    }
}
