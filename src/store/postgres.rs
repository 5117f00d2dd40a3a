//! PostgreSQL store
//!
//! The merge runs inside one database transaction holding the row lock
//! (`SELECT ... FOR UPDATE`). Every other mutation is a single conditional
//! `UPDATE`; `rows_affected()` tells a lost race from success.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::StoreError;
use crate::address::{AddressPolicyStore, BlacklistEntry, RejectReason};
use crate::cash_in::state::default_pending_interval;
use crate::cash_in::store::CashInStore;
use crate::cash_in::types::{
    CashInAction, CashInTransaction, MachineTx, MergeResult, OPERATOR_CANCEL_CODE,
    OPERATOR_CANCEL_ERROR, SendRecord,
};
use crate::clock::Clock;
use crate::core_types::{CustomerId, DeviceId, TxId};
use crate::ledger::FiatLedger;
use crate::risk::limits::{CustomerLimitSetting, LimitTable, Role};
use crate::risk::store::{ChangeLogEntry, EvaluationLog, InvoiceRecord, RiskStore};

const TX_COLUMNS: &str = "id, customer_id, device_id, to_address, crypto_code, fiat_code, \
     fiat, crypto_atoms, commission_percentage, send, send_confirmed, send_pending, batched, \
     operator_completed, gates_claimed, compliance_cleared, error, error_code, tx_hash, fee, wallet_score, \
     created, send_time, confirmed_at";

const SETTING_COLUMNS: &str = "customer_id, role, daily_limit, monthly_limit, level1, \
     level1_days, level2, level2_days, last_black_to_normal_at, edd_type, is_edd";

pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    pending_interval: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            pending_interval: default_pending_interval(),
        }
    }

    pub fn with_pending_interval(mut self, pending_interval: Duration) -> Self {
        self.pending_interval = pending_interval;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_tx(row: &PgRow) -> Result<CashInTransaction, StoreError> {
    Ok(CashInTransaction {
        id: TxId::from_uuid(row.try_get("id")?),
        customer_id: CustomerId::from_uuid(row.try_get("customer_id")?),
        device_id: DeviceId::from_uuid(row.try_get("device_id")?),
        to_address: row.try_get("to_address")?,
        crypto_code: row.try_get("crypto_code")?,
        fiat_code: row.try_get("fiat_code")?,
        fiat: row.try_get("fiat")?,
        crypto_atoms: row.try_get("crypto_atoms")?,
        commission_percentage: row.try_get("commission_percentage")?,
        send: row.try_get("send")?,
        send_confirmed: row.try_get("send_confirmed")?,
        send_pending: row.try_get("send_pending")?,
        batched: row.try_get("batched")?,
        operator_completed: row.try_get("operator_completed")?,
        gates_claimed: row.try_get("gates_claimed")?,
        compliance_cleared: row.try_get("compliance_cleared")?,
        error: row.try_get("error")?,
        error_code: row.try_get("error_code")?,
        tx_hash: row.try_get("tx_hash")?,
        fee: row.try_get("fee")?,
        wallet_score: row.try_get("wallet_score")?,
        created: row.try_get("created")?,
        send_time: row.try_get("send_time")?,
        confirmed_at: row.try_get("confirmed_at")?,
    })
}

fn days(row: &PgRow, column: &str) -> Result<Option<u32>, StoreError> {
    let raw: Option<i32> = row.try_get(column)?;
    raw.map(|d| u32::try_from(d).map_err(|_| StoreError::Corrupt(format!("{column} = {d}"))))
        .transpose()
}

fn row_to_setting(row: &PgRow) -> Result<CustomerLimitSetting, StoreError> {
    let role_id: i16 = row.try_get("role")?;
    let role =
        Role::from_id(role_id).ok_or_else(|| StoreError::Corrupt(format!("role {role_id}")))?;
    Ok(CustomerLimitSetting {
        customer_id: CustomerId::from_uuid(row.try_get("customer_id")?),
        role,
        daily_limit: row.try_get("daily_limit")?,
        monthly_limit: row.try_get("monthly_limit")?,
        level1: row.try_get("level1")?,
        level1_days: days(row, "level1_days")?,
        level2: row.try_get("level2")?,
        level2_days: days(row, "level2_days")?,
        last_black_to_normal_at: row.try_get("last_black_to_normal_at")?,
        edd_type: row.try_get("edd_type")?,
        is_edd: row.try_get("is_edd")?,
    })
}

fn row_to_table(row: &PgRow) -> Result<LimitTable, StoreError> {
    let required = |column: &str| -> Result<u32, StoreError> {
        days(row, column)?.ok_or_else(|| StoreError::Corrupt(format!("{column} is null")))
    };
    Ok(LimitTable {
        daily: row.try_get("daily_limit")?,
        monthly: row.try_get("monthly_limit")?,
        level1: row.try_get("level1")?,
        level1_days: required("level1_days")?,
        level2: row.try_get("level2")?,
        level2_days: required("level2_days")?,
    })
}

#[async_trait]
impl CashInStore for PgStore {
    async fn merge(&self, machine_tx: &MachineTx) -> Result<MergeResult, StoreError> {
        let now = self.clock.now();
        let mut db_tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO cash_in_txs
                (id, customer_id, device_id, to_address, crypto_code, fiat_code,
                 commission_percentage, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(machine_tx.id.inner())
        .bind(machine_tx.customer_id.inner())
        .bind(machine_tx.device_id.inner())
        .bind(&machine_tx.to_address)
        .bind(&machine_tx.crypto_code)
        .bind(&machine_tx.fiat_code)
        .bind(machine_tx.commission_percentage)
        .bind(now)
        .execute(&mut *db_tx)
        .await?
        .rows_affected()
            == 1;

        // Lock the row for the rest of the merge
        let locked = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM cash_in_txs WHERE id = $1 FOR UPDATE"
        ))
        .bind(machine_tx.id.inner())
        .fetch_one(&mut *db_tx)
        .await?;
        // Decided under the row lock, so one merge per open row takes the claim
        let gates_claimed = row_to_tx(&locked)?.gates_open();

        let mut new_bills = Vec::new();
        for bill in &machine_tx.bills {
            let added = sqlx::query(
                r#"
                INSERT INTO bills (id, cash_in_txs_id, fiat, fiat_code, crypto_atoms, created)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(bill.id)
            .bind(machine_tx.id.inner())
            .bind(bill.fiat)
            .bind(&bill.fiat_code)
            .bind(bill.crypto_atoms)
            .bind(now)
            .execute(&mut *db_tx)
            .await?
            .rows_affected();
            if added == 1 {
                new_bills.push(bill.clone());
            }
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE cash_in_txs SET
                fiat = COALESCE((SELECT SUM(fiat) FROM bills WHERE cash_in_txs_id = $1), 0),
                crypto_atoms = COALESCE((SELECT SUM(crypto_atoms) FROM bills WHERE cash_in_txs_id = $1), 0),
                send = send OR $2,
                gates_claimed = gates_claimed OR $3
            WHERE id = $1
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(machine_tx.id.inner())
        .bind(machine_tx.send)
        .bind(gates_claimed)
        .fetch_one(&mut *db_tx)
        .await?;
        let tx = row_to_tx(&row)?;

        db_tx.commit().await?;
        debug!(
            tx_id = %tx.id,
            inserted,
            new_bills = new_bills.len(),
            gates_claimed,
            "Cash-in row merged"
        );

        Ok(MergeResult {
            tx,
            new_bills,
            gates_claimed,
        })
    }

    async fn get(&self, id: TxId) -> Result<Option<CashInTransaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TX_COLUMNS} FROM cash_in_txs WHERE id = $1"
        ))
        .bind(id.inner())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_tx).transpose()
    }

    async fn complete_with_rejection(
        &self,
        id: TxId,
        reason: RejectReason,
        wallet_score: Option<i32>,
    ) -> Result<Option<CashInTransaction>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE cash_in_txs
            SET operator_completed = true, error = $2, error_code = $3, wallet_score = $4
            WHERE id = $1
              AND gates_claimed
              AND NOT compliance_cleared
              AND NOT send_confirmed
              AND NOT send_pending
              AND NOT operator_completed
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(id.inner())
        .bind(reason.message())
        .bind(reason.code())
        .bind(wallet_score)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_tx).transpose()
    }

    async fn mark_compliance_cleared(
        &self,
        id: TxId,
        wallet_score: Option<i32>,
    ) -> Result<Option<CashInTransaction>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE cash_in_txs SET compliance_cleared = true, wallet_score = $2
            WHERE id = $1 AND gates_claimed AND NOT operator_completed AND error IS NULL
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(id.inner())
        .bind(wallet_score)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_tx).transpose()
    }

    async fn release_gates(&self, id: TxId) -> Result<(), StoreError> {
        let released = sqlx::query(
            r#"
            UPDATE cash_in_txs SET gates_claimed = false
            WHERE id = $1 AND gates_claimed AND NOT compliance_cleared AND NOT operator_completed
            "#,
        )
        .bind(id.inner())
        .execute(&self.pool)
        .await?
        .rows_affected();
        debug!(tx_id = %id, released, "Gates claim released");
        Ok(())
    }

    async fn claim_send(
        &self,
        id: TxId,
        pending_interval: Duration,
    ) -> Result<Option<CashInTransaction>, StoreError> {
        let now = self.clock.now();
        let row = sqlx::query(&format!(
            r#"
            UPDATE cash_in_txs SET send_pending = true, send_time = $3
            WHERE id = $1
              AND send
              AND compliance_cleared
              AND NOT send_confirmed
              AND NOT send_pending
              AND NOT operator_completed
              AND error IS NULL
              AND created > $2
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(id.inner())
        .bind(now - pending_interval)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_tx).transpose()
    }

    async fn record_send(
        &self,
        id: TxId,
        record: &SendRecord,
    ) -> Result<CashInTransaction, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE cash_in_txs SET
                send_confirmed = $2,
                send_pending = $3,
                batched = $4,
                tx_hash = $5,
                fee = $6,
                error = $7,
                error_code = $8,
                confirmed_at = CASE WHEN $2 THEN $9 ELSE confirmed_at END
            WHERE id = $1
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(id.inner())
        .bind(record.send_confirmed)
        .bind(record.send_pending)
        .bind(record.batched)
        .bind(&record.tx_hash)
        .bind(record.fee)
        .bind(&record.error)
        .bind(&record.error_code)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::RowNotFound(format!("cash_in_txs {id}")))?;
        row_to_tx(&row)
    }

    async fn find_pending(
        &self,
        pending_interval: Duration,
        limit: usize,
    ) -> Result<Vec<CashInTransaction>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TX_COLUMNS} FROM cash_in_txs
            WHERE send
              AND NOT send_confirmed
              AND NOT send_pending
              AND NOT operator_completed
              AND error IS NULL
              AND created > $1
            ORDER BY created ASC
            LIMIT $2
            "#
        ))
        .bind(self.clock.now() - pending_interval)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_tx).collect()
    }

    async fn cancel(&self, id: TxId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cash_in_txs
            SET operator_completed = true, error = $2, error_code = $3, batched = false
            WHERE id = $1
              AND NOT send_confirmed
              AND NOT (operator_completed AND error IS NOT DISTINCT FROM $2)
            "#,
        )
        .bind(id.inner())
        .bind(OPERATOR_CANCEL_ERROR)
        .bind(OPERATOR_CANCEL_CODE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn log_action(&self, action: &CashInAction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cash_in_actions (tx_id, action, error, error_code, tx_hash, created)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(action.tx_id.inner())
        .bind(action.action.as_str())
        .bind(&action.error)
        .bind(&action.error_code)
        .bind(&action.tx_hash)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AddressPolicyStore for PgStore {
    async fn blacklisted(
        &self,
        address: &str,
        crypto_code: &str,
    ) -> Result<Option<BlacklistEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT address, crypto_code, content FROM blacklist WHERE address = $1 AND crypto_code = $2",
        )
        .bind(address)
        .bind(crypto_code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<BlacklistEntry, StoreError> {
            Ok(BlacklistEntry {
                address: row.try_get("address")?,
                crypto_code: row.try_get("crypto_code")?,
                content: row.try_get("content")?,
            })
        })
        .transpose()
    }

    async fn whitelisted(
        &self,
        customer_id: CustomerId,
        address: &str,
        crypto_code: &str,
    ) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM btm_whitelists
                WHERE customer_id = $1
                  AND lower(address) = lower($2)
                  AND crypto_code = $3
                  AND deleted_at IS NULL
            )
            "#,
        )
        .bind(customer_id.inner())
        .bind(address)
        .bind(crypto_code)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn address_reused(&self, tx_id: TxId, address: &str) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM cash_in_txs WHERE id <> $1 AND to_address = $2)",
        )
        .bind(tx_id.inner())
        .bind(address)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

/// Shared filter of the ledger queries: $1 customer, $2 window start, $3 expiry horizon
const LEDGER_FILTER: &str = "customer_id = $1 AND created > $2 AND fiat > 0 \
     AND error IS NULL AND (send_confirmed OR created > $3)";

#[async_trait]
impl FiatLedger for PgStore {
    async fn sum_fiat_since(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
    ) -> Result<Decimal, StoreError> {
        let sum = sqlx::query_scalar::<_, Decimal>(&format!(
            "SELECT COALESCE(SUM(fiat), 0) FROM cash_in_txs WHERE {LEDGER_FILTER}"
        ))
        .bind(customer_id.inner())
        .bind(start)
        .bind(self.clock.now() - self.pending_interval)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn count_since(
        &self,
        customer_id: CustomerId,
        start: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM cash_in_txs WHERE {LEDGER_FILTER}"
        ))
        .bind(customer_id.inner())
        .bind(start)
        .bind(self.clock.now() - self.pending_interval)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn days_param(days: Option<u32>) -> Option<i32> {
    days.map(|d| i32::try_from(d).unwrap_or(i32::MAX))
}

#[async_trait]
impl RiskStore for PgStore {
    async fn get_limit_setting(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<CustomerLimitSetting>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SETTING_COLUMNS} FROM btm_risk_control_customer_limit_settings WHERE customer_id = $1"
        ))
        .bind(customer_id.inner())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_setting).transpose()
    }

    async fn create_limit_setting(
        &self,
        setting: &CustomerLimitSetting,
    ) -> Result<CustomerLimitSetting, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO btm_risk_control_customer_limit_settings
                (customer_id, role, daily_limit, monthly_limit, level1, level1_days,
                 level2, level2_days, last_black_to_normal_at, edd_type, is_edd,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (customer_id) DO NOTHING
            "#,
        )
        .bind(setting.customer_id.inner())
        .bind(setting.role.id())
        .bind(setting.daily_limit)
        .bind(setting.monthly_limit)
        .bind(setting.level1)
        .bind(days_param(setting.level1_days))
        .bind(setting.level2)
        .bind(days_param(setting.level2_days))
        .bind(setting.last_black_to_normal_at)
        .bind(&setting.edd_type)
        .bind(setting.is_edd)
        .execute(&self.pool)
        .await?;

        self.get_limit_setting(setting.customer_id)
            .await?
            .ok_or_else(|| StoreError::RowNotFound(format!("limit setting {}", setting.customer_id)))
    }

    async fn escalate_to_edd(
        &self,
        customer_id: CustomerId,
        edd_type: &str,
    ) -> Result<(CustomerLimitSetting, CustomerLimitSetting), StoreError> {
        let mut db_tx = self.pool.begin().await?;

        let before = sqlx::query(&format!(
            "SELECT {SETTING_COLUMNS} FROM btm_risk_control_customer_limit_settings \
             WHERE customer_id = $1 FOR UPDATE"
        ))
        .bind(customer_id.inner())
        .fetch_optional(&mut *db_tx)
        .await?
        .ok_or_else(|| StoreError::RowNotFound(format!("limit setting {customer_id}")))?;
        let before = row_to_setting(&before)?;

        let after = sqlx::query(&format!(
            r#"
            UPDATE btm_risk_control_customer_limit_settings
            SET role = $2, is_edd = true, edd_type = $3, updated_at = NOW()
            WHERE customer_id = $1
            RETURNING {SETTING_COLUMNS}
            "#
        ))
        .bind(customer_id.inner())
        .bind(Role::Blacklist.id())
        .bind(edd_type)
        .fetch_one(&mut *db_tx)
        .await?;
        let after = row_to_setting(&after)?;

        db_tx.commit().await?;
        Ok((before, after))
    }

    async fn fetch_default_limit(&self, role: Role) -> Result<Option<LimitTable>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT daily_limit, monthly_limit, level1, level1_days, level2, level2_days
            FROM btm_risk_control_role_limits
            WHERE role = $1
            "#,
        )
        .bind(role.id())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_table).transpose()
    }

    async fn insert_change_log(&self, entry: &ChangeLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO btm_change_logs
                (created_at, updated_at, deleted_at, operation_user_id, table_name,
                 operation_type, customer_id, before_value, after_value)
            VALUES (NOW(), NOW(), NULL, $1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.operation_user_id)
        .bind(entry.table_name)
        .bind(entry.operation_type)
        .bind(entry.customer_id.inner())
        .bind(&entry.before_value)
        .bind(&entry.after_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_invoice(&self, record: &InvoiceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO btm_invoices
                (customer_id, tx_id, invoice_no, invoice_date, random_number, raw_resp, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(record.customer_id.inner())
        .bind(record.tx_id.inner())
        .bind(&record.invoice_no)
        .bind(record.invoice_date)
        .bind(&record.random_number)
        .bind(&record.raw_resp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_evaluation(&self, log: &EvaluationLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO btm_risk_control_evaluation_logs
                (customer_id, tx_id, daily_add_tx, monthly_add_tx, now_limit_config, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(log.customer_id.inner())
        .bind(log.tx_id.inner())
        .bind(log.daily_sum)
        .bind(log.monthly_sum)
        .bind(&log.limit_config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
