//! Cash-in Core Types
//!
//! Type definitions for the cash-in state machine.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TxStatus;
use crate::address::RejectReason;
use crate::core_types::{CryptoCode, CustomerId, DeviceId, TxId};

/// Error text written by an operator cancel; also drives the `Cancelled` status
pub const OPERATOR_CANCEL_ERROR: &str = "Operator cancel";
pub const OPERATOR_CANCEL_CODE: &str = "operatorCancel";

/// One accepted banknote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    /// Machine-assigned id; re-posting the same bill never counts twice
    pub id: Uuid,
    pub fiat: Decimal,
    pub fiat_code: String,
    pub crypto_atoms: Decimal,
}

/// Event posted by a machine for a cash-in session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineTx {
    pub id: TxId,
    pub customer_id: CustomerId,
    pub device_id: DeviceId,
    pub to_address: String,
    pub crypto_code: CryptoCode,
    pub fiat_code: String,
    /// Operator commission applied to this session (0.05 = 5%)
    pub commission_percentage: Decimal,
    /// All bills the machine has accepted so far (already-recorded ones are ignored)
    #[serde(default)]
    pub bills: Vec<Bill>,
    /// Customer asked for the coins to be sent
    #[serde(default)]
    pub send: bool,
}

impl MachineTx {
    /// Rebuild a bill-less event from a stored row (used by the pending monitor)
    pub fn resume(tx: &CashInTransaction) -> Self {
        Self {
            id: tx.id,
            customer_id: tx.customer_id,
            device_id: tx.device_id,
            to_address: tx.to_address.clone(),
            crypto_code: tx.crypto_code.clone(),
            fiat_code: tx.fiat_code.clone(),
            commission_percentage: tx.commission_percentage,
            bills: Vec::new(),
            send: tx.send,
        }
    }
}

/// Persisted cash-in session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashInTransaction {
    pub id: TxId,
    pub customer_id: CustomerId,
    pub device_id: DeviceId,
    pub to_address: String,
    pub crypto_code: CryptoCode,
    pub fiat_code: String,
    /// Sum of all recorded bills, never decreases
    pub fiat: Decimal,
    pub crypto_atoms: Decimal,
    pub commission_percentage: Decimal,
    pub send: bool,
    pub send_confirmed: bool,
    pub send_pending: bool,
    pub batched: bool,
    pub operator_completed: bool,
    /// Held by the one post running the address gates
    pub gates_claimed: bool,
    /// Set once the address gates passed
    pub compliance_cleared: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub tx_hash: Option<String>,
    pub fee: Option<Decimal>,
    pub wallet_score: Option<i32>,
    pub created: DateTime<Utc>,
    pub send_time: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl CashInTransaction {
    /// Fresh row for the first event of a session
    pub fn from_machine_tx(machine_tx: &MachineTx, created: DateTime<Utc>) -> Self {
        Self {
            id: machine_tx.id,
            customer_id: machine_tx.customer_id,
            device_id: machine_tx.device_id,
            to_address: machine_tx.to_address.clone(),
            crypto_code: machine_tx.crypto_code.clone(),
            fiat_code: machine_tx.fiat_code.clone(),
            fiat: Decimal::ZERO,
            crypto_atoms: Decimal::ZERO,
            commission_percentage: machine_tx.commission_percentage,
            send: false,
            send_confirmed: false,
            send_pending: false,
            batched: false,
            operator_completed: false,
            gates_claimed: false,
            compliance_cleared: false,
            error: None,
            error_code: None,
            tx_hash: None,
            fee: None,
            wallet_score: None,
            created,
            send_time: None,
            confirmed_at: None,
        }
    }

    pub fn status(&self, now: DateTime<Utc>, pending_interval: Duration) -> TxStatus {
        TxStatus::derive(self, now, pending_interval)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, pending_interval: Duration) -> bool {
        !self.send_confirmed && self.created <= now - pending_interval
    }

    /// Nobody holds or has passed the address gates, and the row is still open
    pub fn gates_open(&self) -> bool {
        !self.gates_claimed
            && !self.compliance_cleared
            && !self.operator_completed
            && self.error.is_none()
    }

    /// The claim predicate for a coin send. Stores evaluate the same
    /// condition atomically; this is the in-process rendition.
    pub fn is_clear_to_send(&self, now: DateTime<Utc>, pending_interval: Duration) -> bool {
        self.send
            && self.compliance_cleared
            && !self.send_confirmed
            && !self.send_pending
            && !self.operator_completed
            && self.error.is_none()
            && !self.is_expired(now, pending_interval)
    }

    /// Fee invoiced to the customer, rounded to whole fiat units
    pub fn commission_amount(&self) -> Decimal {
        (self.fiat * self.commission_percentage)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
    }
}

/// Result of the atomic merge of a machine event into the store
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Row after the merge
    pub tx: CashInTransaction,
    /// Bills recorded by this event
    pub new_bills: Vec<Bill>,
    /// This merge took the gates claim; the caller must run the gates
    /// and then clear, reject or release
    pub gates_claimed: bool,
}

impl MergeResult {
    /// Exactly one caller per session observes this as true, unless the
    /// claim is released after a failed gate run
    pub fn is_first_post(&self) -> bool {
        self.gates_claimed
    }
}

/// Outcome of a coin send reported by the wallet
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    /// Broadcast with a known hash
    Confirmed { tx_hash: String, fee: Option<Decimal> },
    /// Queued into an outgoing batch; no hash yet
    Batched,
    /// Failed in a way that guarantees funds were NOT sent (e.g. insufficient funds)
    Rejected { code: String, message: String },
    /// Failed in an unknown state; funds may have left the wallet
    Indeterminate { code: String, message: String },
}

impl SendResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, SendResult::Confirmed { .. } | SendResult::Batched)
    }
}

/// Columns written back after a send attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendRecord {
    pub send_confirmed: bool,
    pub send_pending: bool,
    pub batched: bool,
    pub tx_hash: Option<String>,
    pub fee: Option<Decimal>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl From<&SendResult> for SendRecord {
    fn from(result: &SendResult) -> Self {
        match result {
            SendResult::Confirmed { tx_hash, fee } => Self {
                send_confirmed: true,
                send_pending: false,
                batched: false,
                tx_hash: Some(tx_hash.clone()),
                fee: *fee,
                error: None,
                error_code: None,
            },
            SendResult::Batched => Self {
                send_confirmed: false,
                send_pending: true,
                batched: true,
                tx_hash: None,
                fee: None,
                error: None,
                error_code: None,
            },
            SendResult::Rejected { code, message } => Self {
                send_confirmed: false,
                send_pending: false,
                batched: false,
                tx_hash: None,
                fee: None,
                error: Some(message.clone()),
                error_code: Some(code.clone()),
            },
            // Keep send_pending so nothing ever retries a possibly-sent tx
            SendResult::Indeterminate { code, message } => Self {
                send_confirmed: false,
                send_pending: true,
                batched: false,
                tx_hash: None,
                fee: None,
                error: Some(message.clone()),
                error_code: Some(code.clone()),
            },
        }
    }
}

/// Per-post outcome returned to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum PostOutcome {
    /// Bills recorded, no send attempted by this call
    Accumulated,
    /// Address gates refused the destination; terminal
    Rejected(RejectReason),
    Sent { tx_hash: String },
    Batched,
    /// `retryable` is true only when funds are known not to have moved
    Failed {
        retryable: bool,
        code: String,
        message: String,
    },
}

impl PostOutcome {
    pub fn from_send(result: &SendResult) -> Self {
        match result {
            SendResult::Confirmed { tx_hash, .. } => PostOutcome::Sent {
                tx_hash: tx_hash.clone(),
            },
            SendResult::Batched => PostOutcome::Batched,
            SendResult::Rejected { code, message } => PostOutcome::Failed {
                retryable: true,
                code: code.clone(),
                message: message.clone(),
            },
            SendResult::Indeterminate { code, message } => PostOutcome::Failed {
                retryable: false,
                code: code.clone(),
                message: message.clone(),
            },
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, PostOutcome::Sent { .. } | PostOutcome::Batched)
    }
}

/// Kind of entry in the immutable cash-in action log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionKind {
    SendCoins,
    SendBatched,
    SendCoinsError,
    OperatorCompleted,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendCoins => "sendCoins",
            ActionKind::SendBatched => "sendBatched",
            ActionKind::SendCoinsError => "sendCoinsError",
            ActionKind::OperatorCompleted => "operatorCompleted",
        }
    }
}

/// Action log row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CashInAction {
    pub tx_id: TxId,
    pub action: ActionKind,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub tx_hash: Option<String>,
}

impl CashInAction {
    pub fn from_send(tx_id: TxId, record: &SendRecord) -> Self {
        let action = if record.send_confirmed {
            ActionKind::SendCoins
        } else if record.batched {
            ActionKind::SendBatched
        } else {
            ActionKind::SendCoinsError
        };
        Self {
            tx_id,
            action,
            error: record.error.clone(),
            error_code: record.error_code.clone(),
            tx_hash: record.tx_hash.clone(),
        }
    }

    pub fn operator_completed(tx_id: TxId) -> Self {
        Self {
            tx_id,
            action: ActionKind::OperatorCompleted,
            error: None,
            error_code: None,
            tx_hash: None,
        }
    }
}
