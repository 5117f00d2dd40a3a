//! Cash-in status definitions
//!
//! The status is never stored. It is derived on every read from the
//! persisted flags, in this precedence:
//!
//! ```text
//! operator_completed && error == "Operator cancel"  → CANCELLED
//! error is set                                      → ERROR
//! send_confirmed                                    → SENT
//! created <= now - pending_interval                 → EXPIRED
//! otherwise                                         → PENDING
//! ```

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::types::{CashInTransaction, OPERATOR_CANCEL_ERROR};

/// How long an unsent transaction stays eligible for automatic retries
pub const PENDING_INTERVAL_MINUTES: i64 = 60;

pub fn default_pending_interval() -> Duration {
    Duration::minutes(PENDING_INTERVAL_MINUTES)
}

/// Derived cash-in status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TxStatus {
    Pending,
    Sent,
    /// Terminal for automatic retries; may still be cancelled by an operator
    Error,
    Cancelled,
    /// Read-time only: stops the pending monitor, never interrupts an in-flight send
    Expired,
}

impl TxStatus {
    pub fn derive(tx: &CashInTransaction, now: DateTime<Utc>, pending_interval: Duration) -> Self {
        if tx.operator_completed && tx.error.as_deref() == Some(OPERATOR_CANCEL_ERROR) {
            TxStatus::Cancelled
        } else if tx.error.is_some() {
            TxStatus::Error
        } else if tx.send_confirmed {
            TxStatus::Sent
        } else if tx.created <= now - pending_interval {
            TxStatus::Expired
        } else {
            TxStatus::Pending
        }
    }

    /// No automatic transition can leave this status
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Sent | TxStatus::Cancelled | TxStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "Pending",
            TxStatus::Sent => "Sent",
            TxStatus::Error => "Error",
            TxStatus::Cancelled => "Cancelled",
            TxStatus::Expired => "Expired",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
