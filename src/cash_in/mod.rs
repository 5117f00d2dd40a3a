//! Cash-in Transaction State Machine
//!
//! Turns the stream of bill-acceptance events posted by a machine into at
//! most one coin send per session.
//!
//! # State Machine
//!
//! ```text
//! PENDING → SENT
//!    ↓  ↘
//! EXPIRED  ERROR → CANCELLED
//!    ↘
//!   CANCELLED
//! ```
//!
//! The status is derived on read (see [`state`]); only flags are stored.
//!
//! # Safety Invariants
//!
//! 1. **Serialized Merge**: bills are merged under a per-row lock; exactly one
//!    caller observes the first post and runs the address gates
//! 2. **Persist-Before-Call**: the send is claimed (`send_pending := true`) by
//!    a conditional update before the wallet is called
//! 3. **Unknown Means Sent**: a send failure that cannot prove funds stayed
//!    put keeps `send_pending` set and is never retried automatically

pub mod coordinator;
pub mod error;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use coordinator::{CashInCoordinator, CashInSettings, PostResponse};
pub use error::CashInError;
pub use state::{TxStatus, default_pending_interval};
pub use store::CashInStore;
pub use types::{
    ActionKind, Bill, CashInAction, CashInTransaction, MachineTx, MergeResult, PostOutcome,
    SendRecord, SendResult,
};
pub use worker::{MonitorConfig, PendingMonitor};
