//! BTM Server - crypto ATM cash-in core
//!
//! Turns bill-acceptance events from machines into at most one coin send
//! per session, and keeps every customer inside the operator's rolling
//! fiat limits.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier newtypes (TxId, CustomerId, DeviceId)
//! - [`clock`] / [`calendar`] - Time source and the operator business calendar
//! - [`cash_in`] - Transaction state machine, coordinator and pending monitor
//! - [`address`] - Destination address gates (blacklist, reuse, wallet score)
//! - [`ledger`] - Rolling fiat sums per customer
//! - [`risk`] - Limit resolution, suspensions and EDD escalation
//! - [`adapters`] - Exchange, notifier, invoice and customer directory contracts
//! - [`store`] - PostgreSQL and in-process store implementations
//! - [`db`] - Connection pool and schema bootstrap

// Core types - must be first!
pub mod core_types;

pub mod calendar;
pub mod clock;

pub mod adapters;
pub mod address;
pub mod cash_in;
pub mod ledger;
pub mod risk;

pub mod db;
pub mod store;

pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use address::{AddressPolicyGate, AddressVerdict, RejectReason};
pub use calendar::{BusinessCalendar, CalendarInterval};
pub use cash_in::{
    CashInCoordinator, CashInError, CashInSettings, CashInTransaction, MachineTx, PendingMonitor,
    PostOutcome, TxStatus,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use core_types::{CryptoCode, CustomerId, DeviceId, TxId};
pub use ledger::FiatLedger;
pub use risk::{RiskAssessment, RiskAssessor, RiskError, RiskEvaluator, RiskReport, Role};
pub use store::{MemoryStore, PgStore, StoreError};
