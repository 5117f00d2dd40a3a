//! Store implementations
//!
//! Both stores implement every persistence contract of the crate:
//! [`CashInStore`](crate::cash_in::CashInStore),
//! [`AddressPolicyStore`](crate::address::AddressPolicyStore),
//! [`FiatLedger`](crate::ledger::FiatLedger) and
//! [`RiskStore`](crate::risk::RiskStore).

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
