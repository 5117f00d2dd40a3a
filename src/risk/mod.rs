//! Risk-control limit engine
//!
//! Per-customer rolling limits evaluated on the operator's business
//! calendar:
//!
//! - [`limits`]: effective daily / monthly / EDD limits for a customer
//! - [`suspension`]: calendar-aligned suspension ends and window starts
//! - [`assessor`]: read-only assessment against the fiat ledger
//! - [`evaluator`]: applies suspensions and EDD escalations after a cash-in

pub mod assessor;
pub mod error;
pub mod evaluator;
pub mod limits;
pub mod store;
pub mod suspension;

pub use assessor::{EddTier, RiskAssessment, RiskAssessor, WindowSums};
pub use error::RiskError;
pub use evaluator::{PolicyAction, RiskEvaluator, RiskReport, SideEffect, SideEffectFailure};
pub use limits::{
    CustomerLimitSetting, EffectiveLimits, LimitPolicyResolver, LimitSource, LimitTable, Role,
};
pub use store::{ChangeLogEntry, EvaluationLog, InvoiceRecord, RiskStore};
pub use suspension::{
    EvaluationWindows, SuspensionKind, SuspensionScheduler, SuspensionWindow, WindowAnchors,
};
