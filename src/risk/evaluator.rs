//! Risk Evaluation Orchestrator
//!
//! Runs once per successfully posted cash-in and applies the consequences
//! of an assessment: calendar-aligned suspension, EDD escalation to the
//! Blacklist role, fee invoice.
//!
//! Every step is best effort. A failing step is logged and recorded on the
//! returned [`RiskReport`]; the remaining steps still run and `evaluate`
//! itself never fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::assessor::{EddTier, RiskAssessment, RiskAssessor};
use super::limits::{CustomerLimitSetting, Role};
use super::store::{ChangeLogEntry, EvaluationLog, InvoiceRecord, RiskStore};
use super::suspension::SuspensionKind;
use crate::adapters::{
    AuthorizedOverride, ComplianceAction, Customer, CustomerDirectory, CustomerPatch,
    InvoiceIssuer, Notifier,
};
use crate::cash_in::types::CashInTransaction;
use crate::clock::Clock;
use crate::core_types::{CustomerId, TxId};

/// Step of the orchestration that can fail on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SideEffect {
    CustomerLookup,
    LimitSetting,
    Assessment,
    EvaluationLog,
    Suspension,
    EddBlock,
    ChangeLog,
    Invoice,
    Notification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideEffectFailure {
    pub effect: SideEffect,
    pub message: String,
}

/// Policy change applied to the customer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PolicyAction {
    Suspended {
        kind: SuspensionKind,
        until: DateTime<Utc>,
    },
    EddBlocked {
        tier: EddTier,
        edd_type: String,
    },
    InvoiceIssued {
        invoice_no: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskReport {
    pub tx_id: TxId,
    pub customer_id: CustomerId,
    pub assessment: Option<RiskAssessment>,
    pub actions: Vec<PolicyAction>,
    pub failures: Vec<SideEffectFailure>,
}

impl RiskReport {
    fn new(tx: &CashInTransaction) -> Self {
        Self {
            tx_id: tx.id,
            customer_id: tx.customer_id,
            assessment: None,
            actions: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, effect: SideEffect, message: impl ToString) {
        let message = message.to_string();
        error!(
            tx_id = %self.tx_id,
            customer_id = %self.customer_id,
            effect = ?effect,
            error = %message,
            "Risk side effect failed"
        );
        self.failures.push(SideEffectFailure { effect, message });
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct RiskEvaluator {
    assessor: RiskAssessor,
    store: Arc<dyn RiskStore>,
    customers: Arc<dyn CustomerDirectory>,
    notifier: Arc<dyn Notifier>,
    invoices: Arc<dyn InvoiceIssuer>,
    clock: Arc<dyn Clock>,
    invoicing_enabled: bool,
}

impl RiskEvaluator {
    pub fn new(
        assessor: RiskAssessor,
        store: Arc<dyn RiskStore>,
        customers: Arc<dyn CustomerDirectory>,
        notifier: Arc<dyn Notifier>,
        invoices: Arc<dyn InvoiceIssuer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            assessor,
            store,
            customers,
            notifier,
            invoices,
            clock,
            invoicing_enabled: true,
        }
    }

    pub fn with_invoicing(mut self, enabled: bool) -> Self {
        self.invoicing_enabled = enabled;
        self
    }

    pub async fn evaluate(&self, tx: &CashInTransaction) -> RiskReport {
        let now = self.clock.now();
        let mut report = RiskReport::new(tx);

        let customer = match self.customers.get_by_id(tx.customer_id).await {
            Ok(Some(customer)) => Some(customer),
            Ok(None) => {
                report.fail(SideEffect::CustomerLookup, "customer not found");
                None
            }
            Err(e) => {
                report.fail(SideEffect::CustomerLookup, e);
                None
            }
        };
        let cib = customer.as_ref().and_then(|c| c.cib_expire_date);

        if let Some(setting) = self.load_setting(tx.customer_id, &mut report).await {
            match self.assessor.assess(&setting, cib, now).await {
                Ok(assessment) => {
                    self.log_evaluation(tx, &assessment, &mut report).await;
                    self.apply(tx, &setting, customer.as_ref(), &assessment, now, &mut report)
                        .await;
                    report.assessment = Some(assessment);
                }
                Err(e) => report.fail(SideEffect::Assessment, e),
            }
        }

        if self.invoicing_enabled {
            self.issue_invoice(tx, customer.as_ref(), &mut report).await;
        }

        info!(
            tx_id = %tx.id,
            customer_id = %tx.customer_id,
            actions = report.actions.len(),
            failures = report.failures.len(),
            "Risk evaluation finished"
        );
        report
    }

    /// Stored setting, or a fresh default row on the customer's first transaction
    async fn load_setting(
        &self,
        customer_id: CustomerId,
        report: &mut RiskReport,
    ) -> Option<CustomerLimitSetting> {
        match self.store.get_limit_setting(customer_id).await {
            Ok(Some(setting)) => Some(setting),
            Ok(None) => match self
                .store
                .create_limit_setting(&CustomerLimitSetting::new_default(customer_id))
                .await
            {
                Ok(setting) => Some(setting),
                Err(e) => {
                    report.fail(SideEffect::LimitSetting, e);
                    None
                }
            },
            Err(e) => {
                report.fail(SideEffect::LimitSetting, e);
                None
            }
        }
    }

    async fn log_evaluation(
        &self,
        tx: &CashInTransaction,
        assessment: &RiskAssessment,
        report: &mut RiskReport,
    ) {
        let limit_config = serde_json::json!({
            "limits": assessment.limits,
            "windows": assessment.windows,
        });
        let log = EvaluationLog {
            customer_id: tx.customer_id,
            tx_id: tx.id,
            daily_sum: assessment.sums.today,
            monthly_sum: assessment.sums.month,
            limit_config,
        };
        if let Err(e) = self.store.record_evaluation(&log).await {
            report.fail(SideEffect::EvaluationLog, e);
        }
    }

    async fn apply(
        &self,
        tx: &CashInTransaction,
        setting: &CustomerLimitSetting,
        customer: Option<&Customer>,
        assessment: &RiskAssessment,
        now: DateTime<Utc>,
        report: &mut RiskReport,
    ) {
        if let Some(window) = &assessment.suspension {
            let until = self.assessor.scheduler().suspended_until(window, now);
            let patch = CustomerPatch {
                suspended_until: Some(until),
                ..Default::default()
            };
            match self.customers.update(tx.customer_id, patch).await {
                Ok(updated) => {
                    warn!(
                        customer_id = %tx.customer_id,
                        kind = window.kind.as_str(),
                        until = %until,
                        "Customer suspended"
                    );
                    report.actions.push(PolicyAction::Suspended {
                        kind: window.kind,
                        until,
                    });
                    self.notify(
                        &updated,
                        tx,
                        ComplianceAction::Suspended,
                        Some(window.kind.nominal_days()),
                        report,
                    )
                    .await;
                }
                Err(e) => report.fail(SideEffect::Suspension, e),
            }
        }

        if let Some(tier) = assessment.highest_edd_tier() {
            self.apply_edd_block(tx, setting, customer, assessment, tier, report)
                .await;
        }
    }

    async fn apply_edd_block(
        &self,
        tx: &CashInTransaction,
        assessed: &CustomerLimitSetting,
        customer: Option<&Customer>,
        assessment: &RiskAssessment,
        tier: EddTier,
        report: &mut RiskReport,
    ) {
        // Tagged with the role the breach was assessed under
        let edd_type = tier.tag(assessed.role);
        let (before, after) = match self
            .store
            .escalate_to_edd(tx.customer_id, &edd_type)
            .await
        {
            Ok(images) => images,
            Err(e) => {
                report.fail(SideEffect::EddBlock, e);
                return;
            }
        };
        warn!(
            customer_id = %tx.customer_id,
            edd_type = %edd_type,
            "Customer escalated to EDD"
        );
        report.actions.push(PolicyAction::EddBlocked {
            tier,
            edd_type: edd_type.clone(),
        });

        for _ in &assessment.edd_breaches {
            let entry = match ChangeLogEntry::limit_update(&before, &after) {
                Ok(entry) => entry,
                Err(e) => {
                    report.fail(SideEffect::ChangeLog, e);
                    continue;
                }
            };
            if let Err(e) = self.store.insert_change_log(&entry).await {
                report.fail(SideEffect::ChangeLog, e);
            }
        }

        let patch = CustomerPatch {
            authorized_override: Some(AuthorizedOverride::Blocked),
            ..Default::default()
        };
        match self.customers.update(tx.customer_id, patch).await {
            Ok(updated) => {
                self.notify(&updated, tx, ComplianceAction::Blocked, None, report)
                    .await
            }
            Err(e) => {
                report.fail(SideEffect::EddBlock, e);
                if let Some(customer) = customer {
                    self.notify(customer, tx, ComplianceAction::Blocked, None, report)
                        .await;
                }
            }
        }
    }

    async fn notify(
        &self,
        customer: &Customer,
        tx: &CashInTransaction,
        action: ComplianceAction,
        period_days: Option<u32>,
        report: &mut RiskReport,
    ) {
        if let Err(e) = self
            .notifier
            .compliance_notify(customer, tx.device_id, action, period_days)
            .await
        {
            report.fail(SideEffect::Notification, e);
        }
    }

    async fn issue_invoice(
        &self,
        tx: &CashInTransaction,
        customer: Option<&Customer>,
        report: &mut RiskReport,
    ) {
        let email = customer.and_then(|c| c.email.as_deref());
        let amount = tx.commission_amount();

        let record = match self
            .invoices
            .issue_invoice(tx.id, tx.customer_id, email, amount)
            .await
        {
            Ok(invoice) => {
                report.actions.push(PolicyAction::InvoiceIssued {
                    invoice_no: invoice.invoice_no.clone(),
                });
                InvoiceRecord {
                    customer_id: tx.customer_id,
                    tx_id: tx.id,
                    invoice_no: Some(invoice.invoice_no),
                    invoice_date: invoice.invoice_date,
                    random_number: Some(invoice.random_number),
                    raw_resp: invoice.raw,
                }
            }
            Err(e) => {
                let record = InvoiceRecord {
                    customer_id: tx.customer_id,
                    tx_id: tx.id,
                    invoice_no: None,
                    invoice_date: None,
                    random_number: None,
                    raw_resp: serde_json::json!({ "error": e.to_string() }),
                };
                report.fail(SideEffect::Invoice, e);
                record
            }
        };

        if let Err(e) = self.store.record_invoice(&record).await {
            report.fail(SideEffect::Invoice, e);
        }
    }
}
