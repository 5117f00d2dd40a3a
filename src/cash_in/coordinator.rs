//! Cash-in Coordinator
//!
//! Drives one machine event through merge, address gates, send claim and
//! coin send, then hands successful sends to the risk evaluator.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::error::CashInError;
use super::state::{TxStatus, default_pending_interval};
use super::store::CashInStore;
use super::types::{CashInAction, CashInTransaction, MachineTx, PostOutcome, SendRecord};
use crate::address::{AddressPolicyGate, AddressVerdict, RejectReason};
use crate::adapters::{Exchange, Notifier};
use crate::clock::Clock;
use crate::core_types::TxId;
use crate::risk::{RiskEvaluator, RiskReport};

/// Runtime knobs of the state machine
#[derive(Debug, Clone, Copy)]
pub struct CashInSettings {
    /// Age after which an unsent transaction reads as expired
    pub pending_interval: Duration,
    pub reject_address_reuse: bool,
}

impl Default for CashInSettings {
    fn default() -> Self {
        Self {
            pending_interval: default_pending_interval(),
            reject_address_reuse: true,
        }
    }
}

/// Answer to a machine post
#[derive(Debug, Clone, Serialize)]
pub struct PostResponse {
    pub tx: CashInTransaction,
    pub status: TxStatus,
    #[serde(skip)]
    pub outcome: PostOutcome,
    /// Present only on the first post
    pub verdict: Option<AddressVerdict>,
    pub risk_report: Option<RiskReport>,
}

enum GateRun {
    Cleared(CashInTransaction, AddressVerdict),
    Rejected(Box<PostResponse>),
}

/// Display view of a stored transaction
#[derive(Debug, Clone, Serialize)]
pub struct TxView {
    pub tx: CashInTransaction,
    pub status: TxStatus,
    pub expired: bool,
}

pub struct CashInCoordinator {
    store: Arc<dyn CashInStore>,
    gate: AddressPolicyGate,
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    risk: Option<Arc<RiskEvaluator>>,
    clock: Arc<dyn Clock>,
    settings: CashInSettings,
}

impl CashInCoordinator {
    pub fn new(
        store: Arc<dyn CashInStore>,
        gate: AddressPolicyGate,
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: CashInSettings,
    ) -> Self {
        Self {
            store,
            gate,
            exchange,
            notifier,
            risk: None,
            clock,
            settings,
        }
    }

    /// Evaluate customer limits after every successful send
    pub fn with_risk_evaluator(mut self, risk: Arc<RiskEvaluator>) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn store(&self) -> &Arc<dyn CashInStore> {
        &self.store
    }

    pub fn settings(&self) -> &CashInSettings {
        &self.settings
    }

    /// Merge a machine event and, when due, send the coins
    pub async fn post(&self, machine_tx: MachineTx) -> Result<PostResponse, CashInError> {
        validate(&machine_tx)?;

        let merge = self.store.merge(&machine_tx).await?;
        let first_post = merge.is_first_post();
        debug!(
            tx_id = %machine_tx.id,
            fiat = %merge.tx.fiat,
            new_bills = merge.new_bills.len(),
            first_post,
            "Cash-in merged"
        );

        for bill in &merge.new_bills {
            if let Err(e) = self.exchange.buy(bill, &merge.tx).await {
                warn!(tx_id = %merge.tx.id, bill_id = %bill.id, error = %e, "Trade registration failed");
            }
        }

        let mut tx = merge.tx;
        let mut verdict = None;

        if first_post {
            let id = tx.id;
            match self.run_gates(tx).await {
                Ok(GateRun::Cleared(cleared, v)) => {
                    tx = cleared;
                    verdict = Some(v);
                }
                Ok(GateRun::Rejected(response)) => return Ok(*response),
                Err(e) => {
                    // Let the next post or monitor scan take the gates again
                    if let Err(release) = self.store.release_gates(id).await {
                        error!(tx_id = %id, error = %release, "Failed to release gates claim");
                    }
                    warn!(tx_id = %id, error = %e, "Address gates failed");
                    return Err(e);
                }
            }
        }

        let now = self.clock.now();
        let (tx, outcome) = if tx.is_clear_to_send(now, self.settings.pending_interval) {
            self.send(tx).await?
        } else {
            (tx, PostOutcome::Accumulated)
        };

        let risk_report = match (&self.risk, outcome.is_success()) {
            (Some(risk), true) => Some(risk.evaluate(&tx).await),
            _ => None,
        };

        Ok(PostResponse {
            status: tx.status(self.clock.now(), self.settings.pending_interval),
            tx,
            outcome,
            verdict,
            risk_report,
        })
    }

    /// Runs under the gates claim taken by `merge`
    async fn run_gates(&self, tx: CashInTransaction) -> Result<GateRun, CashInError> {
        let v = self.gate.evaluate(&tx).await?;
        let score = v.wallet_score.map(|s| s.score);

        if let Some(reason) = v.rejection(self.settings.reject_address_reuse) {
            let response = self.reject(tx, reason, v, score).await?;
            return Ok(GateRun::Rejected(Box::new(response)));
        }
        let cleared = self
            .store
            .mark_compliance_cleared(tx.id, score)
            .await?
            .ok_or(CashInError::LostRace(tx.id))?;
        Ok(GateRun::Cleared(cleared, v))
    }

    async fn reject(
        &self,
        tx: CashInTransaction,
        reason: RejectReason,
        verdict: AddressVerdict,
        score: Option<i32>,
    ) -> Result<PostResponse, CashInError> {
        warn!(
            tx_id = %tx.id,
            customer_id = %tx.customer_id,
            reason = reason.code(),
            "Cash-in rejected by address policy"
        );
        if reason.is_address_block()
            && let Err(e) = self
                .notifier
                .notify_blacklisted(&tx, reason == RejectReason::AddressReused)
                .await
        {
            error!(tx_id = %tx.id, error = %e, "Blacklist notification failed");
        }

        let tx = self
            .store
            .complete_with_rejection(tx.id, reason, score)
            .await?
            .ok_or(CashInError::LostRace(tx.id))?;
        Ok(PostResponse {
            status: tx.status(self.clock.now(), self.settings.pending_interval),
            tx,
            outcome: PostOutcome::Rejected(reason),
            verdict: Some(verdict),
            risk_report: None,
        })
    }

    /// Claim, send, record. Only the claimer ever reaches the wallet.
    async fn send(
        &self,
        tx: CashInTransaction,
    ) -> Result<(CashInTransaction, PostOutcome), CashInError> {
        let Some(claimed) = self
            .store
            .claim_send(tx.id, self.settings.pending_interval)
            .await?
        else {
            debug!(tx_id = %tx.id, "Send already claimed");
            return Ok((tx, PostOutcome::Accumulated));
        };

        let result = self.exchange.send_coins(&claimed).await;
        let record = SendRecord::from(&result);
        let outcome = PostOutcome::from_send(&result);

        let tx = self.store.record_send(claimed.id, &record).await?;
        match &outcome {
            PostOutcome::Failed {
                retryable, code, ..
            } => error!(
                tx_id = %tx.id,
                code = %code,
                retryable,
                "Coin send failed"
            ),
            _ => info!(
                tx_id = %tx.id,
                tx_hash = ?tx.tx_hash,
                batched = tx.batched,
                "Coins sent"
            ),
        }

        self.log_action(&CashInAction::from_send(tx.id, &record)).await;
        if let Err(e) = self.notifier.notify_operator(&tx, &record).await {
            warn!(tx_id = %tx.id, error = %e, "Operator notification failed");
        }
        Ok((tx, outcome))
    }

    /// Operator cancel; fails once the coins are confirmed or the tx is already cancelled
    pub async fn cancel(&self, id: TxId) -> Result<CashInTransaction, CashInError> {
        if !self.store.cancel(id).await? {
            return Err(CashInError::NotFound(id));
        }
        info!(tx_id = %id, "Cash-in cancelled by operator");
        self.log_action(&CashInAction::operator_completed(id)).await;
        self.store.get(id).await?.ok_or(CashInError::NotFound(id))
    }

    pub async fn view(&self, id: TxId) -> Result<TxView, CashInError> {
        let tx = self.store.get(id).await?.ok_or(CashInError::NotFound(id))?;
        let now = self.clock.now();
        Ok(TxView {
            status: tx.status(now, self.settings.pending_interval),
            expired: tx.is_expired(now, self.settings.pending_interval),
            tx,
        })
    }

    async fn log_action(&self, action: &CashInAction) {
        if let Err(e) = self.store.log_action(action).await {
            error!(
                tx_id = %action.tx_id,
                action = action.action.as_str(),
                error = %e,
                "Failed to append cash-in action"
            );
        }
    }
}

fn validate(machine_tx: &MachineTx) -> Result<(), CashInError> {
    if machine_tx.to_address.trim().is_empty() {
        return Err(CashInError::InvalidMachineTx("empty destination address".into()));
    }
    if machine_tx.crypto_code.is_empty() {
        return Err(CashInError::InvalidMachineTx("missing crypto code".into()));
    }
    for bill in &machine_tx.bills {
        if bill.fiat <= rust_decimal::Decimal::ZERO {
            return Err(CashInError::InvalidMachineTx(format!(
                "bill {} has non-positive fiat",
                bill.id
            )));
        }
        if bill.fiat_code != machine_tx.fiat_code {
            return Err(CashInError::InvalidMachineTx(format!(
                "bill {} fiat code {} does not match {}",
                bill.id, bill.fiat_code, machine_tx.fiat_code
            )));
        }
    }
    Ok(())
}
