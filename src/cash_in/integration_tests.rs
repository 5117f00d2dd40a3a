//! End-to-end tests of the coordinator and the pending monitor against the
//! in-process store and mock collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use chrono::{Duration, TimeZone, Utc};
use rust_decimal_macros::dec;

use super::*;
use crate::adapters::WalletScore;
use crate::adapters::mock::{
    MockCustomerDirectory, MockExchange, MockInvoiceIssuer, MockNotifier, Notification, customer,
};
use crate::address::{
    AddressPolicyGate, AddressPolicyStore, BlacklistEntry, RejectReason, WhitelistEntry,
};
use crate::cash_in::types::tests::{bill, sample_machine_tx};
use crate::clock::{Clock, FixedClock};
use crate::core_types::TxId;
use crate::risk::{
    LimitPolicyResolver, LimitTable, RiskAssessor, RiskEvaluator, Role, SuspensionScheduler,
};
use crate::store::{MemoryStore, StoreError};

struct Harness {
    clock: Arc<FixedClock>,
    store: Arc<MemoryStore>,
    exchange: Arc<MockExchange>,
    notifier: Arc<MockNotifier>,
    coordinator: Arc<CashInCoordinator>,
}

fn harness() -> Harness {
    harness_with_policy(|store| store as Arc<dyn AddressPolicyStore>)
}

/// Harness whose address gate reads from `policy(store)`
fn harness_with_policy<F>(policy: F) -> Harness
where
    F: FnOnce(Arc<MemoryStore>) -> Arc<dyn AddressPolicyStore>,
{
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 3, 15, 2, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let exchange = Arc::new(MockExchange::new());
    let notifier = Arc::new(MockNotifier::new());
    let gate = AddressPolicyGate::new(policy(store.clone()), exchange.clone());
    let coordinator = Arc::new(CashInCoordinator::new(
        store.clone(),
        gate,
        exchange.clone(),
        notifier.clone(),
        clock.clone(),
        CashInSettings::default(),
    ));
    Harness {
        clock,
        store,
        exchange,
        notifier,
        coordinator,
    }
}

fn with_send(mut m: MachineTx) -> MachineTx {
    m.send = true;
    m
}

#[tokio::test]
async fn test_bills_accumulate_then_send_once() {
    let h = harness();
    let mut m = sample_machine_tx();
    m.bills = vec![bill(dec!(500))];

    let first = h.coordinator.post(m.clone()).await.unwrap();
    assert_eq!(first.outcome, PostOutcome::Accumulated);
    assert!(first.verdict.is_some());
    assert!(first.tx.compliance_cleared);
    assert_eq!(first.status, TxStatus::Pending);

    m.bills.push(bill(dec!(1000)));
    let sent = h.coordinator.post(with_send(m.clone())).await.unwrap();
    assert_eq!(
        sent.outcome,
        PostOutcome::Sent {
            tx_hash: "mock-hash".into()
        }
    );
    assert!(sent.verdict.is_none());
    assert_eq!(sent.tx.fiat, dec!(1500));
    assert_eq!(sent.status, TxStatus::Sent);
    assert_eq!(h.exchange.buy_count(), 2);

    // Re-posting the same event changes nothing
    let again = h.coordinator.post(with_send(m)).await.unwrap();
    assert_eq!(again.outcome, PostOutcome::Accumulated);
    assert_eq!(again.tx.fiat, dec!(1500));
    assert_eq!(h.exchange.send_count(), 1);
    assert_eq!(h.exchange.buy_count(), 2);

    let actions = h.store.actions(sent.tx.id);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, ActionKind::SendCoins);
    assert!(h.notifier.sent().contains(&Notification::Operator { tx_id: sent.tx.id }));
}

#[tokio::test]
async fn test_concurrent_posts_send_once() {
    let h = harness();
    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];

    let (a, b) = tokio::join!(
        h.coordinator.post(m.clone()),
        h.coordinator.post(m.clone())
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.exchange.send_count(), 1);
    assert_eq!(h.exchange.buy_count(), 1);
    let sends = [&a, &b]
        .iter()
        .filter(|r| r.outcome.is_success())
        .count();
    assert_eq!(sends, 1);
    assert_eq!(h.store.tx(m.id).unwrap().fiat, dec!(1000));
}

#[tokio::test]
async fn test_concurrent_posts_from_many_tasks() {
    let h = harness();
    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = h.coordinator.clone();
        let m = m.clone();
        handles.push(tokio::spawn(async move { coordinator.post(m).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(h.exchange.send_count(), 1);
}

#[tokio::test]
async fn test_address_scan_racing_first_bill_runs_gates_once() {
    let h = harness();
    h.exchange.set_wallet_score(Some(WalletScore {
        score: 2,
        is_valid: true,
    }));
    // Address scan post: no bills yet
    let scan = sample_machine_tx();
    let mut first_bill = with_send(scan.clone());
    first_bill.bills = vec![bill(dec!(1000))];

    let (a, b) = tokio::join!(h.coordinator.post(scan), h.coordinator.post(first_bill));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.exchange.rate_count(), 1);
    assert_eq!(h.exchange.send_count(), 1);
    let verdicts = [&a, &b].iter().filter(|r| r.verdict.is_some()).count();
    assert_eq!(verdicts, 1);
    assert!(
        [&a, &b]
            .iter()
            .all(|r| !matches!(r.outcome, PostOutcome::Rejected(_)))
    );

    let tx = h.store.tx(a.tx.id).unwrap();
    assert!(tx.send_confirmed);
    assert!(!tx.operator_completed);
    assert!(tx.error.is_none());
    assert_eq!(tx.fiat, dec!(1000));
}

#[tokio::test]
async fn test_scoring_failure_racing_bill_post_never_overwrites_send() {
    let h = harness();
    h.exchange.set_wallet_score(None);
    let scan = sample_machine_tx();
    let mut first_bill = with_send(scan.clone());
    first_bill.bills = vec![bill(dec!(1000))];

    let (a, b) = tokio::join!(h.coordinator.post(scan), h.coordinator.post(first_bill));
    let (a, b) = (a.unwrap(), b.unwrap());

    // One gate run, it rejected, and nothing was sent
    assert_eq!(h.exchange.rate_count(), 1);
    assert_eq!(h.exchange.send_count(), 0);
    assert_eq!(
        a.outcome,
        PostOutcome::Rejected(RejectReason::WalletScoringError)
    );
    assert_eq!(b.outcome, PostOutcome::Accumulated);

    let tx = h.store.tx(a.tx.id).unwrap();
    assert!(!tx.send_confirmed);
    assert!(tx.operator_completed);
    assert_eq!(tx.status(h.clock.now(), Duration::minutes(60)), TxStatus::Error);
}

#[tokio::test]
async fn test_cancel_during_gates_wins() {
    let h = harness();
    h.exchange.set_wallet_score(Some(WalletScore {
        score: 2,
        is_valid: true,
    }));
    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];
    let id = m.id;

    let (posted, cancelled) = tokio::join!(h.coordinator.post(m), async {
        tokio::task::yield_now().await;
        h.coordinator.cancel(id).await
    });

    assert!(cancelled.is_ok());
    assert!(matches!(posted, Err(CashInError::LostRace(_))));
    assert_eq!(h.exchange.send_count(), 0);
    let tx = h.store.tx(id).unwrap();
    assert!(!tx.compliance_cleared);
    assert_eq!(tx.error_code.as_deref(), Some("operatorCancel"));
}

/// Address lookups that fail a fixed number of times before delegating
struct FlakyPolicyStore {
    inner: Arc<MemoryStore>,
    failures_left: AtomicUsize,
}

impl FlakyPolicyStore {
    fn fail_once(inner: Arc<MemoryStore>) -> Arc<dyn AddressPolicyStore> {
        Arc::new(Self {
            inner,
            failures_left: AtomicUsize::new(1),
        })
    }
}

#[async_trait]
impl AddressPolicyStore for FlakyPolicyStore {
    async fn blacklisted(
        &self,
        address: &str,
        crypto_code: &str,
    ) -> Result<Option<BlacklistEntry>, StoreError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database("connection reset".into()));
        }
        self.inner.blacklisted(address, crypto_code).await
    }

    async fn whitelisted(
        &self,
        customer_id: crate::core_types::CustomerId,
        address: &str,
        crypto_code: &str,
    ) -> Result<bool, StoreError> {
        self.inner.whitelisted(customer_id, address, crypto_code).await
    }

    async fn address_reused(&self, tx_id: TxId, address: &str) -> Result<bool, StoreError> {
        self.inner.address_reused(tx_id, address).await
    }
}

#[tokio::test]
async fn test_gate_store_failure_is_retried_by_next_post() {
    let h = harness_with_policy(FlakyPolicyStore::fail_once);
    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];

    let err = h.coordinator.post(m.clone()).await.unwrap_err();
    assert_eq!(err.code(), "DATABASE_ERROR");
    let stuck = h.store.tx(m.id).unwrap();
    assert!(!stuck.gates_claimed);
    assert!(!stuck.compliance_cleared);
    assert_eq!(stuck.fiat, dec!(1000));
    assert_eq!(h.exchange.send_count(), 0);

    let resp = h.coordinator.post(m).await.unwrap();
    assert!(resp.verdict.is_some());
    assert!(resp.outcome.is_success());
    assert_eq!(h.exchange.send_count(), 1);
    // The bill was registered once, by the first post
    assert_eq!(h.exchange.buy_count(), 1);
}

#[tokio::test]
async fn test_monitor_recovers_after_gate_store_failure() {
    let h = harness_with_policy(FlakyPolicyStore::fail_once);
    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];
    assert!(h.coordinator.post(m.clone()).await.is_err());

    let monitor = PendingMonitor::with_defaults(h.coordinator.clone());
    assert_eq!(monitor.scan_once().await.unwrap(), 1);
    assert_eq!(h.exchange.send_count(), 1);
    assert!(h.store.tx(m.id).unwrap().send_confirmed);
}

#[tokio::test]
async fn test_blacklisted_address_rejected() {
    let h = harness();
    let m = with_send(sample_machine_tx());
    h.store.add_blacklist(BlacklistEntry {
        address: m.to_address.clone(),
        crypto_code: m.crypto_code.clone(),
        content: Some("OFAC".into()),
    });

    let resp = h.coordinator.post(m.clone()).await.unwrap();
    assert_eq!(resp.outcome, PostOutcome::Rejected(RejectReason::Blacklisted));
    assert_eq!(resp.status, TxStatus::Error);
    assert!(resp.tx.operator_completed);
    assert_eq!(resp.tx.error.as_deref(), Some("Blacklisted Address"));
    assert_eq!(resp.tx.error_code.as_deref(), Some("blacklisted"));
    assert_eq!(h.exchange.send_count(), 0);
    assert!(h.notifier.sent().contains(&Notification::Blacklisted {
        tx_id: m.id,
        is_address_reuse: false,
    }));

    // Terminal: a later post never sends
    h.coordinator.post(m).await.unwrap();
    assert_eq!(h.exchange.send_count(), 0);
}

#[tokio::test]
async fn test_whitelist_overrides_blacklist() {
    let h = harness();
    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];
    h.store.add_blacklist(BlacklistEntry {
        address: m.to_address.clone(),
        crypto_code: m.crypto_code.clone(),
        content: None,
    });
    h.store.add_whitelist(WhitelistEntry {
        customer_id: m.customer_id,
        address: m.to_address.to_uppercase(),
        crypto_code: m.crypto_code.clone(),
        deleted_at: None,
    });

    let resp = h.coordinator.post(m).await.unwrap();
    assert!(resp.outcome.is_success());
    assert_eq!(h.exchange.send_count(), 1);
}

#[tokio::test]
async fn test_reused_address_rejected() {
    let h = harness();
    let mut earlier = sample_machine_tx();
    earlier.bills = vec![bill(dec!(500))];
    h.coordinator.post(earlier.clone()).await.unwrap();

    let mut m = with_send(sample_machine_tx());
    m.to_address = earlier.to_address.clone();
    m.bills = vec![bill(dec!(500))];
    let resp = h.coordinator.post(m.clone()).await.unwrap();

    assert_eq!(resp.outcome, PostOutcome::Rejected(RejectReason::AddressReused));
    assert_eq!(resp.tx.error.as_deref(), Some("Address Reused"));
    assert!(h.notifier.sent().contains(&Notification::Blacklisted {
        tx_id: m.id,
        is_address_reuse: true,
    }));
    assert_eq!(h.exchange.send_count(), 0);
}

#[tokio::test]
async fn test_reuse_allowed_when_toggle_off() {
    let h = harness();
    let gate = AddressPolicyGate::new(h.store.clone(), h.exchange.clone());
    let coordinator = CashInCoordinator::new(
        h.store.clone(),
        gate,
        h.exchange.clone(),
        h.notifier.clone(),
        h.clock.clone(),
        CashInSettings {
            reject_address_reuse: false,
            ..CashInSettings::default()
        },
    );
    let mut earlier = sample_machine_tx();
    earlier.bills = vec![bill(dec!(500))];
    coordinator.post(earlier.clone()).await.unwrap();

    let mut m = with_send(sample_machine_tx());
    m.to_address = earlier.to_address;
    m.bills = vec![bill(dec!(500))];
    let resp = coordinator.post(m).await.unwrap();
    assert!(resp.outcome.is_success());
}

#[tokio::test]
async fn test_invalid_wallet_score_rejected_without_alert() {
    let h = harness();
    h.exchange.set_wallet_score(Some(WalletScore {
        score: 9,
        is_valid: false,
    }));
    let m = with_send(sample_machine_tx());

    let resp = h.coordinator.post(m).await.unwrap();
    assert_eq!(
        resp.outcome,
        PostOutcome::Rejected(RejectReason::ScoreThresholdReached)
    );
    assert_eq!(resp.tx.wallet_score, Some(9));
    assert!(
        !h.notifier
            .sent()
            .iter()
            .any(|n| matches!(n, Notification::Blacklisted { .. }))
    );
}

#[tokio::test]
async fn test_wallet_scoring_failure_rejects() {
    let h = harness();
    h.exchange.set_wallet_score(None);
    let resp = h
        .coordinator
        .post(with_send(sample_machine_tx()))
        .await
        .unwrap();
    assert_eq!(
        resp.outcome,
        PostOutcome::Rejected(RejectReason::WalletScoringError)
    );
    assert_eq!(resp.tx.error_code.as_deref(), Some("walletScoringError"));
}

#[tokio::test]
async fn test_indeterminate_failure_never_retried() {
    let h = harness();
    h.exchange.set_send_result(SendResult::Indeterminate {
        code: "ETIMEDOUT".into(),
        message: "socket hang up".into(),
    });
    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];

    let resp = h.coordinator.post(m.clone()).await.unwrap();
    assert!(matches!(
        resp.outcome,
        PostOutcome::Failed {
            retryable: false,
            ..
        }
    ));
    assert!(resp.tx.send_pending);
    assert_eq!(resp.status, TxStatus::Error);

    h.exchange.set_send_result(SendResult::Batched);
    h.coordinator.post(m).await.unwrap();
    let monitor = PendingMonitor::with_defaults(h.coordinator.clone());
    assert_eq!(monitor.scan_once().await.unwrap(), 0);
    assert_eq!(h.exchange.send_count(), 1);
}

#[tokio::test]
async fn test_known_safe_failure_is_retryable() {
    let h = harness();
    h.exchange.set_send_result(SendResult::Rejected {
        code: "InsufficientFundsError".into(),
        message: "insufficient funds".into(),
    });
    let resp = h
        .coordinator
        .post(with_send(sample_machine_tx()))
        .await
        .unwrap();
    assert!(matches!(
        resp.outcome,
        PostOutcome::Failed {
            retryable: true,
            ..
        }
    ));
    assert!(!resp.tx.send_pending);
    assert_eq!(resp.tx.error_code.as_deref(), Some("InsufficientFundsError"));
    let actions = h.store.actions(resp.tx.id);
    assert_eq!(actions[0].action, ActionKind::SendCoinsError);
}

#[tokio::test]
async fn test_batched_send_counts_as_success() {
    let h = harness();
    h.exchange.set_send_result(SendResult::Batched);
    let resp = h
        .coordinator
        .post(with_send(sample_machine_tx()))
        .await
        .unwrap();
    assert_eq!(resp.outcome, PostOutcome::Batched);
    assert!(resp.tx.batched);
    assert!(resp.tx.send_pending);
    assert!(!resp.tx.send_confirmed);
}

#[tokio::test]
async fn test_expired_transaction_not_sent() {
    let h = harness();
    let mut m = sample_machine_tx();
    m.bills = vec![bill(dec!(1000))];
    h.coordinator.post(m.clone()).await.unwrap();

    h.clock.advance(Duration::minutes(61));
    let resp = h.coordinator.post(with_send(m)).await.unwrap();
    assert_eq!(resp.outcome, PostOutcome::Accumulated);
    assert_eq!(resp.status, TxStatus::Expired);
    assert_eq!(h.exchange.send_count(), 0);

    let view = h.coordinator.view(resp.tx.id).await.unwrap();
    assert!(view.expired);
}

#[tokio::test]
async fn test_cancel() {
    let h = harness();
    let mut m = sample_machine_tx();
    m.bills = vec![bill(dec!(1000))];
    h.coordinator.post(m.clone()).await.unwrap();

    let cancelled = h.coordinator.cancel(m.id).await.unwrap();
    assert!(cancelled.operator_completed);
    assert_eq!(cancelled.error_code.as_deref(), Some("operatorCancel"));
    assert_eq!(
        cancelled.status(h.clock.now(), default_pending_interval()),
        TxStatus::Cancelled
    );
    assert_eq!(
        h.store.actions(m.id)[0].action,
        ActionKind::OperatorCompleted
    );

    // Already cancelled
    assert!(matches!(
        h.coordinator.cancel(m.id).await,
        Err(CashInError::NotFound(_))
    ));

    // Cancelled sessions never send
    h.coordinator.post(with_send(m)).await.unwrap();
    assert_eq!(h.exchange.send_count(), 0);
}

#[tokio::test]
async fn test_cancel_after_send_fails() {
    let h = harness();
    let resp = h
        .coordinator
        .post(with_send(sample_machine_tx()))
        .await
        .unwrap();
    assert!(matches!(
        h.coordinator.cancel(resp.tx.id).await,
        Err(CashInError::NotFound(_))
    ));
    assert!(matches!(
        h.coordinator.cancel(TxId::new()).await,
        Err(CashInError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_monitor_reposts_pending_send() {
    let h = harness();
    let mut m = sample_machine_tx();
    m.bills = vec![bill(dec!(1000))];
    h.coordinator.post(m.clone()).await.unwrap();

    // Machine asked for the send but the post never reached us
    let mut stored = h.store.tx(m.id).unwrap();
    stored.send = true;
    h.store.insert_tx(stored);

    let monitor = PendingMonitor::with_defaults(h.coordinator.clone());
    assert_eq!(monitor.scan_once().await.unwrap(), 1);
    assert_eq!(h.exchange.send_count(), 1);
    assert!(h.store.tx(m.id).unwrap().send_confirmed);

    assert_eq!(monitor.scan_once().await.unwrap(), 0);
    assert_eq!(h.exchange.send_count(), 1);
}

#[tokio::test]
async fn test_invalid_machine_tx_rejected_before_merge() {
    let h = harness();
    let mut m = sample_machine_tx();
    m.crypto_code = String::new();
    assert!(matches!(
        h.coordinator.post(m.clone()).await,
        Err(CashInError::InvalidMachineTx(_))
    ));
    assert!(h.store.tx(m.id).is_none());
}

#[tokio::test]
async fn test_successful_send_runs_risk_evaluation() {
    let h = harness();
    h.store.set_role_default(
        Role::Normal,
        LimitTable {
            daily: dec!(300000),
            monthly: dec!(1000000),
            level1: dec!(500000),
            level1_days: 7,
            level2: dec!(2000000),
            level2_days: 60,
        },
    );
    let customers = Arc::new(MockCustomerDirectory::new());
    let invoices = Arc::new(MockInvoiceIssuer::new());
    let assessor = RiskAssessor::new(
        h.store.clone(),
        LimitPolicyResolver::new(h.store.clone(), None),
        SuspensionScheduler::default(),
    );
    let risk = Arc::new(RiskEvaluator::new(
        assessor,
        h.store.clone(),
        customers.clone(),
        h.notifier.clone(),
        invoices.clone(),
        h.clock.clone(),
    ));
    let gate = AddressPolicyGate::new(h.store.clone(), h.exchange.clone());
    let coordinator = CashInCoordinator::new(
        h.store.clone(),
        gate,
        h.exchange.clone(),
        h.notifier.clone(),
        h.clock.clone(),
        CashInSettings::default(),
    )
    .with_risk_evaluator(risk);

    let mut m = with_send(sample_machine_tx());
    m.bills = vec![bill(dec!(1000))];
    customers.insert(customer(m.customer_id));

    let resp = coordinator.post(m.clone()).await.unwrap();
    let report = resp.risk_report.unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.assessment.unwrap().sums.today, dec!(1000));
    assert_eq!(invoices.issued(), vec![(m.id, dec!(50))]);

    // Failed sends are not evaluated
    h.exchange.set_send_result(SendResult::Rejected {
        code: "InsufficientFundsError".into(),
        message: "insufficient funds".into(),
    });
    let mut other = with_send(sample_machine_tx());
    other.to_address = "bc1qanotheraddress".into();
    other.bills = vec![bill(dec!(1000))];
    let resp = coordinator.post(other).await.unwrap();
    assert!(resp.risk_report.is_none());
}
