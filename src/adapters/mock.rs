//! Mock collaborators for testing

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::*;

pub struct MockExchange {
    buy_count: AtomicUsize,
    send_count: AtomicUsize,
    rate_count: AtomicUsize,
    /// Result returned by every `send_coins`
    send_result: Mutex<SendResult>,
    scoring_enabled: AtomicBool,
    score: Mutex<Option<WalletScore>>,
    fail_buy: AtomicBool,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            buy_count: AtomicUsize::new(0),
            send_count: AtomicUsize::new(0),
            rate_count: AtomicUsize::new(0),
            send_result: Mutex::new(SendResult::Confirmed {
                tx_hash: "mock-hash".to_string(),
                fee: None,
            }),
            scoring_enabled: AtomicBool::new(false),
            score: Mutex::new(None),
            fail_buy: AtomicBool::new(false),
        }
    }

    pub fn set_send_result(&self, result: SendResult) {
        *self.send_result.lock().unwrap() = result;
    }

    /// Enable scoring; `None` makes `rate_address` fail
    pub fn set_wallet_score(&self, score: Option<WalletScore>) {
        self.scoring_enabled.store(true, Ordering::SeqCst);
        *self.score.lock().unwrap() = score;
    }

    pub fn set_fail_buy(&self, fail: bool) {
        self.fail_buy.store(fail, Ordering::SeqCst);
    }

    pub fn buy_count(&self) -> usize {
        self.buy_count.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn rate_count(&self) -> usize {
        self.rate_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn buy(&self, _bill: &Bill, _tx: &CashInTransaction) -> Result<(), CollaboratorError> {
        self.buy_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_buy.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                service: "exchange",
                message: "mock buy failure".to_string(),
            });
        }
        Ok(())
    }

    async fn send_coins(&self, _tx: &CashInTransaction) -> SendResult {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        // Give concurrent posts a chance to interleave
        tokio::task::yield_now().await;
        self.send_result.lock().unwrap().clone()
    }

    async fn is_wallet_scoring_enabled(
        &self,
        _tx: &CashInTransaction,
    ) -> Result<bool, CollaboratorError> {
        Ok(self.scoring_enabled.load(Ordering::SeqCst))
    }

    async fn rate_address(
        &self,
        _crypto_code: &str,
        _address: &str,
    ) -> Result<WalletScore, CollaboratorError> {
        self.rate_count.fetch_add(1, Ordering::SeqCst);
        // Scoring is remote; let other posts for the session run meanwhile
        tokio::task::yield_now().await;
        (*self.score.lock().unwrap()).ok_or_else(|| CollaboratorError::Unavailable {
            service: "wallet-scoring",
            message: "mock scoring failure".to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Operator { tx_id: TxId },
    Blacklisted { tx_id: TxId, is_address_reuse: bool },
    Compliance {
        customer_id: CustomerId,
        action: ComplianceAction,
        period_days: Option<u32>,
    },
}

pub struct MockNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    fn push(&self, n: Notification) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push(n);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                service: "notifier",
                message: "mock transport down".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify_operator(
        &self,
        tx: &CashInTransaction,
        _record: &SendRecord,
    ) -> Result<(), CollaboratorError> {
        self.push(Notification::Operator { tx_id: tx.id })
    }

    async fn notify_blacklisted(
        &self,
        tx: &CashInTransaction,
        is_address_reuse: bool,
    ) -> Result<(), CollaboratorError> {
        self.push(Notification::Blacklisted {
            tx_id: tx.id,
            is_address_reuse,
        })
    }

    async fn compliance_notify(
        &self,
        customer: &Customer,
        _device_id: DeviceId,
        action: ComplianceAction,
        period_days: Option<u32>,
    ) -> Result<(), CollaboratorError> {
        self.push(Notification::Compliance {
            customer_id: customer.id,
            action,
            period_days,
        })
    }
}

pub struct MockInvoiceIssuer {
    issued: Mutex<Vec<(TxId, Decimal)>>,
    fail: AtomicBool,
}

impl MockInvoiceIssuer {
    pub fn new() -> Self {
        Self {
            issued: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<(TxId, Decimal)> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl InvoiceIssuer for MockInvoiceIssuer {
    async fn issue_invoice(
        &self,
        tx_id: TxId,
        _customer_id: CustomerId,
        _email: Option<&str>,
        amount: Decimal,
    ) -> Result<IssuedInvoice, CollaboratorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected {
                service: "invoice",
                message: "mock invoice failure".to_string(),
            });
        }
        self.issued.lock().unwrap().push((tx_id, amount));
        Ok(IssuedInvoice {
            invoice_no: format!("AB{:08}", self.issued.lock().unwrap().len()),
            invoice_date: None,
            random_number: "1234".to_string(),
            raw: serde_json::json!({ "RtnCode": 1 }),
        })
    }
}

pub struct MockCustomerDirectory {
    customers: Mutex<HashMap<CustomerId, Customer>>,
}

impl MockCustomerDirectory {
    pub fn new() -> Self {
        Self {
            customers: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, customer: Customer) {
        self.customers.lock().unwrap().insert(customer.id, customer);
    }

    pub fn get(&self, id: CustomerId) -> Option<Customer> {
        self.customers.lock().unwrap().get(&id).cloned()
    }
}

pub fn customer(id: CustomerId) -> Customer {
    Customer {
        id,
        phone: Some("+886912345678".to_string()),
        email: Some("customer@example.com".to_string()),
        suspended_until: None,
        authorized_override: None,
        cib_expire_date: None,
    }
}

#[async_trait]
impl CustomerDirectory for MockCustomerDirectory {
    async fn get_by_id(&self, id: CustomerId) -> Result<Option<Customer>, CollaboratorError> {
        Ok(self.customers.lock().unwrap().get(&id).cloned())
    }

    async fn update(
        &self,
        id: CustomerId,
        patch: CustomerPatch,
    ) -> Result<Customer, CollaboratorError> {
        let mut customers = self.customers.lock().unwrap();
        let customer = customers
            .get_mut(&id)
            .ok_or(CollaboratorError::CustomerNotFound(id))?;
        if let Some(until) = patch.suspended_until {
            customer.suspended_until = Some(until);
        }
        if let Some(ov) = patch.authorized_override {
            customer.authorized_override = Some(ov);
        }
        Ok(customer.clone())
    }
}
