//! Address Policy Gate
//!
//! Decides whether coins may be sent to a destination address. Four
//! independent checks are run concurrently:
//!
//! - global blacklist: exact, case-sensitive match per crypto code
//! - customer whitelist: case-insensitive, soft-deleted rows ignored
//! - address reuse: the address appears on any other cash-in transaction
//! - wallet scoring: delegated to the exchange, only when the operator enabled it
//!
//! A whitelisted destination overrides both blacklist and reuse. Wallet
//! scoring blocks on its own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::{Exchange, WalletScore};
use crate::cash_in::types::CashInTransaction;
use crate::core_types::{CryptoCode, CustomerId, TxId};
use crate::store::StoreError;

/// Why a destination was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    Blacklisted,
    AddressReused,
    ScoreThresholdReached,
    WalletScoringError,
}

impl RejectReason {
    /// Text written to the transaction's `error` column
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::Blacklisted => "Blacklisted Address",
            RejectReason::AddressReused => "Address Reused",
            RejectReason::ScoreThresholdReached => "Chain analysis score is above defined threshold",
            RejectReason::WalletScoringError => "Wallet scoring failed",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Blacklisted => "blacklisted",
            RejectReason::AddressReused => "addressReused",
            RejectReason::ScoreThresholdReached => "scoreThresholdReached",
            RejectReason::WalletScoringError => "walletScoringError",
        }
    }

    /// Blacklist and reuse detections raise an operator alert
    pub fn is_address_block(&self) -> bool {
        matches!(self, RejectReason::Blacklisted | RejectReason::AddressReused)
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Global blacklist row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub address: String,
    pub crypto_code: CryptoCode,
    /// Free-text source of the listing (OFAC, manual...)
    pub content: Option<String>,
}

/// Customer-scoped whitelist row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub customer_id: CustomerId,
    pub address: String,
    pub crypto_code: CryptoCode,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WhitelistEntry {
    pub fn matches(&self, customer_id: CustomerId, address: &str, crypto_code: &str) -> bool {
        self.deleted_at.is_none()
            && self.customer_id == customer_id
            && self.crypto_code == crypto_code
            && self.address.eq_ignore_ascii_case(address)
    }
}

/// Lookups backing the gate
#[async_trait]
pub trait AddressPolicyStore: Send + Sync {
    async fn blacklisted(
        &self,
        address: &str,
        crypto_code: &str,
    ) -> Result<Option<BlacklistEntry>, StoreError>;

    async fn whitelisted(
        &self,
        customer_id: CustomerId,
        address: &str,
        crypto_code: &str,
    ) -> Result<bool, StoreError>;

    /// `true` if any cash-in other than `tx_id` used this address
    async fn address_reused(&self, tx_id: TxId, address: &str) -> Result<bool, StoreError>;
}

/// Result of all checks for one destination
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AddressVerdict {
    pub blacklisted: bool,
    pub whitelisted: bool,
    pub address_reused: bool,
    /// `None` when scoring is disabled ("no opinion")
    pub wallet_score: Option<WalletScore>,
    pub scoring_error: bool,
}

impl AddressVerdict {
    /// First blocking reason, if any
    pub fn rejection(&self, reject_address_reuse: bool) -> Option<RejectReason> {
        if !self.whitelisted {
            if self.blacklisted {
                return Some(RejectReason::Blacklisted);
            }
            if reject_address_reuse && self.address_reused {
                return Some(RejectReason::AddressReused);
            }
        }
        if self.wallet_score.is_some_and(|s| !s.is_valid) {
            return Some(RejectReason::ScoreThresholdReached);
        }
        if self.scoring_error {
            return Some(RejectReason::WalletScoringError);
        }
        None
    }
}

pub struct AddressPolicyGate {
    store: Arc<dyn AddressPolicyStore>,
    exchange: Arc<dyn Exchange>,
}

impl AddressPolicyGate {
    pub fn new(store: Arc<dyn AddressPolicyStore>, exchange: Arc<dyn Exchange>) -> Self {
        Self { store, exchange }
    }

    /// Run every check for `tx`.
    ///
    /// Store failures propagate; a scoring failure is folded into the verdict.
    pub async fn evaluate(&self, tx: &CashInTransaction) -> Result<AddressVerdict, StoreError> {
        let (blacklisted, whitelisted, address_reused, score) = tokio::join!(
            self.store.blacklisted(&tx.to_address, &tx.crypto_code),
            self.store
                .whitelisted(tx.customer_id, &tx.to_address, &tx.crypto_code),
            self.store.address_reused(tx.id, &tx.to_address),
            self.wallet_score(tx),
        );

        let (wallet_score, scoring_error) = score;
        let verdict = AddressVerdict {
            blacklisted: blacklisted?.is_some(),
            whitelisted: whitelisted?,
            address_reused: address_reused?,
            wallet_score,
            scoring_error,
        };

        debug!(
            tx_id = %tx.id,
            blacklisted = verdict.blacklisted,
            whitelisted = verdict.whitelisted,
            address_reused = verdict.address_reused,
            score = ?verdict.wallet_score,
            "Address policy evaluated"
        );
        Ok(verdict)
    }

    async fn wallet_score(&self, tx: &CashInTransaction) -> (Option<WalletScore>, bool) {
        match self.exchange.is_wallet_scoring_enabled(tx).await {
            Ok(false) => (None, false),
            Ok(true) => match self
                .exchange
                .rate_address(&tx.crypto_code, &tx.to_address)
                .await
            {
                Ok(score) => (Some(score), false),
                Err(e) => {
                    warn!(tx_id = %tx.id, error = %e, "Wallet scoring failed");
                    (None, true)
                }
            },
            Err(e) => {
                warn!(tx_id = %tx.id, error = %e, "Wallet scoring toggle unavailable");
                (None, true)
            }
        }
    }
}
