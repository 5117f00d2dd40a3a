//! Read-only risk assessment
//!
//! Resolves limits and windows for a customer, queries the rolling sums
//! and reports which limits are breached. Nothing is written here; the
//! evaluator applies the consequences.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use super::error::RiskError;
use super::limits::{CustomerLimitSetting, EffectiveLimits, LimitPolicyResolver, Role};
use super::suspension::{
    EvaluationWindows, SuspensionKind, SuspensionScheduler, SuspensionWindow, WindowAnchors,
};
use crate::core_types::CustomerId;
use crate::ledger::FiatLedger;

/// EDD velocity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EddTier {
    Level1,
    Level2,
}

impl EddTier {
    pub fn number(&self) -> u8 {
        match self {
            EddTier::Level1 => 1,
            EddTier::Level2 => 2,
        }
    }

    /// `edd_type` tag recorded on escalation, e.g. `normal_level2`
    pub fn tag(&self, role: Role) -> String {
        format!("{}_level{}", role.as_str(), self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSums {
    pub today: Decimal,
    pub month: Decimal,
    pub level1: Decimal,
    pub level2: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub customer_id: CustomerId,
    pub role: Role,
    pub limits: EffectiveLimits,
    pub windows: EvaluationWindows,
    pub sums: WindowSums,
    pub daily_breach: bool,
    pub monthly_breach: bool,
    /// Breached tiers, ascending
    pub edd_breaches: Vec<EddTier>,
    /// Suspension with the later end among the breached kinds
    pub suspension: Option<SuspensionWindow>,
    pub evaluated_at: DateTime<Utc>,
}

impl RiskAssessment {
    pub fn highest_edd_tier(&self) -> Option<EddTier> {
        self.edd_breaches.iter().copied().max()
    }
}

/// An empty window never breaches, even against a zero limit
fn breached(sum: Decimal, limit: Decimal) -> bool {
    sum > Decimal::ZERO && sum >= limit
}

pub struct RiskAssessor {
    ledger: Arc<dyn FiatLedger>,
    resolver: LimitPolicyResolver,
    scheduler: SuspensionScheduler,
}

impl RiskAssessor {
    pub fn new(
        ledger: Arc<dyn FiatLedger>,
        resolver: LimitPolicyResolver,
        scheduler: SuspensionScheduler,
    ) -> Self {
        Self {
            ledger,
            resolver,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &SuspensionScheduler {
        &self.scheduler
    }

    /// `cib_expire_date` is the directory's raw Minguo date
    pub async fn assess(
        &self,
        setting: &CustomerLimitSetting,
        cib_expire_date: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<RiskAssessment, RiskError> {
        let customer_id = setting.customer_id;
        let limits = self.resolver.resolve(setting).await?;
        let anchors = WindowAnchors {
            cib_expiry: self.scheduler.cib_anchor(cib_expire_date),
            black_cleared_at: setting.last_black_to_normal_at,
        };
        let windows = self.scheduler.evaluation_windows(now, &limits, &anchors);

        let (today, month, level1, level2) = tokio::try_join!(
            self.ledger.sum_fiat_since(customer_id, windows.today),
            self.ledger.sum_fiat_since(customer_id, windows.month),
            self.ledger.sum_fiat_since(customer_id, windows.level1),
            self.ledger.sum_fiat_since(customer_id, windows.level2),
        )?;
        let sums = WindowSums {
            today,
            month,
            level1,
            level2,
        };

        let daily_breach = breached(sums.today, limits.daily);
        let monthly_breach = breached(sums.month, limits.monthly);

        let mut edd_breaches = Vec::new();
        if setting.role != Role::Blacklist {
            if breached(sums.level1, limits.level1) {
                edd_breaches.push(EddTier::Level1);
            }
            if breached(sums.level2, limits.level2) {
                edd_breaches.push(EddTier::Level2);
            }
        }

        let suspension = [
            daily_breach.then_some(SuspensionKind::Daily),
            monthly_breach.then_some(SuspensionKind::Monthly),
        ]
        .into_iter()
        .flatten()
        .map(|kind| self.scheduler.window(kind, now))
        .max_by_key(|w| w.end);

        debug!(
            customer_id = %customer_id,
            role = %setting.role,
            today = %sums.today,
            month = %sums.month,
            level1 = %sums.level1,
            level2 = %sums.level2,
            daily_breach,
            monthly_breach,
            edd = ?edd_breaches,
            "Risk assessed"
        );

        Ok(RiskAssessment {
            customer_id,
            role: setting.role,
            limits,
            windows,
            sums,
            daily_breach,
            monthly_breach,
            edd_breaches,
            suspension,
            evaluated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cash_in::types::CashInTransaction;
    use crate::cash_in::types::tests::sample_tx;
    use crate::clock::FixedClock;
    use crate::risk::limits::LimitTable;
    use crate::store::MemoryStore;
    use chrono::{Duration, FixedOffset, TimeZone};
    use rust_decimal_macros::dec;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn table() -> LimitTable {
        LimitTable {
            daily: dec!(300000),
            monthly: dec!(1000000),
            level1: dec!(500000),
            level1_days: 7,
            level2: dec!(2000000),
            level2_days: 60,
        }
    }

    fn setup(now: DateTime<Utc>) -> (Arc<MemoryStore>, RiskAssessor) {
        let store = Arc::new(MemoryStore::new(Arc::new(FixedClock::new(now))));
        store.set_role_default(Role::Normal, table());
        let assessor = RiskAssessor::new(
            store.clone(),
            LimitPolicyResolver::new(store.clone(), None),
            SuspensionScheduler::default(),
        );
        (store, assessor)
    }

    fn confirmed(customer_id: CustomerId, fiat: Decimal, created: DateTime<Utc>) -> CashInTransaction {
        let mut tx = sample_tx();
        tx.customer_id = customer_id;
        tx.fiat = fiat;
        tx.created = created;
        tx.send = true;
        tx.send_confirmed = true;
        tx
    }

    #[tokio::test]
    async fn test_daily_breach_at_limit() {
        let now = local(2024, 3, 15, 8, 0);
        let (store, assessor) = setup(now);
        let setting = CustomerLimitSetting::new_default(CustomerId::new());
        let id = setting.customer_id;
        store.insert_tx(confirmed(id, dec!(250000), now - Duration::hours(2)));
        store.insert_tx(confirmed(id, dec!(60000), now - Duration::minutes(1)));

        let a = assessor.assess(&setting, None, now).await.unwrap();
        assert_eq!(a.sums.today, dec!(310000));
        assert!(a.daily_breach);
        assert!(!a.monthly_breach);
        assert!(a.edd_breaches.is_empty());
        let s = a.suspension.unwrap();
        assert_eq!(s.kind, SuspensionKind::Daily);
        assert_eq!(s.end, local(2024, 3, 16, 0, 0));
    }

    #[tokio::test]
    async fn test_monthly_wins_over_daily() {
        let now = local(2024, 3, 15, 8, 0);
        let (store, assessor) = setup(now);
        let setting = CustomerLimitSetting::new_default(CustomerId::new());
        let id = setting.customer_id;
        store.insert_tx(confirmed(id, dec!(800000), local(2024, 3, 2, 10, 0)));
        store.insert_tx(confirmed(id, dec!(300000), now - Duration::hours(1)));

        let a = assessor.assess(&setting, None, now).await.unwrap();
        assert!(a.daily_breach);
        assert!(a.monthly_breach);
        assert_eq!(a.suspension.unwrap().kind, SuspensionKind::Monthly);
        // Only today's transaction falls inside the 7-day window
        assert_eq!(a.sums.level1, dec!(300000));
    }

    #[tokio::test]
    async fn test_edd_tiers_and_skip_for_blacklist() {
        let now = local(2024, 3, 15, 8, 0);
        let (store, assessor) = setup(now);
        let mut setting = CustomerLimitSetting::new_default(CustomerId::new());
        let id = setting.customer_id;
        store.insert_tx(confirmed(id, dec!(2100000), local(2024, 3, 13, 9, 0)));

        let a = assessor.assess(&setting, None, now).await.unwrap();
        assert_eq!(a.edd_breaches, vec![EddTier::Level1, EddTier::Level2]);
        assert_eq!(a.highest_edd_tier(), Some(EddTier::Level2));
        assert_eq!(EddTier::Level2.tag(a.role), "normal_level2");

        setting.role = Role::Blacklist;
        let a = assessor.assess(&setting, None, now).await.unwrap();
        assert!(a.edd_breaches.is_empty());
    }

    #[tokio::test]
    async fn test_black_cleared_anchor_hides_history() {
        let now = local(2024, 3, 15, 8, 0);
        let (store, assessor) = setup(now);
        let mut setting = CustomerLimitSetting::new_default(CustomerId::new());
        let id = setting.customer_id;
        store.insert_tx(confirmed(id, dec!(900000), local(2024, 3, 5, 9, 0)));
        store.insert_tx(confirmed(id, dec!(200000), local(2024, 3, 14, 9, 0)));
        setting.last_black_to_normal_at = Some(local(2024, 3, 10, 0, 0));

        let a = assessor.assess(&setting, None, now).await.unwrap();
        assert_eq!(a.sums.month, dec!(200000));
        assert!(!a.monthly_breach);
    }
}
