//! Limit Policy Resolver
//!
//! Turns a customer's stored limit setting into the limits actually enforced.
//!
//! Resolution per field: the customer's override when present, else the
//! role's default row, else the configured policy floor. A Blacklist role
//! short-circuits to zero limits whatever is stored. `None` means "unset";
//! a stored zero is a real limit.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::RiskError;
use super::store::RiskStore;
use crate::core_types::CustomerId;

/// EDD tier windows reported for blacklisted customers
pub const BLACKLIST_LEVEL1_DAYS: u32 = 7;
pub const BLACKLIST_LEVEL2_DAYS: u32 = 60;

/// Customer risk tier, stored numerically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Whitelist = 1,
    Normal = 2,
    Blacklist = 3,
}

impl Role {
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Role::Whitelist),
            2 => Some(Role::Normal),
            3 => Some(Role::Blacklist),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Whitelist => "whitelist",
            Role::Normal => "normal",
            Role::Blacklist => "blacklist",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-customer policy row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerLimitSetting {
    pub customer_id: CustomerId,
    pub role: Role,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub level1: Option<Decimal>,
    pub level1_days: Option<u32>,
    pub level2: Option<Decimal>,
    pub level2_days: Option<u32>,
    /// Most recent Blacklist -> Normal transition
    pub last_black_to_normal_at: Option<DateTime<Utc>>,
    /// `{role}_level{n}` tag of the last EDD escalation
    pub edd_type: Option<String>,
    pub is_edd: bool,
}

impl CustomerLimitSetting {
    /// Row created on a customer's first transaction
    pub fn new_default(customer_id: CustomerId) -> Self {
        Self {
            customer_id,
            role: Role::Normal,
            daily_limit: None,
            monthly_limit: None,
            level1: None,
            level1_days: None,
            level2: None,
            level2_days: None,
            last_black_to_normal_at: None,
            edd_type: None,
            is_edd: false,
        }
    }

    fn fully_customized(&self) -> bool {
        self.daily_limit.is_some()
            && self.monthly_limit.is_some()
            && self.level1.is_some()
            && self.level1_days.is_some()
            && self.level2.is_some()
            && self.level2_days.is_some()
    }
}

/// A complete set of limits (role default row or policy floor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitTable {
    pub daily: Decimal,
    pub monthly: Decimal,
    pub level1: Decimal,
    pub level1_days: u32,
    pub level2: Decimal,
    pub level2_days: u32,
}

/// Where the fallback values of an [`EffectiveLimits`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LimitSource {
    /// Every field was overridden on the customer
    Customized,
    RoleDefault,
    PolicyFloor,
    Blacklisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveLimits {
    pub daily: Decimal,
    pub monthly: Decimal,
    pub level1: Decimal,
    pub level1_days: u32,
    pub level2: Decimal,
    pub level2_days: u32,
    pub source: LimitSource,
}

impl EffectiveLimits {
    pub fn blacklisted() -> Self {
        Self {
            daily: Decimal::ZERO,
            monthly: Decimal::ZERO,
            level1: Decimal::ZERO,
            level1_days: BLACKLIST_LEVEL1_DAYS,
            level2: Decimal::ZERO,
            level2_days: BLACKLIST_LEVEL2_DAYS,
            source: LimitSource::Blacklisted,
        }
    }

    /// Overlay the customer's overrides on `base`
    pub fn merge(setting: &CustomerLimitSetting, base: &LimitTable, source: LimitSource) -> Self {
        Self {
            daily: setting.daily_limit.unwrap_or(base.daily),
            monthly: setting.monthly_limit.unwrap_or(base.monthly),
            level1: setting.level1.unwrap_or(base.level1),
            level1_days: setting.level1_days.unwrap_or(base.level1_days),
            level2: setting.level2.unwrap_or(base.level2),
            level2_days: setting.level2_days.unwrap_or(base.level2_days),
            source,
        }
    }

    fn customized(setting: &CustomerLimitSetting) -> Option<Self> {
        Some(Self {
            daily: setting.daily_limit?,
            monthly: setting.monthly_limit?,
            level1: setting.level1?,
            level1_days: setting.level1_days?,
            level2: setting.level2?,
            level2_days: setting.level2_days?,
            source: LimitSource::Customized,
        })
    }
}

pub struct LimitPolicyResolver {
    store: Arc<dyn RiskStore>,
    floor: Option<LimitTable>,
}

impl LimitPolicyResolver {
    pub fn new(store: Arc<dyn RiskStore>, floor: Option<LimitTable>) -> Self {
        Self { store, floor }
    }

    pub async fn resolve(
        &self,
        setting: &CustomerLimitSetting,
    ) -> Result<EffectiveLimits, RiskError> {
        if setting.role == Role::Blacklist {
            return Ok(EffectiveLimits::blacklisted());
        }
        if setting.fully_customized()
            && let Some(limits) = EffectiveLimits::customized(setting)
        {
            return Ok(limits);
        }

        let limits = match self.store.fetch_default_limit(setting.role).await? {
            Some(table) => EffectiveLimits::merge(setting, &table, LimitSource::RoleDefault),
            None => {
                let floor = self
                    .floor
                    .ok_or(RiskError::MissingRoleDefault(setting.role))?;
                debug!(
                    customer_id = %setting.customer_id,
                    role = %setting.role,
                    "No role default row, using policy floor"
                );
                EffectiveLimits::merge(setting, &floor, LimitSource::PolicyFloor)
            }
        };
        Ok(limits)
    }
}
