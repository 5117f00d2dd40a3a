use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::calendar::{BusinessCalendar, DEFAULT_UTC_OFFSET_HOURS};
use crate::cash_in::state::PENDING_INTERVAL_MINUTES;
use crate::cash_in::worker::DEFAULT_BATCH_SIZE;
use crate::cash_in::{CashInSettings, MonitorConfig};
use crate::risk::LimitTable;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Per-target level overrides, e.g. `btm_server::risk: debug`
    #[serde(default = "default_log_targets")]
    pub log_targets: BTreeMap<String, String>,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    /// PostgreSQL connection URL; the operator binary refuses to start without it
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Operator business timezone, hours east of UTC
    #[serde(default = "default_utc_offset_hours")]
    pub business_utc_offset_hours: i32,
    #[serde(default)]
    pub cash_in: CashInConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub risk: RiskConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// sqlx logs every statement at info
fn default_log_targets() -> BTreeMap<String, String> {
    BTreeMap::from([("sqlx".to_string(), "warn".to_string())])
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file() -> String {
    "btm-server.log".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_utc_offset_hours() -> i32 {
    DEFAULT_UTC_OFFSET_HOURS
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CashInConfig {
    /// Age after which an unsent transaction is expired
    pub pending_interval_minutes: i64,
    pub monitor_scan_interval_secs: u64,
    pub monitor_batch_size: usize,
}

impl Default for CashInConfig {
    fn default() -> Self {
        Self {
            pending_interval_minutes: PENDING_INTERVAL_MINUTES,
            monitor_scan_interval_secs: 10,
            monitor_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ComplianceConfig {
    pub reject_address_reuse: bool,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            reject_address_reuse: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RiskConfig {
    /// Used when a role has no default limit row
    #[serde(default)]
    pub policy_floor: Option<LimitTable>,
    #[serde(default = "default_true")]
    pub invoicing_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            policy_floor: None,
            invoicing_enabled: true,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.cash_in.pending_interval_minutes <= 0 {
            anyhow::bail!("cash_in.pending_interval_minutes must be positive");
        }
        if self.cash_in.monitor_batch_size == 0 {
            anyhow::bail!("cash_in.monitor_batch_size must be positive");
        }
        if BusinessCalendar::from_utc_offset_hours(self.business_utc_offset_hours).is_none() {
            anyhow::bail!(
                "business_utc_offset_hours out of range: {}",
                self.business_utc_offset_hours
            );
        }
        Ok(())
    }

    pub fn calendar(&self) -> BusinessCalendar {
        BusinessCalendar::from_utc_offset_hours(self.business_utc_offset_hours).unwrap_or_default()
    }

    pub fn pending_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cash_in.pending_interval_minutes)
    }

    pub fn cash_in_settings(&self) -> CashInSettings {
        CashInSettings {
            pending_interval: self.pending_interval(),
            reject_address_reuse: self.compliance.reject_address_reuse,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            scan_interval: Duration::from_secs(self.cash_in.monitor_scan_interval_secs),
            pending_interval: self.pending_interval(),
            batch_size: self.cash_in.monitor_batch_size,
        }
    }
}
