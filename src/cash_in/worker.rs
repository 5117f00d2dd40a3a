//! Pending Monitor
//!
//! Background task that re-posts cash-in sessions which asked for a send
//! but never got one (e.g. the machine lost its connection mid-post).
//!
//! Rows are processed one at a time so the wallet and exchange never see
//! more than one retry in flight from this task.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::coordinator::CashInCoordinator;
use super::error::CashInError;
use super::state::PENDING_INTERVAL_MINUTES;
use super::types::MachineTx;

/// Rows re-posted per scan
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub scan_interval: Duration,
    /// Only rows younger than this are retried
    pub pending_interval: chrono::Duration,
    pub batch_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            pending_interval: chrono::Duration::minutes(PENDING_INTERVAL_MINUTES),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

pub struct PendingMonitor {
    coordinator: Arc<CashInCoordinator>,
    config: MonitorConfig,
}

impl PendingMonitor {
    pub fn new(coordinator: Arc<CashInCoordinator>, config: MonitorConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub fn with_defaults(coordinator: Arc<CashInCoordinator>) -> Self {
        Self::new(coordinator, MonitorConfig::default())
    }

    /// Scan forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            pending_interval_mins = self.config.pending_interval.num_minutes(),
            batch_size = self.config.batch_size,
            "Starting pending cash-in monitor"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Pending scan failed");
            }
            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// One scan; returns how many rows were re-posted without error
    pub async fn scan_once(&self) -> Result<usize, CashInError> {
        let pending = self
            .coordinator
            .store()
            .find_pending(self.config.pending_interval, self.config.batch_size)
            .await?;

        if pending.is_empty() {
            debug!("No pending cash-in transactions");
            return Ok(0);
        }
        info!(count = pending.len(), "Re-posting pending cash-in transactions");

        let mut reposted = 0;
        for tx in &pending {
            match self.coordinator.post(MachineTx::resume(tx)).await {
                Ok(resp) => {
                    debug!(
                        tx_id = %tx.id,
                        status = %resp.status,
                        outcome = ?resp.outcome,
                        "Pending cash-in re-posted"
                    );
                    reposted += 1;
                }
                Err(e) => {
                    error!(tx_id = %tx.id, error = %e, "Failed to re-post pending cash-in");
                }
            }
        }
        Ok(reposted)
    }
}
