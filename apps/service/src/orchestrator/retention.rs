//! Automatic retention of check history.
//!
//! Outcomes older than the configured number of days are pruned every hour.
//! Only the current leader prunes, so instances sharing a database do not
//! race on the same delete.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::leader::LeaderElector;
use crate::database::HistoryStore;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Cleanup manager for expired outcomes
pub struct RetentionCleanup {
    history: Arc<dyn HistoryStore>,
    elector: Arc<LeaderElector>,
    retention_days: u32,
}

impl RetentionCleanup {
    pub fn new(history: Arc<dyn HistoryStore>, elector: Arc<LeaderElector>, retention_days: u32) -> Self {
        Self { history, elector, retention_days }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Prune once. Standby nodes skip and report zero.
    pub async fn cleanup_expired_results(&self) -> Result<u64> {
        if !self.elector.is_leader() {
            debug!("Skipping retention cleanup on standby node");
            return Ok(0);
        }

        let deleted = self.history.prune(self.retention_days).await?;
        info!(
            "Retention cleanup completed: {} outcome(s) older than {} days deleted",
            deleted, self.retention_days
        );
        Ok(deleted)
    }

    /// Start background cleanup task (runs every hour)
    pub fn start_periodic_cleanup(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.cleanup_expired_results().await {
                            warn!("Periodic retention cleanup failed: {:#}", e);
                        }
                    }
                }
            }
        })
    }
}
