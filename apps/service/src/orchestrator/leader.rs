//! Lease-based leader election.
//!
//! Instances sharing one database race for a single lease row. Only the
//! holder runs probes; everyone else keeps ticking in standby and takes over
//! once the lease expires or is released.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::LeaseStore;

/// Log target for leadership transitions
pub const LEASE_LOG: &str = "modelwatch::lease";

pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    node_id: String,
    ttl: chrono::Duration,
    is_leader: AtomicBool,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LeaseStore>, node_id: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120));
        Self { store, node_id: node_id.into(), ttl, is_leader: AtomicBool::new(false) }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Role observed by the most recent election round
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Claim an expired lease or renew our own. Store errors count as standby.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> bool {
        let leader = match self.elect(now).await {
            Ok(leader) => leader,
            Err(e) => {
                warn!(target: LEASE_LOG, node_id = %self.node_id, "Lease check failed, standing by: {:#}", e);
                false
            }
        };

        let was_leader = self.is_leader.swap(leader, Ordering::AcqRel);
        match (was_leader, leader) {
            (false, true) => info!(target: LEASE_LOG, node_id = %self.node_id, "Acquired scheduler lease"),
            (true, false) => warn!(target: LEASE_LOG, node_id = %self.node_id, "Lost scheduler lease"),
            _ => debug!(target: LEASE_LOG, node_id = %self.node_id, leader, "Lease unchanged"),
        }
        leader
    }

    async fn elect(&self, now: DateTime<Utc>) -> Result<bool> {
        let expires_at = now + self.ttl;
        match self.store.read_lease().await? {
            Some(lease) if lease.is_held_by(&self.node_id, now) => {
                self.store.renew_lease(&self.node_id, now, expires_at).await
            }
            Some(lease) if lease.is_live(now) => Ok(false),
            _ => self.store.claim_lease(&self.node_id, now, expires_at).await,
        }
    }

    /// Give the lease up so a standby can take over without waiting for expiry.
    pub async fn release(&self) -> bool {
        self.is_leader.store(false, Ordering::Release);
        match self.store.release_lease(&self.node_id, Utc::now()).await {
            Ok(released) => {
                if released {
                    info!(target: LEASE_LOG, node_id = %self.node_id, "Released scheduler lease");
                }
                released
            }
            Err(e) => {
                warn!(target: LEASE_LOG, node_id = %self.node_id, "Failed to release lease: {:#}", e);
                false
            }
        }
    }
}
