//! In-process stores for unit tests of the scheduling core.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

use super::models::{Lease, Target};
use super::repository::{HistoryStore, LeaseStore, RecentHistory, TargetStore};
use crate::monitoring::types::CheckOutcome;

pub struct MemoryStore {
    targets: Mutex<Vec<Target>>,
    history: Mutex<Vec<CheckOutcome>>,
    lease: Mutex<Lease>,
    pub append_calls: AtomicUsize,
    pub fail_lease: AtomicBool,
}

impl MemoryStore {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets: Mutex::new(targets),
            history: Mutex::new(Vec::new()),
            lease: Mutex::new(Lease {
                owner_id: None,
                expires_at: DateTime::<Utc>::UNIX_EPOCH,
                updated_at: DateTime::<Utc>::UNIX_EPOCH,
            }),
            append_calls: AtomicUsize::new(0),
            fail_lease: AtomicBool::new(false),
        }
    }

    pub fn history(&self) -> Vec<CheckOutcome> {
        self.history.lock().unwrap().clone()
    }

    pub fn lease(&self) -> Lease {
        self.lease.lock().unwrap().clone()
    }

    fn check_lease_failure(&self) -> Result<()> {
        if self.fail_lease.load(Ordering::SeqCst) {
            Err(anyhow!("lease store unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn list_enabled_targets(&self) -> Result<Vec<Target>> {
        Ok(self.targets.lock().unwrap().iter().filter(|t| t.enabled).cloned().collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append_batch(&self, outcomes: &[CheckOutcome]) -> Result<usize> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().unwrap().extend_from_slice(outcomes);
        Ok(outcomes.len())
    }

    async fn fetch_recent(
        &self,
        limit_per_target: usize,
        target_ids: Option<&[Uuid]>,
    ) -> Result<RecentHistory> {
        let mut recent = RecentHistory::new();
        let history = self.history.lock().unwrap();
        for outcome in history.iter().rev() {
            if target_ids.is_some_and(|ids| !ids.contains(&outcome.target_id)) {
                continue;
            }
            let entry = recent.entry(outcome.target_id).or_default();
            if entry.len() < limit_per_target {
                entry.push(outcome.clone());
            }
        }
        Ok(recent)
    }

    async fn prune(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut history = self.history.lock().unwrap();
        let before = history.len();
        history.retain(|o| o.checked_at >= cutoff);
        Ok((before - history.len()) as u64)
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn read_lease(&self) -> Result<Option<Lease>> {
        self.check_lease_failure()?;
        Ok(Some(self.lease()))
    }

    async fn claim_lease(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_lease_failure()?;
        let mut lease = self.lease.lock().unwrap();
        if lease.expires_at < now {
            *lease = Lease { owner_id: Some(node_id.to_string()), expires_at, updated_at: now };
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn renew_lease(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_lease_failure()?;
        let mut lease = self.lease.lock().unwrap();
        if lease.owner_id.as_deref() == Some(node_id) && lease.expires_at > now {
            lease.expires_at = expires_at;
            lease.updated_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lease(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.check_lease_failure()?;
        let mut lease = self.lease.lock().unwrap();
        if lease.owner_id.as_deref() == Some(node_id) {
            *lease = Lease {
                owner_id: None,
                expires_at: DateTime::<Utc>::UNIX_EPOCH,
                updated_at: now,
            };
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
