//! Read side: cached, single-flight snapshots of recent outcomes.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::official_status::OfficialStatusPoller;
use crate::database::{HistoryStore, Target, TargetStore};
use crate::monitoring::MonitoringScheduler;
use crate::monitoring::types::{CheckOutcome, CheckStatus, OfficialStatus, Vendor};

/// Refresh failure shared by every caller awaiting the same computation
#[derive(Debug, Clone, Error)]
#[error("snapshot refresh failed: {0}")]
pub struct RefreshError(String);

impl From<anyhow::Error> for RefreshError {
    fn from(err: anyhow::Error) -> Self {
        RefreshError(format!("{err:#}"))
    }
}

/// Anything holding derived data that a new batch makes stale
pub trait Invalidate: Send + Sync {
    fn invalidate_all(&self);
}

type SharedRefresh<T> = Shared<BoxFuture<'static, Result<Arc<T>, RefreshError>>>;

struct Entry<T> {
    /// Last known value; kept across invalidation so a failed refresh can fall back to it
    value: Option<Arc<T>>,
    /// `None` once invalidated
    refreshed_at: Option<Instant>,
    in_flight: Option<SharedRefresh<T>>,
    /// Bumped by every invalidation; a refresh started under an older
    /// generation does not store its result.
    generation: u64,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Self { value: None, refreshed_at: None, in_flight: None, generation: 0 }
    }
}

/// TTL cache where at most one refresh per key runs at a time; concurrent
/// callers await the same in-flight result.
pub struct SnapshotCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Send + Sync + 'static> SnapshotCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fresh cached value, else the in-flight refresh, else a new refresh
    /// started from `refresh`. The refresh runs on its own task, so a caller
    /// that gives up does not cancel it for the others.
    ///
    /// A failed refresh is logged and answered with the last known value;
    /// it is only an error when nothing was ever computed for `key`.
    pub async fn get_or_refresh<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        refresh: F,
    ) -> Result<Arc<T>, RefreshError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let pending = {
            let mut entries = self.lock();
            let entry = entries.entry(key.to_string()).or_default();

            if let (Some(value), Some(at)) = (&entry.value, entry.refreshed_at) {
                if at.elapsed() < self.ttl {
                    return Ok(Arc::clone(value));
                }
            }

            match &entry.in_flight {
                Some(pending) if pending.peek().is_none() => pending.clone(),
                _ => {
                    let cache = Arc::clone(self);
                    let owned_key = key.to_string();
                    let generation = entry.generation;
                    let work = refresh();
                    let task = tokio::spawn(async move {
                        let result = work.await.map(Arc::new).map_err(RefreshError::from);
                        cache.complete(&owned_key, generation, &result);
                        result
                    });
                    let pending: SharedRefresh<T> = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(RefreshError(format!("refresh task ended abnormally: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    entry.in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        match pending.await {
            Ok(value) => Ok(value),
            Err(err) => match self.cached(key) {
                Some(stale) => {
                    warn!(key, error = %err, "Refresh failed, serving last known value");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    fn complete(&self, key: &str, generation: u64, result: &Result<Arc<T>, RefreshError>) {
        let mut entries = self.lock();
        let entry = entries.entry(key.to_string()).or_default();
        if entry.generation != generation {
            debug!(key, "Discarding refresh started before invalidation");
            return;
        }
        entry.in_flight = None;
        if let Ok(value) = result {
            entry.value = Some(Arc::clone(value));
            entry.refreshed_at = Some(Instant::now());
        }
    }

    /// Last stored value regardless of age
    pub fn cached(&self, key: &str) -> Option<Arc<T>> {
        self.lock().get(key).and_then(|entry| entry.value.clone())
    }
}

impl<T: Send + Sync + 'static> Invalidate for SnapshotCache<T> {
    /// Marks every value stale and detaches in-flight refreshes, whose
    /// results may predate the change.
    fn invalidate_all(&self) {
        for entry in self.lock().values_mut() {
            entry.refreshed_at = None;
            entry.in_flight = None;
            entry.generation += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Probe before answering
    Always,
    /// Probe only when some target has no history yet
    Missing,
    /// Answer from history alone
    #[default]
    Never,
}

impl FromStr for RefreshMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" | "1" | "true" => Ok(RefreshMode::Always),
            "missing" => Ok(RefreshMode::Missing),
            "never" | "0" | "false" | "" => Ok(RefreshMode::Never),
            other => Err(anyhow::anyhow!("Unknown refresh mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub poll_interval_seconds: u64,
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub target_id: Uuid,
    pub name: String,
    pub vendor: Vendor,
    pub model: String,
    pub endpoint: String,
    pub maintenance: bool,
    pub latest: Option<CheckOutcome>,
    /// Newest first
    pub history: Vec<CheckOutcome>,
    pub official_status: Option<OfficialStatus>,
}

/// Key covering everything a snapshot depends on besides history
pub fn cache_key(poll_interval: Duration, targets: &[Target]) -> String {
    let mut ids: Vec<String> = targets.iter().map(|t| t.id.to_string()).collect();
    ids.sort();
    format!("{}:{}", poll_interval.as_secs(), ids.join(","))
}

/// What downstream readers call
pub struct SnapshotService {
    targets: Arc<dyn TargetStore>,
    history: Arc<dyn HistoryStore>,
    scheduler: Arc<MonitoringScheduler>,
    official: Arc<OfficialStatusPoller>,
    cache: Arc<SnapshotCache<Snapshot>>,
    window: usize,
}

impl SnapshotService {
    pub fn new(
        targets: Arc<dyn TargetStore>,
        history: Arc<dyn HistoryStore>,
        scheduler: Arc<MonitoringScheduler>,
        official: Arc<OfficialStatusPoller>,
        cache: Arc<SnapshotCache<Snapshot>>,
        window: usize,
    ) -> Self {
        Self { targets, history, scheduler, official, cache, window: window.max(1) }
    }

    pub async fn get_snapshot(&self, mode: RefreshMode) -> Result<Arc<Snapshot>, RefreshError> {
        let targets = self.targets.list_enabled_targets().await?;
        let poll_interval = self.scheduler.poll_interval();
        let key = cache_key(poll_interval, &targets);

        let history = Arc::clone(&self.history);
        let scheduler = Arc::clone(&self.scheduler);
        let official = Arc::clone(&self.official);
        let window = self.window;

        self.cache
            .get_or_refresh(&key, move || async move {
                let ids: Vec<Uuid> = targets.iter().map(|t| t.id).collect();

                let probe = match mode {
                    RefreshMode::Always => true,
                    RefreshMode::Missing => {
                        let recent = history.fetch_recent(1, Some(ids.as_slice())).await?;
                        targets
                            .iter()
                            .filter(|t| t.is_schedulable())
                            .any(|t| recent.get(&t.id).is_none_or(Vec::is_empty))
                    }
                    RefreshMode::Never => false,
                };
                if probe && scheduler.run_on_demand().await.is_none() {
                    debug!(?mode, "On-demand probe refused, serving history");
                }

                let mut recent = history.fetch_recent(window, Some(ids.as_slice())).await?;
                let official = official.all().await;
                Ok(build_snapshot(&targets, &mut recent, &official, poll_interval))
            })
            .await
    }
}

fn build_snapshot(
    targets: &[Target],
    recent: &mut HashMap<Uuid, Vec<CheckOutcome>>,
    official: &HashMap<Vendor, OfficialStatus>,
    poll_interval: Duration,
) -> Snapshot {
    let now = Utc::now();
    let entries = targets
        .iter()
        .map(|target| {
            let history = recent.remove(&target.id).unwrap_or_default();
            let official_status = official.get(&target.vendor).cloned();

            let latest = if target.maintenance {
                Some(maintenance_outcome(target, now))
            } else {
                history.first().cloned()
            };
            let latest = latest.map(|mut outcome| {
                outcome.official_status = official_status.clone();
                outcome
            });

            SnapshotEntry {
                target_id: target.id,
                name: target.name.clone(),
                vendor: target.vendor,
                model: target.model.clone(),
                endpoint: target.endpoint.clone(),
                maintenance: target.maintenance,
                latest,
                history,
                official_status,
            }
        })
        .collect();

    Snapshot { generated_at: now, poll_interval_seconds: poll_interval.as_secs(), entries }
}

fn maintenance_outcome(target: &Target, now: DateTime<Utc>) -> CheckOutcome {
    CheckOutcome {
        target_id: target.id,
        name: target.name.clone(),
        vendor: target.vendor,
        model: target.model.clone(),
        endpoint: target.endpoint.clone(),
        status: CheckStatus::Maintenance,
        latency_ms: None,
        ping_latency_ms: None,
        checked_at: now,
        message: "under maintenance".to_string(),
        official_status: None,
    }
}
