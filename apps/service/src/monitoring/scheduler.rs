//! Tick loop: leader gate, due filter, batch execution, bookkeeping.
//!
//! All mutable scheduling state (running guard, last-checked instants,
//! supplementary timer) lives on [`MonitoringScheduler`], which the
//! orchestrator owns for the lifetime of the process.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::executor::MonitoringExecutor;
use super::types::CheckOutcome;
use crate::database::{HistoryStore, Target, TargetStore};
use crate::orchestrator::leader::{LEASE_LOG, LeaderElector};
use crate::orchestrator::snapshot::Invalidate;

/// Slack applied to "now" so a timer firing a hair early still counts.
const DUE_TOLERANCE: Duration = Duration::from_millis(500);

/// A supplementary timer this close to the next global tick is not armed.
const SUPPLEMENTARY_MARGIN: Duration = Duration::from_secs(1);

/// Whether a target last checked at `last_checked` is due at `now`.
pub fn is_due(last_checked: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last_checked {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= interval,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Global,
    Supplementary,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another tick was still executing
    Overlapping,
    Standby,
    NothingDue,
    Probed(Vec<CheckOutcome>),
    /// Targets could not be listed
    Failed(String),
}

/// Clears the running flag when a tick or on-demand batch ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).ok().map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Monitoring scheduler - decides which targets run on each tick
pub struct MonitoringScheduler {
    executor: Arc<MonitoringExecutor>,
    targets: Arc<dyn TargetStore>,
    history: Arc<dyn HistoryStore>,
    elector: Arc<LeaderElector>,
    poll_interval: Duration,
    invalidation: Option<Arc<dyn Invalidate>>,
    cancel: CancellationToken,

    running: AtomicBool,
    last_checked: Mutex<HashMap<Uuid, Instant>>,
    last_global_tick: Mutex<Option<Instant>>,
    /// Deadline of the one-shot supplementary tick, watched by the loop in `start`
    supplementary: watch::Sender<Option<Instant>>,
}

impl MonitoringScheduler {
    pub fn new(
        executor: Arc<MonitoringExecutor>,
        targets: Arc<dyn TargetStore>,
        history: Arc<dyn HistoryStore>,
        elector: Arc<LeaderElector>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            targets,
            history,
            elector,
            poll_interval,
            invalidation: None,
            cancel,
            running: AtomicBool::new(false),
            last_checked: Mutex::new(HashMap::new()),
            last_global_tick: Mutex::new(None),
            supplementary: watch::Sender::new(None),
        }
    }

    /// Cache to clear whenever a batch is recorded
    pub fn with_invalidation(mut self, invalidation: Arc<dyn Invalidate>) -> Self {
        self.invalidation = Some(invalidation);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    /// Run the global tick loop until cancelled, firing the supplementary
    /// tick whenever one is armed. Each tick runs on its own task so a slow
    /// batch never delays the timer; the running guard drops ticks that
    /// would overlap.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut armed = self.supplementary.subscribe();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(scheduler.poll_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Scheduler started (interval {}s)", scheduler.poll_interval.as_secs());

            loop {
                let deadline = *armed.borrow_and_update();
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = timer.tick() => scheduler.spawn_tick(TickKind::Global),
                    // Re-read the deadline after a re-arm.
                    _ = armed.changed() => {}
                    _ = sleep_until_armed(deadline) => {
                        scheduler.supplementary.send_replace(None);
                        scheduler.spawn_tick(TickKind::Supplementary);
                    }
                }
            }

            info!("Scheduler stopped");
        })
    }

    fn spawn_tick(self: &Arc<Self>, kind: TickKind) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.tick(kind).await;
        });
    }

    pub async fn tick(self: &Arc<Self>, kind: TickKind) -> TickOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            info!(?kind, "Previous tick still running, skipping");
            return TickOutcome::Overlapping;
        };

        let now = Instant::now();
        if kind == TickKind::Global {
            *self.last_global_tick.lock().await = Some(now);
        }

        if !self.elector.try_acquire_or_renew(Utc::now()).await {
            info!(target: LEASE_LOG, node_id = %self.elector.node_id(), "standby, skipping tick");
            self.supplementary.send_replace(None);
            return TickOutcome::Standby;
        }

        let targets = match self.targets.list_enabled_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                error!("Failed to list targets: {:#}", e);
                return TickOutcome::Failed(e.to_string());
            }
        };
        let schedulable: Vec<Target> = targets.into_iter().filter(Target::is_schedulable).collect();

        let due = self.due_targets(&schedulable, now).await;
        let result = if due.is_empty() {
            debug!(?kind, "No targets due");
            TickOutcome::NothingDue
        } else {
            TickOutcome::Probed(self.record_batch(&due, now).await)
        };

        self.arm_supplementary(&schedulable).await;
        result
    }

    async fn due_targets(&self, targets: &[Target], now: Instant) -> Vec<Target> {
        let due_at = now + DUE_TOLERANCE;
        let last_checked = self.last_checked.lock().await;
        targets
            .iter()
            .filter(|t| {
                let interval = t.settings().effective_interval(self.poll_interval);
                is_due(last_checked.get(&t.id).copied(), interval, due_at)
            })
            .cloned()
            .collect()
    }

    /// Probe `targets`, append the outcomes and stamp them as checked at
    /// `started`. Storage failures are logged and never abort the tick.
    async fn record_batch(&self, targets: &[Target], started: Instant) -> Vec<CheckOutcome> {
        let outcomes = self.executor.execute_batch(targets, &self.cancel).await;
        if self.cancel.is_cancelled() {
            info!("Shutting down, discarding {} interrupted outcome(s)", outcomes.len());
            return outcomes;
        }

        if let Err(e) = self.history.append_batch(&outcomes).await {
            error!("Failed to append {} outcome(s) to history: {:#}", outcomes.len(), e);
        }

        {
            let mut last_checked = self.last_checked.lock().await;
            for target in targets {
                last_checked.insert(target.id, started);
            }
        }

        if let Some(invalidation) = &self.invalidation {
            invalidation.invalidate_all();
        }

        log_summary(&outcomes);
        outcomes
    }

    /// Probe every schedulable target now, if this node leads and no tick is
    /// running. `None` means the gate refused.
    pub async fn run_on_demand(&self) -> Option<Vec<CheckOutcome>> {
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            debug!("On-demand batch refused, tick in progress");
            return None;
        };
        if !self.elector.try_acquire_or_renew(Utc::now()).await {
            debug!(target: LEASE_LOG, "On-demand batch refused, node is standby");
            return None;
        }

        let targets = match self.targets.list_enabled_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                error!("Failed to list targets: {:#}", e);
                return None;
            }
        };
        let schedulable: Vec<Target> = targets.into_iter().filter(Target::is_schedulable).collect();
        if schedulable.is_empty() {
            return Some(Vec::new());
        }

        info!("Running on-demand batch for {} target(s)", schedulable.len());
        Some(self.record_batch(&schedulable, Instant::now()).await)
    }

    /// Targets with an interval shorter than the global one would otherwise
    /// wait for the next global tick; arm a one-shot tick at the earliest
    /// such due time instead.
    async fn arm_supplementary(&self, targets: &[Target]) {
        let next_due = {
            let last_checked = self.last_checked.lock().await;
            targets
                .iter()
                .filter_map(|t| {
                    let interval = t.settings().effective_interval(self.poll_interval);
                    if interval >= self.poll_interval {
                        return None;
                    }
                    last_checked.get(&t.id).map(|last| *last + interval)
                })
                .min()
        };

        let Some(next_due) = next_due else {
            self.supplementary.send_replace(None);
            return;
        };

        if let Some(last_global) = *self.last_global_tick.lock().await {
            let next_global = last_global + self.poll_interval;
            if next_due + SUPPLEMENTARY_MARGIN >= next_global {
                debug!("Next short-interval target is due with the global tick");
                self.supplementary.send_replace(None);
                return;
            }
        }

        debug!(
            "Arming supplementary tick in {} ms",
            next_due.saturating_duration_since(Instant::now()).as_millis()
        );
        self.supplementary.send_replace(Some(next_due));
    }

    #[cfg(test)]
    fn supplementary_deadline(&self) -> Option<Instant> {
        *self.supplementary.borrow()
    }
}

async fn sleep_until_armed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_summary(outcomes: &[CheckOutcome]) {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for outcome in outcomes {
        *counts.entry(outcome.status.as_str()).or_default() += 1;
        info!(
            target_id = %outcome.target_id,
            name = %outcome.name,
            status = %outcome.status,
            latency_ms = ?outcome.latency_ms,
            ping_latency_ms = ?outcome.ping_latency_ms,
            "{}",
            outcome.message
        );
    }

    let summary = counts
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect::<Vec<_>>()
        .join(", ");
    info!("Checked {} target(s): {}", outcomes.len(), summary);
}
