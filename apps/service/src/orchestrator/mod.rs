/// Orchestrator module - coordinates all components
///
/// The orchestrator is the core coordinator that:
/// - Owns the database, elector, scheduler and pollers for the process lifetime
/// - Starts the background loops and stops them through one cancellation token
/// - Hands the snapshot service to readers
///
/// ## Leadership
/// The `leader` submodule runs the lease election that decides which
/// instance probes. Standby instances still serve snapshots from history.

pub mod leader;
pub mod official_status;
pub mod retention;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use leader::LeaderElector;
pub use official_status::OfficialStatusPoller;
pub use retention::RetentionCleanup;
pub use snapshot::{RefreshError, RefreshMode, Snapshot, SnapshotCache, SnapshotService};

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::{DatabaseImpl, initialize_database};
use crate::monitoring::probe::ProbeRegistry;
use crate::monitoring::types::CheckOutcome;
use crate::monitoring::{MonitoringExecutor, MonitoringScheduler};
use crate::pool::LibsqlPool;

/// Main orchestrator for the modelwatch service
pub struct Orchestrator {
    config: Arc<Config>,
    database: Arc<DatabaseImpl>,
    elector: Arc<LeaderElector>,
    scheduler: Arc<MonitoringScheduler>,
    official: Arc<OfficialStatusPoller>,
    snapshots: Arc<SnapshotService>,
    cancel: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Create and start a new orchestrator
    /// This is a convenience method that runs until Ctrl-C and then shuts down
    pub async fn start(config: Config, pool: LibsqlPool) -> Result<()> {
        let mut orchestrator = Self::new(config, pool).await?;
        orchestrator.run().await
    }

    /// Create a new orchestrator instance with the built-in vendor probes
    pub async fn new(config: Config, pool: LibsqlPool) -> Result<Self> {
        Self::with_registry(config, pool, ProbeRegistry::standard()).await
    }

    pub async fn with_registry(
        config: Config,
        pool: LibsqlPool,
        registry: ProbeRegistry,
    ) -> Result<Self> {
        let config = Arc::new(config);

        info!("Initializing database schema...");
        {
            let conn = pool.get().await?;
            initialize_database(&conn).await?;
        }
        let database = Arc::new(DatabaseImpl::new_from_pool(pool));

        info!("Node id: {}", config.scheduler.node_id);
        let elector = Arc::new(LeaderElector::new(
            database.clone(),
            config.scheduler.node_id.clone(),
            config.lease_ttl(),
        ));

        let executor = Arc::new(MonitoringExecutor::new(registry, config.scheduler.max_concurrency)?);
        let cancel = CancellationToken::new();
        let cache = Arc::new(SnapshotCache::new(config.poll_interval()));

        let scheduler = Arc::new(
            MonitoringScheduler::new(
                executor,
                database.clone(),
                database.clone(),
                elector.clone(),
                config.poll_interval(),
                cancel.child_token(),
            )
            .with_invalidation(cache.clone()),
        );

        let official = Arc::new(OfficialStatusPoller::new(
            &config.official_status,
            config.official_status_interval(),
        )?);

        let snapshots = Arc::new(SnapshotService::new(
            database.clone(),
            database.clone(),
            scheduler.clone(),
            official.clone(),
            cache,
            config.history.window,
        ));

        Ok(Self {
            config,
            database,
            elector,
            scheduler,
            official,
            snapshots,
            cancel,
            task_handles: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<DatabaseImpl> {
        &self.database
    }

    pub fn snapshots(&self) -> Arc<SnapshotService> {
        Arc::clone(&self.snapshots)
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the scheduler, the official-status poller and retention cleanup.
    pub fn spawn_background(&mut self) {
        info!("Starting scheduler (node {})", self.elector.node_id());
        self.task_handles.push(self.scheduler.start());

        if self.config.official_status.enabled {
            info!("Starting official status poller...");
            self.task_handles.push(self.official.start(self.cancel.child_token()));
        } else {
            info!("Official status polling is disabled");
        }

        info!(
            "Starting retention cleanup (keeping {} days of history)",
            self.config.history.retention_days
        );
        let retention = RetentionCleanup::new(
            self.database.clone(),
            self.elector.clone(),
            self.config.history.retention_days,
        );
        self.task_handles.push(retention.start_periodic_cleanup(self.cancel.child_token()));
    }

    /// One leader-gated batch over every schedulable target.
    /// `None` when another instance holds the lease.
    pub async fn check_once(&self) -> Option<Vec<CheckOutcome>> {
        if self.config.official_status.enabled {
            self.official.poll_once().await;
        }
        self.scheduler.run_on_demand().await
    }

    /// Run the orchestrator until Ctrl-C
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting modelwatch orchestrator...");
        self.spawn_background();

        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Stop every background task and hand the lease back.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for handle in self.task_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.elector.release().await;
        info!("Orchestrator stopped");
    }
}
