/// Integration tests for orchestrator components
///
/// These tests run the real libsql stores end to end with a scripted probe:
/// - Leader-gated batches persist history and surface in snapshots
/// - A second instance on the same database stays standby
/// - Shutdown hands the lease back
use crate::config::Config;
use crate::database::repository::upsert_target;
use crate::database::{HistoryStore, LeaseStore, Target};
use crate::monitoring::fake::FakeProbe;
use crate::monitoring::probe::ProbeRegistry;
use crate::monitoring::types::{CheckStatus, Vendor};
use crate::orchestrator::{Orchestrator, RefreshMode};
use crate::pool::open_pool;
use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;

fn test_config(dir: &TempDir, node_id: &str) -> Config {
    let mut config = Config::default();
    config.scheduler.node_id = node_id.to_string();
    config.official_status.enabled = false;
    config.database.path = dir.path().join("modelwatch.db").to_string_lossy().to_string();
    config
}

async fn orchestrator(config: Config, fake: &Arc<FakeProbe>) -> Result<Orchestrator> {
    let pool = open_pool(&config.database.path, 2).await?;
    let registry = ProbeRegistry::empty().with_strategy(Vendor::OpenAi, fake.clone());
    Orchestrator::with_registry(config, pool, registry).await
}

async fn seed_target(orchestrator: &Orchestrator, target: &Target) -> Result<()> {
    let conn = orchestrator.database().get_conn().await?;
    upsert_target(&conn, target).await
}

#[tokio::test]
async fn test_check_once_records_and_snapshots() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fake = Arc::new(FakeProbe::answering(1200));
    let mut orchestrator = orchestrator(test_config(&dir, "a"), &fake).await?;

    let target = Target::new("gpt", Vendor::OpenAi, "gpt-4o", "https://api.example.com/v1", "sk");
    seed_target(&orchestrator, &target).await?;

    let outcomes = orchestrator.check_once().await.expect("sole instance leads");
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, CheckStatus::Operational);
    assert_eq!(outcomes[0].latency_ms, Some(1200));
    assert!(orchestrator.is_leader());

    let recent = orchestrator.database().fetch_recent(10, None).await?;
    assert_eq!(recent.get(&target.id).map(Vec::len), Some(1));

    let snapshot = orchestrator.snapshots().get_snapshot(RefreshMode::Never).await?;
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].latest.as_ref().map(|o| o.status), Some(CheckStatus::Operational));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_second_instance_stays_standby() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fake = Arc::new(FakeProbe::answering(100));
    let mut a = orchestrator(test_config(&dir, "a"), &fake).await?;
    let mut b = orchestrator(test_config(&dir, "b"), &fake).await?;

    seed_target(&a, &Target::new("t", Vendor::OpenAi, "m", "https://x/v1", "k")).await?;

    assert!(a.check_once().await.is_some());
    assert!(b.check_once().await.is_none());
    assert_eq!(fake.calls(), 1);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_releases_lease() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fake = Arc::new(FakeProbe::answering(100));
    let mut a = orchestrator(test_config(&dir, "a"), &fake).await?;
    let mut b = orchestrator(test_config(&dir, "b"), &fake).await?;

    assert!(a.check_once().await.is_some());
    a.shutdown().await;

    let lease = b.database().read_lease().await?.expect("lease row exists");
    assert!(lease.owner_id.is_none());
    assert!(b.check_once().await.is_some());

    b.shutdown().await;
    Ok(())
}
