use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::models::{Lease, Target, millis_to_timestamp, timestamp_to_millis};
use crate::monitoring::types::{CheckOutcome, CheckStatus, Vendor};
use crate::pool::LibsqlPool;

/// Recent outcomes per target, newest first.
pub type RecentHistory = HashMap<Uuid, Vec<CheckOutcome>>;

/// Read side of the admin-managed target table
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Enabled targets, maintenance ones included
    async fn list_enabled_targets(&self) -> Result<Vec<Target>>;
}

/// Append-only outcome history with bounded retention
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_batch(&self, outcomes: &[CheckOutcome]) -> Result<usize>;

    /// Up to `limit_per_target` newest outcomes for each target, optionally
    /// restricted to `target_ids`.
    async fn fetch_recent(
        &self,
        limit_per_target: usize,
        target_ids: Option<&[Uuid]>,
    ) -> Result<RecentHistory>;

    /// Delete outcomes older than `retention_days`; returns rows removed.
    async fn prune(&self, retention_days: u32) -> Result<u64>;
}

/// Conditional-update access to the singleton lease row
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn read_lease(&self) -> Result<Option<Lease>>;

    /// Take the lease if it has expired. Succeeds only when `expires_at < now`.
    async fn claim_lease(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extend the lease. Succeeds only when `owner = node_id AND expires_at > now`.
    async fn renew_lease(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Give the lease up early. Succeeds only when `owner = node_id`.
    async fn release_lease(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool>;
}

const OUTCOME_COLUMNS: &str =
    "target_id, name, vendor, model, endpoint, status, latency_ms, ping_latency_ms, message, checked_at";

/// LibSQL database implementation of all three stores
pub struct DatabaseImpl {
    pool: LibsqlPool,
    /// Cleared once the engine shows it cannot run the window-function query.
    window_query_supported: AtomicBool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool, window_query_supported: AtomicBool::new(true) }
    }

    /// Get a connection from the pool
    pub(crate) async fn get_conn(&self) -> Result<deadpool::managed::Object<crate::pool::LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    /// Single-query path: rank rows per target and keep the newest N.
    async fn fetch_recent_windowed(
        &self,
        limit_per_target: usize,
        target_ids: Option<&[Uuid]>,
    ) -> Result<RecentHistory> {
        let conn = self.get_conn().await?;
        let filter = target_ids.map(ids_to_json);
        let sql = format!(
            "SELECT {OUTCOME_COLUMNS} FROM (
                SELECT h.*, ROW_NUMBER() OVER (
                    PARTITION BY h.target_id ORDER BY h.checked_at DESC, h.id DESC
                ) AS rn
                FROM check_history h
                WHERE ?1 IS NULL OR h.target_id IN (SELECT value FROM json_each(?1))
            ) WHERE rn <= ?2
            ORDER BY target_id, checked_at DESC, id DESC"
        );

        let mut rows = conn.query(&sql, params![filter, limit_per_target as i64]).await?;
        let mut history = RecentHistory::new();
        while let Some(row) = rows.next().await? {
            let outcome = outcome_from_row(&row)?;
            history.entry(outcome.target_id).or_default().push(outcome);
        }
        Ok(history)
    }

    /// Only a missing capability turns the fast path off for good; anything
    /// else (locks, pool timeouts, I/O) falls back for this call alone.
    fn note_window_failure(&self, err: &anyhow::Error) {
        if is_capability_error(err) {
            tracing::warn!(error = %err, "Window functions unavailable, using per-target history queries");
            self.window_query_supported.store(false, Ordering::Relaxed);
        } else {
            tracing::warn!(error = %err, "Windowed history query failed, falling back once");
        }
    }

    /// Slower path: one bounded query per target.
    pub(crate) async fn fetch_recent_per_target(
        &self,
        limit_per_target: usize,
        target_ids: Option<&[Uuid]>,
    ) -> Result<RecentHistory> {
        let conn = self.get_conn().await?;

        let ids: Vec<String> = match target_ids {
            Some(ids) => ids.iter().map(Uuid::to_string).collect(),
            None => {
                let mut rows = conn.query("SELECT DISTINCT target_id FROM check_history", ()).await?;
                let mut ids = Vec::new();
                while let Some(row) = rows.next().await? {
                    ids.push(row.get::<String>(0)?);
                }
                ids
            }
        };

        let sql = format!(
            "SELECT {OUTCOME_COLUMNS} FROM check_history WHERE target_id = ?
             ORDER BY checked_at DESC, id DESC LIMIT ?"
        );

        let mut history = RecentHistory::new();
        for id in ids {
            let mut rows = conn.query(&sql, params![id, limit_per_target as i64]).await?;
            while let Some(row) = rows.next().await? {
                let outcome = outcome_from_row(&row)?;
                history.entry(outcome.target_id).or_default().push(outcome);
            }
        }
        Ok(history)
    }
}

fn ids_to_json(ids: &[Uuid]) -> String {
    serde_json::Value::Array(ids.iter().map(|id| serde_json::Value::String(id.to_string())).collect())
        .to_string()
}

fn outcome_from_row(row: &Row) -> Result<CheckOutcome> {
    let target_id: String = row.get(0)?;
    let vendor: String = row.get(2)?;
    let status: String = row.get(5)?;

    Ok(CheckOutcome {
        target_id: Uuid::parse_str(&target_id)?,
        name: row.get(1)?,
        vendor: vendor.parse()?,
        model: row.get(3)?,
        endpoint: row.get(4)?,
        status: status.parse()?,
        latency_ms: row.get::<Option<i64>>(6)?.map(|v| v as u64),
        ping_latency_ms: row.get::<Option<i64>>(7)?.map(|v| v as u64),
        message: row.get(8)?,
        checked_at: millis_to_timestamp(row.get(9)?),
        official_status: None,
    })
}

fn target_from_row(row: &Row) -> Result<Target> {
    let id: String = row.get(0)?;
    let vendor: String = row.get(2)?;
    let headers: Option<String> = row.get(8)?;
    let metadata: Option<String> = row.get(9)?;

    Ok(Target {
        id: Uuid::parse_str(&id)?,
        name: row.get(1)?,
        vendor: vendor.parse::<Vendor>()?,
        model: row.get(3)?,
        endpoint: row.get(4)?,
        api_key: row.get(5)?,
        enabled: row.get::<i64>(6)? != 0,
        maintenance: row.get::<i64>(7)? != 0,
        request_headers: parse_json_column(headers.as_deref(), "request_headers", &id),
        metadata: parse_json_column(metadata.as_deref(), "metadata", &id),
    })
}

/// Malformed JSON columns degrade to an empty value rather than hiding the target.
fn parse_json_column<T: serde::de::DeserializeOwned + Default>(
    raw: Option<&str>,
    column: &str,
    target_id: &str,
) -> T {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => T::default(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!(target_id, column, error = %e, "Ignoring malformed JSON column");
            T::default()
        }),
    }
}

#[async_trait]
impl TargetStore for DatabaseImpl {
    async fn list_enabled_targets(&self) -> Result<Vec<Target>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, vendor, model, endpoint, api_key, enabled, maintenance, request_headers, metadata
                 FROM targets WHERE enabled = 1 ORDER BY name, id",
                (),
            )
            .await?;

        let mut targets = Vec::new();
        while let Some(row) = rows.next().await? {
            match target_from_row(&row) {
                Ok(target) => targets.push(target),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable target row"),
            }
        }

        Ok(targets)
    }
}

#[async_trait]
impl HistoryStore for DatabaseImpl {
    async fn append_batch(&self, outcomes: &[CheckOutcome]) -> Result<usize> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        for outcome in outcomes {
            tx.execute(
                "INSERT INTO check_history (target_id, name, vendor, model, endpoint, status, latency_ms, ping_latency_ms, message, checked_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    outcome.target_id.to_string(),
                    outcome.name.clone(),
                    outcome.vendor.as_str(),
                    outcome.model.clone(),
                    outcome.endpoint.clone(),
                    outcome.status.as_str(),
                    outcome.latency_ms.map(|v| v as i64),
                    outcome.ping_latency_ms.map(|v| v as i64),
                    outcome.message.clone(),
                    timestamp_to_millis(outcome.checked_at)
                ],
            )
            .await?;
        }
        tx.commit().await?;

        Ok(outcomes.len())
    }

    async fn fetch_recent(
        &self,
        limit_per_target: usize,
        target_ids: Option<&[Uuid]>,
    ) -> Result<RecentHistory> {
        if matches!(target_ids, Some(ids) if ids.is_empty()) || limit_per_target == 0 {
            return Ok(RecentHistory::new());
        }

        if self.window_query_supported.load(Ordering::Relaxed) {
            match self.fetch_recent_windowed(limit_per_target, target_ids).await {
                Ok(history) => return Ok(history),
                Err(e) => self.note_window_failure(&e),
            }
        }

        self.fetch_recent_per_target(limit_per_target, target_ids).await
    }

    async fn prune(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let conn = self.get_conn().await?;
        let removed = conn
            .execute(
                "DELETE FROM check_history WHERE checked_at < ?",
                params![timestamp_to_millis(cutoff)],
            )
            .await
            .context("pruning check_history")?;
        Ok(removed)
    }
}

/// Errors meaning the engine lacks window functions or `json_each`. The
/// query text is fixed, so a syntax error can only come from the dialect.
fn is_capability_error(err: &anyhow::Error) -> bool {
    let message = format!("{err:#}").to_ascii_lowercase();
    message.contains("no such function")
        || message.contains("no such table: json_each")
        || message.contains("syntax error")
}

/// Insert or replace a target. The admin surface owns this table; the service
/// itself only calls this from tests and tooling.
pub async fn upsert_target(conn: &Connection, target: &Target) -> Result<()> {
    let now = timestamp_to_millis(Utc::now());
    conn.execute(
        "INSERT OR REPLACE INTO targets (id, name, vendor, model, endpoint, api_key, enabled, maintenance, request_headers, metadata, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            target.id.to_string(),
            target.name.clone(),
            target.vendor.as_str(),
            target.model.clone(),
            target.endpoint.clone(),
            target.api_key.clone(),
            if target.enabled { 1 } else { 0 },
            if target.maintenance { 1 } else { 0 },
            serde_json::to_string(&target.request_headers)?,
            serde_json::to_string(&target.metadata)?,
            now,
            now
        ],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::initialize_database;
    use crate::pool::open_pool;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn create_test_database() -> Result<(DatabaseImpl, TempDir)> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("test.db");
        let pool = open_pool(&path.to_string_lossy(), 4).await?;
        let conn = pool.get().await?;
        initialize_database(&conn).await?;
        drop(conn);
        Ok((DatabaseImpl::new_from_pool(pool), temp_dir))
    }

    fn outcome(target_id: Uuid, status: CheckStatus, checked_at: DateTime<Utc>) -> CheckOutcome {
        CheckOutcome {
            target_id,
            name: "target".into(),
            vendor: Vendor::OpenAi,
            model: "gpt-4o-mini".into(),
            endpoint: "https://api.example.com/v1/chat/completions".into(),
            status,
            latency_ms: Some(120),
            ping_latency_ms: None,
            checked_at,
            message: String::new(),
            official_status: None,
        }
    }

    #[tokio::test]
    async fn test_list_enabled_targets_reads_overrides() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let conn = db.get_conn().await?;

        let mut target = Target::new("Main", Vendor::Anthropic, "claude-sonnet", "https://api.example.com/v1/messages", "k");
        target.maintenance = true;
        target.request_headers.insert("x-team".into(), "core".into());
        target.metadata.insert("pollIntervalSeconds".into(), 20.into());
        upsert_target(&conn, &target).await?;

        let mut disabled = Target::new("Off", Vendor::OpenAi, "gpt", "https://x", "k");
        disabled.enabled = false;
        upsert_target(&conn, &disabled).await?;

        let targets = db.list_enabled_targets().await?;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, target.id);
        assert!(targets[0].maintenance);
        assert_eq!(targets[0].request_headers.get("x-team").map(String::as_str), Some("core"));
        assert_eq!(targets[0].settings().poll_interval_seconds, Some(20));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_recent_paths_agree() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let now = Utc::now();

        let mut batch = Vec::new();
        for i in 0..5 {
            batch.push(outcome(a, CheckStatus::Operational, now - Duration::seconds(i)));
        }
        batch.push(outcome(b, CheckStatus::Failed, now));
        db.append_batch(&batch).await?;

        let windowed = db.fetch_recent_windowed(3, None).await?;
        let fallback = db.fetch_recent_per_target(3, None).await?;
        assert_eq!(windowed, fallback);
        assert_eq!(windowed[&a].len(), 3);
        assert_eq!(windowed[&b].len(), 1);
        assert!(windowed[&a][0].checked_at >= windowed[&a][1].checked_at);

        let only_b = db.fetch_recent(10, Some(&[b])).await?;
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[&b][0].status, CheckStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_window_failure_keeps_fast_path() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let id = Uuid::new_v4();
        db.append_batch(&[outcome(id, CheckStatus::Operational, Utc::now())]).await?;

        db.note_window_failure(&anyhow::anyhow!("SQLite failure: database is locked"));
        db.note_window_failure(&anyhow::anyhow!("timed out waiting for a pooled connection"));
        assert!(db.window_query_supported.load(Ordering::Relaxed));
        assert_eq!(db.fetch_recent(5, None).await?[&id].len(), 1);

        db.note_window_failure(&anyhow::anyhow!("SQLite failure: no such function: ROW_NUMBER"));
        assert!(!db.window_query_supported.load(Ordering::Relaxed));
        assert_eq!(db.fetch_recent(5, None).await?[&id].len(), 1);
        Ok(())
    }

    #[test]
    fn test_capability_errors() {
        assert!(is_capability_error(&anyhow::anyhow!("no such function: ROW_NUMBER")));
        assert!(is_capability_error(&anyhow::anyhow!("no such table: json_each")));
        assert!(is_capability_error(&anyhow::anyhow!("near \"(\": syntax error")));
        assert!(!is_capability_error(&anyhow::anyhow!("database is locked")));
        assert!(!is_capability_error(&anyhow::anyhow!("disk I/O error")));
    }

    #[tokio::test]
    async fn test_prune_removes_old_rows() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        db.append_batch(&[
            outcome(id, CheckStatus::Operational, now - Duration::days(40)),
            outcome(id, CheckStatus::Operational, now - Duration::days(1)),
        ])
        .await?;

        assert_eq!(db.prune(30).await?, 1);
        assert_eq!(db.fetch_recent(10, None).await?[&id].len(), 1);
        Ok(())
    }
}
