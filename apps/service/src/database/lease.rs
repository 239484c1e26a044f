//! Lease row access for [`DatabaseImpl`].
//!
//! Every write is a single conditional `UPDATE`; the affected-row count tells
//! the caller whether its compare-and-swap won.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;

use super::migrations::SCHEDULER_LEASE_KEY;
use super::models::{Lease, millis_to_timestamp, timestamp_to_millis};
use super::repository::{DatabaseImpl, LeaseStore};

#[async_trait]
impl LeaseStore for DatabaseImpl {
    async fn read_lease(&self) -> Result<Option<Lease>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT owner_id, expires_at, updated_at FROM scheduler_lease WHERE lease_key = ?",
                params![SCHEDULER_LEASE_KEY],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Lease {
                owner_id: row.get(0)?,
                expires_at: millis_to_timestamp(row.get(1)?),
                updated_at: millis_to_timestamp(row.get(2)?),
            })),
            None => Ok(None),
        }
    }

    async fn claim_lease(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.get_conn().await?;
        let now_ms = timestamp_to_millis(now);

        // Recreate the row if someone truncated the table.
        conn.execute(
            "INSERT OR IGNORE INTO scheduler_lease (lease_key, owner_id, expires_at, updated_at) VALUES (?, NULL, 0, ?)",
            params![SCHEDULER_LEASE_KEY, now_ms],
        )
        .await?;

        let changed = conn
            .execute(
                "UPDATE scheduler_lease SET owner_id = ?1, expires_at = ?2, updated_at = ?3
                 WHERE lease_key = ?4 AND expires_at < ?3",
                params![node_id, timestamp_to_millis(expires_at), now_ms, SCHEDULER_LEASE_KEY],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn renew_lease(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE scheduler_lease SET expires_at = ?2, updated_at = ?3
                 WHERE lease_key = ?4 AND owner_id = ?1 AND expires_at > ?3",
                params![
                    node_id,
                    timestamp_to_millis(expires_at),
                    timestamp_to_millis(now),
                    SCHEDULER_LEASE_KEY
                ],
            )
            .await?;
        Ok(changed == 1)
    }

    async fn release_lease(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE scheduler_lease SET owner_id = NULL, expires_at = 0, updated_at = ?2
                 WHERE lease_key = ?3 AND owner_id = ?1",
                params![node_id, timestamp_to_millis(now), SCHEDULER_LEASE_KEY],
            )
            .await?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::initialize_database;
    use crate::pool::open_pool;
    use chrono::Duration;

    async fn create_test_database() -> Result<(DatabaseImpl, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir()?;
        let pool = open_pool(&temp_dir.path().join("lease.db").to_string_lossy(), 2).await?;
        initialize_database(&*pool.get().await?).await?;
        Ok((DatabaseImpl::new_from_pool(pool), temp_dir))
    }

    #[tokio::test]
    async fn test_claim_only_succeeds_on_expired_lease() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        assert!(db.claim_lease("a", now, now + ttl).await?);
        assert!(!db.claim_lease("b", now, now + ttl).await?);

        let lease = db.read_lease().await?.expect("lease row");
        assert_eq!(lease.owner_id.as_deref(), Some("a"));

        // After expiry anyone may claim.
        let later = now + ttl + Duration::seconds(1);
        assert!(db.claim_lease("b", later, later + ttl).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_renew_requires_live_ownership() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        assert!(!db.renew_lease("a", now, now + ttl).await?);
        assert!(db.claim_lease("a", now, now + ttl).await?);
        assert!(db.renew_lease("a", now + Duration::seconds(10), now + Duration::seconds(40)).await?);
        assert!(!db.renew_lease("b", now + Duration::seconds(10), now + Duration::seconds(40)).await?);

        // An expired lease cannot be renewed, it must be claimed again.
        let late = now + Duration::seconds(41);
        assert!(!db.renew_lease("a", late, late + ttl).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_hands_over_immediately() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        assert!(db.claim_lease("a", now, now + ttl).await?);
        assert!(!db.release_lease("b", now).await?);
        assert!(db.release_lease("a", now).await?);
        assert!(db.claim_lease("b", now, now + ttl).await?);
        Ok(())
    }
}
