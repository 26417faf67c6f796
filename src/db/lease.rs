use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use std::time::Duration;

use super::Store;

/// The singleton lease row deciding which process may drive scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerLease {
    pub holder_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchedulerLease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}

impl Store {
    /// Acquires or renews the scheduler lease for `holder`.
    ///
    /// Runs as a single transaction: insert-if-absent, a conditional update
    /// that only succeeds for the current holder or once the lease expired,
    /// then a read-back. Two contenders therefore observe a serial order and
    /// exactly one wins.
    pub fn try_acquire_lease(
        &self,
        holder: &str,
        ttl: Duration,
    ) -> Result<(bool, Option<SchedulerLease>)> {
        anyhow::ensure!(!holder.is_empty(), "lease holder id is required");
        anyhow::ensure!(!ttl.is_zero(), "lease ttl must be positive");

        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_ms = now_ms + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        self.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .context("failed to begin lease transaction")?;

            tx.execute(
                "INSERT OR IGNORE INTO scheduler_leases (id, holder_id, lease_expires_at, updated_at)
                 VALUES (1, ?1, ?2, ?3)",
                params![holder, expires_ms, now_ms],
            )
            .context("failed to insert scheduler lease")?;

            tx.execute(
                "UPDATE scheduler_leases
                 SET holder_id = ?1, lease_expires_at = ?2, updated_at = ?3
                 WHERE id = 1 AND (holder_id = ?1 OR lease_expires_at <= ?3)",
                params![holder, expires_ms, now_ms],
            )
            .context("failed to update scheduler lease")?;

            let lease = read_lease(&tx)?;
            tx.commit().context("failed to commit lease transaction")?;

            let acquired = lease
                .as_ref()
                .is_some_and(|l| l.holder_id == holder && l.is_active(now));
            Ok((acquired, lease))
        })
    }

    pub fn get_lease(&self) -> Result<Option<SchedulerLease>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT holder_id, lease_expires_at, updated_at
                     FROM scheduler_leases WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()
                .context("failed to read scheduler lease")?;

            row.map(|(holder_id, expires_ms, updated_ms)| {
                Ok(SchedulerLease {
                    holder_id,
                    lease_expires_at: millis_to_datetime(expires_ms)?,
                    updated_at: millis_to_datetime(updated_ms)?,
                })
            })
            .transpose()
        })
    }

    /// Expires the lease immediately when held by `holder`; other holders
    /// are silently left alone.
    pub fn release_lease(&self, holder: &str) -> Result<()> {
        anyhow::ensure!(!holder.is_empty(), "lease holder id is required");

        let now_ms = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduler_leases
                 SET lease_expires_at = ?1, updated_at = ?1
                 WHERE id = 1 AND holder_id = ?2",
                params![now_ms, holder],
            )
            .context("failed to release scheduler lease")?;
            Ok(())
        })
    }
}

fn read_lease(tx: &Transaction<'_>) -> Result<Option<SchedulerLease>> {
    let row = tx
        .query_row(
            "SELECT holder_id, lease_expires_at, updated_at
             FROM scheduler_leases WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
        .context("failed to read back scheduler lease")?;

    row.map(|(holder_id, expires_ms, updated_ms)| {
        Ok(SchedulerLease {
            holder_id,
            lease_expires_at: millis_to_datetime(expires_ms)?,
            updated_at: millis_to_datetime(updated_ms)?,
        })
    })
    .transpose()
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("invalid lease timestamp: {ms}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> Store {
        Store::open(tmp.path().join("tasks.db")).unwrap()
    }

    #[test]
    fn first_holder_acquires() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let (acquired, lease) = store
            .try_acquire_lease("holder-a", Duration::from_secs(2))
            .unwrap();
        assert!(acquired);
        assert_eq!(lease.unwrap().holder_id, "holder-a");
    }

    #[test]
    fn contender_rejected_before_expiry() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let (acquired_a, _) = store
            .try_acquire_lease("holder-a", Duration::from_secs(2))
            .unwrap();
        assert!(acquired_a);

        let (acquired_b, lease) = store
            .try_acquire_lease("holder-b", Duration::from_secs(2))
            .unwrap();
        assert!(!acquired_b);
        assert_eq!(lease.unwrap().holder_id, "holder-a");
    }

    #[test]
    fn takeover_allowed_after_expiry() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let (acquired_a, _) = store
            .try_acquire_lease("holder-a", Duration::from_millis(50))
            .unwrap();
        assert!(acquired_a);

        std::thread::sleep(Duration::from_millis(80));

        let (acquired_b, lease) = store
            .try_acquire_lease("holder-b", Duration::from_secs(2))
            .unwrap();
        assert!(acquired_b);
        assert_eq!(lease.unwrap().holder_id, "holder-b");
    }

    #[test]
    fn release_lets_contender_take_over_immediately() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let (acquired, _) = store
            .try_acquire_lease("holder-a", Duration::from_secs(2))
            .unwrap();
        assert!(acquired);

        store.release_lease("holder-a").unwrap();

        let (acquired_b, lease) = store
            .try_acquire_lease("holder-b", Duration::from_secs(2))
            .unwrap();
        assert!(acquired_b);
        assert_eq!(lease.unwrap().holder_id, "holder-b");
    }

    #[test]
    fn release_by_non_holder_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store
            .try_acquire_lease("holder-a", Duration::from_secs(2))
            .unwrap();
        store.release_lease("holder-b").unwrap();

        let lease = store.get_lease().unwrap().unwrap();
        assert_eq!(lease.holder_id, "holder-a");
        assert!(lease.is_active(Utc::now()));
    }

    #[test]
    fn holder_renews_its_own_lease() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store
            .try_acquire_lease("holder-a", Duration::from_secs(1))
            .unwrap();
        let first = store.get_lease().unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let (renewed, _) = store
            .try_acquire_lease("holder-a", Duration::from_secs(2))
            .unwrap();
        assert!(renewed);

        let second = store.get_lease().unwrap().unwrap();
        assert!(second.lease_expires_at > first.lease_expires_at);
    }

    #[test]
    fn empty_holder_and_zero_ttl_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        assert!(store.try_acquire_lease("", Duration::from_secs(1)).is_err());
        assert!(store.try_acquire_lease("holder-a", Duration::ZERO).is_err());
    }

    #[test]
    fn no_lease_row_until_first_acquire() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        assert!(store.get_lease().unwrap().is_none());
    }

    #[test]
    fn contention_across_two_stores_on_one_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.db");
        let store_a = Store::open(&path).unwrap();
        let store_b = Store::open(&path).unwrap();

        let (acquired_a, _) = store_a
            .try_acquire_lease("A", Duration::from_millis(300))
            .unwrap();
        assert!(acquired_a);

        let (acquired_b, lease) = store_b
            .try_acquire_lease("B", Duration::from_millis(300))
            .unwrap();
        assert!(!acquired_b);
        assert_eq!(lease.unwrap().holder_id, "A");

        std::thread::sleep(Duration::from_millis(350));

        let (acquired_b, lease) = store_b
            .try_acquire_lease("B", Duration::from_secs(2))
            .unwrap();
        assert!(acquired_b);
        assert_eq!(lease.unwrap().holder_id, "B");
    }
}
