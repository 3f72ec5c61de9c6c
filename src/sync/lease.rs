//! Per-account sync lease with a TTL, kept in the sync_state table. A
//! sweep takes the lease before touching an account, so overlapping
//! triggers (timer, startup backfill, webhook-adjacent fetch) cannot race
//! on the same account while unrelated accounts proceed. The TTL lets a
//! lease die on its own if the holder crashed mid-pass.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::db::{Database, DbError};

pub const LEASE_TTL_MINUTES: i64 = 10;

fn lease_key(account_id: &str) -> String {
    format!("lease:{account_id}")
}

fn format_expiry(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Try to take the lease for one account. Returns false when a live
/// lease is already held; an expired lease is claimed over.
pub fn acquire(db: &Database, account_id: &str, now: DateTime<Utc>) -> Result<bool, DbError> {
    let key = lease_key(account_id);

    if let Some(existing) = db.get_sync_state(&key)? {
        if let Some(expiry) = existing.value.as_deref() {
            if expiry > format_expiry(now).as_str() {
                debug!("account {account_id} lease held until {expiry}");
                return Ok(false);
            }
        }
    }

    let expiry = format_expiry(now + Duration::minutes(LEASE_TTL_MINUTES));
    db.set_sync_state(&key, &expiry)?;
    Ok(true)
}

pub fn release(db: &Database, account_id: &str) -> Result<(), DbError> {
    db.clear_sync_state(&lease_key(account_id))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{acquire, release, LEASE_TTL_MINUTES};
    use crate::db::Database;

    fn temp_db() -> Database {
        let path = std::env::temp_dir().join(format!("mip-lease-{}.db", Uuid::new_v4()));
        Database::open(&path).expect("open temp db")
    }

    #[test]
    fn second_acquire_fails_while_lease_is_live() {
        let db = temp_db();
        let now = Utc::now();

        assert!(acquire(&db, "acc-1", now).expect("first acquire"));
        assert!(!acquire(&db, "acc-1", now).expect("second acquire"));

        // A different account is unaffected.
        assert!(acquire(&db, "acc-2", now).expect("other account"));
    }

    #[test]
    fn expired_lease_can_be_claimed_over() {
        let db = temp_db();
        let now = Utc::now();

        assert!(acquire(&db, "acc-1", now).expect("first acquire"));

        let later = now + Duration::minutes(LEASE_TTL_MINUTES + 1);
        assert!(acquire(&db, "acc-1", later).expect("acquire after expiry"));
    }

    #[test]
    fn release_frees_the_lease_immediately() {
        let db = temp_db();
        let now = Utc::now();

        assert!(acquire(&db, "acc-1", now).expect("acquire"));
        release(&db, "acc-1").expect("release");
        assert!(acquire(&db, "acc-1", now).expect("reacquire"));
    }
}
