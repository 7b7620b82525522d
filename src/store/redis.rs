//! Redis-backed idempotency locks.

use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use crate::domain::{Result, WorkerError};
use crate::store::IdempotencyStore;

const LOCK_KEY_PREFIX: &str = "sentinel:lock:";

/// Strictly greater than compile budget + maximum run budget + margin, so no
/// live worker can still be processing when the record expires.
pub const LOCK_TTL: Duration = Duration::from_secs(600);

/// Lock gate over a single lazily reconnecting Redis connection.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
    ttl: Duration,
}

impl RedisIdempotencyStore {
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| WorkerError::Lock(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection()
            .map_err(|e| WorkerError::Lock(format!("connect redis: {e}")))?;
        Ok(RedisIdempotencyStore {
            client,
            conn: Mutex::new(Some(conn)),
            ttl: LOCK_TTL,
        })
    }

    /// Run `op` against the cached connection, dropping it on error so the
    /// next call reconnects.
    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(
                self.client
                    .get_connection()
                    .map_err(|e| WorkerError::Lock(format!("reconnect redis: {e}")))?,
            );
        }
        let conn = guard.as_mut().expect("connection populated above");
        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                *guard = None;
                Err(WorkerError::Lock(e.to_string()))
            }
        }
    }
}

fn lock_key(job_id: Uuid) -> String {
    format!("{LOCK_KEY_PREFIX}{job_id}")
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn acquire(&self, job_id: Uuid) -> Result<bool> {
        let key = lock_key(job_id);
        let ttl_secs = self.ttl.as_secs();
        let claimed_at = chrono::Utc::now().timestamp();
        // SET NX EX is the atomic set-if-absent-with-expiry primitive;
        // it answers OK on first creation and nil on a duplicate.
        let reply: Option<String> = self.with_conn(|conn| {
            redis::cmd("SET")
                .arg(&key)
                .arg(claimed_at)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn release(&self, job_id: Uuid) -> Result<()> {
        let key = lock_key(job_id);
        let ttl_secs = self.ttl.as_secs();
        let _: i64 = self.with_conn(|conn| {
            redis::cmd("EXPIRE").arg(&key).arg(ttl_secs).query(conn)
        })?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        let _: String = self.with_conn(|conn| redis::cmd("PING").query(conn))?;
        Ok(())
    }
}
