//! Redis-backed KvStore (feature `redis`).
//!
//! - create-if-absent: `SET key value NX PX ttl`
//! - fenced release: Lua compare-and-delete, so the check and the delete are one atomic step
//! - prefix delete: `SCAN MATCH prefix*` + `DEL` in batches

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use crate::error::{Result, SpindleError};
use crate::ports::KvStore;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const SCAN_BATCH: usize = 500;

#[derive(Clone)]
pub struct RedisKvStore {
    conn: MultiplexedConnection,
}

impl RedisKvStore {
    /// Connect to a single node (e.g. `redis://localhost:6379`).
    ///
    /// An unreachable store at startup is the one fatal condition; callers get the error here.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(SpindleError::store)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(SpindleError::store)?;
        debug!(url, "connected to redis");
        Ok(Self { conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(SpindleError::store)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(SpindleError::store)
    }

    #[instrument(skip(self, value))]
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(SpindleError::store)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(SpindleError::store)?;
        Ok(removed > 0)
    }

    #[instrument(skip(self, expected))]
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn();
        let removed = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(SpindleError::store)?;
        Ok(removed == 1)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await
                .map_err(SpindleError::store)?;
            if !keys.is_empty() {
                let n = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, i64>(&mut conn)
                    .await
                    .map_err(SpindleError::store)?;
                removed += n.max(0) as usize;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_never_zero_millis() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }
}
