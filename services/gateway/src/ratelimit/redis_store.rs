//! Redis-backed [`BucketStore`], enabled with the `backend-redis` feature.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

use super::distributed::BucketStore;
use super::error::RateLimitError;

/// GET, compare against the expected payload, then SET with a millisecond TTL.
/// `ARGV[1]` is `1` when an existing value is expected.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

const SCAN_BATCH: usize = 500;

#[derive(Clone)]
pub struct RedisBucketStore {
    pool: Pool,
    script: redis::Script,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore").finish()
    }
}

impl RedisBucketStore {
    pub async fn connect(url: &str) -> Result<Self, RateLimitError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(backend_error)?;

        let mut conn = pool.get().await.map_err(backend_error)?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await
            .map_err(backend_error)?;

        info!("redis bucket store connected");
        Ok(Self {
            pool,
            script: redis::Script::new(COMPARE_AND_SET),
        })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, RateLimitError> {
        self.pool.get().await.map_err(backend_error)
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, RateLimitError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(backend_error)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RateLimitError> {
        let mut conn = self.connection().await?;
        let swapped: i64 = self
            .script
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.map(<[u8]>::to_vec).unwrap_or_default())
            .arg(new)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut *conn)
            .await
            .map_err(backend_error)?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut *conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RateLimitError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(backend_error)?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut *conn)
                    .await
                    .map_err(backend_error)?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

fn backend_error(err: impl Display) -> RateLimitError {
    RateLimitError::Backend(err.to_string())
}

fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
