//! Redis-backed counter store shared by every gateway instance

use super::{CounterStore, StoreError, StoreResult};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError, Script};
use async_trait::async_trait;
use tracing::info;

/// INCR and set the expiry on the first increment, in one round trip
const INCR_WITH_EXPIRY: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Counter store over a multiplexed, auto-reconnecting Redis connection
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`)
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("Connected to Redis counter store at {}", url);

        Ok(Self {
            conn,
            script: Script::new(INCR_WITH_EXPIRY),
        })
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .script
            .key(key)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        // -2: missing, -1: no expiry
        let ttl: i64 = conn.ttl(key).await.map_err(unavailable)?;
        Ok(u64::try_from(ttl).ok())
    }
}
