//! Redis-backed coordination store.
//!
//! # Queue Structure
//!
//! The ordered queue uses three Redis keys:
//!
//! - `{queue}`: sorted set scored by negated priority, so `ZPOPMIN` yields the
//!   highest priority. Members are `{sequence:020}:{member}`; among equal
//!   scores Redis orders members lexicographically, which makes equal
//!   priorities pop in push order.
//! - `{queue}:index`: hash from member to its encoded sorted-set entry
//! - `{queue}:seq`: monotonic counter used to build the encoded entries
//!
//! Every multi-command primitive runs as a Lua script and is therefore atomic
//! on the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::CoordinationStore;
use crate::error::StoreError;

const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
else
  if current ~= ARGV[2] then return 0 end
end
if ARGV[3] == '0' then
  redis.call('DEL', KEYS[1])
else
  redis.call('SET', KEYS[1], ARGV[4])
end
return 1
";

const PUSH_SCRIPT: &str = r"
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 then return 0 end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return 1
";

const POP_SCRIPT: &str = r"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then return false end
local member = string.match(popped[1], '^%d+:(.*)$')
redis.call('HDEL', KEYS[2], member)
return member
";

const REMOVE_SCRIPT: &str = r"
local entry = redis.call('HGET', KEYS[2], ARGV[1])
if not entry then return 0 end
redis.call('ZREM', KEYS[1], entry)
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
";

/// Coordination store backed by a Redis server.
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    cas_script: Script,
    push_script: Script,
    pop_script: Script,
    remove_script: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self::from_connection(redis))
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            cas_script: Script::new(CAS_SCRIPT),
            push_script: Script::new(PUSH_SCRIPT),
            pop_script: Script::new(POP_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        }
    }

    fn index_key(queue: &str) -> String {
        format!("{}:index", queue)
    }

    fn seq_key(queue: &str) -> String {
        format!("{}:seq", queue)
    }

    fn encode_entry(seq: u64, member: &str) -> String {
        format!("{:020}:{}", seq, member)
    }

    fn decode_entry(entry: &str) -> Option<&str> {
        entry.split_once(':').map(|(_, member)| member)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get(key).await?)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn queue_push(
        &self,
        queue: &str,
        member: &str,
        priority: i32,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();

        // Sequence gaps from aborted pushes are harmless; only ordering matters.
        let seq: u64 = conn.incr(Self::seq_key(queue), 1).await?;
        let entry = Self::encode_entry(seq, member);
        let score = -f64::from(priority);

        let inserted: i64 = self
            .push_script
            .key(queue)
            .key(Self::index_key(queue))
            .arg(member)
            .arg(&entry)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let member: Option<String> = self
            .pop_script
            .key(queue)
            .key(Self::index_key(queue))
            .invoke_async(&mut conn)
            .await?;
        Ok(member)
    }

    async fn queue_remove(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .remove_script
            .key(queue)
            .key(Self::index_key(queue))
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn queue_contains(&self, queue: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.hexists(Self::index_key(queue), member).await?)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(queue).await?)
    }

    async fn queue_peek(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<(String, i32)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(queue, 0, limit as isize - 1)
            .await?;

        entries
            .into_iter()
            .map(|(entry, score)| {
                let member = Self::decode_entry(&entry).ok_or_else(|| StoreError::Corrupt {
                    key: queue.to_string(),
                    message: format!("malformed queue entry '{}'", entry),
                })?;
                Ok((member.to_string(), -score as i32))
            })
            .collect()
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.scard(key).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
