use super::RemoteStore;
use crate::errors::Result;
use crate::models::{EntityId, PopularityEntry, ResyncRecord};
use crate::utils::keys::friend_set_key;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::BTreeSet;
use std::time::Duration;

/// Rescales every member of a sorted set in one server-side pass.
/// KEYS[1] = ranking key, ARGV[1] = decay rate. Returns ZCARD.
pub const DECAY_SCRIPT: &str = r#"
local members = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
local rate = tonumber(ARGV[1])
for i = 1, #members, 2 do
    local decayed = tonumber(members[i + 1]) * rate
    redis.call('ZADD', KEYS[1], string.format('%.17g', decayed), members[i])
end
return redis.call('ZCARD', KEYS[1])
"#;

/// Compare-and-delete used to release a lock held under a specific token.
pub const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    decay_script: Script,
    release_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        log::info!("Connected to remote store at {}", url);
        Ok(Self {
            conn,
            decay_script: Script::new(DECAY_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn write_friend_sets(&self, records: &[ResyncRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records {
            let key = friend_set_key(record.owner_id);
            pipe.cmd("DEL").arg(&key).ignore();
            if !record.related_ids.is_empty() {
                let members: Vec<EntityId> = record.related_ids.iter().copied().collect();
                pipe.cmd("SADD").arg(&key).arg(members).ignore();
            }
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn add_friend(&self, owner_id: EntityId, target_id: EntityId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(friend_set_key(owner_id))
            .arg(target_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_friend(&self, owner_id: EntityId, target_id: EntityId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(friend_set_key(owner_id))
            .arg(target_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn friends_of(&self, owner_id: EntityId) -> Result<BTreeSet<EntityId>> {
        let mut conn = self.conn.clone();
        let members: BTreeSet<EntityId> = redis::cmd("SMEMBERS")
            .arg(friend_set_key(owner_id))
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn.clone();
        let score: f64 = redis::cmd("ZINCRBY")
            .arg(key)
            .arg(delta)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn top_scores(&self, key: &str, limit: usize) -> Result<Vec<PopularityEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(0)
            .arg(limit as i64 - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(entity_id, score)| PopularityEntry { entity_id, score })
            .collect())
    }

    async fn rescale_scores(&self, key: &str, rate: f64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let cardinality: u64 = self
            .decay_script
            .key(key)
            .arg(rate)
            .invoke_async(&mut conn)
            .await?;
        Ok(cardinality)
    }

    async fn prune_scores(&self, key: &str, threshold: f64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(threshold)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
