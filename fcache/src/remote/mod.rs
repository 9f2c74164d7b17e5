//! The remote derived-view store.
//!
//! Every mutation here is a single atomic remote operation (or a single
//! pipelined round trip), so callers never hold local locks around them.

pub mod memory;
pub mod redis_store;

use crate::errors::Result;
use crate::models::{EntityId, PopularityEntry, ResyncRecord};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;

pub use self::memory::InMemoryRemoteStore;
pub use self::redis_store::RedisStore;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replaces each record's friend set. All records travel in one round trip.
    async fn write_friend_sets(&self, records: &[ResyncRecord]) -> Result<()>;

    async fn add_friend(&self, owner_id: EntityId, target_id: EntityId) -> Result<()>;

    async fn remove_friend(&self, owner_id: EntityId, target_id: EntityId) -> Result<()>;

    async fn friends_of(&self, owner_id: EntityId) -> Result<BTreeSet<EntityId>>;

    /// Atomically adds `delta` to `member`'s score and returns the new score.
    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> Result<f64>;

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Highest scores first.
    async fn top_scores(&self, key: &str, limit: usize) -> Result<Vec<PopularityEntry>>;

    /// Multiplies every score under `key` by `rate` server-side and returns the cardinality.
    async fn rescale_scores(&self, key: &str, rate: f64) -> Result<u64>;

    /// Removes every member whose score is `<= threshold`; returns how many went.
    async fn prune_scores(&self, key: &str, threshold: f64) -> Result<u64>;

    /// Set-if-not-exists with expiry. Returns whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}
