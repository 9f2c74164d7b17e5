pub mod config;
pub mod dlq;
pub mod errors;
pub mod events;
pub mod lock;
pub mod models;
pub mod pool;
pub mod ranking;
pub mod rebuild;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod source;
pub mod utils;
pub mod views;

use crate::config::CacheConfig;
use crate::dlq::SqliteDeadLetterStore;
use crate::errors::{CacheError, Result};
use crate::events::{EventDispatcher, IncrementalEventProcessor};
use crate::lock::CacheRefreshCoordinator;
use crate::models::{DecayOutcome, RankingDomain, RebuildReport};
use crate::pool::WorkerPools;
use crate::ranking::PopularityRanking;
use crate::rebuild::{FriendCacheRebuilder, RebuildHandle};
use crate::reconcile::DeadLetterReconciler;
use crate::remote::{RedisStore, RemoteStore};
use crate::source::SqliteFriendSource;
use crate::views::{TrendingView, TrendingViewCache};
use std::sync::Arc;
use std::time::Duration;

pub use crate::models::{DomainEvent, EventOutcome};

/// The main entry point for the `fcache` library.
///
/// `FCache` keeps the derived views in the remote store consistent with the
/// relational source of truth:
/// - A bulk rebuild (`FriendCacheRebuilder`) that streams every friend set
///   from SQLite into the remote store through a bounded relay.
/// - An incremental processor fed by an `EventDispatcher`, which dead-letters
///   mutations the remote store rejects.
/// - A reconciler that replays dead-lettered mutations.
/// - Popularity rankings with periodic decay, and a lock-guarded cache of
///   their top-N views.
///
/// # Example
///
/// ```rust,no_run
/// use fcache::{FCache, config::CacheConfig};
/// use tempfile::tempdir;
///
/// #[tokio::main]
/// async fn main() {
///     let dir = tempdir().unwrap();
///     let config = CacheConfig::new(dir.path());
///     let cache = FCache::new(config).await.unwrap();
///
///     let report = cache.rebuild_friend_cache().await.unwrap();
///     println!("{} friend sets written", report.consumer.flushed_records);
/// }
/// ```
pub struct FCache {
    pub config: CacheConfig,
    pub remote: Arc<dyn RemoteStore>,
    pub source: Arc<SqliteFriendSource>,
    pub dead_letters: Arc<SqliteDeadLetterStore>,
    pub processor: Arc<IncrementalEventProcessor>,
    pub coordinator: Arc<CacheRefreshCoordinator>,
    pub rebuilder: FriendCacheRebuilder,
    pub reconciler: DeadLetterReconciler,
    pub trending: TrendingViewCache,
    pools: WorkerPools,
}

impl FCache {
    /// Connects to the Redis instance named in `config.redis_url` and wires
    /// every component against it.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let remote = Arc::new(RedisStore::connect(&config.redis_url).await?);
        Self::with_remote(config, remote)
    }

    /// Wires every component against an already constructed remote store.
    ///
    /// This will:
    /// 1. Validate the configuration and create the SQLite parent directories.
    /// 2. Open the source of truth and the dead-letter store and create their schemas.
    /// 3. Start the producer, consumer and event worker pools.
    pub fn with_remote(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        config.validate()?;
        for path in [&config.catalog_path, &config.source_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let source = Arc::new(SqliteFriendSource::new(&config.source_path)?);
        source.initialize_schema()?;
        let dead_letters = Arc::new(SqliteDeadLetterStore::new(&config.catalog_path)?);
        dead_letters.initialize_schema()?;

        let processor = Arc::new(IncrementalEventProcessor::new(
            Arc::clone(&remote),
            dead_letters.clone(),
            config.retry,
        ));
        let coordinator = Arc::new(CacheRefreshCoordinator::new(Arc::clone(&remote)));
        let rebuilder = FriendCacheRebuilder::new(
            source.clone(),
            source.clone(),
            Arc::clone(&remote),
            config.rebuild.clone(),
            config.retry,
        );
        let reconciler = DeadLetterReconciler::new(
            dead_letters.clone(),
            Arc::clone(&processor),
            config.retry,
            &config.dead_letter,
        );
        let trending = TrendingViewCache::new(
            Arc::clone(&remote),
            Arc::clone(&coordinator),
            config.ranking.view_ttl(),
            config.ranking.refresh_lock_ttl(),
        );
        let pools = WorkerPools::new(&config.pools)?;

        log::info!(
            "fcache ready (remote: {}, source: {}, dead letters: {})",
            remote.name(),
            config.source_path.display(),
            config.catalog_path.display()
        );
        Ok(Self {
            config,
            remote,
            source,
            dead_letters,
            processor,
            coordinator,
            rebuilder,
            reconciler,
            trending,
            pools,
        })
    }

    pub fn pools(&self) -> &WorkerPools {
        &self.pools
    }

    /// Starts a friend-set rebuild on the rebuild pools without waiting for it.
    pub fn start_rebuild(&self) -> RebuildHandle {
        self.rebuilder
            .start(&self.pools.producer, &self.pools.consumer)
    }

    pub async fn rebuild_friend_cache(&self) -> Result<RebuildReport> {
        self.start_rebuild().wait().await
    }

    /// Starts the dispatcher that feeds domain events to the incremental processor.
    pub fn start_dispatcher(&self) -> EventDispatcher {
        EventDispatcher::start(
            Arc::clone(&self.processor),
            &self.pools.events,
            self.config.pools.event_queue_capacity,
            self.config.pools.event_max_in_flight,
        )
    }

    pub fn ranking(&self, domain: RankingDomain) -> Result<Arc<PopularityRanking>> {
        self.processor
            .ranking(domain)
            .ok_or_else(|| CacheError::NotFound(format!("ranking for {}", domain)))
    }

    /// One decay pass over `domain` with the configured rate and threshold.
    pub async fn decay(&self, domain: RankingDomain) -> Result<DecayOutcome> {
        self.ranking(domain)?
            .decay_all(self.config.ranking.decay_rate, self.config.ranking.prune_threshold)
            .await
    }

    pub async fn top_view(&self, domain: RankingDomain, n: usize) -> Result<Option<TrendingView>> {
        let ranking = self.ranking(domain)?;
        self.trending.top_view(&ranking, n).await
    }

    /// Claims the right to run `job` for the next `period` across all
    /// instances sharing the remote store. The claim is never released; it
    /// expires when the period ends.
    pub async fn claim_period(&self, job: &str, period: Duration) -> bool {
        self.coordinator
            .try_acquire(&format!("period:{}", job), period)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemoteStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_with_remote_creates_schemas() {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path().join("nested"));
        let cache = FCache::with_remote(config, Arc::new(InMemoryRemoteStore::new())).unwrap();

        cache.source.insert_friend(1, 2).unwrap();
        assert_eq!(crate::dlq::DeadLetterStore::count(cache.dead_letters.as_ref()).unwrap(), 0);
        assert!(cache.ranking(RankingDomain::PaperRealtime).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = CacheConfig::new(dir.path());
        config.ranking.decay_rate = 1.0;
        assert!(matches!(
            FCache::with_remote(config, Arc::new(InMemoryRemoteStore::new())),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_period_claim_is_exclusive() {
        let dir = tempdir().unwrap();
        let remote: Arc<dyn RemoteStore> = Arc::new(InMemoryRemoteStore::new());
        let a = FCache::with_remote(CacheConfig::new(dir.path().join("a")), remote.clone()).unwrap();
        let b = FCache::with_remote(CacheConfig::new(dir.path().join("b")), remote).unwrap();

        assert!(a.claim_period("decay:post", Duration::from_secs(5)).await);
        assert!(!b.claim_period("decay:post", Duration::from_secs(5)).await);
    }
}
