//! Runs the rebuild and ranking paths against a real Redis.
//!
//! Ignored by default. Point `FCACHE_REDIS_URL` (or a `.env` file) at a
//! disposable instance: the test deletes the keys it touches.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use fcache::{
    lock::CacheRefreshCoordinator,
    models::{RankingDomain, ResyncRecord},
    ranking::PopularityRanking,
    remote::{RedisStore, RemoteStore},
    retry::RetryPolicy,
    FCache,
};

mod common;

async fn connect() -> Result<Arc<RedisStore>> {
    if let Err(err) = dotenv() {
        if !matches!(err, dotenvy::Error::Io(ref io_err) if io_err.kind() == ErrorKind::NotFound) {
            anyhow::bail!("failed to load .env file: {err}");
        }
    }
    let url = std::env::var("FCACHE_REDIS_URL")
        .context("FCACHE_REDIS_URL must be set to run the live Redis test")?;
    let store = RedisStore::connect(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(Arc::new(store))
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis reachable through FCACHE_REDIS_URL"]
async fn live_friend_sets_are_replaced_atomically() -> Result<()> {
    let remote = connect().await?;
    let owners = [900_001i64, 900_002];
    remote
        .write_friend_sets(&[
            ResyncRecord::new(owners[0], BTreeSet::from([1, 2, 3])),
            ResyncRecord::new(owners[1], BTreeSet::from([4])),
        ])
        .await?;
    remote
        .write_friend_sets(&[ResyncRecord::new(owners[0], BTreeSet::from([5]))])
        .await?;

    assert_eq!(remote.friends_of(owners[0]).await?, BTreeSet::from([5]));
    assert_eq!(remote.friends_of(owners[1]).await?, BTreeSet::from([4]));

    for owner in owners {
        remote.remove_friend(owner, 5).await?;
        remote.remove_friend(owner, 4).await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis reachable through FCACHE_REDIS_URL"]
async fn live_decay_and_lock_semantics() -> Result<()> {
    let remote = connect().await?;
    let ranking = PopularityRanking::new(
        remote.clone(),
        RankingDomain::PaperRealtime,
        RetryPolicy::default(),
    );
    ranking.decay_all(0.0, 0.0).await?;

    ranking.increment(1, 0.5).await;
    ranking.increment(2, 20.0).await;
    let outcome = ranking.decay_all(0.9, 1.0).await?;
    assert_eq!(outcome.pruned, 1);
    let score = ranking.score(2).await?.context("entity 2 should survive")?;
    assert!((score - 18.0).abs() < 1e-9);

    let coordinator = CacheRefreshCoordinator::new(remote.clone());
    let ttl = Duration::from_millis(300);
    assert!(coordinator.try_acquire("live-test", ttl).await);
    assert!(!coordinator.try_acquire("live-test", ttl).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(coordinator.try_acquire("live-test", ttl).await);
    assert!(coordinator.release("live-test").await);

    ranking.decay_all(0.0, 0.0).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running Redis reachable through FCACHE_REDIS_URL"]
async fn live_full_rebuild() -> Result<()> {
    let remote = connect().await?;
    let temp_dir = tempfile::tempdir()?;
    let cache = FCache::with_remote(common::test_config(&temp_dir), remote.clone())?;
    common::seed(&cache, &[(910_001, &[1, 2]), (910_002, &[]), (910_003, &[3])])?;

    let report = cache.rebuild_friend_cache().await?;
    assert_eq!(report.consumer.flushed_records, 2);
    assert_eq!(remote.friends_of(910_001).await?, BTreeSet::from([1, 2]));
    assert!(remote.friends_of(910_002).await?.is_empty());
    Ok(())
}
