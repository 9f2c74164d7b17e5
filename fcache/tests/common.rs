use std::sync::Arc;
use std::time::Duration;

use fcache::{
    config::CacheConfig, remote::InMemoryRemoteStore, retry::RetryPolicy, FCache,
};
use tempfile::TempDir;

#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub remote: Arc<InMemoryRemoteStore>,
    pub cache: FCache,
}

/// Small pages and batches so a handful of owners exercises every code path.
pub fn test_config(temp_dir: &TempDir) -> CacheConfig {
    let mut config = CacheConfig::new(temp_dir.path());
    config.rebuild.page_size = 2;
    config.rebuild.batch_size = 3;
    config.rebuild.relay_capacity = 4;
    config.rebuild.poll_timeout_ms = 20;
    config.rebuild.sentinel_timeout_ms = 2_000;
    config.pools.event_threads = 2;
    config.dead_letter.max_retries = 3;
    config.retry = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
    config
}

#[allow(dead_code)]
pub async fn init_test_context() -> anyhow::Result<TestContext> {
    let _ = env_logger::builder().is_test(true).try_init();

    let temp_dir = tempfile::tempdir()?;
    let config = test_config(&temp_dir);
    let remote = Arc::new(InMemoryRemoteStore::new());
    let cache = FCache::with_remote(config, remote.clone())?;

    Ok(TestContext {
        temp_dir,
        remote,
        cache,
    })
}

/// Seeds `owner -> friends` rows; owners listed with no friends still become members.
#[allow(dead_code)]
pub fn seed(cache: &FCache, graph: &[(i64, &[i64])]) -> anyhow::Result<()> {
    for (owner, friends) in graph {
        cache.source.insert_member(*owner)?;
        for friend in *friends {
            cache.source.insert_friend(*owner, *friend)?;
        }
    }
    Ok(())
}
