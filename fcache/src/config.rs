use crate::errors::{CacheError, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Deserialize, Debug, Clone)]
pub struct CacheConfig {
    pub catalog_path: PathBuf,
    pub source_path: PathBuf,
    pub redis_url: String,
    #[serde(default)]
    pub rebuild: RebuildConfig,
    #[serde(default)]
    pub pools: PoolConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Sizing of the bulk rebuild pipeline.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RebuildConfig {
    pub page_size: usize,
    pub batch_size: usize,
    pub relay_capacity: usize,
    pub poll_timeout_ms: u64,
    pub sentinel_timeout_ms: u64,
    /// Period of the scheduled rebuild in the service; `None` runs it on demand only.
    pub interval_secs: Option<u64>,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            batch_size: 1000,
            relay_capacity: 10_000,
            poll_timeout_ms: 5_000,
            sentinel_timeout_ms: 30_000,
            interval_secs: None,
        }
    }
}

impl RebuildConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn sentinel_timeout(&self) -> Duration {
        Duration::from_millis(self.sentinel_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub producer_threads: usize,
    pub consumer_threads: usize,
    pub event_threads: usize,
    pub event_queue_capacity: usize,
    /// Upper bound on event handlers running at once; past it `publish` waits.
    pub event_max_in_flight: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            producer_threads: 1,
            consumer_threads: 1,
            event_threads: 4,
            event_queue_capacity: 1024,
            event_max_in_flight: 64,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RankingConfig {
    pub decay_rate: f64,
    pub prune_threshold: f64,
    pub decay_interval_secs: u64,
    pub view_ttl_ms: u64,
    pub refresh_lock_ttl_ms: u64,
    pub top_n: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.95,
            prune_threshold: 1.0,
            decay_interval_secs: 300,
            view_ttl_ms: 60_000,
            refresh_lock_ttl_ms: 30_000,
            top_n: 20,
        }
    }
}

impl RankingConfig {
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }

    pub fn view_ttl(&self) -> Duration {
        Duration::from_millis(self.view_ttl_ms)
    }

    pub fn refresh_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.refresh_lock_ttl_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub max_retries: u32,
    pub scan_limit: usize,
    pub reconcile_interval_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            scan_limit: 100,
            reconcile_interval_secs: 60,
        }
    }
}

impl DeadLetterConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl CacheConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            catalog_path: base_path.join("dead_letter.sqlite"),
            source_path: base_path.join("source.sqlite"),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            rebuild: RebuildConfig::default(),
            pools: PoolConfig::default(),
            ranking: RankingConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Builds a config rooted at `base_path` and overlays `FCACHE_*` variables,
    /// loading a `.env` file first when one is present.
    pub fn from_env(base_path: impl Into<PathBuf>) -> Result<Self> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(CacheError::Config(format!("failed to load .env file: {}", err)));
            }
        }

        let mut config = Self::new(base_path);
        if let Ok(url) = std::env::var("FCACHE_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(path) = std::env::var("FCACHE_SOURCE_PATH") {
            config.source_path = PathBuf::from(path);
        }
        if let Some(v) = env_parse("FCACHE_PAGE_SIZE")? {
            config.rebuild.page_size = v;
        }
        if let Some(v) = env_parse("FCACHE_BATCH_SIZE")? {
            config.rebuild.batch_size = v;
        }
        if let Some(v) = env_parse("FCACHE_RELAY_CAPACITY")? {
            config.rebuild.relay_capacity = v;
        }
        if let Some(v) = env_parse("FCACHE_DECAY_RATE")? {
            config.ranking.decay_rate = v;
        }
        if let Some(v) = env_parse("FCACHE_PRUNE_THRESHOLD")? {
            config.ranking.prune_threshold = v;
        }
        if let Some(v) = env_parse("FCACHE_DLQ_MAX_RETRIES")? {
            config.dead_letter.max_retries = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("rebuild.page_size", self.rebuild.page_size),
            ("rebuild.batch_size", self.rebuild.batch_size),
            ("rebuild.relay_capacity", self.rebuild.relay_capacity),
            ("pools.producer_threads", self.pools.producer_threads),
            ("pools.consumer_threads", self.pools.consumer_threads),
            ("pools.event_threads", self.pools.event_threads),
            ("pools.event_queue_capacity", self.pools.event_queue_capacity),
            ("pools.event_max_in_flight", self.pools.event_max_in_flight),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(CacheError::Config(format!("{} must be > 0", name)));
            }
        }
        let intervals = [
            ("ranking.decay_interval_secs", self.ranking.decay_interval_secs),
            ("dead_letter.reconcile_interval_secs", self.dead_letter.reconcile_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(CacheError::Config(format!("{} must be > 0", name)));
            }
        }
        if !(0.0..1.0).contains(&self.ranking.decay_rate) {
            return Err(CacheError::Config(format!(
                "ranking.decay_rate must be in [0, 1), got {}",
                self.ranking.decay_rate
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(CacheError::Config("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| CacheError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
