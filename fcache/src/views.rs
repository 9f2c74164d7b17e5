use crate::errors::Result;
use crate::lock::{CacheRefreshCoordinator, RefreshOutcome};
use crate::models::{PopularityEntry, RankingDomain};
use crate::ranking::PopularityRanking;
use crate::remote::RemoteStore;
use crate::utils::keys::view_key;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Cached views outlive their freshness window by this factor so that a
/// reader who loses the refresh race still has something to serve.
const STALE_RETENTION_FACTOR: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingView {
    pub domain: RankingDomain,
    pub entries: Vec<PopularityEntry>,
    pub computed_at_ms: i64,
}

impl TrendingView {
    fn is_fresh(&self, ttl: Duration) -> bool {
        let age_ms = Utc::now().timestamp_millis() - self.computed_at_ms;
        age_ms >= 0 && (age_ms as u128) < ttl.as_millis()
    }
}

/// Read-through cache of a ranking's top entries.
pub struct TrendingViewCache {
    remote: Arc<dyn RemoteStore>,
    coordinator: Arc<CacheRefreshCoordinator>,
    view_ttl: Duration,
    lock_ttl: Duration,
}

impl TrendingViewCache {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        coordinator: Arc<CacheRefreshCoordinator>,
        view_ttl: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            remote,
            coordinator,
            view_ttl,
            lock_ttl,
        }
    }

    pub fn view_name(domain: RankingDomain, n: usize) -> String {
        format!("top:{}:{}", domain.name(), n)
    }

    /// The top `n` entries of `ranking`. A fresh cached view is returned as is;
    /// otherwise one instance recomputes it while the others serve whatever is
    /// cached, which may be stale or absent.
    pub async fn top_view(
        &self,
        ranking: &PopularityRanking,
        n: usize,
    ) -> Result<Option<TrendingView>> {
        let name = Self::view_name(ranking.domain(), n);
        let key = view_key(&name);
        let cached = self.read(&key).await;
        if let Some(view) = &cached {
            if view.is_fresh(self.view_ttl) {
                return Ok(cached);
            }
        }

        let outcome = self
            .coordinator
            .refresh_with(&name, self.lock_ttl, || async {
                let view = TrendingView {
                    domain: ranking.domain(),
                    entries: ranking.top(n).await?,
                    computed_at_ms: Utc::now().timestamp_millis(),
                };
                let payload = serde_json::to_string(&view)?;
                self.remote
                    .set_value(&key, &payload, self.view_ttl * STALE_RETENTION_FACTOR)
                    .await?;
                Ok(view)
            })
            .await;

        match outcome {
            Ok(RefreshOutcome::Refreshed(view)) => {
                log::debug!("Refreshed {} with {} entries", name, view.entries.len());
                Ok(Some(view))
            }
            Ok(RefreshOutcome::Skipped) => Ok(cached),
            Err(err) if cached.is_some() => {
                log::warn!("Refresh of {} failed; serving stale view: {}", name, err);
                Ok(cached)
            }
            Err(err) => Err(err),
        }
    }

    async fn read(&self, key: &str) -> Option<TrendingView> {
        let payload = match self.remote.get_value(key).await {
            Ok(payload) => payload?,
            Err(err) => {
                log::warn!("Could not read cached view {}: {}", key, err);
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(view) => Some(view),
            Err(err) => {
                log::warn!("Discarding malformed cached view {}: {}", key, err);
                None
            }
        }
    }
}
