use crate::errors::{CacheError, Result};
use crate::models::{DecayOutcome, EntityId, PopularityEntry, RankingDomain};
use crate::remote::RemoteStore;
use crate::retry::{retry, RetryPolicy};
use crate::utils::keys::ranking_key;
use std::sync::Arc;

/// Real-time popularity scores for one ranking domain.
pub struct PopularityRanking {
    remote: Arc<dyn RemoteStore>,
    domain: RankingDomain,
    key: String,
    retry: RetryPolicy,
}

impl PopularityRanking {
    pub fn new(remote: Arc<dyn RemoteStore>, domain: RankingDomain, retry: RetryPolicy) -> Self {
        Self {
            remote,
            domain,
            key: ranking_key(domain),
            retry,
        }
    }

    pub fn domain(&self) -> RankingDomain {
        self.domain
    }

    /// Adds `delta` to the entity's score. Transient failures are retried;
    /// if the increment still fails it is logged and dropped.
    pub async fn increment(&self, entity_id: EntityId, delta: f64) -> Option<f64> {
        let member = entity_id.to_string();
        let label = format!("{} increment for {}", self.domain, entity_id);
        let remote = &self.remote;
        let key = self.key.as_str();
        let member_ref = member.as_str();
        match retry(&self.retry, &label, CacheError::is_transient, || {
            remote.increment_score(key, member_ref, delta)
        })
        .await
        {
            Ok(score) => Some(score),
            Err(err) => {
                log::warn!(
                    "Dropping {} popularity increment of {} for {}: {}",
                    self.domain,
                    delta,
                    entity_id,
                    err
                );
                None
            }
        }
    }

    /// Multiplies every score by `rate`, then removes entries at or below
    /// `threshold`.
    ///
    /// The two steps are separate remote operations. Between them a reader may
    /// see rescaled entries that are about to be pruned.
    pub async fn decay_all(&self, rate: f64, threshold: f64) -> Result<DecayOutcome> {
        if !(0.0..1.0).contains(&rate) {
            return Err(CacheError::InvalidArg(format!(
                "decay rate must lie in [0, 1), got {}",
                rate
            )));
        }
        let rescaled = self.remote.rescale_scores(&self.key, rate).await?;
        let pruned = self.remote.prune_scores(&self.key, threshold).await?;
        log::info!(
            "Decayed {} ranking: {} entries rescaled by {}, {} pruned at <= {}",
            self.domain,
            rescaled,
            rate,
            pruned,
            threshold
        );
        Ok(DecayOutcome { rescaled, pruned })
    }

    pub async fn top(&self, n: usize) -> Result<Vec<PopularityEntry>> {
        self.remote.top_scores(&self.key, n).await
    }

    pub async fn score(&self, entity_id: EntityId) -> Result<Option<f64>> {
        self.remote.score(&self.key, &entity_id.to_string()).await
    }
}
