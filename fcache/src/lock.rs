//! Store-mediated mutual exclusion for expensive cache recomputation.

use crate::errors::Result;
use crate::remote::RemoteStore;
use crate::utils::id::lock_owner_token;
use crate::utils::keys::refresh_lock_key;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, PartialEq)]
pub enum RefreshOutcome<T> {
    Refreshed(T),
    /// Another holder owns the lock; the caller should serve the current view.
    Skipped,
}

/// Grants at most one instance at a time the right to recompute a view.
///
/// Locks carry this coordinator's owner token and expire after their TTL. There
/// is no renewal: a holder that outlives its TTL may overlap with the next one.
pub struct CacheRefreshCoordinator {
    remote: Arc<dyn RemoteStore>,
    owner_token: String,
}

impl CacheRefreshCoordinator {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            owner_token: lock_owner_token(),
        }
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Returns `true` if this coordinator now holds the lock for `refresh_key`.
    /// A remote failure counts as "held elsewhere".
    pub async fn try_acquire(&self, refresh_key: &str, ttl: Duration) -> bool {
        let key = refresh_lock_key(refresh_key);
        match self.remote.set_if_absent(&key, &self.owner_token, ttl).await {
            Ok(true) => {
                log::debug!("Acquired {} for {:?}", key, ttl);
                true
            }
            Ok(false) => {
                log::debug!("{} is held by another instance", key);
                false
            }
            Err(err) => {
                log::warn!("Could not acquire {}; skipping refresh: {}", key, err);
                false
            }
        }
    }

    /// Releases the lock if this coordinator still owns it. Returns whether a
    /// lock was removed.
    pub async fn release(&self, refresh_key: &str) -> bool {
        let key = refresh_lock_key(refresh_key);
        match self.remote.delete_if_equals(&key, &self.owner_token).await {
            Ok(true) => true,
            Ok(false) => {
                log::warn!("{} expired or changed hands before release", key);
                false
            }
            Err(err) => {
                log::warn!("Failed to release {}; it will expire on its own: {}", key, err);
                false
            }
        }
    }

    /// Acquires the lock, runs `recompute` and releases the lock, whether or
    /// not the recomputation succeeded.
    pub async fn refresh_with<T, F, Fut>(
        &self,
        refresh_key: &str,
        ttl: Duration,
        recompute: F,
    ) -> Result<RefreshOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.try_acquire(refresh_key, ttl).await {
            return Ok(RefreshOutcome::Skipped);
        }
        let result = recompute().await;
        self.release(refresh_key).await;
        result.map(RefreshOutcome::Refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CacheError;
    use crate::remote::InMemoryRemoteStore;

    #[tokio::test]
    async fn test_second_acquire_fails_until_ttl_elapses() {
        let coordinator = CacheRefreshCoordinator::new(Arc::new(InMemoryRemoteStore::new()));
        let ttl = Duration::from_millis(40);

        assert!(coordinator.try_acquire("top-posts", ttl).await);
        assert!(!coordinator.try_acquire("top-posts", ttl).await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(coordinator.try_acquire("top-posts", ttl).await);
    }

    #[tokio::test]
    async fn test_release_only_removes_own_lock() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let mine = CacheRefreshCoordinator::new(remote.clone());
        let theirs = CacheRefreshCoordinator::new(remote.clone());
        let ttl = Duration::from_secs(5);

        assert!(theirs.try_acquire("top-posts", ttl).await);
        let holder = remote.get_value(&refresh_lock_key("top-posts")).await.unwrap();
        assert_eq!(holder.as_deref(), Some(theirs.owner_token()));
        assert_ne!(mine.owner_token(), theirs.owner_token());
        assert!(!mine.release("top-posts").await);
        assert!(!mine.try_acquire("top-posts", ttl).await);

        assert!(theirs.release("top-posts").await);
        assert!(mine.try_acquire("top-posts", ttl).await);
    }

    #[tokio::test]
    async fn test_outage_means_skip() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let coordinator = CacheRefreshCoordinator::new(remote.clone());
        remote.set_available(false);
        assert!(!coordinator.try_acquire("top-posts", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_refresh_with_releases_after_failure() {
        let coordinator = CacheRefreshCoordinator::new(Arc::new(InMemoryRemoteStore::new()));
        let ttl = Duration::from_secs(5);

        let failed: Result<RefreshOutcome<u32>> = coordinator
            .refresh_with("view", ttl, || async { Err(CacheError::NotFound("ranking".into())) })
            .await;
        assert!(failed.is_err());

        let outcome = coordinator
            .refresh_with("view", ttl, || async { Ok(7u32) })
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed(7));
    }

    #[tokio::test]
    async fn test_refresh_with_skips_when_held() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let holder = CacheRefreshCoordinator::new(remote.clone());
        let other = CacheRefreshCoordinator::new(remote);
        assert!(holder.try_acquire("view", Duration::from_secs(5)).await);

        let outcome = other
            .refresh_with("view", Duration::from_secs(5), || async { Ok(1u8) })
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Skipped);
    }
}
