use super::RemoteStore;
use crate::errors::{CacheError, Result};
use crate::models::{EntityId, PopularityEntry, ResyncRecord};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct State {
    friend_sets: HashMap<EntityId, BTreeSet<EntityId>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    values: HashMap<String, (String, Instant)>,
}

impl State {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(self.values.get(key), Some((_, deadline)) if *deadline <= Instant::now());
        if expired {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value)
    }
}

/// In-process remote store with Redis semantics.
///
/// Used by tests and offline runs. Outages can be simulated with
/// [`set_available`](Self::set_available) or [`fail_next`](Self::fail_next).
pub struct InMemoryRemoteStore {
    state: Mutex<State>,
    available: AtomicBool,
    fail_next: AtomicUsize,
    round_trips: AtomicU64,
    latency_ms: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            round_trips: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `n` operations fail as if the store were unreachable.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delays every operation by `latency`, like a slow network hop.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Number of operations that reached the store (a pipeline counts once).
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn friend_sets(&self) -> HashMap<EntityId, BTreeSet<EntityId>> {
        self.state
            .lock()
            .map(|state| state.friend_sets.clone())
            .unwrap_or_default()
    }

    fn begin(&self) -> Result<MutexGuard<'_, State>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory store is offline".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CacheError::Unavailable("injected failure".into()));
        }
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .map_err(|_| CacheError::Unavailable("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_friend_sets(&self, records: &[ResyncRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.pause().await;
        let mut state = self.begin()?;
        for record in records {
            if record.related_ids.is_empty() {
                state.friend_sets.remove(&record.owner_id);
            } else {
                state
                    .friend_sets
                    .insert(record.owner_id, record.related_ids.clone());
            }
        }
        Ok(())
    }

    async fn add_friend(&self, owner_id: EntityId, target_id: EntityId) -> Result<()> {
        self.pause().await;
        let mut state = self.begin()?;
        state.friend_sets.entry(owner_id).or_default().insert(target_id);
        Ok(())
    }

    async fn remove_friend(&self, owner_id: EntityId, target_id: EntityId) -> Result<()> {
        self.pause().await;
        let mut state = self.begin()?;
        if let Some(set) = state.friend_sets.get_mut(&owner_id) {
            set.remove(&target_id);
            if set.is_empty() {
                state.friend_sets.remove(&owner_id);
            }
        }
        Ok(())
    }

    async fn friends_of(&self, owner_id: EntityId) -> Result<BTreeSet<EntityId>> {
        self.pause().await;
        let state = self.begin()?;
        Ok(state.friend_sets.get(&owner_id).cloned().unwrap_or_default())
    }

    async fn increment_score(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        self.pause().await;
        let mut state = self.begin()?;
        let score = state
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.pause().await;
        let state = self.begin()?;
        Ok(state
            .sorted_sets
            .get(key)
            .and_then(|set| set.get(member))
            .copied())
    }

    async fn top_scores(&self, key: &str, limit: usize) -> Result<Vec<PopularityEntry>> {
        self.pause().await;
        let state = self.begin()?;
        let mut entries: Vec<PopularityEntry> = state
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .map(|(member, score)| PopularityEntry {
                        entity_id: member.clone(),
                        score: *score,
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.entity_id.cmp(&a.entity_id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn rescale_scores(&self, key: &str, rate: f64) -> Result<u64> {
        self.pause().await;
        let mut state = self.begin()?;
        match state.sorted_sets.get_mut(key) {
            Some(set) => {
                for score in set.values_mut() {
                    *score *= rate;
                }
                Ok(set.len() as u64)
            }
            None => Ok(0),
        }
    }

    async fn prune_scores(&self, key: &str, threshold: f64) -> Result<u64> {
        self.pause().await;
        let mut state = self.begin()?;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| *score > threshold);
        let removed = (before - set.len()) as u64;
        if set.is_empty() {
            state.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.pause().await;
        let mut state = self.begin()?;
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state
            .values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        self.pause().await;
        let mut state = self.begin()?;
        if state.live_value(key).map(String::as_str) == Some(value) {
            state.values.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.pause().await;
        let mut state = self.begin()?;
        Ok(state.live_value(key).cloned())
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.pause().await;
        let mut state = self.begin()?;
        state
            .values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }
}
