//! Incremental cache maintenance driven by domain events.

use crate::dlq::DeadLetterStore;
use crate::errors::{CacheError, Result};
use crate::models::{
    DlqEntry, DomainEvent, EntityId, EventOutcome, MutationType, NewDlqEntry, RankingDomain,
};
use crate::pool::{TaskHandle, WorkerPool};
use crate::ranking::PopularityRanking;
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::utils::id::relation_event_id;
use crate::utils::keys::interaction_key;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A single remote mutation, replayable from a dead-letter row.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub event_id: String,
    pub mutation_type: MutationType,
    pub owner_id: EntityId,
    pub target_id: EntityId,
    pub score_delta: Option<f64>,
}

impl Mutation {
    pub fn relation(mutation_type: MutationType, owner_id: EntityId, target_id: EntityId) -> Self {
        Self {
            event_id: relation_event_id(mutation_type, owner_id, target_id),
            mutation_type,
            owner_id,
            target_id,
            score_delta: None,
        }
    }

    pub fn score_up(event_id: String, owner_id: EntityId, target_id: EntityId, delta: f64) -> Self {
        Self {
            event_id,
            mutation_type: MutationType::ScoreUp,
            owner_id,
            target_id,
            score_delta: Some(delta),
        }
    }

    pub fn to_dead_letter(&self, error: &CacheError) -> NewDlqEntry {
        NewDlqEntry {
            event_id: self.event_id.clone(),
            mutation_type: self.mutation_type,
            owner_id: self.owner_id,
            target_id: self.target_id,
            score_delta: self.score_delta,
            last_error: Some(error.to_string()),
        }
    }
}

impl From<&DlqEntry> for Mutation {
    fn from(entry: &DlqEntry) -> Self {
        Self {
            event_id: entry.event_id.clone(),
            mutation_type: entry.mutation_type,
            owner_id: entry.owner_id,
            target_id: entry.target_id,
            score_delta: entry.score_delta,
        }
    }
}

pub struct IncrementalEventProcessor {
    remote: Arc<dyn RemoteStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    rankings: HashMap<RankingDomain, Arc<PopularityRanking>>,
}

impl IncrementalEventProcessor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        ranking_retry: RetryPolicy,
    ) -> Self {
        let rankings = RankingDomain::ALL
            .iter()
            .map(|&domain| {
                (
                    domain,
                    Arc::new(PopularityRanking::new(remote.clone(), domain, ranking_retry)),
                )
            })
            .collect();
        Self {
            remote,
            dead_letters,
            rankings,
        }
    }

    pub fn ranking(&self, domain: RankingDomain) -> Option<Arc<PopularityRanking>> {
        self.rankings.get(&domain).cloned()
    }

    /// Applies one event to the remote store. Never fails: a mutation the store
    /// rejects is dead-lettered, and a dead-letter failure is only logged.
    pub async fn handle(&self, event: DomainEvent) -> EventOutcome {
        let mutation = match event {
            DomainEvent::RelationAdded {
                owner_id,
                target_id,
            } => Mutation::relation(MutationType::RelationAdd, owner_id, target_id),
            DomainEvent::RelationRemoved {
                owner_id,
                target_id,
            } => Mutation::relation(MutationType::RelationRemove, owner_id, target_id),
            DomainEvent::InteractionScored {
                event_id,
                owner_id,
                target_id,
                delta,
            } => Mutation::score_up(event_id, owner_id, target_id, delta),
            DomainEvent::ContentActivity {
                domain,
                entity_id,
                activity,
            } => {
                match self.rankings.get(&domain) {
                    Some(ranking) => {
                        ranking.increment(entity_id, activity.weight()).await;
                    }
                    None => log::warn!("No ranking registered for {}", domain),
                }
                return EventOutcome::BestEffort;
            }
        };

        match self.apply(&mutation).await {
            Ok(()) => EventOutcome::Applied,
            Err(err) => self.dead_letter(&mutation, &err),
        }
    }

    /// Performs the remote operation for `mutation` once.
    pub async fn apply(&self, mutation: &Mutation) -> Result<()> {
        match mutation.mutation_type {
            MutationType::RelationAdd => {
                self.remote
                    .add_friend(mutation.owner_id, mutation.target_id)
                    .await
            }
            MutationType::RelationRemove => {
                self.remote
                    .remove_friend(mutation.owner_id, mutation.target_id)
                    .await
            }
            MutationType::ScoreUp => {
                let delta = mutation.score_delta.ok_or_else(|| {
                    CacheError::InvalidArg(format!("{} has no score delta", mutation.event_id))
                })?;
                self.remote
                    .increment_score(
                        &interaction_key(mutation.owner_id),
                        &mutation.target_id.to_string(),
                        delta,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    fn dead_letter(&self, mutation: &Mutation, error: &CacheError) -> EventOutcome {
        match self.dead_letters.upsert_if_absent(&mutation.to_dead_letter(error)) {
            Ok(written) => {
                log::warn!(
                    "Dead-lettered {}{}: {}",
                    mutation.event_id,
                    if written { "" } else { " (already pending)" },
                    error
                );
                EventOutcome::DeadLettered
            }
            Err(persist_err) => {
                log::error!(
                    "Lost mutation {}: remote failed with '{}' and dead-letter write failed with '{}'",
                    mutation.event_id,
                    error,
                    persist_err
                );
                EventOutcome::DeadLetterFailed
            }
        }
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    received: AtomicU64,
    applied: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failed: AtomicU64,
    best_effort: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub received: u64,
    pub applied: u64,
    pub dead_lettered: u64,
    pub dead_letter_failed: u64,
    pub best_effort: u64,
    pub panicked: u64,
}

impl DispatchCounters {
    fn record(&self, outcome: EventOutcome) {
        let counter = match outcome {
            EventOutcome::Applied => &self.applied,
            EventOutcome::DeadLettered => &self.dead_lettered,
            EventOutcome::DeadLetterFailed => &self.dead_letter_failed,
            EventOutcome::BestEffort => &self.best_effort,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dead_letter_failed: self.dead_letter_failed.load(Ordering::Relaxed),
            best_effort: self.best_effort.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

/// Typed event channel feeding the processor on the event pool.
///
/// Each event runs as its own task, so events for different owners are applied
/// concurrently and in no particular order. At most `max_in_flight` handlers run
/// at once; past that the loop stops receiving and `publish` waits on the queue.
pub struct EventDispatcher {
    tx: mpsc::Sender<DomainEvent>,
    task: TaskHandle<()>,
    counters: Arc<DispatchCounters>,
}

impl EventDispatcher {
    pub fn start(
        processor: Arc<IncrementalEventProcessor>,
        pool: &WorkerPool,
        capacity: usize,
        max_in_flight: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(DispatchCounters::default());
        let loop_counters = counters.clone();
        let max_in_flight = max_in_flight.max(1);
        let task = pool.submit("event-dispatch", move |cancel| {
            dispatch_loop(rx, processor, loop_counters, max_in_flight, cancel)
        });
        Self { tx, task, counters }
    }

    /// Queues an event, waiting while the channel is full.
    pub async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CacheError::TaskFailed("event dispatcher has stopped".into()))
    }

    /// Queues an event only if there is room. Returns whether it was accepted.
    pub fn try_publish(&self, event: DomainEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Event queue full; rejected {} event", event.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                log::warn!("Event dispatcher stopped; rejected {} event", event.kind());
                false
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Stops accepting events, finishes the ones already queued and waits for
    /// the dispatch loop to exit.
    pub async fn shutdown(self) -> Result<DispatchStats> {
        let Self { tx, task, counters } = self;
        drop(tx);
        task.join().await?;
        Ok(counters.snapshot())
    }

    /// Stops the loop without draining queued events. In-flight handlers finish.
    pub async fn abort(self) -> Result<DispatchStats> {
        self.task.cancel();
        let Self { task, counters, .. } = self;
        task.join().await?;
        Ok(counters.snapshot())
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<DomainEvent>,
    processor: Arc<IncrementalEventProcessor>,
    counters: Arc<DispatchCounters>,
    max_in_flight: usize,
    cancel: CancellationToken,
) {
    let mut in_flight: JoinSet<EventOutcome> = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Event dispatcher cancelled with {} handlers in flight", in_flight.len());
                break;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                record_joined(joined, &counters);
            }
            event = rx.recv(), if in_flight.len() < max_in_flight => match event {
                Some(event) => {
                    counters.received.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Dispatching {} event", event.kind());
                    let processor = processor.clone();
                    in_flight.spawn(async move { processor.handle(event).await });
                }
                None => {
                    log::debug!("Event channel closed; draining {} handlers", in_flight.len());
                    break;
                }
            },
        }
    }
    while let Some(joined) = in_flight.join_next().await {
        record_joined(joined, &counters);
    }
}

fn record_joined(
    joined: std::result::Result<EventOutcome, tokio::task::JoinError>,
    counters: &DispatchCounters,
) {
    match joined {
        Ok(outcome) => counters.record(outcome),
        Err(err) => {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            log::error!("Event handler failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::SqliteDeadLetterStore;
    use crate::models::{ActivityKind, DlqStatus};
    use crate::remote::InMemoryRemoteStore;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (
        IncrementalEventProcessor,
        Arc<InMemoryRemoteStore>,
        Arc<SqliteDeadLetterStore>,
        TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemoteStore::new());
        let dlq = Arc::new(SqliteDeadLetterStore::new(dir.path().join("dlq.sqlite")).unwrap());
        dlq.initialize_schema().unwrap();
        let processor = IncrementalEventProcessor::new(
            remote.clone(),
            dlq.clone(),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
        );
        (processor, remote, dlq, dir)
    }

    #[tokio::test]
    async fn test_relation_events_update_friend_set() {
        let (processor, remote, _dlq, _dir) = setup();
        let add = |target_id| DomainEvent::RelationAdded {
            owner_id: 1,
            target_id,
        };
        assert_eq!(processor.handle(add(2)).await, EventOutcome::Applied);
        assert_eq!(processor.handle(add(3)).await, EventOutcome::Applied);
        processor
            .handle(DomainEvent::RelationRemoved {
                owner_id: 1,
                target_id: 2,
            })
            .await;
        assert_eq!(remote.friends_of(1).await.unwrap(), BTreeSet::from([3]));
    }

    #[tokio::test]
    async fn test_outage_dead_letters_score_with_delta() {
        let (processor, remote, dlq, _dir) = setup();
        let scored = |event_id: &str, delta| DomainEvent::InteractionScored {
            event_id: event_id.to_string(),
            owner_id: 1,
            target_id: 42,
            delta,
        };

        assert_eq!(processor.handle(scored("SCORE_UP:a", 5.0)).await, EventOutcome::Applied);
        remote.set_available(false);
        assert_eq!(
            processor.handle(scored("SCORE_UP:b", 3.0)).await,
            EventOutcome::DeadLettered
        );

        assert_eq!(dlq.count().unwrap(), 1);
        let entry = dlq.get_by_event_id("SCORE_UP:b").unwrap().unwrap();
        assert_eq!(entry.score_delta, Some(3.0));
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.retry_count, 0);

        remote.set_available(true);
        assert_eq!(
            remote.score(&interaction_key(1), "42").await.unwrap(),
            Some(5.0)
        );
    }

    #[tokio::test]
    async fn test_repeated_relation_failure_is_one_row() {
        let (processor, remote, dlq, _dir) = setup();
        remote.set_available(false);
        for _ in 0..2 {
            let outcome = processor
                .handle(DomainEvent::RelationAdded {
                    owner_id: 1,
                    target_id: 2,
                })
                .await;
            assert_eq!(outcome, EventOutcome::DeadLettered);
        }
        assert_eq!(dlq.count().unwrap(), 1);
        assert!(dlq.get_by_event_id("RELATION_ADD:1:2").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dead_letter_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(InMemoryRemoteStore::new());
        // Schema never created, so every insert fails.
        let dlq = Arc::new(SqliteDeadLetterStore::new(dir.path().join("dlq.sqlite")).unwrap());
        let processor = IncrementalEventProcessor::new(remote.clone(), dlq, RetryPolicy::default());
        remote.set_available(false);

        let outcome = processor
            .handle(DomainEvent::RelationAdded {
                owner_id: 1,
                target_id: 2,
            })
            .await;
        assert_eq!(outcome, EventOutcome::DeadLetterFailed);
    }

    #[tokio::test]
    async fn test_content_activity_is_best_effort() {
        let (processor, remote, dlq, _dir) = setup();
        let like = DomainEvent::ContentActivity {
            domain: RankingDomain::PaperRealtime,
            entity_id: 9,
            activity: ActivityKind::Like,
        };
        assert_eq!(processor.handle(like.clone()).await, EventOutcome::BestEffort);
        let ranking = processor.ranking(RankingDomain::PaperRealtime).unwrap();
        assert_eq!(ranking.score(9).await.unwrap(), Some(3.0));

        remote.set_available(false);
        assert_eq!(processor.handle(like).await, EventOutcome::BestEffort);
        assert_eq!(dlq.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_drains_on_shutdown() {
        let (processor, remote, _dlq, _dir) = setup();
        let pool = WorkerPool::new("events-test", 2).unwrap();
        let dispatcher = EventDispatcher::start(Arc::new(processor), &pool, 16, 4);

        for target_id in 1..=10 {
            dispatcher
                .publish(DomainEvent::RelationAdded {
                    owner_id: 7,
                    target_id,
                })
                .await
                .unwrap();
        }
        let stats = dispatcher.shutdown().await.unwrap();
        assert_eq!(stats.received, 10);
        assert_eq!(stats.applied, 10);
        assert_eq!(remote.friends_of(7).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_publish_waits_while_handlers_are_saturated() {
        let (processor, remote, _dlq, _dir) = setup();
        remote.set_latency(Duration::from_millis(1_000));
        let pool = WorkerPool::new("events-busy", 2).unwrap();
        let dispatcher = EventDispatcher::start(Arc::new(processor), &pool, 1, 1);
        let add = |target_id| DomainEvent::RelationAdded {
            owner_id: 3,
            target_id,
        };

        // One event in the handler, one in the queue, the rest turned away.
        let mut accepted = 0;
        for target_id in 1..=8 {
            if dispatcher.try_publish(add(target_id)) {
                accepted += 1;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(accepted, 2);
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), dispatcher.publish(add(99))).await;
        assert!(blocked.is_err());

        let stats = dispatcher.shutdown().await.unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.applied, 2);
        assert_eq!(remote.friends_of(3).await.unwrap(), BTreeSet::from([1, 2]));
    }
}
