//! Full rebuild of the friend-set cache from the source of truth.
//!
//! A producer on the `rebuild-producer` pool pages through owners and pushes
//! resync records into a bounded relay; a consumer on the `rebuild-consumer`
//! pool drains it and pipelines batches into the remote store.

pub mod consumer;
pub mod paginator;
pub mod producer;
pub mod relay;

use self::consumer::BatchPipelineWriter;
use self::paginator::{ChunkPaginator, RelationshipResolver};
use self::producer::RebuildProducer;
use crate::config::RebuildConfig;
use crate::errors::Result;
use crate::models::{ConsumerReport, ProducerReport, RebuildReport};
use crate::pool::{TaskHandle, WorkerPool};
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::source::{OwnerSource, RelationSource};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Live counters shared by both halves of a running rebuild.
#[derive(Debug, Default)]
pub struct RebuildProgress {
    pub produced: AtomicU64,
    pub batches: AtomicU64,
    pub flushed: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub produced: u64,
    pub batches: u64,
    pub flushed: u64,
    pub failed: u64,
}

impl RebuildProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct FriendCacheRebuilder {
    owners: Arc<dyn OwnerSource>,
    relations: Arc<dyn RelationSource>,
    remote: Arc<dyn RemoteStore>,
    config: RebuildConfig,
    retry: RetryPolicy,
}

impl FriendCacheRebuilder {
    pub fn new(
        owners: Arc<dyn OwnerSource>,
        relations: Arc<dyn RelationSource>,
        remote: Arc<dyn RemoteStore>,
        config: RebuildConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            owners,
            relations,
            remote,
            config,
            retry,
        }
    }

    /// Submits the producer and the consumer to their pools and returns immediately.
    pub fn start(&self, producer_pool: &WorkerPool, consumer_pool: &WorkerPool) -> RebuildHandle {
        let started_at = Utc::now().timestamp();
        let progress = Arc::new(RebuildProgress::default());
        let (tx, rx) = relay::bounded(self.config.relay_capacity);

        let producer = RebuildProducer::new(
            ChunkPaginator::new(self.owners.clone(), self.config.page_size),
            RelationshipResolver::new(self.relations.clone()),
            self.config.sentinel_timeout(),
            progress.clone(),
        );
        let consumer = BatchPipelineWriter::new(
            self.remote.clone(),
            self.config.batch_size,
            self.config.poll_timeout(),
            self.retry,
            progress.clone(),
        );

        log::info!(
            "Starting friend cache rebuild (page {}, batch {}, relay {}) against {}",
            self.config.page_size,
            self.config.batch_size,
            self.config.relay_capacity,
            self.remote.name()
        );
        let consumer = consumer_pool.submit("friend-set-writer", move |cancel| {
            consumer.consume(rx, cancel)
        });
        let producer = producer_pool.submit("friend-set-reader", move |cancel| {
            producer.produce(tx, cancel)
        });

        RebuildHandle {
            producer,
            consumer,
            progress,
            started_at,
        }
    }

    /// Runs one full rebuild to completion.
    pub async fn run(
        &self,
        producer_pool: &WorkerPool,
        consumer_pool: &WorkerPool,
    ) -> Result<RebuildReport> {
        self.start(producer_pool, consumer_pool).wait().await
    }
}

pub struct RebuildHandle {
    producer: TaskHandle<Result<ProducerReport>>,
    consumer: TaskHandle<ConsumerReport>,
    progress: Arc<RebuildProgress>,
    started_at: i64,
}

impl RebuildHandle {
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Stops reading the source. Records already relayed are still written and
    /// the consumer finishes on the termination marker.
    pub fn stop(&self) {
        self.producer.cancel();
    }

    /// Token behind [`stop`](Self::stop), for callers that race `wait` against
    /// their own shutdown.
    pub fn stop_token(&self) -> CancellationToken {
        self.producer.cancellation_token()
    }

    /// Stops both halves without draining the relay.
    pub fn abort(&self) {
        self.producer.cancel();
        self.consumer.cancel();
    }

    pub async fn wait(self) -> Result<RebuildReport> {
        let (producer, consumer) = tokio::join!(self.producer.join(), self.consumer.join());
        let consumer = consumer?;
        let producer = producer??;
        let report = RebuildReport {
            producer,
            consumer,
            started_at: self.started_at,
            finished_at: Utc::now().timestamp(),
        };
        log::info!(
            "Friend cache rebuild finished in {}s: {} records relayed, {} written, {} failed",
            report.finished_at - report.started_at,
            report.producer.records,
            report.consumer.flushed_records,
            report.consumer.failed_records
        );
        Ok(report)
    }
}
