use super::paginator::{ChunkPaginator, RelationshipResolver};
use super::relay::RelaySender;
use super::RebuildProgress;
use crate::errors::Result;
use crate::models::ProducerReport;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reads the source of truth page by page and feeds resync records into the relay.
pub struct RebuildProducer {
    paginator: ChunkPaginator,
    resolver: RelationshipResolver,
    sentinel_timeout: Duration,
    progress: Arc<RebuildProgress>,
}

impl RebuildProducer {
    pub fn new(
        paginator: ChunkPaginator,
        resolver: RelationshipResolver,
        sentinel_timeout: Duration,
        progress: Arc<RebuildProgress>,
    ) -> Self {
        Self {
            paginator,
            resolver,
            sentinel_timeout,
            progress,
        }
    }

    /// Streams every owner with a non-empty set into `relay`, then the
    /// termination marker.
    ///
    /// The marker is sent on every exit path, including cancellation and source
    /// failures, so the consumer is never left waiting on a stream that has
    /// ended.
    pub async fn produce(
        mut self,
        relay: RelaySender,
        cancel: CancellationToken,
    ) -> Result<ProducerReport> {
        let mut report = ProducerReport::default();
        let pumped = self.pump(&relay, &cancel, &mut report).await;
        if let Err(err) = &pumped {
            log::error!(
                "Rebuild producer stopped after {} records at cursor {:?}: {}",
                report.records,
                self.paginator.cursor(),
                err
            );
        }

        let terminated = relay.terminate(self.sentinel_timeout).await;
        if let Err(err) = &terminated {
            log::error!(
                "Failed to deliver termination marker after {} records: {}",
                report.records,
                err
            );
        }

        pumped?;
        terminated?;
        log::info!(
            "Rebuild producer finished: {} pages, {} records, {} owners without relations{}",
            report.pages,
            report.records,
            report.skipped_empty,
            if report.interrupted { " (interrupted)" } else { "" }
        );
        Ok(report)
    }

    async fn pump(
        &mut self,
        relay: &RelaySender,
        cancel: &CancellationToken,
        report: &mut ProducerReport,
    ) -> Result<()> {
        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.interrupted = true;
                    break;
                }
                page = self.paginator.next_page() => page?,
            };
            let Some(owner_ids) = page else { break };
            report.pages += 1;

            let (records, skipped) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.interrupted = true;
                    break;
                }
                resolved = self.resolver.resolve(&owner_ids) => resolved?,
            };
            report.skipped_empty += skipped;
            log::debug!(
                "Resolved page {} ({} owners, {} records)",
                report.pages,
                owner_ids.len(),
                records.len()
            );

            for record in records {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.interrupted = true;
                        break;
                    }
                    sent = relay.send(record) => sent?,
                }
                report.records += 1;
                self.progress.produced.fetch_add(1, Ordering::Relaxed);
            }
            if report.interrupted {
                break;
            }
        }

        if report.interrupted {
            log::info!(
                "Rebuild producer interrupted at cursor {:?}",
                self.paginator.cursor()
            );
        }
        Ok(())
    }
}
