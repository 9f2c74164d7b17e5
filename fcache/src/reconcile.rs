use crate::config::DeadLetterConfig;
use crate::dlq::DeadLetterStore;
use crate::errors::{CacheError, Result};
use crate::events::{IncrementalEventProcessor, Mutation};
use crate::models::ReconcileReport;
use crate::retry::{retry, RetryPolicy};
use std::sync::Arc;

/// Replays dead-lettered mutations against the remote store.
pub struct DeadLetterReconciler {
    store: Arc<dyn DeadLetterStore>,
    processor: Arc<IncrementalEventProcessor>,
    retry: RetryPolicy,
    max_retries: u32,
    scan_limit: usize,
}

impl DeadLetterReconciler {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        processor: Arc<IncrementalEventProcessor>,
        retry: RetryPolicy,
        config: &DeadLetterConfig,
    ) -> Self {
        Self {
            store,
            processor,
            retry,
            max_retries: config.max_retries,
            scan_limit: config.scan_limit,
        }
    }

    /// One pass over the oldest retryable rows.
    ///
    /// Only dead-letter store failures abort the pass; remote failures are
    /// recorded on the row and the pass moves on.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let entries = self.store.find_pending(self.scan_limit, self.max_retries)?;
        let mut report = ReconcileReport::default();
        if entries.is_empty() {
            log::debug!("No dead-letter entries to reconcile");
            return Ok(report);
        }

        for entry in &entries {
            report.scanned += 1;
            let mutation = Mutation::from(entry);
            let processor = &self.processor;
            let replay = &mutation;
            let applied = retry(
                &self.retry,
                &format!("replay of {}", entry.event_id),
                CacheError::is_transient,
                || processor.apply(replay),
            )
            .await;

            match applied {
                Ok(()) => {
                    self.store.mark_processed(entry.id)?;
                    report.processed += 1;
                    log::info!(
                        "Reconciled {} after {} failed attempts",
                        entry.event_id,
                        entry.retry_count
                    );
                }
                Err(err) => {
                    let retries = self.store.increment_retry(entry.id, &err.to_string())?;
                    report.failed += 1;
                    if retries >= self.max_retries {
                        report.exhausted += 1;
                        log::error!(
                            "Giving up on {} after {} retries; left FAILED for inspection: {}",
                            entry.event_id,
                            retries,
                            err
                        );
                    } else {
                        log::warn!(
                            "Replay of {} failed (retry {}/{}): {}",
                            entry.event_id,
                            retries,
                            self.max_retries,
                            err
                        );
                    }
                }
            }
        }

        log::info!(
            "Dead-letter reconciliation: {} scanned, {} processed, {} failed, {} exhausted",
            report.scanned,
            report.processed,
            report.failed,
            report.exhausted
        );
        Ok(report)
    }
}
