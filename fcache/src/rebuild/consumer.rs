use super::relay::{RelayMessage, RelayPoll, RelayReceiver};
use super::RebuildProgress;
use crate::errors::CacheError;
use crate::models::{ConsumerReport, ConsumerState, ResyncRecord};
use crate::remote::RemoteStore;
use crate::retry::{retry, RetryPolicy};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Drains the relay in batches and writes each batch to the remote store as
/// one pipelined round trip.
///
/// ```text
/// Waiting --message--> Batching --batch full or relay empty--> Flushing
/// Flushing --no marker--> Waiting
/// Flushing --marker seen--> Done
/// Waiting --cancelled--> Interrupted
/// Waiting --relay closed--> Closed
/// ```
pub struct BatchPipelineWriter {
    remote: Arc<dyn RemoteStore>,
    batch_size: usize,
    poll_timeout: Duration,
    retry: RetryPolicy,
    progress: Arc<RebuildProgress>,
    state: ConsumerState,
}

impl BatchPipelineWriter {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        batch_size: usize,
        poll_timeout: Duration,
        retry: RetryPolicy,
        progress: Arc<RebuildProgress>,
    ) -> Self {
        Self {
            remote,
            batch_size: batch_size.max(1),
            poll_timeout,
            retry,
            progress,
            state: ConsumerState::Waiting,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub async fn consume(
        mut self,
        mut relay: RelayReceiver,
        cancel: CancellationToken,
    ) -> ConsumerReport {
        let mut report = ConsumerReport {
            batches: 0,
            flushed_records: 0,
            failed_records: 0,
            final_state: ConsumerState::Waiting,
        };
        let mut batch: Vec<ResyncRecord> = Vec::with_capacity(self.batch_size);

        loop {
            self.transition(ConsumerState::Waiting);
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.transition(ConsumerState::Interrupted);
                    break;
                }
                polled = relay.poll(self.poll_timeout) => polled,
            };
            let first = match polled {
                RelayPoll::Message(message) => message,
                RelayPoll::TimedOut => continue,
                RelayPoll::Closed => {
                    log::warn!("Relay closed without a termination marker");
                    self.transition(ConsumerState::Closed);
                    break;
                }
            };

            self.transition(ConsumerState::Batching);
            let mut terminated = false;
            let mut next = Some(first);
            while let Some(message) = next.take() {
                match message {
                    RelayMessage::Record(record) => batch.push(record),
                    RelayMessage::Terminate => {
                        terminated = true;
                        break;
                    }
                }
                if batch.len() >= self.batch_size {
                    break;
                }
                next = relay.try_next();
            }

            self.transition(ConsumerState::Flushing);
            if !batch.is_empty() {
                self.flush(&batch, &mut report).await;
                batch.clear();
            }

            if terminated {
                self.transition(ConsumerState::Done);
                break;
            }
        }

        report.final_state = self.state;
        match report.final_state {
            ConsumerState::Done => log::info!(
                "Rebuild consumer done: {} batches, {} records written, {} failed",
                report.batches,
                report.flushed_records,
                report.failed_records
            ),
            state => log::warn!(
                "Rebuild consumer stopped in state {:?} after {} records written",
                state,
                report.flushed_records
            ),
        }
        report
    }

    async fn flush(&self, batch: &[ResyncRecord], report: &mut ConsumerReport) {
        let remote = &self.remote;
        let label = format!("friend-set flush of {} records", batch.len());
        let written = retry(&self.retry, &label, CacheError::is_transient, || {
            remote.write_friend_sets(batch)
        })
        .await;

        report.batches += 1;
        self.progress.batches.fetch_add(1, Ordering::Relaxed);
        match written {
            Ok(()) => {
                report.flushed_records += batch.len() as u64;
                let total = self
                    .progress
                    .flushed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed)
                    + batch.len() as u64;
                log::debug!("Flushed {} records ({} so far)", batch.len(), total);
            }
            Err(err) => {
                report.failed_records += batch.len() as u64;
                self.progress
                    .failed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                log::error!(
                    "Dropping batch of {} friend sets (owners {:?}..{:?}): {}",
                    batch.len(),
                    batch.first().map(|r| r.owner_id),
                    batch.last().map(|r| r.owner_id),
                    err
                );
            }
        }
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            log::trace!("Rebuild consumer {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
