//! Bounded in-process channel between the rebuild producer and consumer.

use crate::errors::{CacheError, Result};
use crate::models::ResyncRecord;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Record(ResyncRecord),
    /// End of stream. Sent once per producer lifetime.
    Terminate,
}

/// Result of a bounded wait on the relay.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayPoll {
    Message(RelayMessage),
    TimedOut,
    Closed,
}

/// Creates a relay holding at most `capacity` in-flight messages.
pub fn bounded(capacity: usize) -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RelaySender { tx }, RelayReceiver { rx })
}

/// Producer side of the relay. Not `Clone`: one sender, one marker.
///
/// ```compile_fail
/// let (tx, _rx) = fcache::rebuild::relay::bounded(1);
/// let _second = tx.clone();
/// ```
pub struct RelaySender {
    tx: mpsc::Sender<RelayMessage>,
}

impl RelaySender {
    /// Enqueues a record, waiting while the relay is full.
    pub async fn send(&self, record: ResyncRecord) -> Result<()> {
        self.tx
            .send(RelayMessage::Record(record))
            .await
            .map_err(|_| CacheError::RelayClosed("consumer dropped the relay".into()))
    }

    /// Enqueues the termination marker, waiting at most `wait` for room.
    ///
    /// Consumes the sender, so a producer can only terminate its stream once.
    pub async fn terminate(self, wait: Duration) -> Result<()> {
        match tokio::time::timeout(wait, self.tx.send(RelayMessage::Terminate)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CacheError::RelayClosed(
                "consumer dropped the relay before the termination marker".into(),
            )),
            Err(_) => Err(CacheError::Interrupted(format!(
                "termination marker not accepted within {:?}",
                wait
            ))),
        }
    }
}

pub struct RelayReceiver {
    rx: mpsc::Receiver<RelayMessage>,
}

impl RelayReceiver {
    /// Waits up to `timeout` for the next message.
    pub async fn poll(&mut self, timeout: Duration) -> RelayPoll {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => RelayPoll::Message(message),
            Ok(None) => RelayPoll::Closed,
            Err(_) => RelayPoll::TimedOut,
        }
    }

    /// Takes a message only if one is immediately available.
    pub fn try_next(&mut self) -> Option<RelayMessage> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn record(owner_id: i64) -> ResyncRecord {
        ResyncRecord::new(owner_id, BTreeSet::from([owner_id * 10]))
    }

    #[tokio::test]
    async fn test_send_waits_while_full() {
        let (tx, mut rx) = bounded(1);
        tx.send(record(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(30), tx.send(record(2))).await;
        assert!(blocked.is_err(), "second send should wait for room");

        assert_eq!(rx.try_next(), Some(RelayMessage::Record(record(1))));
        tx.send(record(2)).await.unwrap();
        assert_eq!(rx.try_next(), Some(RelayMessage::Record(record(2))));
    }

    #[tokio::test]
    async fn test_poll_times_out_then_sees_terminate() {
        let (tx, mut rx) = bounded(4);
        assert_eq!(rx.poll(Duration::from_millis(10)).await, RelayPoll::TimedOut);

        tx.terminate(Duration::from_millis(10)).await.unwrap();
        assert_eq!(
            rx.poll(Duration::from_millis(10)).await,
            RelayPoll::Message(RelayMessage::Terminate)
        );
        assert_eq!(rx.poll(Duration::from_millis(10)).await, RelayPoll::Closed);
    }

    #[tokio::test]
    async fn test_terminate_reports_dropped_consumer() {
        let (tx, rx) = bounded(4);
        drop(rx);
        assert!(matches!(
            tx.terminate(Duration::from_millis(10)).await,
            Err(CacheError::RelayClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_reports_full_relay() {
        let (tx, _rx) = bounded(1);
        tx.send(record(1)).await.unwrap();
        assert!(matches!(
            tx.terminate(Duration::from_millis(10)).await,
            Err(CacheError::Interrupted(_))
        ));
    }
}
