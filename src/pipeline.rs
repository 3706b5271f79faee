//! Bounded sample delivery from many producers to the metrics engine.
//!
//! Producers never drop samples: when the channel is full, [`SampleSender::send`]
//! records a back-pressure event and waits for capacity. Ordering is preserved
//! per sender (a VU awaits each send before producing the next batch); there is
//! no ordering across senders.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::metric::Sample;

/// Default channel capacity, in batches.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct PipelineStats {
    sent: AtomicU64,
    backpressure_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub capacity: usize,
    pub queued: usize,
    pub sent_batches: u64,
    pub backpressure_events: u64,
}

impl PipelineStatus {
    pub fn is_saturated(&self) -> bool {
        self.queued >= self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<Vec<Sample>>,
    stats: Arc<PipelineStats>,
    capacity: usize,
}

/// Returned when the consuming side has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sample pipeline closed")]
pub struct PipelineClosed;

impl SampleSender {
    pub async fn send(&self, samples: Vec<Sample>) -> Result<(), PipelineClosed> {
        if samples.is_empty() {
            return Ok(());
        }
        let samples = match self.tx.try_send(samples) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => return Err(PipelineClosed),
            Err(TrySendError::Full(samples)) => samples,
        };

        self.stats
            .backpressure_events
            .fetch_add(1, Ordering::Relaxed);
        tracing::trace!("sample pipeline full, waiting for capacity");
        self.tx.send(samples).await.map_err(|_| PipelineClosed)?;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn send_one(&self, sample: Sample) -> Result<(), PipelineClosed> {
        self.send(vec![sample]).await
    }

    pub fn status(&self) -> PipelineStatus {
        self.stats.status(self.capacity, self.tx.capacity())
    }

    /// A status handle that does not keep the pipeline open.
    pub fn monitor(&self) -> PipelineMonitor {
        PipelineMonitor {
            tx: self.tx.downgrade(),
            stats: Arc::clone(&self.stats),
            capacity: self.capacity,
        }
    }
}

impl PipelineStats {
    fn status(&self, capacity: usize, free: usize) -> PipelineStatus {
        PipelineStatus {
            capacity,
            queued: capacity.saturating_sub(free),
            sent_batches: self.sent.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineMonitor {
    tx: mpsc::WeakSender<Vec<Sample>>,
    stats: Arc<PipelineStats>,
    capacity: usize,
}

impl PipelineMonitor {
    /// Once every sender is gone the queue is reported as drained.
    pub fn status(&self) -> PipelineStatus {
        let free = self
            .tx
            .upgrade()
            .map_or(self.capacity, |tx| tx.capacity());
        self.stats.status(self.capacity, free)
    }
}

#[derive(Debug)]
pub struct SampleReceiver {
    rx: mpsc::Receiver<Vec<Sample>>,
}

impl SampleReceiver {
    /// Waits for at least one batch, then drains whatever else is immediately
    /// available until `max_batches` have been collected.
    ///
    /// Returns `false` once every sender is dropped and the channel is empty.
    pub async fn recv_many(&mut self, max_batches: usize, buf: &mut Vec<Sample>) -> bool {
        match self.rx.recv().await {
            Some(batch) => buf.extend(batch),
            None => return false,
        }

        let mut received = 1;
        while received < max_batches {
            match self.rx.try_recv() {
                Ok(batch) => {
                    buf.extend(batch);
                    received += 1;
                }
                Err(_) => break,
            }
        }
        true
    }
}

pub fn channel(capacity: usize) -> (SampleSender, SampleReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        SampleSender {
            tx,
            stats: Arc::new(PipelineStats::default()),
            capacity,
        },
        SampleReceiver { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metric::{MetricKind, Registry, ValueType},
        tags::TagSet,
    };
    use std::time::Duration;

    fn sample(value: f64) -> Sample {
        let registry = Registry::new();
        let metric = registry
            .new_metric("test", MetricKind::Counter, ValueType::Default)
            .unwrap();
        Sample::new(&metric, value, TagSet::new())
    }

    #[tokio::test]
    async fn empty_batches_are_not_sent() {
        let (tx, _rx) = channel(1);
        tx.send(vec![]).await.unwrap();
        assert_eq!(tx.status().sent_batches, 0);
        assert_eq!(tx.status().queued, 0);
    }

    #[tokio::test]
    async fn full_pipeline_blocks_instead_of_dropping() {
        let (tx, mut rx) = channel(1);
        tx.send_one(sample(1.0)).await.unwrap();
        assert!(tx.status().is_saturated());

        let blocked = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send_one(sample(2.0)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let mut buf = Vec::new();
        assert!(rx.recv_many(10, &mut buf).await);
        blocked.await.unwrap().unwrap();
        while buf.len() < 2 {
            assert!(rx.recv_many(10, &mut buf).await);
        }

        let values: Vec<f64> = buf.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
        assert_eq!(tx.status().backpressure_events, 1);
    }

    #[tokio::test]
    async fn receiver_drains_in_batches_and_detects_close() {
        let (tx, mut rx) = channel(16);
        for i in 0..5 {
            tx.send_one(sample(i as f64)).await.unwrap();
        }
        drop(tx);

        let mut buf = Vec::new();
        assert!(rx.recv_many(3, &mut buf).await);
        assert_eq!(buf.len(), 3);
        assert!(rx.recv_many(3, &mut buf).await);
        assert_eq!(buf.len(), 5);
        assert!(!rx.recv_many(3, &mut buf).await);
    }

    #[tokio::test]
    async fn monitor_does_not_keep_the_pipeline_open() {
        let (tx, mut rx) = channel(4);
        let monitor = tx.monitor();
        tx.send_one(sample(1.0)).await.unwrap();
        assert_eq!(monitor.status().queued, 1);
        drop(tx);

        let mut buf = Vec::new();
        assert!(rx.recv_many(4, &mut buf).await);
        assert!(!rx.recv_many(4, &mut buf).await);
        assert_eq!(monitor.status().sent_batches, 1);
        assert_eq!(monitor.status().queued, 0);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (tx, rx) = channel(4);
        drop(rx);
        assert_eq!(tx.send_one(sample(1.0)).await, Err(PipelineClosed));
    }
}
