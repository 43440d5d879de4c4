//! In-process topic-keyed event fan-out.
//!
//! Each topic is backed by a broadcast channel and each subscriber runs in its own task, so a
//! slow subscriber never blocks publication; it lags and the missed publications are logged.
//! Delivery is best-effort and nothing is persisted.

use crate::eth2::types::FinalityCheckpointsData;
use slog::{debug, error, warn, Logger};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::sync::watch;

pub const TOPIC_FINALITY_HEAD_UPDATED: &str = "finality_head_updated";

const EVENT_CHANNEL_CAPACITY: usize = 16;

pub struct EventBroker {
    finality_head_updated: broadcast::Sender<FinalityCheckpointsData>,
    log: Logger,
}

impl EventBroker {
    pub fn new(log: Logger) -> Self {
        let (finality_head_updated, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            finality_head_updated,
            log,
        }
    }

    pub fn subscribe_finality_head_updated(&self) -> broadcast::Receiver<FinalityCheckpointsData> {
        self.finality_head_updated.subscribe()
    }

    pub fn publish_finality_head_updated(&self, checkpoint: FinalityCheckpointsData) {
        if self.finality_head_updated.send(checkpoint).is_err() {
            debug!(
                self.log,
                "Published event without subscribers";
                "topic" => TOPIC_FINALITY_HEAD_UPDATED,
            );
        }
    }

    /// Register a subscriber for the `finality_head_updated` topic.
    ///
    /// The callback runs inside a dedicated task and receives every publication made after
    /// registration. Callback errors are logged and do not stop the subscription.
    pub fn on_finality_head_updated<F, Fut>(
        &self,
        subscriber: &'static str,
        mut shutdown: watch::Receiver<()>,
        callback: F,
    ) where
        F: Fn(FinalityCheckpointsData) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), crate::provider::Error>> + Send + 'static,
    {
        let mut receiver = self.finality_head_updated.subscribe();
        let log = self.log.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = receiver.recv() => match event {
                        Ok(checkpoint) => {
                            if let Err(e) = callback(checkpoint).await {
                                error!(
                                    log,
                                    "Failed to handle finality head update";
                                    "topic" => TOPIC_FINALITY_HEAD_UPDATED,
                                    "subscriber" => subscriber,
                                    "error" => %e,
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                log,
                                "Subscriber lagged behind publications";
                                "topic" => TOPIC_FINALITY_HEAD_UPDATED,
                                "subscriber" => subscriber,
                                "skipped" => skipped,
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Checkpoint, Epoch, Hash256};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn checkpoint(epoch: u64) -> FinalityCheckpointsData {
        FinalityCheckpointsData {
            previous_justified: Checkpoint::default(),
            current_justified: Checkpoint::default(),
            finalized: Checkpoint {
                epoch: Epoch::new(epoch),
                root: Hash256::from_low_u64_be(epoch),
            },
        }
    }

    fn broker() -> EventBroker {
        EventBroker::new(slog::Logger::root(slog::Discard, slog::o!()))
    }

    #[tokio::test]
    async fn subscribers_see_every_publication() {
        let broker = broker();
        let (_shutdown_tx, shutdown_rx) = watch::channel(());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        broker.on_finality_head_updated("test", shutdown_rx, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for epoch in 0..3 {
            broker.publish_finality_head_updated(checkpoint(epoch));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_event() {
        let broker = broker();
        let mut first = broker.subscribe_finality_head_updated();
        let mut second = broker.subscribe_finality_head_updated();

        broker.publish_finality_head_updated(checkpoint(100));

        assert_eq!(first.recv().await.unwrap(), checkpoint(100));
        assert_eq!(second.recv().await.unwrap(), checkpoint(100));
    }

    #[tokio::test]
    async fn publication_without_subscribers_is_harmless() {
        broker().publish_finality_head_updated(checkpoint(1));
    }

    #[tokio::test]
    async fn subscriber_errors_do_not_stop_the_subscription() {
        let broker = broker();
        let (_shutdown_tx, shutdown_rx) = watch::channel(());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        broker.on_finality_head_updated("test", shutdown_rx, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(crate::provider::Error::BlockNotFound)
            }
        });

        broker.publish_finality_head_updated(checkpoint(1));
        broker.publish_finality_head_updated(checkpoint(2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
