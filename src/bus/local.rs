//! In-process bus built on tokio broadcast channels
//!
//! One broadcast channel per topic, created on first subscribe and pruned
//! once its last subscriber is gone. Lock-free from the caller's point of
//! view: topic lookup goes through a `DashMap`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{Bus, BusError, BusMessage, Subscription, BUS_QUEUE_CAPACITY};

/// In-process [`Bus`]
pub struct LocalBus {
    topics: DashMap<String, broadcast::Sender<BusMessage>>,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver a message, returning how many subscribers received it
    pub fn deliver(&self, msg: BusMessage) -> Result<usize, BusError> {
        if self.is_closed() {
            return Err(BusError::Unavailable("bus is closed".to_string()));
        }

        let topic = msg.topic.clone();
        let delivered = match self.topics.get(&topic) {
            Some(tx) => tx.send(msg).unwrap_or(0),
            None => 0,
        };

        if delivered == 0 {
            self.topics
                .remove_if(&topic, |_, tx| tx.receiver_count() == 0);
        }

        Ok(delivered)
    }

    /// Shut the bus down: later publishes fail and open subscriptions end
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribers currently attached to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Topics with at least one channel allocated
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BusError> {
        let delivered = self.deliver(BusMessage {
            topic: topic.to_string(),
            payload,
            content_type: content_type.to_string(),
        })?;
        debug!("Published to {} ({} subscriber(s))", topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Unavailable("bus is closed".to_string()));
        }

        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(BUS_QUEUE_CAPACITY).0)
            .subscribe();

        let name = topic.to_string();
        let messages = futures::stream::unfold(rx, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) => return Some((msg, rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {} lagged, {} message(s) lost", name, skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Subscription::new(topic, messages.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("/t").await.unwrap();
        let mut b = bus.subscribe("/t").await.unwrap();

        bus.publish("/t", b"1".to_vec(), "text/plain").await.unwrap();
        bus.publish("/t", b"2".to_vec(), "text/plain").await.unwrap();

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.next().await.unwrap().payload, b"1");
            assert_eq!(sub.next().await.unwrap().payload, b"2");
        }
    }

    #[tokio::test]
    async fn test_no_delivery_before_subscribe() {
        let bus = LocalBus::new();
        bus.publish("/t", b"early".to_vec(), "text/plain").await.unwrap();

        let mut sub = bus.subscribe("/t").await.unwrap();
        bus.publish("/t", b"late".to_vec(), "text/plain").await.unwrap();

        assert_eq!(sub.next().await.unwrap().payload, b"late");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = LocalBus::new();
        let mut pods = bus.subscribe("/registry/pod/default").await.unwrap();

        bus.publish("/registry/svc/default", b"svc".to_vec(), "text/plain")
            .await
            .unwrap();
        bus.publish("/registry/pod/default", b"pod".to_vec(), "text/plain")
            .await
            .unwrap();

        let msg = pods.next().await.unwrap();
        assert_eq!(msg.payload, b"pod");
        assert_eq!(msg.topic, "/registry/pod/default");
    }

    #[tokio::test]
    async fn test_empty_topic_is_pruned() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("/t").await.unwrap();
        assert_eq!(bus.subscriber_count("/t"), 1);

        drop(sub);
        assert_eq!(bus.deliver(BusMessage {
            topic: "/t".to_string(),
            payload: vec![],
            content_type: "text/plain".to_string(),
        }), Ok(0));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("/t").await.unwrap();

        for i in 0..=255u8 {
            bus.publish("/t", vec![i], "text/plain").await.unwrap();
        }

        // The oldest messages were overwritten; delivery resumes in order
        let first = sub.next().await.unwrap().payload[0];
        let second = sub.next().await.unwrap().payload[0];
        assert!(first > 0);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_and_ends_subscriptions() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("/t").await.unwrap();

        bus.close();

        assert!(sub.next().await.is_none());
        assert!(matches!(
            bus.publish("/t", vec![], "text/plain").await,
            Err(BusError::Unavailable(_))
        ));
        assert!(matches!(bus.subscribe("/t").await, Err(BusError::Unavailable(_))));
    }
}
