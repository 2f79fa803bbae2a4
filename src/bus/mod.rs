//! # Fan-out publish/subscribe bus
//!
//! A publisher broadcasts a message to a named topic; every subscriber bound
//! to the topic receives its own copy of each message published after it
//! joined. Delivery is best-effort, in order per subscriber, with no ordering
//! across subscribers. Failures surface to the caller; nothing here retries.
//!
//! Topics are key paths (`/registry/pod/default`), which is how the watch
//! relay names them.

pub mod local;
pub mod remote;

pub use local::LocalBus;
pub use remote::RemoteBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Messages buffered per subscriber before a slow consumer starts losing them
pub const BUS_QUEUE_CAPACITY: usize = 100;

/// Errors surfaced by a bus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Subscription to '{0}' closed")]
    Closed(String),
}

/// One message as delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub content_type: String,
}

/// Wire frame used by the WebSocket bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusFrame {
    #[serde(rename = "contentType")]
    pub content_type: String,

    #[serde(with = "crate::store::event::base64_bytes")]
    pub payload: Vec<u8>,
}

impl BusFrame {
    pub fn into_message(self, topic: impl Into<String>) -> BusMessage {
        BusMessage {
            topic: topic.into(),
            payload: self.payload,
            content_type: self.content_type,
        }
    }
}

impl From<&BusMessage> for BusFrame {
    fn from(msg: &BusMessage) -> Self {
        Self {
            content_type: msg.content_type.clone(),
            payload: msg.payload.clone(),
        }
    }
}

/// How a dispatched subscription finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The stop signal fired
    Stopped,
    /// The bus closed the subscription
    Closed,
}

/// An active subscription to one topic
pub struct Subscription {
    topic: String,
    messages: BoxStream<'static, BusMessage>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, messages: BoxStream<'static, BusMessage>) -> Self {
        Self {
            topic: topic.into(),
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the bus closed the subscription
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.messages.next().await
    }

    /// Run `handler` for every message on a dedicated dispatch task until
    /// `stop` fires or the bus closes the subscription.
    ///
    /// The subscription is dropped (unsubscribed) when the task exits.
    pub fn dispatch<F>(mut self, mut handler: F, stop: CancellationToken) -> JoinHandle<SubscriptionEnd>
    where
        F: FnMut(BusMessage) + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return SubscriptionEnd::Stopped,
                    msg = self.messages.next() => match msg {
                        Some(msg) => handler(msg),
                        None => return SubscriptionEnd::Closed,
                    },
                }
            }
        })
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait Bus: Send + Sync {
    /// Broadcast `payload` to every current subscriber of `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>, content_type: &str)
        -> Result<(), BusError>;

    /// Start receiving messages published to `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// Subscribe to `topic` and deliver every message to `handler` on an internal
/// dispatch task, blocking the caller until `stop` fires.
///
/// Returns [`BusError::Closed`] if the bus ends the subscription first.
pub async fn subscribe_until<F>(
    bus: &dyn Bus,
    topic: &str,
    handler: F,
    stop: CancellationToken,
) -> Result<(), BusError>
where
    F: FnMut(BusMessage) + Send + 'static,
{
    let subscription = bus.subscribe(topic).await?;
    match subscription.dispatch(handler, stop).await {
        Ok(SubscriptionEnd::Stopped) => Ok(()),
        Ok(SubscriptionEnd::Closed) => Err(BusError::Closed(topic.to_string())),
        Err(e) => Err(BusError::Unavailable(format!("dispatch task failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribe_until_blocks_until_stop() {
        let bus = Arc::new(LocalBus::new());
        let stop = CancellationToken::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let bus = bus.clone();
            let stop = stop.clone();
            let received = received.clone();
            tokio::spawn(async move {
                subscribe_until(
                    bus.as_ref(),
                    "/registry/pod/default",
                    move |msg| received.lock().unwrap().push(msg.payload),
                    stop,
                )
                .await
            })
        };

        // Wait until the subscriber is attached
        while bus.subscriber_count("/registry/pod/default") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bus.publish("/registry/pod/default", b"one".to_vec(), "text/plain")
            .await
            .unwrap();

        while received.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.cancel();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(received.lock().unwrap().clone(), vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn test_subscribe_until_reports_closed_bus() {
        let bus = Arc::new(LocalBus::new());
        let stop = CancellationToken::new();

        let task = {
            let bus = bus.clone();
            tokio::spawn(async move { subscribe_until(bus.as_ref(), "/t", |_| {}, stop).await })
        };
        while bus.subscriber_count("/t") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        bus.close();

        assert_eq!(task.await.unwrap(), Err(BusError::Closed("/t".to_string())));
    }

    #[test]
    fn test_bus_frame_json() {
        let msg = BusMessage {
            topic: "/t".to_string(),
            payload: b"hi".to_vec(),
            content_type: "application/json".to_string(),
        };
        let json = serde_json::to_value(BusFrame::from(&msg)).unwrap();

        assert_eq!(json["contentType"], "application/json");
        assert_eq!(json["payload"], "aGk=");
    }
}
