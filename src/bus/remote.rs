//! Client for the control plane's bus bridge
//!
//! Publishes with a plain HTTP POST and subscribes over a WebSocket that
//! streams one JSON [`BusFrame`] per message.

use async_trait::async_trait;
use futures::future::ready;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{Bus, BusError, BusFrame, Subscription};

/// [`Bus`] reached through a control plane's `/bus` routes
#[derive(Clone)]
pub struct RemoteBus {
    client: Client,
    base_url: String,
}

impl RemoteBus {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn publish_url(&self, topic: &str) -> String {
        format!(
            "{}/bus/publish/{}",
            self.base_url,
            topic.trim_start_matches('/')
        )
    }

    fn subscribe_url(&self, topic: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/bus/subscribe/{}", ws_base, topic.trim_start_matches('/'))
    }
}

#[async_trait]
impl Bus for RemoteBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BusError> {
        let response = self
            .client
            .post(self.publish_url(topic))
            .header(CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BusError::Unavailable(format!("HTTP {}: {}", status, body)));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let url = self.subscribe_url(topic);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        debug!("Subscribed to {} via {}", topic, url);

        let name = topic.to_string();
        let messages = ws_stream
            .take_while(|frame| ready(matches!(frame, Ok(msg) if !msg.is_close())))
            .filter_map(move |frame| {
                let name = name.clone();
                ready(match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<BusFrame>(text.as_str()) {
                        Ok(frame) => Some(frame.into_message(name)),
                        Err(e) => {
                            warn!("Dropping malformed bus frame on {}: {}", name, e);
                            None
                        }
                    },
                    _ => None,
                })
            });

        Ok(Subscription::new(topic, messages.boxed()))
    }
}
