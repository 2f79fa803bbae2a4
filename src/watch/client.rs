//! Watch registration clients
//!
//! [`WatchRegistrar`] is the seam a [`ListerWatcher`](super::ListerWatcher)
//! takes tickets through: in-process straight against a [`WatchRegistry`], or
//! over HTTP against a control plane with [`HttpRegistrar`].

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;

use super::registry::{RegistryError, WatchRegistry};
use super::{TicketResponse, WatchTicket, WatchedKey};

/// Errors from registering or releasing a watch
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Registration rejected ({status}): {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("Registration transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Key cannot be watched remotely: {0}")]
    InvalidKey(String),
}

/// Takes and returns watch tickets
#[async_trait]
pub trait WatchRegistrar: Send + Sync {
    async fn register(&self, key: &WatchedKey) -> Result<WatchTicket, RegistrationError>;

    async fn release(&self, key: &WatchedKey, ticket: WatchTicket) -> Result<(), RegistrationError>;
}

#[async_trait]
impl WatchRegistrar for WatchRegistry {
    async fn register(&self, key: &WatchedKey) -> Result<WatchTicket, RegistrationError> {
        Ok(WatchRegistry::register(self, key).await?)
    }

    async fn release(&self, key: &WatchedKey, ticket: WatchTicket) -> Result<(), RegistrationError> {
        WatchRegistry::release(self, key, ticket).await;
        Ok(())
    }
}

/// [`WatchRegistrar`] speaking to a control plane's `/watch` routes
#[derive(Clone)]
pub struct HttpRegistrar {
    client: Client,
    base_url: String,
}

impl HttpRegistrar {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, key: &WatchedKey) -> Result<String, RegistrationError> {
        let path = key
            .watch_path()
            .ok_or_else(|| RegistrationError::InvalidKey(key.to_string()))?;
        Ok(format!("{}{}", self.base_url, path))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RegistrationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RegistrationError::Rejected { status, message })
    }
}

fn transport(e: reqwest::Error) -> RegistrationError {
    RegistrationError::Transport(e.to_string())
}

#[async_trait]
impl WatchRegistrar for HttpRegistrar {
    async fn register(&self, key: &WatchedKey) -> Result<WatchTicket, RegistrationError> {
        let response = self
            .client
            .post(self.url(key)?)
            .send()
            .await
            .map_err(transport)?;

        let body: TicketResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(body.ticket)
    }

    async fn release(&self, key: &WatchedKey, ticket: WatchTicket) -> Result<(), RegistrationError> {
        let response = self
            .client
            .post(self.url(key)?)
            .form(&[("ticket", ticket.0.to_string())])
            .send()
            .await
            .map_err(transport)?;

        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bus::LocalBus;
    use crate::store::MemoryStore;

    #[test]
    fn test_registration_urls() {
        let registrar = HttpRegistrar::new("http://localhost:8282/");

        assert_eq!(
            registrar.url(&WatchedKey::collection("pod", "default")).unwrap(),
            "http://localhost:8282/watch/pod/default"
        );
        assert_eq!(
            registrar
                .url(&WatchedKey::object("pod", "default", "web"))
                .unwrap(),
            "http://localhost:8282/watch/pod/default/web"
        );
    }

    #[tokio::test]
    async fn test_unroutable_key_rejected_before_sending() {
        let registrar = HttpRegistrar::new("http://127.0.0.1:1");

        let result = registrar.register(&WatchedKey::point("/elsewhere/x")).await;

        assert!(matches!(result, Err(RegistrationError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_unreachable_control_plane() {
        let registrar = HttpRegistrar::new("http://127.0.0.1:1");

        let result = registrar
            .register(&WatchedKey::collection("pod", "default"))
            .await;

        assert!(matches!(result, Err(RegistrationError::Transport(_))));
    }

    #[tokio::test]
    async fn test_in_process_registrar() {
        let store = MemoryStore::new();
        let registry = WatchRegistry::new(Arc::new(store.clone()), Arc::new(LocalBus::new()));
        let registrar: &dyn WatchRegistrar = &registry;
        let key = WatchedKey::collection("pod", "default");

        let ticket = registrar.register(&key).await.unwrap();
        assert_eq!(store.active_watches().await, 1);

        registrar.release(&key, ticket).await.unwrap();
        assert_eq!(store.active_watches().await, 0);
    }
}
