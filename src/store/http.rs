//! HTTP client for the control plane's `/kv` routes
//!
//! Lets processes outside the control plane list and write cluster state.
//! Watches are not served here: remote consumers watch through the relay
//! (watch registration + bus), so [`HttpStore::watch`] reports
//! [`StoreError::Unsupported`].

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::watch::WatchStream;
use super::{KeyValue, ListResult, StateStore, StoreError};

/// Body returned by `PUT /kv/<key>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub revision: i64,
}

/// Body returned by `DELETE /kv/<key>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// [`StateStore`] backed by a remote control plane
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, key.trim_start_matches('/'))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Unavailable(format!("HTTP {}: {}", status, body)))
    }
}

fn unavailable(e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl StateStore for HttpStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let response = self
            .client
            .get(self.url(key))
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        response.json().await.map(Some).map_err(unavailable)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError> {
        let response = self
            .client
            .put(self.url(key))
            .body(value)
            .send()
            .await
            .map_err(unavailable)?;

        let body: PutResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(body.revision)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let response = self
            .client
            .delete(self.url(key))
            .send()
            .await
            .map_err(unavailable)?;

        let body: DeleteResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(unavailable)?;
        Ok(body.deleted)
    }

    async fn list(&self, prefix: &str) -> Result<ListResult, StoreError> {
        let response = self
            .client
            .get(self.url(prefix))
            .query(&[("prefix", "true")])
            .send()
            .await
            .map_err(unavailable)?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(unavailable)
    }

    async fn watch(&self, key: &str, _with_prefix: bool) -> Result<WatchStream, StoreError> {
        Err(StoreError::Unsupported(format!(
            "watch {} through the relay instead",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let store = HttpStore::new("http://localhost:8282/");
        assert_eq!(store.base_url(), "http://localhost:8282");
        assert_eq!(
            store.url("/registry/pod/default/web"),
            "http://localhost:8282/kv/registry/pod/default/web"
        );
    }

    #[tokio::test]
    async fn test_watch_is_unsupported() {
        let store = HttpStore::new("http://localhost:8282");
        let result = store.watch("/registry/pod/default", true).await;
        assert!(matches!(result, Err(StoreError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let store = HttpStore::new("http://127.0.0.1:1");
        let result = store.get("/registry/pod/default/web").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
