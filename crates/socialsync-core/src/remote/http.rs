//! HTTP implementation of [`RemoteCache`] over `reqwest`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    ErrorBody, MessagesPull, MessagesPush, PostCreated, PostIndex, PostsPage, PushAck,
    PushOutcome, RemoteCache,
};
use crate::config::DEFAULT_REMOTE_TIMEOUT_MS;
use crate::error::{SyncError, SyncResult};
use crate::types::{Cid, Post};

fn unreachable(e: impl std::fmt::Display) -> SyncError {
    SyncError::RemoteCacheUnreachable(e.to_string())
}

#[derive(Debug, Clone)]
pub struct HttpRemoteCache {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteCache {
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        Self::with_timeout(base_url, Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS))
    }

    /// Client whose requests fail with `RemoteCacheUnreachable` once
    /// `timeout` elapses, so a stalled service never holds a sync pass open.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| SyncError::Config(format!("Invalid remote cache URL {}: {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("socialsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(unreachable)?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> SyncResult<Url> {
        let raw = format!("{}{}", self.base_url, path);
        let url = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params.iter().map(|(k, v)| (*k, v.as_str())))
        };
        url.map_err(|e| SyncError::Config(format!("Invalid URL {}: {}", raw, e)))
    }

    /// Turn a non-2xx response into `RemoteCacheUnreachable`, keeping the
    /// service's `{error}` message when it sent one.
    async fn check(response: Response) -> SyncResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        Err(SyncError::RemoteCacheUnreachable(format!(
            "{}: {}",
            status, message
        )))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> SyncResult<T> {
        let response = Self::check(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Serialization(format!("Bad remote cache response: {}", e)))
    }
}

#[async_trait]
impl RemoteCache for HttpRemoteCache {
    async fn pull_messages(&self, user_address: &str, since: i64) -> SyncResult<MessagesPull> {
        let url = self.url(
            "/messages",
            &[
                ("userAddress", user_address.to_string()),
                ("since", since.to_string()),
            ],
        )?;
        debug!(%url, "Pulling messages");
        let response = self.client.get(url).send().await.map_err(unreachable)?;
        Self::json(response).await
    }

    async fn push_messages(&self, push: &MessagesPush) -> SyncResult<PushAck> {
        let url = self.url("/messages", &[])?;
        let response = self
            .client
            .post(url)
            .json(push)
            .send()
            .await
            .map_err(unreachable)?;
        Self::json(response).await
    }

    async fn pull_posts(&self, since: i64, offset: usize, limit: usize) -> SyncResult<PostsPage> {
        let url = self.url(
            "/posts",
            &[
                ("since", since.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )?;
        debug!(%url, "Pulling posts");
        let response = self.client.get(url).send().await.map_err(unreachable)?;
        Self::json(response).await
    }

    async fn push_post(&self, post: &Post) -> SyncResult<PushOutcome> {
        let url = self.url("/posts", &[])?;
        let response = self
            .client
            .post(url)
            .json(post)
            .send()
            .await
            .map_err(unreachable)?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(PushOutcome::AlreadyExists);
        }
        let _created: PostCreated = Self::json(response).await?;
        Ok(PushOutcome::Created)
    }

    async fn post_index(&self) -> SyncResult<Option<Cid>> {
        let url = self.url("/posts/index", &[])?;
        let response = self.client.get(url).send().await.map_err(unreachable)?;
        let index: PostIndex = Self::json(response).await?;
        Ok(index.cid)
    }

    async fn set_post_index(&self, cid: &Cid) -> SyncResult<()> {
        let url = self.url("/posts/index", &[])?;
        let body = PostIndex {
            cid: Some(cid.clone()),
            updated_at: None,
        };
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(unreachable)?;
        let _ack: PushAck = Self::json(response).await?;
        Ok(())
    }
}
