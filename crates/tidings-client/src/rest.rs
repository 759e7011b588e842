//! REST collaborator: conversation list, history pages, read marks and the
//! unread snapshot.
//!
//! The engine only depends on the [`RestApi`] trait. [`HttpRestApi`] is the
//! production implementation over `reqwest`.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use tidings_shared::protocol::{ConversationSummary, MessagePage, UnreadEntry};
use tidings_shared::types::ConversationId;

use crate::error::{ClientError, Result};

pub trait RestApi: Send + Sync + 'static {
    fn list_conversations(&self) -> impl Future<Output = Result<Vec<ConversationSummary>>> + Send;

    /// Page `page` (1-based, newest first) of a conversation's history.
    fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        size: u32,
    ) -> impl Future<Output = Result<MessagePage>> + Send;

    fn mark_read(&self, conversation_id: ConversationId) -> impl Future<Output = Result<()>> + Send;

    fn unread_snapshot(&self) -> impl Future<Output = Result<Vec<UnreadEntry>>> + Send;

    /// Replace the bearer token used by every later call.
    fn set_token(&self, token: &str);
}

/// HTTP implementation with bearer authentication. Clones share the token.
#[derive(Clone)]
pub struct HttpRestApi {
    client: Client,
    base_url: String,
    token: Arc<RwLock<String>>,
}

impl HttpRestApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(token.into())),
        }
    }

    fn token(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.token())
            .query(query)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClientError::Rest(format!("{url} answered {}", resp.status())));
        }
        Ok(resp.json().await?)
    }
}

impl RestApi for HttpRestApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.get_json("/conversations", &[]).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        size: u32,
    ) -> Result<MessagePage> {
        let path = format!("/conversations/{conversation_id}/messages");
        self.get_json(&path, &[("page", page.to_string()), ("size", size.to_string())])
            .await
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<()> {
        let url = self.url(&format!("/conversations/{conversation_id}/read"));
        debug!(url = %url, "POST");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.token())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClientError::Rest(format!("{url} answered {}", resp.status())));
        }
        Ok(())
    }

    async fn unread_snapshot(&self) -> Result<Vec<UnreadEntry>> {
        self.get_json("/unread", &[]).await
    }

    fn set_token(&self, token: &str) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token.to_string();
        debug!("REST token replaced");
    }
}
