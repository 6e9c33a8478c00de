//! Social publishing API: media upload slots and scheduled posts.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{info, instrument};

/// Where to send the bytes of one media file, and the id to post it with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadSlot {
    pub media_id: String,
    pub upload_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostRequest<'a> {
    pub account_ids: &'a [i64],
    pub caption: &'a str,
    pub media_ids: &'a [String],
    pub scheduled_at: DateTime<Utc>,
    pub draft: bool,
}

#[async_trait]
pub trait PublishingService: Send + Sync {
    async fn create_upload_slot(&self, filename: &str, mime: &str, size: u64) -> Result<UploadSlot>;

    async fn put_bytes(&self, upload_url: &str, bytes: Vec<u8>, mime: &str) -> Result<()>;

    async fn create_post(&self, post: &PostRequest<'_>) -> Result<Value>;
}

pub fn build_upload_slot_request(filename: &str, mime: &str, size: u64) -> Value {
    json!({
        "name": filename,
        "mime_type": mime,
        "size_bytes": size,
    })
}

pub fn build_post_request(post: &PostRequest<'_>) -> Value {
    json!({
        "social_accounts": post.account_ids,
        "caption": post.caption,
        "media": post.media_ids,
        "is_draft": post.draft,
        "scheduled_at": post.scheduled_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

#[derive(Clone)]
pub struct PostBridgeClient {
    http: Client,
    token: String,
    uploads_url: String,
    posts_url: String,
}

impl fmt::Debug for PostBridgeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostBridgeClient")
            .field("uploads_url", &self.uploads_url)
            .field("posts_url", &self.posts_url)
            .finish_non_exhaustive()
    }
}

impl PostBridgeClient {
    pub fn new(token: String, uploads_url: String, posts_url: String) -> Result<Self> {
        let http = Client::builder().user_agent("autopost/0.1").build()?;
        Ok(Self {
            http,
            token,
            uploads_url,
            posts_url,
        })
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<reqwest::Request> {
        self.http
            .post(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(body)
            .build()
            .with_context(|| format!("failed to build request to {}", url))
    }

    async fn send(&self, request: reqwest::Request, what: &str) -> Result<reqwest::Response> {
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach publisher for {}", what))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("publisher {} error {}: {}", what, status, body));
        }
        Ok(res)
    }
}

#[async_trait]
impl PublishingService for PostBridgeClient {
    async fn create_upload_slot(&self, filename: &str, mime: &str, size: u64) -> Result<UploadSlot> {
        let body = build_upload_slot_request(filename, mime, size);
        let res = self
            .send(self.post_json(&self.uploads_url, &body)?, "upload url")
            .await?;
        res.json().await.context("invalid upload url response")
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put_bytes(&self, upload_url: &str, bytes: Vec<u8>, mime: &str) -> Result<()> {
        let request = self
            .http
            .put(upload_url)
            .header("Content-Type", mime)
            .body(bytes)
            .build()
            .context("failed to build media upload")?;
        self.send(request, "media upload").await?;
        Ok(())
    }

    #[instrument(skip_all, fields(accounts = post.account_ids.len(), media = post.media_ids.len()))]
    async fn create_post(&self, post: &PostRequest<'_>) -> Result<Value> {
        let body = build_post_request(post);
        let res = self.send(self.post_json(&self.posts_url, &body)?, "post").await?;
        let text = res.text().await.unwrap_or_default();
        let reply = serde_json::from_str(&text).unwrap_or(Value::Null);
        info!(scheduled_at = %post.scheduled_at, draft = post.draft, "post created");
        Ok(reply)
    }
}
