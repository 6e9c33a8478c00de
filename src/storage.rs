//! Remote object storage for rendered runs.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write `bytes` at `path`, replacing any existing object.
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime: &str) -> Result<()>;

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String>;
}

/// `{folder}/{group}/{run_dir}/{filename}`
pub fn build_storage_path(folder: &str, group: &str, run_dir: &str, filename: &str) -> String {
    [folder, group, run_dir, filename]
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Supabase Storage REST client.
#[derive(Clone)]
pub struct SupabaseStorage {
    http: Client,
    base_url: Url,
    key: String,
    bucket: String,
}

impl fmt::Debug for SupabaseStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseStorage")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl SupabaseStorage {
    pub fn new(project_url: &str, key: String, bucket: String) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", project_url.trim_end_matches('/')))
            .with_context(|| format!("invalid project url {}", project_url))?;
        let http = Client::builder()
            .user_agent("autopost/0.1")
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            base_url,
            key,
            bucket,
        })
    }

    pub fn build_upload_request(&self, path: &str, bytes: Vec<u8>, mime: &str) -> Result<reqwest::Request> {
        let url = self
            .base_url
            .join(&format!("storage/v1/object/{}/{}", self.bucket, path))
            .context("invalid object url")?;
        self.http
            .post(url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .header("Content-Type", mime)
            .header("x-upsert", "true")
            .body(bytes)
            .build()
            .context("failed to build upload request")
    }

    pub fn build_sign_request(&self, path: &str, ttl: Duration) -> Result<reqwest::Request> {
        let url = self
            .base_url
            .join(&format!("storage/v1/object/sign/{}/{}", self.bucket, path))
            .context("invalid sign url")?;
        self.http
            .post(url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .json(&json!({ "expiresIn": ttl.as_secs() }))
            .build()
            .context("failed to build sign request")
    }
}

#[async_trait]
impl ObjectStorage for SupabaseStorage {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime: &str) -> Result<()> {
        let res = self
            .http
            .execute(self.build_upload_request(path, bytes, mime)?)
            .await
            .context("failed to reach storage")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("upload of {} failed {}: {}", path, status, body));
        }
        debug!(path, "object stored");
        Ok(())
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        let res = self
            .http
            .execute(self.build_sign_request(path, ttl)?)
            .await
            .context("failed to reach storage")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("signing {} failed {}: {}", path, status, body));
        }
        let signed: SignResponse = res.json().await.context("invalid sign response")?;
        let url = self
            .base_url
            .join(&format!("storage/v1/{}", signed.signed_url.trim_start_matches('/')))
            .context("invalid signed url")?;
        Ok(url.to_string())
    }
}
