//! Configuration loader and validator for the posting pipeline.
use crate::model::{Group, RenderOptions};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub queue: Queue,
    pub schedule: Scheduling,
    pub render: Render,
    #[serde(default)]
    pub content: Content,
    pub supabase: Supabase,
    pub publisher: Publisher,
    pub generator: Generator,
    pub groups: Vec<Group>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Keep run directories after a successful publish.
    #[serde(default)]
    pub preserve_output: bool,
}

/// Job queue and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Queue {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub keep_completed: u32,
    pub keep_failed: u32,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base_ms: 5_000,
            poll_interval_ms: 500,
            job_timeout_secs: 900,
            stall_timeout_secs: 1_800,
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

/// Daily trigger and per-day post slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduling {
    #[serde(default = "default_daily_cron")]
    pub daily_cron: String,
    pub post_hours: Vec<u32>,
}

fn default_daily_cron() -> String {
    "0 0 6 * * *".into()
}

/// Template image plus text layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Render {
    pub template: PathBuf,
    #[serde(flatten)]
    pub options: RenderOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Content {
    pub items_per_page: u64,
}

impl Default for Content {
    fn default() -> Self {
        Self { items_per_page: 10 }
    }
}

/// Supabase project: remote content tables and object storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Supabase {
    pub url: String,
    pub key: String,
    pub bucket: String,
    pub folder: String,
}

/// Social publishing API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publisher {
    pub token: String,
    pub uploads_url: String,
    pub posts_url: String,
    /// Create posts as drafts instead of live scheduled posts.
    #[serde(default)]
    pub draft: bool,
}

/// Text generation API (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generator {
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_generator_url")]
    pub base_url: String,
}

fn default_generator_url() -> String {
    "https://api.openai.com/".into()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Root under which per-run output directories are created.
    pub fn output_root(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("output")
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/autopost.db", self.app.data_dir))
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let q = &cfg.queue;
    if q.concurrency == 0 {
        return Err(ConfigError::Invalid("queue.concurrency must be > 0"));
    }
    if q.max_attempts == 0 {
        return Err(ConfigError::Invalid("queue.max_attempts must be > 0"));
    }
    if q.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("queue.poll_interval_ms must be > 0"));
    }
    if q.job_timeout_secs == 0 {
        return Err(ConfigError::Invalid("queue.job_timeout_secs must be > 0"));
    }
    if q.stall_timeout_secs <= q.job_timeout_secs {
        return Err(ConfigError::Invalid(
            "queue.stall_timeout_secs must exceed queue.job_timeout_secs",
        ));
    }

    if Schedule::from_str(&cfg.schedule.daily_cron).is_err() {
        return Err(ConfigError::Invalid("schedule.daily_cron is not a valid cron expression"));
    }
    if cfg.schedule.post_hours.is_empty() {
        return Err(ConfigError::Invalid("schedule.post_hours must be non-empty"));
    }
    if cfg.schedule.post_hours.iter().any(|h| *h > 23) {
        return Err(ConfigError::Invalid("schedule.post_hours must be within 0..=23"));
    }

    if cfg.render.template.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("render.template must be non-empty"));
    }
    if cfg.render.options.font_file.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("render.font_file must be non-empty"));
    }
    if cfg.render.options.font_size == 0 {
        return Err(ConfigError::Invalid("render.font_size must be > 0"));
    }

    if cfg.content.items_per_page == 0 {
        return Err(ConfigError::Invalid("content.items_per_page must be > 0"));
    }

    let sb = &cfg.supabase;
    if sb.url.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.url must be non-empty"));
    }
    if sb.key.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.key must be non-empty"));
    }
    if sb.bucket.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.bucket must be non-empty"));
    }
    if sb.folder.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.folder must be non-empty"));
    }

    let pb = &cfg.publisher;
    if pb.token.trim().is_empty() {
        return Err(ConfigError::Invalid("publisher.token must be non-empty"));
    }
    if pb.uploads_url.trim().is_empty() || pb.posts_url.trim().is_empty() {
        return Err(ConfigError::Invalid("publisher.uploads_url and posts_url must be non-empty"));
    }

    if cfg.generator.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.api_key must be non-empty"));
    }
    if cfg.generator.model.trim().is_empty() {
        return Err(ConfigError::Invalid("generator.model must be non-empty"));
    }

    let mut seen = HashSet::new();
    for group in &cfg.groups {
        if group.name.trim().is_empty() {
            return Err(ConfigError::Invalid("groups[].name must be non-empty"));
        }
        if !seen.insert(group.name.as_str()) {
            return Err(ConfigError::Invalid("groups[].name must be unique"));
        }
        if group.account_ids.is_empty() || group.account_ids.iter().any(|id| *id <= 0) {
            return Err(ConfigError::Invalid("groups[].account_ids must be positive and non-empty"));
        }
        if group.content.is_empty() {
            return Err(ConfigError::Invalid("groups[].content must be non-empty"));
        }
    }

    Ok(())
}

/// Example configuration used by docs and tests.
pub fn example() -> &'static str {
    r##"app:
  data_dir: "./data"
  preserve_output: false

queue:
  concurrency: 5
  max_attempts: 3
  backoff_base_ms: 5000
  poll_interval_ms: 500
  job_timeout_secs: 900
  stall_timeout_secs: 1800
  keep_completed: 100
  keep_failed: 500

schedule:
  daily_cron: "0 0 6 * * *"
  post_hours: [9, 18, 22]

render:
  template: "./template/background.png"
  margin_top: 120
  margin_bottom: 120
  margin_left: 80
  margin_right: 80
  font_size: 64
  font_file: "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf"
  font_name: "DejaVu Sans"
  text_color: "#ffffff"
  letter_spacing: 2
  paragraph_spacing: 24
  font_weight: "bold"
  font_style: "normal"

content:
  items_per_page: 10

supabase:
  url: "https://YOUR_PROJECT.supabase.co"
  key: "YOUR_SUPABASE_SERVICE_KEY"
  bucket: "media"
  folder: "carousels"

publisher:
  token: "YOUR_PUBLISHER_TOKEN"
  uploads_url: "https://api.post-bridge.com/v1/media/create-upload-url"
  posts_url: "https://api.post-bridge.com/v1/posts"
  draft: true

generator:
  api_key: "YOUR_OPENAI_API_KEY"
  model: "gpt-4o-mini"

groups:
  - name: "FOOTBALL"
    account_ids: [101, 102]
    content:
      table: "football_articles"
  - name: "GYM"
    account_ids: [201]
    content:
      path: "./content/gym.json"
"##
}
