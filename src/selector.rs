//! Picks one content item per run, from a remote table or a local JSON list.
use crate::model::{ContentSource, Group, SelectedItem};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use reqwest::{Client, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("page {page} of table {table} is empty")]
    EmptyPage { table: String, page: u64 },
    #[error("content list {0} is empty")]
    EmptyList(String),
    #[error("content file {0} does not hold a list")]
    NotAList(String),
    #[error("content source unavailable: {0:#}")]
    Source(#[from] anyhow::Error),
}

/// Paginated remote table.
#[async_trait]
pub trait TableSource: Send + Sync {
    async fn count(&self, table: &str) -> Result<u64>;

    /// Rows in the inclusive range `[from, to]`; the result may be shorter.
    async fn fetch_range(&self, table: &str, from: u64, to: u64) -> Result<Vec<Value>>;
}

/// Which page to read and its inclusive row range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    pub total_pages: u64,
    pub page_index: u64,
    pub from: u64,
    pub to: u64,
}

/// Map a uniform draw in `[0, 1)` to a page of `per_page` rows.
pub fn plan_page(count: u64, per_page: u64, draw: f64) -> PagePlan {
    let per_page = per_page.max(1);
    let total_pages = count.div_ceil(per_page).max(1);
    let page_index = ((draw * total_pages as f64).floor() as u64).min(total_pages - 1);
    let from = page_index * per_page;
    PagePlan {
        total_pages,
        page_index,
        from,
        to: from + per_page - 1,
    }
}

/// The shapes a raw content record can take.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Text(String),
    Record {
        id: Option<String>,
        title: Option<String>,
        content: Option<String>,
    },
    Other,
}

impl RawRecord {
    pub fn classify(value: &Value) -> Self {
        match value {
            Value::String(s) => RawRecord::Text(s.clone()),
            Value::Object(map) => {
                let id = match map.get("id") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                let title = map.get("title").and_then(Value::as_str).map(str::to_string);
                let content = map.get("content").and_then(Value::as_str).map(str::to_string);
                RawRecord::Record { id, title, content }
            }
            _ => RawRecord::Other,
        }
    }
}

/// Turn a raw record into a [`SelectedItem`]. Never fails.
pub fn normalize(value: Value) -> SelectedItem {
    match RawRecord::classify(&value) {
        RawRecord::Text(text) => SelectedItem {
            id: None,
            title: Some(text.clone()),
            body: Some(text),
            raw: value,
        },
        RawRecord::Record { id, title, content } => SelectedItem {
            id,
            title,
            body: content.as_deref().and_then(flatten_rich_text),
            raw: value,
        },
        RawRecord::Other => SelectedItem {
            id: None,
            title: None,
            body: None,
            raw: value,
        },
    }
}

/// Join the text runs of paragraph elements; `None` when the document does not parse.
pub fn flatten_rich_text(doc: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(doc).ok()?;
    let elements = parsed.get("contentElements")?.as_array()?;
    let paragraphs: Vec<String> = elements
        .iter()
        .filter(|el| el.get("type").and_then(Value::as_str) == Some("paragraph"))
        .map(|el| {
            el.get("content")
                .and_then(Value::as_array)
                .map(|runs| {
                    runs.iter()
                        .filter_map(|run| run.get("text").and_then(Value::as_str))
                        .collect::<String>()
                })
                .unwrap_or_default()
        })
        .filter(|text| !text.is_empty())
        .collect();
    Some(paragraphs.join("\n"))
}

/// Read a local content list: a top-level array, or an object carrying an
/// `ideas` or `default` array.
pub fn load_list(path: &Path) -> Result<Vec<Value>, SelectionError> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&text)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let list = match parsed {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("ideas").or_else(|| map.remove("default")) {
            Some(Value::Array(items)) => items,
            _ => return Err(SelectionError::NotAList(path.display().to_string())),
        },
        _ => return Err(SelectionError::NotAList(path.display().to_string())),
    };
    if list.is_empty() {
        return Err(SelectionError::EmptyList(path.display().to_string()));
    }
    Ok(list)
}

static TOTAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(\d+)\s*$").unwrap());

/// Total from a `Content-Range` header such as `0-9/25` or `*/0`.
pub fn parse_content_range_total(header: &str) -> Option<u64> {
    TOTAL_RE
        .captures(header)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// PostgREST table reader (Supabase `rest/v1`).
#[derive(Clone)]
pub struct RestTableClient {
    http: Client,
    base_url: Url,
    key: String,
}

impl fmt::Debug for RestTableClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestTableClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestTableClient {
    pub fn new(project_url: &str, key: String) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", project_url.trim_end_matches('/')))
            .with_context(|| format!("invalid project url {}", project_url))?;
        let http = Client::builder().user_agent("autopost/0.1").build()?;
        Ok(Self { http, base_url, key })
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.base_url
            .join(&format!("rest/v1/{}", table))
            .context("invalid table url")
    }

    pub fn build_count_request(&self, table: &str) -> Result<reqwest::Request> {
        self.http
            .head(self.table_url(table)?)
            .query(&[("select", "*")])
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .header("Prefer", "count=exact")
            .build()
            .context("failed to build count request")
    }

    pub fn build_range_request(&self, table: &str, from: u64, to: u64) -> Result<reqwest::Request> {
        self.http
            .get(self.table_url(table)?)
            .query(&[("select", "*")])
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
            .header("Range-Unit", "items")
            .header("Range", format!("{}-{}", from, to))
            .build()
            .context("failed to build range request")
    }
}

#[async_trait]
impl TableSource for RestTableClient {
    async fn count(&self, table: &str) -> Result<u64> {
        let res = self
            .http
            .execute(self.build_count_request(table)?)
            .await
            .context("failed to reach table endpoint")?;
        if !res.status().is_success() {
            return Err(anyhow!("count on {} failed: {}", table, res.status()));
        }
        let header = res
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow!("count on {} returned no Content-Range", table))?;
        parse_content_range_total(header)
            .ok_or_else(|| anyhow!("unparsable Content-Range {:?}", header))
    }

    async fn fetch_range(&self, table: &str, from: u64, to: u64) -> Result<Vec<Value>> {
        let res = self
            .http
            .execute(self.build_range_request(table, from, to)?)
            .await
            .context("failed to reach table endpoint")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("range {}-{} on {} failed {}: {}", from, to, table, status, body));
        }
        let rows: Value = res.json().await.context("invalid rows JSON")?;
        match rows {
            Value::Array(rows) => Ok(rows),
            other => Err(anyhow!("expected an array of rows, got {}", other)),
        }
    }
}

/// Chooses the content for one run.
#[derive(Clone)]
pub struct ContentSelector {
    tables: Arc<dyn TableSource>,
    items_per_page: u64,
    lists: Arc<Mutex<HashMap<PathBuf, Arc<Vec<Value>>>>>,
    rng: Arc<Mutex<StdRng>>,
}

impl ContentSelector {
    pub fn new(tables: Arc<dyn TableSource>, items_per_page: u64) -> Self {
        Self::with_rng(tables, items_per_page, StdRng::from_entropy())
    }

    pub fn with_seed(tables: Arc<dyn TableSource>, items_per_page: u64, seed: u64) -> Self {
        Self::with_rng(tables, items_per_page, StdRng::seed_from_u64(seed))
    }

    fn with_rng(tables: Arc<dyn TableSource>, items_per_page: u64, rng: StdRng) -> Self {
        Self {
            tables,
            items_per_page,
            lists: Arc::new(Mutex::new(HashMap::new())),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    fn draw(&self) -> Result<f64> {
        let mut rng = self.rng.lock().map_err(|_| anyhow!("rng poisoned"))?;
        Ok(rng.gen::<f64>())
    }

    fn pick_index(&self, len: usize) -> Result<usize> {
        let mut rng = self.rng.lock().map_err(|_| anyhow!("rng poisoned"))?;
        Ok(rng.gen_range(0..len))
    }

    #[instrument(skip_all, fields(group = %group.name))]
    pub async fn select(&self, group: &Group) -> Result<SelectedItem, SelectionError> {
        let raw = match &group.content {
            ContentSource::Table(table) => self.select_from_table(table).await?,
            ContentSource::Path(path) => self.select_from_list(path)?,
        };
        let item = normalize(raw);
        info!(id = ?item.id, title = ?item.title, "selected content");
        Ok(item)
    }

    async fn select_from_table(&self, table: &str) -> Result<Value, SelectionError> {
        let count = self.tables.count(table).await?;
        let plan = plan_page(count, self.items_per_page, self.draw()?);
        debug!(table, count, ?plan, "reading page");
        let mut rows = self.tables.fetch_range(table, plan.from, plan.to).await?;
        if rows.is_empty() {
            return Err(SelectionError::EmptyPage {
                table: table.to_string(),
                page: plan.page_index,
            });
        }
        let idx = self.pick_index(rows.len())?;
        Ok(rows.swap_remove(idx))
    }

    fn select_from_list(&self, path: &Path) -> Result<Value, SelectionError> {
        let list = self.cached_list(path)?;
        let idx = self.pick_index(list.len())?;
        Ok(list[idx].clone())
    }

    fn cached_list(&self, path: &Path) -> Result<Arc<Vec<Value>>, SelectionError> {
        {
            let lists = self.lists.lock().map_err(|_| anyhow!("list cache poisoned"))?;
            if let Some(list) = lists.get(path) {
                return Ok(list.clone());
            }
        }
        let list = Arc::new(load_list(path)?);
        let mut lists = self.lists.lock().map_err(|_| anyhow!("list cache poisoned"))?;
        Ok(lists.entry(path.to_path_buf()).or_insert(list).clone())
    }
}
