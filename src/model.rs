use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Where a group's content comes from. Written as `{ table: .. }` or
/// `{ path: .. }` in both YAML config and JSON payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "ContentSourceMap", into = "ContentSourceMap")]
pub enum ContentSource {
    /// Remote table, selected page-then-row.
    Table(String),
    /// Local JSON file holding a list of items.
    Path(PathBuf),
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContentSourceMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
}

impl TryFrom<ContentSourceMap> for ContentSource {
    type Error = String;

    fn try_from(map: ContentSourceMap) -> Result<Self, Self::Error> {
        match (map.table, map.path) {
            (Some(table), None) => Ok(ContentSource::Table(table)),
            (None, Some(path)) => Ok(ContentSource::Path(path)),
            _ => Err("content needs exactly one of `table` or `path`".into()),
        }
    }
}

impl From<ContentSource> for ContentSourceMap {
    fn from(source: ContentSource) -> Self {
        match source {
            ContentSource::Table(table) => Self {
                table: Some(table),
                path: None,
            },
            ContentSource::Path(path) => Self {
                table: None,
                path: Some(path),
            },
        }
    }
}

impl ContentSource {
    pub fn is_empty(&self) -> bool {
        match self {
            ContentSource::Table(t) => t.trim().is_empty(),
            ContentSource::Path(p) => p.as_os_str().is_empty(),
        }
    }
}

/// A configured set of target accounts plus a content source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub account_ids: Vec<i64>,
    pub content: ContentSource,
}

/// Image carousel or short silent videos for one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Image,
    Video,
}

impl BatchType {
    pub fn from_is_video(is_video: bool) -> Self {
        if is_video {
            BatchType::Video
        } else {
            BatchType::Image
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, BatchType::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Image => "image",
            BatchType::Video => "video",
        }
    }
}

/// The chosen content unit for one pipeline run. Never mutated after selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub raw: Value,
}

impl SelectedItem {
    /// Prompt handed to the content generator and reused for the caption.
    pub fn to_prompt(&self) -> String {
        let title = self.title.as_deref().unwrap_or("Untitled");
        let body = self.body.as_deref().unwrap_or("");
        format!("Title: {}\n\nContext: {}", title, body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slide {
    pub id: u32,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Theme {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accent_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarouselContent {
    pub slides: Vec<Slide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
}

impl CarouselContent {
    /// Renumber slides to `1..=N` in their current order.
    pub fn renumber(&mut self) {
        for (idx, slide) in self.slides.iter_mut().enumerate() {
            slide.id = idx as u32 + 1;
        }
    }

    /// True when slide ids are exactly `1..=N` with no gaps or duplicates.
    pub fn has_contiguous_ids(&self) -> bool {
        self.slides
            .iter()
            .enumerate()
            .all(|(idx, slide)| slide.id == idx as u32 + 1)
    }
}

/// Layout and style for one render pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderOptions {
    pub margin_top: u32,
    pub margin_bottom: u32,
    pub margin_left: u32,
    pub margin_right: u32,
    pub font_size: u32,
    pub font_file: PathBuf,
    pub font_name: String,
    pub text_color: String,
    #[serde(default)]
    pub letter_spacing: u32,
    #[serde(default)]
    pub paragraph_spacing: u32,
    #[serde(default = "default_font_weight")]
    pub font_weight: String,
    #[serde(default = "default_font_style")]
    pub font_style: String,
}

fn default_font_weight() -> String {
    "normal".into()
}

fn default_font_style() -> String {
    "normal".into()
}

/// Output bundle of one rendering pass; also the `metadata.json` record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedResult {
    pub group: String,
    pub selected: SelectedItem,
    pub carousel: CarouselContent,
    pub created_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub filenames: Vec<String>,
}

impl GeneratedResult {
    /// Final path component of the run directory.
    pub fn run_dir_name(&self) -> String {
        self.output_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.filenames
            .iter()
            .map(|name| self.output_dir.join(name))
            .collect()
    }
}

/// MIME type used for storage and publishing uploads.
pub fn mime_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".mp4") {
        "video/mp4"
    } else if lower.ends_with(".json") {
        "application/json"
    } else {
        "image/png"
    }
}
