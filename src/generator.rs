//! Carousel and caption generation through an OpenAI-compatible chat API.
use crate::model::{CarouselContent, Slide, Theme};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, instrument};

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<CarouselContent>;

    async fn caption(&self, prompt: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct OpenAiGenerator {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenAiGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiGenerator")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

pub fn carousel_instructions(prompt: &str) -> String {
    format!(
        "You are a social media strategist. Create a concise carousel of 3-4 slides \
         with scannable text. Reply with JSON shaped as \
         {{ \"slides\": [ {{ \"id\", \"title\", \"subtitle\", \"bullets\" }} ], \
         \"theme\": {{ \"backgroundColor\", \"textColor\", \"accentColor\" }} }}. \
         Slide ids start at 1 and increase by one. Input:\n\n{}",
        prompt
    )
}

pub fn caption_instructions(prompt: &str) -> String {
    format!(
        "You are a social media strategist. Write one engaging caption of at most \
         280 characters for the input below, with a few relevant hashtags. \
         Reply with the caption text only.\n\nInput:\n{}",
        prompt
    )
}

/// Body for `POST v1/chat/completions`.
pub fn build_chat_request(model: &str, content: &str, json_mode: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [{ "role": "user", "content": content }],
    });
    if json_mode {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

/// Message text of the first choice, or empty.
pub fn extract_message(reply: &Value) -> String {
    reply
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Lenient parse of a carousel reply. Slide ids are renumbered to `1..=N`
/// in reply order.
pub fn parse_carousel(text: &str) -> Result<CarouselContent> {
    let parsed: Value = serde_json::from_str(text).context("carousel reply is not JSON")?;
    let slides = parsed
        .get("slides")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("carousel reply has no slides array"))?;
    if slides.is_empty() {
        return Err(anyhow!("carousel reply has no slides"));
    }

    let slides = slides
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let bullets: Option<Vec<String>> = s.get("bullets").and_then(Value::as_array).map(|b| {
                b.iter()
                    .filter_map(Value::as_str)
                    .filter(|b| !b.is_empty())
                    .map(str::to_string)
                    .collect()
            });
            Slide {
                id: i as u32 + 1,
                title: s.get("title").and_then(Value::as_str).unwrap_or("").to_string(),
                subtitle: s.get("subtitle").and_then(Value::as_str).map(str::to_string),
                bullets: bullets.filter(|b| !b.is_empty()),
            }
        })
        .collect();

    let theme = parsed.get("theme").filter(|t| t.is_object()).map(|t| {
        let color = |camel: &str, snake: &str| {
            t.get(camel)
                .or_else(|| t.get(snake))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Theme {
            background_color: color("backgroundColor", "background_color"),
            text_color: color("textColor", "text_color"),
            accent_color: color("accentColor", "accent_color"),
        }
    });

    let mut carousel = CarouselContent { slides, theme };
    carousel.renumber();
    Ok(carousel)
}

impl OpenAiGenerator {
    pub fn new(api_key: String, model: String, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("invalid base url {}", base_url))?;
        let http = Client::builder().user_agent("autopost/0.1").build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            model,
        })
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/chat/completions")
            .context("invalid generator base URL")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .build()
            .context("failed to build chat request")
    }

    async fn complete(&self, content: &str, json_mode: bool) -> Result<String> {
        let body = build_chat_request(&self.model, content, json_mode);
        let res = self
            .http
            .execute(self.build_request(&body)?)
            .await
            .context("failed to reach chat completions")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("chat completions failed {}: {}", status, body));
        }
        let reply: Value = res.json().await.context("invalid chat completions JSON")?;
        Ok(extract_message(&reply))
    }
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    #[instrument(skip_all)]
    async fn generate(&self, prompt: &str) -> Result<CarouselContent> {
        let text = self.complete(&carousel_instructions(prompt), true).await?;
        debug!(len = text.len(), "carousel reply received");
        parse_carousel(&text).context("carousel generation failed")
    }

    #[instrument(skip_all)]
    async fn caption(&self, prompt: &str) -> Result<String> {
        let text = self.complete(&caption_instructions(prompt), false).await?;
        Ok(text.trim().to_string())
    }
}
