//! Typed pipeline stages and their payloads.
//!
//! Every queued job carries exactly one [`JobPayload`] variant; the variant
//! fixes both the stage name stored next to it and the shape of its data.
use crate::model::{BatchType, CarouselContent, GeneratedResult, Group, SelectedItem};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Stage {
    DailyBatch,
    GenerateContent,
    CreateMedia,
    UploadMedia,
    SchedulePost,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DailyBatch => "daily_batch",
            Stage::GenerateContent => "generate_content",
            Stage::CreateMedia => "create_media",
            Stage::UploadMedia => "upload_media",
            Stage::SchedulePost => "schedule_post",
        }
    }

    pub fn parse_stage(s: &str) -> Option<Self> {
        match s {
            "daily_batch" => Some(Stage::DailyBatch),
            "generate_content" => Some(Stage::GenerateContent),
            "create_media" => Some(Stage::CreateMedia),
            "upload_media" => Some(Stage::UploadMedia),
            "schedule_post" => Some(Stage::SchedulePost),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyBatchJob {
    pub group: Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateContentJob {
    pub group: Group,
    pub hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateMediaJob {
    pub group: Group,
    pub hour: u32,
    pub batch_type: BatchType,
    pub selected: SelectedItem,
    pub carousel: CarouselContent,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadMediaJob {
    pub group: Group,
    pub hour: u32,
    pub batch_type: BatchType,
    pub prompt: String,
    pub result: GeneratedResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulePostJob {
    pub group: Group,
    pub hour: u32,
    pub batch_type: BatchType,
    pub prompt: String,
    pub result: GeneratedResult,
    /// Remote storage paths of the uploaded media, for operators.
    pub storage_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    DailyBatch(DailyBatchJob),
    GenerateContent(GenerateContentJob),
    CreateMedia(CreateMediaJob),
    UploadMedia(UploadMediaJob),
    SchedulePost(SchedulePostJob),
}

impl JobPayload {
    pub fn stage(&self) -> Stage {
        match self {
            JobPayload::DailyBatch(_) => Stage::DailyBatch,
            JobPayload::GenerateContent(_) => Stage::GenerateContent,
            JobPayload::CreateMedia(_) => Stage::CreateMedia,
            JobPayload::UploadMedia(_) => Stage::UploadMedia,
            JobPayload::SchedulePost(_) => Stage::SchedulePost,
        }
    }

    pub fn group(&self) -> &Group {
        match self {
            JobPayload::DailyBatch(j) => &j.group,
            JobPayload::GenerateContent(j) => &j.group,
            JobPayload::CreateMedia(j) => &j.group,
            JobPayload::UploadMedia(j) => &j.group,
            JobPayload::SchedulePost(j) => &j.group,
        }
    }

    pub fn hour(&self) -> Option<u32> {
        match self {
            JobPayload::DailyBatch(_) => None,
            JobPayload::GenerateContent(j) => Some(j.hour),
            JobPayload::CreateMedia(j) => Some(j.hour),
            JobPayload::UploadMedia(j) => Some(j.hour),
            JobPayload::SchedulePost(j) => Some(j.hour),
        }
    }

    /// Check the payload before it is enqueued.
    pub fn validate(&self) -> Result<()> {
        validate_group(self.group())?;
        if let Some(hour) = self.hour() {
            if hour > 23 {
                bail!("hour {} out of range", hour);
            }
        }
        match self {
            JobPayload::DailyBatch(_) | JobPayload::GenerateContent(_) => Ok(()),
            JobPayload::CreateMedia(j) => validate_carousel(&j.carousel),
            JobPayload::UploadMedia(j) => validate_result(&j.result),
            JobPayload::SchedulePost(j) => validate_result(&j.result),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored payload and check it matches the stage column.
    pub fn from_stored(stage: &str, payload: &str) -> Result<Self> {
        let stage = Stage::parse_stage(stage).ok_or_else(|| anyhow!("unknown stage {}", stage))?;
        let parsed: JobPayload = serde_json::from_str(payload)?;
        if parsed.stage() != stage {
            bail!("payload is {} but job stage is {}", parsed.stage(), stage);
        }
        Ok(parsed)
    }
}

fn validate_group(group: &Group) -> Result<()> {
    if group.name.trim().is_empty() {
        bail!("group name is empty");
    }
    if group.account_ids.is_empty() {
        bail!("group {} has no account ids", group.name);
    }
    if group.content.is_empty() {
        bail!("group {} has no content source", group.name);
    }
    Ok(())
}

fn validate_carousel(carousel: &CarouselContent) -> Result<()> {
    if carousel.slides.is_empty() {
        bail!("carousel has no slides");
    }
    if !carousel.has_contiguous_ids() {
        bail!("carousel slide ids are not 1..N");
    }
    Ok(())
}

fn validate_result(result: &GeneratedResult) -> Result<()> {
    validate_carousel(&result.carousel)?;
    if result.filenames.is_empty() {
        bail!("run {} produced no files", result.output_dir.display());
    }
    if result.output_dir == PathBuf::new() {
        bail!("run has no output directory");
    }
    Ok(())
}

/// Publish time for a slot: tomorrow (UTC) at `hour:00:00`.
pub fn scheduled_at(now: DateTime<Utc>, hour: u32) -> Result<DateTime<Utc>> {
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .ok_or_else(|| anyhow!("date overflow"))?;
    let at = tomorrow
        .and_hms_opt(hour, 0, 0)
        .ok_or_else(|| anyhow!("hour {} out of range", hour))?;
    Ok(at.and_utc())
}
