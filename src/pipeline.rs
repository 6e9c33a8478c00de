//! Stage handlers. Each stage is a function of its payload plus external
//! calls, and returns the payloads of the jobs that follow it.
use crate::batch_state::BatchTypeStore;
use crate::config::Config;
use crate::generator::ContentGenerator;
use crate::jobs::{
    self, CreateMediaJob, DailyBatchJob, GenerateContentJob, JobPayload, SchedulePostJob,
    UploadMediaJob,
};
use crate::model::{mime_for, BatchType, GeneratedResult, RenderOptions};
use crate::publisher::{PostRequest, PublishingService};
use crate::render::MediaRenderer;
use crate::selector::ContentSelector;
use crate::storage::{build_storage_path, ObjectStorage};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const METADATA_FILE: &str = "metadata.json";

/// Static inputs of every run, taken from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub post_hours: Vec<u32>,
    pub output_root: PathBuf,
    pub template: PathBuf,
    pub render: RenderOptions,
    pub storage_folder: String,
    pub draft: bool,
    pub preserve_output: bool,
    pub signed_url_ttl: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            post_hours: cfg.schedule.post_hours.clone(),
            output_root: cfg.output_root(),
            template: cfg.render.template.clone(),
            render: cfg.render.options.clone(),
            storage_folder: cfg.supabase.folder.clone(),
            draft: cfg.publisher.draft,
            preserve_output: cfg.app.preserve_output,
            signed_url_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// External collaborators the stages call.
#[derive(Clone)]
pub struct Services {
    pub batch_types: BatchTypeStore,
    pub selector: ContentSelector,
    pub generator: Arc<dyn ContentGenerator>,
    pub renderer: Arc<dyn MediaRenderer>,
    pub storage: Arc<dyn ObjectStorage>,
    pub publisher: Arc<dyn PublishingService>,
}

#[derive(Clone)]
pub struct Pipeline {
    settings: PipelineSettings,
    services: Services,
}

/// Run directory name: the UTC timestamp with `:` and `.` replaced by `-`.
pub fn run_dir_name(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// Create a fresh run directory under `{root}/{group}`. A name collision
/// gets a numeric suffix so no two runs share a directory.
pub async fn create_run_dir(root: &Path, group: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let parent = root.join(group);
    tokio::fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let base = run_dir_name(now);
    for n in 0..100 {
        let name = if n == 0 { base.clone() } else { format!("{}-{}", base, n) };
        let dir = parent.join(name);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("failed to create {}", dir.display())),
        }
    }
    Err(anyhow!("no free run directory under {}", parent.display()))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, services: Services) -> Self {
        Self { settings, services }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Execute one job and return its successors.
    pub async fn run_stage(&self, payload: &JobPayload, now: DateTime<Utc>) -> Result<Vec<JobPayload>> {
        match payload {
            JobPayload::DailyBatch(job) => Ok(self.daily_batch(job)),
            JobPayload::GenerateContent(job) => self.generate_content(job).await.map(|n| vec![n]),
            JobPayload::CreateMedia(job) => self.create_media(job, now).await.map(|n| vec![n]),
            JobPayload::UploadMedia(job) => self.upload_media(job).await.map(|n| vec![n]),
            JobPayload::SchedulePost(job) => self.schedule_post(job, now).await.map(|_| Vec::new()),
        }
    }

    fn daily_batch(&self, job: &DailyBatchJob) -> Vec<JobPayload> {
        info!(group = %job.group.name, hours = ?self.settings.post_hours, "fanning out daily batch");
        self.settings
            .post_hours
            .iter()
            .map(|hour| {
                JobPayload::GenerateContent(GenerateContentJob {
                    group: job.group.clone(),
                    hour: *hour,
                })
            })
            .collect()
    }

    #[instrument(skip_all, fields(group = %job.group.name, hour = job.hour))]
    async fn generate_content(&self, job: &GenerateContentJob) -> Result<JobPayload> {
        let is_video = self
            .services
            .batch_types
            .get_and_toggle(&job.group.name)
            .await
            .context("batch type store unavailable")?;
        let batch_type = BatchType::from_is_video(is_video);

        let selected = self.services.selector.select(&job.group).await?;
        let prompt = selected.to_prompt();
        debug!(%prompt, "prompt built");

        let mut carousel = self.services.generator.generate(&prompt).await?;
        if !carousel.has_contiguous_ids() {
            warn!("generator returned non-contiguous slide ids; renumbering");
            carousel.renumber();
        }
        info!(batch_type = batch_type.as_str(), slides = carousel.slides.len(), "content generated");

        Ok(JobPayload::CreateMedia(CreateMediaJob {
            group: job.group.clone(),
            hour: job.hour,
            batch_type,
            selected,
            carousel,
            prompt,
        }))
    }

    #[instrument(skip_all, fields(group = %job.group.name, hour = job.hour))]
    async fn create_media(&self, job: &CreateMediaJob, now: DateTime<Utc>) -> Result<JobPayload> {
        let run_dir = create_run_dir(&self.settings.output_root, &job.group.name, now).await?;
        let rendered = self
            .services
            .renderer
            .render(&self.settings.template, &job.carousel, &self.settings.render, &run_dir)
            .await;
        let images = match rendered {
            Ok(images) => images,
            Err(err) => {
                if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
                    warn!(dir = %run_dir.display(), error = %e, "failed to remove partial run");
                }
                return Err(err.context("rendering failed"));
            }
        };

        let mut filenames = Vec::with_capacity(images.len());
        for image in &images {
            let output = if job.batch_type.is_video() {
                match self.services.renderer.to_video(image).await {
                    Ok(video) => video,
                    Err(err) => {
                        warn!(image = %image.display(), error = %format!("{:#}", err), "video conversion failed; keeping still");
                        image.clone()
                    }
                }
            } else {
                image.clone()
            };
            filenames.push(file_name(&output)?);
        }

        let result = GeneratedResult {
            group: job.group.name.clone(),
            selected: job.selected.clone(),
            carousel: job.carousel.clone(),
            created_at: now,
            output_dir: run_dir.clone(),
            filenames,
        };
        let metadata = serde_json::to_vec_pretty(&result)?;
        tokio::fs::write(run_dir.join(METADATA_FILE), metadata)
            .await
            .context("failed to write run metadata")?;
        info!(dir = %run_dir.display(), files = ?result.filenames, "media created");

        Ok(JobPayload::UploadMedia(UploadMediaJob {
            group: job.group.clone(),
            hour: job.hour,
            batch_type: job.batch_type,
            prompt: job.prompt.clone(),
            result,
        }))
    }

    #[instrument(skip_all, fields(group = %job.group.name, hour = job.hour))]
    async fn upload_media(&self, job: &UploadMediaJob) -> Result<JobPayload> {
        let run_dir = job.result.run_dir_name();
        let folder = &self.settings.storage_folder;
        let mut storage_paths = Vec::with_capacity(job.result.filenames.len());
        for filename in &job.result.filenames {
            let local = job.result.output_dir.join(filename);
            let bytes = tokio::fs::read(&local)
                .await
                .with_context(|| format!("file not found: {}", local.display()))?;
            let remote = build_storage_path(folder, &job.group.name, &run_dir, filename);
            self.services
                .storage
                .upload(&remote, bytes, mime_for(filename))
                .await
                .with_context(|| format!("upload of {} failed", remote))?;
            info!(path = %remote, "uploaded");
            storage_paths.push(remote);
        }

        let metadata = match tokio::fs::read(job.result.output_dir.join(METADATA_FILE)).await {
            Ok(bytes) => bytes,
            Err(_) => serde_json::to_vec_pretty(&job.result)?,
        };
        let meta_path = build_storage_path(folder, &job.group.name, &run_dir, METADATA_FILE);
        self.services
            .storage
            .upload(&meta_path, metadata, mime_for(METADATA_FILE))
            .await
            .with_context(|| format!("upload of {} failed", meta_path))?;
        match self
            .services
            .storage
            .signed_url(&meta_path, self.settings.signed_url_ttl)
            .await
        {
            Ok(url) => info!(%url, "run metadata available"),
            Err(err) => warn!(path = %meta_path, error = %format!("{:#}", err), "could not sign metadata url"),
        }

        Ok(JobPayload::SchedulePost(SchedulePostJob {
            group: job.group.clone(),
            hour: job.hour,
            batch_type: job.batch_type,
            prompt: job.prompt.clone(),
            result: job.result.clone(),
            storage_paths,
        }))
    }

    #[instrument(skip_all, fields(group = %job.group.name, hour = job.hour))]
    async fn schedule_post(&self, job: &SchedulePostJob, now: DateTime<Utc>) -> Result<()> {
        let publisher = &self.services.publisher;
        let mut media_ids = Vec::with_capacity(job.result.filenames.len());
        for filename in &job.result.filenames {
            let local = job.result.output_dir.join(filename);
            let bytes = tokio::fs::read(&local)
                .await
                .with_context(|| format!("file not found: {}", local.display()))?;
            let mime = mime_for(filename);
            let slot = publisher
                .create_upload_slot(filename, mime, bytes.len() as u64)
                .await?;
            publisher.put_bytes(&slot.upload_url, bytes, mime).await?;
            debug!(%filename, media_id = %slot.media_id, "media handed to publisher");
            media_ids.push(slot.media_id);
        }

        let caption = self.services.generator.caption(&job.prompt).await?;
        let scheduled_at = jobs::scheduled_at(now, job.hour)?;
        let reply = publisher
            .create_post(&PostRequest {
                account_ids: &job.group.account_ids,
                caption: &caption,
                media_ids: &media_ids,
                scheduled_at,
                draft: self.settings.draft,
            })
            .await?;
        info!(%scheduled_at, media = media_ids.len(), %reply, "post scheduled");

        if self.settings.preserve_output {
            debug!(dir = %job.result.output_dir.display(), "keeping run output");
        } else if let Err(e) = tokio::fs::remove_dir_all(&job.result.output_dir).await {
            warn!(dir = %job.result.output_dir.display(), error = %e, "cleanup failed");
        }
        Ok(())
    }
}
