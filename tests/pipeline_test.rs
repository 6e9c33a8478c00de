use anyhow::{anyhow, Result};
use autopost::batch_state::{BatchTypeStore, KeyValueStore, MemoryKvStore};
use autopost::config::{self, Config};
use autopost::db::{self, JobStatus};
use autopost::generator::ContentGenerator;
use autopost::jobs::{GenerateContentJob, JobPayload};
use autopost::model::{CarouselContent, ContentSource, Group, RenderOptions, Slide};
use autopost::pipeline::{Pipeline, PipelineSettings, Services};
use autopost::publisher::{build_post_request, PostRequest, PublishingService, UploadSlot};
use autopost::queue::{EnqueueOptions, JobQueue, RetryPolicy};
use autopost::render::{slide_filename, MediaRenderer};
use autopost::selector::{ContentSelector, TableSource};
use autopost::storage::ObjectStorage;
use autopost::worker::process_next_job;
use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct StaticTable {
    rows: Vec<Value>,
    ranges: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl StaticTable {
    fn articles(n: u64) -> Self {
        Self {
            rows: (0..n)
                .map(|i| json!({"id": i, "title": format!("Article {i}"), "content": format!("Body {i}")}))
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl TableSource for StaticTable {
    async fn count(&self, _table: &str) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn fetch_range(&self, _table: &str, from: u64, to: u64) -> Result<Vec<Value>> {
        self.ranges.lock().await.push((from, to));
        Ok(self
            .rows
            .iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Default)]
struct RecordingGenerator {
    prompts: Arc<Mutex<Vec<String>>>,
    caption_prompts: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl ContentGenerator for RecordingGenerator {
    async fn generate(&self, prompt: &str) -> Result<CarouselContent> {
        self.prompts.lock().await.push(prompt.to_string());
        if prompt.contains("broken") {
            return Err(anyhow!("generator refused the prompt"));
        }
        if prompt.contains("empty") {
            return Ok(CarouselContent {
                slides: Vec::new(),
                theme: None,
            });
        }
        Ok(CarouselContent {
            slides: vec![
                Slide {
                    id: 1,
                    title: "Hook".into(),
                    subtitle: Some("Why it matters".into()),
                    bullets: None,
                },
                Slide {
                    id: 3,
                    title: "Tips".into(),
                    subtitle: None,
                    bullets: Some(vec!["Warm up".into(), "Hydrate".into()]),
                },
            ],
            theme: None,
        })
    }

    async fn caption(&self, prompt: &str) -> Result<String> {
        self.caption_prompts.lock().await.push(prompt.to_string());
        Ok("Swipe for more #daily".into())
    }
}

#[derive(Clone, Default)]
struct RecordingRenderer {
    fail_video: bool,
    slide_ids: Arc<Mutex<Vec<Vec<u32>>>>,
}

#[async_trait::async_trait]
impl MediaRenderer for RecordingRenderer {
    async fn render(
        &self,
        _template: &Path,
        carousel: &CarouselContent,
        _options: &RenderOptions,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        self.slide_ids
            .lock()
            .await
            .push(carousel.slides.iter().map(|s| s.id).collect());
        let mut out = Vec::new();
        for slide in &carousel.slides {
            let path = out_dir.join(slide_filename(slide));
            tokio::fs::write(&path, b"png").await?;
            out.push(path);
        }
        Ok(out)
    }

    async fn to_video(&self, image: &Path) -> Result<PathBuf> {
        if self.fail_video {
            return Err(anyhow!("ffmpeg not installed"));
        }
        let video = image.with_extension("mp4");
        tokio::fs::write(&video, b"mp4").await?;
        Ok(video)
    }
}

#[derive(Clone, Default)]
struct RecordingStorage {
    /// path -> (mime, number of writes)
    objects: Arc<Mutex<BTreeMap<String, (String, usize)>>>,
    calls: Arc<Mutex<usize>>,
    fail_on_call: Option<usize>,
}

#[async_trait::async_trait]
impl ObjectStorage for RecordingStorage {
    async fn upload(&self, path: &str, _bytes: Vec<u8>, mime: &str) -> Result<()> {
        let mut calls = self.calls.lock().await;
        *calls += 1;
        if Some(*calls) == self.fail_on_call {
            return Err(anyhow!("storage returned 503"));
        }
        let mut objects = self.objects.lock().await;
        let entry = objects.entry(path.to_string()).or_insert((String::new(), 0));
        entry.0 = mime.to_string();
        entry.1 += 1;
        Ok(())
    }

    async fn signed_url(&self, path: &str, _ttl: Duration) -> Result<String> {
        Ok(format!("https://storage.test/signed/{path}"))
    }
}

#[derive(Clone, Default)]
struct RecordingPublisher {
    slots: Arc<Mutex<Vec<(String, String, u64)>>>,
    puts: Arc<Mutex<Vec<(String, String)>>>,
    posts: Arc<Mutex<Vec<Value>>>,
}

#[async_trait::async_trait]
impl PublishingService for RecordingPublisher {
    async fn create_upload_slot(&self, filename: &str, mime: &str, size: u64) -> Result<UploadSlot> {
        let mut slots = self.slots.lock().await;
        slots.push((filename.to_string(), mime.to_string(), size));
        Ok(UploadSlot {
            media_id: format!("media-{}", slots.len()),
            upload_url: format!("https://upload.test/{}", slots.len()),
        })
    }

    async fn put_bytes(&self, upload_url: &str, _bytes: Vec<u8>, mime: &str) -> Result<()> {
        self.puts
            .lock()
            .await
            .push((upload_url.to_string(), mime.to_string()));
        Ok(())
    }

    async fn create_post(&self, post: &PostRequest<'_>) -> Result<Value> {
        self.posts.lock().await.push(build_post_request(post));
        Ok(json!({"id": "post-1"}))
    }
}

struct Harness {
    _td: TempDir,
    output_root: PathBuf,
    pool: sqlx::SqlitePool,
    queue: JobQueue,
    pipeline: Pipeline,
    kv: MemoryKvStore,
    table: StaticTable,
    generator: RecordingGenerator,
    renderer: RecordingRenderer,
    storage: RecordingStorage,
    publisher: RecordingPublisher,
}

async fn harness(renderer: RecordingRenderer, storage: RecordingStorage) -> Harness {
    let td = tempfile::tempdir().unwrap();
    let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    let mut settings = PipelineSettings::from_config(&cfg);
    settings.output_root = td.path().join("output");
    settings.template = td.path().join("template.png");

    let pool = setup_pool().await;
    let queue = JobQueue::new(
        pool.clone(),
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::ZERO,
        },
    );
    let kv = MemoryKvStore::default();
    let table = StaticTable::articles(25);
    let generator = RecordingGenerator::default();
    let publisher = RecordingPublisher::default();
    let services = Services {
        batch_types: BatchTypeStore::with_seed(Arc::new(kv.clone()), 7),
        selector: ContentSelector::with_seed(Arc::new(table.clone()), 10, 7),
        generator: Arc::new(generator.clone()),
        renderer: Arc::new(renderer.clone()),
        storage: Arc::new(storage.clone()),
        publisher: Arc::new(publisher.clone()),
    };
    Harness {
        output_root: settings.output_root.clone(),
        pipeline: Pipeline::new(settings, services),
        _td: td,
        pool,
        queue,
        kv,
        table,
        generator,
        renderer,
        storage,
        publisher,
    }
}

fn football() -> Group {
    Group {
        name: "FOOTBALL".into(),
        account_ids: vec![101, 102],
        content: ContentSource::Table("football_articles".into()),
    }
}

async fn enqueue(h: &Harness, payload: JobPayload) {
    h.queue
        .enqueue(&payload, EnqueueOptions::default(), Utc::now())
        .await
        .unwrap()
        .unwrap();
}

async fn drain(h: &Harness) -> usize {
    let mut processed = 0;
    while process_next_job(&h.queue, &h.pipeline, Duration::from_secs(30), Utc::now())
        .await
        .unwrap()
    {
        processed += 1;
        assert!(processed < 100, "queue never drained");
    }
    processed
}

fn scheduled_at(post: &Value) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(post["scheduled_at"].as_str().unwrap())
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn daily_batch_flows_through_every_stage() {
    let h = harness(RecordingRenderer::default(), RecordingStorage::default()).await;
    h.kv.set(&BatchTypeStore::key_for("FOOTBALL"), "false").await.unwrap();
    enqueue(&h, JobPayload::DailyBatch(autopost::jobs::DailyBatchJob { group: football() })).await;

    // one fan-out plus four stages for each of the three post hours
    assert_eq!(drain(&h).await, 13);
    assert_eq!(db::count_jobs(&h.pool, JobStatus::Completed).await.unwrap(), 13);
    assert_eq!(db::count_jobs(&h.pool, JobStatus::Failed).await.unwrap(), 0);

    // image, video, image: the stored decision flips back to video
    assert_eq!(
        h.kv.get(&BatchTypeStore::key_for("FOOTBALL")).await.unwrap().as_deref(),
        Some("true")
    );

    for (from, to) in h.table.ranges.lock().await.iter() {
        assert_eq!(to - from, 9);
        assert!([0, 10, 20].contains(from));
    }
    assert_eq!(h.generator.prompts.lock().await.len(), 3);
    for prompt in h.generator.caption_prompts.lock().await.iter() {
        assert!(prompt.starts_with("Title: Article "));
    }
    // slide ids were renumbered before rendering
    for ids in h.renderer.slide_ids.lock().await.iter() {
        assert_eq!(ids, &vec![1, 2]);
    }

    let objects = h.storage.objects.lock().await;
    assert_eq!(objects.len(), 9);
    for (path, (mime, writes)) in objects.iter() {
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts.len(), 4, "{path}");
        assert_eq!(&parts[..2], &["carousels", "FOOTBALL"]);
        assert_eq!(*writes, 1);
        if path.ends_with("metadata.json") {
            assert_eq!(mime, "application/json");
        }
    }
    assert_eq!(objects.keys().filter(|p| p.ends_with(".mp4")).count(), 2);
    assert_eq!(objects.keys().filter(|p| p.ends_with(".png")).count(), 4);

    let posts = h.publisher.posts.lock().await;
    assert_eq!(posts.len(), 3);
    let mut hours: Vec<u32> = posts.iter().map(|p| scheduled_at(p).hour()).collect();
    hours.sort();
    assert_eq!(hours, vec![9, 18, 22]);
    for post in posts.iter() {
        assert_eq!(post["social_accounts"], json!([101, 102]));
        assert_eq!(post["is_draft"], json!(true));
        assert_eq!(post["caption"], json!("Swipe for more #daily"));
        assert_eq!(post["media"].as_array().unwrap().len(), 2);
        assert!(scheduled_at(post) > Utc::now());
        assert_eq!(scheduled_at(post).minute(), 0);
    }
    assert_eq!(h.publisher.puts.lock().await.len(), 6);

    let leftover = std::fs::read_dir(h.output_root.join("FOOTBALL")).unwrap().count();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn stage_chain_targets_next_day_at_post_hour() {
    let h = harness(RecordingRenderer::default(), RecordingStorage::default()).await;
    h.kv.set(&BatchTypeStore::key_for("FOOTBALL"), "false").await.unwrap();
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();

    let mut next = vec![JobPayload::GenerateContent(GenerateContentJob {
        group: football(),
        hour: 9,
    })];
    let mut stages = Vec::new();
    while let Some(payload) = next.pop() {
        stages.push(payload.stage().as_str());
        next = h.pipeline.run_stage(&payload, now).await.unwrap();
    }
    assert_eq!(
        stages,
        vec!["generate_content", "create_media", "upload_media", "schedule_post"]
    );

    let posts = h.publisher.posts.lock().await;
    assert_eq!(posts[0]["scheduled_at"], json!("2024-05-02T09:00:00.000Z"));
    let objects = h.storage.objects.lock().await;
    assert!(objects.contains_key("carousels/FOOTBALL/2024-05-01T06-00-00-000Z/slide-1.png"));
    assert!(objects.contains_key("carousels/FOOTBALL/2024-05-01T06-00-00-000Z/metadata.json"));
}

#[tokio::test]
async fn failed_video_conversion_keeps_stills() {
    let renderer = RecordingRenderer {
        fail_video: true,
        ..Default::default()
    };
    let h = harness(renderer, RecordingStorage::default()).await;
    h.kv.set(&BatchTypeStore::key_for("FOOTBALL"), "true").await.unwrap();
    enqueue(
        &h,
        JobPayload::GenerateContent(GenerateContentJob {
            group: football(),
            hour: 18,
        }),
    )
    .await;

    assert_eq!(drain(&h).await, 4);
    let objects = h.storage.objects.lock().await;
    assert!(objects.keys().all(|p| !p.ends_with(".mp4")));
    assert_eq!(objects.keys().filter(|p| p.ends_with(".png")).count(), 2);
    let puts = h.publisher.puts.lock().await;
    assert!(puts.iter().all(|(_, mime)| mime == "image/png"));
    assert_eq!(h.publisher.posts.lock().await.len(), 1);
}

#[tokio::test]
async fn upload_failure_retries_with_artifacts_intact() {
    // the third upload call is the first attempt's metadata.json
    let storage = RecordingStorage {
        fail_on_call: Some(3),
        ..Default::default()
    };
    let h = harness(RecordingRenderer::default(), storage).await;
    h.kv.set(&BatchTypeStore::key_for("FOOTBALL"), "false").await.unwrap();
    enqueue(
        &h,
        JobPayload::GenerateContent(GenerateContentJob {
            group: football(),
            hour: 22,
        }),
    )
    .await;

    assert_eq!(drain(&h).await, 5);
    let upload = db::list_jobs(&h.pool, Some(JobStatus::Completed), 10)
        .await
        .unwrap()
        .into_iter()
        .find(|job| job.stage == "upload_media")
        .unwrap();
    assert_eq!(upload.attempts, 2);
    assert!(upload.last_error.unwrap().contains("503"));

    let objects = h.storage.objects.lock().await;
    assert_eq!(objects.len(), 3);
    assert_eq!(objects.values().filter(|(_, writes)| *writes == 2).count(), 2);
    assert_eq!(h.publisher.posts.lock().await.len(), 1);
}

#[tokio::test]
async fn failing_group_does_not_block_others() {
    let h = harness(RecordingRenderer::default(), RecordingStorage::default()).await;
    let list = h.output_root.with_file_name("gym.json");
    std::fs::write(&list, r#"[{"title": "broken", "content": "nothing"}]"#).unwrap();
    let gym = Group {
        name: "GYM".into(),
        account_ids: vec![201],
        content: ContentSource::Path(list),
    };
    for group in [football(), gym] {
        enqueue(&h, JobPayload::GenerateContent(GenerateContentJob { group, hour: 9 })).await;
    }

    drain(&h).await;
    let failed = db::list_jobs(&h.pool, Some(JobStatus::Failed), 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stage, "generate_content");
    assert_eq!(failed[0].attempts, 3);
    assert!(failed[0].last_error.as_deref().unwrap().contains("generator refused"));

    let posts = h.publisher.posts.lock().await;
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["social_accounts"], json!([101, 102]));
}

#[tokio::test]
async fn unenqueueable_successor_fails_the_job() {
    let h = harness(RecordingRenderer::default(), RecordingStorage::default()).await;
    let list = h.output_root.with_file_name("empty.json");
    std::fs::write(&list, r#"["empty"]"#).unwrap();
    let group = Group {
        name: "GYM".into(),
        account_ids: vec![201],
        content: ContentSource::Path(list),
    };
    enqueue(&h, JobPayload::GenerateContent(GenerateContentJob { group, hour: 9 })).await;

    assert_eq!(drain(&h).await, 3);
    assert_eq!(db::count_jobs(&h.pool, JobStatus::Active).await.unwrap(), 0);
    assert_eq!(db::count_jobs(&h.pool, JobStatus::Waiting).await.unwrap(), 0);
    let failed = db::list_jobs(&h.pool, Some(JobStatus::Failed), 10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stage, "generate_content");
    assert_eq!(failed[0].attempts, 3);
    assert!(failed[0].last_error.as_deref().unwrap().contains("no slides"));
    assert!(h.publisher.posts.lock().await.is_empty());
}
