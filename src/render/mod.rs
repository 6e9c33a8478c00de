//! Slide rendering: ffmpeg `drawtext` first, direct rasterisation as fallback,
//! plus still-to-video conversion.
use crate::model::{CarouselContent, RenderOptions, Slide};
use ab_glyph::FontVec;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub mod filter;
pub mod layout;
pub mod raster;
pub mod video;

pub const DEFAULT_DIMENSION: u32 = 1080;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template {path} unreadable: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("font {path} unusable: {reason}")]
    Font { path: PathBuf, reason: String },
    #[error("primary render failed: {0}")]
    Primary(String),
    #[error("fallback render failed: {0}")]
    Fallback(String),
    #[error("video conversion failed: {0}")]
    Conversion(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait MediaRenderer: Send + Sync {
    /// One image per slide, in slide order, written into `out_dir`.
    async fn render(
        &self,
        template: &Path,
        carousel: &CarouselContent,
        options: &RenderOptions,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>>;

    /// Convert one still into a short silent clip; returns the clip path.
    async fn to_video(&self, image: &Path) -> Result<PathBuf>;
}

pub fn slide_filename(slide: &Slide) -> String {
    format!("slide-{}.png", slide.id)
}

/// Pixel size of the template, or a square default when it cannot be read.
pub fn probe_dimensions(template: &Path) -> (u32, u32) {
    match imagesize::size(template) {
        Ok(size) if size.width > 0 && size.height > 0 => (size.width as u32, size.height as u32),
        Ok(_) => (DEFAULT_DIMENSION, DEFAULT_DIMENSION),
        Err(err) => {
            warn!(template = %template.display(), %err, "cannot probe template; using default size");
            (DEFAULT_DIMENSION, DEFAULT_DIMENSION)
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegRenderer {
    ffmpeg: PathBuf,
}

impl Default for FfmpegRenderer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegRenderer {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self { ffmpeg: ffmpeg.into() }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    async fn render_slide(
        &self,
        template: &Path,
        slide: &Slide,
        options: &RenderOptions,
        font: &Arc<FontVec>,
        dims: (u32, u32),
        out: &Path,
    ) -> Result<(), RenderError> {
        let (width, height) = dims;
        let block = layout::compute_lines(slide, options, width);
        let placed = layout::place_lines(&block, options, height);
        if placed.len() < block.lines.len() {
            debug!(slide = slide.id, kept = placed.len(), total = block.lines.len(), "text truncated");
        }
        let runs = layout::text_runs(&placed, options, width, |ch| {
            raster::advance(font, options.font_size, ch)
        });

        let primary = match filter::build_filter(&runs, options) {
            Some(f) => filter::run_ffmpeg(&self.ffmpeg, template, &f, out).await,
            None => Err(RenderError::Primary("text cannot be escaped for drawtext".into())),
        };
        let Err(primary_err) = primary else {
            return Ok(());
        };
        warn!(slide = slide.id, error = %primary_err, "primary render failed; drawing directly");

        let job = raster::RasterJob {
            template: template.to_path_buf(),
            out: out.to_path_buf(),
            runs,
            font: font.clone(),
            font_size: options.font_size,
            color: options.text_color.clone(),
        };
        tokio::task::spawn_blocking(move || raster::render(job))
            .await
            .map_err(|e| RenderError::Fallback(format!("render task panicked: {}", e)))?
    }
}

#[async_trait]
impl MediaRenderer for FfmpegRenderer {
    #[instrument(skip_all, fields(slides = carousel.slides.len()))]
    async fn render(
        &self,
        template: &Path,
        carousel: &CarouselContent,
        options: &RenderOptions,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(out_dir).await.map_err(RenderError::from)?;
        let dims = probe_dimensions(template);
        let font_path = options.font_file.clone();
        let font = tokio::task::spawn_blocking(move || raster::load_font(&font_path))
            .await
            .map_err(|e| RenderError::Font {
                path: options.font_file.clone(),
                reason: e.to_string(),
            })??;
        let font = Arc::new(font);

        let mut files = Vec::with_capacity(carousel.slides.len());
        for slide in &carousel.slides {
            let out = out_dir.join(slide_filename(slide));
            self.render_slide(template, slide, options, &font, dims, &out)
                .await
                .map_err(|e| anyhow::Error::new(e).context(format!("slide {} failed", slide.id)))?;
            files.push(out);
        }
        info!(count = files.len(), dir = %out_dir.display(), "slides rendered");
        Ok(files)
    }

    async fn to_video(&self, image: &Path) -> Result<PathBuf> {
        Ok(video::convert_to_video(&self.ffmpeg, image).await?)
    }
}
