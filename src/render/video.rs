use super::RenderError;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub const CLIP_SECONDS: u32 = 5;

/// Ensure the `ffmpeg` binary can be invoked.
pub async fn ensure_ffmpeg_available(ffmpeg: &Path) -> Result<()> {
    let status = Command::new(ffmpeg)
        .arg("-version")
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(anyhow!("ffmpeg not available (exit status {})", s)),
        Err(e) => Err(anyhow!("ffmpeg not available: {}", e)),
    }
}

/// `slide-1.png` -> `slide-1.mp4`, next to the image.
pub fn video_path_for(image: &Path) -> PathBuf {
    image.with_extension("mp4")
}

/// Loop a still image into a silent H.264 clip.
pub async fn convert_to_video(ffmpeg: &Path, image: &Path) -> Result<PathBuf, RenderError> {
    let out = video_path_for(image);
    let output = Command::new(ffmpeg)
        .arg("-y")
        .arg("-loglevel")
        .arg("error")
        .arg("-loop")
        .arg("1")
        .arg("-i")
        .arg(image.as_os_str())
        .arg("-t")
        .arg(CLIP_SECONDS.to_string())
        .arg("-c:v")
        .arg("libx264")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-r")
        .arg("30")
        .arg("-movflags")
        .arg("+faststart")
        .arg("-an")
        .arg(out.as_os_str())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RenderError::Conversion(format!("failed to spawn ffmpeg: {}", e)))?;

    if !output.status.success() {
        return Err(RenderError::Conversion(format!(
            "ffmpeg exited with status {} for {}: {}",
            output.status,
            image.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if !tokio::fs::try_exists(&out).await.unwrap_or(false) {
        return Err(RenderError::Conversion(format!("video {} was not created", out.display())));
    }
    Ok(out)
}
