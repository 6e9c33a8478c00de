//! Primary render path: ffmpeg `drawtext` over the template image.
use super::layout::TextRun;
use super::RenderError;
use crate::model::RenderOptions;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Escape a value for a `drawtext` option inside a filtergraph passed as a
/// single argument (no shell). Returns `None` for text that cannot be
/// expressed safely, such as control characters.
pub fn escape_drawtext(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len() * 2);
    for ch in value.chars() {
        match ch {
            c if c.is_control() => return None,
            '\\' => out.push_str("\\\\\\\\"),
            '\'' => out.push_str("\\\\\\'"),
            ':' => out.push_str("\\\\:"),
            ',' | ';' | '[' | ']' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            c => out.push(c),
        }
    }
    Some(out)
}

/// One `drawtext` per run, chained. `None` if any run cannot be escaped.
pub fn build_filter(runs: &[TextRun], options: &RenderOptions) -> Option<String> {
    if runs.is_empty() {
        return Some("null".to_string());
    }
    let font = escape_drawtext(&options.font_file.to_string_lossy())?;
    let color = escape_drawtext(&options.text_color)?;
    let mut filters = Vec::with_capacity(runs.len());
    for run in runs {
        let text = escape_drawtext(&run.text)?;
        filters.push(format!(
            "drawtext=fontfile={}:text={}:expansion=none:x={}:y={}:fontsize={}:fontcolor={}",
            font, text, run.x, run.y, options.font_size, color
        ));
    }
    Some(filters.join(","))
}

/// Render a single frame of `template` with `filter` applied into `out`.
pub async fn run_ffmpeg(ffmpeg: &Path, template: &Path, filter: &str, out: &Path) -> Result<(), RenderError> {
    debug!(out = %out.display(), filters = filter.matches("drawtext").count(), "ffmpeg drawtext");
    let output = Command::new(ffmpeg)
        .arg("-y")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(template.as_os_str())
        .arg("-vf")
        .arg(filter)
        .arg("-frames:v")
        .arg("1")
        .arg(out.as_os_str())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RenderError::Primary(format!("failed to spawn ffmpeg: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RenderError::Primary(format!(
            "ffmpeg exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if !tokio::fs::try_exists(out).await.unwrap_or(false) {
        return Err(RenderError::Primary(format!("ffmpeg produced no {}", out.display())));
    }
    Ok(())
}
