//! Fallback render path: draw the runs straight onto a decoded template.
use super::layout::TextRun;
use super::RenderError;
use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_text_mut;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parse `#rgb`, `#rrggbb`, `#rrggbbaa` (with or without `#`/`0x`) or a few
/// common color names.
pub fn parse_color(value: &str) -> Option<Rgba<u8>> {
    let v = value.trim().to_ascii_lowercase();
    let named = match v.as_str() {
        "white" => Some([255, 255, 255, 255]),
        "black" => Some([0, 0, 0, 255]),
        "red" => Some([255, 0, 0, 255]),
        "green" => Some([0, 128, 0, 255]),
        "blue" => Some([0, 0, 255, 255]),
        "yellow" => Some([255, 255, 0, 255]),
        _ => None,
    };
    if let Some(px) = named {
        return Some(Rgba(px));
    }

    let hex = v
        .strip_prefix('#')
        .or_else(|| v.strip_prefix("0x"))
        .unwrap_or(&v);
    let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        3 => {
            let mut px = [255u8; 4];
            for (i, c) in hex.chars().enumerate() {
                let d = c.to_digit(16)? as u8;
                px[i] = d * 17;
            }
            Some(Rgba(px))
        }
        6 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Some(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => None,
    }
}

/// Horizontal advance of `ch` at `font_size` pixels.
pub fn advance(font: &FontVec, font_size: u32, ch: char) -> f32 {
    let scaled = font.as_scaled(PxScale::from(font_size as f32));
    scaled.h_advance(font.glyph_id(ch))
}

pub fn load_font(path: &Path) -> Result<FontVec, RenderError> {
    let bytes = std::fs::read(path).map_err(|e| RenderError::Font {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    FontVec::try_from_vec(bytes).map_err(|e| RenderError::Font {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Everything the blocking draw needs, owned.
pub struct RasterJob {
    pub template: PathBuf,
    pub out: PathBuf,
    pub runs: Vec<TextRun>,
    pub font: Arc<FontVec>,
    pub font_size: u32,
    pub color: String,
}

pub fn render(job: RasterJob) -> Result<(), RenderError> {
    let color = parse_color(&job.color)
        .ok_or_else(|| RenderError::Fallback(format!("unsupported color {:?}", job.color)))?;
    let mut canvas: RgbaImage = image::open(&job.template)
        .map_err(|source| RenderError::Template {
            path: job.template.clone(),
            source,
        })?
        .to_rgba8();
    let scale = PxScale::from(job.font_size as f32);
    for run in &job.runs {
        draw_text_mut(
            &mut canvas,
            color,
            run.x as i32,
            run.y as i32,
            scale,
            &*job.font,
            &run.text,
        );
    }
    canvas
        .save(&job.out)
        .map_err(|e| RenderError::Fallback(format!("failed to write {}: {}", job.out.display(), e)))
}
