//! Text layout shared by both render paths.
//!
//! Lines are wrapped by an approximate character width, placed top-down
//! between the margins, then split into positioned runs. The ffmpeg path and
//! the raster path draw the exact same runs.
use crate::model::{RenderOptions, Slide};
use std::collections::BTreeSet;

pub const BULLET_PREFIX: &str = "\u{2022} ";

/// Greedy word wrap by character count. A word longer than `max_chars`
/// gets a line of its own.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let tentative_len = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if tentative_len > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            current.push_str(word);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Characters per line for a canvas `width` pixels wide.
pub fn max_chars(options: &RenderOptions, width: u32) -> usize {
    let available = width as f64 - (options.margin_left as f64 + options.margin_right as f64);
    let approx_char_width = options.font_size as f64 * 0.6 + options.letter_spacing as f64;
    if approx_char_width <= 0.0 {
        return 1;
    }
    ((available / approx_char_width).floor() as i64).max(1) as usize
}

pub fn line_height(options: &RenderOptions) -> u32 {
    options.font_size * 11 / 10
}

/// Wrapped lines of one slide, plus the indices after which a paragraph ends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineBlock {
    pub lines: Vec<String>,
    pub breaks: BTreeSet<usize>,
}

impl LineBlock {
    fn push_paragraph(&mut self, wrapped: Vec<String>) {
        if wrapped.is_empty() {
            return;
        }
        self.lines.extend(wrapped);
        self.breaks.insert(self.lines.len() - 1);
    }
}

pub fn compute_lines(slide: &Slide, options: &RenderOptions, width: u32) -> LineBlock {
    let max = max_chars(options, width);
    let mut block = LineBlock::default();
    block.push_paragraph(wrap_text(&slide.title, max));
    if let Some(subtitle) = slide.subtitle.as_deref().filter(|s| !s.is_empty()) {
        block.push_paragraph(wrap_text(subtitle, max));
    }
    for bullet in slide.bullets.iter().flatten() {
        block.push_paragraph(wrap_text(&format!("{}{}", BULLET_PREFIX, bullet), max));
    }
    block
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedLine {
    pub text: String,
    pub y: i64,
}

/// Assign a y position to each line, starting at the top margin. Lines that
/// would cross the bottom margin are dropped.
pub fn place_lines(block: &LineBlock, options: &RenderOptions, height: u32) -> Vec<PlacedLine> {
    let lh = line_height(options) as i64;
    let limit = height as i64 - options.margin_bottom as i64 - lh;
    let mut y = options.margin_top as i64;
    let mut placed = Vec::with_capacity(block.lines.len());
    for (i, line) in block.lines.iter().enumerate() {
        placed.push(PlacedLine {
            text: line.clone(),
            y,
        });
        y += lh;
        if block.breaks.contains(&i) {
            y += options.paragraph_spacing as i64;
        }
        if y > limit {
            break;
        }
    }
    placed
}

/// A piece of text drawn at a fixed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    pub x: i64,
    pub y: i64,
}

/// Split placed lines into drawable runs. Without letter spacing each line is
/// one run; with it, each character is its own run advanced by its measured
/// width plus the spacing, stopping once the cursor passes the line width.
pub fn text_runs<F>(placed: &[PlacedLine], options: &RenderOptions, width: u32, measure: F) -> Vec<TextRun>
where
    F: Fn(char) -> f32,
{
    let x0 = options.margin_left as i64;
    if options.letter_spacing == 0 {
        return placed
            .iter()
            .map(|line| TextRun {
                text: line.text.clone(),
                x: x0,
                y: line.y,
            })
            .collect();
    }

    let max_width = width as f32 - (options.margin_left + options.margin_right) as f32;
    let spacing = options.letter_spacing as f32;
    let mut runs = Vec::new();
    for line in placed {
        let mut cursor = 0.0_f32;
        for ch in line.text.chars() {
            if !ch.is_whitespace() {
                runs.push(TextRun {
                    text: ch.to_string(),
                    x: x0 + cursor.round() as i64,
                    y: line.y,
                });
            }
            cursor += measure(ch) + spacing;
            if cursor > max_width {
                break;
            }
        }
    }
    runs
}
