//! Per-frame compositing: subtitle words, glow, shadows, image overlays,
//! background crossfades and the freeze-frame effect.

use crate::easing::{clamp01, ease_in_out, ease_out_back};
use crate::font::FontBank;
use crate::layout::{LaidPage, PlacedWord, is_orphan_word};
use crate::markup::Rgb;
use anyhow::Context;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgba, RgbaImage};
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

pub const WIDTH: u32 = 1080;
pub const HEIGHT: u32 = 1920;
pub const BACKDROP: Rgb = Rgb(15, 15, 20);
pub const BG_CROSSFADE: f64 = 0.3;

const POP_DURATION: f64 = 0.25;
const POP_OFFSET: f64 = 20.0;
const SHADOW_OFFSET: f32 = 4.0;
const SHADOW_ALPHA: f32 = 200.0 / 255.0;
const GLOW_ALPHA: f32 = 100.0 / 255.0;
const GLOW_PAD: u32 = 36;
const GLOW_SPREAD: i32 = 3;
const GLOW_SIGMA: f32 = 10.0;

const IMAGE_BOX: u32 = 760;
const IMAGE_CENTER_Y: f64 = 400.0;
const IMAGE_POP: f64 = 0.4;
const IMAGE_FADE_IN: f64 = 0.2;
const IMAGE_FADE_OUT: f64 = 0.3;
const IMAGE_ZOOM: f64 = 0.08;
const IMAGE_DRIFT: f64 = 30.0;

const FREEZE_ZOOM: f64 = 0.05;
const FREEZE_DIM: f64 = 0.4;

pub fn blend(px: &mut Rgba<u8>, color: Rgb, alpha: f32) {
    let a = alpha.clamp(0.0, 1.0);
    if a <= 0.0 {
        return;
    }
    let mix = |dst: u8, src: u8| (src as f32 * a + dst as f32 * (1.0 - a)).round() as u8;
    px.0 = [mix(px.0[0], color.0), mix(px.0[1], color.1), mix(px.0[2], color.2), 255];
}

fn blend_at(frame: &mut RgbaImage, x: i32, y: i32, color: Rgb, alpha: f32) {
    if x < 0 || y < 0 || x as u32 >= frame.width() || y as u32 >= frame.height() {
        return;
    }
    blend(frame.get_pixel_mut(x as u32, y as u32), color, alpha);
}

pub fn solid_frame(color: Rgb) -> RgbaImage {
    RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([color.0, color.1, color.2, 255]))
}

/// Time each page takes over the screen. A page with words starts with its
/// first word; an image-only page starts once the previous page's last word
/// has ended.
pub fn page_starts(pages: &[LaidPage]) -> Vec<f64> {
    let mut starts = Vec::with_capacity(pages.len());
    let mut prev_end = 0.0;
    for page in pages {
        let start = page.start().unwrap_or(prev_end);
        starts.push(start);
        prev_end = page
            .words
            .iter()
            .map(|w| w.word.end.max(w.word.start))
            .fold(start, f64::max);
    }
    starts
}

/// Index of the last page whose start has passed (page 0 before that).
pub fn current_page(starts: &[f64], t: f64) -> usize {
    starts.iter().rposition(|&s| s <= t).unwrap_or(0)
}

/// Indices of the words of `page` shown at `t`.
///
/// An orphan word waits for the next word when it would otherwise sit alone
/// on its row.
pub fn visible_words(page: &LaidPage, t: f64) -> Vec<usize> {
    let mut visible = Vec::new();
    for (idx, placed) in page.words.iter().enumerate() {
        if t < placed.word.start {
            continue;
        }
        if is_orphan_word(&placed.word.text) {
            if let Some(next) = page.words.get(idx + 1) {
                if t < next.word.start {
                    let has_company = page.words[..idx]
                        .iter()
                        .any(|o| o.row == placed.row && t >= o.word.start);
                    if !has_company {
                        continue;
                    }
                }
            }
        }
        visible.push(idx);
    }
    visible
}

/// (eased progress, vertical offset in px) of a word's pop-in at `t`.
pub fn pop_in(start: f64, t: f64) -> (f64, f64) {
    let eased = ease_out_back(clamp01((t - start) / POP_DURATION));
    (eased, (1.0 - eased) * POP_OFFSET)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayPose {
    pub scale: f64,
    pub center_y: f64,
    pub alpha: f64,
}

/// Pop-in, slow drift/zoom and fade-out of a page image over its window.
pub fn overlay_pose(window: (f64, f64), t: f64) -> Option<OverlayPose> {
    let (start, end) = window;
    let local = t - start;
    if local < 0.0 || t > end {
        return None;
    }
    let pop = ease_out_back(clamp01(local / IMAGE_POP));
    let drift = ease_in_out(local / (end - start).max(1e-3));
    let alpha = clamp01(local / IMAGE_FADE_IN).min(clamp01((end - t) / IMAGE_FADE_OUT));
    let scale = (0.6 + 0.4 * pop) * (1.0 + IMAGE_ZOOM * drift);
    if alpha <= 0.0 || scale <= 0.0 {
        return None;
    }
    Some(OverlayPose {
        scale,
        center_y: IMAGE_CENTER_Y - IMAGE_DRIFT * drift,
        alpha,
    })
}

/// Loads an overlay image scaled to fit the overlay box.
pub fn load_overlay(path: &Path) -> anyhow::Result<RgbaImage> {
    let img = image::open(path)
        .with_context(|| format!("Cannot open overlay image '{}'", path.display()))?
        .to_rgba8();
    let (w, h) = img.dimensions();
    let fit = (IMAGE_BOX as f64 / w.max(1) as f64).min(IMAGE_BOX as f64 / h.max(1) as f64);
    let (nw, nh) = (
        ((w as f64 * fit).round() as u32).max(1),
        ((h as f64 * fit).round() as u32).max(1),
    );
    Ok(imageops::resize(&img, nw, nh, FilterType::Lanczos3))
}

/// Last hook frame, slowly zoomed in and dimmed as `progress` goes 0 → 1.
pub fn freeze(src: &RgbaImage, progress: f64) -> RgbaImage {
    let p = ease_in_out(progress);
    let zoom = 1.0 + FREEZE_ZOOM * p;
    let (w, h) = src.dimensions();
    let (cw, ch) = ((w as f64 / zoom).round() as u32, (h as f64 / zoom).round() as u32);
    let mut out = if cw < w || ch < h {
        let crop = imageops::crop_imm(src, (w - cw) / 2, (h - ch) / 2, cw, ch).to_image();
        imageops::resize(&crop, w, h, FilterType::Triangle)
    } else {
        src.clone()
    };
    let dim = (1.0 - FREEZE_DIM * p) as f32;
    for px in out.pixels_mut() {
        for c in 0..3 {
            px.0[c] = (px.0[c] as f32 * dim).round() as u8;
        }
    }
    out
}

/// Blends `from` into `to` in place; `progress` 0 shows `from`, 1 shows `to`.
pub fn crossfade(from: &RgbaImage, to: &mut RgbaImage, progress: f64) {
    let p = clamp01(progress) as f32;
    for (dst, src) in to.pixels_mut().zip(from.pixels()) {
        for c in 0..3 {
            dst.0[c] = (src.0[c] as f32 * (1.0 - p) + dst.0[c] as f32 * p).round() as u8;
        }
    }
}

struct GlowMask {
    mask: GrayImage,
    left: i32,
    top: i32,
}

/// Subtitle and overlay painter for the main-content segment.
pub struct Compositor {
    fonts: FontBank,
    pages: Vec<LaidPage>,
    glows: Vec<Vec<Option<GlowMask>>>,
    overlays: Vec<Option<RgbaImage>>,
    starts: Vec<f64>,
    windows: Vec<(f64, f64)>,
}

impl Compositor {
    pub fn new(fonts: FontBank, pages: Vec<LaidPage>, overlays: Vec<Option<RgbaImage>>, end: f64) -> Self {
        let glows: Vec<Vec<Option<GlowMask>>> = pages
            .par_iter()
            .map(|page| {
                page.words
                    .iter()
                    .map(|w| w.word.style.glows().then(|| build_glow(&fonts, w)))
                    .collect()
            })
            .collect();
        let starts = page_starts(&pages);
        let windows = page_windows(&starts, end);
        debug!("Prepared glow masks for {} pages", glows.len());
        Compositor {
            fonts,
            pages,
            glows,
            overlays,
            starts,
            windows,
        }
    }

    pub fn pages(&self) -> &[LaidPage] {
        &self.pages
    }

    pub fn page_at(&self, t: f64) -> usize {
        current_page(&self.starts, t)
    }

    /// Draws the page image and subtitles for main-content time `t`.
    pub fn draw(&self, frame: &mut RgbaImage, t: f64) {
        if self.pages.is_empty() {
            return;
        }
        let idx = self.page_at(t);
        if let (Some(Some(img)), Some(window)) = (self.overlays.get(idx), self.windows.get(idx)) {
            if let Some(pose) = overlay_pose(*window, t) {
                draw_overlay(frame, img, pose);
            }
        }
        self.draw_words(frame, idx, t);
    }

    fn draw_words(&self, frame: &mut RgbaImage, page_idx: usize, t: f64) {
        let page = &self.pages[page_idx];
        let visible = visible_words(page, t);

        for &i in &visible {
            let placed = &page.words[i];
            let (eased, offset) = pop_in(placed.word.start, t);
            if let Some(Some(glow)) = self.glows[page_idx].get(i) {
                let alpha = GLOW_ALPHA * eased.clamp(0.0, 1.0) as f32;
                let left = placed.x as i32 + glow.left;
                let top = (placed.y as f64 + offset) as i32 + glow.top;
                for (mx, my, Luma([m])) in glow.mask.enumerate_pixels() {
                    if *m > 0 {
                        blend_at(frame, left + mx as i32, top + my as i32, placed.word.color, alpha * *m as f32 / 255.0);
                    }
                }
            }
        }

        for &i in &visible {
            let placed = &page.words[i];
            let (eased, offset) = pop_in(placed.word.start, t);
            let alpha = eased.clamp(0.0, 1.0) as f32;
            let x = placed.x.floor();
            let y = (placed.y as f64 + offset).trunc() as f32;
            let text = &placed.word.text;
            let size = placed.word.size;

            self.fonts.for_each_pixel(text, size, x + SHADOW_OFFSET, y + SHADOW_OFFSET, |px, py, cov| {
                blend_at(frame, px, py, Rgb(0, 0, 0), cov * SHADOW_ALPHA * alpha)
            });
            self.fonts.for_each_pixel(text, size, x, y, |px, py, cov| {
                blend_at(frame, px, py, placed.word.color, cov * alpha)
            });
        }
    }
}

fn page_windows(starts: &[f64], end: f64) -> Vec<(f64, f64)> {
    (0..starts.len())
        .map(|i| (starts[i], starts.get(i + 1).copied().unwrap_or(end).max(starts[i])))
        .collect()
}

fn build_glow(fonts: &FontBank, placed: &PlacedWord) -> GlowMask {
    let w = placed.width.ceil() as u32 + 2 * GLOW_PAD;
    let h = placed.height.ceil() as u32 + 2 * GLOW_PAD;
    let mut layer = GrayImage::new(w, h);
    for dx in [-GLOW_SPREAD, 0, GLOW_SPREAD] {
        for dy in [-GLOW_SPREAD, 0, GLOW_SPREAD] {
            let ox = (GLOW_PAD as i32 + dx) as f32;
            let oy = (GLOW_PAD as i32 + dy) as f32;
            fonts.for_each_pixel(&placed.word.text, placed.word.size, ox, oy, |px, py, cov| {
                if px >= 0 && py >= 0 && (px as u32) < w && (py as u32) < h {
                    let v = (cov * 255.0) as u8;
                    let cell = layer.get_pixel_mut(px as u32, py as u32);
                    cell.0[0] = cell.0[0].max(v);
                }
            });
        }
    }
    let mut mask = imageops::blur(&layer, GLOW_SIGMA);
    let peak = mask.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    if peak > 0 && peak < 255 {
        let gain = 255.0 / peak as f32;
        for p in mask.pixels_mut() {
            p.0[0] = (p.0[0] as f32 * gain).min(255.0) as u8;
        }
    }
    GlowMask {
        mask,
        left: -(GLOW_PAD as i32),
        top: -(GLOW_PAD as i32),
    }
}

fn draw_overlay(frame: &mut RgbaImage, img: &RgbaImage, pose: OverlayPose) {
    let nw = ((img.width() as f64 * pose.scale).round() as u32).max(1);
    let nh = ((img.height() as f64 * pose.scale).round() as u32).max(1);
    let scaled = imageops::resize(img, nw, nh, FilterType::Triangle);
    let left = (WIDTH as f64 / 2.0 - nw as f64 / 2.0).round() as i32;
    let top = (pose.center_y - nh as f64 / 2.0).round() as i32;
    for (x, y, px) in scaled.enumerate_pixels() {
        let a = px.0[3] as f32 / 255.0 * pose.alpha as f32;
        blend_at(frame, left + x as i32, top + y as i32, Rgb(px.0[0], px.0[1], px.0[2]), a);
    }
}
