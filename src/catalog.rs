//! Background video catalog: technical info, visual stats and inferred tags
//! for every `.mp4` in a directory, stored as `catalog.json`.

use crate::ffmpeg::{self, MediaInfo};
use anyhow::{Context, bail};
use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CATALOG_FILE: &str = "catalog.json";
const CATALOG_VERSION: &str = "1.0";
const SAMPLE_FRAMES: usize = 5;
const ANALYSIS_WIDTH: u32 = 320;
const THUMB_WIDTH: u32 = 480;
const THUMB_QUALITY: u8 = 85;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub version: String,
    pub last_updated: String,
    #[serde(default)]
    pub videos: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub filename: String,
    pub path: PathBuf,
    pub technical: Technical,
    pub visual: Visual,
    pub tags: Tags,
    pub thumbnail: Option<String>,
    pub analyzed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Technical {
    pub duration: f64,
    pub resolution: [u32; 2],
    pub fps: u32,
    pub orientation: Orientation,
    pub codec: String,
    pub file_size_mb: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Vertical,
    Horizontal,
    Square,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visual {
    pub dominant_colors: Vec<String>,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub motion_speed: Motion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Motion {
    Static,
    Slow,
    Medium,
    Fast,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tags {
    pub style: Vec<String>,
    pub mood: Vec<String>,
    pub text_friendly: bool,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn technical(info: &MediaInfo) -> Technical {
    let orientation = if info.height > info.width {
        Orientation::Vertical
    } else if info.width > info.height {
        Orientation::Horizontal
    } else {
        Orientation::Square
    };
    Technical {
        duration: info.duration,
        resolution: [info.width, info.height],
        fps: info.fps as u32,
        orientation,
        codec: if info.codec.is_empty() { "unknown".into() } else { info.codec.clone() },
        file_size_mb: round2(info.size_bytes as f64 / (1024.0 * 1024.0)),
    }
}

/// Evenly spaced sample times that stay clear of the first and last half second.
fn sample_times(duration: f64, count: usize) -> Vec<f64> {
    if count <= 1 {
        return vec![duration / 2.0];
    }
    let start = (0.5f64).min(duration * 0.1);
    let end = (duration - 0.5).max(duration * 0.9);
    let step = (end - start) / (count - 1) as f64;
    (0..count).map(|i| round2(start + step * i as f64)).collect()
}

fn luma(r: u8, g: u8, b: u8) -> f64 {
    0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64
}

fn gray(frame: &RgbaImage) -> Vec<f64> {
    frame.pixels().map(|p| luma(p[0], p[1], p[2])).collect()
}

/// Mean luma in 0..1.
pub fn brightness(frame: &RgbaImage) -> f64 {
    let g = gray(frame);
    if g.is_empty() {
        return 0.0;
    }
    round2(g.iter().sum::<f64>() / g.len() as f64 / 255.0)
}

/// Luma standard deviation over 128, capped at 1.
pub fn contrast(frame: &RgbaImage) -> f64 {
    let g = gray(frame);
    if g.is_empty() {
        return 0.0;
    }
    let mean = g.iter().sum::<f64>() / g.len() as f64;
    let var = g.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / g.len() as f64;
    round2((var.sqrt() / 128.0).min(1.0))
}

/// Mean HSV saturation in 0..1.
pub fn saturation(frame: &RgbaImage) -> f64 {
    let n = frame.pixels().len();
    if n == 0 {
        return 0.0;
    }
    let total: f64 = frame
        .pixels()
        .map(|p| {
            let max = p[0].max(p[1]).max(p[2]) as f64;
            let min = p[0].min(p[1]).min(p[2]) as f64;
            if max > 0.0 { (max - min) / max } else { 0.0 }
        })
        .sum();
    round2(total / n as f64)
}

fn motion_gray(frame: &RgbaImage) -> GrayImage {
    let small = imageops::resize(frame, 160, 90, FilterType::Triangle);
    DynamicImage::ImageRgba8(small).to_luma8()
}

pub fn classify_motion(score: f64) -> Motion {
    if score < 0.02 {
        Motion::Static
    } else if score < 0.06 {
        Motion::Slow
    } else if score < 0.15 {
        Motion::Medium
    } else {
        Motion::Fast
    }
}

/// Mean absolute difference between consecutive frames, classified.
pub fn motion(frames: &[RgbaImage]) -> Motion {
    if frames.len() < 2 {
        return Motion::Unknown;
    }
    let grays: Vec<GrayImage> = frames.iter().map(motion_gray).collect();
    let scores: Vec<f64> = grays
        .windows(2)
        .map(|pair| {
            let diff: f64 = pair[0]
                .as_raw()
                .iter()
                .zip(pair[1].as_raw())
                .map(|(a, b)| (*a as f64 - *b as f64).abs())
                .sum();
            diff / pair[0].as_raw().len().max(1) as f64 / 255.0
        })
        .collect();
    classify_motion(scores.iter().sum::<f64>() / scores.len() as f64)
}

fn dist2(a: [f64; 3], b: [f64; 3]) -> f64 {
    (0..3).map(|i| (a[i] - b[i]).powi(2)).sum()
}

/// Dominant colors by k-means over a 100x100 thumbnail, most common first.
pub fn dominant_colors(frame: &RgbaImage, k: usize) -> Vec<[u8; 3]> {
    let small = imageops::resize(frame, 100, 100, FilterType::Triangle);
    let mut pixels: Vec<[f64; 3]> = small
        .pixels()
        .map(|p| [p[0] as f64, p[1] as f64, p[2] as f64])
        .collect();
    if pixels.is_empty() || k == 0 {
        return Vec::new();
    }
    // Seed from luma quantiles so the result is deterministic.
    let key = |p: &[f64; 3]| 0.299 * p[0] + 0.587 * p[1] + 0.114 * p[2];
    pixels.sort_by(|a, b| key(a).total_cmp(&key(b)));
    let mut centers: Vec<[f64; 3]> = (0..k)
        .map(|i| pixels[(i * 2 + 1) * pixels.len() / (k * 2)])
        .collect();
    let mut labels = vec![0usize; pixels.len()];

    for _ in 0..20 {
        let mut changed = false;
        for (px, label) in pixels.iter().zip(labels.iter_mut()) {
            let best = (0..k)
                .min_by(|&a, &b| dist2(*px, centers[a]).total_cmp(&dist2(*px, centers[b])))
                .unwrap_or(0);
            if best != *label {
                *label = best;
                changed = true;
            }
        }
        let mut sums = vec![[0.0f64; 3]; k];
        let mut counts = vec![0usize; k];
        for (px, &label) in pixels.iter().zip(&labels) {
            for c in 0..3 {
                sums[label][c] += px[c];
            }
            counts[label] += 1;
        }
        for i in 0..k {
            if counts[i] > 0 {
                centers[i] = [
                    sums[i][0] / counts[i] as f64,
                    sums[i][1] / counts[i] as f64,
                    sums[i][2] / counts[i] as f64,
                ];
            }
        }
        if !changed {
            break;
        }
    }

    let mut counts = vec![0usize; k];
    for &label in &labels {
        counts[label] += 1;
    }
    let mut order: Vec<usize> = (0..k).filter(|&i| counts[i] > 0).collect();
    order.sort_by(|a, b| counts[*b].cmp(&counts[*a]));
    order
        .into_iter()
        .map(|i| centers[i].map(|c| c.clamp(0.0, 255.0) as u8))
        .collect()
}

pub fn to_hex(c: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", c[0], c[1], c[2])
}

pub fn infer_style(colors: &[[u8; 3]], brightness: f64, saturation: f64) -> Vec<String> {
    let mut styles = Vec::new();
    let n = colors.len().max(1) as f64;
    let avg = |c: usize| colors.iter().map(|rgb| rgb[c] as f64).sum::<f64>() / n;
    let (r, g, b) = (avg(0), avg(1), avg(2));

    if brightness < 0.35 {
        if colors.iter().any(|c| c[2] > c[0]) {
            styles.push("lofi");
        }
        if saturation > 0.5 && colors.iter().any(|c| c[1] < 100) {
            styles.push("cyberpunk");
        }
    }
    if saturation < 0.4 && r > b {
        styles.push("vintage");
    }
    if saturation > 0.6 && brightness > 0.3 {
        styles.push("neon");
    }
    if saturation < 0.25 {
        styles.push("minimal");
    }
    if !colors.is_empty() && g > r.max(b) {
        styles.push("nature");
    }
    if styles.is_empty() {
        styles.push(if brightness < 0.4 { "cinematic" } else { "abstract" });
    }
    styles.into_iter().take(2).map(String::from).collect()
}

pub fn infer_mood(brightness: f64, saturation: f64, motion: Motion, colors: &[[u8; 3]]) -> Vec<String> {
    fn add(moods: &mut Vec<&'static str>, m: &'static str) {
        if !moods.contains(&m) {
            moods.push(m);
        }
    }
    let mut moods = Vec::new();

    if brightness < 0.3 {
        add(&mut moods, "dark");
        add(&mut moods, "mysterious");
    } else if brightness < 0.5 {
        add(&mut moods, "calm");
    } else {
        add(&mut moods, "energetic");
    }

    match motion {
        Motion::Static | Motion::Slow => {
            add(&mut moods, "calm");
            add(&mut moods, "cozy");
        }
        Motion::Fast => add(&mut moods, "energetic"),
        _ => {}
    }

    if saturation < 0.3 {
        add(&mut moods, "melancholic");
    } else if saturation > 0.6 {
        add(&mut moods, "vibrant");
    }

    for &[r, g, b] in colors {
        if r > 180 && g < 150 && b < 150 {
            add(&mut moods, "romantic");
        }
        if b > r.max(g) && brightness < 0.4 {
            add(&mut moods, "sad");
        }
    }
    moods.into_iter().take(3).map(String::from).collect()
}

pub fn is_text_friendly(brightness: f64, contrast: f64, motion: Motion) -> bool {
    brightness > 0.15
        && brightness < 0.7
        && contrast > 0.15
        && matches!(motion, Motion::Static | Motion::Slow | Motion::Medium)
}

fn save_jpeg(frame: &RgbaImage, path: &Path) -> anyhow::Result<()> {
    let rgb = DynamicImage::ImageRgba8(frame.clone()).to_rgb8();
    let mut out = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut out, THUMB_QUALITY)
        .encode_image(&rgb)
        .with_context(|| format!("Failed to write thumbnail {}", path.display()))?;
    Ok(())
}

/// Full analysis of one video. `thumbs` is where the thumbnail goes.
pub fn analyze_video(path: &Path, thumbs: Option<&Path>) -> anyhow::Result<CatalogEntry> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Video path has no file name")?
        .to_string();
    info!("Analyzing {}", filename);

    let info = ffmpeg::probe(path)?;
    if info.width == 0 || info.height == 0 {
        bail!("No video stream in {}", path.display());
    }
    let technical = technical(&info);

    let times = sample_times(info.duration, SAMPLE_FRAMES);
    let mut frames = Vec::with_capacity(times.len());
    for &t in &times {
        match ffmpeg::extract_frame(path, t, Some(ANALYSIS_WIDTH)) {
            Ok(frame) => frames.push(frame),
            Err(e) => debug!("Skipping sample at {:.2}s: {:#}", t, e),
        }
    }
    if frames.is_empty() {
        bail!("Could not extract frames from {}", path.display());
    }

    let primary = &frames[frames.len() / 2];
    let colors = dominant_colors(primary, 3);
    let brightness = brightness(primary);
    let contrast = contrast(primary);
    let saturation = saturation(primary);
    let motion_speed = motion(&frames);

    let style = infer_style(&colors, brightness, saturation);
    let mood = infer_mood(brightness, saturation, motion_speed, &colors);
    let text_friendly = is_text_friendly(brightness, contrast, motion_speed);

    let thumbnail = match thumbs {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("thumb");
            let name = format!("{stem}.jpg");
            let t = times.get(2).copied().unwrap_or(info.duration / 2.0);
            match ffmpeg::extract_frame(path, t, Some(THUMB_WIDTH))
                .and_then(|frame| save_jpeg(&frame, &dir.join(&name)))
            {
                Ok(()) => Some(format!("thumbnails/{name}")),
                Err(e) => {
                    warn!("Thumbnail for {} failed: {:#}", filename, e);
                    None
                }
            }
        }
        None => None,
    };

    info!("  {} / {}", style.join(", "), mood.join(", "));
    Ok(CatalogEntry {
        filename,
        path: path.to_path_buf(),
        technical,
        visual: Visual {
            dominant_colors: colors.into_iter().map(to_hex).collect(),
            brightness,
            contrast,
            saturation,
            motion_speed,
        },
        tags: Tags { style, mood, text_friendly },
        thumbnail,
        analyzed_at: Local::now().to_rfc3339(),
    })
}

fn list_videos(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut videos: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read background directory {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("mp4"))
        })
        .collect();
    videos.sort();
    Ok(videos)
}

pub fn load_catalog(path: &Path) -> anyhow::Result<Catalog> {
    let raw = fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid catalog {}", path.display()))
}

pub fn save_catalog(path: &Path, catalog: &Catalog) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("Cannot write {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), catalog)?;
    Ok(())
}

/// Analyzes every `.mp4` in `dir` and writes `dir/catalog.json`. Entries
/// already in the catalog are kept unless `force` is set.
pub fn scan(dir: &Path, force: bool) -> anyhow::Result<Catalog> {
    let videos = list_videos(dir)?;
    info!("Found {} video files in {}", videos.len(), dir.display());

    let catalog_path = dir.join(CATALOG_FILE);
    let mut known: HashMap<String, CatalogEntry> = HashMap::new();
    if !force && catalog_path.exists() {
        match load_catalog(&catalog_path) {
            Ok(existing) => {
                known = existing.videos.into_iter().map(|e| (e.filename.clone(), e)).collect();
            }
            Err(e) => warn!("Ignoring unreadable catalog: {:#}", e),
        }
    }

    let thumbs = dir.join("thumbnails");
    let entries: Vec<Option<CatalogEntry>> = videos
        .par_iter()
        .map(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if let Some(entry) = known.get(name) {
                debug!("Keeping catalog entry for {}", name);
                return Some(entry.clone());
            }
            match analyze_video(path, Some(&thumbs)) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping {}: {:#}", path.display(), e);
                    None
                }
            }
        })
        .collect();

    let catalog = Catalog {
        version: CATALOG_VERSION.to_string(),
        last_updated: Local::now().to_rfc3339(),
        videos: entries.into_iter().flatten().collect(),
    };
    save_catalog(&catalog_path, &catalog)?;
    info!("Catalog saved to {} ({} videos)", catalog_path.display(), catalog.videos.len());
    Ok(catalog)
}

/// Background rotation order: catalog order when `catalog.json` exists,
/// otherwise the sorted `.mp4` files.
pub fn background_order(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let catalog_path = dir.join(CATALOG_FILE);
    if catalog_path.exists() {
        let catalog = load_catalog(&catalog_path)?;
        let paths: Vec<PathBuf> = catalog
            .videos
            .iter()
            .map(|e| dir.join(&e.filename))
            .filter(|p| p.exists())
            .collect();
        if !paths.is_empty() {
            debug!("Using catalog order for {} backgrounds", paths.len());
            return Ok(paths);
        }
        warn!("Catalog in {} lists no existing videos; falling back to directory listing", dir.display());
    }
    list_videos(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    #[test]
    fn sample_times_avoid_edges() {
        assert_eq!(sample_times(10.0, 5), vec![0.5, 2.75, 5.0, 7.25, 9.5]);
        let short = sample_times(2.0, 5);
        assert_eq!(short[0], 0.2);
        assert_eq!(short[4], 1.8);
    }

    #[test]
    fn stats_of_solid_frames() {
        let white = solid(10, 10, [255, 255, 255]);
        assert_eq!(brightness(&white), 1.0);
        assert_eq!(contrast(&white), 0.0);
        assert_eq!(saturation(&white), 0.0);
        let red = solid(10, 10, [255, 0, 0]);
        assert_eq!(saturation(&red), 1.0);
        assert_eq!(brightness(&red), 0.3);
    }

    #[test]
    fn contrast_of_split_frame() {
        let mut img = solid(10, 10, [0, 0, 0]);
        for y in 0..10 {
            for x in 5..10 {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        assert_eq!(contrast(&img), 1.0);
        assert_eq!(brightness(&img), 0.5);
    }

    #[test]
    fn motion_classes() {
        let black = solid(32, 18, [0, 0, 0]);
        let white = solid(32, 18, [255, 255, 255]);
        assert_eq!(motion(&[black.clone()]), Motion::Unknown);
        assert_eq!(motion(&[black.clone(), black.clone()]), Motion::Static);
        assert_eq!(motion(&[black, white]), Motion::Fast);
        assert_eq!(classify_motion(0.03), Motion::Slow);
        assert_eq!(classify_motion(0.1), Motion::Medium);
    }

    #[test]
    fn dominant_colors_are_ordered_by_area() {
        let mut img = solid(100, 100, [10, 20, 200]);
        for y in 0..30 {
            for x in 0..100 {
                img.put_pixel(x, y, Rgba([250, 250, 250, 255]));
            }
        }
        let colors = dominant_colors(&img, 3);
        assert_eq!(colors.len(), 2);
        let close = |a: [u8; 3], b: [u8; 3]| (0..3).all(|i| a[i].abs_diff(b[i]) <= 8);
        assert!(close(colors[0], [10, 20, 200]));
        assert!(close(colors[1], [250, 250, 250]));
    }

    #[test]
    fn hex_colors() {
        assert_eq!(to_hex([10, 20, 200]), "#0a14c8");
    }

    #[test]
    fn style_rules() {
        let dark_blue = [[20, 20, 120]];
        assert_eq!(infer_style(&dark_blue, 0.2, 0.3), vec!["lofi"]);
        let warm_gray = [[120, 110, 100]];
        assert_eq!(infer_style(&warm_gray, 0.5, 0.1), vec!["vintage", "minimal"]);
        let green = [[40, 200, 60]];
        assert_eq!(infer_style(&green, 0.5, 0.5), vec!["nature"]);
        assert_eq!(infer_style(&[[100, 100, 100]], 0.2, 0.5), vec!["cinematic"]);
        assert_eq!(infer_style(&[[100, 100, 100]], 0.6, 0.5), vec!["abstract"]);
    }

    #[test]
    fn mood_rules_are_capped_and_unique() {
        let moods = infer_mood(0.2, 0.2, Motion::Slow, &[[10, 10, 90]]);
        assert_eq!(moods, vec!["dark", "mysterious", "calm"]);
        let moods = infer_mood(0.4, 0.5, Motion::Static, &[]);
        assert_eq!(moods, vec!["calm", "cozy"]);
        let moods = infer_mood(0.6, 0.7, Motion::Fast, &[[220, 40, 40]]);
        assert_eq!(moods, vec!["energetic", "vibrant", "romantic"]);
    }

    #[test]
    fn text_friendliness() {
        assert!(is_text_friendly(0.4, 0.3, Motion::Medium));
        assert!(!is_text_friendly(0.8, 0.3, Motion::Slow));
        assert!(!is_text_friendly(0.4, 0.1, Motion::Slow));
        assert!(!is_text_friendly(0.4, 0.3, Motion::Fast));
    }

    #[test]
    fn orientation_from_probe() {
        let info = MediaInfo {
            duration: 3.0,
            width: 1080,
            height: 1920,
            fps: 29.97,
            codec: "h264".into(),
            size_bytes: 3 * 1024 * 1024 / 2,
            has_audio: false,
        };
        let tech = technical(&info);
        assert_eq!(tech.orientation, Orientation::Vertical);
        assert_eq!(tech.fps, 29);
        assert_eq!(tech.file_size_mb, 1.5);
    }

    #[test]
    fn background_order_prefers_catalog() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mp4", "b.mp4", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(
            background_order(dir.path()).unwrap(),
            vec![dir.path().join("a.mp4"), dir.path().join("b.mp4")]
        );

        let entry = |name: &str| CatalogEntry {
            filename: name.into(),
            path: dir.path().join(name),
            technical: Technical {
                duration: 1.0,
                resolution: [1080, 1920],
                fps: 30,
                orientation: Orientation::Vertical,
                codec: "h264".into(),
                file_size_mb: 0.0,
            },
            visual: Visual {
                dominant_colors: vec![],
                brightness: 0.5,
                contrast: 0.5,
                saturation: 0.5,
                motion_speed: Motion::Slow,
            },
            tags: Tags { style: vec![], mood: vec![], text_friendly: true },
            thumbnail: None,
            analyzed_at: String::new(),
        };
        let catalog = Catalog {
            version: CATALOG_VERSION.into(),
            last_updated: String::new(),
            videos: vec![entry("b.mp4"), entry("gone.mp4"), entry("a.mp4")],
        };
        save_catalog(&dir.path().join(CATALOG_FILE), &catalog).unwrap();
        assert_eq!(
            background_order(dir.path()).unwrap(),
            vec![dir.path().join("b.mp4"), dir.path().join("a.mp4")]
        );
    }
}
