//! Render pipeline: parse → align → layout → composite frames in parallel →
//! encode with the mixed audio in a single ffmpeg process.
//!
//! Frame sources (hook video, backgrounds) are decoded sequentially because
//! they are ffmpeg pipes; the per-frame compositing of each batch runs on a
//! rayon pool and results are written back in order.

use crate::align::{apply_timestamps, load_timestamps};
use crate::args::RenderArgs;
use crate::audio::media_duration;
use crate::compose::{self, BACKDROP, BG_CROSSFADE, Compositor, HEIGHT, WIDTH};
use crate::config::Settings;
use crate::ffmpeg::{self, Encoder, FrameReader, VideoFormat};
use crate::font::FontBank;
use crate::layout::{LaidPage, TextArea, layout_script};
use crate::markup::parse_script;
use crate::timeline::{AudioPlan, CROSSFADE, Segment, Timeline};
use anyhow::{Context, bail};
use image::RgbaImage;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RenderJob {
    pub script: PathBuf,
    pub audio: PathBuf,
    pub timestamps: PathBuf,
    pub output: PathBuf,
    pub backgrounds: Vec<PathBuf>,
    pub hook: Option<PathBuf>,
    pub hook_max: Option<f64>,
    pub freeze: f64,
    pub music: Option<PathBuf>,
    pub music_volume: f64,
    pub font: PathBuf,
    pub fps: u32,
    pub threads: Option<usize>,
    pub preset: String,
    pub srt: Option<PathBuf>,
}

impl RenderJob {
    /// Command-line flags win over settings; settings win over built-in defaults.
    pub fn from_args(args: RenderArgs, settings: &Settings) -> anyhow::Result<Self> {
        let mut backgrounds = args.backgrounds;
        if let Some(dir) = &args.bg_dir {
            backgrounds.extend(crate::catalog::background_order(dir)?);
        }
        Ok(RenderJob {
            timestamps: args
                .timestamps
                .unwrap_or_else(|| crate::transcribe::default_output_path(&args.audio)),
            output: args.output.unwrap_or_else(|| args.script.with_extension("mp4")),
            script: args.script,
            audio: args.audio,
            backgrounds,
            hook: args.hook,
            hook_max: args.hook_max,
            freeze: args.freeze.unwrap_or(settings.freeze),
            music: args.music,
            music_volume: args.music_volume.unwrap_or(settings.music_volume),
            font: args.font.unwrap_or_else(|| settings.font.clone()),
            fps: args.fps.unwrap_or(settings.fps),
            threads: args.threads,
            preset: settings.preset.clone(),
            srt: args.srt,
        })
    }
}

pub fn resolve_threads(threads: Option<usize>) -> usize {
    threads.filter(|&n| n > 0).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    })
}

pub fn make_progress_bar(total_frames: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total_frames);
    let style = ProgressStyle::with_template(&format!(
        "{label} {{bar:40.cyan/blue}} {{pos}}/{{len}} [{{elapsed_precise}}<{{eta_precise}}, {{msg}}]"
    ))
    .map(|s| s.progress_chars("##-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Relative image paths are tried as given, then next to the script.
fn resolve_image(path: &Path, script_dir: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        path.to_path_buf()
    } else {
        script_dir.join(path)
    }
}

fn load_overlays(pages: &[LaidPage], script_dir: &Path) -> Vec<Option<RgbaImage>> {
    pages
        .par_iter()
        .map(|page| {
            let path = resolve_image(page.image.as_deref()?, script_dir);
            match compose::load_overlay(&path) {
                Ok(img) => Some(img),
                Err(e) => {
                    warn!("Skipping overlay: {:#}", e);
                    None
                }
            }
        })
        .collect()
}

fn log_preview(pages: &[LaidPage]) {
    info!("Layout: {} pages", pages.len());
    let starts = compose::page_starts(pages);
    for (i, (page, &start)) in pages.iter().zip(&starts).enumerate() {
        let text: Vec<&str> = page.words.iter().map(|w| w.word.text.as_str()).collect();
        let marker = if page.image.is_some() { " [img]" } else { "" };
        if i < 3 {
            info!("  Page {} @ {:.2}s{}: {}", i + 1, start, marker, text.join(" "));
        } else {
            debug!("  Page {} @ {:.2}s{}: {}", i + 1, start, marker, text.join(" "));
        }
    }
}

/// Pixels a frame is built from before subtitles are drawn.
enum Layer {
    Shared(Arc<RgbaImage>),
    Frozen { last: Arc<RgbaImage>, progress: f64 },
    Solid,
}

impl Layer {
    fn into_image(self) -> RgbaImage {
        match self {
            Layer::Shared(img) => Arc::try_unwrap(img).unwrap_or_else(|shared| (*shared).clone()),
            Layer::Frozen { last, progress } => compose::freeze(&last, progress),
            Layer::Solid => compose::solid_frame(BACKDROP),
        }
    }
}

struct FrameJob {
    layer: Layer,
    fade_from: Option<(Layer, f64)>,
    main_t: Option<f64>,
}

fn render_frame(compositor: &Compositor, job: FrameJob) -> RgbaImage {
    let mut frame = job.layer.into_image();
    if let Some((from, progress)) = job.fade_from {
        compose::crossfade(&from.into_image(), &mut frame, progress);
    }
    if let Some(t) = job.main_t {
        compositor.draw(&mut frame, t);
    }
    frame
}

/// Looped background readers; page `i` uses background `i % n` and page
/// changes crossfade between the two.
struct BackgroundCycler {
    paths: Vec<PathBuf>,
    format: VideoFormat,
    readers: HashMap<usize, FrameReader>,
    last: HashMap<usize, Arc<RgbaImage>>,
    current: Option<usize>,
    fade: Option<(usize, f64)>,
}

impl BackgroundCycler {
    fn new(paths: Vec<PathBuf>, format: VideoFormat) -> Self {
        BackgroundCycler {
            paths,
            format,
            readers: HashMap::new(),
            last: HashMap::new(),
            current: None,
            fade: None,
        }
    }

    fn index_for_page(&self, page: usize) -> Option<usize> {
        (!self.paths.is_empty()).then(|| page % self.paths.len())
    }

    fn read(&mut self, idx: usize) -> anyhow::Result<Layer> {
        if !self.readers.contains_key(&idx) {
            let reader = FrameReader::open(&self.paths[idx], self.format, true)?;
            info!("Background {} → {}", idx + 1, self.paths[idx].display());
            self.readers.insert(idx, reader);
        }
        let next = match self.readers.get_mut(&idx) {
            Some(reader) => reader.next_frame()?,
            None => None,
        };
        if let Some(frame) = next {
            self.last.insert(idx, Arc::new(frame));
        }
        Ok(match self.last.get(&idx) {
            Some(frame) => Layer::Shared(Arc::clone(frame)),
            None => Layer::Solid,
        })
    }

    /// Background index for `page` and, while a change is still fading,
    /// the previous index with the fade progress.
    fn plan(&mut self, page: usize, t: f64) -> Option<(usize, Option<(usize, f64)>)> {
        let idx = self.index_for_page(page)?;
        if self.current != Some(idx) {
            if let Some(prev) = self.current {
                self.fade = Some((prev, t));
            }
            self.current = Some(idx);
        }
        let fade = match self.fade {
            Some((prev, since)) if t - since < BG_CROSSFADE => Some((prev, (t - since) / BG_CROSSFADE)),
            _ => {
                self.fade = None;
                None
            }
        };
        Some((idx, fade))
    }

    /// Closes the ffmpeg readers (and cached frames) of every background other
    /// than the shown one and the one fading out.
    fn release_idle(&mut self, shown: usize, fading: Option<usize>) {
        let keep = |k: &usize| *k == shown || Some(*k) == fading;
        self.readers.retain(|k, _| keep(k));
        self.last.retain(|k, _| keep(k));
    }

    fn layers(&mut self, page: usize, t: f64) -> anyhow::Result<(Layer, Option<(Layer, f64)>)> {
        let Some((idx, fade)) = self.plan(page, t) else {
            return Ok((Layer::Solid, None));
        };
        self.release_idle(idx, fade.map(|(prev, _)| prev));
        let layer = self.read(idx)?;
        let fade_from = match fade {
            Some((prev, progress)) => Some((self.read(prev)?, progress)),
            None => None,
        };
        Ok((layer, fade_from))
    }
}

/// Sequential stage: decodes source frames in timeline order.
struct FrameSource<'a> {
    timeline: &'a Timeline,
    compositor: &'a Compositor,
    hook: Option<FrameReader>,
    last_hook: Option<Arc<RgbaImage>>,
    backgrounds: BackgroundCycler,
}

impl FrameSource<'_> {
    fn job(&mut self, index: u64) -> anyhow::Result<FrameJob> {
        let t = self.timeline.frame_time(index);
        match self.timeline.locate(t) {
            Segment::Hook(_) => {
                if let Some(reader) = self.hook.as_mut() {
                    if let Some(frame) = reader.next_frame()? {
                        self.last_hook = Some(Arc::new(frame));
                    }
                }
                let layer = match &self.last_hook {
                    Some(frame) => Layer::Shared(Arc::clone(frame)),
                    None => Layer::Solid,
                };
                Ok(FrameJob { layer, fade_from: None, main_t: None })
            }
            Segment::Freeze(progress) => {
                self.hook = None;
                let layer = match &self.last_hook {
                    Some(last) => Layer::Frozen { last: Arc::clone(last), progress },
                    None => Layer::Solid,
                };
                Ok(FrameJob { layer, fade_from: None, main_t: None })
            }
            Segment::Main(local) => {
                self.hook = None;
                let page = self.compositor.page_at(local);
                let (layer, mut fade_from) = self.backgrounds.layers(page, local)?;
                if fade_from.is_none() && local < CROSSFADE {
                    if let Some(last) = &self.last_hook {
                        let frozen = Layer::Frozen { last: Arc::clone(last), progress: 1.0 };
                        fade_from = Some((frozen, local / CROSSFADE));
                    }
                }
                Ok(FrameJob { layer, fade_from, main_t: Some(local) })
            }
        }
    }
}

pub fn run(job: &RenderJob) -> anyhow::Result<()> {
    let started = Instant::now();
    let format = VideoFormat { width: WIDTH, height: HEIGHT, fps: job.fps };

    let text = fs::read_to_string(&job.script)
        .with_context(|| format!("Failed to read script {}", job.script.display()))?;
    let mut script = parse_script(&text);
    if script.pages.is_empty() {
        bail!("Script {} has no words", job.script.display());
    }
    info!("Parsed {} words on {} pages", script.word_count(), script.pages.len());

    let timestamps = load_timestamps(&job.timestamps)?;
    let report = apply_timestamps(&mut script, &timestamps);
    info!("Matched {}/{} words to timestamps", report.matched, script.word_count());

    if let Some(srt) = &job.srt {
        crate::subtitle::write_word_srt(srt, script.words())?;
    }

    let fonts = FontBank::load(&job.font)?;
    let pages = layout_script(&script, &TextArea::default(), &fonts);
    log_preview(&pages);

    let voice = media_duration(&job.audio)?;
    let hook_info = job.hook.as_deref().map(ffmpeg::probe).transpose()?;
    let hook_duration = match &hook_info {
        Some(info) => job.hook_max.map_or(info.duration, |max| info.duration.min(max)),
        None => 0.0,
    };
    let timeline = Timeline::new(hook_duration, job.freeze, voice, job.fps);
    info!(
        "Timeline: hook {:.2}s, freeze {:.2}s, main {:.2}s, {} frames",
        timeline.hook,
        timeline.freeze,
        timeline.main,
        timeline.frame_count()
    );

    let threads = resolve_threads(job.threads);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to build thread pool")?;

    let script_dir = job.script.parent().unwrap_or(Path::new(".")).to_path_buf();
    let compositor = pool.install(|| {
        let overlays = load_overlays(&pages, &script_dir);
        Compositor::new(fonts, pages, overlays, timeline.main)
    });

    let hook_reader = match &job.hook {
        Some(hook) if timeline.hook > 0.0 => Some(FrameReader::open(hook, format, false)?),
        _ => None,
    };
    let hook_audio = match (&job.hook, &hook_info) {
        (Some(hook), Some(info)) if info.has_audio => Some(hook.clone()),
        _ => None,
    };
    let audio = AudioPlan {
        voice: job.audio.clone(),
        hook: hook_audio,
        music: job.music.clone(),
        music_volume: job.music_volume,
    };
    if job.backgrounds.is_empty() {
        info!("No backgrounds; using solid backdrop");
    }

    let mut source = FrameSource {
        timeline: &timeline,
        compositor: &compositor,
        hook: hook_reader,
        last_hook: None,
        backgrounds: BackgroundCycler::new(job.backgrounds.clone(), format),
    };
    let mut encoder = Encoder::spawn(&job.output, &format, &audio, &timeline, &job.preset)?;

    let total = timeline.frame_count();
    let batch_size = (threads * 2) as u64;
    info!("Rendering {} frames on {} threads", total, threads);
    let pb = make_progress_bar(total, "Rendering");
    let render_start = Instant::now();

    let mut index = 0u64;
    while index < total {
        let end = (index + batch_size).min(total);
        let jobs = (index..end)
            .map(|i| source.job(i))
            .collect::<anyhow::Result<Vec<FrameJob>>>()?;
        let frames: Vec<RgbaImage> =
            pool.install(|| jobs.into_par_iter().map(|job| render_frame(&compositor, job)).collect());
        for frame in &frames {
            encoder.write_frame(frame)?;
        }
        pb.inc(end - index);
        pb.set_message(format!("{:.1} fps", end as f64 / render_start.elapsed().as_secs_f64()));
        index = end;
    }
    pb.finish_and_clear();
    drop(source);

    encoder.finish()?;
    info!("Done in {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn threads_default_to_available_cores() {
        assert_eq!(resolve_threads(Some(3)), 3);
        assert!(resolve_threads(None) >= 1);
        assert!(resolve_threads(Some(0)) >= 1);
    }

    #[test]
    fn relative_images_resolve_next_to_script() {
        let p = resolve_image(Path::new("pics/nowhere-xyz.png"), Path::new("/scripts"));
        assert_eq!(p, PathBuf::from("/scripts/pics/nowhere-xyz.png"));
        let abs = resolve_image(Path::new("/abs/a.png"), Path::new("/scripts"));
        assert_eq!(abs, PathBuf::from("/abs/a.png"));
    }

    #[test]
    fn cycler_without_backgrounds_is_solid() {
        let format = VideoFormat { width: 4, height: 4, fps: 30 };
        let mut cycler = BackgroundCycler::new(Vec::new(), format);
        let (layer, fade) = cycler.layers(3, 1.0).unwrap();
        assert!(matches!(layer, Layer::Solid));
        assert!(fade.is_none());
    }

    #[test]
    fn cycler_crossfades_on_background_change() {
        let format = VideoFormat { width: 4, height: 4, fps: 30 };
        let mut cycler = BackgroundCycler::new(vec!["a.mp4".into(), "b.mp4".into()], format);
        assert_eq!(cycler.plan(0, 0.0), Some((0, None)));
        assert_eq!(cycler.plan(1, 2.0), Some((1, Some((0, 0.0)))));
        let (idx, fade) = cycler.plan(1, 2.15).unwrap();
        assert_eq!(idx, 1);
        let (prev, progress) = fade.unwrap();
        assert_eq!(prev, 0);
        assert!((progress - 0.5).abs() < 1e-9);
        assert_eq!(cycler.plan(1, 2.4), Some((1, None)));
        assert_eq!(cycler.plan(2, 4.0), Some((0, Some((1, 0.0)))));
    }

    #[test]
    fn finished_fade_releases_previous_background() {
        let format = VideoFormat { width: 4, height: 4, fps: 30 };
        let mut cycler = BackgroundCycler::new(vec!["a.mp4".into(), "b.mp4".into(), "c.mp4".into()], format);
        for idx in 0..3 {
            cycler.last.insert(idx, Arc::new(RgbaImage::new(4, 4)));
        }
        cycler.release_idle(1, Some(0));
        let mut kept: Vec<usize> = cycler.last.keys().copied().collect();
        kept.sort();
        assert_eq!(kept, vec![0, 1]);

        cycler.release_idle(1, None);
        assert_eq!(cycler.last.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn single_background_never_fades() {
        let format = VideoFormat { width: 4, height: 4, fps: 30 };
        let mut cycler = BackgroundCycler::new(vec!["a.mp4".into()], format);
        assert_eq!(cycler.plan(0, 0.0), Some((0, None)));
        assert_eq!(cycler.plan(1, 3.0), Some((0, None)));
    }

    #[test]
    fn layers_resolve_to_images() {
        let last = Arc::new(RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([100, 100, 100, 255])));
        let frozen = Layer::Frozen { last: Arc::clone(&last), progress: 0.0 }.into_image();
        assert_eq!(frozen.get_pixel(10, 10).0, [100, 100, 100, 255]);
        let shared = Layer::Shared(last).into_image();
        assert_eq!(shared.dimensions(), (WIDTH, HEIGHT));
        let solid = Layer::Solid.into_image();
        assert_eq!(solid.get_pixel(0, 0).0, [BACKDROP.0, BACKDROP.1, BACKDROP.2, 255]);
    }
}
