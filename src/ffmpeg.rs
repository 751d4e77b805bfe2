use crate::timeline::{AudioPlan, Timeline};
use anyhow::{Context, bail};
use image::RgbaImage;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, error, info, warn};

pub fn ffmpeg_bin() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

pub fn ffprobe_bin() -> String {
    std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl VideoFormat {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub size_bytes: u64,
    pub has_audio: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    size: Option<String>,
}

fn parse_rate(raw: &str) -> f64 {
    match raw.split_once('/') {
        Some((num, den)) => {
            let n: f64 = num.parse().unwrap_or(0.0);
            let d: f64 = den.parse().unwrap_or(1.0);
            if d > 0.0 { n / d } else { 0.0 }
        }
        None => raw.parse().unwrap_or(0.0),
    }
}

fn parse_probe(json: &str) -> anyhow::Result<MediaInfo> {
    let out: ProbeOutput = serde_json::from_str(json).context("Unexpected ffprobe output")?;
    let video = out.streams.iter().find(|s| s.codec_type.as_deref() == Some("video"));
    let has_audio = out.streams.iter().any(|s| s.codec_type.as_deref() == Some("audio"));

    let format_duration = out
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());
    let stream_duration = out
        .streams
        .iter()
        .filter_map(|s| s.duration.as_deref())
        .filter_map(|d| d.parse::<f64>().ok())
        .reduce(f64::max);

    Ok(MediaInfo {
        duration: format_duration.or(stream_duration).unwrap_or(0.0),
        width: video.and_then(|v| v.width).unwrap_or(0),
        height: video.and_then(|v| v.height).unwrap_or(0),
        fps: video
            .and_then(|v| v.r_frame_rate.as_deref())
            .map(parse_rate)
            .unwrap_or(0.0),
        codec: video
            .or(out.streams.first())
            .and_then(|s| s.codec_name.clone())
            .unwrap_or_default(),
        size_bytes: out
            .format
            .as_ref()
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        has_audio,
    })
}

pub fn probe(path: &Path) -> anyhow::Result<MediaInfo> {
    let output = Command::new(ffprobe_bin())
        .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .output()
        .context("Failed to run ffprobe. Is ffmpeg installed?")?;
    if !output.status.success() {
        bail!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_probe(&String::from_utf8_lossy(&output.stdout))
}

fn cover_filter(format: &VideoFormat) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},fps={fps}",
        w = format.width,
        h = format.height,
        fps = format.fps
    )
}

/// Decodes a video into RGBA frames scaled and center-cropped to `format`.
pub struct FrameReader {
    child: Child,
    stdout: BufReader<ChildStdout>,
    format: VideoFormat,
    source: PathBuf,
}

impl FrameReader {
    pub fn open(path: &Path, format: VideoFormat, looped: bool) -> anyhow::Result<Self> {
        let mut cmd = Command::new(ffmpeg_bin());
        cmd.args(["-v", "error"]);
        if looped {
            cmd.args(["-stream_loop", "-1"]);
        }
        cmd.arg("-i")
            .arg(path)
            .args(["-an", "-vf", &cover_filter(&format)])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .context("Failed to spawn ffmpeg reader. Is ffmpeg installed?")?;
        let stdout = child
            .stdout
            .take()
            .context("ffmpeg reader has no stdout")?;
        debug!("Opened frame reader for {} (loop: {})", path.display(), looped);
        Ok(FrameReader {
            child,
            stdout: BufReader::new(stdout),
            format,
            source: path.to_path_buf(),
        })
    }

    /// Next frame, or `None` at the end of the stream.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<RgbaImage>> {
        let mut buf = vec![0u8; self.format.frame_bytes()];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Read error from {}", self.source.display()));
            }
        }
        let frame = RgbaImage::from_raw(self.format.width, self.format.height, buf)
            .context("Frame buffer size mismatch")?;
        Ok(Some(frame))
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn encoder_args(output: &Path, format: &VideoFormat, audio: &AudioPlan, timeline: &Timeline, preset: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-v".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", format.width, format.height),
        "-r".into(),
        format.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
    ];
    args.extend(audio.input_args());
    args.extend([
        "-filter_complex".into(),
        audio.filter_graph(timeline),
        "-map".into(),
        "0:v".into(),
        "-map".into(),
        "[aout]".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        preset.to_string(),
        "-crf".into(),
        "23".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-t".into(),
        format!("{:.3}", timeline.total()),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// Single ffmpeg process that encodes piped frames and muxes the audio plan.
pub struct Encoder {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    output: PathBuf,
}

impl Encoder {
    pub fn spawn(
        output: &Path,
        format: &VideoFormat,
        audio: &AudioPlan,
        timeline: &Timeline,
        preset: &str,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let args = encoder_args(output, format, audio, timeline, preset);
        debug!("ffmpeg {}", args.join(" "));
        let mut child = Command::new(ffmpeg_bin())
            .args(&args)
            .stdin(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("Failed to spawn ffmpeg writer. Is ffmpeg installed?")?;
        let stdin = child.stdin.take().context("ffmpeg writer has no stdin")?;
        Ok(Encoder {
            child,
            stdin: Some(BufWriter::new(stdin)),
            output: output.to_path_buf(),
        })
    }

    pub fn write_frame(&mut self, frame: &RgbaImage) -> anyhow::Result<()> {
        let stdin = self.stdin.as_mut().context("Encoder already finished")?;
        stdin.write_all(frame.as_raw()).context("write failed")?;
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().context("write failed")?;
        }
        let status = self.child.wait()?;
        if !status.success() {
            error!("ffmpeg failed to produce final video");
            let _ = fs::remove_file(&self.output);
            bail!("ffmpeg failed to produce final video {}", self.output.display());
        }
        info!("Final video written to {}", self.output.display());
        Ok(())
    }
}

/// An encoder dropped before `finish` (a failed render) stops ffmpeg and
/// removes the truncated output.
impl Drop for Encoder {
    fn drop(&mut self) {
        let Some(stdin) = self.stdin.take() else {
            return;
        };
        let _ = self.child.kill();
        drop(stdin.into_parts());
        let _ = self.child.wait();
        match fs::remove_file(&self.output) {
            Ok(()) => warn!("Removed incomplete video {}", self.output.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove incomplete video {}: {}", self.output.display(), e),
        }
    }
}

/// Single frame at `t` seconds, scaled to `width` (keeping aspect) when given.
pub fn extract_frame(path: &Path, t: f64, width: Option<u32>) -> anyhow::Result<RgbaImage> {
    let mut cmd = Command::new(ffmpeg_bin());
    cmd.args(["-v", "error", "-ss", &format!("{t:.3}"), "-i"])
        .arg(path)
        .args(["-frames:v", "1"]);
    if let Some(w) = width {
        cmd.args(["-vf", &format!("scale={w}:-2")]);
    }
    let output = cmd
        .args(["-f", "image2pipe", "-vcodec", "png", "pipe:1"])
        .output()
        .context("Failed to run ffmpeg. Is ffmpeg installed?")?;
    if !output.status.success() || output.stdout.is_empty() {
        bail!("Could not extract frame at {:.2}s from '{}'", t, path.display());
    }
    let img = image::load_from_memory(&output.stdout)
        .with_context(|| format!("Invalid frame data from '{}'", path.display()))?;
    Ok(img.to_rgba8())
}

/// Joins audio files with the concat demuxer; falls back to re-encoding when
/// a stream copy is not possible.
pub fn concat_audio(parts: &[PathBuf], output: &Path) -> anyhow::Result<()> {
    if parts.is_empty() {
        bail!("No audio parts to concatenate");
    }
    let list_path = output.with_extension("concat.txt");
    {
        let mut f = File::create(&list_path)?;
        for p in parts {
            let abs = fs::canonicalize(p).with_context(|| format!("Missing audio part {}", p.display()))?;
            writeln!(f, "file '{}'", abs.to_string_lossy().replace('\'', "'\\''"))?;
        }
    }
    info!("Concatenating {} audio parts into {}", parts.len(), output.display());

    let run = |codec: &[&str]| -> anyhow::Result<bool> {
        let status = Command::new(ffmpeg_bin())
            .args(["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(codec)
            .arg(output)
            .status()
            .context("Failed to run ffmpeg. Is ffmpeg installed?")?;
        Ok(status.success())
    };

    let ok = if run(&["-c", "copy"])? {
        true
    } else {
        warn!("ffmpeg concat with copy failed; retrying with re-encode");
        run(&["-c:a", "libmp3lame", "-q:a", "2"])?
    };
    let _ = fs::remove_file(&list_path);
    if !ok {
        error!("ffmpeg failed to concatenate audio files");
        bail!("ffmpeg failed to concatenate audio files");
    }
    Ok(())
}

/// ffmpeg's `atempo` accepts 0.5..=2.0 per stage, so larger factors are chained.
fn atempo_chain(tempo: f64) -> String {
    let mut stages = Vec::new();
    let mut rest = tempo;
    while rest > 2.0 {
        stages.push(2.0);
        rest /= 2.0;
    }
    while rest < 0.5 {
        stages.push(0.5);
        rest /= 0.5;
    }
    stages.push(rest);
    stages
        .iter()
        .map(|s| format!("atempo={s:.4}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn change_tempo(input: &Path, output: &Path, tempo: f64) -> anyhow::Result<()> {
    if tempo <= 0.0 {
        bail!("Tempo must be positive, got {}", tempo);
    }
    info!("Applying tempo x{:.2} to {}", tempo, input.display());
    let status = Command::new(ffmpeg_bin())
        .args(["-y", "-v", "error", "-i"])
        .arg(input)
        .args(["-filter:a", &atempo_chain(tempo)])
        .arg(output)
        .status()
        .context("Failed to run ffmpeg. Is ffmpeg installed?")?;
    if !status.success() {
        bail!("ffmpeg failed to change tempo of {}", input.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_encoder(output: &Path) -> Encoder {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        Encoder {
            child,
            stdin: Some(BufWriter::new(stdin)),
            output: output.to_path_buf(),
        }
    }

    #[test]
    fn dropped_encoder_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        fs::write(&output, b"partial").unwrap();
        let mut encoder = cat_encoder(&output);
        encoder.write_frame(&RgbaImage::new(2, 2)).unwrap();
        drop(encoder);
        assert!(!output.exists());
    }

    #[test]
    fn finished_encoder_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        fs::write(&output, b"done").unwrap();
        let mut encoder = cat_encoder(&output);
        encoder.write_frame(&RgbaImage::new(2, 2)).unwrap();
        encoder.finish().unwrap();
        assert!(output.exists());
    }

    #[test]
    fn probe_json_is_parsed() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1080, "height": 1920,
                 "r_frame_rate": "30000/1001", "duration": "12.5"},
                {"codec_type": "audio", "codec_name": "aac", "duration": "12.6"}
            ],
            "format": {"duration": "12.600000", "size": "1048576"}
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.width, 1080);
        assert_eq!(info.height, 1920);
        assert_eq!(info.codec, "h264");
        assert!((info.fps - 29.97).abs() < 0.01);
        assert!((info.duration - 12.6).abs() < 1e-9);
        assert_eq!(info.size_bytes, 1_048_576);
        assert!(info.has_audio);
    }

    #[test]
    fn audio_only_probe_uses_stream_duration() {
        let json = r#"{"streams": [{"codec_type": "audio", "codec_name": "mp3", "duration": "3.25"}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.codec, "mp3");
        assert_eq!(info.width, 0);
        assert!((info.duration - 3.25).abs() < 1e-9);
    }

    #[test]
    fn rates_parse() {
        assert_eq!(parse_rate("30/1"), 30.0);
        assert_eq!(parse_rate("25"), 25.0);
        assert_eq!(parse_rate("0/0"), 0.0);
    }

    #[test]
    fn atempo_is_chained_outside_range() {
        assert_eq!(atempo_chain(1.1), "atempo=1.1000");
        assert_eq!(atempo_chain(3.0), "atempo=2.0000,atempo=1.5000");
        assert_eq!(atempo_chain(0.25), "atempo=0.5000,atempo=0.5000");
    }

    #[test]
    fn encoder_args_pipe_video_and_map_mix() {
        let format = VideoFormat { width: 1080, height: 1920, fps: 30 };
        let timeline = Timeline::new(0.0, 0.0, 2.0, 30);
        let audio = AudioPlan {
            voice: "voice.mp3".into(),
            hook: None,
            music: None,
            music_volume: 0.12,
        };
        let args = encoder_args(Path::new("out.mp4"), &format, &audio, &timeline, "medium");
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgba -s 1080x1920 -r 30 -i pipe:0 -i voice.mp3"));
        assert!(joined.contains("-map 0:v -map [aout]"));
        assert!(joined.contains("-crf 23 -pix_fmt yuv420p"));
        assert!(joined.contains("-movflags +faststart -t 2.500"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn cover_filter_crops_to_target() {
        let f = VideoFormat { width: 1080, height: 1920, fps: 30 };
        assert_eq!(
            cover_filter(&f),
            "scale=1080:1920:force_original_aspect_ratio=increase,crop=1080:1920,fps=30"
        );
        assert_eq!(f.frame_bytes(), 1080 * 1920 * 4);
    }

    #[test]
    fn concat_rejects_empty_list() {
        assert!(concat_audio(&[], Path::new("out.mp3")).is_err());
    }
}
