use crate::ffmpeg;
use hound::WavReader;
use std::path::Path;
use tracing::debug;

pub fn wav_duration_seconds(path: &Path) -> anyhow::Result<f64> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    let duration = frames / spec.sample_rate as f64;
    Ok(duration)
}

/// Duration of any audio or video file; WAV is read directly, everything else
/// goes through ffprobe.
pub fn media_duration(path: &Path) -> anyhow::Result<f64> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if is_wav {
        match wav_duration_seconds(path) {
            Ok(d) => return Ok(d),
            Err(e) => debug!("hound could not read {}: {}; falling back to ffprobe", path.display(), e),
        }
    }
    let info = ffmpeg::probe(path)?;
    if info.duration <= 0.0 {
        anyhow::bail!("Could not determine duration of {}", path.display());
    }
    Ok(info.duration)
}
