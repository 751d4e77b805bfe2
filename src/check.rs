//! Samples a rendered video and reports stretches where a word should be on
//! screen but the subtitle area is empty.

use crate::align::{WordTimestamp, load_timestamps};
use crate::ffmpeg;
use image::RgbaImage;
use rayon::prelude::*;
use std::path::Path;
use tracing::{info, warn};

const SAMPLE_EVERY: f64 = 2.0;
const BRIGHT: f64 = 200.0;
const MIN_BRIGHT_SHARE: f64 = 0.005;
/// Words stay on screen a little past their end.
const LINGER: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub time: f64,
    pub expected: String,
    pub word_index: usize,
    pub last_good: f64,
}

fn round1(t: f64) -> f64 {
    (t * 10.0).round() / 10.0
}

/// Word starts, word midpoints and a regular grid, shifted by `offset`.
pub fn sample_times(words: &[WordTimestamp], offset: f64, duration: f64) -> Vec<f64> {
    let mut times: Vec<f64> = words
        .iter()
        .flat_map(|w| [w.start + offset, (w.start + w.end) / 2.0 + offset])
        .map(round1)
        .collect();
    let mut t = 0.0;
    while t < duration {
        times.push(round1(t));
        t += SAMPLE_EVERY;
    }
    times.retain(|t| *t >= 0.0 && *t < duration);
    times.sort_by(f64::total_cmp);
    times.dedup();
    times
}

/// True when enough of the central region is near-white.
pub fn has_content(frame: &RgbaImage) -> bool {
    let (w, h) = frame.dimensions();
    let (y1, y2) = ((h as f64 * 0.2) as u32, (h as f64 * 0.8) as u32);
    let (x1, x2) = ((w as f64 * 0.1) as u32, (w as f64 * 0.9) as u32);
    let total = ((y2 - y1) as u64) * ((x2 - x1) as u64);
    if total == 0 {
        return false;
    }
    let mut bright = 0u64;
    for y in y1..y2 {
        for x in x1..x2 {
            let p = frame.get_pixel(x, y);
            let gray = (p[0] as f64 + p[1] as f64 + p[2] as f64) / 3.0;
            if gray > BRIGHT {
                bright += 1;
            }
        }
    }
    bright as f64 / total as f64 > MIN_BRIGHT_SHARE
}

fn expected_at(words: &[WordTimestamp], t: f64, offset: f64) -> Option<usize> {
    words
        .iter()
        .position(|w| w.start + offset <= t && t <= w.end + offset + LINGER)
}

/// Collapses per-sample results into gaps. A gap opens at the first empty
/// sample while a word is expected and closes at the next sample with content.
pub fn find_gaps(samples: &[(f64, bool)], words: &[WordTimestamp], offset: f64) -> Vec<Gap> {
    let mut gaps = Vec::new();
    let mut last_good = 0.0;
    let mut open = false;
    for &(t, content) in samples {
        if content {
            last_good = t;
            open = false;
            continue;
        }
        if open {
            continue;
        }
        if let Some(i) = expected_at(words, t, offset) {
            open = true;
            gaps.push(Gap {
                time: t,
                expected: words[i].word.clone(),
                word_index: i,
                last_good,
            });
        }
    }
    gaps
}

pub fn run(video: &Path, timestamps: &Path, offset: f64) -> anyhow::Result<Vec<Gap>> {
    let words = load_timestamps(timestamps)?;
    let duration = ffmpeg::probe(video)?.duration;
    info!("Video duration: {:.2}s, {} words", duration, words.len());

    let times = sample_times(&words, offset, duration);
    info!("Checking {} sample points", times.len());
    let samples: Vec<(f64, bool)> = times
        .par_iter()
        .filter_map(|&t| match ffmpeg::extract_frame(video, t, None) {
            Ok(frame) => Some((t, has_content(&frame))),
            Err(e) => {
                warn!("Frame at {:.1}s unreadable: {:#}", t, e);
                None
            }
        })
        .collect();

    let gaps = find_gaps(&samples, &words, offset);
    for gap in &gaps {
        warn!(
            "Missing subtitles at {:.1}s: expected '{}' (word {}), last good {:.1}s",
            gap.time, gap.expected, gap.word_index, gap.last_good
        );
    }
    if gaps.is_empty() {
        info!("Subtitles appear throughout the video");
    } else if let Some(first) = gaps.first() {
        warn!("Found {} gap(s); subtitles likely stop around {:.1}s", gaps.len(), first.last_good);
    }
    Ok(gaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn word(w: &str, start: f64, end: f64) -> WordTimestamp {
        WordTimestamp { word: w.into(), start, end }
    }

    #[test]
    fn samples_cover_words_and_grid() {
        let words = vec![word("a", 0.5, 0.9), word("b", 3.04, 3.5)];
        let times = sample_times(&words, 1.0, 6.0);
        assert_eq!(times, vec![0.0, 1.5, 1.7, 2.0, 4.0, 4.3]);
    }

    #[test]
    fn detects_bright_text_in_center() {
        let mut frame = RgbaImage::from_pixel(100, 100, Rgba([20, 20, 20, 255]));
        assert!(!has_content(&frame));
        // Bright pixels outside the central region do not count.
        for x in 0..100 {
            frame.put_pixel(x, 5, Rgba([255, 255, 255, 255]));
        }
        assert!(!has_content(&frame));
        for x in 30..70 {
            frame.put_pixel(x, 50, Rgba([255, 255, 255, 255]));
        }
        assert!(has_content(&frame));
    }

    #[test]
    fn gaps_open_once_and_close_on_content() {
        let words = vec![word("one", 1.0, 2.0), word("two", 2.0, 3.0), word("three", 5.0, 6.0)];
        let samples = vec![
            (0.0, false),
            (1.0, true),
            (2.0, false),
            (2.5, false),
            (3.0, true),
            (4.0, false),
            (5.5, false),
        ];
        let gaps = find_gaps(&samples, &words, 0.0);
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].time, 2.0);
        assert_eq!(gaps[0].expected, "one");
        assert_eq!(gaps[0].last_good, 1.0);
        assert_eq!(gaps[1].time, 5.5);
        assert_eq!(gaps[1].expected, "three");
        assert_eq!(gaps[1].word_index, 2);
        assert_eq!(gaps[1].last_good, 3.0);
    }

    #[test]
    fn offset_shifts_expectations() {
        let words = vec![word("hi", 0.0, 1.0)];
        assert!(find_gaps(&[(0.5, false)], &words, 2.0).is_empty());
        assert_eq!(find_gaps(&[(2.5, false)], &words, 2.0).len(), 1);
    }
}
