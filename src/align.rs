use crate::markup::Script;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const ESTIMATE_GAP: f64 = 0.05;
const ESTIMATE_DURATION: f64 = 0.3;

/// One word of transcription output, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AlignReport {
    pub matched: usize,
    /// Indices (in script order) of words whose timing was estimated.
    pub estimated: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignIssue {
    pub word_index: usize,
    pub word: String,
    pub cleaned: String,
    pub skipped_from: usize,
    pub skipped_count: usize,
    pub nearby: Vec<String>,
}

pub fn load_timestamps(path: &Path) -> anyhow::Result<Vec<WordTimestamp>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read timestamps {}", path.display()))?;
    let words: Vec<WordTimestamp> = serde_json::from_str(&data)
        .with_context(|| format!("Invalid timestamps JSON in {}", path.display()))?;
    Ok(words)
}

pub fn save_timestamps(path: &Path, words: &[WordTimestamp]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(words)?)?;
    info!("Saved {} word timestamps to {}", words.len(), path.display());
    Ok(())
}

/// Lowercased alphanumerics only, with `ё` folded into `е`.
pub fn clean_word(word: &str) -> String {
    word.to_lowercase()
        .chars()
        .map(|c| if c == 'ё' { 'е' } else { c })
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn words_match(a: &str, b: &str) -> bool {
    !b.is_empty() && (a == b || a.contains(b) || b.contains(a))
}

/// Scans forward from `cursor` for a timestamp matching `cleaned`.
fn find_match(cleaned: &str, timestamps: &[WordTimestamp], cursor: usize) -> Option<usize> {
    (cursor..timestamps.len()).find(|&i| words_match(cleaned, &clean_word(&timestamps[i].word)))
}

/// Copies word timing from transcription output onto the script words.
pub fn apply_timestamps(script: &mut Script, timestamps: &[WordTimestamp]) -> AlignReport {
    let mut report = AlignReport::default();
    let mut cursor = 0usize;
    let mut prev: Option<(f64, f64)> = None;

    for (idx, word) in script.words_mut().enumerate() {
        let cleaned = clean_word(&word.text);
        if cleaned.is_empty() {
            let (start, end) = prev.unwrap_or((0.0, ESTIMATE_DURATION));
            word.start = start;
            word.end = end;
            continue;
        }

        match find_match(&cleaned, timestamps, cursor) {
            Some(i) => {
                word.start = timestamps[i].start;
                word.end = timestamps[i].end;
                cursor = i + 1;
                report.matched += 1;
            }
            None => {
                let start = prev.map(|(_, end)| end + ESTIMATE_GAP).unwrap_or(0.0);
                word.start = start;
                word.end = start + ESTIMATE_DURATION;
                report.estimated.push(idx);
                debug!("No timestamp for '{}', estimated at {:.2}s", word.text, start);
            }
        }
        prev = Some((word.start, word.end));
    }

    if !report.estimated.is_empty() {
        warn!(
            "{} of {} words had no matching timestamp; timing estimated",
            report.estimated.len(),
            report.estimated.len() + report.matched
        );
    }
    report
}

/// Reports every script word the aligner cannot match.
pub fn validate(script: &Script, timestamps: &[WordTimestamp]) -> Vec<AlignIssue> {
    let mut issues = Vec::new();
    let mut cursor = 0usize;

    for (idx, word) in script.words().enumerate() {
        let cleaned = clean_word(&word.text);
        if cleaned.is_empty() {
            continue;
        }
        match find_match(&cleaned, timestamps, cursor) {
            Some(i) => cursor = i + 1,
            None => {
                let lo = cursor.saturating_sub(2);
                let hi = (cursor + 5).min(timestamps.len());
                issues.push(AlignIssue {
                    word_index: idx,
                    word: word.text.clone(),
                    cleaned,
                    skipped_from: cursor,
                    skipped_count: timestamps.len() - cursor,
                    nearby: timestamps[lo..hi].iter().map(|t| t.word.clone()).collect(),
                });
            }
        }
    }
    issues
}

impl AlignIssue {
    pub fn suggestion(&self) -> String {
        let prefix = |s: &str| s.chars().take(3).collect::<String>();
        for ts_word in &self.nearby {
            let ts_clean = clean_word(ts_word);
            let script_is_number = self.cleaned.chars().all(|c| c.is_ascii_digit());
            let ts_is_number = !ts_clean.is_empty() && ts_clean.chars().all(|c| c.is_ascii_digit());
            if script_is_number && !ts_is_number {
                return format!("Change \"{}\" to \"{}\" (number vs text)", self.word, ts_word);
            }
            if !ts_clean.is_empty() && prefix(&self.cleaned) == prefix(&ts_clean) {
                return format!("Change \"{}\" to \"{}\" (spelling mismatch)", self.word, ts_word);
            }
        }
        format!("Check TTS pronunciation. Nearby words: {:?}", self.nearby)
    }
}
