//! Word-level timestamps from the Whisper transcription API.

use crate::align::WordTimestamp;
use anyhow::{Context, bail};
use reqwest::multipart;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MODEL: &str = "whisper-1";
const ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    words: Vec<WhisperWord>,
}

#[derive(Debug, Deserialize)]
struct WhisperWord {
    word: String,
    start: f64,
    end: f64,
}

#[derive(Debug)]
pub struct Transcript {
    pub text: String,
    pub words: Vec<WordTimestamp>,
}

/// `<dir>/<stem>_timestamps.json` for `<dir>/<stem>.<ext>`.
pub fn default_output_path(audio: &Path) -> PathBuf {
    let stem = audio.file_stem().and_then(|s| s.to_str()).unwrap_or("audio");
    audio.with_file_name(format!("{}_timestamps.json", stem))
}

/// Writes the word timestamps to `output`. Returns false, writing nothing,
/// when the transcription came back without words.
pub fn save(transcript: &Transcript, output: &Path) -> anyhow::Result<bool> {
    if transcript.words.is_empty() {
        warn!("Transcription has no word timestamps; {} not written", output.display());
        return Ok(false);
    }
    crate::align::save_timestamps(output, &transcript.words)?;
    Ok(true)
}

fn round_ms(t: f64) -> f64 {
    (t * 1000.0).round() / 1000.0
}

fn to_transcript(resp: WhisperResponse) -> Transcript {
    Transcript {
        text: resp.text.trim().to_string(),
        words: resp
            .words
            .into_iter()
            .map(|w| WordTimestamp {
                word: w.word.trim().to_string(),
                start: round_ms(w.start),
                end: round_ms(w.end),
            })
            .filter(|w| !w.word.is_empty())
            .collect(),
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("flac") => "audio/flac",
        _ => "audio/mpeg",
    }
}

pub struct Whisper {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl Whisper {
    pub fn new(api_key: &str, base_url: &str) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            bail!("OPENAI_API_KEY not set");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Whisper {
            client,
            api_key: api_key.trim().to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn transcribe(&self, audio: &Path, language: &str) -> anyhow::Result<Transcript> {
        let bytes = tokio::fs::read(audio)
            .await
            .with_context(|| format!("Failed to read audio {}", audio.display()))?;
        let filename = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3")
            .to_string();
        let url = format!("{}/audio/transcriptions", self.base_url);
        info!("Processing: {} ({} KB)", audio.display(), bytes.len() / 1024);

        let mut attempt = 1;
        loop {
            let form = multipart::Form::new()
                .text("model", MODEL)
                .part(
                    "file",
                    multipart::Part::bytes(bytes.clone())
                        .file_name(filename.clone())
                        .mime_str(mime_for(audio))?,
                )
                .text("response_format", "verbose_json")
                .text("timestamp_granularities[]", "word")
                .text("language", language.to_string());

            let result: anyhow::Result<WhisperResponse> = async {
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .multipart(form)
                    .send()
                    .await?;
                let status = resp.status();
                if status.is_server_error() {
                    bail!("Server error {}", status);
                }
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Fatal(format!("OpenAI error {}: {}", status, body)).into());
                }
                Ok(resp.json().await?)
            }
            .await;

            match result {
                Ok(resp) => return Ok(to_transcript(resp)),
                Err(e) if e.is::<Fatal>() => return Err(e),
                Err(e) if attempt < ATTEMPTS => {
                    let wait = Duration::from_secs(5 * attempt as u64);
                    warn!("Transcription attempt {} failed: {:#}. Retrying in {:?}", attempt, e, wait);
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.context("Transcription failed")),
            }
        }
    }
}

/// Client errors (4xx) are not retried.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Fatal(String);

pub fn words_per_minute(words: &[WordTimestamp]) -> Option<f64> {
    let duration = words.last()?.end;
    (duration > 0.0).then(|| words.len() as f64 / (duration / 60.0))
}

pub fn log_preview(transcript: &Transcript, count: usize) {
    info!("Transcription: {}", transcript.text);
    info!("Word timestamps ({} total):", transcript.words.len());
    for w in transcript.words.iter().take(count) {
        info!("  {:6.2}s - {:6.2}s ({:.2}s): {}", w.start, w.end, w.end - w.start, w.word);
    }
    if transcript.words.len() > count {
        info!("  ... and {} more words", transcript.words.len() - count);
    }
    if let (Some(last), Some(wpm)) = (transcript.words.last(), words_per_minute(&transcript.words)) {
        info!("Duration: {:.1}s | Words: {} | WPM: {:.0}", last.end, transcript.words.len(), wpm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_sits_next_to_audio() {
        assert_eq!(
            default_output_path(Path::new("out/voice.mp3")),
            PathBuf::from("out/voice_timestamps.json")
        );
    }

    #[test]
    fn response_words_are_trimmed_and_rounded() {
        let resp: WhisperResponse = serde_json::from_str(
            r#"{"text":" Привет мир ","words":[
                {"word":" Привет","start":0.12345,"end":0.5004},
                {"word":"  ","start":0.6,"end":0.7},
                {"word":"мир","start":0.6,"end":1.0}
            ]}"#,
        )
        .unwrap();
        let t = to_transcript(resp);
        assert_eq!(t.text, "Привет мир");
        assert_eq!(t.words.len(), 2);
        assert_eq!(t.words[0].word, "Привет");
        assert_eq!(t.words[0].start, 0.123);
        assert_eq!(t.words[0].end, 0.5);
    }

    #[test]
    fn missing_words_field_is_empty() {
        let resp: WhisperResponse = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert!(to_transcript(resp).words.is_empty());
    }

    #[test]
    fn wpm_from_last_word_end() {
        let words: Vec<WordTimestamp> = (0..30)
            .map(|i| WordTimestamp { word: "w".into(), start: i as f64, end: i as f64 + 1.0 })
            .collect();
        assert_eq!(words_per_minute(&words), Some(60.0));
        assert_eq!(words_per_minute(&[]), None);
    }

    #[test]
    fn mime_types() {
        assert_eq!(mime_for(Path::new("a.WAV")), "audio/wav");
        assert_eq!(mime_for(Path::new("a.mp3")), "audio/mpeg");
    }

    #[test]
    fn empty_transcript_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("voice_timestamps.json");
        let empty = Transcript { text: String::new(), words: Vec::new() };
        assert!(!save(&empty, &output).unwrap());
        assert!(!output.exists());

        let words = vec![WordTimestamp { word: "hi".into(), start: 0.0, end: 0.4 }];
        let transcript = Transcript { text: "hi".into(), words };
        assert!(save(&transcript, &output).unwrap());
        assert_eq!(crate::align::load_timestamps(&output).unwrap().len(), 1);
    }

    #[test]
    fn fatal_errors_are_detectable() {
        let e: anyhow::Error = Fatal("OpenAI error 401".into()).into();
        assert!(e.is::<Fatal>());
        assert_eq!(e.to_string(), "OpenAI error 401");
        let wrapped = e.context("Transcription failed");
        assert!(wrapped.downcast_ref::<Fatal>().is_some());
    }
}
