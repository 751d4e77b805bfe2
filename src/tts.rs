//! Text-to-speech through the KIE.ai job API (ElevenLabs Turbo 2.5).

use crate::ffmpeg;
use crate::utils::chunk_text;
use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.kie.ai/api/v1/jobs";
pub const DEFAULT_VOICE: &str = "EiNlNiXeDU1pqqOPrYMO";
pub const MODEL: &str = "elevenlabs/text-to-speech-turbo-2-5";
pub const MAX_TEXT_CHARS: usize = 5000;
pub const CHUNK_CHARS: usize = 4500;

const CREATE_ATTEMPTS: u32 = 3;
const POLL_LIMIT: u32 = 150;
const MAX_POLL_ERRORS: u32 = 5;

/// Voice presets accepted by name; any other value is sent as a raw voice ID.
pub const VOICES: &[&str] = &[
    "Callum", "Rachel", "Aria", "Roger", "Sarah", "Laura", "Charlie", "George", "River", "Liam",
    "Charlotte", "Alice", "Matilda", "Will", "Jessica", "Eric", "Chris", "Brian", "Daniel", "Lily",
    "Bill",
];

pub fn resolve_voice(voice: &str) -> String {
    VOICES
        .iter()
        .find(|name| name.eq_ignore_ascii_case(voice.trim()))
        .map(|name| name.to_string())
        .unwrap_or_else(|| voice.trim().to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSettings {
    pub stability: f64,
    pub similarity_boost: f64,
    pub style: f64,
    pub speed: f64,
    pub language: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        VoiceSettings {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            speed: 1.0,
            language: "ru".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    model: &'a str,
    input: TtsInput<'a>,
}

#[derive(Debug, Serialize)]
struct TtsInput<'a> {
    text: &'a str,
    voice: &'a str,
    stability: f64,
    similarity_boost: f64,
    style: f64,
    speed: f64,
    timestamps: bool,
    language_code: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedTask {
    task_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRecord {
    state: Option<String>,
    result_json: Option<String>,
    fail_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultJson {
    #[serde(default)]
    result_urls: Vec<String>,
}

/// `Ok(Some(url))` when finished, `Ok(None)` while still running.
fn poll_outcome(record: &TaskRecord) -> anyhow::Result<Option<String>> {
    match record.state.as_deref() {
        Some("success") => {
            let raw = record.result_json.as_deref().unwrap_or("{}");
            let result: ResultJson = serde_json::from_str(raw).context("Invalid resultJson")?;
            result
                .result_urls
                .into_iter()
                .next()
                .map(Some)
                .ok_or_else(|| anyhow!("No audio URL in result"))
        }
        Some("fail") => bail!(
            "Generation failed: {}",
            record.fail_msg.as_deref().unwrap_or("unknown error")
        ),
        _ => Ok(None),
    }
}

pub struct KieTts {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
}

impl KieTts {
    pub fn new(api_key: &str, base_url: &str) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            bail!("KIE_API_KEY not set");
        }
        Ok(KieTts {
            client: reqwest::Client::new(),
            api_key: api_key.trim().to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(2),
        })
    }

    async fn create_task(&self, text: &str, voice: &str, settings: &VoiceSettings) -> anyhow::Result<String> {
        let payload = CreateTaskRequest {
            model: MODEL,
            input: TtsInput {
                text,
                voice,
                stability: settings.stability,
                similarity_boost: settings.similarity_boost,
                style: settings.style,
                speed: settings.speed,
                timestamps: false,
                language_code: &settings.language,
            },
        };
        let url = format!("{}/createTask", self.base_url);

        let mut attempt = 1;
        loop {
            let result: anyhow::Result<String> = async {
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&payload)
                    .send()
                    .await?;
                let status = resp.status();
                if status.is_server_error() {
                    let body = resp.text().await.unwrap_or_default();
                    bail!("Server error {}: {:.200}", status, body);
                }
                let parsed: ApiResponse<CreatedTask> = resp.json().await?;
                match (parsed.code, parsed.data) {
                    (200, Some(data)) => Ok(data.task_id),
                    (code, _) => bail!("API error {}: {}", code, parsed.msg.unwrap_or_default()),
                }
            }
            .await;

            match result {
                Ok(task_id) => return Ok(task_id),
                Err(e) if attempt < CREATE_ATTEMPTS => {
                    let wait = Duration::from_secs(5 * attempt as u64);
                    warn!("createTask attempt {} failed: {:#}. Retrying in {:?}", attempt, e, wait);
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.context("createTask failed")),
            }
        }
    }

    async fn wait_for_result(&self, task_id: &str) -> anyhow::Result<String> {
        let url = format!("{}/recordInfo", self.base_url);
        let mut consecutive_errors = 0;

        for _ in 0..POLL_LIMIT {
            let polled: anyhow::Result<TaskRecord> = async {
                let resp = self
                    .client
                    .get(&url)
                    .bearer_auth(&self.api_key)
                    .query(&[("taskId", task_id)])
                    .send()
                    .await?;
                if resp.status().is_server_error() {
                    bail!("Server error {}", resp.status());
                }
                let parsed: ApiResponse<TaskRecord> = resp.json().await?;
                Ok(parsed.data.unwrap_or_default())
            }
            .await;

            match polled {
                Ok(record) => {
                    consecutive_errors = 0;
                    if let Some(audio_url) = poll_outcome(&record)? {
                        debug!("Task {} done: {}", task_id, audio_url);
                        return Ok(audio_url);
                    }
                    debug!("Status: {}", record.state.as_deref().unwrap_or("processing"));
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!("Poll error ({}): {:#}", consecutive_errors, e);
                    if consecutive_errors >= MAX_POLL_ERRORS {
                        bail!("Too many consecutive poll errors: {:#}", e);
                    }
                }
            }
            sleep(self.poll_interval).await;
        }
        bail!("Timeout waiting for generation of task {}", task_id)
    }

    async fn download(&self, url: &str, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut resp = self.client.get(url).send().await?.error_for_status()?;
        let mut file = fs::File::create(path).await?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Synthesizes up to `MAX_TEXT_CHARS` characters into one audio file.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        settings: &VoiceSettings,
        output: &Path,
    ) -> anyhow::Result<()> {
        let chars = text.chars().count();
        if chars > MAX_TEXT_CHARS {
            bail!("Text too long: {}/{} chars", chars, MAX_TEXT_CHARS);
        }
        let voice_id = resolve_voice(voice);
        info!("Creating task ({} chars, voice: {} → {})", chars, voice, voice_id);
        let task_id = self.create_task(text, &voice_id, settings).await?;
        info!("Task ID: {}; waiting for generation", task_id);
        let audio_url = self.wait_for_result(&task_id).await?;
        self.download(&audio_url, output).await?;
        info!("Saved: {}", output.display());
        Ok(())
    }

    /// Splits long text at sentence boundaries, synthesizes every chunk and
    /// joins the parts.
    pub async fn synthesize_long(
        &self,
        text: &str,
        voice: &str,
        settings: &VoiceSettings,
        output: &Path,
    ) -> anyhow::Result<()> {
        if text.chars().count() <= MAX_TEXT_CHARS {
            return self.synthesize(text, voice, settings, output).await;
        }
        let chunks = chunk_text(text, CHUNK_CHARS);
        info!("Text is {} chars; splitting into {} chunks", text.chars().count(), chunks.len());

        let parts_dir = part_dir(output);
        fs::create_dir_all(&parts_dir).await?;
        let ext = output.extension().and_then(|e| e.to_str()).unwrap_or("mp3");
        let mut parts = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let part = parts_dir.join(format!("part_{:03}.{}", i, ext));
            info!("Generating chunk {}/{} ({} chars)", i + 1, chunks.len(), chunk.chars().count());
            self.synthesize(chunk, voice, settings, &part).await?;
            parts.push(part);
        }

        let out = output.to_path_buf();
        tokio::task::spawn_blocking(move || ffmpeg::concat_audio(&parts, &out)).await??;
        fs::remove_dir_all(&parts_dir).await.ok();
        info!("Combined audio written to {}", output.display());
        Ok(())
    }
}

fn part_dir(output: &Path) -> PathBuf {
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("voiceover");
    output.with_file_name(format!("{}_parts", stem))
}

/// Applies an `atempo` change in place.
pub fn apply_tempo(path: &Path, tempo: f64) -> anyhow::Result<()> {
    if (tempo - 1.0).abs() < 1e-6 {
        return Ok(());
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("mp3");
    let tmp = path.with_extension(format!("tempo.{}", ext));
    ffmpeg::change_tempo(path, &tmp, tempo)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voices_resolve_case_insensitively() {
        assert_eq!(resolve_voice("callum"), "Callum");
        assert_eq!(resolve_voice(" LILY "), "Lily");
        assert_eq!(resolve_voice("EiNlNiXeDU1pqqOPrYMO"), "EiNlNiXeDU1pqqOPrYMO");
    }

    #[test]
    fn create_request_shape() {
        let settings = VoiceSettings::default();
        let req = CreateTaskRequest {
            model: MODEL,
            input: TtsInput {
                text: "Привет",
                voice: "Callum",
                stability: settings.stability,
                similarity_boost: settings.similarity_boost,
                style: settings.style,
                speed: settings.speed,
                timestamps: false,
                language_code: &settings.language,
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], MODEL);
        assert_eq!(json["input"]["voice"], "Callum");
        assert_eq!(json["input"]["timestamps"], false);
        assert_eq!(json["input"]["language_code"], "ru");
        assert_eq!(json["input"]["similarity_boost"], 0.75);
    }

    #[test]
    fn created_task_parses() {
        let resp: ApiResponse<CreatedTask> =
            serde_json::from_str(r#"{"code":200,"msg":"success","data":{"taskId":"abc123"}}"#).unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.data.unwrap().task_id, "abc123");
    }

    #[test]
    fn poll_outcomes() {
        let pending = TaskRecord { state: Some("generating".into()), ..Default::default() };
        assert_eq!(poll_outcome(&pending).unwrap(), None);

        let done = TaskRecord {
            state: Some("success".into()),
            result_json: Some(r#"{"resultUrls":["https://cdn/x.mp3"]}"#.into()),
            fail_msg: None,
        };
        assert_eq!(poll_outcome(&done).unwrap(), Some("https://cdn/x.mp3".to_string()));

        let empty = TaskRecord {
            state: Some("success".into()),
            result_json: Some(r#"{"resultUrls":[]}"#.into()),
            fail_msg: None,
        };
        assert!(poll_outcome(&empty).is_err());

        let failed = TaskRecord {
            state: Some("fail".into()),
            result_json: None,
            fail_msg: Some("quota".into()),
        };
        let err = poll_outcome(&failed).unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(KieTts::new("  ", DEFAULT_BASE_URL).is_err());
        assert!(KieTts::new("key", DEFAULT_BASE_URL).is_ok());
    }

    #[tokio::test]
    async fn too_long_text_is_rejected_before_any_request() {
        let tts = KieTts::new("key", "http://127.0.0.1:9").unwrap();
        let text = "a".repeat(MAX_TEXT_CHARS + 1);
        let err = tts
            .synthesize(&text, "Callum", &VoiceSettings::default(), Path::new("x.mp3"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Text too long"));
    }

    #[test]
    fn parts_live_next_to_output() {
        assert_eq!(part_dir(Path::new("out/voice.mp3")), PathBuf::from("out/voice_parts"));
    }
}
