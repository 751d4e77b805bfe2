mod align;
mod args;
mod audio;
mod catalog;
mod check;
mod compose;
mod config;
mod download;
mod easing;
mod ffmpeg;
mod font;
mod layout;
mod markup;
mod render;
mod subtitle;
mod timeline;
mod transcribe;
mod tts;
mod utils;

use anyhow::{Context, bail};
use args::{Args, Cmd, DownloadArgs, TimestampsArgs, TtsArgs, ValidateArgs};
use clap::Parser;
use config::Settings;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.settings)?;

    match args.command {
        Cmd::Render(render_args) => {
            let job = render::RenderJob::from_args(render_args, &settings)?;
            info!("Rendering {} -> {}", job.script.display(), job.output.display());
            tokio::task::spawn_blocking(move || render::run(&job)).await??;
        }
        Cmd::Tts(tts_args) => run_tts(tts_args, &settings).await?,
        Cmd::Timestamps(ts_args) => run_timestamps(ts_args, &settings).await?,
        Cmd::Validate(validate_args) => {
            if !run_validate(&validate_args)? {
                std::process::exit(1);
            }
        }
        Cmd::Download(download_args) => run_download(download_args).await?,
        Cmd::Catalog(catalog_args) => {
            let dir = catalog_args.dir;
            let force = catalog_args.force;
            tokio::task::spawn_blocking(move || catalog::scan(&dir, force)).await??;
        }
        Cmd::Check(check_args) => {
            let gaps = tokio::task::spawn_blocking(move || {
                check::run(&check_args.video, &check_args.timestamps, check_args.offset)
            })
            .await??;
            if !gaps.is_empty() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

/// Reads `input` as a file when it names one, otherwise treats it as the text.
fn read_input(input: &str) -> anyhow::Result<String> {
    let path = Path::new(input);
    if path.is_file() {
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    } else {
        Ok(input.to_string())
    }
}

async fn run_tts(args: TtsArgs, settings: &Settings) -> anyhow::Result<()> {
    if args.list_voices {
        for name in tts::VOICES {
            println!("{}", name);
        }
        return Ok(());
    }
    let Some(input) = args.input.as_deref() else {
        bail!("Provide text or a script file to synthesize");
    };
    let text = markup::strip_markup(&read_input(input)?);
    if text.trim().is_empty() {
        bail!("Nothing to synthesize");
    }
    let Some(api_key) = args.api_key.as_deref() else {
        bail!("KIE_API_KEY not set");
    };

    let client = tts::KieTts::new(api_key, &settings.tts_base_url)?;
    let voice = args.voice.clone().unwrap_or_else(|| settings.voice.clone());
    let voice_settings = tts::VoiceSettings {
        stability: args.stability,
        similarity_boost: args.similarity,
        style: args.style,
        speed: args.speed,
        language: args.language.clone().unwrap_or_else(|| settings.language.clone()),
    };
    client
        .synthesize_long(&text, &voice, &voice_settings, &args.output)
        .await?;

    if let Some(tempo) = args.tempo {
        let output = args.output.clone();
        tokio::task::spawn_blocking(move || tts::apply_tempo(&output, tempo)).await??;
    }
    match audio::media_duration(&args.output) {
        Ok(d) => info!("Voiceover ready: {} ({:.1}s)", args.output.display(), d),
        Err(e) => warn!("Could not read duration of {}: {:#}", args.output.display(), e),
    }
    Ok(())
}

async fn run_timestamps(args: TimestampsArgs, settings: &Settings) -> anyhow::Result<()> {
    let Some(api_key) = args.api_key.as_deref() else {
        bail!("OPENAI_API_KEY not set");
    };
    let whisper = transcribe::Whisper::new(api_key, &settings.whisper_base_url)?;
    let language = args.language.as_deref().unwrap_or(&settings.language);
    let transcript = whisper.transcribe(&args.audio, language).await?;

    let output = args
        .output
        .unwrap_or_else(|| transcribe::default_output_path(&args.audio));
    if !transcribe::save(&transcript, &output)? {
        return Ok(());
    }
    transcribe::log_preview(&transcript, args.preview);
    info!("Saved {} word timestamps to {}", transcript.words.len(), output.display());
    Ok(())
}

/// Returns false when some script words have no matching timestamp.
fn run_validate(args: &ValidateArgs) -> anyhow::Result<bool> {
    let text = fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;
    let script = markup::parse_script(&text);
    let timestamps = align::load_timestamps(&args.timestamps)?;
    info!("Script: {} words, timestamps: {} entries", script.word_count(), timestamps.len());

    let issues = align::validate(&script, &timestamps);
    if issues.is_empty() {
        info!("All script words match the timestamps");
        return Ok(true);
    }
    for issue in &issues {
        error!(
            "Word {} '{}' not found (from timestamp {}, {} left). Nearby: {:?}",
            issue.word_index, issue.word, issue.skipped_from, issue.skipped_count, issue.nearby
        );
        info!("  Suggestion: {}", issue.suggestion());
    }
    error!("{} word(s) do not match", issues.len());
    Ok(false)
}

async fn run_download(args: DownloadArgs) -> anyhow::Result<()> {
    let urls = download::collect_urls(&args.urls, args.file.as_deref(), args.html.as_deref())?;
    let proxies = match &args.proxy_file {
        Some(path) => download::ProxyPool::load(path)?,
        None => download::ProxyPool::default(),
    };
    if proxies.is_empty() {
        info!("No proxies configured; connecting directly");
    }
    let history = download::DownloadHistory::load(&args.history)?;
    let downloader = Arc::new(download::Downloader::new(
        &args.site,
        &args.output,
        args.workers,
        proxies,
        history,
    )?);
    let results = downloader.download_all(urls).await?;
    if download::all_failed(&results) {
        bail!("None of the {} URLs could be downloaded", results.len());
    }
    if results.iter().any(|r| !r.succeeded()) {
        warn!("Some downloads failed");
    }
    Ok(())
}
