use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "reelsmith", about = "Styled-subtitle Reels toolkit")]
pub struct Args {
    /// JSON settings file; missing file means built-in defaults
    #[clap(long, global = true, default_value = crate::config::SETTINGS_PATH)]
    pub settings: PathBuf,

    #[clap(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Render a video with animated subtitles from a markup script
    Render(RenderArgs),
    /// Synthesize a voiceover for a script
    Tts(TtsArgs),
    /// Transcribe audio into word timestamps
    Timestamps(TimestampsArgs),
    /// Report script words that do not match the timestamps
    Validate(ValidateArgs),
    /// Download Instagram media through the download site
    Download(DownloadArgs),
    /// Analyze a directory of background videos into catalog.json
    Catalog(CatalogArgs),
    /// Check a rendered video for missing subtitles
    Check(CheckArgs),
}

#[derive(clap::Args, Debug)]
pub struct RenderArgs {
    pub script: PathBuf,

    pub audio: PathBuf,

    /// Defaults to `<audio stem>_timestamps.json` next to the audio
    pub timestamps: Option<PathBuf>,

    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Background video; repeat to rotate several
    #[clap(long = "bg")]
    pub backgrounds: Vec<PathBuf>,

    /// Directory of backgrounds (uses catalog.json order when present)
    #[clap(long)]
    pub bg_dir: Option<PathBuf>,

    #[clap(long)]
    pub hook: Option<PathBuf>,

    /// Cap on how much of the hook video is used, in seconds
    #[clap(long)]
    pub hook_max: Option<f64>,

    /// Freeze-frame duration after the hook, in seconds
    #[clap(long)]
    pub freeze: Option<f64>,

    #[clap(long)]
    pub music: Option<PathBuf>,

    #[clap(long)]
    pub music_volume: Option<f64>,

    #[clap(long)]
    pub font: Option<PathBuf>,

    #[clap(long)]
    pub fps: Option<u32>,

    /// Worker threads for compositing; defaults to all cores
    #[clap(long)]
    pub threads: Option<usize>,

    /// Also write the aligned words as an SRT file
    #[clap(long)]
    pub srt: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct TtsArgs {
    /// Text to speak, or a script file; markup is stripped before synthesis
    pub input: Option<String>,

    #[clap(short, long, default_value = "voiceover.mp3")]
    pub output: PathBuf,

    /// Preset name or raw voice ID
    #[clap(long)]
    pub voice: Option<String>,

    #[clap(long, default_value_t = 0.5)]
    pub stability: f64,

    #[clap(long, default_value_t = 0.75)]
    pub similarity: f64,

    #[clap(long, default_value_t = 0.0)]
    pub style: f64,

    #[clap(long, default_value_t = 1.0)]
    pub speed: f64,

    #[clap(long)]
    pub language: Option<String>,

    /// Speed the finished audio up (or down) with ffmpeg's atempo
    #[clap(long)]
    pub tempo: Option<f64>,

    #[clap(long)]
    pub list_voices: bool,

    #[clap(long, env = "KIE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct TimestampsArgs {
    pub audio: PathBuf,

    #[clap(short, long)]
    pub output: Option<PathBuf>,

    #[clap(long)]
    pub language: Option<String>,

    /// Number of words to print after transcription
    #[clap(long, default_value_t = 20)]
    pub preview: usize,

    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct ValidateArgs {
    pub script: PathBuf,

    pub timestamps: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    pub urls: Vec<String>,

    /// File with one Instagram URL per line
    #[clap(short, long)]
    pub file: Option<PathBuf>,

    /// Saved Instagram page (profile, saved posts) to take post and reel links from
    #[clap(long)]
    pub html: Option<PathBuf>,

    #[clap(short, long, default_value = "downloads")]
    pub output: PathBuf,

    #[clap(long, default_value_t = 3)]
    pub workers: usize,

    /// SOCKS5 proxies, one `host:port` per line
    #[clap(long)]
    pub proxy_file: Option<PathBuf>,

    #[clap(long, default_value = "./config/downloaded.json")]
    pub history: PathBuf,

    #[clap(long, default_value = crate::download::DEFAULT_SITE)]
    pub site: String,
}

#[derive(clap::Args, Debug)]
pub struct CatalogArgs {
    #[clap(default_value = "backgrounds")]
    pub dir: PathBuf,

    /// Re-analyze videos that are already in the catalog
    #[clap(long)]
    pub force: bool,
}

#[derive(clap::Args, Debug)]
pub struct CheckArgs {
    pub video: PathBuf,

    pub timestamps: PathBuf,

    /// Seconds of hook + freeze before the subtitles start
    #[clap(long, default_value_t = 0.0)]
    pub offset: f64,
}
