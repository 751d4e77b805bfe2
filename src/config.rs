use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SETTINGS_PATH: &str = "./config/settings.json";

/// Render and service defaults; every field may be omitted from the JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub font: PathBuf,
    pub fps: u32,
    pub freeze: f64,
    pub music_volume: f64,
    pub preset: String,
    pub voice: String,
    pub language: String,
    pub tts_base_url: String,
    pub whisper_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            font: PathBuf::from("./fonts/Montserrat-Bold.ttf"),
            fps: 30,
            freeze: crate::timeline::DEFAULT_FREEZE,
            music_volume: 0.12,
            preset: "medium".to_string(),
            voice: crate::tts::DEFAULT_VOICE.to_string(),
            language: "ru".to_string(),
            tts_base_url: crate::tts::DEFAULT_BASE_URL.to_string(),
            whisper_base_url: crate::transcribe::DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl Settings {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!("No settings file at {}; using defaults", path.display());
            return Ok(Settings::default());
        }
        let data = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("Invalid settings file {}: {}", path.display(), e))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let s = Settings::load(Path::new("/no/such/settings.json")).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.fps, 30);
    }

    #[test]
    fn partial_file_overrides_some_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"fps": 60, "music_volume": 0.2}"#).unwrap();
        let s = Settings::load(&path).unwrap();
        assert_eq!(s.fps, 60);
        assert_eq!(s.music_volume, 0.2);
        assert_eq!(s.freeze, crate::timeline::DEFAULT_FREEZE);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid settings file"));
    }
}
