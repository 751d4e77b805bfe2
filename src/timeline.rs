//! Hook → freeze-frame → main content sequencing and the matching audio mix.

use std::path::PathBuf;

pub const DEFAULT_FREEZE: f64 = 0.6;
pub const CROSSFADE: f64 = 0.35;
pub const MAIN_TAIL: f64 = 0.5;
const VOICE_FADE_IN: f64 = 0.15;
const MUSIC_FADE_OUT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment {
    /// Playing the hook video; local time into the hook.
    Hook(f64),
    /// Holding the last hook frame; progress 0..1 through the freeze.
    Freeze(f64),
    /// Main content; local time aligned with the voiceover.
    Main(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub hook: f64,
    pub freeze: f64,
    pub main: f64,
    pub fps: u32,
}

impl Timeline {
    /// `hook` is the hook video duration (0 without a hook); freeze is only
    /// used after a hook.
    pub fn new(hook: f64, freeze: f64, voice: f64, fps: u32) -> Self {
        let hook = hook.max(0.0);
        Timeline {
            hook,
            freeze: if hook > 0.0 { freeze.max(0.0) } else { 0.0 },
            main: voice.max(0.0) + MAIN_TAIL,
            fps: fps.max(1),
        }
    }

    pub fn main_start(&self) -> f64 {
        self.hook + self.freeze
    }

    pub fn total(&self) -> f64 {
        self.main_start() + self.main
    }

    pub fn frame_count(&self) -> u64 {
        (self.total() * self.fps as f64).ceil() as u64
    }

    pub fn frame_time(&self, index: u64) -> f64 {
        index as f64 / self.fps as f64
    }

    pub fn locate(&self, t: f64) -> Segment {
        if t < self.hook {
            Segment::Hook(t)
        } else if t < self.main_start() {
            Segment::Freeze(((t - self.hook) / self.freeze.max(1e-9)).clamp(0.0, 1.0))
        } else {
            Segment::Main(t - self.main_start())
        }
    }
}

/// Audio sources for the final mux, in ffmpeg input order after the video pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPlan {
    pub voice: PathBuf,
    pub hook: Option<PathBuf>,
    pub music: Option<PathBuf>,
    pub music_volume: f64,
}

impl AudioPlan {
    /// Extra ffmpeg input arguments; input 0 is the raw video pipe.
    pub fn input_args(&self) -> Vec<String> {
        let mut args = vec!["-i".to_string(), self.voice.to_string_lossy().to_string()];
        if let Some(hook) = &self.hook {
            args.extend(["-i".to_string(), hook.to_string_lossy().to_string()]);
        }
        if let Some(music) = &self.music {
            args.extend([
                "-stream_loop".to_string(),
                "-1".to_string(),
                "-i".to_string(),
                music.to_string_lossy().to_string(),
            ]);
        }
        args
    }

    /// Filter graph producing `[aout]`.
    pub fn filter_graph(&self, timeline: &Timeline) -> String {
        let total = timeline.total();
        let delay_ms = (timeline.main_start() * 1000.0).round() as u64;
        let mut chains = vec![format!(
            "[1:a]afade=t=in:st=0:d={VOICE_FADE_IN},adelay={delay_ms}|{delay_ms},apad,atrim=0:{total:.3}[voice]"
        )];
        let mut labels = vec!["[voice]"];
        let mut next_input = 2;

        if self.hook.is_some() {
            let keep = timeline.hook + timeline.freeze + CROSSFADE;
            let fade = timeline.freeze + CROSSFADE;
            chains.push(format!(
                "[{next_input}:a]atrim=0:{keep:.3},asetpts=PTS-STARTPTS,afade=t=out:st={:.3}:d={fade:.3}[hook]",
                timeline.hook
            ));
            labels.push("[hook]");
            next_input += 1;
        }

        if self.music.is_some() {
            let fade_start = (total - MUSIC_FADE_OUT).max(0.0);
            chains.push(format!(
                "[{next_input}:a]atrim=0:{total:.3},asetpts=PTS-STARTPTS,volume={:.3},afade=t=out:st={fade_start:.3}:d={MUSIC_FADE_OUT}[music]",
                self.music_volume
            ));
            labels.push("[music]");
        }

        if labels.len() == 1 {
            chains.push("[voice]anull[aout]".to_string());
        } else {
            chains.push(format!(
                "{}amix=inputs={}:duration=first:dropout_transition=0:normalize=0[aout]",
                labels.concat(),
                labels.len()
            ));
        }
        chains.join(";")
    }
}
