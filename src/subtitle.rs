use crate::markup::StyledWord;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// One cue per aligned word.
pub fn build_srt_entries<'a>(words: impl Iterator<Item = &'a StyledWord>) -> Vec<(f64, f64, String)> {
    words
        .map(|w| (w.start, w.end.max(w.start), w.text.clone()))
        .collect()
}

pub fn write_srt(path: &Path, entries: &[(f64, f64, String)]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut f = BufWriter::new(File::create(path)?);
    for (i, (start, end, text)) in entries.iter().enumerate() {
        writeln!(f, "{}", i + 1)?;
        writeln!(f, "{} --> {}", format_srt_time(*start), format_srt_time(*end))?;
        for line in wrap_text(text, 42) {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;
    }
    f.flush()?;
    Ok(())
}

pub fn write_word_srt<'a>(path: &Path, words: impl Iterator<Item = &'a StyledWord>) -> anyhow::Result<()> {
    let entries = build_srt_entries(words);
    write_srt(path, &entries)?;
    info!("Wrote {} subtitle cues to {}", entries.len(), path.display());
    Ok(())
}

fn format_srt_time(seconds: f64) -> String {
    let ms = (seconds.max(0.0) * 1000.0).round() as u64;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        ms / 3_600_000,
        ms / 60_000 % 60,
        ms / 1000 % 60,
        ms % 1000
    )
}

/// Custom spans can hold several words; long ones are wrapped.
fn wrap_text(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if current.chars().count() + word.chars().count() + 1 > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::parse_script;

    #[test]
    fn srt_time_format() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(3661.25), "01:01:01,250");
        assert_eq!(format_srt_time(-1.0), "00:00:00,000");
    }

    #[test]
    fn wraps_long_spans() {
        let lines = wrap_text("one two three four", 9);
        assert_eq!(lines, vec!["one two", "three", "four"]);
    }

    #[test]
    fn writes_one_cue_per_word() {
        let mut script = parse_script("**Hello** world");
        for (i, w) in script.words_mut().enumerate() {
            w.start = i as f64;
            w.end = i as f64 + 0.5;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs/out.srt");
        write_word_srt(&path, script.words()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "1\n00:00:00,000 --> 00:00:00,500\nHello\n\n2\n00:00:01,000 --> 00:00:01,500\nworld\n\n"
        );
    }
}
