use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)([^.!?]+[.!?]+)|([^.!?]+$)").expect("sentence pattern"));

static UNSAFE_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("filename pattern"));

/// Groups sentences into chunks of at most `max_chars` characters. A single
/// sentence longer than the limit is split at word boundaries.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    for m in SENTENCE.find_iter(text) {
        let s = m.as_str().trim();
        if !s.is_empty() {
            sentences.extend(split_long(s, max_chars));
        }
    }
    if sentences.is_empty() {
        warn!("No sentence breaks found; returning whole text as one chunk");
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for s in sentences {
        if current.is_empty() {
            current = s;
        } else if current.chars().count() + 1 + s.chars().count() <= max_chars {
            current.push(' ');
            current.push_str(&s);
        } else {
            chunks.push(std::mem::replace(&mut current, s));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    debug!("Created {} text chunks (max {} chars)", chunks.len(), max_chars);
    chunks
}

fn split_long(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }
    let mut parts = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            parts.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Replaces characters that are not allowed in file names.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = UNSAFE_FILENAME.replace_all(name.trim(), "_");
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_sentence_boundaries() {
        let text = "One two. Three four! Five six? Seven";
        let chunks = chunk_text(text, 20);
        assert_eq!(chunks, vec!["One two. Three four!", "Five six? Seven"]);
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("Hello there.", 4500), vec!["Hello there."]);
    }

    #[test]
    fn oversized_sentence_is_split_on_words() {
        let text = "aaaa bbbb cccc dddd";
        let chunks = chunk_text(text, 9);
        assert_eq!(chunks, vec!["aaaa bbbb", "cccc dddd"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 9));
    }

    #[test]
    fn counts_chars_not_bytes() {
        let text = "Привет мир. Как дела?";
        assert_eq!(chunk_text(text, 11), vec!["Привет мир.", "Как дела?"]);
    }

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(sanitize_filename("a/b:c*d?.mp4"), "a_b_c_d_.mp4");
        assert_eq!(sanitize_filename("  .. "), "file");
        assert_eq!(sanitize_filename("video.mp4"), "video.mp4");
    }
}
