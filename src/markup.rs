//! Inline markup for subtitle scripts.
//!
//! ```text
//! **word**             accent (large, white, glow)
//! *word*               highlight (medium, yellow, glow)
//! _word_               muted (small, gray)
//! [c:FF5500]word[/]    explicit color (hex or palette name)
//! [s:120]word[/]       explicit size in px
//! [c:red,s:80]word[/]  both
//! [img:path.png]       image overlay for the current page
//! ---                  page break (on its own line)
//! ```

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::debug;

pub const DEFAULT_SIZE: u32 = 72;
pub const ACCENT_SIZE: u32 = 110;
pub const HIGHLIGHT_SIZE: u32 = 88;
pub const MUTED_SIZE: u32 = 58;

static PAGE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*-{3,}[ \t]*$").expect("page break pattern"));

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
          (?P<img>\[img:[^\]]+\])
        | (?P<accent>\*\*[^*]+\*\*)
        | (?P<highlight>\*[^*]+\*)
        | (?P<muted>_[^_]+_)
        | (?P<custom>\[(?P<attrs>[^\]/][^\]]*)\](?P<inner>[^\[]+)\[/\])
        | (?P<plain>\S+)
        ",
    )
    .expect("token pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const WHITE: Rgb = Rgb(255, 255, 255);
    pub const GRAY: Rgb = Rgb(180, 180, 180);
    pub const YELLOW: Rgb = Rgb(255, 240, 60);
}

const PALETTE: &[(&str, Rgb)] = &[
    ("white", Rgb(255, 255, 255)),
    ("gray", Rgb(180, 180, 180)),
    ("grey", Rgb(180, 180, 180)),
    ("red", Rgb(255, 70, 90)),
    ("green", Rgb(50, 255, 130)),
    ("blue", Rgb(80, 160, 255)),
    ("yellow", Rgb(255, 240, 60)),
    ("orange", Rgb(255, 140, 40)),
    ("purple", Rgb(200, 100, 255)),
    ("pink", Rgb(255, 100, 180)),
    ("cyan", Rgb(60, 230, 255)),
    ("coral", Rgb(255, 120, 100)),
    ("lime", Rgb(180, 255, 60)),
    ("gold", Rgb(255, 215, 0)),
    ("rose", Rgb(255, 150, 180)),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordStyle {
    Normal,
    Accent,
    Highlight,
    Muted,
    Custom,
}

impl WordStyle {
    /// Styles drawn with a colored glow behind the text.
    pub fn glows(self) -> bool {
        matches!(self, WordStyle::Accent | WordStyle::Highlight | WordStyle::Custom)
    }
}

/// A unit of subtitle text with its style and, once aligned, its timing.
#[derive(Debug, Clone, PartialEq)]
pub struct StyledWord {
    pub text: String,
    pub color: Rgb,
    pub size: u32,
    pub style: WordStyle,
    pub start: f64,
    pub end: f64,
}

impl StyledWord {
    fn new(text: &str, color: Rgb, size: u32, style: WordStyle) -> Self {
        StyledWord {
            text: text.trim().to_string(),
            color,
            size,
            style,
            start: 0.0,
            end: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub words: Vec<StyledWord>,
    pub image: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub pages: Vec<Page>,
}

impl Script {
    pub fn words(&self) -> impl Iterator<Item = &StyledWord> {
        self.pages.iter().flat_map(|p| p.words.iter())
    }

    pub fn words_mut(&mut self) -> impl Iterator<Item = &mut StyledWord> {
        self.pages.iter_mut().flat_map(|p| p.words.iter_mut())
    }

    pub fn word_count(&self) -> usize {
        self.pages.iter().map(|p| p.words.len()).sum()
    }
}

/// Color from a palette name, `RRGGBB` or `#RRGGBB`. Unknown input is white.
pub fn parse_color(value: &str) -> Rgb {
    let value = value.trim().to_lowercase();
    if let Some((_, rgb)) = PALETTE.iter().find(|(name, _)| *name == value) {
        return *rgb;
    }
    let hex = value.strip_prefix('#').unwrap_or(&value);
    if hex.len() == 6 && hex.is_ascii() {
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        if let (Some(r), Some(g), Some(b)) = (channel(0), channel(2), channel(4)) {
            return Rgb(r, g, b);
        }
    }
    Rgb::WHITE
}

pub fn parse_script(text: &str) -> Script {
    let mut pages = Vec::new();
    for part in PAGE_BREAK.split(text) {
        let page = parse_page(part);
        if page.words.is_empty() && page.image.is_none() {
            continue;
        }
        pages.push(page);
    }
    debug!("Parsed {} pages from markup", pages.len());
    Script { pages }
}

fn parse_page(part: &str) -> Page {
    let mut page = Page::default();
    for caps in TOKEN.captures_iter(part) {
        let word = if let Some(m) = caps.name("img") {
            let path = m.as_str()["[img:".len()..m.as_str().len() - 1].trim();
            if !path.is_empty() {
                page.image = Some(PathBuf::from(path));
            }
            continue;
        } else if let Some(m) = caps.name("accent") {
            let s = m.as_str();
            StyledWord::new(&s[2..s.len() - 2], Rgb::WHITE, ACCENT_SIZE, WordStyle::Accent)
        } else if let Some(m) = caps.name("highlight") {
            let s = m.as_str();
            StyledWord::new(&s[1..s.len() - 1], Rgb::YELLOW, HIGHLIGHT_SIZE, WordStyle::Highlight)
        } else if let Some(m) = caps.name("muted") {
            let s = m.as_str();
            StyledWord::new(&s[1..s.len() - 1], Rgb::GRAY, MUTED_SIZE, WordStyle::Muted)
        } else if let (Some(attrs), Some(inner)) = (caps.name("attrs"), caps.name("inner")) {
            let (color, size) = parse_attrs(attrs.as_str());
            StyledWord::new(inner.as_str(), color, size, WordStyle::Custom)
        } else if let Some(m) = caps.name("plain") {
            StyledWord::new(m.as_str(), Rgb::WHITE, DEFAULT_SIZE, WordStyle::Normal)
        } else {
            continue;
        };
        if !word.text.is_empty() {
            page.words.push(word);
        }
    }
    page
}

fn parse_attrs(attrs: &str) -> (Rgb, u32) {
    let mut color = Rgb::WHITE;
    let mut size = DEFAULT_SIZE;
    for attr in attrs.split(',').map(str::trim) {
        if let Some(c) = attr.strip_prefix("c:") {
            color = parse_color(c);
        } else if let Some(s) = attr.strip_prefix("s:") {
            if let Ok(px) = s.trim().parse::<u32>() {
                size = px;
            }
        }
    }
    (color, size)
}

/// Plain text for voiceover: markup removed, one paragraph per page.
pub fn strip_markup(text: &str) -> String {
    parse_script(text)
        .pages
        .iter()
        .filter(|p| !p.words.is_empty())
        .map(|p| {
            p.words
                .iter()
                .map(|w| w.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_style() {
        let script = parse_script("Hello **big** *warm* _quiet_ [c:red,s:80]custom[/]");
        let words = &script.pages[0].words;
        assert_eq!(words.len(), 5);
        assert_eq!(words[0].style, WordStyle::Normal);
        assert_eq!(words[0].size, DEFAULT_SIZE);
        assert_eq!(words[1].text, "big");
        assert_eq!(words[1].size, ACCENT_SIZE);
        assert_eq!(words[2].color, Rgb::YELLOW);
        assert_eq!(words[3].size, MUTED_SIZE);
        assert_eq!(words[4].style, WordStyle::Custom);
        assert_eq!(words[4].color, Rgb(255, 70, 90));
        assert_eq!(words[4].size, 80);
    }

    #[test]
    fn page_breaks_split_pages_and_drop_empty_ones() {
        let script = parse_script("one two\n---\nthree\n---\n\n---\nfour");
        assert_eq!(script.pages.len(), 3);
        assert_eq!(script.pages[1].words[0].text, "three");
        assert_eq!(script.word_count(), 4);
    }

    #[test]
    fn dashes_inside_a_line_are_words() {
        let script = parse_script("wait --- what");
        assert_eq!(script.pages.len(), 1);
        assert_eq!(script.pages[0].words.len(), 3);
    }

    #[test]
    fn image_marker_attaches_to_page() {
        let script = parse_script("first\n---\n[img:pics/cat.png] second page");
        assert!(script.pages[0].image.is_none());
        assert_eq!(script.pages[1].image, Some(PathBuf::from("pics/cat.png")));
        assert_eq!(script.pages[1].words.len(), 2);
    }

    #[test]
    fn highlight_span_keeps_inner_spaces() {
        let script = parse_script("*two words* after");
        assert_eq!(script.pages[0].words[0].text, "two words");
        assert_eq!(script.pages[0].words[1].text, "after");
    }

    #[test]
    fn underscores_inside_words_are_plain() {
        let script = parse_script("snake_case_word");
        assert_eq!(script.pages[0].words[0].style, WordStyle::Normal);
        assert_eq!(script.pages[0].words[0].text, "snake_case_word");
    }

    #[test]
    fn color_forms() {
        assert_eq!(parse_color("gold"), Rgb(255, 215, 0));
        assert_eq!(parse_color(" GREY "), Rgb::GRAY);
        assert_eq!(parse_color("FF5500"), Rgb(255, 85, 0));
        assert_eq!(parse_color("#00ff00"), Rgb(0, 255, 0));
        assert_eq!(parse_color("nonsense"), Rgb::WHITE);
        assert_eq!(parse_color("zz0000"), Rgb::WHITE);
    }

    #[test]
    fn bad_size_keeps_default() {
        let script = parse_script("[s:huge]word[/]");
        assert_eq!(script.pages[0].words[0].size, DEFAULT_SIZE);
    }

    #[test]
    fn strip_markup_yields_paragraphs() {
        let plain = strip_markup("**Hi** _there_\n---\n[img:a.png] [c:blue]you[/]");
        assert_eq!(plain, "Hi there\n\nyou");
    }
}
