use crate::align::clean_word;
use crate::markup::{Page, Script, StyledWord};
use std::path::PathBuf;
use tracing::debug;

pub const MIN_WORD_SIZE: u32 = 50;
const SHRINK_STEP: u32 = 4;
const SHRINK_MARGIN: f32 = 40.0;

/// Short words that must not be left hanging at the end of a row.
pub const ORPHAN_WORDS: &[&str] = &[
    "от", "в", "на", "с", "и", "а", "к", "у", "о", "за", "из", "по", "до", "не", "но", "же", "бы",
];

pub fn is_orphan_word(text: &str) -> bool {
    let cleaned = clean_word(text);
    ORPHAN_WORDS.contains(&cleaned.as_str())
}

/// Width and height in pixels of `text` rendered at `size` px.
pub trait TextMeasure {
    fn measure(&self, text: &str, size: u32) -> (f32, f32);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextArea {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub gap_x: f32,
    pub gap_y: f32,
}

impl Default for TextArea {
    fn default() -> Self {
        TextArea {
            x: 60.0,
            y: 700.0,
            width: 960.0,
            height: 520.0,
            gap_x: 20.0,
            gap_y: 25.0,
        }
    }
}

impl TextArea {
    fn right(&self) -> f32 {
        self.x + self.width
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedWord {
    pub word: StyledWord,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub row: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaidPage {
    pub words: Vec<PlacedWord>,
    pub image: Option<PathBuf>,
}

impl LaidPage {
    pub fn start(&self) -> Option<f64> {
        self.words.iter().map(|w| w.word.start).reduce(f64::min)
    }
}

struct Row {
    words: Vec<PlacedWord>,
    height: f32,
}

/// Accumulates rows for one output page.
struct PageBuilder<'a> {
    area: &'a TextArea,
    rows: Vec<Row>,
    current: Vec<PlacedWord>,
    current_height: f32,
    cursor_x: f32,
    image: Option<PathBuf>,
}

impl<'a> PageBuilder<'a> {
    fn new(area: &'a TextArea, image: Option<PathBuf>) -> Self {
        PageBuilder {
            area,
            rows: Vec::new(),
            current: Vec::new(),
            current_height: 0.0,
            cursor_x: area.x,
            image,
        }
    }

    fn close_row(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.rows.push(Row {
            words: std::mem::take(&mut self.current),
            height: self.current_height,
        });
        self.current_height = 0.0;
        self.cursor_x = self.area.x;
    }

    fn closed_height(&self) -> f32 {
        self.rows.iter().map(|r| r.height + self.area.gap_y).sum()
    }

    fn place(&mut self, word: StyledWord, width: f32, height: f32) {
        let row = self.rows.len();
        self.current.push(PlacedWord {
            word,
            x: self.cursor_x,
            y: 0.0,
            width,
            height,
            row,
        });
        self.current_height = self.current_height.max(height);
        self.cursor_x += width + self.area.gap_x;
    }

    fn finish(mut self) -> Option<LaidPage> {
        self.close_row();
        if self.rows.is_empty() && self.image.is_none() {
            return None;
        }
        let mut words = Vec::new();
        let mut y = self.area.y;
        for row in self.rows {
            let offset = match row.words.last() {
                Some(last) => ((self.area.width - (last.x + last.width - self.area.x)) / 2.0).floor(),
                None => 0.0,
            };
            for mut w in row.words {
                w.x += offset;
                w.y = y;
                words.push(w);
            }
            y += row.height + self.area.gap_y;
        }
        Some(LaidPage {
            words,
            image: self.image,
        })
    }
}

fn fit_word(word: &mut StyledWord, area: &TextArea, measure: &impl TextMeasure) -> (f32, f32) {
    let (mut w, mut h) = measure.measure(&word.text, word.size);
    while w > area.width - SHRINK_MARGIN && word.size > MIN_WORD_SIZE {
        word.size = word.size.saturating_sub(SHRINK_STEP).max(MIN_WORD_SIZE);
        (w, h) = measure.measure(&word.text, word.size);
    }
    (w, h)
}

fn layout_page(page: &Page, area: &TextArea, measure: &impl TextMeasure, out: &mut Vec<LaidPage>) {
    let mut builder = PageBuilder::new(area, page.image.clone());

    for (i, source) in page.words.iter().enumerate() {
        let mut word = source.clone();
        let (w, h) = fit_word(&mut word, area, measure);

        let mut new_row = builder.cursor_x + w > area.right() && !builder.current.is_empty();

        if !new_row && !builder.current.is_empty() && is_orphan_word(&word.text) {
            if let Some(next) = page.words.get(i + 1) {
                let (next_w, _) = fit_word(&mut next.clone(), area, measure);
                let fits_after = builder.cursor_x + w + area.gap_x + next_w <= area.right();
                let fits_together = w + area.gap_x + next_w <= area.width;
                if !fits_after && fits_together {
                    new_row = true;
                }
            }
        }

        if new_row {
            builder.close_row();
        }

        if builder.current.is_empty()
            && !builder.rows.is_empty()
            && builder.closed_height() + h > area.height
        {
            if let Some(full) = std::mem::replace(&mut builder, PageBuilder::new(area, None)).finish() {
                out.push(full);
            }
        }

        builder.place(word, w, h);
    }

    if let Some(last) = builder.finish() {
        out.push(last);
    }
}

/// Lays out every page of the script, splitting pages that overflow the area.
pub fn layout_script(script: &Script, area: &TextArea, measure: &impl TextMeasure) -> Vec<LaidPage> {
    let mut pages = Vec::new();
    for page in &script.pages {
        layout_page(page, area, measure, &mut pages);
    }
    debug!("Layout produced {} pages from {} script pages", pages.len(), script.pages.len());
    pages
}
