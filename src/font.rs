use crate::layout::TextMeasure;
use anyhow::{Context, anyhow};
use fontdue::{Font, FontSettings, Metrics};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use tracing::info;

const MIN_PX: u32 = 30;
const MAX_PX: u32 = 148;

thread_local! {
    static GLYPHS: RefCell<HashMap<(char, u32), Rc<(Metrics, Vec<u8>)>>> = RefCell::new(HashMap::new());
}

/// A single TTF face used for all subtitle text.
///
/// Sizes are snapped to even pixel sizes between 30 and 148 so rasterised
/// glyphs can be cached per worker thread.
pub struct FontBank {
    font: Font,
}

impl FontBank {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("Failed to read font {}", path.display()))?;
        let font = Font::from_bytes(bytes, FontSettings::default())
            .map_err(|e| anyhow!("Failed to parse font {}: {}", path.display(), e))?;
        info!("Loaded font {}", path.display());
        Ok(FontBank { font })
    }

    pub fn snap(size: u32) -> u32 {
        let clamped = size.clamp(MIN_PX, MAX_PX);
        clamped - clamped % 2
    }

    fn ascent_descent(&self, px: u32) -> (f32, f32) {
        match self.font.horizontal_line_metrics(px as f32) {
            Some(m) => (m.ascent, m.descent),
            None => (px as f32 * 0.8, -(px as f32) * 0.2),
        }
    }

    fn glyph(&self, c: char, px: u32) -> Rc<(Metrics, Vec<u8>)> {
        GLYPHS.with(|cache| {
            cache
                .borrow_mut()
                .entry((c, px))
                .or_insert_with(|| Rc::new(self.font.rasterize(c, px as f32)))
                .clone()
        })
    }

    /// Walks the coverage of every glyph of `text` whose line box has its
    /// top-left corner at (`x`, `y`). `plot` receives pixel coordinates and
    /// coverage in 0..=1.
    pub fn for_each_pixel(&self, text: &str, size: u32, x: f32, y: f32, mut plot: impl FnMut(i32, i32, f32)) {
        let px = Self::snap(size);
        let (ascent, _) = self.ascent_descent(px);
        let baseline = y + ascent;
        let mut pen = x;
        let mut prev: Option<char> = None;

        for c in text.chars() {
            if let Some(p) = prev {
                pen += self.font.horizontal_kern(p, c, px as f32).unwrap_or(0.0);
            }
            let glyph = self.glyph(c, px);
            let (m, bitmap) = (&glyph.0, &glyph.1);
            let left = (pen + m.xmin as f32).round() as i32;
            let top = (baseline - m.height as f32 - m.ymin as f32).round() as i32;
            for row in 0..m.height {
                for col in 0..m.width {
                    let coverage = bitmap[row * m.width + col];
                    if coverage > 0 {
                        plot(left + col as i32, top + row as i32, coverage as f32 / 255.0);
                    }
                }
            }
            pen += m.advance_width;
            prev = Some(c);
        }
    }
}

impl TextMeasure for FontBank {
    fn measure(&self, text: &str, size: u32) -> (f32, f32) {
        let px = Self::snap(size);
        let mut width = 0.0;
        let mut prev: Option<char> = None;
        for c in text.chars() {
            if let Some(p) = prev {
                width += self.font.horizontal_kern(p, c, px as f32).unwrap_or(0.0);
            }
            width += self.font.metrics(c, px as f32).advance_width;
            prev = Some(c);
        }
        let (ascent, descent) = self.ascent_descent(px);
        (width.ceil(), (ascent - descent).ceil())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_clamps_and_evens() {
        assert_eq!(FontBank::snap(72), 72);
        assert_eq!(FontBank::snap(73), 72);
        assert_eq!(FontBank::snap(10), 30);
        assert_eq!(FontBank::snap(400), 148);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = FontBank::load(Path::new("/definitely/not/here.ttf")).err().unwrap();
        assert!(err.to_string().contains("Failed to read font"));
    }
}
