//! PDF export of an analysis.
//!
//! The analysis is written line by line in a single built-in font, one fixed
//! line pitch, with a new page whenever the vertical space runs out. Markdown
//! markup is written as literal characters.

use printpdf::{BuiltinFont, Mm, PdfDocument};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::error::{FlowError, Result};

pub const REPORT_FILE_NAME: &str = "diagnosis_report.pdf";
const REPORT_TITLE: &str = "Medical Imaging Diagnosis Report";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageLayout {
    pub page_width_mm: f32,
    pub page_height_mm: f32,
    pub margin_top_mm: f32,
    pub margin_bottom_mm: f32,
    pub margin_left_mm: f32,
    pub line_height_mm: f32,
    pub font_size_pt: f32,
}

impl Default for PageLayout {
    /// A4 portrait, Helvetica 12pt on a 10mm pitch.
    fn default() -> Self {
        Self {
            page_width_mm: 210.0,
            page_height_mm: 297.0,
            margin_top_mm: 20.0,
            margin_bottom_mm: 20.0,
            margin_left_mm: 15.0,
            line_height_mm: 10.0,
            font_size_pt: 12.0,
        }
    }
}

impl PageLayout {
    pub fn lines_per_page(&self) -> usize {
        let usable = self.page_height_mm - self.margin_top_mm - self.margin_bottom_mm;
        ((usable / self.line_height_mm).floor() as usize).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub bytes: Vec<u8>,
    pub page_count: usize,
}

/// Splits the analysis into pages of at most `lines_per_page` lines.
/// An empty analysis still yields one (blank) page.
pub fn paginate<'a>(text: &'a str, layout: &PageLayout) -> Vec<Vec<&'a str>> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return vec![Vec::new()];
    }
    lines
        .chunks(layout.lines_per_page())
        .map(|chunk| chunk.to_vec())
        .collect()
}

pub fn render_pdf(text: &str, layout: &PageLayout) -> Result<RenderedReport> {
    let pages = paginate(text, layout);
    let width = Mm(layout.page_width_mm);
    let height = Mm(layout.page_height_mm);

    let (doc, first_page, first_layer) = PdfDocument::new(REPORT_TITLE, width, height, "Layer 1");
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| FlowError::Report(e.to_string()))?;

    let mut targets = vec![(first_page, first_layer)];
    for _ in 1..pages.len() {
        targets.push(doc.add_page(width, height, "Layer 1"));
    }

    for ((page, layer), lines) in targets.into_iter().zip(pages.iter()) {
        let canvas = doc.get_page(page).get_layer(layer);
        let mut baseline = layout.page_height_mm - layout.margin_top_mm;
        for line in lines {
            canvas.use_text(
                to_font_charset(line.trim()),
                layout.font_size_pt,
                Mm(layout.margin_left_mm),
                Mm(baseline),
                &font,
            );
            baseline -= layout.line_height_mm;
        }
    }

    let page_count = pages.len();
    let bytes = doc
        .save_to_bytes()
        .map_err(|e| FlowError::Report(e.to_string()))?;

    Ok(RenderedReport { bytes, page_count })
}

/// Renders the report into a temp file under `dir`, reads it back and removes the file.
pub fn write_report(text: &str, layout: &PageLayout, dir: &Path) -> Result<RenderedReport> {
    let rendered = render_pdf(text, layout)?;

    let mut file = tempfile::Builder::new()
        .prefix("diagnosis_report_")
        .suffix(".pdf")
        .tempfile_in(dir)?;
    file.write_all(&rendered.bytes)?;
    file.flush()?;

    let bytes = std::fs::read(file.path())?;
    info!(
        "Generated PDF report: {} page(s), {} bytes",
        rendered.page_count,
        bytes.len()
    );

    Ok(RenderedReport {
        bytes,
        page_count: rendered.page_count,
    })
}

/// The built-in fonts only cover Latin-1.
fn to_font_charset(line: &str) -> String {
    line.chars()
        .map(|c| match c {
            '\t' => ' ',
            '\u{2022}' | '\u{2013}' | '\u{2014}' => '-',
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            c if (c as u32) < 0x20 => ' ',
            c if (c as u32) <= 0xFF => c,
            _ => '?',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_fits_25_lines() {
        assert_eq!(PageLayout::default().lines_per_page(), 25);
    }

    #[test]
    fn three_lines_fit_on_one_page_in_order() {
        let pages = paginate("A\nB\nC", &PageLayout::default());
        assert_eq!(pages, vec![vec!["A", "B", "C"]]);

        let rendered = render_pdf("A\nB\nC", &PageLayout::default()).unwrap();
        assert_eq!(rendered.page_count, 1);
        assert!(rendered.bytes.starts_with(b"%PDF"));
    }

    /// Text operands of every show-text operator on `page`, in content-stream order.
    fn shown_text(pdf: &[u8], page: u32) -> Vec<String> {
        let document = lopdf::Document::load_mem(pdf).unwrap();
        let page_id = document.get_pages()[&page];
        let content = document.get_page_content(page_id).unwrap();
        let operations = lopdf::content::Content::decode(&content).unwrap().operations;

        let mut shown = Vec::new();
        for op in operations {
            let strings: Vec<lopdf::Object> = match op.operator.as_str() {
                "Tj" => op.operands,
                "TJ" => op
                    .operands
                    .into_iter()
                    .flat_map(|o| o.as_array().cloned().unwrap_or_default())
                    .collect(),
                _ => continue,
            };
            let text: Vec<u8> = strings
                .iter()
                .filter_map(|o| o.as_str().ok())
                .flatten()
                .copied()
                .collect();
            shown.push(String::from_utf8_lossy(&text).into_owned());
        }
        shown
    }

    #[test]
    fn rendered_page_holds_lines_in_order() {
        let rendered = render_pdf("A\nB\nC", &PageLayout::default()).unwrap();
        assert_eq!(shown_text(&rendered.bytes, 1), vec!["A", "B", "C"]);
    }

    #[test]
    fn overflow_lines_start_the_next_page() {
        let layout = PageLayout::default();
        let text = (1..=layout.lines_per_page() + 2)
            .map(|i| format!("L{}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let rendered = render_pdf(&text, &layout).unwrap();
        assert_eq!(rendered.page_count, 2);
        assert_eq!(shown_text(&rendered.bytes, 1).len(), 25);
        assert_eq!(shown_text(&rendered.bytes, 2), vec!["L26", "L27"]);
    }

    #[test]
    fn page_count_is_ceiling_of_lines_over_capacity() {
        let layout = PageLayout::default();
        let per_page = layout.lines_per_page();
        for line_count in [1, per_page, per_page + 1, 2 * per_page, 2 * per_page + 1, 77] {
            let text = (0..line_count)
                .map(|i| format!("line {}", i))
                .collect::<Vec<_>>()
                .join("\n");
            let expected = line_count.div_ceil(per_page);
            assert_eq!(paginate(&text, &layout).len(), expected, "{} lines", line_count);
        }
    }

    #[test]
    fn pages_keep_markdown_literally() {
        let text = "### 1. Image Type & Region\n- **Modality**: X-ray";
        let pages = paginate(text, &PageLayout::default());
        assert_eq!(pages[0][1], "- **Modality**: X-ray");
    }

    #[test]
    fn empty_analysis_renders_one_blank_page() {
        let rendered = render_pdf("", &PageLayout::default()).unwrap();
        assert_eq!(rendered.page_count, 1);
    }

    #[test]
    fn unsupported_characters_are_replaced() {
        assert_eq!(to_font_charset("\u{2022} ok \u{1F9E0}"), "- ok ?");
        assert_eq!(to_font_charset("caf\u{E9}"), "caf\u{E9}");
    }

    #[test]
    fn write_report_cleans_up_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let text = (0..60).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let report = write_report(&text, &PageLayout::default(), dir.path()).unwrap();

        assert_eq!(report.page_count, 3);
        assert!(report.bytes.starts_with(b"%PDF"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
