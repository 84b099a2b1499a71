use crate::canvas::{Canvas, Document, RasterImage};
use crate::error::FormstampError;
use crate::font::{FontRegistry, RegisteredFont};
use crate::layout::{FormLayout, InkField};
use crate::template::Template;
use crate::types::{Pt, Rect, Size};
use crate::{pdf_raster, raster, stamp};

/// Which artifact a compose call produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pdf,
    Png,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Png => "png",
        }
    }
}

/// One finished artifact. Immutable once produced; the accumulator stores
/// these in generation order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDocument {
    pub filename: String,
    pub format: OutputFormat,
    pub bytes: Vec<u8>,
}

/// An ink image bound to one of the layout's ink slots.
#[derive(Debug, Clone)]
pub struct SignatureOverlay {
    pub field: InkField,
    pub image: RasterImage,
}

/// Everything one user action provides. Constructed fresh per action and
/// never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct CompositionRequest {
    pub department: String,
    pub reason: String,
    pub signatures: Vec<SignatureOverlay>,
}

impl CompositionRequest {
    pub fn new(department: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            department: department.into(),
            reason: reason.into(),
            signatures: Vec::new(),
        }
    }

    pub fn with_signature(mut self, field: InkField, image: RasterImage) -> Self {
        self.signatures.push(SignatureOverlay { field, image });
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedText {
    pub page_index: usize,
    pub x: Pt,
    /// Baseline measured from the page top.
    pub y: Pt,
    pub font_size: Pt,
    pub text: String,
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedInk {
    pub page_index: usize,
    pub rect: Rect,
    pub image: RasterImage,
}

/// The resolved overlay: every text line and ink image with its final
/// placement. Both output pipelines consume this one plan.
#[derive(Debug, Clone, Default)]
pub(crate) struct OverlayPlan {
    pub texts: Vec<PlannedText>,
    pub inks: Vec<PlannedInk>,
}

/// Resolves a request against the layout. Empty text fields are omitted;
/// absent and fully transparent ink images are equivalent and draw
/// nothing.
pub(crate) fn build_overlay_plan(
    layout: &FormLayout,
    request: &CompositionRequest,
    date_text: &str,
    reason_prefix: Option<&str>,
    registry: &FontRegistry,
    font_name: &str,
) -> OverlayPlan {
    let mut plan = OverlayPlan::default();

    plan.texts.push(PlannedText {
        page_index: layout.date.page_index,
        x: layout.date.x,
        y: layout.date.y,
        font_size: layout.date.font_size,
        text: date_text.to_string(),
    });

    if !request.department.trim().is_empty() {
        plan.texts.push(PlannedText {
            page_index: layout.department.page_index,
            x: layout.department.x,
            y: layout.department.y,
            font_size: layout.department.font_size,
            text: request.department.clone(),
        });
    }

    if !request.reason.trim().is_empty() {
        let slot = layout.reason;
        let full = match reason_prefix {
            Some(prefix) => format!("{prefix}{}", request.reason),
            None => request.reason.clone(),
        };
        let lines = wrap_text(registry, font_name, slot.font_size, slot.rect.width, &full);
        let bottom = slot.rect.y + slot.rect.height;
        for (index, line) in lines.into_iter().enumerate() {
            let baseline = slot.rect.y + slot.font_size + slot.leading * (index as i32);
            if baseline > bottom {
                // Text past the box is dropped, like the original's
                // fixed-size text box.
                break;
            }
            plan.texts.push(PlannedText {
                page_index: slot.page_index,
                x: slot.rect.x,
                y: baseline,
                font_size: slot.font_size,
                text: line,
            });
        }
    }

    for signature in &request.signatures {
        if signature.image.is_fully_transparent() {
            continue;
        }
        let slot = layout.ink_slot(signature.field);
        plan.inks.push(PlannedInk {
            page_index: slot.page_index,
            rect: slot.rect,
            image: signature.image.clone(),
        });
    }

    plan
}

/// Greedy line wrapping against measured widths. Breaks at any character,
/// which is the norm for CJK prose; explicit newlines are honored.
pub(crate) fn wrap_text(
    registry: &FontRegistry,
    font_name: &str,
    font_size: Pt,
    max_width: Pt,
    text: &str,
) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        if paragraph.is_empty() {
            lines.push(String::new());
            continue;
        }
        let mut current = String::new();
        for ch in paragraph.chars() {
            if current.is_empty() && ch == ' ' && !lines.is_empty() {
                continue;
            }
            let mut candidate = current.clone();
            candidate.push(ch);
            let width = registry.measure_text_width(font_name, font_size, &candidate);
            if width > max_width && !current.is_empty() {
                lines.push(std::mem::take(&mut current));
                if ch != ' ' {
                    current.push(ch);
                }
            } else {
                current = candidate;
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }
    lines
}

/// PDF pipeline: stamp the plan onto a fresh parse of the template.
pub(crate) fn compose_pdf_bytes(
    template: &Template,
    plan: &OverlayPlan,
    font: &RegisteredFont,
) -> Result<Vec<u8>, FormstampError> {
    match template {
        Template::Pdf { .. } => {
            let doc = template.open_pdf()?;
            stamp::stamp_overlay(doc, plan, font)
        }
        Template::Blank(_) => Err(FormstampError::InvalidConfiguration(
            "blank canvas template produces PNG only".to_string(),
        )),
    }
}

/// PNG pipeline: PDF templates are stamped, rasterized page by page and
/// stitched vertically; the blank-canvas variant renders the plan onto a
/// single white page.
pub(crate) fn compose_png_bytes(
    template: &Template,
    plan: &OverlayPlan,
    font: &RegisteredFont,
    registry: &FontRegistry,
    dpi: u32,
) -> Result<Vec<u8>, FormstampError> {
    match template {
        Template::Pdf { .. } => {
            let pdf = compose_pdf_bytes(template, plan, font)?;
            let pages = pdf_raster::pdf_bytes_to_png_pages(&pdf, dpi, Some(registry))?;
            raster::stitch_pages_vertical(&pages)
        }
        Template::Blank(size) => {
            let document = overlay_document(*size, plan, &font.name);
            let mut pages = raster::document_to_png_pages(&document, dpi, Some(registry))?;
            pages
                .pop()
                .ok_or_else(|| FormstampError::Pdf("no rendered page output".to_string()))
        }
    }
}

/// Draws the whole plan onto one blank page. Page indexes collapse: the
/// raster-only form is a single sheet.
fn overlay_document(size: Size, plan: &OverlayPlan, font_name: &str) -> Document {
    let mut canvas = Canvas::new(size);
    canvas.set_font_name(font_name);
    for text in &plan.texts {
        canvas.set_font_size(text.font_size);
        // DrawString y is the glyph-box top; the plan carries baselines.
        canvas.draw_string(text.x, text.y - text.font_size, text.text.clone());
    }
    for (index, ink) in plan.inks.iter().enumerate() {
        canvas.draw_image(
            ink.rect.x,
            ink.rect.y,
            ink.rect.width,
            ink.rect.height,
            format!("ink{index}"),
            ink.image.clone(),
        );
    }
    canvas.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FormLayout;

    fn empty_registry() -> FontRegistry {
        FontRegistry::new()
    }

    fn transparent_image() -> RasterImage {
        RasterImage::from_rgba8(4, 4, vec![0u8; 64]).expect("image")
    }

    fn opaque_image() -> RasterImage {
        RasterImage::from_rgba8(4, 4, vec![20u8, 20, 20, 255].repeat(16)).expect("image")
    }

    #[test]
    fn plan_always_carries_the_date() {
        let layout = FormLayout::default();
        let request = CompositionRequest::default();
        let plan = build_overlay_plan(
            &layout,
            &request,
            "2024.03.05",
            None,
            &empty_registry(),
            "F",
        );
        assert_eq!(plan.texts.len(), 1);
        assert_eq!(plan.texts[0].text, "2024.03.05");
        assert!(plan.inks.is_empty());
    }

    #[test]
    fn empty_fields_are_omitted_and_blank_strings_count_as_empty() {
        let layout = FormLayout::default();
        let request = CompositionRequest::new("  ", "");
        let plan = build_overlay_plan(
            &layout,
            &request,
            "2024.03.05",
            Some("理由："),
            &empty_registry(),
            "F",
        );
        assert_eq!(plan.texts.len(), 1);
    }

    #[test]
    fn reason_prefix_is_prepended_when_configured() {
        let layout = FormLayout::default();
        let request = CompositionRequest::new("内科", "违规");
        let plan = build_overlay_plan(
            &layout,
            &request,
            "2024.03.05",
            Some("扣分原因："),
            &empty_registry(),
            "F",
        );
        let reason_lines: Vec<&str> = plan
            .texts
            .iter()
            .filter(|t| t.page_index == layout.reason.page_index)
            .map(|t| t.text.as_str())
            .collect();
        assert!(reason_lines.concat().starts_with("扣分原因："));
    }

    #[test]
    fn transparent_signature_is_equivalent_to_absent() {
        let layout = FormLayout::default();
        let absent = CompositionRequest::new("内科", "x");
        let transparent = CompositionRequest::new("内科", "x")
            .with_signature(InkField::ChiefSignature, transparent_image());

        let registry = empty_registry();
        let plan_a = build_overlay_plan(&layout, &absent, "d", None, &registry, "F");
        let plan_b = build_overlay_plan(&layout, &transparent, "d", None, &registry, "F");
        assert!(plan_a.inks.is_empty());
        assert!(plan_b.inks.is_empty());
        assert_eq!(plan_a.texts.len(), plan_b.texts.len());
    }

    #[test]
    fn opaque_signature_lands_in_its_slot() {
        let layout = FormLayout::default();
        let request = CompositionRequest::new("内科", "")
            .with_signature(InkField::Score, opaque_image());
        let plan = build_overlay_plan(&layout, &request, "d", None, &empty_registry(), "F");
        assert_eq!(plan.inks.len(), 1);
        assert_eq!(plan.inks[0].rect, layout.score.rect);
        assert_eq!(plan.inks[0].page_index, layout.score.page_index);
    }

    // With no resolvable font every character measures half an em, so
    // wrapping math is exact and deterministic.
    #[test]
    fn wrap_text_breaks_at_measured_width() {
        let registry = empty_registry();
        let lines = wrap_text(
            &registry,
            "F",
            Pt::from_f32(10.0),
            Pt::from_f32(20.0),
            "abcdefghij",
        );
        assert_eq!(lines, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn wrap_text_honors_explicit_newlines() {
        let registry = empty_registry();
        let lines = wrap_text(
            &registry,
            "F",
            Pt::from_f32(10.0),
            Pt::from_f32(100.0),
            "ab\ncd",
        );
        assert_eq!(lines, vec!["ab", "cd"]);
    }

    #[test]
    fn reason_lines_past_the_box_are_dropped() {
        let mut layout = FormLayout::default();
        layout.reason.rect = Rect::new(0.0, 100.0, 20.0, 30.0);
        layout.reason.font_size = Pt::from_f32(10.0);
        layout.reason.leading = Pt::from_f32(12.0);
        let request = CompositionRequest::new("", "abcdefghijklmnopqrstuvwxyz");
        let plan = build_overlay_plan(&layout, &request, "d", None, &empty_registry(), "F");
        let reason_count = plan
            .texts
            .iter()
            .filter(|t| t.page_index == layout.reason.page_index)
            .count();
        // Baselines at 110 and 122 fit inside y=100..130; 134 does not.
        assert_eq!(reason_count, 2);
    }

    #[test]
    fn overlay_document_collapses_to_one_page() {
        let plan = OverlayPlan {
            texts: vec![PlannedText {
                page_index: 1,
                x: Pt::from_f32(10.0),
                y: Pt::from_f32(20.0),
                font_size: Pt::from_f32(12.0),
                text: "x".to_string(),
            }],
            inks: vec![PlannedInk {
                page_index: 1,
                rect: Rect::new(5.0, 5.0, 10.0, 10.0),
                image: opaque_image(),
            }],
        };
        let document = overlay_document(Size::a4(), &plan, "F");
        assert_eq!(document.pages.len(), 1);
        assert_eq!(document.images.len(), 1);
    }
}
