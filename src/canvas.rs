use crate::error::FormstampError;
use crate::types::{Color, Pt, Size};

use std::collections::HashMap;

/// A decoded RGBA8 pixel buffer. Ink captured from a drawing surface
/// arrives here either as raw rows or as an encoded PNG/JPEG blob.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RasterImage {
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, FormstampError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4));
        if expected != Some(pixels.len()) || width == 0 || height == 0 {
            return Err(FormstampError::InvalidImage(format!(
                "rgba buffer size mismatch: {}x{} with {} bytes",
                width,
                height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormstampError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| FormstampError::InvalidImage(format!("decode failed: {e}")))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::from_rgba8(width, height, rgba.into_raw())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True when every pixel has zero alpha. Such a buffer draws nothing
    /// and is treated exactly like an absent image.
    pub fn is_fully_transparent(&self) -> bool {
        self.pixels.chunks_exact(4).all(|px| px[3] == 0)
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    SaveState,
    RestoreState,
    SetFillColor(Color),
    SetStrokeColor(Color),
    SetLineWidth(Pt),
    SetLineCap(u8),
    SetLineJoin(u8),
    // Applies both fill and stroke alpha. Values outside 0..1 are clamped.
    SetOpacity {
        fill: f32,
        stroke: f32,
    },
    SetFontName(String),
    SetFontSize(Pt),
    // Clip to the current path. The current path is consumed.
    ClipPath {
        evenodd: bool,
    },
    MoveTo {
        x: Pt,
        y: Pt,
    },
    LineTo {
        x: Pt,
        y: Pt,
    },
    CurveTo {
        x1: Pt,
        y1: Pt,
        x2: Pt,
        y2: Pt,
        x: Pt,
        y: Pt,
    },
    ClosePath,
    Fill,
    FillEvenOdd,
    Stroke,
    FillStroke,
    FillStrokeEvenOdd,
    DrawString {
        x: Pt,
        y: Pt,
        text: String,
    },
    // Emitted by the PDF reader for precise CID text: glyph ids with
    // pre-computed advances and the text-to-user linear transform.
    DrawGlyphRun {
        x: Pt,
        y: Pt,
        glyph_ids: Vec<u16>,
        advances: Vec<(Pt, Pt)>,
        m00: f32,
        m01: f32,
        m10: f32,
        m11: f32,
    },
    DrawRect {
        x: Pt,
        y: Pt,
        width: Pt,
        height: Pt,
    },
    DrawImage {
        x: Pt,
        y: Pt,
        width: Pt,
        height: Pt,
        resource_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct Page {
    pub commands: Vec<Command>,
}

impl Page {
    fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub page_size: Size,
    pub pages: Vec<Page>,
    pub images: HashMap<String, RasterImage>,
}

#[derive(Debug, Clone)]
struct GraphicsState {
    font_size: Pt,
    font_name: String,
}

impl GraphicsState {
    fn initial() -> Self {
        Self {
            font_size: Pt::from_f32(12.0),
            font_name: String::new(),
        }
    }
}

/// Records drawing commands page by page; `finish` yields the immutable
/// document handed to the rasterizer.
pub struct Canvas {
    page_size: Size,
    pages: Vec<Page>,
    current: Page,
    state: GraphicsState,
    images: HashMap<String, RasterImage>,
}

impl Canvas {
    pub fn new(page_size: Size) -> Self {
        Self {
            page_size,
            pages: Vec::new(),
            current: Page::new(),
            state: GraphicsState::initial(),
            images: HashMap::new(),
        }
    }

    pub fn set_font_name(&mut self, name: &str) {
        if self.state.font_name == name {
            return;
        }
        self.state.font_name = name.to_string();
        self.current
            .commands
            .push(Command::SetFontName(self.state.font_name.clone()));
    }

    pub fn set_font_size(&mut self, size: Pt) {
        if self.state.font_size == size {
            return;
        }
        self.state.font_size = size;
        self.current.commands.push(Command::SetFontSize(size));
    }

    pub fn draw_string(&mut self, x: Pt, y: Pt, text: impl Into<String>) {
        self.current.commands.push(Command::DrawString {
            x,
            y,
            text: text.into(),
        });
    }

    pub fn draw_rect(&mut self, x: Pt, y: Pt, width: Pt, height: Pt) {
        self.current.commands.push(Command::DrawRect {
            x,
            y,
            width,
            height,
        });
    }

    /// Registers the pixel buffer under `resource_id` and draws it into
    /// the given placement. Re-registering the same id keeps the first
    /// buffer, matching PDF resource semantics.
    pub fn draw_image(
        &mut self,
        x: Pt,
        y: Pt,
        width: Pt,
        height: Pt,
        resource_id: impl Into<String>,
        image: RasterImage,
    ) {
        let resource_id = resource_id.into();
        self.images.entry(resource_id.clone()).or_insert(image);
        self.current.commands.push(Command::DrawImage {
            x,
            y,
            width,
            height,
            resource_id,
        });
    }

    pub fn show_page(&mut self) {
        let current = std::mem::replace(&mut self.current, Page::new());
        self.pages.push(current);
        self.state = GraphicsState::initial();
    }

    pub fn finish(mut self) -> Document {
        if !self.current.commands.is_empty() || self.pages.is_empty() {
            self.show_page();
        }
        Document {
            page_size: self.page_size,
            pages: self.pages,
            images: self.images,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(alpha: u8) -> RasterImage {
        RasterImage::from_rgba8(2, 2, vec![10, 20, 30, alpha].repeat(4)).expect("image")
    }

    #[test]
    fn raster_image_rejects_short_buffer() {
        let err = RasterImage::from_rgba8(4, 4, vec![0u8; 8]).expect_err("must fail");
        assert!(err.to_string().contains("size mismatch"));
    }

    #[test]
    fn fully_transparent_detection() {
        assert!(solid_image(0).is_fully_transparent());
        assert!(!solid_image(1).is_fully_transparent());
    }

    #[test]
    fn finish_always_yields_at_least_one_page() {
        let doc = Canvas::new(Size::a4()).finish();
        assert_eq!(doc.pages.len(), 1);
        assert!(doc.pages[0].commands.is_empty());
    }

    #[test]
    fn font_state_changes_are_deduplicated() {
        let mut canvas = Canvas::new(Size::a4());
        canvas.set_font_name("SimSun");
        canvas.set_font_name("SimSun");
        canvas.set_font_size(Pt::from_f32(11.0));
        canvas.set_font_size(Pt::from_f32(11.0));
        canvas.draw_string(Pt::ZERO, Pt::ZERO, "x");
        let doc = canvas.finish();
        let sets = doc.pages[0]
            .commands
            .iter()
            .filter(|c| matches!(c, Command::SetFontName(_) | Command::SetFontSize(_)))
            .count();
        assert_eq!(sets, 2);
    }

    #[test]
    fn draw_image_keeps_first_registration_per_id() {
        let mut canvas = Canvas::new(Size::a4());
        let first = solid_image(255);
        let second = solid_image(0);
        canvas.draw_image(
            Pt::ZERO,
            Pt::ZERO,
            Pt::from_f32(10.0),
            Pt::from_f32(10.0),
            "ink0",
            first.clone(),
        );
        canvas.draw_image(
            Pt::ZERO,
            Pt::ZERO,
            Pt::from_f32(10.0),
            Pt::from_f32(10.0),
            "ink0",
            second,
        );
        let doc = canvas.finish();
        assert_eq!(doc.images.len(), 1);
        assert_eq!(doc.images["ink0"], first);
    }
}
