use crate::canvas::{Command, Document, Page, RasterImage};
use crate::error::FormstampError;
use crate::font::FontRegistry;
use crate::raster;
use crate::types::{Color, Pt, Size};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn lopdf_err(err: lopdf::Error) -> FormstampError {
    FormstampError::Pdf(format!("raster error: {err}"))
}

#[derive(Clone, Copy, Debug)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
        }
    }

    fn from_operands(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    fn translation(tx: f32, ty: f32) -> Self {
        Self::from_operands(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    fn concat(self, rhs: Self) -> Self {
        Self {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    fn transform_point(self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    fn transform_delta(self, dx: f32, dy: f32) -> (f32, f32) {
        (self.a * dx + self.c * dy, self.b * dx + self.d * dy)
    }

    fn axis_aligned_unit_rect(self) -> Option<(f32, f32, f32, f32)> {
        if self.b.abs() > 0.0001 || self.c.abs() > 0.0001 {
            return None;
        }
        let x0 = self.e;
        let x1 = self.e + self.a;
        let y0 = self.f;
        let y1 = self.f + self.d;
        Some((x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CharCodeEncoding {
    SingleByte,
    TwoByteBigEndian,
}

#[derive(Clone)]
struct PdfFontMetrics {
    default_width: f32,
    widths: HashMap<u16, f32>,
    code_encoding: CharCodeEncoding,
}

impl Default for PdfFontMetrics {
    fn default() -> Self {
        Self {
            default_width: 500.0,
            widths: HashMap::new(),
            code_encoding: CharCodeEncoding::SingleByte,
        }
    }
}

#[derive(Clone, Default)]
struct PdfFontResource {
    font_name: String,
    to_unicode: HashMap<u16, String>,
    embedded_font: Option<Arc<Vec<u8>>>,
    metrics: PdfFontMetrics,
    // Type0/Identity-H with an embedded program: character codes ARE
    // glyph ids, so text renders as exact glyph runs.
    identity_cid: bool,
}

#[derive(Clone, Default)]
struct PdfResources {
    fonts: HashMap<String, PdfFontResource>,
    xobjects: HashMap<String, ObjectId>,
    extgstates: HashMap<String, (f32, f32)>,
}

impl PdfResources {
    fn merged(&self, child: &PdfResources) -> PdfResources {
        let mut out = self.clone();
        for (k, v) in &child.fonts {
            out.fonts.insert(k.clone(), v.clone());
        }
        for (k, v) in &child.xobjects {
            out.xobjects.insert(k.clone(), *v);
        }
        for (k, v) in &child.extgstates {
            out.extgstates.insert(k.clone(), *v);
        }
        out
    }
}

#[derive(Clone)]
struct ParseState {
    ctm: Matrix,
    font_resource: Option<String>,
    font_name: String,
    font_size: Pt,
    text_matrix: Matrix,
    text_line_matrix: Matrix,
    text_leading: f32,
    char_spacing: f32,
    word_spacing: f32,
    text_h_scale: f32,
    text_rise: f32,
    text_render_mode: i64,
}

impl Default for ParseState {
    fn default() -> Self {
        Self {
            ctm: Matrix::identity(),
            font_resource: None,
            font_name: String::new(),
            font_size: Pt::from_f32(12.0),
            text_matrix: Matrix::identity(),
            text_line_matrix: Matrix::identity(),
            text_leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            text_h_scale: 1.0,
            text_rise: 0.0,
            text_render_mode: 0,
        }
    }
}

struct ParsedPage {
    size: Size,
    commands: Vec<Command>,
}

#[derive(Default)]
struct ParseCache {
    image_key_by_object: HashMap<ObjectId, Option<String>>,
    images: HashMap<String, RasterImage>,
}

/// Renders every page of a PDF to a PNG pixel buffer. Fonts embedded in
/// the document take priority; `registry` backs text whose program was
/// not embedded.
pub(crate) fn pdf_bytes_to_png_pages(
    bytes: &[u8],
    dpi: u32,
    registry: Option<&FontRegistry>,
) -> Result<Vec<Vec<u8>>, FormstampError> {
    let doc = LoDocument::load_mem(bytes).map_err(lopdf_err)?;
    let (pages, embedded_fonts, images) = parse_pdf_pages(&doc)?;
    if pages.is_empty() {
        return Err(FormstampError::Pdf("no pages to rasterize".to_string()));
    }

    let mut effective = FontRegistry::new();
    for (font_name, font_bytes) in &embedded_fonts {
        let _ = effective.register_bytes((**font_bytes).clone(), Some(font_name));
    }
    if let Some(registry) = registry {
        effective.adopt_all(registry);
    }
    let effective = if effective.is_empty() {
        None
    } else {
        Some(&effective)
    };

    let mut out = Vec::with_capacity(pages.len());
    for parsed in pages {
        let document = Document {
            page_size: parsed.size,
            pages: vec![Page {
                commands: parsed.commands,
            }],
            images: images.clone(),
        };
        let mut pngs = raster::document_to_png_pages(&document, dpi, effective)?;
        let Some(page_png) = pngs.pop() else {
            return Err(FormstampError::Pdf("no rendered page output".to_string()));
        };
        out.push(page_png);
    }
    Ok(out)
}

type EmbeddedFontMap = HashMap<String, Arc<Vec<u8>>>;

fn parse_pdf_pages(
    doc: &LoDocument,
) -> Result<(Vec<ParsedPage>, EmbeddedFontMap, HashMap<String, RasterImage>), FormstampError> {
    let page_map = doc.get_pages();
    let mut out = Vec::with_capacity(page_map.len());
    let mut cache = ParseCache::default();
    let mut embedded_fonts: EmbeddedFontMap = HashMap::new();
    for (_page_no, page_id) in page_map {
        out.push(parse_page(doc, page_id, &mut cache, &mut embedded_fonts)?);
    }
    Ok((out, embedded_fonts, cache.images))
}

fn parse_page(
    doc: &LoDocument,
    page_id: ObjectId,
    cache: &mut ParseCache,
    embedded_fonts: &mut EmbeddedFontMap,
) -> Result<ParsedPage, FormstampError> {
    let size = page_size_for_id(doc, page_id)?;
    let page_dict = doc
        .get_object(page_id)
        .map_err(lopdf_err)?
        .as_dict()
        .map_err(lopdf_err)?;
    let resources = match page_dict.get(b"Resources") {
        Ok(obj) => resources_from_object(doc, obj, embedded_fonts)?,
        Err(_) => PdfResources::default(),
    };
    let content_bytes = doc.get_page_content(page_id).map_err(lopdf_err)?;
    let content = Content::decode(&content_bytes).map_err(lopdf_err)?;

    let mut state = ParseState::default();
    let mut stack: Vec<ParseState> = Vec::new();
    let mut commands: Vec<Command> = Vec::new();
    let mut visited_forms: HashSet<ObjectId> = HashSet::new();

    parse_operations(
        doc,
        &content.operations,
        &resources,
        size.height.to_f32(),
        &mut state,
        &mut stack,
        &mut commands,
        &mut visited_forms,
        cache,
        embedded_fonts,
    )?;

    Ok(ParsedPage { size, commands })
}

#[allow(clippy::too_many_arguments)]
fn parse_operations(
    doc: &LoDocument,
    operations: &[Operation],
    resources: &PdfResources,
    page_height: f32,
    state: &mut ParseState,
    stack: &mut Vec<ParseState>,
    commands: &mut Vec<Command>,
    visited_forms: &mut HashSet<ObjectId>,
    cache: &mut ParseCache,
    embedded_fonts: &mut EmbeddedFontMap,
) -> Result<(), FormstampError> {
    for op in operations {
        match op.operator.as_str() {
            "q" => {
                stack.push(state.clone());
                commands.push(Command::SaveState);
            }
            "Q" => {
                if let Some(prev) = stack.pop() {
                    *state = prev;
                }
                commands.push(Command::RestoreState);
            }
            "cm" => {
                if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                    state.ctm = state.ctm.concat(Matrix::from_operands(a, b, c, d, e, f));
                }
            }
            "w" => {
                if let Some(width) = op_f32(op, 0) {
                    commands.push(Command::SetLineWidth(Pt::from_f32(width.max(0.0))));
                }
            }
            "J" => {
                if let Some(cap) = op_i64(op, 0) {
                    commands.push(Command::SetLineCap(cap.clamp(0, 2) as u8));
                }
            }
            "j" => {
                if let Some(join) = op_i64(op, 0) {
                    commands.push(Command::SetLineJoin(join.clamp(0, 2) as u8));
                }
            }
            "gs" => {
                if let Some(name) = op_name(op, 0) {
                    if let Some((fill, stroke)) = resources.extgstates.get(&name).copied() {
                        commands.push(Command::SetOpacity { fill, stroke });
                    }
                }
            }
            "rg" => {
                if let Some([r, g, b]) = op_f32_3(op) {
                    commands.push(Command::SetFillColor(Color::rgb(r, g, b)));
                }
            }
            "RG" => {
                if let Some([r, g, b]) = op_f32_3(op) {
                    commands.push(Command::SetStrokeColor(Color::rgb(r, g, b)));
                }
            }
            "g" => {
                if let Some(gray) = op_f32(op, 0) {
                    commands.push(Command::SetFillColor(Color::rgb(gray, gray, gray)));
                }
            }
            "G" => {
                if let Some(gray) = op_f32(op, 0) {
                    commands.push(Command::SetStrokeColor(Color::rgb(gray, gray, gray)));
                }
            }
            "k" => {
                if let Some([c, m, y, k]) = op_f32_4(op) {
                    let (r, g, b) = cmyk_to_rgb(c, m, y, k);
                    commands.push(Command::SetFillColor(Color::rgb(r, g, b)));
                }
            }
            "K" => {
                if let Some([c, m, y, k]) = op_f32_4(op) {
                    let (r, g, b) = cmyk_to_rgb(c, m, y, k);
                    commands.push(Command::SetStrokeColor(Color::rgb(r, g, b)));
                }
            }
            "m" => {
                if let Some([x, y]) = op_f32_2(op) {
                    let (x_pdf, y_pdf) = state.ctm.transform_point(x, y);
                    commands.push(Command::MoveTo {
                        x: Pt::from_f32(x_pdf),
                        y: Pt::from_f32(page_height - y_pdf),
                    });
                }
            }
            "l" => {
                if let Some([x, y]) = op_f32_2(op) {
                    let (x_pdf, y_pdf) = state.ctm.transform_point(x, y);
                    commands.push(Command::LineTo {
                        x: Pt::from_f32(x_pdf),
                        y: Pt::from_f32(page_height - y_pdf),
                    });
                }
            }
            "c" => {
                if let Some([x1, y1, x2, y2, x, y]) = op_f32_6(op) {
                    let (x1_pdf, y1_pdf) = state.ctm.transform_point(x1, y1);
                    let (x2_pdf, y2_pdf) = state.ctm.transform_point(x2, y2);
                    let (x_pdf, y_pdf) = state.ctm.transform_point(x, y);
                    commands.push(Command::CurveTo {
                        x1: Pt::from_f32(x1_pdf),
                        y1: Pt::from_f32(page_height - y1_pdf),
                        x2: Pt::from_f32(x2_pdf),
                        y2: Pt::from_f32(page_height - y2_pdf),
                        x: Pt::from_f32(x_pdf),
                        y: Pt::from_f32(page_height - y_pdf),
                    });
                }
            }
            "re" => {
                if let Some([x, y, w, h]) = op_f32_4(op) {
                    let corners = [
                        state.ctm.transform_point(x, y),
                        state.ctm.transform_point(x + w, y),
                        state.ctm.transform_point(x + w, y + h),
                        state.ctm.transform_point(x, y + h),
                    ];
                    for (idx, (cx, cy)) in corners.iter().enumerate() {
                        let point = Command::LineTo {
                            x: Pt::from_f32(*cx),
                            y: Pt::from_f32(page_height - cy),
                        };
                        if idx == 0 {
                            commands.push(Command::MoveTo {
                                x: Pt::from_f32(*cx),
                                y: Pt::from_f32(page_height - cy),
                            });
                        } else {
                            commands.push(point);
                        }
                    }
                    commands.push(Command::ClosePath);
                }
            }
            "h" => commands.push(Command::ClosePath),
            "W" => commands.push(Command::ClipPath { evenodd: false }),
            "W*" => commands.push(Command::ClipPath { evenodd: true }),
            "f" | "F" => commands.push(Command::Fill),
            "f*" => commands.push(Command::FillEvenOdd),
            "S" => commands.push(Command::Stroke),
            "B" => commands.push(Command::FillStroke),
            "B*" => commands.push(Command::FillStrokeEvenOdd),
            "s" => {
                commands.push(Command::ClosePath);
                commands.push(Command::Stroke);
            }
            "b" => {
                commands.push(Command::ClosePath);
                commands.push(Command::FillStroke);
            }
            "b*" => {
                commands.push(Command::ClosePath);
                commands.push(Command::FillStrokeEvenOdd);
            }
            "n" => {
                // Path end without painting; consumed by a pending clip.
            }
            "BT" => {
                state.text_matrix = Matrix::identity();
                state.text_line_matrix = Matrix::identity();
            }
            "ET" => {}
            "TL" => {
                if let Some(leading) = op_f32(op, 0) {
                    state.text_leading = leading;
                }
            }
            "Tc" => {
                if let Some(spacing) = op_f32(op, 0) {
                    state.char_spacing = spacing;
                }
            }
            "Tw" => {
                if let Some(spacing) = op_f32(op, 0) {
                    state.word_spacing = spacing;
                }
            }
            "Tz" => {
                if let Some(scale_percent) = op_f32(op, 0) {
                    state.text_h_scale = (scale_percent / 100.0).max(0.0);
                }
            }
            "Ts" => {
                if let Some(rise) = op_f32(op, 0) {
                    state.text_rise = rise;
                }
            }
            "Tr" => {
                if let Some(mode) = op_i64(op, 0) {
                    state.text_render_mode = mode.clamp(0, 7);
                }
            }
            "Tf" => {
                if let Some(font_res_name) = op_name(op, 0) {
                    let font_res = resources
                        .fonts
                        .get(&font_res_name)
                        .cloned()
                        .unwrap_or_else(|| PdfFontResource {
                            font_name: font_res_name.clone(),
                            ..PdfFontResource::default()
                        });
                    let size = op_f32(op, 1).unwrap_or(12.0).abs();
                    state.font_resource = Some(font_res_name);
                    state.font_name = font_res.font_name.clone();
                    state.font_size = Pt::from_f32(size.max(0.0));
                    commands.push(Command::SetFontName(state.font_name.clone()));
                    commands.push(Command::SetFontSize(state.font_size));
                }
            }
            "Td" | "TD" => {
                if let Some([tx, ty]) = op_f32_2(op) {
                    if op.operator == "TD" {
                        state.text_leading = -ty;
                    }
                    let (ux, uy) = state.text_line_matrix.transform_delta(tx, ty);
                    state.text_line_matrix =
                        state.text_line_matrix.concat(Matrix::translation(ux, uy));
                    state.text_matrix = state.text_line_matrix;
                }
            }
            "T*" => {
                advance_text_line(state);
            }
            "Tm" => {
                if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                    let tm = Matrix::from_operands(a, b, c, d, e, f);
                    state.text_matrix = tm;
                    state.text_line_matrix = tm;
                }
            }
            "Tj" => {
                show_text_operand(commands, state, resources, page_height, op.operands.first());
            }
            "'" => {
                advance_text_line(state);
                show_text_operand(commands, state, resources, page_height, op.operands.first());
            }
            "TJ" => {
                if let Some(arr) = op.operands.first().and_then(|o| o.as_array().ok()) {
                    for item in arr {
                        if let Some(adj) = numeric_operand(item) {
                            // Adjustments are thousandths of text-space units.
                            let tx = -(adj / 1000.0)
                                * state.font_size.to_f32()
                                * state.text_h_scale.max(0.0);
                            advance_text_matrix(state, tx);
                        } else {
                            show_text_operand(commands, state, resources, page_height, Some(item));
                        }
                    }
                }
            }
            "Do" => {
                if let Some(name) = op_name(op, 0) {
                    if let Some(obj_id) = resources.xobjects.get(&name).copied() {
                        parse_xobject(
                            doc,
                            obj_id,
                            resources,
                            page_height,
                            state,
                            commands,
                            visited_forms,
                            cache,
                            embedded_fonts,
                        )?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn advance_text_line(state: &mut ParseState) {
    let (ux, uy) = state
        .text_line_matrix
        .transform_delta(0.0, -state.text_leading);
    state.text_line_matrix = state.text_line_matrix.concat(Matrix::translation(ux, uy));
    state.text_matrix = state.text_line_matrix;
}

fn advance_text_matrix(state: &mut ParseState, tx: f32) {
    let (ux, uy) = state.text_matrix.transform_delta(tx, 0.0);
    state.text_matrix = state.text_matrix.concat(Matrix::translation(ux, uy));
}

fn show_text_operand(
    commands: &mut Vec<Command>,
    state: &mut ParseState,
    resources: &PdfResources,
    page_height: f32,
    operand: Option<&LoObject>,
) {
    let Some(operand) = operand else {
        return;
    };
    let Ok(bytes) = operand.as_str() else {
        return;
    };
    let font = state
        .font_resource
        .as_ref()
        .and_then(|res| resources.fonts.get(res));

    if let Some(font) = font {
        if font.identity_cid {
            emit_glyph_run(commands, state, page_height, bytes, font);
            return;
        }
    }

    let Some(text) = decode_text_operand(operand, font) else {
        return;
    };
    emit_text(commands, state, page_height, &text);
    let advance = font
        .and_then(|f| advance_from_pdf_codes(bytes, state, f))
        .unwrap_or_else(|| estimate_text_advance_fallback(&text, state, font));
    advance_text_matrix(state, advance);
}

/// Identity-H text with an embedded font program: codes are glyph ids, so
/// the run renders from exact outlines and /W advances.
fn emit_glyph_run(
    commands: &mut Vec<Command>,
    state: &mut ParseState,
    page_height: f32,
    bytes: &[u8],
    font: &PdfFontResource,
) {
    let Some(codes) = pdf_string_codes(bytes, CharCodeEncoding::TwoByteBigEndian) else {
        return;
    };
    if codes.is_empty() {
        return;
    }

    let combined = state.text_matrix.concat(state.ctm);
    let font_size = state.font_size.to_f32();
    let h_scale = state.text_h_scale.max(0.0);

    let mut advances = Vec::with_capacity(codes.len());
    let mut total_tx = 0.0f32;
    for code in &codes {
        let width = font
            .metrics
            .widths
            .get(code)
            .copied()
            .unwrap_or(font.metrics.default_width)
            .max(0.0);
        let tx = ((width / 1000.0) * font_size + state.char_spacing) * h_scale;
        total_tx += tx;
        let (dx, dy) = combined.transform_delta(tx, 0.0);
        advances.push((Pt::from_f32(dx), Pt::from_f32(dy)));
    }

    if state.text_render_mode != 3 && state.text_render_mode != 7 {
        let (ox, oy) = combined.transform_point(0.0, state.text_rise);
        commands.push(Command::SetFontSize(state.font_size));
        commands.push(Command::DrawGlyphRun {
            x: Pt::from_f32(ox),
            y: Pt::from_f32(page_height - oy),
            glyph_ids: codes,
            advances,
            m00: combined.a,
            m01: combined.b,
            m10: combined.c,
            m11: combined.d,
        });
    }

    advance_text_matrix(state, total_tx);
}

fn emit_text(commands: &mut Vec<Command>, state: &ParseState, page_height: f32, text: &str) {
    if text.is_empty() {
        return;
    }
    if state.text_render_mode == 3 || state.text_render_mode == 7 {
        return;
    }
    let (tx, ty) = state.text_matrix.transform_point(0.0, state.text_rise);
    let (x_pdf, y_pdf) = state.ctm.transform_point(tx, ty);
    let effective_size = effective_font_size(state);
    commands.push(Command::SetFontSize(Pt::from_f32(effective_size)));
    commands.push(Command::DrawString {
        x: Pt::from_f32(x_pdf),
        y: Pt::from_f32(page_height - y_pdf - effective_size),
        text: text.to_string(),
    });
}

fn effective_font_size(state: &ParseState) -> f32 {
    let m = state.text_matrix;
    let sx = (m.a * m.a + m.b * m.b).sqrt();
    let sy = (m.c * m.c + m.d * m.d).sqrt();
    let matrix_scale = if sy > 0.0001 {
        sy
    } else if sx > 0.0001 {
        sx
    } else {
        1.0
    };
    (state.font_size.to_f32() * matrix_scale).max(0.01)
}

fn advance_from_pdf_codes(bytes: &[u8], state: &ParseState, font: &PdfFontResource) -> Option<f32> {
    let codes = pdf_string_codes(bytes, font.metrics.code_encoding)?;
    if codes.is_empty() {
        return Some(0.0);
    }

    let mut sum = 0.0f32;
    let font_size = state.font_size.to_f32();
    for code in codes {
        let width = font
            .metrics
            .widths
            .get(&code)
            .copied()
            .unwrap_or(font.metrics.default_width)
            .max(0.0);
        sum += (width / 1000.0) * font_size + state.char_spacing;
        if code_is_space(font, code) {
            sum += state.word_spacing;
        }
    }

    Some(sum * state.text_h_scale.max(0.0))
}

fn pdf_string_codes(bytes: &[u8], encoding: CharCodeEncoding) -> Option<Vec<u16>> {
    match encoding {
        CharCodeEncoding::SingleByte => Some(bytes.iter().map(|b| *b as u16).collect()),
        CharCodeEncoding::TwoByteBigEndian => {
            if bytes.len() < 2 {
                return None;
            }
            Some(
                bytes
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect(),
            )
        }
    }
}

fn code_is_space(font: &PdfFontResource, code: u16) -> bool {
    if code == 0x0020 {
        return true;
    }
    font.to_unicode
        .get(&code)
        .map(|mapped| mapped.as_str() == " ")
        .unwrap_or(false)
}

fn estimate_text_advance_fallback(
    text: &str,
    state: &ParseState,
    font: Option<&PdfFontResource>,
) -> f32 {
    let fallback = state.font_size.to_f32().max(0.01) * 0.5;
    let face_bytes = font.and_then(|f| f.embedded_font.as_ref());
    let face = face_bytes.and_then(|bytes| ttf_parser::Face::parse(bytes, 0).ok());
    let mut sum = 0.0f32;
    for ch in text.chars() {
        let adv = face
            .as_ref()
            .and_then(|face| {
                let upem = face.units_per_em().max(1) as f32;
                face.glyph_index(ch)
                    .and_then(|gid| face.glyph_hor_advance(gid))
                    .map(|w| (w as f32 / upem) * state.font_size.to_f32())
            })
            .unwrap_or(fallback);
        sum += adv + state.char_spacing;
        if ch == ' ' {
            sum += state.word_spacing;
        }
    }
    sum * state.text_h_scale.max(0.0)
}

fn decode_text_operand(obj: &LoObject, font: Option<&PdfFontResource>) -> Option<String> {
    if let Ok(bytes) = obj.as_str() {
        if let Some(font_resource) = font {
            if !font_resource.to_unicode.is_empty() {
                if let Some(decoded) = decode_with_to_unicode(bytes, &font_resource.to_unicode) {
                    return Some(decoded);
                }
            }
        }
    }
    if let Ok(decoded) = lopdf::decode_text_string(obj) {
        return Some(decoded);
    }
    if let Ok(bytes) = obj.as_str() {
        return Some(String::from_utf8_lossy(bytes).to_string());
    }
    None
}

fn decode_with_to_unicode(bytes: &[u8], cmap: &HashMap<u16, String>) -> Option<String> {
    if bytes.is_empty() {
        return Some(String::new());
    }
    if bytes.len() % 2 == 0 {
        let mut out = String::new();
        let mut mapped_any = false;
        for chunk in bytes.chunks_exact(2) {
            let code = u16::from_be_bytes([chunk[0], chunk[1]]);
            if let Some(mapped) = cmap.get(&code) {
                out.push_str(mapped);
                mapped_any = true;
            } else if let Some(ch) = char::from_u32(code as u32) {
                out.push(ch);
            } else {
                out.push('?');
            }
        }
        if mapped_any {
            return Some(out);
        }
    }

    let mut out = String::new();
    let mut mapped_any = false;
    for b in bytes {
        let code = *b as u16;
        if let Some(mapped) = cmap.get(&code) {
            out.push_str(mapped);
            mapped_any = true;
        } else if let Some(ch) = char::from_u32(code as u32) {
            out.push(ch);
        } else {
            out.push('?');
        }
    }
    if mapped_any { Some(out) } else { None }
}

#[allow(clippy::too_many_arguments)]
fn parse_xobject(
    doc: &LoDocument,
    obj_id: ObjectId,
    parent_resources: &PdfResources,
    page_height: f32,
    state: &ParseState,
    commands: &mut Vec<Command>,
    visited_forms: &mut HashSet<ObjectId>,
    cache: &mut ParseCache,
    embedded_fonts: &mut EmbeddedFontMap,
) -> Result<(), FormstampError> {
    let stream = doc
        .get_object(obj_id)
        .map_err(lopdf_err)?
        .as_stream()
        .map_err(lopdf_err)?;
    let subtype = stream
        .dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();

    if subtype == "Form" {
        if !visited_forms.insert(obj_id) {
            return Ok(());
        }
        let form_bytes = stream
            .get_plain_content()
            .map_err(|e| FormstampError::Pdf(format!("form decode failed: {e}")))?;
        let form_content = Content::decode(&form_bytes).map_err(lopdf_err)?;
        let form_resources = match stream.dict.get(b"Resources") {
            Ok(obj) => resources_from_object(doc, obj, embedded_fonts)?,
            Err(_) => PdfResources::default(),
        };
        let merged_resources = parent_resources.merged(&form_resources);
        let form_matrix = stream
            .dict
            .get(b"Matrix")
            .ok()
            .and_then(parse_matrix_object)
            .unwrap_or_else(Matrix::identity);

        let mut nested_state = state.clone();
        nested_state.ctm = nested_state.ctm.concat(form_matrix);
        let mut nested_stack = Vec::new();
        parse_operations(
            doc,
            &form_content.operations,
            &merged_resources,
            page_height,
            &mut nested_state,
            &mut nested_stack,
            commands,
            visited_forms,
            cache,
            embedded_fonts,
        )?;
        visited_forms.remove(&obj_id);
        return Ok(());
    }

    if subtype == "Image" {
        let key = if let Some(cached) = cache.image_key_by_object.get(&obj_id) {
            cached.clone()
        } else {
            let decoded = decode_image_xobject(doc, stream);
            let key = decoded.map(|image| {
                let key = format!("xobj_{}_{}", obj_id.0, obj_id.1);
                cache.images.insert(key.clone(), image);
                key
            });
            cache.image_key_by_object.insert(obj_id, key.clone());
            key
        };
        let Some(key) = key else {
            return Ok(());
        };
        if let Some((left, bottom, right, top)) = state.ctm.axis_aligned_unit_rect() {
            let width = right - left;
            let height = top - bottom;
            if width > 0.0 && height > 0.0 {
                commands.push(Command::DrawImage {
                    x: Pt::from_f32(left),
                    y: Pt::from_f32(page_height - top),
                    width: Pt::from_f32(width),
                    height: Pt::from_f32(height),
                    resource_id: key,
                });
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Image XObject decoding

#[derive(Clone, Copy)]
enum DirectColor {
    Gray,
    Rgb,
    Cmyk,
}

impl DirectColor {
    fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb => 3,
            Self::Cmyk => 4,
        }
    }

    fn rgb_from_bytes(self, bytes: &[u8]) -> Option<(u8, u8, u8)> {
        match self {
            Self::Gray => {
                let v = *bytes.first()?;
                Some((v, v, v))
            }
            Self::Rgb => Some((*bytes.first()?, *bytes.get(1)?, *bytes.get(2)?)),
            Self::Cmyk => {
                let c = (*bytes.first()? as f32) / 255.0;
                let m = (*bytes.get(1)? as f32) / 255.0;
                let y = (*bytes.get(2)? as f32) / 255.0;
                let k = (*bytes.get(3)? as f32) / 255.0;
                let (rf, gf, bf) = cmyk_to_rgb(c, m, y, k);
                Some((
                    (rf.clamp(0.0, 1.0) * 255.0) as u8,
                    (gf.clamp(0.0, 1.0) * 255.0) as u8,
                    (bf.clamp(0.0, 1.0) * 255.0) as u8,
                ))
            }
        }
    }
}

enum XobjColorSpace {
    Direct(DirectColor),
    Indexed { base: DirectColor, lookup: Vec<u8> },
}

fn direct_color_from_name(name: &[u8]) -> Option<DirectColor> {
    match name {
        b"DeviceGray" => Some(DirectColor::Gray),
        b"DeviceRGB" => Some(DirectColor::Rgb),
        b"DeviceCMYK" => Some(DirectColor::Cmyk),
        _ => None,
    }
}

fn parse_xobj_color_space(doc: &LoDocument, obj: &LoObject) -> Option<XobjColorSpace> {
    let resolved = resolve_object(doc, obj).ok()?;
    match resolved {
        LoObject::Name(name) => {
            Some(XobjColorSpace::Direct(direct_color_from_name(name)?))
        }
        LoObject::Array(arr) => {
            let head = resolve_object(doc, arr.first()?).ok()?.as_name().ok()?;
            if let Some(direct) = direct_color_from_name(head) {
                return Some(XobjColorSpace::Direct(direct));
            }
            if head != b"Indexed" || arr.len() < 4 {
                return None;
            }
            let base = match parse_xobj_color_space(doc, arr.get(1)?)? {
                XobjColorSpace::Direct(mode) => mode,
                XobjColorSpace::Indexed { .. } => return None,
            };
            let lookup = match resolve_object(doc, arr.get(3)?).ok()? {
                LoObject::String(bytes, _) => bytes.clone(),
                LoObject::Stream(stream) => stream.get_plain_content().ok()?,
                _ => return None,
            };
            Some(XobjColorSpace::Indexed { base, lookup })
        }
        _ => None,
    }
}

fn decode_image_xobject(doc: &LoDocument, stream: &lopdf::Stream) -> Option<RasterImage> {
    let filters = stream.filters().unwrap_or_default();
    let has_dct = filters.iter().any(|f| *f == b"DCTDecode");

    let mut image = if has_dct {
        RasterImage::decode(&stream.content).ok()
    } else {
        let plain = stream.get_plain_content().ok()?;
        decode_raw_image_samples(doc, stream, &plain)
            .or_else(|| RasterImage::decode(&plain).ok())
    }?;

    if let Some(alpha) = decode_smask_alpha(doc, stream, &image) {
        image = apply_alpha(image, &alpha)?;
    }
    Some(image)
}

fn decode_raw_image_samples(
    doc: &LoDocument,
    stream: &lopdf::Stream,
    plain: &[u8],
) -> Option<RasterImage> {
    let width = stream
        .dict
        .get(b"Width")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())?;
    let height = stream
        .dict
        .get(b"Height")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())?;
    let bpc = stream
        .dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(obj_to_f32)
        .unwrap_or(8.0);
    if (bpc - 8.0).abs() > 0.01 {
        return None;
    }

    let color_space = match stream.dict.get(b"ColorSpace") {
        Ok(obj) => parse_xobj_color_space(doc, obj)?,
        Err(_) => XobjColorSpace::Direct(DirectColor::Gray),
    };
    let pixels = (width as usize).saturating_mul(height as usize);
    let expected = match &color_space {
        XobjColorSpace::Direct(mode) => pixels.saturating_mul(mode.channels()),
        XobjColorSpace::Indexed { .. } => pixels,
    };
    if plain.len() < expected {
        return None;
    }

    let mut rgba = vec![0u8; pixels * 4];
    let mut src = 0usize;
    let mut dst = 0usize;
    while dst + 4 <= rgba.len() {
        let (r, g, b) = match &color_space {
            XobjColorSpace::Direct(mode) => {
                let channels = mode.channels();
                let rgb = mode.rgb_from_bytes(&plain[src..(src + channels)])?;
                src += channels;
                rgb
            }
            XobjColorSpace::Indexed { base, lookup } => {
                let idx = *plain.get(src)? as usize;
                src += 1;
                let channels = base.channels();
                let offset = idx.saturating_mul(channels);
                if offset + channels > lookup.len() {
                    return None;
                }
                base.rgb_from_bytes(&lookup[offset..(offset + channels)])?
            }
        };
        rgba[dst] = r;
        rgba[dst + 1] = g;
        rgba[dst + 2] = b;
        rgba[dst + 3] = 255;
        dst += 4;
    }

    RasterImage::from_rgba8(width, height, rgba).ok()
}

fn decode_smask_alpha(
    doc: &LoDocument,
    stream: &lopdf::Stream,
    image: &RasterImage,
) -> Option<Vec<u8>> {
    let smask_obj = stream.dict.get(b"SMask").ok()?;
    let smask = resolve_object(doc, smask_obj).ok()?.as_stream().ok()?;
    let width = smask
        .dict
        .get(b"Width")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())?;
    let height = smask
        .dict
        .get(b"Height")
        .ok()
        .and_then(|o| o.as_i64().ok())
        .and_then(|v| u32::try_from(v).ok())?;
    if width != image.width() || height != image.height() {
        return None;
    }
    let alpha = smask.get_plain_content().ok()?;
    let expected = (width as usize) * (height as usize);
    if alpha.len() < expected {
        return None;
    }
    Some(alpha[..expected].to_vec())
}

fn apply_alpha(image: RasterImage, alpha: &[u8]) -> Option<RasterImage> {
    let width = image.width();
    let height = image.height();
    let mut pixels = image.pixels().to_vec();
    for (px, a) in pixels.chunks_exact_mut(4).zip(alpha.iter()) {
        px[3] = *a;
    }
    RasterImage::from_rgba8(width, height, pixels).ok()
}

// ---------------------------------------------------------------------------
// Resources

fn resources_from_object(
    doc: &LoDocument,
    obj: &LoObject,
    embedded_fonts: &mut EmbeddedFontMap,
) -> Result<PdfResources, FormstampError> {
    let resolved = resolve_object(doc, obj)?;
    let dict = match resolved {
        LoObject::Dictionary(d) => d.clone(),
        _ => return Ok(PdfResources::default()),
    };

    let mut out = PdfResources::default();

    if let Ok(font_obj) = dict.get(b"Font") {
        let font_dict = resolve_dict(doc, font_obj)?;
        for (name, font_ref_obj) in font_dict.iter() {
            let resource_name = name_bytes_to_string(name);
            let font = resolve_font_resource(doc, font_ref_obj)?;
            if let Some(data) = font.embedded_font.as_ref() {
                embedded_fonts
                    .entry(font.font_name.clone())
                    .or_insert_with(|| data.clone());
            }
            out.fonts.insert(resource_name, font);
        }
    }

    if let Ok(xobj_obj) = dict.get(b"XObject") {
        let xobj_dict = resolve_dict(doc, xobj_obj)?;
        for (name, ref_obj) in xobj_dict.iter() {
            if let Ok(id) = ref_obj.as_reference() {
                out.xobjects.insert(name_bytes_to_string(name), id);
            }
        }
    }

    if let Ok(gs_obj) = dict.get(b"ExtGState") {
        let gs_dict = resolve_dict(doc, gs_obj)?;
        for (name, gs_ref_obj) in gs_dict.iter() {
            let resolved_gs = resolve_object(doc, gs_ref_obj)?;
            let LoObject::Dictionary(gs) = resolved_gs else {
                continue;
            };
            let fill = gs
                .get(b"ca")
                .ok()
                .and_then(obj_to_f32)
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            let stroke = gs
                .get(b"CA")
                .ok()
                .and_then(obj_to_f32)
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            out.extgstates
                .insert(name_bytes_to_string(name), (fill, stroke));
        }
    }

    Ok(out)
}

fn resolve_font_resource(
    doc: &LoDocument,
    obj: &LoObject,
) -> Result<PdfFontResource, FormstampError> {
    let resolved = resolve_object(doc, obj)?;
    let dict = match resolved {
        LoObject::Dictionary(d) => d,
        _ => return Ok(PdfFontResource::default()),
    };
    let font_name = dict
        .get(b"BaseFont")
        .ok()
        .and_then(|obj| obj.as_name().ok())
        .map(name_bytes_to_string)
        .map(|name| normalize_pdf_font_name(&name))
        .unwrap_or_else(|| "Helvetica".to_string());
    let subtype = dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();
    let to_unicode = parse_to_unicode_cmap(doc, dict);
    let embedded_font = resolve_embedded_font_bytes(doc, dict).map(Arc::new);

    let metrics = if subtype == "Type0" {
        parse_type0_font_metrics(doc, dict, &to_unicode)
    } else {
        parse_simple_font_metrics(doc, dict)
    };
    let identity_cid = subtype == "Type0"
        && embedded_font.is_some()
        && metrics.code_encoding == CharCodeEncoding::TwoByteBigEndian
        && encoding_is_identity(doc, dict);

    Ok(PdfFontResource {
        font_name,
        to_unicode,
        embedded_font,
        metrics,
        identity_cid,
    })
}

fn encoding_is_identity(doc: &LoDocument, font_dict: &LoDictionary) -> bool {
    font_dict
        .get(b"Encoding")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_name().ok())
        .map(|name| name == b"Identity-H" || name == b"Identity-V")
        .unwrap_or(false)
}

fn parse_type0_font_metrics(
    doc: &LoDocument,
    font_dict: &LoDictionary,
    to_unicode: &HashMap<u16, String>,
) -> PdfFontMetrics {
    let code_encoding = if encoding_is_identity(doc, font_dict)
        || to_unicode.keys().any(|code| *code > 0x00FF)
    {
        CharCodeEncoding::TwoByteBigEndian
    } else {
        CharCodeEncoding::SingleByte
    };

    let mut default_width = 1000.0f32;
    let mut widths = HashMap::new();

    if let Some(descendant) = font_dict
        .get(b"DescendantFonts")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_array().ok())
        .and_then(|arr| arr.first())
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_dict().ok())
    {
        if let Ok(dw_obj) = descendant.get(b"DW") {
            if let Some(dw) = resolved_obj_to_f32(doc, dw_obj) {
                default_width = dw.max(0.0);
            }
        }
        if let Ok(w_obj) = descendant.get(b"W") {
            widths = parse_cid_font_widths(doc, w_obj);
        }
    }

    PdfFontMetrics {
        default_width,
        widths,
        code_encoding,
    }
}

fn parse_simple_font_metrics(doc: &LoDocument, font_dict: &LoDictionary) -> PdfFontMetrics {
    let mut default_width = 500.0f32;
    if let Some(descriptor) = font_dict
        .get(b"FontDescriptor")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_dict().ok())
    {
        if let Ok(missing_obj) = descriptor.get(b"MissingWidth") {
            if let Some(missing) = resolved_obj_to_f32(doc, missing_obj) {
                default_width = missing.max(0.0);
            }
        }
    }

    let first_char = font_dict
        .get(b"FirstChar")
        .ok()
        .and_then(|obj| resolved_obj_to_u16(doc, obj))
        .unwrap_or(0u16);
    let mut widths = HashMap::new();
    if let Some(width_arr) = font_dict
        .get(b"Widths")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_array().ok())
    {
        for (idx, width_obj) in width_arr.iter().enumerate() {
            let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
                continue;
            };
            let Ok(offset) = u16::try_from(idx) else {
                break;
            };
            let Some(code) = first_char.checked_add(offset) else {
                break;
            };
            widths.insert(code, width.max(0.0));
        }
    }

    PdfFontMetrics {
        default_width,
        widths,
        code_encoding: CharCodeEncoding::SingleByte,
    }
}

fn parse_cid_font_widths(doc: &LoDocument, obj: &LoObject) -> HashMap<u16, f32> {
    let mut out = HashMap::new();
    let Some(width_items) = resolve_object(doc, obj)
        .ok()
        .and_then(|resolved| resolved.as_array().ok())
    else {
        return out;
    };

    let mut idx = 0usize;
    while idx < width_items.len() {
        let Some(start_cid) = resolved_obj_to_u16(doc, &width_items[idx]) else {
            idx += 1;
            continue;
        };
        if idx + 1 >= width_items.len() {
            break;
        }

        let next_obj = match resolve_object(doc, &width_items[idx + 1]) {
            Ok(obj) => obj,
            Err(_) => {
                idx += 1;
                continue;
            }
        };

        if let Ok(width_list) = next_obj.as_array() {
            for (offset, width_obj) in width_list.iter().enumerate() {
                let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
                    continue;
                };
                let Ok(step) = u16::try_from(offset) else {
                    break;
                };
                let Some(code) = start_cid.checked_add(step) else {
                    break;
                };
                out.insert(code, width.max(0.0));
            }
            idx += 2;
            continue;
        }

        let Some(end_cid) = resolved_obj_to_u16(doc, &width_items[idx + 1]) else {
            idx += 1;
            continue;
        };
        let Some(width_obj) = width_items.get(idx + 2) else {
            break;
        };
        let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
            idx += 3;
            continue;
        };

        for code in start_cid..=end_cid {
            out.insert(code, width.max(0.0));
            if code == u16::MAX {
                break;
            }
        }
        idx += 3;
    }

    out
}

fn resolve_embedded_font_bytes(doc: &LoDocument, font_dict: &LoDictionary) -> Option<Vec<u8>> {
    let subtype = font_dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();

    let descriptor_obj = if subtype == "Type0" {
        let descendants = font_dict.get(b"DescendantFonts").ok()?;
        let descendants = resolve_object(doc, descendants).ok()?.as_array().ok()?;
        let descendant = resolve_object(doc, descendants.first()?).ok()?.as_dict().ok()?;
        descendant.get(b"FontDescriptor").ok()?.clone()
    } else {
        font_dict.get(b"FontDescriptor").ok()?.clone()
    };

    let descriptor = resolve_object(doc, &descriptor_obj).ok()?.as_dict().ok()?;
    for key in [
        b"FontFile2".as_slice(),
        b"FontFile3".as_slice(),
        b"FontFile".as_slice(),
    ] {
        if let Ok(obj) = descriptor.get(key) {
            if let Some(data) = resolve_object(doc, obj)
                .ok()
                .and_then(|o| o.as_stream().ok())
                .and_then(|s| s.get_plain_content().ok())
            {
                if !data.is_empty() {
                    return Some(data);
                }
            }
        }
    }
    None
}

fn parse_to_unicode_cmap(doc: &LoDocument, font_dict: &LoDictionary) -> HashMap<u16, String> {
    let mut map = HashMap::new();
    let Ok(to_unicode_obj) = font_dict.get(b"ToUnicode") else {
        return map;
    };
    let Some(stream) = resolve_object(doc, to_unicode_obj)
        .ok()
        .and_then(|obj| obj.as_stream().ok())
    else {
        return map;
    };
    let Ok(bytes) = stream.get_plain_content() else {
        return map;
    };
    let body = String::from_utf8_lossy(&bytes);

    // bfchar entries: <src> <dst...>
    let mut rest = body.as_ref();
    while let Some(start) = rest.find("beginbfchar") {
        let Some(end) = rest[start..].find("endbfchar") else {
            break;
        };
        let section = &rest[start + "beginbfchar".len()..start + end];
        let mut tokens = hex_tokens(section);
        while tokens.len() >= 2 {
            let dst = tokens.pop().unwrap_or_default();
            let src = tokens.pop().unwrap_or_default();
            if let (Some(code), Some(text)) = (hex_to_u16(&src), hex_to_string(&dst)) {
                map.insert(code, text);
            }
        }
        rest = &rest[start + end + "endbfchar".len()..];
    }

    // bfrange entries: <lo> <hi> <dst-start>
    let mut rest = body.as_ref();
    while let Some(start) = rest.find("beginbfrange") {
        let Some(end) = rest[start..].find("endbfrange") else {
            break;
        };
        let section = &rest[start + "beginbfrange".len()..start + end];
        let tokens = hex_tokens(section);
        for triple in tokens.chunks_exact(3) {
            let (Some(lo), Some(hi), Some(base)) = (
                hex_to_u16(&triple[0]),
                hex_to_u16(&triple[1]),
                hex_to_u16(&triple[2]),
            ) else {
                continue;
            };
            for (offset, code) in (lo..=hi).enumerate() {
                let value = (base as u32) + offset as u32;
                if let Some(ch) = char::from_u32(value) {
                    map.insert(code, ch.to_string());
                }
            }
        }
        rest = &rest[start + end + "endbfrange".len()..];
    }

    map
}

fn hex_tokens(section: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = section.chars();
    while let Some(ch) = chars.next() {
        if ch != '<' {
            continue;
        }
        let mut token = String::new();
        for inner in chars.by_ref() {
            if inner == '>' {
                break;
            }
            if inner.is_ascii_hexdigit() {
                token.push(inner);
            }
        }
        out.push(token);
    }
    out
}

fn hex_to_u16(token: &str) -> Option<u16> {
    u16::from_str_radix(token, 16).ok()
}

fn hex_to_string(token: &str) -> Option<String> {
    if token.len() % 4 != 0 {
        let code = hex_to_u16(token)?;
        return char::from_u32(code as u32).map(|ch| ch.to_string());
    }
    let mut out = String::new();
    for chunk in token.as_bytes().chunks_exact(4) {
        let piece = std::str::from_utf8(chunk).ok()?;
        let code = u16::from_str_radix(piece, 16).ok()?;
        out.push(char::from_u32(code as u32)?);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Generic object helpers

pub(crate) fn page_size_for_id(doc: &LoDocument, mut id: ObjectId) -> Result<Size, FormstampError> {
    loop {
        let dict = doc
            .get_object(id)
            .map_err(lopdf_err)?
            .as_dict()
            .map_err(lopdf_err)?;
        if let Ok(arr) = dict.get(b"MediaBox").and_then(LoObject::as_array) {
            if let Some(size) = parse_media_box_array(arr) {
                return Ok(size);
            }
        }
        id = match dict.get(b"Parent").and_then(LoObject::as_reference) {
            Ok(parent_id) => parent_id,
            Err(_) => break,
        };
    }
    Ok(Size::letter())
}

fn parse_media_box_array(arr: &[LoObject]) -> Option<Size> {
    if arr.len() < 4 {
        return None;
    }
    let x0 = obj_to_f32(&arr[0])?;
    let y0 = obj_to_f32(&arr[1])?;
    let x1 = obj_to_f32(&arr[2])?;
    let y1 = obj_to_f32(&arr[3])?;
    Some(Size::new((x1 - x0).abs().max(1.0), (y1 - y0).abs().max(1.0)))
}

fn parse_matrix_object(obj: &LoObject) -> Option<Matrix> {
    let arr = obj.as_array().ok()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Matrix::from_operands(
        obj_to_f32(&arr[0])?,
        obj_to_f32(&arr[1])?,
        obj_to_f32(&arr[2])?,
        obj_to_f32(&arr[3])?,
        obj_to_f32(&arr[4])?,
        obj_to_f32(&arr[5])?,
    ))
}

fn resolve_object<'a>(
    doc: &'a LoDocument,
    mut obj: &'a LoObject,
) -> Result<&'a LoObject, FormstampError> {
    loop {
        match obj {
            LoObject::Reference(id) => {
                obj = doc.get_object(*id).map_err(lopdf_err)?;
            }
            _ => return Ok(obj),
        }
    }
}

fn resolve_dict(doc: &LoDocument, obj: &LoObject) -> Result<LoDictionary, FormstampError> {
    let resolved = resolve_object(doc, obj)?;
    match resolved {
        LoObject::Dictionary(d) => Ok(d.clone()),
        _ => Ok(LoDictionary::new()),
    }
}

fn resolved_obj_to_f32(doc: &LoDocument, obj: &LoObject) -> Option<f32> {
    let resolved = resolve_object(doc, obj).ok()?;
    obj_to_f32(resolved)
}

fn resolved_obj_to_u16(doc: &LoDocument, obj: &LoObject) -> Option<u16> {
    let resolved = resolve_object(doc, obj).ok()?;
    if let Ok(v) = resolved.as_i64() {
        return u16::try_from(v).ok();
    }
    let v = obj_to_f32(resolved)?;
    if !(0.0..=(u16::MAX as f32)).contains(&v) {
        return None;
    }
    Some(v.round() as u16)
}

fn op_name(op: &Operation, idx: usize) -> Option<String> {
    let obj = op.operands.get(idx)?;
    let name = obj.as_name().ok()?;
    Some(name_bytes_to_string(name))
}

fn op_f32(op: &Operation, idx: usize) -> Option<f32> {
    obj_to_f32(op.operands.get(idx)?)
}

fn op_i64(op: &Operation, idx: usize) -> Option<i64> {
    op.operands.get(idx)?.as_i64().ok()
}

fn op_f32_2(op: &Operation) -> Option<[f32; 2]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?])
}

fn op_f32_3(op: &Operation) -> Option<[f32; 3]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?, op_f32(op, 2)?])
}

fn op_f32_4(op: &Operation) -> Option<[f32; 4]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
    ])
}

fn op_f32_6(op: &Operation) -> Option<[f32; 6]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
        op_f32(op, 4)?,
        op_f32(op, 5)?,
    ])
}

fn numeric_operand(obj: &LoObject) -> Option<f32> {
    match obj {
        LoObject::Integer(_) | LoObject::Real(_) => obj_to_f32(obj),
        _ => None,
    }
}

fn obj_to_f32(obj: &LoObject) -> Option<f32> {
    if let Ok(v) = obj.as_float() {
        return Some(v);
    }
    obj.as_i64().ok().map(|v| v as f32)
}

fn name_bytes_to_string(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_string()
}

fn normalize_pdf_font_name(name: &str) -> String {
    let trimmed = name
        .trim()
        .trim_start_matches('/')
        .trim_matches('"')
        .trim_matches('\'');
    if let Some((prefix, rest)) = trimmed.split_once('+') {
        if prefix.len() == 6 && prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return rest.to_string();
        }
    }
    trimmed.to_string()
}

fn cmyk_to_rgb(c: f32, m: f32, y: f32, k: f32) -> (f32, f32, f32) {
    let r = (1.0 - c.clamp(0.0, 1.0)) * (1.0 - k.clamp(0.0, 1.0));
    let g = (1.0 - m.clamp(0.0, 1.0)) * (1.0 - k.clamp(0.0, 1.0));
    let b = (1.0 - y.clamp(0.0, 1.0)) * (1.0 - k.clamp(0.0, 1.0));
    (r, g, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{Stream as LoStream, dictionary};

    fn make_single_page_pdf_bytes(content_ops: &str) -> Vec<u8> {
        let mut doc = LoDocument::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content_id = doc.add_object(LoStream::new(
            dictionary! {},
            content_ops.as_bytes().to_vec(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 200.into(), 100.into()],
        });
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();
        let mut out = Vec::new();
        doc.save_to(&mut out).expect("save");
        out
    }

    fn non_white_bounds(img: &image::RgbaImage) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, px) in img.enumerate_pixels() {
            let [r, g, b, _a] = px.0;
            if r > 245 && g > 245 && b > 245 {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((min_x, min_y, max_x, max_y)) => {
                    (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
                }
            });
        }
        bounds
    }

    #[test]
    fn rasterizes_filled_rect_at_expected_position() {
        let bytes = make_single_page_pdf_bytes("0 0 0 rg 20 40 60 30 re f");
        let pages = pdf_bytes_to_png_pages(&bytes, 72, None).expect("raster");
        assert_eq!(pages.len(), 1);
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        assert_eq!(img.width(), 200);
        assert_eq!(img.height(), 100);
        let (min_x, min_y, max_x, max_y) = non_white_bounds(&img).expect("ink");
        // MediaBox is 100pt tall; rect from y=40..70 in PDF space lands
        // at rows 30..60 from the top.
        assert!((19..=21).contains(&min_x), "min_x={min_x}");
        assert!((29..=31).contains(&min_y), "min_y={min_y}");
        assert!((79..=81).contains(&max_x), "max_x={max_x}");
        assert!((59..=61).contains(&max_y), "max_y={max_y}");
    }

    #[test]
    fn rasterizes_stroke_with_line_width() {
        let bytes = make_single_page_pdf_bytes("0 0 0 RG 4 w 10 50 m 190 50 l S");
        let pages = pdf_bytes_to_png_pages(&bytes, 72, None).expect("raster");
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        let (_, min_y, _, max_y) = non_white_bounds(&img).expect("ink");
        let thickness = max_y - min_y + 1;
        assert!((3..=6).contains(&thickness), "thickness={thickness}");
    }

    #[test]
    fn empty_content_rasterizes_to_all_white() {
        let bytes = make_single_page_pdf_bytes("");
        let pages = pdf_bytes_to_png_pages(&bytes, 72, None).expect("raster");
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        assert!(non_white_bounds(&img).is_none());
    }

    #[test]
    fn rejects_malformed_pdf() {
        let err = pdf_bytes_to_png_pages(b"not a pdf", 72, None).expect_err("invalid");
        assert!(err.to_string().contains("raster error"));
    }

    #[test]
    fn image_xobject_with_smask_gets_alpha_channel() {
        let mut doc = LoDocument::with_version("1.7");
        let smask_id = doc.add_object(LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 1,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![255u8, 0u8],
        ));
        let image_stream = LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 1,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "SMask" => smask_id,
            },
            vec![255, 0, 0, 0, 255, 0],
        );

        let image = decode_image_xobject(&doc, &image_stream).expect("decode");
        assert_eq!(image.width(), 2);
        assert_eq!(image.height(), 1);
        assert_eq!(image.pixels(), &[255, 0, 0, 255, 0, 255, 0, 0]);
    }

    #[test]
    fn indexed_cmyk_lookup_decodes_to_rgb() {
        let mut doc = LoDocument::with_version("1.7");
        let lookup_id = doc.add_object(LoStream::new(
            LoDictionary::new(),
            vec![
                0, 0, 0, 0, // index 0 -> white (CMYK)
                0, 255, 255, 0, // index 1 -> red (CMYK)
            ],
        ));
        let image_stream = LoStream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 1,
                "BitsPerComponent" => 8,
                "ColorSpace" => vec![
                    LoObject::Name(b"Indexed".to_vec()),
                    LoObject::Name(b"DeviceCMYK".to_vec()),
                    1.into(),
                    lookup_id.into(),
                ],
            },
            vec![0u8, 1u8],
        );

        let image = decode_image_xobject(&doc, &image_stream).expect("decode");
        let px = image.pixels();
        assert!(px[0] > 240 && px[1] > 240 && px[2] > 240, "white {px:?}");
        assert!(px[4] > 200 && px[5] < 80 && px[6] < 80, "red {px:?}");
    }

    #[test]
    fn to_unicode_bfchar_and_bfrange_parse() {
        let cmap = "\n/CIDInit /ProcSet findresource begin\nbeginbfchar\n<0041> <0042>\nendbfchar\nbeginbfrange\n<0050> <0052> <0061>\nendbfrange\nend\n";
        let mut doc = LoDocument::with_version("1.7");
        let stream_id = doc.add_object(LoStream::new(
            LoDictionary::new(),
            cmap.as_bytes().to_vec(),
        ));
        let font_dict = dictionary! {
            "ToUnicode" => stream_id,
        };
        let map = parse_to_unicode_cmap(&doc, &font_dict);
        assert_eq!(map.get(&0x0041).map(String::as_str), Some("B"));
        assert_eq!(map.get(&0x0050).map(String::as_str), Some("a"));
        assert_eq!(map.get(&0x0052).map(String::as_str), Some("c"));
    }

    #[test]
    fn pdf_string_codes_two_byte_big_endian() {
        let codes = pdf_string_codes(&[0x00, 0x41, 0x30, 0x00], CharCodeEncoding::TwoByteBigEndian)
            .expect("codes");
        assert_eq!(codes, vec![0x0041, 0x3000]);
    }

    #[test]
    fn normalize_pdf_font_name_strips_subset_prefix() {
        assert_eq!(normalize_pdf_font_name("ABCDEF+SimSun"), "SimSun");
        assert_eq!(normalize_pdf_font_name("Helvetica"), "Helvetica");
    }

    #[test]
    fn page_size_reads_the_page_media_box() {
        let bytes = make_single_page_pdf_bytes("");
        let doc = LoDocument::load_mem(&bytes).expect("load");
        let page_id = *doc.get_pages().values().next().expect("page");
        let size = page_size_for_id(&doc, page_id).expect("size");
        assert_eq!(size, Size::new(200.0, 100.0));
    }
}
