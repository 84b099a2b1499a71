use crate::canvas::{Command, Document, RasterImage};
use crate::error::FormstampError;
use crate::font::FontRegistry;
use crate::types::{Color, Pt};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use rustybuzz::{Face as HbFace, UnicodeBuffer};
use std::collections::HashMap;
use tiny_skia::{
    FillRule, FilterQuality, LineCap, LineJoin, Mask, Paint, Path, PathBuilder, Pixmap,
    PixmapPaint, Stroke, Transform,
};
use ttf_parser::{GlyphId, OutlineBuilder};

#[derive(Clone)]
struct RasterState {
    transform: Transform,
    fill_color: Color,
    stroke_color: Color,
    line_width: Pt,
    line_cap: u8,
    line_join: u8,
    fill_opacity: f32,
    stroke_opacity: f32,
    font_name: String,
    font_size: Pt,
    clip_mask: Option<Mask>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            transform: Transform::identity(),
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            line_width: Pt::from_f32(1.0),
            line_cap: 0,
            line_join: 0,
            fill_opacity: 1.0,
            stroke_opacity: 1.0,
            font_name: String::new(),
            font_size: Pt::from_f32(12.0),
            clip_mask: None,
        }
    }
}

/// Renders every page of a command document onto a white pixmap and
/// encodes each page as PNG.
pub(crate) fn document_to_png_pages(
    document: &Document,
    dpi: u32,
    registry: Option<&FontRegistry>,
) -> Result<Vec<Vec<u8>>, FormstampError> {
    let dpi = if dpi == 0 { 150 } else { dpi };
    let width_px = pt_milli_to_px_u32(document.page_size.width.to_milli_i64(), dpi)?;
    let height_px = pt_milli_to_px_u32(document.page_size.height.to_milli_i64(), dpi)?;
    let page_height_pt = document.page_size.height.to_f32();
    let scale = dpi as f32 / 72.0;
    let base_transform = Transform::from_row(scale, 0.0, 0.0, -scale, 0.0, page_height_pt * scale);

    let mut png_pages = Vec::with_capacity(document.pages.len());
    let mut pixmap_cache: HashMap<String, Option<Pixmap>> = HashMap::new();

    for page in &document.pages {
        let mut pixmap = Pixmap::new(width_px, height_px).ok_or_else(|| {
            FormstampError::InvalidConfiguration(format!(
                "invalid raster size {}x{} at {} DPI",
                width_px, height_px, dpi
            ))
        })?;
        pixmap.fill(tiny_skia::Color::from_rgba8(255, 255, 255, 255));

        let mut state = RasterState::default();
        let mut stack: Vec<RasterState> = Vec::new();
        let mut path_builder = PathBuilder::new();
        let mut has_path = false;

        render_commands(
            &mut pixmap,
            page_height_pt,
            &page.commands,
            base_transform,
            &mut state,
            &mut stack,
            &mut path_builder,
            &mut has_path,
            &document.images,
            &mut pixmap_cache,
            registry,
        );

        let png = pixmap
            .encode_png()
            .map_err(|e| FormstampError::InvalidImage(format!("png encode failed: {e}")))?;
        png_pages.push(png);
    }

    Ok(png_pages)
}

#[allow(clippy::too_many_arguments)]
fn render_commands(
    pixmap: &mut Pixmap,
    page_height_pt: f32,
    commands: &[Command],
    base_transform: Transform,
    state: &mut RasterState,
    stack: &mut Vec<RasterState>,
    path_builder: &mut PathBuilder,
    has_path: &mut bool,
    images: &HashMap<String, RasterImage>,
    pixmap_cache: &mut HashMap<String, Option<Pixmap>>,
    registry: Option<&FontRegistry>,
) {
    for cmd in commands {
        match cmd {
            Command::SaveState => stack.push(state.clone()),
            Command::RestoreState => {
                if let Some(restored) = stack.pop() {
                    *state = restored;
                }
            }
            Command::SetFillColor(color) => state.fill_color = *color,
            Command::SetStrokeColor(color) => state.stroke_color = *color,
            Command::SetLineWidth(width) => {
                state.line_width = if *width < Pt::ZERO { Pt::ZERO } else { *width };
            }
            Command::SetLineCap(cap) => state.line_cap = *cap,
            Command::SetLineJoin(join) => state.line_join = *join,
            Command::SetOpacity { fill, stroke } => {
                state.fill_opacity = fill.clamp(0.0, 1.0);
                state.stroke_opacity = stroke.clamp(0.0, 1.0);
            }
            Command::SetFontName(name) => state.font_name = name.clone(),
            Command::SetFontSize(size) => state.font_size = *size,
            Command::ClipPath { evenodd } => {
                if let Some(path) = take_path(path_builder, has_path) {
                    let fill_rule = if *evenodd {
                        FillRule::EvenOdd
                    } else {
                        FillRule::Winding
                    };
                    apply_clip_path(
                        state,
                        &path,
                        fill_rule,
                        base_transform.pre_concat(state.transform),
                        pixmap.width(),
                        pixmap.height(),
                    );
                }
            }
            Command::MoveTo { x, y } => {
                path_builder.move_to(x.to_f32(), page_height_pt - y.to_f32());
                *has_path = true;
            }
            Command::LineTo { x, y } => {
                path_builder.line_to(x.to_f32(), page_height_pt - y.to_f32());
                *has_path = true;
            }
            Command::CurveTo {
                x1,
                y1,
                x2,
                y2,
                x,
                y,
            } => {
                path_builder.cubic_to(
                    x1.to_f32(),
                    page_height_pt - y1.to_f32(),
                    x2.to_f32(),
                    page_height_pt - y2.to_f32(),
                    x.to_f32(),
                    page_height_pt - y.to_f32(),
                );
                *has_path = true;
            }
            Command::ClosePath => {
                if *has_path {
                    path_builder.close();
                }
            }
            Command::Fill => {
                fill_current_path(
                    pixmap,
                    state,
                    path_builder,
                    has_path,
                    FillRule::Winding,
                    base_transform,
                );
            }
            Command::FillEvenOdd => {
                fill_current_path(
                    pixmap,
                    state,
                    path_builder,
                    has_path,
                    FillRule::EvenOdd,
                    base_transform,
                );
            }
            Command::Stroke => {
                stroke_current_path(pixmap, state, path_builder, has_path, base_transform);
            }
            Command::FillStroke => {
                fill_stroke_current_path(
                    pixmap,
                    state,
                    path_builder,
                    has_path,
                    FillRule::Winding,
                    base_transform,
                );
            }
            Command::FillStrokeEvenOdd => {
                fill_stroke_current_path(
                    pixmap,
                    state,
                    path_builder,
                    has_path,
                    FillRule::EvenOdd,
                    base_transform,
                );
            }
            Command::DrawString { x, y, text } => {
                draw_string(
                    pixmap,
                    state,
                    x.to_f32(),
                    y.to_f32(),
                    text,
                    page_height_pt,
                    base_transform,
                    registry,
                );
            }
            Command::DrawGlyphRun {
                x,
                y,
                glyph_ids,
                advances,
                m00,
                m01,
                m10,
                m11,
            } => {
                draw_glyph_run(
                    pixmap,
                    state,
                    x.to_f32(),
                    y.to_f32(),
                    glyph_ids,
                    advances,
                    *m00,
                    *m01,
                    *m10,
                    *m11,
                    page_height_pt,
                    base_transform,
                    registry,
                );
            }
            Command::DrawRect {
                x,
                y,
                width,
                height,
            } => {
                let draw_y = page_height_pt - y.to_f32() - height.to_f32();
                if let Some(rect) = tiny_skia::Rect::from_xywh(
                    x.to_f32(),
                    draw_y,
                    width.to_f32(),
                    height.to_f32(),
                ) {
                    let path = PathBuilder::from_rect(rect);
                    let paint = fill_paint(state.fill_color, state.fill_opacity);
                    pixmap.fill_path(
                        &path,
                        &paint,
                        FillRule::Winding,
                        base_transform.pre_concat(state.transform),
                        state.clip_mask.as_ref(),
                    );
                }
            }
            Command::DrawImage {
                x,
                y,
                width,
                height,
                resource_id,
            } => {
                let source = pixmap_cache
                    .entry(resource_id.clone())
                    .or_insert_with(|| images.get(resource_id).and_then(pixmap_from_image));
                let Some(image) = source.as_ref() else {
                    continue;
                };
                let src_w = image.width() as f32;
                let src_h = image.height() as f32;
                if src_w <= 0.0 || src_h <= 0.0 {
                    continue;
                }
                let sx = width.to_f32() / src_w;
                let sy = height.to_f32() / src_h;
                // Placement is top-left based; flip locally so source row 0
                // lands at the visual top, matching PDF /Im Do semantics.
                let image_ts = Transform::from_row(
                    sx,
                    0.0,
                    0.0,
                    -sy,
                    x.to_f32(),
                    page_height_pt - y.to_f32(),
                );
                let ctm = state.transform.pre_concat(image_ts);
                let device_ts = base_transform.pre_concat(ctm);
                let mut paint = PixmapPaint::default();
                paint.quality = FilterQuality::Bilinear;
                paint.opacity = state.fill_opacity.clamp(0.0, 1.0);
                pixmap.draw_pixmap(
                    0,
                    0,
                    image.as_ref(),
                    &paint,
                    device_ts,
                    state.clip_mask.as_ref(),
                );
            }
        }
    }
}

fn fill_current_path(
    pixmap: &mut Pixmap,
    state: &RasterState,
    path_builder: &mut PathBuilder,
    has_path: &mut bool,
    fill_rule: FillRule,
    base_transform: Transform,
) {
    let Some(path) = take_path(path_builder, has_path) else {
        return;
    };
    let paint = fill_paint(state.fill_color, state.fill_opacity);
    pixmap.fill_path(
        &path,
        &paint,
        fill_rule,
        base_transform.pre_concat(state.transform),
        state.clip_mask.as_ref(),
    );
}

fn stroke_current_path(
    pixmap: &mut Pixmap,
    state: &RasterState,
    path_builder: &mut PathBuilder,
    has_path: &mut bool,
    base_transform: Transform,
) {
    let Some(path) = take_path(path_builder, has_path) else {
        return;
    };
    let paint = fill_paint(state.stroke_color, state.stroke_opacity);
    let stroke = build_stroke(state);
    pixmap.stroke_path(
        &path,
        &paint,
        &stroke,
        base_transform.pre_concat(state.transform),
        state.clip_mask.as_ref(),
    );
}

fn fill_stroke_current_path(
    pixmap: &mut Pixmap,
    state: &RasterState,
    path_builder: &mut PathBuilder,
    has_path: &mut bool,
    fill_rule: FillRule,
    base_transform: Transform,
) {
    let Some(path) = take_path(path_builder, has_path) else {
        return;
    };
    let fill = fill_paint(state.fill_color, state.fill_opacity);
    pixmap.fill_path(
        &path,
        &fill,
        fill_rule,
        base_transform.pre_concat(state.transform),
        state.clip_mask.as_ref(),
    );
    let stroke_paint = fill_paint(state.stroke_color, state.stroke_opacity);
    let stroke = build_stroke(state);
    pixmap.stroke_path(
        &path,
        &stroke_paint,
        &stroke,
        base_transform.pre_concat(state.transform),
        state.clip_mask.as_ref(),
    );
}

fn apply_clip_path(
    state: &mut RasterState,
    path: &Path,
    fill_rule: FillRule,
    transform: Transform,
    width: u32,
    height: u32,
) {
    if let Some(mask) = state.clip_mask.as_mut() {
        mask.intersect_path(path, fill_rule, true, transform);
        return;
    }
    let Some(mut mask) = Mask::new(width, height) else {
        return;
    };
    mask.fill_path(path, fill_rule, true, transform);
    state.clip_mask = Some(mask);
}

#[allow(clippy::too_many_arguments)]
fn draw_string(
    pixmap: &mut Pixmap,
    state: &RasterState,
    x: f32,
    y: f32,
    text: &str,
    page_height_pt: f32,
    base_transform: Transform,
    registry: Option<&FontRegistry>,
) {
    let font_size = state.font_size.to_f32().max(0.0);
    if font_size <= 0.0 || text.is_empty() {
        return;
    }
    let Some(font) = registry.and_then(|r| r.resolve(&state.font_name)) else {
        return;
    };
    let Ok(face) = ttf_parser::Face::parse(&font.data, 0) else {
        return;
    };

    let baseline_x = x;
    let baseline_y = page_height_pt - y - font_size;
    let paint = fill_paint(state.fill_color, state.fill_opacity);
    let device_transform = base_transform.pre_concat(state.transform);

    for placement in layout_text_glyphs(&font.data, text, font_size, baseline_x, baseline_y) {
        let mut builder =
            GlyphPathBuilder::new(placement.origin_x, placement.origin_y, placement.scale);
        if face
            .outline_glyph(GlyphId(placement.glyph_id), &mut builder)
            .is_none()
        {
            continue;
        }
        let Some(path) = builder.finish() else {
            continue;
        };
        pixmap.fill_path(
            &path,
            &paint,
            FillRule::Winding,
            device_transform,
            state.clip_mask.as_ref(),
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_glyph_run(
    pixmap: &mut Pixmap,
    state: &RasterState,
    x: f32,
    y: f32,
    glyph_ids: &[u16],
    advances: &[(Pt, Pt)],
    m00: f32,
    m01: f32,
    m10: f32,
    m11: f32,
    page_height_pt: f32,
    base_transform: Transform,
    registry: Option<&FontRegistry>,
) {
    if glyph_ids.is_empty() {
        return;
    }
    let font_size = state.font_size.to_f32().max(0.0);
    if font_size <= 0.0 {
        return;
    }
    let Some(font) = registry.and_then(|r| r.resolve(&state.font_name)) else {
        return;
    };
    let Ok(face) = ttf_parser::Face::parse(&font.data, 0) else {
        return;
    };
    let upem = face.units_per_em().max(1) as f32;
    let scale = font_size / upem;

    let paint = fill_paint(state.fill_color, state.fill_opacity);
    let device_transform = base_transform.pre_concat(state.transform);

    let mut pen_x = x;
    let mut pen_y = page_height_pt - y;
    for (idx, gid) in glyph_ids.iter().enumerate() {
        if *gid != 0 {
            let mut builder = GlyphPathBuilder::new(0.0, 0.0, scale);
            if face.outline_glyph(GlyphId(*gid), &mut builder).is_some() {
                if let Some(path) = builder.finish() {
                    let local = Transform::from_row(m00, m01, m10, m11, pen_x, pen_y);
                    pixmap.fill_path(
                        &path,
                        &paint,
                        FillRule::Winding,
                        device_transform.pre_concat(local),
                        state.clip_mask.as_ref(),
                    );
                }
            }
        }

        let (adv_x, adv_y) = advances
            .get(idx)
            .map(|(dx, dy)| (dx.to_f32(), dy.to_f32()))
            .or_else(|| {
                face.glyph_hor_advance(GlyphId(*gid)).map(|w| {
                    let adv = (w as f32) * scale;
                    (m00 * adv, m01 * adv)
                })
            })
            .unwrap_or((font_size * 0.5, 0.0));
        if adv_x.is_finite() {
            pen_x += adv_x;
        }
        if adv_y.is_finite() {
            pen_y += adv_y;
        }
    }
}

#[derive(Clone, Copy)]
struct GlyphPlacement {
    glyph_id: u16,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

fn layout_text_glyphs(
    font_data: &[u8],
    text: &str,
    font_size: f32,
    baseline_x: f32,
    baseline_y: f32,
) -> Vec<GlyphPlacement> {
    let Some(face) = HbFace::from_slice(font_data, 0) else {
        return layout_text_glyphs_unshaped(font_data, text, font_size, baseline_x, baseline_y);
    };
    let hb_units = face.units_per_em().max(1) as f32;
    let scale = font_size / hb_units;
    let mut buffer = UnicodeBuffer::new();
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();
    if infos.is_empty() || infos.len() != positions.len() {
        return layout_text_glyphs_unshaped(font_data, text, font_size, baseline_x, baseline_y);
    }

    let mut out = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    let mut pen_y = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        if gid == 0 {
            pen_x += (pos.x_advance as f32 / hb_units) * font_size;
            pen_y += (pos.y_advance as f32 / hb_units) * font_size;
            continue;
        }
        let x_off = (pos.x_offset as f32 / hb_units) * font_size;
        let y_off = (pos.y_offset as f32 / hb_units) * font_size;
        out.push(GlyphPlacement {
            glyph_id: gid,
            origin_x: baseline_x + pen_x + x_off,
            origin_y: baseline_y + pen_y + y_off,
            scale,
        });
        pen_x += (pos.x_advance as f32 / hb_units) * font_size;
        pen_y += (pos.y_advance as f32 / hb_units) * font_size;
    }
    out
}

fn layout_text_glyphs_unshaped(
    font_data: &[u8],
    text: &str,
    font_size: f32,
    baseline_x: f32,
    baseline_y: f32,
) -> Vec<GlyphPlacement> {
    let Ok(face) = ttf_parser::Face::parse(font_data, 0) else {
        return Vec::new();
    };
    let units_per_em = face.units_per_em().max(1) as f32;
    let scale = font_size / units_per_em;

    let mut out = Vec::new();
    let mut pen_x = 0.0f32;
    for ch in text.chars() {
        let gid = face.glyph_index(ch).map(|id| id.0).unwrap_or(0);
        if gid == 0 {
            pen_x += font_size * 0.5;
            continue;
        }
        out.push(GlyphPlacement {
            glyph_id: gid,
            origin_x: baseline_x + pen_x,
            origin_y: baseline_y,
            scale,
        });
        let advance_units = face.glyph_hor_advance(GlyphId(gid)).unwrap_or(0) as f32;
        let mut adv = (advance_units / units_per_em) * font_size;
        if adv <= 0.0 {
            adv = font_size * 0.5;
        }
        pen_x += adv;
    }
    out
}

struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        self.builder.move_to(
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn line_to(&mut self, x: f32, y: f32) {
        self.builder.line_to(
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        self.builder.quad_to(
            self.origin_x + x1 * self.scale,
            self.origin_y + y1 * self.scale,
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        self.builder.cubic_to(
            self.origin_x + x1 * self.scale,
            self.origin_y + y1 * self.scale,
            self.origin_x + x2 * self.scale,
            self.origin_y + y2 * self.scale,
            self.origin_x + x * self.scale,
            self.origin_y + y * self.scale,
        );
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn take_path(path_builder: &mut PathBuilder, has_path: &mut bool) -> Option<Path> {
    if !*has_path {
        return None;
    }
    *has_path = false;
    let builder = std::mem::replace(path_builder, PathBuilder::new());
    builder.finish()
}

fn build_stroke(state: &RasterState) -> Stroke {
    let mut stroke = Stroke::default();
    stroke.width = state.line_width.to_f32().max(0.0);
    stroke.line_cap = match state.line_cap {
        1 => LineCap::Round,
        2 => LineCap::Square,
        _ => LineCap::Butt,
    };
    stroke.line_join = match state.line_join {
        1 => LineJoin::Round,
        2 => LineJoin::Bevel,
        _ => LineJoin::Miter,
    };
    stroke
}

fn fill_paint(color: Color, opacity: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(to_sk_color(color, opacity));
    paint.anti_alias = true;
    paint
}

fn to_sk_color(color: Color, opacity: f32) -> tiny_skia::Color {
    let r = color.r.clamp(0.0, 1.0);
    let g = color.g.clamp(0.0, 1.0);
    let b = color.b.clamp(0.0, 1.0);
    let a = opacity.clamp(0.0, 1.0);
    tiny_skia::Color::from_rgba(r, g, b, a)
        .unwrap_or_else(|| tiny_skia::Color::from_rgba8(0, 0, 0, 255))
}

fn pixmap_from_image(image: &RasterImage) -> Option<Pixmap> {
    let mut pixmap = Pixmap::new(image.width(), image.height())?;
    let dst = pixmap.data_mut();
    for (src_px, dst_px) in image
        .pixels()
        .chunks_exact(4)
        .zip(dst.chunks_exact_mut(4))
    {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

fn pt_milli_to_px_u32(pt_milli: i64, dpi: u32) -> Result<u32, FormstampError> {
    let px = pt_milli_to_px_i64(pt_milli, dpi)?;
    if px <= 0 {
        return Err(FormstampError::InvalidConfiguration(format!(
            "invalid non-positive pixel dimension {px} for pt_milli={pt_milli} dpi={dpi}"
        )));
    }
    u32::try_from(px).map_err(|_| {
        FormstampError::InvalidConfiguration(format!(
            "pixel dimension out of range: {px} for pt_milli={pt_milli} dpi={dpi}"
        ))
    })
}

fn pt_milli_to_px_i64(pt_milli: i64, dpi: u32) -> Result<i64, FormstampError> {
    if dpi == 0 {
        return Err(FormstampError::InvalidConfiguration(
            "dpi must be > 0".to_string(),
        ));
    }

    let num = (pt_milli as i128).saturating_mul(dpi as i128);
    let den = 72_000_i128;
    let px = if num >= 0 {
        (num + (den / 2)) / den
    } else {
        -(((-num) + (den / 2)) / den)
    };
    i64::try_from(px).map_err(|_| {
        FormstampError::InvalidConfiguration(format!(
            "pixel conversion overflow: pt_milli={pt_milli} dpi={dpi}"
        ))
    })
}

/// Concatenates page PNGs top to bottom: output width is the widest page,
/// height is the sum of page heights, and narrower pages leave white to
/// their right.
pub(crate) fn stitch_pages_vertical(pages: &[Vec<u8>]) -> Result<Vec<u8>, FormstampError> {
    if pages.is_empty() {
        return Err(FormstampError::InvalidConfiguration(
            "no pages to stitch".to_string(),
        ));
    }

    let mut decoded = Vec::with_capacity(pages.len());
    let mut max_width: u32 = 0;
    let mut total_height: u64 = 0;
    for bytes in pages {
        let img = image::load_from_memory(bytes)
            .map_err(|e| FormstampError::InvalidImage(format!("page decode failed: {e}")))?
            .to_rgba8();
        max_width = max_width.max(img.width());
        total_height += img.height() as u64;
        decoded.push(img);
    }
    let total_height = u32::try_from(total_height).map_err(|_| {
        FormstampError::InvalidImage(format!("stitched height overflow: {total_height}"))
    })?;

    let mut canvas = image::RgbaImage::from_pixel(
        max_width,
        total_height,
        image::Rgba([255, 255, 255, 255]),
    );
    let mut y_offset: i64 = 0;
    for img in &decoded {
        image::imageops::replace(&mut canvas, img, 0, y_offset);
        y_offset += img.height() as i64;
    }

    let mut out = Vec::new();
    let encoder = PngEncoder::new(&mut out);
    encoder
        .write_image(
            canvas.as_raw(),
            max_width,
            total_height,
            ExtendedColorType::Rgba8,
        )
        .map_err(|e| FormstampError::InvalidImage(format!("stitch encode failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Canvas;
    use crate::types::Size;

    fn encode_solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .expect("encode");
        out
    }

    #[test]
    fn pt_milli_to_px_rounds_half_away_from_zero() {
        assert_eq!(pt_milli_to_px_i64(500, 72).expect("px"), 1);
        assert_eq!(pt_milli_to_px_i64(499, 72).expect("px"), 0);
        assert_eq!(pt_milli_to_px_i64(72_000, 144).expect("px"), 144);
    }

    #[test]
    fn blank_page_renders_all_white() {
        let doc = Canvas::new(Size::new(100.0, 50.0)).finish();
        let pages = document_to_png_pages(&doc, 72, None).expect("raster");
        assert_eq!(pages.len(), 1);
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        assert_eq!((img.width(), img.height()), (100, 50));
        assert!(img.pixels().all(|p| p.0[0] == 255 && p.0[1] == 255));
    }

    #[test]
    fn draw_rect_paints_fill_color() {
        let mut canvas = Canvas::new(Size::new(100.0, 100.0));
        canvas.draw_rect(
            Pt::from_f32(10.0),
            Pt::from_f32(10.0),
            Pt::from_f32(30.0),
            Pt::from_f32(30.0),
        );
        let doc = canvas.finish();
        let pages = document_to_png_pages(&doc, 72, None).expect("raster");
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        let center = img.get_pixel(25, 25).0;
        assert!(center[0] < 30 && center[1] < 30 && center[2] < 30);
        let outside = img.get_pixel(80, 80).0;
        assert_eq!(outside, [255, 255, 255, 255]);
    }

    #[test]
    fn transparent_image_draw_leaves_page_white() {
        let mut canvas = Canvas::new(Size::new(100.0, 100.0));
        let transparent =
            RasterImage::from_rgba8(4, 4, vec![0u8; 64]).expect("image");
        canvas.draw_image(
            Pt::from_f32(10.0),
            Pt::from_f32(10.0),
            Pt::from_f32(50.0),
            Pt::from_f32(50.0),
            "ink",
            transparent,
        );
        let doc = canvas.finish();
        let pages = document_to_png_pages(&doc, 72, None).expect("raster");
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        assert!(img.pixels().all(|p| p.0[0] == 255 && p.0[2] == 255));
    }

    #[test]
    fn opaque_image_lands_at_placement() {
        let mut canvas = Canvas::new(Size::new(100.0, 100.0));
        let black = RasterImage::from_rgba8(
            2,
            2,
            vec![0, 0, 0, 255].repeat(4),
        )
        .expect("image");
        canvas.draw_image(
            Pt::from_f32(20.0),
            Pt::from_f32(30.0),
            Pt::from_f32(40.0),
            Pt::from_f32(20.0),
            "ink",
            black,
        );
        let doc = canvas.finish();
        let pages = document_to_png_pages(&doc, 72, None).expect("raster");
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        let inside = img.get_pixel(40, 40).0;
        assert!(inside[0] < 30, "inside={inside:?}");
        let above = img.get_pixel(40, 20).0;
        assert_eq!(above, [255, 255, 255, 255]);
    }

    #[test]
    fn draw_string_renders_glyph_outlines_when_font_available() {
        let Some(font_bytes) = crate::font::locate_test_font() else {
            return;
        };
        let mut registry = FontRegistry::new();
        let name = registry
            .register_bytes(font_bytes, Some("test"))
            .expect("register");

        let mut canvas = Canvas::new(Size::new(200.0, 60.0));
        canvas.set_font_name(&name);
        canvas.set_font_size(Pt::from_f32(24.0));
        canvas.draw_string(Pt::from_f32(10.0), Pt::from_f32(10.0), "Hg");
        let doc = canvas.finish();
        let pages = document_to_png_pages(&doc, 144, Some(&registry)).expect("raster");
        let img = image::load_from_memory(&pages[0]).expect("png").to_rgba8();
        assert!(img.pixels().any(|p| p.0[0] < 100));
    }

    #[test]
    fn stitch_two_pages_has_max_width_and_summed_height() {
        let red = encode_solid_png(30, 20, [255, 0, 0, 255]);
        let blue = encode_solid_png(50, 10, [0, 0, 255, 255]);
        let out = stitch_pages_vertical(&[red, blue]).expect("stitch");
        let img = image::load_from_memory(&out).expect("png").to_rgba8();
        assert_eq!((img.width(), img.height()), (50, 30));
        // Page 1 occupies rows 0..20, left 30 columns; the rest is white.
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(40, 5).0, [255, 255, 255, 255]);
        // Page 2 occupies rows 20..30 across the full 50 columns.
        assert_eq!(img.get_pixel(0, 25).0, [0, 0, 255, 255]);
        assert_eq!(img.get_pixel(45, 25).0, [0, 0, 255, 255]);
    }

    #[test]
    fn stitch_rejects_empty_input() {
        let err = stitch_pages_vertical(&[]).expect_err("empty");
        assert!(err.to_string().contains("no pages to stitch"));
    }
}
