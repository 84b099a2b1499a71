use crate::error::FormstampError;
use crate::types::Pt;
use rustybuzz::{Face as HbFace, UnicodeBuffer};
use std::collections::HashMap;
use std::path::Path;
use ttf_parser::GlyphId;

/// Metrics normalized to a 1000-unit em, the scale PDF font descriptors
/// and width arrays use.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FontMetrics {
    pub(crate) ascent: i16,
    pub(crate) descent: i16,
    pub(crate) cap_height: i16,
    pub(crate) italic_angle: i16,
    pub(crate) bbox: (i16, i16, i16, i16),
}

#[derive(Debug, Clone)]
pub(crate) struct RegisteredFont {
    pub(crate) name: String,
    pub(crate) data: Vec<u8>,
    pub(crate) metrics: FontMetrics,
    // Advances for ASCII 32..=126 in 1000-unit space; the fast path for
    // measurement without shaping.
    ascii_widths: [u16; 95],
}

impl RegisteredFont {
    /// Glyph id for a character, 0 when the font has no mapping.
    pub(crate) fn glyph_id(&self, ch: char) -> u16 {
        let Ok(face) = ttf_parser::Face::parse(&self.data, 0) else {
            return 0;
        };
        face.glyph_index(ch).map(|gid| gid.0).unwrap_or(0)
    }

    /// Horizontal advance for a glyph id in 1000-unit space.
    pub(crate) fn glyph_advance(&self, gid: u16) -> u16 {
        let Ok(face) = ttf_parser::Face::parse(&self.data, 0) else {
            return 0;
        };
        let advance = face.glyph_hor_advance(GlyphId(gid)).unwrap_or(0);
        let units = face.units_per_em().max(1) as i64;
        let scaled = ((advance as i64) * 1000 + (units / 2)) / units;
        scaled.clamp(0, u16::MAX as i64) as u16
    }
}

#[derive(Debug, Default)]
pub(crate) struct FontRegistry {
    fonts: Vec<RegisteredFont>,
    lookup: HashMap<String, usize>,
}

impl FontRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_file(&mut self, path: impl AsRef<Path>) -> Result<String, FormstampError> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|_| FormstampError::MissingResource(format!("font file {}", path.display())))?;
        let source = path.file_stem().and_then(|v| v.to_str());
        self.register_bytes(data, source)
    }

    pub(crate) fn register_bytes(
        &mut self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, FormstampError> {
        let source = source_name.unwrap_or("EmbeddedFont");
        let Ok(face) = ttf_parser::Face::parse(&data, 0) else {
            return Err(FormstampError::InvalidConfiguration(format!(
                "invalid font data for {source}"
            )));
        };

        let (name, aliases) = font_names(&face, source);
        let metrics = metrics_from_face(&face);
        let ascii_widths = build_ascii_widths(&face);
        let index = self.fonts.len();
        self.fonts.push(RegisteredFont {
            name: name.clone(),
            data,
            metrics,
            ascii_widths,
        });

        for alias in std::iter::once(name.clone()).chain(aliases) {
            let key = normalize_name(&alias);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, index);
        }

        Ok(name)
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&RegisteredFont> {
        let key = normalize_name(name);
        self.lookup
            .get(&key)
            .and_then(|index| self.fonts.get(*index))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    /// Re-registers every font of `other` into this registry. Names that
    /// already resolve keep their first registration.
    pub(crate) fn adopt_all(&mut self, other: &FontRegistry) {
        for font in &other.fonts {
            let _ = self.register_bytes(font.data.clone(), Some(&font.name));
        }
    }

    /// Measures rendered text width. ASCII-only runs use the precomputed
    /// advance table; anything else (CJK in particular) goes through the
    /// shaper so the measurement matches what the rasterizer draws.
    pub(crate) fn measure_text_width(&self, name: &str, font_size: Pt, text: &str) -> Pt {
        let Some(font) = self.resolve(name) else {
            // Unresolved fonts get the half-em estimate used everywhere
            // else in the raster path.
            let char_width = (font_size * 0.5).max(Pt::from_f32(1.0));
            return char_width * (text.chars().count() as i32);
        };

        if text.chars().all(|ch| (' '..='~').contains(&ch)) {
            let mut total_units: i32 = 0;
            for ch in text.chars() {
                let idx = (ch as usize) - (' ' as usize);
                total_units = total_units.saturating_add(font.ascii_widths[idx] as i32);
            }
            if total_units <= 0 {
                return Pt::ZERO;
            }
            return font_size.mul_ratio(total_units, 1000);
        }

        measure_shaped(font, font_size, text).unwrap_or_else(|| {
            let char_width = (font_size * 0.5).max(Pt::from_f32(1.0));
            char_width * (text.chars().count() as i32)
        })
    }
}

fn measure_shaped(font: &RegisteredFont, font_size: Pt, text: &str) -> Option<Pt> {
    let face = HbFace::from_slice(&font.data, 0)?;
    let units_per_em = face.units_per_em().max(1) as i64;

    let mut buffer = UnicodeBuffer::new();
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let positions = output.glyph_positions();
    if positions.is_empty() {
        return None;
    }
    let mut total_units: i32 = 0;
    for pos in positions {
        let adv = (((pos.x_advance as i64) * 1000 + (units_per_em / 2)) / units_per_em) as i32;
        total_units = total_units.saturating_add(adv);
    }
    if total_units <= 0 {
        return Some(Pt::ZERO);
    }
    Some(font_size.mul_ratio(total_units, 1000))
}

fn metrics_from_face(face: &ttf_parser::Face<'_>) -> FontMetrics {
    let units_per_em = face.units_per_em().max(1);
    let scale = 1000.0 / units_per_em as f32;
    let ascent = scale_i16(face.ascender(), scale);
    let descent = scale_i16(face.descender(), scale);
    let cap_height = face
        .capital_height()
        .map(|value| scale_i16(value, scale))
        .unwrap_or(ascent);
    let italic_angle = face
        .italic_angle()
        .map(|value| value.round() as i16)
        .unwrap_or(0);
    let bbox = face.global_bounding_box();
    FontMetrics {
        ascent,
        descent,
        cap_height,
        italic_angle,
        bbox: (
            scale_i16(bbox.x_min, scale),
            scale_i16(bbox.y_min, scale),
            scale_i16(bbox.x_max, scale),
            scale_i16(bbox.y_max, scale),
        ),
    }
}

fn build_ascii_widths(face: &ttf_parser::Face<'_>) -> [u16; 95] {
    let units = face.units_per_em().max(1) as i64;
    let mut widths = [0u16; 95];
    for (idx, width) in widths.iter_mut().enumerate() {
        let ch = (b' ' + idx as u8) as char;
        let advance = face
            .glyph_index(ch)
            .and_then(|gid| face.glyph_hor_advance(gid))
            .unwrap_or(0);
        let scaled = ((advance as i64) * 1000 + (units / 2)) / units;
        *width = scaled.clamp(0, u16::MAX as i64) as u16;
    }
    widths
}

fn scale_i16(value: i16, scale: f32) -> i16 {
    let scaled = (value as f32 * scale).round() as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn font_names(face: &ttf_parser::Face<'_>, source: &str) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => {
                if family.is_none() {
                    family = Some(name);
                }
            }
            name_id::FULL_NAME => {
                if full.is_none() {
                    full = Some(name);
                }
            }
            name_id::POST_SCRIPT_NAME => {
                if post.is_none() {
                    post = Some(name);
                }
            }
            _ => {}
        }
    }

    let stem = Some(source.to_string()).filter(|v| !v.is_empty());
    let primary = post
        .clone()
        .or_else(|| full.clone())
        .or_else(|| family.clone())
        .or_else(|| stem.clone())
        .unwrap_or_else(|| "EmbeddedFont".to_string());

    let mut aliases = Vec::new();
    for candidate in [family, full, post, stem].into_iter().flatten() {
        if candidate != primary {
            aliases.push(candidate);
        }
    }

    (primary, aliases)
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

/// Finds an installed TrueType font for tests that need real glyph data.
/// Tests that get `None` back simply pass without exercising that path.
#[cfg(test)]
pub(crate) fn locate_test_font() -> Option<Vec<u8>> {
    fn scan(dir: &Path, depth: usize) -> Option<Vec<u8>> {
        if depth == 0 {
            return None;
        }
        let entries = std::fs::read_dir(dir).ok()?;
        let mut subdirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                subdirs.push(path);
                continue;
            }
            let ext = path
                .extension()
                .and_then(|v| v.to_str())
                .map(|v| v.to_ascii_lowercase());
            // TrueType only: the stamped font program is embedded as
            // FontFile2, which does not cover CFF outlines.
            if ext.as_deref() != Some("ttf") {
                continue;
            }
            if let Ok(bytes) = std::fs::read(&path) {
                if ttf_parser::Face::parse(&bytes, 0).is_ok() {
                    return Some(bytes);
                }
            }
        }
        for sub in subdirs {
            if let Some(found) = scan(&sub, depth - 1) {
                return Some(found);
            }
        }
        None
    }

    for dir in [
        "/usr/share/fonts",
        "/usr/local/share/fonts",
        "/System/Library/Fonts",
        "/Library/Fonts",
        "C:\\Windows\\Fonts",
    ] {
        if let Some(found) = scan(Path::new(dir), 4) {
            return Some(found);
        }
    }
    None
}
