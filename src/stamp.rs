use crate::compose::{OverlayPlan, PlannedInk, PlannedText};
use crate::error::FormstampError;
use crate::font::RegisteredFont;
use lopdf::{
    Document as LoDocument, Object as LoObject, ObjectId, Stream as LoStream, dictionary,
};
use std::collections::{BTreeMap, BTreeSet};

const FONT_RESOURCE: &str = "FS0";

fn lopdf_err(err: lopdf::Error) -> FormstampError {
    FormstampError::Pdf(format!("stamp error: {err}"))
}

/// Appends the overlay plan to the template document's pages and returns
/// the serialized result. The document is consumed per request; nothing
/// here mutates shared state.
pub(crate) fn stamp_overlay(
    mut doc: LoDocument,
    plan: &OverlayPlan,
    font: &RegisteredFont,
) -> Result<Vec<u8>, FormstampError> {
    let page_ids: Vec<ObjectId> = doc.get_pages().values().copied().collect();

    let mut used_gids: BTreeMap<u16, u16> = BTreeMap::new();
    for text in &plan.texts {
        for ch in text.text.chars() {
            let gid = font.glyph_id(ch);
            used_gids.entry(gid).or_insert_with(|| font.glyph_advance(gid));
        }
    }

    let font_id = if plan.texts.is_empty() {
        None
    } else {
        Some(ensure_font_registered(&mut doc, font, &used_gids)?)
    };

    let mut pages_touched: BTreeSet<usize> = BTreeSet::new();
    for text in &plan.texts {
        pages_touched.insert(text.page_index);
    }
    for ink in &plan.inks {
        pages_touched.insert(ink.page_index);
    }

    for page_index in pages_touched {
        let Some(page_id) = page_ids.get(page_index).copied() else {
            return Err(FormstampError::Pdf(format!(
                "overlay references page {} but the template has {}",
                page_index + 1,
                page_ids.len()
            )));
        };
        let page_height = crate::pdf_raster::page_size_for_id(&doc, page_id)?
            .height
            .to_f32();

        let mut content = String::new();
        if let Some(font_id) = font_id {
            attach_font_resource(&mut doc, page_id, font_id)?;
            for text in plan.texts.iter().filter(|t| t.page_index == page_index) {
                push_text_ops(&mut content, text, font, page_height);
            }
        }

        for (ink_index, ink) in plan
            .inks
            .iter()
            .enumerate()
            .filter(|(_, i)| i.page_index == page_index)
        {
            let resource_name = format!("FsInk{}", ink_index + 1);
            let image_id = add_image_xobject(&mut doc, ink)?;
            attach_xobject_resource(&mut doc, page_id, &resource_name, image_id)?;
            push_image_ops(&mut content, ink, &resource_name, page_height);
        }

        if !content.is_empty() {
            doc.add_page_contents(page_id, content.into_bytes())
                .map_err(lopdf_err)?;
        }
    }

    doc.compress();
    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

/// Embeds the configured font into the document as a Type0/Identity-H CID
/// font and returns its object id. Idempotent: if a Type0 font with the
/// same BaseFont already exists it is reused, so the font program is
/// present exactly once no matter how often this runs.
pub(crate) fn ensure_font_registered(
    doc: &mut LoDocument,
    font: &RegisteredFont,
    used_gids: &BTreeMap<u16, u16>,
) -> Result<ObjectId, FormstampError> {
    let base_font = pdf_font_name(font);

    let mut existing = None;
    for (id, object) in doc.objects.iter() {
        let Ok(dict) = object.as_dict() else {
            continue;
        };
        let is_type0 = dict
            .get(b"Subtype")
            .ok()
            .and_then(|o| o.as_name().ok())
            .map(|name| name == b"Type0")
            .unwrap_or(false);
        if !is_type0 {
            continue;
        }
        let matches = dict
            .get(b"BaseFont")
            .ok()
            .and_then(|o| o.as_name().ok())
            .map(|name| name == base_font.as_bytes())
            .unwrap_or(false);
        if matches {
            existing = Some(*id);
            break;
        }
    }
    if let Some(id) = existing {
        return Ok(id);
    }

    let metrics = font.metrics;
    let font_file_id = doc.add_object(LoStream::new(
        dictionary! {
            "Length1" => font.data.len() as i64,
        },
        font.data.clone(),
    ));
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => LoObject::Name(base_font.clone().into_bytes()),
        "Flags" => 4,
        "FontBBox" => vec![
            (metrics.bbox.0 as i64).into(),
            (metrics.bbox.1 as i64).into(),
            (metrics.bbox.2 as i64).into(),
            (metrics.bbox.3 as i64).into(),
        ],
        "ItalicAngle" => metrics.italic_angle as i64,
        "Ascent" => metrics.ascent as i64,
        "Descent" => metrics.descent as i64,
        "CapHeight" => metrics.cap_height as i64,
        "StemV" => 80,
        "FontFile2" => font_file_id,
    });

    let mut widths: Vec<LoObject> = Vec::with_capacity(used_gids.len() * 2);
    for (gid, advance) in used_gids {
        if *gid == 0 {
            continue;
        }
        widths.push((*gid as i64).into());
        widths.push(LoObject::Array(vec![(*advance as i64).into()]));
    }
    let cid_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => LoObject::Name(base_font.clone().into_bytes()),
        "CIDSystemInfo" => dictionary! {
            "Registry" => LoObject::String(b"Adobe".to_vec(), lopdf::StringFormat::Literal),
            "Ordering" => LoObject::String(b"Identity".to_vec(), lopdf::StringFormat::Literal),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "DW" => 1000,
        "W" => widths,
        "CIDToGIDMap" => "Identity",
    });

    let type0_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => LoObject::Name(base_font.into_bytes()),
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![LoObject::Reference(cid_font_id)],
    });
    Ok(type0_id)
}

fn pdf_font_name(font: &RegisteredFont) -> String {
    let cleaned: String = font
        .name
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-')
        .collect();
    if cleaned.is_empty() {
        "EmbeddedCidFont".to_string()
    } else {
        cleaned
    }
}

fn page_resources_dict(doc: &LoDocument, page_id: ObjectId) -> Result<lopdf::Dictionary, FormstampError> {
    let page = doc
        .get_object(page_id)
        .and_then(LoObject::as_dict)
        .map_err(lopdf_err)?;
    match page.get(b"Resources") {
        Ok(LoObject::Dictionary(d)) => Ok(d.clone()),
        Ok(LoObject::Reference(id)) => Ok(doc
            .get_object(*id)
            .ok()
            .and_then(|o| o.as_dict().ok())
            .cloned()
            .unwrap_or_default()),
        _ => Ok(lopdf::Dictionary::new()),
    }
}

fn sub_dict(doc: &LoDocument, resources: &lopdf::Dictionary, key: &[u8]) -> lopdf::Dictionary {
    match resources.get(key) {
        Ok(LoObject::Dictionary(d)) => d.clone(),
        Ok(LoObject::Reference(id)) => doc
            .get_object(*id)
            .ok()
            .and_then(|o| o.as_dict().ok())
            .cloned()
            .unwrap_or_default(),
        _ => lopdf::Dictionary::new(),
    }
}

fn write_resources(
    doc: &mut LoDocument,
    page_id: ObjectId,
    resources: lopdf::Dictionary,
) -> Result<(), FormstampError> {
    let page = doc
        .get_object_mut(page_id)
        .and_then(LoObject::as_dict_mut)
        .map_err(lopdf_err)?;
    page.set("Resources", LoObject::Dictionary(resources));
    Ok(())
}

fn attach_font_resource(
    doc: &mut LoDocument,
    page_id: ObjectId,
    font_id: ObjectId,
) -> Result<(), FormstampError> {
    let mut resources = page_resources_dict(doc, page_id)?;
    let mut fonts = sub_dict(doc, &resources, b"Font");
    if let Ok(LoObject::Reference(existing)) = fonts.get(FONT_RESOURCE.as_bytes()) {
        if *existing == font_id {
            return Ok(());
        }
    }
    fonts.set(FONT_RESOURCE.as_bytes().to_vec(), LoObject::Reference(font_id));
    resources.set("Font", LoObject::Dictionary(fonts));
    write_resources(doc, page_id, resources)
}

fn attach_xobject_resource(
    doc: &mut LoDocument,
    page_id: ObjectId,
    name: &str,
    xobject_id: ObjectId,
) -> Result<(), FormstampError> {
    let mut resources = page_resources_dict(doc, page_id)?;
    let mut xobjects = sub_dict(doc, &resources, b"XObject");
    xobjects.set(name.as_bytes().to_vec(), LoObject::Reference(xobject_id));
    resources.set("XObject", LoObject::Dictionary(xobjects));
    write_resources(doc, page_id, resources)
}

/// Embeds the ink image as an RGB Image XObject with its alpha channel in
/// an SMask, so partially transparent strokes composite over whatever the
/// template already draws in that cell.
fn add_image_xobject(doc: &mut LoDocument, ink: &PlannedInk) -> Result<ObjectId, FormstampError> {
    let width = ink.image.width();
    let height = ink.image.height();
    let pixel_count = (width as usize) * (height as usize);
    let mut rgb = Vec::with_capacity(pixel_count * 3);
    let mut alpha = Vec::with_capacity(pixel_count);
    for px in ink.image.pixels().chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
        alpha.push(px[3]);
    }

    let smask_id = doc.add_object(LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        alpha,
    ));
    let image_id = doc.add_object(LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => width as i64,
            "Height" => height as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "SMask" => smask_id,
        },
        rgb,
    ));
    Ok(image_id)
}

fn push_text_ops(content: &mut String, text: &PlannedText, font: &RegisteredFont, page_height: f32) {
    let mut hex = String::with_capacity(text.text.chars().count() * 4);
    for ch in text.text.chars() {
        hex.push_str(&format!("{:04X}", font.glyph_id(ch)));
    }
    let baseline_y = page_height - text.y.to_f32();
    content.push_str(&format!(
        "q 0 g BT /{} {:.2} Tf 1 0 0 1 {:.2} {:.2} Tm <{}> Tj ET Q\n",
        FONT_RESOURCE,
        text.font_size.to_f32(),
        text.x.to_f32(),
        baseline_y,
        hex
    ));
}

fn push_image_ops(content: &mut String, ink: &PlannedInk, resource_name: &str, page_height: f32) {
    let x = ink.rect.x.to_f32();
    let w = ink.rect.width.to_f32();
    let h = ink.rect.height.to_f32();
    let y_bottom = page_height - ink.rect.y.to_f32() - h;
    content.push_str(&format!(
        "q {:.2} 0 0 {:.2} {:.2} {:.2} cm /{} Do Q\n",
        w, h, x, y_bottom, resource_name
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::RasterImage;
    use crate::font::FontRegistry;
    use crate::types::{Pt, Rect};

    fn make_template_bytes(pages: usize) -> Vec<u8> {
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
        let mut kids: Vec<LoObject> = Vec::new();
        for idx in 0..pages {
            let content = format!("BT /F1 18 Tf 72 720 Td (PAGE{}) Tj ET", idx + 1).into_bytes();
            let content_id = doc.add_object(LoStream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 792.into(), 612.into()],
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
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

    fn test_font() -> Option<RegisteredFont> {
        let data = crate::font::locate_test_font()?;
        let mut registry = FontRegistry::new();
        let name = registry.register_bytes(data, Some("test")).ok()?;
        registry.resolve(&name).cloned()
    }

    fn ink(width: u32, height: u32) -> PlannedInk {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..(width * height) {
            pixels.extend_from_slice(&[0, 0, 0, 255]);
        }
        PlannedInk {
            page_index: 1,
            rect: Rect::new(262.0, 468.0, 60.0, 30.0),
            image: RasterImage::from_rgba8(width, height, pixels).expect("image"),
        }
    }

    fn count_type0_fonts(doc: &LoDocument) -> usize {
        doc.objects
            .values()
            .filter_map(|o| o.as_dict().ok())
            .filter(|d| {
                d.get(b"Subtype")
                    .ok()
                    .and_then(|o| o.as_name().ok())
                    .map(|n| n == b"Type0")
                    .unwrap_or(false)
            })
            .count()
    }

    #[test]
    fn ensure_font_registered_is_idempotent() {
        let Some(font) = test_font() else {
            return;
        };
        let mut doc = LoDocument::load_mem(&make_template_bytes(2)).expect("load");
        let mut gids = BTreeMap::new();
        gids.insert(font.glyph_id('A'), font.glyph_advance(font.glyph_id('A')));

        let first = ensure_font_registered(&mut doc, &font, &gids).expect("register");
        let second = ensure_font_registered(&mut doc, &font, &gids).expect("register again");
        assert_eq!(first, second);
        assert_eq!(count_type0_fonts(&doc), 1);
    }

    #[test]
    fn stamp_produces_loadable_pdf_with_overlay_content() {
        let Some(font) = test_font() else {
            return;
        };
        let doc = LoDocument::load_mem(&make_template_bytes(2)).expect("load");
        let plan = OverlayPlan {
            texts: vec![PlannedText {
                page_index: 0,
                x: Pt::from_f32(131.0),
                y: Pt::from_f32(118.0),
                font_size: Pt::from_f32(12.0),
                text: "Ward A".to_string(),
            }],
            inks: vec![ink(4, 4)],
        };

        let bytes = stamp_overlay(doc, &plan, &font).expect("stamp");
        let stamped = LoDocument::load_mem(&bytes).expect("reload");
        assert_eq!(stamped.get_pages().len(), 2);

        let page_ids: Vec<ObjectId> = stamped.get_pages().values().copied().collect();
        let page1 = stamped.get_page_content(page_ids[0]).expect("content 1");
        let page1 = String::from_utf8_lossy(&page1);
        assert!(page1.contains("/FS0"));
        assert!(page1.contains("Tj"));

        let page2 = stamped.get_page_content(page_ids[1]).expect("content 2");
        let page2 = String::from_utf8_lossy(&page2);
        assert!(page2.contains("/FsInk1 Do"));
        assert_eq!(count_type0_fonts(&stamped), 1);
    }

    #[test]
    fn stamp_without_text_skips_font_embedding() {
        let Some(font) = test_font() else {
            return;
        };
        let doc = LoDocument::load_mem(&make_template_bytes(2)).expect("load");
        let plan = OverlayPlan {
            texts: Vec::new(),
            inks: vec![ink(4, 4)],
        };
        let bytes = stamp_overlay(doc, &plan, &font).expect("stamp");
        let stamped = LoDocument::load_mem(&bytes).expect("reload");
        assert_eq!(count_type0_fonts(&stamped), 0);
    }

    #[test]
    fn stamp_rejects_out_of_range_page() {
        let Some(font) = test_font() else {
            return;
        };
        let doc = LoDocument::load_mem(&make_template_bytes(1)).expect("load");
        let plan = OverlayPlan {
            texts: Vec::new(),
            inks: vec![ink(2, 2)],
        };
        let err = stamp_overlay(doc, &plan, &font).expect_err("page out of range");
        assert!(err.to_string().contains("references page 2"));
    }

    #[test]
    fn image_xobject_carries_smask_alpha() {
        let mut doc = LoDocument::load_mem(&make_template_bytes(1)).expect("load");
        let mut planned = ink(2, 1);
        planned.image =
            RasterImage::from_rgba8(2, 1, vec![255, 0, 0, 255, 0, 0, 0, 0]).expect("image");
        let image_id = add_image_xobject(&mut doc, &planned).expect("xobject");
        let stream = doc
            .get_object(image_id)
            .and_then(LoObject::as_stream)
            .expect("stream");
        assert_eq!(stream.content, vec![255, 0, 0, 0, 0, 0]);
        let smask_id = stream
            .dict
            .get(b"SMask")
            .and_then(LoObject::as_reference)
            .expect("smask ref");
        let smask = doc
            .get_object(smask_id)
            .and_then(LoObject::as_stream)
            .expect("smask stream");
        assert_eq!(smask.content, vec![255, 0]);
    }
}
