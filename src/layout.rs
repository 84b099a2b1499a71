use crate::types::{Pt, Rect, Size};

/// A fixed baseline position for a single line of inserted text.
/// `y` runs from the top edge of the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextSlot {
    pub page_index: usize,
    pub x: Pt,
    pub y: Pt,
    pub font_size: Pt,
}

impl TextSlot {
    pub fn new(page_index: usize, x: f32, y: f32, font_size: f32) -> Self {
        Self {
            page_index,
            x: Pt::from_f32(x),
            y: Pt::from_f32(y),
            font_size: Pt::from_f32(font_size),
        }
    }
}

/// A fixed rectangle that receives wrapped multi-line text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextBoxSlot {
    pub page_index: usize,
    pub rect: Rect,
    pub font_size: Pt,
    pub leading: Pt,
}

/// A fixed rectangle that receives a raster ink image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InkSlot {
    pub page_index: usize,
    pub rect: Rect,
}

impl InkSlot {
    pub fn new(page_index: usize, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            page_index,
            rect: Rect::new(x, y, width, height),
        }
    }
}

/// The three ink inputs the form collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InkField {
    ChiefSignature,
    InspectorSignature,
    Score,
}

/// Placement table for the inspection form.
///
/// Every coordinate is configuration rather than a hardcoded constant:
/// the digitized source forms disagree on small details (date baseline at
/// 118 vs 120, reason text prefixed or not), so callers pin the variant
/// they need and the defaults follow the richest one.
#[derive(Debug, Clone, PartialEq)]
pub struct FormLayout {
    pub date: TextSlot,
    pub department: TextSlot,
    pub reason: TextBoxSlot,
    pub chief_signature: InkSlot,
    pub inspector_signature: InkSlot,
    pub score: InkSlot,
    /// Page size of the raster-only variant's blank canvas.
    pub blank_canvas: Size,
}

impl Default for FormLayout {
    fn default() -> Self {
        let score = InkSlot::new(1, 522.0, 468.0, 100.0, 50.0);
        Self {
            date: TextSlot::new(0, 671.0, 118.0, 10.0),
            department: TextSlot::new(0, 131.0, 118.0, 12.0),
            // The reason box hangs below the score slot on the second page.
            reason: TextBoxSlot {
                page_index: 1,
                rect: Rect::new(422.0, 528.0, 300.0, 80.0),
                font_size: Pt::from_f32(11.0),
                leading: Pt::from_f32(14.3),
            },
            chief_signature: InkSlot::new(1, 262.0, 468.0, 60.0, 30.0),
            inspector_signature: InkSlot::new(1, 80.0, 468.0, 60.0, 30.0),
            score,
            blank_canvas: Size::a4(),
        }
    }
}

impl FormLayout {
    /// Highest page index any slot references, as a 1-based page count the
    /// template must provide.
    pub fn required_pages(&self) -> usize {
        let mut max_index = self.date.page_index.max(self.department.page_index);
        max_index = max_index.max(self.reason.page_index);
        for slot in [
            &self.chief_signature,
            &self.inspector_signature,
            &self.score,
        ] {
            max_index = max_index.max(slot.page_index);
        }
        max_index + 1
    }

    pub fn ink_slot(&self, field: InkField) -> InkSlot {
        match field {
            InkField::ChiefSignature => self.chief_signature,
            InkField::InspectorSignature => self.inspector_signature,
            InkField::Score => self.score,
        }
    }
}
