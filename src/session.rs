use crate::canvas::RasterImage;
use crate::compose::{CompositionRequest, OutputDocument, OutputFormat, SignatureOverlay};
use crate::error::FormstampError;
use crate::layout::InkField;
use crate::Formstamp;
use std::collections::HashMap;
use std::io::Write;
use zip::write::{FileOptions, ZipWriter};

/// Session-scoped ordered store of generated outputs. Append-only; the
/// sequence order is the generation order and the last element is always
/// the latest. Dropped with the session, never shared across sessions.
#[derive(Debug, Default)]
pub struct ExportAccumulator {
    items: Vec<OutputDocument>,
}

impl ExportAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// No deduplication: duplicate filenames are retained, matching how
    /// rapid repeated generations behave.
    pub fn append(&mut self, doc: OutputDocument) {
        self.items.push(doc);
    }

    pub fn latest(&self) -> Option<&OutputDocument> {
        self.items.last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[OutputDocument] {
        &self.items
    }

    /// Batch download is only offered once there is something to batch.
    pub fn can_archive(&self) -> bool {
        self.items.len() >= 2
    }

    /// Packs every accumulated output into a zip, one deflate-compressed
    /// entry per item named by its filename, in insertion order.
    pub fn archive(&self) -> Result<Vec<u8>, FormstampError> {
        if !self.can_archive() {
            return Err(FormstampError::ArchiveNotAvailable);
        }

        let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for item in &self.items {
            zip.start_file::<_, ()>(
                item.filename.as_str(),
                FileOptions::default().compression_method(zip::CompressionMethod::Deflated),
            )
            .map_err(zip_err)?;
            zip.write_all(&item.bytes)?;
        }
        let cursor = zip.finish().map_err(zip_err)?;
        Ok(cursor.into_inner())
    }
}

fn zip_err(err: zip::result::ZipError) -> FormstampError {
    FormstampError::Io(std::io::Error::other(err))
}

/// Where a session currently stands. Explicit named transitions replace
/// the nested UI triggers of the original tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    CollectingInput,
    Generated,
    ReadyForNext,
}

/// A batch-download artifact: the zip plus its generated filename.
#[derive(Debug, Clone)]
pub struct ArchiveDownload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One interactive session: the in-progress inputs, the accumulator of
/// finished outputs, and the current phase. Owned by the caller; created
/// at session start and dropped at session end.
#[derive(Debug, Default)]
pub struct Session {
    phase: SessionPhase,
    department: String,
    reason: String,
    inks: HashMap<InkField, RasterImage>,
    accumulator: ExportAccumulator,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn department(&self) -> &str {
        &self.department
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn accumulator(&self) -> &ExportAccumulator {
        &self.accumulator
    }

    pub fn set_department(&mut self, department: impl Into<String>) {
        self.department = department.into();
        self.input_edited();
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
        self.input_edited();
    }

    pub fn set_ink(&mut self, field: InkField, image: RasterImage) {
        self.inks.insert(field, image);
        self.input_edited();
    }

    pub fn clear_ink(&mut self, field: InkField) {
        self.inks.remove(&field);
        self.input_edited();
    }

    fn input_edited(&mut self) {
        if self.phase == SessionPhase::ReadyForNext {
            self.phase = SessionPhase::CollectingInput;
        }
    }

    /// Composes one output from the current inputs and appends it to the
    /// accumulator. Empty required fields are rejected by the engine
    /// before any compositing work starts.
    pub fn generate(
        &mut self,
        engine: &Formstamp,
        format: OutputFormat,
    ) -> Result<&OutputDocument, FormstampError> {
        let mut request = CompositionRequest::new(self.department.clone(), self.reason.clone());
        for field in [
            InkField::ChiefSignature,
            InkField::InspectorSignature,
            InkField::Score,
        ] {
            if let Some(image) = self.inks.get(&field) {
                request.signatures.push(SignatureOverlay {
                    field,
                    image: image.clone(),
                });
            }
        }

        let output = engine.compose(&request, format)?;
        self.accumulator.append(output);
        self.phase = SessionPhase::Generated;
        Ok(self.accumulator.latest().expect("just appended"))
    }

    pub fn download_latest(&self) -> Option<&OutputDocument> {
        self.accumulator.latest()
    }

    pub fn can_download_archive(&self) -> bool {
        self.accumulator.can_archive()
    }

    pub fn download_archive(
        &self,
        engine: &Formstamp,
    ) -> Result<ArchiveDownload, FormstampError> {
        let started = std::time::Instant::now();
        let bytes = self.accumulator.archive()?;
        if let Some(perf) = engine.perf() {
            perf.log_span_ms("archive", started.elapsed().as_secs_f64() * 1000.0);
            perf.log_count("archive.entries", self.accumulator.len() as u64);
            perf.flush();
        }
        Ok(ArchiveDownload {
            filename: engine.archive_name(),
            bytes,
        })
    }

    /// Clears the per-entry inputs while keeping every accumulated
    /// output, ready for the next department.
    pub fn next_entry(&mut self) {
        self.department.clear();
        self.reason.clear();
        self.inks.clear();
        self.phase = if self.phase == SessionPhase::Generated {
            SessionPhase::ReadyForNext
        } else {
            SessionPhase::CollectingInput
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn doc(filename: &str, bytes: &[u8]) -> OutputDocument {
        OutputDocument {
            filename: filename.to_string(),
            format: OutputFormat::Pdf,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn latest_returns_last_appended_item() {
        let mut acc = ExportAccumulator::new();
        assert!(acc.latest().is_none());
        for i in 0..5 {
            acc.append(doc(&format!("f{i}.pdf"), &[i as u8]));
        }
        assert_eq!(acc.len(), 5);
        assert_eq!(acc.latest().expect("latest").filename, "f4.pdf");
    }

    #[test]
    fn archive_requires_two_items() {
        let mut acc = ExportAccumulator::new();
        assert!(!acc.can_archive());
        assert!(matches!(
            acc.archive(),
            Err(FormstampError::ArchiveNotAvailable)
        ));

        acc.append(doc("a.pdf", b"A"));
        assert!(!acc.can_archive());
        assert!(matches!(
            acc.archive(),
            Err(FormstampError::ArchiveNotAvailable)
        ));

        acc.append(doc("b.pdf", b"B"));
        assert!(acc.can_archive());
        assert!(acc.archive().is_ok());
    }

    #[test]
    fn archive_round_trips_entry_names_and_bytes() {
        let mut acc = ExportAccumulator::new();
        acc.append(doc("表_内科_20240305_120000.pdf", b"first payload"));
        acc.append(doc("表_外科_20240305_120001.pdf", b"second payload"));

        let bytes = acc.archive().expect("archive");
        let cursor = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(cursor).expect("open zip");
        assert_eq!(archive.len(), 2);

        let mut first = Vec::new();
        archive
            .by_name("表_内科_20240305_120000.pdf")
            .expect("entry 1")
            .read_to_end(&mut first)
            .expect("read 1");
        assert_eq!(first, b"first payload");

        let mut second = Vec::new();
        archive
            .by_name("表_外科_20240305_120001.pdf")
            .expect("entry 2")
            .read_to_end(&mut second)
            .expect("read 2");
        assert_eq!(second, b"second payload");
    }

    #[test]
    fn archive_keeps_duplicate_filenames_and_order() {
        let mut acc = ExportAccumulator::new();
        acc.append(doc("same.pdf", b"one"));
        acc.append(doc("same.pdf", b"two"));
        assert_eq!(acc.len(), 2);

        let bytes = acc.archive().expect("archive");
        let cursor = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(cursor).expect("open zip");
        assert_eq!(archive.len(), 2);

        let mut contents = Vec::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx).expect("entry");
            assert_eq!(entry.name(), "same.pdf");
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).expect("read");
            contents.push(buf);
        }
        assert_eq!(contents, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn archive_entries_are_deflate_compressed() {
        let mut acc = ExportAccumulator::new();
        acc.append(doc("a.bin", &vec![b'x'; 10_000]));
        acc.append(doc("b.bin", &vec![b'y'; 10_000]));
        let bytes = acc.archive().expect("archive");
        assert!(bytes.len() < 20_000, "zip is {} bytes", bytes.len());
    }

    #[test]
    fn session_phase_starts_collecting_and_edits_reset_ready_state() {
        let mut session = Session::new();
        assert_eq!(session.phase(), SessionPhase::CollectingInput);

        session.set_department("内科");
        assert_eq!(session.phase(), SessionPhase::CollectingInput);

        // Force the post-generate state without an engine round trip.
        session.phase = SessionPhase::Generated;
        session.next_entry();
        assert_eq!(session.phase(), SessionPhase::ReadyForNext);
        assert!(session.department().is_empty());

        session.set_reason("扣分");
        assert_eq!(session.phase(), SessionPhase::CollectingInput);
    }

    #[test]
    fn next_entry_preserves_accumulated_outputs() {
        let mut session = Session::new();
        session.accumulator.append(doc("kept.pdf", b"K"));
        session.set_department("内科");
        session.phase = SessionPhase::Generated;
        session.next_entry();
        assert_eq!(session.accumulator().len(), 1);
        assert_eq!(session.download_latest().expect("latest").filename, "kept.pdf");
    }

    #[test]
    fn ink_edits_can_be_cleared() {
        let mut session = Session::new();
        let image = RasterImage::from_rgba8(1, 1, vec![0, 0, 0, 255]).expect("image");
        session.set_ink(InkField::Score, image);
        assert_eq!(session.inks.len(), 1);
        session.clear_ink(InkField::Score);
        assert!(session.inks.is_empty());
    }
}
