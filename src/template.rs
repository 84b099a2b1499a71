use crate::error::FormstampError;
use crate::types::Size;
use lopdf::Document as LoDocument;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Where the compositing base comes from. The form variants either stamp
/// onto a scanned two-page PDF or draw onto a fixed blank canvas.
#[derive(Debug, Clone)]
pub enum TemplateSource {
    PdfFile {
        path: PathBuf,
        /// Optional digest pin; a mismatch rejects the template before
        /// any compositing happens.
        sha256: Option<String>,
    },
    PdfBytes(Vec<u8>),
    Blank(Size),
}

/// Shallow structural facts about a PDF, gathered before it is accepted
/// as a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateReport {
    pub pdf_version: String,
    pub page_count: usize,
    pub encrypted: bool,
    pub file_size_bytes: usize,
}

pub fn inspect_pdf_bytes(bytes: &[u8]) -> Result<TemplateReport, FormstampError> {
    let pdf = LoDocument::load_mem(bytes)
        .map_err(|err| FormstampError::Pdf(format!("template parse failed: {err}")))?;
    Ok(TemplateReport {
        pdf_version: pdf.version.clone(),
        page_count: pdf.get_pages().len(),
        encrypted: pdf.is_encrypted(),
        file_size_bytes: bytes.len(),
    })
}

/// A validated, read-only template. PDF templates keep their raw bytes;
/// every compose parses a fresh document from them so requests cannot
/// observe each other.
#[derive(Debug)]
pub(crate) enum Template {
    Pdf { bytes: Vec<u8>, page_count: usize },
    Blank(Size),
}

impl Template {
    pub(crate) fn load(
        source: &TemplateSource,
        required_pages: usize,
    ) -> Result<Template, FormstampError> {
        match source {
            TemplateSource::Blank(size) => Ok(Template::Blank(*size)),
            TemplateSource::PdfBytes(bytes) => Self::from_pdf_bytes(bytes.clone(), required_pages),
            TemplateSource::PdfFile { path, sha256 } => {
                let bytes = std::fs::read(path).map_err(|_| {
                    FormstampError::MissingResource(format!("template file {}", path.display()))
                })?;
                if let Some(expected) = sha256 {
                    let found = sha256_hex(&bytes);
                    if !found.eq_ignore_ascii_case(expected) {
                        return Err(FormstampError::InvalidConfiguration(format!(
                            "template digest mismatch for {}: expected {} found {}",
                            path.display(),
                            expected,
                            found
                        )));
                    }
                }
                Self::from_pdf_bytes(bytes, required_pages)
            }
        }
    }

    fn from_pdf_bytes(bytes: Vec<u8>, required_pages: usize) -> Result<Template, FormstampError> {
        let report = inspect_pdf_bytes(&bytes)?;
        if report.encrypted {
            return Err(FormstampError::Pdf(
                "template PDF is encrypted".to_string(),
            ));
        }
        if report.page_count < required_pages {
            return Err(FormstampError::InsufficientTemplatePages {
                required: required_pages,
                found: report.page_count,
            });
        }
        Ok(Template::Pdf {
            bytes,
            page_count: report.page_count,
        })
    }

    pub(crate) fn open_pdf(&self) -> Result<LoDocument, FormstampError> {
        match self {
            Template::Pdf { bytes, .. } => LoDocument::load_mem(bytes)
                .map_err(|err| FormstampError::Pdf(format!("template reload failed: {err}"))),
            Template::Blank(_) => Err(FormstampError::InvalidConfiguration(
                "blank canvas template has no PDF document".to_string(),
            )),
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{Object as LoObject, Stream as LoStream, dictionary};

    pub(crate) fn make_pdf_bytes(page_texts: &[&str]) -> Vec<u8> {
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
        for text in page_texts {
            let content = format!("BT /F1 18 Tf 72 720 Td ({}) Tj ET", text).into_bytes();
            let content_id = doc.add_object(LoStream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        };
        doc.objects.insert(pages_id, LoObject::Dictionary(pages));
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

    #[test]
    fn inspect_reads_version_and_page_count() {
        let bytes = make_pdf_bytes(&["ONE", "TWO"]);
        let report = inspect_pdf_bytes(&bytes).expect("inspect");
        assert_eq!(report.page_count, 2);
        assert!(!report.encrypted);
        assert_eq!(report.file_size_bytes, bytes.len());
    }

    #[test]
    fn inspect_rejects_malformed_data() {
        let err = inspect_pdf_bytes(b"not a pdf").expect_err("invalid");
        assert!(err.to_string().contains("template parse failed"));
    }

    #[test]
    fn load_rejects_short_template() {
        let bytes = make_pdf_bytes(&["ONLY"]);
        let err = Template::load(&TemplateSource::PdfBytes(bytes), 2).expect_err("short");
        assert!(matches!(
            err,
            FormstampError::InsufficientTemplatePages {
                required: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let missing = std::env::temp_dir().join(format!(
            "formstamp_template_missing_{}.pdf",
            std::process::id()
        ));
        let err = Template::load(
            &TemplateSource::PdfFile {
                path: missing,
                sha256: None,
            },
            2,
        )
        .expect_err("missing");
        assert!(matches!(err, FormstampError::MissingResource(_)));
    }

    #[test]
    fn load_verifies_digest_pin() {
        let bytes = make_pdf_bytes(&["A", "B"]);
        let dir = std::env::temp_dir().join(format!(
            "formstamp_template_digest_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("template.pdf");
        std::fs::write(&path, &bytes).expect("write");

        let good = Template::load(
            &TemplateSource::PdfFile {
                path: path.clone(),
                sha256: Some(sha256_hex(&bytes)),
            },
            2,
        );
        assert!(good.is_ok());

        let err = Template::load(
            &TemplateSource::PdfFile {
                path,
                sha256: Some("00".repeat(32)),
            },
            2,
        )
        .expect_err("digest mismatch");
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn blank_template_has_no_pdf_document() {
        let template = Template::load(&TemplateSource::Blank(Size::a4()), 1).expect("blank");
        assert!(template.open_pdf().is_err());
    }
}
