mod canvas;
mod compose;
mod error;
mod font;
mod layout;
mod naming;
mod pdf_raster;
mod perf;
mod raster;
mod session;
mod stamp;
mod template;
mod types;

pub use canvas::RasterImage;
pub use compose::{
    CompositionRequest, OutputDocument, OutputFormat, SignatureOverlay,
};
pub use error::FormstampError;
use font::FontRegistry;
pub use layout::{FormLayout, InkField, InkSlot, TextBoxSlot, TextSlot};
pub use naming::sanitize;
use perf::PerfLogger;
pub use session::{ArchiveDownload, ExportAccumulator, Session, SessionPhase};
pub use template::{TemplateReport, TemplateSource, inspect_pdf_bytes};
use template::Template;
pub use types::{Color, Pt, Rect, Size};

use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone)]
enum FontSource {
    File(PathBuf),
    Bytes(Vec<u8>, Option<String>),
}

/// The compositing engine. Template and font are loaded lazily on first
/// use and shared read-only across requests for the process lifetime;
/// every compose call is otherwise independent.
#[derive(Debug)]
pub struct Formstamp {
    template_source: TemplateSource,
    font_source: FontSource,
    layout: FormLayout,
    output_prefix: String,
    unnamed_department: String,
    batch_tag: String,
    reason_prefix: Option<String>,
    require_department: bool,
    raster_dpi: u32,
    reference_path: Option<PathBuf>,
    clock_override: Option<NaiveDateTime>,
    perf: Option<PerfLogger>,
    template_cell: OnceLock<Template>,
    font_cell: OnceLock<(FontRegistry, String)>,
}

#[derive(Clone)]
pub struct FormstampBuilder {
    template: TemplateSource,
    font_source: Option<FontSource>,
    layout: FormLayout,
    output_prefix: String,
    unnamed_department: String,
    batch_tag: String,
    reason_prefix: Option<String>,
    require_department: bool,
    raster_dpi: u32,
    reference_path: Option<PathBuf>,
    perf_path: Option<PathBuf>,
    clock_override: Option<NaiveDateTime>,
}

impl FormstampBuilder {
    pub fn new(template: TemplateSource) -> Self {
        Self {
            template,
            font_source: None,
            layout: FormLayout::default(),
            output_prefix: "药品检查表".to_string(),
            unnamed_department: "未命名科室".to_string(),
            batch_tag: "批量".to_string(),
            reason_prefix: Some("扣分原因：".to_string()),
            require_department: true,
            raster_dpi: 150,
            reference_path: None,
            perf_path: None,
            clock_override: None,
        }
    }

    pub fn font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_source = Some(FontSource::File(path.into()));
        self
    }

    pub fn font_bytes(mut self, data: Vec<u8>, source_name: Option<&str>) -> Self {
        self.font_source = Some(FontSource::Bytes(data, source_name.map(str::to_string)));
        self
    }

    pub fn layout(mut self, layout: FormLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    pub fn unnamed_department(mut self, placeholder: impl Into<String>) -> Self {
        self.unnamed_department = placeholder.into();
        self
    }

    pub fn batch_tag(mut self, tag: impl Into<String>) -> Self {
        self.batch_tag = tag.into();
        self
    }

    /// Text prepended to the deduction reason. `None` reproduces the
    /// form variants that print the raw reason.
    pub fn reason_prefix(mut self, prefix: Option<String>) -> Self {
        self.reason_prefix = prefix;
        self
    }

    pub fn require_department(mut self, required: bool) -> Self {
        self.require_department = required;
        self
    }

    pub fn raster_dpi(mut self, dpi: u32) -> Self {
        self.raster_dpi = dpi;
        self
    }

    /// Optional markdown instructions file surfaced verbatim on request.
    pub fn reference_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_path = Some(path.into());
        self
    }

    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_path = Some(path.into());
        self
    }

    /// Pins the clock used for the stamped date and filename timestamps,
    /// making outputs fully reproducible.
    pub fn fixed_clock(mut self, at: NaiveDateTime) -> Self {
        self.clock_override = Some(at);
        self
    }

    pub fn build(self) -> Result<Formstamp, FormstampError> {
        let Some(font_source) = self.font_source else {
            return Err(FormstampError::InvalidConfiguration(
                "a font file or font bytes must be configured".to_string(),
            ));
        };
        if self.raster_dpi == 0 {
            return Err(FormstampError::InvalidConfiguration(
                "raster dpi must be > 0".to_string(),
            ));
        }
        let perf = match &self.perf_path {
            Some(path) => Some(PerfLogger::new(path)?),
            None => None,
        };
        Ok(Formstamp {
            template_source: self.template,
            font_source,
            layout: self.layout,
            output_prefix: self.output_prefix,
            unnamed_department: self.unnamed_department,
            batch_tag: self.batch_tag,
            reason_prefix: self.reason_prefix,
            require_department: self.require_department,
            raster_dpi: self.raster_dpi,
            reference_path: self.reference_path,
            clock_override: self.clock_override,
            perf,
            template_cell: OnceLock::new(),
            font_cell: OnceLock::new(),
        })
    }
}

impl Formstamp {
    pub fn builder(template: TemplateSource) -> FormstampBuilder {
        FormstampBuilder::new(template)
    }

    pub fn layout(&self) -> &FormLayout {
        &self.layout
    }

    fn template(&self) -> Result<&Template, FormstampError> {
        if let Some(template) = self.template_cell.get() {
            return Ok(template);
        }
        let loaded = Template::load(&self.template_source, self.layout.required_pages())?;
        Ok(self.template_cell.get_or_init(|| loaded))
    }

    fn font(&self) -> Result<(&FontRegistry, &str), FormstampError> {
        if let Some((registry, name)) = self.font_cell.get() {
            return Ok((registry, name.as_str()));
        }
        let mut registry = FontRegistry::new();
        let name = match &self.font_source {
            FontSource::File(path) => registry.register_file(path)?,
            FontSource::Bytes(data, source) => {
                registry.register_bytes(data.clone(), source.as_deref())?
            }
        };
        let (registry, name) = self.font_cell.get_or_init(|| (registry, name));
        Ok((registry, name.as_str()))
    }

    fn now(&self) -> NaiveDateTime {
        self.clock_override
            .unwrap_or_else(|| chrono::Local::now().naive_local())
    }

    /// Composes one output document. Deterministic for fixed inputs and
    /// resources, up to the stamped current date.
    pub fn compose(
        &self,
        request: &CompositionRequest,
        format: OutputFormat,
    ) -> Result<OutputDocument, FormstampError> {
        if self.require_department && request.department.trim().is_empty() {
            return Err(FormstampError::EmptyInput("department".to_string()));
        }

        let started = Instant::now();
        let template = self.template()?;
        let (registry, font_name) = self.font()?;
        let font = registry.resolve(font_name).ok_or_else(|| {
            FormstampError::MissingResource(format!("font {font_name}"))
        })?;

        let now = self.now();
        let date_text = now.format("%Y.%m.%d").to_string();
        let plan = compose::build_overlay_plan(
            &self.layout,
            request,
            &date_text,
            self.reason_prefix.as_deref(),
            registry,
            font_name,
        );

        let bytes = match format {
            OutputFormat::Pdf => compose::compose_pdf_bytes(template, &plan, font)?,
            OutputFormat::Png => {
                compose::compose_png_bytes(template, &plan, font, registry, self.raster_dpi)?
            }
        };

        let department = {
            let sanitized = naming::sanitize(&request.department);
            if sanitized.is_empty() {
                self.unnamed_department.clone()
            } else {
                sanitized
            }
        };
        let filename =
            naming::output_filename(&self.output_prefix, &department, now, format.extension());

        if let Some(perf) = &self.perf {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let span = match format {
                OutputFormat::Pdf => "compose.pdf",
                OutputFormat::Png => "compose.png",
            };
            perf.log_span_ms(span, elapsed_ms);
            perf.log_count("compose.output_bytes", bytes.len() as u64);
            perf.flush();
        }

        Ok(OutputDocument {
            filename,
            format,
            bytes,
        })
    }

    /// Filename for a batch zip of accumulated outputs.
    pub fn archive_name(&self) -> String {
        naming::archive_filename(&self.output_prefix, &self.batch_tag, self.now())
    }

    pub(crate) fn perf(&self) -> Option<&PerfLogger> {
        self.perf.as_ref()
    }

    /// The configured markdown instructions, verbatim. A missing file is
    /// not an error; the reference sheet is optional.
    pub fn reference_text(&self) -> Result<Option<String>, FormstampError> {
        let Some(path) = &self.reference_path else {
            return Ok(None);
        };
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
