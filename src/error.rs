use std::fmt;

#[derive(Debug)]
pub enum FormstampError {
    MissingResource(String),
    InsufficientTemplatePages { required: usize, found: usize },
    EmptyInput(String),
    ArchiveNotAvailable,
    InvalidImage(String),
    Pdf(String),
    InvalidConfiguration(String),
    Io(std::io::Error),
}

impl fmt::Display for FormstampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormstampError::MissingResource(what) => write!(f, "missing resource: {}", what),
            FormstampError::InsufficientTemplatePages { required, found } => {
                write!(
                    f,
                    "template has too few pages: required {}, found {}",
                    required, found
                )
            }
            FormstampError::EmptyInput(field) => write!(f, "required input is empty: {}", field),
            FormstampError::ArchiveNotAvailable => {
                write!(f, "archive requires at least two accumulated outputs")
            }
            FormstampError::InvalidImage(message) => write!(f, "invalid image: {}", message),
            FormstampError::Pdf(message) => write!(f, "pdf error: {}", message),
            FormstampError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            FormstampError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for FormstampError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormstampError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FormstampError {
    fn from(value: std::io::Error) -> Self {
        FormstampError::Io(value)
    }
}
