//! Document Extractor — uploaded binary → normalized, markdown-like text.
//!
//! Pure and deterministic. An unsupported mime type is a client input error
//! (rejected before queueing); a parse failure of a supported type is a
//! processing failure recorded on the job.

use thiserror::Error;

mod doc;
mod docx;
mod normalize;
mod pdf;

pub use normalize::normalize;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("unsupported file type '{0}'")]
    Unsupported(String),

    #[error("could not read {kind} document: {message}")]
    Parse { kind: DocumentKind, message: String },

    #[error("{0} document contains no readable text")]
    Empty(DocumentKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Doc,
    Text,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DocumentKind::Pdf => "PDF",
            DocumentKind::Docx => "DOCX",
            DocumentKind::Doc => "DOC",
            DocumentKind::Text => "text",
        };
        f.write_str(name)
    }
}

impl DocumentKind {
    /// Maps a declared mime type (parameters such as `; charset=` ignored).
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            MIME_PDF => Some(DocumentKind::Pdf),
            MIME_DOCX => Some(DocumentKind::Docx),
            MIME_DOC => Some(DocumentKind::Doc),
            MIME_TEXT | MIME_MARKDOWN => Some(DocumentKind::Text),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::Doc => "doc",
            DocumentKind::Text => "txt",
        }
    }
}

/// Seam for the pipeline; [`DocumentExtractor`] is the only production impl.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], declared_mime: &str) -> Result<String, ExtractError>;
}

/// Whether uploads of this declared type can be extracted. Checked before
/// anything is stored or queued.
pub fn is_supported(mime: &str) -> bool {
    DocumentKind::from_mime(mime).is_some()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExtractor;

impl TextExtractor for DocumentExtractor {
    fn extract(&self, bytes: &[u8], declared_mime: &str) -> Result<String, ExtractError> {
        let kind = DocumentKind::from_mime(declared_mime)
            .ok_or_else(|| ExtractError::Unsupported(declared_mime.to_string()))?;

        let raw = match kind {
            DocumentKind::Pdf => pdf::extract_text(bytes)?,
            DocumentKind::Docx => docx::extract_text(bytes)?,
            DocumentKind::Doc => doc::extract_text(bytes)?,
            DocumentKind::Text => String::from_utf8(bytes.to_vec()).map_err(|e| {
                ExtractError::Parse {
                    kind,
                    message: format!("not valid UTF-8: {e}"),
                }
            })?,
        };

        let text = normalize(&raw);
        if text.is_empty() {
            return Err(ExtractError::Empty(kind));
        }
        Ok(text)
    }
}
