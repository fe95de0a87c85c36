use std::panic::{self, AssertUnwindSafe};

use crate::extract::{DocumentKind, ExtractError};

const PDF_MAGIC: &[u8] = b"%PDF-";

pub(super) fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(parse_error("missing %PDF header"));
    }

    // pdf-extract panics on some malformed inputs; contain it to this job.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));

    match result {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(parse_error(&e.to_string())),
        Err(_) => Err(parse_error("parser aborted on malformed content")),
    }
}

fn parse_error(message: &str) -> ExtractError {
    ExtractError::Parse {
        kind: DocumentKind::Pdf,
        message: message.to_string(),
    }
}
