use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::extract::{DocumentKind, ExtractError};

/// Largest inflated `word/document.xml` accepted. Real resumes are a few
/// hundred kilobytes; anything near this is a decompression bomb.
const MAX_DOCUMENT_XML_BYTES: u64 = 32 * 1024 * 1024;

pub(super) fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let xml = read_document_xml(bytes, MAX_DOCUMENT_XML_BYTES)?;
    parse_document_xml(&xml)
}

fn read_document_xml(bytes: &[u8], limit: u64) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| parse_error(format!("not a DOCX archive: {e}")))?;

    let document_xml = archive
        .by_name("word/document.xml")
        .map_err(|e| parse_error(format!("missing word/document.xml: {e}")))?;

    let too_large = || parse_error(format!("word/document.xml inflates beyond {limit} bytes"));
    if document_xml.size() > limit {
        return Err(too_large());
    }

    // The declared size can lie; never read past the limit either way.
    let mut xml = String::new();
    document_xml
        .take(limit + 1)
        .read_to_string(&mut xml)
        .map_err(|e| parse_error(format!("failed to read document.xml: {e}")))?;
    if xml.len() as u64 > limit {
        return Err(too_large());
    }
    Ok(xml)
}

/// Walks `w:p` paragraphs, keeping `w:t` runs. List paragraphs (`w:numPr`)
/// become `- ` items and `Heading*`/`Title` styles become `#` headings.
fn parse_document_xml(xml: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut out = String::new();
    let mut paragraph = Paragraph::default();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"p" => paragraph = Paragraph::default(),
                b"t" => in_text = true,
                b"numPr" => paragraph.is_list = true,
                b"pStyle" => paragraph.heading = heading_level(e),
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"tab" => paragraph.text.push('\t'),
                b"br" => paragraph.text.push('\n'),
                b"pStyle" => paragraph.heading = heading_level(e),
                b"numPr" => paragraph.is_list = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    paragraph.flush_into(&mut out);
                    paragraph = Paragraph::default();
                }
                _ => {}
            },
            Ok(Event::Text(e)) if in_text => {
                let decoded = e
                    .unescape()
                    .map_err(|err| parse_error(format!("bad text run: {err}")))?;
                paragraph.text.push_str(&decoded);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_error(format!("XML parsing error: {e}"))),
            _ => {}
        }
    }

    Ok(out)
}

#[derive(Default)]
struct Paragraph {
    text: String,
    is_list: bool,
    heading: Option<usize>,
}

impl Paragraph {
    fn flush_into(&self, out: &mut String) {
        let text = self.text.trim();
        if text.is_empty() {
            out.push('\n');
            return;
        }
        if let Some(level) = self.heading {
            out.push_str(&"#".repeat(level));
            out.push(' ');
        } else if self.is_list {
            out.push_str("- ");
        }
        out.push_str(text);
        out.push('\n');
    }
}

fn heading_level(e: &BytesStart<'_>) -> Option<usize> {
    let value = e.attributes().flatten().find_map(|a| {
        (a.key.local_name().as_ref() == b"val").then(|| String::from_utf8_lossy(&a.value).into_owned())
    })?;
    if value.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let level = value.strip_prefix("Heading")?.parse::<usize>().ok()?;
    Some(level.clamp(1, 3))
}

fn parse_error(message: String) -> ExtractError {
    ExtractError::Parse {
        kind: DocumentKind::Docx,
        message,
    }
}
