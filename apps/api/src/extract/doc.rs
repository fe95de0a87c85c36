//! Legacy Word 97-2003 (`.doc`) support.
//!
//! The binary format stores body text as runs of either CP1252 bytes or
//! UTF-16LE code units inside an OLE compound file. Without a full FIB parser
//! this recovers those runs heuristically: good enough to feed a customizer,
//! not a faithful layout.

use crate::extract::{DocumentKind, ExtractError};

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Shorter runs are almost always structure bytes, not prose.
const MIN_RUN_CHARS: usize = 5;

pub(super) fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    if !bytes.starts_with(&OLE_MAGIC) {
        return Err(ExtractError::Parse {
            kind: DocumentKind::Doc,
            message: "not an OLE compound document".to_string(),
        });
    }

    let wide = collect_runs(utf16_chars(bytes));
    let narrow = collect_runs(bytes.iter().map(|&b| Some(b as char)));

    let best = if letter_count(&wide) >= letter_count(&narrow) {
        wide
    } else {
        narrow
    };
    Ok(best.join("\n"))
}

/// Resume text is overwhelmingly Latin; code units above Latin Extended-B are
/// treated as binary so byte pairs of ASCII do not decode as CJK.
const MAX_WIDE_CODE_UNIT: u16 = 0x024F;

fn utf16_chars(bytes: &[u8]) -> impl Iterator<Item = Option<char>> + '_ {
    bytes.chunks_exact(2).map(|pair| {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        (unit <= MAX_WIDE_CODE_UNIT)
            .then(|| char::from_u32(unit as u32))
            .flatten()
    })
}

fn is_text_char(c: char) -> bool {
    (c.is_alphanumeric() && (c.is_ascii() || c as u32 >= 0xC0))
        || matches!(c, ' ' | '\t' | '\r' | '.' | ',' | ';' | ':' | '-' | '(' | ')' | '/' | '&' | '%' | '@' | '\'' | '+' | '#')
}

fn collect_runs(chars: impl Iterator<Item = Option<char>>) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();

    for c in chars {
        match c {
            Some(c) if is_text_char(c) => current.push(c),
            _ => flush_run(&mut current, &mut runs),
        }
    }
    flush_run(&mut current, &mut runs);
    runs
}

fn flush_run(current: &mut String, runs: &mut Vec<String>) {
    let run = current.trim();
    if run.chars().count() >= MIN_RUN_CHARS && run.chars().any(char::is_alphabetic) {
        runs.extend(
            run.split('\r')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        );
    }
    current.clear();
}

fn letter_count(runs: &[String]) -> usize {
    runs.iter()
        .map(|r| r.chars().filter(|c| c.is_alphabetic()).count())
        .sum()
}
