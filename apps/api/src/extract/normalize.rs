/// Glyphs resume templates use for list items.
const BULLET_GLYPHS: [char; 8] = ['•', '▪', '◦', '●', '○', '■', '–', '·'];

/// Longest line still treated as a section heading.
const MAX_HEADING_CHARS: usize = 40;

/// Normalizes raw extracted text into the markdown-like form the customizer
/// and renderer share:
/// - trailing/leading whitespace trimmed per line, inner runs collapsed
/// - at most one blank line between blocks, none at the ends
/// - bullet glyphs, `*` and `-` items rewritten to `- `
/// - short ALL-CAPS lines promoted to `## ` headings
pub fn normalize(raw: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut pending_blank = false;

    for line in raw.replace("\r\n", "\n").replace('\r', "\n").lines() {
        let line = collapse_whitespace(line);
        if line.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if pending_blank {
            out.push(String::new());
            pending_blank = false;
        }
        out.push(classify(&line));
    }

    out.join("\n")
}

fn collapse_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn classify(line: &str) -> String {
    if line.starts_with('#') {
        return line.to_string();
    }
    if let Some(item) = strip_bullet(line) {
        return format!("- {item}");
    }
    if is_heading(line) {
        return format!("## {line}");
    }
    line.to_string()
}

fn strip_bullet(line: &str) -> Option<&str> {
    let mut chars = line.chars();
    let first = chars.next()?;
    let is_marker = BULLET_GLYPHS.contains(&first) || first == '*' || first == '-';
    if !is_marker {
        return None;
    }
    let rest = chars.as_str();
    // "-5%" or "**bold**" are not list items.
    if !rest.starts_with(' ') {
        return None;
    }
    let item = rest.trim_start();
    (!item.is_empty()).then_some(item)
}

fn is_heading(line: &str) -> bool {
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    line.chars().count() <= MAX_HEADING_CHARS
        && letters.len() >= 3
        && letters.iter().all(|c| c.is_uppercase())
}
