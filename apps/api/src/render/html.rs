/// Inline stylesheet for the rendered resume (US letter, single column).
const STYLESHEET: &str = r#"
@page { size: Letter; margin: 0.75in; }
body { font-family: "Inter", "Helvetica Neue", Arial, sans-serif; font-size: 10.5pt; line-height: 1.35; color: #111; }
h1 { font-size: 20pt; margin: 0 0 4pt 0; }
h2 { font-size: 12pt; text-transform: uppercase; letter-spacing: 0.04em; border-bottom: 1px solid #999; margin: 12pt 0 4pt 0; }
h3 { font-size: 11pt; margin: 8pt 0 2pt 0; }
ul { margin: 2pt 0 6pt 0; padding-left: 14pt; }
li { margin: 1pt 0; }
p { margin: 2pt 0; }
"#;

/// Converts the structured resume text (`#` headings, `- ` bullets, paragraphs,
/// `**bold**`) into a standalone HTML document.
pub fn to_html(text: &str) -> String {
    let mut body = String::new();
    let mut in_list = false;

    for line in text.lines() {
        let line = line.trim();

        let item = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "));
        if item.is_none() && in_list {
            body.push_str("</ul>\n");
            in_list = false;
        }

        if line.is_empty() {
            continue;
        }

        if let Some(item) = item {
            if !in_list {
                body.push_str("<ul>\n");
                in_list = true;
            }
            body.push_str(&format!("<li>{}</li>\n", inline(item)));
        } else if let Some((level, heading)) = heading(line) {
            body.push_str(&format!("<h{level}>{}</h{level}>\n", inline(heading)));
        } else {
            body.push_str(&format!("<p>{}</p>\n", inline(line)));
        }
    }
    if in_list {
        body.push_str("</ul>\n");
    }

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<style>{STYLESHEET}</style>\n</head>\n<body>\n{body}</body>\n</html>\n"
    )
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let level = line.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 3 {
        return None;
    }
    let rest = line[level..].strip_prefix(' ')?;
    Some((level, rest.trim()))
}

/// Escapes HTML and turns `**x**` into `<strong>x</strong>`.
fn inline(text: &str) -> String {
    let escaped = escape(text);
    let mut out = String::with_capacity(escaped.len());
    let mut parts = escaped.split("**");
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    let rest: Vec<&str> = parts.collect();
    // An odd number of markers leaves the last one literal.
    let pairs = rest.len() / 2 * 2;
    for (i, part) in rest.iter().enumerate() {
        if i >= pairs {
            out.push_str("**");
            out.push_str(part);
        } else if i % 2 == 0 {
            out.push_str("<strong>");
            out.push_str(part);
        } else {
            out.push_str("</strong>");
            out.push_str(part);
        }
    }
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
