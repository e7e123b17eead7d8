use crate::models::Highlight;
use regex::Regex;

pub const DEFAULT_SNIPPET_CHARS: usize = 400;

/// Cuts a `max_length` character snippet around the first query term match and wraps every
/// term occurrence in `<mark>` tags. The returned HTML is escaped apart from the tags.
pub fn highlight(text: &str, query: &str, max_length: usize) -> Highlight {
    let total_chars = text.chars().count();
    let pattern = if text.is_empty() || query.is_empty() {
        None
    } else {
        term_pattern(query)
    };

    let Some(pattern) = pattern else {
        return Highlight {
            html: escape_html(char_window(text, 0, max_length)),
            truncated: total_chars > max_length,
        };
    };

    let start = pattern
        .find(text)
        .map(|found| {
            text[..found.start()]
                .chars()
                .count()
                .saturating_sub(max_length / 2)
        })
        .unwrap_or(0);
    let end = start + max_length;

    Highlight {
        html: mark_terms(&pattern, char_window(text, start, end)),
        truncated: end < total_chars,
    }
}

/// Case-insensitive alternation of the query's terms longer than two characters.
fn term_pattern(query: &str) -> Option<Regex> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|term| term.chars().count() > 2)
        .map(|term| regex::escape(&term.to_lowercase()))
        .collect();

    if terms.is_empty() {
        return None;
    }

    Regex::new(&format!("(?i)(?:{})", terms.join("|"))).ok()
}

fn char_window(text: &str, start: usize, end: usize) -> &str {
    let byte_at = |position: usize| {
        text.char_indices()
            .nth(position)
            .map_or(text.len(), |(offset, _)| offset)
    };
    let from = byte_at(start);
    let to = byte_at(end.max(start));
    &text[from..to]
}

fn mark_terms(pattern: &Regex, window: &str) -> String {
    let mut html = String::with_capacity(window.len() + 32);
    let mut cursor = 0;

    for found in pattern.find_iter(window) {
        html.push_str(&escape_html(&window[cursor..found.start()]));
        html.push_str("<mark>");
        html.push_str(&escape_html(found.as_str()));
        html.push_str("</mark>");
        cursor = found.end();
    }
    html.push_str(&escape_html(&window[cursor..]));

    html
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
