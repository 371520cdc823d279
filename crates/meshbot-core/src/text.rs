//! Text helpers: splitting long messages for the radio and rendering reply templates.

/// Longest text the radio reliably carries in one packet, in characters.
pub const MAX_TEXT_LEN: usize = 190;

/// Splits `text` into radio-sized parts.
///
/// Text that fits is returned trimmed as a single part. Longer text is cut into
/// parts of at most `max_len` characters each, every part prefixed with
/// `"i/N "`. The prefix is accounted for when cutting, so no characters are
/// lost.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    let text = text.trim();
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_len {
        return vec![text.to_string()];
    }

    let prefix_width = |total: usize| format!("{total}/{total} ").chars().count();

    // Grow the part count until the prefix width stabilises.
    let mut total = chars.len().div_ceil(max_len);
    let body = loop {
        let body = max_len.saturating_sub(prefix_width(total)).max(1);
        let needed = chars.len().div_ceil(body);
        if needed <= total {
            break body;
        }
        total = needed;
    };

    let bodies: Vec<String> = chars
        .chunks(body)
        .map(|c| c.iter().collect::<String>())
        .collect();
    let count = bodies.len();
    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| format!("{}/{} {}", i + 1, count, body))
        .collect()
}

/// Renders `{name}` placeholders from `vars`.
///
/// Unknown placeholders are left untouched and substituted values are never
/// re-scanned, so user text containing braces cannot inject placeholders.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match vars.iter().find(|(name, _)| *name == key) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_part() {
        assert_eq!(chunk_text("  hello  ", MAX_TEXT_LEN), vec!["hello"]);
    }

    #[test]
    fn test_long_text_is_prefixed_and_lossless() {
        let text: String = "abcdefghij".repeat(45);
        let parts = chunk_text(&text, MAX_TEXT_LEN);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("1/3 "));
        assert!(parts[2].starts_with("3/3 "));
        assert!(parts.iter().all(|p| p.chars().count() <= MAX_TEXT_LEN));

        let rebuilt: String = parts
            .iter()
            .map(|p| p.split_once(' ').map(|(_, b)| b).unwrap_or_default())
            .collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_chunk_counts_characters_not_bytes() {
        let text = "ä".repeat(20);
        assert_eq!(chunk_text(&text, 20).len(), 1);
        let parts = chunk_text(&text, 10);
        assert!(parts.iter().all(|p| p.chars().count() <= 10));
    }

    #[test]
    fn test_render_template() {
        let out = render_template(
            "{fromId} said {text} on {channelName} {unknown}",
            &[("fromId", "!a"), ("text", "{channel}"), ("channelName", "ch0")],
        );
        assert_eq!(out, "!a said {channel} on ch0 {unknown}");
        assert_eq!(render_template("open { brace", &[]), "open { brace");
    }
}
