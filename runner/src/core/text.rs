//! Small string helpers shared by handlers and prompt builders.

/// Longest prefix of `text` that fits in `max_bytes` without splitting a char.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn cut_marker(dropped: usize) -> String {
    format!("\n...[truncated {dropped} bytes]")
}

/// Truncate and mark the cut so the oracle knows the text is partial.
///
/// The result, marker included, never exceeds `max_bytes`. When the marker
/// alone does not fit, the text is cut without one.
pub fn truncate_marked(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    // Dropping at most `text.len()` bytes bounds the marker's width.
    let reserve = cut_marker(text.len()).len();
    if reserve >= max_bytes {
        return truncate_utf8(text, max_bytes).to_string();
    }
    let head = truncate_utf8(text, max_bytes - reserve);
    format!("{head}{}", cut_marker(text.len() - head.len()))
}
