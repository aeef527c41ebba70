//! Escaping helpers for the HTML and header bodies the routes produce.

use std::fmt::Write;

use serde_json::Value;

/// Escape text for use inside HTML element content or a quoted attribute.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Serialize `value` as a JSON literal that is safe inside a `<script>` element.
///
/// `<`, `>` and `&` only ever occur inside JSON strings, where `\uXXXX` is an
/// equivalent spelling, so the literal evaluates to the same value while no
/// longer being able to close the element. U+2028/U+2029 are escaped because
/// older JavaScript engines treat them as line terminators.
pub fn json_for_html(value: &Value) -> String {
    let json = value.to_string();
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(c),
        }
    }
    out
}

/// Percent-encode every byte of `url` that may not appear in a header value.
///
/// Printable ASCII (including existing `%XX` escapes) passes through as-is.
pub fn encode_location(url: &str) -> String {
    encode_bytes(url, |b| (0x21..0x7f).contains(&b))
}

/// Percent-encode a single path segment.
pub fn encode_path_segment(segment: &str) -> String {
    encode_bytes(segment, |b| b.is_ascii_alphanumeric() || b"-._~".contains(&b))
}

fn encode_bytes(input: &str, keep: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if keep(b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}
