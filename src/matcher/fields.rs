//! Field decoding for line-oriented device reports.
//!
//! Host card reports (`sysinfo`, `ver`, `lsd`, ...) are line-oriented
//! `key: value` or `key=value` text. The decoder tolerates section banners
//! and blank lines, coerces values to the narrowest matching type, and
//! degrades gracefully on binary payloads by simply decoding no fields; the
//! raw bytes remain available on the structured response.

use std::collections::BTreeMap;

use crate::response::FieldValue;

/// Decode report lines into a field map.
///
/// Later occurrences of a key overwrite earlier ones, matching the device's
/// habit of repeating a header block before the final report.
#[must_use]
pub fn decode_fields(raw: &[u8]) -> BTreeMap<String, FieldValue> {
    let text = String::from_utf8_lossy(raw);
    let mut fields = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || is_section_banner(line) {
            continue;
        }
        if let Some((key, value)) = split_field(line) {
            fields.insert(key.to_owned(), FieldValue::coerce(value));
        }
    }

    fields
}

/// Section banners look like `=== Hardware ===` or a bare `Thermal:` label.
fn is_section_banner(line: &str) -> bool {
    if line.contains("===") {
        return true;
    }
    match line.split_once(':') {
        Some((_, rest)) => rest.trim().is_empty(),
        None => false,
    }
}

/// Split one report line at the first `:` or `=`, whichever comes first.
fn split_field(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':');
    let equals = line.find('=');
    let at = match (colon, equals) {
        (Some(c), Some(e)) => c.min(e),
        (Some(c), None) => c,
        (None, Some(e)) => e,
        (None, None) => return None,
    };
    let (key, rest) = line.split_at(at);
    let key = key.trim();
    let value = rest[1..].trim();
    if key.is_empty() { None } else { Some((key, value)) }
}
