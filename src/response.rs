//! Structured results of completed assemblies.
//!
//! A [`StructuredResponse`] is the parsed, validated outcome of one complete
//! assembly: a field map decoded from the device's report lines, the raw
//! bytes the fields were derived from, and a wall-clock completion
//! timestamp. Responses are immutable once created and shared between the
//! cache and its consumers behind an `Arc`.

use std::{collections::BTreeMap, time::SystemTime};

use serde::{Deserialize, Serialize};

/// Typed value decoded from one response field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FieldValue {
    /// Free-form text, the fallback when no narrower type matches.
    Text(String),
    /// Whole number, decimal or `0x`-prefixed hexadecimal on the wire.
    Integer(i64),
    /// Fractional number, as reported by thermal and voltage sensors.
    Float(f64),
    /// Boolean flag (`true`/`false`, `yes`/`no`, `on`/`off`).
    Bool(bool),
}

impl FieldValue {
    /// Coerce a raw report value into the narrowest matching type.
    #[must_use]
    pub fn coerce(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            if let Ok(value) = i64::from_str_radix(hex, 16) {
                return Self::Integer(value);
            }
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            return Self::Integer(value);
        }
        if let Ok(value) = trimmed.parse::<f64>() {
            return Self::Float(value);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" => Self::Bool(true),
            "false" | "no" | "off" => Self::Bool(false),
            _ => Self::Text(trimmed.to_owned()),
        }
    }

    /// Borrow the text payload when the value is [`Text`](Self::Text).
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The integer payload when the value is [`Integer`](Self::Integer).
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// The parsed, validated result of a completed assembly.
///
/// Partial or malformed assemblies never become a `StructuredResponse`; the
/// assembler only constructs one after the pattern matcher classified the
/// accumulated bytes as complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuredResponse {
    fields: BTreeMap<String, FieldValue>,
    raw: Vec<u8>,
    completed_at: SystemTime,
}

impl StructuredResponse {
    /// Construct a response from decoded fields and the bytes they came from.
    #[must_use]
    pub fn new(
        fields: BTreeMap<String, FieldValue>,
        raw: Vec<u8>,
        completed_at: SystemTime,
    ) -> Self {
        Self {
            fields,
            raw,
            completed_at,
        }
    }

    /// Look up a decoded field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> { self.fields.get(name) }

    /// All decoded fields in name order.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> { &self.fields }

    /// The raw bytes the fields were derived from.
    #[must_use]
    pub fn raw(&self) -> &[u8] { &self.raw }

    /// Wall-clock instant at which the assembly completed.
    #[must_use]
    pub fn completed_at(&self) -> SystemTime { self.completed_at }
}
