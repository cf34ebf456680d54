//! Stateless classification of accumulated response bytes.
//!
//! [`classify`] is a pure function: given the bytes accumulated so far and
//! the command family they belong to, it decides whether the response is
//! complete, still pending, or can never become valid. It holds no state
//! across calls; the assembler owns all accumulation.

use std::{collections::BTreeMap, fmt};

use crate::{
    command::{CommandFamily, CompletionRule},
    response::FieldValue,
};

pub mod fields;

pub use fields::decode_fields;

/// Outcome of classifying accumulated response bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Classification {
    /// The response is logically complete; the decoded fields are attached.
    Complete(BTreeMap<String, FieldValue>),
    /// More bytes are required before a decision can be made.
    Pending,
    /// The accumulated bytes can never form a valid response.
    Malformed(MalformedKind),
}

/// Why accumulated bytes were rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MalformedKind {
    /// Accumulated bytes exceeded the family maximum without completing.
    Overflow,
    /// No completion rules are registered for the command.
    UnknownFamily,
    /// The device reported an error marker instead of a response.
    DeviceError,
    /// More bytes arrived than the declared or fixed length allows.
    LengthMismatch,
}

impl fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Overflow => "overflow",
            Self::UnknownFamily => "unknown family",
            Self::DeviceError => "device error",
            Self::LengthMismatch => "length mismatch",
        };
        f.write_str(label)
    }
}

/// Classify accumulated bytes against a command family's completion rule.
///
/// `family` is `None` when the command catalog does not know the command;
/// any non-empty input then classifies as malformed rather than guessing a
/// format. Empty input is always `Pending`.
///
/// The caller is responsible for the overflow policy: when the accumulated
/// length exceeds [`CommandFamily::max_response_size`] while classification
/// keeps returning `Pending`, the assembler must treat the response as
/// `Malformed(Overflow)` instead of polling forever.
#[must_use]
pub fn classify(accumulated: &[u8], family: Option<&CommandFamily>) -> Classification {
    if accumulated.is_empty() {
        return Classification::Pending;
    }
    let Some(family) = family else {
        return Classification::Malformed(MalformedKind::UnknownFamily);
    };

    if family
        .reject_markers()
        .iter()
        .any(|marker| contains(accumulated, marker))
    {
        return Classification::Malformed(MalformedKind::DeviceError);
    }

    match family.completion() {
        CompletionRule::Terminator(terminator) => {
            if let Some(end) = find(accumulated, terminator) {
                let body = &accumulated[..end + terminator.len()];
                Classification::Complete(decode_fields(body))
            } else {
                Classification::Pending
            }
        }
        CompletionRule::FixedLength(length) => {
            classify_declared_length(accumulated, length.get())
        }
        CompletionRule::LengthPrefixed { header_len } => {
            let header_len = header_len.get();
            if accumulated.len() < header_len {
                return Classification::Pending;
            }
            let declared = declared_payload_len(&accumulated[..header_len]);
            let Some(total) = header_len.checked_add(declared) else {
                return Classification::Malformed(MalformedKind::LengthMismatch);
            };
            if total > family.max_response_size().get() {
                // The declared size can never fit; no point waiting for it.
                return Classification::Malformed(MalformedKind::Overflow);
            }
            classify_declared_length(accumulated, total)
        }
    }
}

fn classify_declared_length(accumulated: &[u8], expected: usize) -> Classification {
    match accumulated.len().cmp(&expected) {
        std::cmp::Ordering::Less => Classification::Pending,
        std::cmp::Ordering::Equal => Classification::Complete(decode_fields(accumulated)),
        std::cmp::Ordering::Greater => Classification::Malformed(MalformedKind::LengthMismatch),
    }
}

/// Payload length declared by the final two header bytes, big-endian.
/// Single-byte headers carry the length directly.
fn declared_payload_len(header: &[u8]) -> usize {
    match header {
        [] => 0,
        [length] => usize::from(*length),
        [.., hi, lo] => usize::from(u16::from_be_bytes([*hi, *lo])),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool { find(haystack, needle).is_some() }

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
