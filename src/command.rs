//! Command identities and per-family response rules.
//!
//! A [`CommandKey`] names one logical device request and doubles as both the
//! cache key and the assembler's correlation id. A [`CommandFamily`] carries
//! the completion and validation rules shared by a class of commands (status
//! queries, version reports, register reads, ...). The [`CommandCatalog`]
//! trait is the collaborator seam through which the engine learns a key's
//! family and its encoded request bytes.

use std::{collections::HashMap, fmt, num::NonZeroUsize};

use serde::{Deserialize, Serialize};

/// Identifies a logical device request: command name plus parameters.
///
/// Keys are immutable and hashable so they can serve as cache keys and as
/// correlation ids for in-flight assemblies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandKey {
    name: String,
    params: String,
}

impl CommandKey {
    /// Create a key for a command with parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: params.into(),
        }
    }

    /// Create a key for a parameterless command.
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self { Self::new(name, "") }

    /// The command name, used for family lookup.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// The parameter string, empty for parameterless commands.
    #[must_use]
    pub fn params(&self) -> &str { &self.params }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} {}", self.name, self.params)
        }
    }
}

/// How a command family recognises the end of a response.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompletionRule {
    /// The response ends with this byte sequence.
    Terminator(Vec<u8>),
    /// The response is exactly this many bytes.
    FixedLength(NonZeroUsize),
    /// The response starts with a fixed-size header whose final two bytes
    /// declare the payload length as a big-endian `u16`. The response is
    /// complete after `header_len + payload_len` bytes.
    LengthPrefixed { header_len: NonZeroUsize },
}

/// Completion and validation rules for one class of commands.
#[derive(Clone, Debug)]
pub struct CommandFamily {
    name: String,
    completion: CompletionRule,
    max_response_size: NonZeroUsize,
    reject_markers: Vec<Vec<u8>>,
}

impl CommandFamily {
    /// Create a family with the given completion rule and response size cap.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        completion: CompletionRule,
        max_response_size: NonZeroUsize,
    ) -> Self {
        Self {
            name: name.into(),
            completion,
            max_response_size,
            reject_markers: Vec::new(),
        }
    }

    /// Declare byte sequences whose appearance anywhere in a response marks
    /// it as a device-reported error (for example `b"unknown command"`).
    #[must_use]
    pub fn with_reject_markers(mut self, markers: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.reject_markers = markers.into_iter().collect();
        self
    }

    /// Family name, used for diagnostics.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// The family's completion rule.
    #[must_use]
    pub fn completion(&self) -> &CompletionRule { &self.completion }

    /// Hard cap on accumulated response bytes before the assembly is
    /// declared malformed.
    #[must_use]
    pub fn max_response_size(&self) -> NonZeroUsize { self.max_response_size }

    /// Device error markers declared for this family.
    #[must_use]
    pub fn reject_markers(&self) -> &[Vec<u8>] { &self.reject_markers }
}

/// Supplies, for each [`CommandKey`], its command family and its encoded
/// request bytes.
///
/// Implementations must be cheap to query; both methods sit on the
/// assembler's dispatch path.
pub trait CommandCatalog: Send + Sync {
    /// Look up the family for a key, `None` when the command is unknown.
    ///
    /// Unknown families fail closed: the pattern matcher classifies any
    /// non-empty input for them as malformed rather than guessing a format.
    fn family(&self, key: &CommandKey) -> Option<&CommandFamily>;

    /// Encode the request bytes dispatched to the device for this key.
    fn encode_request(&self, key: &CommandKey) -> Vec<u8>;
}

impl<C: CommandCatalog + ?Sized> CommandCatalog for std::sync::Arc<C> {
    fn family(&self, key: &CommandKey) -> Option<&CommandFamily> { (**self).family(key) }

    fn encode_request(&self, key: &CommandKey) -> Vec<u8> { (**self).encode_request(key) }
}

/// In-memory catalog mapping command names to families.
///
/// Requests are encoded in the host card's line discipline: the display form
/// of the key followed by CR LF.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    families: HashMap<String, CommandFamily>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register a family under the command name it classifies.
    ///
    /// Registering a second family under the same name replaces the first.
    pub fn register(&mut self, command: impl Into<String>, family: CommandFamily) {
        self.families.insert(command.into(), family);
    }

    /// Builder-style form of [`register`](Self::register).
    #[must_use]
    pub fn with_family(mut self, command: impl Into<String>, family: CommandFamily) -> Self {
        self.register(command, family);
        self
    }

    /// Number of registered families.
    #[must_use]
    pub fn len(&self) -> usize { self.families.len() }

    /// Whether the catalog has no registered families.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.families.is_empty() }
}

impl CommandCatalog for StaticCatalog {
    fn family(&self, key: &CommandKey) -> Option<&CommandFamily> {
        self.families.get(key.name())
    }

    fn encode_request(&self, key: &CommandKey) -> Vec<u8> {
        let mut bytes = key.to_string().into_bytes();
        bytes.extend_from_slice(b"\r\n");
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_family() -> CommandFamily {
        CommandFamily::new(
            "status",
            CompletionRule::Terminator(b"\r\n".to_vec()),
            NonZeroUsize::new(256).expect("non-zero"),
        )
    }

    #[test]
    fn display_omits_empty_params() {
        assert_eq!(CommandKey::bare("sysinfo").to_string(), "sysinfo");
        assert_eq!(
            CommandKey::new("readreg", "0x1c").to_string(),
            "readreg 0x1c"
        );
    }

    #[test]
    fn catalog_resolves_family_by_command_name() {
        let catalog = StaticCatalog::new().with_family("status", status_family());

        let key = CommandKey::new("status", "port1");
        let family = catalog.family(&key).expect("family registered");
        assert_eq!(family.name(), "status");

        assert!(catalog.family(&CommandKey::bare("bogus")).is_none());
    }

    #[test]
    fn requests_are_encoded_with_crlf() {
        let catalog = StaticCatalog::new().with_family("status", status_family());
        assert_eq!(
            catalog.encode_request(&CommandKey::new("status", "port1")),
            b"status port1\r\n"
        );
    }

    #[test]
    fn registering_same_command_replaces_family() {
        let mut catalog = StaticCatalog::new();
        catalog.register("status", status_family());
        catalog.register(
            "status",
            CommandFamily::new(
                "status-v2",
                CompletionRule::FixedLength(NonZeroUsize::new(8).expect("non-zero")),
                NonZeroUsize::new(8).expect("non-zero"),
            ),
        );

        let family = catalog
            .family(&CommandKey::bare("status"))
            .expect("family registered");
        assert_eq!(family.name(), "status-v2");
        assert_eq!(catalog.len(), 1);
    }
}
