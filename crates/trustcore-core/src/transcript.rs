//! Length-prefixed byte transcripts.
//!
//! Signatures, AEAD associated data and KDF info strings are computed over a
//! transcript rather than a serializer's output, so the bytes being
//! authenticated never depend on a serde representation.

/// Builder for an unambiguous concatenation of fields.
///
/// Each field is written as a 4-byte big-endian length followed by its bytes,
/// so `("ab", "c")` and `("a", "bc")` produce different transcripts.
#[derive(Debug, Clone, Default)]
pub(crate) struct Transcript {
    bytes: Vec<u8>,
}

impl Transcript {
    /// Start a transcript with a domain separation label.
    pub(crate) fn new(label: &str) -> Self {
        Self::default().field(label.as_bytes())
    }

    /// Append one field.
    pub(crate) fn field(mut self, value: impl AsRef<[u8]>) -> Self {
        let value = value.as_ref();
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        self.bytes.extend_from_slice(&len.to_be_bytes());
        self.bytes.extend_from_slice(value);
        self
    }

    /// Append a fixed-width integer field.
    pub(crate) fn u32(self, value: u32) -> Self {
        self.field(value.to_be_bytes())
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
