//! Source units - the code under validation.

use serde::Serialize;

/// Source text plus the metadata every stage needs.
///
/// Immutable once created; stages share it by reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceUnit {
    #[serde(skip)]
    text: String,
    length: usize,
    line_count: usize,
    digest: String,
}

impl SourceUnit {
    /// Wrap source text
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let length = text.chars().count();
        let line_count = text.lines().count();
        let digest = blake3::hash(text.as_bytes()).to_hex().to_string();

        Self {
            text,
            length,
            line_count,
            digest,
        }
    }

    /// The code text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in characters
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// Number of lines
    #[must_use]
    pub const fn line_count(&self) -> usize {
        self.line_count
    }

    /// BLAKE3 hex digest of the text
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl From<&str> for SourceUnit {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for SourceUnit {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata() {
        let unit = SourceUnit::new("def f(x):\n    return x\n");
        assert_eq!(unit.line_count(), 2);
        assert_eq!(unit.length(), 23);
        assert_eq!(unit.digest().len(), 64);
    }

    #[test]
    fn test_digest_is_stable() {
        let a = SourceUnit::from("x = 1");
        let b = SourceUnit::from(String::from("x = 1"));
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), SourceUnit::from("x = 2").digest());
    }

    #[test]
    fn test_length_counts_characters() {
        let unit = SourceUnit::new("s = 'é'");
        assert_eq!(unit.length(), 7);
    }
}
