//! Findings and their severity scale.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a finding.
///
/// The derived ordering is the gating order: `Info < Warning < Error < Critical`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FindingSeverity {
    /// Informational note, never blocks
    Info,
    /// Degrades confidence
    Warning,
    /// Fatal under the default thresholds
    Error,
    /// Always fatal
    Critical,
}

impl FindingSeverity {
    /// All severities, lowest first
    pub const ALL: [Self; 4] = [Self::Info, Self::Warning, Self::Error, Self::Critical];

    /// Upper-case label used in reports
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// Weight used when scoring reports
    #[must_use]
    pub const fn weight(&self) -> u32 {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 5,
            Self::Critical => 25,
        }
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 1-based position in the source text
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Line number, starting at 1
    pub line: usize,
    /// Column number, starting at 1
    pub column: usize,
}

impl SourceLocation {
    /// Create a location from 1-based coordinates
    #[must_use]
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Create a location from 0-based parser coordinates
    #[must_use]
    pub const fn from_zero_based(row: usize, column: usize) -> Self {
        Self {
            line: row + 1,
            column: column + 1,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A single reported issue attached to a pipeline stage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// How serious the issue is
    pub severity: FindingSeverity,
    /// Human-readable explanation
    pub message: String,
    /// Where in the source the issue was found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    /// Rule or analyzer code that produced the finding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Finding {
    /// Create a finding without location or code
    pub fn new(severity: FindingSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            location: None,
            code: None,
        }
    }

    /// Shorthand for an informational finding
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(FindingSeverity::Info, message)
    }

    /// Shorthand for a warning
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(FindingSeverity::Warning, message)
    }

    /// Shorthand for an error
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FindingSeverity::Error, message)
    }

    /// Shorthand for a critical finding
    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(FindingSeverity::Critical, message)
    }

    /// Attach a source location
    #[must_use]
    pub const fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach a rule code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.severity)?;
        if let Some(location) = self.location {
            write!(f, " {location}")?;
        }
        if let Some(code) = &self.code {
            write!(f, " {code}:")?;
        }
        write!(f, " {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(FindingSeverity::Info < FindingSeverity::Warning);
        assert!(FindingSeverity::Warning < FindingSeverity::Error);
        assert!(FindingSeverity::Error < FindingSeverity::Critical);
        assert_eq!(
            FindingSeverity::ALL.iter().max(),
            Some(&FindingSeverity::Critical)
        );
    }

    #[test]
    fn test_severity_serializes_upper_case() {
        let json = serde_json::to_string(&FindingSeverity::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
    }

    #[test]
    fn test_finding_display() {
        let finding = Finding::error("import of forbidden module 'os'")
            .at(SourceLocation::new(1, 8))
            .with_code("forbidden-module");
        assert_eq!(
            finding.to_string(),
            "[ERROR] 1:8 forbidden-module: import of forbidden module 'os'"
        );
    }
}
