//! Static prevalidation of untrusted Python source.
//!
//! Parses the source with tree-sitter and matches imports, calls, attribute
//! accesses and a few known bypass idioms against a [`PatternRegistry`].
//! Source tree-sitter accepts is also compiled (never run) so that anything
//! CPython would reject as a `SyntaxError` stops here.

mod grammar;
mod patterns;
mod walker;

pub use patterns::{PatternRegistry, NETWORK_MODULES};
pub(crate) use walker::{
    CODE_FORBIDDEN_ATTRIBUTE, CODE_FORBIDDEN_CALLABLE, CODE_FORBIDDEN_MODULE,
    CODE_FORBIDDEN_REFERENCE, CODE_SYNTAX_ERROR,
};

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};
use tree_sitter::{LanguageError, Parser};

use crate::config::PrevalidationConfig;
use crate::types::{Finding, FindingSeverity, SourceUnit, StageId, StageResult};

/// Parse-and-denylist stage
#[derive(Clone, Debug)]
pub struct Prevalidator {
    patterns: Arc<PatternRegistry>,
    limits: PrevalidationConfig,
    threshold: FindingSeverity,
}

impl Prevalidator {
    /// Create a prevalidator with the default `Error` threshold
    #[must_use]
    pub fn new(patterns: Arc<PatternRegistry>, limits: PrevalidationConfig) -> Self {
        Self {
            patterns,
            limits,
            threshold: FindingSeverity::Error,
        }
    }

    /// Override the fatality threshold
    #[must_use]
    pub const fn with_threshold(mut self, threshold: FindingSeverity) -> Self {
        self.threshold = threshold;
        self
    }

    /// Registry the prevalidator matches against
    #[must_use]
    pub fn patterns(&self) -> &PatternRegistry {
        &self.patterns
    }

    /// Run the stage
    #[must_use]
    pub fn validate(&self, source: &SourceUnit) -> StageResult {
        let start = Instant::now();
        let result = match self.scan(source) {
            Ok(findings) => StageResult::from_findings(
                StageId::Prevalidation,
                findings,
                self.threshold,
                start.elapsed(),
            ),
            Err(e) => StageResult::errored(
                StageId::Prevalidation,
                vec![Finding::critical(format!("python grammar unavailable: {e}"))],
                start.elapsed(),
            ),
        };

        info!(
            status = ?result.status(),
            findings = result.findings().len(),
            "prevalidation finished"
        );
        result
    }

    /// Collect findings without building a stage result.
    ///
    /// A syntax error yields exactly one `Critical` finding and nothing else.
    ///
    /// # Errors
    /// Returns error if the Python grammar cannot be loaded
    pub fn scan(&self, source: &SourceUnit) -> Result<Vec<Finding>, LanguageError> {
        let mut parser = Parser::new();
        let language: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
        parser.set_language(&language)?;

        let Some(tree) = parser.parse(source.text(), None) else {
            return Ok(vec![Finding::critical("syntax error: source could not be parsed")
                .with_code(CODE_SYNTAX_ERROR)]);
        };
        let root = tree.root_node();

        if let Some(finding) = walker::first_syntax_error(root, source.text())
            .or_else(|| grammar::compile_error(source.text()))
        {
            debug!(%finding, "source rejected by parser");
            return Ok(vec![finding]);
        }

        let mut findings = Vec::new();
        if source.length() > self.limits.max_code_length {
            findings.push(
                Finding::new(
                    self.limits.limit_severity,
                    format!(
                        "source is {} characters long, limit is {}",
                        source.length(),
                        self.limits.max_code_length
                    ),
                )
                .with_code("code-too-long"),
            );
        }
        if source.line_count() > self.limits.max_lines {
            findings.push(
                Finding::new(
                    self.limits.limit_severity,
                    format!(
                        "source has {} lines, limit is {}",
                        source.line_count(),
                        self.limits.max_lines
                    ),
                )
                .with_code("too-many-lines"),
            );
        }

        findings.extend(walker::Walker::new(source.text(), &self.patterns).run(root));
        Ok(findings)
    }
}

/// Whether a prevalidation result was caused by unparsable source
#[must_use]
pub fn is_syntax_failure(result: &StageResult) -> bool {
    result
        .findings()
        .iter()
        .any(|f| f.code.as_deref() == Some(CODE_SYNTAX_ERROR))
}
