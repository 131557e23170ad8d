//! Static analysis stage.
//!
//! Runs every registered [`ExternalAnalyzer`] as its own tokio task, each under
//! its own timeout, and joins them under a bounded overall wait. Analyzer
//! failures degrade to warnings; they never fail the stage on their own.

mod command;

pub use command::{BuiltinAnalyzer, CommandAnalyzer};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{StaticAnalysisConfig, MAX_DURATION};
use crate::types::{Finding, FindingSeverity, SourceLocation, SourceUnit, StageId, StageResult};

/// Errors raised by an external analyzer
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The analyzer tool is not installed
    #[error("analyzer tool '{0}' is not available")]
    NotAvailable(String),

    /// The analyzer process could not be run
    #[error("failed to run analyzer: {0}")]
    Io(#[from] std::io::Error),

    /// The tool exited without usable output
    #[error("analyzer exited with {status}: {stderr}")]
    Failed {
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// The tool output could not be parsed
    #[error("unparsable analyzer output: {0}")]
    Parse(String),

    /// A severity scale does not preserve the analyzer's level order
    #[error("severity scale is not monotone at level '{0}'")]
    NonMonotoneScale(String),
}

/// Mapping from an analyzer's native levels to [`FindingSeverity`].
///
/// Levels are listed lowest first and must map to non-decreasing severities,
/// so the analyzer's relative ordering survives the translation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeverityScale {
    levels: Vec<(String, FindingSeverity)>,
}

impl SeverityScale {
    /// Build a scale from `(level, severity)` pairs, lowest level first
    ///
    /// # Errors
    /// Returns error if a higher level maps to a lower severity
    pub fn new<I, S>(levels: I) -> Result<Self, AnalyzerError>
    where
        I: IntoIterator<Item = (S, FindingSeverity)>,
        S: Into<String>,
    {
        let levels: Vec<(String, FindingSeverity)> = levels
            .into_iter()
            .map(|(level, severity)| (level.into(), severity))
            .collect();

        for pair in levels.windows(2) {
            if pair[1].1 < pair[0].1 {
                return Err(AnalyzerError::NonMonotoneScale(pair[1].0.clone()));
            }
        }
        Ok(Self { levels })
    }

    /// Severity for a native level; unknown levels are warnings
    #[must_use]
    pub fn map(&self, level: &str) -> FindingSeverity {
        self.levels
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(level))
            .map_or(FindingSeverity::Warning, |(_, severity)| *severity)
    }
}

/// One issue as reported by an analyzer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyzerIssue {
    /// Native level, mapped through the analyzer's [`SeverityScale`]
    pub level: String,
    /// Analyzer message
    pub message: String,
    /// Analyzer rule code
    pub code: Option<String>,
    /// Where the issue was found
    pub location: Option<SourceLocation>,
}

/// An external static analyzer.
///
/// Implementations must be cancel-safe: the stage drops the future when the
/// analyzer exceeds its timeout.
#[async_trait]
pub trait ExternalAnalyzer: Send + Sync {
    /// Name used in findings and logs
    fn name(&self) -> &str;

    /// Scale for this analyzer's native levels
    fn severity_scale(&self) -> &SeverityScale;

    /// Analyze the source text
    async fn analyze(&self, source: &str) -> Result<Vec<AnalyzerIssue>, AnalyzerError>;
}

/// Aborts still-running analyzer tasks when the stage is dropped
struct TaskGuard<T>(Vec<JoinHandle<T>>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

type AnalyzerOutcome = Result<Result<Vec<AnalyzerIssue>, AnalyzerError>, tokio::time::error::Elapsed>;

/// The static analysis stage
#[derive(Clone)]
pub struct StaticAnalyzer {
    analyzers: Vec<Arc<dyn ExternalAnalyzer>>,
    per_analyzer_timeout: Duration,
    overall_timeout: Duration,
    threshold: FindingSeverity,
}

impl std::fmt::Debug for StaticAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAnalyzer")
            .field(
                "analyzers",
                &self.analyzers.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .field("per_analyzer_timeout", &self.per_analyzer_timeout)
            .field("overall_timeout", &self.overall_timeout)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl StaticAnalyzer {
    /// Build the stage with the configured built-in analyzers
    #[must_use]
    pub fn from_config(config: &StaticAnalysisConfig) -> Self {
        let analyzers = config
            .analyzers
            .iter()
            .map(|builtin| Arc::new(builtin.build()) as Arc<dyn ExternalAnalyzer>)
            .collect();
        Self {
            analyzers,
            per_analyzer_timeout: config.per_analyzer_timeout,
            overall_timeout: config.overall_timeout,
            threshold: FindingSeverity::Critical,
        }
    }

    /// Register an additional analyzer; findings follow registration order
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn ExternalAnalyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    /// Override the fatality threshold (default `Critical`)
    #[must_use]
    pub const fn with_threshold(mut self, threshold: FindingSeverity) -> Self {
        self.threshold = threshold;
        self
    }

    /// Number of registered analyzers
    #[must_use]
    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    /// Whether no analyzer is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    /// Run every analyzer concurrently and collect their findings
    pub async fn analyze(&self, source: &SourceUnit) -> StageResult {
        let start = Instant::now();

        if self.analyzers.is_empty() {
            return StageResult::from_findings(
                StageId::StaticAnalysis,
                vec![Finding::info("no static analyzers configured")],
                self.threshold,
                start.elapsed(),
            );
        }

        let text: Arc<str> = Arc::from(source.text());
        let mut tasks: TaskGuard<AnalyzerOutcome> = TaskGuard(
            self.analyzers
                .iter()
                .map(|analyzer| {
                    let analyzer = Arc::clone(analyzer);
                    let text = Arc::clone(&text);
                    let limit = self.per_analyzer_timeout;
                    tokio::spawn(
                        async move { tokio::time::timeout(limit, analyzer.analyze(&text)).await },
                    )
                })
                .collect(),
        );

        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(self.overall_timeout)
            .unwrap_or_else(|| now + MAX_DURATION);
        let mut findings = Vec::new();

        for (analyzer, handle) in self.analyzers.iter().zip(tasks.0.iter_mut()) {
            let name = analyzer.name();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(Ok(issues)))) => {
                    debug!(analyzer = name, issues = issues.len(), "analyzer finished");
                    let scale = analyzer.severity_scale();
                    findings.extend(issues.into_iter().map(|issue| to_finding(name, scale, issue)));
                }
                Ok(Ok(Ok(Err(e)))) => {
                    warn!(analyzer = name, error = %e, "analyzer failed");
                    findings.push(
                        Finding::warning(format!("analyzer '{name}' failed: {e}"))
                            .with_code("analyzer-crash"),
                    );
                }
                Ok(Ok(Err(_))) => {
                    warn!(analyzer = name, "analyzer timed out");
                    findings.push(
                        Finding::warning(format!(
                            "analyzer '{name}' timed out after {:.1}s",
                            self.per_analyzer_timeout.as_secs_f64()
                        ))
                        .with_code("analyzer-timeout"),
                    );
                }
                Ok(Err(e)) => {
                    warn!(analyzer = name, error = %e, "analyzer task crashed");
                    findings.push(
                        Finding::warning(format!("analyzer '{name}' crashed: {e}"))
                            .with_code("analyzer-crash"),
                    );
                }
                Err(_) => {
                    warn!(analyzer = name, "analyzer abandoned at overall wait");
                    findings.push(
                        Finding::warning(format!(
                            "analyzer '{name}' timed out: overall wait of {:.1}s exceeded",
                            self.overall_timeout.as_secs_f64()
                        ))
                        .with_code("analyzer-timeout"),
                    );
                }
            }
        }

        let result = StageResult::from_findings(
            StageId::StaticAnalysis,
            findings,
            self.threshold,
            start.elapsed(),
        );
        info!(
            status = ?result.status(),
            analyzers = self.analyzers.len(),
            findings = result.findings().len(),
            "static analysis finished"
        );
        result
    }
}

fn to_finding(name: &str, scale: &SeverityScale, issue: AnalyzerIssue) -> Finding {
    let mut finding = Finding::new(scale.map(&issue.level), format!("{name}: {}", issue.message))
        .with_code(match &issue.code {
            Some(code) => format!("{name}:{code}"),
            None => name.to_string(),
        });
    finding.location = issue.location;
    finding
}
