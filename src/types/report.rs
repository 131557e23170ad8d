//! Stage results and the aggregated validation report.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{serde_millis, ExecutionResult, Finding, FindingSeverity, PropertyCheckResult};

/// Pipeline stages, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Parse and denylist check
    Prevalidation,
    /// External analyzers
    StaticAnalysis,
    /// Isolated run of the code
    SandboxExecution,
    /// Randomized behavioral checks
    PropertyTesting,
    /// Cumulative resource summary
    ResourceGuard,
}

impl StageId {
    /// Every stage in pipeline order
    pub const PIPELINE: [Self; 5] = [
        Self::Prevalidation,
        Self::StaticAnalysis,
        Self::SandboxExecution,
        Self::PropertyTesting,
        Self::ResourceGuard,
    ];

    /// Stage name used in logs and reports
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Prevalidation => "prevalidation",
            Self::StaticAnalysis => "static_analysis",
            Self::SandboxExecution => "sandbox_execution",
            Self::PropertyTesting => "property_testing",
            Self::ResourceGuard => "resource_guard",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// No finding reached the stage's fatality threshold
    Passed,
    /// At least one finding reached the threshold
    Failed,
    /// Not run; see the skip reason
    Skipped,
    /// Cancelled by the overall deadline
    TimedOut,
    /// The stage's own machinery failed
    Errored,
}

impl StageStatus {
    /// Whether the stage halts the pipeline under `stop_on_failure`
    #[must_use]
    pub const fn halts_pipeline(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Errored)
    }
}

/// Result of a single pipeline stage. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    stage: StageId,
    status: StageStatus,
    findings: Vec<Finding>,
    #[serde(with = "serde_millis")]
    duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skip_reason: Option<String>,
}

impl StageResult {
    /// Build a result whose status is derived from the findings.
    ///
    /// The stage fails when any finding is at or above `threshold`.
    #[must_use]
    pub fn from_findings(
        stage: StageId,
        findings: Vec<Finding>,
        threshold: FindingSeverity,
        duration: Duration,
    ) -> Self {
        let failed = findings.iter().any(|f| f.severity >= threshold);
        Self {
            stage,
            status: if failed {
                StageStatus::Failed
            } else {
                StageStatus::Passed
            },
            findings,
            duration,
            skip_reason: None,
        }
    }

    /// A stage that did not run
    #[must_use]
    pub fn skipped(stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            findings: Vec::new(),
            duration: Duration::ZERO,
            skip_reason: Some(reason.into()),
        }
    }

    /// A stage cancelled by the overall deadline
    #[must_use]
    pub fn timed_out(stage: StageId, deadline: Duration, duration: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::TimedOut,
            findings: vec![Finding::error(format!(
                "stage cancelled: overall deadline of {:.3}s exceeded",
                deadline.as_secs_f64()
            ))
            .with_code("deadline-exceeded")],
            duration,
            skip_reason: None,
        }
    }

    /// A stage whose own machinery failed
    #[must_use]
    pub const fn errored(stage: StageId, findings: Vec<Finding>, duration: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Errored,
            findings,
            duration,
            skip_reason: None,
        }
    }

    /// Stage identifier
    #[must_use]
    pub const fn stage(&self) -> StageId {
        self.stage
    }

    /// Stage status
    #[must_use]
    pub const fn status(&self) -> StageStatus {
        self.status
    }

    /// Findings in stage order
    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Elapsed wall-clock time
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Why the stage was skipped
    #[must_use]
    pub fn skip_reason(&self) -> Option<&str> {
        self.skip_reason.as_deref()
    }

    /// Highest severity among the findings
    #[must_use]
    pub fn max_severity(&self) -> Option<FindingSeverity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Overall verdict of a validation run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    /// All executed stages passed
    Passed,
    /// At least one stage failed
    Failed,
    /// No stage failed, but one timed out or errored
    Error,
}

impl OverallStatus {
    /// Derive the overall status from stage results
    #[must_use]
    pub fn from_stages(stages: &[StageResult]) -> Self {
        if stages.iter().any(|s| s.status == StageStatus::Failed) {
            Self::Failed
        } else if stages
            .iter()
            .any(|s| matches!(s.status, StageStatus::TimedOut | StageStatus::Errored))
        {
            Self::Error
        } else {
            Self::Passed
        }
    }

    /// Process exit code for CI gates
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed => 1,
            Self::Error => 2,
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        })
    }
}

/// The product of one validation call.
///
/// Holds exactly one [`StageResult`] per [`StageId`], in pipeline order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    status: OverallStatus,
    stages: Vec<StageResult>,
    #[serde(with = "serde_millis")]
    total_duration: Duration,
    source_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution: Option<ExecutionResult>,
    #[serde(default)]
    properties: Vec<PropertyCheckResult>,
    generated_at: DateTime<Utc>,
}

impl ValidationReport {
    /// Assemble a report; the overall status is derived from the stages
    #[must_use]
    pub fn new(
        stages: Vec<StageResult>,
        total_duration: Duration,
        source_digest: String,
        entry_point: Option<String>,
        execution: Option<ExecutionResult>,
        properties: Vec<PropertyCheckResult>,
    ) -> Self {
        Self {
            status: OverallStatus::from_stages(&stages),
            stages,
            total_duration,
            source_digest,
            entry_point,
            execution,
            properties,
            generated_at: Utc::now(),
        }
    }

    /// Overall status
    #[must_use]
    pub const fn status(&self) -> OverallStatus {
        self.status
    }

    /// Whether the code passed every executed stage
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == OverallStatus::Passed
    }

    /// Stage results in pipeline order
    #[must_use]
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Result for a given stage
    #[must_use]
    pub fn stage(&self, stage: StageId) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Total elapsed time of the validation call
    #[must_use]
    pub const fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Digest of the validated source
    #[must_use]
    pub fn source_digest(&self) -> &str {
        &self.source_digest
    }

    /// Entry point the caller asked to test
    #[must_use]
    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Sandbox execution details, if the sandbox ran
    #[must_use]
    pub const fn execution(&self) -> Option<&ExecutionResult> {
        self.execution.as_ref()
    }

    /// Property check results, if property testing ran
    #[must_use]
    pub fn properties(&self) -> &[PropertyCheckResult] {
        &self.properties
    }

    /// When the report was assembled
    #[must_use]
    pub const fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// All findings across stages, in pipeline order
    pub fn findings(&self) -> impl Iterator<Item = (StageId, &Finding)> {
        self.stages
            .iter()
            .flat_map(|s| s.findings.iter().map(move |f| (s.stage, f)))
    }

    /// Weighted severity score across all findings
    #[must_use]
    pub fn severity_score(&self) -> u32 {
        self.findings().map(|(_, f)| f.severity.weight()).sum()
    }

    /// Process exit code for CI gates
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// Serialize to compact JSON
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize to indented JSON
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed(stage: StageId) -> StageResult {
        StageResult::from_findings(stage, Vec::new(), FindingSeverity::Error, Duration::ZERO)
    }

    #[test]
    fn test_stage_fails_at_threshold() {
        let result = StageResult::from_findings(
            StageId::Prevalidation,
            vec![Finding::warning("style"), Finding::error("bad import")],
            FindingSeverity::Error,
            Duration::from_millis(2),
        );
        assert_eq!(result.status(), StageStatus::Failed);
        assert_eq!(result.max_severity(), Some(FindingSeverity::Error));

        let tolerant = StageResult::from_findings(
            StageId::StaticAnalysis,
            vec![Finding::error("lint")],
            FindingSeverity::Critical,
            Duration::ZERO,
        );
        assert_eq!(tolerant.status(), StageStatus::Passed);
    }

    #[test]
    fn test_overall_status_precedence() {
        let stages = vec![
            passed(StageId::Prevalidation),
            StageResult::skipped(StageId::StaticAnalysis, "disabled"),
        ];
        assert_eq!(OverallStatus::from_stages(&stages), OverallStatus::Passed);

        let stages = vec![
            passed(StageId::Prevalidation),
            StageResult::timed_out(
                StageId::SandboxExecution,
                Duration::from_secs(1),
                Duration::from_secs(1),
            ),
        ];
        assert_eq!(OverallStatus::from_stages(&stages), OverallStatus::Error);

        let stages = vec![
            StageResult::from_findings(
                StageId::Prevalidation,
                vec![Finding::critical("escape")],
                FindingSeverity::Error,
                Duration::ZERO,
            ),
            StageResult::errored(StageId::SandboxExecution, Vec::new(), Duration::ZERO),
        ];
        assert_eq!(OverallStatus::from_stages(&stages), OverallStatus::Failed);
    }

    #[test]
    fn test_report_json_shape() {
        let report = ValidationReport::new(
            vec![
                passed(StageId::Prevalidation),
                StageResult::skipped(StageId::StaticAnalysis, "static analysis disabled"),
            ],
            Duration::from_millis(1500),
            "abc".to_string(),
            None,
            None,
            Vec::new(),
        );

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "PASSED");
        assert_eq!(value["total_duration"], 1500.0);
        assert_eq!(value["stages"][0]["stage"], "prevalidation");
        assert_eq!(value["stages"][1]["status"], "SKIPPED");
        assert_eq!(value["stages"][1]["skip_reason"], "static analysis disabled");
        assert_eq!(report.exit_code(), 0);
    }
}
