//! The validation pipeline.
//!
//! Stages run strictly in order: prevalidation, static analysis, sandbox
//! execution, property testing, resource guard. Every report carries exactly
//! one result per stage; stages that were not reached are `Skipped` with a
//! reason. The resource guard always runs.

mod guard;

pub use guard::{ResourceGuard, ResourceUsage};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::analyzer::{ExternalAnalyzer, StaticAnalyzer};
use crate::config::{ConfigError, SandboxConfig, ValidatorConfig, MAX_DURATION};
use crate::prevalidator::{is_syntax_failure, PatternRegistry, Prevalidator};
use crate::property::{Property, PropertyTester};
use crate::sandbox::{build_sandbox, ExecutionRequest, Sandbox};
use crate::types::{
    ExecutionResult, ExitClassification, Finding, PropertyCheckResult, SandboxBackendKind,
    SourceUnit, StageId, StageResult, StageStatus, ValidationReport,
};

/// Error type reported by the sandbox for failures of its own machinery
const SANDBOX_MACHINERY_ERROR: &str = "SandboxError";

#[derive(Clone, Copy, Debug)]
struct Deadline {
    budget: Duration,
    at: tokio::time::Instant,
}

/// Runs the staged pipeline under one configuration.
///
/// The sandbox backend is chosen once, at construction.
pub struct Validator {
    config: ValidatorConfig,
    prevalidator: Prevalidator,
    analyzer: StaticAnalyzer,
    sandbox: Arc<dyn Sandbox>,
    properties: Vec<Property>,
    guard: ResourceGuard,
}

impl Validator {
    /// Build a validator from a configuration
    ///
    /// # Errors
    /// Returns error if the configuration is invalid
    pub fn new(config: ValidatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let thresholds = config.thresholds;
        let patterns = Arc::new(config.patterns.clone());
        let prevalidator = Prevalidator::new(Arc::clone(&patterns), config.prevalidation.clone())
            .with_threshold(thresholds.prevalidation);
        let analyzer = StaticAnalyzer::from_config(&config.static_analysis)
            .with_threshold(thresholds.static_analysis);
        let sandbox = build_sandbox(config.sandbox_backend, config.sandbox.clone(), patterns);
        let guard = ResourceGuard::new(config.ceilings, thresholds.resource_guard);

        Ok(Self {
            config,
            prevalidator,
            analyzer,
            sandbox,
            properties: Vec::new(),
            guard,
        })
    }

    /// Register an additional static analyzer
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn ExternalAnalyzer>) -> Self {
        self.analyzer = self.analyzer.with_analyzer(analyzer);
        self
    }

    /// Register a user property checked after the built-in battery
    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Replace the configured sandbox backend
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Execution-free verdict: prevalidation, plus static analysis when
    /// analyzers are configured
    pub async fn is_safe(&self, source: &str) -> bool {
        let unit = SourceUnit::new(source);
        if self.prevalidator.validate(&unit).status() != StageStatus::Passed {
            return false;
        }
        if !self.config.static_analysis.enabled || self.analyzer.is_empty() {
            return true;
        }
        self.analyzer.analyze(&unit).await.status() == StageStatus::Passed
    }

    /// Run the full pipeline
    pub async fn validate(&self, source: &str, entry_point: Option<&str>) -> ValidationReport {
        let start = Instant::now();
        let now = tokio::time::Instant::now();
        let deadline = self.config.overall_deadline.map(|budget| Deadline {
            budget,
            at: now
                .checked_add(budget)
                .unwrap_or_else(|| now + MAX_DURATION),
        });
        let unit = SourceUnit::new(source);
        let mut stages = Vec::with_capacity(StageId::PIPELINE.len());
        let mut usage = ResourceUsage::default();
        let mut execution: Option<ExecutionResult> = None;
        let mut properties: Vec<PropertyCheckResult> = Vec::new();

        info!(
            digest = %unit.digest(),
            chars = unit.length(),
            lines = unit.line_count(),
            entry_point,
            "validation started"
        );

        // Prevalidation
        let result = run_stage(StageId::Prevalidation, deadline, async {
            self.prevalidator.validate(&unit)
        })
        .await;
        let mut halted = if is_syntax_failure(&result) {
            Some("source does not parse".to_string())
        } else {
            self.halt_reason(&result)
        };
        stages.push(result);

        // Static analysis
        let result = if let Some(reason) = &halted {
            StageResult::skipped(StageId::StaticAnalysis, reason.as_str())
        } else if !self.config.static_analysis.enabled {
            StageResult::skipped(StageId::StaticAnalysis, "static analysis disabled")
        } else {
            run_stage(StageId::StaticAnalysis, deadline, self.analyzer.analyze(&unit)).await
        };
        halted = halted.or_else(|| self.halt_reason(&result));
        stages.push(result);

        // Sandbox execution
        let result = if let Some(reason) = &halted {
            StageResult::skipped(StageId::SandboxExecution, reason.as_str())
        } else if !self.config.enable_sandbox {
            StageResult::skipped(StageId::SandboxExecution, "sandbox disabled")
        } else {
            let started = Instant::now();
            let run = run_stage_value(StageId::SandboxExecution, deadline, async {
                let mut request = ExecutionRequest::new(unit.text());
                if let Some(entry_point) = entry_point {
                    request = request.with_entry_point(entry_point);
                }
                self.sandbox.execute(request).await
            })
            .await;
            match run {
                Ok(run) => {
                    usage.record_peak(run.peak_memory_bytes);
                    usage.add_cpu_time(run.cpu_time);
                    let stage = self.execution_stage(&run, entry_point, started.elapsed());
                    execution = Some(run);
                    stage
                }
                Err(timed_out) => timed_out,
            }
        };
        halted = halted.or_else(|| self.halt_reason(&result));
        stages.push(result);

        // Property testing
        let precondition = halted
            .clone()
            .or_else(|| self.property_precondition(entry_point, execution.as_ref()));
        let result = match (precondition, entry_point, execution.as_ref()) {
            (None, Some(entry_point), Some(run)) => {
                let started = Instant::now();
                let signature = run.signature.clone().unwrap_or_default();
                let tester = PropertyTester::new(
                    Arc::clone(&self.sandbox),
                    self.config.property_tests.clone(),
                )
                .with_properties(self.properties.iter().cloned());
                let report = run_stage_value(StageId::PropertyTesting, deadline, async {
                    tester.test(unit.text(), entry_point, &signature).await
                })
                .await;
                match report {
                    Ok(report) => {
                        usage.record_peak(report.usage.peak_memory_bytes);
                        usage.add_cpu_time(Some(report.usage.cpu_time));
                        let stage = report.to_stage_result(
                            self.config.thresholds.property_testing,
                            started.elapsed(),
                        );
                        properties = report.results;
                        stage
                    }
                    Err(timed_out) => timed_out,
                }
            }
            (reason, _, _) => StageResult::skipped(
                StageId::PropertyTesting,
                reason.unwrap_or_else(|| "no target entry point supplied".to_string()),
            ),
        };
        stages.push(result);

        // Resource guard
        usage.wall_time = start.elapsed();
        stages.push(self.guard.check(&usage));

        let report = ValidationReport::new(
            stages,
            start.elapsed(),
            unit.digest().to_string(),
            entry_point.map(str::to_string),
            execution,
            properties,
        );
        info!(
            status = ?report.status(),
            elapsed_ms = report.total_duration().as_millis() as u64,
            score = report.severity_score(),
            "validation finished"
        );
        report
    }

    /// Why later stages must be skipped after `result`, if they must
    fn halt_reason(&self, result: &StageResult) -> Option<String> {
        match result.status() {
            StageStatus::TimedOut => Some("overall deadline exceeded".to_string()),
            status if self.config.stop_on_failure && status.halts_pipeline() => {
                Some(format!("stopped after {} {}", result.stage(), status_word(status)))
            }
            _ => None,
        }
    }

    /// Reason the property stage cannot run, if any
    fn property_precondition(
        &self,
        entry_point: Option<&str>,
        execution: Option<&ExecutionResult>,
    ) -> Option<String> {
        if !self.config.enable_property_tests {
            return Some("property testing disabled".to_string());
        }
        let Some(entry_point) = entry_point else {
            return Some("no target entry point supplied".to_string());
        };
        let Some(run) = execution else {
            return Some("sandbox did not run".to_string());
        };
        if !run.is_usable() {
            return Some(format!(
                "sandbox run did not complete cleanly ({})",
                run.classification
            ));
        }
        if run.entry_point_found != Some(true) {
            return Some(format!("entry point '{entry_point}' not found"));
        }
        if run.signature.is_none() {
            return Some(format!("signature of '{entry_point}' unavailable"));
        }
        None
    }

    fn execution_stage(
        &self,
        run: &ExecutionResult,
        entry_point: Option<&str>,
        duration: Duration,
    ) -> StageResult {
        let threshold = self.config.thresholds.sandbox;
        let exception = run
            .exception
            .as_ref()
            .map_or_else(String::new, ToString::to_string);

        if run
            .exception
            .as_ref()
            .is_some_and(|e| e.error_type == SANDBOX_MACHINERY_ERROR)
        {
            warn!(backend = %run.backend, %exception, "sandbox machinery failed");
            return StageResult::errored(
                StageId::SandboxExecution,
                vec![Finding::error(exception).with_code("sandbox-unavailable")],
                duration,
            );
        }

        let mut findings = Vec::new();
        match run.classification {
            ExitClassification::Ok => findings.push(
                Finding::info(format!("execution completed on {} backend", run.backend))
                    .with_code("execution-ok"),
            ),
            ExitClassification::Timeout => findings.push(
                Finding::error(format!(
                    "execution exceeded the {:.3}s timeout",
                    self.config.sandbox.timeout.as_secs_f64()
                ))
                .with_code("sandbox-timeout"),
            ),
            ExitClassification::Oom => findings.push(
                Finding::error(format!(
                    "execution exceeded the {} MiB memory ceiling",
                    self.config.sandbox.memory_mb()
                ))
                .with_code("sandbox-oom"),
            ),
            ExitClassification::RuntimeError => findings.push(
                Finding::error(format!("execution raised {exception}"))
                    .with_code("sandbox-runtime-error"),
            ),
            ExitClassification::ForbiddenOperation => findings.push(
                Finding::critical(format!("forbidden operation at runtime: {exception}"))
                    .with_code("sandbox-forbidden"),
            ),
        }

        if let (Some(entry_point), Some(false)) = (entry_point, run.entry_point_found) {
            findings.push(
                Finding::error(format!("entry point '{entry_point}' is not defined"))
                    .with_code("entry-point-missing"),
            );
        }
        if run.output_truncated {
            findings.push(
                Finding::warning(format!(
                    "captured output truncated at {} bytes",
                    self.config.sandbox.output_limit_bytes
                ))
                .with_code("output-truncated"),
            );
        }

        let result =
            StageResult::from_findings(StageId::SandboxExecution, findings, threshold, duration);
        info!(
            classification = %run.classification,
            status = ?result.status(),
            "sandbox stage finished"
        );
        result
    }
}

fn status_word(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Failed => "failed",
        StageStatus::Errored => "errored",
        StageStatus::TimedOut => "timed out",
        StageStatus::Passed => "passed",
        StageStatus::Skipped => "was skipped",
    }
}

/// Run a stage body under the overall deadline
async fn run_stage<F>(stage: StageId, deadline: Option<Deadline>, body: F) -> StageResult
where
    F: Future<Output = StageResult>,
{
    let result = run_stage_value(stage, deadline, body)
        .await
        .unwrap_or_else(|timed_out| timed_out);
    info!(%stage, status = ?result.status(), findings = result.findings().len(), "stage finished");
    result
}

/// Run a stage body under the overall deadline; `Err` is the `TimedOut` result
async fn run_stage_value<F>(
    stage: StageId,
    deadline: Option<Deadline>,
    body: F,
) -> Result<F::Output, StageResult>
where
    F: Future,
{
    let Some(deadline) = deadline else {
        return Ok(body.await);
    };
    let started = Instant::now();
    // Dropping the body cancels it; kill guards reap any child processes
    tokio::time::timeout_at(deadline.at, body).await.map_err(|_| {
        warn!(%stage, budget = ?deadline.budget, "overall deadline cancelled stage");
        StageResult::timed_out(stage, deadline.budget, started.elapsed())
    })
}

/// Prevalidation plus configured static analysis with the default configuration
pub async fn is_safe(source: &str) -> bool {
    match Validator::new(ValidatorConfig::default()) {
        Ok(validator) => validator.is_safe(source).await,
        Err(e) => {
            warn!(error = %e, "default configuration rejected");
            false
        }
    }
}

/// Validate `source` with a one-off validator
///
/// # Errors
/// Returns error if the configuration is invalid
pub async fn validate(
    source: &str,
    entry_point: Option<&str>,
    config: ValidatorConfig,
) -> Result<ValidationReport, ConfigError> {
    Ok(Validator::new(config)?.validate(source, entry_point).await)
}

/// Run `source` in a sandbox with the default denylist, without other stages
///
/// # Errors
/// Returns error if the sandbox configuration is invalid
pub async fn execute_safe(
    source: &str,
    backend: SandboxBackendKind,
    sandbox_config: SandboxConfig,
) -> Result<ExecutionResult, ConfigError> {
    sandbox_config.validate()?;
    let sandbox = build_sandbox(backend, sandbox_config, Arc::new(PatternRegistry::default()));
    Ok(sandbox.execute(ExecutionRequest::new(source)).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{AnalyzerError, AnalyzerIssue, SeverityScale};
    use crate::config::PropertyTestConfig;
    use crate::sandbox::SubprocessSandbox;
    use crate::types::{
        CallOutcome, CallableSignature, FindingSeverity, OverallStatus, ParamSpec, PropertyOutcome,
        SandboxState,
    };
    use async_trait::async_trait;

    const OS_SCENARIO: &str = "import os\nos.system('echo hi')";
    const FIB: &str = "def fib(n):\n    return n if n <= 1 else fib(n - 1) + fib(n - 2)\n";

    fn statuses(report: &ValidationReport) -> Vec<StageStatus> {
        report.stages().iter().map(StageResult::status).collect()
    }

    fn python_available() -> bool {
        if SubprocessSandbox::is_available(&SandboxConfig::default()) {
            return true;
        }
        eprintln!("Skipping test: Python not available");
        false
    }

    /// A clean run of `f(x: int)` that made no calls
    fn completed_run(wall_time: Duration) -> ExecutionResult {
        let mut result = ExecutionResult::aborted(
            SandboxBackendKind::Subprocess,
            ExitClassification::Ok,
            crate::types::ExceptionSummary {
                error_type: String::new(),
                message: String::new(),
                traceback: None,
            },
            wall_time,
        );
        result.exception = None;
        result.entry_point_found = Some(true);
        result.signature = Some(CallableSignature {
            params: vec![ParamSpec {
                name: "x".to_string(),
                annotation: Some("int".to_string()),
                kind: "POSITIONAL_OR_KEYWORD".to_string(),
                has_default: false,
            }],
            returns: None,
        });
        result
    }

    /// Reports a successful run after sleeping
    struct SlowSandbox(Duration);

    #[async_trait]
    impl Sandbox for SlowSandbox {
        async fn execute(&self, _request: ExecutionRequest<'_>) -> ExecutionResult {
            tokio::time::sleep(self.0).await;
            completed_run(self.0)
        }

        fn backend(&self) -> SandboxBackendKind {
            SandboxBackendKind::Subprocess
        }
    }

    /// Identity function whose property batches use far more memory than
    /// the module run
    struct HungrySandbox;

    const BATCH_PEAK: u64 = 900 * 1024 * 1024;

    #[async_trait]
    impl Sandbox for HungrySandbox {
        async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
            let mut result = completed_run(Duration::from_millis(1));
            result.cpu_time = Some(Duration::from_millis(10));
            if request.inputs.is_empty() {
                result.peak_memory_bytes = Some(1024 * 1024);
                return result;
            }
            result.peak_memory_bytes = Some(BATCH_PEAK);
            result.calls = request
                .inputs
                .iter()
                .map(|args| CallOutcome::Returned {
                    value: args[0].clone(),
                })
                .collect();
            result
        }

        fn backend(&self) -> SandboxBackendKind {
            SandboxBackendKind::Subprocess
        }
    }

    struct BrokenAnalyzer(SeverityScale);

    #[async_trait]
    impl ExternalAnalyzer for BrokenAnalyzer {
        fn name(&self) -> &str {
            "broken"
        }

        fn severity_scale(&self) -> &SeverityScale {
            &self.0
        }

        async fn analyze(&self, _source: &str) -> Result<Vec<AnalyzerIssue>, AnalyzerError> {
            Err(AnalyzerError::NotAvailable("broken".to_string()))
        }
    }

    #[tokio::test]
    async fn test_os_scenario() {
        let validator = Validator::new(ValidatorConfig::default()).unwrap();
        let report = validator.validate(OS_SCENARIO, None).await;

        assert_eq!(report.status(), OverallStatus::Failed);
        assert_eq!(
            statuses(&report),
            vec![
                StageStatus::Failed,
                StageStatus::Skipped,
                StageStatus::Skipped,
                StageStatus::Skipped,
                StageStatus::Passed,
            ]
        );

        let pre = report.stage(StageId::Prevalidation).unwrap();
        let module = pre
            .findings()
            .iter()
            .find(|f| f.code.as_deref() == Some("forbidden-module"))
            .unwrap();
        assert_eq!(module.severity, FindingSeverity::Error);
        assert!(module.message.contains("os"));
        assert_eq!(module.location.unwrap().line, 1);
        assert!(pre
            .findings()
            .iter()
            .any(|f| f.code.as_deref() == Some("forbidden-callable")));
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_os_scenario_without_stop_on_failure() {
        if !python_available() {
            return;
        }
        let config = ValidatorConfig {
            stop_on_failure: false,
            ..ValidatorConfig::default()
        };
        let report = Validator::new(config)
            .unwrap()
            .validate(OS_SCENARIO, None)
            .await;

        assert_eq!(report.status(), OverallStatus::Failed);
        assert_eq!(
            statuses(&report),
            vec![
                StageStatus::Failed,
                StageStatus::Passed,
                StageStatus::Failed,
                StageStatus::Skipped,
                StageStatus::Passed,
            ]
        );

        let execution = report.execution().unwrap();
        assert_eq!(
            execution.classification,
            ExitClassification::ForbiddenOperation
        );
        let sandbox = report.stage(StageId::SandboxExecution).unwrap();
        let forbidden = sandbox
            .findings()
            .iter()
            .find(|f| f.code.as_deref() == Some("sandbox-forbidden"))
            .unwrap();
        assert_eq!(forbidden.severity, FindingSeverity::Critical);
        assert_eq!(
            report.stage(StageId::PropertyTesting).unwrap().skip_reason(),
            Some("no target entry point supplied")
        );
        assert!(report
            .stage(StageId::ResourceGuard)
            .unwrap()
            .findings()
            .iter()
            .any(|f| f.code.as_deref() == Some("resource-summary")));
    }

    #[tokio::test]
    async fn test_property_batch_peak_reaches_guard() {
        let config = ValidatorConfig {
            property_tests: PropertyTestConfig {
                trials: 5,
                seed: Some(3),
                ..PropertyTestConfig::default()
            },
            ..ValidatorConfig::default()
        };
        let report = Validator::new(config)
            .unwrap()
            .with_sandbox(Arc::new(HungrySandbox))
            .validate("def f(x):\n    return x\n", Some("f"))
            .await;

        assert_eq!(
            report.stage(StageId::SandboxExecution).unwrap().status(),
            StageStatus::Passed
        );
        assert_eq!(
            report.stage(StageId::PropertyTesting).unwrap().status(),
            StageStatus::Passed
        );
        let guard = report.stage(StageId::ResourceGuard).unwrap();
        assert_eq!(guard.status(), StageStatus::Failed);
        let exceeded = guard
            .findings()
            .iter()
            .find(|f| f.code.as_deref() == Some("memory-exceeded"))
            .unwrap();
        assert!(exceeded.message.contains("900 MiB"), "{}", exceeded.message);
        assert_eq!(report.status(), OverallStatus::Failed);
    }

    #[tokio::test]
    async fn test_syntax_error_is_always_fatal() {
        let config = ValidatorConfig {
            stop_on_failure: false,
            ..ValidatorConfig::default()
        };
        let validator = Validator::new(config).unwrap();
        // tree-sitter rejects the first; only a full grammar check rejects the rest
        for source in [
            "def broken(:\n    pass\n",
            "def f(a=1, b):\n    pass\n",
            "f(a=1, 2)\n",
            "(a, b) += 1\n",
            "del 1\n",
        ] {
            let report = validator.validate(source, Some("f")).await;

            let pre = report.stage(StageId::Prevalidation).unwrap();
            assert_eq!(pre.findings().len(), 1, "{source:?}");
            assert_eq!(pre.findings()[0].severity, FindingSeverity::Critical);
            for stage in [
                StageId::StaticAnalysis,
                StageId::SandboxExecution,
                StageId::PropertyTesting,
            ] {
                let result = report.stage(stage).unwrap();
                assert_eq!(result.status(), StageStatus::Skipped);
                assert_eq!(result.skip_reason(), Some("source does not parse"));
            }
            assert!(report.execution().is_none());
        }
    }

    #[tokio::test]
    async fn test_disabled_stages_are_skipped_with_reason() {
        let config = ValidatorConfig {
            enable_sandbox: false,
            ..ValidatorConfig::default()
        };
        let report = Validator::new(config)
            .unwrap()
            .validate("x = 1\n", Some("f"))
            .await;

        assert_eq!(report.status(), OverallStatus::Passed);
        assert_eq!(
            report.stage(StageId::SandboxExecution).unwrap().skip_reason(),
            Some("sandbox disabled")
        );
        assert_eq!(
            report.stage(StageId::PropertyTesting).unwrap().skip_reason(),
            Some("sandbox did not run")
        );
    }

    #[tokio::test]
    async fn test_broken_analyzer_is_not_fatal() {
        let scale = SeverityScale::new([("error", FindingSeverity::Error)]).unwrap();
        let config = ValidatorConfig {
            enable_sandbox: false,
            ..ValidatorConfig::default()
        };
        let report = Validator::new(config)
            .unwrap()
            .with_analyzer(Arc::new(BrokenAnalyzer(scale)))
            .validate("x = 1\n", None)
            .await;

        let analysis = report.stage(StageId::StaticAnalysis).unwrap();
        assert_eq!(analysis.status(), StageStatus::Passed);
        assert_eq!(analysis.max_severity(), Some(FindingSeverity::Warning));
    }

    #[tokio::test]
    async fn test_overall_deadline_times_out_stage() {
        let config = ValidatorConfig {
            overall_deadline: Some(Duration::from_millis(200)),
            ..ValidatorConfig::default()
        };
        let validator = Validator::new(config)
            .unwrap()
            .with_sandbox(Arc::new(SlowSandbox(Duration::from_secs(30))));

        let started = Instant::now();
        let report = validator.validate("def f(x):\n    return x\n", Some("f")).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.status(), OverallStatus::Error);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(
            report.stage(StageId::SandboxExecution).unwrap().status(),
            StageStatus::TimedOut
        );
        let property = report.stage(StageId::PropertyTesting).unwrap();
        assert_eq!(property.skip_reason(), Some("overall deadline exceeded"));
        assert_eq!(
            report.stage(StageId::ResourceGuard).unwrap().status(),
            StageStatus::Passed
        );
    }

    #[tokio::test]
    async fn test_property_stage_times_out_under_deadline() {
        let config = ValidatorConfig {
            overall_deadline: Some(Duration::from_millis(300)),
            ..ValidatorConfig::default()
        };
        // the first run fits the deadline, the property batches do not
        let validator = Validator::new(config)
            .unwrap()
            .with_sandbox(Arc::new(SlowSandbox(Duration::from_millis(200))));
        let report = validator.validate("def f(x):\n    return x\n", Some("f")).await;

        assert_eq!(
            report.stage(StageId::SandboxExecution).unwrap().status(),
            StageStatus::Passed
        );
        assert_eq!(
            report.stage(StageId::PropertyTesting).unwrap().status(),
            StageStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ValidatorConfig::default();
        config.prevalidation.max_lines = 0;
        assert!(matches!(
            Validator::new(config),
            Err(ConfigError::ZeroLimit("max_lines"))
        ));
    }

    #[tokio::test]
    async fn test_is_safe() {
        assert!(is_safe("def add(a, b):\n    return a + b\n").await);
        assert!(!is_safe(OS_SCENARIO).await);
        assert!(!is_safe("getattr(object, '__subclasses__')()").await);
        assert!(!is_safe("def f(:").await);
    }

    #[tokio::test]
    async fn test_repeated_validation_is_stable() {
        let validator = Validator::new(ValidatorConfig::default()).unwrap();
        let first = validator.validate(OS_SCENARIO, None).await;
        let second = validator.validate(OS_SCENARIO, None).await;
        assert_eq!(statuses(&first), statuses(&second));
        for (a, b) in first.stages().iter().zip(second.stages()) {
            assert_eq!(a.findings(), b.findings());
        }
        assert_eq!(first.source_digest(), second.source_digest());
    }

    fn fib_config() -> ValidatorConfig {
        ValidatorConfig {
            sandbox: SandboxConfig::default().with_timeout_secs(3.0).unwrap(),
            property_tests: PropertyTestConfig {
                trials: 25,
                int_min: 0,
                int_max: 20,
                seed: Some(7),
                ..PropertyTestConfig::default()
            },
            ..ValidatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_fib_scenario() {
        if !python_available() {
            return;
        }
        let report = Validator::new(fib_config())
            .unwrap()
            .validate(FIB, Some("fib"))
            .await;

        assert_eq!(report.status(), OverallStatus::Passed, "{report:#?}");
        assert_eq!(
            report.stage(StageId::Prevalidation).unwrap().status(),
            StageStatus::Passed
        );
        let execution = report.execution().unwrap();
        assert_eq!(execution.state, SandboxState::Completed);

        let outcome = |name: &str| {
            report
                .properties()
                .iter()
                .find(|p| p.property == name)
                .map(|p| p.outcome)
        };
        assert_eq!(outcome("no_exception"), Some(PropertyOutcome::Holds));
        assert_eq!(outcome("determinism"), Some(PropertyOutcome::Holds));
        // fib(fib(n)) is neither equal nor cheap; both outcomes are expected
        assert!(matches!(
            outcome("idempotence"),
            Some(PropertyOutcome::Violated | PropertyOutcome::Error)
        ));
    }

    #[tokio::test]
    async fn test_repeated_python_validation_is_stable() {
        if !python_available() {
            return;
        }
        let config = ValidatorConfig {
            property_tests: PropertyTestConfig {
                trials: 10,
                seed: Some(1),
                ..PropertyTestConfig::default()
            },
            ..ValidatorConfig::default()
        };
        let validator = Validator::new(config).unwrap();
        let code = "def double(n: int) -> int:\n    return n * 2\n";
        let first = validator.validate(code, Some("double")).await;
        let second = validator.validate(code, Some("double")).await;

        assert_eq!(first.status(), OverallStatus::Passed);
        assert_eq!(statuses(&first), statuses(&second));
        for (a, b) in first.stages().iter().zip(second.stages()) {
            assert_eq!(a.findings(), b.findings());
        }
        assert_eq!(first.properties(), second.properties());
    }

    #[tokio::test]
    async fn test_missing_entry_point_fails_sandbox_stage() {
        if !python_available() {
            return;
        }
        let report = Validator::new(ValidatorConfig::default())
            .unwrap()
            .validate("x = 1\n", Some("missing"))
            .await;
        let sandbox = report.stage(StageId::SandboxExecution).unwrap();
        assert_eq!(sandbox.status(), StageStatus::Failed);
        assert!(sandbox
            .findings()
            .iter()
            .any(|f| f.code.as_deref() == Some("entry-point-missing")));
        assert_eq!(
            report.stage(StageId::PropertyTesting).unwrap().status(),
            StageStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_execute_safe_runs_code() {
        if !python_available() {
            return;
        }
        let result = execute_safe(
            "print('hello')\n",
            SandboxBackendKind::Subprocess,
            SandboxConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.classification, ExitClassification::Ok);
        assert_eq!(result.stdout, "hello\n");
    }

    #[tokio::test]
    async fn test_execute_safe_rejects_bad_config() {
        let config = SandboxConfig {
            cpu_share: 0.0,
            ..SandboxConfig::default()
        };
        assert!(execute_safe("x = 1", SandboxBackendKind::Subprocess, config)
            .await
            .is_err());
    }
}
