//! Randomized behavioral checks on a sandboxed entry point.
//!
//! Inputs come from the entry point's declared signature. Every call runs in
//! the sandbox, batched: one batch calls each input twice back-to-back (for
//! `no_exception`, `determinism` and user predicates), a second batch feeds
//! outputs back in for `idempotence`.
//!
//! There is no shrinking. Edge values are tried first and distinct
//! counter-examples are reported smallest first.

mod generator;

pub use generator::{InputGenerator, ParamType};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::PropertyTestConfig;
use crate::sandbox::{ExecutionRequest, Sandbox};
use crate::types::{
    CallOutcome, CallableSignature, CounterExample, ExecutionResult, Finding, FindingSeverity,
    PropertyCheckResult, PropertyOutcome, StageId, StageResult,
};
use generator::compare_inputs;

/// Name of the built-in "never raises" property
pub const NO_EXCEPTION: &str = "no_exception";
/// Name of the built-in "same input, same output" property
pub const DETERMINISM: &str = "determinism";
/// Name of the built-in `f(f(x)) == f(x)` property
pub const IDEMPOTENCE: &str = "idempotence";

/// User predicate over `(input, output)`
pub type Predicate = Arc<dyn Fn(&[Value], &Value) -> bool + Send + Sync>;

/// A named user predicate, evaluated on every call that returned
#[derive(Clone)]
pub struct Property {
    name: String,
    predicate: Predicate,
}

impl Property {
    /// Create a property
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&[Value], &Value) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Property name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property").field("name", &self.name).finish()
    }
}

/// Resources consumed by the sandbox batches of one campaign
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchUsage {
    /// Sandbox runs made
    pub batches: usize,
    /// Largest peak memory reported by any batch
    pub peak_memory_bytes: Option<u64>,
    /// CPU time summed over all batches
    pub cpu_time: Duration,
}

impl BatchUsage {
    fn record(&mut self, run: &ExecutionResult) {
        self.batches += 1;
        self.peak_memory_bytes = self.peak_memory_bytes.max(run.peak_memory_bytes);
        if let Some(cpu) = run.cpu_time {
            self.cpu_time = self.cpu_time.saturating_add(cpu);
        }
    }
}

/// Everything one property-testing campaign produced
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyReport {
    /// Seed the inputs were generated from
    pub seed: u64,
    /// Inputs generated
    pub trials: usize,
    /// One result per property, battery first
    pub results: Vec<PropertyCheckResult>,
    /// Resources the batches consumed
    pub usage: BatchUsage,
}

impl PropertyReport {
    /// Look up a property's result
    #[must_use]
    pub fn result(&self, property: &str) -> Option<&PropertyCheckResult> {
        self.results.iter().find(|r| r.property == property)
    }

    /// Findings for the property testing stage.
    ///
    /// Violations are `Error`, unevaluable properties `Warning`, skips and
    /// the campaign summary `Info`.
    #[must_use]
    pub fn findings(&self) -> Vec<Finding> {
        let mut findings = vec![Finding::info(format!(
            "{} properties over {} trials (seed {})",
            self.results.len(),
            self.trials,
            self.seed
        ))
        .with_code("property-summary")];

        for result in &self.results {
            let finding = match result.outcome {
                PropertyOutcome::Holds => continue,
                PropertyOutcome::Violated => {
                    let input = result
                        .counter_example
                        .as_ref()
                        .and_then(|input| serde_json::to_string(input).ok())
                        .unwrap_or_default();
                    Finding::error(format!(
                        "property '{}' violated by input {input}: {}",
                        result.property,
                        result.detail.as_deref().unwrap_or("no detail")
                    ))
                    .with_code("property-violated")
                }
                PropertyOutcome::Error => Finding::warning(format!(
                    "property '{}' could not be evaluated: {}",
                    result.property,
                    result.detail.as_deref().unwrap_or("no detail")
                ))
                .with_code("property-error"),
                PropertyOutcome::Skipped => Finding::info(format!(
                    "property '{}' skipped: {}",
                    result.property,
                    result.detail.as_deref().unwrap_or("not applicable")
                ))
                .with_code("property-skipped"),
            };
            findings.push(finding);
        }
        findings
    }

    /// The stage result for this campaign
    #[must_use]
    pub fn to_stage_result(&self, threshold: FindingSeverity, duration: Duration) -> StageResult {
        StageResult::from_findings(StageId::PropertyTesting, self.findings(), threshold, duration)
    }
}

/// One input and the two back-to-back calls made with it
struct Trial {
    input: Vec<Value>,
    first: CallOutcome,
    second: CallOutcome,
}

/// Drives property campaigns through a sandbox
pub struct PropertyTester {
    sandbox: Arc<dyn Sandbox>,
    config: PropertyTestConfig,
    properties: Vec<Property>,
}

impl PropertyTester {
    /// Create a tester running the built-in battery
    #[must_use]
    pub fn new(sandbox: Arc<dyn Sandbox>, config: PropertyTestConfig) -> Self {
        Self {
            sandbox,
            config,
            properties: Vec::new(),
        }
    }

    /// Add a user predicate, evaluated after the battery
    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Add several user predicates
    #[must_use]
    pub fn with_properties(mut self, properties: impl IntoIterator<Item = Property>) -> Self {
        self.properties.extend(properties);
        self
    }

    fn property_names(&self) -> Vec<&str> {
        [NO_EXCEPTION, DETERMINISM, IDEMPOTENCE]
            .into_iter()
            .chain(self.properties.iter().map(Property::name))
            .collect()
    }

    fn all(&self, outcome: impl Fn(&str) -> PropertyCheckResult) -> Vec<PropertyCheckResult> {
        self.property_names().into_iter().map(outcome).collect()
    }

    /// Parameter types to generate, one per required positional parameter
    fn resolve_params(&self, signature: &CallableSignature) -> Result<Vec<ParamType>, String> {
        let mut params = Vec::new();
        for param in &signature.params {
            if param.has_default || matches!(param.kind.as_str(), "VAR_POSITIONAL" | "VAR_KEYWORD")
            {
                continue;
            }
            if !param.is_positional() {
                return Err(format!(
                    "required {} parameter '{}' is not supported",
                    param.kind.to_lowercase().replace('_', "-"),
                    param.name
                ));
            }
            let annotation = param
                .annotation
                .as_deref()
                .unwrap_or(&self.config.default_param_type);
            let ty = ParamType::parse(annotation).ok_or_else(|| {
                format!(
                    "unsupported annotation '{annotation}' on parameter '{}'",
                    param.name
                )
            })?;
            params.push(ty);
        }
        Ok(params)
    }

    /// Run the battery and the user predicates against `entry_point`.
    ///
    /// `signature` is the one the sandbox reported for the entry point.
    pub async fn test(
        &self,
        source: &str,
        entry_point: &str,
        signature: &CallableSignature,
    ) -> PropertyReport {
        let seed = self.config.seed.unwrap_or_else(rand::random);

        let params = match self.resolve_params(signature) {
            Ok(params) => params,
            Err(reason) => {
                info!(entry_point, %reason, "property testing skipped");
                return PropertyReport {
                    seed,
                    trials: 0,
                    results: self.all(|name| PropertyCheckResult::skipped(name, reason.as_str())),
                    usage: BatchUsage::default(),
                };
            }
        };

        let inputs = InputGenerator::new(&self.config, seed).generate(&params, self.config.trials);
        let trials = inputs.len();
        debug!(entry_point, seed, trials, "generated property inputs");

        let doubled: Vec<Vec<Value>> = inputs
            .iter()
            .flat_map(|input| [input.clone(), input.clone()])
            .collect();
        let mut usage = BatchUsage::default();
        let batch = self.run_batch(source, entry_point, &doubled, &mut usage).await;
        let calls = match batch {
            Ok(calls) => calls,
            Err(detail) => {
                info!(entry_point, %detail, "property batch failed");
                return PropertyReport {
                    seed,
                    trials,
                    results: self.all(|name| PropertyCheckResult::error(name, 0, detail.as_str())),
                    usage,
                };
            }
        };

        let mut calls = calls.into_iter();
        let trial_runs: Vec<Trial> = inputs
            .into_iter()
            .filter_map(|input| {
                Some(Trial {
                    input,
                    first: calls.next()?,
                    second: calls.next()?,
                })
            })
            .collect();

        let mut results = vec![
            self.check_no_exception(&trial_runs),
            self.check_determinism(&trial_runs),
            self.check_idempotence(
                source,
                entry_point,
                &params,
                signature,
                &trial_runs,
                &mut usage,
            )
            .await,
        ];
        results.extend(
            self.properties
                .iter()
                .map(|property| self.check_predicate(property, &trial_runs)),
        );

        for result in &results {
            info!(
                entry_point,
                property = %result.property,
                outcome = %result.outcome,
                trials = result.trials,
                "property checked"
            );
        }

        debug!(
            entry_point,
            batches = usage.batches,
            peak_memory_bytes = usage.peak_memory_bytes,
            cpu_ms = usage.cpu_time.as_millis() as u64,
            "property batches finished"
        );
        PropertyReport {
            seed,
            trials,
            results,
            usage,
        }
    }

    /// Call the entry point once per input; `Err` explains an incomplete batch
    async fn run_batch(
        &self,
        source: &str,
        entry_point: &str,
        inputs: &[Vec<Value>],
        usage: &mut BatchUsage,
    ) -> Result<Vec<CallOutcome>, String> {
        let run = self
            .sandbox
            .execute(
                ExecutionRequest::new(source)
                    .with_entry_point(entry_point)
                    .with_inputs(inputs),
            )
            .await;
        usage.record(&run);
        complete_calls(run, inputs.len())
    }

    fn check_no_exception(&self, trials: &[Trial]) -> PropertyCheckResult {
        self.evaluate(
            NO_EXCEPTION,
            trials.iter().map(|trial| {
                let failure = match (&trial.first, &trial.second) {
                    (raised @ CallOutcome::Raised { .. }, _)
                    | (_, raised @ CallOutcome::Raised { .. }) => Some(render(raised)),
                    _ => None,
                };
                (trial.input.as_slice(), failure)
            }),
        )
    }

    fn check_determinism(&self, trials: &[Trial]) -> PropertyCheckResult {
        self.evaluate(
            DETERMINISM,
            trials.iter().map(|trial| {
                let failure = (!same_outcome(&trial.first, &trial.second)).then(|| {
                    format!(
                        "first call {}, second call {}",
                        render(&trial.first),
                        render(&trial.second)
                    )
                });
                (trial.input.as_slice(), failure)
            }),
        )
    }

    async fn check_idempotence(
        &self,
        source: &str,
        entry_point: &str,
        params: &[ParamType],
        signature: &CallableSignature,
        trials: &[Trial],
        usage: &mut BatchUsage,
    ) -> PropertyCheckResult {
        let [param] = params else {
            return PropertyCheckResult::skipped(
                IDEMPOTENCE,
                format!("needs exactly one parameter, found {}", params.len()),
            );
        };

        let returned: Vec<(&Trial, &Value)> = trials
            .iter()
            .filter_map(|trial| trial.first.value().map(|value| (trial, value)))
            .collect();

        match signature.returns.as_deref() {
            Some(annotation) => {
                if ParamType::parse(annotation).as_ref() != Some(param) {
                    return PropertyCheckResult::skipped(
                        IDEMPOTENCE,
                        format!("return type '{annotation}' differs from input type '{param}'"),
                    );
                }
            }
            None => {
                if let Some((_, value)) = returned.iter().find(|(_, v)| !param.accepts(v)) {
                    return PropertyCheckResult::skipped(
                        IDEMPOTENCE,
                        format!("output {value} does not have input type '{param}'"),
                    );
                }
            }
        }

        let eligible: Vec<(&Trial, &Value)> = returned
            .into_iter()
            .filter(|(_, value)| param.accepts(value))
            .collect();
        if eligible.is_empty() {
            return PropertyCheckResult::skipped(IDEMPOTENCE, "no call returned a usable value");
        }

        let reapplied: Vec<Vec<Value>> = eligible
            .iter()
            .map(|(_, value)| vec![(*value).clone()])
            .collect();
        let calls = match self.run_batch(source, entry_point, &reapplied, usage).await {
            Ok(calls) => calls,
            Err(detail) => return PropertyCheckResult::error(IDEMPOTENCE, 0, detail),
        };

        self.evaluate(
            IDEMPOTENCE,
            eligible.iter().zip(&calls).map(|((trial, once), twice)| {
                let failure = match twice {
                    CallOutcome::Returned { value } if value == *once => None,
                    CallOutcome::Returned { value } => {
                        Some(format!("f(x) = {once} but f(f(x)) = {value}"))
                    }
                    raised @ CallOutcome::Raised { .. } => {
                        Some(format!("f(x) = {once} but f(f(x)) {}", render(raised)))
                    }
                };
                (trial.input.as_slice(), failure)
            }),
        )
    }

    fn check_predicate(&self, property: &Property, trials: &[Trial]) -> PropertyCheckResult {
        let mut cases = Vec::new();
        for trial in trials {
            let Some(output) = trial.first.value() else {
                continue;
            };
            let verdict = catch_unwind(AssertUnwindSafe(|| {
                (property.predicate)(&trial.input, output)
            }));
            match verdict {
                Ok(true) => cases.push((trial.input.as_slice(), None)),
                Ok(false) => cases.push((
                    trial.input.as_slice(),
                    Some(format!("predicate rejected output {output}")),
                )),
                Err(_) => {
                    return PropertyCheckResult::error(
                        property.name(),
                        cases.len(),
                        "predicate panicked",
                    )
                }
            }
        }
        if cases.is_empty() {
            return PropertyCheckResult::skipped(property.name(), "no call returned a value");
        }
        self.evaluate(property.name(), cases)
    }

    /// Fold per-trial verdicts into a result.
    ///
    /// Stops at the first failure when configured to; otherwise keeps the
    /// smallest distinct counter-examples up to the cap.
    fn evaluate<'t>(
        &self,
        name: &str,
        cases: impl IntoIterator<Item = (&'t [Value], Option<String>)>,
    ) -> PropertyCheckResult {
        let mut found: Vec<CounterExample> = Vec::new();
        let mut trials = 0;
        for (input, failure) in cases {
            trials += 1;
            let Some(observed) = failure else {
                continue;
            };
            if found.iter().any(|c| c.input.as_slice() == input) {
                continue;
            }
            found.push(CounterExample {
                input: input.to_vec(),
                observed,
            });
            if self.config.stop_on_first_violation {
                break;
            }
        }

        if found.is_empty() {
            return PropertyCheckResult::holds(name, trials);
        }
        found.sort_by(|a, b| compare_inputs(&a.input, &b.input));
        found.truncate(self.config.max_counterexamples);
        PropertyCheckResult::violated(name, trials, found)
    }
}

/// Calls of a batch that ran to completion
fn complete_calls(run: ExecutionResult, expected: usize) -> Result<Vec<CallOutcome>, String> {
    if !run.is_usable() {
        let cause = run
            .exception
            .map_or_else(|| "no exception reported".to_string(), |e| e.to_string());
        return Err(format!(
            "sandbox batch ended with {}: {cause}",
            run.classification
        ));
    }
    if run.entry_point_found != Some(true) {
        return Err("entry point not found in batch run".to_string());
    }
    if run.calls.len() != expected {
        return Err(format!(
            "sandbox returned {} of {expected} call outcomes",
            run.calls.len()
        ));
    }
    Ok(run.calls)
}

fn same_outcome(a: &CallOutcome, b: &CallOutcome) -> bool {
    match (a, b) {
        (CallOutcome::Returned { value: x }, CallOutcome::Returned { value: y }) => x == y,
        (
            CallOutcome::Raised { error_type: x, .. },
            CallOutcome::Raised { error_type: y, .. },
        ) => x == y,
        _ => false,
    }
}

fn render(outcome: &CallOutcome) -> String {
    match outcome {
        CallOutcome::Returned { value } => format!("returned {value}"),
        CallOutcome::Raised {
            error_type,
            message,
        } => format!("raised {error_type}: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::prevalidator::PatternRegistry;
    use crate::sandbox::SubprocessSandbox;
    use crate::types::{ExitClassification, ParamSpec, SandboxBackendKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Evaluates the entry point in Rust, recording every batch
    struct FnSandbox {
        f: fn(&[Value]) -> Result<Value, String>,
        batches: Mutex<Vec<usize>>,
    }

    impl FnSandbox {
        fn new(f: fn(&[Value]) -> Result<Value, String>) -> Arc<Self> {
            Arc::new(Self {
                f,
                batches: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Sandbox for FnSandbox {
        async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
            self.batches.lock().unwrap().push(request.inputs.len());
            let mut result = ExecutionResult::aborted(
                SandboxBackendKind::Subprocess,
                ExitClassification::Ok,
                crate::types::ExceptionSummary {
                    error_type: String::new(),
                    message: String::new(),
                    traceback: None,
                },
                Duration::ZERO,
            );
            result.exception = None;
            result.entry_point_found = Some(true);
            result.peak_memory_bytes = Some(request.inputs.len() as u64 * 1000);
            result.cpu_time = Some(Duration::from_millis(5));
            result.calls = request
                .inputs
                .iter()
                .map(|args| match (self.f)(args) {
                    Ok(value) => CallOutcome::Returned { value },
                    Err(message) => CallOutcome::Raised {
                        error_type: "ValueError".to_string(),
                        message,
                    },
                })
                .collect();
            result
        }

        fn backend(&self) -> SandboxBackendKind {
            SandboxBackendKind::Subprocess
        }
    }

    fn signature(params: &[(&str, Option<&str>)], returns: Option<&str>) -> CallableSignature {
        CallableSignature {
            params: params
                .iter()
                .map(|(name, annotation)| ParamSpec {
                    name: (*name).to_string(),
                    annotation: annotation.map(str::to_string),
                    kind: "POSITIONAL_OR_KEYWORD".to_string(),
                    has_default: false,
                })
                .collect(),
            returns: returns.map(str::to_string),
        }
    }

    fn config() -> PropertyTestConfig {
        PropertyTestConfig {
            trials: 30,
            seed: Some(11),
            ..PropertyTestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_abs_battery_holds() {
        let sandbox = FnSandbox::new(|args| Ok(json!(args[0].as_i64().unwrap().abs())));
        let tester = PropertyTester::new(sandbox.clone(), config());
        let report = tester
            .test("", "f", &signature(&[("x", Some("int"))], Some("int")))
            .await;

        assert_eq!(report.seed, 11);
        for name in [NO_EXCEPTION, DETERMINISM, IDEMPOTENCE] {
            assert_eq!(report.result(name).unwrap().outcome, PropertyOutcome::Holds);
        }
        // doubled batch, then the re-application batch
        assert_eq!(*sandbox.batches.lock().unwrap(), vec![60, 30]);
        assert_eq!(report.usage.batches, 2);
        assert_eq!(report.usage.peak_memory_bytes, Some(60_000));
        assert_eq!(report.usage.cpu_time, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_raising_input_is_smallest_counter_example() {
        let sandbox = FnSandbox::new(|args| {
            let n = args[0].as_i64().unwrap();
            if n < 0 {
                Err(format!("negative: {n}"))
            } else {
                Ok(json!(n))
            }
        });
        let config = PropertyTestConfig {
            stop_on_first_violation: false,
            max_counterexamples: 3,
            ..config()
        };
        let report = PropertyTester::new(sandbox, config)
            .test("", "f", &signature(&[("n", None)], None))
            .await;

        let result = report.result(NO_EXCEPTION).unwrap();
        assert_eq!(result.outcome, PropertyOutcome::Violated);
        assert_eq!(result.counter_example, Some(vec![json!(-1)]));
        assert_eq!(result.counter_examples.len(), 3);
        assert_eq!(result.trials, 30);
    }

    #[tokio::test]
    async fn test_stop_on_first_violation() {
        let sandbox = FnSandbox::new(|_| Err("always".to_string()));
        let report = PropertyTester::new(sandbox, config())
            .test("", "f", &signature(&[("n", Some("int"))], None))
            .await;
        let result = report.result(NO_EXCEPTION).unwrap();
        assert_eq!(result.trials, 1);
        assert_eq!(result.counter_examples.len(), 1);
        assert_eq!(
            report.result(IDEMPOTENCE).unwrap().outcome,
            PropertyOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_non_idempotent_increment() {
        let sandbox = FnSandbox::new(|args| Ok(json!(args[0].as_i64().unwrap() + 1)));
        let report = PropertyTester::new(sandbox, config())
            .test("", "f", &signature(&[("n", Some("int"))], Some("int")))
            .await;
        let result = report.result(IDEMPOTENCE).unwrap();
        assert_eq!(result.outcome, PropertyOutcome::Violated);
        assert_eq!(result.counter_example, Some(vec![json!(0)]));
    }

    #[tokio::test]
    async fn test_idempotence_skipped_on_type_change() {
        let sandbox = FnSandbox::new(|args| Ok(json!(args[0].to_string())));
        let report = PropertyTester::new(sandbox, config())
            .test("", "f", &signature(&[("n", Some("int"))], Some("str")))
            .await;
        assert_eq!(
            report.result(IDEMPOTENCE).unwrap().outcome,
            PropertyOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_unsupported_annotation_skips_everything() {
        let sandbox = FnSandbox::new(|_| Ok(Value::Null));
        let tester = PropertyTester::new(sandbox.clone(), config())
            .with_property(Property::new("anything", |_, _| true));
        let report = tester
            .test("", "f", &signature(&[("d", Some("dict[str, int]"))], None))
            .await;

        assert_eq!(report.results.len(), 4);
        assert!(report
            .results
            .iter()
            .all(|r| r.outcome == PropertyOutcome::Skipped));
        assert!(sandbox.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_required_keyword_only_param_skips() {
        let sandbox = FnSandbox::new(|_| Ok(Value::Null));
        let mut sig = signature(&[("a", Some("int")), ("k", Some("int"))], None);
        sig.params[1].kind = "KEYWORD_ONLY".to_string();
        let report = PropertyTester::new(sandbox.clone(), config())
            .test("", "f", &sig)
            .await;

        let result = report.result(NO_EXCEPTION).unwrap();
        assert_eq!(result.outcome, PropertyOutcome::Skipped);
        assert!(result
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("keyword-only parameter 'k'")));
        assert!(sandbox.batches.lock().unwrap().is_empty());

        // an optional keyword-only parameter is left to its default
        sig.params[1].has_default = true;
        let report = PropertyTester::new(sandbox.clone(), config())
            .test("", "f", &sig)
            .await;
        assert_eq!(
            report.result(NO_EXCEPTION).unwrap().outcome,
            PropertyOutcome::Holds
        );
    }

    #[tokio::test]
    async fn test_user_predicate() {
        let sandbox = FnSandbox::new(|args| Ok(json!(args[0].as_i64().unwrap() * 2)));
        let tester = PropertyTester::new(sandbox, config())
            .with_property(Property::new("even", |_, out| out.as_i64().unwrap() % 2 == 0))
            .with_property(Property::new("positive", |_, out| out.as_i64().unwrap() > 0));
        let report = tester
            .test("", "f", &signature(&[("n", Some("int"))], None))
            .await;

        assert_eq!(report.result("even").unwrap().outcome, PropertyOutcome::Holds);
        let positive = report.result("positive").unwrap();
        assert_eq!(positive.outcome, PropertyOutcome::Violated);
        assert_eq!(positive.counter_example, Some(vec![json!(0)]));
    }

    #[tokio::test]
    async fn test_panicking_predicate_is_error() {
        let sandbox = FnSandbox::new(|args| Ok(args[0].clone()));
        let tester = PropertyTester::new(sandbox, config())
            .with_property(Property::new("boom", |_, _| panic!("bad predicate")));
        let report = tester
            .test("", "f", &signature(&[("n", Some("int"))], None))
            .await;
        assert_eq!(report.result("boom").unwrap().outcome, PropertyOutcome::Error);
    }

    #[test]
    fn test_findings_mapping() {
        let report = PropertyReport {
            seed: 3,
            trials: 10,
            results: vec![
                PropertyCheckResult::holds(NO_EXCEPTION, 10),
                PropertyCheckResult::violated(
                    DETERMINISM,
                    4,
                    vec![CounterExample {
                        input: vec![json!(2)],
                        observed: "first call returned 1, second call returned 2".to_string(),
                    }],
                ),
                PropertyCheckResult::skipped(IDEMPOTENCE, "needs exactly one parameter"),
            ],
            usage: BatchUsage::default(),
        };
        let stage = report.to_stage_result(FindingSeverity::Critical, Duration::ZERO);
        assert_eq!(stage.status(), crate::types::StageStatus::Passed);
        let codes: Vec<_> = stage
            .findings()
            .iter()
            .filter_map(|f| f.code.as_deref())
            .collect();
        assert_eq!(
            codes,
            vec!["property-summary", "property-violated", "property-skipped"]
        );
        assert!(stage.findings()[0].message.contains("seed 3"));

        let strict = report.to_stage_result(FindingSeverity::Error, Duration::ZERO);
        assert_eq!(strict.status(), crate::types::StageStatus::Failed);
    }

    fn python_sandbox(timeout: Duration) -> Option<Arc<dyn Sandbox>> {
        let config = SandboxConfig {
            timeout,
            ..SandboxConfig::default()
        };
        if !SubprocessSandbox::is_available(&config) {
            eprintln!("Skipping test: Python not available");
            return None;
        }
        Some(Arc::new(SubprocessSandbox::new(
            config,
            Arc::new(PatternRegistry::default()),
        )))
    }

    #[tokio::test]
    async fn test_sorting_is_idempotent() {
        let Some(sandbox) = python_sandbox(Duration::from_secs(10)) else {
            return;
        };
        let report = PropertyTester::new(sandbox, config())
            .test(
                "def sort_list(xs: list[int]) -> list[int]:\n    return sorted(xs)\n",
                "sort_list",
                &signature(&[("xs", Some("list[int]"))], Some("list[int]")),
            )
            .await;

        for name in [NO_EXCEPTION, DETERMINISM, IDEMPOTENCE] {
            assert_eq!(
                report.result(name).unwrap().outcome,
                PropertyOutcome::Holds,
                "{name}: {:?}",
                report.result(name)
            );
        }
    }

    #[tokio::test]
    async fn test_unseeded_random_is_not_deterministic() {
        let Some(sandbox) = python_sandbox(Duration::from_secs(10)) else {
            return;
        };
        let code = "import random\n\ndef noisy(n: int) -> float:\n    return n + random.random()\n";
        let report = PropertyTester::new(sandbox, config())
            .test(
                code,
                "noisy",
                &signature(&[("n", Some("int"))], Some("float")),
            )
            .await;

        let determinism = report.result(DETERMINISM).unwrap();
        assert_eq!(determinism.outcome, PropertyOutcome::Violated);
        assert!(determinism.counter_example.is_some());
    }

    #[tokio::test]
    async fn test_timed_out_batch_is_error() {
        let Some(sandbox) = python_sandbox(Duration::from_millis(500)) else {
            return;
        };
        let code = "def hang(n: int) -> int:\n    while True:\n        pass\n";
        let report = PropertyTester::new(sandbox, config())
            .test(code, "hang", &signature(&[("n", Some("int"))], Some("int")))
            .await;
        assert!(report
            .results
            .iter()
            .all(|r| r.outcome == PropertyOutcome::Error));
    }
}
