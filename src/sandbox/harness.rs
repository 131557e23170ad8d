//! The Python harness shared by every backend.
//!
//! Rust and the harness exchange JSON only: a [`HarnessJob`] goes in on stdin
//! (or as the argument of `run_job` when embedded) and a [`HarnessReport`]
//! comes back after the [`SENTINEL`] marker.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ExecutionRequest;
use crate::config::{FilesystemPolicy, NetworkPolicy, SandboxConfig};
use crate::prevalidator::{PatternRegistry, NETWORK_MODULES};
use crate::types::{
    CallOutcome, CallableSignature, ExceptionSummary, ExecutionResult, ExitClassification,
    SandboxBackendKind,
};

/// Harness source, run with `python3 -I -c` or loaded as a module
pub(crate) const HARNESS: &str = include_str!("harness.py");

/// Marker preceding the JSON report on the harness's stdout
pub(crate) const SENTINEL: &str = "__SANDBOX_RESULT__";

/// How the harness enforces limits for a given backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Enforcement {
    /// `setrlimit` inside the child before user code runs
    Rlimits,
    /// Trace-hook deadline and `tracemalloc` ceiling
    Cooperative,
}

/// Job description sent to the harness
#[derive(Debug, Serialize)]
pub(crate) struct HarnessJob<'a> {
    source: &'a str,
    entry_point: Option<&'a str>,
    inputs: &'a [Vec<Value>],
    timeout_seconds: f64,
    memory_limit_bytes: u64,
    cpu_seconds: u64,
    apply_rlimits: bool,
    cooperative: bool,
    read_only_fs: bool,
    output_cap_bytes: usize,
    forbidden_modules: Vec<&'a str>,
    forbidden_builtins: Vec<&'a str>,
}

impl<'a> HarnessJob<'a> {
    pub(crate) fn new(
        request: &ExecutionRequest<'a>,
        config: &SandboxConfig,
        patterns: &'a PatternRegistry,
        enforcement: Enforcement,
    ) -> Self {
        let mut forbidden_modules: Vec<&'a str> = patterns.modules().collect();
        if config.network == NetworkPolicy::Disabled {
            forbidden_modules.extend(NETWORK_MODULES.iter().copied());
            forbidden_modules.sort_unstable();
            forbidden_modules.dedup();
        }

        Self {
            source: request.source,
            entry_point: request.entry_point,
            inputs: request.inputs,
            timeout_seconds: config.timeout.as_secs_f64(),
            memory_limit_bytes: config.max_memory_bytes,
            // CPU time is a backstop behind the wall-clock watchdog
            cpu_seconds: config.timeout.as_secs().saturating_add(1),
            apply_rlimits: enforcement == Enforcement::Rlimits,
            cooperative: enforcement == Enforcement::Cooperative,
            read_only_fs: config.filesystem == FilesystemPolicy::ReadOnly,
            output_cap_bytes: config.output_limit_bytes,
            forbidden_modules,
            forbidden_builtins: patterns.builtin_callables().collect(),
        }
    }

    pub(crate) fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HarnessStatus {
    Ok,
    RuntimeError,
    SyntaxError,
    Forbidden,
    Oom,
    Timeout,
}

/// Report produced by the harness
#[derive(Debug, Deserialize)]
pub(crate) struct HarnessReport {
    status: HarnessStatus,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    output_truncated: bool,
    return_value: Option<Value>,
    exception: Option<ExceptionSummary>,
    signature: Option<CallableSignature>,
    entry_point_found: Option<bool>,
    #[serde(default)]
    calls: Vec<CallOutcome>,
    peak_memory_bytes: Option<u64>,
    #[serde(default)]
    cpu_seconds: Option<f64>,
    #[serde(default)]
    violations: Vec<String>,
}

impl HarnessReport {
    /// Parse the report from the harness's stdout; the last sentinel line wins
    pub(crate) fn from_stdout(stdout: &str) -> Option<Self> {
        stdout
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(SENTINEL))
            .and_then(|json| serde_json::from_str(json).ok())
    }

    /// Parse the string returned by the embedded `run_job`
    pub(crate) fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Classification claimed by the harness.
    ///
    /// A recorded violation wins even if user code swallowed the exception.
    pub(crate) fn classification(&self) -> ExitClassification {
        if !self.violations.is_empty() {
            return ExitClassification::ForbiddenOperation;
        }
        match self.status {
            HarnessStatus::Ok => ExitClassification::Ok,
            HarnessStatus::RuntimeError | HarnessStatus::SyntaxError => {
                ExitClassification::RuntimeError
            }
            HarnessStatus::Forbidden => ExitClassification::ForbiddenOperation,
            HarnessStatus::Oom => ExitClassification::Oom,
            HarnessStatus::Timeout => ExitClassification::Timeout,
        }
    }

    pub(crate) fn into_result(
        self,
        backend: SandboxBackendKind,
        classification: ExitClassification,
        wall_time: Duration,
    ) -> ExecutionResult {
        let exception = match (self.exception, self.violations.last()) {
            (Some(exception), _) => Some(exception),
            (None, Some(violation)) => Some(ExceptionSummary {
                error_type: "ForbiddenOperation".to_string(),
                message: violation.clone(),
                traceback: None,
            }),
            (None, None) => None,
        };

        ExecutionResult {
            backend,
            classification,
            state: classification.terminal_state(),
            stdout: self.stdout,
            stderr: self.stderr,
            output_truncated: self.output_truncated,
            return_value: self.return_value,
            exception,
            signature: self.signature,
            entry_point_found: self.entry_point_found,
            calls: self.calls,
            wall_time,
            peak_memory_bytes: self.peak_memory_bytes,
            cpu_time: self
                .cpu_seconds
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        }
    }
}
