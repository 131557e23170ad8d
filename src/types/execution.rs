//! Sandbox execution results.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{serde_millis, serde_millis_opt};

/// Which sandbox backend ran (or should run) the code
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackendKind {
    /// In-process restricted interpreter (weakest boundary)
    Restricted,
    /// Separate OS process with resource limits
    #[default]
    Subprocess,
    /// Ephemeral container with network and filesystem isolation
    Container,
}

impl SandboxBackendKind {
    /// Backend name used in logs and reports
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Subprocess => "subprocess",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a sandbox invocation ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitClassification {
    /// Code ran to completion
    Ok,
    /// Wall-clock (or CPU) limit hit
    Timeout,
    /// Memory ceiling hit
    Oom,
    /// Code raised, or the harness could not run it
    RuntimeError,
    /// Code attempted a blocked import or builtin
    ForbiddenOperation,
}

impl ExitClassification {
    /// Terminal sandbox state for this classification
    #[must_use]
    pub const fn terminal_state(&self) -> SandboxState {
        match self {
            Self::Ok => SandboxState::Completed,
            Self::Timeout => SandboxState::TimedOut,
            Self::Oom => SandboxState::ResourceExceeded,
            Self::RuntimeError | Self::ForbiddenOperation => SandboxState::Crashed,
        }
    }

    /// Upper-case label used in findings
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Timeout => "TIMEOUT",
            Self::Oom => "OOM",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::ForbiddenOperation => "FORBIDDEN_OPERATION",
        }
    }
}

impl fmt::Display for ExitClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle state shared by all backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    /// Created, not started
    Ready,
    /// Code is executing
    Running,
    /// Finished normally
    Completed,
    /// Killed by the watchdog
    TimedOut,
    /// Memory ceiling exceeded
    ResourceExceeded,
    /// Raised, violated policy, or the backend failed
    Crashed,
}

impl SandboxState {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ready | Self::Running)
    }
}

/// Summary of an exception raised by the sandboxed code
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionSummary {
    /// Exception class name
    pub error_type: String,
    /// `str()` of the exception
    pub message: String,
    /// Formatted traceback, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl fmt::Display for ExceptionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.error_type)
        } else {
            write!(f, "{}: {}", self.error_type, self.message)
        }
    }
}

/// Result of calling the entry point with one argument tuple
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The call returned a value
    Returned {
        /// JSON rendering of the returned value
        value: Value,
    },
    /// The call raised
    Raised {
        /// Exception class name
        error_type: String,
        /// `str()` of the exception
        message: String,
    },
}

impl CallOutcome {
    /// The returned value, if the call returned
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        match self {
            Self::Returned { value } => Some(value),
            Self::Raised { .. } => None,
        }
    }
}

/// One declared parameter of the entry point
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Annotation rendered as text (`int`, `list[int]`, ...)
    #[serde(default)]
    pub annotation: Option<String>,
    /// `inspect.Parameter.kind` name
    pub kind: String,
    /// Whether the parameter has a default value
    #[serde(default)]
    pub has_default: bool,
}

impl ParamSpec {
    /// Whether the parameter can be filled positionally
    #[must_use]
    pub fn is_positional(&self) -> bool {
        matches!(
            self.kind.as_str(),
            "POSITIONAL_ONLY" | "POSITIONAL_OR_KEYWORD"
        )
    }
}

/// Declared signature of the entry point
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallableSignature {
    /// Parameters in declaration order
    pub params: Vec<ParamSpec>,
    /// Return annotation rendered as text
    #[serde(default)]
    pub returns: Option<String>,
}

/// Everything one sandbox invocation produced
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Backend that ran the code
    pub backend: SandboxBackendKind,
    /// Exit classification
    pub classification: ExitClassification,
    /// Terminal lifecycle state
    pub state: SandboxState,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Whether captured output was cut at the configured cap
    pub output_truncated: bool,
    /// Value returned by the first entry-point call, if any
    pub return_value: Option<Value>,
    /// Exception raised while loading the code, if any
    pub exception: Option<ExceptionSummary>,
    /// Entry-point signature, when an entry point was requested and found
    pub signature: Option<CallableSignature>,
    /// Whether the requested entry point exists (`None` if none requested)
    pub entry_point_found: Option<bool>,
    /// One outcome per supplied argument tuple, in order
    pub calls: Vec<CallOutcome>,
    /// Wall-clock time of the invocation
    #[serde(with = "serde_millis")]
    pub wall_time: Duration,
    /// Peak memory, when the backend can measure it
    pub peak_memory_bytes: Option<u64>,
    /// CPU time consumed by the harness, when reported
    #[serde(default, with = "serde_millis_opt")]
    pub cpu_time: Option<Duration>,
}

impl ExecutionResult {
    /// A result for an invocation that never produced harness output
    #[must_use]
    pub fn aborted(
        backend: SandboxBackendKind,
        classification: ExitClassification,
        exception: ExceptionSummary,
        wall_time: Duration,
    ) -> Self {
        Self {
            backend,
            classification,
            state: classification.terminal_state(),
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            return_value: None,
            exception: Some(exception),
            signature: None,
            entry_point_found: None,
            calls: Vec::new(),
            wall_time,
            peak_memory_bytes: None,
            cpu_time: None,
        }
    }

    /// Only a completed, error-free run yields values usable downstream
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.state == SandboxState::Completed && self.classification == ExitClassification::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert_eq!(ExitClassification::Ok.terminal_state(), SandboxState::Completed);
        assert_eq!(ExitClassification::Timeout.terminal_state(), SandboxState::TimedOut);
        assert_eq!(
            ExitClassification::Oom.terminal_state(),
            SandboxState::ResourceExceeded
        );
        assert_eq!(
            ExitClassification::ForbiddenOperation.terminal_state(),
            SandboxState::Crashed
        );
        assert!(!SandboxState::Running.is_terminal());
    }

    #[test]
    fn test_aborted_is_not_usable() {
        let result = ExecutionResult::aborted(
            SandboxBackendKind::Subprocess,
            ExitClassification::Timeout,
            ExceptionSummary {
                error_type: "Timeout".to_string(),
                message: "exceeded 1s".to_string(),
                traceback: None,
            },
            Duration::from_secs(1),
        );
        assert!(!result.is_usable());
        assert_eq!(result.state, SandboxState::TimedOut);
    }

    #[test]
    fn test_call_outcome_wire_format() {
        let raw = r#"{"outcome":"raised","error_type":"ValueError","message":"bad"}"#;
        let outcome: CallOutcome = serde_json::from_str(raw).unwrap();
        assert!(outcome.value().is_none());

        let raw = r#"{"outcome":"returned","value":[1,2]}"#;
        let outcome: CallOutcome = serde_json::from_str(raw).unwrap();
        assert_eq!(outcome.value(), Some(&serde_json::json!([1, 2])));
    }
}
