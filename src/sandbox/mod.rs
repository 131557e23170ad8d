//! Isolated execution of untrusted Python.
//!
//! Three backends share one lifecycle and one harness:
//! - [`RestrictedSandbox`]: in-process restricted interpreter (weakest)
//! - [`SubprocessSandbox`]: separate process with OS resource limits
//! - [`ContainerSandbox`]: ephemeral container, no network, read-only root
//!
//! Backends never return errors for things the code under test does; every
//! outcome is an [`ExecutionResult`]. [`SandboxError`] covers failures of the
//! sandbox machinery itself, which surface as `RuntimeError` results.

mod container;
mod harness;
mod process;
mod restricted;
mod subprocess;

pub use container::ContainerSandbox;
pub use restricted::RestrictedSandbox;
pub use subprocess::SubprocessSandbox;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::SandboxConfig;
use crate::prevalidator::PatternRegistry;
use crate::types::{
    ExceptionSummary, ExecutionResult, ExitClassification, SandboxBackendKind, SandboxState,
};

/// Sandbox machinery errors
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Interpreter or container runtime binary not found
    #[error("interpreter '{0}' not found")]
    InterpreterNotFound(String),

    /// Child process could not be spawned
    #[error("failed to spawn sandbox process: {0}")]
    Spawn(std::io::Error),

    /// I/O with the child failed
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Job could not be encoded
    #[error("failed to encode harness job: {0}")]
    Encode(#[from] serde_json::Error),

    /// The harness produced no usable report
    #[error("harness protocol error: {0}")]
    Protocol(String),

    /// Embedded interpreter failure
    #[error("embedded interpreter error: {0}")]
    Embedded(String),

    /// A previous run was abandoned and the embedded interpreter may be compromised
    #[error("embedded interpreter poisoned by an abandoned run")]
    Poisoned,

    /// Illegal lifecycle transition
    #[error("invalid sandbox transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: SandboxState,
        /// Requested state
        to: SandboxState,
    },
}

/// What to run in the sandbox
#[derive(Clone, Copy, Debug)]
pub struct ExecutionRequest<'a> {
    /// Source text
    pub source: &'a str,
    /// Function to introspect and call after the module body runs
    pub entry_point: Option<&'a str>,
    /// Positional argument tuples, one call each
    pub inputs: &'a [Vec<Value>],
}

impl<'a> ExecutionRequest<'a> {
    /// Run the module body only
    #[must_use]
    pub const fn new(source: &'a str) -> Self {
        Self {
            source,
            entry_point: None,
            inputs: &[],
        }
    }

    /// Introspect (and call) a function after the module body runs
    #[must_use]
    pub const fn with_entry_point(mut self, entry_point: &'a str) -> Self {
        self.entry_point = Some(entry_point);
        self
    }

    /// Call the entry point once per argument tuple
    #[must_use]
    pub const fn with_inputs(mut self, inputs: &'a [Vec<Value>]) -> Self {
        self.inputs = inputs;
        self
    }
}

/// A sandbox backend
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run the request; always yields a terminal result
    async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionResult;

    /// Which backend this is
    fn backend(&self) -> SandboxBackendKind;
}

/// Lifecycle shared by all backends: `Ready -> Running -> terminal`
#[derive(Debug)]
pub struct SandboxLifecycle {
    backend: SandboxBackendKind,
    state: SandboxState,
}

impl SandboxLifecycle {
    /// A sandbox invocation that has not started
    #[must_use]
    pub const fn new(backend: SandboxBackendKind) -> Self {
        Self {
            backend,
            state: SandboxState::Ready,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SandboxState {
        self.state
    }

    /// `Ready -> Running`
    ///
    /// # Errors
    /// Returns error if the invocation already started
    pub fn start(&mut self) -> Result<(), SandboxError> {
        self.transition(SandboxState::Running)
    }

    /// `Running -> terminal`
    ///
    /// # Errors
    /// Returns error if the invocation is not running
    pub fn finish(&mut self, classification: ExitClassification) -> Result<SandboxState, SandboxError> {
        let terminal = classification.terminal_state();
        self.transition(terminal)?;
        Ok(terminal)
    }

    fn transition(&mut self, to: SandboxState) -> Result<(), SandboxError> {
        let legal = match (self.state, to) {
            (SandboxState::Ready, SandboxState::Running) => true,
            (SandboxState::Running, next) => next.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(SandboxError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(backend = %self.backend, from = ?self.state, ?to, "sandbox transition");
        self.state = to;
        Ok(())
    }

    /// Seal a backend's result; its state always matches its classification
    pub(crate) fn seal(mut self, mut result: ExecutionResult) -> ExecutionResult {
        match self.finish(result.classification) {
            Ok(state) => {
                result.state = state;
                result
            }
            Err(e) => failure(self.backend, &e, result.wall_time),
        }
    }
}

/// Result for a failure of the sandbox machinery
pub(crate) fn failure(
    backend: SandboxBackendKind,
    error: &SandboxError,
    wall_time: Duration,
) -> ExecutionResult {
    ExecutionResult::aborted(
        backend,
        ExitClassification::RuntimeError,
        ExceptionSummary {
            error_type: "SandboxError".to_string(),
            message: error.to_string(),
            traceback: None,
        },
        wall_time,
    )
}

/// Result for an invocation killed by the watchdog
pub(crate) fn timeout_result(
    backend: SandboxBackendKind,
    limit: Duration,
    wall_time: Duration,
) -> ExecutionResult {
    ExecutionResult::aborted(
        backend,
        ExitClassification::Timeout,
        ExceptionSummary {
            error_type: "Timeout".to_string(),
            message: format!("execution exceeded {:.3}s", limit.as_secs_f64()),
            traceback: None,
        },
        wall_time,
    )
}

/// Build the configured backend
#[must_use]
pub fn build_sandbox(
    kind: SandboxBackendKind,
    config: SandboxConfig,
    patterns: Arc<PatternRegistry>,
) -> Arc<dyn Sandbox> {
    match kind {
        SandboxBackendKind::Restricted => Arc::new(RestrictedSandbox::new(config, patterns)),
        SandboxBackendKind::Subprocess => Arc::new(SubprocessSandbox::new(config, patterns)),
        SandboxBackendKind::Container => Arc::new(ContainerSandbox::new(config, patterns)),
    }
}

/// Whether `program --version` runs successfully
#[must_use]
pub fn interpreter_available(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut lifecycle = SandboxLifecycle::new(SandboxBackendKind::Subprocess);
        assert_eq!(lifecycle.state(), SandboxState::Ready);
        lifecycle.start().unwrap();
        assert!(lifecycle.start().is_err());
        assert_eq!(
            lifecycle.finish(ExitClassification::Timeout).unwrap(),
            SandboxState::TimedOut
        );
        assert!(lifecycle.finish(ExitClassification::Ok).is_err());
    }

    #[test]
    fn test_cannot_finish_before_start() {
        let mut lifecycle = SandboxLifecycle::new(SandboxBackendKind::Container);
        assert!(matches!(
            lifecycle.finish(ExitClassification::Ok),
            Err(SandboxError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_build_sandbox_kinds() {
        let patterns = Arc::new(PatternRegistry::default());
        for kind in [
            SandboxBackendKind::Restricted,
            SandboxBackendKind::Subprocess,
            SandboxBackendKind::Container,
        ] {
            let sandbox = build_sandbox(kind, SandboxConfig::default(), Arc::clone(&patterns));
            assert_eq!(sandbox.backend(), kind);
        }
    }

    #[test]
    fn test_request_builder() {
        let inputs = vec![vec![serde_json::json!(1)]];
        let request = ExecutionRequest::new("def f(x): return x")
            .with_entry_point("f")
            .with_inputs(&inputs);
        assert_eq!(request.entry_point, Some("f"));
        assert_eq!(request.inputs.len(), 1);
    }
}
