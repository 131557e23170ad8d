//! Restricted backend: the weakest isolation level.
//!
//! User code runs with a curated builtins table and a guarded `__import__`.
//! Limits are cooperative: a trace hook enforces the deadline and
//! `tracemalloc` the memory ceiling, so code stuck inside a C call can
//! overrun both. Use it only for code that already passed prevalidation.
//!
//! With the `embedded-python` feature the harness runs inside this process
//! through `PyO3`. Without it, a plain interpreter child runs the same
//! harness with the same cooperative limits and no OS ceilings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::info;

use super::harness::{Enforcement, HarnessJob};
use super::{failure, ExecutionRequest, Sandbox, SandboxError, SandboxLifecycle};
use crate::config::SandboxConfig;
use crate::prevalidator::PatternRegistry;
use crate::types::{ExecutionResult, SandboxBackendKind};

/// Slack for the cooperative deadline before the worker is abandoned
const HARD_GRACE: Duration = Duration::from_secs(1);

/// Runs code under a restricted builtins table
#[derive(Clone, Debug)]
pub struct RestrictedSandbox {
    config: SandboxConfig,
    patterns: Arc<PatternRegistry>,
}

impl RestrictedSandbox {
    /// Create a restricted sandbox
    #[must_use]
    pub fn new(config: SandboxConfig, patterns: Arc<PatternRegistry>) -> Self {
        Self { config, patterns }
    }

    /// Whether this backend can run
    #[must_use]
    pub fn is_available(config: &SandboxConfig) -> bool {
        #[cfg(feature = "embedded-python")]
        {
            let _ = config;
            !embedded::is_poisoned()
        }
        #[cfg(not(feature = "embedded-python"))]
        {
            super::interpreter_available(&config.interpreter)
        }
    }

    #[cfg(feature = "embedded-python")]
    async fn run(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        let job = HarnessJob::new(
            request,
            &self.config,
            &self.patterns,
            Enforcement::Cooperative,
        )
        .to_json()?;
        let hard_limit = self.config.timeout.saturating_add(HARD_GRACE);
        embedded::run(job, self.config.timeout, hard_limit).await
    }

    #[cfg(not(feature = "embedded-python"))]
    async fn run(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        use super::harness::HARNESS;
        use super::process::{run_supervised, Reaper};
        use super::subprocess::{classify, report_read_cap};
        use tokio::process::Command;

        let job = HarnessJob::new(
            request,
            &self.config,
            &self.patterns,
            Enforcement::Cooperative,
        );
        let mut command = Command::new(&self.config.interpreter);
        command
            .args(["-I", "-c", HARNESS])
            .env_clear()
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8");

        let supervised = run_supervised(
            command,
            job.to_json()?.into_bytes(),
            self.config.timeout.saturating_add(HARD_GRACE),
            report_read_cap(&self.config),
            Reaper::Child,
        )
        .await?;

        Ok(classify(
            SandboxBackendKind::Restricted,
            &self.config,
            &supervised,
        ))
    }
}

#[cfg(feature = "embedded-python")]
mod embedded {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use pyo3::prelude::*;
    use tracing::{error, warn};

    use super::super::harness::{HarnessReport, HARNESS};
    use super::super::{timeout_result, SandboxError};
    use crate::types::{ExecutionResult, SandboxBackendKind};

    /// `sys.stdout` and `sys.settrace` are interpreter-global
    static EMBEDDED: Mutex<()> = Mutex::new(());

    /// Set once a worker has been abandoned mid-run
    static POISONED: AtomicBool = AtomicBool::new(false);

    pub(super) fn is_poisoned() -> bool {
        POISONED.load(Ordering::SeqCst)
    }

    fn run_blocking(job: &str) -> Result<String, SandboxError> {
        let _lock = EMBEDDED.lock().map_err(|_| SandboxError::Poisoned)?;
        Python::with_gil(|py| -> PyResult<String> {
            let module =
                PyModule::from_code(py, HARNESS, "codegate_harness.py", "codegate_harness")?;
            module.getattr("run_job")?.call1((job,))?.extract()
        })
        .map_err(|e| SandboxError::Embedded(e.to_string()))
    }

    pub(super) async fn run(
        job: String,
        timeout: Duration,
        hard_limit: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        if is_poisoned() {
            return Err(SandboxError::Poisoned);
        }

        let start = Instant::now();
        let worker = tokio::task::spawn_blocking(move || run_blocking(&job));

        match tokio::time::timeout(hard_limit, worker).await {
            Ok(Ok(output)) => {
                let report = HarnessReport::from_json(&output?)
                    .map_err(|e| SandboxError::Protocol(e.to_string()))?;
                let classification = report.classification();
                Ok(report.into_result(
                    SandboxBackendKind::Restricted,
                    classification,
                    start.elapsed(),
                ))
            }
            Ok(Err(join_error)) => {
                error!(error = %join_error, "embedded worker panicked");
                POISONED.store(true, Ordering::SeqCst);
                Err(SandboxError::Embedded(join_error.to_string()))
            }
            Err(_) => {
                // The thread cannot be killed; it keeps the GIL until user code yields
                warn!(limit = ?hard_limit, "abandoning embedded worker");
                POISONED.store(true, Ordering::SeqCst);
                Ok(timeout_result(
                    SandboxBackendKind::Restricted,
                    timeout,
                    start.elapsed(),
                ))
            }
        }
    }
}

#[async_trait]
impl Sandbox for RestrictedSandbox {
    async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
        let start = Instant::now();
        let mut lifecycle = SandboxLifecycle::new(SandboxBackendKind::Restricted);
        if let Err(e) = lifecycle.start() {
            return failure(SandboxBackendKind::Restricted, &e, start.elapsed());
        }

        let result = match self.run(&request).await {
            Ok(result) => result,
            Err(e) => failure(SandboxBackendKind::Restricted, &e, start.elapsed()),
        };
        let result = lifecycle.seal(result);

        info!(
            backend = "restricted",
            classification = %result.classification,
            elapsed_ms = result.wall_time.as_millis() as u64,
            "sandbox run finished"
        );
        result
    }

    fn backend(&self) -> SandboxBackendKind {
        SandboxBackendKind::Restricted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitClassification;
    use serde_json::json;

    fn sandbox(timeout: Duration) -> Option<RestrictedSandbox> {
        let config = SandboxConfig {
            timeout,
            ..SandboxConfig::default()
        };
        if !RestrictedSandbox::is_available(&config) {
            eprintln!("Skipping test: Python not available");
            return None;
        }
        Some(RestrictedSandbox::new(
            config,
            Arc::new(PatternRegistry::default()),
        ))
    }

    #[tokio::test]
    async fn test_calls_entry_point() {
        let Some(sandbox) = sandbox(Duration::from_secs(5)) else {
            return;
        };
        let inputs = vec![vec![json!([3, 1, 2])]];
        let result = sandbox
            .execute(
                ExecutionRequest::new("def f(xs):\n    return sorted(xs)\n")
                    .with_entry_point("f")
                    .with_inputs(&inputs),
            )
            .await;

        assert_eq!(result.classification, ExitClassification::Ok, "{result:?}");
        assert_eq!(result.backend, SandboxBackendKind::Restricted);
        assert_eq!(result.return_value, Some(json!([1, 2, 3])));
        assert!(result.peak_memory_bytes.is_some());
    }

    #[tokio::test]
    async fn test_cooperative_deadline() {
        let Some(sandbox) = sandbox(Duration::from_millis(300)) else {
            return;
        };
        let code = "def spin():\n    while True:\n        pass\nspin()\n";
        let result = sandbox.execute(ExecutionRequest::new(code)).await;
        assert_eq!(result.classification, ExitClassification::Timeout);
    }

    #[tokio::test]
    async fn test_forbidden_module_blocked() {
        let Some(sandbox) = sandbox(Duration::from_secs(5)) else {
            return;
        };
        let result = sandbox
            .execute(ExecutionRequest::new("import subprocess\n"))
            .await;
        assert_eq!(result.classification, ExitClassification::ForbiddenOperation);
    }

    #[tokio::test]
    async fn test_network_module_blocked_when_disabled() {
        let Some(sandbox) = sandbox(Duration::from_secs(5)) else {
            return;
        };
        let result = sandbox.execute(ExecutionRequest::new("import socket\n")).await;
        assert_eq!(result.classification, ExitClassification::ForbiddenOperation);
    }

    #[tokio::test]
    async fn test_output_is_captured_and_capped() {
        let config = SandboxConfig {
            output_limit_bytes: 16,
            ..SandboxConfig::default()
        };
        if !RestrictedSandbox::is_available(&config) {
            eprintln!("Skipping test: Python not available");
            return;
        }
        let sandbox = RestrictedSandbox::new(config, Arc::new(PatternRegistry::default()));
        let result = sandbox
            .execute(ExecutionRequest::new("print('x' * 100)\n"))
            .await;
        assert_eq!(result.classification, ExitClassification::Ok);
        assert_eq!(result.stdout.len(), 16);
        assert!(result.output_truncated);
    }

    #[tokio::test]
    async fn test_output_cap_counts_bytes() {
        let config = SandboxConfig {
            output_limit_bytes: 15,
            ..SandboxConfig::default()
        };
        if !RestrictedSandbox::is_available(&config) {
            eprintln!("Skipping test: Python not available");
            return;
        }
        let sandbox = RestrictedSandbox::new(config, Arc::new(PatternRegistry::default()));
        let result = sandbox
            .execute(ExecutionRequest::new("print('\\u00e9' * 100)\n"))
            .await;
        assert_eq!(result.classification, ExitClassification::Ok);
        // a two-byte character is never split across the cap
        assert_eq!(result.stdout, "\u{e9}".repeat(7));
        assert_eq!(result.stdout.len(), 14);
        assert!(result.output_truncated);
    }
}
