//! Subprocess backend: a fresh interpreter per run, in its own process group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::harness::{Enforcement, HarnessJob, HarnessReport, HARNESS};
use super::process::{run_supervised, Reaper, Supervised};
use super::{
    failure, interpreter_available, timeout_result, ExecutionRequest, Sandbox, SandboxError,
    SandboxLifecycle,
};
use crate::config::SandboxConfig;
use crate::prevalidator::PatternRegistry;
use crate::types::{ExceptionSummary, ExecutionResult, ExitClassification, SandboxBackendKind};

/// Grace period on top of the configured timeout for interpreter start-up
const STARTUP_GRACE: Duration = Duration::from_millis(500);

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// Runs code in `python3 -I` with a cleared environment and `setrlimit` ceilings
#[derive(Clone, Debug)]
pub struct SubprocessSandbox {
    config: SandboxConfig,
    patterns: Arc<PatternRegistry>,
}

impl SubprocessSandbox {
    /// Create a subprocess sandbox
    #[must_use]
    pub fn new(config: SandboxConfig, patterns: Arc<PatternRegistry>) -> Self {
        Self { config, patterns }
    }

    /// Whether the configured interpreter can be started
    #[must_use]
    pub fn is_available(config: &SandboxConfig) -> bool {
        interpreter_available(&config.interpreter)
    }

    async fn run(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        let job = HarnessJob::new(request, &self.config, &self.patterns, Enforcement::Rlimits);
        let scratch = tempfile::tempdir()?;

        let mut command = Command::new(&self.config.interpreter);
        command
            .args(["-I", "-c", HARNESS])
            .env_clear()
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .current_dir(scratch.path());
        #[cfg(unix)]
        command.process_group(0);

        let supervised = run_supervised(
            command,
            job.to_json()?.into_bytes(),
            self.config.timeout.saturating_add(STARTUP_GRACE),
            report_read_cap(&self.config),
            Reaper::ProcessGroup,
        )
        .await?;

        Ok(classify(
            SandboxBackendKind::Subprocess,
            &self.config,
            &supervised,
        ))
    }
}

/// Room for the report, which embeds both capped output streams
pub(crate) fn report_read_cap(config: &SandboxConfig) -> usize {
    config
        .output_limit_bytes
        .saturating_mul(8)
        .saturating_add(1024 * 1024)
}

/// Map a finished child to a result.
///
/// The watchdog and kernel signals take precedence over the harness report.
pub(crate) fn classify(
    backend: SandboxBackendKind,
    config: &SandboxConfig,
    supervised: &Supervised,
) -> ExecutionResult {
    if supervised.timed_out() {
        return timeout_result(backend, config.timeout, supervised.wall_time);
    }

    if supervised.signal() == Some(SIGXCPU) {
        return timeout_result(backend, config.timeout, supervised.wall_time);
    }

    if let Some(report) = HarnessReport::from_stdout(&supervised.stdout_text()) {
        let classification = match report.classification() {
            ExitClassification::Ok if supervised.exit_code() != Some(0) => {
                ExitClassification::RuntimeError
            }
            other => other,
        };
        let mut result = report.into_result(backend, classification, supervised.wall_time);
        result.output_truncated |= supervised.truncated;
        return result;
    }

    // SIGKILL without the watchdog firing is the kernel OOM killer
    let classification = if supervised.exit_code() == Some(137)
        || supervised.signal() == Some(SIGKILL)
        || supervised.stderr_tail().contains("MemoryError")
    {
        ExitClassification::Oom
    } else {
        ExitClassification::RuntimeError
    };
    let status = supervised
        .status
        .map_or_else(|| "no status".to_string(), |s| s.to_string());

    warn!(%backend, %status, "sandbox produced no harness report");
    ExecutionResult::aborted(
        backend,
        classification,
        ExceptionSummary {
            error_type: if classification == ExitClassification::Oom {
                "MemoryError".to_string()
            } else {
                "SandboxExit".to_string()
            },
            message: format!(
                "interpreter exited ({status}) without a report: {}",
                supervised.stderr_tail()
            ),
            traceback: None,
        },
        supervised.wall_time,
    )
}

#[async_trait]
impl Sandbox for SubprocessSandbox {
    async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
        let start = Instant::now();
        let mut lifecycle = SandboxLifecycle::new(SandboxBackendKind::Subprocess);
        if let Err(e) = lifecycle.start() {
            return failure(SandboxBackendKind::Subprocess, &e, start.elapsed());
        }

        let result = match self.run(&request).await {
            Ok(result) => result,
            Err(e) => failure(SandboxBackendKind::Subprocess, &e, start.elapsed()),
        };
        let result = lifecycle.seal(result);

        info!(
            backend = "subprocess",
            classification = %result.classification,
            elapsed_ms = result.wall_time.as_millis() as u64,
            "sandbox run finished"
        );
        result
    }

    fn backend(&self) -> SandboxBackendKind {
        SandboxBackendKind::Subprocess
    }
}
