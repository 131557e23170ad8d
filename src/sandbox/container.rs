//! Container backend: one ephemeral, hardened container per run.
//!
//! The container gets no network, a read-only root, a size-limited tmpfs
//! scratch mount, memory / CPU / PID ceilings, no capabilities and an
//! unprivileged user. The image should be pulled ahead of time; a pull
//! counts against the run's timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::harness::{Enforcement, HarnessJob, HARNESS};
use super::process::{run_supervised, Reaper};
use super::subprocess::{classify, report_read_cap};
use super::{failure, ExecutionRequest, Sandbox, SandboxError, SandboxLifecycle};
use crate::config::{FilesystemPolicy, NetworkPolicy, SandboxConfig};
use crate::prevalidator::PatternRegistry;
use crate::types::{ExecutionResult, SandboxBackendKind};

/// Allowance for container creation on top of the configured timeout
const STARTUP_GRACE: Duration = Duration::from_secs(3);

const SCRATCH_DIR: &str = "/scratch";
const NOBODY: &str = "65534:65534";

/// Runs code via `docker run --rm` (or a compatible runtime)
#[derive(Clone, Debug)]
pub struct ContainerSandbox {
    config: SandboxConfig,
    patterns: Arc<PatternRegistry>,
}

impl ContainerSandbox {
    /// Create a container sandbox
    #[must_use]
    pub fn new(config: SandboxConfig, patterns: Arc<PatternRegistry>) -> Self {
        Self { config, patterns }
    }

    /// Whether the runtime CLI is installed and its daemon answers
    #[must_use]
    pub fn is_available(config: &SandboxConfig) -> bool {
        std::process::Command::new(&config.container.runtime)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionResult, SandboxError> {
        let job = HarnessJob::new(request, &self.config, &self.patterns, Enforcement::Rlimits);
        let name = container_name();
        debug!(container = %name, image = %self.config.container.image, "starting container");

        let mut command = Command::new(&self.config.container.runtime);
        command.args(run_args(&self.config, &name));

        let supervised = run_supervised(
            command,
            job.to_json()?.into_bytes(),
            self.config.timeout.saturating_add(STARTUP_GRACE),
            report_read_cap(&self.config),
            Reaper::Container {
                runtime: self.config.container.runtime.clone(),
                name,
            },
        )
        .await?;

        Ok(classify(
            SandboxBackendKind::Container,
            &self.config,
            &supervised,
        ))
    }
}

/// Unique per invocation
fn container_name() -> String {
    format!("codegate-{}", hex::encode(rand::random::<[u8; 8]>()))
}

/// Arguments for `<runtime> run`
fn run_args(config: &SandboxConfig, name: &str) -> Vec<String> {
    let container = &config.container;
    let network = match config.network {
        NetworkPolicy::Disabled => "none",
        NetworkPolicy::Enabled => "bridge",
    };
    let scratch_mode = match config.filesystem {
        FilesystemPolicy::ReadOnly => "ro",
        FilesystemPolicy::Writable => "rw",
    };

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "-i".into(),
        "--name".into(),
        name.to_string(),
        format!("--network={network}"),
        "--read-only".into(),
        "--tmpfs".into(),
        format!(
            "{SCRATCH_DIR}:{scratch_mode},noexec,nosuid,nodev,size={}",
            container.scratch_size_bytes
        ),
        "-w".into(),
        SCRATCH_DIR.into(),
        format!("--memory={}b", config.max_memory_bytes),
        format!("--memory-swap={}b", config.max_memory_bytes),
        format!("--cpus={}", config.cpu_share),
        format!("--pids-limit={}", container.pids_limit),
        "--cap-drop=ALL".into(),
        "--security-opt=no-new-privileges".into(),
        "--user".into(),
        NOBODY.into(),
        "-e".into(),
        "PYTHONDONTWRITEBYTECODE=1".into(),
        container.image.clone(),
        container.interpreter.clone(),
    ];
    args.extend(["-I".to_string(), "-c".to_string(), HARNESS.to_string()]);
    args
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn execute(&self, request: ExecutionRequest<'_>) -> ExecutionResult {
        let start = Instant::now();
        let mut lifecycle = SandboxLifecycle::new(SandboxBackendKind::Container);
        if let Err(e) = lifecycle.start() {
            return failure(SandboxBackendKind::Container, &e, start.elapsed());
        }

        let result = match self.run(&request).await {
            Ok(result) => result,
            Err(e) => failure(SandboxBackendKind::Container, &e, start.elapsed()),
        };
        let result = lifecycle.seal(result);

        info!(
            backend = "container",
            classification = %result.classification,
            elapsed_ms = result.wall_time.as_millis() as u64,
            "sandbox run finished"
        );
        result
    }

    fn backend(&self) -> SandboxBackendKind {
        SandboxBackendKind::Container
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitClassification;

    #[test]
    fn test_security_flags_present() {
        let args = run_args(&SandboxConfig::default(), "codegate-test");
        for flag in [
            "--rm",
            "--read-only",
            "--network=none",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
        ] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
        let user = args.iter().position(|a| a == "--user").unwrap();
        assert_eq!(args[user + 1], NOBODY);
    }

    #[test]
    fn test_resource_limits_from_config() {
        let config = SandboxConfig::default().with_memory_mb(128).unwrap();
        let args = run_args(&config, "codegate-test");
        assert!(args.contains(&format!("--memory={}b", 128 * 1024 * 1024)));
        assert!(args.contains(&format!("--memory-swap={}b", 128 * 1024 * 1024)));
        assert!(args.contains(&"--cpus=1".to_string()));
        assert!(args.contains(&"--pids-limit=32".to_string()));
    }

    #[test]
    fn test_image_precedes_interpreter() {
        let args = run_args(&SandboxConfig::default(), "codegate-test");
        let image = args.iter().position(|a| a == "python:3.12-slim").unwrap();
        assert_eq!(args[image + 1], "python3");
        assert_eq!(args.last().map(String::as_str), Some(HARNESS));
    }

    #[test]
    fn test_network_and_scratch_follow_policy() {
        let config = SandboxConfig {
            network: NetworkPolicy::Enabled,
            filesystem: FilesystemPolicy::Writable,
            ..SandboxConfig::default()
        };
        let args = run_args(&config, "codegate-test");
        assert!(args.contains(&"--network=bridge".to_string()));
        let tmpfs = args.iter().position(|a| a == "--tmpfs").unwrap();
        assert!(args[tmpfs + 1].starts_with("/scratch:rw,"));
    }

    #[test]
    fn test_container_names_are_unique() {
        assert_ne!(container_name(), container_name());
        assert!(container_name().starts_with("codegate-"));
    }

    #[tokio::test]
    async fn test_container_timeout() {
        let config = SandboxConfig {
            timeout: Duration::from_secs(1),
            ..SandboxConfig::default()
        };
        if !ContainerSandbox::is_available(&config) {
            eprintln!("Skipping test: container runtime not available");
            return;
        }
        let sandbox = ContainerSandbox::new(config, Arc::new(PatternRegistry::default()));
        let result = sandbox
            .execute(ExecutionRequest::new("while True:\n    pass\n"))
            .await;
        assert_eq!(result.classification, ExitClassification::Timeout);
    }
}
