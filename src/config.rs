//! Validator configuration.
//!
//! Every field is optional when loading from JSON; missing fields take the
//! defaults below. Invalid values are rejected by [`ValidatorConfig::validate`]
//! before any stage runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::BuiltinAnalyzer;
use crate::prevalidator::PatternRegistry;
use crate::property::ParamType;
use crate::types::{serde_secs, serde_secs_opt, FindingSeverity, SandboxBackendKind, StageId};

/// Longest timeout, deadline or ceiling accepted anywhere in the configuration
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Invalid configuration, detected before any stage runs
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A timeout or deadline is zero, negative, not finite or above [`MAX_DURATION`]
    #[error("{field} must be a positive, finite duration of at most 24h (got {value})")]
    InvalidDuration {
        /// Offending field
        field: &'static str,
        /// Rendered value
        value: String,
    },

    /// A limit that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    /// CPU share is not a positive finite number
    #[error("cpu_share must be a positive, finite number (got {0})")]
    InvalidCpuShare(f64),

    /// Lower bound above upper bound
    #[error("invalid {field} bounds: {min} > {max}")]
    InvalidBounds {
        /// Offending field
        field: &'static str,
        /// Lower bound
        min: String,
        /// Upper bound
        max: String,
    },

    /// A name appears in more than one pattern set
    #[error("pattern '{0}' appears in more than one denylist set")]
    OverlappingPatterns(String),

    /// Container image reference contains disallowed characters
    #[error("invalid container image reference '{0}'")]
    InvalidImage(String),

    /// A program name is empty
    #[error("{0} must name a program")]
    EmptyProgram(&'static str),

    /// Default parameter type is not one the property tester can generate
    #[error("unsupported default parameter type '{0}'")]
    UnsupportedParamType(String),

    /// JSON configuration could not be parsed
    #[error("invalid configuration document: {0}")]
    Parse(String),
}

/// Whether sandboxed code may reach the network
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network access
    #[default]
    Disabled,
    /// Network access allowed (never recommended)
    Enabled,
}

/// Whether sandboxed code may write to the filesystem
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemPolicy {
    /// Root filesystem read-only, no file writes
    #[default]
    ReadOnly,
    /// Writes allowed inside the scratch area
    Writable,
}

/// Container backend settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime CLI (`docker`, `podman`)
    pub runtime: String,
    /// Pinned base image; prefer a digest reference
    pub image: String,
    /// Interpreter inside the image
    pub interpreter: String,
    /// Size of the writable scratch tmpfs in bytes
    pub scratch_size_bytes: u64,
    /// Maximum number of processes inside the container
    pub pids_limit: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            interpreter: "python3".to_string(),
            scratch_size_bytes: 16 * 1024 * 1024,
            pids_limit: 32,
        }
    }
}

/// Configuration for sandbox execution.
///
/// Read-only to the backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock timeout
    #[serde(with = "serde_secs")]
    pub timeout: Duration,
    /// Memory ceiling in bytes
    pub max_memory_bytes: u64,
    /// CPU share (1.0 = one full core)
    pub cpu_share: f64,
    /// Network policy
    pub network: NetworkPolicy,
    /// Filesystem policy
    pub filesystem: FilesystemPolicy,
    /// Cap on each captured output stream, in bytes
    pub output_limit_bytes: usize,
    /// Interpreter for the subprocess backend
    pub interpreter: String,
    /// Container backend settings
    pub container: ContainerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_memory_bytes: 256 * 1024 * 1024,
            cpu_share: 1.0,
            network: NetworkPolicy::Disabled,
            filesystem: FilesystemPolicy::ReadOnly,
            output_limit_bytes: 64 * 1024,
            interpreter: "python3".to_string(),
            container: ContainerConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Set the timeout from fractional seconds
    ///
    /// # Errors
    /// Returns error if `secs` is not positive and finite
    pub fn with_timeout_secs(mut self, secs: f64) -> Result<Self, ConfigError> {
        self.timeout = positive_duration("sandbox_timeout_seconds", secs)?;
        Ok(self)
    }

    /// Set the memory ceiling in megabytes
    ///
    /// # Errors
    /// Returns error if `mb` is zero
    pub fn with_memory_mb(mut self, mb: u64) -> Result<Self, ConfigError> {
        if mb == 0 {
            return Err(ConfigError::ZeroLimit("sandbox_max_memory_mb"));
        }
        self.max_memory_bytes = mb.saturating_mul(1024 * 1024);
        Ok(self)
    }

    /// Memory ceiling in whole megabytes
    #[must_use]
    pub const fn memory_mb(&self) -> u64 {
        self.max_memory_bytes / (1024 * 1024)
    }

    /// Validate the sandbox settings
    ///
    /// # Errors
    /// Returns the first invalid setting found
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("sandbox_timeout_seconds", self.timeout)?;
        if self.max_memory_bytes == 0 {
            return Err(ConfigError::ZeroLimit("sandbox_max_memory_mb"));
        }
        if !self.cpu_share.is_finite() || self.cpu_share <= 0.0 {
            return Err(ConfigError::InvalidCpuShare(self.cpu_share));
        }
        if self.output_limit_bytes == 0 {
            return Err(ConfigError::ZeroLimit("output_limit_bytes"));
        }
        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::EmptyProgram("interpreter"));
        }
        if self.container.runtime.trim().is_empty() {
            return Err(ConfigError::EmptyProgram("container.runtime"));
        }
        if self.container.interpreter.trim().is_empty() {
            return Err(ConfigError::EmptyProgram("container.interpreter"));
        }
        validate_image_name(&self.container.image)?;
        if self.container.pids_limit == 0 {
            return Err(ConfigError::ZeroLimit("container.pids_limit"));
        }
        if self.container.scratch_size_bytes == 0 {
            return Err(ConfigError::ZeroLimit("container.scratch_size_bytes"));
        }
        Ok(())
    }
}

/// Prevalidator limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrevalidationConfig {
    /// Maximum source length in characters
    pub max_code_length: usize,
    /// Maximum number of lines
    pub max_lines: usize,
    /// Severity of a length or line-count violation
    pub limit_severity: FindingSeverity,
}

impl Default for PrevalidationConfig {
    fn default() -> Self {
        Self {
            max_code_length: 100_000,
            max_lines: 5_000,
            limit_severity: FindingSeverity::Error,
        }
    }
}

/// Static analysis settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticAnalysisConfig {
    /// Run the static analysis stage at all
    pub enabled: bool,
    /// Built-in external analyzers to register
    pub analyzers: Vec<BuiltinAnalyzer>,
    /// Timeout for each analyzer
    #[serde(with = "serde_secs")]
    pub per_analyzer_timeout: Duration,
    /// Bound on the whole concurrent join
    #[serde(with = "serde_secs")]
    pub overall_timeout: Duration,
}

impl Default for StaticAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            analyzers: Vec::new(),
            per_analyzer_timeout: Duration::from_secs(10),
            overall_timeout: Duration::from_secs(30),
        }
    }
}

/// Property tester settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyTestConfig {
    /// Randomized trials per property
    pub trials: usize,
    /// Smallest generated integer
    pub int_min: i64,
    /// Largest generated integer
    pub int_max: i64,
    /// Smallest generated float
    pub float_min: f64,
    /// Largest generated float
    pub float_max: f64,
    /// Longest generated string
    pub max_string_len: usize,
    /// Longest generated list
    pub max_list_len: usize,
    /// Type assumed for unannotated parameters
    pub default_param_type: String,
    /// Stop a property at its first violation
    pub stop_on_first_violation: bool,
    /// Distinct counter-examples kept per property otherwise
    pub max_counterexamples: usize,
    /// RNG seed; random when absent
    pub seed: Option<u64>,
}

impl Default for PropertyTestConfig {
    fn default() -> Self {
        Self {
            trials: 100,
            int_min: -1000,
            int_max: 1000,
            float_min: -1.0e6,
            float_max: 1.0e6,
            max_string_len: 16,
            max_list_len: 8,
            default_param_type: "int".to_string(),
            stop_on_first_violation: true,
            max_counterexamples: 5,
            seed: None,
        }
    }
}

impl PropertyTestConfig {
    /// Validate the generator settings
    ///
    /// # Errors
    /// Returns the first invalid setting found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trials == 0 {
            return Err(ConfigError::ZeroLimit("property_test_trial_count"));
        }
        if self.int_min > self.int_max {
            return Err(ConfigError::InvalidBounds {
                field: "int",
                min: self.int_min.to_string(),
                max: self.int_max.to_string(),
            });
        }
        if !self.float_min.is_finite()
            || !self.float_max.is_finite()
            || self.float_min > self.float_max
        {
            return Err(ConfigError::InvalidBounds {
                field: "float",
                min: self.float_min.to_string(),
                max: self.float_max.to_string(),
            });
        }
        if self.max_counterexamples == 0 {
            return Err(ConfigError::ZeroLimit("max_counterexamples"));
        }
        if ParamType::parse(&self.default_param_type).is_none() {
            return Err(ConfigError::UnsupportedParamType(
                self.default_param_type.clone(),
            ));
        }
        Ok(())
    }
}

/// Per-stage fatality thresholds.
///
/// A stage fails when it carries a finding at or above its threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FatalityThresholds {
    /// Prevalidator threshold
    pub prevalidation: FindingSeverity,
    /// Static analysis threshold (tolerant by default)
    pub static_analysis: FindingSeverity,
    /// Sandbox execution threshold
    pub sandbox: FindingSeverity,
    /// Property testing threshold (violations are evidence, not a gate)
    pub property_testing: FindingSeverity,
    /// Resource guard threshold
    pub resource_guard: FindingSeverity,
}

impl Default for FatalityThresholds {
    fn default() -> Self {
        Self {
            prevalidation: FindingSeverity::Error,
            static_analysis: FindingSeverity::Critical,
            sandbox: FindingSeverity::Error,
            property_testing: FindingSeverity::Critical,
            resource_guard: FindingSeverity::Error,
        }
    }
}

impl FatalityThresholds {
    /// Threshold for a stage
    #[must_use]
    pub const fn for_stage(&self, stage: StageId) -> FindingSeverity {
        match stage {
            StageId::Prevalidation => self.prevalidation,
            StageId::StaticAnalysis => self.static_analysis,
            StageId::SandboxExecution => self.sandbox,
            StageId::PropertyTesting => self.property_testing,
            StageId::ResourceGuard => self.resource_guard,
        }
    }
}

/// Global ceilings checked by the resource guard
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCeilings {
    /// Cumulative wall time across all stages
    #[serde(with = "serde_secs")]
    pub max_total_duration: Duration,
    /// Peak memory observed in any sandbox run
    pub max_peak_memory_bytes: u64,
    /// CPU time summed over every sandbox run
    #[serde(with = "serde_secs")]
    pub max_total_cpu_time: Duration,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self {
            max_total_duration: Duration::from_secs(120),
            max_peak_memory_bytes: 512 * 1024 * 1024,
            max_total_cpu_time: Duration::from_secs(60),
        }
    }
}

/// Full validator configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Halt the pipeline after the first failing stage
    pub stop_on_failure: bool,
    /// Prevalidator limits
    pub prevalidation: PrevalidationConfig,
    /// Denylist used by the prevalidator and the sandbox harness
    pub patterns: PatternRegistry,
    /// Static analysis settings
    pub static_analysis: StaticAnalysisConfig,
    /// Run the sandbox stage
    pub enable_sandbox: bool,
    /// Sandbox backend, chosen once at construction
    pub sandbox_backend: SandboxBackendKind,
    /// Sandbox limits
    pub sandbox: SandboxConfig,
    /// Run the property testing stage
    pub enable_property_tests: bool,
    /// Property tester settings
    pub property_tests: PropertyTestConfig,
    /// Per-stage fatality thresholds
    pub thresholds: FatalityThresholds,
    /// Global resource ceilings
    pub ceilings: ResourceCeilings,
    /// Deadline for a whole validation call
    #[serde(with = "serde_secs_opt")]
    pub overall_deadline: Option<Duration>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
            prevalidation: PrevalidationConfig::default(),
            patterns: PatternRegistry::default(),
            static_analysis: StaticAnalysisConfig::default(),
            enable_sandbox: true,
            sandbox_backend: SandboxBackendKind::default(),
            sandbox: SandboxConfig::default(),
            enable_property_tests: true,
            property_tests: PropertyTestConfig::default(),
            thresholds: FatalityThresholds::default(),
            ceilings: ResourceCeilings::default(),
            overall_deadline: None,
        }
    }
}

impl ValidatorConfig {
    /// Parse and validate a JSON configuration document
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    ///
    /// # Errors
    /// Returns the first invalid setting found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prevalidation.max_code_length == 0 {
            return Err(ConfigError::ZeroLimit("max_code_length"));
        }
        if self.prevalidation.max_lines == 0 {
            return Err(ConfigError::ZeroLimit("max_lines"));
        }
        self.patterns.validate()?;
        check_duration(
            "per_analyzer_timeout",
            self.static_analysis.per_analyzer_timeout,
        )?;
        check_duration("overall_timeout", self.static_analysis.overall_timeout)?;
        self.sandbox.validate()?;
        self.property_tests.validate()?;
        check_duration("max_total_duration", self.ceilings.max_total_duration)?;
        check_duration("max_total_cpu_time", self.ceilings.max_total_cpu_time)?;
        if self.ceilings.max_peak_memory_bytes == 0 {
            return Err(ConfigError::ZeroLimit("max_peak_memory_bytes"));
        }
        if let Some(deadline) = self.overall_deadline {
            check_duration("overall_deadline", deadline)?;
        }
        Ok(())
    }
}

fn positive_duration(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidDuration {
            field,
            value: secs.to_string(),
        });
    }
    let duration = Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidDuration {
        field,
        value: secs.to_string(),
    })?;
    check_duration(field, duration)?;
    Ok(duration)
}

fn check_duration(field: &'static str, duration: Duration) -> Result<(), ConfigError> {
    if duration.is_zero() || duration > MAX_DURATION {
        return Err(ConfigError::InvalidDuration {
            field,
            value: format!("{:.3}s", duration.as_secs_f64()),
        });
    }
    Ok(())
}

/// Image references may only contain registry, path, tag and digest characters
fn validate_image_name(image: &str) -> Result<(), ConfigError> {
    let valid = !image.is_empty()
        && !image.starts_with('-')
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | ':' | '@' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidImage(image.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ValidatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let err = SandboxConfig::default().with_timeout_secs(-1.0).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
        assert!(SandboxConfig::default().with_timeout_secs(f64::NAN).is_err());
        assert!(SandboxConfig::default().with_timeout_secs(0.5).is_ok());
    }

    #[test]
    fn test_negative_timeout_in_json_rejected() {
        let err =
            ValidatorConfig::from_json_str(r#"{"sandbox": {"timeout": -3.0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let config = SandboxConfig {
            timeout: Duration::MAX,
            ..SandboxConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                field: "sandbox_timeout_seconds",
                ..
            })
        ));
        assert!(SandboxConfig::default().with_timeout_secs(1e12).is_err());

        let err = ValidatorConfig::from_json_str(r#"{"overall_deadline": 1e19}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration {
                field: "overall_deadline",
                ..
            }
        ));

        let mut config = ValidatorConfig::default();
        config.static_analysis.per_analyzer_timeout = MAX_DURATION + Duration::from_secs(1);
        assert!(config.validate().is_err());
        config.static_analysis.per_analyzer_timeout = MAX_DURATION;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_mb() {
        let config = SandboxConfig::default().with_memory_mb(128).unwrap();
        assert_eq!(config.max_memory_bytes, 128 * 1024 * 1024);
        assert_eq!(config.memory_mb(), 128);
        assert!(SandboxConfig::default().with_memory_mb(0).is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ValidatorConfig::from_json_str(
            r#"{
                "stop_on_failure": false,
                "sandbox_backend": "container",
                "sandbox": {"timeout": 2.5},
                "property_tests": {"trials": 10, "seed": 7}
            }"#,
        )
        .unwrap();

        assert!(!config.stop_on_failure);
        assert_eq!(config.sandbox_backend, SandboxBackendKind::Container);
        assert_eq!(config.sandbox.timeout, Duration::from_millis(2500));
        assert_eq!(config.sandbox.max_memory_bytes, 256 * 1024 * 1024);
        assert_eq!(config.property_tests.trials, 10);
        assert_eq!(config.property_tests.seed, Some(7));
        assert_eq!(config.prevalidation.max_lines, 5_000);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let mut config = ValidatorConfig::default();
        config.property_tests.int_min = 10;
        config.property_tests.int_max = -10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBounds { field: "int", .. })
        ));
    }

    #[test]
    fn test_image_validation() {
        assert!(validate_image_name("python:3.12-slim").is_ok());
        assert!(validate_image_name("python@sha256:0123abcd").is_ok());
        assert!(validate_image_name("--privileged").is_err());
        assert!(validate_image_name("python; rm -rf /").is_err());
    }

    #[test]
    fn test_thresholds_per_stage() {
        let thresholds = FatalityThresholds::default();
        assert_eq!(
            thresholds.for_stage(StageId::Prevalidation),
            FindingSeverity::Error
        );
        assert_eq!(
            thresholds.for_stage(StageId::StaticAnalysis),
            FindingSeverity::Critical
        );
    }
}
