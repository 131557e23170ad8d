//! # codegate
//!
//! A multi-stage validation pipeline that decides whether machine-generated
//! Python is safe and correct enough to execute.
//!
//! ## Pipeline
//!
//! Stages run in a fixed order, each producing a [`StageResult`]:
//! 1. **Prevalidation**: tree-sitter parse plus a denylist walk, no execution
//! 2. **Static analysis**: external analyzers run concurrently, non-fatal by default
//! 3. **Sandbox execution**: restricted, subprocess or container backend
//! 4. **Property testing**: seeded randomized checks on a target function
//! 5. **Resource guard**: cumulative wall time and peak memory against ceilings
//!
//! ## Security Model
//!
//! The [`PatternRegistry`] is a living denylist. It pins the escape routes
//! known today (dangerous modules, reflection builtins, dunder attributes,
//! string-based `getattr` and dynamic imports) and must be revisited as new
//! bypasses appear. Passing prevalidation is not a proof of safety; isolation
//! comes from the sandbox backend, and the container backend is the strongest.
//!
//! ```no_run
//! # async fn demo() -> Result<(), codegate::ConfigError> {
//! let report = codegate::validate(
//!     "def add(a: int, b: int) -> int:\n    return a + b\n",
//!     Some("add"),
//!     codegate::ValidatorConfig::default(),
//! )
//! .await?;
//! println!("{}", report.status());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc
)]

pub mod analyzer;
pub mod config;
pub mod orchestrator;
pub mod prevalidator;
pub mod property;
pub mod sandbox;
pub mod types;

pub use analyzer::{
    AnalyzerError, AnalyzerIssue, BuiltinAnalyzer, CommandAnalyzer, ExternalAnalyzer,
    SeverityScale, StaticAnalyzer,
};
pub use config::{
    ConfigError, FatalityThresholds, FilesystemPolicy, NetworkPolicy, PropertyTestConfig,
    ResourceCeilings, SandboxConfig, ValidatorConfig,
};
pub use orchestrator::{execute_safe, is_safe, validate, Validator};
pub use prevalidator::{PatternRegistry, Prevalidator};
pub use property::{BatchUsage, ParamType, Property, PropertyReport, PropertyTester};
pub use sandbox::{build_sandbox, ExecutionRequest, Sandbox, SandboxError};
pub use types::{
    ExecutionResult, ExitClassification, Finding, FindingSeverity, OverallStatus,
    PropertyCheckResult, PropertyOutcome, SandboxBackendKind, SourceUnit, StageId, StageResult,
    StageStatus, ValidationReport,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
