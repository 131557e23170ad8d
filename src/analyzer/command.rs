//! Analyzers backed by an external command that reads source from stdin.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{AnalyzerError, AnalyzerIssue, ExternalAnalyzer, SeverityScale};
use crate::types::{FindingSeverity, SourceLocation};

/// Analyzers shipped with presets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinAnalyzer {
    /// `ruff check`, JSON output
    Ruff,
    /// `bandit`, JSON output
    Bandit,
}

impl BuiltinAnalyzer {
    /// Build the preset analyzer
    #[must_use]
    pub fn build(self) -> CommandAnalyzer {
        match self {
            Self::Ruff => CommandAnalyzer::ruff(),
            Self::Bandit => CommandAnalyzer::bandit(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Ruff,
    Bandit,
}

/// External tool run once per source, source on stdin and JSON on stdout
#[derive(Clone, Debug)]
pub struct CommandAnalyzer {
    name: String,
    program: String,
    args: Vec<String>,
    scale: SeverityScale,
    format: OutputFormat,
}

impl CommandAnalyzer {
    /// `ruff check` with pyflakes / syntax rules as errors and bandit-derived
    /// `S` rules as security issues
    #[must_use]
    pub fn ruff() -> Self {
        Self {
            name: "ruff".to_string(),
            program: "ruff".to_string(),
            args: ["check", "--output-format", "json", "--stdin-filename", "snippet.py", "-"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            scale: SeverityScale {
                levels: vec![
                    ("style".to_string(), FindingSeverity::Info),
                    ("error".to_string(), FindingSeverity::Warning),
                    ("security".to_string(), FindingSeverity::Error),
                ],
            },
            format: OutputFormat::Ruff,
        }
    }

    /// `bandit` with its LOW / MEDIUM / HIGH severities
    #[must_use]
    pub fn bandit() -> Self {
        Self {
            name: "bandit".to_string(),
            program: "bandit".to_string(),
            args: ["-q", "-f", "json", "-"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            scale: SeverityScale {
                levels: vec![
                    ("UNDEFINED".to_string(), FindingSeverity::Info),
                    ("LOW".to_string(), FindingSeverity::Warning),
                    ("MEDIUM".to_string(), FindingSeverity::Error),
                    ("HIGH".to_string(), FindingSeverity::Critical),
                ],
            },
            format: OutputFormat::Bandit,
        }
    }

    /// Use a different executable (a venv path, `uvx ruff`, ...)
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn parse(&self, stdout: &str) -> Result<Vec<AnalyzerIssue>, AnalyzerError> {
        match self.format {
            OutputFormat::Ruff => parse_ruff(stdout),
            OutputFormat::Bandit => parse_bandit(stdout),
        }
    }
}

#[async_trait]
impl ExternalAnalyzer for CommandAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    fn severity_scale(&self) -> &SeverityScale {
        &self.scale
    }

    async fn analyze(&self, source: &str) -> Result<Vec<AnalyzerIssue>, AnalyzerError> {
        debug!(program = %self.program, args = ?self.args, "running analyzer");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => AnalyzerError::NotAvailable(self.program.clone()),
                _ => AnalyzerError::Io(e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(source.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // Both tools exit non-zero when they report issues
        if stdout.trim().is_empty() {
            if output.status.success() {
                return Ok(Vec::new());
            }
            return Err(AnalyzerError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.parse(&stdout)
    }
}

#[derive(Deserialize)]
struct RuffDiagnostic {
    code: Option<String>,
    message: String,
    location: Option<RuffLocation>,
}

#[derive(Deserialize)]
struct RuffLocation {
    row: usize,
    column: usize,
}

fn ruff_level(code: Option<&str>) -> &'static str {
    match code {
        None => "error",
        Some(code) if code.starts_with('F') || code.starts_with("E9") => "error",
        Some(code) if code.starts_with('S') => "security",
        Some(_) => "style",
    }
}

fn parse_ruff(stdout: &str) -> Result<Vec<AnalyzerIssue>, AnalyzerError> {
    let diagnostics: Vec<RuffDiagnostic> =
        serde_json::from_str(stdout).map_err(|e| AnalyzerError::Parse(e.to_string()))?;
    Ok(diagnostics
        .into_iter()
        .map(|d| AnalyzerIssue {
            level: ruff_level(d.code.as_deref()).to_string(),
            message: d.message,
            location: d.location.map(|l| SourceLocation::new(l.row, l.column)),
            code: d.code,
        })
        .collect())
}

#[derive(Deserialize)]
struct BanditReport {
    #[serde(default)]
    results: Vec<BanditResult>,
}

#[derive(Deserialize)]
struct BanditResult {
    issue_severity: String,
    issue_text: String,
    test_id: Option<String>,
    line_number: Option<usize>,
    col_offset: Option<usize>,
}

fn parse_bandit(stdout: &str) -> Result<Vec<AnalyzerIssue>, AnalyzerError> {
    let report: BanditReport =
        serde_json::from_str(stdout).map_err(|e| AnalyzerError::Parse(e.to_string()))?;
    Ok(report
        .results
        .into_iter()
        .map(|r| AnalyzerIssue {
            level: r.issue_severity,
            message: r.issue_text,
            code: r.test_id,
            location: r
                .line_number
                .map(|line| SourceLocation::new(line, r.col_offset.unwrap_or(0) + 1)),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ruff_output() {
        let stdout = r#"[
            {"code": "F401", "message": "`os` imported but unused",
             "location": {"row": 1, "column": 8}, "filename": "snippet.py"},
            {"code": "S605", "message": "Starting a process with a shell",
             "location": {"row": 2, "column": 1}, "filename": "snippet.py"},
            {"code": "E501", "message": "Line too long",
             "location": {"row": 3, "column": 89}, "filename": "snippet.py"}
        ]"#;
        let issues = parse_ruff(stdout).unwrap();
        let levels: Vec<&str> = issues.iter().map(|i| i.level.as_str()).collect();
        assert_eq!(levels, vec!["error", "security", "style"]);
        assert_eq!(issues[0].location, Some(SourceLocation::new(1, 8)));

        let scale = CommandAnalyzer::ruff().scale;
        assert_eq!(scale.map("security"), FindingSeverity::Error);
    }

    #[test]
    fn test_parse_bandit_output() {
        let stdout = r#"{"errors": [], "results": [
            {"issue_severity": "HIGH", "issue_text": "subprocess call with shell=True",
             "test_id": "B602", "line_number": 4, "col_offset": 0}
        ]}"#;
        let issues = parse_bandit(stdout).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].location, Some(SourceLocation::new(4, 1)));
        assert_eq!(
            CommandAnalyzer::bandit().scale.map(&issues[0].level),
            FindingSeverity::Critical
        );
    }

    #[test]
    fn test_preset_scales_are_monotone() {
        for analyzer in [CommandAnalyzer::ruff(), CommandAnalyzer::bandit()] {
            let levels = analyzer.scale.levels.clone();
            assert!(SeverityScale::new(levels).is_ok());
        }
    }

    #[test]
    fn test_garbage_output_is_parse_error() {
        assert!(matches!(
            parse_ruff("not json"),
            Err(AnalyzerError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_is_not_available() {
        let analyzer = CommandAnalyzer::ruff().with_program("codegate-no-such-analyzer");
        let err = analyzer.analyze("x = 1\n").await.unwrap_err();
        assert!(matches!(err, AnalyzerError::NotAvailable(_)));
    }
}
