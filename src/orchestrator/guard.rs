//! Resource guard: the last stage, always run.

use std::time::Duration;

use tracing::{info, warn};

use crate::config::ResourceCeilings;
use crate::types::{Finding, FindingSeverity, StageId, StageResult};

const MIB: u64 = 1024 * 1024;

/// Resources consumed by one validation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Wall time from the start of the validation to the guard
    pub wall_time: Duration,
    /// Largest peak memory reported by any sandbox run
    pub peak_memory_bytes: Option<u64>,
    /// CPU time summed over every sandbox run
    pub cpu_time: Duration,
}

impl ResourceUsage {
    /// Fold in a sandbox run's peak memory
    pub fn record_peak(&mut self, peak: Option<u64>) {
        self.peak_memory_bytes = self.peak_memory_bytes.max(peak);
    }

    /// Add CPU time reported by a sandbox run
    pub fn add_cpu_time(&mut self, cpu_time: Option<Duration>) {
        if let Some(cpu_time) = cpu_time {
            self.cpu_time = self.cpu_time.saturating_add(cpu_time);
        }
    }
}

/// Compares cumulative usage against global ceilings
#[derive(Clone, Copy, Debug)]
pub struct ResourceGuard {
    ceilings: ResourceCeilings,
    threshold: FindingSeverity,
}

impl ResourceGuard {
    /// Create a guard
    #[must_use]
    pub const fn new(ceilings: ResourceCeilings, threshold: FindingSeverity) -> Self {
        Self {
            ceilings,
            threshold,
        }
    }

    /// Build the stage result.
    ///
    /// Measured values stay out of the summary finding so repeated runs
    /// produce identical findings; they live in the report itself.
    #[must_use]
    pub fn check(&self, usage: &ResourceUsage) -> StageResult {
        let mut findings = Vec::new();

        if usage.wall_time > self.ceilings.max_total_duration {
            warn!(
                elapsed = ?usage.wall_time,
                ceiling = ?self.ceilings.max_total_duration,
                "validation exceeded its wall-time ceiling"
            );
            findings.push(
                Finding::error(format!(
                    "validation took {:.3}s, ceiling is {:.3}s",
                    usage.wall_time.as_secs_f64(),
                    self.ceilings.max_total_duration.as_secs_f64()
                ))
                .with_code("wall-time-exceeded"),
            );
        }

        if usage.cpu_time > self.ceilings.max_total_cpu_time {
            findings.push(
                Finding::error(format!(
                    "sandbox runs used {:.3}s of CPU, ceiling is {:.3}s",
                    usage.cpu_time.as_secs_f64(),
                    self.ceilings.max_total_cpu_time.as_secs_f64()
                ))
                .with_code("cpu-time-exceeded"),
            );
        }

        if let Some(peak) = usage.peak_memory_bytes {
            if peak > self.ceilings.max_peak_memory_bytes {
                findings.push(
                    Finding::error(format!(
                        "peak memory {} MiB exceeds ceiling of {} MiB",
                        peak / MIB,
                        self.ceilings.max_peak_memory_bytes / MIB
                    ))
                    .with_code("memory-exceeded"),
                );
            }
        }

        if findings.is_empty() {
            findings.push(
                Finding::info(format!(
                    "within ceilings: {:.3}s wall time, {:.3}s CPU time, {} MiB peak memory",
                    self.ceilings.max_total_duration.as_secs_f64(),
                    self.ceilings.max_total_cpu_time.as_secs_f64(),
                    self.ceilings.max_peak_memory_bytes / MIB
                ))
                .with_code("resource-summary"),
            );
        }

        let result =
            StageResult::from_findings(StageId::ResourceGuard, findings, self.threshold, Duration::ZERO);
        info!(
            status = ?result.status(),
            wall_ms = usage.wall_time.as_millis() as u64,
            cpu_ms = usage.cpu_time.as_millis() as u64,
            peak_memory_bytes = usage.peak_memory_bytes,
            "resource guard finished"
        );
        result
    }
}
