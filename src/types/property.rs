//! Property check results.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one property over a testing campaign
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyOutcome {
    /// No trial falsified the property
    Holds,
    /// At least one trial falsified the property
    Violated,
    /// The property could not be evaluated
    Error,
    /// The property does not apply to this callable
    Skipped,
}

impl fmt::Display for PropertyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Holds => "HOLDS",
            Self::Violated => "VIOLATED",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        })
    }
}

/// An input that falsified a property
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterExample {
    /// Positional arguments of the failing call
    pub input: Vec<Value>,
    /// What was observed instead of the expected behavior
    pub observed: String,
}

/// Result of one property check
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyCheckResult {
    /// Property name
    pub property: String,
    /// Outcome
    pub outcome: PropertyOutcome,
    /// Smallest failing input found, if violated
    pub counter_example: Option<Vec<Value>>,
    /// Distinct counter-examples, smallest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counter_examples: Vec<CounterExample>,
    /// Randomized trials executed
    pub trials: usize,
    /// Explanation for errors, skips and violations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PropertyCheckResult {
    /// Property held over `trials` trials
    pub fn holds(property: impl Into<String>, trials: usize) -> Self {
        Self {
            property: property.into(),
            outcome: PropertyOutcome::Holds,
            counter_example: None,
            counter_examples: Vec::new(),
            trials,
            detail: None,
        }
    }

    /// Property was falsified; `counter_examples` must be non-empty and ordered smallest first
    pub fn violated(
        property: impl Into<String>,
        trials: usize,
        counter_examples: Vec<CounterExample>,
    ) -> Self {
        let detail = counter_examples.first().map(|c| c.observed.clone());
        Self {
            property: property.into(),
            outcome: PropertyOutcome::Violated,
            counter_example: counter_examples.first().map(|c| c.input.clone()),
            counter_examples,
            trials,
            detail,
        }
    }

    /// Property could not be evaluated
    pub fn error(property: impl Into<String>, trials: usize, detail: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            outcome: PropertyOutcome::Error,
            counter_example: None,
            counter_examples: Vec::new(),
            trials,
            detail: Some(detail.into()),
        }
    }

    /// Property does not apply
    pub fn skipped(property: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            outcome: PropertyOutcome::Skipped,
            counter_example: None,
            counter_examples: Vec::new(),
            trials: 0,
            detail: Some(detail.into()),
        }
    }
}
