//! Shared deterministic types for the task engine.
//!
//! These types define the stable contracts between loader, evaluator,
//! feedback builder, and workspace broker. Everything here is plain data;
//! wire records serialize as snake_case JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task difficulty tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Expert,
}

/// A correctness constraint checked within a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier; resolved to a registered check function.
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Failure subcategories this rule can report (raw, pre-obfuscation).
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A stage of a task with a fixed rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Function interface the agent must implement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub function_name: String,
    /// Advisory signature text embedded in the agent's view; never parsed.
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub allowed_imports: Vec<String>,
}

/// Execution configuration for sandbox calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock budget per sandbox request, in seconds.
    pub timeout_seconds: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30.0,
        }
    }
}

/// Attempt budgets for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_attempts_per_phase: u32,
    pub max_total_attempts: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_attempts_per_phase: 10,
            max_total_attempts: 50,
        }
    }
}

/// Complete immutable task descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    pub difficulty: Difficulty,
    pub interface: Interface,
    pub execution: ExecutionConfig,
    pub limits: Limits,
    /// Ordered phases; ids form a contiguous 0..N sequence.
    pub phases: Vec<Phase>,
}

/// A single hidden test case.
///
/// `input` and `expected` are arbitrary JSON values; the stored input is
/// never handed to the sandbox directly; every call gets a fresh copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: Value,
    pub expected: Value,
    /// Earliest phase in which this case is live; it stays live forever.
    pub phase: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One failing (rule, test) outcome, before aggregation and obfuscation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawViolation {
    pub rule_id: String,
    pub scope: String,
}

/// An aggregated rule violation as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    /// Post-obfuscation scope label.
    pub scope: String,
    pub count: u32,
}

/// Status classification for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Valid,
    PartiallyValid,
    Invalid,
    Error,
}

/// Summary counts for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub rules_total: u32,
    pub rules_passed: u32,
    pub rules_failed: u32,
    /// Fraction of live tests on which every rule passed, in [0, 1].
    pub coverage: f64,
}

/// Change relative to the most recent counted attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub coverage_change: f64,
    pub new_failures: Vec<String>,
    pub fixed_failures: Vec<String>,
}

/// Error details when the solution could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Taxonomy name: SyntaxError, MissingFunction, ImportViolation,
    /// Timeout, RuntimeException.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// Pipeline stage that failed: "execution" or "evaluation".
    pub phase: String,
}

/// Structured feedback written after each counted attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub phase_id: u32,
    /// 1-based, strictly monotone per task. Absent on implicit evaluations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<u32>,
    pub status: AttemptStatus,
    pub status_reason: String,
    pub violations: Vec<Violation>,
    pub summary: Summary,
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Feedback {
    /// Rule ids with at least one violation, sorted and deduplicated.
    pub fn failing_rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .violations
            .iter()
            .map(|violation| violation.rule_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Agent-visible task summary (`task.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: String,
    pub name: String,
    pub difficulty: Difficulty,
    pub interface: Interface,
    pub execution: ExecutionConfig,
    pub limits: Limits,
    pub total_phases: u32,
}

/// A rule as shown to the agent; scopes are post-obfuscation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleView {
    pub id: String,
    pub description: String,
    pub scopes: Vec<String>,
}

/// Agent-visible phase announcement (`phase.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseView {
    pub phase_id: u32,
    pub description: String,
    pub rules: Vec<RuleView>,
    /// Free evaluation of the inherited solution against this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implicit_evaluation: Option<Feedback>,
    pub attempts_used_this_phase: u32,
    pub attempts_remaining_this_phase: u32,
    pub total_attempts_remaining: u32,
}

impl TaskConfig {
    pub fn task_view(&self) -> TaskView {
        TaskView {
            task_id: self.id.clone(),
            name: self.name.clone(),
            difficulty: self.difficulty,
            interface: self.interface.clone(),
            execution: self.execution,
            limits: self.limits,
            total_phases: self.phases.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_serializes_without_empty_optionals() {
        let feedback = Feedback {
            phase_id: 0,
            attempt_id: None,
            status: AttemptStatus::Valid,
            status_reason: "All rules pass".to_string(),
            violations: Vec::new(),
            summary: Summary {
                rules_total: 1,
                rules_passed: 1,
                rules_failed: 0,
                coverage: 1.0,
            },
            delta: Delta {
                coverage_change: 0.0,
                new_failures: Vec::new(),
                fixed_failures: Vec::new(),
            },
            error: None,
        };

        let json = serde_json::to_value(&feedback).expect("serialize");
        assert!(json.get("attempt_id").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["status"], "valid");
    }

    #[test]
    fn error_info_uses_type_key_on_the_wire() {
        let error = ErrorInfo {
            kind: "ImportViolation".to_string(),
            message: "import 'os' is not allowed".to_string(),
            phase: "execution".to_string(),
        };
        let json = serde_json::to_value(&error).expect("serialize");
        assert_eq!(json["type"], "ImportViolation");
    }

    #[test]
    fn failing_rule_ids_are_sorted_and_unique() {
        let feedback = Feedback {
            phase_id: 1,
            attempt_id: Some(3),
            status: AttemptStatus::PartiallyValid,
            status_reason: "Fails checks: b_rule, a_rule".to_string(),
            violations: vec![
                Violation {
                    rule_id: "b_rule".to_string(),
                    scope: "direct".to_string(),
                    count: 2,
                },
                Violation {
                    rule_id: "a_rule".to_string(),
                    scope: "unknown".to_string(),
                    count: 1,
                },
                Violation {
                    rule_id: "b_rule".to_string(),
                    scope: "nested".to_string(),
                    count: 1,
                },
            ],
            summary: Summary {
                rules_total: 3,
                rules_passed: 1,
                rules_failed: 2,
                coverage: 0.5,
            },
            delta: Delta {
                coverage_change: 0.0,
                new_failures: Vec::new(),
                fixed_failures: Vec::new(),
            },
            error: None,
        };

        assert_eq!(feedback.failing_rule_ids(), vec!["a_rule", "b_rule"]);
    }
}
