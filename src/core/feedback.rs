//! Feedback construction from raw evaluation output.
//!
//! Aggregates per-test violations, classifies the attempt, computes the
//! delta against the previous counted attempt, and applies scope
//! obfuscation. This is the only place wire `Feedback` records are built.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::core::model::{
    AttemptStatus, Delta, ErrorInfo, Feedback, Phase, RawViolation, Summary, Violation,
};
use crate::core::obfuscate::obfuscate_scope;

/// Inputs for building one feedback record.
#[derive(Debug)]
pub struct FeedbackInput<'a> {
    pub phase: &'a Phase,
    /// `None` for implicit phase-transition evaluations.
    pub attempt_id: Option<u32>,
    pub raw_violations: &'a [RawViolation],
    pub coverage: f64,
    /// Number of live tests the coverage was computed over.
    pub live_tests: usize,
    /// Most recent counted feedback, if any (across phases).
    pub prior: Option<&'a Feedback>,
    /// Set when the solution could not be loaded or evaluated at all.
    pub error: Option<ErrorInfo>,
}

/// Build the wire feedback record for one evaluation.
pub fn build_feedback(input: FeedbackInput<'_>) -> Feedback {
    if let Some(error) = input.error {
        return error_feedback(input.phase, input.attempt_id, error);
    }

    let counts = aggregate(input.raw_violations);
    let violations = to_wire_violations(&counts);
    let failing: BTreeSet<&str> = counts.keys().map(|(rule_id, _)| rule_id.as_str()).collect();

    let status = classify(input.phase, &counts, input.coverage, input.live_tests);
    let status_reason = if failing.is_empty() {
        "All rules pass".to_string()
    } else {
        let ids: Vec<&str> = failing.iter().copied().collect();
        format!("Fails checks: {}", ids.join(", "))
    };

    let rules_total = input.phase.rules.len() as u32;
    let rules_failed = failing.len() as u32;
    let summary = Summary {
        rules_total,
        rules_passed: rules_total - rules_failed,
        rules_failed,
        coverage: input.coverage,
    };

    let delta = compute_delta(&failing, input.coverage, input.prior);

    Feedback {
        phase_id: input.phase.id,
        attempt_id: input.attempt_id,
        status,
        status_reason,
        violations,
        summary,
        delta,
        error: None,
    }
}

/// Feedback for an attempt whose solution never produced a callable.
///
/// Rule checks were skipped, so no violations are reported and the delta is
/// neutral: an execution error says nothing about which rules regressed.
fn error_feedback(phase: &Phase, attempt_id: Option<u32>, error: ErrorInfo) -> Feedback {
    Feedback {
        phase_id: phase.id,
        attempt_id,
        status: AttemptStatus::Error,
        status_reason: format!("Runtime error: {}", error.message),
        violations: Vec::new(),
        summary: Summary {
            rules_total: phase.rules.len() as u32,
            rules_passed: 0,
            rules_failed: 0,
            coverage: 0.0,
        },
        delta: Delta {
            coverage_change: 0.0,
            new_failures: Vec::new(),
            fixed_failures: Vec::new(),
        },
        error: Some(error),
    }
}

/// Count raw violations by `(rule_id, scope)`.
///
/// Aggregation runs on raw scopes, before obfuscation, so two raw scopes
/// that collide under the short digest are still counted separately.
fn aggregate(raw: &[RawViolation]) -> BTreeMap<(String, String), u32> {
    let mut counts: BTreeMap<(String, String), u32> = BTreeMap::new();
    for violation in raw {
        *counts
            .entry((violation.rule_id.clone(), violation.scope.clone()))
            .or_insert(0) += 1;
    }
    counts
}

fn to_wire_violations(counts: &BTreeMap<(String, String), u32>) -> Vec<Violation> {
    counts
        .iter()
        .map(|((rule_id, scope), count)| Violation {
            rule_id: rule_id.clone(),
            scope: obfuscate_scope(scope),
            count: *count,
        })
        .collect()
}

fn classify(
    phase: &Phase,
    counts: &BTreeMap<(String, String), u32>,
    coverage: f64,
    live_tests: usize,
) -> AttemptStatus {
    if counts.is_empty() && coverage == 1.0 {
        return AttemptStatus::Valid;
    }
    if live_tests > 0 && coverage == 0.0 && every_rule_failed_everywhere(phase, counts, live_tests) {
        return AttemptStatus::Invalid;
    }
    AttemptStatus::PartiallyValid
}

/// True when each rule of the phase failed on every live test.
fn every_rule_failed_everywhere(
    phase: &Phase,
    counts: &BTreeMap<(String, String), u32>,
    live_tests: usize,
) -> bool {
    let mut per_rule: BTreeMap<&str, u32> = BTreeMap::new();
    for ((rule_id, _), count) in counts {
        *per_rule.entry(rule_id.as_str()).or_insert(0) += count;
    }
    phase
        .rules
        .iter()
        .all(|rule| per_rule.get(rule.id.as_str()).copied().unwrap_or(0) as usize >= live_tests)
}

fn compute_delta(failing: &BTreeSet<&str>, coverage: f64, prior: Option<&Feedback>) -> Delta {
    let Some(prior) = prior else {
        return Delta {
            coverage_change: 0.0,
            new_failures: Vec::new(),
            fixed_failures: Vec::new(),
        };
    };

    let prior_failing: BTreeSet<String> = prior.failing_rule_ids().into_iter().collect();
    let new_failures = failing
        .iter()
        .filter(|id| !prior_failing.contains(**id))
        .map(|id| id.to_string())
        .collect();
    let fixed_failures = prior_failing
        .iter()
        .filter(|id| !failing.contains(id.as_str()))
        .cloned()
        .collect();

    Delta {
        coverage_change: coverage - prior.summary.coverage,
        new_failures,
        fixed_failures,
    }
}
