//! Structural task validation for the `validate` command.
//!
//! Goes beyond what the loader enforces: every rule id named by a phase must
//! resolve to a registered check, and every phase must have at least one
//! live test case. Difficulty-tier phase-count bands are advisory only.

use std::path::Path;

use anyhow::Result;

use crate::core::model::Difficulty;
use crate::evaluate::Evaluator;
use crate::io::task::{TaskBundle, load_task};

/// Issues found by static validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Defects that make the task unrunnable; non-empty fails `validate`.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Load a task directory and statically validate it against `evaluator`.
pub fn validate_task(task_dir: &Path, evaluator: &Evaluator) -> Result<ValidationReport> {
    let bundle = load_task(task_dir)?;
    Ok(validate_bundle(&bundle, evaluator))
}

/// Static checks on an already-loaded task.
pub fn validate_bundle(bundle: &TaskBundle, evaluator: &Evaluator) -> ValidationReport {
    let mut report = ValidationReport::default();

    for phase in &bundle.config.phases {
        for rule in &phase.rules {
            if !evaluator.has_check(&rule.id) {
                report.errors.push(format!(
                    "no check registered for rule '{}' (phase {})",
                    rule.id, phase.id
                ));
            }
        }
        let live = bundle
            .tests
            .iter()
            .filter(|case| case.phase <= phase.id)
            .count();
        if live == 0 {
            report
                .errors
                .push(format!("phase {} has no live test cases", phase.id));
        }
    }

    let declared: Vec<u32> = bundle.config.phases.iter().map(|phase| phase.id).collect();
    for case in &bundle.tests {
        if !declared.contains(&case.phase) {
            report.warnings.push(format!(
                "test case declares unknown phase {} and will never go live",
                case.phase
            ));
            break;
        }
    }

    let phase_count = bundle.config.phases.len();
    let band = difficulty_band(bundle.config.difficulty);
    if !band.contains(&phase_count) {
        report.warnings.push(format!(
            "{:?} tasks usually have {}-{} phases (this one has {})",
            bundle.config.difficulty,
            band.start(),
            band.end(),
            phase_count
        ));
    }

    report
}

fn difficulty_band(difficulty: Difficulty) -> std::ops::RangeInclusive<usize> {
    match difficulty {
        Difficulty::Easy => 1..=5,
        Difficulty::Medium => 6..=15,
        Difficulty::Hard => 16..=30,
        Difficulty::Expert => 31..=50,
    }
}
