//! Run metrics collection and the final report.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::model::Feedback;

/// Final status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseOutcome {
    Valid,
    Failed,
    Error,
    Aborted,
}

/// Final status of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Error,
    /// Reserved for orchestrators that impose wall-clock task deadlines;
    /// the engine itself never emits it.
    Timeout,
    Aborted,
}

/// Per-phase section of the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase_id: u32,
    pub status: PhaseOutcome,
    /// Counted attempts only; implicit evaluations are free.
    pub attempts: u32,
    /// Coverage of the last counted attempt in this phase.
    pub final_coverage: f64,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implicit_evaluation: Option<Feedback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallReport {
    pub status: RunStatus,
    pub total_attempts: u32,
    pub phases_completed: u32,
    pub total_duration_seconds: f64,
}

/// Complete report emitted on termination (`report.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: String,
    pub agent_id: String,
    pub timestamp: String,
    pub phases: Vec<PhaseReport>,
    pub overall: OverallReport,
}

#[derive(Debug)]
struct PhaseMetrics {
    attempts: u32,
    final_coverage: f64,
    started: Instant,
    ended: Option<Instant>,
    status: Option<PhaseOutcome>,
    implicit_evaluation: Option<Feedback>,
}

impl PhaseMetrics {
    fn new() -> Self {
        Self {
            attempts: 0,
            final_coverage: 0.0,
            started: Instant::now(),
            ended: None,
            status: None,
            implicit_evaluation: None,
        }
    }
}

/// Accumulates per-phase attempt counts, coverage, and durations.
#[derive(Debug)]
pub struct MetricsCollector {
    task_id: String,
    agent_id: String,
    started: Instant,
    phases: BTreeMap<u32, PhaseMetrics>,
    total_attempts: u32,
}

impl MetricsCollector {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            started: Instant::now(),
            phases: BTreeMap::new(),
            total_attempts: 0,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    /// Start the clock for a phase. Idempotent.
    pub fn enter_phase(&mut self, phase_id: u32) {
        self.phases.entry(phase_id).or_insert_with(PhaseMetrics::new);
    }

    /// Record one counted attempt and its coverage.
    pub fn record_attempt(&mut self, phase_id: u32, coverage: f64) {
        let phase = self.phase(phase_id);
        phase.attempts += 1;
        phase.final_coverage = coverage;
        self.total_attempts += 1;
    }

    /// Attach the implicit phase-transition snapshot. Not an attempt.
    pub fn record_implicit(&mut self, phase_id: u32, feedback: &Feedback) {
        self.phase(phase_id).implicit_evaluation = Some(feedback.clone());
    }

    pub fn complete_phase(&mut self, phase_id: u32) {
        let phase = self.phase(phase_id);
        phase.status = Some(PhaseOutcome::Valid);
        phase.final_coverage = 1.0;
        phase.ended = Some(Instant::now());
    }

    pub fn fail_phase(&mut self, phase_id: u32) {
        self.close_phase(phase_id, PhaseOutcome::Failed);
    }

    pub fn error_phase(&mut self, phase_id: u32) {
        self.close_phase(phase_id, PhaseOutcome::Error);
    }

    pub fn abort_phase(&mut self, phase_id: u32) {
        self.close_phase(phase_id, PhaseOutcome::Aborted);
    }

    fn close_phase(&mut self, phase_id: u32, outcome: PhaseOutcome) {
        let phase = self.phase(phase_id);
        phase.status = Some(outcome);
        phase.ended = Some(Instant::now());
    }

    fn phase(&mut self, phase_id: u32) -> &mut PhaseMetrics {
        self.phases.entry(phase_id).or_insert_with(PhaseMetrics::new)
    }

    /// Build the final report. Phases appear in id order; only entered
    /// phases appear at all.
    pub fn report(&self, status: RunStatus) -> RunReport {
        let now = Instant::now();
        let phases: Vec<PhaseReport> = self
            .phases
            .iter()
            .map(|(phase_id, phase)| PhaseReport {
                phase_id: *phase_id,
                status: phase.status.unwrap_or(match status {
                    RunStatus::Aborted => PhaseOutcome::Aborted,
                    RunStatus::Error => PhaseOutcome::Error,
                    _ => PhaseOutcome::Failed,
                }),
                attempts: phase.attempts,
                final_coverage: phase.final_coverage,
                duration_seconds: phase
                    .ended
                    .unwrap_or(now)
                    .duration_since(phase.started)
                    .as_secs_f64(),
                implicit_evaluation: phase.implicit_evaluation.clone(),
            })
            .collect();

        let phases_completed = phases
            .iter()
            .filter(|phase| phase.status == PhaseOutcome::Valid)
            .count() as u32;

        RunReport {
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            phases,
            overall: OverallReport {
                status,
                total_attempts: self.total_attempts,
                phases_completed,
                total_duration_seconds: now.duration_since(self.started).as_secs_f64(),
            },
        }
    }
}
