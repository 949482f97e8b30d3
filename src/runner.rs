//! Top-level run state machine.
//!
//! Drives the `phase → attempt* → advance or terminate` loop: reads the
//! agent's solution through the workspace broker, obtains a callable from
//! the sandbox, hands it to the evaluator, publishes feedback, and applies
//! the termination rules. On every phase transition the inherited solution
//! gets one free implicit evaluation against the new phase, reported inside
//! the phase announcement and never counted as an attempt.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::feedback::{FeedbackInput, build_feedback};
use crate::core::model::{AttemptStatus, ErrorInfo, Feedback, Phase, PhaseView, RuleView};
use crate::core::obfuscate::obfuscate_scope;
use crate::evaluate::Evaluator;
use crate::io::sandbox::{LoadOutcome, LoadRequest, Sandbox};
use crate::io::task::TaskBundle;
use crate::io::workspace::{QuitSignal, WaitOutcome, Workspace};
use crate::metrics::{MetricsCollector, RunReport, RunStatus};

/// Caller-facing run parameters.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub agent_id: String,
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            agent_id: "unknown".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Progress notifications for CLI rendering.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started {
        task_name: String,
        total_phases: u32,
        solution_path: PathBuf,
    },
    AttemptEvaluated {
        phase_id: u32,
        attempt_in_phase: u32,
        feedback: Feedback,
    },
    PhaseCompleted {
        phase_id: u32,
    },
    /// A new phase was announced; the agent has work to do.
    PhaseEntered {
        phase_id: u32,
        implicit: Feedback,
    },
    /// The inherited solution already satisfies the new phase.
    PhasePassedThrough {
        phase_id: u32,
    },
}

/// One task run over one workspace.
pub struct Runner<'a, S: Sandbox> {
    bundle: &'a TaskBundle,
    evaluator: &'a Evaluator,
    sandbox: &'a S,
    workspace: Workspace,
    options: RunOptions,
    metrics: MetricsCollector,
    phase_idx: usize,
    total_attempts: u32,
    phase_attempts: u32,
    /// Most recent counted feedback; the baseline for every delta.
    last_counted: Option<Feedback>,
}

impl<'a, S: Sandbox> Runner<'a, S> {
    pub fn new(
        bundle: &'a TaskBundle,
        evaluator: &'a Evaluator,
        sandbox: &'a S,
        workspace_root: &Path,
        options: RunOptions,
    ) -> Result<Self> {
        let workspace = Workspace::create(workspace_root)?;
        let metrics = MetricsCollector::new(bundle.config.id.as_str(), options.agent_id.as_str());
        Ok(Self {
            bundle,
            evaluator,
            sandbox,
            workspace,
            options,
            metrics,
            phase_idx: 0,
            total_attempts: 0,
            phase_attempts: 0,
            last_counted: None,
        })
    }

    /// Interactive mode: watch `solution.py` until the task terminates.
    pub fn run_interactive(
        &mut self,
        quit: &QuitSignal,
        mut on_event: impl FnMut(&RunEvent),
    ) -> Result<RunReport> {
        let outcome = self.drive_interactive(quit, &mut on_event);
        self.finish(outcome)
    }

    /// Single mode: evaluate the existing solution exactly once.
    pub fn run_single(&mut self, mut on_event: impl FnMut(&RunEvent)) -> Result<RunReport> {
        let outcome = self.drive_single(&mut on_event);
        self.finish(outcome)
    }

    /// Emit the terminal report; on internal errors, close the current
    /// phase as errored and still leave a best-effort report behind.
    fn finish(&mut self, outcome: Result<RunStatus>) -> Result<RunReport> {
        match outcome {
            Ok(status) => {
                let report = self.metrics.report(status);
                self.workspace.write_report(&report)?;
                info!(status = ?status, attempts = report.overall.total_attempts, "run finished");
                Ok(report)
            }
            Err(err) => {
                self.metrics.error_phase(self.current_phase().id);
                let report = self.metrics.report(RunStatus::Error);
                let _ = self.workspace.write_report(&report);
                Err(err)
            }
        }
    }

    fn drive_interactive(
        &mut self,
        quit: &QuitSignal,
        on_event: &mut impl FnMut(&RunEvent),
    ) -> Result<RunStatus> {
        self.publish_initial(on_event)?;

        // Start from the current content so the initial (usually empty)
        // file is never treated as an attempt.
        let mut last_evaluated = self.workspace.solution_state()?;

        loop {
            if self.total_attempts >= self.bundle.config.limits.max_total_attempts {
                self.metrics.fail_phase(self.current_phase().id);
                return Ok(RunStatus::Failed);
            }

            match self.workspace.wait_for_solution(
                &last_evaluated,
                self.options.poll_interval,
                quit,
            )? {
                WaitOutcome::Quit => {
                    self.metrics.abort_phase(self.current_phase().id);
                    return Ok(RunStatus::Aborted);
                }
                WaitOutcome::NewSolution { source, state } => {
                    last_evaluated = state;
                    let feedback = self.run_attempt(&source)?;
                    on_event(&RunEvent::AttemptEvaluated {
                        phase_id: self.current_phase().id,
                        attempt_in_phase: self.phase_attempts,
                        feedback: feedback.clone(),
                    });
                    if let Some(status) = self.after_attempt(&feedback, &source, on_event)? {
                        return Ok(status);
                    }
                }
            }
        }
    }

    fn drive_single(&mut self, on_event: &mut impl FnMut(&RunEvent)) -> Result<RunStatus> {
        self.publish_initial(on_event)?;
        let source = self.workspace.read_solution()?;
        let feedback = self.run_attempt(&source)?;
        on_event(&RunEvent::AttemptEvaluated {
            phase_id: self.current_phase().id,
            attempt_in_phase: self.phase_attempts,
            feedback: feedback.clone(),
        });

        // Terminate after the one attempt regardless of outcome: the run
        // only completes when that attempt satisfies the final phase.
        let phase_id = self.current_phase().id;
        if feedback.status == AttemptStatus::Valid {
            self.metrics.complete_phase(phase_id);
            on_event(&RunEvent::PhaseCompleted { phase_id });
            if self.phase_idx + 1 == self.bundle.config.phases.len() {
                return Ok(RunStatus::Completed);
            }
            return Ok(RunStatus::Failed);
        }
        self.metrics.fail_phase(phase_id);
        Ok(RunStatus::Failed)
    }

    fn current_phase(&self) -> &'a Phase {
        &self.bundle.config.phases[self.phase_idx]
    }

    fn publish_initial(&mut self, on_event: &mut impl FnMut(&RunEvent)) -> Result<()> {
        self.workspace.write_problem(&self.bundle.problem)?;
        self.workspace.write_task(&self.bundle.config.task_view())?;
        self.metrics.enter_phase(self.current_phase().id);
        self.publish_phase(None)?;
        on_event(&RunEvent::Started {
            task_name: self.bundle.config.name.clone(),
            total_phases: self.bundle.config.phases.len() as u32,
            solution_path: self.workspace.solution_path(),
        });
        Ok(())
    }

    fn publish_phase(&self, implicit: Option<Feedback>) -> Result<()> {
        let phase = self.current_phase();
        let limits = self.bundle.config.limits;
        let rules = phase
            .rules
            .iter()
            .map(|rule| RuleView {
                id: rule.id.clone(),
                description: rule.description.clone(),
                scopes: rule.scopes.iter().map(|scope| obfuscate_scope(scope)).collect(),
            })
            .collect();
        let view = PhaseView {
            phase_id: phase.id,
            description: phase.description.clone(),
            rules,
            implicit_evaluation: implicit,
            attempts_used_this_phase: self.phase_attempts,
            attempts_remaining_this_phase: limits
                .max_attempts_per_phase
                .saturating_sub(self.phase_attempts),
            total_attempts_remaining: limits.max_total_attempts.saturating_sub(self.total_attempts),
        };
        self.workspace.write_phase(&view)
    }

    /// Evaluate `source` against the current phase without touching any
    /// counters. `attempt_id` is `None` for implicit evaluations.
    fn evaluate_solution(&self, source: &str, attempt_id: Option<u32>) -> Result<Feedback> {
        let config = &self.bundle.config;
        let phase = self.current_phase();
        let request = LoadRequest {
            source,
            function_name: &config.interface.function_name,
            allowed_imports: &config.interface.allowed_imports,
            timeout: Duration::from_secs_f64(config.execution.timeout_seconds),
        };

        let outcome = self.sandbox.load(&request)?;
        let mut solution = match outcome {
            LoadOutcome::Loaded(solution) => solution,
            LoadOutcome::Rejected(load_error) => {
                debug!(kind = load_error.kind.as_str(), "solution rejected");
                return Ok(build_feedback(FeedbackInput {
                    phase,
                    attempt_id,
                    raw_violations: &[],
                    coverage: 0.0,
                    live_tests: 0,
                    prior: self.last_counted.as_ref(),
                    error: Some(ErrorInfo {
                        kind: load_error.kind.as_str().to_string(),
                        message: load_error.message,
                        phase: "execution".to_string(),
                    }),
                }));
            }
        };

        match self
            .evaluator
            .evaluate(solution.as_mut(), &self.bundle.tests, phase)
        {
            Ok(evaluation) => Ok(build_feedback(FeedbackInput {
                phase,
                attempt_id,
                raw_violations: &evaluation.raw_violations,
                coverage: evaluation.coverage,
                live_tests: evaluation.live_tests,
                prior: self.last_counted.as_ref(),
                error: None,
            })),
            Err(err) => Ok(build_feedback(FeedbackInput {
                phase,
                attempt_id,
                raw_violations: &[],
                coverage: 0.0,
                live_tests: 0,
                prior: self.last_counted.as_ref(),
                error: Some(ErrorInfo {
                    kind: "RuntimeException".to_string(),
                    message: err.to_string(),
                    phase: "evaluation".to_string(),
                }),
            })),
        }
    }

    /// One counted attempt: evaluate, bump counters, publish feedback.
    fn run_attempt(&mut self, source: &str) -> Result<Feedback> {
        let attempt_id = self.total_attempts + 1;
        let feedback = self.evaluate_solution(source, Some(attempt_id))?;
        self.total_attempts += 1;
        self.phase_attempts += 1;
        self.metrics
            .record_attempt(self.current_phase().id, feedback.summary.coverage);
        self.workspace.write_feedback(&feedback)?;
        self.last_counted = Some(feedback.clone());
        debug!(
            attempt_id,
            phase = self.current_phase().id,
            status = ?feedback.status,
            coverage = feedback.summary.coverage,
            "attempt evaluated"
        );
        Ok(feedback)
    }

    /// Apply the termination rules after a counted attempt, in priority
    /// order: satisfaction first, then the phase budget, then the task
    /// budget. Returns the terminal status, or `None` to keep going.
    fn after_attempt(
        &mut self,
        feedback: &Feedback,
        source: &str,
        on_event: &mut impl FnMut(&RunEvent),
    ) -> Result<Option<RunStatus>> {
        let limits = self.bundle.config.limits;
        let phase_id = self.current_phase().id;

        if feedback.status == AttemptStatus::Valid {
            self.metrics.complete_phase(phase_id);
            on_event(&RunEvent::PhaseCompleted { phase_id });
            return self.advance(source, on_event);
        }
        if self.phase_attempts >= limits.max_attempts_per_phase {
            info!(phase = phase_id, "phase attempt budget exhausted");
            self.metrics.fail_phase(phase_id);
            return Ok(Some(RunStatus::Failed));
        }
        if self.total_attempts >= limits.max_total_attempts {
            info!("total attempt budget exhausted");
            self.metrics.fail_phase(phase_id);
            return Ok(Some(RunStatus::Failed));
        }
        Ok(None)
    }

    /// Move past a satisfied phase.
    ///
    /// Each new phase gets a free implicit evaluation of the inherited
    /// solution; a `valid` implicit result auto-passes that phase with zero
    /// attempts and the advance cascades. The phase announcement is always
    /// published, so pass-throughs still leave a record for the agent.
    fn advance(
        &mut self,
        source: &str,
        on_event: &mut impl FnMut(&RunEvent),
    ) -> Result<Option<RunStatus>> {
        loop {
            if self.phase_idx + 1 >= self.bundle.config.phases.len() {
                return Ok(Some(RunStatus::Completed));
            }
            self.phase_idx += 1;
            self.phase_attempts = 0;
            let phase_id = self.current_phase().id;
            self.metrics.enter_phase(phase_id);

            let implicit = self
                .evaluate_solution(source, None)
                .with_context(|| format!("implicit evaluation for phase {phase_id}"))?;
            self.metrics.record_implicit(phase_id, &implicit);
            self.publish_phase(Some(implicit.clone()))?;

            if implicit.status == AttemptStatus::Valid {
                self.metrics.complete_phase(phase_id);
                on_event(&RunEvent::PhasePassedThrough { phase_id });
                continue;
            }
            on_event(&RunEvent::PhaseEntered { phase_id, implicit });
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{
        Difficulty, ExecutionConfig, Interface, Limits, Rule, TaskConfig, TestCase,
    };
    use crate::test_support::{ScriptedSandbox, pure_solution};
    use serde_json::{Value, json};
    use tempfile::tempdir;

    fn bundle() -> TaskBundle {
        TaskBundle {
            config: TaskConfig {
                id: "echo".to_string(),
                name: "Echo".to_string(),
                difficulty: Difficulty::Easy,
                interface: Interface {
                    function_name: "echo".to_string(),
                    signature: "def echo(x)".to_string(),
                    allowed_imports: Vec::new(),
                },
                execution: ExecutionConfig {
                    timeout_seconds: 5.0,
                },
                limits: Limits {
                    max_attempts_per_phase: 3,
                    max_total_attempts: 6,
                },
                phases: vec![Phase {
                    id: 0,
                    description: "echo the input".to_string(),
                    rules: vec![Rule {
                        id: "correct_output".to_string(),
                        description: "output equals input".to_string(),
                        scopes: vec!["round_trip".to_string()],
                    }],
                }],
            },
            problem: "# Echo\n".to_string(),
            tests: vec![TestCase {
                input: json!(1),
                expected: json!(1),
                phase: 0,
                tags: vec!["round_trip".to_string()],
            }],
        }
    }

    #[test]
    fn publish_obfuscates_rule_scopes() {
        let temp = tempdir().expect("tempdir");
        let bundle = bundle();
        let evaluator = Evaluator::standard();
        let sandbox = ScriptedSandbox::new();
        let mut runner = Runner::new(
            &bundle,
            &evaluator,
            &sandbox,
            temp.path(),
            RunOptions::default(),
        )
        .expect("runner");

        runner.publish_initial(&mut |_| {}).expect("publish");

        let phase_json =
            std::fs::read_to_string(temp.path().join("phase.json")).expect("read phase.json");
        let view: Value = serde_json::from_str(&phase_json).expect("parse");
        let scope = view["rules"][0]["scopes"][0].as_str().expect("scope");
        assert!(scope.starts_with("scope_"));
        assert_ne!(scope, "round_trip");
        assert_eq!(view["attempts_remaining_this_phase"], 3);
        assert_eq!(view["total_attempts_remaining"], 6);
    }

    #[test]
    fn single_mode_with_blank_solution_reports_error() {
        let temp = tempdir().expect("tempdir");
        let bundle = bundle();
        let evaluator = Evaluator::standard();
        let sandbox = ScriptedSandbox::new();
        let mut runner = Runner::new(
            &bundle,
            &evaluator,
            &sandbox,
            temp.path(),
            RunOptions::default(),
        )
        .expect("runner");

        let report = runner.run_single(|_| {}).expect("run");
        assert_eq!(report.overall.status, RunStatus::Failed);
        assert_eq!(report.overall.total_attempts, 1);

        let feedback: Feedback = serde_json::from_str(
            &std::fs::read_to_string(temp.path().join("feedback.json")).expect("read feedback"),
        )
        .expect("parse feedback");
        assert_eq!(feedback.status, AttemptStatus::Error);
        assert_eq!(feedback.attempt_id, Some(1));
        let error = feedback.error.expect("error info");
        assert_eq!(error.kind, "MissingFunction");
    }

    #[test]
    fn single_mode_completes_on_valid_final_phase() {
        let temp = tempdir().expect("tempdir");
        let bundle = bundle();
        let evaluator = Evaluator::standard();
        let sandbox = ScriptedSandbox::new()
            .program("echo-v1", || Box::new(pure_solution(|input| input.clone())));
        let mut runner = Runner::new(
            &bundle,
            &evaluator,
            &sandbox,
            temp.path(),
            RunOptions::default(),
        )
        .expect("runner");

        std::fs::write(temp.path().join("solution.py"), "echo-v1").expect("write solution");
        let report = runner.run_single(|_| {}).expect("run");

        assert_eq!(report.overall.status, RunStatus::Completed);
        assert_eq!(report.overall.phases_completed, 1);
        assert!(temp.path().join("report.json").exists());
    }

    #[test]
    fn task_view_reflects_the_descriptor() {
        let bundle = bundle();
        let view = bundle.config.task_view();
        assert_eq!(view.task_id, "echo");
        assert_eq!(view.total_phases, 1);
        assert_eq!(view.limits.max_total_attempts, 6);
    }
}
