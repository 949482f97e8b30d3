//! Hidden-requirement benchmark CLI.
//!
//! `list` enumerates tasks, `validate` statically checks one task
//! definition, and `run` executes one task against one agent workspace.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use phasebench::evaluate::Evaluator;
use phasebench::io::sandbox::ProcessSandbox;
use phasebench::io::task::{discover_tasks, load_task};
use phasebench::io::workspace::QuitSignal;
use phasebench::runner::{RunEvent, RunOptions, Runner};
use phasebench::validate::validate_task;
use phasebench::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "phasebench",
    version,
    about = "Hidden-requirement coding benchmark runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enumerate task ids, names, difficulties, and phase counts.
    List {
        #[arg(long, default_value = "./tasks")]
        tasks_dir: PathBuf,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Structurally validate a task definition.
    Validate {
        /// Path to the task directory.
        #[arg(long)]
        task: PathBuf,
    },
    /// Run one task against one agent workspace.
    Run {
        /// Path to the task directory.
        #[arg(long)]
        task: PathBuf,
        /// Workspace directory for the file-based agent exchange.
        #[arg(long, default_value = "./workspace")]
        workspace: PathBuf,
        /// Identifier for the agent under test.
        #[arg(long, default_value = "unknown")]
        agent_id: String,
        /// Seconds between solution polls in interactive mode.
        #[arg(long, default_value_t = 1.0)]
        poll_interval: f64,
        /// Evaluate the existing solution once and exit.
        #[arg(long)]
        single: bool,
        /// Interpreter command for the sandbox child process.
        #[arg(long, default_value = ProcessSandbox::DEFAULT_INTERPRETER)]
        interpreter: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::List { tasks_dir, json } => cmd_list(&tasks_dir, json),
        Command::Validate { task } => cmd_validate(&task),
        Command::Run {
            task,
            workspace,
            agent_id,
            poll_interval,
            single,
            interpreter,
        } => cmd_run(
            &task,
            &workspace,
            agent_id,
            poll_interval,
            single,
            interpreter,
        ),
    }
}

fn cmd_list(tasks_dir: &Path, json: bool) -> Result<i32> {
    let summaries = discover_tasks(tasks_dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(exit_codes::COMPLETED);
    }
    println!("Found {} task(s):", summaries.len());
    for summary in summaries {
        println!();
        println!("  {}", summary.id);
        println!("    Name: {}", summary.name);
        println!("    Difficulty: {:?}", summary.difficulty);
        println!("    Phases: {}", summary.phases);
        println!("    Path: {}", summary.path.display());
    }
    Ok(exit_codes::COMPLETED)
}

fn cmd_validate(task_dir: &Path) -> Result<i32> {
    let evaluator = Evaluator::standard();
    let report = validate_task(task_dir, &evaluator)
        .with_context(|| format!("load task {}", task_dir.display()))?;

    for warning in &report.warnings {
        println!("[WARN] {warning}");
    }
    for error in &report.errors {
        println!("[ERROR] {error}");
    }
    if report.is_ok() {
        println!("Validation PASSED");
        Ok(exit_codes::COMPLETED)
    } else {
        println!("Validation FAILED");
        Ok(exit_codes::ERROR)
    }
}

fn cmd_run(
    task_dir: &Path,
    workspace_dir: &Path,
    agent_id: String,
    poll_interval: f64,
    single: bool,
    interpreter: String,
) -> Result<i32> {
    let bundle = load_task(task_dir)?;
    let evaluator = Evaluator::standard();
    let sandbox = ProcessSandbox::new(interpreter);
    let options = RunOptions {
        agent_id,
        poll_interval: Duration::from_secs_f64(poll_interval.max(0.01)),
    };
    let mut runner = Runner::new(&bundle, &evaluator, &sandbox, workspace_dir, options)?;

    let report = if single {
        runner.run_single(render_event)?
    } else {
        let quit = QuitSignal::new();
        quit.listen_on_stdin();
        runner.run_interactive(&quit, render_event)?
    };

    println!();
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!(
        "Report saved to: {}",
        workspace_dir.join("report.json").display()
    );
    Ok(exit_codes::for_status(report.overall.status))
}

fn render_event(event: &RunEvent) {
    match event {
        RunEvent::Started {
            task_name,
            total_phases,
            solution_path,
        } => {
            println!("Starting task: {task_name}");
            println!("Total phases: {total_phases}");
            println!("Waiting for solution in: {}", solution_path.display());
            println!("Type 'q' + Enter to quit");
            println!();
        }
        RunEvent::AttemptEvaluated {
            phase_id,
            attempt_in_phase,
            feedback,
        } => {
            println!(
                "Phase {phase_id}, attempt {attempt_in_phase}: {} (coverage {:.1}%)",
                status_label(feedback.status),
                feedback.summary.coverage * 100.0
            );
            for violation in &feedback.violations {
                println!(
                    "  - {} ({}): {}",
                    violation.rule_id, violation.scope, violation.count
                );
            }
            if let Some(error) = &feedback.error {
                println!("  error: {}: {}", error.kind, error.message);
            }
        }
        RunEvent::PhaseCompleted { phase_id } => {
            println!("Phase {phase_id} completed!");
        }
        RunEvent::PhaseEntered { phase_id, implicit } => {
            println!(
                "Advancing to phase {phase_id} (implicit evaluation: {}, coverage {:.1}%)",
                status_label(implicit.status),
                implicit.summary.coverage * 100.0
            );
        }
        RunEvent::PhasePassedThrough { phase_id } => {
            println!("Phase {phase_id} already satisfied by the current solution.");
        }
    }
}

fn status_label(status: phasebench::core::model::AttemptStatus) -> &'static str {
    use phasebench::core::model::AttemptStatus;
    match status {
        AttemptStatus::Valid => "valid",
        AttemptStatus::PartiallyValid => "partially_valid",
        AttemptStatus::Invalid => "invalid",
        AttemptStatus::Error => "error",
    }
}
