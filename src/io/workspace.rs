//! Workspace broker: the agent-facing file protocol.
//!
//! One directory, one runner. The agent is the sole writer of
//! `solution.py`; the runner is the sole writer of everything else. Runner
//! writes go through temp-file + rename so the agent never observes a
//! partial file, and are retried a few times before giving up.

use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::model::{Feedback, PhaseView, TaskView};
use crate::metrics::RunReport;

const PROBLEM_FILE: &str = "problem.md";
const TASK_FILE: &str = "task.json";
const PHASE_FILE: &str = "phase.json";
const SOLUTION_FILE: &str = "solution.py";
const FEEDBACK_FILE: &str = "feedback.json";
const REPORT_FILE: &str = "report.json";

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Asynchronous operator quit flag, honored at broker suspension points.
#[derive(Debug, Clone, Default)]
pub struct QuitSignal {
    flag: Arc<AtomicBool>,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Spawn a daemon thread that triggers on `q` + newline from stdin.
    pub fn listen_on_stdin(&self) {
        let signal = self.clone();
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    return;
                };
                if line.trim().eq_ignore_ascii_case("q") {
                    signal.trigger();
                    return;
                }
            }
        });
    }
}

/// Fingerprint of the solution file used for change detection.
///
/// `(mtime, size)` is the cheap poll; the content hash decides whether a
/// write is actually a new attempt, so redundant saves of identical content
/// are collapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionState {
    stamp: (Option<SystemTime>, u64),
    content_hash: String,
}

impl SolutionState {
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

/// Outcome of waiting for the next agent submission.
#[derive(Debug)]
pub enum WaitOutcome {
    NewSolution {
        source: String,
        state: SolutionState,
    },
    Quit,
}

/// An agent-visible workspace directory owned by one runner.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create the directory (if needed) and the initial empty solution file,
    /// so the watch loop has something to stat.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("create workspace {}", root.display()))?;
        let workspace = Self {
            root: root.to_path_buf(),
        };
        let solution = workspace.solution_path();
        if !solution.exists() {
            fs::write(&solution, "").with_context(|| format!("write {}", solution.display()))?;
        }
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn solution_path(&self) -> PathBuf {
        self.root.join(SOLUTION_FILE)
    }

    pub fn write_problem(&self, problem: &str) -> Result<()> {
        self.write_atomic(PROBLEM_FILE, problem)
    }

    pub fn write_task(&self, view: &TaskView) -> Result<()> {
        self.write_json(TASK_FILE, view)
    }

    pub fn write_phase(&self, view: &PhaseView) -> Result<()> {
        self.write_json(PHASE_FILE, view)
    }

    pub fn write_feedback(&self, feedback: &Feedback) -> Result<()> {
        self.write_json(FEEDBACK_FILE, feedback)
    }

    pub fn write_report(&self, report: &RunReport) -> Result<()> {
        self.write_json(REPORT_FILE, report)
    }

    /// One-shot solution read, for `--single` mode.
    pub fn read_solution(&self) -> Result<String> {
        let path = self.solution_path();
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Fingerprint the solution file as it currently stands.
    pub fn solution_state(&self) -> Result<SolutionState> {
        let source = self.read_solution()?;
        Ok(SolutionState {
            stamp: self.solution_stamp(),
            content_hash: content_hash(&source),
        })
    }

    /// Block until the agent writes a genuinely new solution or the
    /// operator quits.
    ///
    /// New means: the content hash differs from `last_evaluated` and the
    /// content is not blank. Touches that keep the content identical move
    /// the observed stamp but are not reported.
    pub fn wait_for_solution(
        &self,
        last_evaluated: &SolutionState,
        poll_interval: Duration,
        quit: &QuitSignal,
    ) -> Result<WaitOutcome> {
        let mut observed_stamp = last_evaluated.stamp;
        loop {
            if quit.is_triggered() {
                return Ok(WaitOutcome::Quit);
            }

            let stamp = self.solution_stamp();
            if stamp != observed_stamp {
                observed_stamp = stamp;
                let source = self.read_solution()?;
                let hash = content_hash(&source);
                if hash != last_evaluated.content_hash && !source.trim().is_empty() {
                    debug!(bytes = source.len(), "new solution detected");
                    return Ok(WaitOutcome::NewSolution {
                        state: SolutionState {
                            stamp,
                            content_hash: hash,
                        },
                        source,
                    });
                }
            }

            thread::sleep(poll_interval);
        }
    }

    fn solution_stamp(&self) -> (Option<SystemTime>, u64) {
        match fs::metadata(self.solution_path()) {
            Ok(meta) => (meta.modified().ok(), meta.len()),
            Err(_) => (None, 0),
        }
    }

    fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<()> {
        let mut contents = serde_json::to_string_pretty(value)
            .with_context(|| format!("serialize {file_name}"))?;
        contents.push('\n');
        self.write_atomic(file_name, &contents)
    }

    /// Temp-file + rename write, retried on transient I/O errors.
    fn write_atomic(&self, file_name: &str, contents: &str) -> Result<()> {
        let path = self.root.join(file_name);
        for attempt in 1..WRITE_ATTEMPTS {
            match try_write_atomic(&path, contents) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(path = %path.display(), attempt, error = %err, "workspace write failed");
                    thread::sleep(WRITE_RETRY_DELAY);
                }
            }
        }
        try_write_atomic(&path, contents)
            .with_context(|| format!("write {} after {WRITE_ATTEMPTS} attempts", path.display()))
    }
}

fn try_write_atomic(path: &Path, contents: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("workspace file has no name")?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn content_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}
