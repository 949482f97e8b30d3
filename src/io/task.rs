//! Task loading and descriptor validation.
//!
//! A task directory holds three files: `task.toml` (the descriptor),
//! `problem.md` (the agent-facing statement, copied verbatim into the
//! workspace), and `tests.json` (the ordered hidden test cases, validated
//! against an embedded JSON Schema before deserialization).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::model::{
    Difficulty, ExecutionConfig, Interface, Limits, Phase, TaskConfig, TestCase,
};

const TEST_CASES_SCHEMA: &str = include_str!("../../schemas/test_cases.schema.json");

/// A fully loaded task: descriptor, problem statement, and hidden tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBundle {
    pub config: TaskConfig,
    pub problem: String,
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Deserialize)]
struct TaskDoc {
    task: TaskMeta,
    interface: Interface,
    #[serde(default)]
    execution: ExecutionConfig,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    phases: Vec<Phase>,
}

#[derive(Debug, Deserialize)]
struct TaskMeta {
    id: String,
    name: String,
    difficulty: Difficulty,
}

/// Load and validate a complete task from `task_dir`.
pub fn load_task(task_dir: &Path) -> Result<TaskBundle> {
    let config = load_config(task_dir)?;
    let problem = load_problem(task_dir)?;
    let tests = load_tests(task_dir)?;
    debug!(
        task_id = %config.id,
        phases = config.phases.len(),
        tests = tests.len(),
        "task loaded"
    );
    Ok(TaskBundle {
        config,
        problem,
        tests,
    })
}

/// Load and validate the descriptor only (enough for `list`).
pub fn load_config(task_dir: &Path) -> Result<TaskConfig> {
    let descriptor_path = task_dir.join("task.toml");
    if !descriptor_path.exists() {
        bail!("task.toml not found in {}", task_dir.display());
    }
    let contents = fs::read_to_string(&descriptor_path)
        .with_context(|| format!("read {}", descriptor_path.display()))?;
    let doc: TaskDoc = toml::from_str(&contents)
        .with_context(|| format!("parse {}", descriptor_path.display()))?;

    let config = TaskConfig {
        id: doc.task.id,
        name: doc.task.name,
        difficulty: doc.task.difficulty,
        interface: doc.interface,
        execution: doc.execution,
        limits: doc.limits,
        phases: doc.phases,
    };
    validate_config(&config).with_context(|| format!("validate {}", descriptor_path.display()))?;
    Ok(config)
}

fn validate_config(config: &TaskConfig) -> Result<()> {
    if config.id.trim().is_empty() {
        bail!("task.id must be non-empty");
    }
    if config.interface.function_name.trim().is_empty() {
        bail!("interface.function_name must be non-empty");
    }
    if !(config.execution.timeout_seconds > 0.0) {
        bail!("execution.timeout_seconds must be > 0");
    }
    if config.limits.max_attempts_per_phase == 0 {
        bail!("limits.max_attempts_per_phase must be > 0");
    }
    if config.limits.max_total_attempts < config.limits.max_attempts_per_phase {
        bail!("limits.max_total_attempts must be >= max_attempts_per_phase");
    }
    if config.phases.is_empty() {
        bail!("task must declare at least one phase");
    }
    for (index, phase) in config.phases.iter().enumerate() {
        if phase.id as usize != index {
            let ids: Vec<u32> = config.phases.iter().map(|phase| phase.id).collect();
            bail!("phase ids must be contiguous starting from 0, got {ids:?}");
        }
        if phase.rules.is_empty() {
            bail!("phase {} has no rules", phase.id);
        }
        for rule in &phase.rules {
            if rule.id.trim().is_empty() {
                bail!("phase {} has a rule with an empty id", phase.id);
            }
            if rule.scopes.is_empty() {
                bail!("rule '{}' in phase {} has no scopes", rule.id, phase.id);
            }
        }
    }
    Ok(())
}

fn load_problem(task_dir: &Path) -> Result<String> {
    let problem_path = task_dir.join("problem.md");
    if !problem_path.exists() {
        bail!("problem.md not found in {}", task_dir.display());
    }
    fs::read_to_string(&problem_path).with_context(|| format!("read {}", problem_path.display()))
}

fn load_tests(task_dir: &Path) -> Result<Vec<TestCase>> {
    let tests_path = task_dir.join("tests.json");
    if !tests_path.exists() {
        bail!("tests.json not found in {}", task_dir.display());
    }
    let contents =
        fs::read_to_string(&tests_path).with_context(|| format!("read {}", tests_path.display()))?;
    let instance: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", tests_path.display()))?;
    validate_tests_schema(&instance)
        .with_context(|| format!("validate {}", tests_path.display()))?;
    let tests: Vec<TestCase> = serde_json::from_value(instance)
        .with_context(|| format!("parse {} as test cases", tests_path.display()))?;
    Ok(tests)
}

/// Validate the raw test-case JSON against the embedded schema
/// (Draft 2020-12).
fn validate_tests_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(TEST_CASES_SCHEMA).context("parse embedded test cases schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile test cases schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Summary row for the `list` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub difficulty: Difficulty,
    pub phases: usize,
    pub path: PathBuf,
}

/// Discover loadable tasks under `tasks_dir`, sorted by id.
///
/// Directories that fail to load are skipped with a warning rather than
/// failing the whole listing.
pub fn discover_tasks(tasks_dir: &Path) -> Result<Vec<TaskSummary>> {
    if !tasks_dir.exists() {
        bail!("tasks directory not found: {}", tasks_dir.display());
    }
    let mut summaries = Vec::new();
    for entry in
        fs::read_dir(tasks_dir).with_context(|| format!("read {}", tasks_dir.display()))?
    {
        let entry = entry.context("read tasks entry")?;
        let path = entry.path();
        if !path.is_dir() || !path.join("task.toml").exists() {
            continue;
        }
        match load_config(&path) {
            Ok(config) => summaries.push(TaskSummary {
                id: config.id,
                name: config.name,
                difficulty: config.difficulty,
                phases: config.phases.len(),
                path,
            }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unloadable task");
            }
        }
    }
    summaries.sort_by(|left, right| left.id.cmp(&right.id));
    Ok(summaries)
}
