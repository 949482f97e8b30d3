//! Hidden-requirement coding benchmark engine.
//!
//! A task is a single function specification whose full correctness
//! criteria are never disclosed. The agent discovers them from structured
//! violation feedback across an escalating sequence of phases: each phase
//! adds rules the previous solution typically breaks. This crate is the
//! task execution engine: it loads a task, watches a workspace for agent
//! submissions, runs them in a sandboxed child interpreter, evaluates them
//! against hidden test cases, and emits per-task metrics.
//!
//! The workspace file protocol is the only interface the agent sees; see
//! the `io::workspace` module for the file set and its atomicity rules.

pub mod core;
pub mod evaluate;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod metrics;
pub mod runner;
pub mod validate;

#[cfg(test)]
mod test_support;
