//! Sandboxed execution of agent-submitted solutions.
//!
//! The sandbox is a child interpreter process speaking JSON lines over
//! stdin/stdout (one process per loaded solution, so every load gets a fresh
//! scope). The host side enforces all deadlines: a reader thread feeds lines
//! into a channel and each request is a `recv_timeout` on that channel; on
//! expiry the child is killed. The sandbox is a correctness barrier, not a
//! security one.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

const DRIVER_SOURCE: &str = include_str!("sandbox_driver.py");

/// Grace period for a clean child shutdown before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Why a solution could not be turned into a callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    Syntax,
    MissingFunction,
    ImportViolation,
    Timeout,
    Runtime,
}

impl LoadErrorKind {
    /// Wire taxonomy name, as embedded in `Feedback.error.type`.
    pub fn as_str(self) -> &'static str {
        match self {
            LoadErrorKind::Syntax => "SyntaxError",
            LoadErrorKind::MissingFunction => "MissingFunction",
            LoadErrorKind::ImportViolation => "ImportViolation",
            LoadErrorKind::Timeout => "Timeout",
            LoadErrorKind::Runtime => "RuntimeException",
        }
    }
}

/// A failed sandbox call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The call exceeded the wall-clock budget; the sandbox was killed.
    Timeout { seconds: f64 },
    /// The solution raised; carries the exception class name and message.
    Runtime { exception: String, message: String },
}

/// Output of a successful sandbox call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    /// The solution's return value.
    pub value: Value,
    /// The argument as the solution left it, for mutation detection.
    pub input_after: Value,
}

/// One loaded solution callable.
///
/// Lives for a single evaluator pass. State inside the solution (closures,
/// module-level caches) persists across calls within that pass.
pub trait Solution {
    fn call(&mut self, input: &Value) -> std::result::Result<CallOutput, CallError>;
}

/// Parameters for loading a solution.
#[derive(Debug)]
pub struct LoadRequest<'a> {
    pub source: &'a str,
    pub function_name: &'a str,
    pub allowed_imports: &'a [String],
    /// Wall-clock budget for the load itself and for each later call.
    pub timeout: Duration,
}

/// Result of a load: either a callable or a structured rejection.
///
/// Host-environment failures (interpreter missing, driver crash before
/// responding) surface as `Err` instead; they are operator problems, not
/// solution problems.
pub enum LoadOutcome {
    Loaded(Box<dyn Solution>),
    Rejected(LoadError),
}

/// Loads solution source into a callable under import and timeout policy.
pub trait Sandbox {
    fn load(&self, request: &LoadRequest<'_>) -> Result<LoadOutcome>;
}

/// Sandbox backed by a child interpreter process per loaded solution.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    interpreter: String,
}

impl ProcessSandbox {
    pub const DEFAULT_INTERPRETER: &'static str = "python3";

    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERPRETER)
    }
}

impl Sandbox for ProcessSandbox {
    fn load(&self, request: &LoadRequest<'_>) -> Result<LoadOutcome> {
        let mut session = DriverSession::spawn(&self.interpreter)
            .with_context(|| format!("spawn sandbox interpreter '{}'", self.interpreter))?;

        let load = DriverRequest::Load {
            source: request.source,
            function_name: request.function_name,
            allowed_imports: request.allowed_imports,
        };
        let response = match session.roundtrip(&load, request.timeout) {
            Ok(response) => response,
            Err(SessionError::Timeout) => {
                return Ok(LoadOutcome::Rejected(LoadError {
                    kind: LoadErrorKind::Timeout,
                    message: format!(
                        "loading timed out after {} seconds",
                        request.timeout.as_secs_f64()
                    ),
                }));
            }
            Err(SessionError::Closed) => {
                anyhow::bail!("sandbox driver exited before responding to load");
            }
        };

        match response.error {
            None => {
                debug!(function = request.function_name, "solution loaded");
                Ok(LoadOutcome::Loaded(Box::new(ProcessSolution {
                    session,
                    timeout: request.timeout,
                })))
            }
            Some(error) => Ok(LoadOutcome::Rejected(LoadError {
                kind: load_error_kind(&error.kind),
                message: error.message,
            })),
        }
    }
}

fn load_error_kind(wire: &str) -> LoadErrorKind {
    match wire {
        "SyntaxError" => LoadErrorKind::Syntax,
        "MissingFunction" => LoadErrorKind::MissingFunction,
        "ImportViolation" => LoadErrorKind::ImportViolation,
        "Timeout" => LoadErrorKind::Timeout,
        _ => LoadErrorKind::Runtime,
    }
}

struct ProcessSolution {
    session: DriverSession,
    timeout: Duration,
}

impl Solution for ProcessSolution {
    fn call(&mut self, input: &Value) -> std::result::Result<CallOutput, CallError> {
        let request = DriverRequest::Call { input };
        match self.session.roundtrip(&request, self.timeout) {
            Ok(response) => match response.error {
                None => Ok(CallOutput {
                    value: response.value.unwrap_or(Value::Null),
                    input_after: response.input_after.unwrap_or(Value::Null),
                }),
                Some(error) => Err(CallError::Runtime {
                    exception: error.exception.unwrap_or_else(|| "RuntimeException".to_string()),
                    message: error.message,
                }),
            },
            Err(SessionError::Timeout) => Err(CallError::Timeout {
                seconds: self.timeout.as_secs_f64(),
            }),
            Err(SessionError::Closed) => Err(CallError::Runtime {
                exception: "RuntimeError".to_string(),
                message: "sandbox process terminated".to_string(),
            }),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum DriverRequest<'a> {
    Load {
        source: &'a str,
        function_name: &'a str,
        allowed_imports: &'a [String],
    },
    Call {
        input: &'a Value,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct DriverResponse {
    #[allow(dead_code)]
    ok: bool,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    input_after: Option<Value>,
    #[serde(default)]
    error: Option<DriverError>,
}

#[derive(Debug, Deserialize)]
struct DriverError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    exception: Option<String>,
    message: String,
}

enum SessionError {
    Timeout,
    Closed,
}

/// A running driver child plus its protocol plumbing.
struct DriverSession {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
    /// Set once the child was killed or its pipe broke; no further requests.
    dead: bool,
}

impl DriverSession {
    fn spawn(interpreter: &str) -> Result<Self> {
        let mut child = Command::new(interpreter)
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn sandbox driver")?;

        let stdin = child
            .stdin
            .take()
            .context("sandbox driver stdin was not piped")?;
        let stdout = child
            .stdout
            .take()
            .context("sandbox driver stdout was not piped")?;

        let (sender, lines) = mpsc::channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else {
                    break;
                };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            lines,
            dead: false,
        })
    }

    fn roundtrip(
        &mut self,
        request: &DriverRequest<'_>,
        timeout: Duration,
    ) -> std::result::Result<DriverResponse, SessionError> {
        if self.dead {
            return Err(SessionError::Closed);
        }

        let line = serde_json::to_string(request).map_err(|_| SessionError::Closed)?;
        if writeln!(self.stdin, "{line}").is_err() || self.stdin.flush().is_err() {
            self.mark_dead();
            return Err(SessionError::Closed);
        }

        match self.lines.recv_timeout(timeout) {
            Ok(line) => match serde_json::from_str(&line) {
                Ok(response) => Ok(response),
                Err(err) => {
                    warn!(error = %err, "unparseable sandbox response");
                    self.mark_dead();
                    Err(SessionError::Closed)
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                self.mark_dead();
                Err(SessionError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.mark_dead();
                Err(SessionError::Closed)
            }
        }
    }

    fn mark_dead(&mut self) {
        self.dead = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        if self.dead {
            return;
        }
        if let Ok(line) = serde_json::to_string(&DriverRequest::Shutdown) {
            let _ = writeln!(self.stdin, "{line}");
            let _ = self.stdin.flush();
        }
        match self.child.wait_timeout(SHUTDOWN_GRACE) {
            Ok(Some(_)) => {}
            _ => {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}
