//! Scripted sandbox and solution fakes for unit tests.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;

use crate::io::sandbox::{
    CallError, CallOutput, LoadError, LoadErrorKind, LoadOutcome, LoadRequest, Sandbox, Solution,
};

/// A solution whose behavior is an arbitrary closure.
pub struct FnSolution {
    behavior: Box<dyn FnMut(&Value) -> Result<CallOutput, CallError>>,
}

impl Solution for FnSolution {
    fn call(&mut self, input: &Value) -> Result<CallOutput, CallError> {
        (self.behavior)(input)
    }
}

/// Solution computing a value from its input without touching the argument.
pub fn pure_solution(mut f: impl FnMut(&Value) -> Value + 'static) -> FnSolution {
    FnSolution {
        behavior: Box::new(move |input| {
            Ok(CallOutput {
                value: f(input),
                input_after: input.clone(),
            })
        }),
    }
}

/// Solution returning `(value, input_after)` pairs, for mutation scenarios.
pub fn solution_with(mut f: impl FnMut(&Value) -> (Value, Value) + 'static) -> FnSolution {
    FnSolution {
        behavior: Box::new(move |input| {
            let (value, input_after) = f(input);
            Ok(CallOutput { value, input_after })
        }),
    }
}

/// Solution with full control over each call's result.
pub fn fallible_solution(
    f: impl FnMut(&Value) -> Result<CallOutput, CallError> + 'static,
) -> FnSolution {
    FnSolution {
        behavior: Box::new(f),
    }
}

/// Solution that always raises the given exception.
pub fn failing_solution(exception: &str, message: &str) -> FnSolution {
    let exception = exception.to_string();
    let message = message.to_string();
    FnSolution {
        behavior: Box::new(move |_| {
            Err(CallError::Runtime {
                exception: exception.clone(),
                message: message.clone(),
            })
        }),
    }
}

type SolutionFactory = Box<dyn Fn() -> Box<dyn Solution>>;

/// Sandbox that treats the solution source as a key into scripted programs.
///
/// Unknown sources are rejected as `MissingFunction`, which is also what a
/// real sandbox reports for blank source.
#[derive(Default)]
pub struct ScriptedSandbox {
    programs: HashMap<String, SolutionFactory>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(
        mut self,
        source_key: &str,
        factory: impl Fn() -> Box<dyn Solution> + 'static,
    ) -> Self {
        self.programs.insert(source_key.to_string(), Box::new(factory));
        self
    }
}

impl Sandbox for ScriptedSandbox {
    fn load(&self, request: &LoadRequest<'_>) -> anyhow::Result<LoadOutcome> {
        match self.programs.get(request.source.trim()) {
            Some(factory) => Ok(LoadOutcome::Loaded(factory())),
            None => Ok(LoadOutcome::Rejected(LoadError {
                kind: LoadErrorKind::MissingFunction,
                message: format!(
                    "function '{}' not found in solution",
                    request.function_name
                ),
            })),
        }
    }
}
