//! Rule evaluation of a loaded solution against the hidden test cases.
//!
//! The evaluator is a registry mapping rule ids to check functions with a
//! common signature. Tasks name rules in their descriptor; the standard
//! archetypes below cover the common contracts and deployments can register
//! more. Checks never see the stored test inputs directly: every sandbox
//! call serializes a fresh copy, and mutation detection compares the
//! pre-call snapshot with the argument as the solution left it.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::model::{Phase, RawViolation, TestCase};
use crate::io::sandbox::{CallError, Solution};

/// Outcome of one rule check on one test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Passed,
    Failed { scope: String },
}

impl RuleOutcome {
    pub fn failed(scope: impl Into<String>) -> Self {
        RuleOutcome::Failed {
            scope: scope.into(),
        }
    }
}

/// A rule check: one solution, one test case, one verdict.
pub type CheckFn = fn(&mut dyn Solution, &TestCase) -> RuleOutcome;

/// Result of evaluating one solution against one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// One record per failing (rule, test) pair, in evaluation order.
    pub raw_violations: Vec<RawViolation>,
    /// Fraction of live tests on which every rule passed.
    pub coverage: f64,
    /// Number of live tests the coverage was computed over.
    pub live_tests: usize,
}

/// Registry-driven evaluator.
pub struct Evaluator {
    checks: BTreeMap<String, CheckFn>,
}

impl Evaluator {
    /// Empty registry, for deployments composing their own rule set.
    pub fn new() -> Self {
        Self {
            checks: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with the standard rule archetypes.
    pub fn standard() -> Self {
        let mut evaluator = Self::new();
        evaluator.register("correct_output", check_correct_output);
        evaluator.register("no_mutation", check_no_mutation);
        evaluator.register("deterministic", check_deterministic);
        evaluator.register("correct_type", check_correct_type);
        evaluator.register("correct_error", check_correct_error);
        evaluator
    }

    pub fn register(&mut self, rule_id: impl Into<String>, check: CheckFn) {
        self.checks.insert(rule_id.into(), check);
    }

    pub fn has_check(&self, rule_id: &str) -> bool {
        self.checks.contains_key(rule_id)
    }

    /// Evaluate `solution` against every rule of `phase` over the live tests.
    ///
    /// Live tests are those introduced in `phase` or any earlier phase; a
    /// test introduced in phase k stays live forever, which is what keeps
    /// later phases from regressing earlier ones. Errors only when a rule id
    /// has no registered check (a task configuration defect).
    pub fn evaluate(
        &self,
        solution: &mut dyn Solution,
        test_cases: &[TestCase],
        phase: &Phase,
    ) -> Result<Evaluation> {
        let live: Vec<&TestCase> = test_cases
            .iter()
            .filter(|case| case.phase <= phase.id)
            .collect();
        if live.is_empty() {
            return Ok(Evaluation {
                raw_violations: Vec::new(),
                coverage: 1.0,
                live_tests: 0,
            });
        }

        let mut raw_violations = Vec::new();
        let mut tests_passed = 0usize;

        for &case in &live {
            let mut all_rules_passed = true;
            for rule in &phase.rules {
                let check = self
                    .checks
                    .get(rule.id.as_str())
                    .ok_or_else(|| anyhow!("no check registered for rule '{}'", rule.id))?;
                match check(solution, case) {
                    RuleOutcome::Passed => {}
                    RuleOutcome::Failed { scope } => {
                        all_rules_passed = false;
                        raw_violations.push(RawViolation {
                            rule_id: rule.id.clone(),
                            scope,
                        });
                    }
                }
            }
            if all_rules_passed {
                tests_passed += 1;
            }
        }

        Ok(Evaluation {
            raw_violations,
            coverage: tests_passed as f64 / live.len() as f64,
            live_tests: live.len(),
        })
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::standard()
    }
}

fn tag_scope(case: &TestCase) -> String {
    case.tags
        .first()
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

/// The error contract encoded in `expected`, if any.
///
/// A test case expecting an exception instead of a value writes
/// `{"error": {"type": "<class>", "message_contains"?: "<substring>"}}` as
/// its expected value. Such cases are owned by `correct_error`; the
/// output-shaped checks pass on them vacuously.
fn error_contract(expected: &Value) -> Option<(&str, Option<&str>)> {
    let spec = expected.get("error")?;
    let kind = spec.get("type").and_then(Value::as_str)?;
    Some((kind, spec.get("message_contains").and_then(Value::as_str)))
}

/// Output equals the expected value (structural equality).
fn check_correct_output(solution: &mut dyn Solution, case: &TestCase) -> RuleOutcome {
    if error_contract(&case.expected).is_some() {
        return RuleOutcome::Passed;
    }
    match solution.call(&case.input) {
        Ok(output) if output.value == case.expected => RuleOutcome::Passed,
        Ok(_) => RuleOutcome::failed(tag_scope(case)),
        Err(_) => RuleOutcome::failed("error"),
    }
}

/// The solution must not mutate its argument.
fn check_no_mutation(solution: &mut dyn Solution, case: &TestCase) -> RuleOutcome {
    if error_contract(&case.expected).is_some() {
        return RuleOutcome::Passed;
    }
    let snapshot = case.input.clone();
    match solution.call(&case.input) {
        Ok(output) if output.input_after == snapshot => RuleOutcome::Passed,
        Ok(output) => RuleOutcome::failed(mutation_scope(&snapshot, &output.input_after)),
        Err(_) => RuleOutcome::failed("error"),
    }
}

/// Classify a detected mutation as `nested` or `direct`.
///
/// A map whose originally-container value changed under an existing key is a
/// nested mutation; everything else (list edits, scalar replacements,
/// added/removed keys) is direct.
fn mutation_scope(original: &Value, after: &Value) -> &'static str {
    if let (Value::Object(original), Value::Object(after)) = (original, after) {
        for (key, value) in original {
            if after.get(key) != Some(value) && (value.is_object() || value.is_array()) {
                return "nested";
            }
        }
    }
    "direct"
}

/// Three calls on independent copies must agree.
fn check_deterministic(solution: &mut dyn Solution, case: &TestCase) -> RuleOutcome {
    const RUNS: usize = 3;
    if error_contract(&case.expected).is_some() {
        return RuleOutcome::Passed;
    }
    let mut first: Option<Value> = None;
    for _ in 0..RUNS {
        match solution.call(&case.input) {
            Ok(output) => match &first {
                None => first = Some(output.value),
                Some(expected) if *expected == output.value => {}
                Some(_) => return RuleOutcome::failed("ordering"),
            },
            Err(_) => return RuleOutcome::failed("error"),
        }
    }
    RuleOutcome::Passed
}

/// Return value must have the same JSON type as the expected value.
fn check_correct_type(solution: &mut dyn Solution, case: &TestCase) -> RuleOutcome {
    if error_contract(&case.expected).is_some() {
        return RuleOutcome::Passed;
    }
    match solution.call(&case.input) {
        Ok(output) if json_type(&output.value) == json_type(&case.expected) => RuleOutcome::Passed,
        Ok(_) => RuleOutcome::failed("type_check"),
        Err(_) => RuleOutcome::failed("error"),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Error-contract tests must raise the expected exception. Tests without a
/// contract pass vacuously; they belong to the output-shaped checks.
fn check_correct_error(solution: &mut dyn Solution, case: &TestCase) -> RuleOutcome {
    let Some((expected_type, expected_substring)) = error_contract(&case.expected) else {
        return RuleOutcome::Passed;
    };

    match solution.call(&case.input) {
        Ok(_) => RuleOutcome::failed(tag_scope(case)),
        Err(CallError::Runtime { exception, message }) => {
            let type_matches = exception == expected_type;
            let message_matches =
                expected_substring.is_none_or(|substring| message.contains(substring));
            if type_matches && message_matches {
                RuleOutcome::Passed
            } else {
                RuleOutcome::failed(tag_scope(case))
            }
        }
        Err(CallError::Timeout { .. }) => RuleOutcome::failed("error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Rule;
    use crate::io::sandbox::CallOutput;
    use crate::test_support::{failing_solution, fallible_solution, pure_solution, solution_with};
    use serde_json::json;

    fn phase(id: u32, rule_ids: &[&str]) -> Phase {
        Phase {
            id,
            description: format!("phase {id}"),
            rules: rule_ids
                .iter()
                .map(|rule_id| Rule {
                    id: rule_id.to_string(),
                    description: String::new(),
                    scopes: vec!["unknown".to_string()],
                })
                .collect(),
        }
    }

    fn case(input: Value, expected: Value, phase: u32, tags: &[&str]) -> TestCase {
        TestCase {
            input,
            expected,
            phase,
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
        }
    }

    #[test]
    fn only_live_tests_are_evaluated() {
        let cases = vec![
            case(json!(1), json!(1), 0, &[]),
            case(json!(2), json!(2), 1, &[]),
            case(json!(3), json!(3), 2, &[]),
        ];
        let evaluator = Evaluator::standard();
        let mut solution = pure_solution(|input| input.clone());

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(1, &["correct_output"]))
            .expect("evaluate");

        assert_eq!(evaluation.live_tests, 2);
        assert_eq!(evaluation.coverage, 1.0);
        assert!(evaluation.raw_violations.is_empty());
    }

    #[test]
    fn empty_live_set_has_full_coverage() {
        let cases = vec![case(json!(1), json!(1), 3, &[])];
        let evaluator = Evaluator::standard();
        let mut solution = pure_solution(|input| input.clone());

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["correct_output"]))
            .expect("evaluate");

        assert_eq!(evaluation.live_tests, 0);
        assert_eq!(evaluation.coverage, 1.0);
    }

    #[test]
    fn coverage_counts_whole_tests() {
        // Identity solution: passes the first case, fails the second.
        let cases = vec![
            case(json!(1), json!(1), 0, &["small"]),
            case(json!(2), json!(99), 0, &["large"]),
        ];
        let evaluator = Evaluator::standard();
        let mut solution = pure_solution(|input| input.clone());

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["correct_output"]))
            .expect("evaluate");

        assert_eq!(evaluation.coverage, 0.5);
        assert_eq!(evaluation.raw_violations.len(), 1);
        assert_eq!(evaluation.raw_violations[0].scope, "large");
    }

    #[test]
    fn correct_output_scope_falls_back_to_unknown() {
        let cases = vec![case(json!(1), json!(2), 0, &[])];
        let evaluator = Evaluator::standard();
        let mut solution = pure_solution(|input| input.clone());

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["correct_output"]))
            .expect("evaluate");

        assert_eq!(evaluation.raw_violations[0].scope, "unknown");
    }

    #[test]
    fn no_mutation_detects_direct_list_mutation() {
        let cases = vec![case(json!([1, 2]), json!([1, 2]), 0, &[])];
        let evaluator = Evaluator::standard();
        let mut solution = solution_with(|input| {
            let mut mutated = input.clone();
            mutated.as_array_mut().expect("array").push(json!(3));
            (input.clone(), mutated)
        });

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["no_mutation"]))
            .expect("evaluate");

        assert_eq!(evaluation.raw_violations.len(), 1);
        assert_eq!(evaluation.raw_violations[0].rule_id, "no_mutation");
        assert_eq!(evaluation.raw_violations[0].scope, "direct");
    }

    #[test]
    fn no_mutation_detects_nested_map_mutation() {
        let input = json!({"items": [1, 2], "name": "x"});
        let cases = vec![case(input.clone(), json!(null), 0, &[])];
        let evaluator = Evaluator::standard();
        let mut solution = solution_with(|input| {
            let mut mutated = input.clone();
            mutated["items"].as_array_mut().expect("array").push(json!(3));
            (json!(null), mutated)
        });

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["no_mutation"]))
            .expect("evaluate");

        assert_eq!(evaluation.raw_violations[0].scope, "nested");
    }

    #[test]
    fn no_mutation_passes_when_argument_is_untouched() {
        let cases = vec![case(json!({"a": 1}), json!(null), 0, &[])];
        let evaluator = Evaluator::standard();
        let mut solution = pure_solution(|_| json!(null));

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["no_mutation"]))
            .expect("evaluate");

        assert!(evaluation.raw_violations.is_empty());
        assert_eq!(evaluation.coverage, 1.0);
    }

    #[test]
    fn deterministic_fails_on_varying_output() {
        let cases = vec![case(json!(1), json!(1), 0, &[])];
        let evaluator = Evaluator::standard();
        let mut counter = 0u64;
        let mut solution = pure_solution(move |_| {
            counter += 1;
            json!(counter)
        });

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["deterministic"]))
            .expect("evaluate");

        assert_eq!(evaluation.raw_violations[0].scope, "ordering");
    }

    #[test]
    fn correct_type_compares_json_types() {
        let cases = vec![case(json!(3), json!("3"), 0, &[])];
        let evaluator = Evaluator::standard();
        let mut solution = pure_solution(|input| input.clone());

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["correct_type"]))
            .expect("evaluate");

        assert_eq!(evaluation.raw_violations[0].scope, "type_check");
    }

    #[test]
    fn correct_error_requires_matching_exception() {
        let expected = json!({"error": {"type": "ValueError", "message_contains": "negative"}});
        let cases = vec![case(json!(-1), expected, 0, &["negative_input"])];
        let evaluator = Evaluator::standard();

        let mut raising = failing_solution("ValueError", "negative value not allowed");
        let evaluation = evaluator
            .evaluate(&mut raising, &cases, &phase(0, &["correct_error"]))
            .expect("evaluate");
        assert!(evaluation.raw_violations.is_empty());

        let mut wrong_class = failing_solution("TypeError", "negative value not allowed");
        let evaluation = evaluator
            .evaluate(&mut wrong_class, &cases, &phase(0, &["correct_error"]))
            .expect("evaluate");
        assert_eq!(evaluation.raw_violations[0].scope, "negative_input");

        let mut returns = pure_solution(|_| json!(0));
        let evaluation = evaluator
            .evaluate(&mut returns, &cases, &phase(0, &["correct_error"]))
            .expect("evaluate");
        assert_eq!(evaluation.raw_violations[0].scope, "negative_input");
    }

    #[test]
    fn error_contract_tests_are_owned_by_correct_error() {
        // A phase mixing value tests and error-contract tests is satisfiable:
        // output checks pass vacuously on the contract case and correct_error
        // passes vacuously on the value cases.
        let cases = vec![
            case(json!(1), json!(1), 0, &["value"]),
            case(
                json!(-1),
                json!({"error": {"type": "ValueError"}}),
                0,
                &["negative"],
            ),
        ];
        let evaluator = Evaluator::standard();
        let mut solution = fallible_solution(|input| {
            if input.as_i64().is_some_and(|n| n < 0) {
                Err(CallError::Runtime {
                    exception: "ValueError".to_string(),
                    message: "negative input".to_string(),
                })
            } else {
                Ok(CallOutput {
                    value: input.clone(),
                    input_after: input.clone(),
                })
            }
        });

        let evaluation = evaluator
            .evaluate(
                &mut solution,
                &cases,
                &phase(0, &["correct_output", "correct_error"]),
            )
            .expect("evaluate");

        assert!(evaluation.raw_violations.is_empty());
        assert_eq!(evaluation.coverage, 1.0);
    }

    #[test]
    fn call_errors_fail_with_error_scope() {
        let cases = vec![case(json!(1), json!(1), 0, &["tagged"])];
        let evaluator = Evaluator::standard();
        let mut solution = failing_solution("RuntimeError", "boom");

        let evaluation = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["correct_output"]))
            .expect("evaluate");

        assert_eq!(evaluation.raw_violations[0].scope, "error");
        assert_eq!(evaluation.coverage, 0.0);
    }

    #[test]
    fn unregistered_rule_is_an_error() {
        let cases = vec![case(json!(1), json!(1), 0, &[])];
        let evaluator = Evaluator::standard();
        let mut solution = pure_solution(|input| input.clone());

        let err = evaluator
            .evaluate(&mut solution, &cases, &phase(0, &["made_up_rule"]))
            .expect_err("should fail");
        assert!(err.to_string().contains("made_up_rule"));
    }
}
