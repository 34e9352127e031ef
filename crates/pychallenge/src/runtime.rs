//! Runtime checks: assertions over the captured output of the one sandbox run.

use std::str::FromStr;

use crate::error::CheckError;
use crate::types::ExecutionResult;

/// Assertions understood by the runtime evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeAssertion {
    /// The joined output contains `expected` as a substring.
    OutputContains,
    /// The joined output, trimmed at both ends, equals `expected` exactly.
    OutputEquals,
    /// The joined output does not contain the text `error`.
    NotError,
}

impl FromStr for RuntimeAssertion {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "output_contains" => Ok(Self::OutputContains),
            "output_equals" => Ok(Self::OutputEquals),
            "not_error" => Ok(Self::NotError),
            other => Err(CheckError::UnknownRuntimeAssertion(other.to_string())),
        }
    }
}

/// Evaluates one runtime assertion against `result`.
///
/// A failed run fails every runtime assertion with the run's error message,
/// before the assertion name is even looked at.
pub fn evaluate(result: &ExecutionResult, assertion: &str, expected: &str) -> Result<bool, CheckError> {
    if !result.succeeded {
        let message = result
            .error_message
            .clone()
            .unwrap_or_else(|| "Execution failed".to_string());
        return Err(CheckError::ExecutionFailed(message));
    }

    let output = result.output_text();
    Ok(match assertion.parse::<RuntimeAssertion>()? {
        RuntimeAssertion::OutputContains => output.contains(expected),
        RuntimeAssertion::OutputEquals => output.trim() == expected,
        RuntimeAssertion::NotError => !output.contains("error"),
    })
}
