//! Engine-level and check-level error types.
//!
//! [`EngineError`] is the only error that escapes a call into the engine.
//! [`CheckError`] never escapes: it is rendered into the failing
//! [`Verdict`](crate::Verdict) of the one test that caused it.

use thiserror::Error;

/// Errors returned by [`ChallengeEngine`](crate::ChallengeEngine) and
/// [`Executor`](crate::Executor) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine was disposed; no further calls are accepted.
    #[error("engine has been disposed")]
    Disposed,

    /// No sandbox worker could be obtained for this run.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
}

/// Per-test evaluation failures.
///
/// The `Display` text is exactly the `error` string of the resulting verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("Unknown test type")]
    UnknownKind(String),

    #[error("Unknown runtime assertion")]
    UnknownRuntimeAssertion(String),

    #[error("Unknown static assertion")]
    UnknownStaticAssertion(String),

    #[error("Parse error")]
    ParseError,

    #[error("Invalid regex")]
    InvalidRegex,

    /// The sandbox run failed; carries its error message verbatim.
    #[error("{0}")]
    ExecutionFailed(String),
}
