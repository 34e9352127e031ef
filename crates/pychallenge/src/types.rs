//! Foundational public types for the pychallenge engine.
//!
//! - [`ExecutionSettings`]: sandbox configuration owned by one engine
//! - [`ExecutionResult`]: the outcome of one sandboxed run
//! - [`ExecutionError`]: structured sandbox failure variants
//! - [`TestSpec`]: a lesson-authored check
//! - [`Verdict`]: the graded outcome of one [`TestSpec`]

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Python modules learner code may import by default.
///
/// Pure computation only: no filesystem, network, process or interpreter
/// introspection modules.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "math",
    "random",
    "string",
    "re",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "statistics",
];

/// Environment variable overriding [`ExecutionSettings::timeout_ns`], in milliseconds.
pub const ENV_TIMEOUT_MS: &str = "PYCHALLENGE_TIMEOUT_MS";
/// Environment variable overriding [`ExecutionSettings::max_output_bytes`].
pub const ENV_MAX_OUTPUT_BYTES: &str = "PYCHALLENGE_MAX_OUTPUT_BYTES";
/// Environment variable overriding [`ExecutionSettings::facts_cache_size`].
pub const ENV_FACTS_CACHE_SIZE: &str = "PYCHALLENGE_FACTS_CACHE_SIZE";

/// Configuration for one engine instance and its sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Wall-clock budget of a single sandboxed run, in nanoseconds.
    /// Default: 2,000,000,000 ns (2 seconds).
    pub timeout_ns: u64,

    /// Maximum number of bytes learner code may write to stdout + stderr.
    /// Default: 1,048,576 bytes (1 MiB).
    pub max_output_bytes: usize,

    /// Module names learner code may import. Any other import fails the run
    /// with [`ExecutionError::ModuleNotAllowed`].
    pub allowed_modules: Vec<String>,

    /// Number of parsed sources kept for static checks. Default: 64.
    pub facts_cache_size: usize,

    /// How long to wait for a freshly spawned worker to build its
    /// interpreter before reporting the sandbox as unavailable.
    /// Default: 30 seconds.
    pub worker_init_timeout_ns: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_ns: 2_000_000_000,
            max_output_bytes: 1_048_576,
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            facts_cache_size: 64,
            worker_init_timeout_ns: 30_000_000_000,
        }
    }
}

impl ExecutionSettings {
    /// Default settings overlaid with the `PYCHALLENGE_*` environment variables.
    ///
    /// Unset or unparseable variables leave the default in place.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values produced by `lookup` (keyed by environment variable name).
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = lookup(ENV_TIMEOUT_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.timeout_ns = ms.saturating_mul(1_000_000);
        }
        if let Some(bytes) = lookup(ENV_MAX_OUTPUT_BYTES).and_then(|v| v.trim().parse().ok()) {
            self.max_output_bytes = bytes;
        }
        if let Some(size) = lookup(ENV_FACTS_CACHE_SIZE).and_then(|v| v.trim().parse().ok()) {
            self.facts_cache_size = size;
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_ns)
    }

    pub fn worker_init_timeout(&self) -> Duration {
        Duration::from_nanos(self.worker_init_timeout_ns)
    }
}

/// The outcome of running learner code once in the sandbox.
///
/// One result is produced per [`run_tests`](crate::ChallengeEngine::run_tests)
/// call and shared by every runtime check of that batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `true` when the run completed without a fatal error.
    pub succeeded: bool,

    /// Captured stdout split into lines, in emission order.
    pub output_lines: Vec<String>,

    /// Human-readable failure, present iff `succeeded` is `false`.
    pub error_message: Option<String>,

    /// Structured failure, present iff `succeeded` is `false`.
    pub error: Option<ExecutionError>,

    /// Everything written to `sys.stderr`.
    pub stderr: String,

    /// Elapsed wall-clock time in nanoseconds.
    pub duration_ns: u64,
}

impl ExecutionResult {
    pub fn success(output_lines: Vec<String>, stderr: String, duration_ns: u64) -> Self {
        Self {
            succeeded: true,
            output_lines,
            error_message: None,
            error: None,
            stderr,
            duration_ns,
        }
    }

    pub fn failure(
        error: ExecutionError,
        output_lines: Vec<String>,
        stderr: String,
        duration_ns: u64,
    ) -> Self {
        Self {
            succeeded: false,
            output_lines,
            error_message: Some(error.message()),
            error: Some(error),
            stderr,
            duration_ns,
        }
    }

    /// A timed-out run. Partial output of the abandoned run is discarded.
    pub fn timeout(limit_ns: u64, duration_ns: u64) -> Self {
        Self::failure(
            ExecutionError::Timeout { limit_ns },
            Vec::new(),
            String::new(),
            duration_ns,
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, Some(ExecutionError::Timeout { .. }))
    }

    /// Captured stdout lines joined with `\n`.
    pub fn output_text(&self) -> String {
        self.output_lines.join("\n")
    }
}

/// Structured sandbox failures.
///
/// Serialized with an internally-tagged `"type"` discriminator:
/// ```json
/// {"type":"SyntaxError","message":"invalid syntax","line":1,"col":5}
/// {"type":"RuntimeError","message":"ZeroDivisionError: division by zero","traceback":"..."}
/// {"type":"Timeout","limit_ns":2000000000}
/// {"type":"OutputLimitExceeded","limit_bytes":1048576}
/// {"type":"ModuleNotAllowed","module_name":"socket"}
/// {"type":"SourceTooLarge","limit_bytes":65536}
/// {"type":"WorkerCrashed"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionError {
    /// The learner source could not be compiled.
    SyntaxError {
        message: String,
        /// 1-based line, or 0 if unknown.
        line: u32,
        /// 1-based column, or 0 if unknown.
        col: u32,
    },

    /// A Python exception escaped the learner code.
    RuntimeError {
        /// Final traceback line, e.g. `NameError: name 'x' is not defined`.
        message: String,
        traceback: String,
    },

    /// The run exceeded [`ExecutionSettings::timeout_ns`].
    Timeout { limit_ns: u64 },

    /// Combined output exceeded [`ExecutionSettings::max_output_bytes`].
    OutputLimitExceeded { limit_bytes: usize },

    /// Learner code imported a module outside the allowlist.
    ModuleNotAllowed { module_name: String },

    /// The source was longer than the sandbox compiles.
    SourceTooLarge { limit_bytes: usize },

    /// The worker thread died without replying.
    WorkerCrashed,
}

impl ExecutionError {
    /// Text surfaced as [`ExecutionResult::error_message`] and attached to
    /// failing runtime verdicts.
    pub fn message(&self) -> String {
        match self {
            ExecutionError::SyntaxError { message, line, col } => {
                if *line == 0 {
                    format!("SyntaxError: {message}")
                } else {
                    format!("SyntaxError: {message} (line {line}, column {col})")
                }
            }
            ExecutionError::RuntimeError { message, .. } => message.clone(),
            ExecutionError::Timeout { .. } => "Timeout".to_string(),
            ExecutionError::OutputLimitExceeded { limit_bytes } => {
                format!("Output limit exceeded: {limit_bytes} bytes")
            }
            ExecutionError::ModuleNotAllowed { module_name } => {
                format!("Module not allowed: {module_name}")
            }
            ExecutionError::SourceTooLarge { limit_bytes } => {
                format!("Source too large: limit is {limit_bytes} bytes")
            }
            ExecutionError::WorkerCrashed => "Sandbox worker crashed".to_string(),
        }
    }
}

/// One lesson-authored check.
///
/// `kind` and `assertion` stay free-form strings so that content naming an
/// unknown check still yields a verdict instead of failing to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    /// `runtime`, `static` or `pattern` (`regex` is accepted as an alias).
    #[serde(rename = "type", alias = "kind")]
    pub kind: String,
    pub assertion: String,
    #[serde(default)]
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestSpec {
    pub fn new(kind: &str, assertion: &str, expected: &str) -> Self {
        Self {
            kind: kind.to_string(),
            assertion: assertion.to_string(),
            expected: expected.to_string(),
            description: None,
        }
    }

    pub fn runtime(assertion: &str, expected: &str) -> Self {
        Self::new("runtime", assertion, expected)
    }

    pub fn structural(assertion: &str, expected: &str) -> Self {
        Self::new("static", assertion, expected)
    }

    pub fn pattern(expected: &str) -> Self {
        Self::new("pattern", "matches", expected)
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// The graded outcome of one [`TestSpec`]: a copy of the spec plus the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(rename = "type")]
    pub kind: String,
    pub assertion: String,
    pub expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Verdict {
    pub fn error(spec: &TestSpec, error: impl Into<String>) -> Self {
        Self::from_spec(spec, false, Some(error.into()))
    }

    pub fn from_spec(spec: &TestSpec, passed: bool, error: Option<String>) -> Self {
        Self {
            kind: spec.kind.clone(),
            assertion: spec.assertion.clone(),
            expected: spec.expected.clone(),
            description: spec.description.clone(),
            passed,
            error,
        }
    }

    /// The description when present, otherwise `assertion(expected)`.
    pub fn label(&self) -> String {
        match &self.description {
            Some(description) => description.clone(),
            None => format!("{}({})", self.assertion, self.expected),
        }
    }
}
