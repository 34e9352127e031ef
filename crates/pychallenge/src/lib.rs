// pychallenge: grades learner Python against lesson checks inside a RustPython sandbox.

pub mod cache;
pub mod check;
pub mod engine;
pub mod error;
pub mod modules;
pub mod output;
pub mod pattern;
pub mod runtime;
pub mod sandbox;
pub mod structure;
pub mod summary;
pub mod timeout;
pub mod types;
pub(crate) mod vm;

pub use check::TestKind;
pub use engine::{ChallengeEngine, EngineState};
pub use error::{CheckError, EngineError};
pub use modules::ModuleAllowlist;
pub use runtime::RuntimeAssertion;
pub use sandbox::{Executor, SandboxExecutor};
pub use structure::{SourceFacts, StaticAssertion};
pub use summary::{BatchSummary, LessonStep};
pub use types::{
    ExecutionError, ExecutionResult, ExecutionSettings, TestSpec, Verdict, DEFAULT_ALLOWED_MODULES,
};
