//! The challenge engine: one sandbox run per batch, one verdict per test.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, info, warn};

use crate::cache::{FactsCache, ParsedSource};
use crate::check::TestKind;
use crate::error::{CheckError, EngineError};
use crate::sandbox::{Executor, SandboxExecutor};
use crate::types::{ExecutionSettings, TestSpec, Verdict};
use crate::{pattern, runtime, structure};

/// Lifecycle of a [`ChallengeEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Ready,
    Running,
    Disposed,
}

/// Grades learner code against a batch of [`TestSpec`]s.
///
/// The engine owns its executor and its parsed-source cache; nothing is
/// process-wide. Calls take `&mut self`, so one engine grades one batch at a
/// time. Wrap it in a `Mutex` to share it between threads.
///
/// ```no_run
/// use pychallenge::{ChallengeEngine, ExecutionSettings, TestSpec};
///
/// let mut engine = ChallengeEngine::new(ExecutionSettings::default());
/// let verdicts = engine
///     .run_tests("print('Hello, World!')", &[TestSpec::runtime("output_contains", "Hello")])
///     .unwrap();
/// assert!(verdicts[0].passed);
/// ```
pub struct ChallengeEngine<E: Executor = SandboxExecutor> {
    executor: E,
    facts: FactsCache,
    state: EngineState,
}

impl ChallengeEngine<SandboxExecutor> {
    /// Starts a sandbox worker configured by `settings`.
    pub fn new(settings: ExecutionSettings) -> Self {
        let cache_size = settings.facts_cache_size;
        Self::with_executor(SandboxExecutor::new(settings), cache_size)
    }
}

impl<E: Executor> ChallengeEngine<E> {
    pub fn with_executor(executor: E, facts_cache_size: usize) -> Self {
        info!("challenge engine ready");
        Self {
            executor,
            facts: FactsCache::new(facts_cache_size),
            state: EngineState::Ready,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn facts_cache(&self) -> &FactsCache {
        &self.facts
    }

    /// Runs `code` once and grades every test against that single run.
    ///
    /// `verdicts[i]` always corresponds to `tests[i]`. Learner faults,
    /// timeouts and content bugs all surface as failing verdicts; the only
    /// error returned is [`EngineError::Disposed`].
    pub fn run_tests(&mut self, code: &str, tests: &[TestSpec]) -> Result<Vec<Verdict>, EngineError> {
        if self.state == EngineState::Disposed {
            return Err(EngineError::Disposed);
        }
        self.state = EngineState::Running;
        let verdicts = self.grade(code, tests);
        self.state = EngineState::Ready;
        Ok(verdicts)
    }

    /// Releases the sandbox. Every later call returns [`EngineError::Disposed`].
    pub fn dispose(&mut self) -> Result<(), EngineError> {
        if self.state == EngineState::Disposed {
            return Err(EngineError::Disposed);
        }
        self.executor.shutdown();
        self.state = EngineState::Disposed;
        info!("challenge engine disposed");
        Ok(())
    }

    fn grade(&mut self, code: &str, tests: &[TestSpec]) -> Vec<Verdict> {
        let execution = match self.executor.execute(code) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, tests = tests.len(), "failing batch without a sandbox run");
                let message = e.to_string();
                return tests.iter().map(|t| Verdict::error(t, message.clone())).collect();
            }
        };
        if execution.is_timeout() {
            warn!(duration_ns = execution.duration_ns, "learner code timed out");
        }

        let mut parsed: Option<ParsedSource> = None;
        let mut verdicts = Vec::with_capacity(tests.len());
        for spec in tests {
            let outcome = match spec.kind.parse::<TestKind>() {
                Ok(TestKind::Runtime) => {
                    isolated(|| runtime::evaluate(&execution, &spec.assertion, &spec.expected))
                }
                Ok(TestKind::Static) => {
                    let facts = &mut self.facts;
                    let parsed = &mut parsed;
                    isolated(|| {
                        let parsed = &*parsed.get_or_insert_with(|| facts.get_or_parse(code));
                        structure::evaluate(parsed, code, &spec.assertion, &spec.expected)
                    })
                }
                Ok(TestKind::Pattern) => isolated(|| pattern::evaluate(code, &spec.expected)),
                Err(e) => Err(e),
            };
            verdicts.push(match outcome {
                Ok(passed) => Verdict::from_spec(spec, passed, None),
                Err(e) => Verdict::error(spec, e.to_string()),
            });
        }

        debug!(
            tests = verdicts.len(),
            passed = verdicts.iter().filter(|v| v.passed).count(),
            "batch graded"
        );
        verdicts
    }
}

impl<E: Executor> Drop for ChallengeEngine<E> {
    fn drop(&mut self) {
        if self.state != EngineState::Disposed {
            self.executor.shutdown();
        }
    }
}

/// Runs one evaluator so that a panic fails only the test that caused it.
fn isolated<F>(check: F) -> Result<bool, CheckError>
where
    F: FnOnce() -> Result<bool, CheckError>,
{
    panic::catch_unwind(AssertUnwindSafe(check)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "evaluator panicked".to_string());
        warn!(%message, "evaluator panicked");
        Err(CheckError::ExecutionFailed(format!("Internal error: {message}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionError, ExecutionResult};
    use std::cell::Cell;
    use std::rc::Rc;

    /// Returns a canned result and counts calls.
    struct FakeExecutor {
        result: Result<ExecutionResult, EngineError>,
        calls: Rc<Cell<usize>>,
        shutdowns: Rc<Cell<usize>>,
    }

    impl FakeExecutor {
        fn printing(lines: &[&str]) -> Self {
            Self::returning(Ok(ExecutionResult::success(
                lines.iter().map(|l| l.to_string()).collect(),
                String::new(),
                1,
            )))
        }

        fn returning(result: Result<ExecutionResult, EngineError>) -> Self {
            Self {
                result,
                calls: Rc::new(Cell::new(0)),
                shutdowns: Rc::new(Cell::new(0)),
            }
        }
    }

    impl Executor for FakeExecutor {
        fn execute(&mut self, _code: &str) -> Result<ExecutionResult, EngineError> {
            self.calls.set(self.calls.get() + 1);
            self.result.clone()
        }

        fn shutdown(&mut self) {
            self.shutdowns.set(self.shutdowns.get() + 1);
        }
    }

    fn engine(executor: FakeExecutor) -> ChallengeEngine<FakeExecutor> {
        ChallengeEngine::with_executor(executor, 8)
    }

    #[test]
    fn test_verdicts_follow_input_order() {
        let mut engine = engine(FakeExecutor::printing(&["Hello, World!"]));
        let tests = vec![
            TestSpec::pattern("print"),
            TestSpec::runtime("output_contains", "Goodbye"),
            TestSpec::structural("function_exists", "print"),
            TestSpec::new("unit", "x", "y"),
            TestSpec::runtime("output_contains", "Hello"),
        ];
        let verdicts = engine.run_tests("print('Hello, World!')", &tests).unwrap();
        assert_eq!(verdicts.len(), tests.len());
        for (verdict, spec) in verdicts.iter().zip(&tests) {
            assert_eq!(verdict.kind, spec.kind);
            assert_eq!(verdict.assertion, spec.assertion);
            assert_eq!(verdict.expected, spec.expected);
        }
        let passed: Vec<bool> = verdicts.iter().map(|v| v.passed).collect();
        assert_eq!(passed, vec![true, false, true, false, true]);
        assert_eq!(verdicts[3].error.as_deref(), Some("Unknown test type"));
    }

    #[test]
    fn test_sandbox_runs_once_per_batch() {
        let executor = FakeExecutor::printing(&["1", "2", "3"]);
        let calls = executor.calls.clone();
        let mut engine = engine(executor);
        let tests = vec![
            TestSpec::runtime("output_contains", "1"),
            TestSpec::runtime("output_contains", "2"),
            TestSpec::runtime("output_equals", "1\n2\n3"),
            TestSpec::runtime("not_error", ""),
        ];
        let verdicts = engine.run_tests("for i in range(1, 4): print(i)", &tests).unwrap();
        assert!(verdicts.iter().all(|v| v.passed));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_sandbox_runs_once_even_without_runtime_tests() {
        let executor = FakeExecutor::printing(&[]);
        let calls = executor.calls.clone();
        let mut engine = engine(executor);
        engine.run_tests("x = 1", &[TestSpec::pattern("x")]).unwrap();
        engine.run_tests("x = 1", &[]).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_parse_failure_does_not_touch_runtime_verdicts() {
        let mut engine = engine(FakeExecutor::printing(&["ok"]));
        let tests = vec![
            TestSpec::structural("identifier_exists", "x"),
            TestSpec::runtime("output_equals", "ok"),
            TestSpec::pattern("def"),
        ];
        let verdicts = engine.run_tests("def broken(:\n", &tests).unwrap();
        assert!(!verdicts[0].passed);
        assert_eq!(verdicts[0].error.as_deref(), Some("Parse error"));
        assert!(verdicts[1].passed);
        assert_eq!(verdicts[1].error, None);
        assert!(verdicts[2].passed);
    }

    #[test]
    fn test_static_facts_parsed_once_per_batch() {
        let mut engine = engine(FakeExecutor::printing(&[]));
        let tests = vec![
            TestSpec::structural("identifier_exists", "total"),
            TestSpec::structural("function_exists", "add"),
            TestSpec::structural("literal_includes", "return"),
        ];
        let code = "def add(a, b):\n    total = a + b\n    return total";
        let verdicts = engine.run_tests(code, &tests).unwrap();
        assert!(verdicts.iter().all(|v| v.passed), "{verdicts:?}");
        assert_eq!(engine.facts_cache().misses(), 1);
        assert_eq!(engine.facts_cache().hits(), 0);

        engine.run_tests(code, &tests).unwrap();
        assert_eq!(engine.facts_cache().hits(), 1);
    }

    #[test]
    fn test_repeat_runs_give_identical_verdicts() {
        let mut engine = engine(FakeExecutor::printing(&["42"]));
        let tests = vec![
            TestSpec::runtime("output_equals", "42"),
            TestSpec::structural("identifier_exists", "answer"),
            TestSpec::pattern("(unclosed"),
        ];
        let code = "answer = 42\nprint(answer)";
        let first = engine.run_tests(code, &tests).unwrap();
        let second = engine.run_tests(code, &tests).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_run_fails_runtime_tests_only() {
        let mut engine = engine(FakeExecutor::returning(Ok(ExecutionResult::timeout(
            2_000_000_000,
            2_000_000_000,
        ))));
        let tests = vec![
            TestSpec::runtime("output_contains", "x"),
            TestSpec::structural("literal_includes", "while"),
        ];
        let verdicts = engine.run_tests("while True: pass", &tests).unwrap();
        assert!(!verdicts[0].passed);
        assert_eq!(verdicts[0].error.as_deref(), Some("Timeout"));
        assert!(verdicts[1].passed);
    }

    #[test]
    fn test_runtime_error_message_is_attached() {
        let mut engine = engine(FakeExecutor::returning(Ok(ExecutionResult::failure(
            ExecutionError::ModuleNotAllowed {
                module_name: "socket".into(),
            },
            Vec::new(),
            String::new(),
            1,
        ))));
        let verdicts = engine
            .run_tests("import socket", &[TestSpec::runtime("not_error", "")])
            .unwrap();
        assert_eq!(verdicts[0].error.as_deref(), Some("Module not allowed: socket"));
    }

    #[test]
    fn test_unavailable_sandbox_fails_whole_batch() {
        let mut engine = engine(FakeExecutor::returning(Err(EngineError::SandboxUnavailable(
            "worker failed to initialize".into(),
        ))));
        let tests = vec![
            TestSpec::runtime("output_contains", "x"),
            TestSpec::structural("identifier_exists", "x"),
            TestSpec::pattern("x"),
        ];
        let verdicts = engine.run_tests("x = 1", &tests).unwrap();
        assert_eq!(verdicts.len(), 3);
        for verdict in &verdicts {
            assert!(!verdict.passed);
            assert_eq!(
                verdict.error.as_deref(),
                Some("sandbox unavailable: worker failed to initialize")
            );
        }
    }

    #[test]
    fn test_dispose_is_terminal() {
        let executor = FakeExecutor::printing(&[]);
        let shutdowns = executor.shutdowns.clone();
        let mut engine = engine(executor);
        assert_eq!(engine.state(), EngineState::Ready);
        engine.dispose().unwrap();
        assert_eq!(engine.state(), EngineState::Disposed);
        assert_eq!(engine.run_tests("x = 1", &[]), Err(EngineError::Disposed));
        assert_eq!(engine.dispose(), Err(EngineError::Disposed));
        drop(engine);
        assert_eq!(shutdowns.get(), 1);
    }

    #[test]
    fn test_drop_releases_executor() {
        let executor = FakeExecutor::printing(&[]);
        let shutdowns = executor.shutdowns.clone();
        drop(engine(executor));
        assert_eq!(shutdowns.get(), 1);
    }

    #[test]
    fn test_state_returns_to_ready_after_batch() {
        let mut engine = engine(FakeExecutor::printing(&[]));
        engine.run_tests("pass", &[TestSpec::pattern("pass")]).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_regex_alias_and_unknown_assertions() {
        let mut engine = engine(FakeExecutor::printing(&["x"]));
        let tests = vec![
            TestSpec::new("regex", "anything", r"x\s*="),
            TestSpec::runtime("output_startswith", "x"),
            TestSpec::structural("class_exists", "X"),
        ];
        let verdicts = engine.run_tests("x = 1", &tests).unwrap();
        assert!(verdicts[0].passed);
        assert_eq!(verdicts[1].error.as_deref(), Some("Unknown runtime assertion"));
        assert_eq!(verdicts[2].error.as_deref(), Some("Unknown static assertion"));
    }

    #[test]
    fn test_panicking_parser_fails_static_tests_only() {
        let mut engine = engine(FakeExecutor::printing(&["ok"]));
        engine.facts = FactsCache::with_parser(8, |_| panic!("parser bug"));
        let tests = vec![
            TestSpec::structural("identifier_exists", "x"),
            TestSpec::runtime("output_equals", "ok"),
            TestSpec::pattern("x"),
            TestSpec::structural("function_exists", "f"),
        ];
        let verdicts = engine.run_tests("x = 1", &tests).unwrap();
        assert_eq!(verdicts.len(), 4);
        assert_eq!(verdicts[0].error.as_deref(), Some("Internal error: parser bug"));
        assert!(verdicts[1].passed);
        assert!(verdicts[2].passed);
        assert_eq!(verdicts[3].error.as_deref(), Some("Internal error: parser bug"));
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_panicking_evaluator_fails_one_test() {
        let outcome = isolated(|| panic!("boom"));
        assert_eq!(
            outcome,
            Err(CheckError::ExecutionFailed("Internal error: boom".into()))
        );
    }
}
