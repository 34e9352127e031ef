//! RustPython interpreter lifecycle for the sandbox worker.
//!
//! Every RustPython call lives in this module. A [`PyInterp`] is built on the
//! worker thread and never leaves it (`Interpreter` is not `Send`). Before each
//! run, [`run_code`] re-installs the host guards inside `enter()`:
//!
//! - `builtins.__import__` is replaced by an allowlist hook;
//! - `builtins.open` raises instead of touching the filesystem;
//! - `sys.stdout` / `sys.stderr` become writer objects that feed an
//!   [`OutputBuffer`], and `sys.stdin` always reads as empty.
//!
//! The guards must be installed after `vm.initialize()`, which runs after the
//! `Interpreter::with_init` closure, hence the per-run installation. The real
//! `__import__` is captured once at build time and only the hook's closure
//! holds it; nothing reachable from Python refers to it.
//!
//! A plain `import x` statement reads `sys.modules` before it calls
//! `__import__`, so a module cached by an earlier import never reaches the
//! hook. `sys.modules` is therefore replaced at build time by a `dict`
//! subclass whose lookups hide non-allowlisted modules from learner code.
//!
//! Pure-Python stdlib modules come from the frozen `Lib` that `freeze-stdlib`
//! compiles in. No host directory is put on the import path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyDictRef, PyStr},
    compiler::Mode,
    frame::FrameRef,
    function::FuncArgs,
    signal::{UserSignalReceiver, UserSignalSender},
    AsObject, Interpreter, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::modules::ModuleAllowlist;
use crate::output::{CapturedOutput, OutputBuffer};
use crate::types::ExecutionError;

/// Prefix of the `ImportError` message raised by the allowlist hook.
const DENIED_IMPORT_PREFIX: &str = "ModuleNotAllowed:";

/// Filename learner code is compiled under.
const LEARNER_FILENAME: &str = "<learner>";

/// Filename of code compiled from a string by `exec`, `eval` or `compile`.
const STRING_FILENAME: &str = "<string>";

/// Filename of the sandbox's own Python helpers.
const GUARD_FILENAME: &str = "<pychallenge>";

/// The `sys.modules` replacement. `_hidden` is the native check.
const MODULES_GUARD_SOURCE: &str = "\
class GuardedModules(dict):
    def __getitem__(self, name):
        if _hidden(name):
            raise KeyError(name)
        return dict.__getitem__(self, name)
";

/// Result of one run, before timing is attached by the sandbox.
pub(crate) struct VmRunResult {
    pub output: CapturedOutput,
    pub error: Option<ExecutionError>,
}

/// An interpreter bundled with the allowlist its import hook enforces.
pub(crate) struct PyInterp {
    // Declared before `inner` so it is released while the VM still exists.
    original_import: PyObjectRef,
    inner: Interpreter,
    allowlist: Arc<ModuleAllowlist>,
    baseline_modules: HashSet<String>,
}

impl PyInterp {
    /// Removes every `sys.modules` entry that was not present right after
    /// initialization, so modules imported by one run are not cached for the next.
    pub(crate) fn reset_modules(&self) {
        self.inner.enter(|vm| {
            let Ok(sys_modules) = vm.sys_module.get_attr("modules", vm) else {
                return;
            };
            let stale: Vec<String> = module_names(vm, &sys_modules)
                .into_iter()
                .filter(|name| !self.baseline_modules.contains(name))
                .collect();
            for name in stale {
                let _ = vm.call_method(&sys_modules, "__delitem__", (vm.ctx.new_str(name),));
            }
        });
    }
}

/// Creates an interpreter with the native stdlib registered.
///
/// Signals sent on the sender paired with `interrupts` are raised inside
/// whatever Python code the interpreter is running at the time.
pub(crate) fn build_interpreter(
    allowlist: ModuleAllowlist,
    interrupts: UserSignalReceiver,
) -> Result<PyInterp, String> {
    let inner = Interpreter::with_init(rustpython_vm::Settings::default(), move |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.set_user_signal_channel(interrupts);
    });
    let allowlist = Arc::new(allowlist);

    let original_import = inner
        .enter(|vm| vm.builtins.get_attr("__import__", vm))
        .map_err(|_| "interpreter has no builtins.__import__".to_string())?;
    inner
        .enter(|vm| install_modules_guard(vm, &allowlist))
        .map_err(|_| "failed to guard sys.modules".to_string())?;

    let baseline_modules = inner.enter(|vm| match vm.sys_module.get_attr("modules", vm) {
        Ok(modules) => module_names(vm, &modules).into_iter().collect(),
        Err(_) => HashSet::new(),
    });

    Ok(PyInterp {
        original_import,
        inner,
        allowlist,
        baseline_modules,
    })
}

/// Asks the interpreter behind `sender` to abandon its current run by
/// raising `KeyboardInterrupt` at its next instruction.
///
/// Returns `false` when that interpreter is already gone.
pub(crate) fn interrupt(sender: &UserSignalSender) -> bool {
    sender
        .send(Box::new(|vm: &VirtualMachine| -> PyResult<()> {
            Err(vm.new_exception_msg(
                vm.ctx.exceptions.keyboard_interrupt.to_owned(),
                "sandbox run cancelled".to_owned(),
            ))
        }))
        .is_ok()
}

/// Compiles and runs `source` in a fresh `__main__` scope.
pub(crate) fn run_code(interp: &PyInterp, source: &str, output: &OutputBuffer) -> VmRunResult {
    interp.inner.enter(|vm| {
        install_import_hook(vm, &interp.original_import, &interp.allowlist);
        install_host_guards(vm, output);

        let error = match vm.compile(source, Mode::Exec, LEARNER_FILENAME.to_owned()) {
            Err(e) => Some(extract_syntax_error(e)),
            Ok(code) => {
                let scope = vm.new_scope_with_builtins();
                let _ = scope
                    .globals
                    .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);
                match vm.run_code_obj(code, scope) {
                    Ok(_) => None,
                    Err(exc) => Some(
                        extract_module_not_allowed(vm, &exc)
                            .unwrap_or_else(|| extract_runtime_error(vm, exc)),
                    ),
                }
            }
        };

        // A rejected write surfaces inside Python as some exception; report
        // the canonical variant instead of whatever the learner code made of it.
        let error = if output.is_limit_exceeded() {
            Some(ExecutionError::OutputLimitExceeded {
                limit_bytes: output.max_bytes(),
            })
        } else {
            error
        };

        VmRunResult {
            output: output.take(),
            error,
        }
    })
}

/// Collects the string keys of a `sys.modules`-like mapping.
fn module_names(vm: &VirtualMachine, modules: &PyObjectRef) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(keys) = vm.call_method(modules, "keys", ()) else {
        return names;
    };
    let Ok(iter) = vm.call_method(&keys, "__iter__", ()) else {
        return names;
    };
    // StopIteration (or any error) ends the walk.
    while let Ok(key) = vm.call_method(&iter, "__next__", ()) {
        if let Ok(s) = key.str(vm) {
            names.push(s.as_str().to_owned());
        }
    }
    names
}

/// `true` when the import must pass the allowlist.
///
/// The importer is read from the interpreter's frame stack, never from the
/// `globals` argument, which any caller can forge. A builtin call pushes no
/// frame, so the current frame belongs to the code that called `__import__`.
fn is_learner_import(vm: &VirtualMachine) -> bool {
    match vm.current_frame().as_deref().cloned() {
        Some(frame) => is_learner_frame(vm, &frame),
        None => true,
    }
}

/// `true` when the Python caller of the current Python frame is learner code.
fn caller_is_learner(vm: &VirtualMachine) -> bool {
    let caller = {
        let frames = vm.frames.borrow();
        frames.len().checked_sub(2).and_then(|i| frames.get(i)).cloned()
    };
    match caller {
        Some(frame) => is_learner_frame(vm, &frame),
        None => true,
    }
}

/// Only a frame running in the namespace of a module registered in
/// `sys.modules` is module code. Learner code and strings run through
/// `exec`/`eval` are learner code whatever namespace they run in.
fn is_learner_frame(vm: &VirtualMachine, frame: &FrameRef) -> bool {
    let filename = frame.code.source_path.as_str();
    if filename == LEARNER_FILENAME || filename == STRING_FILENAME {
        return true;
    }
    !is_module_namespace(vm, &frame.globals)
}

/// `globals` is the `__dict__` of the `sys.modules` entry its `__name__` names.
fn is_module_namespace(vm: &VirtualMachine, globals: &PyDictRef) -> bool {
    let name = match vm.call_method(globals.as_object(), "get", (vm.ctx.new_str("__name__"),)) {
        Ok(name) => name,
        Err(_) => return false,
    };
    let Some(name) = name.downcast_ref_if_exact::<PyStr>(vm).map(|s| s.as_str().to_owned()) else {
        return false;
    };
    if name == "__main__" {
        return false;
    }
    let Ok(modules) = vm.sys_module.get_attr("modules", vm) else {
        return false;
    };
    let Ok(module) = vm.call_method(&modules, "get", (vm.ctx.new_str(name),)) else {
        return false;
    };
    !vm.is_none(&module)
        && module
            .get_attr("__dict__", vm)
            .map(|dict| dict.is(globals))
            .unwrap_or(false)
}

/// The module name an import call asks for, as the allowlist sees it.
///
/// `None` when the name is not an exact `str`: a subclass can disagree with
/// its own value about equality and hashing. Relative imports keep their
/// leading dots. Learner code has no package to resolve them against, so
/// the allowlist never matches them.
fn requested_module(args: &FuncArgs, vm: &VirtualMachine) -> Option<String> {
    let name = import_arg(args, 0, "name")?
        .downcast_ref_if_exact::<PyStr>(vm)?
        .as_str()
        .to_owned();
    let level = import_arg(args, 4, "level")
        .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
        .unwrap_or(0);
    if level > 0 {
        let dots = ".".repeat(level.min(8) as usize);
        Some(format!("{dots}{name}"))
    } else {
        Some(name)
    }
}

/// An `__import__` argument given by position or by keyword.
fn import_arg<'a>(args: &'a FuncArgs, index: usize, keyword: &str) -> Option<&'a PyObjectRef> {
    args.args.get(index).or_else(|| args.kwargs.get(keyword))
}

/// Replaces `sys.modules` with a `GuardedModules` copy.
///
/// Its `__getitem__` raises `KeyError` when learner code looks up a module
/// outside the allowlist, so the import falls through to the hook and is
/// denied there. `get`, `in` and assignment are untouched, which is all the
/// import machinery itself needs.
fn install_modules_guard(vm: &VirtualMachine, allowlist: &Arc<ModuleAllowlist>) -> PyResult<()> {
    let allowlist = Arc::clone(allowlist);
    let hidden = vm.new_function(
        "_hidden",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let allowed = args
                .args
                .first()
                .and_then(|o| o.downcast_ref_if_exact::<PyStr>(vm))
                .map(|name| allowlist.is_allowed(name.as_str()))
                .unwrap_or(false);
            Ok(vm.ctx.new_bool(!allowed && caller_is_learner(vm)).into())
        },
    );

    let scope = vm.new_scope_with_builtins();
    scope.globals.set_item("_hidden", hidden.into(), vm)?;
    vm.run_code_string(scope.clone(), MODULES_GUARD_SOURCE, GUARD_FILENAME.to_owned())?;
    let guarded_class = scope.globals.get_item("GuardedModules", vm)?;

    let modules = vm.sys_module.get_attr("modules", vm)?;
    let guarded = guarded_class.call((modules,), vm)?;
    vm.sys_module.set_attr("modules", guarded, vm)?;
    Ok(())
}

/// Replaces `builtins.__import__` with the allowlist hook.
///
/// Every installation delegates to the interpreter's own import function,
/// never to a previous hook.
fn install_import_hook(
    vm: &VirtualMachine,
    original_import: &PyObjectRef,
    allowlist: &Arc<ModuleAllowlist>,
) {
    let original_import = original_import.clone();
    let allowlist = Arc::clone(allowlist);

    let hook = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            if is_learner_import(vm) {
                let denied = match requested_module(&args, vm) {
                    Some(name) if allowlist.is_allowed(&name) => None,
                    Some(name) => Some(name),
                    None => Some("<non-str module name>".to_owned()),
                };
                if let Some(name) = denied {
                    return Err(vm.new_import_error(
                        format!("{DENIED_IMPORT_PREFIX}{name}"),
                        vm.ctx.new_str(name),
                    ));
                }
            }
            original_import.call(args, vm)
        },
    );

    let _ = vm.builtins.set_attr("__import__", hook, vm);
}

/// Output capture, empty stdin, and a disabled `open`.
fn install_host_guards(vm: &VirtualMachine, output: &OutputBuffer) {
    let stdout = build_writer_object(vm, output.clone(), Stream::Stdout);
    let stderr = build_writer_object(vm, output.clone(), Stream::Stderr);
    let _ = vm.sys_module.set_attr("stdout", stdout, vm);
    let _ = vm.sys_module.set_attr("stderr", stderr, vm);
    let _ = vm.sys_module.set_attr("stdin", build_empty_reader(vm), vm);

    let open = vm.new_function(
        "open",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            Err(vm.new_runtime_error("open() is not available in the sandbox".to_owned()))
        },
    );
    let _ = vm.builtins.set_attr("open", open, vm);
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// A module used as a namespace with `write(s)` and `flush()`.
///
/// `print()` calls `sys.stdout.write` for each piece, so this sees every print.
fn build_writer_object(vm: &VirtualMachine, output: OutputBuffer, stream: Stream) -> PyObjectRef {
    let output = Arc::new(Mutex::new(output));

    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            let buf = output.lock().expect("OutputBuffer mutex poisoned");
            let written = match stream {
                Stream::Stdout => buf.write_stdout(data.as_bytes()),
                Stream::Stderr => buf.write_stderr(data.as_bytes()),
            };

            match written {
                Ok(()) => Ok(vm.ctx.new_int(data.len()).into()),
                Err(ExecutionError::OutputLimitExceeded { limit_bytes }) => Err(vm
                    .new_runtime_error(format!("Output limit exceeded: {limit_bytes} bytes"))),
                Err(_) => Err(vm.new_runtime_error("Write error".to_owned())),
            }
        },
    );

    let flush_fn = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

/// A stdin stand-in: every read returns the empty string, so `input()` sees EOF.
fn build_empty_reader(vm: &VirtualMachine) -> PyObjectRef {
    let empty = |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        Ok(vm.ctx.new_str("").into())
    };
    let ns = vm.new_module("<stdin>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("readline", vm.new_function("readline", empty), vm);
    let _ = ns.set_attr("read", vm.new_function("read", empty), vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

fn extract_syntax_error(err: rustpython_vm::compiler::CompileError) -> ExecutionError {
    let (row, col) = err.python_location();
    ExecutionError::SyntaxError {
        message: err.to_string(),
        line: row as u32,
        col: col as u32,
    }
}

/// Recognizes the allowlist hook's sentinel `ImportError`.
fn extract_module_not_allowed(
    vm: &VirtualMachine,
    exc: &PyBaseExceptionRef,
) -> Option<ExecutionError> {
    let msg = exc.as_object().str(vm).ok()?;
    msg.as_str()
        .strip_prefix(DENIED_IMPORT_PREFIX)
        .map(|name| ExecutionError::ModuleNotAllowed {
            module_name: name.to_string(),
        })
}

/// The last traceback line (`ZeroDivisionError: division by zero`) is the
/// message; `str(exc)` is the fallback when no traceback could be rendered.
fn extract_runtime_error(vm: &VirtualMachine, exc: PyBaseExceptionRef) -> ExecutionError {
    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, &exc);

    let message = traceback
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
        .or_else(|| exc.as_object().str(vm).ok().map(|s| s.as_str().to_owned()))
        .unwrap_or_else(|| "Unknown runtime error".to_owned());

    ExecutionError::RuntimeError { message, traceback }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionSettings;

    fn interp(allowlist: ModuleAllowlist) -> PyInterp {
        let (_interrupts, receiver) = rustpython_vm::signal::user_signal_channel();
        build_interpreter(allowlist, receiver).expect("interpreter builds")
    }

    fn run(code: &str) -> VmRunResult {
        let interp = interp(ModuleAllowlist::from_settings(&ExecutionSettings::default()));
        let output = OutputBuffer::new(1_048_576);
        run_code(&interp, code, &output)
    }

    fn denied_module(result: VmRunResult) -> String {
        match result.error {
            Some(ExecutionError::ModuleNotAllowed { module_name }) => module_name,
            other => panic!("expected ModuleNotAllowed, got {:?}", other),
        }
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_print_lines_captured() {
        let result = run("print('hello')\nprint('a', 'b', sep='-')");
        assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
        assert_eq!(result.output.lines, vec!["hello", "a-b"]);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_syntax_error_has_line() {
        match run("def f(:").error {
            Some(ExecutionError::SyntaxError { line, .. }) => assert!(line > 0),
            other => panic!("expected SyntaxError, got {:?}", other),
        }
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_runtime_error_message_is_last_traceback_line() {
        match run("x = 1/0").error {
            Some(ExecutionError::RuntimeError { message, .. }) => {
                assert!(message.contains("ZeroDivisionError"), "got: {message}");
            }
            other => panic!("expected RuntimeError, got {:?}", other),
        }
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_denied_import() {
        match run("import socket").error {
            Some(ExecutionError::ModuleNotAllowed { module_name }) => {
                assert_eq!(module_name, "socket")
            }
            other => panic!("expected ModuleNotAllowed, got {:?}", other),
        }
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_open_is_disabled() {
        let result = run("open('/etc/passwd')");
        assert!(matches!(result.error, Some(ExecutionError::RuntimeError { .. })));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_reset_modules_keeps_baseline() {
        let interp = interp(ModuleAllowlist::new(["math"]));
        let output = OutputBuffer::new(1024);
        let first = run_code(&interp, "import math\nprint(math.floor(2.5))", &output);
        assert!(first.error.is_none(), "unexpected error: {:?}", first.error);
        interp.reset_modules();
        let second = run_code(&interp, "print('again')", &output);
        assert_eq!(second.output.lines, vec!["again"]);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_forged_globals_do_not_bypass_allowlist() {
        assert_eq!(denied_module(run("__import__('os', {'__name__': 'mod'})")), "os");
        assert_eq!(
            denied_module(run("exec('import os', {'__name__': 'random', '__file__': None})")),
            "os"
        );
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_relative_and_non_str_imports_are_denied() {
        assert_eq!(denied_module(run("__import__('path', {'__package__': 'os'}, None, (), 1)")), ".path");
        let result = run("class S(str): pass\n__import__(S('math'))");
        assert_eq!(denied_module(result), "<non-str module name>");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_real_import_is_not_reachable_from_python() {
        match run("__pychallenge_original_import__('os')").error {
            Some(ExecutionError::RuntimeError { message, .. }) => {
                assert!(message.starts_with("NameError"), "got: {message}")
            }
            other => panic!("expected NameError, got {:?}", other),
        }
        let result = run("print(__import__ is __builtins__.__import__)\nprint(__import__.__name__)");
        assert_eq!(result.output.lines, vec!["True", "__import__"]);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_cached_modules_are_hidden_from_learner_imports() {
        for name in ["sys", "posix", "_io", "builtins"] {
            assert_eq!(denied_module(run(&format!("import {name}"))), name);
        }
        assert_eq!(denied_module(run("import random\nimport os")), "os");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_allowed_module_imports_twice() {
        let result = run("import math\nimport math as m2\nprint(m2.floor(2.5))");
        assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
        assert_eq!(result.output.lines, vec!["2"]);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_stdlib_internal_imports_still_work() {
        let result = run("import random\nimport statistics\nprint(statistics.mean([1, 2, 3]))");
        assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
        assert_eq!(result.output.lines, vec!["2"]);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_interrupt_stops_a_busy_loop() {
        let (sender, receiver) = rustpython_vm::signal::user_signal_channel();
        let interp = build_interpreter(ModuleAllowlist::default(), receiver).expect("builds");
        let output = OutputBuffer::new(1024);
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            assert!(interrupt(&sender));
        });
        let result = run_code(&interp, "while True:\n    pass", &output);
        match result.error {
            Some(ExecutionError::RuntimeError { message, .. }) => {
                assert!(message.contains("KeyboardInterrupt"), "got: {message}")
            }
            other => panic!("expected KeyboardInterrupt, got {:?}", other),
        }
        signaller.join().expect("signaller thread");
    }
}
