//! Sandbox executor: one RustPython worker thread behind a message channel.
//!
//! ## Design
//!
//! The worker is a dedicated OS thread that
//! 1. builds its interpreter at startup and reports readiness,
//! 2. blocks on a `Receiver<Job>`,
//! 3. runs each job, resets `sys.modules`, and replies on the job's own
//!    one-shot channel.
//!
//! The interpreter never crosses the thread boundary. Only owned data does:
//! the source string goes in, a [`VmRunResult`] comes back.
//!
//! ## Timeout handling
//!
//! Every call races the reply against [`ExecutionSettings::timeout_ns`]. When
//! the deadline wins, the worker is interrupted through RustPython's
//! user-signal channel, which raises `KeyboardInterrupt` inside its VM at the
//! next instruction, and a fresh worker takes its place. Each job carries its
//! own reply channel and the caller drops the receiver on timeout, so a late
//! reply can never reach a later call.
//!
//! Learner code can catch the interrupt. An interrupted worker whose thread
//! has not exited is kept as stalled and interrupted again on every call; at
//! [`MAX_STALLED_WORKERS`] the executor refuses new runs until one exits.
//!
//! Worker threads get a [`WORKER_STACK_BYTES`] stack. Sources nested deeper
//! than [`MAX_NESTING_DEPTH`](crate::structure::MAX_NESTING_DEPTH) or larger
//! than [`MAX_SOURCE_BYTES`](crate::structure::MAX_SOURCE_BYTES) are refused
//! before a job is sent, so compiling and running what remains fits.

use std::io;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustpython_vm::signal::{user_signal_channel, UserSignalSender};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::modules::ModuleAllowlist;
use crate::output::OutputBuffer;
use crate::structure;
use crate::timeout::{recv_within, Outcome};
use crate::types::{ExecutionError, ExecutionResult, ExecutionSettings};
use crate::vm::{build_interpreter, interrupt, run_code, VmRunResult};

/// Stack size of each sandbox worker thread.
pub const WORKER_STACK_BYTES: usize = 128 * 1024 * 1024;

/// Interrupted workers still running before `execute` refuses new runs.
pub const MAX_STALLED_WORKERS: usize = 4;

/// How long `shutdown` waits for worker threads to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Runs learner source and reports an [`ExecutionResult`].
///
/// [`SandboxExecutor`] is the production implementation; the engine is
/// generic over this trait.
pub trait Executor {
    /// Runs `code` once.
    ///
    /// Timeouts and learner errors are reported inside the `Ok` result. `Err`
    /// means no result could be obtained at all.
    fn execute(&mut self, code: &str) -> Result<ExecutionResult, EngineError>;

    /// Releases the execution context. Later calls to `execute` may fail.
    fn shutdown(&mut self);
}

/// A unit of work sent to the worker thread.
struct Job {
    run_id: u64,
    source: String,
    reply: SyncSender<VmRunResult>,
}

/// Host-side handle of one worker thread.
struct Worker {
    id: u64,
    jobs: SyncSender<Job>,
    /// Present until the worker's readiness has been observed.
    ready: Option<Receiver<()>>,
    interrupt: UserSignalSender,
    thread: JoinHandle<()>,
}

/// An interrupted worker whose thread has not exited yet.
struct Stalled {
    id: u64,
    interrupt: UserSignalSender,
    thread: JoinHandle<()>,
}

fn spawn_worker(id: u64, allowlist: ModuleAllowlist, max_output_bytes: usize) -> io::Result<Worker> {
    // Capacity 1: calls are serialized, so at most one job is ever queued.
    let (job_tx, job_rx) = sync_channel::<Job>(1);
    let (ready_tx, ready_rx) = sync_channel::<()>(1);
    let (interrupt_tx, interrupt_rx) = user_signal_channel();

    let thread = std::thread::Builder::new()
        .name(format!("pychallenge-sandbox-{id}"))
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || {
            let interp = match build_interpreter(allowlist, interrupt_rx) {
                Ok(interp) => interp,
                Err(error) => {
                    // Dropping `ready_tx` unsent reports the failure.
                    warn!(worker = id, %error, "sandbox interpreter failed to build");
                    return;
                }
            };
            let output = OutputBuffer::new(max_output_bytes);
            let _ = ready_tx.send(());
            drop(ready_tx);

            while let Ok(job) = job_rx.recv() {
                debug!(worker = id, run = job.run_id, "sandbox run started");
                let result = run_code(&interp, &job.source, &output);
                interp.reset_modules();
                // Fails only when the caller gave up on this run.
                if job.reply.send(result).is_err() {
                    debug!(worker = id, run = job.run_id, "reply discarded");
                }
            }
            debug!(worker = id, "sandbox worker exiting");
        })?;

    Ok(Worker {
        id,
        jobs: job_tx,
        ready: Some(ready_rx),
        interrupt: interrupt_tx,
        thread,
    })
}

/// Owns one sandbox worker and replaces it after a timeout or crash.
pub struct SandboxExecutor {
    settings: ExecutionSettings,
    allowlist: ModuleAllowlist,
    worker: Option<Worker>,
    stalled: Vec<Stalled>,
    workers_spawned: u64,
    next_run_id: u64,
}

impl SandboxExecutor {
    /// Starts the worker and waits for its interpreter to come up.
    ///
    /// A worker that fails to start is not fatal here: the executor stays
    /// without a worker, [`execute`](Executor::execute) reports
    /// [`EngineError::SandboxUnavailable`] and retries the spawn.
    pub fn new(settings: ExecutionSettings) -> Self {
        let mut executor = Self {
            allowlist: ModuleAllowlist::from_settings(&settings),
            settings,
            worker: None,
            stalled: Vec::new(),
            workers_spawned: 0,
            next_run_id: 0,
        };
        if let Err(e) = executor.ensure_ready_worker() {
            warn!(error = %e, "sandbox not ready at construction");
        }
        executor
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Number of workers started so far, including replacements.
    pub fn workers_spawned(&self) -> u64 {
        self.workers_spawned
    }

    /// Number of jobs handed to a worker so far.
    pub fn runs_started(&self) -> u64 {
        self.next_run_id
    }

    /// Interrupted workers whose threads are still running.
    pub fn stalled_workers(&self) -> usize {
        self.stalled.iter().filter(|w| !w.thread.is_finished()).count()
    }

    /// `true` while a worker handle is held.
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    fn spawn(&mut self) -> io::Result<Worker> {
        let id = self.workers_spawned;
        let worker = spawn_worker(id, self.allowlist.clone(), self.settings.max_output_bytes)?;
        self.workers_spawned += 1;
        info!(worker = id, "sandbox worker started");
        Ok(worker)
    }

    /// Makes sure a worker exists and has finished initializing.
    fn ensure_ready_worker(&mut self) -> Result<(), EngineError> {
        if self.worker.is_none() {
            let worker = self.spawn().map_err(|e| {
                EngineError::SandboxUnavailable(format!("failed to spawn sandbox worker: {e}"))
            })?;
            self.worker = Some(worker);
        }

        let pending = self.worker.as_mut().and_then(|w| w.ready.take());
        if let Some(ready) = pending {
            let failure = match recv_within(&ready, self.settings.worker_init_timeout()) {
                Outcome::Ready(()) => None,
                Outcome::TimedOut => Some("sandbox worker did not initialize in time"),
                Outcome::Disconnected => Some("sandbox worker failed to initialize"),
            };
            if let Some(reason) = failure {
                warn!(reason, "dropping sandbox worker");
                if let Some(worker) = self.worker.take() {
                    self.retire(worker);
                }
                return Err(EngineError::SandboxUnavailable(reason.to_string()));
            }
        }
        Ok(())
    }

    /// Interrupts the current worker and starts a fresh one.
    ///
    /// Readiness of the replacement is awaited lazily by the next call, so the
    /// call that timed out is not delayed by interpreter start-up.
    fn replace_worker(&mut self, reason: &str) {
        if let Some(old) = self.worker.take() {
            warn!(worker = old.id, reason, "interrupting sandbox worker");
            self.retire(old);
        }
        match self.spawn() {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => warn!(error = %e, "failed to spawn replacement sandbox worker"),
        }
    }

    /// Interrupts `worker`, closes its job channel and tracks it until its
    /// thread exits.
    fn retire(&mut self, worker: Worker) {
        let Worker {
            id,
            jobs,
            interrupt: signal,
            thread,
            ..
        } = worker;
        drop(jobs);
        if !thread.is_finished() {
            interrupt(&signal);
        }
        self.stalled.push(Stalled {
            id,
            interrupt: signal,
            thread,
        });
    }

    /// Joins stalled workers that have exited and interrupts the rest again.
    ///
    /// Another interpreter on the process can consume the shared signal flag
    /// before a stalled VM sees it, so the interrupt is repeated.
    fn reap_stalled(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.stalled)
            .into_iter()
            .partition(|w| w.thread.is_finished());
        for worker in finished {
            if worker.thread.join().is_err() {
                debug!(worker = worker.id, "stalled sandbox worker panicked");
            }
            debug!(worker = worker.id, "stalled sandbox worker exited");
        }
        for worker in &running {
            interrupt(&worker.interrupt);
        }
        if !running.is_empty() {
            warn!(stalled = running.len(), "sandbox workers still running after interrupt");
        }
        self.stalled = running;
    }

    /// Waits up to `grace` for every stalled worker to exit.
    fn drain_stalled(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            self.reap_stalled();
            if self.stalled.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Executor for SandboxExecutor {
    fn execute(&mut self, code: &str) -> Result<ExecutionResult, EngineError> {
        self.reap_stalled();
        if self.stalled.len() >= MAX_STALLED_WORKERS {
            return Err(EngineError::SandboxUnavailable(format!(
                "{} interrupted sandbox workers are still running",
                self.stalled.len()
            )));
        }
        let start = Instant::now();
        if let Err(refused) = structure::check_shape(code) {
            debug!(error = %refused.message(), "source refused before run");
            return Ok(ExecutionResult::failure(
                refused,
                Vec::new(),
                String::new(),
                start.elapsed().as_nanos() as u64,
            ));
        }

        self.ensure_ready_worker()?;
        let (jobs, worker_id) = match self.worker.as_ref() {
            Some(worker) => (worker.jobs.clone(), worker.id),
            None => {
                return Err(EngineError::SandboxUnavailable(
                    "no sandbox worker".to_string(),
                ))
            }
        };

        let run_id = self.next_run_id;
        self.next_run_id += 1;

        let (reply_tx, reply_rx) = sync_channel::<VmRunResult>(1);
        let job = Job {
            run_id,
            source: code.to_owned(),
            reply: reply_tx,
        };

        if jobs.send(job).is_err() {
            self.replace_worker("job channel closed");
            return Ok(ExecutionResult::failure(
                ExecutionError::WorkerCrashed,
                Vec::new(),
                String::new(),
                start.elapsed().as_nanos() as u64,
            ));
        }

        let outcome = recv_within(&reply_rx, self.settings.timeout());
        let duration_ns = start.elapsed().as_nanos() as u64;

        match outcome {
            Outcome::Ready(run) => {
                debug!(
                    worker = worker_id,
                    run = run_id,
                    lines = run.output.lines.len(),
                    failed = run.error.is_some(),
                    "sandbox run finished"
                );
                Ok(match run.error {
                    None => ExecutionResult::success(run.output.lines, run.output.stderr, duration_ns),
                    Some(error) => ExecutionResult::failure(
                        error,
                        run.output.lines,
                        run.output.stderr,
                        duration_ns,
                    ),
                })
            }
            Outcome::TimedOut => {
                drop(reply_rx);
                self.replace_worker("timeout");
                Ok(ExecutionResult::timeout(self.settings.timeout_ns, duration_ns))
            }
            Outcome::Disconnected => {
                self.replace_worker("worker crashed");
                Ok(ExecutionResult::failure(
                    ExecutionError::WorkerCrashed,
                    Vec::new(),
                    String::new(),
                    duration_ns,
                ))
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            info!(worker = worker.id, "sandbox worker released");
            self.retire(worker);
        }
        self.drain_stalled(SHUTDOWN_GRACE);
        if !self.stalled.is_empty() {
            warn!(
                stalled = self.stalled.len(),
                "sandbox workers outlive shutdown"
            );
        }
    }
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
