//! Thread-safe output capture for sandboxed runs.
//!
//! [`OutputBuffer`] receives everything learner code writes to `sys.stdout`
//! and `sys.stderr`. Stdout is split into lines as it arrives; stderr is kept
//! as raw text. A combined byte limit applies across both streams.
//!
//! Clones share state through `Arc<Mutex<_>>`, so the VM's writer objects and
//! the worker loop can hold handles to the same buffer.

use std::sync::{Arc, Mutex};

use crate::types::ExecutionError;

struct OutputBufferInner {
    lines: Vec<String>,
    /// Stdout bytes written since the last `\n`.
    pending: Vec<u8>,
    stderr: Vec<u8>,
    written: usize,
    max_bytes: usize,
    limit_exceeded: bool,
}

impl OutputBufferInner {
    fn new(max_bytes: usize) -> Self {
        Self {
            lines: Vec::new(),
            pending: Vec::new(),
            stderr: Vec::new(),
            written: 0,
            max_bytes,
            limit_exceeded: false,
        }
    }

    fn reserve(&mut self, len: usize) -> Result<(), ExecutionError> {
        if self.written + len > self.max_bytes {
            self.limit_exceeded = true;
            return Err(ExecutionError::OutputLimitExceeded {
                limit_bytes: self.max_bytes,
            });
        }
        self.written += len;
        Ok(())
    }
}

/// Captured output of one run, as returned by [`OutputBuffer::take`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub lines: Vec<String>,
    pub stderr: String,
}

/// Line-oriented capture buffer shared between the VM writers and the worker.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<OutputBufferInner>>,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputBufferInner::new(max_bytes))),
        }
    }

    /// Appends `data` to stdout, completing a line at every `\n`.
    ///
    /// A write that would push the combined total over the limit is rejected
    /// whole, leaves the buffer unchanged and sets
    /// [`is_limit_exceeded`](Self::is_limit_exceeded).
    pub fn write_stdout(&self, data: &[u8]) -> Result<(), ExecutionError> {
        let mut inner = self.inner.lock().expect("OutputBuffer mutex poisoned");
        inner.reserve(data.len())?;
        for &byte in data {
            if byte == b'\n' {
                let line = std::mem::take(&mut inner.pending);
                let line = String::from_utf8_lossy(&line).into_owned();
                inner.lines.push(line.strip_suffix('\r').map(str::to_owned).unwrap_or(line));
            } else {
                inner.pending.push(byte);
            }
        }
        Ok(())
    }

    /// Appends `data` to stderr. Same limit semantics as [`write_stdout`](Self::write_stdout).
    pub fn write_stderr(&self, data: &[u8]) -> Result<(), ExecutionError> {
        let mut inner = self.inner.lock().expect("OutputBuffer mutex poisoned");
        inner.reserve(data.len())?;
        inner.stderr.extend_from_slice(data);
        Ok(())
    }

    pub fn max_bytes(&self) -> usize {
        self.inner
            .lock()
            .expect("OutputBuffer mutex poisoned")
            .max_bytes
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.inner
            .lock()
            .expect("OutputBuffer mutex poisoned")
            .limit_exceeded
    }

    /// Drains the buffer. A trailing unterminated stdout line is kept as the
    /// last line. Invalid UTF-8 is replaced with `U+FFFD`.
    pub fn take(&self) -> CapturedOutput {
        let mut inner = self.inner.lock().expect("OutputBuffer mutex poisoned");
        let mut lines = std::mem::take(&mut inner.lines);
        if !inner.pending.is_empty() {
            let tail = std::mem::take(&mut inner.pending);
            lines.push(String::from_utf8_lossy(&tail).into_owned());
        }
        let stderr = String::from_utf8_lossy(&std::mem::take(&mut inner.stderr)).into_owned();
        inner.written = 0;
        inner.limit_exceeded = false;
        CapturedOutput { lines, stderr }
    }
}
