//! Deadline race between a worker reply and the wall clock.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

/// How a bounded wait on a worker reply ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The reply arrived before the deadline.
    Ready(T),
    /// The deadline passed first. The sender may still reply later; the caller
    /// must drop the receiver so that reply goes nowhere.
    TimedOut,
    /// The sender was dropped without replying (the worker died).
    Disconnected,
}

/// Waits at most `timeout` for one message on `rx`.
///
/// This only decides who wins the race. Stopping a worker that lost it is the
/// sandbox's job.
pub fn recv_within<T>(rx: &Receiver<T>, timeout: Duration) -> Outcome<T> {
    match rx.recv_timeout(timeout) {
        Ok(value) => Outcome::Ready(value),
        Err(RecvTimeoutError::Timeout) => Outcome::TimedOut,
        Err(RecvTimeoutError::Disconnected) => Outcome::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fast_reply_is_ready() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(1));
            let _ = tx.send(42u32);
        });
        assert_eq!(recv_within(&rx, Duration::from_secs(1)), Outcome::Ready(42));
    }

    #[test]
    fn test_slow_reply_times_out_promptly() {
        let (tx, rx) = mpsc::channel::<u32>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            // The receiver is gone by now; the send fails quietly.
            let _ = tx.send(99);
        });
        let start = Instant::now();
        assert_eq!(recv_within(&rx, Duration::from_millis(50)), Outcome::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(250));
        drop(rx);
        handle.join().expect("sender thread");
    }

    #[test]
    fn test_panicking_sender_is_disconnected() {
        let (tx, rx) = mpsc::channel::<u32>();
        thread::spawn(move || {
            let _tx = tx;
            panic!("intentional panic in worker");
        });
        assert_eq!(recv_within(&rx, Duration::from_secs(1)), Outcome::Disconnected);
    }
}
