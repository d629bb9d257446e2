//! One-shot completion handles for caller-visible send results
//!
//! A `CompletionHandle` is attached to an outgoing send (or to the
//! connect/CONNACK lifecycle) and is completed exactly once by the selector
//! thread. Callers on any other thread may block on [`CompletionHandle::wait`]
//! for the terminal outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::ChannelError;

/// The terminal state of a completion handle.
#[derive(Debug, Clone)]
pub enum CompletionOutcome<T> {
    /// The send completed and (where applicable) its acknowledgement arrived.
    Success(T),
    /// The channel closed, or the send otherwise failed, before completion.
    Failure(ChannelError),
    /// The awaiter cancelled the handle before it resolved.
    Cancelled,
}

struct Inner<T> {
    state: Mutex<Option<CompletionOutcome<T>>>,
    ready: Condvar,
}

/// A one-shot, thread-safe completion handle.
///
/// Exactly one of `complete_success`, `complete_failure`, or `cancel` takes
/// effect; later calls are silent no-ops, matching the exactly-once terminal
/// transition the channel relies on.
pub struct CompletionHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> CompletionHandle<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    fn complete(&self, outcome: CompletionOutcome<T>) {
        let mut state = self.inner.state.lock();
        if state.is_none() {
            *state = Some(outcome);
            self.inner.ready.notify_all();
        }
    }

    pub fn complete_success(&self, value: T) {
        self.complete(CompletionOutcome::Success(value));
    }

    pub fn complete_failure(&self, cause: ChannelError) {
        self.complete(CompletionOutcome::Failure(cause));
    }

    pub fn cancel(&self) {
        self.complete(CompletionOutcome::Cancelled);
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// Blocks until the handle reaches a terminal state or `timeout` elapses.
    /// `None` means wait indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<CompletionOutcome<T>> {
        let mut state = self.inner.state.lock();
        match timeout {
            None => {
                while state.is_none() {
                    self.inner.ready.wait(&mut state);
                }
            }
            Some(d) => {
                let deadline = Instant::now() + d;
                while state.is_none() {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    self.inner.ready.wait_for(&mut state, remaining);
                }
            }
        }
        state.clone()
    }
}

impl<T: Clone> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Default for CompletionHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completes_once_first_write_wins() {
        let handle: CompletionHandle<u32> = CompletionHandle::new();
        handle.complete_success(1);
        handle.complete_success(2);
        match handle.wait(None) {
            Some(CompletionOutcome::Success(v)) => assert_eq!(v, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cancel_is_a_distinct_terminal_state() {
        let handle: CompletionHandle<u32> = CompletionHandle::new();
        handle.cancel();
        assert!(matches!(handle.wait(None), Some(CompletionOutcome::Cancelled)));
    }

    #[test]
    fn wait_blocks_until_completed_from_another_thread() {
        let handle: CompletionHandle<u32> = CompletionHandle::new();
        let other = handle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.complete_success(42);
        });
        match handle.wait(Some(Duration::from_secs(5))) {
            Some(CompletionOutcome::Success(v)) => assert_eq!(v, 42),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn wait_times_out_when_never_completed() {
        let handle: CompletionHandle<u32> = CompletionHandle::new();
        assert!(handle.wait(Some(Duration::from_millis(20))).is_none());
    }
}
