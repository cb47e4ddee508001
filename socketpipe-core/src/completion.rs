//! Reusable single-completion primitive (C3)
//!
//! Pairs a native completion (delivered from whatever thread woke it —
//! an OS reactor thread for socket I/O, or the Pipe's own writer/reader
//! for backpressure waits) with a cooperative task continuation, spec
//! §4.3. Rust's `Future`/`Waker` machinery already *is* the
//! continuation-registration half of the spec's `on_completed`, so this
//! type is implemented as an awaitable: polling registers the waker (the
//! spec's "pending" state), and [`Self::complete`] corresponds to the
//! native side delivering a result and waking it.
//!
//! Generic over the completion payload `T` so the same state machine
//! backs both socket completions (`io::Result<usize>`, via
//! [`IoCompletion`]) and the Pipe's own flush/read waiters (which carry
//! `is_canceled`/`is_completed` flags rather than byte counts, see
//! [`crate::pipe`]).
//!
//! Only one operation may be in flight at a time; [`Self::wait`] asserts
//! this by construction rather than by runtime check, since it borrows
//! `&self` for the duration of the await.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Pending,
    Completed,
}

struct Inner<T> {
    state: State,
    waker: Option<Waker>,
    result: Option<T>,
}

/// A reusable, single-slot completion of payload type `T`.
pub struct AwaitableCompletion<T> {
    inner: Mutex<Inner<T>>,
    scheduler: Scheduler,
}

/// The socket-flavored instantiation: `bytes_transferred` on success, the
/// socket error on failure.
pub type IoCompletion = AwaitableCompletion<io::Result<usize>>;

impl<T: Send + 'static> AwaitableCompletion<T> {
    #[must_use]
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Idle,
                waker: None,
                result: None,
            }),
            scheduler,
        }
    }

    /// Deliver `result`, waking a registered continuation. Returns
    /// `false` if the primitive was already completed (a logic error
    /// upstream, since only one operation may be in flight at a time).
    pub fn complete(&self, result: T) -> bool {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.state == State::Completed {
                return false;
            }
            inner.state = State::Completed;
            inner.result = Some(result);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            if self.scheduler.is_inline() {
                waker.wake();
            } else {
                self.scheduler.schedule(move || waker.wake());
            }
        }
        true
    }

    /// Deliver `result` only if a continuation is currently registered
    /// (i.e. [`Self::wait`] has been polled at least once since the last
    /// completion). Unlike [`Self::complete`], a primitive nobody is
    /// waiting on is left `Idle` rather than accumulating a result that
    /// would be handed to some unrelated, later `wait()` call.
    pub fn complete_if_pending(&self, result: T) -> bool {
        let waker = {
            let mut inner = self.inner.lock();
            if inner.state != State::Pending {
                return false;
            }
            inner.state = State::Completed;
            inner.result = Some(result);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            if self.scheduler.is_inline() {
                waker.wake();
            } else {
                self.scheduler.schedule(move || waker.wake());
            }
        }
        true
    }

    /// Await the next completion. Resets the primitive to `Idle` once the
    /// result has been observed, so it can be reused for the next
    /// operation (spec's `get_result` semantics).
    pub fn wait(&self) -> Wait<'_, T> {
        Wait { completion: self }
    }

    /// `true` once a result has landed and is waiting to be observed via
    /// [`Self::wait`].
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.lock().state == State::Completed
    }
}

impl IoCompletion {
    /// Deliver a successful completion carrying `bytes_transferred`.
    pub fn try_complete(&self, bytes_transferred: usize) -> bool {
        self.complete(Ok(bytes_transferred))
    }

    /// Deliver a failed completion, e.g. in response to cancellation.
    pub fn abort(&self, error: io::Error) -> bool {
        self.complete(Err(error))
    }
}

/// Future returned by [`AwaitableCompletion::wait`].
pub struct Wait<'a, T> {
    completion: &'a AwaitableCompletion<T>,
}

impl<T> Future for Wait<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.completion.inner.lock();
        match inner.state {
            State::Completed => {
                inner.state = State::Idle;
                Poll::Ready(
                    inner
                        .result
                        .take()
                        .expect("Completed state always carries a result"),
                )
            }
            State::Idle | State::Pending => {
                inner.state = State::Pending;
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_before_poll_resolves_immediately() {
        let completion = IoCompletion::new(Scheduler::Inline);
        assert!(completion.try_complete(42));
        let rt = compio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(completion.wait());
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn double_complete_is_rejected() {
        let completion = IoCompletion::new(Scheduler::Inline);
        assert!(completion.try_complete(1));
        assert!(!completion.try_complete(2));
    }

    #[test]
    fn abort_carries_the_error() {
        let completion = IoCompletion::new(Scheduler::Inline);
        completion.abort(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let rt = compio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(completion.wait());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }
}
