//! Test body modes and the single-shot completion callback.
//!
//! A body declares how its completion is detected. The mode is chosen at
//! construction time; there is no runtime reflection:
//!
//! - [`TestBody::empty`]: no body, immediate pass
//! - [`TestBody::sync`]: completion is the synchronous return
//! - [`TestBody::future`]: completion is the settlement of the returned
//!   future (value mode)
//! - [`TestBody::callback`]: completion is the first signal on the [`Done`]
//!   handle (callback mode)
//! - [`TestBody::callback_with_future`]: the modes are mutually exclusive;
//!   a body constructed this way always fails with a fixed message
//!
//! # Callback contract
//!
//! `Done` is single-shot. The first signal decides the verdict; later
//! signals are ignored and recorded as a diagnostic. Dropping the handle
//! without signalling is an unresolved completion obligation: the owning
//! test fails rather than hanging the run.

use crate::cx::TestCx;
use crate::runner::state::Shared;
use crate::types::{Failure, TestId};
use core::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Fixed failure message for a body that mixes callback and value modes.
pub(crate) const CALLBACK_AND_FUTURE_MSG: &str =
    "test returned a future and also used a completion callback";

/// Fixed failure message for a completion callback that was never invoked.
pub(crate) const CALLBACK_LEAK_MSG: &str = "completion callback dropped without being invoked";

/// Diagnostic recorded when a completion callback is invoked again.
pub(crate) const CALLBACK_EXTRA_MSG: &str = "completion callback invoked more than once";

/// A boxed test future.
pub type BoxTestFuture = Pin<Box<dyn Future<Output = Result<(), Failure>> + Send + 'static>>;

type SyncFn = Box<dyn FnOnce(&TestCx) -> Result<(), Failure> + Send + 'static>;
type FutureFn = Box<dyn FnOnce(TestCx) -> BoxTestFuture + Send + 'static>;
type CallbackFn = Box<dyn FnOnce(TestCx, Done) + Send + 'static>;
type CallbackFutureFn = Box<dyn FnOnce(TestCx, Done) -> BoxTestFuture + Send + 'static>;

/// A test body with its completion mode.
pub enum TestBody {
    /// No body; the test passes without running anything.
    Empty,
    /// Synchronous body; completion is the return.
    Sync(SyncFn),
    /// Value-mode body; completion is the settlement of the future.
    Future(FutureFn),
    /// Callback-mode body; completion is the first [`Done`] signal.
    Callback(CallbackFn),
    /// Protocol misuse: callback mode that also hands back a future.
    CallbackWithFuture(CallbackFutureFn),
}

impl TestBody {
    /// A body-less test that passes immediately.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// A synchronous body. Panics and `Err` returns become failures.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce(&TestCx) -> Result<(), Failure> + Send + 'static,
    {
        Self::Sync(Box::new(f))
    }

    /// A value-mode body: the test settles with the returned future.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: FnOnce(TestCx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        Self::Future(Box::new(move |cx| Box::pin(f(cx))))
    }

    /// A callback-mode body: the test settles on the first [`Done`] signal.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(TestCx, Done) + Send + 'static,
    {
        Self::Callback(Box::new(f))
    }

    /// A body that takes a completion callback *and* returns a future.
    ///
    /// The two completion protocols are mutually exclusive; a test built
    /// this way runs its closure (so subtest creation is still observed)
    /// but always fails with a fixed message, and the returned future is
    /// discarded unpolled.
    pub fn callback_with_future<F, Fut>(f: F) -> Self
    where
        F: FnOnce(TestCx, Done) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        Self::CallbackWithFuture(Box::new(move |cx, done| Box::pin(f(cx, done))))
    }

    /// Returns the mode name, for logging.
    #[must_use]
    pub(crate) const fn mode(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Sync(_) => "sync",
            Self::Future(_) => "future",
            Self::Callback(_) => "callback",
            Self::CallbackWithFuture(_) => "callback+future",
        }
    }
}

impl Default for TestBody {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for TestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TestBody").field(&self.mode()).finish()
    }
}

#[derive(Debug)]
struct DoneInner {
    /// The decided outcome, present once signalled and not yet consumed.
    outcome: Option<Result<(), Failure>>,
    /// True after the first signal (or the leak on drop).
    signalled: bool,
    /// Waker for the body future waiting on the signal.
    waker: Option<Waker>,
}

/// Single-shot completion callback handed to callback-mode bodies.
///
/// The first call to [`Done::ok`] or [`Done::fail`] decides the test's
/// outcome. The handle may be moved to another thread and signalled there.
pub struct Done {
    inner: Arc<Mutex<DoneInner>>,
    shared: Arc<Shared>,
    node: TestId,
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done").field("node", &self.node).finish()
    }
}

impl Done {
    /// Creates a callback handle and the future that observes its signal.
    pub(crate) fn new(shared: Arc<Shared>, node: TestId) -> (Self, DoneWait) {
        let inner = Arc::new(Mutex::new(DoneInner {
            outcome: None,
            signalled: false,
            waker: None,
        }));
        (
            Self {
                inner: Arc::clone(&inner),
                shared,
                node,
            },
            DoneWait { inner },
        )
    }

    /// Signals successful completion.
    pub fn ok(&self) {
        self.signal(Ok(()));
    }

    /// Signals failure with the given reason.
    pub fn fail(&self, reason: impl Into<Failure>) {
        self.signal(Err(reason.into()));
    }

    fn signal(&self, outcome: Result<(), Failure>) {
        enum Signalled {
            First(Option<Waker>),
            Extra,
        }
        let failed = outcome.is_err();
        let signalled = {
            let mut inner = self.inner.lock().expect("done lock poisoned");
            if inner.signalled {
                Signalled::Extra
            } else {
                inner.signalled = true;
                inner.outcome = Some(outcome);
                Signalled::First(inner.waker.take())
            }
        };
        match signalled {
            Signalled::First(waker) => {
                // An error signal decides the verdict even though the body
                // is still running; later skip/todo marks must not apply.
                if failed {
                    self.shared.note_callback_failure(self.node);
                }
                if let Some(waker) = waker {
                    waker.wake();
                }
                // With no waker yet, the runner observes the stored outcome
                // on its first poll.
            }
            // Already decided: record the extra invocation, do not let it
            // change anything.
            Signalled::Extra => self
                .shared
                .callback_diagnostic(self.node, CALLBACK_EXTRA_MSG.to_string()),
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        let waker = {
            let mut inner = self.inner.lock().expect("done lock poisoned");
            if inner.signalled {
                return;
            }
            inner.signalled = true;
            inner.outcome = Some(Err(Failure::new(CALLBACK_LEAK_MSG)));
            inner.waker.take()
        };
        crate::tracing_compat::debug!(test = %self.node, "completion callback leaked");
        self.shared.note_callback_failure(self.node);
        if let Some(waker) = waker {
            waker.wake();
        } else {
            self.shared.wake_node_driver(self.node);
        }
    }
}

/// Future resolving with the outcome of a [`Done`] signal.
pub(crate) struct DoneWait {
    inner: Arc<Mutex<DoneInner>>,
}

impl Future for DoneWait {
    type Output = Result<(), Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().expect("done lock poisoned");
        if let Some(outcome) = inner.outcome.take() {
            return Poll::Ready(outcome);
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::HarnessConfig;
    use crate::test_utils::{init_test_logging, poll_once};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn shared() -> Arc<Shared> {
        Shared::new(HarnessConfig::default())
    }

    #[test]
    fn body_modes_are_named() {
        init_test("body_modes_are_named");
        assert_eq!(TestBody::empty().mode(), "empty");
        assert_eq!(TestBody::sync(|_cx| Ok(())).mode(), "sync");
        assert_eq!(
            TestBody::future(|_cx| async { Ok(()) }).mode(),
            "future"
        );
        assert_eq!(TestBody::callback(|_cx, done| done.ok()).mode(), "callback");
        crate::test_complete!("body_modes_are_named");
    }

    #[test]
    fn first_signal_decides() {
        init_test("first_signal_decides");
        let (done, mut wait) = Done::new(shared(), TestId::ROOT);
        done.ok();
        let outcome = poll_once(&mut wait).expect("signal pending");
        assert!(outcome.is_ok());
        crate::test_complete!("first_signal_decides");
    }

    #[test]
    fn failure_signal_carries_reason() {
        init_test("failure_signal_carries_reason");
        let (done, mut wait) = Done::new(shared(), TestId::ROOT);
        done.fail("socket closed");
        let outcome = poll_once(&mut wait).expect("signal pending");
        assert_eq!(outcome.unwrap_err().message(), "socket closed");
        crate::test_complete!("failure_signal_carries_reason");
    }

    #[test]
    fn second_signal_is_ignored() {
        init_test("second_signal_is_ignored");
        let (done, mut wait) = Done::new(shared(), TestId::ROOT);
        done.ok();
        done.fail("too late");
        let outcome = poll_once(&mut wait).expect("signal pending");
        assert!(outcome.is_ok(), "first signal must win");
        crate::test_complete!("second_signal_is_ignored");
    }

    #[test]
    fn dropped_handle_fails_with_leak_message() {
        init_test("dropped_handle_fails_with_leak_message");
        let (done, mut wait) = Done::new(shared(), TestId::ROOT);
        drop(done);
        let outcome = poll_once(&mut wait).expect("leak must resolve the wait");
        assert_eq!(outcome.unwrap_err().message(), CALLBACK_LEAK_MSG);
        crate::test_complete!("dropped_handle_fails_with_leak_message");
    }

    #[test]
    fn failure_signal_marks_node_as_failed() {
        init_test("failure_signal_marks_node_as_failed");
        let shared = shared();
        let id = shared.spawn(
            TestId::ROOT,
            "t".into(),
            crate::types::TestOptions::new(),
            TestBody::empty(),
        );
        let (done, _wait) = Done::new(Arc::clone(&shared), id);
        done.fail("boom");
        let tree = shared.lock_tree();
        assert!(tree.nodes.get(id).own_failed);
        crate::test_complete!("failure_signal_marks_node_as_failed");
    }

    #[test]
    fn ok_signal_leaves_node_unmarked() {
        init_test("ok_signal_leaves_node_unmarked");
        let shared = shared();
        let id = shared.spawn(
            TestId::ROOT,
            "t".into(),
            crate::types::TestOptions::new(),
            TestBody::empty(),
        );
        let (done, _wait) = Done::new(Arc::clone(&shared), id);
        done.ok();
        let tree = shared.lock_tree();
        assert!(!tree.nodes.get(id).own_failed);
        crate::test_complete!("ok_signal_leaves_node_unmarked");
    }
}
