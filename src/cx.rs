//! The context handle passed to test bodies.
//!
//! `TestCx` is the only surface user code has onto its own test node:
//! diagnostics, skip/todo marks, and subtest creation all flow through it.
//! The handle is cheap to clone and may be moved across threads; every
//! operation is routed back to the runner, which owns all tree mutation.

use crate::body::TestBody;
use crate::runner::state::{ReportWait, Shared};
use crate::types::{Annotation, TestId, TestOptions};
use core::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Context handle for one test node.
///
/// # Example
///
/// ```ignore
/// use tapline::{TestBody, TestOptions};
///
/// TestBody::future(|cx| async move {
///     cx.diagnostic("starting");
///     let child = cx.test("child", TestBody::sync(|_cx| Ok(())));
///     child.await;
///     Ok(())
/// })
/// ```
#[derive(Clone)]
pub struct TestCx {
    shared: Arc<Shared>,
    id: TestId,
}

impl fmt::Debug for TestCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCx").field("id", &self.id).finish()
    }
}

impl TestCx {
    pub(crate) fn new(shared: Arc<Shared>, id: TestId) -> Self {
        Self { shared, id }
    }

    /// Returns this test's id.
    #[must_use]
    pub const fn id(&self) -> TestId {
        self.id
    }

    /// Appends a diagnostic message to this test's TAP output.
    ///
    /// Never fails. Once the test has been reported the message is dropped,
    /// and a note about the drop lands at the file root instead.
    pub fn diagnostic(&self, message: impl Into<String>) {
        self.shared.user_diagnostic(self.id, message.into());
    }

    /// Marks this test skipped. The body keeps running; the mark decides
    /// the verdict at settle time unless the test fails first.
    pub fn skip(&self) {
        self.shared.mark_skip(self.id, Annotation::On);
    }

    /// Marks this test skipped with a reason. On repeat calls the first
    /// non-empty reason wins.
    pub fn skip_because(&self, reason: impl Into<String>) {
        self.shared
            .mark_skip(self.id, Annotation::Reason(reason.into()));
    }

    /// Marks this test todo: it still runs, and a failure is annotated in
    /// TAP but does not fail the parent.
    pub fn todo(&self) {
        self.shared.mark_todo(self.id, Annotation::On);
    }

    /// Marks this test todo with a reason. On repeat calls the first
    /// non-empty reason wins.
    pub fn todo_because(&self, reason: impl Into<String>) {
        self.shared
            .mark_todo(self.id, Annotation::Reason(reason.into()));
    }

    /// Creates a subtest of this test.
    ///
    /// The returned handle settles once the subtest is reported; it never
    /// fails (subtest failures surface in TAP output, not here). A subtest
    /// created after this test has finished is a late arrival: it is
    /// attached to the file root, reported as failed, and its body never
    /// runs.
    pub fn test(&self, name: impl Into<String>, body: TestBody) -> Subtest {
        self.test_with(name, TestOptions::new(), body)
    }

    /// Creates a subtest with explicit options.
    pub fn test_with(
        &self,
        name: impl Into<String>,
        options: TestOptions,
        body: TestBody,
    ) -> Subtest {
        let id = self.shared.spawn(self.id, name.into(), options, body);
        Subtest::new(Arc::clone(&self.shared), id)
    }
}

/// Handle for a created subtest.
///
/// Awaiting the handle suspends until the subtest reaches its terminal
/// state. Dropping it without awaiting is fine; the subtest is unaffected.
pub struct Subtest {
    wait: ReportWait,
    id: TestId,
}

impl Subtest {
    pub(crate) fn new(shared: Arc<Shared>, id: TestId) -> Self {
        Self {
            wait: ReportWait::new(shared, id),
            id,
        }
    }

    /// Returns the subtest's id.
    #[must_use]
    pub const fn id(&self) -> TestId {
        self.id
    }
}

impl fmt::Debug for Subtest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subtest").field("id", &self.id).finish()
    }
}

impl Future for Subtest {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.wait).poll(cx)
    }
}
