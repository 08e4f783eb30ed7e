//! The runner: a single-threaded cooperative driver loop.
//!
//! Every test node gets one driver future that walks it through its
//! lifecycle: acquire a gate permit under the parent, run the body, settle
//! the children, report. Drivers are polled by a step loop that pops from a
//! FIFO ready queue and parks when the queue runs dry; wakers requeue their
//! driver and unpark the loop, so completion signals may arrive from any
//! thread.
//!
//! The loop ends when the root reports. Drivers still outstanding at that
//! point belong to cancelled tests whose outcomes are ignored; they are
//! dropped with the loop.

pub(crate) mod scheduler;
pub(crate) mod state;

use crate::body::{BoxTestFuture, Done, TestBody, CALLBACK_AND_FUTURE_MSG};
use crate::cx::TestCx;
use crate::fault;
use crate::node::TestState;
use crate::tracing_compat::{debug, trace};
use crate::types::{Failure, TestId, Verdict};
use state::{DriverFuture, ReportWait, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

/// The outcome of a node's own body, before child aggregation.
#[derive(Debug)]
pub(crate) enum BodyOutcome {
    /// The body completed without failing.
    Passed,
    /// The body failed: threw, rejected, or signalled an error.
    Failed(Failure),
}

impl From<Result<(), Failure>> for BodyOutcome {
    fn from(result: Result<(), Failure>) -> Self {
        match result {
            Ok(()) => Self::Passed,
            Err(failure) => Self::Failed(failure),
        }
    }
}

/// Wraps a body future so that a panic in any poll becomes a failure.
struct CatchUnwind {
    inner: BoxTestFuture,
}

impl Future for CatchUnwind {
    type Output = Result<(), Failure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match fault::catch(|| self.inner.as_mut().poll(cx)) {
            Ok(Poll::Ready(result)) => Poll::Ready(result),
            Ok(Poll::Pending) => Poll::Pending,
            Err(failure) => Poll::Ready(Err(failure)),
        }
    }
}

/// Runs a body to completion, classifying the outcome by its mode.
async fn run_body(shared: Arc<Shared>, id: TestId, body: TestBody) -> BodyOutcome {
    match body {
        TestBody::Empty => BodyOutcome::Passed,
        TestBody::Sync(f) => {
            let cx = TestCx::new(Arc::clone(&shared), id);
            match fault::catch(move || f(&cx)) {
                Ok(result) => result.into(),
                Err(failure) => BodyOutcome::Failed(failure),
            }
        }
        TestBody::Future(f) => {
            let cx = TestCx::new(Arc::clone(&shared), id);
            match fault::catch(move || f(cx)) {
                Ok(future) => CatchUnwind { inner: future }.await.into(),
                Err(failure) => BodyOutcome::Failed(failure),
            }
        }
        TestBody::Callback(f) => {
            let cx = TestCx::new(Arc::clone(&shared), id);
            let (done, wait) = Done::new(Arc::clone(&shared), id);
            match fault::catch(move || f(cx, done)) {
                Ok(()) => wait.await.into(),
                Err(failure) => BodyOutcome::Failed(failure),
            }
        }
        TestBody::CallbackWithFuture(f) => {
            // Hard contract: the two completion protocols are mutually
            // exclusive. The closure still runs (subtest creation must be
            // observed) but the future is discarded unpolled.
            let cx = TestCx::new(Arc::clone(&shared), id);
            let (done, _wait) = Done::new(Arc::clone(&shared), id);
            match fault::catch(move || f(cx, done)) {
                Ok(future) => {
                    drop(future);
                    BodyOutcome::Failed(Failure::new(CALLBACK_AND_FUTURE_MSG))
                }
                Err(failure) => BodyOutcome::Failed(failure),
            }
        }
    }
}

/// Drives one non-root node through its lifecycle.
pub(crate) async fn drive(shared: Arc<Shared>, id: TestId, body: TestBody) {
    let (gate, ordinal) = {
        let tree = shared.lock_tree();
        let rec = tree.nodes.get(id);
        if rec.is_reported() {
            return;
        }
        let parent = rec.parent.expect("non-root node has a parent");
        (Arc::clone(&tree.nodes.get(parent).gate), rec.ordinal)
    };
    let permit = gate.acquire(ordinal).await;

    // Cancelled while queued: the forced report already happened.
    {
        let tree = shared.lock_tree();
        if tree.nodes.get(id).is_reported() {
            return;
        }
    }

    // Skip requested at creation: cycle the permit for ordering stability,
    // never invoke the body.
    let skip_reason = {
        let tree = shared.lock_tree();
        let rec = tree.nodes.get(id);
        if rec.skip_mark.is_set() {
            Some(rec.skip_mark.reason().map(str::to_string))
        } else {
            None
        }
    };
    if let Some(reason) = skip_reason {
        drop(permit);
        let mut tree = shared.lock_tree();
        if !tree.nodes.get(id).is_reported() {
            shared.finalize(&mut tree, id, Verdict::Skipped(reason));
        }
        return;
    }

    // Pending -> Running
    {
        let mut tree = shared.lock_tree();
        let rec = tree.nodes.get_mut(id);
        if let Err(error) = rec.advance(TestState::Running) {
            debug!(error = %error, "state transition rejected");
        }
        rec.started_at = Some(Instant::now());
        trace!(test = %id, mode = body.mode(), "state -> running");
        tree.running.push(id);
    }

    let outcome = run_body(Arc::clone(&shared), id, body).await;

    // Running -> Settling: the node's own body is complete; flip `finished`
    // before anything else can observe the node.
    {
        let mut tree = shared.lock_tree();
        if tree.nodes.get(id).is_reported() {
            // Cancelled while the body was in flight. The outcome is
            // ignored; a late failure is still worth a root diagnostic.
            if let BodyOutcome::Failed(failure) = outcome {
                let name = tree.nodes.get(id).name.clone();
                let root = tree.root;
                tree.nodes
                    .get_mut(root)
                    .diagnostics
                    .push(format!("error from cancelled test '{name}': {failure}"));
            }
            return;
        }
        {
            let rec = tree.nodes.get_mut(id);
            rec.finished = true;
            if let Err(error) = rec.advance(TestState::Settling) {
                debug!(error = %error, "state transition rejected");
            }
            rec.ended_at = Some(Instant::now());
        }
        tree.running.retain(|&running| running != id);
        trace!(test = %id, "state -> settling");

        // Children still outstanding at this instant are cancelled, in
        // ordinal order; already-reported children aggregate as-is.
        let children = tree.nodes.get(id).children.clone();
        for child in children {
            if !tree.nodes.get(child).is_reported() {
                shared.cancel_subtree(&mut tree, child);
            }
        }

        let own_failure = match outcome {
            BodyOutcome::Passed => None,
            BodyOutcome::Failed(failure) => Some(failure),
        };
        let verdict = Shared::aggregate(&tree, id, own_failure);
        shared.finalize(&mut tree, id, verdict);
    }
    // The gate permit drops here, after the node is reported.
    drop(permit);
}

/// Drives the invisible file root: waits for every attached child
/// (including late arrivals) to report, then settles and closes the
/// document.
pub(crate) async fn drive_root(shared: Arc<Shared>) {
    {
        let mut tree = shared.lock_tree();
        let root = tree.root;
        let rec = tree.nodes.get_mut(root);
        if let Err(error) = rec.advance(TestState::Running) {
            debug!(error = %error, "state transition rejected");
        }
        rec.started_at = Some(Instant::now());
    }
    let mut index = 0;
    loop {
        let next = {
            let mut tree = shared.lock_tree();
            let root = tree.root;
            if index < tree.nodes.get(root).children.len() {
                Some(tree.nodes.get(root).children[index])
            } else {
                // Every attached child is reported; settle under this lock
                // so a late arrival cannot slip in between.
                {
                    let rec = tree.nodes.get_mut(root);
                    rec.finished = true;
                    if let Err(error) = rec.advance(TestState::Settling) {
                        debug!(error = %error, "state transition rejected");
                    }
                    rec.ended_at = Some(Instant::now());
                }
                let verdict = Shared::aggregate(&tree, root, None);
                shared.finalize(&mut tree, root, verdict);
                None
            }
        };
        match next {
            Some(child) => {
                ReportWait::new(Arc::clone(&shared), child).await;
                index += 1;
            }
            None => break,
        }
    }
}

struct TaskWaker {
    id: TestId,
    shared: Arc<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.shared.queue.schedule(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.queue.schedule(self.id);
    }
}

/// The step loop driving all node futures to quiescence.
pub(crate) struct Runner {
    shared: Arc<Shared>,
    tasks: HashMap<TestId, DriverFuture>,
}

impl Runner {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            tasks: HashMap::new(),
        }
    }

    /// Runs until the root reports.
    pub(crate) fn run(&mut self) {
        let root = {
            let tree = self.shared.lock_tree();
            tree.root
        };
        self.tasks
            .insert(root, Box::pin(drive_root(Arc::clone(&self.shared))));
        self.shared.queue.schedule(root);

        loop {
            self.drain_spawned();
            let Some(id) = self.shared.queue.pop() else {
                if self.shared.root_reported() {
                    break;
                }
                self.shared.queue.park();
                continue;
            };
            let Some(mut task) = self.tasks.remove(&id) else {
                continue;
            };
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                shared: Arc::clone(&self.shared),
            }));
            let mut cx = Context::from_waker(&waker);
            match fault::catch(|| task.as_mut().poll(&mut cx)) {
                Ok(Poll::Pending) => {
                    self.tasks.insert(id, task);
                }
                Ok(Poll::Ready(())) => {
                    trace!(test = %id, "driver complete");
                }
                Err(failure) => {
                    // A driver must never panic; if one does, force the
                    // subtree out so the run can still end.
                    debug!(test = %id, failure = %failure, "driver panicked");
                    let mut tree = self.shared.lock_tree();
                    if tree.nodes.get(id).is_reported() {
                        let root = tree.root;
                        tree.nodes
                            .get_mut(root)
                            .diagnostics
                            .push(format!("internal: driver panicked: {failure}"));
                    } else {
                        let children = tree.nodes.get(id).children.clone();
                        for child in children {
                            if !tree.nodes.get(child).is_reported() {
                                self.shared.cancel_subtree(&mut tree, child);
                            }
                        }
                        self.shared
                            .finalize(&mut tree, id, Verdict::Fail(failure));
                    }
                }
            }
        }
    }

    fn drain_spawned(&mut self) {
        let drained = std::mem::take(
            &mut *self
                .shared
                .spawned
                .lock()
                .expect("spawn list poisoned"),
        );
        for (id, driver) in drained {
            self.tasks.insert(id, driver);
        }
    }
}
