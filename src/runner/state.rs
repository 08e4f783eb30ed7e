//! Shared run state: the node table, fault routing, and reporting.
//!
//! All mutation of the test tree funnels through [`Shared`]. The tree lock
//! is never held across a suspension point, and the lock order is always
//! tree before emitter.

use crate::body::TestBody;
use crate::harness::HarnessConfig;
use crate::node::{NodeRecord, NodeTable, TestState};
use crate::runner::scheduler::ReadyQueue;
use crate::tap::TapEmitter;
use crate::tracing_compat::{debug, trace};
use crate::types::{Annotation, Failure, TestId, TestOptions, Verdict};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

/// Fixed failure message for a subtest cancelled by its parent's completion.
pub(crate) const CANCELLED_MSG: &str = "parent finished before child";

/// Fixed failure message for a subtest created against a finished parent.
pub(crate) const LATE_MSG: &str = "created too late";

/// A node driver stored by the runner.
pub(crate) type DriverFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The tree of test nodes plus the fault router's running stack.
#[derive(Debug)]
pub(crate) struct TreeState {
    /// All node records, indexed by id.
    pub nodes: NodeTable,
    /// The invisible file root.
    pub root: TestId,
    /// Non-root nodes currently in the `Running` state, outermost first.
    pub running: Vec<TestId>,
}

/// Shared state for one harness run.
pub(crate) struct Shared {
    tree: Mutex<TreeState>,
    /// Ready queue for node drivers.
    pub queue: ReadyQueue,
    /// Drivers spawned since the runner last drained this list.
    pub spawned: Mutex<Vec<(TestId, DriverFuture)>>,
    emitter: Mutex<TapEmitter>,
}

impl Shared {
    /// Creates the shared state with an empty tree holding only the root.
    pub(crate) fn new(config: HarnessConfig) -> Arc<Self> {
        let mut nodes = NodeTable::default();
        let root = nodes.insert_with(|id| {
            NodeRecord::new(
                id,
                "<root>".to_string(),
                0,
                0,
                None,
                config.concurrency,
                Annotation::Off,
                Annotation::Off,
            )
        });
        let emitter = TapEmitter::new(config.emit_durations);
        Arc::new(Self {
            tree: Mutex::new(TreeState {
                nodes,
                root,
                running: Vec::new(),
            }),
            queue: ReadyQueue::new(),
            spawned: Mutex::new(Vec::new()),
            emitter: Mutex::new(emitter),
        })
    }

    /// Locks the tree.
    pub(crate) fn lock_tree(&self) -> MutexGuard<'_, TreeState> {
        self.tree.lock().expect("tree lock poisoned")
    }

    /// Locks the emitter. Caller must already hold the tree lock or be
    /// outside any tree access; the lock order is tree before emitter.
    pub(crate) fn lock_emitter(&self) -> MutexGuard<'_, TapEmitter> {
        self.emitter.lock().expect("emitter lock poisoned")
    }

    /// Returns true once the root has been reported.
    pub(crate) fn root_reported(&self) -> bool {
        let tree = self.lock_tree();
        tree.nodes.get(tree.root).is_reported()
    }

    /// Creates a test node under `parent` and schedules its driver.
    ///
    /// A `test` call against a finished or reported parent is a late
    /// arrival: the node is attached to the file root with a forced
    /// failure verdict and its body is never invoked.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        parent: TestId,
        name: String,
        options: TestOptions,
        body: TestBody,
    ) -> TestId {
        let mut tree = self.lock_tree();
        let parent_rec = tree.nodes.get(parent);
        if parent_rec.finished || parent_rec.is_reported() {
            let id = self.attach_late(&mut tree, name);
            drop(body);
            return id;
        }

        let ordinal = parent_rec.children.len();
        let depth = parent_rec.depth + 1;
        let concurrency = options
            .concurrency
            .unwrap_or(parent_rec.concurrency)
            .max(1);
        let id = tree.nodes.insert_with(|id| {
            NodeRecord::new(
                id,
                name,
                depth,
                ordinal,
                Some(parent),
                concurrency,
                options.skip,
                options.todo,
            )
        });
        tree.nodes.get_mut(parent).children.push(id);
        trace!(test = %id, parent = %parent, ordinal, "subtest created");
        drop(tree);

        let driver: DriverFuture = Box::pin(crate::runner::drive(Arc::clone(self), id, body));
        self.spawned
            .lock()
            .expect("spawn list poisoned")
            .push((id, driver));
        self.queue.schedule(id);
        id
    }

    /// Attaches a late arrival to the file root, already failed and reported.
    fn attach_late(self: &Arc<Self>, tree: &mut TreeState, name: String) -> TestId {
        let root = tree.root;
        if tree.nodes.get(root).is_reported() {
            // The run is over; nothing can be emitted any more. Keep the
            // record detached so handles stay inert.
            debug!(name = %name, "subtest created after the run ended; dropped");
            return tree.nodes.insert_with(|id| {
                let mut rec = NodeRecord::new(
                    id,
                    name,
                    1,
                    usize::MAX,
                    None,
                    1,
                    Annotation::Off,
                    Annotation::Off,
                );
                let _ = rec.set_verdict(Verdict::Fail(Failure::new(LATE_MSG)));
                let _ = rec.mark_reported();
                rec
            });
        }

        let ordinal = tree.nodes.get(root).children.len();
        let id = tree.nodes.insert_with(|id| {
            NodeRecord::new(
                id,
                name,
                1,
                ordinal,
                Some(root),
                1,
                Annotation::Off,
                Annotation::Off,
            )
        });
        tree.nodes.get_mut(root).children.push(id);
        debug!(test = %id, "late subtest attached to file root");
        self.finalize(tree, id, Verdict::Fail(Failure::new(LATE_MSG)));
        id
    }

    /// Sets a node's verdict, marks it reported, notifies waiters, and hands
    /// it to the TAP emitter. The root additionally closes the document.
    pub(crate) fn finalize(&self, tree: &mut TreeState, id: TestId, verdict: Verdict) {
        debug!(test = %id, verdict = %verdict, "reported");
        let rec = tree.nodes.get_mut(id);
        if let Err(error) = rec.set_verdict(verdict) {
            debug!(error = %error, "verdict write ignored");
        }
        rec.finished = true;
        let wakers = rec.mark_reported();
        tree.running.retain(|&running| running != id);
        for waker in wakers {
            waker.wake();
        }
        let mut emitter = self.lock_emitter();
        emitter.on_reported(tree, id);
        if id == tree.root {
            emitter.close(tree);
        }
    }

    /// Cancels a still-outstanding subtree, reporting it post-order so that
    /// child result lines precede their parent's.
    ///
    /// Cancellation is cooperative: each node's driver is woken so it can
    /// observe the forced report and unwind, but running bodies are not
    /// interrupted and their eventual outcomes are ignored.
    pub(crate) fn cancel_subtree(&self, tree: &mut TreeState, id: TestId) {
        let children = tree.nodes.get(id).children.clone();
        for child in children {
            if !tree.nodes.get(child).is_reported() {
                self.cancel_subtree(tree, child);
            }
        }
        debug!(test = %id, "cancelled: parent finished first");
        self.finalize(tree, id, Verdict::Fail(Failure::new(CANCELLED_MSG)));
        self.queue.schedule(id);
    }

    /// Computes a node's aggregate verdict at settle time.
    ///
    /// Precedence: the node's own failure, then an explicit skip mark, then
    /// failing non-todo children, then a todo mark, then `Pass`.
    pub(crate) fn aggregate(tree: &TreeState, id: TestId, own_failure: Option<Failure>) -> Verdict {
        let rec = tree.nodes.get(id);
        if let Some(failure) = own_failure {
            return Verdict::Fail(failure);
        }
        if let Some(fault) = rec.async_fault.clone() {
            return Verdict::Fail(fault);
        }
        if rec.skip_mark.is_set() {
            return Verdict::Skipped(rec.skip_mark.reason().map(str::to_string));
        }
        let failed = rec
            .children
            .iter()
            .filter(|&&child| {
                let child_rec = tree.nodes.get(child);
                child_rec
                    .verdict
                    .as_ref()
                    .is_some_and(|v| v.fails_parent(child_rec.todo_mark.is_set()))
            })
            .count();
        if failed > 0 {
            return Verdict::Fail(Failure::new(format!("{failed} subtests failed")));
        }
        if rec.todo_mark.is_set() {
            return Verdict::Todo(rec.todo_mark.reason().map(str::to_string));
        }
        Verdict::Pass
    }

    /// Routes an asynchronous fault with no synchronous attribution.
    ///
    /// When exactly one test is running, the fault becomes a diagnostic on
    /// that test and forces its verdict to `Fail` at settle time. In every
    /// other situation the fault lands as a diagnostic on the file root and
    /// never flips an existing verdict.
    pub(crate) fn route_fault(&self, fault: Failure) {
        let mut tree = self.lock_tree();
        let target = match tree.running.as_slice() {
            [only] => *only,
            _ => tree.root,
        };
        debug!(routed_to = %target, fault = %fault, "asynchronous fault routed");
        let root = tree.root;
        if target == root || tree.nodes.get(target).is_reported() {
            tree.nodes
                .get_mut(root)
                .diagnostics
                .push(fault.to_string());
        } else {
            let rec = tree.nodes.get_mut(target);
            rec.diagnostics.push(fault.to_string());
            if rec.async_fault.is_none() {
                rec.async_fault = Some(fault);
            }
        }
    }

    /// Records that a node's own completion channel has already signalled
    /// a failure while its body is still running (a callback error or a
    /// leaked callback). Later skip/todo requests become diagnostics only.
    pub(crate) fn note_callback_failure(&self, id: TestId) {
        let mut tree = self.lock_tree();
        let rec = tree.nodes.get_mut(id);
        if !rec.is_reported() {
            rec.own_failed = true;
        }
    }

    /// Records a diagnostic from the user context.
    ///
    /// After the node is reported the message is dropped, and a note about
    /// the drop lands on the file root instead.
    pub(crate) fn user_diagnostic(&self, id: TestId, message: String) {
        let mut tree = self.lock_tree();
        if tree.nodes.get(id).is_reported() {
            let name = tree.nodes.get(id).name.clone();
            let root = tree.root;
            tree.nodes.get_mut(root).diagnostics.push(format!(
                "diagnostic from completed test '{name}' dropped: {message}"
            ));
        } else {
            tree.nodes.get_mut(id).diagnostics.push(message);
        }
    }

    /// Records a diagnostic about callback misuse on `id`, or on the root
    /// when `id` has already been reported.
    pub(crate) fn callback_diagnostic(&self, id: TestId, message: String) {
        let mut tree = self.lock_tree();
        if tree.nodes.get(id).is_reported() {
            let name = tree.nodes.get(id).name.clone();
            let root = tree.root;
            tree.nodes
                .get_mut(root)
                .diagnostics
                .push(format!("{message} (test '{name}' already completed)"));
        } else {
            tree.nodes.get_mut(id).diagnostics.push(message);
        }
    }

    /// Applies a skip request from the user context.
    pub(crate) fn mark_skip(&self, id: TestId, annotation: Annotation) {
        self.mark(id, annotation, true);
    }

    /// Applies a todo request from the user context.
    pub(crate) fn mark_todo(&self, id: TestId, annotation: Annotation) {
        self.mark(id, annotation, false);
    }

    fn mark(&self, id: TestId, annotation: Annotation, is_skip: bool) {
        let label = if is_skip { "skip" } else { "todo" };
        let mut tree = self.lock_tree();
        let eligible = {
            let rec = tree.nodes.get(id);
            matches!(rec.state, TestState::Pending | TestState::Running)
                && rec.async_fault.is_none()
                && !rec.own_failed
        };
        if eligible {
            let rec = tree.nodes.get_mut(id);
            let slot = if is_skip {
                &mut rec.skip_mark
            } else {
                &mut rec.todo_mark
            };
            slot.note(annotation);
            return;
        }
        // Too late to change the outcome; keep the request visible.
        let still_running = matches!(
            tree.nodes.get(id).state,
            TestState::Pending | TestState::Running
        );
        let when = if still_running {
            "after failure"
        } else {
            "after completion"
        };
        let note = match annotation.reason() {
            Some(reason) => format!("{label} requested {when}: {reason}"),
            None => format!("{label} requested {when}"),
        };
        if tree.nodes.get(id).is_reported() {
            let name = tree.nodes.get(id).name.clone();
            let root = tree.root;
            tree.nodes
                .get_mut(root)
                .diagnostics
                .push(format!("{note} (test '{name}')"));
        } else {
            tree.nodes.get_mut(id).diagnostics.push(note);
        }
    }

    /// Wakes a node's driver so it can observe new state.
    pub(crate) fn wake_node_driver(&self, id: TestId) {
        self.queue.schedule(id);
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

/// Future resolving once a node has been reported.
///
/// This is the settlement primitive behind subtest handles and the root's
/// wait for its children. It never fails.
pub(crate) struct ReportWait {
    shared: Arc<Shared>,
    id: TestId,
}

impl ReportWait {
    pub(crate) fn new(shared: Arc<Shared>, id: TestId) -> Self {
        Self { shared, id }
    }
}

impl Future for ReportWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut tree = self.shared.lock_tree();
        let rec = tree.nodes.get_mut(self.id);
        if rec.is_reported() {
            return Poll::Ready(());
        }
        if !rec.report_wakers.iter().any(|w| w.will_wake(cx.waker())) {
            rec.report_wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
