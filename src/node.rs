//! Test node records.
//!
//! A node record holds one test's identity, options, lifecycle state,
//! verdict, diagnostics, children, and timing. Records are mutated only by
//! the runner and by the narrow surface the context handle exposes; user
//! code never touches a record directly.

use crate::error::{Error, ErrorKind, Result};
use crate::gate::ConcurrencyGate;
use crate::types::{Annotation, Failure, TestId, Verdict, ANONYMOUS};
use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

/// The state of a test node in its lifecycle.
///
/// States advance strictly forward: `Pending → Running → Settling →
/// Reported`. Skipped and cancelled nodes jump straight to `Reported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TestState {
    /// Created, body not yet started.
    Pending,
    /// Body is executing (possibly suspended).
    Running,
    /// Body complete; children being resolved.
    Settling,
    /// Terminal state; verdict set and handed to the reporter.
    Reported,
}

impl TestState {
    /// Returns true if this is the terminal state.
    pub(crate) const fn is_terminal(self) -> bool {
        matches!(self, Self::Reported)
    }

    /// Position in the forward-only lifecycle order.
    pub(crate) const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Settling => 2,
            Self::Reported => 3,
        }
    }
}

/// Internal record for one test node.
#[derive(Debug)]
pub(crate) struct NodeRecord {
    /// This node's id.
    pub id: TestId,
    /// Reported name.
    pub name: String,
    /// Tree depth; 0 is the file root.
    pub depth: usize,
    /// Position among siblings, in creation order (0-based).
    pub ordinal: usize,
    /// Parent node; `None` only for the root.
    pub parent: Option<TestId>,
    /// Lifecycle state.
    pub state: TestState,
    /// Flips the instant the node's own body completes. Once true, new
    /// children are late arrivals.
    pub finished: bool,
    /// Terminal verdict; set exactly once.
    pub verdict: Option<Verdict>,
    /// Skip mark, merged from creation options and context calls.
    pub skip_mark: Annotation,
    /// Todo mark, merged from creation options and context calls.
    pub todo_mark: Annotation,
    /// Effective concurrency budget for this node's direct children.
    pub concurrency: usize,
    /// Gate governing this node's direct children.
    pub gate: Arc<ConcurrencyGate>,
    /// Direct children in creation order.
    pub children: Vec<TestId>,
    /// Diagnostics, in arrival order.
    pub diagnostics: Vec<String>,
    /// An asynchronous fault routed to this node while it was running.
    pub async_fault: Option<Failure>,
    /// True once the node's own completion channel has signalled a failure
    /// while the body is still running (a callback error or leak). Later
    /// skip/todo requests are diagnostics only.
    pub own_failed: bool,
    /// Body start instant.
    pub started_at: Option<Instant>,
    /// Body end instant.
    pub ended_at: Option<Instant>,
    /// Wakers to notify when this node is reported.
    pub report_wakers: Vec<Waker>,
}

impl NodeRecord {
    /// Creates a record in the `Pending` state.
    pub(crate) fn new(
        id: TestId,
        name: String,
        depth: usize,
        ordinal: usize,
        parent: Option<TestId>,
        concurrency: usize,
        skip_mark: Annotation,
        todo_mark: Annotation,
    ) -> Self {
        let name = if name.is_empty() {
            ANONYMOUS.to_string()
        } else {
            name
        };
        Self {
            id,
            name,
            depth,
            ordinal,
            parent,
            state: TestState::Pending,
            finished: false,
            verdict: None,
            skip_mark,
            todo_mark,
            concurrency,
            gate: Arc::new(ConcurrencyGate::new(concurrency)),
            children: Vec::new(),
            diagnostics: Vec::new(),
            async_fault: None,
            own_failed: false,
            started_at: None,
            ended_at: None,
            report_wakers: Vec::new(),
        }
    }

    /// Returns true once the node has been reported.
    pub(crate) const fn is_reported(&self) -> bool {
        self.state.is_terminal()
    }

    /// Advances the lifecycle state. States only move forward; a backward
    /// or repeated transition is an internal invariant breach.
    pub(crate) fn advance(&mut self, next: TestState) -> Result<()> {
        if next.rank() <= self.state.rank() {
            return Err(Error::new(ErrorKind::InvalidStateTransition)
                .with_context(format!("{:?} -> {next:?} for {}", self.state, self.id)));
        }
        self.state = next;
        Ok(())
    }

    /// Sets the verdict. The verdict is written exactly once; a second
    /// write is an internal invariant breach and leaves the first in place.
    pub(crate) fn set_verdict(&mut self, verdict: Verdict) -> Result<()> {
        if self.verdict.is_some() {
            return Err(Error::new(ErrorKind::VerdictAlreadySet)
                .with_context(format!("verdict for {} already set", self.id)));
        }
        self.verdict = Some(verdict);
        Ok(())
    }

    /// Marks the node reported and drains its report wakers for notification.
    pub(crate) fn mark_reported(&mut self) -> Vec<Waker> {
        if let Err(error) = self.advance(TestState::Reported) {
            crate::tracing_compat::debug!(error = %error, "already reported");
        }
        if self.ended_at.is_none() {
            self.ended_at = Some(Instant::now());
        }
        std::mem::take(&mut self.report_wakers)
    }

    /// Duration between body start and end, in milliseconds.
    pub(crate) fn duration_ms(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.ended_at?;
        Some(end.duration_since(start).as_secs_f64() * 1000.0)
    }
}

/// The node table: records indexed by [`TestId`].
#[derive(Debug, Default)]
pub(crate) struct NodeTable {
    nodes: Vec<NodeRecord>,
}

impl NodeTable {
    /// Inserts a record built by `make` from the id it will receive.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(TestId) -> NodeRecord) -> TestId {
        let id = TestId::from_index(self.nodes.len());
        self.nodes.push(make(id));
        id
    }

    /// Returns the record for `id`.
    pub(crate) fn get(&self, id: TestId) -> &NodeRecord {
        &self.nodes[id.index()]
    }

    /// Returns the mutable record for `id`.
    pub(crate) fn get_mut(&mut self, id: TestId) -> &mut NodeRecord {
        &mut self.nodes[id.index()]
    }

    /// Number of records, including the root.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Iterates over all records.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }
}
