//! The TAP emitter.
//!
//! Streams a single well-formed TAP version 13 document per run. Result
//! lines for one sibling group always appear in ordinal order, and a
//! parent's result line always follows all of its children's lines; the
//! emitter buffers whatever those guarantees require.
//!
//! Streaming granularity is the root-level subtree: once the next root
//! child (by ordinal) is reported, its whole block is rendered and written.
//! Nested nodes are complete before their parent reports, so a block can
//! always be rendered in one pass.
//!
//! Writes are synchronous. Write errors are sticky: the first one is kept,
//! later writes are skipped, and the run surfaces the error at the end.

use crate::node::NodeRecord;
use crate::runner::state::TreeState;
use crate::types::{TestId, Verdict};
use std::io::{self, Write};

/// Indentation per nesting level.
const INDENT: &str = "  ";

/// Buffered, ordinal-ordered TAP writer.
pub(crate) struct TapEmitter {
    out: Option<Box<dyn Write + Send>>,
    header_written: bool,
    /// Index of the next root child to flush.
    cursor: usize,
    emit_durations: bool,
    error: Option<io::Error>,
}

impl std::fmt::Debug for TapEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapEmitter")
            .field("header_written", &self.header_written)
            .field("cursor", &self.cursor)
            .field("emit_durations", &self.emit_durations)
            .finish_non_exhaustive()
    }
}

impl TapEmitter {
    pub(crate) fn new(emit_durations: bool) -> Self {
        Self {
            out: None,
            header_written: false,
            cursor: 0,
            emit_durations,
            error: None,
        }
    }

    /// Attaches the output stream. Called once, at the start of a run.
    pub(crate) fn set_output(&mut self, out: Box<dyn Write + Send>) {
        self.out = Some(out);
    }

    /// Takes the sticky write error, if any occurred.
    pub(crate) fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    /// Observes a reported node, flushing any root-level blocks that are
    /// now ready in ordinal order.
    pub(crate) fn on_reported(&mut self, tree: &TreeState, id: TestId) {
        if self.out.is_none() || id == tree.root {
            return;
        }
        if tree.nodes.get(id).parent == Some(tree.root) {
            self.flush_ready(tree);
        }
    }

    /// Closes the document: flushes the remaining blocks, the root's
    /// diagnostics, and the final plan.
    pub(crate) fn close(&mut self, tree: &TreeState) {
        self.flush_ready(tree);
        self.write_header_if_needed();
        let root = tree.nodes.get(tree.root);
        for line in &root.diagnostics {
            self.comment(0, line);
        }
        self.plan(0, root.children.len());
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.flush() {
                self.error.get_or_insert(e);
            }
        }
    }

    fn flush_ready(&mut self, tree: &TreeState) {
        loop {
            let root = tree.nodes.get(tree.root);
            let Some(&child) = root.children.get(self.cursor) else {
                return;
            };
            if !tree.nodes.get(child).is_reported() {
                return;
            }
            self.write_header_if_needed();
            self.render_block(tree, child, 0);
            self.cursor += 1;
        }
    }

    /// Renders one node's block: its children's blocks and scope plan
    /// first, then its own result line and diagnostics.
    fn render_block(&mut self, tree: &TreeState, id: TestId, indent: usize) {
        let rec = tree.nodes.get(id);
        if !rec.children.is_empty() {
            for &child in &rec.children {
                self.render_block(tree, child, indent + 1);
            }
            self.plan(indent + 1, rec.children.len());
        }
        self.result_line(rec, indent);
        if self.emit_durations {
            if let Some(ms) = rec.duration_ms() {
                self.comment(indent, &format!("duration_ms: {ms:.3}"));
            }
        }
        if let Some(Verdict::Fail(failure)) = &rec.verdict {
            self.comment(indent, &format!("error: {failure}"));
        }
        for line in &rec.diagnostics {
            self.comment(indent, line);
        }
    }

    fn result_line(&mut self, rec: &NodeRecord, indent: usize) {
        let verdict = rec
            .verdict
            .as_ref()
            .expect("reported node carries a verdict");
        let status = if verdict.is_fail() { "not ok" } else { "ok" };
        let mut line = format!("{status} {} - {}", rec.ordinal + 1, rec.name);
        match verdict {
            Verdict::Skipped(reason) => {
                Self::directive(&mut line, "SKIP", reason.as_deref());
            }
            Verdict::Todo(reason) => {
                Self::directive(&mut line, "TODO", reason.as_deref());
            }
            Verdict::Fail(_) if rec.todo_mark.is_set() => {
                Self::directive(&mut line, "TODO", rec.todo_mark.reason());
            }
            _ => {}
        }
        self.line(indent, &line);
    }

    fn directive(line: &mut String, label: &str, reason: Option<&str>) {
        line.push_str(" # ");
        line.push_str(label);
        if let Some(reason) = reason {
            line.push(' ');
            line.push_str(reason);
        }
    }

    fn write_header_if_needed(&mut self) {
        if !self.header_written {
            self.header_written = true;
            self.line_raw("TAP version 13");
        }
    }

    fn plan(&mut self, indent: usize, count: usize) {
        self.line(indent, &format!("1..{count}"));
    }

    fn comment(&mut self, indent: usize, text: &str) {
        // Multi-line diagnostics stay comment-prefixed on every line.
        for part in text.lines() {
            self.line(indent, &format!("# {part}"));
        }
        if text.is_empty() {
            self.line(indent, "#");
        }
    }

    fn line(&mut self, indent: usize, text: &str) {
        if indent == 0 {
            self.line_raw(text);
        } else {
            self.line_raw(&format!("{}{text}", INDENT.repeat(indent)));
        }
    }

    fn line_raw(&mut self, text: &str) {
        if self.error.is_some() {
            return;
        }
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = writeln!(out, "{text}") {
                self.error.get_or_insert(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::HarnessConfig;
    use crate::runner::state::Shared;
    use crate::test_utils::CaptureBuffer;

    #[test]
    fn directive_with_reason() {
        let mut line = "ok 1 - x".to_string();
        TapEmitter::directive(&mut line, "SKIP", Some("wip"));
        assert_eq!(line, "ok 1 - x # SKIP wip");
    }

    #[test]
    fn directive_without_reason() {
        let mut line = "ok 2 - y".to_string();
        TapEmitter::directive(&mut line, "TODO", None);
        assert_eq!(line, "ok 2 - y # TODO");
    }

    #[test]
    fn close_on_empty_tree_writes_header_and_plan() {
        let shared = Shared::new(HarnessConfig::default());
        let buffer = CaptureBuffer::new();
        let mut emitter = TapEmitter::new(false);
        emitter.set_output(Box::new(buffer.clone()));
        let tree = shared.lock_tree();
        emitter.close(&tree);
        assert_eq!(buffer.contents(), "TAP version 13\n1..0\n");
    }

    #[test]
    fn multi_line_diagnostics_stay_commented() {
        let buffer = CaptureBuffer::new();
        let mut emitter = TapEmitter::new(false);
        emitter.set_output(Box::new(buffer.clone()));
        emitter.comment(1, "first\nsecond");
        assert_eq!(buffer.contents(), "  # first\n  # second\n");
    }
}
