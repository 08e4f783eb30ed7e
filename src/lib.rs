//! Tapline: a structured test-tree runner with a streaming TAP reporter.
//!
//! # Overview
//!
//! Tapline executes user-authored test bodies arranged in a tree and emits a
//! deterministic [Test Anything Protocol](https://testanything.org/) version
//! 13 document on an output stream. Every test is a node in the tree; nodes
//! are driven through a strict lifecycle by a single-threaded cooperative
//! runner, and their results are reported in hierarchical order regardless of
//! completion order.
//!
//! # Core Guarantees
//!
//! - **Every test reports exactly once**: verdicts are set exactly once and
//!   the `Reported` state is terminal
//! - **Deterministic output**: sibling result lines appear in creation order;
//!   a parent's result line follows all of its children's lines
//! - **Parents do not await children**: a test finishes when its own body
//!   completes; subtests still outstanding at that instant are cancelled
//!   cooperatively and reported before their parent
//! - **Bounded sibling parallelism**: a per-parent concurrency gate grants
//!   run slots strictly in ordinal order
//! - **No fault escapes the harness**: panics, rejected futures, callback
//!   errors, and stray asynchronous faults are captured and routed to the
//!   owning test, or to the file root when no single owner exists
//!
//! # Module Structure
//!
//! - [`types`]: Core types (identifiers, verdicts, failures, options)
//! - [`body`]: Test body modes and the single-shot completion callback
//! - [`gate`]: The per-parent concurrency gate
//! - [`cx`]: The context handle passed to test bodies
//! - [`harness`]: The root harness, configuration, and run entry points
//! - [`error`]: Error types for the harness's own fallible surface
//! - [`tracing_compat`]: Structured logging that compiles away when disabled
//! - [`test_utils`]: Shared helpers for this crate's own tests
//!
//! # Example
//!
//! ```ignore
//! use tapline::{Harness, TestBody};
//!
//! fn main() -> std::process::ExitCode {
//!     let mut harness = Harness::new();
//!     harness.test("arithmetic", TestBody::sync(|_cx| {
//!         assert_eq!(2 + 2, 4);
//!         Ok(())
//!     }));
//!     harness.test("nested", TestBody::future(|cx| async move {
//!         cx.test("inner", TestBody::sync(|_cx| Ok(()))).await;
//!         Ok(())
//!     }));
//!     harness.run_stdout()
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod body;
pub mod cx;
pub mod error;
mod fault;
pub mod gate;
pub mod harness;
mod node;
mod runner;
mod tap;
pub mod test_utils;
pub mod tracing_compat;
pub mod types;

pub use body::{Done, TestBody};
pub use cx::{Subtest, TestCx};
pub use error::{Error, ErrorKind, Result};
pub use harness::{ConfigError, Harness, HarnessConfig, RunReport};
pub use types::{Annotation, Failure, TestId, TestOptions, Verdict};
