//! The root harness: configuration, run entry points, and the run report.
//!
//! A [`Harness`] owns the invisible root node for one file. Top-level tests
//! register against the root, [`Harness::run`] drives the tree to
//! quiescence while the fault hook is installed, and the resulting
//! [`RunReport`] carries the aggregate verdict and the process exit code.

use crate::body::TestBody;
use crate::cx::Subtest;
use crate::error::{Error, ErrorKind, Result};
use crate::fault::{hook_serial, PanicHookGuard};
use crate::runner::state::Shared;
use crate::runner::Runner;
use crate::tracing_compat::info;
use crate::types::{TestOptions, Verdict};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error parsing a configuration override from the environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// The environment variable name.
        var: &'static str,
        /// The offending value.
        value: String,
    },
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::new(ErrorKind::Config).with_source(e)
    }
}

/// Configuration for a harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Concurrency budget for the root's direct children.
    pub concurrency: usize,
    /// Emit a `duration_ms` diagnostic after every result line.
    pub emit_durations: bool,
}

impl HarnessConfig {
    /// Environment variable overriding the root concurrency.
    pub const ENV_CONCURRENCY: &'static str = "TAPLINE_CONCURRENCY";
    /// Environment variable enabling duration diagnostics.
    pub const ENV_EMIT_DURATIONS: &'static str = "TAPLINE_EMIT_DURATIONS";

    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            concurrency: 1,
            emit_durations: false,
        }
    }

    /// Sets the root concurrency budget. Values below 1 are clamped to 1.
    #[must_use]
    pub const fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = if concurrency == 0 { 1 } else { concurrency };
        self
    }

    /// Sets whether to emit `duration_ms` diagnostics.
    #[must_use]
    pub const fn emit_durations(mut self, emit: bool) -> Self {
        self.emit_durations = emit;
        self
    }

    /// Applies overrides from the environment.
    ///
    /// `TAPLINE_CONCURRENCY` takes a positive integer;
    /// `TAPLINE_EMIT_DURATIONS` takes `0`/`1`/`true`/`false`.
    pub fn from_env() -> core::result::Result<Self, ConfigError> {
        let mut config = Self::new();
        if let Ok(value) = std::env::var(Self::ENV_CONCURRENCY) {
            let parsed: usize = value.parse().map_err(|_| ConfigError::Invalid {
                var: Self::ENV_CONCURRENCY,
                value: value.clone(),
            })?;
            config = config.concurrency(parsed);
        }
        if let Ok(value) = std::env::var(Self::ENV_EMIT_DURATIONS) {
            config.emit_durations = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: Self::ENV_EMIT_DURATIONS,
                        value,
                    })
                }
            };
        }
        Ok(config)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The root's aggregate verdict.
    pub verdict: Verdict,
    /// Number of tests reported (the root is not counted).
    pub total: usize,
    /// Tests that passed.
    pub passed: usize,
    /// Tests that failed and were not marked todo.
    pub failed: usize,
    /// Tests that were skipped.
    pub skipped: usize,
    /// Tests under a todo annotation (passing or failing).
    pub todo: usize,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunReport {
    /// Returns true if the run as a whole passed.
    #[must_use]
    pub const fn success(&self) -> bool {
        !self.verdict.is_fail()
    }

    /// The process exit code: 0 on success, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        if self.success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        }
    }
}

/// The entry point for one file's tests.
#[derive(Debug)]
pub struct Harness {
    shared: Arc<Shared>,
}

impl Harness {
    /// Creates a harness with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }

    /// Creates a harness with the given configuration.
    #[must_use]
    pub fn with_config(config: HarnessConfig) -> Self {
        Self {
            shared: Shared::new(config),
        }
    }

    /// Registers a top-level test.
    pub fn test(&mut self, name: impl Into<String>, body: TestBody) -> Subtest {
        self.test_with(name, TestOptions::new(), body)
    }

    /// Registers a top-level test with explicit options.
    pub fn test_with(
        &mut self,
        name: impl Into<String>,
        options: TestOptions,
        body: TestBody,
    ) -> Subtest {
        let root = {
            let tree = self.shared.lock_tree();
            tree.root
        };
        let id = self.shared.spawn(root, name.into(), options, body);
        Subtest::new(Arc::clone(&self.shared), id)
    }

    /// Runs every registered test to completion, writing TAP to `out`.
    ///
    /// The process panic hook is installed for the duration of the run and
    /// the previous hook is restored before this returns. The only error
    /// surfaced here is a failure to write the TAP document; test failures
    /// are reported through the document and the exit code.
    pub fn run(self, out: impl Write + Send + 'static) -> Result<RunReport> {
        let started = Instant::now();
        // Process-global state below: one run at a time per process.
        let _serial = hook_serial();
        self.shared.lock_emitter().set_output(Box::new(out));
        let hook = PanicHookGuard::install(Arc::clone(&self.shared));

        Runner::new(Arc::clone(&self.shared)).run();
        drop(hook);

        if let Some(io_error) = self.shared.lock_emitter().take_error() {
            return Err(Error::from(io_error).with_context("writing TAP output"));
        }

        let report = self.summarize(started.elapsed());
        info!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            skipped = report.skipped,
            todo = report.todo,
            "run complete"
        );
        Ok(report)
    }

    /// Runs with TAP on standard output, for use from `fn main`.
    ///
    /// Exit code 0 when the root verdict passes, 1 otherwise (including a
    /// failure to write the document itself).
    pub fn run_stdout(self) -> ExitCode {
        match self.run(std::io::stdout()) {
            Ok(report) => report.exit_code(),
            Err(error) => {
                eprintln!("tapline: {error}");
                ExitCode::from(1)
            }
        }
    }

    fn summarize(&self, duration: Duration) -> RunReport {
        let tree = self.shared.lock_tree();
        let verdict = tree
            .nodes
            .get(tree.root)
            .verdict
            .clone()
            .unwrap_or(Verdict::Pass);
        let mut report = RunReport {
            verdict,
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            todo: 0,
            duration,
        };
        for rec in tree.nodes.iter() {
            if rec.id == tree.root || rec.parent.is_none() {
                continue;
            }
            let Some(verdict) = &rec.verdict else { continue };
            report.total += 1;
            match verdict {
                Verdict::Pass => report.passed += 1,
                Verdict::Fail(_) if rec.todo_mark.is_set() => report.todo += 1,
                Verdict::Fail(_) => report.failed += 1,
                Verdict::Skipped(_) => report.skipped += 1,
                Verdict::Todo(_) => report.todo += 1,
            }
        }
        report
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{env_lock, init_test_logging, CaptureBuffer};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    // =========================================================================
    // Configuration Tests
    // =========================================================================

    #[test]
    fn default_config() {
        init_test("default_config");
        let config = HarnessConfig::default();
        assert_eq!(config.concurrency, 1);
        assert!(!config.emit_durations);
        crate::test_complete!("default_config");
    }

    #[test]
    fn concurrency_clamped() {
        init_test("concurrency_clamped");
        let config = HarnessConfig::new().concurrency(0);
        assert_eq!(config.concurrency, 1);
        crate::test_complete!("concurrency_clamped");
    }

    #[test]
    fn from_env_reads_overrides() {
        init_test("from_env_reads_overrides");
        let _env = env_lock();
        std::env::set_var(HarnessConfig::ENV_CONCURRENCY, "4");
        std::env::set_var(HarnessConfig::ENV_EMIT_DURATIONS, "true");
        let config = HarnessConfig::from_env().expect("valid overrides");
        assert_eq!(config.concurrency, 4);
        assert!(config.emit_durations);
        std::env::remove_var(HarnessConfig::ENV_CONCURRENCY);
        std::env::remove_var(HarnessConfig::ENV_EMIT_DURATIONS);
        crate::test_complete!("from_env_reads_overrides");
    }

    #[test]
    fn from_env_rejects_garbage() {
        init_test("from_env_rejects_garbage");
        let _env = env_lock();
        std::env::set_var(HarnessConfig::ENV_CONCURRENCY, "many");
        let err = HarnessConfig::from_env().expect_err("must reject");
        assert!(matches!(err, ConfigError::Invalid { var, .. }
            if var == HarnessConfig::ENV_CONCURRENCY));
        std::env::remove_var(HarnessConfig::ENV_CONCURRENCY);
        crate::test_complete!("from_env_rejects_garbage");
    }

    // =========================================================================
    // Run Tests
    // =========================================================================

    #[test]
    fn empty_run_emits_empty_plan() {
        init_test("empty_run_emits_empty_plan");
        let harness = Harness::new();
        let buffer = CaptureBuffer::new();
        let report = harness.run(buffer.clone()).expect("run");
        assert!(report.success());
        assert_eq!(report.total, 0);
        assert_eq!(buffer.contents(), "TAP version 13\n1..0\n");
        crate::test_complete!("empty_run_emits_empty_plan");
    }

    #[test]
    fn single_passing_test() {
        init_test("single_passing_test");
        let mut harness = Harness::new();
        harness.test("a", TestBody::sync(|_cx| Ok(())));
        let buffer = CaptureBuffer::new();
        let report = harness.run(buffer.clone()).expect("run");
        assert!(report.success());
        assert_eq!(report.passed, 1);
        assert_eq!(buffer.contents(), "TAP version 13\nok 1 - a\n1..1\n");
        crate::test_complete!("single_passing_test");
    }

    #[test]
    fn durations_emitted_when_enabled() {
        init_test("durations_emitted_when_enabled");
        let mut harness = Harness::with_config(HarnessConfig::new().emit_durations(true));
        harness.test("timed", TestBody::sync(|_cx| Ok(())));
        let buffer = CaptureBuffer::new();
        harness.run(buffer.clone()).expect("run");
        let output = buffer.contents();
        assert!(output.contains("ok 1 - timed"));
        assert!(output.contains("# duration_ms:"));
        crate::test_complete!("durations_emitted_when_enabled");
    }

    #[test]
    fn failing_test_sets_exit_code() {
        init_test("failing_test_sets_exit_code");
        let mut harness = Harness::new();
        harness.test("bad", TestBody::sync(|_cx| Err("broken".into())));
        let buffer = CaptureBuffer::new();
        let report = harness.run(buffer.clone()).expect("run");
        assert!(!report.success());
        assert_eq!(report.failed, 1);
        let output = buffer.contents();
        assert!(output.contains("not ok 1 - bad"));
        assert!(output.contains("# error: broken"));
        crate::test_complete!("failing_test_sets_exit_code");
    }
}
