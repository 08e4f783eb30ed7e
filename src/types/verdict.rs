//! Verdicts: the terminal classification of a test node.
//!
//! A verdict is set exactly once, when a node is reported. Failing verdicts
//! carry a [`Failure`] payload describing what went wrong; skip and todo
//! verdicts carry the optional reason given by the user.

use core::fmt;

/// The reason a test failed.
///
/// This wraps the failure value (an `Err` return, a panic payload, a callback
/// error, or a runner-imposed message) for transport to the TAP reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    message: String,
}

impl Failure {
    /// Creates a new failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Creates a failure from any displayable error value.
    #[must_use]
    pub fn from_error(error: impl fmt::Display) -> Self {
        Self::new(error.to_string())
    }

    /// Creates a failure from a caught panic payload.
    ///
    /// String payloads are preserved verbatim; any other payload type is
    /// reported with a placeholder message.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        if let Some(msg) = payload.downcast_ref::<String>() {
            Self::new(msg.clone())
        } else if let Some(msg) = payload.downcast_ref::<&'static str>() {
            Self::new(*msg)
        } else {
            Self::new("<non-string panic payload>")
        }
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The terminal classification of a test node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The test (and every child that counts) succeeded.
    Pass,
    /// The test failed, with the reason.
    Fail(Failure),
    /// The test was skipped, with an optional reason.
    Skipped(Option<String>),
    /// The test ran under a todo annotation and did not fail.
    Todo(Option<String>),
}

impl Verdict {
    /// Returns true if this verdict is `Pass`.
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Returns true if this verdict is `Fail`.
    #[must_use]
    pub const fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    /// Returns true if this verdict is `Skipped`.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// Returns true if this verdict is `Todo`.
    #[must_use]
    pub const fn is_todo(&self) -> bool {
        matches!(self, Self::Todo(_))
    }

    /// Returns true if a child with this verdict forces its parent to fail.
    ///
    /// Only `Fail` counts, and only when the child does not carry a todo
    /// annotation: failures inside a todo test are annotated in TAP but are
    /// non-fatal for the parent.
    #[must_use]
    pub const fn fails_parent(&self, todo_marked: bool) -> bool {
        self.is_fail() && !todo_marked
    }

    /// Returns the failure payload, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Fail(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail(reason) => write!(f, "fail: {reason}"),
            Self::Skipped(Some(reason)) => write!(f, "skipped: {reason}"),
            Self::Skipped(None) => write!(f, "skipped"),
            Self::Todo(Some(reason)) => write!(f, "todo: {reason}"),
            Self::Todo(None) => write!(f, "todo"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_variant() {
        assert!(Verdict::Pass.is_pass());
        assert!(Verdict::Fail(Failure::new("x")).is_fail());
        assert!(Verdict::Skipped(None).is_skipped());
        assert!(Verdict::Todo(None).is_todo());
        assert!(!Verdict::Pass.is_fail());
    }

    #[test]
    fn fail_forces_parent_unless_todo_marked() {
        let fail = Verdict::Fail(Failure::new("boom"));
        assert!(fail.fails_parent(false));
        assert!(!fail.fails_parent(true));
        assert!(!Verdict::Skipped(None).fails_parent(false));
        assert!(!Verdict::Todo(None).fails_parent(false));
    }

    #[test]
    fn panic_payload_string_preserved() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("assert failed".to_string());
        let failure = Failure::from_panic(payload.as_ref());
        assert_eq!(failure.message(), "assert failed");
    }

    #[test]
    fn panic_payload_static_str_preserved() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("oops");
        let failure = Failure::from_panic(payload.as_ref());
        assert_eq!(failure.message(), "oops");
    }

    #[test]
    fn panic_payload_other_type_replaced() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        let failure = Failure::from_panic(payload.as_ref());
        assert_eq!(failure.message(), "<non-string panic payload>");
    }

    #[test]
    fn display_includes_reason() {
        let verdict = Verdict::Fail(Failure::new("broken"));
        assert_eq!(verdict.to_string(), "fail: broken");
        assert_eq!(Verdict::Skipped(Some("wip".into())).to_string(), "skipped: wip");
    }
}
