//! Per-test creation options.
//!
//! Options cover the full vocabulary accepted at test creation:
//! `concurrency` (sibling parallelism for the node's children), `skip`, and
//! `todo`. Skip and todo accept either a bare flag or a reason string, which
//! [`Annotation`] models as one type.

/// A skip or todo annotation: off, set, or set with a reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Annotation {
    /// Not set.
    #[default]
    Off,
    /// Set without a reason.
    On,
    /// Set with a reason string.
    Reason(String),
}

impl Annotation {
    /// Returns true if the annotation is set (with or without a reason).
    #[must_use]
    pub const fn is_set(&self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Returns the reason, if one was given.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Reason(r) => Some(r.as_str()),
            _ => None,
        }
    }

    /// Merges a repeated annotation request into this one.
    ///
    /// The first non-empty reason wins: an unset annotation takes the
    /// incoming value, a reasonless `On` is upgraded by the first reason,
    /// and an existing reason is never replaced. Returns true if anything
    /// changed.
    pub fn note(&mut self, incoming: Self) -> bool {
        match (&*self, &incoming) {
            (Self::Off, _) if incoming.is_set() => {
                *self = incoming;
                true
            }
            (Self::On, Self::Reason(_)) => {
                *self = incoming;
                true
            }
            _ => false,
        }
    }
}

impl From<bool> for Annotation {
    fn from(set: bool) -> Self {
        if set {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl From<&str> for Annotation {
    fn from(reason: &str) -> Self {
        Self::Reason(reason.to_string())
    }
}

impl From<String> for Annotation {
    fn from(reason: String) -> Self {
        Self::Reason(reason)
    }
}

/// Options accepted when creating a test.
///
/// # Example
///
/// ```ignore
/// use tapline::TestOptions;
///
/// let options = TestOptions::new().concurrency(4).todo("flaky on CI");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    /// Sibling parallelism for this node's direct children. Inherited from
    /// the parent when absent; the root defaults to 1.
    pub concurrency: Option<usize>,
    /// Skip this test without invoking its body.
    pub skip: Annotation,
    /// Run this test but treat a failure as non-fatal for the parent.
    pub todo: Annotation,
}

impl TestOptions {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency budget for this node's direct children.
    ///
    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    /// Marks the test as skipped.
    #[must_use]
    pub fn skip(mut self, annotation: impl Into<Annotation>) -> Self {
        self.skip = annotation.into();
        self
    }

    /// Marks the test as todo.
    #[must_use]
    pub fn todo(mut self, annotation: impl Into<Annotation>) -> Self {
        self.todo = annotation.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Annotation Tests
    // =========================================================================

    #[test]
    fn default_is_off() {
        let annotation = Annotation::default();
        assert!(!annotation.is_set());
        assert_eq!(annotation.reason(), None);
    }

    #[test]
    fn reason_is_exposed() {
        let annotation = Annotation::from("not ready");
        assert!(annotation.is_set());
        assert_eq!(annotation.reason(), Some("not ready"));
    }

    #[test]
    fn note_first_reason_wins() {
        let mut annotation = Annotation::Off;
        assert!(annotation.note(Annotation::from("first")));
        assert!(!annotation.note(Annotation::from("second")));
        assert_eq!(annotation.reason(), Some("first"));
    }

    #[test]
    fn note_upgrades_bare_flag_with_reason() {
        let mut annotation = Annotation::On;
        assert!(annotation.note(Annotation::from("late reason")));
        assert_eq!(annotation.reason(), Some("late reason"));
    }

    #[test]
    fn note_ignores_off() {
        let mut annotation = Annotation::Off;
        assert!(!annotation.note(Annotation::Off));
        assert!(!annotation.is_set());
    }

    // =========================================================================
    // TestOptions Tests
    // =========================================================================

    #[test]
    fn concurrency_clamped_to_one() {
        let options = TestOptions::new().concurrency(0);
        assert_eq!(options.concurrency, Some(1));
    }

    #[test]
    fn builder_sets_annotations() {
        let options = TestOptions::new().skip(true).todo("someday");
        assert!(options.skip.is_set());
        assert_eq!(options.todo.reason(), Some("someday"));
    }
}
