//! Cancellation conformance: the parent-does-not-await rule and its edges.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tapline::test_utils::{init_test_logging, CaptureBuffer};
use tapline::{Harness, TestBody};

fn init_test(name: &str) {
    init_test_logging();
    tapline::test_phase!(name);
}

struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

fn yield_now() -> YieldNow {
    YieldNow(false)
}

fn run(harness: Harness) -> (String, bool) {
    let buffer = CaptureBuffer::new();
    let report = harness.run(buffer.clone()).expect("run");
    (buffer.contents(), report.success())
}

#[test]
fn parent_completion_cancels_unawaited_child() {
    init_test("parent_completion_cancels_unawaited_child");
    let mut harness = Harness::new();
    harness.test(
        "p",
        TestBody::sync(|cx| {
            let _ = cx.test(
                "c",
                TestBody::future(|_cx| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
            );
            Ok(())
        }),
    );
    let (output, success) = run(harness);
    assert!(!success);
    assert!(output.contains("not ok 1 - c"));
    assert!(output.contains("# error: parent finished before child"));
    assert!(output.contains("not ok 1 - p"));
    assert!(output.contains("# error: 1 subtests failed"));
    tapline::test_complete!("parent_completion_cancels_unawaited_child");
}

#[test]
fn queued_sibling_body_never_starts() {
    init_test("queued_sibling_body_never_starts");
    let ran = Arc::new(AtomicBool::new(false));
    let first_ran = Arc::clone(&ran);
    let second_ran = Arc::clone(&ran);
    let mut harness = Harness::new();
    harness.test(
        "p",
        TestBody::sync(move |cx| {
            let observed = Arc::clone(&first_ran);
            let _ = cx.test(
                "one",
                TestBody::sync(move |_cx| {
                    observed.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            );
            let observed = Arc::clone(&second_ran);
            let _ = cx.test(
                "two",
                TestBody::sync(move |_cx| {
                    observed.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            );
            Ok(())
        }),
    );
    let (output, success) = run(harness);
    assert!(!success);
    assert!(
        !ran.load(Ordering::SeqCst),
        "cancelled bodies must never start"
    );
    assert!(output.contains("not ok 1 - one"));
    assert!(output.contains("not ok 2 - two"));
    tapline::test_complete!("queued_sibling_body_never_starts");
}

#[test]
fn cancelled_subtree_reports_children_before_parent() {
    init_test("cancelled_subtree_reports_children_before_parent");
    let mut harness = Harness::new();
    harness.test(
        "p",
        TestBody::future(|cx| async move {
            let _ = cx.test(
                "mid",
                TestBody::future(|cx| async move {
                    let _ = cx.test(
                        "leaf",
                        TestBody::future(|_cx| async {
                            std::future::pending::<()>().await;
                            Ok(())
                        }),
                    );
                    std::future::pending::<()>().await;
                    Ok(())
                }),
            );
            yield_now().await;
            yield_now().await;
            Ok(())
        }),
    );
    let (output, success) = run(harness);
    assert!(!success);
    let leaf_at = output.find("not ok 1 - leaf").expect("leaf line");
    let mid_at = output.find("not ok 1 - mid").expect("mid line");
    let p_at = output.find("not ok 1 - p").expect("p line");
    assert!(leaf_at < mid_at && mid_at < p_at);
    tapline::test_complete!("cancelled_subtree_reports_children_before_parent");
}

#[test]
fn cancelled_body_keeps_running_and_late_error_goes_to_root() {
    init_test("cancelled_body_keeps_running_and_late_error_goes_to_root");
    let resumed = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&resumed);
    let mut harness = Harness::new();
    harness.test(
        "p",
        TestBody::future(move |cx| async move {
            let observed = Arc::clone(&observed);
            let _ = cx.test(
                "c",
                TestBody::future(move |_cx| async move {
                    yield_now().await;
                    // Resumes after the parent has already finished.
                    observed.store(true, Ordering::SeqCst);
                    Err("late failure".into())
                }),
            );
            yield_now().await;
            Ok(())
        }),
    );
    let (output, success) = run(harness);
    assert!(!success);
    assert!(output.contains("not ok 1 - c"));
    assert!(output.contains("# error: parent finished before child"));
    assert!(
        resumed.load(Ordering::SeqCst),
        "cancellation must not interrupt the body"
    );
    assert!(output.contains("error from cancelled test 'c': late failure"));
    tapline::test_complete!("cancelled_body_keeps_running_and_late_error_goes_to_root");
}
