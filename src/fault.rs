//! Panic capture and the process-wide fault hook.
//!
//! Panics that unwind out of a test body are captured at the poll boundary
//! by [`catch`] and attributed to the polled test directly. Panics raised
//! anywhere else while a run is active (typically on threads a test body
//! spawned) reach the process panic hook installed by [`PanicHookGuard`],
//! which routes them through the runner's fault router instead of printing
//! the default report.
//!
//! The hook is process-global state: installation is serialized by
//! [`hook_serial`] and the previously installed hook is restored when the
//! guard drops.

use crate::runner::state::Shared;
use crate::types::Failure;
use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

thread_local! {
    /// True while this thread is inside a body poll whose panics are
    /// captured at the poll boundary; the hook stays out of the way.
    static IN_BODY_POLL: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f`, converting an unwinding panic into a [`Failure`].
///
/// While `f` runs, the process panic hook suppresses its own routing for
/// this thread so the panic is attributed exactly once.
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, Failure> {
    let prev = IN_BODY_POLL.with(|flag| flag.replace(true));
    let result = std::panic::catch_unwind(AssertUnwindSafe(f));
    IN_BODY_POLL.with(|flag| flag.set(prev));
    result.map_err(|payload| Failure::from_panic(payload.as_ref()))
}

static HOOK_SERIAL: Mutex<()> = Mutex::new(());

/// Serializes panic-hook installation across concurrent runs in one process.
pub(crate) fn hook_serial() -> MutexGuard<'static, ()> {
    HOOK_SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

type PrevHook = Arc<dyn Fn(&std::panic::PanicHookInfo<'_>) + Send + Sync>;

/// Installs the routing panic hook for the duration of a run.
///
/// Dropping the guard restores the previously installed hook.
pub(crate) struct PanicHookGuard {
    prev: PrevHook,
}

impl PanicHookGuard {
    pub(crate) fn install(shared: Arc<Shared>) -> Self {
        let prev: PrevHook = Arc::from(std::panic::take_hook());
        std::panic::set_hook(Box::new(move |info| {
            if IN_BODY_POLL.with(Cell::get) {
                return;
            }
            let failure = Failure::from_panic(info.payload());
            let message = match info.location() {
                Some(location) => format!("uncaught panic at {location}: {failure}"),
                None => format!("uncaught panic: {failure}"),
            };
            shared.route_fault(Failure::new(message));
        }));
        Self { prev }
    }
}

impl Drop for PanicHookGuard {
    fn drop(&mut self) {
        let _ = std::panic::take_hook();
        let prev = Arc::clone(&self.prev);
        std::panic::set_hook(Box::new(move |info| prev(info)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::HarnessConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn catch_passes_through_return_value() {
        let result = catch(|| 41 + 1);
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn catch_converts_panic_to_failure() {
        let result: Result<(), Failure> = catch(|| panic!("kaboom"));
        assert_eq!(result.unwrap_err().message(), "kaboom");
    }

    #[test]
    fn catch_resets_suppression_flag() {
        let _ = catch(|| panic!("first"));
        assert!(!IN_BODY_POLL.with(Cell::get));
    }

    #[test]
    fn hook_guard_restores_previous_hook() {
        let _serial = hook_serial();
        let fired = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&fired);
        std::panic::set_hook(Box::new(move |_| observed.store(true, Ordering::SeqCst)));
        {
            let shared = Shared::new(HarnessConfig::default());
            let _guard = PanicHookGuard::install(shared);
        }
        let _ = std::panic::catch_unwind(|| panic!("probe"));
        assert!(
            fired.load(Ordering::SeqCst),
            "the prior hook must be reinstated when the guard drops"
        );
        let _ = std::panic::take_hook();
    }
}
