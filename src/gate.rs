//! Per-parent concurrency gate.
//!
//! A gate bounds how many direct children of one parent run at the same
//! time. Each running child holds one permit from the instant its body is
//! about to start until it is reported; skipped children cycle a permit
//! without running anything so that sibling ordering stays stable.
//!
//! # Fairness
//!
//! Grants are strictly FIFO by child ordinal: a permit is never handed to a
//! waiter while a sibling with a smaller ordinal is still waiting. This keeps
//! start order deterministic under any completion order.
//!
//! # Example
//!
//! ```ignore
//! use tapline::gate::ConcurrencyGate;
//!
//! let gate = ConcurrencyGate::new(2);
//!
//! // Acquire a permit for the child with ordinal 0 (awaits until granted)
//! let permit = gate.acquire(0).await;
//!
//! // Permit is released back to the gate when dropped
//! drop(permit);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A counting gate limiting concurrent direct children of one parent.
#[derive(Debug)]
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
    capacity: usize,
}

#[derive(Debug)]
struct GateState {
    /// Number of available permits.
    permits: usize,
    /// Waiters ordered by child ordinal.
    waiters: Vec<GateWaiter>,
}

#[derive(Debug)]
struct GateWaiter {
    ordinal: usize,
    waker: Waker,
}

impl ConcurrencyGate {
    /// Creates a gate with the given capacity.
    ///
    /// Capacities below 1 are clamped to 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(GateState {
                permits: capacity,
                waiters: Vec::new(),
            }),
            capacity,
        }
    }

    /// Returns the gate capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of currently available permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.state.lock().expect("gate lock poisoned").permits
    }

    /// Acquires a permit for the child with the given ordinal.
    ///
    /// The returned future resolves once a permit is available and no
    /// sibling with a smaller ordinal is still waiting.
    pub fn acquire(self: &Arc<Self>, ordinal: usize) -> GateAcquire {
        GateAcquire {
            gate: Arc::clone(self),
            ordinal,
            queued: false,
        }
    }

    /// Returns a permit to the gate and wakes the next waiter in line.
    fn release(&self) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.permits += 1;
        if let Some(front) = state
            .waiters
            .iter()
            .min_by_key(|waiter| waiter.ordinal)
        {
            front.waker.wake_by_ref();
        }
    }
}

/// Future returned by [`ConcurrencyGate::acquire`].
pub struct GateAcquire {
    gate: Arc<ConcurrencyGate>,
    ordinal: usize,
    queued: bool,
}

impl Future for GateAcquire {
    type Output = GatePermit;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut state = this.gate.state.lock().expect("gate lock poisoned");

        let blocked_by_elder = state
            .waiters
            .iter()
            .any(|waiter| waiter.ordinal < this.ordinal);

        if state.permits > 0 && !blocked_by_elder {
            state.permits -= 1;
            state.waiters.retain(|waiter| waiter.ordinal != this.ordinal);
            this.queued = false;
            // Two releases may both have woken this waiter; pass any spare
            // permit on so the next sibling in line is not stranded.
            if state.permits > 0 {
                if let Some(front) = state
                    .waiters
                    .iter()
                    .min_by_key(|waiter| waiter.ordinal)
                {
                    front.waker.wake_by_ref();
                }
            }
            return Poll::Ready(GatePermit {
                gate: Arc::clone(&this.gate),
            });
        }

        if let Some(existing) = state
            .waiters
            .iter_mut()
            .find(|waiter| waiter.ordinal == this.ordinal)
        {
            existing.waker = cx.waker().clone();
        } else {
            state.waiters.push(GateWaiter {
                ordinal: this.ordinal,
                waker: cx.waker().clone(),
            });
        }
        this.queued = true;
        Poll::Pending
    }
}

impl Drop for GateAcquire {
    fn drop(&mut self) {
        if self.queued {
            let mut state = self.gate.state.lock().expect("gate lock poisoned");
            state.waiters.retain(|waiter| waiter.ordinal != self.ordinal);
            // The departing waiter may have been blocking a younger sibling.
            if state.permits > 0 {
                if let Some(front) = state
                    .waiters
                    .iter()
                    .min_by_key(|waiter| waiter.ordinal)
                {
                    front.waker.wake_by_ref();
                }
            }
        }
    }
}

/// A permit from a gate.
#[must_use = "permit will be immediately released if not held"]
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
