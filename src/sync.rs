//! Wait points shared between the blocking and completion contexts.
//!
//! State a waiter checks lives behind short `spin` locks owned by each component.
//! A `WaitQueue` only carries a generation number: a waker updates its state,
//! drops the spin lock and then bumps the generation, while a waiter evaluates its
//! condition with the generation lock held. A wakeup between the check and the
//! sleep therefore cannot be lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

pub(crate) struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Wake every waiter. Must not be called with a component spin lock held.
    pub(crate) fn wake_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until `ready` yields a value or `deadline` passes.
    ///
    /// `ready` is evaluated once more after the deadline, so a condition that became
    /// true just as the timer fired is still reported. Returns `None` on timeout.
    pub(crate) fn wait_until<T>(
        &self,
        deadline: Option<Instant>,
        mut ready: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let mut generation = self.generation.lock();
        loop {
            if let Some(value) = ready() {
                return Some(value);
            }
            let seen = *generation;
            while *generation == seen {
                match deadline {
                    Some(deadline) => {
                        if self.cond.wait_until(&mut generation, deadline).timed_out() {
                            return ready();
                        }
                    }
                    None => self.cond.wait(&mut generation),
                }
            }
        }
    }
}

/// Interrupt source of one handle.
///
/// A wait samples the source when it starts and reports only interrupts raised
/// after that point, so an interrupt nobody was waiting for is simply lost.
pub(crate) struct Interrupter {
    generation: AtomicU64,
}

impl Interrupter {
    pub(crate) fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Flag every wait armed so far. The caller wakes the queues afterwards.
    pub(crate) fn raise(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn arm(&self) -> InterruptToken<'_> {
        InterruptToken {
            source: self,
            seen: self.generation.load(Ordering::SeqCst),
        }
    }
}

/// One wait's view of an [`Interrupter`].
pub(crate) struct InterruptToken<'a> {
    source: &'a Interrupter,
    seen: u64,
}

impl InterruptToken<'_> {
    pub(crate) fn is_raised(&self) -> bool {
        self.source.generation.load(Ordering::SeqCst) != self.seen
    }
}
