//! A single waker slot shared between an interrupt handler and one waiting task.

use core::cell::UnsafeCell;
use core::task::Waker;

/// Holds at most one [`Waker`]. Every access is a short critical section.
pub(crate) struct WakerSlot {
    waker: UnsafeCell<Option<Waker>>,
}

unsafe impl Send for WakerSlot {}
unsafe impl Sync for WakerSlot {}

impl WakerSlot {
    pub(crate) const fn new() -> Self {
        Self {
            waker: UnsafeCell::new(None),
        }
    }

    /// Store `waker`, replacing (and waking) a waker that belongs to another task.
    pub(crate) fn register(&self, waker: &Waker) {
        let evicted = critical_section::with(|_| {
            // SAFETY: exclusive access inside the critical section.
            let slot = unsafe { &mut *self.waker.get() };

            match slot {
                Some(current) if current.will_wake(waker) => None,
                _ => slot.replace(waker.clone()),
            }
        });

        // The evicted task re-registers if it is still interested.
        if let Some(evicted) = evicted {
            evicted.wake();
        }
    }

    /// Take the stored waker, if any, and wake it.
    pub(crate) fn wake(&self) {
        // SAFETY: exclusive access inside the critical section.
        let waker = critical_section::with(|_| unsafe { &mut *self.waker.get() }.take());

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
