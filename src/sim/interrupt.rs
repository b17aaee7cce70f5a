//! The interrupt controller.
//!
//! The controller holds three pending slots:
//! - an external interrupt (raised by a device, e.g. the keyboard),
//! - a timer interrupt,
//! - a synchronous trap (raised by the instruction which just executed).
//!
//! Each slot holds at most one pending interrupt.
//! Registering an interrupt while one of that kind is already pending is rejected,
//! so one interrupt is never silently lost under another.
//! The simulator claims pending interrupts at instruction boundaries,
//! which atomically reads and clears the slot.
//!
//! The controller is shared between the execution thread and devices or front ends
//! (via `Arc<InterruptController>`), so all of its methods take `&self`.
//!
//! ```
//! use riscv_ensemble::sim::interrupt::InterruptController;
//!
//! let ctrl = InterruptController::new();
//! assert!(ctrl.register_external(0xFFFF_0000));
//! // already pending:
//! assert!(!ctrl.register_external(0xFFFF_0004));
//!
//! assert_eq!(ctrl.claim_external(), 0xFFFF_0000);
//! assert!(!ctrl.has_pending());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::Trap;

/// Something claimed from the controller.
///
/// This is recorded so that claiming can be undone.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Claim {
    /// An external interrupt, with its value.
    External(u32),
    /// A timer interrupt, with its value.
    Timer(u32),
    /// A synchronous trap.
    Trap(Trap),
}

/// A snapshot of which interrupts are pending.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Pending {
    /// Whether an external interrupt is pending.
    pub external: bool,
    /// Whether a timer interrupt is pending.
    pub timer: bool,
    /// Whether a synchronous trap is pending.
    pub trap: bool,
}
impl Pending {
    /// Whether anything is pending.
    pub fn any(self) -> bool {
        self.external || self.timer || self.trap
    }
}

#[derive(Debug, Default)]
struct Slots {
    external: Option<u32>,
    timer: Option<u32>,
    trap: Option<Trap>,
}
impl Slots {
    fn is_empty(&self) -> bool {
        self.external.is_none() && self.timer.is_none() && self.trap.is_none()
    }
}

/// The pending interrupt and trap state.
#[derive(Debug, Default)]
pub struct InterruptController {
    slots: Mutex<Slots>,
    /// Set while any slot is occupied.
    signal: AtomicBool,
}
impl InterruptController {
    /// Creates a controller with nothing pending.
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // the slots are always consistent, so a poisoned lock is still usable
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes a value out of a slot, lowering the signal once every slot is empty.
    fn take<T>(&self, select: impl FnOnce(&mut Slots) -> &mut Option<T>) -> Option<T> {
        let mut slots = self.lock();
        let value = select(&mut *slots).take();
        if slots.is_empty() {
            self.signal.store(false, Ordering::Release);
        }
        value
    }

    fn register<T>(&self, select: impl FnOnce(&mut Slots) -> &mut Option<T>, value: T, kind: &str) -> bool {
        let mut slots = self.lock();
        let slot = select(&mut *slots);
        if slot.is_some() {
            log::warn!("{kind} interrupt rejected: one is already pending");
            return false;
        }

        *slot = Some(value);
        self.signal.store(true, Ordering::Release);
        true
    }

    /// Registers an external interrupt with the given value.
    ///
    /// Returns `false` (and changes nothing) if an external interrupt is already pending.
    pub fn register_external(&self, value: u32) -> bool {
        self.register(|s| &mut s.external, value, "external")
    }

    /// Registers a timer interrupt with the given value.
    ///
    /// Returns `false` (and changes nothing) if a timer interrupt is already pending.
    pub fn register_timer(&self, value: u32) -> bool {
        self.register(|s| &mut s.timer, value, "timer")
    }

    /// Registers a synchronous trap raised by the instruction at `trap.pc`.
    ///
    /// Returns `false` (and changes nothing) if a trap is already pending.
    pub fn register_synchronous_trap(&self, trap: Trap) -> bool {
        self.register(|s| &mut s.trap, trap, "trap")
    }

    /// Claims the pending external interrupt.
    ///
    /// # Panics
    ///
    /// Panics if no external interrupt is pending.
    pub fn claim_external(&self) -> u32 {
        self.take(|s| &mut s.external)
            .unwrap_or_else(|| panic!("claimed an external interrupt while none was pending"))
    }

    /// Claims the pending timer interrupt.
    ///
    /// # Panics
    ///
    /// Panics if no timer interrupt is pending.
    pub fn claim_timer(&self) -> u32 {
        self.take(|s| &mut s.timer)
            .unwrap_or_else(|| panic!("claimed a timer interrupt while none was pending"))
    }

    /// Claims the pending synchronous trap.
    ///
    /// `current_pc` is the program counter after the faulting instruction.
    ///
    /// # Panics
    ///
    /// Panics if no trap is pending, or if the trap was not raised by the instruction
    /// just before `current_pc`.
    pub fn claim_trap(&self, current_pc: u32) -> Trap {
        let trap = self.take(|s| &mut s.trap)
            .unwrap_or_else(|| panic!("claimed a trap while none was pending"));
        assert_eq!(trap.pc, current_pc.wrapping_sub(4), "claimed a stale trap");
        trap
    }

    /// Checks which interrupts are pending.
    pub fn pending(&self) -> Pending {
        let slots = self.lock();
        Pending {
            external: slots.external.is_some(),
            timer: slots.timer.is_some(),
            trap: slots.trap.is_some(),
        }
    }

    /// Whether anything is pending.
    pub fn has_pending(&self) -> bool {
        self.pending().any()
    }

    /// Whether anything may be pending, checked without locking.
    ///
    /// This is raised by every registration and lowered once the last pending slot is claimed,
    /// so the simulator only locks the controller when it has something to look at.
    pub fn is_signaled(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }

    /// Removes the pending trap without claiming it (used when undoing the faulting instruction).
    pub fn discard_trap(&self) {
        self.take(|s| &mut s.trap);
    }

    /// Puts back something which was claimed (used when undoing a trap entry).
    pub fn restore(&self, claim: Claim) {
        let mut slots = self.lock();
        match claim {
            Claim::External(v) => slots.external = Some(v),
            Claim::Timer(v)    => slots.timer = Some(v),
            Claim::Trap(t)     => slots.trap = Some(t),
        }
        self.signal.store(true, Ordering::Release);
    }

    /// Clears all pending interrupts.
    pub fn reset(&self) {
        *self.lock() = Slots::default();
        self.signal.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::sim::{SimErr, Trap};

    use super::*;

    fn trap(pc: u32) -> Trap {
        Trap { error: SimErr::IllegalInstruction(0), pc }
    }

    #[test]
    fn test_register_once() {
        let ctrl = InterruptController::new();
        assert!(ctrl.register_timer(1));
        assert!(!ctrl.register_timer(2));
        assert!(ctrl.register_external(3));
        assert_eq!(ctrl.pending(), Pending { external: true, timer: true, trap: false });
        assert!(ctrl.is_signaled());

        assert_eq!(ctrl.claim_timer(), 1);
        assert!(ctrl.register_timer(2));
        assert_eq!(ctrl.claim_timer(), 2);

        // the signal stays up until the last slot is claimed
        assert!(ctrl.is_signaled());
        assert_eq!(ctrl.claim_external(), 3);
        assert!(!ctrl.is_signaled());
    }

    #[test]
    fn test_trap() {
        let ctrl = InterruptController::new();
        assert!(ctrl.register_synchronous_trap(trap(0x40_0000)));
        assert!(!ctrl.register_synchronous_trap(trap(0x40_0004)));
        assert_eq!(ctrl.claim_trap(0x40_0004), trap(0x40_0000));

        assert!(!ctrl.is_signaled());

        ctrl.restore(Claim::Trap(trap(0x40_0000)));
        assert!(ctrl.pending().trap);
        assert!(ctrl.is_signaled());
        ctrl.discard_trap();
        assert!(!ctrl.has_pending());
        assert!(!ctrl.is_signaled());
    }

    #[test]
    #[should_panic]
    fn test_claim_unpending() {
        InterruptController::new().claim_external();
    }

    #[test]
    #[should_panic]
    fn test_claim_stale_trap() {
        let ctrl = InterruptController::new();
        ctrl.register_synchronous_trap(trap(0x40_0000));
        ctrl.claim_trap(0x40_0010);
    }

    #[test]
    fn test_reset() {
        let ctrl = InterruptController::new();
        ctrl.register_external(1);
        ctrl.register_synchronous_trap(trap(0));
        ctrl.reset();
        assert!(!ctrl.has_pending());
        assert!(!ctrl.is_signaled());
    }

    #[test]
    fn test_concurrent_registration() {
        let ctrl = Arc::new(InterruptController::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctrl = Arc::clone(&ctrl);
                std::thread::spawn(move || ctrl.register_external(i))
            })
            .collect();

        let accepted = handles.into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(accepted, 1);
    }
}
