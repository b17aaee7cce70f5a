use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockWriteGuard, TryLockError};

use crate::sim::interrupt::InterruptController;

use super::{ExternalDevice, RCR, RDR};

const READY: u32 = 0b01;
const INTERRUPT_ENABLE: u32 = 0b10;

/// Keyboard that accesses input from a memory buffer.
///
/// When interrupts are enabled (bit 1 of the control port),
/// the keyboard raises one external interrupt per character of input.
/// The interrupt carries the address of the control port.
/// If the interrupt is rejected (because one is already pending),
/// the keyboard tries again after the next instruction.
#[derive(Default, Clone)]
pub struct BufferedKeyboard {
    buffer: Arc<RwLock<VecDeque<u8>>>,
    interrupts_enabled: bool,
    // whether the character at the front of the buffer has raised its interrupt
    signalled: bool,
}
impl BufferedKeyboard {
    /// Creates a new keyboard, wrapping it around a given buffer.
    pub fn new(buffer: Arc<RwLock<VecDeque<u8>>>) -> Self {
        Self { buffer, interrupts_enabled: false, signalled: false }
    }

    /// Gets a reference to the internal buffer of this keyboard.
    pub fn get_buffer(&self) -> &Arc<RwLock<VecDeque<u8>>> {
        &self.buffer
    }

    fn try_input(&self) -> Option<RwLockWriteGuard<'_, VecDeque<u8>>> {
        match self.buffer.try_write() {
            Ok(g) => Some(g),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn ready(&self) -> bool {
        self.try_input().is_some_and(|buf| !buf.is_empty())
    }
}
impl std::fmt::Debug for BufferedKeyboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedKeyboard")
            .field("interrupts_enabled", &self.interrupts_enabled)
            .finish_non_exhaustive()
    }
}
impl ExternalDevice for BufferedKeyboard {
    fn io_read(&mut self, offset: u32, effectful: bool) -> Option<u32> {
        match offset {
            RCR => {
                let ie = if self.interrupts_enabled { INTERRUPT_ENABLE } else { 0 };
                let ready = if self.ready() { READY } else { 0 };
                Some(ready | ie)
            },
            RDR if effectful => {
                let byte = self.try_input()?.pop_front()?;
                self.signalled = false;
                Some(u32::from(byte))
            },
            RDR => self.try_input()?.front().copied().map(u32::from),
            _ => None
        }
    }

    fn io_write(&mut self, offset: u32, data: u32) -> bool {
        match offset {
            RCR => {
                self.interrupts_enabled = data & INTERRUPT_ENABLE != 0;
                true
            },
            _ => false
        }
    }

    fn io_reset(&mut self) {
        if let Some(mut inp) = self.try_input() {
            inp.clear();
        }
        self.interrupts_enabled = false;
        self.signalled = false;
    }

    fn poll_interrupt(&mut self, ctrl: &InterruptController, mmio_base: u32) {
        if self.interrupts_enabled && !self.signalled && self.ready() {
            self.signalled = ctrl.register_external(mmio_base.wrapping_add(RCR));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_once_per_char() {
        let input = Arc::new(RwLock::new(VecDeque::from(*b"ab")));
        let mut kb = BufferedKeyboard::new(Arc::clone(&input));
        let ctrl = InterruptController::new();

        // interrupts are disabled
        kb.poll_interrupt(&ctrl, 0xFFFF_0000);
        assert!(!ctrl.has_pending());

        kb.io_write(RCR, INTERRUPT_ENABLE);
        assert_eq!(kb.io_read(RCR, false), Some(READY | INTERRUPT_ENABLE));
        kb.poll_interrupt(&ctrl, 0xFFFF_0000);
        assert_eq!(ctrl.claim_external(), 0xFFFF_0000);

        // same character, no new interrupt
        kb.poll_interrupt(&ctrl, 0xFFFF_0000);
        assert!(!ctrl.has_pending());

        assert_eq!(kb.io_read(RDR, true), Some(u32::from(b'a')));
        kb.poll_interrupt(&ctrl, 0xFFFF_0000);
        assert!(ctrl.pending().external);
    }

    #[test]
    fn test_rejected_interrupt_retries() {
        let input = Arc::new(RwLock::new(VecDeque::from(*b"a")));
        let mut kb = BufferedKeyboard::new(input);
        kb.io_write(RCR, INTERRUPT_ENABLE);

        let ctrl = InterruptController::new();
        assert!(ctrl.register_external(1));
        kb.poll_interrupt(&ctrl, 0);
        assert_eq!(ctrl.claim_external(), 1);

        kb.poll_interrupt(&ctrl, 0);
        assert_eq!(ctrl.claim_external(), RCR);
    }
}
