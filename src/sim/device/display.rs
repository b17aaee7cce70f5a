use std::sync::{Arc, RwLock, RwLockWriteGuard, TryLockError};

use crate::sim::interrupt::InterruptController;

use super::{ExternalDevice, TCR, TDR};

/// A display that delegates its output to a buffer.
///
/// Each write to the data port appends the low byte of the value to the buffer.
#[derive(Default, Clone)]
pub struct BufferedDisplay {
    buffer: Arc<RwLock<Vec<u8>>>
}
impl BufferedDisplay {
    /// Creates a new display, wrapping it around a given buffer.
    pub fn new(buffer: Arc<RwLock<Vec<u8>>>) -> Self {
        Self { buffer }
    }

    /// Gets a reference to the internal buffer of this display.
    pub fn get_buffer(&self) -> &Arc<RwLock<Vec<u8>>> {
        &self.buffer
    }

    fn try_output(&self) -> Option<RwLockWriteGuard<'_, Vec<u8>>> {
        match self.buffer.try_write() {
            Ok(g) => Some(g),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}
impl std::fmt::Debug for BufferedDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedDisplay").finish_non_exhaustive()
    }
}
impl ExternalDevice for BufferedDisplay {
    fn io_read(&mut self, offset: u32, _effectful: bool) -> Option<u32> {
        match offset {
            TCR => Some(u32::from(self.try_output().is_some())),
            _   => None
        }
    }

    fn io_write(&mut self, offset: u32, data: u32) -> bool {
        match (offset, self.try_output()) {
            (TDR, Some(mut out)) => {
                out.push(data as u8);
                true
            },
            _ => false
        }
    }

    fn io_reset(&mut self) {
        if let Some(mut out) = self.try_output() {
            out.clear();
        }
    }

    fn poll_interrupt(&mut self, _ctrl: &InterruptController, _mmio_base: u32) {}
}
