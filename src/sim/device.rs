//! Handlers for external devices connected to the simulator.
//!
//! Devices are accessed through memory-mapped IO and raise interrupts
//! through the [`InterruptController`].
//!
//! The core types here are:
//! - [`ExternalDevice`]: A device which can be connected to the simulator.
//! - [`DeviceHandler`]: The handler for the simulator's IO ports.
//!
//! This module also provides some devices:
//! - [`NullDevice`]: Does nothing.
//! - [`BufferedKeyboard`]: Keyboard device that reads off of an input buffer.
//! - [`BufferedDisplay`]: Display device that writes to an output buffer.
//! - [`TimerDevice`]: Raises a timer interrupt every so many instructions.
//!
//! Ports are word addresses given as offsets from the start of MMIO.
//! The keyboard and display have fixed ports:
//!
//! | offset | register                                                  |
//! |--------|-----------------------------------------------------------|
//! | `0x0`  | receiver control (bit 0: ready, bit 1: interrupt enable)  |
//! | `0x4`  | receiver data                                             |
//! | `0x8`  | transmitter control (bit 0: ready)                        |
//! | `0xC`  | transmitter data                                          |
//!
//! Ports with no device attached behave like ordinary memory.

mod keyboard;
mod display;
mod timer;

use std::collections::BTreeMap;

pub use keyboard::BufferedKeyboard;
pub use display::BufferedDisplay;
pub use timer::TimerDevice;

use super::interrupt::InterruptController;

/// Receiver (keyboard) control port.
pub const RCR: u32 = 0x0;
/// Receiver (keyboard) data port.
pub const RDR: u32 = 0x4;
/// Transmitter (display) control port.
pub const TCR: u32 = 0x8;
/// Transmitter (display) data port.
pub const TDR: u32 = 0xC;

/// An external device, which can be accessed via memory-mapped IO or via interrupts.
pub trait ExternalDevice: Send + 'static {
    /// Reads the data at the given port (an offset from the start of MMIO).
    ///
    /// If successful, this returns the value returned from that port.
    /// If unsuccessful, this returns `None` (and the read sees what was last stored there).
    ///
    /// `effectful` is false when the read should not change the device's state.
    fn io_read(&mut self, offset: u32, effectful: bool) -> Option<u32>;

    /// Writes the data to the given port (an offset from the start of MMIO).
    ///
    /// This returns whether the write was accepted.
    fn io_write(&mut self, offset: u32, data: u32) -> bool;

    /// Resets the device.
    fn io_reset(&mut self);

    /// Called once after every instruction, so that the device can raise interrupts.
    ///
    /// `mmio_base` is the address the device's ports are relative to.
    fn poll_interrupt(&mut self, ctrl: &InterruptController, mmio_base: u32);
}

/// The central hub for all external devices of the simulator.
pub struct DeviceHandler {
    base: u32,
    devices: Vec<Box<dyn ExternalDevice>>,
    ports: BTreeMap<u32, usize>,
}

impl DeviceHandler {
    const KB_DEV: usize = 0;
    const DS_DEV: usize = 1;

    /// Creates a new device handler with no devices attached.
    pub fn new(mmio_base: u32) -> Self {
        Self {
            base: mmio_base,
            devices: vec![Box::new(NullDevice), Box::new(NullDevice)],
            ports: BTreeMap::new(),
        }
    }

    /// The address ports are relative to.
    pub fn base(&self) -> u32 {
        self.base
    }
    /// Moves the devices to a new MMIO base address.
    pub fn set_base(&mut self, mmio_base: u32) {
        self.base = mmio_base;
    }

    fn dev_id(&self, port: u32) -> Option<usize> {
        self.ports.get(&port.checked_sub(self.base)?).copied()
    }

    /// Sets the keyboard device.
    pub fn set_keyboard(&mut self, kb: impl ExternalDevice) {
        self.devices[Self::KB_DEV] = Box::new(kb);
        self.ports.insert(RCR, Self::KB_DEV);
        self.ports.insert(RDR, Self::KB_DEV);
    }
    /// Sets the display device.
    pub fn set_display(&mut self, ds: impl ExternalDevice) {
        self.devices[Self::DS_DEV] = Box::new(ds);
        self.ports.insert(TCR, Self::DS_DEV);
        self.ports.insert(TDR, Self::DS_DEV);
    }
    /// Adds a new device (which is not a keyboard or a display).
    ///
    /// This accepts an external device and the port offsets which the device should act on.
    /// If successful, the ID of the device is returned.
    ///
    /// # Errors
    ///
    /// If the device cannot be added, it is returned back.
    /// This happens if one of the offsets is not word-aligned or is already used by another device
    /// (including the keyboard and display ports).
    pub fn add_device<D: ExternalDevice>(&mut self, dev: D, offsets: &[u32]) -> Result<usize, D> {
        let reserved = [RCR, RDR, TCR, TDR];
        let all_valid_ports = offsets.iter()
            .all(|p| p % 4 == 0 && !reserved.contains(p) && !self.ports.contains_key(p));
        if !all_valid_ports { return Err(dev) };

        let dev_id = self.devices.len();
        self.devices.push(Box::new(dev));
        for &p in offsets {
            self.ports.insert(p, dev_id);
        }

        Ok(dev_id)
    }
    /// Removes the device at the given device ID.
    ///
    /// Its ports go back to behaving like memory.
    pub fn remove_device(&mut self, dev_id: usize) {
        if let Some(dev_ref) = self.devices.get_mut(dev_id) {
            *dev_ref = Box::new(NullDevice);
            self.ports.retain(|_, d| *d != dev_id);
        }
    }

    /// Reads from the device at the given address (if there is one).
    pub fn io_read(&mut self, addr: u32, effectful: bool) -> Option<u32> {
        let dev_id = self.dev_id(addr)?;
        self.devices[dev_id].io_read(addr - self.base, effectful)
    }

    /// Writes to the device at the given address,
    /// returning whether the written value should be stored.
    ///
    /// Writes to addresses with no device are always stored.
    pub fn io_write(&mut self, addr: u32, data: u32) -> bool {
        let Some(dev_id) = self.dev_id(addr) else { return true };
        self.devices[dev_id].io_write(addr - self.base, data)
    }

    /// Resets all the devices connected to this handler.
    pub fn io_reset(&mut self) {
        self.devices.iter_mut().for_each(|d| d.io_reset())
    }

    /// Lets every device raise its interrupts.
    pub fn poll(&mut self, ctrl: &InterruptController) {
        let base = self.base;
        self.devices.iter_mut().for_each(|d| d.poll_interrupt(ctrl, base))
    }
}
impl std::fmt::Debug for DeviceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandler")
            .field("base", &self.base)
            .field("devices", &self.devices.len())
            .field("ports", &self.ports)
            .finish()
    }
}

/// Does nothing.
///
/// Does not accept any reads nor writes and never interrupts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NullDevice;
impl ExternalDevice for NullDevice {
    fn io_read(&mut self, _offset: u32, _effectful: bool) -> Option<u32> {
        None
    }

    fn io_write(&mut self, _offset: u32, _data: u32) -> bool {
        false
    }

    fn io_reset(&mut self) {}

    fn poll_interrupt(&mut self, _ctrl: &InterruptController, _mmio_base: u32) {}
}

fn resolve_lock<G>(e: std::sync::TryLockResult<G>) -> Option<G> {
    use std::sync::TryLockError;

    match e {
        Ok(guard) => Some(guard),
        Err(TryLockError::WouldBlock) => None,
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner())
    }
}
impl<D: ExternalDevice + Sync> ExternalDevice for std::sync::Arc<std::sync::RwLock<D>> {
    fn io_read(&mut self, offset: u32, effectful: bool) -> Option<u32> {
        resolve_lock(self.try_write())?
            .io_read(offset, effectful)
    }

    fn io_write(&mut self, offset: u32, data: u32) -> bool {
        resolve_lock(self.try_write())
            .map_or(false, |mut g| g.io_write(offset, data))
    }

    fn io_reset(&mut self) {
        if let Some(mut guard) = resolve_lock(self.try_write()) {
            guard.io_reset();
        }
    }

    fn poll_interrupt(&mut self, ctrl: &InterruptController, mmio_base: u32) {
        if let Some(mut guard) = resolve_lock(self.try_write()) {
            guard.poll_interrupt(ctrl, mmio_base);
        }
    }
}
impl<D: ExternalDevice> ExternalDevice for std::sync::Arc<std::sync::Mutex<D>> {
    fn io_read(&mut self, offset: u32, effectful: bool) -> Option<u32> {
        resolve_lock(self.try_lock())?
            .io_read(offset, effectful)
    }

    fn io_write(&mut self, offset: u32, data: u32) -> bool {
        resolve_lock(self.try_lock())
            .map_or(false, |mut g| g.io_write(offset, data))
    }

    fn io_reset(&mut self) {
        if let Some(mut guard) = resolve_lock(self.try_lock()) {
            guard.io_reset();
        }
    }

    fn poll_interrupt(&mut self, ctrl: &InterruptController, mmio_base: u32) {
        if let Some(mut guard) = resolve_lock(self.try_lock()) {
            guard.poll_interrupt(ctrl, mmio_base);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, RwLock};

    use super::*;

    #[test]
    fn test_unmapped_ports_store() {
        let mut handler = DeviceHandler::new(0xFFFF_0000);
        assert_eq!(handler.io_read(0xFFFF_0000, true), None);
        assert!(handler.io_write(0xFFFF_0000, 5));
        assert!(handler.io_write(0x1000, 5));
    }

    #[test]
    fn test_keyboard_display_ports() {
        let input = Arc::new(RwLock::new(VecDeque::from(*b"hi")));
        let output = Arc::new(RwLock::new(vec![]));

        let mut handler = DeviceHandler::new(0x7F00);
        handler.set_keyboard(BufferedKeyboard::new(Arc::clone(&input)));
        handler.set_display(BufferedDisplay::new(Arc::clone(&output)));

        assert_eq!(handler.io_read(0x7F00 + RCR, true), Some(1));
        assert_eq!(handler.io_read(0x7F00 + RDR, false), Some(u32::from(b'h')));
        assert_eq!(handler.io_read(0x7F00 + RDR, true), Some(u32::from(b'h')));
        assert_eq!(handler.io_read(0x7F00 + RDR, true), Some(u32::from(b'i')));
        assert_eq!(handler.io_read(0x7F00 + RCR, true), Some(0));

        assert_eq!(handler.io_read(0x7F00 + TCR, true), Some(1));
        assert!(handler.io_write(0x7F00 + TDR, u32::from(b'!')));
        assert_eq!(*output.read().unwrap(), b"!");

        handler.io_reset();
        assert!(output.read().unwrap().is_empty());
    }

    #[test]
    fn test_add_remove_device() {
        let mut handler = DeviceHandler::new(0xFFFF_0000);
        let shared = Arc::new(Mutex::new(BufferedDisplay::default()));

        let Err(shared) = handler.add_device(shared, &[TDR]) else { panic!("reserved port accepted") };
        let Err(shared) = handler.add_device(shared, &[0x12]) else { panic!("unaligned port accepted") };
        let id = handler.add_device(Arc::clone(&shared), &[0x20]).unwrap();
        assert_eq!(id, 2);
        assert!(handler.add_device(NullDevice, &[0x20]).is_err());

        // the display's data port is TDR, so writes to 0x20 are rejected
        assert!(!handler.io_write(0xFFFF_0020, 1));
        handler.remove_device(id);
        assert!(handler.io_write(0xFFFF_0020, 1));
    }
}
