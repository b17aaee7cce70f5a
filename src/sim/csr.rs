//! The control and status registers.
//!
//! The CSR space is sparse: only the user-level trap CSRs, the floating-point CSRs,
//! and the counters are implemented. Unimplemented CSRs read as zero and ignore writes.
//!
//! | CSR        | number  | kind                                |
//! |------------|---------|-------------------------------------|
//! | `ustatus`  | `0x000` | masked (only `UIE`, `UPIE` writable) |
//! | `fflags`   | `0x001` | bits 4:0 of `fcsr`                  |
//! | `frm`      | `0x002` | bits 7:5 of `fcsr`                  |
//! | `fcsr`     | `0x003` | masked (only bits 7:0 writable)     |
//! | `uie`      | `0x004` | plain                               |
//! | `utvec`    | `0x005` | plain                               |
//! | `uscratch` | `0x040` | plain                               |
//! | `uepc`     | `0x041` | plain                               |
//! | `ucause`   | `0x042` | plain                               |
//! | `utval`    | `0x043` | plain                               |
//! | `uip`      | `0x044` | plain                               |
//! | `cycle`    | `0xC00` | read-only                           |
//! | `time`     | `0xC01` | read-only                           |
//! | `instret`  | `0xC02` | read-only                           |
//! | `cycleh`   | `0xC80` | upper half of `cycle`               |
//! | `timeh`    | `0xC81` | upper half of `time`                |
//! | `instreth` | `0xC82` | upper half of `instret`             |
//!
//! CSRs whose number has `11` in bits 11:10 are read-only to the program,
//! so writing them through [`CsrFile::update`] fails with [`RegisterError::ReadOnly`].

use std::time::Instant;

use super::backstep::BackStepper;
use super::observer::{Notifier, RegisterNotice, Subscription};
use super::regs::{FileKind, RegRef, Register, RegisterError, RegisterFile};

#[allow(missing_docs)]
pub mod numbers {
    pub const USTATUS: u32 = 0x000;
    pub const FFLAGS: u32 = 0x001;
    pub const FRM: u32 = 0x002;
    pub const FCSR: u32 = 0x003;
    pub const UIE: u32 = 0x004;
    pub const UTVEC: u32 = 0x005;
    pub const USCRATCH: u32 = 0x040;
    pub const UEPC: u32 = 0x041;
    pub const UCAUSE: u32 = 0x042;
    pub const UTVAL: u32 = 0x043;
    pub const UIP: u32 = 0x044;
    pub const CYCLE: u32 = 0xC00;
    pub const TIME: u32 = 0xC01;
    pub const INSTRET: u32 = 0xC02;
    pub const CYCLEH: u32 = 0xC80;
    pub const TIMEH: u32 = 0xC81;
    pub const INSTRETH: u32 = 0xC82;
}
use numbers::*;

/// Bits of `ustatus`.
pub mod status {
    /// User interrupt enable.
    pub const UIE: u64 = 0x1;
    /// The value of `UIE` before the current trap.
    pub const UPIE: u64 = 0x10;
}

/// Bits of `uie` and `uip`.
pub mod interrupts {
    /// User software interrupt.
    pub const SOFTWARE: u64 = 0x1;
    /// User timer interrupt.
    pub const TIMER: u64 = 0x10;
    /// User external interrupt.
    pub const EXTERNAL: u64 = 0x100;
}

/// Floating-point exception flags (the bits of `fflags`).
pub mod fflags {
    /// Inexact.
    pub const NX: u64 = 0x01;
    /// Underflow.
    pub const UF: u64 = 0x02;
    /// Overflow.
    pub const OF: u64 = 0x04;
    /// Divide by zero.
    pub const DZ: u64 = 0x08;
    /// Invalid operation.
    pub const NV: u64 = 0x10;
}

const HIGH_HALF: u64 = 0xFFFF_FFFF_0000_0000;

/// Whether the CSR number lies in the read-only part of the CSR space.
pub fn is_read_only(number: u32) -> bool {
    (number >> 10) & 0b11 == 0b11
}

/// The control and status register file.
#[derive(Debug)]
pub struct CsrFile {
    file: RegisterFile,
    started: Instant,
}
impl CsrFile {
    /// Creates the CSR file with every CSR at its reset value.
    pub fn new() -> Self {
        let file = RegisterFile::new(FileKind::Csr, vec![
            Register::masked("ustatus", USTATUS, 0, !0x11),
            Register::linked("fflags", FFLAGS, 3, 0x1F),
            Register::linked("frm", FRM, 3, 0xE0),
            Register::masked("fcsr", FCSR, 0, !0xFF),
            Register::plain("uie", UIE, 0),
            Register::plain("utvec", UTVEC, 0),
            Register::plain("uscratch", USCRATCH, 0),
            Register::plain("uepc", UEPC, 0),
            Register::plain("ucause", UCAUSE, 0),
            Register::plain("utval", UTVAL, 0),
            Register::plain("uip", UIP, 0),
            Register::read_only("cycle", CYCLE, 0),
            Register::read_only("time", TIME, 0),
            Register::read_only("instret", INSTRET, 0),
            Register::linked("cycleh", CYCLEH, 11, HIGH_HALF),
            Register::linked("timeh", TIMEH, 12, HIGH_HALF),
            Register::linked("instreth", INSTRETH, 13, HIGH_HALF),
        ]);

        Self { file, started: Instant::now() }
    }

    /// Gets the value of a CSR.
    pub fn get<'a>(&self, r: impl Into<RegRef<'a>>) -> Result<u64, RegisterError> {
        self.file.get(r)
    }

    /// Reads the CSR with the given number (zero if it is not implemented).
    pub fn read(&self, number: u32) -> u64 {
        self.file.get(number).unwrap_or(0)
    }

    /// Whether a CSR with this number exists.
    pub fn is_implemented(&self, number: u32) -> bool {
        self.file.index_of(number).is_ok()
    }

    /// Writes a CSR as the program would, returning its previous value.
    ///
    /// Writes to unimplemented CSRs are ignored.
    ///
    /// # Errors
    ///
    /// Fails with [`RegisterError::ReadOnly`] if the CSR is read-only to the program.
    ///
    /// ```
    /// use riscv_ensemble::sim::csr::{numbers, CsrFile};
    ///
    /// let mut csrs = CsrFile::new();
    /// // only UIE and UPIE can be set:
    /// csrs.update(numbers::USTATUS, 0xFF, None).unwrap();
    /// assert_eq!(csrs.read(numbers::USTATUS), 0x11);
    ///
    /// assert!(csrs.update(numbers::CYCLEH, 1, None).is_err());
    /// ```
    pub fn update(&mut self, number: u32, value: u64, rec: Option<&mut BackStepper>) -> Result<u64, RegisterError> {
        let Ok(index) = self.file.index_of(number) else { return Ok(0) };
        if is_read_only(number) {
            let name = self.file.register(RegRef::Index(index))?.name();
            return Err(RegisterError::ReadOnly(name));
        }

        self.file.set(RegRef::Index(index), value, rec)
    }

    /// Writes a CSR, ignoring read-only and masked protection.
    ///
    /// Writes to unimplemented CSRs are ignored.
    pub fn update_backdoor(&mut self, number: u32, value: u64, rec: Option<&mut BackStepper>) -> u64 {
        self.file.set_backdoor(number, value, rec).unwrap_or(0)
    }

    /// Sets the given bits of a CSR.
    pub fn or_register(&mut self, number: u32, bits: u64, rec: Option<&mut BackStepper>) -> Result<u64, RegisterError> {
        let old = self.read(number);
        self.update(number, old | bits, rec)
    }

    /// Clears the given bits of a CSR.
    pub fn clear_register(&mut self, number: u32, bits: u64, rec: Option<&mut BackStepper>) -> Result<u64, RegisterError> {
        let old = self.read(number);
        self.update(number, old & !bits, rec)
    }

    /// Advances the counters after an instruction retires.
    ///
    /// `cycle` and `instret` count up by one, and `time` holds the microseconds since the last reset.
    pub fn tick(&mut self, mut rec: Option<&mut BackStepper>) {
        let elapsed = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);

        let cycle = self.read(CYCLE).wrapping_add(1);
        let instret = self.read(INSTRET).wrapping_add(1);
        self.update_backdoor(CYCLE, cycle, rec.as_deref_mut());
        self.update_backdoor(TIME, elapsed, rec.as_deref_mut());
        self.update_backdoor(INSTRET, instret, rec);
    }

    /// Writes back the old value of the CSR at an index while undoing an instruction.
    pub fn restore(&mut self, index: usize, value: u64) {
        self.file.restore(index, value);
    }

    /// Resets every CSR and restarts the clock.
    pub fn reset(&mut self) {
        self.file.reset();
        self.started = Instant::now();
    }

    /// The underlying register file.
    pub fn file(&self) -> &RegisterFile {
        &self.file
    }

    /// Subscribes to CSR write notices.
    pub fn subscribe(&mut self) -> Subscription<RegisterNotice> {
        self.file.subscribe()
    }
    /// The notifier for CSR write notices.
    pub fn notifier_mut(&mut self) -> &mut Notifier<RegisterNotice> {
        self.file.notifier_mut()
    }
}
impl Default for CsrFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::backstep::{BackStep, BackStepper};

    use super::*;

    #[test]
    fn test_fp_fields() {
        let mut csrs = CsrFile::new();
        csrs.update(FRM, 0b011, None).unwrap();
        csrs.or_register(FFLAGS, fflags::NX | fflags::DZ, None).unwrap();
        assert_eq!(csrs.read(FCSR), 0b011_01001);

        // fcsr only has 8 writable bits
        csrs.update(FCSR, 0xFFFF, None).unwrap();
        assert_eq!(csrs.read(FCSR), 0xFF);
        assert_eq!(csrs.read(FRM), 0b111);
        assert_eq!(csrs.get("fflags"), Ok(0x1F));
    }

    #[test]
    fn test_unimplemented() {
        let mut csrs = CsrFile::new();
        assert!(!csrs.is_implemented(0x300));
        assert_eq!(csrs.update(0x300, 5, None), Ok(0));
        assert_eq!(csrs.read(0x300), 0);
    }

    #[test]
    fn test_read_only() {
        let mut csrs = CsrFile::new();
        assert_eq!(csrs.update(CYCLE, 5, None), Err(RegisterError::ReadOnly("cycle")));
        assert_eq!(csrs.update(INSTRETH, 5, None), Err(RegisterError::ReadOnly("instreth")));

        csrs.update_backdoor(CYCLE, 0x2_0000_0003, None);
        assert_eq!(csrs.read(CYCLE), 0x2_0000_0003);
        assert_eq!(csrs.read(CYCLEH), 2);
    }

    #[test]
    fn test_status_bits() {
        let mut csrs = CsrFile::new();
        csrs.or_register(USTATUS, status::UIE | status::UPIE | 0x100, None).unwrap();
        assert_eq!(csrs.read(USTATUS), 0x11);
        csrs.clear_register(USTATUS, status::UIE, None).unwrap();
        assert_eq!(csrs.read(USTATUS), status::UPIE);
    }

    #[test]
    fn test_tick_records() {
        let mut csrs = CsrFile::new();
        let mut bs = BackStepper::new();
        bs.set_enabled(true);
        bs.begin(0);
        csrs.tick(bs.recorder());
        bs.commit();

        assert_eq!(csrs.read(CYCLE), 1);
        assert_eq!(csrs.read(INSTRET), 1);
        let group = bs.pop().unwrap();
        assert_eq!(group.actions.len(), 3);
        assert_eq!(group.actions[0], BackStep::CsrBackdoor { index: 11, value: 0 });

        csrs.restore(11, 0);
        assert_eq!(csrs.read(CYCLE), 0);
        csrs.reset();
        assert_eq!(csrs.read(INSTRET), 0);
    }
}
