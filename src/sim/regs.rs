//! Register files.
//!
//! A [`RegisterFile`] is an ordered collection of [`Register`]s which can be
//! looked up by index, by architectural number, or by name (see [`RegRef`]).
//!
//! Each register has a [`RegisterKind`], which determines what a write does:
//! - [`RegisterKind::Plain`]: the write stores the value.
//! - [`RegisterKind::ReadOnly`]: the write does nothing.
//! - [`RegisterKind::Masked`]: bits in the mask are protected and keep their old value.
//! - [`RegisterKind::Linked`]: the register is a view of a bit slice of another register.
//!
//! Backdoor writes ([`RegisterFile::set_backdoor`]) ignore read-only and masked protection.
//! These are used by the simulator itself (e.g., to set trap CSRs or to tick counters).
//!
//! ```
//! use riscv_ensemble::sim::mem::MemoryConfig;
//! use riscv_ensemble::sim::regs::RegisterFile;
//!
//! let mut regs = RegisterFile::integer(&MemoryConfig::DEFAULT);
//! assert_eq!(regs.get("sp"), Ok(0x7fff_effc));
//!
//! regs.set("a0", 5, None).unwrap();
//! assert_eq!(regs.get(10), Ok(5));
//!
//! // x0 is hardwired to zero:
//! regs.set("zero", 5, None).unwrap();
//! assert_eq!(regs.get("zero"), Ok(0));
//! ```

use crate::ast::{FReg, Reg, FPR_NAMES, GPR_NAMES};

use super::backstep::{BackStep, BackStepper};
use super::mem::MemoryConfig;
use super::observer::{AccessType, Notifier, RegisterNotice, Subscription};

const SP_NUMBER: u32 = 2;
const GP_NUMBER: u32 = 3;

/// Which register file a register belongs to.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum FileKind {
    /// The general-purpose integer registers (`x0`-`x31`).
    Integer,
    /// The floating-point registers (`f0`-`f31`).
    Float,
    /// The control and status registers.
    Csr,
}

/// How writes to a register behave.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RegisterKind {
    /// Writes store the value.
    Plain,
    /// Writes are ignored.
    ReadOnly,
    /// Bits set in `mask` are protected: a write computes `(old & mask) | (value & !mask)`.
    Masked {
        /// The protected bits.
        mask: u64
    },
    /// This register has no storage of its own,
    /// and is instead a view of the bits of `mask` in the register at index `target`.
    ///
    /// Reading computes `(target & mask) >> shift` (where `shift` is the
    /// position of the lowest bit of the mask). Writing replaces those bits of the target,
    /// subject to the target's own kind.
    Linked {
        /// The index of the register holding the value.
        target: usize,
        /// The bits of the target register which this register views.
        mask: u64
    },
}

/// A register.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Register {
    name: &'static str,
    alias: Option<&'static str>,
    number: u32,
    value: u64,
    reset_value: u64,
    kind: RegisterKind,
}
impl Register {
    fn new(name: &'static str, number: u32, reset_value: u64, kind: RegisterKind) -> Self {
        Self { name, alias: None, number, value: reset_value, reset_value, kind }
    }

    /// A plain register.
    pub fn plain(name: &'static str, number: u32, reset_value: u64) -> Self {
        Self::new(name, number, reset_value, RegisterKind::Plain)
    }
    /// A read-only register.
    pub fn read_only(name: &'static str, number: u32, reset_value: u64) -> Self {
        Self::new(name, number, reset_value, RegisterKind::ReadOnly)
    }
    /// A register whose `mask` bits are write-protected.
    pub fn masked(name: &'static str, number: u32, reset_value: u64, mask: u64) -> Self {
        Self::new(name, number, reset_value, RegisterKind::Masked { mask })
    }
    /// A view of the `mask` bits of the register at index `target`.
    pub fn linked(name: &'static str, number: u32, target: usize, mask: u64) -> Self {
        Self::new(name, number, 0, RegisterKind::Linked { target, mask })
    }
    /// Adds an alternate name to this register.
    pub fn with_alias(mut self, alias: &'static str) -> Self {
        self.alias = Some(alias);
        self
    }

    /// The name of this register.
    pub fn name(&self) -> &'static str {
        self.name
    }
    /// The alternate name of this register (if it has one).
    pub fn alias(&self) -> Option<&'static str> {
        self.alias
    }
    /// The architectural number of this register.
    pub fn number(&self) -> u32 {
        self.number
    }
    /// The kind of this register.
    pub fn kind(&self) -> RegisterKind {
        self.kind
    }
    /// The value this register takes on reset.
    pub fn reset_value(&self) -> u64 {
        self.reset_value
    }
}

/// A reference to a register in a [`RegisterFile`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RegRef<'a> {
    /// The position of the register in the file.
    Index(usize),
    /// The architectural number of the register.
    Number(u32),
    /// The name (or alias) of the register.
    Name(&'a str),
}
impl From<u32> for RegRef<'_> {
    fn from(value: u32) -> Self {
        RegRef::Number(value)
    }
}
impl<'a> From<&'a str> for RegRef<'a> {
    fn from(value: &'a str) -> Self {
        RegRef::Name(value)
    }
}
impl From<Reg> for RegRef<'_> {
    fn from(value: Reg) -> Self {
        RegRef::Number(u32::from(value.reg_no()))
    }
}
impl From<FReg> for RegRef<'_> {
    fn from(value: FReg) -> Self {
        RegRef::Number(u32::from(value.reg_no()))
    }
}
impl std::fmt::Display for RegRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegRef::Index(i)  => write!(f, "index {i}"),
            RegRef::Number(n) => write!(f, "number {n}"),
            RegRef::Name(s)   => write!(f, "{s:?}"),
        }
    }
}

/// Errors from accessing a [`RegisterFile`].
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum RegisterError {
    /// No register matched the reference.
    #[error("no register with {0}")]
    NotFound(String),
    /// The register cannot be written.
    #[error("register {0} is read-only")]
    ReadOnly(&'static str),
}

/// The position of the lowest set bit of a mask (64 for an empty mask).
fn mask_shift(mask: u64) -> u32 {
    mask.trailing_zeros()
}

/// A collection of registers.
#[derive(Debug)]
pub struct RegisterFile {
    kind: FileKind,
    regs: Vec<Register>,
    notices: Notifier<RegisterNotice>,
}
impl RegisterFile {
    /// Creates a register file from a list of registers.
    ///
    /// # Panics
    ///
    /// Panics if a linked register does not target a register of the file
    /// which holds its own value (i.e., one which is not also linked).
    pub fn new(kind: FileKind, regs: Vec<Register>) -> Self {
        for reg in &regs {
            if let RegisterKind::Linked { target, .. } = reg.kind {
                let target_kind = regs.get(target).map(|r| r.kind);
                assert!(
                    !matches!(target_kind, None | Some(RegisterKind::Linked { .. })),
                    "linked register {} has invalid target {target}", reg.name
                );
            }
        }

        Self { kind, regs, notices: Notifier::new() }
    }

    /// The general-purpose register file.
    ///
    /// `zero` is read-only, and the reset values of `sp` and `gp` come from the memory configuration.
    pub fn integer(config: &MemoryConfig) -> Self {
        let regs = GPR_NAMES.iter()
            .zip(0..)
            .map(|(&name, n)| match n {
                0 => Register::read_only(name, n, 0),
                SP_NUMBER => Register::plain(name, n, u64::from(config.stack_pointer)),
                GP_NUMBER => Register::plain(name, n, u64::from(config.global_pointer)),
                8 => Register::plain(name, n, 0).with_alias("fp"),
                _ => Register::plain(name, n, 0),
            })
            .collect();

        Self::new(FileKind::Integer, regs)
    }

    /// The floating-point register file.
    pub fn float() -> Self {
        let regs = FPR_NAMES.iter()
            .zip(0..)
            .map(|(&name, n)| Register::plain(name, n, 0))
            .collect();

        Self::new(FileKind::Float, regs)
    }

    /// Which file this is.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Finds the index of a register.
    pub fn index_of<'a>(&self, r: impl Into<RegRef<'a>>) -> Result<usize, RegisterError> {
        let r = r.into();
        let found = match r {
            RegRef::Index(i) => (i < self.regs.len()).then_some(i),
            RegRef::Number(n) => self.regs.iter().position(|reg| reg.number == n),
            RegRef::Name(s) => self.regs.iter().position(|reg| reg.name == s || reg.alias == Some(s)),
        };

        found.ok_or_else(|| RegisterError::NotFound(r.to_string()))
    }

    /// Gets a register's definition.
    pub fn register<'a>(&self, r: impl Into<RegRef<'a>>) -> Result<&Register, RegisterError> {
        let i = self.index_of(r)?;
        Ok(&self.regs[i])
    }

    /// Gets the value of a register.
    pub fn get<'a>(&self, r: impl Into<RegRef<'a>>) -> Result<u64, RegisterError> {
        self.index_of(r).map(|i| self.value_at(i))
    }

    /// Gets the value of the register at an index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn value_at(&self, index: usize) -> u64 {
        match self.regs[index].kind {
            RegisterKind::Linked { target, mask } => {
                (self.regs[target].value & mask).checked_shr(mask_shift(mask)).unwrap_or(0)
            },
            _ => self.regs[index].value,
        }
    }

    /// Writes a register, returning its previous value.
    ///
    /// Writes to read-only registers do nothing (and return the unchanged value).
    pub fn set<'a>(&mut self, r: impl Into<RegRef<'a>>, value: u64, rec: Option<&mut BackStepper>) -> Result<u64, RegisterError> {
        let i = self.index_of(r)?;
        Ok(self.write(i, value, rec, false))
    }

    /// Writes the register at an index, returning its previous value.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn set_at(&mut self, index: usize, value: u64, rec: Option<&mut BackStepper>) -> u64 {
        self.write(index, value, rec, false)
    }

    /// Writes a register, ignoring read-only and masked protection.
    pub fn set_backdoor<'a>(&mut self, r: impl Into<RegRef<'a>>, value: u64, rec: Option<&mut BackStepper>) -> Result<u64, RegisterError> {
        let i = self.index_of(r)?;
        Ok(self.write(i, value, rec, true))
    }

    fn write(&mut self, index: usize, value: u64, rec: Option<&mut BackStepper>, backdoor: bool) -> u64 {
        let old = self.value_at(index);

        match self.regs[index].kind {
            RegisterKind::Linked { target, mask } => {
                let shifted = value.checked_shl(mask_shift(mask)).unwrap_or(0);
                let composed = self.regs[target].value & !mask | shifted & mask;
                if self.write_physical(target, composed, rec, backdoor) {
                    self.publish(index);
                }
            },
            _ => {
                self.write_physical(index, value, rec, backdoor);
            }
        }

        old
    }

    /// Stores into a register which holds its own value, returning whether anything was stored.
    fn write_physical(&mut self, index: usize, value: u64, rec: Option<&mut BackStepper>, backdoor: bool) -> bool {
        let reg = &self.regs[index];
        let new = match (reg.kind, backdoor) {
            (_, true) => value,
            (RegisterKind::ReadOnly, false) => return false,
            (RegisterKind::Masked { mask }, false) => reg.value & mask | value & !mask,
            (RegisterKind::Plain | RegisterKind::Linked { .. }, false) => value,
        };

        if let Some(rec) = rec {
            let old = reg.value;
            rec.record(match (self.kind, backdoor) {
                (FileKind::Csr, true) => BackStep::CsrBackdoor { index, value: old },
                (file, _) => BackStep::Register { file, index, value: old },
            });
        }
        self.regs[index].value = new;
        self.publish(index);
        true
    }

    fn publish(&mut self, index: usize) {
        let value = self.value_at(index);
        let reg = &self.regs[index];
        self.notices.publish(RegisterNotice {
            file: self.kind,
            number: reg.number,
            name: reg.name,
            value,
            access: AccessType::Write
        });
    }

    /// Writes back the old value of the register at an index while undoing an instruction.
    ///
    /// This is not recorded.
    pub fn restore(&mut self, index: usize, value: u64) {
        if let Some(reg) = self.regs.get_mut(index) {
            reg.value = value;
            self.publish(index);
        }
    }

    /// Sets every register back to its reset value.
    pub fn reset(&mut self) {
        for i in 0..self.regs.len() {
            let reg = &mut self.regs[i];
            if matches!(reg.kind, RegisterKind::Linked { .. }) || reg.value == reg.reset_value {
                continue;
            }
            reg.value = reg.reset_value;
            self.publish(i);
        }
    }

    /// Takes the reset values of `sp` and `gp` from a memory configuration.
    ///
    /// This only affects the general-purpose file, and does not change current values.
    pub fn set_layout(&mut self, config: &MemoryConfig) {
        if self.kind != FileKind::Integer {
            return;
        }
        for (number, value) in [(SP_NUMBER, config.stack_pointer), (GP_NUMBER, config.global_pointer)] {
            if let Some(reg) = self.regs.iter_mut().find(|r| r.number == number) {
                reg.reset_value = u64::from(value);
            }
        }
    }

    /// Changes the value a register takes on reset.
    ///
    /// This does not change the register's current value.
    pub fn set_reset_value<'a>(&mut self, r: impl Into<RegRef<'a>>, value: u64) -> Result<(), RegisterError> {
        let i = self.index_of(r)?;
        self.regs[i].reset_value = value;
        Ok(())
    }

    /// Iterates over every register and its current value.
    pub fn iter(&self) -> impl Iterator<Item=(&Register, u64)> + '_ {
        self.regs.iter()
            .enumerate()
            .map(|(i, reg)| (reg, self.value_at(i)))
    }

    /// The number of registers in the file.
    pub fn len(&self) -> usize {
        self.regs.len()
    }
    /// Whether the file has no registers.
    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Subscribes to register write notices.
    pub fn subscribe(&mut self) -> Subscription<RegisterNotice> {
        self.notices.subscribe()
    }
    /// The notifier for register write notices.
    pub fn notifier_mut(&mut self) -> &mut Notifier<RegisterNotice> {
        &mut self.notices
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::ast::reg_consts::{A0, S0};
    use crate::sim::backstep::{BackStep, BackStepper};

    use super::*;

    fn sample() -> RegisterFile {
        RegisterFile::new(FileKind::Csr, vec![
            Register::plain("p", 0, 0),
            Register::read_only("ro", 1, 7),
            Register::masked("m", 2, 0, 0x11),
            Register::linked("lo", 3, 0, 0x1F),
            Register::linked("hi", 4, 0, 0xE0),
            Register::linked("ro_hi", 5, 1, 0xFFFF_FFFF_0000_0000),
        ])
    }

    #[test]
    fn test_set_layout() {
        let mut regs = RegisterFile::integer(&MemoryConfig::DEFAULT);
        regs.set_layout(&MemoryConfig::COMPACT_TEXT_AT_ZERO);
        // current values are kept until reset
        assert_eq!(regs.get("sp"), Ok(0x7fff_effc));
        regs.reset();
        assert_eq!(regs.get("sp"), Ok(0x3ffc));
        assert_eq!(regs.get("gp"), Ok(0x1800));

        // other files are unaffected
        let mut fregs = RegisterFile::float();
        fregs.set_layout(&MemoryConfig::DEFAULT);
        fregs.reset();
        assert_eq!(fregs.get(RegRef::Number(2)), Ok(0));
    }

    #[test]
    fn test_lookup() {
        let regs = RegisterFile::integer(&MemoryConfig::DEFAULT);
        assert_eq!(regs.index_of("fp"), Ok(8));
        assert_eq!(regs.index_of(S0), Ok(8));
        assert_eq!(regs.index_of(RegRef::Index(31)), Ok(31));
        assert!(regs.index_of(RegRef::Index(32)).is_err());
        assert!(matches!(regs.get("x99"), Err(RegisterError::NotFound(_))));
        assert_eq!(regs.get("gp"), Ok(0x1000_8000));

        let fregs = RegisterFile::float();
        assert_eq!(fregs.index_of("fa0"), Ok(10));
    }

    #[test]
    fn test_read_only() {
        let mut regs = sample();
        let sub = regs.subscribe();
        assert_eq!(regs.set("ro", 100, None), Ok(7));
        assert_eq!(regs.get("ro"), Ok(7));
        assert!(sub.try_recv().is_err());

        assert_eq!(regs.set_backdoor("ro", 100, None), Ok(7));
        assert_eq!(regs.get("ro"), Ok(100));
        assert_eq!(sub.try_recv().map(|n| n.value), Ok(100));
    }

    #[test]
    fn test_linked() {
        let mut regs = sample();
        regs.set("p", 0xAB, None).unwrap();
        assert_eq!(regs.get("lo"), Ok(0x0B));
        assert_eq!(regs.get("hi"), Ok(0x05));

        regs.set("hi", 0b010, None).unwrap();
        assert_eq!(regs.get("p"), Ok(0x4B));
        regs.set("lo", 0xFF, None).unwrap();
        assert_eq!(regs.get("p"), Ok(0x5F));

        // the target is read-only
        regs.set_backdoor("ro", 0x1_0000_0002, None).unwrap();
        assert_eq!(regs.get("ro_hi"), Ok(1));
        assert_eq!(regs.set("ro_hi", 9, None), Ok(1));
        assert_eq!(regs.get("ro"), Ok(0x1_0000_0002));

        regs.reset();
        assert_eq!(regs.get("lo"), Ok(0));
        assert_eq!(regs.get("ro_hi"), Ok(0));
    }

    #[test]
    fn test_recording() {
        let mut regs = sample();
        let mut bs = BackStepper::new();
        bs.set_enabled(true);
        bs.begin(0);
        regs.set("p", 3, bs.recorder()).unwrap();
        regs.set("hi", 1, bs.recorder()).unwrap();
        regs.set_backdoor("ro", 1, bs.recorder()).unwrap();
        regs.set("ro", 1, bs.recorder()).unwrap();
        bs.commit();

        let group = bs.pop().unwrap();
        assert_eq!(group.actions, [
            BackStep::Register { file: FileKind::Csr, index: 0, value: 0 },
            BackStep::Register { file: FileKind::Csr, index: 0, value: 3 },
            BackStep::CsrBackdoor { index: 1, value: 7 },
        ]);
    }

    #[test]
    fn test_notices() {
        let mut regs = RegisterFile::integer(&MemoryConfig::DEFAULT);
        let sub = regs.subscribe();
        regs.set(A0, 42, None).unwrap();
        let notice = sub.try_recv().unwrap();
        assert_eq!((notice.file, notice.number, notice.name, notice.value), (FileKind::Integer, 10, "a0", 42));

        regs.reset();
        assert_eq!(sub.try_recv().map(|n| n.value), Ok(0));
        assert!(sub.try_recv().is_err());
    }

    proptest! {
        #[test]
        fn test_masked_law(old in any::<u64>(), value in any::<u64>(), mask in any::<u64>()) {
            let mut regs = RegisterFile::new(FileKind::Csr, vec![Register::masked("m", 0, old, mask)]);
            regs.set("m", value, None).unwrap();
            prop_assert_eq!(regs.get("m"), Ok((old & mask) | (value & !mask)));
        }

        #[test]
        fn test_linked_law(target in any::<u64>(), value in any::<u64>()) {
            let mask = 0xE0;
            let mut regs = RegisterFile::new(FileKind::Csr, vec![
                Register::plain("t", 0, target),
                Register::linked("l", 1, 0, mask),
            ]);
            regs.set("l", value, None).unwrap();
            prop_assert_eq!(regs.get("t"), Ok(target & !mask | (value << 5) & mask));
            prop_assert_eq!(regs.get("l"), Ok(value & 0b111));
        }
    }
}
