//! Utilities to debug simulation.
//!
//! The key type here is [`Breakpoint`], which can be passed to [`Simulator::start`]
//! to cause the run to pause.
//!
//! [`Simulator::start`]: super::Simulator::start
use std::fmt::Write;

use crate::ast::Reg;

use super::mem::Width;
use super::Machine;

/// Common breakpoints.
///
/// Breakpoints are checked after every instruction, against the state the instruction left behind.
#[derive(PartialEq, Eq, Hash, Clone)]
pub enum Breakpoint {
    /// Break when the PC is equal to the given value.
    PC(u32),

    /// Break when the provided register holds a matching value.
    Reg {
        /// Register to check.
        reg: Reg,
        /// Predicate to break against.
        value: Comparator
    },
    /// Break when the provided memory location holds a matching value.
    Mem {
        /// Address to check.
        addr: u32,
        /// Width of the value to check.
        width: Width,
        /// Predicate to break against.
        value: Comparator
    },
}

impl Breakpoint where Breakpoint: Send + Sync { /* assert Breakpoint is send/sync */ }

impl Breakpoint {
    /// Checks if a break should occur.
    pub fn check(&self, machine: &Machine) -> bool {
        match self {
            Breakpoint::PC(expected) => *expected == machine.pc,
            Breakpoint::Reg { reg, value: cmp } => cmp.check(machine.regs.value_at(usize::from(*reg)) as u32),
            // peek, so that IO devices are not triggered
            Breakpoint::Mem { addr, width, value: cmp } => machine.mem.peek(*addr, *width)
                .is_ok_and(|v| cmp.check(v as u32)),
        }
    }

    fn fmt_bp(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::PC(expected) => {
                write!(f, "pc == {expected:#010x}")?;
            },
            Self::Reg { reg, value } => {
                write!(f, "{reg} ")?;
                value.fmt_cmp(f)?;
            },
            Self::Mem { addr, width, value } => {
                write!(f, "{width}[{addr:#010x}] ")?;
                value.fmt_cmp(f)?;
            },
        }
        Ok(())
    }
}
impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Breakpoint(")?;
        self.fmt_bp(f)?;
        f.write_char(')')
    }
}
/// Predicate checking whether the current value matches.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Comparator {
    /// Never breaks.
    Never,
    /// Break if the current value is less than the provided value.
    Lt(u32),
    /// Break if the current value is equal to the provided value.
    Eq(u32),
    /// Break if the current value is less than or equal to the provided value.
    Le(u32),
    /// Break if the current value is greater than the provided value.
    Gt(u32),
    /// Break if the current value is not equal to the provided value.
    Ne(u32),
    /// Break if the current value is greater than or equal to the provided value.
    Ge(u32),
    /// Always breaks.
    Always
}
impl Comparator {
    /// Checks if the operand passes the comparator.
    pub fn check(&self, operand: u32) -> bool {
        match *self {
            Comparator::Never  => false,
            Comparator::Lt(r)  => operand < r,
            Comparator::Eq(r)  => operand == r,
            Comparator::Le(r)  => operand <= r,
            Comparator::Gt(r)  => operand > r,
            Comparator::Ne(r)  => operand != r,
            Comparator::Ge(r)  => operand >= r,
            Comparator::Always => true,
        }
    }

    fn fmt_cmp(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Never  => f.write_str("never"),
            Comparator::Lt(r)  => write!(f, "< {r}"),
            Comparator::Eq(r)  => write!(f, "== {r}"),
            Comparator::Le(r)  => write!(f, "<= {r}"),
            Comparator::Gt(r)  => write!(f, "> {r}"),
            Comparator::Ne(r)  => write!(f, "!= {r}"),
            Comparator::Ge(r)  => write!(f, ">= {r}"),
            Comparator::Always => f.write_str("always"),
        }
    }
}
