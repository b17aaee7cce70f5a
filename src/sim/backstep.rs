//! Undo history for stepping backwards through execution.
//!
//! While backstepping is active, every mutation made while executing an instruction
//! records the value it overwrote into the instruction's [`StepGroup`].
//! Undoing an instruction ([`Machine::back_step`]) replays its group in reverse,
//! restoring each value through the components' backdoor paths.
//!
//! Components receive the recorder as an `Option<&mut BackStepper>` argument
//! (see [`BackStepper::recorder`]). When it is `None`, nothing is recorded.
//!
//! [`Machine::back_step`]: super::Machine::back_step

use std::collections::VecDeque;

use super::interrupt::Claim;
use super::mem::Width;
use super::regs::FileKind;

/// The maximum number of instructions which can be undone.
pub const HISTORY_LIMIT: usize = 2000;

/// A single undo record, holding the value a mutation overwrote.
#[derive(Debug, PartialEq, Clone)]
pub enum BackStep {
    /// A register's physical value.
    Register {
        /// The file the register is in.
        file: FileKind,
        /// The index of the register holding the physical value.
        index: usize,
        /// The old value.
        value: u64
    },
    /// A memory location.
    Memory {
        /// The address written to.
        address: u32,
        /// The width of the write.
        width: Width,
        /// The old value.
        value: u64
    },
    /// A CSR written through a backdoor.
    CsrBackdoor {
        /// The index of the CSR holding the physical value.
        index: usize,
        /// The old value.
        value: u64
    },
    /// The heap pointer before an allocation.
    HeapPointer(u32),
    /// The stack extent before a write extended it.
    StackExtent(u32),
    /// The instruction raised a synchronous trap (undone by discarding the pending trap).
    TrapRaised,
    /// A pending interrupt or trap was claimed (undone by putting it back).
    Claimed(Claim),
}

/// The undo records of one executed instruction.
#[derive(Debug, PartialEq, Clone)]
pub struct StepGroup {
    /// The program counter before the instruction executed.
    pub pc: u32,
    /// Records in the order the mutations happened.
    pub actions: Vec<BackStep>,
}

/// The undo history.
#[derive(Debug, Default)]
pub struct BackStepper {
    history: VecDeque<StepGroup>,
    current: Option<StepGroup>,
    enabled: bool,
}
impl BackStepper {
    /// Creates a new, disabled backstepper.
    pub fn new() -> Self {
        Default::default()
    }

    /// Enables or disables recording.
    ///
    /// Disabling does not clear history, so previously recorded instructions can still be undone.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.current = None;
        }
    }
    /// Whether recording is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Gets the recorder to pass to mutating calls.
    ///
    /// This is `None` unless recording is enabled and a group is open.
    pub fn recorder(&mut self) -> Option<&mut BackStepper> {
        match self.enabled && self.current.is_some() {
            true  => Some(self),
            false => None,
        }
    }

    /// Opens a new group for the instruction at `pc`.
    pub fn begin(&mut self, pc: u32) {
        if self.enabled {
            self.current = Some(StepGroup { pc, actions: vec![] });
        }
    }

    /// Reopens the most recent group if it belongs to the instruction at `trap_pc`
    /// which raised a trap that has not been delivered yet.
    /// Otherwise, opens a new group for the instruction at `pc`.
    ///
    /// Delivering a trap is part of the instruction which raised it,
    /// so undoing that instruction also undoes entering the handler.
    pub fn reopen(&mut self, trap_pc: u32, pc: u32) {
        if !self.enabled {
            return;
        }

        let raised_here = self.history.back().map_or(false, |g| {
            g.pc == trap_pc
                && g.actions.contains(&BackStep::TrapRaised)
                && !g.actions.iter().any(|a| matches!(a, BackStep::Claimed(Claim::Trap(_))))
        });
        match raised_here {
            true  => self.current = self.history.pop_back(),
            false => self.begin(pc),
        }
    }

    /// Appends a record to the open group.
    pub fn record(&mut self, action: BackStep) {
        if let Some(group) = &mut self.current {
            group.actions.push(action);
        }
    }

    /// Closes the open group and adds it to the history.
    pub fn commit(&mut self) {
        let Some(group) = self.current.take() else { return };

        self.history.push_back(group);
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
            log::trace!("undo history full, dropped oldest step");
        }
    }

    /// Closes the open group, only keeping it if it recorded anything.
    ///
    /// This is used when an iteration stops before executing an instruction.
    pub fn commit_if_dirty(&mut self) {
        match &self.current {
            Some(g) if !g.actions.is_empty() => self.commit(),
            _ => self.current = None,
        }
    }

    /// Removes the most recent group from the history.
    pub fn pop(&mut self) -> Option<StepGroup> {
        self.history.pop_back()
    }

    /// Discards the entire history.
    pub fn clear(&mut self) {
        self.history.clear();
        self.current = None;
    }

    /// The number of instructions which can be undone.
    pub fn len(&self) -> usize {
        self.history.len()
    }
    /// Whether there is nothing to undo.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::{SimErr, Trap};

    use super::*;

    #[test]
    fn test_disabled_records_nothing() {
        let mut bs = BackStepper::new();
        bs.begin(0x400000);
        assert!(bs.recorder().is_none());
        bs.record(BackStep::HeapPointer(0));
        bs.commit();
        assert!(bs.is_empty());
    }

    #[test]
    fn test_groups() {
        let mut bs = BackStepper::new();
        bs.set_enabled(true);

        bs.begin(0x400000);
        bs.record(BackStep::HeapPointer(0x1004_0000));
        bs.commit();

        bs.begin(0x400004);
        bs.commit();

        // empty iterations are dropped
        bs.begin(0x400008);
        bs.commit_if_dirty();

        assert_eq!(bs.len(), 2);
        assert_eq!(bs.pop().map(|g| (g.pc, g.actions.len())), Some((0x400004, 0)));
        assert_eq!(bs.pop().map(|g| (g.pc, g.actions)), Some((0x400000, vec![BackStep::HeapPointer(0x1004_0000)])));
        assert_eq!(bs.pop(), None);
    }

    #[test]
    fn test_reopen_trapped_group() {
        let mut bs = BackStepper::new();
        bs.set_enabled(true);

        bs.begin(0x400010);
        bs.record(BackStep::TrapRaised);
        bs.commit();

        // delivering the trap joins the faulting instruction's group
        bs.reopen(0x400010, 0x400014);
        bs.record(BackStep::Claimed(Claim::Trap(Trap { error: SimErr::IllegalInstruction(0), pc: 0x400010 })));
        bs.commit();
        assert_eq!(bs.len(), 1);

        // a delivered trap is not reopened again
        bs.reopen(0x400010, 0x400040);
        bs.commit();
        assert_eq!(bs.len(), 2);
        assert_eq!(bs.pop().map(|g| g.pc), Some(0x400040));
        assert_eq!(bs.pop().map(|g| (g.pc, g.actions.len())), Some((0x400010, 2)));

        // unrecorded faulting instructions get a group of their own
        bs.reopen(0x400020, 0x400024);
        bs.commit();
        assert_eq!(bs.pop().map(|g| g.pc), Some(0x400024));
    }

    #[test]
    fn test_history_limit() {
        let mut bs = BackStepper::new();
        bs.set_enabled(true);
        for i in 0..(HISTORY_LIMIT as u32 + 5) {
            bs.begin(4 * i);
            bs.commit();
        }
        assert_eq!(bs.len(), HISTORY_LIMIT);
        // the oldest five were dropped
        assert_eq!(bs.history.front().map(|g| g.pc), Some(20));
    }
}
