//! Publish/subscribe notices of simulator activity.
//!
//! Every observable component (the [`Memory`], each [`RegisterFile`], and the
//! [`Simulator`] itself) owns a [`Notifier`]. Front ends attach to it with
//! [`Notifier::subscribe`] and receive notices on a [`Subscription`] channel:
//! - [`MemoryNotice`]: a memory location was read or written,
//! - [`RegisterNotice`]: a register was written,
//! - [`RunNotice`]: a run started or stopped.
//!
//! Notices are delivered in the order they were published and sending never blocks the
//! execution thread. A subscriber detaches with [`Notifier::unsubscribe`] (or by dropping its
//! [`Subscription`], after which it is pruned on the next publish).
//!
//! During unlimited-speed runs, notifiers are put on hold ([`Notifier::hold`]).
//! While held, only the latest notice for each location is kept, and the held notices
//! are delivered when the notifier is released ([`Notifier::release`]).
//!
//! ```
//! use riscv_ensemble::sim::observer::{AccessType, MemoryNotice, Notifier};
//! use riscv_ensemble::sim::mem::Width;
//!
//! let mut notifier = Notifier::new();
//! let sub = notifier.subscribe();
//!
//! notifier.publish(MemoryNotice { address: 0x1001_0000, width: Width::Word, value: 7, access: AccessType::Write });
//! assert_eq!(sub.try_recv().map(|n| n.value), Ok(7));
//!
//! notifier.unsubscribe(sub);
//! assert!(!notifier.has_subscribers());
//! ```
//!
//! [`Memory`]: super::mem::Memory
//! [`RegisterFile`]: super::regs::RegisterFile
//! [`Simulator`]: super::Simulator

use std::collections::BTreeMap;

use crossbeam_channel::{Receiver, Sender};

use super::mem::Width;
use super::regs::FileKind;
use super::{RunSpeed, StopReason, Trap};

/// A notice which can be published through a [`Notifier`].
pub trait Notice: Clone + Send + std::fmt::Debug + 'static {
    /// The location this notice is about.
    ///
    /// While a notifier is held, a later notice replaces an earlier one with the same key.
    type Key: Ord + std::fmt::Debug;

    /// Computes the key of this notice.
    fn key(&self) -> Self::Key;
}

/// The kind of access which caused a notice.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum AccessType {
    /// The location was read.
    Read,
    /// The location was written.
    Write,
}

/// A memory location was accessed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MemoryNotice {
    /// The address of the access.
    pub address: u32,
    /// The width of the access.
    pub width: Width,
    /// The value read or written.
    pub value: u64,
    /// Whether this was a read or a write.
    pub access: AccessType,
}
impl Notice for MemoryNotice {
    type Key = (u32, Width, AccessType);

    fn key(&self) -> Self::Key {
        (self.address, self.width, self.access)
    }
}

/// A register was accessed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RegisterNotice {
    /// Which register file the register is in.
    pub file: FileKind,
    /// The register's architectural number.
    pub number: u32,
    /// The register's name.
    pub name: &'static str,
    /// The register's value after the access.
    pub value: u64,
    /// Whether this was a read or a write.
    pub access: AccessType,
}
impl Notice for RegisterNotice {
    type Key = (FileKind, u32, AccessType);

    fn key(&self) -> Self::Key {
        (self.file, self.number, self.access)
    }
}

/// Whether a run started or stopped.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RunAction {
    /// Execution began.
    Start,
    /// Execution ended or paused.
    Stop,
}

/// A run started or stopped.
///
/// This is the only way the [`Simulator`] reports the outcome of a run.
///
/// [`Simulator`]: super::Simulator
#[derive(Debug, PartialEq, Clone)]
pub struct RunNotice {
    /// Whether the run started or stopped.
    pub action: RunAction,
    /// Why the run stopped (`None` for [`RunAction::Start`]).
    pub reason: Option<StopReason>,
    /// The unhandled trap, if the run stopped with [`StopReason::Exception`].
    pub trap: Option<Trap>,
    /// The run speed of the run.
    pub run_speed: RunSpeed,
    /// The step budget of the run (`None` is unlimited).
    pub max_steps: Option<u64>,
    /// The program counter at the time of the notice.
    pub pc: u32,
    /// The exit code, if the program exited.
    pub exit_code: Option<i32>,
}
impl Notice for RunNotice {
    // the run notifier is never held
    type Key = ();

    fn key(&self) -> Self::Key {}
}

/// The receiving end of a subscription to a [`Notifier`].
///
/// This dereferences to a [`crossbeam_channel::Receiver`], so notices can be received
/// with any of the usual receiving methods (`recv`, `try_recv`, `recv_timeout`, `try_iter`, ...).
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    receiver: Receiver<T>,
}
impl<T> Subscription<T> {
    /// The ID of this subscription in its notifier.
    pub fn id(&self) -> u64 {
        self.id
    }
}
impl<T> std::ops::Deref for Subscription<T> {
    type Target = Receiver<T>;

    fn deref(&self) -> &Self::Target {
        &self.receiver
    }
}

/// A registry of subscribers which receive notices of type `T`.
#[derive(Debug)]
pub struct Notifier<T: Notice> {
    subscribers: Vec<(u64, Sender<T>)>,
    next_id: u64,
    // (sequence number, notice), keyed by location
    held: Option<BTreeMap<T::Key, (u64, T)>>,
    next_seq: u64,
}
impl<T: Notice> Notifier<T> {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        Self { subscribers: vec![], next_id: 0, held: None, next_seq: 0 }
    }

    /// Attaches a new subscriber.
    pub fn subscribe(&mut self) -> Subscription<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, tx));

        Subscription { id, receiver: rx }
    }

    /// Detaches a subscriber.
    ///
    /// No notices are sent to the subscription after this call.
    pub fn unsubscribe(&mut self, sub: Subscription<T>) {
        self.subscribers.retain(|(id, _)| *id != sub.id);
    }

    /// Whether any subscriber is attached.
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Publishes a notice to all subscribers (or holds it, if this notifier is held).
    pub fn publish(&mut self, notice: T) {
        if self.subscribers.is_empty() { return };

        match &mut self.held {
            Some(held) => {
                held.insert(notice.key(), (self.next_seq, notice));
                self.next_seq += 1;
            },
            None => self.send(notice),
        }
    }

    fn send(&mut self, notice: T) {
        // Subscribers whose receivers have been dropped are pruned here.
        self.subscribers.retain(|(_, tx)| tx.send(notice.clone()).is_ok());
    }

    /// Starts holding notices instead of delivering them.
    pub fn hold(&mut self) {
        self.held.get_or_insert_with(BTreeMap::new);
    }

    /// Whether notices are currently being held.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Stops holding notices, delivering the held notices in the order they were last published.
    pub fn release(&mut self) {
        let Some(held) = self.held.take() else { return };

        let mut notices: Vec<_> = held.into_values().collect();
        notices.sort_by_key(|&(seq, _)| seq);
        for (_, notice) in notices {
            self.send(notice);
        }
    }
}
impl<T: Notice> Default for Notifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(address: u32, value: u64) -> MemoryNotice {
        MemoryNotice { address, width: Width::Word, value, access: AccessType::Write }
    }

    #[test]
    fn test_publish_order() {
        let mut notifier = Notifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();

        notifier.publish(write(0, 1));
        notifier.publish(write(4, 2));

        let av: Vec<_> = a.try_iter().map(|n| n.value).collect();
        let bv: Vec<_> = b.try_iter().map(|n| n.value).collect();
        assert_eq!(av, [1, 2]);
        assert_eq!(bv, [1, 2]);
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let mut notifier = Notifier::new();
        let a = notifier.subscribe();
        let b = notifier.subscribe();
        drop(b);

        notifier.publish(write(0, 1));
        assert_eq!(notifier.subscribers.len(), 1);
        assert_eq!(a.try_recv().map(|n| n.value), Ok(1));
    }

    #[test]
    fn test_unsubscribe() {
        let mut notifier = Notifier::new();
        let a = notifier.subscribe();
        let rx = a.receiver.clone();
        notifier.unsubscribe(a);

        notifier.publish(write(0, 1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_hold_coalesces() {
        let mut notifier = Notifier::new();
        let sub = notifier.subscribe();

        notifier.hold();
        notifier.publish(write(0, 1));
        notifier.publish(write(4, 2));
        notifier.publish(write(0, 3));
        assert!(sub.try_recv().is_err());

        notifier.release();
        let got: Vec<_> = sub.try_iter().map(|n| (n.address, n.value)).collect();
        assert_eq!(got, [(4, 2), (0, 3)]);
        assert!(!notifier.is_held());
    }
}
