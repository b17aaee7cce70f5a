//! Memory handling for the simulator.
//!
//! This module consists of:
//! - [`Memory`]: The simulated 32-bit address space.
//! - [`MemoryConfig`]: The addresses which define the segments of the address space.
//! - [`MemoryConfigId`]: The identifier of one of the layout presets.
//! - [`Width`]: The width of an access.
//!
//! The address space is divided into segments (see [`Segment`]).
//! Every access must resolve to exactly one segment, must not run past the end of it,
//! and must be naturally aligned. Otherwise, the access fails with a [`MemError`].
//!
//! Storage is allocated lazily in 4 KiB pages, so untouched memory reads as zero
//! and costs nothing.
//!
//! ```
//! use riscv_ensemble::sim::mem::{Memory, MemoryConfig, Width};
//!
//! let mut mem = Memory::new(MemoryConfig::DEFAULT);
//!
//! mem.write(0x1001_0000, Width::Word, 0xDEAD_BEEF, None).unwrap();
//! assert_eq!(mem.read(0x1001_0000, Width::Word), Ok(0xDEAD_BEEF));
//! assert_eq!(mem.read(0x1001_0000, Width::Byte), Ok(0xEF));
//!
//! // Below the text segment, nothing is mapped:
//! assert!(mem.read(0x0000_0000, Width::Word).is_err());
//! // Accesses must be aligned:
//! assert!(mem.read(0x1001_0002, Width::Word).is_err());
//! ```

use std::collections::BTreeMap;

use crate::ast::encoding::decode;
use crate::ast::{Instr, Program, ProgramStatement};

use super::backstep::{BackStep, BackStepper};
use super::device::DeviceHandler;
use super::observer::{AccessType, MemoryNotice, Notifier, Subscription};

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: usize = 1 << PAGE_BITS;
const PAGE_MASK: u32 = (1 << PAGE_BITS) - 1;

/// The width of a memory access.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum Width {
    /// 1 byte.
    Byte,
    /// 2 bytes.
    Half,
    /// 4 bytes.
    Word,
    /// 8 bytes.
    Double,
}
impl Width {
    /// The number of bytes accessed.
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte   => 1,
            Width::Half   => 2,
            Width::Word   => 4,
            Width::Double => 8,
        }
    }

    /// A mask over the bits of a value of this width.
    pub fn mask(self) -> u64 {
        match self {
            Width::Double => u64::MAX,
            w => (1 << (8 * w.bytes())) - 1,
        }
    }
}
impl std::fmt::Display for Width {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Width::Byte   => f.write_str("byte"),
            Width::Half   => f.write_str("half"),
            Width::Word   => f.write_str("word"),
            Width::Double => f.write_str("double"),
        }
    }
}

/// A region of the address space.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Segment {
    /// Program code, `[text_base, text_limit + 4)`.
    Text,
    /// Static data, `[data_segment_base, heap_base)`.
    Data,
    /// Allocated heap, `[heap_base, heap pointer)`.
    Heap,
    /// The stack, `[max(heap pointer, stack_limit), stack_base + 4)`.
    Stack,
    /// Kernel code and data, `[kernel_base, mmio_base)`.
    Kernel,
    /// Memory-mapped IO, `[mmio_base, mmio_limit]`.
    Mmio,
}
impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Text   => f.write_str("text"),
            Segment::Data   => f.write_str("data"),
            Segment::Heap   => f.write_str("heap"),
            Segment::Stack  => f.write_str("stack"),
            Segment::Kernel => f.write_str("kernel"),
            Segment::Mmio   => f.write_str("mmio"),
        }
    }
}

/// Classification of memory errors.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum FaultKind {
    /// The access was outside every segment, crossed a segment, or was misaligned.
    Addressing,
    /// The access was a write to write-protected memory.
    Protection,
    /// The heap could not grow.
    Allocation,
}

/// Errors which can occur when accessing [`Memory`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, thiserror::Error)]
pub enum MemError {
    /// The address is not in any segment.
    #[error("address {0:#010x} is not mapped")]
    Unmapped(u32),
    /// The address is not aligned to the width of the access.
    #[error("address {address:#010x} is not aligned to a {width} boundary")]
    Misaligned {
        /// The address accessed.
        address: u32,
        /// The width of the access.
        width: Width
    },
    /// The access starts in one segment and ends in another.
    #[error("access at {0:#010x} crosses a segment boundary")]
    CrossesSegment(u32),
    /// The address is mapped, but cannot hold instructions.
    #[error("address {0:#010x} is not in a text segment")]
    NotExecutable(u32),
    /// A write was made to the text segment while self-modifying code is disabled.
    #[error("cannot write to text segment at {0:#010x}")]
    TextWriteProtected(u32),
    /// Growing the heap would overrun the stack or the end of the data segment.
    #[error("cannot allocate {requested} bytes: heap would overrun the stack")]
    HeapExhausted {
        /// The number of bytes requested.
        requested: u32
    },
}
impl MemError {
    /// Gets the kind of fault this is.
    pub fn kind(&self) -> FaultKind {
        match self {
            MemError::Unmapped(_)
            | MemError::Misaligned { .. }
            | MemError::CrossesSegment(_)
            | MemError::NotExecutable(_) => FaultKind::Addressing,
            MemError::TextWriteProtected(_) => FaultKind::Protection,
            MemError::HeapExhausted { .. }  => FaultKind::Allocation,
        }
    }

    /// Gets the address which caused this fault (if there is one).
    pub fn address(&self) -> Option<u32> {
        match *self {
            MemError::Unmapped(a)
            | MemError::Misaligned { address: a, .. }
            | MemError::CrossesSegment(a)
            | MemError::NotExecutable(a)
            | MemError::TextWriteProtected(a) => Some(a),
            MemError::HeapExhausted { .. } => None,
        }
    }
}

/// The addresses which define the layout of the address space.
///
/// The available layouts are given by [`MemoryConfigId`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct MemoryConfig {
    /// The first address of the text segment.
    pub text_base: u32,
    /// The address of the last word of the text segment.
    pub text_limit: u32,
    /// The first address of the data segment.
    pub data_segment_base: u32,
    /// The last address the data segment (including the heap) can extend to.
    pub data_segment_limit: u32,
    /// The start of the `.extern` area (within the data segment).
    pub extern_base: u32,
    /// The initial value of the global pointer (`gp`).
    pub global_pointer: u32,
    /// The start of the `.data` area (within the data segment).
    pub data_base: u32,
    /// The start of the heap.
    pub heap_base: u32,
    /// The initial value of the stack pointer (`sp`).
    pub stack_pointer: u32,
    /// The address of the highest word of the stack.
    pub stack_base: u32,
    /// The lowest address the stack can extend to.
    pub stack_limit: u32,
    /// The highest user-space address.
    pub user_high: u32,
    /// The first address of the kernel segment.
    pub kernel_base: u32,
    /// The highest kernel address.
    pub kernel_high: u32,
    /// The first address of memory-mapped IO.
    pub mmio_base: u32,
    /// The last address of memory-mapped IO.
    pub mmio_limit: u32,
}
impl MemoryConfig {
    /// The default layout, with text at `0x00400000` and data at `0x10010000`.
    pub const DEFAULT: Self = Self {
        text_base: 0x0040_0000,
        text_limit: 0x0fff_fffc,
        data_segment_base: 0x1000_0000,
        data_segment_limit: 0x7fff_ffff,
        extern_base: 0x1000_0000,
        global_pointer: 0x1000_8000,
        data_base: 0x1001_0000,
        heap_base: 0x1004_0000,
        stack_pointer: 0x7fff_effc,
        stack_base: 0x7fff_fffc,
        stack_limit: 0x1004_0000,
        user_high: 0x7fff_ffff,
        kernel_base: 0x8000_0000,
        kernel_high: 0xffff_ffff,
        mmio_base: 0xffff_0000,
        mmio_limit: 0xffff_ffff,
    };

    /// A compact 32 KiB layout with data at address 0 and text at `0x3000`.
    pub const COMPACT_DATA_AT_ZERO: Self = Self {
        text_base: 0x3000,
        text_limit: 0x3ffc,
        data_segment_base: 0x0000,
        data_segment_limit: 0x2fff,
        extern_base: 0x1000,
        global_pointer: 0x1800,
        data_base: 0x0000,
        heap_base: 0x2000,
        stack_pointer: 0x2ffc,
        stack_base: 0x2ffc,
        stack_limit: 0x2000,
        user_high: 0x3fff,
        kernel_base: 0x4000,
        kernel_high: 0x7fff,
        mmio_base: 0x7f00,
        mmio_limit: 0x7fff,
    };

    /// A compact 32 KiB layout with text at address 0 and data at `0x1000`.
    pub const COMPACT_TEXT_AT_ZERO: Self = Self {
        text_base: 0x0000,
        text_limit: 0x0ffc,
        data_segment_base: 0x1000,
        data_segment_limit: 0x3fff,
        extern_base: 0x1000,
        global_pointer: 0x1800,
        data_base: 0x2000,
        heap_base: 0x3000,
        stack_pointer: 0x3ffc,
        stack_base: 0x3ffc,
        stack_limit: 0x3000,
        user_high: 0x3fff,
        kernel_base: 0x4000,
        kernel_high: 0x7fff,
        mmio_base: 0x7f00,
        mmio_limit: 0x7fff,
    };
}
impl Default for MemoryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The identifier of a memory layout preset.
///
/// This is what a settings store persists. It converts to and from a string:
///
/// ```
/// use riscv_ensemble::sim::mem::{MemoryConfig, MemoryConfigId};
///
/// let id: MemoryConfigId = "compact-text-at-zero".parse().unwrap();
/// assert_eq!(id, MemoryConfigId::CompactTextAtZero);
/// assert_eq!(id.to_string(), "compact-text-at-zero");
/// assert_eq!(id.config(), MemoryConfig::COMPACT_TEXT_AT_ZERO);
/// ```
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum MemoryConfigId {
    /// [`MemoryConfig::DEFAULT`]
    #[default]
    Default,
    /// [`MemoryConfig::COMPACT_DATA_AT_ZERO`]
    CompactDataAtZero,
    /// [`MemoryConfig::COMPACT_TEXT_AT_ZERO`]
    CompactTextAtZero,
}
impl MemoryConfigId {
    /// All of the presets.
    pub const ALL: [Self; 3] = [Self::Default, Self::CompactDataAtZero, Self::CompactTextAtZero];

    /// Gets the layout of this preset.
    pub fn config(self) -> MemoryConfig {
        match self {
            MemoryConfigId::Default => MemoryConfig::DEFAULT,
            MemoryConfigId::CompactDataAtZero => MemoryConfig::COMPACT_DATA_AT_ZERO,
            MemoryConfigId::CompactTextAtZero => MemoryConfig::COMPACT_TEXT_AT_ZERO,
        }
    }

    fn ident(self) -> &'static str {
        match self {
            MemoryConfigId::Default => "default",
            MemoryConfigId::CompactDataAtZero => "compact-data-at-zero",
            MemoryConfigId::CompactTextAtZero => "compact-text-at-zero",
        }
    }
}
impl std::fmt::Display for MemoryConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ident())
    }
}

/// Error from parsing a [`MemoryConfigId`].
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
#[error("unknown memory configuration {0:?}")]
pub struct ParseConfigIdError(String);

impl std::str::FromStr for MemoryConfigId {
    type Err = ParseConfigIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter()
            .find(|id| id.ident().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseConfigIdError(s.to_string()))
    }
}

/// The result of fetching an instruction from memory.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Fetched {
    /// A valid instruction.
    Instr(Instr),
    /// An all-zero word which was never loaded as a statement.
    ///
    /// Executing this means the program ran off the end of its code.
    Null,
    /// A word which is not an instruction.
    Illegal(u32),
}

/// The simulated address space.
///
/// Besides raw storage, this keeps track of:
/// - the statements loaded into the text segment,
/// - the heap pointer (which only grows during execution),
/// - the live stack pointer, as last reported by the simulator,
/// - the lowest stack address written at or above the stack pointer
///   (which, with the stack pointer, the heap cannot grow past),
/// - the external devices mapped into MMIO.
#[derive(Debug)]
pub struct Memory {
    config: MemoryConfig,
    pages: BTreeMap<u32, Box<[u8; PAGE_SIZE]>>,
    statements: BTreeMap<u32, ProgramStatement>,
    heap_ptr: u32,
    stack_pointer: u32,
    stack_low: u32,

    /// Whether the text segment can be written to.
    ///
    /// By default, this is `false`.
    pub self_modifying_code: bool,

    devices: DeviceHandler,
    notices: Notifier<MemoryNotice>,
}
impl Memory {
    /// Creates a new, empty memory with the given layout.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            pages: BTreeMap::new(),
            statements: BTreeMap::new(),
            heap_ptr: config.heap_base,
            stack_pointer: config.stack_pointer,
            stack_low: config.stack_pointer,
            self_modifying_code: false,
            devices: DeviceHandler::new(config.mmio_base),
            notices: Notifier::new(),
        }
    }

    /// The current layout.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Switches to a new layout. This clears memory.
    pub fn set_config(&mut self, config: MemoryConfig) {
        self.config = config;
        self.devices.set_base(config.mmio_base);
        self.clear();
    }

    /// Drops all stored data and loaded statements,
    /// and rewinds the heap pointer, stack pointer, and stack extent.
    ///
    /// This also resets all connected devices.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.statements.clear();
        self.heap_ptr = self.config.heap_base;
        self.stack_pointer = self.config.stack_pointer;
        self.stack_low = self.config.stack_pointer;
        self.devices.io_reset();
    }

    /// Reports the current value of `sp`.
    ///
    /// Only stack writes at or above it extend the stack, and the heap cannot grow past it.
    /// Words between the heap pointer and the stack pointer are free space.
    pub fn track_stack_pointer(&mut self, sp: u32) {
        self.stack_pointer = sp;
    }

    /// The lowest address the stack has used.
    pub fn stack_extent(&self) -> u32 {
        self.stack_low
    }

    /// Sets the stack extent back while undoing a write.
    pub fn restore_stack_extent(&mut self, extent: u32) {
        self.stack_low = extent;
    }

    /// The current heap pointer (the address the next allocation starts at).
    pub fn heap_pointer(&self) -> u32 {
        self.heap_ptr
    }

    /// Gets the segment the address is in.
    pub fn segment_of(&self, addr: u32) -> Option<Segment> {
        let c = &self.config;
        let a = u64::from(addr);
        let within = |lo: u32, hi: u64| u64::from(lo) <= a && a < hi;

        if within(c.text_base, u64::from(c.text_limit) + 4) {
            Some(Segment::Text)
        } else if within(c.data_segment_base, u64::from(c.heap_base)) {
            Some(Segment::Data)
        } else if within(c.heap_base, u64::from(self.heap_ptr)) {
            Some(Segment::Heap)
        } else if within(self.heap_ptr.max(c.stack_limit), u64::from(c.stack_base) + 4) {
            Some(Segment::Stack)
        } else if within(c.kernel_base, u64::from(c.mmio_base)) {
            Some(Segment::Kernel)
        } else if within(c.mmio_base, u64::from(c.mmio_limit) + 1) {
            Some(Segment::Mmio)
        } else {
            None
        }
    }

    /// Checks an access, returning the segment it is in.
    fn resolve(&self, addr: u32, width: Width) -> Result<Segment, MemError> {
        if addr % width.bytes() != 0 {
            return Err(MemError::Misaligned { address: addr, width });
        }

        let segment = self.segment_of(addr).ok_or(MemError::Unmapped(addr))?;
        let last = addr.checked_add(width.bytes() - 1).ok_or(MemError::Unmapped(addr))?;
        match self.segment_of(last) == Some(segment) {
            true  => Ok(segment),
            false => Err(MemError::CrossesSegment(addr)),
        }
    }

    fn byte(&self, addr: u32) -> u8 {
        self.pages.get(&(addr >> PAGE_BITS))
            .map_or(0, |page| page[(addr & PAGE_MASK) as usize])
    }
    fn load_raw(&self, addr: u32, len: u32) -> u64 {
        (0..len).rev()
            .fold(0, |acc, i| acc << 8 | u64::from(self.byte(addr.wrapping_add(i))))
    }
    fn store_raw(&mut self, addr: u32, len: u32, value: u64) {
        for i in 0..len {
            let a = addr.wrapping_add(i);
            let page = self.pages.entry(a >> PAGE_BITS)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[(a & PAGE_MASK) as usize] = (value >> (8 * i)) as u8;
        }
    }

    /// Ports (word addresses) covered by an access.
    fn ports(addr: u32, width: Width) -> impl Iterator<Item=u32> {
        let first = addr & !3;
        let count = (width.bytes() + (addr & 3) + 3) / 4;
        (0..count).map(move |i| first.wrapping_add(4 * i))
    }

    /// Reads a value from memory.
    ///
    /// Reads from memory-mapped IO are forwarded to the device mapped at that address.
    /// A successful read publishes a [`MemoryNotice`].
    pub fn read(&mut self, addr: u32, width: Width) -> Result<u64, MemError> {
        let segment = self.resolve(addr, width)?;

        if segment == Segment::Mmio {
            for port in Self::ports(addr, width) {
                if let Some(data) = self.devices.io_read(port, true) {
                    self.store_raw(port, 4, u64::from(data));
                }
            }
        }

        let value = self.load_raw(addr, width.bytes());
        self.notices.publish(MemoryNotice { address: addr, width, value, access: AccessType::Read });
        Ok(value)
    }

    /// Reads a value from memory without any side effects.
    ///
    /// Unlike [`Memory::read`], this does not query devices or publish notices.
    /// This is useful for displaying memory.
    pub fn peek(&self, addr: u32, width: Width) -> Result<u64, MemError> {
        self.resolve(addr, width)?;
        Ok(self.load_raw(addr, width.bytes()))
    }

    /// Writes a value to memory, returning the value it replaced.
    ///
    /// The value is truncated to the width of the access.
    ///
    /// If a recorder is provided, the old value is recorded before the write occurs.
    /// A successful write publishes a [`MemoryNotice`] after the write occurs.
    ///
    /// # Errors
    ///
    /// Besides addressing errors, writes to the text segment fail with
    /// [`MemError::TextWriteProtected`] unless [`Memory::self_modifying_code`] is set.
    pub fn write(&mut self, addr: u32, width: Width, value: u64, rec: Option<&mut BackStepper>) -> Result<u64, MemError> {
        let segment = self.resolve(addr, width)?;
        if segment == Segment::Text && !self.self_modifying_code {
            return Err(MemError::TextWriteProtected(addr));
        }

        let value = value & width.mask();
        let old = self.load_raw(addr, width.bytes());
        let extends_stack = segment == Segment::Stack
            && self.stack_pointer <= addr
            && addr < self.stack_low;
        if let Some(rec) = rec {
            rec.record(BackStep::Memory { address: addr, width, value: old });
            if extends_stack {
                rec.record(BackStep::StackExtent(self.stack_low));
            }
        }
        if extends_stack {
            self.stack_low = addr;
        }

        let accepted = match segment {
            Segment::Mmio => self.write_ports(addr, width, value),
            Segment::Text | Segment::Kernel => {
                self.invalidate(addr, width);
                true
            },
            Segment::Data | Segment::Heap | Segment::Stack => true,
        };
        if accepted {
            self.store_raw(addr, width.bytes(), value);
        }

        self.notices.publish(MemoryNotice { address: addr, width, value, access: AccessType::Write });
        Ok(old)
    }

    /// Forwards a write to the devices at every port it covers.
    ///
    /// Returns whether all devices accepted it.
    fn write_ports(&mut self, addr: u32, width: Width, value: u64) -> bool {
        let mut accepted = true;
        for port in Self::ports(addr, width) {
            // merge the written bytes into the current word at this port
            let mut word = self.load_raw(port, 4);
            for i in 0..width.bytes() {
                let a = addr.wrapping_add(i);
                if a & !3 == port {
                    let shift = 8 * (a - port);
                    let byte = (value >> (8 * i)) & 0xFF;
                    word = word & !(0xFF << shift) | byte << shift;
                }
            }
            accepted &= self.devices.io_write(port, word as u32);
        }
        accepted
    }

    /// Forgets loaded statements overlapping this access, so the words are decoded again.
    fn invalidate(&mut self, addr: u32, width: Width) {
        for port in Self::ports(addr, width) {
            self.statements.remove(&port);
        }
    }

    /// Writes back an old value while undoing an instruction.
    ///
    /// This bypasses protection and devices, and is not recorded.
    pub fn restore(&mut self, addr: u32, width: Width, value: u64) {
        self.invalidate(addr, width);
        self.store_raw(addr, width.bytes(), value);
        self.notices.publish(MemoryNotice { address: addr, width, value, access: AccessType::Write });
    }

    /// Grows the heap by `bytes` (rounded up to a word), returning the start of the new block.
    ///
    /// # Errors
    ///
    /// This fails with [`MemError::HeapExhausted`] if the heap would grow past the stack
    /// (its lowest used address, or the stack pointer if that lies in the stack segment)
    /// or past the end of the data segment.
    ///
    /// ```
    /// use riscv_ensemble::sim::mem::{Memory, MemoryConfig};
    ///
    /// let mut mem = Memory::new(MemoryConfig::DEFAULT);
    /// assert_eq!(mem.allocate_heap(5, None), Ok(0x1004_0000));
    /// assert_eq!(mem.allocate_heap(4, None), Ok(0x1004_0008));
    /// assert!(mem.allocate_heap(0x8000_0000, None).is_err());
    /// ```
    pub fn allocate_heap(&mut self, bytes: u32, rec: Option<&mut BackStepper>) -> Result<u32, MemError> {
        let exhausted = MemError::HeapExhausted { requested: bytes };

        let size = (u64::from(bytes) + 3) & !3;
        let old = self.heap_ptr;
        let new = u64::from(old) + size;
        let stack_bottom = match self.segment_of(self.stack_pointer) {
            Some(Segment::Stack) => self.stack_low.min(self.stack_pointer),
            _ => self.stack_low,
        };
        let limit = u64::from(stack_bottom).min(u64::from(self.config.data_segment_limit) + 1);
        if new > limit {
            return Err(exhausted);
        }

        if let Some(rec) = rec {
            rec.record(BackStep::HeapPointer(old));
        }
        self.heap_ptr = u32::try_from(new).map_err(|_| exhausted)?;
        Ok(old)
    }

    /// Sets the heap pointer back while undoing an allocation.
    pub fn restore_heap_pointer(&mut self, ptr: u32) {
        self.heap_ptr = ptr;
    }

    /// Loads a program's statements and data into memory.
    ///
    /// This bypasses write protection. Statements must lie in the text or kernel segments.
    pub fn load_program(&mut self, program: &Program) -> Result<(), MemError> {
        for stmt in &program.statements {
            match self.resolve(stmt.address, Width::Word)? {
                Segment::Text | Segment::Kernel => {},
                _ => return Err(MemError::NotExecutable(stmt.address)),
            }
            self.store_raw(stmt.address, 4, u64::from(stmt.binary));
            self.statements.insert(stmt.address, stmt.clone());
        }

        for (start, bytes) in &program.data {
            for (i, &b) in bytes.iter().enumerate() {
                let addr = start.wrapping_add(i as u32);
                self.segment_of(addr).ok_or(MemError::Unmapped(addr))?;
                self.store_raw(addr, 1, u64::from(b));
            }
        }

        Ok(())
    }

    /// Gets the loaded statement at the given address, if it has not been overwritten.
    pub fn statement(&self, addr: u32) -> Option<&ProgramStatement> {
        self.statements.get(&addr)
    }

    /// Fetches the instruction at the program counter.
    ///
    /// This neither publishes notices nor touches devices.
    pub fn fetch(&self, pc: u32) -> Result<Fetched, MemError> {
        match self.resolve(pc, Width::Word)? {
            Segment::Text | Segment::Kernel => {},
            _ => return Err(MemError::NotExecutable(pc)),
        }

        if let Some(stmt) = self.statements.get(&pc) {
            return Ok(Fetched::Instr(stmt.instr));
        }
        let fetched = match self.load_raw(pc, 4) as u32 {
            0 => Fetched::Null,
            word => match decode(word) {
                Some(instr) => Fetched::Instr(instr),
                None => Fetched::Illegal(word),
            }
        };
        Ok(fetched)
    }

    /// The devices mapped into memory-mapped IO.
    pub fn devices(&self) -> &DeviceHandler {
        &self.devices
    }
    /// The devices mapped into memory-mapped IO (mutably).
    pub fn devices_mut(&mut self) -> &mut DeviceHandler {
        &mut self.devices
    }

    /// Subscribes to memory access notices.
    pub fn subscribe(&mut self) -> Subscription<MemoryNotice> {
        self.notices.subscribe()
    }
    /// The notifier for memory access notices.
    pub fn notifier_mut(&mut self) -> &mut Notifier<MemoryNotice> {
        &mut self.notices
    }
}
impl Default for Memory {
    fn default() -> Self {
        Self::new(MemoryConfig::DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::ast::{Instr, Program};
    use crate::sim::backstep::{BackStep, BackStepper};

    use super::*;

    #[test]
    fn test_segments() {
        let mem = Memory::new(MemoryConfig::DEFAULT);
        assert_eq!(mem.segment_of(0x0000_0000), None);
        assert_eq!(mem.segment_of(0x0040_0000), Some(Segment::Text));
        assert_eq!(mem.segment_of(0x0fff_ffff), Some(Segment::Text));
        assert_eq!(mem.segment_of(0x1001_0000), Some(Segment::Data));
        // the heap is empty, so this is the bottom of the stack
        assert_eq!(mem.segment_of(0x1004_0000), Some(Segment::Stack));
        assert_eq!(mem.segment_of(0x7fff_fffc), Some(Segment::Stack));
        assert_eq!(mem.segment_of(0x8000_0000), Some(Segment::Kernel));
        assert_eq!(mem.segment_of(0xffff_0000), Some(Segment::Mmio));
        assert_eq!(mem.segment_of(0xffff_ffff), Some(Segment::Mmio));

        let mem = Memory::new(MemoryConfig::COMPACT_TEXT_AT_ZERO);
        assert_eq!(mem.segment_of(0x0000), Some(Segment::Text));
        assert_eq!(mem.segment_of(0x2000), Some(Segment::Data));
        assert_eq!(mem.segment_of(0x3ffc), Some(Segment::Stack));
        assert_eq!(mem.segment_of(0x7f00), Some(Segment::Mmio));
        assert_eq!(mem.segment_of(0x8000), None);
    }

    #[test]
    fn test_access_errors() {
        let mut mem = Memory::default();
        assert_eq!(mem.read(0x10, Width::Word), Err(MemError::Unmapped(0x10)));
        assert_eq!(
            mem.write(0x1001_0001, Width::Half, 0, None),
            Err(MemError::Misaligned { address: 0x1001_0001, width: Width::Half })
        );
        // the last word of text followed by the first word of data
        assert_eq!(mem.peek(0x0fff_fff8, Width::Double), Ok(0));
        assert_eq!(mem.peek(0x0fff_fffc, Width::Word), Ok(0));
        assert_eq!(mem.peek(0x1003_fff8, Width::Double), Ok(0));

        let mem = Memory::new(MemoryConfig::COMPACT_DATA_AT_ZERO);
        assert_eq!(mem.peek(0x2ff8, Width::Double), Ok(0));
        assert_eq!(mem.peek(0x3000, Width::Word), Ok(0));
        assert_eq!(MemError::Unmapped(0).kind(), FaultKind::Addressing);
    }

    #[test]
    fn test_crosses_segment() {
        let mut config = MemoryConfig::DEFAULT;
        // misalign the end of the text segment, so an aligned double crosses it
        config.text_limit = 0x0fff_fff8;
        config.data_segment_base = 0x0fff_fffc;
        let mem = Memory::new(config);
        assert_eq!(mem.peek(0x0fff_fff8, Width::Double), Err(MemError::CrossesSegment(0x0fff_fff8)));
    }

    #[test]
    fn test_text_protection() {
        let mut mem = Memory::default();
        let program = Program::from_instrs(0x0040_0000, [Instr::Ecall]);
        mem.load_program(&program).unwrap();

        let err = mem.write(0x0040_0000, Width::Word, 0x0010_0073, None).unwrap_err();
        assert_eq!(err, MemError::TextWriteProtected(0x0040_0000));
        assert_eq!(err.kind(), FaultKind::Protection);
        assert_eq!(mem.fetch(0x0040_0000), Ok(Fetched::Instr(Instr::Ecall)));

        // self-modifying code rewrites the instruction
        mem.self_modifying_code = true;
        mem.write(0x0040_0000, Width::Word, 0x0010_0073, None).unwrap();
        assert_eq!(mem.fetch(0x0040_0000), Ok(Fetched::Instr(Instr::Ebreak)));
        assert!(mem.statement(0x0040_0000).is_none());
    }

    #[test]
    fn test_fetch() {
        let mut mem = Memory::default();
        let program = Program::from_instrs(0x0040_0000, [Instr::Fence]);
        mem.load_program(&program).unwrap();

        assert_eq!(mem.fetch(0x0040_0000), Ok(Fetched::Instr(Instr::Fence)));
        assert_eq!(mem.fetch(0x0040_0004), Ok(Fetched::Null));
        assert_eq!(mem.fetch(0x1001_0000), Err(MemError::NotExecutable(0x1001_0000)));
        assert_eq!(mem.fetch(0x0040_0002), Err(MemError::Misaligned { address: 0x0040_0002, width: Width::Word }));

        mem.self_modifying_code = true;
        mem.write(0x0040_0004, Width::Word, 0xFFFF_FFFF, None).unwrap();
        assert_eq!(mem.fetch(0x0040_0004), Ok(Fetched::Illegal(0xFFFF_FFFF)));
    }

    #[test]
    fn test_heap() {
        let mut mem = Memory::new(MemoryConfig::COMPACT_DATA_AT_ZERO);
        assert_eq!(mem.allocate_heap(1, None), Ok(0x2000));
        assert_eq!(mem.allocate_heap(8, None), Ok(0x2004));
        assert_eq!(mem.segment_of(0x2008), Some(Segment::Heap));
        assert_eq!(mem.segment_of(0x200C), Some(Segment::Stack));

        // stack writes limit the heap
        mem.track_stack_pointer(0x2800);
        mem.write(0x2800, Width::Word, 1, None).unwrap();
        assert_eq!(mem.stack_extent(), 0x2800);
        assert_eq!(
            mem.allocate_heap(0x800, None).unwrap_err().kind(),
            FaultKind::Allocation
        );
        assert_eq!(mem.allocate_heap(0x7F4, None), Ok(0x200C));
        assert_eq!(mem.heap_pointer(), 0x2800);
    }

    #[test]
    fn test_heap_ignores_free_space() {
        let mut mem = Memory::new(MemoryConfig::DEFAULT);
        // free space between the heap and the stack pointer is not stack
        mem.write(0x1004_0000, Width::Word, 1, None).unwrap();
        mem.write(0x7000_0000, Width::Word, 1, None).unwrap();
        assert_eq!(mem.stack_extent(), 0x7fff_effc);
        assert_eq!(mem.allocate_heap(16, None), Ok(0x1004_0000));

        // the heap still cannot pass the stack pointer
        mem.track_stack_pointer(0x1004_1000);
        assert!(mem.allocate_heap(0x1000, None).is_err());
        assert_eq!(mem.allocate_heap(0xFF0, None), Ok(0x1004_0010));
    }

    #[test]
    fn test_stack_extent_recorded() {
        let mut mem = Memory::new(MemoryConfig::COMPACT_DATA_AT_ZERO);
        let mut bs = BackStepper::new();
        bs.set_enabled(true);
        bs.begin(0x3000);

        mem.track_stack_pointer(0x2800);
        mem.write(0x2800, Width::Word, 7, bs.recorder()).unwrap();
        // writes above the extent leave it alone
        mem.write(0x2900, Width::Word, 7, bs.recorder()).unwrap();
        bs.commit();

        let group = bs.pop().unwrap();
        assert_eq!(group.actions, [
            BackStep::Memory { address: 0x2800, width: Width::Word, value: 0 },
            BackStep::StackExtent(0x2ffc),
            BackStep::Memory { address: 0x2900, width: Width::Word, value: 0 },
        ]);
        assert!(mem.allocate_heap(0x900, None).is_err());

        mem.restore_stack_extent(0x2ffc);
        mem.track_stack_pointer(0x2ffc);
        assert_eq!(mem.allocate_heap(0x900, None), Ok(0x2000));
    }

    #[test]
    fn test_write_records_and_notifies() {
        let mut mem = Memory::default();
        let sub = mem.subscribe();
        let mut bs = BackStepper::new();
        bs.set_enabled(true);
        bs.begin(0x0040_0000);

        mem.write(0x1001_0000, Width::Word, 5, bs.recorder()).unwrap();
        assert_eq!(mem.write(0x1001_0000, Width::Word, 9, bs.recorder()), Ok(5));
        bs.commit();

        let group = bs.pop().unwrap();
        assert_eq!(group.actions, [
            BackStep::Memory { address: 0x1001_0000, width: Width::Word, value: 0 },
            BackStep::Memory { address: 0x1001_0000, width: Width::Word, value: 5 },
        ]);

        let values: Vec<_> = sub.try_iter().map(|n| (n.access, n.value)).collect();
        assert_eq!(values, [(AccessType::Write, 5), (AccessType::Write, 9)]);

        // peeking publishes nothing, reading does
        mem.peek(0x1001_0000, Width::Word).unwrap();
        assert!(sub.try_recv().is_err());
        mem.read(0x1001_0000, Width::Byte).unwrap();
        assert_eq!(sub.try_recv().map(|n| n.access), Ok(AccessType::Read));
    }

    #[test]
    fn test_clear_and_config() {
        let mut mem = Memory::default();
        mem.write(0x1001_0000, Width::Word, 5, None).unwrap();
        mem.allocate_heap(16, None).unwrap();
        mem.clear();
        assert_eq!(mem.peek(0x1001_0000, Width::Word), Ok(0));
        assert_eq!(mem.heap_pointer(), 0x1004_0000);

        mem.set_config(MemoryConfig::COMPACT_TEXT_AT_ZERO);
        assert_eq!(mem.heap_pointer(), 0x3000);
        assert_eq!(mem.segment_of(0x1001_0000), None);
    }

    #[test]
    fn test_config_id_parse() {
        for id in MemoryConfigId::ALL {
            assert_eq!(id.to_string().parse(), Ok(id));
        }
        assert_eq!("Compact-Data-At-Zero".parse(), Ok(MemoryConfigId::CompactDataAtZero));
        assert!("tiny".parse::<MemoryConfigId>().is_err());
    }

    fn width() -> impl Strategy<Value = Width> {
        prop_oneof![Just(Width::Byte), Just(Width::Half), Just(Width::Word), Just(Width::Double)]
    }

    proptest! {
        #[test]
        fn test_write_read(offset in 0u32..0x3_0000, width in width(), value in any::<u64>()) {
            let mut mem = Memory::default();
            let addr = 0x1000_0000 + offset / width.bytes() * width.bytes();
            mem.write(addr, width, value, None).unwrap();
            prop_assert_eq!(mem.read(addr, width), Ok(value & width.mask()));
        }

        #[test]
        fn test_unmapped_fails(addr in 0u32..0x0040_0000, width in width()) {
            let mut mem = Memory::default();
            let addr = addr / width.bytes() * width.bytes();
            prop_assert!(mem.read(addr, width).is_err());
            prop_assert!(mem.write(addr, width, 0, None).is_err());
        }

        #[test]
        fn test_heap_monotonic(sizes in proptest::collection::vec(0u32..0x1000, 1..20)) {
            let mut mem = Memory::default();
            let mut floor = 0;
            for size in sizes {
                let addr = mem.allocate_heap(size, None).unwrap();
                prop_assert!(addr >= floor);
                floor = addr + size;
            }
        }
    }
}
