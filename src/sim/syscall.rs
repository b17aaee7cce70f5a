//! The environment call (`ecall`) boundary.
//!
//! When the program executes `ecall`, the simulator hands the service number in `a7`
//! to the machine's [`SyscallHandler`], along with a [`SyscallEnv`] which gives it access
//! to the registers and memory.
//!
//! [`BufferedSyscalls`] is a small reference set of services which reads
//! from an input buffer and writes to an output buffer:
//!
//! | number | service      | arguments              | result               |
//! |--------|--------------|------------------------|----------------------|
//! | 1      | print int    | `a0`: integer          |                      |
//! | 4      | print string | `a0`: address          |                      |
//! | 9      | sbrk         | `a0`: number of bytes  | `a0`: address        |
//! | 10     | exit         |                        |                      |
//! | 11     | print char   | `a0`: character        |                      |
//! | 12     | read char    |                        | `a0`: character (-1 if none) |
//! | 34     | print hex    | `a0`: integer          |                      |
//! | 93     | exit         | `a0`: exit code        |                      |

use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::ast::reg_consts::A0;

use super::backstep::BackStepper;
use super::mem::{Memory, Width};
use super::regs::{RegRef, RegisterFile};
use super::SimErr;

/// What the simulator should do after a service completes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SyscallOutcome {
    /// Continue with the next instruction.
    Continue,
    /// Terminate the program with the given exit code.
    Exit(i32),
}

/// A provider of environment call services.
pub trait SyscallHandler: Send {
    /// Handles the service with the given number.
    ///
    /// # Errors
    ///
    /// An error is raised as a trap by the `ecall` instruction.
    /// Unknown services should fail with [`SimErr::UnknownSyscall`].
    fn handle(&mut self, number: u32, env: &mut SyscallEnv<'_>) -> Result<SyscallOutcome, SimErr>;

    /// Resets any state of the handler (called when the simulator is reset).
    fn reset(&mut self) {}
}

/// The machine state available to a [`SyscallHandler`].
///
/// Changes made through this are recorded for stepping backwards like any other instruction's.
pub struct SyscallEnv<'a> {
    pub(super) regs: &'a mut RegisterFile,
    pub(super) fregs: &'a mut RegisterFile,
    pub(super) mem: &'a mut Memory,
    pub(super) rec: Option<&'a mut BackStepper>,
}
impl SyscallEnv<'_> {
    fn reg_error(e: super::regs::RegisterError) -> SimErr {
        SimErr::Syscall(e.to_string())
    }

    /// Reads an integer register.
    pub fn reg<'r>(&self, r: impl Into<RegRef<'r>>) -> Result<u32, SimErr> {
        self.regs.get(r).map(|v| v as u32).map_err(Self::reg_error)
    }
    /// Writes an integer register.
    pub fn set_reg<'r>(&mut self, r: impl Into<RegRef<'r>>, value: u32) -> Result<(), SimErr> {
        self.regs.set(r, u64::from(value), self.rec.as_deref_mut())
            .map(|_| ())
            .map_err(Self::reg_error)
    }

    /// Reads a floating-point register as a single.
    pub fn freg<'r>(&self, r: impl Into<RegRef<'r>>) -> Result<f32, SimErr> {
        self.fregs.get(r).map(|v| f32::from_bits(v as u32)).map_err(Self::reg_error)
    }
    /// Writes a single into a floating-point register.
    pub fn set_freg<'r>(&mut self, r: impl Into<RegRef<'r>>, value: f32) -> Result<(), SimErr> {
        self.fregs.set(r, super::nan_box(value.to_bits()), self.rec.as_deref_mut())
            .map(|_| ())
            .map_err(Self::reg_error)
    }

    /// Reads memory.
    pub fn read(&mut self, addr: u32, width: Width) -> Result<u64, SimErr> {
        self.mem.read(addr, width).map_err(SimErr::Load)
    }
    /// Writes memory.
    pub fn write(&mut self, addr: u32, width: Width, value: u64) -> Result<(), SimErr> {
        self.mem.write(addr, width, value, self.rec.as_deref_mut())
            .map(|_| ())
            .map_err(SimErr::Store)
    }
    /// Reads a NUL-terminated string.
    pub fn read_string(&mut self, mut addr: u32) -> Result<Vec<u8>, SimErr> {
        let mut bytes = vec![];
        loop {
            match self.read(addr, Width::Byte)? as u8 {
                0 => break Ok(bytes),
                b => bytes.push(b),
            }
            addr = addr.wrapping_add(1);
        }
    }

    /// Allocates memory on the heap, returning its address.
    pub fn allocate_heap(&mut self, bytes: u32) -> Result<u32, SimErr> {
        self.mem.allocate_heap(bytes, self.rec.as_deref_mut())
            .map_err(|e| SimErr::Syscall(e.to_string()))
    }
}

/// Reference services which read input from and write output to shared buffers.
#[derive(Default, Clone)]
pub struct BufferedSyscalls {
    input: Arc<RwLock<VecDeque<u8>>>,
    output: Arc<RwLock<Vec<u8>>>,
}
impl BufferedSyscalls {
    /// Creates the services, wrapping them around the given buffers.
    pub fn new(input: Arc<RwLock<VecDeque<u8>>>, output: Arc<RwLock<Vec<u8>>>) -> Self {
        Self { input, output }
    }

    /// Gets a reference to the input buffer.
    pub fn input(&self) -> &Arc<RwLock<VecDeque<u8>>> {
        &self.input
    }
    /// Gets a reference to the output buffer.
    pub fn output(&self) -> &Arc<RwLock<Vec<u8>>> {
        &self.output
    }

    fn out(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.output.write().unwrap_or_else(|e| e.into_inner())
    }
}
impl std::fmt::Debug for BufferedSyscalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSyscalls").finish_non_exhaustive()
    }
}
impl SyscallHandler for BufferedSyscalls {
    fn handle(&mut self, number: u32, env: &mut SyscallEnv<'_>) -> Result<SyscallOutcome, SimErr> {
        match number {
            1 => {
                let n = env.reg(A0)? as i32;
                self.out().extend(n.to_string().bytes());
            },
            4 => {
                let s = env.read_string(env.reg(A0)?)?;
                self.out().extend(s);
            },
            9 => {
                let bytes = env.reg(A0)? as i32;
                let bytes = u32::try_from(bytes)
                    .map_err(|_| SimErr::Syscall(format!("cannot allocate a negative number of bytes ({bytes})")))?;
                let addr = env.allocate_heap(bytes)?;
                env.set_reg(A0, addr)?;
            },
            10 => return Ok(SyscallOutcome::Exit(0)),
            11 => {
                let c = env.reg(A0)? as u8;
                self.out().push(c);
            },
            12 => {
                let c = self.input.write()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front()
                    .map_or(u32::MAX, u32::from);
                env.set_reg(A0, c)?;
            },
            34 => {
                let n = env.reg(A0)?;
                self.out().extend(format!("{n:#010x}").bytes());
            },
            93 => return Ok(SyscallOutcome::Exit(env.reg(A0)? as i32)),
            n => return Err(SimErr::UnknownSyscall(n)),
        }

        Ok(SyscallOutcome::Continue)
    }

    fn reset(&mut self) {
        self.out().clear();
    }
}
