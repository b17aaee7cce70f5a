//! Simulating and execution for RV32 programs.
//!
//! This module is focused on executing fully loaded programs (i.e., [`Program`]).
//!
//! This module consists of:
//! - [`Machine`]: The architectural state (memory, register files, CSRs, program counter) and the execution cycle.
//! - [`Simulator`]: A controller which runs a [`Machine`] on its own thread.
//! - [`mem`]: The module handling segmented memory and the heap.
//! - [`regs`]: The module handling the integer and floating-point register files.
//! - [`csr`]: The module handling control and status registers.
//! - [`interrupt`]: The module handling pending interrupts and traps.
//! - [`backstep`]: The module handling the undo history.
//! - [`device`]: The module handling memory-mapped IO devices.
//! - [`observer`]: The module handling notices of simulator activity.
//! - [`debug`]: The module handling types of breakpoints for the simulator.
//! - [`syscall`]: The module handling environment calls.
//!
//! # Usage
//!
//! To simulate some code, you need to instantiate a Simulator and load a program into it:
//!
//! ```
//! use riscv_ensemble::ast::{Instr, ImmOp, IOffset, Program};
//! use riscv_ensemble::ast::reg_consts::{A0, A7, ZERO};
//! use riscv_ensemble::sim::{Simulator, StopReason};
//!
//! let program = Program::from_instrs(0x0040_0000, [
//!     Instr::OpImm { op: ImmOp::Addi, rd: A7, rs1: ZERO, imm: IOffset::new_trunc(93) },
//!     Instr::OpImm { op: ImmOp::Addi, rd: A0, rs1: ZERO, imm: IOffset::new_trunc(5) },
//!     Instr::Ecall,
//! ]);
//!
//! let mut sim = Simulator::new(Default::default());
//! sim.load_program(program).unwrap();
//!
//! let notices = sim.subscribe();
//! sim.start(None, &[]).unwrap();
//! sim.join();
//!
//! let stop = notices.try_iter().last().unwrap();
//! assert_eq!(stop.reason, Some(StopReason::NormalTermination));
//! assert_eq!(stop.exit_code, Some(5));
//! ```
//!
//! ## Flags
//!
//! Here, we define `sim` to have the default flags.
//! We could also configure the simulator by editing the flags. For example,
//! if we wish to allow the program to write to its own text segment, we can edit the flags like so:
//!
//! ```
//! # use riscv_ensemble::sim::{Simulator, SimFlags};
//! let sim = Simulator::new(SimFlags { self_modifying_code: true, ..Default::default() });
//! ```
//!
//! All of the available flags can be found in [`SimFlags`].
//!
//! ## Execution
//!
//! A [`Simulator`] can be controlled with:
//! - [`Simulator::start`]: run until the program stops (or a step budget is spent),
//! - [`Simulator::step`]: execute one instruction,
//! - [`Simulator::pause`], [`Simulator::stop`]: interrupt a run,
//! - [`Simulator::back_step`]: undo the last instruction,
//! - [`Simulator::reset`]: return to the state right after loading.
//!
//! Every run publishes a [`RunNotice`] when it starts and when it stops,
//! which carries the [`StopReason`] (and the unhandled [`Trap`], if there was one).
//!
//! A [`Machine`] can also be driven directly on the current thread with [`Machine::run`].
//!
//! ## Traps and interrupts
//!
//! When an instruction faults, the fault is registered as a synchronous trap with the
//! [`InterruptController`]. Before the next instruction, the machine enters the trap handler
//! at `utvec` if user interrupts are enabled (`ustatus.UIE`) and the handler exists;
//! otherwise the run stops with [`StopReason::Exception`].
//! External and timer interrupts (raised by devices) and software interrupts (`uip`) are serviced the same way.
//!
//! [`InterruptController`]: interrupt::InterruptController
//! [`RunNotice`]: observer::RunNotice

pub mod mem;
pub mod regs;
pub mod csr;
pub mod interrupt;
pub mod backstep;
pub mod observer;
pub mod device;
pub mod debug;
pub mod syscall;
mod exec;

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::ast::reg_consts::SP;
use crate::ast::Program;

use self::backstep::{BackStep, BackStepper};
use self::csr::{interrupts, numbers, status, CsrFile};
use self::debug::Breakpoint;
use self::exec::Flow;
use self::interrupt::{Claim, InterruptController, Pending};
use self::mem::{Fetched, MemError, Memory, MemoryConfigId};
use self::observer::{Notifier, RunAction, RunNotice, Subscription};
use self::regs::{FileKind, RegisterFile};
use self::syscall::{BufferedSyscalls, SyscallHandler};

/// Errors that can occur while executing an instruction.
///
/// These are raised as synchronous traps.
#[derive(Debug, PartialEq, Eq, Hash, Clone, thiserror::Error)]
pub enum SimErr {
    /// The instruction could not be fetched.
    #[error("cannot fetch instruction: {0}")]
    InstructionAccess(MemError),
    /// The instruction word does not decode into a supported instruction
    /// (or the instruction was used in an unsupported way).
    #[error("illegal instruction {0:#010x}")]
    IllegalInstruction(u32),
    /// A load failed.
    #[error("load failed: {0}")]
    Load(MemError),
    /// A store failed.
    #[error("store failed: {0}")]
    Store(MemError),
    /// An environment call requested a service which does not exist.
    #[error("unknown environment call {0}")]
    UnknownSyscall(u32),
    /// An environment call failed.
    #[error("environment call failed: {0}")]
    Syscall(String),
    /// An interrupt was taken, but its handler does not exist.
    #[error("no handler for interrupt (cause {cause:#010x})")]
    UnhandledInterrupt {
        /// The cause of the interrupt.
        cause: u32
    },
}
impl SimErr {
    /// The exception code written to `ucause`.
    pub fn cause(&self) -> u32 {
        use mem::MemError::Misaligned;

        match self {
            SimErr::InstructionAccess(Misaligned { .. }) => 0,
            SimErr::InstructionAccess(_) => 1,
            SimErr::IllegalInstruction(_) => 2,
            SimErr::Load(Misaligned { .. }) => 4,
            SimErr::Load(_) => 5,
            SimErr::Store(Misaligned { .. }) => 6,
            SimErr::Store(_) => 7,
            SimErr::UnknownSyscall(_) | SimErr::Syscall(_) => 8,
            SimErr::UnhandledInterrupt { cause } => *cause,
        }
    }

    /// The value written to `utval`.
    ///
    /// This is the faulting address for memory errors and the instruction word for illegal instructions.
    pub fn tval(&self) -> u32 {
        match self {
            SimErr::InstructionAccess(e) | SimErr::Load(e) | SimErr::Store(e) => e.address().unwrap_or(0),
            SimErr::IllegalInstruction(word) => *word,
            _ => 0,
        }
    }
}

/// A fault raised by an instruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, thiserror::Error)]
#[error("{error} (pc = {pc:#010x})")]
pub struct Trap {
    /// The fault.
    pub error: SimErr,
    /// The address of the instruction which raised the fault.
    pub pc: u32,
}

/// Why a run stopped.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum StopReason {
    /// The program exited through an environment call.
    NormalTermination,
    /// Execution ran off the end of the program (onto a null instruction).
    CliffTermination,
    /// A trap occurred which could not be handled.
    Exception,
    /// A breakpoint (or `ebreak`) was hit.
    Breakpoint,
    /// The step budget of the run was spent.
    MaxSteps,
    /// The run was stopped by [`Simulator::stop`].
    Stop,
    /// The run was paused by [`Simulator::pause`].
    Pause,
}
impl StopReason {
    /// Whether the program can continue after stopping for this reason.
    pub fn is_resumable(self) -> bool {
        matches!(self, StopReason::Breakpoint | StopReason::MaxSteps | StopReason::Pause)
    }
}

/// How fast a run executes.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum RunSpeed {
    /// As fast as possible.
    Unlimited,
    /// At most the given number of instructions per second.
    Limited(f64),
}
impl RunSpeed {
    /// The minimum time each instruction should take (`None` if unthrottled).
    pub fn interval(self) -> Option<Duration> {
        match self {
            RunSpeed::Limited(ips) if ips.is_finite() && ips > 0.0 => Some(Duration::from_secs_f64(1.0 / ips)),
            _ => None,
        }
    }
}

/// Configuration flags for [`Simulator`].
///
/// These can be modified after the [`Simulator`] is created with [`Simulator::new`]
/// and their effects should still apply.
///
/// Read the field descriptions for more details.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct SimFlags {
    /// Whether instructions record undo history.
    ///
    /// History is only recorded while single-stepping or running at a limited speed.
    ///
    /// By default, this flag is `true`.
    pub backstepping: bool,

    /// Whether the program may write to its text segment.
    ///
    /// By default, this flag is `false`.
    pub self_modifying_code: bool,

    /// How fast runs execute.
    ///
    /// By default, this is [`RunSpeed::Unlimited`].
    pub run_speed: RunSpeed,

    /// The memory layout.
    ///
    /// Changing this field does not change the layout of existing memory.
    /// Use [`Simulator::set_memory_config`] instead.
    ///
    /// By default, this is [`MemoryConfigId::Default`].
    pub memory_config: MemoryConfigId,
}
impl Default for SimFlags {
    fn default() -> Self {
        Self {
            backstepping: true,
            self_modifying_code: false,
            run_speed: RunSpeed::Unlimited,
            memory_config: MemoryConfigId::Default,
        }
    }
}

/// The lifecycle of the loaded program.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RunState {
    /// Loaded (or reset) and not yet run.
    Stopped,
    /// A run is in progress.
    Running,
    /// A run stopped and can be resumed.
    Paused,
    /// The program ended. It must be reset before it can run again.
    Terminated,
}

/// The result of a run.
#[derive(Debug, PartialEq, Clone)]
pub struct Stopped {
    /// Why the run stopped.
    pub reason: StopReason,
    /// The unhandled trap, if the run stopped with [`StopReason::Exception`].
    pub trap: Option<Trap>,
}
impl Stopped {
    fn new(reason: StopReason) -> Self {
        Self { reason, trap: None }
    }
}

/// Errors from controlling a run.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// A run is already in progress.
    #[error("a run is already in progress")]
    AlreadyRunning,
    /// The program has terminated and must be reset first.
    #[error("program has terminated and must be reset")]
    Terminated,
    /// The execution thread could not be spawned.
    #[error("could not spawn execution thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Places single-precision bits into a floating-point register's 64-bit physical value.
pub(crate) fn nan_box(bits: u32) -> u64 {
    0xFFFF_FFFF_0000_0000 | u64::from(bits)
}

/// The architectural state of the simulated machine.
pub struct Machine {
    /// The memory.
    pub mem: Memory,
    /// The integer register file.
    pub regs: RegisterFile,
    /// The floating-point register file.
    pub fregs: RegisterFile,
    /// The control and status registers.
    pub csrs: CsrFile,
    /// The program counter.
    pub pc: u32,
    /// The undo history.
    pub backstepper: BackStepper,
    /// Configuration settings for the simulator.
    pub flags: SimFlags,

    interrupts: Arc<InterruptController>,
    syscalls: Box<dyn SyscallHandler>,
    run_notices: Notifier<RunNotice>,
    program: Option<Program>,
    exit_code: Option<i32>,
    state: RunState,
}
impl Machine {
    /// Creates a new machine with the provided flags.
    pub fn new(flags: SimFlags) -> Self {
        let config = flags.memory_config.config();
        let mut mem = Memory::new(config);
        mem.self_modifying_code = flags.self_modifying_code;

        Self {
            mem,
            regs: RegisterFile::integer(&config),
            fregs: RegisterFile::float(),
            csrs: CsrFile::new(),
            pc: config.text_base,
            backstepper: BackStepper::new(),
            flags,

            interrupts: Arc::new(InterruptController::new()),
            syscalls: Box::new(BufferedSyscalls::default()),
            run_notices: Notifier::new(),
            program: None,
            exit_code: None,
            state: RunState::Stopped,
        }
    }

    /// Resets the machine to the state right after its program was loaded.
    ///
    /// This clears memory (reloading the program into it), resets every register,
    /// and discards pending interrupts and the undo history.
    pub fn reset(&mut self) {
        self.mem.clear();
        if let Some(program) = &self.program {
            if let Err(e) = self.mem.load_program(program) {
                log::warn!("could not reload program: {e}");
            }
        }

        self.regs.reset();
        self.fregs.reset();
        self.csrs.reset();
        self.pc = match &self.program {
            Some(p) => p.entry,
            None => self.mem.config().text_base,
        };

        self.interrupts.reset();
        self.backstepper.clear();
        self.syscalls.reset();
        self.exit_code = None;
        self.state = RunState::Stopped;
    }

    /// Loads a program, resetting the machine.
    ///
    /// # Errors
    ///
    /// Fails if the program does not fit the memory layout.
    /// On failure, no program is loaded.
    pub fn load_program(&mut self, program: Program) -> Result<(), MemError> {
        self.mem.clear();
        if let Err(e) = self.mem.load_program(&program) {
            self.program = None;
            self.reset();
            return Err(e);
        }

        log::debug!("loaded program with {} statements (entry {:#010x})", program.statements.len(), program.entry);
        self.program = Some(program);
        self.reset();
        Ok(())
    }

    /// The loaded program.
    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    /// Switches the memory layout.
    ///
    /// This clears memory, unloads the program, and resets the machine
    /// (with `sp` and `gp` taking their initial values from the new layout).
    pub fn set_memory_config(&mut self, id: MemoryConfigId) {
        let config = id.config();
        self.flags.memory_config = id;
        self.mem.set_config(config);

        self.regs.set_layout(&config);

        self.program = None;
        self.reset();
        log::debug!("memory configuration switched to {id}");
    }

    /// Replaces the environment call services.
    pub fn set_syscall_handler(&mut self, handler: impl SyscallHandler + 'static) {
        self.syscalls = Box::new(handler);
    }

    /// The interrupt controller.
    pub fn interrupts(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    /// The lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The exit code, if the program exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Subscribes to run notices.
    pub fn subscribe_runs(&mut self) -> Subscription<RunNotice> {
        self.run_notices.subscribe()
    }

    /// Whether instructions record undo history in a run with this step budget.
    fn records_history(&self, max_steps: Option<u64>) -> bool {
        self.flags.backstepping && (self.flags.run_speed.interval().is_some() || max_steps == Some(1))
    }

    /// Prepares a run.
    fn begin_run(&mut self, max_steps: Option<u64>) -> Result<(), ControlError> {
        match self.state {
            RunState::Running => return Err(ControlError::AlreadyRunning),
            RunState::Terminated => return Err(ControlError::Terminated),
            RunState::Stopped | RunState::Paused => {},
        }

        let interactive = self.flags.run_speed.interval().is_some() || max_steps == Some(1);
        self.backstepper.set_enabled(self.records_history(max_steps));
        self.mem.self_modifying_code = self.flags.self_modifying_code;
        if !interactive {
            self.mem.notifier_mut().hold();
            self.regs.notifier_mut().hold();
            self.fregs.notifier_mut().hold();
            self.csrs.notifier_mut().hold();
        }

        self.state = RunState::Running;
        log::debug!("run started at pc {:#010x} (max steps: {max_steps:?})", self.pc);
        self.run_notices.publish(RunNotice {
            action: RunAction::Start,
            reason: None,
            trap: None,
            run_speed: self.flags.run_speed,
            max_steps,
            pc: self.pc,
            exit_code: None,
        });
        Ok(())
    }

    /// Finishes a run.
    fn end_run(&mut self, max_steps: Option<u64>, stopped: Stopped) {
        self.mem.notifier_mut().release();
        self.regs.notifier_mut().release();
        self.fregs.notifier_mut().release();
        self.csrs.notifier_mut().release();
        self.backstepper.set_enabled(false);

        self.state = match stopped.reason.is_resumable() {
            true  => RunState::Paused,
            false => RunState::Terminated,
        };
        match &stopped.trap {
            Some(trap) => log::debug!("run stopped ({:?}): {trap}", stopped.reason),
            None => log::debug!("run stopped ({:?}) at pc {:#010x}", stopped.reason, self.pc),
        }
        self.run_notices.publish(RunNotice {
            action: RunAction::Stop,
            reason: Some(stopped.reason),
            trap: stopped.trap,
            run_speed: self.flags.run_speed,
            max_steps,
            pc: self.pc,
            exit_code: self.exit_code,
        });
    }

    /// Runs on the current thread until the program stops.
    ///
    /// This is not throttled by [`SimFlags::run_speed`],
    /// and it cannot be paused from elsewhere (use [`Simulator`] for that).
    ///
    /// # Errors
    ///
    /// Fails if the program has terminated (and has not been reset).
    pub fn run(&mut self, max_steps: Option<u64>, breakpoints: &[Breakpoint]) -> Result<Stopped, ControlError> {
        self.begin_run(max_steps)?;

        let mut remaining = max_steps;
        let stopped = loop {
            if let Some(stopped) = self.step_checked(&mut remaining, breakpoints) {
                break stopped;
            }
        };

        self.end_run(max_steps, stopped.clone());
        Ok(stopped)
    }

    /// Executes one iteration and then checks breakpoints.
    fn step_checked(&mut self, remaining: &mut Option<u64>, breakpoints: &[Breakpoint]) -> Option<Stopped> {
        if let Some(stopped) = self.step(remaining) {
            return Some(stopped);
        }

        breakpoints.iter()
            .any(|bp| bp.check(self))
            .then(|| Stopped::new(StopReason::Breakpoint))
    }

    /// Executes one iteration of the execution cycle.
    ///
    /// This services a pending trap or interrupt, and then fetches and executes one instruction
    /// (counting it against `remaining`, if there is a budget).
    ///
    /// Returns why execution should stop, if it should.
    pub fn step(&mut self, remaining: &mut Option<u64>) -> Option<Stopped> {
        let pending = self.pending_interrupts();
        if pending.trap {
            // delivering the trap finishes the instruction which raised it,
            // so it is undone together with that instruction
            let trap = self.interrupts.claim_trap(self.pc);
            self.backstepper.reopen(trap.pc, self.pc);
            let stopped = self.service_trap(trap);
            self.backstepper.commit();
            if stopped.is_some() {
                return stopped;
            }
        }

        self.backstepper.begin(self.pc);
        match self.step_inner(remaining, (!pending.trap).then_some(pending)) {
            Ok(stopped) => {
                self.backstepper.commit();
                stopped
            },
            Err(stopped) => {
                self.backstepper.commit_if_dirty();
                Some(stopped)
            }
        }
    }

    /// `Ok` if an instruction was executed, `Err` if execution stopped before executing one.
    ///
    /// `pending` is `None` if a trap was already delivered in this iteration.
    fn step_inner(&mut self, remaining: &mut Option<u64>, pending: Option<Pending>) -> Result<Option<Stopped>, Stopped> {
        if let Some(stopped) = pending.and_then(|p| self.service_interrupts(p)) {
            return Err(stopped);
        }
        if *remaining == Some(0) {
            return Err(Stopped::new(StopReason::MaxSteps));
        }

        let pc = self.pc;
        let fetched = match self.mem.fetch(pc) {
            Ok(Fetched::Instr(instr)) => Ok(instr),
            Ok(Fetched::Null) => return Err(Stopped::new(StopReason::CliffTermination)),
            Ok(Fetched::Illegal(word)) => Err(SimErr::IllegalInstruction(word)),
            Err(e) => Err(SimErr::InstructionAccess(e)),
        };
        self.pc = pc.wrapping_add(4);
        if let Some(n) = remaining {
            *n -= 1;
        }

        self.mem.track_stack_pointer(self.regs.value_at(usize::from(SP)) as u32);
        let flow = fetched.and_then(|instr| {
            log::trace!("{pc:#010x}: {instr}");
            self.execute(instr)
        });
        let stopped = match flow {
            Ok(Flow::Continue) => None,
            Ok(Flow::Exit(code)) => {
                self.exit_code = Some(code);
                Some(Stopped::new(StopReason::NormalTermination))
            },
            Ok(Flow::Break) => Some(Stopped::new(StopReason::Breakpoint)),
            Err(error) => {
                let trap = Trap { error, pc };
                log::trace!("trap raised: {trap}");
                match self.interrupts.register_synchronous_trap(trap.clone()) {
                    true => {
                        self.backstepper.record(BackStep::TrapRaised);
                        None
                    },
                    false => Some(Stopped { reason: StopReason::Exception, trap: Some(trap) }),
                }
            }
        };

        self.csrs.tick(self.backstepper.recorder());
        self.mem.devices_mut().poll(&self.interrupts);
        Ok(stopped)
    }

    /// Checks the controller, skipping its lock if nothing was registered.
    fn pending_interrupts(&self) -> Pending {
        match self.interrupts.is_signaled() {
            true  => self.interrupts.pending(),
            false => Pending::default(),
        }
    }

    /// Enters the handler for a claimed trap, returning a stop if it has no handler.
    fn service_trap(&mut self, trap: Trap) -> Option<Stopped> {
        self.backstepper.record(BackStep::Claimed(Claim::Trap(trap.clone())));
        match self.enter_handler(trap.error.cause(), trap.error.tval(), trap.pc, false) {
            true  => None,
            false => Some(Stopped { reason: StopReason::Exception, trap: Some(trap) }),
        }
    }

    /// Services at most one pending interrupt.
    ///
    /// External interrupts come first, then software and timer interrupts.
    /// Returns a stop if an interrupt could not be handled.
    fn service_interrupts(&mut self, pending: Pending) -> Option<Stopped> {
        let ustatus = self.csrs.read(numbers::USTATUS);
        let uie = self.csrs.read(numbers::UIE);
        let uip = self.csrs.read(numbers::UIP);
        let enabled = |bit: u64| ustatus & status::UIE != 0 && uie & bit != 0;

        if pending.external {
            if !enabled(interrupts::EXTERNAL) {
                self.mark_pending(uip, interrupts::EXTERNAL);
            } else {
                let value = self.interrupts.claim_external();
                self.backstepper.record(BackStep::Claimed(Claim::External(value)));
                return self.take_interrupt(0x8000_0008, value, uip, interrupts::EXTERNAL);
            }
        }
        if uip & interrupts::SOFTWARE != 0 && enabled(interrupts::SOFTWARE) {
            // software interrupts stay pending until the handler clears uip
            return self.take_interrupt(0x8000_0000, 0, 0, 0);
        }
        if pending.timer {
            if !enabled(interrupts::TIMER) {
                self.mark_pending(uip, interrupts::TIMER);
            } else {
                let value = self.interrupts.claim_timer();
                self.backstepper.record(BackStep::Claimed(Claim::Timer(value)));
                return self.take_interrupt(0x8000_0004, value, uip, interrupts::TIMER);
            }
        }

        None
    }

    /// Sets an interrupt's bit in `uip`.
    fn mark_pending(&mut self, uip: u64, bit: u64) {
        if uip & bit == 0 {
            self.csrs.update_backdoor(numbers::UIP, uip | bit, self.backstepper.recorder());
        }
    }

    fn take_interrupt(&mut self, cause: u32, value: u32, uip: u64, bit: u64) -> Option<Stopped> {
        if uip & bit != 0 {
            self.csrs.update_backdoor(numbers::UIP, uip & !bit, self.backstepper.recorder());
        }

        match self.enter_handler(cause, value, self.pc, true) {
            true  => None,
            false => Some(Stopped {
                reason: StopReason::Exception,
                trap: Some(Trap { error: SimErr::UnhandledInterrupt { cause }, pc: self.pc }),
            }),
        }
    }

    /// Enters the trap handler.
    ///
    /// Returns whether the handler could be entered
    /// (user interrupts must be enabled and the handler must exist).
    fn enter_handler(&mut self, cause: u32, tval: u32, epc: u32, interrupt: bool) -> bool {
        self.csrs.update_backdoor(numbers::UCAUSE, u64::from(cause), self.backstepper.recorder());
        self.csrs.update_backdoor(numbers::UEPC, u64::from(epc), self.backstepper.recorder());
        self.csrs.update_backdoor(numbers::UTVAL, u64::from(tval), self.backstepper.recorder());

        let ustatus = self.csrs.read(numbers::USTATUS);
        if ustatus & status::UIE == 0 {
            return false;
        }

        let utvec = self.csrs.read(numbers::UTVEC) as u32;
        let base = utvec & !0b11;
        let handler = match interrupt && utvec & 0b11 == 1 {
            true  => base.wrapping_add(4 * (cause & 0x7FFF_FFFF)),
            false => base,
        };
        if !matches!(self.mem.fetch(handler), Ok(Fetched::Instr(_))) {
            log::debug!("no trap handler at {handler:#010x}");
            return false;
        }

        let ustatus = (ustatus | status::UPIE) & !status::UIE;
        self.csrs.update_backdoor(numbers::USTATUS, ustatus, self.backstepper.recorder());
        log::debug!("entering trap handler at {handler:#010x} (cause {cause:#010x}, epc {epc:#010x})");
        self.pc = handler;
        true
    }

    /// Undoes the most recently executed instruction.
    ///
    /// Returns `false` if there is nothing to undo.
    pub fn back_step(&mut self) -> bool {
        let Some(group) = self.backstepper.pop() else { return false };

        for action in group.actions.into_iter().rev() {
            match action {
                BackStep::Register { file: FileKind::Integer, index, value } => self.regs.restore(index, value),
                BackStep::Register { file: FileKind::Float, index, value } => self.fregs.restore(index, value),
                BackStep::Register { file: FileKind::Csr, index, value }
                | BackStep::CsrBackdoor { index, value } => self.csrs.restore(index, value),
                BackStep::Memory { address, width, value } => self.mem.restore(address, width, value),
                BackStep::HeapPointer(ptr) => self.mem.restore_heap_pointer(ptr),
                BackStep::StackExtent(extent) => self.mem.restore_stack_extent(extent),
                BackStep::TrapRaised => self.interrupts.discard_trap(),
                BackStep::Claimed(claim) => self.interrupts.restore(claim),
            }
        }
        self.pc = group.pc;

        self.exit_code = None;
        if self.state == RunState::Terminated {
            self.state = RunState::Paused;
        }
        true
    }
}
impl Default for Machine {
    fn default() -> Self {
        Self::new(SimFlags::default())
    }
}
impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("memory_config", self.mem.config())
            .finish_non_exhaustive()
    }
}

enum Control {
    Pause,
    Stop,
}

struct RunHandle {
    control: Sender<Control>,
    thread: JoinHandle<()>,
}

/// Executes a [`Machine`] on a separate thread.
///
/// Only one run can be active at a time. The outcome of each run is reported
/// through [`RunNotice`]s (see [`Simulator::subscribe`]).
///
/// [`RunNotice`]: observer::RunNotice
#[derive(Debug)]
pub struct Simulator {
    machine: Arc<Mutex<Machine>>,
    interrupts: Arc<InterruptController>,
    run: Option<RunHandle>,
}
impl Simulator where Simulator: Send + Sync {}

fn lock_machine(machine: &Mutex<Machine>) -> MutexGuard<'_, Machine> {
    // a panicking run leaves the machine between instructions, which is still usable
    machine.lock().unwrap_or_else(|e| e.into_inner())
}

impl Simulator {
    /// Creates a new simulator with the provided flags, without a loaded program.
    pub fn new(flags: SimFlags) -> Self {
        let machine = Machine::new(flags);
        let interrupts = Arc::clone(machine.interrupts());

        Self {
            machine: Arc::new(Mutex::new(machine)),
            interrupts,
            run: None,
        }
    }

    /// Locks the machine to read or change its state.
    ///
    /// While the guard is held, an active run is blocked between instructions.
    pub fn lock(&self) -> MutexGuard<'_, Machine> {
        lock_machine(&self.machine)
    }

    /// The interrupt controller, which devices and front ends can raise interrupts through.
    pub fn interrupts(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    /// Subscribes to run notices.
    pub fn subscribe(&self) -> Subscription<RunNotice> {
        self.lock().subscribe_runs()
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|r| !r.thread.is_finished())
    }

    /// The lifecycle state of the program.
    pub fn state(&self) -> RunState {
        self.lock().state()
    }

    /// Starts a run on a new thread.
    ///
    /// The run continues until the program stops, a breakpoint is hit,
    /// or `max_steps` instructions have executed (if it is `Some`).
    ///
    /// # Errors
    ///
    /// Fails if a run is already in progress or the program has terminated.
    pub fn start(&mut self, max_steps: Option<u64>, breakpoints: &[Breakpoint]) -> Result<(), ControlError> {
        if self.is_running() {
            return Err(ControlError::AlreadyRunning);
        }
        self.join();
        self.lock().begin_run(max_steps)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let machine = Arc::clone(&self.machine);
        let breakpoints = breakpoints.to_vec();
        let spawned = std::thread::Builder::new()
            .name(String::from("riscv-sim"))
            .spawn(move || run_thread(&machine, &rx, max_steps, &breakpoints));

        match spawned {
            Ok(thread) => {
                self.run = Some(RunHandle { control: tx, thread });
                Ok(())
            },
            Err(e) => {
                self.lock().end_run(max_steps, Stopped::new(StopReason::Stop));
                Err(ControlError::Spawn(e))
            }
        }
    }

    /// Executes a single instruction (on a new thread).
    ///
    /// # Errors
    ///
    /// Fails if a run is already in progress or the program has terminated.
    pub fn step(&mut self) -> Result<(), ControlError> {
        self.start(Some(1), &[])
    }

    /// Pauses the active run (if there is one).
    ///
    /// The run stops with [`StopReason::Pause`] and can be resumed.
    pub fn pause(&mut self) {
        if let Some(run) = &self.run {
            let _ = run.control.send(Control::Pause);
        }
        self.join();
    }

    /// Stops the active run, terminating the program.
    ///
    /// If the program is paused, it is terminated.
    pub fn stop(&mut self) {
        if self.is_running() {
            if let Some(run) = &self.run {
                let _ = run.control.send(Control::Stop);
            }
            self.join();
        } else {
            self.join();
            let mut machine = self.lock();
            if machine.state() == RunState::Paused {
                machine.end_run(None, Stopped::new(StopReason::Stop));
            }
        }
    }

    /// Waits for the active run to finish.
    pub fn join(&mut self) {
        if let Some(run) = self.run.take() {
            if run.thread.join().is_err() {
                log::error!("execution thread panicked");
            }
        }
    }

    /// Undoes the most recently executed instruction, pausing the active run first.
    ///
    /// Returns `false` if there is nothing to undo.
    pub fn back_step(&mut self) -> bool {
        self.pause();
        self.lock().back_step()
    }

    /// Resets the machine to the state right after its program was loaded, stopping the active run first.
    pub fn reset(&mut self) {
        self.halt();
        self.lock().reset();
    }

    /// Loads a program, stopping the active run first.
    ///
    /// # Errors
    ///
    /// Fails if the program does not fit the memory layout.
    pub fn load_program(&mut self, program: Program) -> Result<(), MemError> {
        self.halt();
        self.lock().load_program(program)
    }

    /// Switches the memory layout, stopping the active run first.
    ///
    /// This unloads the program.
    pub fn set_memory_config(&mut self, id: MemoryConfigId) {
        self.halt();
        self.lock().set_memory_config(id);
    }

    /// Stops the active run without otherwise changing the program's state.
    fn halt(&mut self) {
        if self.is_running() {
            self.stop();
        }
        self.join();
    }
}
impl Drop for Simulator {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_thread(machine: &Mutex<Machine>, control: &Receiver<Control>, max_steps: Option<u64>, breakpoints: &[Breakpoint]) {
    let interval = lock_machine(machine).flags.run_speed.interval();
    let mut remaining = max_steps;

    let stopped = loop {
        match control.try_recv() {
            Ok(Control::Pause) => break Stopped::new(StopReason::Pause),
            Ok(Control::Stop) | Err(TryRecvError::Disconnected) => break Stopped::new(StopReason::Stop),
            Err(TryRecvError::Empty) => {},
        }

        let start = Instant::now();
        if let Some(stopped) = lock_machine(machine).step_checked(&mut remaining, breakpoints) {
            break stopped;
        }

        if let Some(interval) = interval {
            match control.recv_timeout(interval.saturating_sub(start.elapsed())) {
                Ok(Control::Pause) => break Stopped::new(StopReason::Pause),
                Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break Stopped::new(StopReason::Stop),
                Err(RecvTimeoutError::Timeout) => {},
            }
        }
    };

    lock_machine(machine).end_run(max_steps, stopped);
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::reg_consts::*;
    use crate::ast::{IOffset, ImmOp, Instr, LoadOp, StoreOp};
    use crate::sim::observer::AccessType;

    use super::*;

    fn addi(rd: crate::ast::Reg, rs1: crate::ast::Reg, imm: i32) -> Instr {
        Instr::OpImm { op: ImmOp::Addi, rd, rs1, imm: IOffset::new_trunc(imm) }
    }

    fn machine(flags: SimFlags, instrs: impl IntoIterator<Item=Instr>) -> Machine {
        let mut machine = Machine::new(flags);
        let base = machine.mem.config().text_base;
        machine.load_program(Program::from_instrs(base, instrs)).unwrap();
        machine
    }

    #[test]
    fn test_cause_codes() {
        assert_eq!(SimErr::InstructionAccess(MemError::Misaligned { address: 2, width: mem::Width::Word }).cause(), 0);
        assert_eq!(SimErr::InstructionAccess(MemError::Unmapped(0)).cause(), 1);
        assert_eq!(SimErr::IllegalInstruction(0xFFFF_FFFF).cause(), 2);
        assert_eq!(SimErr::Load(MemError::Misaligned { address: 1, width: mem::Width::Half }).cause(), 4);
        assert_eq!(SimErr::Load(MemError::Unmapped(0)).cause(), 5);
        assert_eq!(SimErr::Store(MemError::TextWriteProtected(0x0040_0000)).cause(), 7);
        assert_eq!(SimErr::UnknownSyscall(3).cause(), 8);

        assert_eq!(SimErr::Load(MemError::Unmapped(0x10)).tval(), 0x10);
        assert_eq!(SimErr::IllegalInstruction(0xFFFF_FFFF).tval(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_run_speed_interval() {
        assert_eq!(RunSpeed::Unlimited.interval(), None);
        assert_eq!(RunSpeed::Limited(0.0).interval(), None);
        assert_eq!(RunSpeed::Limited(4.0).interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_max_steps_and_resume() {
        let mut m = machine(SimFlags::default(), [
            addi(A0, ZERO, 1),
            addi(A0, A0, 1),
            addi(A0, A0, 1),
        ]);

        let stopped = m.run(Some(2), &[]).unwrap();
        assert_eq!(stopped.reason, StopReason::MaxSteps);
        assert_eq!(m.state(), RunState::Paused);
        assert_eq!(m.regs.get(A0), Ok(2));

        let stopped = m.run(None, &[]).unwrap();
        assert_eq!(stopped.reason, StopReason::CliffTermination);
        assert_eq!(m.state(), RunState::Terminated);
        assert_eq!(m.regs.get(A0), Ok(3));

        assert!(matches!(m.run(None, &[]), Err(ControlError::Terminated)));
        m.reset();
        assert_eq!(m.regs.get(A0), Ok(0));
        assert_eq!(m.pc, 0x0040_0000);
        assert_eq!(m.run(None, &[]).map(|s| s.reason).ok(), Some(StopReason::CliffTermination));
    }

    #[test]
    fn test_single_step_back_step() {
        let mut m = machine(SimFlags::default(), [
            Instr::Lui { rd: T0, imm: crate::ast::UOffset::new_trunc(0x10010) },
            addi(T1, ZERO, 42),
            Instr::Store { op: StoreOp::Sw, rs1: T0, rs2: T1, offset: IOffset::new_trunc(8) },
        ]);

        for _ in 0..3 {
            assert_eq!(m.run(Some(1), &[]).unwrap().reason, StopReason::MaxSteps);
        }
        assert_eq!(m.mem.peek(0x1001_0008, mem::Width::Word), Ok(42));
        assert_eq!(m.backstepper.len(), 3);

        assert!(m.back_step());
        assert_eq!(m.mem.peek(0x1001_0008, mem::Width::Word), Ok(0));
        assert_eq!(m.pc, 0x0040_0008);
        assert!(m.back_step());
        assert_eq!(m.regs.get(T1), Ok(0));
        assert!(m.back_step());
        assert_eq!(m.regs.get(T0), Ok(0));
        assert_eq!(m.pc, 0x0040_0000);
        assert_eq!(m.csrs.read(numbers::INSTRET), 0);
        assert!(!m.back_step());
    }

    #[test]
    fn test_stack_extent_back_step() {
        let mut m = machine(SimFlags::default(), [
            addi(SP, SP, -16),
            Instr::Store { op: StoreOp::Sw, rs1: SP, rs2: ZERO, offset: IOffset::new_trunc(0) },
        ]);
        m.run(Some(1), &[]).unwrap();
        m.run(Some(1), &[]).unwrap();
        assert_eq!(m.mem.stack_extent(), 0x7fff_efec);

        assert!(m.back_step());
        assert_eq!(m.mem.stack_extent(), 0x7fff_effc);
    }

    #[test]
    fn test_sbrk_past_free_space_writes() {
        let mut m = machine(SimFlags::default(), [
            // store just above the heap pointer
            Instr::Lui { rd: T0, imm: crate::ast::UOffset::new_trunc(0x10040) },
            Instr::Store { op: StoreOp::Sw, rs1: T0, rs2: T0, offset: IOffset::new_trunc(0) },
            addi(A0, ZERO, 16),
            addi(A7, ZERO, 9),
            Instr::Ecall,
        ]);

        let stopped = m.run(None, &[]).unwrap();
        assert_eq!(stopped.reason, StopReason::CliffTermination);
        assert_eq!(m.regs.get(A0), Ok(0x1004_0000));
        assert_eq!(m.mem.heap_pointer(), 0x1004_0010);
    }

    #[test]
    fn test_unlimited_run_records_nothing() {
        let mut m = machine(SimFlags::default(), [addi(A0, ZERO, 1)]);
        m.run(None, &[]).unwrap();
        assert!(m.backstepper.is_empty());
    }

    #[test]
    fn test_unhandled_fault() {
        let mut m = machine(SimFlags::default(), [
            Instr::Load { op: LoadOp::Lw, rd: A0, rs1: ZERO, offset: IOffset::new_trunc(0) },
        ]);

        let stopped = m.run(None, &[]).unwrap();
        assert_eq!(stopped.reason, StopReason::Exception);
        assert_eq!(stopped.trap, Some(Trap { error: SimErr::Load(MemError::Unmapped(0)), pc: 0x0040_0000 }));
        assert_eq!(m.csrs.read(numbers::UCAUSE), 5);
        assert_eq!(m.csrs.read(numbers::UEPC), 0x0040_0000);
        assert_eq!(m.state(), RunState::Terminated);
        assert!(!m.interrupts().has_pending());
    }

    #[test]
    fn test_ebreak_pauses() {
        let mut m = machine(SimFlags::default(), [Instr::Ebreak, addi(A0, ZERO, 1)]);
        let stopped = m.run(None, &[]).unwrap();
        assert_eq!(stopped.reason, StopReason::Breakpoint);
        assert_eq!(m.pc, 0x0040_0004);
        assert_eq!(m.run(None, &[]).unwrap().reason, StopReason::CliffTermination);
        assert_eq!(m.regs.get(A0), Ok(1));
    }

    #[test]
    fn test_held_notices_released() {
        let mut m = machine(SimFlags::default(), [
            addi(A0, ZERO, 1),
            addi(A0, A0, 1),
        ]);
        let regs = m.regs.subscribe();
        let runs = m.subscribe_runs();

        m.run(None, &[]).unwrap();
        let writes: Vec<_> = regs.try_iter()
            .filter(|n| n.access == AccessType::Write)
            .map(|n| (n.name, n.value))
            .collect();
        assert_eq!(writes, [("a0", 2)]);

        let actions: Vec<_> = runs.try_iter().map(|n| n.action).collect();
        assert_eq!(actions, [RunAction::Start, RunAction::Stop]);
    }

    #[test]
    fn test_memory_config_switch() {
        let mut m = machine(SimFlags::default(), [addi(A0, ZERO, 1)]);
        m.set_memory_config(MemoryConfigId::CompactTextAtZero);

        let config = MemoryConfigId::CompactTextAtZero.config();
        assert!(m.program().is_none());
        assert_eq!(m.pc, config.text_base);
        assert_eq!(m.regs.get("sp"), Ok(u64::from(config.stack_pointer)));
        assert_eq!(m.regs.get("gp"), Ok(u64::from(config.global_pointer)));
        assert_eq!(m.mem.peek(config.text_base, mem::Width::Word), Ok(0));
    }
}
