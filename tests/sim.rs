use std::time::Duration;

use riscv_ensemble::ast::encoding::encode;
use riscv_ensemble::ast::reg_consts::*;
use riscv_ensemble::ast::{CsrOp, CsrSrc, IOffset, ImmOp, Instr, LoadOp, Program, Reg, StoreOp, UOffset};
use riscv_ensemble::sim::csr::numbers::*;
use riscv_ensemble::sim::debug::Breakpoint;
use riscv_ensemble::sim::device::{BufferedKeyboard, TimerDevice};
use riscv_ensemble::sim::mem::{MemError, MemoryConfigId, Width};
use riscv_ensemble::sim::observer::{AccessType, RunAction, RunNotice, Subscription};
use riscv_ensemble::sim::{ControlError, RunSpeed, RunState, SimErr, SimFlags, Simulator, StopReason, Trap};

const TEXT: u32 = 0x0040_0000;

fn addi(rd: Reg, rs1: Reg, imm: i32) -> Instr {
    Instr::OpImm { op: ImmOp::Addi, rd, rs1, imm: IOffset::new_trunc(imm) }
}
fn lui(rd: Reg, imm: u32) -> Instr {
    Instr::Lui { rd, imm: UOffset::new_trunc(imm) }
}
fn csr(op: CsrOp, rd: Reg, number: u32, src: CsrSrc) -> Instr {
    Instr::Csr { op, rd, csr: UOffset::new_trunc(number), src }
}
fn csr_imm(op: CsrOp, number: u32, imm: u32) -> Instr {
    csr(op, ZERO, number, CsrSrc::Imm(UOffset::new_trunc(imm)))
}
fn nop() -> Instr {
    addi(ZERO, ZERO, 0)
}
fn spin() -> Instr {
    Instr::Jal { rd: ZERO, offset: IOffset::new_trunc(0) }
}

fn simulator(flags: SimFlags, instrs: impl IntoIterator<Item=Instr>) -> Simulator {
    let mut sim = Simulator::new(flags);
    sim.load_program(Program::from_instrs(TEXT, instrs)).unwrap();
    sim
}

/// Runs to completion and returns the final run notice.
fn run(sim: &mut Simulator, breakpoints: &[Breakpoint]) -> RunNotice {
    let notices = sim.subscribe();
    sim.start(None, breakpoints).unwrap();
    sim.join();
    last_stop(&notices)
}

fn last_stop(notices: &Subscription<RunNotice>) -> RunNotice {
    notices.try_iter()
        .filter(|n| n.action == RunAction::Stop)
        .last()
        .expect("run should have stopped")
}

fn step(sim: &mut Simulator) {
    sim.step().unwrap();
    sim.join();
}

#[test]
fn test_exit_with_code() {
    let mut sim = simulator(SimFlags::default(), [
        addi(A0, ZERO, 5),
        Instr::Ecall,
    ]);
    sim.lock().regs.set(A7, 93, None).unwrap();

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::NormalTermination));
    assert_eq!(stop.exit_code, Some(5));
    assert_eq!(stop.trap, None);
    assert_eq!(sim.state(), RunState::Terminated);

    // terminated programs must be reset first
    assert!(matches!(sim.start(None, &[]), Err(ControlError::Terminated)));
    sim.reset();
    assert_eq!(sim.state(), RunState::Stopped);
    assert_eq!(sim.lock().exit_code(), None);
}

#[test]
fn test_unhandled_load_fault() {
    let mut sim = simulator(SimFlags::default(), [
        nop(),
        Instr::Load { op: LoadOp::Lw, rd: A0, rs1: ZERO, offset: IOffset::new_trunc(0) },
    ]);

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::Exception));
    assert_eq!(stop.trap, Some(Trap { error: SimErr::Load(MemError::Unmapped(0)), pc: TEXT + 4 }));
}

#[test]
fn test_breakpoint_and_resume() {
    let program = [
        addi(A0, ZERO, 1),
        addi(A0, A0, 1),
        addi(A0, A0, 1),
        addi(A7, ZERO, 93),
        Instr::Ecall,
    ];
    let mut sim = simulator(SimFlags::default(), program);
    let bps = [Breakpoint::PC(TEXT + 8)];

    let stop = run(&mut sim, &bps);
    assert_eq!(stop.reason, Some(StopReason::Breakpoint));
    assert_eq!(stop.pc, TEXT + 8);
    assert_eq!(sim.state(), RunState::Paused);
    assert_eq!(sim.lock().regs.get(A0), Ok(2));

    let stop = run(&mut sim, &bps);
    assert_eq!(stop.reason, Some(StopReason::NormalTermination));
    assert_eq!(stop.exit_code, Some(3));
}

#[test]
fn test_memory_config_switch() {
    let mut sim = simulator(SimFlags::default(), [addi(A0, ZERO, 1)]);
    sim.lock().mem.write(0x1001_0000, Width::Word, 0xABCD, None).unwrap();

    sim.set_memory_config(MemoryConfigId::CompactDataAtZero);
    let config = MemoryConfigId::CompactDataAtZero.config();

    let machine = sim.lock();
    assert_eq!(machine.regs.get("sp"), Ok(u64::from(config.stack_pointer)));
    assert_eq!(machine.regs.get("gp"), Ok(u64::from(config.global_pointer)));
    assert_eq!(machine.mem.peek(config.data_base, Width::Word), Ok(0));
    assert_eq!(machine.pc, config.text_base);
    assert!(machine.program().is_none());
}

fn trap_handler_program() -> Vec<Instr> {
    let mut program = vec![
        lui(T0, 0x400),                            // 0x00
        addi(T0, T0, 0x40),                        // 0x04
        csr(CsrOp::Rw, ZERO, UTVEC, CsrSrc::Reg(T0)), // 0x08
        csr_imm(CsrOp::Rs, USTATUS, 1),            // 0x0C
        Instr::Load { op: LoadOp::Lw, rd: A0, rs1: ZERO, offset: IOffset::new_trunc(0) }, // 0x10
        addi(A7, ZERO, 93),                        // 0x14
        addi(A0, A1, 0),                           // 0x18
        Instr::Ecall,                              // 0x1C
    ];
    program.resize(16, nop());
    program.extend([
        // handler at 0x40: skip the faulting instruction
        csr(CsrOp::Rs, T0, UEPC, CsrSrc::Reg(ZERO)),
        addi(T0, T0, 4),
        csr(CsrOp::Rw, ZERO, UEPC, CsrSrc::Reg(T0)),
        csr(CsrOp::Rs, A1, UCAUSE, CsrSrc::Reg(ZERO)),
        Instr::Uret,
    ]);
    program
}

#[test]
fn test_trap_handler_and_uret() {
    let mut sim = simulator(SimFlags::default(), trap_handler_program());

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::NormalTermination));
    assert_eq!(stop.exit_code, Some(5));

    let machine = sim.lock();
    assert_eq!(machine.csrs.read(UEPC), u64::from(TEXT + 0x14));
    assert_eq!(machine.csrs.read(UTVAL), 0);
    // UIE restored from UPIE, UPIE set
    assert_eq!(machine.csrs.read(USTATUS), 0x11);
}

#[test]
fn test_back_step_across_trap() {
    let mut sim = simulator(SimFlags::default(), trap_handler_program());
    for _ in 0..4 {
        step(&mut sim);
    }
    assert_eq!(sim.lock().pc, TEXT + 0x10);

    // the fault is serviced before the step budget is checked
    step(&mut sim);
    assert_eq!(sim.lock().pc, TEXT + 0x40);
    assert_eq!(sim.lock().csrs.read(UCAUSE), 5);
    assert_eq!(sim.lock().csrs.read(USTATUS), 0x10);
    assert!(!sim.interrupts().has_pending());

    step(&mut sim);
    assert_eq!(sim.lock().pc, TEXT + 0x44);
    assert_eq!(sim.lock().regs.get(T0), Ok(u64::from(TEXT + 0x10)));

    assert!(sim.back_step());
    assert_eq!(sim.lock().pc, TEXT + 0x40);
    assert_eq!(sim.lock().regs.get(T0), Ok(u64::from(TEXT + 0x40)));

    // one step back undoes the faulting load together with entering its handler
    assert!(sim.back_step());
    assert_eq!(sim.lock().pc, TEXT + 0x10);
    assert_eq!(sim.lock().csrs.read(UCAUSE), 0);
    assert_eq!(sim.lock().csrs.read(USTATUS), 1);
    assert!(!sim.interrupts().has_pending());

    step(&mut sim);
    step(&mut sim);
    assert_eq!(sim.lock().pc, TEXT + 0x44);
    assert_eq!(sim.lock().regs.get(T0), Ok(u64::from(TEXT + 0x10)));
}

#[test]
fn test_back_step_unhandled_fault() {
    // no handler: the fault ends the program
    let mut sim = simulator(SimFlags::default(), [
        addi(A0, ZERO, 1),
        Instr::Load { op: LoadOp::Lw, rd: A0, rs1: ZERO, offset: IOffset::new_trunc(0) },
    ]);
    step(&mut sim);
    step(&mut sim);
    assert_eq!(sim.state(), RunState::Terminated);
    assert_eq!(sim.lock().csrs.read(UCAUSE), 5);

    assert!(sim.back_step());
    assert_eq!(sim.state(), RunState::Paused);
    assert_eq!(sim.lock().pc, TEXT + 4);
    assert_eq!(sim.lock().csrs.read(UCAUSE), 0);
    assert!(!sim.interrupts().has_pending());
    assert_eq!(sim.lock().backstepper.len(), 1);
}

#[test]
fn test_back_step_empty() {
    let mut sim = simulator(SimFlags::default(), [addi(A0, ZERO, 1)]);
    assert!(!sim.back_step());

    step(&mut sim);
    assert!(sim.back_step());
    assert!(!sim.back_step());
    assert_eq!(sim.lock().regs.get(A0), Ok(0));
}

#[test]
fn test_timer_interrupt() {
    let mut program = vec![
        lui(T0, 0x400),
        addi(T0, T0, 0x20),
        csr(CsrOp::Rw, ZERO, UTVEC, CsrSrc::Reg(T0)),
        csr_imm(CsrOp::Rs, UIE, 0x10),
        csr_imm(CsrOp::Rs, USTATUS, 1),
        spin(),
    ];
    program.resize(8, nop());
    program.extend([
        // handler at 0x20
        csr(CsrOp::Rs, A0, UCAUSE, CsrSrc::Reg(ZERO)),
        addi(A7, ZERO, 93),
        Instr::Ecall,
    ]);

    let mut sim = simulator(SimFlags::default(), program);
    let mut timer = TimerDevice::new(None, 10..=10);
    timer.enabled = true;
    assert!(sim.lock().mem.devices_mut().add_device(timer, &[]).is_ok());

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::NormalTermination));
    assert_eq!(stop.exit_code, Some(0x8000_0004u32 as i32));
}

#[test]
fn test_disabled_interrupt_stays_pending() {
    let mut sim = simulator(SimFlags::default(), [nop(), nop()]);
    assert!(sim.interrupts().register_timer(3));

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::CliffTermination));
    assert!(sim.interrupts().pending().timer);
    assert_eq!(sim.lock().csrs.read(UIP), 0x10);
}

#[test]
fn test_keyboard_interrupt() {
    let program = [
        lui(T0, 0x400),                            // 0x00
        addi(T0, T0, 0x30),                        // 0x04
        csr(CsrOp::Rw, ZERO, UTVEC, CsrSrc::Reg(T0)), // 0x08
        addi(T0, ZERO, 0x100),                     // 0x0C
        csr(CsrOp::Rs, ZERO, UIE, CsrSrc::Reg(T0)),   // 0x10
        csr_imm(CsrOp::Rs, USTATUS, 1),            // 0x14
        lui(T1, 0xFFFF0),                          // 0x18
        addi(T2, ZERO, 2),                         // 0x1C
        Instr::Store { op: StoreOp::Sw, rs1: T1, rs2: T2, offset: IOffset::new_trunc(0) }, // 0x20
        spin(),                                    // 0x24
        nop(),                                     // 0x28
        nop(),                                     // 0x2C
        Instr::Load { op: LoadOp::Lw, rd: A0, rs1: T1, offset: IOffset::new_trunc(4) }, // 0x30
        addi(A7, ZERO, 93),                        // 0x34
        Instr::Ecall,                              // 0x38
    ];
    let mut sim = simulator(SimFlags::default(), program);
    let keyboard = BufferedKeyboard::default();
    keyboard.get_buffer().write().unwrap().push_back(b'k');
    sim.lock().mem.devices_mut().set_keyboard(keyboard);

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::NormalTermination));
    assert_eq!(stop.exit_code, Some(i32::from(b'k')));
    assert_eq!(sim.lock().csrs.read(UTVAL), 0xFFFF_0000);
}

#[test]
fn test_read_only_csr_write_is_illegal() {
    let instr = csr(CsrOp::Rw, ZERO, CYCLE, CsrSrc::Reg(T0));
    let mut sim = simulator(SimFlags::default(), [instr]);

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::Exception));
    assert_eq!(stop.trap, Some(Trap { error: SimErr::IllegalInstruction(encode(&instr)), pc: TEXT }));
    assert_eq!(sim.lock().csrs.read(UCAUSE), 2);
}

#[test]
fn test_text_write_protection() {
    let program = [
        lui(T0, 0x400),
        Instr::Store { op: StoreOp::Sw, rs1: T0, rs2: ZERO, offset: IOffset::new_trunc(0) },
    ];

    let mut sim = simulator(SimFlags::default(), program);
    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::Exception));
    assert_eq!(stop.trap.map(|t| t.error), Some(SimErr::Store(MemError::TextWriteProtected(TEXT))));

    let mut sim = simulator(SimFlags { self_modifying_code: true, ..Default::default() }, program);
    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::CliffTermination));
    assert_eq!(sim.lock().mem.peek(TEXT, Width::Word), Ok(0));
}

#[test]
fn test_pause_and_stop() {
    let mut sim = simulator(SimFlags::default(), [spin()]);
    let notices = sim.subscribe();

    sim.start(None, &[]).unwrap();
    assert!(matches!(sim.start(None, &[]), Err(ControlError::AlreadyRunning)));
    std::thread::sleep(Duration::from_millis(20));

    sim.pause();
    assert!(!sim.is_running());
    assert_eq!(sim.state(), RunState::Paused);
    assert_eq!(last_stop(&notices).reason, Some(StopReason::Pause));

    sim.start(None, &[]).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    sim.stop();
    assert_eq!(sim.state(), RunState::Terminated);
    assert_eq!(last_stop(&notices).reason, Some(StopReason::Stop));
}

#[test]
fn test_limited_speed_records_history() {
    let mut sim = simulator(SimFlags::default(), [
        addi(A0, ZERO, 1),
        addi(A0, A0, 1),
        addi(A0, A0, 1),
    ]);
    sim.lock().flags.run_speed = RunSpeed::Limited(1000.0);
    let regs = sim.lock().regs.subscribe();

    let stop = run(&mut sim, &[]);
    assert_eq!(stop.reason, Some(StopReason::CliffTermination));
    assert_eq!(stop.run_speed, RunSpeed::Limited(1000.0));
    assert_eq!(sim.lock().backstepper.len(), 3);

    // notices are not coalesced at a limited speed
    let values: Vec<_> = regs.try_iter()
        .filter(|n| n.name == "a0" && n.access == AccessType::Write)
        .map(|n| n.value)
        .collect();
    assert_eq!(values, [1, 2, 3]);

    // back-stepping a terminated program lets it continue
    assert!(sim.back_step());
    assert_eq!(sim.state(), RunState::Paused);
    assert_eq!(sim.lock().regs.get(A0), Ok(2));
}

#[test]
fn test_max_steps_notice() {
    let mut sim = simulator(SimFlags::default(), [nop(), nop(), nop()]);
    let notices = sim.subscribe();
    sim.start(Some(2), &[]).unwrap();
    sim.join();

    let all: Vec<_> = notices.try_iter().collect();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].action, RunAction::Start);
    assert_eq!(all[0].max_steps, Some(2));
    assert_eq!(all[1].reason, Some(StopReason::MaxSteps));
    assert_eq!(all[1].pc, TEXT + 8);
}
