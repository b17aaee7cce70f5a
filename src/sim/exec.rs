//! Instruction semantics.

use crate::ast::encoding::encode;
use crate::ast::reg_consts::A7;
use crate::ast::{
    BranchOp, CsrOp, CsrSrc, FArithOp, FCmpOp, FReg, ImmOp, Instr, LoadOp, Reg, RegOp,
    RoundingMode, StoreOp
};

use super::csr::{fflags, numbers, status};
use super::mem::Width;
use super::syscall::{SyscallEnv, SyscallOutcome};
use super::{nan_box, Machine, SimErr};

const CANONICAL_NAN: u32 = 0x7FC0_0000;

/// What to do after an instruction executes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(super) enum Flow {
    /// Continue to the next instruction.
    Continue,
    /// The program exited with the given code.
    Exit(i32),
    /// The program executed `ebreak`.
    Break,
}

fn is_signaling(f: f32) -> bool {
    f.is_nan() && f.to_bits() & 0x0040_0000 == 0
}

fn canonicalize(f: f32) -> f32 {
    match f.is_nan() {
        true  => f32::from_bits(CANONICAL_NAN),
        false => f,
    }
}

/// Exception flags for a single-precision result computed from `exact`
/// (the same operation carried out in double precision).
fn result_flags(result: f32, exact: f64, operands_finite: bool) -> u64 {
    let mut flags = 0;
    if result.is_infinite() && operands_finite {
        flags |= fflags::OF | fflags::NX;
    } else if result.is_finite() && f64::from(result) != exact {
        flags |= fflags::NX;
        if result.is_subnormal() || result == 0.0 {
            flags |= fflags::UF;
        }
    }
    flags
}

/// Rounds to an integral value with the given (static) rounding mode.
fn round_f64(x: f64, mode: RoundingMode) -> f64 {
    match mode {
        RoundingMode::Rtz => x.trunc(),
        RoundingMode::Rdn => x.floor(),
        RoundingMode::Rup => x.ceil(),
        RoundingMode::Rmm => x.round(),
        RoundingMode::Rne | RoundingMode::Dyn => {
            let floor = x.floor();
            let diff = x - floor;
            match diff.partial_cmp(&0.5) {
                Some(std::cmp::Ordering::Less) => floor,
                Some(std::cmp::Ordering::Greater) => floor + 1.0,
                _ if floor % 2.0 == 0.0 => floor,
                _ => floor + 1.0,
            }
        }
    }
}

fn toward_zero(f: f32) -> f32 {
    f32::from_bits(f.to_bits() - 1)
}
fn away_from_zero(f: f32) -> f32 {
    f32::from_bits(f.to_bits() + 1)
}

/// Converts an integer to single precision with the given (static) rounding mode.
fn int_to_f32(v: f64, mode: RoundingMode) -> f32 {
    let f = v as f32;
    let fv = f64::from(f);
    if fv == v || f == 0.0 {
        return f;
    }

    match mode {
        RoundingMode::Rtz if fv.abs() > v.abs() => toward_zero(f),
        RoundingMode::Rdn if fv > v => if f > 0.0 { toward_zero(f) } else { away_from_zero(f) },
        RoundingMode::Rup if fv < v => if f > 0.0 { away_from_zero(f) } else { toward_zero(f) },
        RoundingMode::Rmm if fv.abs() < v.abs() => {
            // ties go away from zero
            let other = away_from_zero(f);
            match (v - fv).abs() == (f64::from(other) - v).abs() {
                true  => other,
                false => f,
            }
        },
        _ => f,
    }
}

impl Machine {
    fn x(&self, r: Reg) -> u32 {
        self.regs.value_at(usize::from(r)) as u32
    }
    fn set_x(&mut self, r: Reg, value: u32) {
        self.regs.set_at(usize::from(r), u64::from(value), self.backstepper.recorder());
    }
    fn f_bits(&self, r: FReg) -> u32 {
        self.fregs.value_at(usize::from(r)) as u32
    }
    fn f(&self, r: FReg) -> f32 {
        f32::from_bits(self.f_bits(r))
    }
    fn set_f_bits(&mut self, r: FReg, bits: u32) {
        self.fregs.set_at(usize::from(r), nan_box(bits), self.backstepper.recorder());
    }
    fn set_f(&mut self, r: FReg, value: f32) {
        self.set_f_bits(r, canonicalize(value).to_bits());
    }

    fn load(&mut self, addr: u32, width: Width) -> Result<u64, SimErr> {
        self.mem.read(addr, width).map_err(SimErr::Load)
    }
    fn store(&mut self, addr: u32, width: Width, value: u64) -> Result<(), SimErr> {
        self.mem.write(addr, width, value, self.backstepper.recorder())
            .map(|_| ())
            .map_err(SimErr::Store)
    }

    /// Sets floating-point exception flags.
    fn accrue(&mut self, flags: u64) {
        if flags != 0 {
            // fflags is always writable
            let _ = self.csrs.or_register(numbers::FFLAGS, flags, self.backstepper.recorder());
        }
    }

    /// Resolves the dynamic rounding mode.
    fn rounding(&self, rm: RoundingMode, instr: &Instr) -> Result<RoundingMode, SimErr> {
        match rm {
            RoundingMode::Dyn => match RoundingMode::from_bits(self.csrs.read(numbers::FRM) as u32) {
                Some(RoundingMode::Dyn) | None => Err(SimErr::IllegalInstruction(encode(instr))),
                Some(mode) => Ok(mode),
            },
            mode => Ok(mode),
        }
    }

    /// Executes an instruction.
    ///
    /// The PC has already been moved past the instruction.
    pub(super) fn execute(&mut self, instr: Instr) -> Result<Flow, SimErr> {
        let pc = self.pc.wrapping_sub(4);

        match instr {
            Instr::Lui { rd, imm } => self.set_x(rd, imm.get() << 12),
            Instr::Auipc { rd, imm } => self.set_x(rd, pc.wrapping_add(imm.get() << 12)),
            Instr::Jal { rd, offset } => {
                let ret = self.pc;
                self.pc = pc.wrapping_add_signed(offset.get());
                self.set_x(rd, ret);
            },
            Instr::Jalr { rd, rs1, offset } => {
                let ret = self.pc;
                self.pc = self.x(rs1).wrapping_add_signed(offset.get()) & !1;
                self.set_x(rd, ret);
            },
            Instr::Branch { op, rs1, rs2, offset } => {
                let (a, b) = (self.x(rs1), self.x(rs2));
                let taken = match op {
                    BranchOp::Beq  => a == b,
                    BranchOp::Bne  => a != b,
                    BranchOp::Blt  => (a as i32) < (b as i32),
                    BranchOp::Bge  => (a as i32) >= (b as i32),
                    BranchOp::Bltu => a < b,
                    BranchOp::Bgeu => a >= b,
                };
                if taken {
                    self.pc = pc.wrapping_add_signed(offset.get());
                }
            },
            Instr::Load { op, rd, rs1, offset } => {
                let addr = self.x(rs1).wrapping_add_signed(offset.get());
                let value = match op {
                    LoadOp::Lb  => self.load(addr, Width::Byte)? as u8 as i8 as i32 as u32,
                    LoadOp::Lh  => self.load(addr, Width::Half)? as u16 as i16 as i32 as u32,
                    LoadOp::Lw  => self.load(addr, Width::Word)? as u32,
                    LoadOp::Lbu => self.load(addr, Width::Byte)? as u32,
                    LoadOp::Lhu => self.load(addr, Width::Half)? as u32,
                };
                self.set_x(rd, value);
            },
            Instr::Store { op, rs1, rs2, offset } => {
                let addr = self.x(rs1).wrapping_add_signed(offset.get());
                let width = match op {
                    StoreOp::Sb => Width::Byte,
                    StoreOp::Sh => Width::Half,
                    StoreOp::Sw => Width::Word,
                };
                self.store(addr, width, u64::from(self.x(rs2)))?;
            },
            Instr::OpImm { op, rd, rs1, imm } => {
                let a = self.x(rs1);
                let imm = imm.get();
                let shamt = imm as u32 & 0x1F;
                let result = match op {
                    ImmOp::Addi  => a.wrapping_add(imm as u32),
                    ImmOp::Slti  => u32::from((a as i32) < imm),
                    ImmOp::Sltiu => u32::from(a < imm as u32),
                    ImmOp::Xori  => a ^ imm as u32,
                    ImmOp::Ori   => a | imm as u32,
                    ImmOp::Andi  => a & imm as u32,
                    ImmOp::Slli  => a << shamt,
                    ImmOp::Srli  => a >> shamt,
                    ImmOp::Srai  => ((a as i32) >> shamt) as u32,
                };
                self.set_x(rd, result);
            },
            Instr::Op { op, rd, rs1, rs2 } => {
                let (a, b) = (self.x(rs1), self.x(rs2));
                let (sa, sb) = (a as i32, b as i32);
                let result = match op {
                    RegOp::Add    => a.wrapping_add(b),
                    RegOp::Sub    => a.wrapping_sub(b),
                    RegOp::Sll    => a << (b & 0x1F),
                    RegOp::Slt    => u32::from(sa < sb),
                    RegOp::Sltu   => u32::from(a < b),
                    RegOp::Xor    => a ^ b,
                    RegOp::Srl    => a >> (b & 0x1F),
                    RegOp::Sra    => (sa >> (b & 0x1F)) as u32,
                    RegOp::Or     => a | b,
                    RegOp::And    => a & b,
                    RegOp::Mul    => a.wrapping_mul(b),
                    RegOp::Mulh   => ((i64::from(sa) * i64::from(sb)) >> 32) as u32,
                    RegOp::Mulhsu => ((i64::from(sa) * i64::from(b)) >> 32) as u32,
                    RegOp::Mulhu  => ((u64::from(a) * u64::from(b)) >> 32) as u32,
                    RegOp::Div    => if b == 0 { u32::MAX } else { sa.wrapping_div(sb) as u32 },
                    RegOp::Divu   => if b == 0 { u32::MAX } else { a / b },
                    RegOp::Rem    => if b == 0 { a } else { sa.wrapping_rem(sb) as u32 },
                    RegOp::Remu   => if b == 0 { a } else { a % b },
                };
                self.set_x(rd, result);
            },
            Instr::Fence => {},
            Instr::Ecall => {
                let number = self.x(A7);
                let mut env = SyscallEnv {
                    regs: &mut self.regs,
                    fregs: &mut self.fregs,
                    mem: &mut self.mem,
                    rec: self.backstepper.recorder(),
                };
                match self.syscalls.handle(number, &mut env)? {
                    SyscallOutcome::Continue => {},
                    SyscallOutcome::Exit(code) => return Ok(Flow::Exit(code)),
                }
            },
            Instr::Ebreak => return Ok(Flow::Break),
            Instr::Uret => {
                let ustatus = self.csrs.read(numbers::USTATUS);
                let uie = match ustatus & status::UPIE != 0 {
                    true  => status::UIE,
                    false => 0,
                };
                let new_status = ustatus & !status::UIE | uie | status::UPIE;
                self.csrs.update_backdoor(numbers::USTATUS, new_status, self.backstepper.recorder());
                self.pc = self.csrs.read(numbers::UEPC) as u32;
            },
            Instr::Csr { op, rd, csr, src } => {
                let number = csr.get();
                let operand = match src {
                    CsrSrc::Reg(r) => self.x(r),
                    CsrSrc::Imm(i) => i.get(),
                };
                let old = self.csrs.read(number) as u32;
                let new = match op {
                    CsrOp::Rw => Some(operand),
                    CsrOp::Rs => (!src.is_zero()).then_some(old | operand),
                    CsrOp::Rc => (!src.is_zero()).then_some(old & !operand),
                };

                if let Some(value) = new {
                    self.csrs.update(number, u64::from(value), self.backstepper.recorder())
                        .map_err(|_| SimErr::IllegalInstruction(encode(&instr)))?;
                }
                self.set_x(rd, old);
            },
            Instr::Flw { rd, rs1, offset } => {
                let addr = self.x(rs1).wrapping_add_signed(offset.get());
                let bits = self.load(addr, Width::Word)? as u32;
                self.set_f_bits(rd, bits);
            },
            Instr::Fsw { rs1, rs2, offset } => {
                let addr = self.x(rs1).wrapping_add_signed(offset.get());
                self.store(addr, Width::Word, u64::from(self.f_bits(rs2)))?;
            },
            Instr::FArith { op, rd, rs1, rs2, rm } => {
                self.rounding(rm, &instr)?;
                let (a, b) = (self.f(rs1), self.f(rs2));
                let (da, db) = (f64::from(a), f64::from(b));
                let (result, exact) = match op {
                    FArithOp::Add => (a + b, da + db),
                    FArithOp::Sub => (a - b, da - db),
                    FArithOp::Mul => (a * b, da * db),
                    FArithOp::Div => (a / b, da / db),
                };

                let mut flags = 0;
                if is_signaling(a) || is_signaling(b) || (result.is_nan() && !a.is_nan() && !b.is_nan()) {
                    flags |= fflags::NV;
                } else if op == FArithOp::Div && b == 0.0 && a.is_finite() && a != 0.0 {
                    flags |= fflags::DZ;
                } else {
                    flags |= result_flags(result, exact, a.is_finite() && b.is_finite());
                }
                self.accrue(flags);
                self.set_f(rd, result);
            },
            Instr::FSqrt { rd, rs1, rm } => {
                self.rounding(rm, &instr)?;
                let a = self.f(rs1);
                let result = a.sqrt();
                let flags = match is_signaling(a) || (a < 0.0) {
                    true  => fflags::NV,
                    false => result_flags(result, f64::from(a).sqrt(), a.is_finite()),
                };
                self.accrue(flags);
                self.set_f(rd, result);
            },
            Instr::FMinMax { max, rd, rs1, rs2 } => {
                let (a, b) = (self.f(rs1), self.f(rs2));
                if is_signaling(a) || is_signaling(b) {
                    self.accrue(fflags::NV);
                }
                let result = match (a.is_nan(), b.is_nan()) {
                    (true, true)  => f32::NAN,
                    (true, false) => b,
                    (false, true) => a,
                    // -0.0 is considered less than +0.0
                    _ if max => if a > b || (a == b && b.is_sign_negative()) { a } else { b },
                    _ => if a < b || (a == b && a.is_sign_negative()) { a } else { b },
                };
                self.set_f(rd, result);
            },
            Instr::FCmp { op, rd, rs1, rs2 } => {
                let (a, b) = (self.f(rs1), self.f(rs2));
                let invalid = match op {
                    FCmpOp::Eq => is_signaling(a) || is_signaling(b),
                    FCmpOp::Lt | FCmpOp::Le => a.is_nan() || b.is_nan(),
                };
                if invalid {
                    self.accrue(fflags::NV);
                }
                let result = match op {
                    FCmpOp::Eq => a == b,
                    FCmpOp::Lt => a < b,
                    FCmpOp::Le => a <= b,
                };
                self.set_x(rd, u32::from(result));
            },
            Instr::FCvtToInt { signed, rd, rs1, rm } => {
                let mode = self.rounding(rm, &instr)?;
                let a = f64::from(self.f(rs1));
                let rounded = round_f64(a, mode);

                let (min, max) = match signed {
                    true  => (f64::from(i32::MIN), f64::from(i32::MAX)),
                    false => (0.0, f64::from(u32::MAX)),
                };
                let (result, flags) = if a.is_nan() {
                    (if signed { i32::MAX as u32 } else { u32::MAX }, fflags::NV)
                } else if rounded > max {
                    (if signed { i32::MAX as u32 } else { u32::MAX }, fflags::NV)
                } else if rounded < min {
                    (if signed { i32::MIN as u32 } else { 0 }, fflags::NV)
                } else {
                    let value = if signed { rounded as i32 as u32 } else { rounded as u32 };
                    (value, if rounded != a { fflags::NX } else { 0 })
                };
                self.accrue(flags);
                self.set_x(rd, result);
            },
            Instr::FCvtFromInt { signed, rd, rs1, rm } => {
                let mode = self.rounding(rm, &instr)?;
                let x = self.x(rs1);
                let v = match signed {
                    true  => f64::from(x as i32),
                    false => f64::from(x),
                };
                let result = int_to_f32(v, mode);
                if f64::from(result) != v {
                    self.accrue(fflags::NX);
                }
                self.set_f(rd, result);
            },
            Instr::FMvToInt { rd, rs1 } => {
                let bits = self.f_bits(rs1);
                self.set_x(rd, bits);
            },
            Instr::FMvFromInt { rd, rs1 } => {
                let bits = self.x(rs1);
                self.set_f_bits(rd, bits);
            },
        }

        Ok(Flow::Continue)
    }
}
