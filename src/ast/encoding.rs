//! Conversion between [`Instr`] and 32-bit RISC-V machine words.
//!
//! The simulator keeps the machine code of every loaded statement in the text segment,
//! so programs can read their own code and (if enabled) rewrite it.
//! Words that were rewritten are decoded again with [`decode`] before they execute.
//!
//! ```
//! use riscv_ensemble::ast::encoding::{decode, encode};
//! use riscv_ensemble::ast::{Instr, LoadOp, IOffset};
//! use riscv_ensemble::ast::reg_consts::{A0, T0};
//!
//! let lw = Instr::Load { op: LoadOp::Lw, rd: A0, rs1: T0, offset: IOffset::new_trunc(0) };
//! assert_eq!(encode(&lw), 0x0002_a503);
//! assert_eq!(decode(0x0002_a503), Some(lw));
//! ```

use super::{BranchOp, CsrOp, CsrSrc, FArithOp, FCmpOp, FReg, IOffset, ImmOp, Instr, LoadOp, Offset, Reg, RegOp, RoundingMode, StoreOp, UOffset};

const OP_LUI: u32      = 0b0110111;
const OP_AUIPC: u32    = 0b0010111;
const OP_JAL: u32      = 0b1101111;
const OP_JALR: u32     = 0b1100111;
const OP_BRANCH: u32   = 0b1100011;
const OP_LOAD: u32     = 0b0000011;
const OP_STORE: u32    = 0b0100011;
const OP_IMM: u32      = 0b0010011;
const OP_REG: u32      = 0b0110011;
const OP_MISC_MEM: u32 = 0b0001111;
const OP_SYSTEM: u32   = 0b1110011;
const OP_LOAD_FP: u32  = 0b0000111;
const OP_STORE_FP: u32 = 0b0100111;
const OP_FP: u32       = 0b1010011;

const ECALL: u32  = 0x0000_0073;
const EBREAK: u32 = 0x0010_0073;
const URET: u32   = 0x0020_0073;
const FENCE: u32  = 0x0ff0_000f;

fn r_type(opcode: u32, rd: u32, funct3: u32, rs1: u32, rs2: u32, funct7: u32) -> u32 {
    funct7 << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}
fn i_type(opcode: u32, rd: u32, funct3: u32, rs1: u32, imm: i32) -> u32 {
    (imm as u32 & 0xFFF) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}
fn s_type(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (imm >> 5 & 0x7F) << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | (imm & 0x1F) << 7 | opcode
}
fn b_type(funct3: u32, rs1: u32, rs2: u32, offset: i32) -> u32 {
    let o = offset as u32;
    (o >> 12 & 1) << 31
        | (o >> 5 & 0x3F) << 25
        | rs2 << 20
        | rs1 << 15
        | funct3 << 12
        | (o >> 1 & 0xF) << 8
        | (o >> 11 & 1) << 7
        | OP_BRANCH
}
fn j_type(rd: u32, offset: i32) -> u32 {
    let o = offset as u32;
    (o >> 20 & 1) << 31
        | (o >> 1 & 0x3FF) << 21
        | (o >> 11 & 1) << 20
        | (o >> 12 & 0xFF) << 12
        | rd << 7
        | OP_JAL
}

fn reg(r: Reg) -> u32 {
    u32::from(r.0)
}
fn freg(r: FReg) -> u32 {
    u32::from(r.0)
}

/// Encodes an instruction into its machine code.
///
/// Branch and jump offsets are stored without their lowest bit,
/// as they are always multiples of 2.
pub fn encode(instr: &Instr) -> u32 {
    match *instr {
        Instr::Lui { rd, imm }   => imm.get() << 12 | reg(rd) << 7 | OP_LUI,
        Instr::Auipc { rd, imm } => imm.get() << 12 | reg(rd) << 7 | OP_AUIPC,
        Instr::Jal { rd, offset } => j_type(reg(rd), offset.get()),
        Instr::Jalr { rd, rs1, offset } => i_type(OP_JALR, reg(rd), 0, reg(rs1), offset.get()),
        Instr::Branch { op, rs1, rs2, offset } => {
            let funct3 = match op {
                BranchOp::Beq  => 0b000,
                BranchOp::Bne  => 0b001,
                BranchOp::Blt  => 0b100,
                BranchOp::Bge  => 0b101,
                BranchOp::Bltu => 0b110,
                BranchOp::Bgeu => 0b111,
            };
            b_type(funct3, reg(rs1), reg(rs2), offset.get())
        },
        Instr::Load { op, rd, rs1, offset } => {
            let funct3 = match op {
                LoadOp::Lb  => 0b000,
                LoadOp::Lh  => 0b001,
                LoadOp::Lw  => 0b010,
                LoadOp::Lbu => 0b100,
                LoadOp::Lhu => 0b101,
            };
            i_type(OP_LOAD, reg(rd), funct3, reg(rs1), offset.get())
        },
        Instr::Store { op, rs1, rs2, offset } => {
            let funct3 = match op {
                StoreOp::Sb => 0b000,
                StoreOp::Sh => 0b001,
                StoreOp::Sw => 0b010,
            };
            s_type(OP_STORE, funct3, reg(rs1), reg(rs2), offset.get())
        },
        Instr::OpImm { op, rd, rs1, imm } => {
            let shamt = imm.get() & 0x1F;
            let (funct3, imm) = match op {
                ImmOp::Addi  => (0b000, imm.get()),
                ImmOp::Slti  => (0b010, imm.get()),
                ImmOp::Sltiu => (0b011, imm.get()),
                ImmOp::Xori  => (0b100, imm.get()),
                ImmOp::Ori   => (0b110, imm.get()),
                ImmOp::Andi  => (0b111, imm.get()),
                ImmOp::Slli  => (0b001, shamt),
                ImmOp::Srli  => (0b101, shamt),
                ImmOp::Srai  => (0b101, shamt | 0x400),
            };
            i_type(OP_IMM, reg(rd), funct3, reg(rs1), imm)
        },
        Instr::Op { op, rd, rs1, rs2 } => {
            let (funct7, funct3) = match op {
                RegOp::Add    => (0x00, 0b000),
                RegOp::Sub    => (0x20, 0b000),
                RegOp::Sll    => (0x00, 0b001),
                RegOp::Slt    => (0x00, 0b010),
                RegOp::Sltu   => (0x00, 0b011),
                RegOp::Xor    => (0x00, 0b100),
                RegOp::Srl    => (0x00, 0b101),
                RegOp::Sra    => (0x20, 0b101),
                RegOp::Or     => (0x00, 0b110),
                RegOp::And    => (0x00, 0b111),
                RegOp::Mul    => (0x01, 0b000),
                RegOp::Mulh   => (0x01, 0b001),
                RegOp::Mulhsu => (0x01, 0b010),
                RegOp::Mulhu  => (0x01, 0b011),
                RegOp::Div    => (0x01, 0b100),
                RegOp::Divu   => (0x01, 0b101),
                RegOp::Rem    => (0x01, 0b110),
                RegOp::Remu   => (0x01, 0b111),
            };
            r_type(OP_REG, reg(rd), funct3, reg(rs1), reg(rs2), funct7)
        },
        Instr::Fence  => FENCE,
        Instr::Ecall  => ECALL,
        Instr::Ebreak => EBREAK,
        Instr::Uret   => URET,
        Instr::Csr { op, rd, csr, src } => {
            let base = match op {
                CsrOp::Rw => 0b001,
                CsrOp::Rs => 0b010,
                CsrOp::Rc => 0b011,
            };
            let (funct3, rs1) = match src {
                CsrSrc::Reg(r) => (base, reg(r)),
                CsrSrc::Imm(i) => (base | 0b100, i.get()),
            };
            csr.get() << 20 | rs1 << 15 | funct3 << 12 | reg(rd) << 7 | OP_SYSTEM
        },
        Instr::Flw { rd, rs1, offset }  => i_type(OP_LOAD_FP, freg(rd), 0b010, reg(rs1), offset.get()),
        Instr::Fsw { rs1, rs2, offset } => s_type(OP_STORE_FP, 0b010, reg(rs1), freg(rs2), offset.get()),
        Instr::FArith { op, rd, rs1, rs2, rm } => {
            let funct7 = match op {
                FArithOp::Add => 0x00,
                FArithOp::Sub => 0x04,
                FArithOp::Mul => 0x08,
                FArithOp::Div => 0x0C,
            };
            r_type(OP_FP, freg(rd), rm.bits(), freg(rs1), freg(rs2), funct7)
        },
        Instr::FSqrt { rd, rs1, rm } => r_type(OP_FP, freg(rd), rm.bits(), freg(rs1), 0, 0x2C),
        Instr::FMinMax { max, rd, rs1, rs2 } => r_type(OP_FP, freg(rd), u32::from(max), freg(rs1), freg(rs2), 0x14),
        Instr::FCmp { op, rd, rs1, rs2 } => {
            let funct3 = match op {
                FCmpOp::Le => 0b000,
                FCmpOp::Lt => 0b001,
                FCmpOp::Eq => 0b010,
            };
            r_type(OP_FP, reg(rd), funct3, freg(rs1), freg(rs2), 0x50)
        },
        Instr::FCvtToInt { signed, rd, rs1, rm }   => r_type(OP_FP, reg(rd), rm.bits(), freg(rs1), u32::from(!signed), 0x60),
        Instr::FCvtFromInt { signed, rd, rs1, rm } => r_type(OP_FP, freg(rd), rm.bits(), reg(rs1), u32::from(!signed), 0x68),
        Instr::FMvToInt { rd, rs1 }   => r_type(OP_FP, reg(rd), 0, freg(rs1), 0, 0x70),
        Instr::FMvFromInt { rd, rs1 } => r_type(OP_FP, freg(rd), 0, reg(rs1), 0, 0x78),
    }
}

/// Decodes a machine word into an instruction.
///
/// This returns `None` if the word is not an instruction this simulator implements.
pub fn decode(word: u32) -> Option<Instr> {
    let opcode = word & 0x7F;
    let rd     = ((word >> 7) & 0x1F) as u8;
    let funct3 = (word >> 12) & 0x7;
    let rs1    = ((word >> 15) & 0x1F) as u8;
    let rs2    = ((word >> 20) & 0x1F) as u8;
    let funct7 = word >> 25;

    let i_imm = IOffset::<12>::new_trunc((word as i32) >> 20);
    let s_imm = IOffset::<12>::new_trunc(((word as i32) >> 25) << 5 | ((word >> 7) & 0x1F) as i32);

    let instr = match opcode {
        OP_LUI   => Instr::Lui { rd: Reg(rd), imm: UOffset::new_trunc(word >> 12) },
        OP_AUIPC => Instr::Auipc { rd: Reg(rd), imm: UOffset::new_trunc(word >> 12) },
        OP_JAL => {
            let offset = ((word >> 31) & 1) << 20
                | ((word >> 12) & 0xFF) << 12
                | ((word >> 20) & 1) << 11
                | ((word >> 21) & 0x3FF) << 1;
            Instr::Jal { rd: Reg(rd), offset: Offset::new_trunc(offset as i32) }
        },
        OP_JALR if funct3 == 0 => Instr::Jalr { rd: Reg(rd), rs1: Reg(rs1), offset: i_imm },
        OP_BRANCH => {
            let op = match funct3 {
                0b000 => BranchOp::Beq,
                0b001 => BranchOp::Bne,
                0b100 => BranchOp::Blt,
                0b101 => BranchOp::Bge,
                0b110 => BranchOp::Bltu,
                0b111 => BranchOp::Bgeu,
                _ => return None
            };
            let offset = ((word >> 31) & 1) << 12
                | ((word >> 7) & 1) << 11
                | ((word >> 25) & 0x3F) << 5
                | ((word >> 8) & 0xF) << 1;
            Instr::Branch { op, rs1: Reg(rs1), rs2: Reg(rs2), offset: Offset::new_trunc(offset as i32) }
        },
        OP_LOAD => {
            let op = match funct3 {
                0b000 => LoadOp::Lb,
                0b001 => LoadOp::Lh,
                0b010 => LoadOp::Lw,
                0b100 => LoadOp::Lbu,
                0b101 => LoadOp::Lhu,
                _ => return None
            };
            Instr::Load { op, rd: Reg(rd), rs1: Reg(rs1), offset: i_imm }
        },
        OP_STORE => {
            let op = match funct3 {
                0b000 => StoreOp::Sb,
                0b001 => StoreOp::Sh,
                0b010 => StoreOp::Sw,
                _ => return None
            };
            Instr::Store { op, rs1: Reg(rs1), rs2: Reg(rs2), offset: s_imm }
        },
        OP_IMM => {
            let shamt = IOffset::new_trunc(i32::from(rs2));
            let (op, imm) = match (funct3, funct7) {
                (0b000, _) => (ImmOp::Addi, i_imm),
                (0b010, _) => (ImmOp::Slti, i_imm),
                (0b011, _) => (ImmOp::Sltiu, i_imm),
                (0b100, _) => (ImmOp::Xori, i_imm),
                (0b110, _) => (ImmOp::Ori, i_imm),
                (0b111, _) => (ImmOp::Andi, i_imm),
                (0b001, 0x00) => (ImmOp::Slli, shamt),
                (0b101, 0x00) => (ImmOp::Srli, shamt),
                (0b101, 0x20) => (ImmOp::Srai, shamt),
                _ => return None
            };
            Instr::OpImm { op, rd: Reg(rd), rs1: Reg(rs1), imm }
        },
        OP_REG => {
            let op = match (funct7, funct3) {
                (0x00, 0b000) => RegOp::Add,
                (0x20, 0b000) => RegOp::Sub,
                (0x00, 0b001) => RegOp::Sll,
                (0x00, 0b010) => RegOp::Slt,
                (0x00, 0b011) => RegOp::Sltu,
                (0x00, 0b100) => RegOp::Xor,
                (0x00, 0b101) => RegOp::Srl,
                (0x20, 0b101) => RegOp::Sra,
                (0x00, 0b110) => RegOp::Or,
                (0x00, 0b111) => RegOp::And,
                (0x01, 0b000) => RegOp::Mul,
                (0x01, 0b001) => RegOp::Mulh,
                (0x01, 0b010) => RegOp::Mulhsu,
                (0x01, 0b011) => RegOp::Mulhu,
                (0x01, 0b100) => RegOp::Div,
                (0x01, 0b101) => RegOp::Divu,
                (0x01, 0b110) => RegOp::Rem,
                (0x01, 0b111) => RegOp::Remu,
                _ => return None
            };
            Instr::Op { op, rd: Reg(rd), rs1: Reg(rs1), rs2: Reg(rs2) }
        },
        OP_MISC_MEM if funct3 == 0 => Instr::Fence,
        OP_SYSTEM => match word {
            ECALL  => Instr::Ecall,
            EBREAK => Instr::Ebreak,
            URET   => Instr::Uret,
            _ => {
                let op = match funct3 & 0b011 {
                    0b01 => CsrOp::Rw,
                    0b10 => CsrOp::Rs,
                    0b11 => CsrOp::Rc,
                    _ => return None
                };
                let src = match funct3 & 0b100 != 0 {
                    true  => CsrSrc::Imm(UOffset::new_trunc(u32::from(rs1))),
                    false => CsrSrc::Reg(Reg(rs1)),
                };
                Instr::Csr { op, rd: Reg(rd), csr: UOffset::new_trunc(word >> 20), src }
            }
        },
        OP_LOAD_FP if funct3 == 0b010 => Instr::Flw { rd: FReg(rd), rs1: Reg(rs1), offset: i_imm },
        OP_STORE_FP if funct3 == 0b010 => Instr::Fsw { rs1: Reg(rs1), rs2: FReg(rs2), offset: s_imm },
        OP_FP => decode_fp(funct7, funct3, rd, rs1, rs2)?,
        _ => return None
    };

    Some(instr)
}

fn decode_fp(funct7: u32, funct3: u32, rd: u8, rs1: u8, rs2: u8) -> Option<Instr> {
    let rm = || RoundingMode::from_bits(funct3);

    let instr = match funct7 {
        0x00 => Instr::FArith { op: FArithOp::Add, rd: FReg(rd), rs1: FReg(rs1), rs2: FReg(rs2), rm: rm()? },
        0x04 => Instr::FArith { op: FArithOp::Sub, rd: FReg(rd), rs1: FReg(rs1), rs2: FReg(rs2), rm: rm()? },
        0x08 => Instr::FArith { op: FArithOp::Mul, rd: FReg(rd), rs1: FReg(rs1), rs2: FReg(rs2), rm: rm()? },
        0x0C => Instr::FArith { op: FArithOp::Div, rd: FReg(rd), rs1: FReg(rs1), rs2: FReg(rs2), rm: rm()? },
        0x2C if rs2 == 0 => Instr::FSqrt { rd: FReg(rd), rs1: FReg(rs1), rm: rm()? },
        0x14 if funct3 <= 1 => Instr::FMinMax { max: funct3 == 1, rd: FReg(rd), rs1: FReg(rs1), rs2: FReg(rs2) },
        0x50 => {
            let op = match funct3 {
                0b000 => FCmpOp::Le,
                0b001 => FCmpOp::Lt,
                0b010 => FCmpOp::Eq,
                _ => return None
            };
            Instr::FCmp { op, rd: Reg(rd), rs1: FReg(rs1), rs2: FReg(rs2) }
        },
        0x60 if rs2 <= 1 => Instr::FCvtToInt { signed: rs2 == 0, rd: Reg(rd), rs1: FReg(rs1), rm: rm()? },
        0x68 if rs2 <= 1 => Instr::FCvtFromInt { signed: rs2 == 0, rd: FReg(rd), rs1: Reg(rs1), rm: rm()? },
        0x70 if rs2 == 0 && funct3 == 0 => Instr::FMvToInt { rd: Reg(rd), rs1: FReg(rs1) },
        0x78 if rs2 == 0 && funct3 == 0 => Instr::FMvFromInt { rd: FReg(rd), rs1: Reg(rs1) },
        _ => return None
    };

    Some(instr)
}
