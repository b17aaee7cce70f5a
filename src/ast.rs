//! Components relating to the decoded instructions the simulator executes.
//!
//! The simulator core does not parse assembly. Instead, a loader hands it
//! already-decoded instructions, which are represented here:
//! - [`Reg`] and [`FReg`] (integer and floating-point register operands),
//! - [`Offset`] (bit-width-checked immediates and offsets),
//! - [`Instr`] (a single decoded RV32 instruction),
//! - and [`encoding`] (conversion between [`Instr`] and 32-bit machine words).

pub mod encoding;

use std::fmt::Write as _;
use offset_base::OffsetBacking;

/// An integer (general-purpose) register. Must be between 0 and 31.
///
/// This `Reg` struct can either be constructed by selecting a register from [`reg_consts`],
/// or by using [`Reg::try_from`].
///
/// ## Examples
///
/// ```text
/// addi a0, zero, 5
///      ~~  ~~~~
/// lw t1, 8(sp)
///    ~~    ~~
/// ```
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct Reg(pub(crate) u8);

/// A floating-point register. Must be between 0 and 31.
///
/// This can be constructed from [`freg_consts`] or with [`FReg::try_from`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct FReg(pub(crate) u8);

/// ABI names of the integer registers, indexed by register number.
pub const GPR_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2",
    "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7",
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];
/// ABI names of the floating-point registers, indexed by register number.
pub const FPR_NAMES: [&str; 32] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7",
    "fs0", "fs1", "fa0", "fa1", "fa2", "fa3", "fa4", "fa5",
    "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7",
    "fs8", "fs9", "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

macro_rules! reg_consts {
    ($Reg:ident: $($name:ident = $n:literal),* $(,)?) => {
        $(
            #[doc = concat!("The `", stringify!($name), "` register (number ", stringify!($n), ").")]
            pub const $name: $Reg = $Reg($n);
        )*
    }
}

/// Integer register constants, named by their ABI names.
pub mod reg_consts {
    use super::Reg;

    reg_consts! { Reg:
        ZERO = 0, RA = 1, SP = 2, GP = 3, TP = 4, T0 = 5, T1 = 6, T2 = 7,
        S0 = 8, S1 = 9, A0 = 10, A1 = 11, A2 = 12, A3 = 13, A4 = 14, A5 = 15,
        A6 = 16, A7 = 17, S2 = 18, S3 = 19, S4 = 20, S5 = 21, S6 = 22, S7 = 23,
        S8 = 24, S9 = 25, S10 = 26, S11 = 27, T3 = 28, T4 = 29, T5 = 30, T6 = 31,
    }
}
/// Floating-point register constants, named by their ABI names.
pub mod freg_consts {
    use super::FReg;

    reg_consts! { FReg:
        FT0 = 0, FT1 = 1, FT2 = 2, FT3 = 3, FT4 = 4, FT5 = 5, FT6 = 6, FT7 = 7,
        FS0 = 8, FS1 = 9, FA0 = 10, FA1 = 11, FA2 = 12, FA3 = 13, FA4 = 14, FA5 = 15,
        FA6 = 16, FA7 = 17, FS2 = 18, FS3 = 19, FS4 = 20, FS5 = 21, FS6 = 22, FS7 = 23,
        FS8 = 24, FS9 = 25, FS10 = 26, FS11 = 27, FT8 = 28, FT9 = 29, FT10 = 30, FT11 = 31,
    }
}

macro_rules! impl_reg {
    ($Reg:ident, $names:ident) => {
        impl $Reg {
            /// Gets the register number. This is always between 0 and 31.
            pub fn reg_no(self) -> u8 {
                self.0
            }
            /// Gets the ABI name of this register.
            pub fn name(self) -> &'static str {
                $names[usize::from(self.0)]
            }
        }
        impl std::fmt::Display for $Reg {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
        impl From<$Reg> for usize {
            // Used for indexing into the register files.
            fn from(value: $Reg) -> Self {
                usize::from(value.0)
            }
        }
        impl TryFrom<u8> for $Reg {
            type Error = OffsetNewErr;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    0..=31 => Ok($Reg(value)),
                    _      => Err(OffsetNewErr::CannotFitUnsigned(5)),
                }
            }
        }
    }
}
impl_reg!(Reg, GPR_NAMES);
impl_reg!(FReg, FPR_NAMES);

/// A value representing a signed offset or a signed immediate value.
///
/// `N` indicates the maximum bit size of this offset/immediate value.
///
/// ## Examples
///
/// `IOffset<12>` is used to represent I-type immediates:
///
/// ```text
/// addi a0, a0, -1
///              ~~
/// lw a0, 8(sp)
///        ~
/// ```
///
/// `IOffset<13>` and `IOffset<21>` represent branch and jump offsets respectively.
pub type IOffset<const N: u32> = Offset<i32, N>;
/// A value representing an unsigned immediate (used for `lui`/`auipc`, shift amounts, and CSR immediates).
///
/// ## Examples
///
/// ```text
/// lui a0, 0x10010
///         ~~~~~~~
/// csrrsi zero, ustatus, 1
///                       ~
/// ```
pub type UOffset<const N: u32> = Offset<u32, N>;

/// A value representing an offset or an immediate value.
///
/// The `OFF` type represents the backing type of this offset.
/// The signedness of this offset type is dependent on the signedness of the `OFF` type:
/// - `Offset<i32, _>`: signed offset (also aliased as [`IOffset`])
/// - `Offset<u32, _>`: unsigned offset (also aliased as [`UOffset`])
///
/// `N` indicates the maximum bit size of this offset/immediate value.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Offset<OFF, const N: u32>(OFF);

impl<OFF: std::fmt::Display, const N: u32> std::fmt::Display for Offset<OFF, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl<OFF: std::fmt::LowerHex, const N: u32> std::fmt::LowerHex for Offset<OFF, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        self.0.fmt(f)
    }
}

/// The errors that can result from calling [`Offset::new`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, thiserror::Error)]
pub enum OffsetNewErr {
    /// The provided offset cannot fit an unsigned integer of the given bitsize.
    #[error("value is too big for unsigned {0}-bit integer")]
    CannotFitUnsigned(u32),
    /// The provided offset cannot fit a signed integer of the given bitsize.
    #[error("value is too big for signed {0}-bit integer")]
    CannotFitSigned(u32)
}

mod offset_base {
    use super::OffsetNewErr;

    /// Any type that could store a value for [`Offset`].
    ///
    /// [`Offset`]: super::Offset
    pub trait OffsetBacking: Copy + Eq {
        /// How many bits are contained within this backing.
        const BITS: u32;

        /// Truncates the given value to the provided `bit_size`.
        ///
        /// This bit size is always known to be at most BITS.
        fn truncate(self, bit_size: u32) -> Self;

        /// The error to raise if a given value doesn't match
        /// its provided value when truncated to a given `bit_size`.
        fn does_not_fit_error(bit_size: u32) -> OffsetNewErr;
    }

    macro_rules! impl_offset_backing_for_ints {
        ($($Int:ty: $Err:ident),*) => {
            $(
                impl OffsetBacking for $Int {
                    const BITS: u32 = Self::BITS;

                    fn truncate(self, bit_size: u32) -> Self {
                        match Self::BITS - bit_size {
                            0 => self,
                            s => (self << s) >> s
                        }
                    }

                    fn does_not_fit_error(bit_size: u32) -> OffsetNewErr {
                        OffsetNewErr::$Err(bit_size)
                    }
                }
            )*
        }
    }
    impl_offset_backing_for_ints! {
        u32: CannotFitUnsigned,
        i32: CannotFitSigned
    }
}

impl<OFF: OffsetBacking, const N: u32> Offset<OFF, N> {
    /// Creates a new offset value.
    /// This must fit within `N` bits of the representation, otherwise an error is raised.
    ///
    /// # Examples
    ///
    /// ```
    /// # use riscv_ensemble::ast::Offset;
    /// #
    /// // Signed:
    /// assert!(Offset::<i32, 12>::new(-2048).is_ok());
    /// assert!(Offset::<i32, 12>::new(2047).is_ok());
    /// assert!(Offset::<i32, 12>::new(2048).is_err());
    ///
    /// // Unsigned:
    /// assert!(Offset::<u32, 5>::new(31).is_ok());
    /// assert!(Offset::<u32, 5>::new(32).is_err());
    /// ```
    ///
    /// # Panics
    ///
    /// This will panic if `N` is larger than the offset backing (e.g., for backing `i32`, larger than 32).
    pub fn new(n: OFF) -> Result<Self, OffsetNewErr> {
        assert!(N <= OFF::BITS, "bit size {N} exceeds size of backing ({})", OFF::BITS);
        match n == n.truncate(N) {
            true  => Ok(Offset(n)),
            false => Err(OFF::does_not_fit_error(N)),
        }
    }

    /// Creates a new offset by extending the first N bits of the integer,
    /// and discarding the rest.
    ///
    /// The extension is sign-extended if the offset's backing is signed,
    /// and zero-extended if the offset's backing is unsigned.
    ///
    /// ```
    /// # use riscv_ensemble::ast::Offset;
    /// #
    /// assert_eq!(Offset::<i32, 12>::new_trunc(0xFFF).get(), -1);
    /// assert_eq!(Offset::<u32, 5>::new_trunc(33).get(), 1);
    /// ```
    pub fn new_trunc(n: OFF) -> Self {
        assert!(N <= OFF::BITS, "bit size {N} exceeds size of backing ({})", OFF::BITS);
        Self(n.truncate(N))
    }

    /// Gets the value of the offset.
    pub fn get(&self) -> OFF {
        self.0
    }
}

/// Branch conditions (`B`-type instructions).
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum BranchOp { Beq, Bne, Blt, Bge, Bltu, Bgeu }

/// Loads (`lb`, `lh`, `lw`, `lbu`, `lhu`).
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum LoadOp { Lb, Lh, Lw, Lbu, Lhu }

/// Stores (`sb`, `sh`, `sw`).
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum StoreOp { Sb, Sh, Sw }

/// Register-immediate ALU operations.
///
/// Shift operations only use the low 5 bits of the immediate.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ImmOp { Addi, Slti, Sltiu, Xori, Ori, Andi, Slli, Srli, Srai }

/// Register-register ALU operations, including the `M` extension.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RegOp {
    Add, Sub, Sll, Slt, Sltu, Xor, Srl, Sra, Or, And,
    Mul, Mulh, Mulhsu, Mulhu, Div, Divu, Rem, Remu
}

/// CSR read-modify-write operations (`csrrw`, `csrrs`, `csrrc`).
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum CsrOp { Rw, Rs, Rc }

/// The source operand of a CSR instruction.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum CsrSrc {
    /// The register form (`csrrw`, `csrrs`, `csrrc`).
    Reg(Reg),
    /// The immediate form (`csrrwi`, `csrrsi`, `csrrci`).
    Imm(UOffset<5>),
}
impl CsrSrc {
    /// Whether this operand is statically the zero value (`x0` or immediate 0).
    ///
    /// `csrrs` and `csrrc` do not write the CSR if this is true.
    pub fn is_zero(self) -> bool {
        match self {
            CsrSrc::Reg(r) => r.0 == 0,
            CsrSrc::Imm(i) => i.get() == 0,
        }
    }
}

/// Floating-point arithmetic operations which take a rounding mode.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum FArithOp { Add, Sub, Mul, Div }

/// Floating-point comparisons (`feq.s`, `flt.s`, `fle.s`).
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum FCmpOp { Eq, Lt, Le }

/// A floating-point rounding mode.
///
/// | mode  | code  |
/// |-------|-------|
/// | `rne` | `000` |
/// | `rtz` | `001` |
/// | `rdn` | `010` |
/// | `rup` | `011` |
/// | `rmm` | `100` |
/// | `dyn` | `111` |
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum RoundingMode {
    /// Round to nearest, ties to even.
    Rne,
    /// Round towards zero.
    Rtz,
    /// Round down.
    Rdn,
    /// Round up.
    Rup,
    /// Round to nearest, ties away from zero.
    Rmm,
    /// Use the mode in the `frm` CSR.
    #[default]
    Dyn,
}
impl RoundingMode {
    /// Gets the rounding mode from its 3-bit encoding, if it is valid.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0b000 => Some(Self::Rne),
            0b001 => Some(Self::Rtz),
            0b010 => Some(Self::Rdn),
            0b011 => Some(Self::Rup),
            0b100 => Some(Self::Rmm),
            0b111 => Some(Self::Dyn),
            _ => None
        }
    }
    /// Gets the 3-bit encoding of this rounding mode.
    pub fn bits(self) -> u32 {
        match self {
            Self::Rne => 0b000,
            Self::Rtz => 0b001,
            Self::Rdn => 0b010,
            Self::Rup => 0b011,
            Self::Rmm => 0b100,
            Self::Dyn => 0b111,
        }
    }
}

/// A decoded RV32 instruction.
///
/// This covers RV32I, the `M` extension, `Zicsr`, `uret`,
/// and a single-precision subset of the `F` extension.
///
/// Instructions can be converted to and from machine code with
/// [`encoding::encode`] and [`encoding::decode`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Instr {
    /// `lui rd, imm`: loads `imm << 12` into `rd`.
    Lui { rd: Reg, imm: UOffset<20> },
    /// `auipc rd, imm`: loads `pc + (imm << 12)` into `rd`.
    Auipc { rd: Reg, imm: UOffset<20> },
    /// `jal rd, offset`
    Jal { rd: Reg, offset: IOffset<21> },
    /// `jalr rd, offset(rs1)`
    Jalr { rd: Reg, rs1: Reg, offset: IOffset<12> },
    /// Conditional branches.
    Branch { op: BranchOp, rs1: Reg, rs2: Reg, offset: IOffset<13> },
    /// Integer loads.
    Load { op: LoadOp, rd: Reg, rs1: Reg, offset: IOffset<12> },
    /// Integer stores.
    Store { op: StoreOp, rs1: Reg, rs2: Reg, offset: IOffset<12> },
    /// Register-immediate ALU operations.
    OpImm { op: ImmOp, rd: Reg, rs1: Reg, imm: IOffset<12> },
    /// Register-register ALU operations.
    Op { op: RegOp, rd: Reg, rs1: Reg, rs2: Reg },
    /// `fence` (a no-op in this simulator).
    Fence,
    /// `ecall`
    Ecall,
    /// `ebreak`
    Ebreak,
    /// `uret`
    Uret,
    /// CSR instructions.
    Csr { op: CsrOp, rd: Reg, csr: UOffset<12>, src: CsrSrc },
    /// `flw rd, offset(rs1)`
    Flw { rd: FReg, rs1: Reg, offset: IOffset<12> },
    /// `fsw rs2, offset(rs1)`
    Fsw { rs1: Reg, rs2: FReg, offset: IOffset<12> },
    /// `fadd.s`, `fsub.s`, `fmul.s`, `fdiv.s`
    FArith { op: FArithOp, rd: FReg, rs1: FReg, rs2: FReg, rm: RoundingMode },
    /// `fsqrt.s`
    FSqrt { rd: FReg, rs1: FReg, rm: RoundingMode },
    /// `fmin.s` (`max == false`) or `fmax.s` (`max == true`)
    FMinMax { max: bool, rd: FReg, rs1: FReg, rs2: FReg },
    /// `feq.s`, `flt.s`, `fle.s`
    FCmp { op: FCmpOp, rd: Reg, rs1: FReg, rs2: FReg },
    /// `fcvt.w.s` (`signed == true`) or `fcvt.wu.s` (`signed == false`)
    FCvtToInt { signed: bool, rd: Reg, rs1: FReg, rm: RoundingMode },
    /// `fcvt.s.w` (`signed == true`) or `fcvt.s.wu` (`signed == false`)
    FCvtFromInt { signed: bool, rd: FReg, rs1: Reg, rm: RoundingMode },
    /// `fmv.x.w`
    FMvToInt { rd: Reg, rs1: FReg },
    /// `fmv.w.x`
    FMvFromInt { rd: FReg, rs1: Reg },
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn rm_suffix(f: &mut std::fmt::Formatter<'_>, rm: RoundingMode) -> std::fmt::Result {
            match rm {
                RoundingMode::Dyn => Ok(()),
                RoundingMode::Rne => f.write_str(", rne"),
                RoundingMode::Rtz => f.write_str(", rtz"),
                RoundingMode::Rdn => f.write_str(", rdn"),
                RoundingMode::Rup => f.write_str(", rup"),
                RoundingMode::Rmm => f.write_str(", rmm"),
            }
        }

        match *self {
            Instr::Lui { rd, imm }   => write!(f, "lui {rd}, {imm:x}"),
            Instr::Auipc { rd, imm } => write!(f, "auipc {rd}, {imm:x}"),
            Instr::Jal { rd, offset } => write!(f, "jal {rd}, {offset}"),
            Instr::Jalr { rd, rs1, offset } => write!(f, "jalr {rd}, {offset}({rs1})"),
            Instr::Branch { op, rs1, rs2, offset } => {
                let name = match op {
                    BranchOp::Beq  => "beq",
                    BranchOp::Bne  => "bne",
                    BranchOp::Blt  => "blt",
                    BranchOp::Bge  => "bge",
                    BranchOp::Bltu => "bltu",
                    BranchOp::Bgeu => "bgeu",
                };
                write!(f, "{name} {rs1}, {rs2}, {offset}")
            },
            Instr::Load { op, rd, rs1, offset } => {
                let name = match op {
                    LoadOp::Lb  => "lb",
                    LoadOp::Lh  => "lh",
                    LoadOp::Lw  => "lw",
                    LoadOp::Lbu => "lbu",
                    LoadOp::Lhu => "lhu",
                };
                write!(f, "{name} {rd}, {offset}({rs1})")
            },
            Instr::Store { op, rs1, rs2, offset } => {
                let name = match op {
                    StoreOp::Sb => "sb",
                    StoreOp::Sh => "sh",
                    StoreOp::Sw => "sw",
                };
                write!(f, "{name} {rs2}, {offset}({rs1})")
            },
            Instr::OpImm { op, rd, rs1, imm } => {
                let name = match op {
                    ImmOp::Addi  => "addi",
                    ImmOp::Slti  => "slti",
                    ImmOp::Sltiu => "sltiu",
                    ImmOp::Xori  => "xori",
                    ImmOp::Ori   => "ori",
                    ImmOp::Andi  => "andi",
                    ImmOp::Slli  => "slli",
                    ImmOp::Srli  => "srli",
                    ImmOp::Srai  => "srai",
                };
                match op {
                    ImmOp::Slli | ImmOp::Srli | ImmOp::Srai => write!(f, "{name} {rd}, {rs1}, {}", imm.get() & 0x1F),
                    _ => write!(f, "{name} {rd}, {rs1}, {imm}"),
                }
            },
            Instr::Op { op, rd, rs1, rs2 } => {
                let name = match op {
                    RegOp::Add    => "add",
                    RegOp::Sub    => "sub",
                    RegOp::Sll    => "sll",
                    RegOp::Slt    => "slt",
                    RegOp::Sltu   => "sltu",
                    RegOp::Xor    => "xor",
                    RegOp::Srl    => "srl",
                    RegOp::Sra    => "sra",
                    RegOp::Or     => "or",
                    RegOp::And    => "and",
                    RegOp::Mul    => "mul",
                    RegOp::Mulh   => "mulh",
                    RegOp::Mulhsu => "mulhsu",
                    RegOp::Mulhu  => "mulhu",
                    RegOp::Div    => "div",
                    RegOp::Divu   => "divu",
                    RegOp::Rem    => "rem",
                    RegOp::Remu   => "remu",
                };
                write!(f, "{name} {rd}, {rs1}, {rs2}")
            },
            Instr::Fence  => f.write_str("fence"),
            Instr::Ecall  => f.write_str("ecall"),
            Instr::Ebreak => f.write_str("ebreak"),
            Instr::Uret   => f.write_str("uret"),
            Instr::Csr { op, rd, csr, src } => {
                let name = match op {
                    CsrOp::Rw => "csrrw",
                    CsrOp::Rs => "csrrs",
                    CsrOp::Rc => "csrrc",
                };
                f.write_str(name)?;
                match src {
                    CsrSrc::Reg(rs1) => write!(f, " {rd}, {csr:x}, {rs1}"),
                    CsrSrc::Imm(imm) => write!(f, "i {rd}, {csr:x}, {imm}"),
                }
            },
            Instr::Flw { rd, rs1, offset }  => write!(f, "flw {rd}, {offset}({rs1})"),
            Instr::Fsw { rs1, rs2, offset } => write!(f, "fsw {rs2}, {offset}({rs1})"),
            Instr::FArith { op, rd, rs1, rs2, rm } => {
                let name = match op {
                    FArithOp::Add => "fadd.s",
                    FArithOp::Sub => "fsub.s",
                    FArithOp::Mul => "fmul.s",
                    FArithOp::Div => "fdiv.s",
                };
                write!(f, "{name} {rd}, {rs1}, {rs2}")?;
                rm_suffix(f, rm)
            },
            Instr::FSqrt { rd, rs1, rm } => {
                write!(f, "fsqrt.s {rd}, {rs1}")?;
                rm_suffix(f, rm)
            },
            Instr::FMinMax { max, rd, rs1, rs2 } => {
                let name = if max { "fmax.s" } else { "fmin.s" };
                write!(f, "{name} {rd}, {rs1}, {rs2}")
            },
            Instr::FCmp { op, rd, rs1, rs2 } => {
                let name = match op {
                    FCmpOp::Eq => "feq.s",
                    FCmpOp::Lt => "flt.s",
                    FCmpOp::Le => "fle.s",
                };
                write!(f, "{name} {rd}, {rs1}, {rs2}")
            },
            Instr::FCvtToInt { signed, rd, rs1, rm } => {
                f.write_str(if signed { "fcvt.w.s" } else { "fcvt.wu.s" })?;
                write!(f, " {rd}, {rs1}")?;
                rm_suffix(f, rm)
            },
            Instr::FCvtFromInt { signed, rd, rs1, rm } => {
                f.write_str(if signed { "fcvt.s.w" } else { "fcvt.s.wu" })?;
                write!(f, " {rd}, {rs1}")?;
                rm_suffix(f, rm)
            },
            Instr::FMvToInt { rd, rs1 }   => write!(f, "fmv.x.w {rd}, {rs1}"),
            Instr::FMvFromInt { rd, rs1 } => write!(f, "fmv.w.x {rd}, {rs1}"),
        }
    }
}

/// Where a statement came from in its assembly source.
///
/// This is only carried for diagnostics (e.g., highlighting the instruction
/// which caused an exception).
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct SourceInfo {
    /// The 1-indexed line of the statement.
    pub line: usize,
    /// The source text of the statement.
    pub text: String,
}

/// A decoded instruction placed at an address in memory.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct ProgramStatement {
    /// Address of the statement.
    pub address: u32,
    /// The decoded instruction.
    pub instr: Instr,
    /// The machine code of the instruction.
    pub binary: u32,
    /// The source location, if it is known.
    pub source: Option<SourceInfo>,
}
impl ProgramStatement {
    /// Creates a statement at the given address, computing its machine code.
    pub fn new(address: u32, instr: Instr) -> Self {
        Self { address, instr, binary: encoding::encode(&instr), source: None }
    }

    /// Attaches a source location to this statement.
    pub fn with_source(mut self, line: usize, text: impl Into<String>) -> Self {
        self.source = Some(SourceInfo { line, text: text.into() });
        self
    }
}
impl std::fmt::Display for ProgramStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}: {:08x}  {}", self.address, self.binary, self.instr)?;
        if let Some(src) = &self.source {
            f.write_str("  ; ")?;
            write!(f, "{}: {}", src.line, src.text)?;
        }
        Ok(())
    }
}

/// A program handed to the simulator by a loader.
///
/// This consists of decoded statements (placed in the text segment),
/// initialized data blocks, and the address execution starts from.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Program {
    /// The instructions of the program.
    pub statements: Vec<ProgramStatement>,
    /// Initialized data, as (start address, bytes) blocks.
    pub data: Vec<(u32, Vec<u8>)>,
    /// The initial program counter.
    pub entry: u32,
}
impl Program {
    /// Creates a program from a contiguous run of instructions starting at `base`.
    ///
    /// The entry point is set to `base`.
    ///
    /// ```
    /// use riscv_ensemble::ast::{Instr, ImmOp, IOffset, Program};
    /// use riscv_ensemble::ast::reg_consts::{A0, ZERO};
    ///
    /// let program = Program::from_instrs(0x0040_0000, [
    ///     Instr::OpImm { op: ImmOp::Addi, rd: A0, rs1: ZERO, imm: IOffset::new_trunc(5) },
    ///     Instr::Ecall,
    /// ]);
    /// assert_eq!(program.statements[1].address, 0x0040_0004);
    /// assert_eq!(program.statements[0].binary, 0x0050_0513);
    /// ```
    pub fn from_instrs(base: u32, instrs: impl IntoIterator<Item=Instr>) -> Self {
        let statements = instrs.into_iter()
            .enumerate()
            .map(|(i, instr)| ProgramStatement::new(base.wrapping_add(4 * i as u32), instr))
            .collect();

        Self { statements, data: vec![], entry: base }
    }

    /// Adds a block of initialized data to this program.
    pub fn with_data(mut self, address: u32, bytes: impl Into<Vec<u8>>) -> Self {
        self.data.push((address, bytes.into()));
        self
    }

    /// Renders a listing of the program's statements, one per line.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for stmt in &self.statements {
            // writing to a String cannot fail
            let _ = writeln!(out, "{stmt}");
        }
        out
    }
}
