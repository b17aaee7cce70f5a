//! A RV32 simulator core.
//!
//! This is meant to be the execution backend of a RISC-V teaching environment:
//! a front end (an assembler and an editor) loads decoded programs into the simulator,
//! and then watches execution through notices.
//!
//! # Usage
//!
//! Programs are handed to the simulator already decoded:
//! ```
//! use riscv_ensemble::ast::{Instr, ImmOp, IOffset, Program};
//! use riscv_ensemble::ast::reg_consts::{A0, ZERO};
//!
//! let program = Program::from_instrs(0x0040_0000, [
//!     Instr::OpImm { op: ImmOp::Addi, rd: A0, rs1: ZERO, imm: IOffset::new_trunc(7) },
//! ]);
//! ```
//!
//! Once a program has been created, it can be executed with the simulator:
//! ```
//! # use riscv_ensemble::ast::{Instr, ImmOp, IOffset, Program};
//! # use riscv_ensemble::ast::reg_consts::{A0, ZERO};
//! #
//! # let program = Program::from_instrs(0x0040_0000, [
//! #     Instr::OpImm { op: ImmOp::Addi, rd: A0, rs1: ZERO, imm: IOffset::new_trunc(7) },
//! # ]);
//! use riscv_ensemble::sim::Simulator;
//!
//! let mut simulator = Simulator::new(Default::default());
//! simulator.load_program(program).unwrap();
//! simulator.start(None, &[]).unwrap(); // <-- Result can be handled accordingly
//! simulator.join();
//!
//! assert_eq!(simulator.lock().regs.get(A0), Ok(7));
//! ```
//!
//! If more granularity is needed for simulation, there are also stepping and back-stepping functions.
//! See the [`sim`] module for more details.
#![warn(missing_docs)]

pub mod ast;
pub mod sim;
