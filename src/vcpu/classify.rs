//! Routing classification for instructions.
//!
//! Matrix-class work is handed to the accelerator; everything else runs on
//! the vCPU itself. Classification is a pure function of the instruction.

use serde::{Deserialize, Serialize};

use super::isa::{Instruction, Opcode};

/// Where an instruction executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecClass {
    /// Runs on the vCPU's own register file.
    Scalar,
    /// Offloaded to the accelerator executor.
    Matrix,
}

/// MATMUL is always Matrix; ADD/SUB/MUL are promoted to Matrix when they
/// carry a tile shape. Everything else is Scalar.
pub fn classify(instr: &Instruction) -> ExecClass {
    match instr.opcode {
        Opcode::Matmul => ExecClass::Matrix,
        Opcode::Add | Opcode::Sub | Opcode::Mul if instr.shape.is_some() => ExecClass::Matrix,
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Nop
        | Opcode::Mov
        | Opcode::Load
        | Opcode::Store
        | Opcode::Jmp
        | Opcode::Cmp
        | Opcode::Jz
        | Opcode::Jnz
        | Opcode::Halt
        | Opcode::Inc
        | Opcode::Dec => ExecClass::Scalar,
    }
}

impl Instruction {
    pub fn class(&self) -> ExecClass {
        classify(self)
    }
}
