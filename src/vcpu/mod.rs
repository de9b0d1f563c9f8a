//! Virtual CPU: instruction set, classifier, interpreter and accelerator seam.
//!
//! Programs are validated once at submission ([`Program::validate`]); the
//! interpreter still bounds-checks every access so an unvalidated program
//! faults instead of panicking.

pub mod accelerator;
pub mod asm;
pub mod classify;
pub mod interpreter;
pub mod isa;

pub use accelerator::{AcceleratorError, AcceleratorExecutor, HostAccelerator, MatrixKind, MatrixOp};
pub use asm::{assemble, disassemble};
pub use classify::{classify, ExecClass};
pub use interpreter::{
    ExecOutcome, ExecStats, Fault, Interpreter, VcpuState, DEFAULT_ACCELERATOR_TIMEOUT,
};
pub use isa::{
    DecodeError, Instruction, Opcode, Operand, Program, TileShape, VcpuLayout, ISA_VERSION,
    MAX_REGISTERS,
};
