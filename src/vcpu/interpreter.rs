//! Interpreter - fetch/decode/execute loop for one vCPU.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 VcpuState                     │
//! │  registers: [i64; R]   memory: [i64; M]       │
//! │  pc, halted, stats (cycles, class counts)     │
//! └──────────────────────────────────────────────┘
//!            │ fetch + classify
//!            ├── Scalar ──► executed in place
//!            └── Matrix ──► AcceleratorExecutor (blocking pool, timeout)
//! ```
//!
//! `execute` runs until HALT, a fault, or `max_cycles` instructions have
//! retired in this call. The state keeps its program counter, so calling
//! `execute` again resumes where the previous slice stopped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::accelerator::{AcceleratorExecutor, HostAccelerator, MatrixKind, MatrixOp};
use super::classify::{classify, ExecClass};
use super::isa::{Instruction, Opcode, Operand, Program, VcpuLayout};
use crate::util::blocking_with_timeout;
use crate::Error;

/// Default bound on a single accelerator call.
pub const DEFAULT_ACCELERATOR_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime execution faults.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum Fault {
    #[error("pc {pc}: register r{register} out of range ({registers} registers)")]
    RegisterOutOfRange {
        pc: usize,
        register: u8,
        registers: usize,
    },

    #[error("pc {pc}: memory address {address} out of range ({words} words)")]
    MemoryOutOfRange { pc: usize, address: i64, words: usize },

    #[error("pc {pc}: program counter out of range")]
    ProgramCounterOutOfRange { pc: usize },

    #[error("pc {pc}: invalid instruction: {reason}")]
    InvalidInstruction { pc: usize, reason: String },

    #[error("pc {pc}: accelerator failure: {message}")]
    Accelerator { pc: usize, message: String },

    #[error("pc {pc}: accelerator timed out after {timeout_ms}ms")]
    AcceleratorTimeout { pc: usize, timeout_ms: u64 },

    #[error("cycle budget of {cycles} exhausted")]
    CycleBudgetExhausted { cycles: u64 },
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Halted,
    CycleLimitReached,
    Fault(Fault),
}

/// Per-vCPU counters reported with every task result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStats {
    pub cycles: u64,
    pub scalar_ops: u64,
    pub matrix_ops: u64,
    /// Retired instructions per mnemonic.
    pub histogram: BTreeMap<String, u64>,
}

impl ExecStats {
    fn record(&mut self, opcode: Opcode, class: ExecClass) {
        self.cycles += 1;
        match class {
            ExecClass::Scalar => self.scalar_ops += 1,
            ExecClass::Matrix => self.matrix_ops += 1,
        }
        *self.histogram.entry(opcode.mnemonic().to_string()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &ExecStats) {
        self.cycles += other.cycles;
        self.scalar_ops += other.scalar_ops;
        self.matrix_ops += other.matrix_ops;
        for (name, count) in &other.histogram {
            *self.histogram.entry(name.clone()).or_insert(0) += count;
        }
    }
}

/// Architectural state of one vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuState {
    pub registers: Vec<i64>,
    pub memory: Vec<i64>,
    pub pc: usize,
    pub halted: bool,
    pub stats: ExecStats,
}

impl VcpuState {
    pub fn new(layout: &VcpuLayout) -> Self {
        Self {
            registers: vec![0; layout.registers],
            memory: vec![0; layout.memory_words],
            pc: 0,
            halted: false,
            stats: ExecStats::default(),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.stats.cycles
    }

    fn read(&self, pc: usize, op: Operand) -> Result<i64, Fault> {
        match op {
            Operand::Imm(v) => Ok(v as i64),
            Operand::Reg(r) => self.registers.get(r as usize).copied().ok_or(
                Fault::RegisterOutOfRange {
                    pc,
                    register: r,
                    registers: self.registers.len(),
                },
            ),
        }
    }

    fn write(&mut self, pc: usize, register: u8, value: i64) -> Result<(), Fault> {
        let registers = self.registers.len();
        match self.registers.get_mut(register as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Fault::RegisterOutOfRange {
                pc,
                register,
                registers,
            }),
        }
    }

    /// Bounds-checked `[address, address + len)` range into memory.
    fn span(&self, pc: usize, address: i64, len: usize) -> Result<std::ops::Range<usize>, Fault> {
        let words = self.memory.len();
        let fault = Fault::MemoryOutOfRange { pc, address, words };
        let start = usize::try_from(address).map_err(|_| fault.clone())?;
        let end = start.checked_add(len).ok_or_else(|| fault.clone())?;
        if end > words {
            return Err(fault);
        }
        Ok(start..end)
    }
}

enum Flow {
    Next,
    Jump(usize),
    Halt,
}

/// Executes programs against [`VcpuState`]s, routing matrix-class
/// instructions to an accelerator.
#[derive(Clone)]
pub struct Interpreter {
    accelerator: Arc<dyn AcceleratorExecutor>,
    accelerator_timeout: Duration,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(Arc::new(HostAccelerator), DEFAULT_ACCELERATOR_TIMEOUT)
    }
}

impl Interpreter {
    pub fn new(accelerator: Arc<dyn AcceleratorExecutor>, accelerator_timeout: Duration) -> Self {
        Self {
            accelerator,
            accelerator_timeout,
        }
    }

    pub fn accelerator_name(&self) -> &str {
        self.accelerator.name()
    }

    /// Run until HALT, a fault, or `max_cycles` retired instructions.
    ///
    /// Running past the final instruction is treated as HALT.
    pub async fn execute(
        &self,
        state: &mut VcpuState,
        program: &Program,
        max_cycles: u64,
    ) -> ExecOutcome {
        let mut slice = 0u64;
        loop {
            if state.halted {
                return ExecOutcome::Halted;
            }
            if slice >= max_cycles {
                return ExecOutcome::CycleLimitReached;
            }
            let pc = state.pc;
            let Some(instr) = program.get(pc) else {
                state.halted = true;
                return ExecOutcome::Halted;
            };

            let class = classify(instr);
            let flow = match class {
                ExecClass::Scalar => step_scalar(state, pc, instr, program.len()),
                ExecClass::Matrix => self.step_matrix(state, pc, instr).await,
            };

            match flow {
                Ok(flow) => {
                    state.stats.record(instr.opcode, class);
                    slice += 1;
                    match flow {
                        Flow::Next => state.pc = pc + 1,
                        Flow::Jump(target) => state.pc = target,
                        Flow::Halt => {
                            state.halted = true;
                            return ExecOutcome::Halted;
                        }
                    }
                }
                Err(fault) => return ExecOutcome::Fault(fault),
            }
        }
    }

    async fn step_matrix(
        &self,
        state: &mut VcpuState,
        pc: usize,
        instr: &Instruction,
    ) -> Result<Flow, Fault> {
        let kind = MatrixKind::from_opcode(instr.opcode).ok_or_else(|| {
            Fault::InvalidInstruction {
                pc,
                reason: format!("{} is not a matrix operation", instr.opcode),
            }
        })?;
        let shape = instr.shape.ok_or_else(|| Fault::InvalidInstruction {
            pc,
            reason: format!("{} without tile shape", instr.opcode),
        })?;

        let lhs_at = state.read(pc, instr.src_a)?;
        let rhs_at = state.read(pc, instr.src_b)?;
        let out_at = state.read(pc, Operand::Reg(instr.dest))?;
        let lhs = state.span(pc, lhs_at, MatrixOp::lhs_len(kind, &shape))?;
        let rhs = state.span(pc, rhs_at, MatrixOp::rhs_len(kind, &shape))?;
        let out = state.span(pc, out_at, shape.output_len())?;

        let op = MatrixOp {
            kind,
            shape,
            lhs: state.memory[lhs].to_vec(),
            rhs: state.memory[rhs].to_vec(),
        };
        let accelerator = Arc::clone(&self.accelerator);
        let result = blocking_with_timeout(self.accelerator_timeout, move || {
            Ok(accelerator.execute_matrix_op(&op))
        })
        .await;

        let values = match result {
            Ok(Ok(values)) => values,
            Ok(Err(e)) => {
                return Err(Fault::Accelerator {
                    pc,
                    message: e.to_string(),
                })
            }
            Err(Error::Timeout(d)) => {
                return Err(Fault::AcceleratorTimeout {
                    pc,
                    timeout_ms: d.as_millis() as u64,
                })
            }
            Err(e) => {
                return Err(Fault::Accelerator {
                    pc,
                    message: e.to_string(),
                })
            }
        };
        if values.len() != out.len() {
            return Err(Fault::Accelerator {
                pc,
                message: format!(
                    "returned {} elements, expected {}",
                    values.len(),
                    out.len()
                ),
            });
        }
        state.memory[out].copy_from_slice(&values);
        Ok(Flow::Next)
    }
}

fn jump_target(pc: usize, op: Operand, len: usize) -> Result<usize, Fault> {
    match op {
        Operand::Imm(t) if t >= 0 && (t as usize) < len => Ok(t as usize),
        Operand::Imm(_) => Err(Fault::ProgramCounterOutOfRange { pc }),
        Operand::Reg(_) => Err(Fault::InvalidInstruction {
            pc,
            reason: "jump target must be an immediate".to_string(),
        }),
    }
}

fn step_scalar(
    state: &mut VcpuState,
    pc: usize,
    instr: &Instruction,
    len: usize,
) -> Result<Flow, Fault> {
    match instr.opcode {
        Opcode::Nop => Ok(Flow::Next),
        Opcode::Halt => Ok(Flow::Halt),
        Opcode::Mov => {
            let v = state.read(pc, instr.src_a)?;
            state.write(pc, instr.dest, v)?;
            Ok(Flow::Next)
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Cmp => {
            let a = state.read(pc, instr.src_a)?;
            let b = state.read(pc, instr.src_b)?;
            let v = match instr.opcode {
                Opcode::Add => a.wrapping_add(b),
                Opcode::Sub => a.wrapping_sub(b),
                Opcode::Mul => a.wrapping_mul(b),
                _ => a.cmp(&b) as i64,
            };
            state.write(pc, instr.dest, v)?;
            Ok(Flow::Next)
        }
        Opcode::Inc | Opcode::Dec => {
            let v = state.read(pc, Operand::Reg(instr.dest))?;
            let v = if instr.opcode == Opcode::Inc {
                v.wrapping_add(1)
            } else {
                v.wrapping_sub(1)
            };
            state.write(pc, instr.dest, v)?;
            Ok(Flow::Next)
        }
        Opcode::Load => {
            let address = state.read(pc, instr.src_a)?;
            let at = state.span(pc, address, 1)?.start;
            let v = state.memory[at];
            state.write(pc, instr.dest, v)?;
            Ok(Flow::Next)
        }
        Opcode::Store => {
            let v = state.read(pc, instr.src_a)?;
            let address = state.read(pc, instr.src_b)?;
            let at = state.span(pc, address, 1)?.start;
            state.memory[at] = v;
            Ok(Flow::Next)
        }
        Opcode::Jmp => Ok(Flow::Jump(jump_target(pc, instr.src_a, len)?)),
        Opcode::Jz | Opcode::Jnz => {
            let cond = state.read(pc, instr.src_a)?;
            let take = (cond == 0) == (instr.opcode == Opcode::Jz);
            if take {
                Ok(Flow::Jump(jump_target(pc, instr.src_b, len)?))
            } else {
                Ok(Flow::Next)
            }
        }
        Opcode::Matmul => Err(Fault::InvalidInstruction {
            pc,
            reason: "MATMUL cannot run on the scalar path".to_string(),
        }),
    }
}
