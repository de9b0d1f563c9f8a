//! Instruction set for the hive vCPU.
//!
//! ## Word format (16 bytes, little-endian)
//!
//! ```text
//! [OPCODE:1][DEST:1][FLAGS:1][ROWS:1][COLS:1][INNER:1][RSVD:2][SRC_A:4][SRC_B:4]
//!
//! FLAGS bit 0: SRC_A is a register index (else an immediate)
//! FLAGS bit 1: SRC_B is a register index (else an immediate)
//! FLAGS bit 2: a tile shape is present (ROWS/COLS/INNER valid)
//! ```
//!
//! A serialized program is a 12-byte header (`HVPG`, ISA version, reserved,
//! instruction count) followed by the words.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version of the closed opcode set. Bumped whenever an opcode is added.
pub const ISA_VERSION: u16 = 1;

/// Register indices are a single byte on the wire.
pub const MAX_REGISTERS: usize = 256;

/// Size of one encoded instruction word.
pub const WORD_SIZE: usize = 16;

const PROGRAM_MAGIC: &[u8; 4] = b"HVPG";
const HEADER_SIZE: usize = 12;

const FLAG_A_REG: u8 = 0b001;
const FLAG_B_REG: u8 = 0b010;
const FLAG_SHAPE: u8 = 0b100;

/// Errors raised while decoding or validating a program.
///
/// All of these are detected before a program is accepted for execution.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("program is empty")]
    EmptyProgram,

    #[error("program has {len} instructions (max {max})")]
    ProgramTooLong { len: usize, max: usize },

    #[error("instruction {index}: unknown opcode {opcode:#04x}")]
    UnknownOpcode { index: usize, opcode: u8 },

    #[error("instruction {index}: register r{register} out of range (register file has {registers})")]
    RegisterOutOfRange {
        index: usize,
        register: u8,
        registers: usize,
    },

    #[error("instruction {index}: jump target {target} outside program of {len} instructions")]
    JumpOutOfRange { index: usize, target: i64, len: usize },

    #[error("instruction {index}: memory address {address} outside {words}-word memory")]
    MemoryOutOfRange {
        index: usize,
        address: i64,
        words: usize,
    },

    #[error("instruction {index}: invalid operand: {reason}")]
    InvalidOperand { index: usize, reason: String },

    #[error("instruction {index}: {opcode} requires a tile shape")]
    MissingShape { index: usize, opcode: Opcode },

    #[error("instruction {index}: invalid tile shape: {reason}")]
    InvalidShape { index: usize, reason: String },

    #[error("register file of {0} registers is not supported")]
    BadRegisterFile(usize),

    #[error("truncated program: {len} bytes")]
    Truncated { len: usize },

    #[error("bad program header")]
    BadHeader,

    #[error("unsupported ISA version {0}")]
    UnsupportedVersion(u16),
}

/// Operation codes. The numbering is part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Add = 1,
    Sub = 2,
    Mul = 3,
    Mov = 5,
    Load = 6,
    Store = 7,
    Jmp = 8,
    Cmp = 9,
    Jz = 10,
    Jnz = 11,
    Halt = 14,
    Inc = 15,
    Dec = 16,
    Matmul = 29,
}

impl Opcode {
    pub const ALL: [Opcode; 15] = [
        Opcode::Nop,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Mov,
        Opcode::Load,
        Opcode::Store,
        Opcode::Jmp,
        Opcode::Cmp,
        Opcode::Jz,
        Opcode::Jnz,
        Opcode::Halt,
        Opcode::Inc,
        Opcode::Dec,
        Opcode::Matmul,
    ];

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Mov => "MOV",
            Opcode::Load => "LOAD",
            Opcode::Store => "STORE",
            Opcode::Jmp => "JMP",
            Opcode::Cmp => "CMP",
            Opcode::Jz => "JZ",
            Opcode::Jnz => "JNZ",
            Opcode::Halt => "HALT",
            Opcode::Inc => "INC",
            Opcode::Dec => "DEC",
            Opcode::Matmul => "MATMUL",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        Self::ALL.iter().copied().find(|op| op.mnemonic() == upper)
    }

    /// Whether the opcode writes (or reads-modifies-writes) the `dest` register.
    pub fn uses_dest(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Mov
                | Opcode::Load
                | Opcode::Cmp
                | Opcode::Inc
                | Opcode::Dec
                | Opcode::Matmul
        )
    }

    /// Element-wise arithmetic that may be promoted to a tile operation.
    pub fn is_elementwise(&self) -> bool {
        matches!(self, Opcode::Add | Opcode::Sub | Opcode::Mul)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| *op as u8 == value)
            .ok_or(value)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A source operand: a register index or a sign-extended 32-bit immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Reg(u8),
    Imm(i32),
}

impl Default for Operand {
    fn default() -> Self {
        Operand::Imm(0)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "r{}", r),
            Operand::Imm(v) => write!(f, "{}", v),
        }
    }
}

/// Tile dimensions for matrix-class instructions.
///
/// Element-wise ops work on `rows x cols` tiles (`inner` must be 0);
/// MATMUL multiplies `rows x inner` by `inner x cols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileShape {
    pub rows: u8,
    pub cols: u8,
    #[serde(default)]
    pub inner: u8,
}

impl TileShape {
    pub const fn elementwise(rows: u8, cols: u8) -> Self {
        Self { rows, cols, inner: 0 }
    }

    pub const fn matmul(rows: u8, inner: u8, cols: u8) -> Self {
        Self { rows, cols, inner }
    }

    pub fn output_len(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

impl fmt::Display for TileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner == 0 {
            write!(f, "{}x{}", self.rows, self.cols)
        } else {
            write!(f, "{}x{}x{}", self.rows, self.inner, self.cols)
        }
    }
}

/// One decoded instruction: `{opcode, dest, src_a, src_b}` plus optional
/// tile shape metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    #[serde(default)]
    pub dest: u8,
    #[serde(default)]
    pub src_a: Operand,
    #[serde(default)]
    pub src_b: Operand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<TileShape>,
}

impl Instruction {
    pub const fn new(opcode: Opcode, dest: u8, src_a: Operand, src_b: Operand) -> Self {
        Self {
            opcode,
            dest,
            src_a,
            src_b,
            shape: None,
        }
    }

    pub const fn nop() -> Self {
        Self::new(Opcode::Nop, 0, Operand::Imm(0), Operand::Imm(0))
    }

    pub const fn halt() -> Self {
        Self::new(Opcode::Halt, 0, Operand::Imm(0), Operand::Imm(0))
    }

    /// dest = src
    pub const fn mov(dest: u8, src: Operand) -> Self {
        Self::new(Opcode::Mov, dest, src, Operand::Imm(0))
    }

    /// dest = a + b
    pub const fn add(dest: u8, a: Operand, b: Operand) -> Self {
        Self::new(Opcode::Add, dest, a, b)
    }

    /// dest = a - b
    pub const fn sub(dest: u8, a: Operand, b: Operand) -> Self {
        Self::new(Opcode::Sub, dest, a, b)
    }

    /// dest = a * b
    pub const fn mul(dest: u8, a: Operand, b: Operand) -> Self {
        Self::new(Opcode::Mul, dest, a, b)
    }

    /// dest = signum(a - b)
    pub const fn cmp(dest: u8, a: Operand, b: Operand) -> Self {
        Self::new(Opcode::Cmp, dest, a, b)
    }

    pub const fn inc(dest: u8) -> Self {
        Self::new(Opcode::Inc, dest, Operand::Imm(0), Operand::Imm(0))
    }

    pub const fn dec(dest: u8) -> Self {
        Self::new(Opcode::Dec, dest, Operand::Imm(0), Operand::Imm(0))
    }

    /// dest = mem[addr]
    pub const fn load(dest: u8, addr: Operand) -> Self {
        Self::new(Opcode::Load, dest, addr, Operand::Imm(0))
    }

    /// mem[addr] = value
    pub const fn store(value: Operand, addr: Operand) -> Self {
        Self::new(Opcode::Store, 0, value, addr)
    }

    pub const fn jmp(target: i32) -> Self {
        Self::new(Opcode::Jmp, 0, Operand::Imm(target), Operand::Imm(0))
    }

    /// Jump to `target` when `cond` is zero.
    pub const fn jz(cond: Operand, target: i32) -> Self {
        Self::new(Opcode::Jz, 0, cond, Operand::Imm(target))
    }

    /// Jump to `target` when `cond` is non-zero.
    pub const fn jnz(cond: Operand, target: i32) -> Self {
        Self::new(Opcode::Jnz, 0, cond, Operand::Imm(target))
    }

    /// mem[r_dest..] = mem[a..] @ mem[b..]
    pub const fn matmul(dest: u8, a: Operand, b: Operand, shape: TileShape) -> Self {
        Self {
            opcode: Opcode::Matmul,
            dest,
            src_a: a,
            src_b: b,
            shape: Some(shape),
        }
    }

    pub const fn with_shape(mut self, shape: TileShape) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Encode into a fixed 16-byte word.
    pub fn encode(&self) -> [u8; WORD_SIZE] {
        let mut word = [0u8; WORD_SIZE];
        let (a_reg, a_raw) = operand_bits(self.src_a);
        let (b_reg, b_raw) = operand_bits(self.src_b);
        let mut flags = 0u8;
        if a_reg {
            flags |= FLAG_A_REG;
        }
        if b_reg {
            flags |= FLAG_B_REG;
        }
        word[0] = self.opcode as u8;
        word[1] = self.dest;
        if let Some(shape) = self.shape {
            flags |= FLAG_SHAPE;
            word[3] = shape.rows;
            word[4] = shape.cols;
            word[5] = shape.inner;
        }
        word[2] = flags;
        word[8..12].copy_from_slice(&a_raw.to_le_bytes());
        word[12..16].copy_from_slice(&b_raw.to_le_bytes());
        word
    }

    /// Decode one 16-byte word. `index` is only used for error reporting.
    pub fn decode(word: &[u8], index: usize) -> Result<Self, DecodeError> {
        if word.len() != WORD_SIZE {
            return Err(DecodeError::Truncated { len: word.len() });
        }
        let opcode = Opcode::try_from(word[0])
            .map_err(|opcode| DecodeError::UnknownOpcode { index, opcode })?;
        let flags = word[2];
        if flags & !(FLAG_A_REG | FLAG_B_REG | FLAG_SHAPE) != 0 {
            return Err(DecodeError::InvalidOperand {
                index,
                reason: format!("unknown flag bits {:#04x}", flags),
            });
        }
        if word[6] != 0 || word[7] != 0 {
            return Err(DecodeError::InvalidOperand {
                index,
                reason: "reserved bytes must be zero".to_string(),
            });
        }
        let a_raw = i32::from_le_bytes([word[8], word[9], word[10], word[11]]);
        let b_raw = i32::from_le_bytes([word[12], word[13], word[14], word[15]]);
        let src_a = operand_from_bits(flags & FLAG_A_REG != 0, a_raw, index)?;
        let src_b = operand_from_bits(flags & FLAG_B_REG != 0, b_raw, index)?;
        let shape = (flags & FLAG_SHAPE != 0).then_some(TileShape {
            rows: word[3],
            cols: word[4],
            inner: word[5],
        });
        Ok(Self {
            opcode,
            dest: word[1],
            src_a,
            src_b,
            shape,
        })
    }
}

fn operand_bits(op: Operand) -> (bool, i32) {
    match op {
        Operand::Reg(r) => (true, r as i32),
        Operand::Imm(v) => (false, v),
    }
}

fn operand_from_bits(is_reg: bool, raw: i32, index: usize) -> Result<Operand, DecodeError> {
    if !is_reg {
        return Ok(Operand::Imm(raw));
    }
    u8::try_from(raw)
        .map(Operand::Reg)
        .map_err(|_| DecodeError::InvalidOperand {
            index,
            reason: format!("register index {} does not fit a byte", raw),
        })
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::Nop | Opcode::Halt => write!(f, "{}", self.opcode)?,
            Opcode::Mov | Opcode::Load => {
                write!(f, "{} r{}, {}", self.opcode, self.dest, self.src_a)?
            }
            Opcode::Inc | Opcode::Dec => write!(f, "{} r{}", self.opcode, self.dest)?,
            Opcode::Store | Opcode::Jz | Opcode::Jnz => {
                write!(f, "{} {}, {}", self.opcode, self.src_a, self.src_b)?
            }
            Opcode::Jmp => write!(f, "{} {}", self.opcode, self.src_a)?,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Cmp | Opcode::Matmul => write!(
                f,
                "{} r{}, {}, {}",
                self.opcode, self.dest, self.src_a, self.src_b
            )?,
        }
        if let Some(shape) = self.shape {
            write!(f, " [{}]", shape)?;
        }
        Ok(())
    }
}

/// Register-file and memory dimensions a program is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuLayout {
    pub registers: usize,
    pub memory_words: usize,
}

impl Default for VcpuLayout {
    fn default() -> Self {
        Self {
            registers: 16,
            memory_words: 256,
        }
    }
}

impl From<&crate::config::VcpuConfig> for VcpuLayout {
    fn from(config: &crate::config::VcpuConfig) -> Self {
        Self {
            registers: config.registers,
            memory_words: config.memory_words,
        }
    }
}

/// An ordered, immutable instruction sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Serialize to the binary program format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.len() * WORD_SIZE);
        out.extend_from_slice(PROGRAM_MAGIC);
        out.extend_from_slice(&ISA_VERSION.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for instr in &self.instructions {
            out.extend_from_slice(&instr.encode());
        }
        out
    }

    /// Parse the binary program format. Structural checks only; call
    /// [`Program::validate`] before execution.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated { len: bytes.len() });
        }
        if &bytes[0..4] != PROGRAM_MAGIC {
            return Err(DecodeError::BadHeader);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != ISA_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let body = &bytes[HEADER_SIZE..];
        if body.len() != count.saturating_mul(WORD_SIZE) {
            return Err(DecodeError::Truncated { len: bytes.len() });
        }
        let instructions = body
            .chunks_exact(WORD_SIZE)
            .enumerate()
            .map(|(index, word)| Instruction::decode(word, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { instructions })
    }

    /// Check every instruction against the register file and memory size.
    ///
    /// A program that passes never raises a decode-class fault at runtime:
    /// register indices, jump targets, immediate addresses, shapes and
    /// operand forms are all checked here.
    pub fn validate(&self, layout: &VcpuLayout, max_len: usize) -> Result<(), DecodeError> {
        if layout.registers == 0 || layout.registers > MAX_REGISTERS {
            return Err(DecodeError::BadRegisterFile(layout.registers));
        }
        if self.is_empty() {
            return Err(DecodeError::EmptyProgram);
        }
        if self.len() > max_len {
            return Err(DecodeError::ProgramTooLong {
                len: self.len(),
                max: max_len,
            });
        }
        for (index, instr) in self.instructions.iter().enumerate() {
            validate_instruction(index, instr, layout, self.len())?;
        }
        Ok(())
    }
}

impl From<Vec<Instruction>> for Program {
    fn from(instructions: Vec<Instruction>) -> Self {
        Self::new(instructions)
    }
}

fn validate_instruction(
    index: usize,
    instr: &Instruction,
    layout: &VcpuLayout,
    len: usize,
) -> Result<(), DecodeError> {
    let check_reg = |register: u8| {
        if (register as usize) < layout.registers {
            Ok(())
        } else {
            Err(DecodeError::RegisterOutOfRange {
                index,
                register,
                registers: layout.registers,
            })
        }
    };
    let check_operand = |op: Operand| match op {
        Operand::Reg(r) => check_reg(r),
        Operand::Imm(_) => Ok(()),
    };
    let check_target = |op: Operand| match op {
        Operand::Imm(t) if t >= 0 && (t as usize) < len => Ok(()),
        Operand::Imm(t) => Err(DecodeError::JumpOutOfRange {
            index,
            target: t as i64,
            len,
        }),
        Operand::Reg(_) => Err(DecodeError::InvalidOperand {
            index,
            reason: "jump target must be an immediate".to_string(),
        }),
    };
    // Immediate addresses covering `span` words must fit the memory region.
    let check_address = |op: Operand, span: usize| match op {
        Operand::Imm(a) if a < 0 || (a as usize).saturating_add(span) > layout.memory_words => {
            Err(DecodeError::MemoryOutOfRange {
                index,
                address: a as i64,
                words: layout.memory_words,
            })
        }
        Operand::Imm(_) => Ok(()),
        Operand::Reg(r) => check_reg(r),
    };

    if instr.opcode.uses_dest() {
        check_reg(instr.dest)?;
    }

    if let Some(shape) = instr.shape {
        if !(instr.opcode.is_elementwise() || instr.opcode == Opcode::Matmul) {
            return Err(DecodeError::InvalidShape {
                index,
                reason: format!("{} does not take a tile shape", instr.opcode),
            });
        }
        if shape.rows == 0 || shape.cols == 0 {
            return Err(DecodeError::InvalidShape {
                index,
                reason: format!("zero dimension in {}", shape),
            });
        }
        if instr.opcode == Opcode::Matmul && shape.inner == 0 {
            return Err(DecodeError::InvalidShape {
                index,
                reason: "MATMUL needs a non-zero inner dimension".to_string(),
            });
        }
        if instr.opcode.is_elementwise() && shape.inner != 0 {
            return Err(DecodeError::InvalidShape {
                index,
                reason: format!("{} tiles are two-dimensional", instr.opcode),
            });
        }
    }

    match instr.opcode {
        Opcode::Nop | Opcode::Halt | Opcode::Inc | Opcode::Dec => Ok(()),
        Opcode::Mov => check_operand(instr.src_a),
        Opcode::Cmp => {
            check_operand(instr.src_a)?;
            check_operand(instr.src_b)
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul => match instr.shape {
            None => {
                check_operand(instr.src_a)?;
                check_operand(instr.src_b)
            }
            Some(shape) => {
                check_address(instr.src_a, shape.output_len())?;
                check_address(instr.src_b, shape.output_len())
            }
        },
        Opcode::Matmul => {
            let shape = instr.shape.ok_or(DecodeError::MissingShape {
                index,
                opcode: instr.opcode,
            })?;
            check_address(instr.src_a, shape.rows as usize * shape.inner as usize)?;
            check_address(instr.src_b, shape.inner as usize * shape.cols as usize)
        }
        Opcode::Load => check_address(instr.src_a, 1),
        Opcode::Store => {
            check_operand(instr.src_a)?;
            check_address(instr.src_b, 1)
        }
        Opcode::Jmp => check_target(instr.src_a),
        Opcode::Jz | Opcode::Jnz => {
            check_operand(instr.src_a)?;
            check_target(instr.src_b)
        }
    }
}
