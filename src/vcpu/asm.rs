//! Assembler for `.hasm` program sources.
//!
//! ## Syntax
//!
//! ```text
//! ; comments start with ';' or '#'
//!         MOV   r0, 5          ; r0 = 5
//! loop:   DEC   r0
//!         JNZ   r0, loop       ; labels resolve to instruction indices
//!         MOV   r1, 16
//!         MATMUL r1, 0, 4 [2x2x2]   ; rows x inner x cols
//!         ADD   r1, 16, 16 [2x2]    ; element-wise tile add
//!         HALT
//! ```
//!
//! Operands are registers (`r0`..`r255`), integers (decimal or `0x` hex,
//! optionally negative) or labels. The result is structurally decoded but
//! not validated against a register file; see [`Program::validate`].

use std::collections::HashMap;

use super::isa::{Instruction, Opcode, Operand, Program, TileShape};
use crate::{Error, Result};

/// Assemble source text into a program.
pub fn assemble(source: &str) -> Result<Program> {
    let lines: Vec<(usize, &str)> = source
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, strip_comment(line).trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect();

    // Pass 1: labels
    let mut labels = HashMap::new();
    let mut body = Vec::with_capacity(lines.len());
    for (line_no, line) in lines {
        let mut rest = line;
        while let Some((label, tail)) = split_label(rest) {
            if labels.insert(label.to_string(), body.len()).is_some() {
                return Err(asm_error(line_no, format!("duplicate label '{}'", label)));
            }
            rest = tail.trim();
        }
        if !rest.is_empty() {
            body.push((line_no, rest));
        }
    }

    // Pass 2: instructions
    let instructions = body
        .into_iter()
        .map(|(line_no, text)| parse_instruction(line_no, text, &labels))
        .collect::<Result<Vec<_>>>()?;
    Ok(Program::new(instructions))
}

/// Render a program back to source form, one instruction per line.
pub fn disassemble(program: &Program) -> String {
    program
        .instructions()
        .iter()
        .map(|instr| format!("{}\n", instr))
        .collect()
}

fn strip_comment(line: &str) -> &str {
    match line.find([';', '#']) {
        Some(at) => &line[..at],
        None => line,
    }
}

fn split_label(line: &str) -> Option<(&str, &str)> {
    let (head, tail) = line.split_once(':')?;
    let head = head.trim();
    let is_ident = !head.is_empty()
        && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !head.starts_with(|c: char| c.is_ascii_digit());
    is_ident.then_some((head, tail))
}

fn asm_error(line: usize, message: String) -> Error {
    Error::Assembly { line, message }
}

fn parse_instruction(
    line: usize,
    text: &str,
    labels: &HashMap<String, usize>,
) -> Result<Instruction> {
    let (text, shape) = match text.find('[') {
        Some(open) => {
            let close = text
                .rfind(']')
                .filter(|close| *close > open)
                .ok_or_else(|| asm_error(line, "unterminated shape".to_string()))?;
            if !text[close + 1..].trim().is_empty() {
                return Err(asm_error(line, "text after shape".to_string()));
            }
            let shape = parse_shape(line, &text[open + 1..close])?;
            (text[..open].trim(), Some(shape))
        }
        None => (text, None),
    };

    let (mnemonic, operands) = match text.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest.trim()),
        None => (text, ""),
    };
    let opcode = Opcode::from_mnemonic(mnemonic)
        .ok_or_else(|| asm_error(line, format!("unknown mnemonic '{}'", mnemonic)))?;
    let ops: Vec<&str> = if operands.is_empty() {
        Vec::new()
    } else {
        operands.split(',').map(str::trim).collect()
    };

    let expect = |n: usize| -> Result<()> {
        if ops.len() == n {
            Ok(())
        } else {
            Err(asm_error(
                line,
                format!("{} takes {} operand(s), got {}", opcode, n, ops.len()),
            ))
        }
    };
    let operand = |i: usize| parse_operand(line, ops[i], labels);
    let register = |i: usize| -> Result<u8> {
        match parse_operand(line, ops[i], labels)? {
            Operand::Reg(r) => Ok(r),
            Operand::Imm(_) => Err(asm_error(
                line,
                format!("operand {} of {} must be a register", i + 1, opcode),
            )),
        }
    };

    let instr = match opcode {
        Opcode::Nop | Opcode::Halt => {
            expect(0)?;
            Instruction::new(opcode, 0, Operand::Imm(0), Operand::Imm(0))
        }
        Opcode::Mov | Opcode::Load => {
            expect(2)?;
            Instruction::new(opcode, register(0)?, operand(1)?, Operand::Imm(0))
        }
        Opcode::Inc | Opcode::Dec => {
            expect(1)?;
            Instruction::new(opcode, register(0)?, Operand::Imm(0), Operand::Imm(0))
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Cmp | Opcode::Matmul => {
            expect(3)?;
            Instruction::new(opcode, register(0)?, operand(1)?, operand(2)?)
        }
        Opcode::Store | Opcode::Jz | Opcode::Jnz => {
            expect(2)?;
            Instruction::new(opcode, 0, operand(0)?, operand(1)?)
        }
        Opcode::Jmp => {
            expect(1)?;
            Instruction::new(opcode, 0, operand(0)?, Operand::Imm(0))
        }
    };
    Ok(Instruction { shape, ..instr })
}

fn parse_operand(line: usize, text: &str, labels: &HashMap<String, usize>) -> Result<Operand> {
    if let Some(index) = text.strip_prefix(['r', 'R']) {
        if let Ok(r) = index.parse::<u8>() {
            return Ok(Operand::Reg(r));
        }
    }
    if let Some(value) = parse_int(text) {
        return i32::try_from(value)
            .map(Operand::Imm)
            .map_err(|_| asm_error(line, format!("immediate {} does not fit 32 bits", text)));
    }
    match labels.get(text) {
        Some(&index) => i32::try_from(index)
            .map(Operand::Imm)
            .map_err(|_| asm_error(line, format!("label '{}' out of range", text))),
        None => Err(asm_error(line, format!("bad operand '{}'", text))),
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_shape(line: usize, text: &str) -> Result<TileShape> {
    let dims = text
        .split(['x', 'X'])
        .map(|d| d.trim().parse::<u8>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| asm_error(line, format!("bad shape '{}'", text)))?;
    match dims.as_slice() {
        [rows, cols] => Ok(TileShape::elementwise(*rows, *cols)),
        [rows, inner, cols] => Ok(TileShape::matmul(*rows, *inner, *cols)),
        _ => Err(asm_error(line, format!("shape '{}' needs 2 or 3 dimensions", text))),
    }
}
