//! Accelerator seam for matrix-class instructions.
//!
//! The vCPU never computes tiles itself; it gathers operands from memory,
//! hands a [`MatrixOp`] to an [`AcceleratorExecutor`] and scatters the
//! result back. [`HostAccelerator`] is the in-process reference backend.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::isa::{Opcode, TileShape};

/// The tile operation requested from the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixKind {
    MatMul,
    Add,
    Sub,
    Mul,
}

impl MatrixKind {
    pub fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::Matmul => Some(MatrixKind::MatMul),
            Opcode::Add => Some(MatrixKind::Add),
            Opcode::Sub => Some(MatrixKind::Sub),
            Opcode::Mul => Some(MatrixKind::Mul),
            _ => None,
        }
    }
}

/// Operands of one offloaded instruction, already read out of vCPU memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixOp {
    pub kind: MatrixKind,
    pub shape: TileShape,
    pub lhs: Vec<i64>,
    pub rhs: Vec<i64>,
}

impl MatrixOp {
    pub fn lhs_len(kind: MatrixKind, shape: &TileShape) -> usize {
        match kind {
            MatrixKind::MatMul => shape.rows as usize * shape.inner as usize,
            _ => shape.output_len(),
        }
    }

    pub fn rhs_len(kind: MatrixKind, shape: &TileShape) -> usize {
        match kind {
            MatrixKind::MatMul => shape.inner as usize * shape.cols as usize,
            _ => shape.output_len(),
        }
    }

    pub fn output_len(&self) -> usize {
        self.shape.output_len()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceleratorError {
    #[error("operand shape mismatch: {0}")]
    Shape(String),

    #[error("accelerator backend failure: {0}")]
    Backend(String),
}

/// Executes matrix-class instructions. Implementations must be thread-safe;
/// the interpreter calls them from the blocking pool.
pub trait AcceleratorExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn execute_matrix_op(&self, op: &MatrixOp) -> Result<Vec<i64>, AcceleratorError>;
}

/// Reference backend computing tiles on the host CPU with wrapping
/// integer arithmetic.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAccelerator;

impl AcceleratorExecutor for HostAccelerator {
    fn name(&self) -> &str {
        "host"
    }

    fn execute_matrix_op(&self, op: &MatrixOp) -> Result<Vec<i64>, AcceleratorError> {
        let lhs_len = MatrixOp::lhs_len(op.kind, &op.shape);
        let rhs_len = MatrixOp::rhs_len(op.kind, &op.shape);
        if op.lhs.len() != lhs_len || op.rhs.len() != rhs_len {
            return Err(AcceleratorError::Shape(format!(
                "{:?} {} expects {}+{} elements, got {}+{}",
                op.kind,
                op.shape,
                lhs_len,
                rhs_len,
                op.lhs.len(),
                op.rhs.len()
            )));
        }

        let out = match op.kind {
            MatrixKind::MatMul => {
                let (rows, inner, cols) = (
                    op.shape.rows as usize,
                    op.shape.inner as usize,
                    op.shape.cols as usize,
                );
                let mut out = vec![0i64; rows * cols];
                for r in 0..rows {
                    for c in 0..cols {
                        let mut acc = 0i64;
                        for k in 0..inner {
                            acc = acc.wrapping_add(
                                op.lhs[r * inner + k].wrapping_mul(op.rhs[k * cols + c]),
                            );
                        }
                        out[r * cols + c] = acc;
                    }
                }
                out
            }
            MatrixKind::Add => zip_with(&op.lhs, &op.rhs, i64::wrapping_add),
            MatrixKind::Sub => zip_with(&op.lhs, &op.rhs, i64::wrapping_sub),
            MatrixKind::Mul => zip_with(&op.lhs, &op.rhs, i64::wrapping_mul),
        };
        Ok(out)
    }
}

fn zip_with(a: &[i64], b: &[i64], f: fn(i64, i64) -> i64) -> Vec<i64> {
    a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect()
}
