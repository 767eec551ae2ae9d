/*!
 * Operands
 * Typed values for semaphore reductions and conditional rendering
 *
 * `Operand` is a closed set of integer widths. Every operation matches on
 * the variant once and then runs a function monomorphized for that width.
 */

use serde::{Deserialize, Serialize};

/// Width and signedness of an operand stored in a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    U32,
    U64,
    I32,
    I64,
}

impl OperandKind {
    pub fn size(self) -> usize {
        match self {
            OperandKind::U32 | OperandKind::I32 => 4,
            OperandKind::U64 | OperandKind::I64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
}

/// Semaphore release reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionOp {
    /// Store the operand
    Release,
    Add,
    Min,
    Max,
    /// Increment, wrapping to zero once the current value reaches the operand
    Inc,
    /// Decrement, reloading the operand at zero or above it
    Dec,
    And,
    Or,
    Xor,
}

/// Conditional rendering comparison, `current <op> reference`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    Never,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

trait OperandValue: Copy + Ord {
    const ZERO: Self;
    const ONE: Self;
    fn wrapping_add(self, other: Self) -> Self;
    fn wrapping_sub(self, other: Self) -> Self;
    fn and(self, other: Self) -> Self;
    fn or(self, other: Self) -> Self;
    fn xor(self, other: Self) -> Self;
}

macro_rules! impl_operand_value {
    ($($ty:ty),*) => {
        $(
            impl OperandValue for $ty {
                const ZERO: Self = 0;
                const ONE: Self = 1;
                fn wrapping_add(self, other: Self) -> Self {
                    <$ty>::wrapping_add(self, other)
                }
                fn wrapping_sub(self, other: Self) -> Self {
                    <$ty>::wrapping_sub(self, other)
                }
                fn and(self, other: Self) -> Self {
                    self & other
                }
                fn or(self, other: Self) -> Self {
                    self | other
                }
                fn xor(self, other: Self) -> Self {
                    self ^ other
                }
            }
        )*
    };
}

impl_operand_value!(u32, u64, i32, i64);

fn reduce_value<T: OperandValue>(op: ReductionOp, current: T, operand: T) -> T {
    match op {
        ReductionOp::Release => operand,
        ReductionOp::Add => current.wrapping_add(operand),
        ReductionOp::Min => current.min(operand),
        ReductionOp::Max => current.max(operand),
        ReductionOp::Inc => {
            if current >= operand {
                T::ZERO
            } else {
                current.wrapping_add(T::ONE)
            }
        }
        ReductionOp::Dec => {
            if current == T::ZERO || current > operand {
                operand
            } else {
                current.wrapping_sub(T::ONE)
            }
        }
        ReductionOp::And => current.and(operand),
        ReductionOp::Or => current.or(operand),
        ReductionOp::Xor => current.xor(operand),
    }
}

fn compare_value<T: OperandValue>(condition: Condition, current: T, reference: T) -> bool {
    match condition {
        Condition::Always => true,
        Condition::Never => false,
        Condition::Equal => current == reference,
        Condition::NotEqual => current != reference,
        Condition::Less => current < reference,
        Condition::LessEqual => current <= reference,
        Condition::Greater => current > reference,
        Condition::GreaterEqual => current >= reference,
    }
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::U32(_) => OperandKind::U32,
            Operand::U64(_) => OperandKind::U64,
            Operand::I32(_) => OperandKind::I32,
            Operand::I64(_) => OperandKind::I64,
        }
    }

    /// Decode a little-endian value of `kind`; `None` when `bytes` is too short
    pub fn from_le_bytes(kind: OperandKind, bytes: &[u8]) -> Option<Operand> {
        let bytes = bytes.get(..kind.size())?;
        let mut wide = [0u8; 8];
        wide[..bytes.len()].copy_from_slice(bytes);
        let mut narrow = [0u8; 4];
        narrow.copy_from_slice(&wide[..4]);
        Some(match kind {
            OperandKind::U32 => Operand::U32(u32::from_le_bytes(narrow)),
            OperandKind::I32 => Operand::I32(i32::from_le_bytes(narrow)),
            OperandKind::U64 => Operand::U64(u64::from_le_bytes(wide)),
            OperandKind::I64 => Operand::I64(i64::from_le_bytes(wide)),
        })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            Operand::U32(v) => v.to_le_bytes().to_vec(),
            Operand::U64(v) => v.to_le_bytes().to_vec(),
            Operand::I32(v) => v.to_le_bytes().to_vec(),
            Operand::I64(v) => v.to_le_bytes().to_vec(),
        }
    }

    /// Apply `op` with `self` as the current value; `None` on a width mismatch
    pub fn reduce(self, op: ReductionOp, operand: Operand) -> Option<Operand> {
        Some(match (self, operand) {
            (Operand::U32(a), Operand::U32(b)) => Operand::U32(reduce_value(op, a, b)),
            (Operand::U64(a), Operand::U64(b)) => Operand::U64(reduce_value(op, a, b)),
            (Operand::I32(a), Operand::I32(b)) => Operand::I32(reduce_value(op, a, b)),
            (Operand::I64(a), Operand::I64(b)) => Operand::I64(reduce_value(op, a, b)),
            _ => return None,
        })
    }

    /// Evaluate `self <condition> reference`; `None` on a width mismatch
    pub fn compare(self, condition: Condition, reference: Operand) -> Option<bool> {
        Some(match (self, reference) {
            (Operand::U32(a), Operand::U32(b)) => compare_value(condition, a, b),
            (Operand::U64(a), Operand::U64(b)) => compare_value(condition, a, b),
            (Operand::I32(a), Operand::I32(b)) => compare_value(condition, a, b),
            (Operand::I64(a), Operand::I64(b)) => compare_value(condition, a, b),
            _ => return None,
        })
    }
}
