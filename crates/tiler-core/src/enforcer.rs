use std::ops::RangeInclusive;

use crate::{DType, Operand};

#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error("Shape mismatch between operands {left} and {right}, {a} != {b}.")]
    ShapeMismatch {
        left: usize,
        right: usize,
        a: usize,
        b: usize,
    },
    #[error("Rank mismatch. {accepted:?} != {actual}.")]
    RankMismatch {
        accepted: RangeInclusive<usize>,
        actual: usize,
    },
    #[error("Wrong operand arity. Allowed range is {accepted:?}, workload has {actual}.")]
    OperandArity {
        accepted: RangeInclusive<usize>,
        actual: usize,
    },
    #[error("DType mismatch, expected {expected:?}, got {actual:?}.")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error("Too many operands for a fixed-size record: {actual} > {max}.")]
    TooManyOperands { max: usize, actual: usize },
}

/// # Enforcer
///
/// Enforces the few structural invariants planning cannot be defined without.
/// Everything else (broadcasting, value ranges) is assumed checked upstream.
pub struct Enforcer;

impl Enforcer {
    pub fn check_arity(
        operands: &[Operand],
        accepted: RangeInclusive<usize>,
    ) -> Result<(), InvariantError> {
        let actual = operands.len();
        if !accepted.contains(&actual) {
            return Err(InvariantError::OperandArity { accepted, actual });
        }
        Ok(())
    }

    pub fn check_max_operands(operands: &[Operand], max: usize) -> Result<(), InvariantError> {
        if operands.len() > max {
            return Err(InvariantError::TooManyOperands {
                max,
                actual: operands.len(),
            });
        }
        Ok(())
    }

    pub fn assert_rank_range(
        operand: &Operand,
        accepted: RangeInclusive<usize>,
    ) -> Result<(), InvariantError> {
        let actual = operand.shape.rank();
        if !accepted.contains(&actual) {
            return Err(InvariantError::RankMismatch { accepted, actual });
        }
        Ok(())
    }

    /// Trailing dims of `inner` must match the trailing dims of `outer`.
    pub fn check_trailing_dims(
        outer: &Operand,
        inner: &Operand,
    ) -> Result<(), InvariantError> {
        let (o, i) = (outer.shape.rank(), inner.shape.rank());
        if i > o {
            return Err(InvariantError::RankMismatch {
                accepted: 0..=o,
                actual: i,
            });
        }
        for k in 0..i {
            let (a, b) = (outer.shape[o - i + k], inner.shape[k]);
            if a != b {
                return Err(InvariantError::ShapeMismatch {
                    left: o - i + k,
                    right: k,
                    a,
                    b,
                });
            }
        }
        Ok(())
    }

    pub fn check_dtype_match(operands: &[Operand]) -> Result<DType, InvariantError> {
        let Some(first) = operands.first() else {
            return Ok(DType::default());
        };
        for operand in operands.iter().skip(1) {
            if first.dtype != operand.dtype {
                return Err(InvariantError::DTypeMismatch {
                    expected: first.dtype,
                    actual: operand.dtype,
                });
            }
        }
        Ok(first.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn trailing_dims_must_agree() {
        let x = Operand::new(shape![8, 16, 64], DType::F16);
        let gamma = Operand::new(shape![16, 64], DType::F16);
        assert!(Enforcer::check_trailing_dims(&x, &gamma).is_ok());

        let bad = Operand::new(shape![32], DType::F16);
        assert!(matches!(
            Enforcer::check_trailing_dims(&x, &bad),
            Err(InvariantError::ShapeMismatch { left: 2, right: 0, a: 64, b: 32 })
        ));
        assert!(matches!(
            Enforcer::check_trailing_dims(&gamma, &x),
            Err(InvariantError::RankMismatch { .. })
        ));
    }

    #[test]
    fn dtype_and_arity() {
        let ops = [
            Operand::new(shape![4], DType::F32),
            Operand::new(shape![4], DType::F16),
        ];
        assert!(matches!(
            Enforcer::check_dtype_match(&ops),
            Err(InvariantError::DTypeMismatch { expected: DType::F32, actual: DType::F16 })
        ));
        assert!(Enforcer::check_arity(&ops, 1..=2).is_ok());
        assert!(matches!(
            Enforcer::check_arity(&ops, 3..=3),
            Err(InvariantError::OperandArity { actual: 2, .. })
        ));
        assert!(Enforcer::check_max_operands(&ops, 1).is_err());
    }
}
