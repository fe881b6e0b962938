use num_traits::{PrimInt, Unsigned};

///Scratch memory is addressed in fixed-size blocks. Every buffer carved out of a unit's scratch
///must start and end on a block boundary, so tile sizes are always rounded *down* to a block
///multiple before they are handed to the kernel, and element counts are rounded *up* when a
///whole block has to be reserved for a partial row.
///
///Vector instructions additionally work on 256-byte repeats, and gather/scatter traffic on the
///128-byte cache line.
pub const BLOCK_BYTES: usize = 32;
pub const REPEAT_BYTES: usize = 256;
pub const CACHE_LINE_BYTES: usize = 128;

///The `Align` trait provides block arithmetic on any unsigned integer.
///
///A zero alignment or divisor is treated as "no constraint" and returns the value unchanged,
///planners never divide by zero.
pub trait Align: Sized {
    fn calculate_alignment(&self, alignment: Self) -> Self;
    fn align_up(&self, alignment: Self) -> Self;
    fn align_down(&self, alignment: Self) -> Self;
    fn ceil_div(&self, div: Self) -> Self;
}

impl<T: PrimInt + Unsigned> Align for T {
    fn calculate_alignment(&self, alignment: T) -> T {
        if alignment.is_zero() {
            return T::zero();
        }
        let remainder = *self % alignment;
        if remainder.is_zero() {
            T::zero()
        } else {
            alignment - remainder
        }
    }

    fn align_up(&self, alignment: T) -> T {
        *self + self.calculate_alignment(alignment)
    }

    fn align_down(&self, alignment: T) -> T {
        if alignment.is_zero() {
            return *self;
        }
        *self - *self % alignment
    }

    fn ceil_div(&self, div: T) -> T {
        if div.is_zero() {
            return *self;
        }
        let rest = if (*self % div).is_zero() {
            T::zero()
        } else {
            T::one()
        };
        *self / div + rest
    }
}

/// `(loops, tail)` to walk `len` in steps of `factor`. The tail is a full step when `factor`
/// divides `len`.
pub fn loop_tail(len: usize, factor: usize) -> (usize, usize) {
    if len == 0 || factor == 0 {
        return (0, 0);
    }
    let loops = len.ceil_div(factor);
    (loops, len - (loops - 1) * factor)
}
