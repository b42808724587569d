//! Element-wise reduction kernels
//!
//! Every reduction is the same loop: walk two equal-length buffers in index
//! order and fold `incoming` into `acc`. [`Reducer`] supplies the fold, and
//! [`accumulate`] is the loop in the shape a backend expects of a user
//! operator callback. Half-precision sums go through `f32` and round once per
//! combination, so a sum over K ranks rounds K - 1 times.
//!
//! Max and min keep the accumulator unless the incoming value compares
//! strictly greater (or smaller). A NaN already in the accumulator survives.
//! Complex values compare lexicographically on `(re, im)`. Booleans are
//! reduced as bytes with [`LogicalOr`] and [`LogicalAnd`], which always write
//! 0 or 1.

use crate::backend::RawHandle;
use crate::error::{Error, Result};
use half::{bf16, f16};
use num_complex::Complex;
use std::ffi::{c_int, c_void};

/// Combining function of one reduction
pub trait Reducer<T> {
    fn combine(acc: T, incoming: T) -> T;
}

/// Element-wise sum
#[derive(Debug, Clone, Copy)]
pub struct Sum;

/// Element-wise maximum
#[derive(Debug, Clone, Copy)]
pub struct Max;

/// Element-wise minimum
#[derive(Debug, Clone, Copy)]
pub struct Min;

/// Logical or over bytes holding booleans; any non-zero byte is true
#[derive(Debug, Clone, Copy)]
pub struct LogicalOr;

/// Logical and over bytes holding booleans
#[derive(Debug, Clone, Copy)]
pub struct LogicalAnd;

/// Types with a sum; integers wrap on overflow.
pub trait Additive: Copy {
    fn add(self, other: Self) -> Self;
}

/// Types with the strict ordering max and min use.
pub trait Ordered: Copy {
    fn less_than(self, other: Self) -> bool;
}

impl<T: Additive> Reducer<T> for Sum {
    #[inline]
    fn combine(acc: T, incoming: T) -> T {
        acc.add(incoming)
    }
}

impl<T: Ordered> Reducer<T> for Max {
    #[inline]
    fn combine(acc: T, incoming: T) -> T {
        if acc.less_than(incoming) {
            incoming
        } else {
            acc
        }
    }
}

impl<T: Ordered> Reducer<T> for Min {
    #[inline]
    fn combine(acc: T, incoming: T) -> T {
        if incoming.less_than(acc) {
            incoming
        } else {
            acc
        }
    }
}

impl Reducer<u8> for LogicalOr {
    #[inline]
    fn combine(acc: u8, incoming: u8) -> u8 {
        u8::from(acc != 0 || incoming != 0)
    }
}

impl Reducer<u8> for LogicalAnd {
    #[inline]
    fn combine(acc: u8, incoming: u8) -> u8 {
        u8::from(acc != 0 && incoming != 0)
    }
}

macro_rules! integer_reductions {
    ($($ty:ty),+) => {
        $(
            impl Additive for $ty {
                #[inline]
                fn add(self, other: Self) -> Self {
                    self.wrapping_add(other)
                }
            }

            impl Ordered for $ty {
                #[inline]
                fn less_than(self, other: Self) -> bool {
                    self < other
                }
            }
        )+
    };
}

integer_reductions!(u8, u16, u32, u64, i8, i16, i32, i64);

macro_rules! float_reductions {
    ($($ty:ty),+) => {
        $(
            impl Additive for $ty {
                #[inline]
                fn add(self, other: Self) -> Self {
                    self + other
                }
            }

            impl Ordered for $ty {
                #[inline]
                fn less_than(self, other: Self) -> bool {
                    self < other
                }
            }
        )+
    };
}

float_reductions!(f32, f64);

macro_rules! half_reductions {
    ($($ty:ty),+) => {
        $(
            impl Additive for $ty {
                #[inline]
                fn add(self, other: Self) -> Self {
                    <$ty>::from_f32(self.to_f32() + other.to_f32())
                }
            }

            impl Ordered for $ty {
                #[inline]
                fn less_than(self, other: Self) -> bool {
                    self < other
                }
            }
        )+
    };
}

half_reductions!(f16, bf16);

impl<T: Additive> Additive for Complex<T> {
    #[inline]
    fn add(self, other: Self) -> Self {
        Complex::new(self.re.add(other.re), self.im.add(other.im))
    }
}

impl<T: Ordered + PartialEq> Ordered for Complex<T> {
    #[inline]
    fn less_than(self, other: Self) -> bool {
        self.re.less_than(other.re) || (self.re == other.re && self.im.less_than(other.im))
    }
}

/// Backend user-operator callback: `inout[i] = R::combine(inout[i], input[i])`
///
/// Null pointers or a non-positive length make the call a no-op. The two
/// buffers may be the same or overlap; elements are read and written through
/// raw pointers one at a time, with unaligned access when either pointer is
/// not aligned for `T`.
///
/// # Safety
///
/// When non-null, `len` must be readable and both buffers must hold at least
/// `*len` valid `T` values.
pub unsafe extern "C" fn accumulate<T: Copy, R: Reducer<T>>(
    input: *mut c_void,
    inout: *mut c_void,
    len: *mut c_int,
    _datatype: *mut RawHandle,
) {
    if input.is_null() || inout.is_null() || len.is_null() {
        return;
    }
    let count = *len;
    if count <= 0 {
        return;
    }
    let src = input as *const T;
    let dst = inout as *mut T;

    if src.is_aligned() && dst.is_aligned() {
        for i in 0..count as usize {
            let acc = dst.add(i).read();
            dst.add(i).write(R::combine(acc, src.add(i).read()));
        }
    } else {
        for i in 0..count as usize {
            let acc = dst.add(i).read_unaligned();
            dst.add(i).write_unaligned(R::combine(acc, src.add(i).read_unaligned()));
        }
    }
}

/// Safe form of [`accumulate`] over slices
pub fn accumulate_slice<T: Copy, R: Reducer<T>>(input: &[T], acc: &mut [T]) -> Result<()> {
    if input.len() != acc.len() {
        return Err(Error::ShapeMismatch {
            expected: acc.len(),
            actual: input.len(),
        });
    }
    for (a, &x) in acc.iter_mut().zip(input) {
        *a = R::combine(*a, x);
    }
    Ok(())
}
