//! Element and reduction kinds
//!
//! [`ElementKind`] is the dtype tag carried by every [`Array`](crate::Array).
//! [`Element`] ties a Rust type to its tag so typed reads and writes can be
//! checked against the buffer they touch.

use half::{bf16, f16};
use num_complex::{Complex32, Complex64};
use std::fmt;

/// Numeric element kind of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Bool,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    /// IEEE 754 half precision
    Float16,
    /// Brain floating point (8 exponent bits, 7 mantissa bits)
    BFloat16,
    Float32,
    Float64,
    /// Pair of `f32` (real, imaginary)
    Complex64,
    /// Pair of `f64` (real, imaginary)
    Complex128,
}

impl ElementKind {
    /// Every element kind, in declaration order
    pub const ALL: [ElementKind; 15] = [
        ElementKind::Bool,
        ElementKind::UInt8,
        ElementKind::UInt16,
        ElementKind::UInt32,
        ElementKind::UInt64,
        ElementKind::Int8,
        ElementKind::Int16,
        ElementKind::Int32,
        ElementKind::Int64,
        ElementKind::Float16,
        ElementKind::BFloat16,
        ElementKind::Float32,
        ElementKind::Float64,
        ElementKind::Complex64,
        ElementKind::Complex128,
    ];

    /// Size of one element in bytes
    pub const fn size_of(self) -> usize {
        match self {
            ElementKind::Bool | ElementKind::UInt8 | ElementKind::Int8 => 1,
            ElementKind::UInt16 | ElementKind::Int16 | ElementKind::Float16 | ElementKind::BFloat16 => 2,
            ElementKind::UInt32 | ElementKind::Int32 | ElementKind::Float32 => 4,
            ElementKind::UInt64 | ElementKind::Int64 | ElementKind::Float64 | ElementKind::Complex64 => 8,
            ElementKind::Complex128 => 16,
        }
    }

    /// Short lowercase name (`f16`, `c64`, ...)
    pub const fn name(self) -> &'static str {
        match self {
            ElementKind::Bool => "bool",
            ElementKind::UInt8 => "u8",
            ElementKind::UInt16 => "u16",
            ElementKind::UInt32 => "u32",
            ElementKind::UInt64 => "u64",
            ElementKind::Int8 => "i8",
            ElementKind::Int16 => "i16",
            ElementKind::Int32 => "i32",
            ElementKind::Int64 => "i64",
            ElementKind::Float16 => "f16",
            ElementKind::BFloat16 => "bf16",
            ElementKind::Float32 => "f32",
            ElementKind::Float64 => "f64",
            ElementKind::Complex64 => "c64",
            ElementKind::Complex128 => "c128",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element-wise reduction applied by an all-reduce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionKind {
    Sum,
    Max,
    Min,
}

impl ReductionKind {
    pub const ALL: [ReductionKind; 3] = [ReductionKind::Sum, ReductionKind::Max, ReductionKind::Min];

    /// Operation name used in logs and errors
    pub const fn operation_name(self) -> &'static str {
        match self {
            ReductionKind::Sum => "all_sum",
            ReductionKind::Max => "all_max",
            ReductionKind::Min => "all_min",
        }
    }
}

impl fmt::Display for ReductionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReductionKind::Sum => f.write_str("sum"),
            ReductionKind::Max => f.write_str("max"),
            ReductionKind::Min => f.write_str("min"),
        }
    }
}

/// Rust type stored in an array of kind [`Element::KIND`]
///
/// # Safety
///
/// `Self` must be exactly [`ElementKind::size_of`] bytes with alignment of at
/// most 8. All zeroes must be a valid `Self`. Unless the type overrides
/// [`Element::read_raw`] to decode bytes itself, every byte pattern must be a
/// valid `Self` as well.
pub unsafe trait Element: Copy + Send + Sync + 'static {
    const KIND: ElementKind;

    /// Copy `len` values out of a buffer a backend may have written
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned for `Self` and point at `len` values' worth of
    /// initialized bytes.
    unsafe fn read_raw(ptr: *const u8, len: usize) -> Vec<Self> {
        std::slice::from_raw_parts(ptr.cast::<Self>(), len).to_vec()
    }
}

// Any non-zero byte reads as true.
unsafe impl Element for bool {
    const KIND: ElementKind = ElementKind::Bool;

    unsafe fn read_raw(ptr: *const u8, len: usize) -> Vec<Self> {
        std::slice::from_raw_parts(ptr, len).iter().map(|&byte| byte != 0).collect()
    }
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),+ $(,)?) => {
        $(
            unsafe impl Element for $ty {
                const KIND: ElementKind = ElementKind::$kind;
            }
        )+
    };
}

impl_element!(
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f16 => Float16,
    bf16 => BFloat16,
    f32 => Float32,
    f64 => Float64,
    Complex32 => Complex64,
    Complex64 => Complex128,
);
