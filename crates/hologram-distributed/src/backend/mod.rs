//! Communication backends
//!
//! [`CommBackend`] is the table of native entry points the rest of the crate
//! drives. Handles returned by a backend are opaque pointer-sized values and
//! only mean something to the backend that produced them.
//!
//! Two implementations exist:
//! - [`MpiBackend`]: Open MPI bound at runtime through `libloading`
//! - [`LocalBackend`]: an in-process fabric where each thread is a rank

pub mod local;
pub mod mpi;

pub use local::{LocalBackend, LocalStatsSnapshot};
pub use mpi::{LoadError, MpiApi, MpiBackend};

use crate::error::Result;
use crate::kind::ReductionKind;
use std::ffi::{c_int, c_void};

/// Raw native handle value
pub type RawHandle = usize;

/// Signature of a user-defined reduction callback
///
/// `(input, inout, len, datatype)`: fold `len` elements of `input` into `inout`.
pub type UserFunction = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_int, *mut RawHandle);

/// Tag wildcard accepted by [`CommBackend::recv`]
pub const ANY_TAG: i32 = -1;

macro_rules! raw_handle {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            #[repr(transparent)]
            pub struct $name(RawHandle);

            impl $name {
                pub const fn from_raw(raw: RawHandle) -> Self {
                    Self(raw)
                }

                pub const fn as_raw(self) -> RawHandle {
                    self.0
                }
            }
        )+
    };
}

raw_handle!(
    /// Communicator handle
    CommHandle,
    /// Datatype handle
    DatatypeHandle,
    /// Reduction operator handle
    OpHandle,
);

/// Datatypes every backend provides natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinDatatype {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// Single-precision complex
    Complex64,
}

impl BuiltinDatatype {
    pub const ALL: [BuiltinDatatype; 12] = [
        BuiltinDatatype::Bool,
        BuiltinDatatype::Int8,
        BuiltinDatatype::UInt8,
        BuiltinDatatype::Int16,
        BuiltinDatatype::UInt16,
        BuiltinDatatype::Int32,
        BuiltinDatatype::UInt32,
        BuiltinDatatype::Int64,
        BuiltinDatatype::UInt64,
        BuiltinDatatype::Float32,
        BuiltinDatatype::Float64,
        BuiltinDatatype::Complex64,
    ];

    /// Extent of one element in bytes
    pub const fn size(self) -> usize {
        match self {
            BuiltinDatatype::Bool | BuiltinDatatype::Int8 | BuiltinDatatype::UInt8 => 1,
            BuiltinDatatype::Int16 | BuiltinDatatype::UInt16 => 2,
            BuiltinDatatype::Int32 | BuiltinDatatype::UInt32 | BuiltinDatatype::Float32 => 4,
            BuiltinDatatype::Int64
            | BuiltinDatatype::UInt64
            | BuiltinDatatype::Float64
            | BuiltinDatatype::Complex64 => 8,
        }
    }
}

/// Send-side buffer of a reduction or gather
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBuffer {
    /// Input is already in the receive buffer
    InPlace,
    Buffer(*const c_void),
}

/// Native operation table of a communication backend
///
/// Every call returns `Err(Error::Comm { .. })` when the backend reports a
/// non-success code. Collective calls block until every rank of the
/// communicator has entered them.
pub trait CommBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Bootstrap the backend for this process
    fn init(&self) -> Result<()>;

    fn finalize(&self) -> Result<()>;

    /// Communicator spanning every rank
    fn world(&self) -> CommHandle;

    fn builtin_datatype(&self, datatype: BuiltinDatatype) -> DatatypeHandle;

    fn builtin_op(&self, reduction: ReductionKind) -> OpHandle;

    /// Datatype made of `count` consecutive `base` elements (uncommitted)
    fn type_contiguous(&self, count: i32, base: DatatypeHandle) -> Result<DatatypeHandle>;

    fn type_commit(&self, datatype: DatatypeHandle) -> Result<DatatypeHandle>;

    /// Register a user reduction callback
    fn op_create(&self, function: UserFunction, commute: bool) -> Result<OpHandle>;

    fn comm_rank(&self, comm: CommHandle) -> Result<i32>;

    fn comm_size(&self, comm: CommHandle) -> Result<i32>;

    /// Partition `comm` by `color`, ordering each part by `(key, parent rank)`
    fn comm_split(&self, comm: CommHandle, color: i32, key: i32) -> Result<CommHandle>;

    fn comm_free(&self, comm: CommHandle) -> Result<()>;

    /// Element-wise reduction of `count` elements across `comm`
    ///
    /// # Safety
    ///
    /// `recv` must be writable for `count` elements of `datatype`, and the
    /// send buffer (or `recv` when [`SendBuffer::InPlace`]) readable for the
    /// same, for the duration of the call.
    unsafe fn all_reduce(
        &self,
        send: SendBuffer,
        recv: *mut c_void,
        count: i32,
        datatype: DatatypeHandle,
        op: OpHandle,
        comm: CommHandle,
    ) -> Result<()>;

    /// Concatenate every rank's `count` elements into `recv` in rank order
    ///
    /// # Safety
    ///
    /// `send` must be readable for `count` elements and `recv` writable for
    /// `count * size` elements of `datatype`.
    unsafe fn all_gather(
        &self,
        send: *const c_void,
        count: i32,
        datatype: DatatypeHandle,
        recv: *mut c_void,
        comm: CommHandle,
    ) -> Result<()>;

    /// # Safety
    ///
    /// `buf` must be readable for `count` elements of `datatype`.
    unsafe fn send(
        &self,
        buf: *const c_void,
        count: i32,
        datatype: DatatypeHandle,
        dest: i32,
        tag: i32,
        comm: CommHandle,
    ) -> Result<()>;

    /// Receive at most `count` elements from `source`; `tag` may be [`ANY_TAG`]
    ///
    /// # Safety
    ///
    /// `buf` must be writable for `count` elements of `datatype`.
    unsafe fn recv(
        &self,
        buf: *mut c_void,
        count: i32,
        datatype: DatatypeHandle,
        source: i32,
        tag: i32,
        comm: CommHandle,
    ) -> Result<()>;
}
