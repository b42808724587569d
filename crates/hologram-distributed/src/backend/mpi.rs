//! Open MPI bound at runtime
//!
//! Nothing links against `libmpi` at build time. [`MpiApi::load`] opens the
//! library, checks its version string identifies the expected ABI, then
//! resolves every function and predefined object the crate uses. If any
//! symbol is missing the library is closed again and no table exists.
//!
//! Handle values follow the Open MPI ABI: communicators, datatypes and ops
//! are pointers, and the predefined ones are the addresses of exported
//! `ompi_mpi_*` objects.

use super::{BuiltinDatatype, CommBackend, CommHandle, DatatypeHandle, OpHandle, RawHandle, SendBuffer, UserFunction};
use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::kind::ReductionKind;
use libloading::Library;
use std::ffi::{c_char, c_int, c_void};
use tracing::{debug, info, trace};

pub const MPI_SUCCESS: c_int = 0;
pub const MPI_ANY_TAG: c_int = -1;
/// `MPI_MAX_LIBRARY_VERSION_STRING` in Open MPI
pub const MAX_LIBRARY_VERSION_STRING: usize = 256;

const IN_PLACE: *const c_void = 1 as *const c_void;

/// `MPI_Status` as laid out by Open MPI
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpiStatus {
    pub source: c_int,
    pub tag: c_int,
    pub error: c_int,
    pub cancelled: c_int,
    pub ucount: usize,
}

type InitFn = unsafe extern "C" fn(*mut c_int, *mut *mut *mut c_char) -> c_int;
type FinalizeFn = unsafe extern "C" fn() -> c_int;
type CommQueryFn = unsafe extern "C" fn(RawHandle, *mut c_int) -> c_int;
type CommSplitFn = unsafe extern "C" fn(RawHandle, c_int, c_int, *mut RawHandle) -> c_int;
type CommFreeFn = unsafe extern "C" fn(*mut RawHandle) -> c_int;
type AllreduceFn =
    unsafe extern "C" fn(*const c_void, *mut c_void, c_int, RawHandle, RawHandle, RawHandle) -> c_int;
type AllgatherFn = unsafe extern "C" fn(
    *const c_void,
    c_int,
    RawHandle,
    *mut c_void,
    c_int,
    RawHandle,
    RawHandle,
) -> c_int;
type SendFn = unsafe extern "C" fn(*const c_void, c_int, RawHandle, c_int, c_int, RawHandle) -> c_int;
type RecvFn =
    unsafe extern "C" fn(*mut c_void, c_int, RawHandle, c_int, c_int, RawHandle, *mut MpiStatus) -> c_int;
type TypeContiguousFn = unsafe extern "C" fn(c_int, RawHandle, *mut RawHandle) -> c_int;
type TypeCommitFn = unsafe extern "C" fn(*mut RawHandle) -> c_int;
type OpCreateFn = unsafe extern "C" fn(UserFunction, c_int, *mut RawHandle) -> c_int;
type GetLibraryVersionFn = unsafe extern "C" fn(*mut c_char, *mut c_int) -> c_int;

/// Why the native library could not be bound
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("could not open {name}: {source}")]
    LibraryNotFound {
        name: String,
        #[source]
        source: libloading::Error,
    },

    #[error("symbol {name} not found: {source}")]
    MissingSymbol {
        name: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("MPI_Get_library_version returned {0}")]
    VersionQuery(i32),

    #[error("library identifies as {found:?}, expected {expected:?}")]
    VersionMismatch { expected: String, found: String },
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::VersionMismatch { expected, found } => Error::VersionMismatch { expected, found },
            other => Error::BackendUnavailable(other.to_string()),
        }
    }
}

/// Resolved Open MPI entry points and predefined handles
pub struct MpiApi {
    version: String,

    init: InitFn,
    finalize: FinalizeFn,
    comm_rank: CommQueryFn,
    comm_size: CommQueryFn,
    comm_split: CommSplitFn,
    comm_free: CommFreeFn,
    allreduce: AllreduceFn,
    allgather: AllgatherFn,
    send: SendFn,
    recv: RecvFn,
    type_contiguous: TypeContiguousFn,
    type_commit: TypeCommitFn,
    op_create: OpCreateFn,

    comm_world: RawHandle,
    op_sum: RawHandle,
    op_max: RawHandle,
    op_min: RawHandle,
    /// Indexed like [`BuiltinDatatype::ALL`]
    datatypes: [RawHandle; BuiltinDatatype::ALL.len()],

    // Dropped last; every pointer above points into it.
    _library: Library,
}

const DATATYPE_SYMBOLS: [&str; BuiltinDatatype::ALL.len()] = [
    "ompi_mpi_c_bool",
    "ompi_mpi_int8_t",
    "ompi_mpi_uint8_t",
    "ompi_mpi_int16_t",
    "ompi_mpi_uint16_t",
    "ompi_mpi_int32_t",
    "ompi_mpi_uint32_t",
    "ompi_mpi_int64_t",
    "ompi_mpi_uint64_t",
    "ompi_mpi_float",
    "ompi_mpi_double",
    "ompi_mpi_c_complex",
];

impl MpiApi {
    /// Open, validate and bind the library described by `config`
    pub fn load(config: &LoaderConfig) -> std::result::Result<Self, LoadError> {
        let name = config.library_name();
        let library = open(&name).map_err(|source| LoadError::LibraryNotFound {
            name: name.to_string_lossy().into_owned(),
            source,
        })?;
        debug!(library = %name.to_string_lossy(), "opened communication library");

        // SAFETY: every symbol is resolved with the C signature Open MPI
        // exports it under, and the pointers stay inside `library`, which
        // the table owns.
        unsafe {
            let get_version: GetLibraryVersionFn = function(&library, "MPI_Get_library_version")?;
            let version = read_library_version(get_version)?;
            validate_identity(&version, &config.expected_identity)?;

            let mut datatypes = [0; BuiltinDatatype::ALL.len()];
            for (slot, symbol) in datatypes.iter_mut().zip(DATATYPE_SYMBOLS) {
                *slot = object(&library, symbol)?;
            }

            let api = Self {
                init: function(&library, "MPI_Init")?,
                finalize: function(&library, "MPI_Finalize")?,
                comm_rank: function(&library, "MPI_Comm_rank")?,
                comm_size: function(&library, "MPI_Comm_size")?,
                comm_split: function(&library, "MPI_Comm_split")?,
                comm_free: function(&library, "MPI_Comm_free")?,
                allreduce: function(&library, "MPI_Allreduce")?,
                allgather: function(&library, "MPI_Allgather")?,
                send: function(&library, "MPI_Send")?,
                recv: function(&library, "MPI_Recv")?,
                type_contiguous: function(&library, "MPI_Type_contiguous")?,
                type_commit: function(&library, "MPI_Type_commit")?,
                op_create: function(&library, "MPI_Op_create")?,
                comm_world: object(&library, "ompi_mpi_comm_world")?,
                op_sum: object(&library, "ompi_mpi_op_sum")?,
                op_max: object(&library, "ompi_mpi_op_max")?,
                op_min: object(&library, "ompi_mpi_op_min")?,
                datatypes,
                version,
                _library: library,
            };
            info!(version = %api.version.trim(), "bound communication library");
            Ok(api)
        }
    }

    /// Version string the library reported
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl std::fmt::Debug for MpiApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpiApi")
            .field("version", &self.version)
            .field("comm_world", &format_args!("{:#x}", self.comm_world))
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn open(name: &std::ffi::OsStr) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    // Open MPI loads its own components with dlopen and needs libmpi's
    // symbols globally visible.
    unsafe { UnixLibrary::open(Some(name), RTLD_NOW | RTLD_GLOBAL).map(Library::from) }
}

#[cfg(not(unix))]
fn open(name: &std::ffi::OsStr) -> std::result::Result<Library, libloading::Error> {
    unsafe { Library::new(name) }
}

unsafe fn function<T: Copy>(library: &Library, name: &'static str) -> std::result::Result<T, LoadError> {
    library
        .get::<T>(name.as_bytes())
        .map(|symbol| *symbol)
        .map_err(|source| LoadError::MissingSymbol { name, source })
}

unsafe fn object(library: &Library, name: &'static str) -> std::result::Result<RawHandle, LoadError> {
    library
        .get::<*mut c_void>(name.as_bytes())
        .map(|symbol| *symbol as RawHandle)
        .map_err(|source| LoadError::MissingSymbol { name, source })
}

unsafe fn read_library_version(get_version: GetLibraryVersionFn) -> std::result::Result<String, LoadError> {
    let mut buf = [0 as c_char; MAX_LIBRARY_VERSION_STRING];
    let mut len: c_int = 0;
    let code = get_version(buf.as_mut_ptr(), &mut len);
    if code != MPI_SUCCESS {
        return Err(LoadError::VersionQuery(code));
    }
    let len = (len.max(0) as usize).min(buf.len());
    let bytes: Vec<u8> = buf[..len].iter().map(|&c| c as u8).take_while(|&b| b != 0).collect();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Accept `version` only if it contains `expected`
pub fn validate_identity(version: &str, expected: &str) -> std::result::Result<(), LoadError> {
    if version.contains(expected) {
        Ok(())
    } else {
        Err(LoadError::VersionMismatch {
            expected: expected.to_string(),
            found: version.trim().to_string(),
        })
    }
}

fn check(operation: &'static str, code: c_int) -> Result<()> {
    if code == MPI_SUCCESS {
        Ok(())
    } else {
        Err(Error::comm(operation, code))
    }
}

/// [`CommBackend`] over a bound Open MPI library
#[derive(Debug)]
pub struct MpiBackend {
    api: MpiApi,
}

impl MpiBackend {
    pub fn new(api: MpiApi) -> Self {
        Self { api }
    }

    pub fn load(config: &LoaderConfig) -> std::result::Result<Self, LoadError> {
        MpiApi::load(config).map(Self::new)
    }

    pub fn api(&self) -> &MpiApi {
        &self.api
    }
}

impl CommBackend for MpiBackend {
    fn name(&self) -> &'static str {
        "mpi"
    }

    fn init(&self) -> Result<()> {
        // MPI-2 allows null argc/argv.
        check("init", unsafe { (self.api.init)(std::ptr::null_mut(), std::ptr::null_mut()) })
    }

    fn finalize(&self) -> Result<()> {
        check("finalize", unsafe { (self.api.finalize)() })
    }

    fn world(&self) -> CommHandle {
        CommHandle::from_raw(self.api.comm_world)
    }

    fn builtin_datatype(&self, datatype: BuiltinDatatype) -> DatatypeHandle {
        DatatypeHandle::from_raw(self.api.datatypes[datatype as usize])
    }

    fn builtin_op(&self, reduction: ReductionKind) -> OpHandle {
        OpHandle::from_raw(match reduction {
            ReductionKind::Sum => self.api.op_sum,
            ReductionKind::Max => self.api.op_max,
            ReductionKind::Min => self.api.op_min,
        })
    }

    fn type_contiguous(&self, count: i32, base: DatatypeHandle) -> Result<DatatypeHandle> {
        let mut raw: RawHandle = 0;
        check("type_contiguous", unsafe {
            (self.api.type_contiguous)(count, base.as_raw(), &mut raw)
        })?;
        Ok(DatatypeHandle::from_raw(raw))
    }

    fn type_commit(&self, datatype: DatatypeHandle) -> Result<DatatypeHandle> {
        let mut raw = datatype.as_raw();
        check("type_commit", unsafe { (self.api.type_commit)(&mut raw) })?;
        Ok(DatatypeHandle::from_raw(raw))
    }

    fn op_create(&self, function: UserFunction, commute: bool) -> Result<OpHandle> {
        let mut raw: RawHandle = 0;
        check("op_create", unsafe {
            (self.api.op_create)(function, c_int::from(commute), &mut raw)
        })?;
        Ok(OpHandle::from_raw(raw))
    }

    fn comm_rank(&self, comm: CommHandle) -> Result<i32> {
        let mut rank: c_int = -1;
        check("comm_rank", unsafe { (self.api.comm_rank)(comm.as_raw(), &mut rank) })?;
        Ok(rank)
    }

    fn comm_size(&self, comm: CommHandle) -> Result<i32> {
        let mut size: c_int = -1;
        check("comm_size", unsafe { (self.api.comm_size)(comm.as_raw(), &mut size) })?;
        Ok(size)
    }

    fn comm_split(&self, comm: CommHandle, color: i32, key: i32) -> Result<CommHandle> {
        let mut raw: RawHandle = 0;
        check("comm_split", unsafe {
            (self.api.comm_split)(comm.as_raw(), color, key, &mut raw)
        })?;
        Ok(CommHandle::from_raw(raw))
    }

    fn comm_free(&self, comm: CommHandle) -> Result<()> {
        let mut raw = comm.as_raw();
        check("comm_free", unsafe { (self.api.comm_free)(&mut raw) })
    }

    unsafe fn all_reduce(
        &self,
        send: SendBuffer,
        recv: *mut c_void,
        count: i32,
        datatype: DatatypeHandle,
        op: OpHandle,
        comm: CommHandle,
    ) -> Result<()> {
        let send = match send {
            SendBuffer::InPlace => IN_PLACE,
            SendBuffer::Buffer(ptr) => ptr,
        };
        check(
            "all_reduce",
            (self.api.allreduce)(send, recv, count, datatype.as_raw(), op.as_raw(), comm.as_raw()),
        )
    }

    unsafe fn all_gather(
        &self,
        send: *const c_void,
        count: i32,
        datatype: DatatypeHandle,
        recv: *mut c_void,
        comm: CommHandle,
    ) -> Result<()> {
        check(
            "all_gather",
            (self.api.allgather)(
                send,
                count,
                datatype.as_raw(),
                recv,
                count,
                datatype.as_raw(),
                comm.as_raw(),
            ),
        )
    }

    unsafe fn send(
        &self,
        buf: *const c_void,
        count: i32,
        datatype: DatatypeHandle,
        dest: i32,
        tag: i32,
        comm: CommHandle,
    ) -> Result<()> {
        check(
            "send",
            (self.api.send)(buf, count, datatype.as_raw(), dest, tag, comm.as_raw()),
        )
    }

    unsafe fn recv(
        &self,
        buf: *mut c_void,
        count: i32,
        datatype: DatatypeHandle,
        source: i32,
        tag: i32,
        comm: CommHandle,
    ) -> Result<()> {
        let mut status = MpiStatus::default();
        let tag = if tag == super::ANY_TAG { MPI_ANY_TAG } else { tag };
        check(
            "recv",
            (self.api.recv)(buf, count, datatype.as_raw(), source, tag, comm.as_raw(), &mut status),
        )?;
        trace!(source = status.source, tag = status.tag, "received message");
        Ok(())
    }
}
