//! # hologram-distributed - Collective Communication
//!
//! Independent ranks exchange and combine array data through a message-passing
//! backend that is discovered at runtime. No build-time link against the native
//! library is required, and a process without it simply reports the layer
//! unavailable.
//!
//! ## Architecture
//!
//! - **Backend Loader** ([`backend::mpi`]): binds Open MPI with `libloading`,
//!   validates its identity and resolves a complete function table
//! - **Capability Table** ([`CommBackend`]): the only seam between dispatch
//!   and a backend; [`LocalBackend`] implements it in-process
//! - **Type Registry** ([`TypeRegistry`]): element kinds to datatypes and
//!   operators, synthesizing half, bfloat16 and complex ordering
//! - **Groups** ([`Group`]): rank/size caching, split, release
//! - **Dispatch**: collectives validated up front, then enqueued on a
//!   [`Stream`] and run in order on its worker thread
//!
//! ## Example
//!
//! ```text
//! use hologram_distributed::{init, Array, Stream};
//!
//! let Some(world) = hologram_distributed::init(false)? else {
//!     return Ok(()); // single-process run
//! };
//! let stream = Stream::new("comm")?;
//! let grads = Array::from_slice(&[0.5f32; 1024]);
//! world.all_sum(&grads, &grads, &stream)?;
//! stream.synchronize()?;
//! let summed: Vec<f32> = grads.to_vec()?;
//! ```
//!
//! ## Configuration
//!
//! The process-wide runtime reads [`LoaderConfig::from_env`] once:
//! `HOLOGRAM_MPI_LIBRARY`, `HOLOGRAM_MPI_IDENTITY` and
//! `HOLOGRAM_DISTRIBUTED_DISABLE`.

pub mod array;
pub mod backend;
pub mod config;
pub mod encoder;
pub mod error;
pub mod group;
pub mod kind;
pub mod reduce;
pub mod registry;
pub mod runtime;
pub mod stream;

pub use array::Array;
pub use backend::{CommBackend, LocalBackend, LocalStatsSnapshot, MpiBackend};
pub use config::LoaderConfig;
pub use encoder::CommandEncoder;
pub use error::{Error, Result};
pub use group::Group;
pub use kind::{Element, ElementKind, ReductionKind};
pub use registry::TypeRegistry;
pub use runtime::Runtime;
pub use stream::{Stream, Task};

/// Whether a communication backend is bound in this process
pub fn is_available() -> bool {
    runtime::global().is_available()
}

/// World group of the process-wide runtime
///
/// Returns `Ok(None)` when no backend is available or bootstrap failed,
/// unless `strict` is set, in which case that is an
/// [`Error::Initialization`]. Repeated calls return the same group.
pub fn init(strict: bool) -> Result<Option<Group>> {
    runtime::global().init(strict)
}
