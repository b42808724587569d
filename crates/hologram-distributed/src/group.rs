//! Communicator groups and collective dispatch
//!
//! A [`Group`] is a shared handle over one backend communicator. Collectives
//! validate their arguments on the calling thread, then enqueue the backend
//! call on a [`Stream`]. Nothing touches the backend until that stream's
//! worker runs the operation, and calls on one group are serialized by a
//! per-group lock.
//!
//! Dropping the last handle of the world group finalizes the backend. A
//! group created by [`Group::split`] frees its communicator instead, and keeps
//! its parent alive until then.

use crate::array::Array;
use crate::backend::{CommBackend, CommHandle, SendBuffer, ANY_TAG};
use crate::error::{Error, Result};
use crate::kind::ReductionKind;
use crate::registry::TypeRegistry;
use crate::runtime::Shared;
use crate::stream::Stream;
use hologram_tracing::collective_span;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Tag used by [`Group::send`]
const SEND_TAG: i32 = 0;

pub(crate) struct GroupInner {
    backend: Arc<dyn CommBackend>,
    registry: Arc<TypeRegistry>,
    shared: Arc<Shared>,
    comm: CommHandle,
    is_world: bool,
    rank: AtomicI32,
    size: AtomicI32,
    comm_lock: Mutex<()>,
    /// Split parent; freed after this communicator
    _parent: Option<Group>,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if self.is_world {
            self.shared.release_world(self.backend.as_ref());
        } else if let Err(err) = self.backend.comm_free(self.comm) {
            warn!(comm = self.comm.as_raw(), error = %err, "failed to free communicator");
        } else {
            debug!(comm = self.comm.as_raw(), "communicator freed");
        }
    }
}

/// Handle to a communicator
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

fn element_count(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::ShapeMismatch {
        expected: i32::MAX as usize,
        actual: len,
    })
}

/// Element count of a gather of `count` elements from each of `size` ranks
fn gathered_len(count: usize, size: usize) -> Result<usize> {
    count
        .checked_mul(size)
        .ok_or_else(|| Error::invalid_argument(format!("gathering {count} elements from {size} ranks overflows")))
}

fn same_kind(input: &Array, output: &Array) -> Result<()> {
    if input.kind() == output.kind() {
        Ok(())
    } else {
        Err(Error::KindMismatch {
            expected: input.kind(),
            actual: output.kind(),
        })
    }
}

impl Group {
    pub(crate) fn world(backend: Arc<dyn CommBackend>, registry: Arc<TypeRegistry>, shared: Arc<Shared>) -> Self {
        let comm = backend.world();
        Self::new(backend, registry, shared, comm, true, None)
    }

    pub(crate) fn from_inner(inner: Arc<GroupInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<GroupInner> {
        Arc::downgrade(&self.inner)
    }

    fn new(
        backend: Arc<dyn CommBackend>,
        registry: Arc<TypeRegistry>,
        shared: Arc<Shared>,
        comm: CommHandle,
        is_world: bool,
        parent: Option<Group>,
    ) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                backend,
                registry,
                shared,
                comm,
                is_world,
                rank: AtomicI32::new(-1),
                size: AtomicI32::new(-1),
                comm_lock: Mutex::new(()),
                _parent: parent,
            }),
        }
    }

    pub fn is_world(&self) -> bool {
        self.inner.is_world
    }

    /// Whether both handles refer to the same group
    pub fn same_group(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// This process's rank in the group; queried once, then cached
    pub fn rank(&self) -> Result<usize> {
        self.cached(&self.inner.rank, |backend, comm| backend.comm_rank(comm))
    }

    /// Number of ranks in the group; queried once, then cached
    pub fn size(&self) -> Result<usize> {
        self.cached(&self.inner.size, |backend, comm| backend.comm_size(comm))
    }

    fn cached(&self, slot: &AtomicI32, query: impl FnOnce(&dyn CommBackend, CommHandle) -> Result<i32>) -> Result<usize> {
        let value = slot.load(Ordering::Acquire);
        if value >= 0 {
            return Ok(value as usize);
        }
        let _guard = self.inner.comm_lock.lock();
        let value = slot.load(Ordering::Acquire);
        if value >= 0 {
            return Ok(value as usize);
        }
        let value = query(self.inner.backend.as_ref(), self.inner.comm)?;
        slot.store(value, Ordering::Release);
        Ok(value.max(0) as usize)
    }

    /// Partition the group by `color`
    ///
    /// Collective over this group. Ranks sharing a color form a child group,
    /// ordered by `key` and then by rank here; `key` defaults to this rank.
    #[tracing::instrument(skip_all, fields(color = color, key = ?key))]
    pub fn split(&self, color: i32, key: Option<i32>) -> Result<Group> {
        if color < 0 {
            return Err(Error::invalid_argument(format!("split color must be non-negative, got {color}")));
        }
        let key = match key {
            Some(key) => key,
            None => i32::try_from(self.rank()?).map_err(|_| Error::invalid_argument("rank exceeds i32"))?,
        };

        let comm = {
            let _guard = self.inner.comm_lock.lock();
            self.inner.backend.comm_split(self.inner.comm, color, key)?
        };
        debug!(color, key, comm = comm.as_raw(), "group split");

        Ok(Self::new(
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.shared),
            comm,
            false,
            Some(self.clone()),
        ))
    }

    /// Element-wise reduction of `input` across the group into `output`
    ///
    /// `input` and `output` may be the same array.
    #[tracing::instrument(skip_all, fields(op = %op, kind = %input.kind(), count = input.len()))]
    pub fn all_reduce(&self, op: ReductionKind, input: &Array, output: &Array, stream: &Stream) -> Result<()> {
        let kind = input.kind();
        let datatype = self.inner.registry.datatype_for(kind)?;
        let op_handle = self.inner.registry.operator_for(kind, op)?;
        same_kind(input, output)?;
        if output.len() != input.len() {
            return Err(Error::ShapeMismatch {
                expected: input.len(),
                actual: output.len(),
            });
        }
        let count = element_count(input.len())?;
        let in_place = input.same_storage(output);

        let group = self.clone();
        let (src, dst) = (input.clone(), output.clone());
        let bytes = input.nbytes();
        let operation = op.operation_name();

        let mut encoder = stream.encoder();
        encoder.set_input_array(input).set_output_array(output);
        encoder.dispatch(move || {
            let _timer = collective_span!(operation, bytes, count = count, in_place = in_place);
            let send = if in_place {
                SendBuffer::InPlace
            } else {
                SendBuffer::Buffer(src.data_ptr())
            };
            let inner = &group.inner;
            let _guard = inner.comm_lock.lock();
            // SAFETY: both arrays hold `count` elements of `datatype` and
            // stay alive until this closure returns.
            unsafe { inner.backend.all_reduce(send, dst.data_ptr(), count, datatype, op_handle, inner.comm) }
        })
    }

    pub fn all_sum(&self, input: &Array, output: &Array, stream: &Stream) -> Result<()> {
        self.all_reduce(ReductionKind::Sum, input, output, stream)
    }

    pub fn all_max(&self, input: &Array, output: &Array, stream: &Stream) -> Result<()> {
        self.all_reduce(ReductionKind::Max, input, output, stream)
    }

    pub fn all_min(&self, input: &Array, output: &Array, stream: &Stream) -> Result<()> {
        self.all_reduce(ReductionKind::Min, input, output, stream)
    }

    /// Concatenate every rank's `input` into `output`, in rank order
    #[tracing::instrument(skip_all, fields(kind = %input.kind(), count = input.len()))]
    pub fn all_gather(&self, input: &Array, output: &Array, stream: &Stream) -> Result<()> {
        let datatype = self.inner.registry.datatype_for(input.kind())?;
        same_kind(input, output)?;
        let size = self.size()?;
        let expected = gathered_len(input.len(), size)?;
        if output.len() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: output.len(),
            });
        }
        let count = element_count(input.len())?;
        element_count(output.len())?;
        if input.same_storage(output) && !input.is_empty() {
            return Err(Error::invalid_argument("all_gather input and output must not alias"));
        }

        let group = self.clone();
        let (src, dst) = (input.clone(), output.clone());
        let bytes = input.nbytes();

        let mut encoder = stream.encoder();
        encoder.set_input_array(input).set_output_array(output);
        encoder.dispatch(move || {
            let _timer = collective_span!("all_gather", bytes, count = count, size = size);
            let inner = &group.inner;
            let _guard = inner.comm_lock.lock();
            // SAFETY: `src` holds `count` and `dst` holds `count * size`
            // elements of `datatype`; both outlive the call.
            unsafe { inner.backend.all_gather(src.data_ptr(), count, datatype, dst.data_ptr(), inner.comm) }
        })
    }

    /// Send `input` to rank `dst`
    #[tracing::instrument(skip_all, fields(kind = %input.kind(), count = input.len(), dst = dst))]
    pub fn send(&self, input: &Array, dst: usize, stream: &Stream) -> Result<()> {
        let datatype = self.inner.registry.datatype_for(input.kind())?;
        let size = self.size()?;
        if dst >= size {
            return Err(Error::InvalidRank { rank: dst, size });
        }
        let count = element_count(input.len())?;

        let group = self.clone();
        let src = input.clone();
        let bytes = input.nbytes();

        let mut encoder = stream.encoder();
        encoder.set_input_array(input);
        encoder.dispatch(move || {
            let _timer = collective_span!("send", bytes, peer = dst, count = count);
            let inner = &group.inner;
            let _guard = inner.comm_lock.lock();
            // SAFETY: `src` holds `count` elements and outlives the call.
            unsafe { inner.backend.send(src.data_ptr(), count, datatype, dst as i32, SEND_TAG, inner.comm) }
        })
    }

    /// Receive into `output` from rank `src`
    ///
    /// Matches any tag, so messages from one sender arrive in the order the
    /// backend delivers them.
    #[tracing::instrument(skip_all, fields(kind = %output.kind(), count = output.len(), src = src))]
    pub fn recv(&self, output: &Array, src: usize, stream: &Stream) -> Result<()> {
        let datatype = self.inner.registry.datatype_for(output.kind())?;
        let size = self.size()?;
        if src >= size {
            return Err(Error::InvalidRank { rank: src, size });
        }
        let count = element_count(output.len())?;

        let group = self.clone();
        let dst = output.clone();
        let bytes = output.nbytes();

        let mut encoder = stream.encoder();
        encoder.set_output_array(output);
        encoder.dispatch(move || {
            let _timer = collective_span!("recv", bytes, peer = src, count = count);
            let inner = &group.inner;
            let _guard = inner.comm_lock.lock();
            // SAFETY: `dst` has room for `count` elements and outlives the call.
            unsafe { inner.backend.recv(dst.data_ptr(), count, datatype, src as i32, ANY_TAG, inner.comm) }
        })
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = |slot: &AtomicI32| Some(slot.load(Ordering::Relaxed)).filter(|&v| v >= 0);
        f.debug_struct("Group")
            .field("backend", &self.inner.backend.name())
            .field("comm", &self.inner.comm.as_raw())
            .field("is_world", &self.inner.is_world)
            .field("rank", &cached(&self.inner.rank))
            .field("size", &cached(&self.inner.size))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::kind::ElementKind;
    use crate::runtime::Runtime;

    fn solo() -> (Arc<LocalBackend>, Group) {
        let backend = Arc::new(LocalBackend::world(1).remove(0));
        let group = Runtime::new(backend.clone()).init(true).unwrap().unwrap();
        (backend, group)
    }

    #[test]
    fn rank_and_size_are_cached() {
        let (backend, group) = solo();
        for _ in 0..3 {
            assert_eq!(group.rank().unwrap(), 0);
            assert_eq!(group.size().unwrap(), 1);
        }
        assert_eq!(backend.stats().rank_queries, 1);
        assert_eq!(backend.stats().size_queries, 1);
    }

    #[test]
    fn gathered_len_checks_overflow() {
        assert_eq!(gathered_len(3, 4).unwrap(), 12);
        assert_eq!(gathered_len(0, usize::MAX).unwrap(), 0);
        assert!(matches!(gathered_len(usize::MAX / 2 + 1, 2), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn negative_color_is_rejected() {
        let (backend, group) = solo();
        assert!(matches!(group.split(-1, None), Err(Error::InvalidArgument(_))));
        assert_eq!(backend.stats().splits, 0);
    }

    #[test]
    fn validation_errors_precede_dispatch() {
        let (backend, group) = solo();
        let stream = Stream::new("validation").unwrap();
        let f32s = Array::zeros(ElementKind::Float32, 4);
        let f64s = Array::zeros(ElementKind::Float64, 4);
        let short = Array::zeros(ElementKind::Float32, 3);

        assert_eq!(
            group.all_sum(&f32s, &f64s, &stream),
            Err(Error::KindMismatch {
                expected: ElementKind::Float32,
                actual: ElementKind::Float64
            })
        );
        assert_eq!(
            group.all_max(&f32s, &short, &stream),
            Err(Error::ShapeMismatch { expected: 4, actual: 3 })
        );
        assert_eq!(
            group.all_gather(&f32s, &short, &stream),
            Err(Error::ShapeMismatch { expected: 4, actual: 3 })
        );
        assert_eq!(group.send(&f32s, 1, &stream), Err(Error::InvalidRank { rank: 1, size: 1 }));
        assert_eq!(group.recv(&f32s, 3, &stream), Err(Error::InvalidRank { rank: 3, size: 1 }));

        stream.synchronize().unwrap();
        assert_eq!(backend.stats().collectives, 0);
    }

    #[test]
    fn child_group_frees_before_world_finalizes() {
        let (backend, world) = solo();
        let child = world.split(0, None).unwrap();
        assert!(!child.is_world());
        assert!(!child.same_group(&world));

        drop(world);
        assert_eq!(backend.stats().finalize_calls, 0);
        assert_eq!(child.size().unwrap(), 1);

        drop(child);
        let stats = backend.stats();
        assert_eq!((stats.frees, stats.finalize_calls), (1, 1));
    }

    #[test]
    fn debug_shows_cached_rank() {
        let (_backend, group) = solo();
        group.rank().unwrap();
        let text = format!("{group:?}");
        assert!(text.contains("rank: Some(0)"), "{text}");
        assert!(text.contains("is_world: true"), "{text}");
    }
}
