//! Host arrays
//!
//! An [`Array`] is a flat, kind-tagged buffer shared by reference count.
//! Clones alias the same storage. Collectives write outputs from a stream
//! worker, so an array tracks how many enqueued operations still have to
//! write it, and reads block until that count drops to zero.

use crate::error::{Error, Result};
use crate::kind::{Element, ElementKind};
use parking_lot::{Condvar, Mutex};
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ARRAY_ID: AtomicU64 = AtomicU64::new(1);

struct Storage {
    id: u64,
    kind: ElementKind,
    len: usize,
    /// 8-byte aligned, from `Box<[u64]>::into_raw`
    words: NonNull<u64>,
    word_count: usize,
    pending: Mutex<usize>,
    ready: Condvar,
}

// SAFETY: the buffer is only touched through raw pointers; ordering between
// writers and readers is provided by the pending count.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Drop for Storage {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.words.as_ptr(), self.word_count);
        // SAFETY: allocated by `Box::into_raw` in `Array::zeros` with this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Kind-tagged host buffer
#[derive(Clone)]
pub struct Array {
    storage: Arc<Storage>,
}

impl Array {
    /// Zero-filled array of `len` elements
    ///
    /// # Panics
    ///
    /// Panics if the byte size overflows `usize`, like `Vec::with_capacity`.
    pub fn zeros(kind: ElementKind, len: usize) -> Self {
        match Self::try_zeros(kind, len) {
            Ok(array) => array,
            Err(err) => panic!("{err}"),
        }
    }

    /// [`Array::zeros`], reporting a byte size that overflows `usize` as an error
    pub fn try_zeros(kind: ElementKind, len: usize) -> Result<Self> {
        let nbytes = len
            .checked_mul(kind.size_of())
            .ok_or_else(|| Error::invalid_argument(format!("{len} {kind} elements overflow the address space")))?;
        let word_count = nbytes.div_ceil(8);
        let boxed: Box<[u64]> = vec![0u64; word_count].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u64;
        // Box never hands out null, even for empty slices.
        let words = NonNull::new(raw).unwrap_or(NonNull::dangling());

        Ok(Self {
            storage: Arc::new(Storage {
                id: NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                len,
                words,
                word_count,
                pending: Mutex::new(0),
                ready: Condvar::new(),
            }),
        })
    }

    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        let array = Self::zeros(T::KIND, values.len());
        // SAFETY: the fresh buffer holds exactly `size_of_val(values)` bytes
        // (rounded up) and nothing else references it yet.
        unsafe {
            std::ptr::copy_nonoverlapping(
                values.as_ptr() as *const u8,
                array.data_ptr() as *mut u8,
                std::mem::size_of_val(values),
            );
        }
        array
    }

    pub fn kind(&self) -> ElementKind {
        self.storage.kind
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.storage.len
    }

    pub fn is_empty(&self) -> bool {
        self.storage.len == 0
    }

    pub fn nbytes(&self) -> usize {
        self.storage.len * self.storage.kind.size_of()
    }

    /// Start of the buffer
    pub fn data_ptr(&self) -> *mut c_void {
        self.storage.words.as_ptr().cast()
    }

    /// Whether both arrays alias one buffer
    pub fn same_storage(&self, other: &Array) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Block until every enqueued write to this array has run
    pub fn wait(&self) {
        let mut pending = self.storage.pending.lock();
        while *pending > 0 {
            self.storage.ready.wait(&mut pending);
        }
    }

    /// Copy the contents out, after pending writes complete
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::KIND != self.kind() {
            return Err(Error::KindMismatch {
                expected: self.kind(),
                actual: T::KIND,
            });
        }
        self.wait();
        // SAFETY: kind matches, so the buffer holds `len` elements of `T`'s
        // size, and it is aligned to 8 >= align_of::<T>().
        Ok(unsafe { T::read_raw(self.data_ptr() as *const u8, self.len()) })
    }

    pub(crate) fn mark_pending(&self) {
        *self.storage.pending.lock() += 1;
    }

    pub(crate) fn complete_pending(&self) {
        let mut pending = self.storage.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.storage.ready.notify_all();
        }
    }

    /// Process-unique identity of the underlying buffer
    pub fn id(&self) -> u64 {
        self.storage.id
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("id", &self.storage.id)
            .field("kind", &self.storage.kind)
            .field("len", &self.storage.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;
    use num_complex::Complex32;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn from_slice_round_trips_through_to_vec() {
        let values = [bf16::from_f32(1.5), bf16::from_f32(-3.0), bf16::from_f32(0.25)];
        let array = Array::from_slice(&values);
        assert_eq!(array.kind(), ElementKind::BFloat16);
        assert_eq!(array.len(), 3);
        assert_eq!(array.nbytes(), 6);
        assert_eq!(array.to_vec::<bf16>().unwrap(), values);
    }

    #[test]
    fn storage_is_eight_byte_aligned() {
        for kind in ElementKind::ALL {
            let array = Array::zeros(kind, 3);
            assert_eq!(array.data_ptr() as usize % 8, 0, "{kind}");
        }
        assert!(Array::zeros(ElementKind::Int8, 0).is_empty());
    }

    #[test]
    fn to_vec_rejects_wrong_element_type() {
        let array = Array::zeros(ElementKind::Complex64, 2);
        assert_eq!(
            array.to_vec::<f64>().unwrap_err(),
            Error::KindMismatch {
                expected: ElementKind::Complex64,
                actual: ElementKind::Float64
            }
        );
        assert_eq!(array.to_vec::<Complex32>().unwrap(), vec![Complex32::new(0.0, 0.0); 2]);
    }

    #[test]
    fn try_zeros_rejects_byte_size_overflow() {
        let err = Array::try_zeros(ElementKind::Float16, usize::MAX / 2 + 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(Array::try_zeros(ElementKind::Int64, usize::MAX / 8 + 1).is_err());
        assert_eq!(Array::try_zeros(ElementKind::Float16, 5).unwrap().nbytes(), 10);
    }

    #[test]
    #[should_panic(expected = "overflow the address space")]
    fn zeros_panics_on_byte_size_overflow() {
        let _ = Array::zeros(ElementKind::Complex64, usize::MAX / 4);
    }

    #[test]
    fn bool_arrays_read_any_nonzero_byte_as_true() {
        let array = Array::zeros(ElementKind::Bool, 3);
        unsafe { (array.data_ptr() as *mut u8).add(1).write(2) };
        assert_eq!(array.to_vec::<bool>().unwrap(), vec![false, true, false]);
    }

    #[test]
    fn clones_share_storage() {
        let a = Array::zeros(ElementKind::Int32, 4);
        let b = a.clone();
        let c = Array::zeros(ElementKind::Int32, 4);
        assert!(a.same_storage(&b));
        assert!(!a.same_storage(&c));
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn wait_blocks_until_pending_writes_complete() {
        let array = Array::zeros(ElementKind::UInt32, 1);
        array.mark_pending();

        let writer = array.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            unsafe { (writer.data_ptr() as *mut u32).write(7) };
            writer.complete_pending();
        });

        assert_eq!(array.to_vec::<u32>().unwrap(), vec![7]);
        handle.join().unwrap();
    }
}
