//! Bounds-checked views over shared ring memory.
//!
//! [`AtomicBuffer`] owns a block of memory that several threads (or, when
//! file-backed, several processes) access concurrently. Integer fields are
//! always accessed through atomics; payload bytes are copied in and out under
//! the ring's publication protocol. Every accessor checks its range and panics
//! on an out-of-bounds index instead of touching memory it does not own.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::error::{EngineError, Result};

/// Alignment required for the 64-bit trailer fields.
pub const BUFFER_ALIGNMENT: usize = 8;

const HEAP_ALIGNMENT: usize = 64;

enum Backing {
    Heap(Layout),
    Mapped,
}

/// Shared memory addressed by byte index.
pub struct AtomicBuffer {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: all integer access goes through atomics and payload copies are
// ordered by the ring's release/acquire protocol on the record length.
unsafe impl Send for AtomicBuffer {}
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// Allocates a zeroed, cache-line aligned buffer on the heap.
    pub fn allocate(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), HEAP_ALIGNMENT)
            .unwrap_or_else(|_| panic!("invalid buffer layout for {len} bytes"));
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
            Some(base) => base,
            None => std::alloc::handle_alloc_error(layout),
        };

        Self {
            base,
            len,
            backing: Backing::Heap(layout),
        }
    }

    /// Maps `len` bytes of `file` shared and read-write.
    pub fn map_shared(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be > 0",
            ));
        }

        // SAFETY: the file descriptor is valid for the duration of the call and
        // the mapping outlives the descriptor until munmap in Drop.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(Self {
            base,
            len,
            backing: Backing::Mapped,
        })
    }

    /// Returns the buffer length in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Fails unless the base address supports aligned 64-bit atomics.
    pub fn verify_alignment(&self) -> Result<()> {
        let address = self.base.as_ptr() as usize;
        if address % BUFFER_ALIGNMENT != 0 {
            return Err(EngineError::MisalignedBuffer { address });
        }
        Ok(())
    }

    #[inline]
    fn bounds_check(&self, index: usize, len: usize) {
        let in_bounds = index.checked_add(len).is_some_and(|end| end <= self.len);
        assert!(
            in_bounds,
            "index {index} length {len} out of bounds (capacity={})",
            self.len
        );
    }

    #[inline]
    fn atomic_i32(&self, index: usize) -> &AtomicI32 {
        self.bounds_check(index, 4);
        assert!(index % 4 == 0, "index {index} not aligned for i32");
        // SAFETY: in bounds and aligned; the memory lives as long as &self.
        unsafe { &*(self.base.as_ptr().add(index) as *const AtomicI32) }
    }

    #[inline]
    fn atomic_i64(&self, index: usize) -> &AtomicI64 {
        self.bounds_check(index, 8);
        assert!(index % 8 == 0, "index {index} not aligned for i64");
        // SAFETY: in bounds and aligned; the memory lives as long as &self.
        unsafe { &*(self.base.as_ptr().add(index) as *const AtomicI64) }
    }

    /// Reads an `i32` without ordering guarantees.
    #[inline]
    pub fn get_i32(&self, index: usize) -> i32 {
        self.atomic_i32(index).load(Ordering::Relaxed)
    }

    /// Writes an `i32` without ordering guarantees.
    #[inline]
    pub fn put_i32(&self, index: usize, value: i32) {
        self.atomic_i32(index).store(value, Ordering::Relaxed);
    }

    /// Reads an `i32` with acquire ordering.
    #[inline]
    pub fn get_i32_volatile(&self, index: usize) -> i32 {
        self.atomic_i32(index).load(Ordering::Acquire)
    }

    /// Writes an `i32` with release ordering.
    #[inline]
    pub fn put_i32_ordered(&self, index: usize, value: i32) {
        self.atomic_i32(index).store(value, Ordering::Release);
    }

    /// Atomically replaces `expected` with `update`; returns whether it succeeded.
    #[inline]
    pub fn compare_and_set_i32(&self, index: usize, expected: i32, update: i32) -> bool {
        self.atomic_i32(index)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reads an `i64` with acquire ordering.
    #[inline]
    pub fn get_i64_volatile(&self, index: usize) -> i64 {
        self.atomic_i64(index).load(Ordering::Acquire)
    }

    /// Writes an `i64` with release ordering.
    #[inline]
    pub fn put_i64_ordered(&self, index: usize, value: i64) {
        self.atomic_i64(index).store(value, Ordering::Release);
    }

    /// Adds `delta` and returns the previous value.
    #[inline]
    pub fn get_and_add_i64(&self, index: usize, delta: i64) -> i64 {
        self.atomic_i64(index).fetch_add(delta, Ordering::AcqRel)
    }

    /// Copies `src` into the buffer at `index`.
    ///
    /// The caller must own the destination range under the ring protocol
    /// (a claimed, not yet published record).
    pub fn put_bytes(&self, index: usize, src: &[u8]) {
        self.bounds_check(index, src.len());
        // SAFETY: range checked above; src cannot overlap memory we own.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(index), src.len());
        }
    }

    /// Copies bytes starting at `index` into `dst`.
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) {
        dst.copy_from_slice(self.bytes(index, dst.len()));
    }

    /// Borrows `len` bytes starting at `index`.
    ///
    /// Only valid for ranges published to the caller, such as a record handed
    /// to a read handler.
    pub fn bytes(&self, index: usize, len: usize) -> &[u8] {
        self.bounds_check(index, len);
        // SAFETY: range checked above and tied to the lifetime of &self.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(index), len) }
    }
}

impl Drop for AtomicBuffer {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: allocated in `allocate` with this exact layout.
            Backing::Heap(layout) => unsafe { dealloc(self.base.as_ptr(), layout) },
            // SAFETY: mapped in `map_shared` with this exact length.
            Backing::Mapped => unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            },
        }
    }
}

impl std::fmt::Debug for AtomicBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBuffer")
            .field("capacity", &self.len)
            .field("mapped", &matches!(self.backing, Backing::Mapped))
            .finish()
    }
}
