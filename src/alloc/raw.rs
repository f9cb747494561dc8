//! The allocator underneath the guards. We never ask it for an alignment:
//! whatever it naturally hands out is inferred from the address it returns.

use std::ptr::NonNull;

use crate::util::hint::cold;

pub(crate) mod c {
    pub use libc::{free, malloc, realloc};
}

/// A plain byte allocator, the thing [`GuardedAlloc`] wraps.
///
/// # Safety
///
/// - A block returned by `allocate()` or `resize()` must be valid for reads
///   and writes of the requested size until it is released, and must not
///   overlap any other live block.
/// - Blocks must be aligned to at least 1 (well, obviously) and the address
///   must be non-null. The guarded layer keeps whatever alignment the address
///   happens to have.
///
/// [`GuardedAlloc`]: crate::alloc::guarded::GuardedAlloc
pub unsafe trait RawAlloc {
    /// `size` bytes (`size > 0`), or `None` if the allocator is out of memory
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Grow or shrink `ptr` from `old_size` to `new_size` bytes, moving it if
    /// necessary. On `None` the original block is untouched and still owned by
    /// the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of `old_size` bytes from this allocator.
    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must be a live block of `size` bytes from this allocator, and is
    /// dead afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);
}

/// The C library's `malloc()` family
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcMalloc(());

impl LibcMalloc {
    pub const fn new() -> Self {
        Self(())
    }
}

// SAFETY: `malloc()` and `realloc()` return either null (which we turn into
// `None`) or a fresh block of at least the requested size.
unsafe impl RawAlloc for LibcMalloc {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0);
        // SAFETY: `malloc()` has no preconditions
        let data = unsafe { c::malloc(size) };
        match NonNull::new(data as *mut u8) {
            Some(data) => Some(data),
            None => cold(|| None),
        }
    }

    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        _: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert!(new_size > 0);
        // SAFETY: caller guarantees `ptr` came from `malloc()`/`realloc()`
        // and is live. A null return leaves it untouched.
        let data = unsafe { c::realloc(ptr.as_ptr() as _, new_size) };
        match NonNull::new(data as *mut u8) {
            Some(data) => Some(data),
            None => cold(|| None),
        }
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, _: usize) {
        // SAFETY: identical contract to caller
        unsafe { c::free(ptr.as_ptr() as _) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libc_round_trip_keeps_contents() {
        let mut alloc = LibcMalloc::new();
        let p = alloc.allocate(8).unwrap();
        unsafe {
            p.as_ptr().copy_from_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), 8);
            let q = alloc.resize(p, 8, 4096).unwrap();
            assert_eq!(std::slice::from_raw_parts(q.as_ptr(), 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
            alloc.release(q, 4096);
        }
    }
}
