use std::ptr::NonNull;

use super::raw::RawAlloc;
use crate::util::hint::cold;

// https://gee.cs.oswego.edu/dl/html/malloc.html

/// We never ask dlmalloc for more than its natural alignment, so every request
/// goes down its plain `malloc()` path.
const NATURAL_ALIGN: usize = 1;

/// A private dlmalloc heap (its own segments, obtained from the system), as an
/// underlying allocator. Handy for keeping debug allocations away from the
/// process heap.
pub struct DlMalloc(dlmalloc::Dlmalloc);

impl DlMalloc {
    pub const fn new() -> Self {
        Self(dlmalloc::Dlmalloc::new())
    }
}

impl Default for DlMalloc {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: dlmalloc hands out distinct, non-null (or null on failure) chunks
// of at least the requested size, aligned to at least 8 bytes.
unsafe impl RawAlloc for DlMalloc {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: `size` is non-zero and the alignment is a power of two
        let data = unsafe { self.0.malloc(size, NATURAL_ALIGN) };
        match NonNull::new(data) {
            Some(data) => Some(data),
            None => cold(|| None),
        }
    }

    unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees `ptr` is a live `old_size` chunk of this
        // heap, which we allocated with `NATURAL_ALIGN`
        let data = unsafe { self.0.realloc(ptr.as_ptr(), old_size, NATURAL_ALIGN, new_size) };
        match NonNull::new(data) {
            Some(data) => Some(data),
            None => cold(|| None),
        }
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: identical contract to caller
        unsafe { self.0.free(ptr.as_ptr(), size, NATURAL_ALIGN) }
    }
}
