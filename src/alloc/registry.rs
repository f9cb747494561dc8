//! Bookkeeping for every live guarded block.
//!
//! The host hands us back *payload* pointers, not the base of the underlying
//! block, and may hand us pointers we never produced at all. So we can't trust
//! anything in the block itself until we've found it here. Each record owns the
//! guard bytes we wrote and the offsets needed to find them again.
//!
//! Lookup by interior address is a linear scan over the live records, O(n) in
//! the number of live allocations. Removal is by base address and O(1).

use std::cmp::Ordering;

use hashbrown::HashMap;

use super::guard::Guard;
use crate::{error::RegistryError, report::Provenance};

/// One live allocation.
///
/// ```plaintext
/// base
/// +--------------------+  0
/// | padding            |  only if the block came back over-aligned
/// | BlockHeader        |
/// +--------------------+  payload_offset - guard_size
/// | pre_guard          |
/// +--------------------+  payload_offset            <- pointer given out
/// | payload            |  requested bytes
/// +--------------------+  payload_offset + requested
/// | post_guard         |
/// +--------------------+  total_size
/// ```
#[derive(Debug, Clone)]
pub struct AllocRecord {
    base: usize,
    total_size: usize,
    payload_offset: usize,
    requested: usize,
    allocated: Provenance,
    pre_guard: Guard,
    post_guard: Guard,
}

impl AllocRecord {
    /// `front` is everything before the pre-guard (padding and header).
    ///
    /// # Panics
    ///
    /// If the offsets do not describe the layout above, or the block would
    /// wrap the address space.
    pub fn new(
        base: usize,
        front: usize,
        requested: usize,
        allocated: Provenance,
        pre_guard: Guard,
        post_guard: Guard,
    ) -> Self {
        assert_eq!(pre_guard.len(), post_guard.len(), "guards differ in length");
        let payload_offset = front + pre_guard.len();
        let total_size = payload_offset + requested + post_guard.len();
        assert!(
            base.checked_add(total_size).is_some(),
            "block at {base:#x} of {total_size} bytes wraps"
        );
        Self {
            base,
            total_size,
            payload_offset,
            requested,
            allocated,
            pre_guard,
            post_guard,
        }
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes the caller asked for
    pub const fn requested(&self) -> usize {
        self.requested
    }

    pub fn guard_size(&self) -> usize {
        self.pre_guard.len()
    }

    pub const fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    pub fn pre_guard_offset(&self) -> usize {
        self.payload_offset - self.guard_size()
    }

    pub const fn post_guard_offset(&self) -> usize {
        self.payload_offset + self.requested
    }

    /// The only address that may legitimately be passed back to us
    pub const fn payload_addr(&self) -> usize {
        self.base + self.payload_offset
    }

    pub const fn allocated(&self) -> Provenance {
        self.allocated
    }

    pub fn pre_guard(&self) -> &Guard {
        &self.pre_guard
    }

    pub fn post_guard(&self) -> &Guard {
        &self.post_guard
    }

    /// Where `ptr` falls relative to `[base, base + total_size)`: `Less` below,
    /// `Equal` inside, `Greater` at or past the end.
    pub fn test_interior_ptr(&self, ptr: usize) -> Ordering {
        if ptr < self.base {
            Ordering::Less
        } else if ptr - self.base >= self.total_size {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Every live [`AllocRecord`], keyed by base address
#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<usize, AllocRecord>,
    #[cfg(test)]
    cap: Option<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose storage refuses to hold more than `cap` records
    #[cfg(test)]
    pub(crate) fn with_cap(cap: usize) -> Self {
        Self {
            cap: Some(cap),
            ..Self::default()
        }
    }

    #[cfg(test)]
    fn full(&self) -> bool {
        self.cap.is_some_and(|cap| self.records.len() >= cap)
    }

    #[cfg(not(test))]
    fn full(&self) -> bool {
        false
    }

    /// Start tracking `record`. The only failure is our own storage refusing
    /// to grow; nothing is inserted in that case.
    pub fn add(&mut self, record: AllocRecord) -> Result<(), RegistryError> {
        debug_assert!(
            self.records.values().all(|r| {
                record.test_interior_ptr(r.base()) != Ordering::Equal
                    && r.test_interior_ptr(record.base()) != Ordering::Equal
            }),
            "new block overlaps a live one"
        );
        let refused = RegistryError {
            live: self.records.len(),
        };
        if self.full() {
            return Err(refused);
        }
        self.records.try_reserve(1).map_err(|_| refused)?;
        self.records.insert(record.base(), record);
        Ok(())
    }

    /// The record whose block contains `ptr`, if any. Null is never found.
    pub fn find(&self, ptr: *const u8) -> Option<&AllocRecord> {
        if ptr.is_null() {
            return None;
        }
        let ptr = ptr as usize;
        self.records
            .values()
            .find(|r| r.test_interior_ptr(ptr) == Ordering::Equal)
    }

    /// Stop tracking the block at `base`. `base` must be the base of a live
    /// record, as returned by [`Registry::find`].
    pub fn remove(&mut self, base: usize) -> AllocRecord {
        let record = self
            .records
            .remove(&base)
            .unwrap_or_else(|| panic!("{base:#x} is not the base of a live block"));
        if self.records.capacity() > 2 * (self.records.len() + 1) {
            self.records.shrink_to_fit();
        }
        record
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocRecord> {
        self.records.values()
    }

    /// Take every record out, leaving the registry empty
    pub fn drain(&mut self) -> impl Iterator<Item = AllocRecord> + '_ {
        self.records.drain().map(|(_, r)| r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::guard::GuardRng;

    const AT: Provenance = Provenance::new("registry.rs", 1);

    fn record(base: usize, requested: usize) -> AllocRecord {
        let mut rng = GuardRng::new(Some(base as u64));
        AllocRecord::new(base, 16, requested, AT, rng.guard(32), rng.guard(32))
    }

    #[test]
    fn record_offsets_describe_layout() {
        let r = record(0x1000, 10);
        assert_eq!(r.total_size(), 16 + 32 + 10 + 32);
        assert_eq!(r.pre_guard_offset(), 16);
        assert_eq!(r.payload_offset(), 48);
        assert_eq!(r.payload_addr(), 0x1000 + 48);
        assert_eq!(r.post_guard_offset(), 58);
    }

    #[test]
    fn test_interior_ptr_is_half_open() {
        let r = record(0x1000, 10);
        assert_eq!(r.test_interior_ptr(0xfff), Ordering::Less);
        assert_eq!(r.test_interior_ptr(0x1000), Ordering::Equal);
        assert_eq!(r.test_interior_ptr(0x1000 + 89), Ordering::Equal);
        assert_eq!(r.test_interior_ptr(0x1000 + 90), Ordering::Greater);
    }

    #[test]
    fn find_resolves_any_interior_address() {
        let mut registry = Registry::new();
        registry.add(record(0x1000, 10)).unwrap();
        registry.add(record(0x2000, 100)).unwrap();

        for addr in [0x1000, 0x1030, 0x1059] {
            assert_eq!(registry.find(addr as *const u8).unwrap().base(), 0x1000);
        }
        assert_eq!(registry.find(0x2010 as *const u8).unwrap().base(), 0x2000);
        assert!(registry.find(0x105a as *const u8).is_none());
        assert!(registry.find(0x3000 as *const u8).is_none());
    }

    #[test]
    fn null_is_never_found() {
        let mut registry = Registry::new();
        registry.add(record(0x1000, 10)).unwrap();
        assert!(registry.find(std::ptr::null()).is_none());
    }

    #[test]
    fn remove_forgets_block() {
        let mut registry = Registry::new();
        for i in 1..=8 {
            registry.add(record(i * 0x1000, 8)).unwrap();
        }
        let removed = registry.remove(0x3000);
        assert_eq!(removed.base(), 0x3000);
        assert_eq!(registry.len(), 7);
        assert!(registry.find(0x3040 as *const u8).is_none());
        assert!(registry.find(0x4040 as *const u8).is_some());
    }

    #[test]
    fn drain_empties_registry() {
        let mut registry = Registry::new();
        registry.add(record(0x1000, 1)).unwrap();
        registry.add(record(0x2000, 2)).unwrap();
        assert_eq!(registry.drain().count(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn refused_add_inserts_nothing() {
        let mut registry = Registry::with_cap(1);
        registry.add(record(0x1000, 8)).unwrap();
        assert_eq!(
            registry.add(record(0x2000, 8)).unwrap_err(),
            RegistryError { live: 1 }
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.find(0x2040 as *const u8).is_none());
    }

    #[test]
    #[should_panic]
    fn remove_of_unknown_base_panics() {
        let mut registry = Registry::new();
        registry.remove(0x1000);
    }
}
