//! A debug wrapper around some [`RawAlloc`] that surrounds every payload with
//! random canary bytes, and keeps a [`Registry`] of everything it handed out.
//!
//! Each block the underlying allocator gives us looks like this
//!
//! ```plaintext
//! +--------------------+
//! | padding            | usually none
//! | BlockHeader        | HEADER_SIZE bytes
//! +--------------------+
//! | pre-guard          | guard_size bytes
//! +--------------------+ <- what the caller gets
//! | payload            | requested bytes
//! +--------------------+
//! | post-guard         | guard_size bytes
//! +--------------------+
//! ```
//!
//! `guard_size` is the minimum current when the block was made, always a power
//! of two. If the underlying allocator handed back a block aligned more
//! strictly than `HEADER_SIZE + guard_size` allows for, padding goes in front of
//! the header, so the payload is aligned exactly as well as a raw request would
//! have been.
//!
//! Nothing here panics or unwinds on misuse. Bad pointers, exhaustion and
//! corruption are reported to the [`ReportSink`] and show up as `None`/`Err`.
//! Only the `*_strict` entry points (or [`ReleasePolicy::Strict`]) abort.

use std::{
    cmp, mem,
    ptr::{self, NonNull},
    slice,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, trace};
use serde::Serialize;

use super::{
    guard::{GuardPolicy, GuardRng},
    raw::RawAlloc,
    registry::{AllocRecord, Registry},
};
use crate::{
    config::{Config, ReleasePolicy},
    error::ReleaseError,
    report::{Diagnostic, GuardSide, LogSink, Operation, Provenance, ReportSink},
    util::{hint::cold, num::lowest_set_bit},
};

/// Written just before the pre-guard of every block, so a heap dump shows
/// what each block was for. Checked against the registry on release.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// The exact requested size of this allocation
    requested: usize,
    /// Length of each of the two guards
    guard_size: usize,
}

pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

impl BlockHeader {
    fn of(record: &AllocRecord) -> Self {
        Self {
            requested: record.requested(),
            guard_size: record.guard_size(),
        }
    }
}

/// What we know about a live allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AllocInfo {
    /// The payload pointer that was handed out
    pub ptr: usize,
    pub requested: usize,
    pub guard_size: usize,
    pub allocated: Provenance,
}

impl From<&AllocRecord> for AllocInfo {
    fn from(record: &AllocRecord) -> Self {
        Self {
            ptr: record.payload_addr(),
            requested: record.requested(),
            guard_size: record.guard_size(),
            allocated: record.allocated(),
        }
    }
}

struct State<A> {
    raw: A,
    registry: Registry,
    policy: GuardPolicy,
    rng: GuardRng,
}

/// The allocator context. Owns the underlying allocator, the registry and the
/// guard policy, all behind one lock, so every entry point is atomic with
/// respect to every other.
pub struct GuardedAlloc<A>
where
    A: RawAlloc,
{
    state: Mutex<State<A>>,
    sink: Box<dyn ReportSink>,
    release_policy: ReleasePolicy,
}

impl<A> GuardedAlloc<A>
where
    A: RawAlloc,
{
    /// Default [`Config`], reporting through [`LogSink`]
    pub fn new(raw: A) -> Self {
        Self::with_config(raw, &Config::default())
    }

    pub fn with_config(raw: A, config: &Config) -> Self {
        Self {
            state: Mutex::new(State {
                raw,
                registry: Registry::new(),
                policy: GuardPolicy::new(config.min_guard_size),
                rng: GuardRng::new(config.seed),
            }),
            sink: Box::new(LogSink),
            release_policy: config.release_policy,
        }
    }

    /// Report through `sink` instead
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: ReportSink + 'static,
    {
        self.sink = Box::new(sink);
        self
    }

    pub const fn release_policy(&self) -> ReleasePolicy {
        self.release_policy
    }

    fn lock(&self) -> MutexGuard<'_, State<A>> {
        // A panicking sink can't leave the registry half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, diagnostic: Diagnostic) {
        self.sink.report(&diagnostic);
    }

    /// `n` bytes, or `None` if `n == 0` or memory ran out (which is reported).
    pub fn allocate(&self, n: usize, at: Provenance) -> Option<NonNull<u8>> {
        let mut state = self.lock();
        self.allocate_in(&mut state, n, Operation::Allocate, at)
    }

    /// `count * elem_size` zeroed bytes. A product that overflows is reported
    /// as a memory failure.
    pub fn zero_allocate(
        &self,
        count: usize,
        elem_size: usize,
        at: Provenance,
    ) -> Option<NonNull<u8>> {
        let Some(n) = count.checked_mul(elem_size) else {
            return cold(|| {
                self.report(Diagnostic::MemoryFailure {
                    op: Operation::ZeroAllocate,
                    bytes: count.saturating_mul(elem_size),
                    at,
                });
                None
            });
        };
        let mut state = self.lock();
        self.allocate_in(&mut state, n, Operation::ZeroAllocate, at)
    }

    /// `op` only ends up in reports, except that [`Operation::ZeroAllocate`]
    /// clears the payload
    fn allocate_in(
        &self,
        state: &mut State<A>,
        n: usize,
        op: Operation,
        at: Provenance,
    ) -> Option<NonNull<u8>> {
        if n == 0 {
            return None;
        }

        let Some(first) = state.raw.allocate(n) else {
            return cold(|| {
                self.report(Diagnostic::MemoryFailure { op, bytes: n, at });
                None
            });
        };

        let align = lowest_set_bit(first.as_ptr() as usize);
        let guard_size = state.policy.min();
        let layout = state
            .policy
            .front_for(HEADER_SIZE, align)
            .and_then(|front| {
                let total = guard_size
                    .checked_mul(2)?
                    .checked_add(front)?
                    .checked_add(n)?;
                Some((front, total))
            });
        // SAFETY: `first` is a live `n` byte block from `state.raw`; on
        // failure it is still ours, so we release it.
        let grown = layout.and_then(|(front, total)| unsafe {
            state
                .raw
                .resize(first, n, total)
                .map(|block| (block, front, total))
        });
        let Some((block, front, total)) = grown else {
            return cold(|| {
                unsafe { state.raw.release(first, n) };
                self.report(Diagnostic::MemoryFailure {
                    op,
                    bytes: layout.map_or(usize::MAX, |(_, total)| total),
                    at,
                });
                None
            });
        };

        let record = AllocRecord::new(
            block.as_ptr() as usize,
            front,
            n,
            at,
            state.rng.guard(guard_size),
            state.rng.guard(guard_size),
        );
        debug_assert_eq!(record.total_size(), total);

        // SAFETY: `block` is `total` bytes long and every offset below comes
        // from `record`, which describes exactly that block.
        let payload = unsafe {
            let base = block.as_ptr();
            base.add(front - HEADER_SIZE)
                .cast::<BlockHeader>()
                .write_unaligned(BlockHeader::of(&record));
            ptr::copy_nonoverlapping(
                record.pre_guard().as_bytes().as_ptr(),
                base.add(record.pre_guard_offset()),
                guard_size,
            );
            ptr::copy_nonoverlapping(
                record.post_guard().as_bytes().as_ptr(),
                base.add(record.post_guard_offset()),
                guard_size,
            );
            let payload = base.add(record.payload_offset());
            if op == Operation::ZeroAllocate {
                payload.write_bytes(0, n);
            }
            NonNull::new_unchecked(payload)
        };

        if let Err(e) = state.registry.add(record) {
            return cold(|| {
                // SAFETY: never made it into the registry, so nobody else
                // knows about it
                unsafe { state.raw.release(block, total) };
                debug!(target: "galloc", "{e}");
                self.report(Diagnostic::MemoryFailure {
                    op,
                    bytes: mem::size_of::<AllocRecord>(),
                    at,
                });
                None
            });
        }

        trace!(
            target: "galloc",
            "allocate({n}) = {:p} (block {:p}, guard {guard_size}) at {at}",
            payload,
            block
        );
        Some(payload)
    }

    /// Move the allocation at `ptr` to a fresh block of `n` bytes, keeping the
    /// first `min(old, n)` bytes. Null `ptr` is [`GuardedAlloc::allocate`];
    /// `n == 0` is a (warned about) [`GuardedAlloc::release`] returning `None`.
    ///
    /// An unknown or shifted `ptr` is reported and left alone. If the new
    /// block can't be had, the old one stays live and `None` is returned.
    /// Corruption of the old block is reported, and aborts under
    /// [`ReleasePolicy::Strict`].
    pub fn resize(&self, ptr: *mut u8, n: usize, at: Provenance) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(n, at);
        }
        if n == 0 {
            self.report(Diagnostic::ResizeToZero {
                ptr: ptr as usize,
                at,
            });
            let _ = self.release(ptr, at);
            return None;
        }

        let mut state = self.lock();
        let Some(record) = state.registry.find(ptr) else {
            return cold(|| {
                self.report(Diagnostic::ResizeUnallocated {
                    ptr: ptr as usize,
                    at,
                });
                None
            });
        };
        if record.payload_addr() != ptr as usize {
            let diagnostic = Diagnostic::ResizeShifted {
                ptr: ptr as usize,
                expected: record.payload_addr(),
                bytes: record.requested(),
                allocated: record.allocated(),
                at,
            };
            return cold(|| {
                self.report(diagnostic);
                None
            });
        }
        if let Err(e) = self.scan(record, Operation::Resize, at) {
            if self.release_policy == ReleasePolicy::Strict {
                self.abort(Operation::Resize, at);
            }
            debug!(target: "galloc", "resizing corrupted block {ptr:p}: {e}");
        }
        let (base, old_requested) = (record.base(), record.requested());

        let new = self.allocate_in(&mut state, n, Operation::Resize, at)?;
        // SAFETY: `ptr` is the payload of a live record of `old_requested`
        // bytes, `new` is a fresh payload of `n` bytes, so both ranges are in
        // bounds and distinct.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new.as_ptr(), cmp::min(old_requested, n));
        }
        self.free_block(&mut state, base);
        Some(new)
    }

    /// Release `ptr`, then do whatever the configured [`ReleasePolicy`] says
    /// about any problem found.
    pub fn release(&self, ptr: *mut u8, at: Provenance) -> Result<(), ReleaseError> {
        match self.release_policy {
            ReleasePolicy::Lenient => self.release_lenient(ptr, at),
            ReleasePolicy::Strict => {
                self.release_strict(ptr, at);
                Ok(())
            }
        }
    }

    /// Release `ptr`, aborting the process if anything was wrong with it
    pub fn release_strict(&self, ptr: *mut u8, at: Provenance) {
        if self.release_lenient(ptr, at).is_err() {
            self.abort(Operation::Release, at);
        }
    }

    /// Release `ptr`, checking every guard byte on the way.
    ///
    /// - null is a no-op
    /// - a pointer we never handed out is reported and otherwise ignored
    /// - a pointer into the middle of a live block is reported, and the block
    ///   is released anyway
    /// - every overwritten guard byte is reported, and the block is released
    ///   anyway
    pub fn release_lenient(&self, ptr: *mut u8, at: Provenance) -> Result<(), ReleaseError> {
        if ptr.is_null() {
            return Ok(());
        }

        let mut state = self.lock();
        let Some(record) = state.registry.find(ptr) else {
            return cold(|| {
                self.report(Diagnostic::FreeUnallocated {
                    ptr: ptr as usize,
                    at,
                });
                Err(ReleaseError::Unallocated { ptr: ptr as usize })
            });
        };
        let base = record.base();

        if record.payload_addr() != ptr as usize {
            let offset = (ptr as usize).wrapping_sub(record.payload_addr()) as isize;
            self.report(Diagnostic::FreeShifted {
                ptr: ptr as usize,
                expected: record.payload_addr(),
                offset,
                bytes: record.requested(),
                allocated: record.allocated(),
                at,
            });
            self.free_block(&mut state, base);
            return Err(ReleaseError::Shifted { offset });
        }

        let result = self.scan(record, Operation::Release, at);
        trace!(target: "galloc", "release({ptr:p}) at {at}");
        self.free_block(&mut state, base);
        result
    }

    /// Check the guards of the live allocation at `ptr` without releasing it.
    /// Unknown and shifted pointers come back as errors without a report.
    pub fn check(&self, ptr: *const u8, at: Provenance) -> Result<(), ReleaseError> {
        let state = self.lock();
        let record = state
            .registry
            .find(ptr)
            .ok_or(ReleaseError::Unallocated { ptr: ptr as usize })?;
        if record.payload_addr() != ptr as usize {
            return Err(ReleaseError::Shifted {
                offset: (ptr as usize).wrapping_sub(record.payload_addr()) as isize,
            });
        }
        self.scan(record, Operation::Check, at)
    }

    /// Compare the header and both guards of `record`'s block against what we
    /// wrote, reporting every difference.
    fn scan(
        &self,
        record: &AllocRecord,
        op: Operation,
        at: Provenance,
    ) -> Result<(), ReleaseError> {
        let base = record.base() as *const u8;
        let guard_size = record.guard_size();
        // SAFETY: `record` is live, so its block is ours and the header and
        // guard regions were initialized by `allocate_in()`. The payload is
        // never read.
        let (header, pre, post) = unsafe {
            (
                base.add(record.pre_guard_offset() - HEADER_SIZE)
                    .cast::<BlockHeader>()
                    .read_unaligned(),
                slice::from_raw_parts(base.add(record.pre_guard_offset()), guard_size),
                slice::from_raw_parts(base.add(record.post_guard_offset()), guard_size),
            )
        };

        let header_ok = header == BlockHeader::of(record);
        if !header_ok {
            self.report(Diagnostic::HeaderOverwritten {
                op,
                ptr: record.payload_addr(),
                bytes: record.requested(),
                allocated: record.allocated(),
                at,
            });
        }

        let mut guard_bytes = 0;
        let mut overwritten = |side, offset, old, new| {
            guard_bytes += 1;
            self.report(Diagnostic::GuardOverwritten {
                op,
                side,
                offset,
                old,
                new,
                bytes: record.requested(),
                ptr: record.payload_addr(),
                allocated: record.allocated(),
                at,
            });
        };
        for (i, old, new) in record.pre_guard().mismatches(pre) {
            overwritten(GuardSide::Pre, i as isize - guard_size as isize, old, new);
        }
        for (i, old, new) in record.post_guard().mismatches(post) {
            overwritten(GuardSide::Post, (record.requested() + i) as isize, old, new);
        }

        if header_ok && guard_bytes == 0 {
            Ok(())
        } else {
            Err(ReleaseError::Corrupted {
                guard_bytes,
                header: !header_ok,
            })
        }
    }

    /// Forget the block at `base` and give it back to the underlying
    /// allocator
    fn free_block(&self, state: &mut State<A>, base: usize) {
        let record = state.registry.remove(base);
        // SAFETY: the registry only holds blocks we got from `state.raw`, of
        // exactly `total_size()` bytes, and we just stopped tracking it
        unsafe {
            state.raw.release(
                NonNull::new_unchecked(record.base() as *mut u8),
                record.total_size(),
            )
        }
    }

    /// Report every live allocation as a leak, then release it. Returns how
    /// many there were.
    pub fn shutdown(&self) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut leaked: Vec<AllocRecord> = state.registry.drain().collect();
        leaked.sort_by_key(AllocRecord::base);
        for record in &leaked {
            self.report(Diagnostic::Leak {
                ptr: record.payload_addr(),
                bytes: record.requested(),
                allocated: record.allocated(),
            });
            // SAFETY: see `free_block()`
            unsafe {
                state.raw.release(
                    NonNull::new_unchecked(record.base() as *mut u8),
                    record.total_size(),
                )
            }
        }
        if !leaked.is_empty() {
            debug!(target: "galloc", "shutdown released {} leaked block(s)", leaked.len());
        }
        leaked.len()
    }

    /// Raise the minimum guard length for allocations made from now on to at
    /// least `bytes`, rounded up to a power of two. Never lowers it.
    pub fn set_minimum_guard_size(&self, bytes: usize) {
        let mut state = self.lock();
        match state.policy.raise(bytes) {
            Ok(true) => debug!(target: "galloc", "minimum guard size now {}", state.policy.min()),
            Ok(false) => {}
            Err(()) => self.report(Diagnostic::GuardSizeTooLarge { requested: bytes }),
        }
    }

    pub fn min_guard_size(&self) -> usize {
        self.lock().policy.min()
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().registry.len()
    }

    /// Sum of the requested sizes of every live allocation
    pub fn live_bytes(&self) -> usize {
        self.lock().registry.iter().map(AllocRecord::requested).sum()
    }

    /// What we know about the allocation containing `ptr`, if any
    pub fn record_of(&self, ptr: *const u8) -> Option<AllocInfo> {
        self.lock().registry.find(ptr).map(AllocInfo::from)
    }

    /// [`GuardedAlloc::allocate`], aborting instead of returning `None`
    /// (including for `n == 0`)
    pub fn allocate_strict(&self, n: usize, at: Provenance) -> NonNull<u8> {
        match self.allocate(n, at) {
            Some(ptr) => ptr,
            None => self.abort(Operation::Allocate, at),
        }
    }

    /// [`GuardedAlloc::zero_allocate`], aborting instead of returning `None`
    pub fn zero_allocate_strict(&self, count: usize, elem_size: usize, at: Provenance) -> NonNull<u8> {
        match self.zero_allocate(count, elem_size, at) {
            Some(ptr) => ptr,
            None => self.abort(Operation::ZeroAllocate, at),
        }
    }

    /// [`GuardedAlloc::resize`], aborting instead of returning `None`. `n`
    /// must not be 0.
    pub fn resize_strict(&self, ptr: *mut u8, n: usize, at: Provenance) -> NonNull<u8> {
        if n == 0 {
            self.abort(Operation::Resize, at);
        }
        match self.resize(ptr, n, at) {
            Some(ptr) => ptr,
            None => self.abort(Operation::Resize, at),
        }
    }

    #[cold]
    fn abort(&self, op: Operation, at: Provenance) -> ! {
        self.report(Diagnostic::StrictFailure { op, at });
        std::process::abort()
    }
}

impl<A> Drop for GuardedAlloc<A>
where
    A: RawAlloc,
{
    fn drop(&mut self) {
        let live = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .registry
            .len();
        if live != 0 {
            self.shutdown();
        }
    }
}
