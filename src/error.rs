use thiserror::Error;

/// Why a release (or a standalone guard check) did not come back clean. Every
/// one of these has already been reported to the sink by the time the caller
/// sees it.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("pointer {ptr:#x} was never allocated (or was already released)")]
    Unallocated { ptr: usize },
    #[error("pointer is {offset} bytes away from the start of its allocation")]
    Shifted { offset: isize },
    #[error("{guard_bytes} guard byte(s) overwritten (header overwritten: {header})")]
    Corrupted { guard_bytes: usize, header: bool },
}

/// The registry's own storage could not grow
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("registry out of memory while tracking {live} allocations")]
pub struct RegistryError {
    pub live: usize,
}
