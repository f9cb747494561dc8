pub mod dlmalloc;
pub mod guard;
pub mod guarded;
pub mod raw;
pub mod registry;

pub use guarded::{AllocInfo, GuardedAlloc};
pub use raw::{LibcMalloc, RawAlloc};
