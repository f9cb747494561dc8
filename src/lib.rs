//! A debug allocation layer. [`GuardedAlloc`] wraps a plain byte allocator and
//! catches writes past either end of an allocation, frees of pointers it
//! never handed out, and allocations still live at shutdown.
//!
//! ```no_run
//! use galloc::{alloc::LibcMalloc, here, GuardedAlloc};
//!
//! let alloc = GuardedAlloc::new(LibcMalloc::new());
//! let p = alloc.allocate(10, here!()).unwrap();
//! alloc.release(p.as_ptr(), here!()).unwrap();
//! assert_eq!(alloc.shutdown(), 0);
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
pub mod global;
pub mod report;
pub mod util;

pub use alloc::GuardedAlloc;
pub use config::{Config, ReleasePolicy};
pub use error::{RegistryError, ReleaseError};
pub use report::{CollectingSink, Diagnostic, Provenance, ReportSink};
