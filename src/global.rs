//! One process-wide [`GuardedAlloc`] over libc `malloc()`, for hosts that
//! would rather not thread a context through every call. Configured from the
//! environment (see [`Config::from_env`]) the first time it is touched.
//!
//! The `g*!` macros capture the call site with `file!()`/`line!()`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Once,
};

use once_cell::sync::Lazy;

use crate::{
    alloc::{GuardedAlloc, LibcMalloc},
    config::Config,
};

static GLOBAL: Lazy<GuardedAlloc<LibcMalloc>> =
    Lazy::new(|| GuardedAlloc::with_config(LibcMalloc::new(), &Config::from_env()));

static REGISTER_EXIT_HOOK: Once = Once::new();
static EXIT_HOOK_REGISTERED: AtomicBool = AtomicBool::new(false);
static SHUT_DOWN: AtomicBool = AtomicBool::new(false);

/// The process-wide allocator
pub fn global() -> &'static GuardedAlloc<LibcMalloc> {
    &GLOBAL
}

extern "C" fn shutdown_at_exit() {
    if !SHUT_DOWN.swap(true, Ordering::AcqRel) {
        GLOBAL.shutdown();
    }
}

/// Arrange for [`shutdown`] to run at process exit, unless it has been run by
/// hand before then. Calling this more than once does nothing more. Returns
/// whether the hook is in place.
pub fn initialize() -> bool {
    REGISTER_EXIT_HOOK.call_once(|| {
        Lazy::force(&GLOBAL);
        // SAFETY: `shutdown_at_exit` is a plain `extern "C" fn()` that lives
        // for the whole program
        let registered = unsafe { libc::atexit(shutdown_at_exit) } == 0;
        if !registered {
            log::warn!(target: "galloc", "could not register exit hook, leaks will not be reported");
        }
        EXIT_HOOK_REGISTERED.store(registered, Ordering::Release);
    });
    EXIT_HOOK_REGISTERED.load(Ordering::Acquire)
}

/// Report and release everything still live in the global allocator. Returns
/// the number of leaks. The exit hook won't run again afterwards.
pub fn shutdown() -> usize {
    SHUT_DOWN.store(true, Ordering::Release);
    GLOBAL.shutdown()
}

/// [`Provenance`](crate::report::Provenance) of the macro call site
#[macro_export]
macro_rules! here {
    () => {
        $crate::report::Provenance::new(file!(), line!())
    };
}

/// `gmalloc!(bytes)`, see [`GuardedAlloc::allocate`]
#[macro_export]
macro_rules! gmalloc {
    ($bytes:expr) => {
        $crate::global::global().allocate($bytes, $crate::here!())
    };
}

/// `gcalloc!(count, elem_size)`, see [`GuardedAlloc::zero_allocate`]
#[macro_export]
macro_rules! gcalloc {
    ($count:expr, $elem_size:expr) => {
        $crate::global::global().zero_allocate($count, $elem_size, $crate::here!())
    };
}

/// `grealloc!(ptr, bytes)`, see [`GuardedAlloc::resize`]
#[macro_export]
macro_rules! grealloc {
    ($ptr:expr, $bytes:expr) => {
        $crate::global::global().resize($ptr, $bytes, $crate::here!())
    };
}

/// `gfree!(ptr)`, see [`GuardedAlloc::release`]
#[macro_export]
macro_rules! gfree {
    ($ptr:expr) => {
        $crate::global::global().release($ptr, $crate::here!())
    };
}

/// `gxfree!(ptr)`, see [`GuardedAlloc::release_strict`]
#[macro_export]
macro_rules! gxfree {
    ($ptr:expr) => {
        $crate::global::global().release_strict($ptr, $crate::here!())
    };
}
