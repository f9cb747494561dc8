//! C entry points onto the [global](crate::global) allocator, for C code that
//! wants to route its `malloc()` family through the guards. A header would
//! wrap these as e.g. `#define jmalloc(n) malloc_d((n), __LINE__, __FILE__)`.

use std::{
    ffi::{c_char, c_int, CStr},
    ptr::{self, NonNull},
};

use libc::{c_void, size_t};

use crate::{global, report::Provenance};

/// # Safety
///
/// `file` must be null or a NUL-terminated string that outlives the program,
/// like `__FILE__`.
unsafe fn provenance(line: c_int, file: *const c_char) -> Provenance {
    let file = if file.is_null() {
        "<unknown>"
    } else {
        // SAFETY: caller guarantees a 'static NUL-terminated string
        unsafe { CStr::from_ptr(file) }
            .to_str()
            .unwrap_or("<non-utf8 file>")
    };
    Provenance::new(file, u32::try_from(line).unwrap_or(0))
}

fn into_c(ptr: Option<NonNull<u8>>) -> *mut c_void {
    ptr.map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

/// Register the leak report to run at exit. 0 on success.
#[no_mangle]
pub extern "C" fn alloc_init() -> c_int {
    if global::initialize() {
        0
    } else {
        -1
    }
}

/// Report and release every live allocation. Nonzero if there were any.
#[no_mangle]
pub extern "C" fn alloc_free() -> c_int {
    (global::shutdown() != 0) as c_int
}

/// Raise the minimum guard length for later allocations
#[no_mangle]
pub extern "C" fn alloc_size(size: size_t) {
    global::global().set_minimum_guard_size(size)
}

/// # Safety
///
/// See [`provenance`] for `file`.
#[no_mangle]
pub unsafe extern "C" fn malloc_d(n: size_t, line: c_int, file: *const c_char) -> *mut c_void {
    into_c(global::global().allocate(n, provenance(line, file)))
}

/// # Safety
///
/// See [`provenance`] for `file`.
#[no_mangle]
pub unsafe extern "C" fn calloc_d(
    n: size_t,
    size: size_t,
    line: c_int,
    file: *const c_char,
) -> *mut c_void {
    into_c(global::global().zero_allocate(n, size, provenance(line, file)))
}

/// # Safety
///
/// See [`provenance`] for `file`. `ptr` may be anything; it is only
/// dereferenced once it has been found in the registry.
#[no_mangle]
pub unsafe extern "C" fn realloc_d(
    ptr: *mut c_void,
    n: size_t,
    line: c_int,
    file: *const c_char,
) -> *mut c_void {
    into_c(global::global().resize(ptr.cast(), n, provenance(line, file)))
}

/// # Safety
///
/// See [`realloc_d`].
#[no_mangle]
pub unsafe extern "C" fn free_d(ptr: *mut c_void, line: c_int, file: *const c_char) {
    let _ = global::global().release(ptr.cast(), provenance(line, file));
}

/// # Safety
///
/// See [`provenance`] for `file`.
#[no_mangle]
pub unsafe extern "C" fn xmalloc_d(n: size_t, line: c_int, file: *const c_char) -> *mut c_void {
    global::global()
        .allocate_strict(n, provenance(line, file))
        .as_ptr()
        .cast()
}

/// # Safety
///
/// See [`provenance`] for `file`.
#[no_mangle]
pub unsafe extern "C" fn xcalloc_d(
    n: size_t,
    size: size_t,
    line: c_int,
    file: *const c_char,
) -> *mut c_void {
    global::global()
        .zero_allocate_strict(n, size, provenance(line, file))
        .as_ptr()
        .cast()
}

/// # Safety
///
/// See [`realloc_d`].
#[no_mangle]
pub unsafe extern "C" fn xrealloc_d(
    ptr: *mut c_void,
    n: size_t,
    line: c_int,
    file: *const c_char,
) -> *mut c_void {
    global::global()
        .resize_strict(ptr.cast(), n, provenance(line, file))
        .as_ptr()
        .cast()
}

/// # Safety
///
/// See [`realloc_d`].
#[no_mangle]
pub unsafe extern "C" fn xfree_d(ptr: *mut c_void, line: c_int, file: *const c_char) {
    global::global().release_strict(ptr.cast(), provenance(line, file))
}
