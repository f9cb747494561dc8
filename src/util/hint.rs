/// Run `f` on a path we expect to be taken rarely (allocation failures,
/// corruption reports).
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
