/// The largest power of two that divides `addr`, i.e. `addr & -addr`. This is
/// the strongest alignment we can infer for a block handed out at `addr`.
/// Returns 0 for address 0.
pub const fn lowest_set_bit(addr: usize) -> usize {
    addr & addr.wrapping_neg()
}

/// Round up `n` to the nearest multiple of `to`, `None` on overflow
pub fn round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to != 0);
    match n % to {
        0 => Some(n),
        rem => n.checked_add(to - rem),
    }
}

/// Round `n` up to the next power of two (`n` itself if it already is one).
/// `None` if that does not fit in a `usize`.
pub fn next_pow2(n: usize) -> Option<usize> {
    n.checked_next_power_of_two()
}
