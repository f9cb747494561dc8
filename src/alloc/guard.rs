//! Canary bytes written either side of every payload, and the policy that
//! decides how many of them there are.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::util::num::{next_pow2, round_up};

/// Guard length used until somebody asks for more
pub const DEFAULT_MIN_GUARD_SIZE: usize = 32;

/// A run of random bytes. The length is stored, so any byte value (including
/// 0) is a valid guard byte.
#[derive(Clone, PartialEq, Eq)]
pub struct Guard {
    bytes: Box<[u8]>,
}

impl Guard {
    /// `len` uniformly random bytes
    pub fn generate<R: Rng>(len: usize, rng: &mut R) -> Self {
        let mut bytes = vec![0u8; len].into_boxed_slice();
        rng.fill(&mut bytes[..]);
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Indices (into the guard) of every byte in `actual` that differs from
    /// what we wrote, paired with the byte we expected and the byte we found.
    /// Scans the whole guard; the first mismatch does not stop it.
    pub fn mismatches<'a>(
        &'a self,
        actual: &'a [u8],
    ) -> impl Iterator<Item = (usize, u8, u8)> + 'a {
        debug_assert_eq!(actual.len(), self.len());
        self.bytes
            .iter()
            .zip(actual)
            .enumerate()
            .filter(|(_, (old, new))| old != new)
            .map(|(i, (&old, &new))| (i, old, new))
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guard[")?;
        for (i, b) in self.bytes.iter().enumerate() {
            write!(f, "{b:02x}")?;
            if i + 1 != self.bytes.len() {
                write!(f, " ")?;
            }
        }
        write!(f, "]")
    }
}

/// Source of guard bytes. Seeded from the OS unless a seed is given.
pub struct GuardRng(StdRng);

impl GuardRng {
    pub fn new(seed: Option<u64>) -> Self {
        Self(match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        })
    }

    pub fn guard(&mut self, len: usize) -> Guard {
        Guard::generate(len, &mut self.0)
    }
}

/// Process-wide minimum guard length. Only ever grows, and is always a power
/// of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardPolicy {
    min: usize,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_GUARD_SIZE,
        }
    }
}

impl GuardPolicy {
    /// Policy starting at `min` rounded up to a power of two, but never below
    /// [`DEFAULT_MIN_GUARD_SIZE`]
    pub fn new(min: usize) -> Self {
        let mut policy = Self::default();
        // Too large to round means we stay at the default
        let _ = policy.raise(min);
        policy
    }

    pub const fn min(&self) -> usize {
        self.min
    }

    /// Raise the minimum to at least `size`, rounded up to a power of two.
    /// Smaller values are ignored. `Err(())` if `size` has no power of two
    /// above it.
    pub fn raise(&mut self, size: usize) -> Result<bool, ()> {
        if size <= self.min {
            return Ok(false);
        }
        self.min = next_pow2(size).ok_or(())?;
        Ok(true)
    }

    /// Bytes in front of the pre-guard for a block the underlying allocator
    /// aligned to `align`: the `header_size` header plus enough leading
    /// padding that the payload, one guard of [`GuardPolicy::min`] bytes
    /// further on, is `align`-aligned. `None` on overflow.
    pub fn front_for(&self, header_size: usize, align: usize) -> Option<usize> {
        assert!(
            align.is_power_of_two(),
            "inferred alignment {align} is not a power of two"
        );
        let payload = round_up(header_size.checked_add(self.min)?, align)?;
        Some(payload - self.min)
    }
}
