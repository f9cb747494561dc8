//! Everything the allocator has to say ends up here. A [`Diagnostic`] is
//! produced for every misuse, exhaustion, corruption or leak, and is handed to
//! whatever [`ReportSink`] the [`GuardedAlloc`] was built with.
//!
//! [`GuardedAlloc`]: crate::alloc::guarded::GuardedAlloc

use std::{
    fmt,
    io::Write,
    panic::Location,
    sync::{Arc, Mutex, PoisonError},
};

use log::Level;
use serde::Serialize;

/// Where in the host program an allocator call was made
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Provenance {
    pub file: &'static str,
    pub line: u32,
}

impl Provenance {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// The call site of whoever called this function (or the outermost
    /// `#[track_caller]` frame above it).
    #[track_caller]
    pub fn here() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Which side of the payload a guard sits on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardSide {
    Pre,
    Post,
}

/// The entry point a report came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Allocate,
    ZeroAllocate,
    Resize,
    Release,
    Check,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allocate => "allocate",
            Self::ZeroAllocate => "zero_allocate",
            Self::Resize => "resize",
            Self::Release => "release",
            Self::Check => "check",
        })
    }
}

/// A single report. Addresses are plain `usize`s: by the time anybody reads
/// one of these, the block may well be gone.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The underlying allocator (or our own bookkeeping) refused `bytes`
    MemoryFailure {
        op: Operation,
        bytes: usize,
        at: Provenance,
    },
    /// `resize(ptr, 0)`, which we treat as a release
    ResizeToZero { ptr: usize, at: Provenance },
    /// `resize()` on something we never handed out
    ResizeUnallocated { ptr: usize, at: Provenance },
    /// `resize()` on an interior pointer of a live block
    ResizeShifted {
        ptr: usize,
        expected: usize,
        bytes: usize,
        allocated: Provenance,
        at: Provenance,
    },
    /// `release()` on something we never handed out
    FreeUnallocated { ptr: usize, at: Provenance },
    /// `release()` on an interior pointer of a live block
    FreeShifted {
        ptr: usize,
        expected: usize,
        offset: isize,
        bytes: usize,
        allocated: Provenance,
        at: Provenance,
    },
    /// One guard byte no longer holds the value written at allocation time.
    /// `offset` is relative to the payload start: negative for the pre-guard,
    /// `>= bytes` for the post-guard.
    GuardOverwritten {
        op: Operation,
        side: GuardSide,
        offset: isize,
        old: u8,
        new: u8,
        bytes: usize,
        ptr: usize,
        allocated: Provenance,
        at: Provenance,
    },
    /// The in-block header disagrees with the registry
    HeaderOverwritten {
        op: Operation,
        ptr: usize,
        bytes: usize,
        allocated: Provenance,
        at: Provenance,
    },
    /// Still live at shutdown
    Leak {
        ptr: usize,
        bytes: usize,
        allocated: Provenance,
    },
    /// `set_minimum_guard_size()` with a size that has no power of two above it
    GuardSizeTooLarge { requested: usize },
    /// A strict entry point failed; the process aborts right after this
    StrictFailure { op: Operation, at: Provenance },
}

impl Diagnostic {
    /// How loud the [`LogSink`] should be about this
    pub fn level(&self) -> Level {
        match self {
            Self::ResizeToZero { .. } | Self::GuardSizeTooLarge { .. } => Level::Warn,
            Self::MemoryFailure { .. } => Level::Warn,
            _ => Level::Error,
        }
    }

    /// `true` for reports that mean the heap has been written where it
    /// should not have been
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::GuardOverwritten { .. } | Self::HeaderOverwritten { .. }
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryFailure { op, bytes, at } => write!(
                f,
                "Memory failure!\n\tOperation: {op}\n\tLine: {}\n\tFile: {}\n\tBytes: {bytes}",
                at.line, at.file
            ),
            Self::ResizeToZero { ptr, at } => write!(
                f,
                "Warning: resize(ptr, 0) is not portable, since it may or may not \
                 free ptr. Here ptr is being freed.\n\tLine: {}\n\tFile: {}\n\tPointer: {ptr:#x}",
                at.line, at.file
            ),
            Self::ResizeUnallocated { ptr, at } => write!(
                f,
                "Reallocating invalid pointer!\n\tLine: {}\n\tFile: {}\n\tPointer: {ptr:#x}\n\
                 \tProblem: Pointer not allocated",
                at.line, at.file
            ),
            Self::ResizeShifted {
                ptr,
                expected,
                bytes,
                allocated,
                at,
            } => write!(
                f,
                "Reallocating invalid pointer!\n\tLine allocated: {}\n\tFile allocated: {}\n\
                 \tLine: {}\n\tFile: {}\n\tBytes: {bytes}\n\tPointer: {ptr:#x}\n\
                 \tExpected: {expected:#x}\n\tProblem: Pointer shifted",
                allocated.line, allocated.file, at.line, at.file
            ),
            Self::FreeUnallocated { ptr, at } => write!(
                f,
                "Freeing unallocated pointer!\n\tLine: {}\n\tFile: {}\n\tPointer: {ptr:#x}",
                at.line, at.file
            ),
            Self::FreeShifted {
                ptr,
                expected,
                offset,
                bytes,
                allocated,
                at,
            } => write!(
                f,
                "Freeing shifted pointer!\n\tLine allocated: {}\n\tFile allocated: {}\n\
                 \tLine freed: {}\n\tFile freed: {}\n\tBytes: {bytes}\n\tPointer: {ptr:#x}\n\
                 \tExpected: {expected:#x}\n\tOffset: {offset}",
                allocated.line, allocated.file, at.line, at.file
            ),
            Self::GuardOverwritten {
                op,
                side,
                offset,
                old,
                new,
                bytes,
                ptr,
                allocated,
                at,
            } => write!(
                f,
                "Memory {}!\n\tOperation: {op}\n\tLine allocated: {}\n\tFile allocated: {}\n\
                 \tLine checked: {}\n\tFile checked: {}\n\tOld value: {old}\n\tNew value: {new}\n\
                 \tBytes: {bytes}\n\tOverwritten byte: {offset}\n\tPointer: {ptr:#x}",
                match side {
                    GuardSide::Pre => "underflow",
                    GuardSide::Post => "overflow",
                },
                allocated.line,
                allocated.file,
                at.line,
                at.file
            ),
            Self::HeaderOverwritten {
                op,
                ptr,
                bytes,
                allocated,
                at,
            } => write!(
                f,
                "Allocation header overwritten!\n\tOperation: {op}\n\tLine allocated: {}\n\
                 \tFile allocated: {}\n\tLine checked: {}\n\tFile checked: {}\n\tBytes: {bytes}\n\tPointer: {ptr:#x}",
                allocated.line, allocated.file, at.line, at.file
            ),
            Self::Leak {
                ptr,
                bytes,
                allocated,
            } => write!(
                f,
                "Memory not freed!\n\tLine: {}\n\tFile: {}\n\tBytes: {bytes}\n\tPointer: {ptr:#x}",
                allocated.line, allocated.file
            ),
            Self::GuardSizeTooLarge { requested } => write!(
                f,
                "Guard size {requested} cannot be rounded to a power of two, ignoring"
            ),
            Self::StrictFailure { op, at } => write!(
                f,
                "Strict {op} failed.\n\tLine: {}\n\tFile: {}\nAborting now.",
                at.line, at.file
            ),
        }
    }
}

/// Somewhere to put [`Diagnostic`]s.
///
/// Sinks are called with the allocator's lock held, so a sink must never call
/// back into the allocator that reported to it.
pub trait ReportSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Forward every diagnostic to the `log` facade
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&self, diagnostic: &Diagnostic) {
        log::log!(target: "galloc", diagnostic.level(), "{diagnostic}");
    }
}

/// Keeps every diagnostic it is given. Clones share the same buffer, so hand
/// one clone to the allocator and keep the other to inspect.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    seen: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything reported so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain everything reported so far
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.seen.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for CollectingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic.clone());
    }
}

/// Writes each diagnostic as one line of JSON
pub struct JsonSink<W> {
    out: Mutex<W>,
}

impl<W> JsonSink<W>
where
    W: Write + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W> ReportSink for JsonSink<W>
where
    W: Write + Send,
{
    fn report(&self, diagnostic: &Diagnostic) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let written = serde_json::to_writer(&mut *out, diagnostic)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(e) = written {
            // Nowhere else to send it
            log::error!(target: "galloc", "could not write diagnostic as json: {e}");
        }
    }
}
