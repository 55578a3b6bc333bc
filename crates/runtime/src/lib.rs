//! quickening: the inline-cache and rewriter subsystem of a
//! Python-compatible runtime.
//!
//! The crate turns slow, polymorphic generic-dispatch operations
//! (attribute access, calls, binary operators, comparisons, subscript,
//! length, truth tests) into specialized straight-line machine code
//! patched into the program's code stream at the call site.
//!
//! The pieces, leaves first:
//!
//! * [`asm`] — a bounded x86-64 emitter, one method per instruction form
//!   the rewriter needs. Overflow sets a failed flag instead of
//!   panicking so whole fast paths can be assembled and checked once.
//! * [`ics`] — per-call-site bookkeeping: patchable regions divided into
//!   slots, round-robin eviction, invalidation dependencies, atomic
//!   commit, and the standalone 512-byte trampolines the built-in
//!   runtime uses for its hottest operations.
//! * [`rewriter`] — records guarded actions against virtual values while
//!   the slow path runs, then allocates registers and emits the fast
//!   path into an IC slot, tracking reference-count obligations so the
//!   emitted code's net refcount effect matches the slow path's.
//! * [`objects`] — the object-model carrier: `#[repr(C)]` layouts,
//!   hidden-class attribute storage, the type-version method cache.
//! * [`dispatch`] — the generic slow paths themselves; each executes the
//!   full semantics while recording a rewrite for the shapes it saw.
//! * [`capi`] — CPython-compatible wrapper names for extension code.
//!
//! Execution model: one Python thread at a time under a global execution
//! lock; re-entry is handled with per-slot in-use counters rather than
//! locks. Patched code becomes visible to the next call after an
//! explicit instruction-cache flush.

pub mod asm;
pub mod capi;
pub mod dispatch;
pub mod error;
pub mod ics;
pub mod mem;
pub mod objects;
pub mod options;
pub mod rewriter;
pub mod stats;

pub use error::{ExcInfo, PyResult, RuntimeError};
