//! Heap allocator core of an embedded JavaScript engine runtime.
//!
//! The engine makes lots of small, short-lived allocations (objects, strings,
//! property slots, bytecode) out of a bounded memory budget. This crate
//! services them with a first-fit free list over one or more fixed areas and
//! cooperates with the engine's mark-sweep collector: when a request cannot
//! be satisfied, the allocator calls back into the collector at escalating
//! severities and, in segmented mode, attaches more backing memory before
//! giving up.
//!
//! All intra-heap links are *compressed pointers*: 32-bit offsets into the
//! logical heap space, converted to host addresses by [`Heap::decompress`].
//! The free list lives inside the free memory itself, one 8-byte header at
//! the start of every free region:
//!
//! ```text
//!   offset 0                                                  end of heap
//!   +----------+--------+-----------+--------+-----------+
//!   | sentinel | blocks | free      | blocks | free      |
//!   | size 0   | in use | size,next | in use | size,next |
//!   +-----|----+--------+----^--|---+--------+----^------+
//!         |                  |  |                 |
//!         +------------------+  +-----------------+
//!             next_offset           next_offset
//! ```
//!
//! See [`Heap`] for the public surface and [`HeapConfig`] for backend
//! selection (static reservation, segmented, dynamic-emulation or system
//! allocator passthrough).
//!
//! The allocator is single-threaded by contract: it holds no locks, and the
//! registered GC callback may free blocks but must never allocate.

use std::ptr::NonNull;

mod align;
mod config;
mod freelist;
mod gc;
mod heap;
mod platform;
mod segment;
mod stats;
mod system;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use align::ALIGNMENT;
pub use config::{Backend, HeapConfig};
pub use gc::{GcSeverity, ERR_OUT_OF_MEMORY};
pub use heap::Heap;
pub use stats::HeapStats;
