use std::process;
use std::ptr::NonNull;

use crate::{
    config::Backend,
    freelist::{FreeRegion, END_OF_LIST},
    heap::Heap,
    Pointer,
};

/// Process exit code used when an allocation fails and the caller did not opt
/// into null-on-error behavior.
pub const ERR_OUT_OF_MEMORY: i32 = 10;

/// How aggressively the engine's collector should reclaim when the allocator
/// calls it under pressure. `Low` is the routine pass run when the projected
/// total crosses the soft limit; `High` is the last resort before giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcSeverity {
    Low,
    High,
}

/// Registered reclamation hook. It receives the heap so it can return blocks
/// with [`Heap::free`] and [`Heap::free_small`]; it must not allocate.
pub(crate) type GcCallback = Box<dyn FnMut(&mut Heap, GcSeverity)>;

impl Heap {
    /// Registers the reclamation hook the allocator escalates through when a
    /// request cannot be satisfied. Replaces any previous hook.
    pub fn set_gc_callback(&mut self, callback: impl FnMut(&mut Heap, GcSeverity) + 'static) {
        self.gc_callback = Some(Box::new(callback));
    }

    /// Runs the registered hook at `severity`, if any. The hook is taken out
    /// of the heap for the duration so it can borrow the heap itself; it is
    /// only ever invoked between whole allocation attempts, never while the
    /// free list is mid-mutation.
    pub(crate) fn run_gc(&mut self, severity: GcSeverity) {
        if let Some(mut callback) = self.gc_callback.take() {
            self.in_gc = true;
            callback(self, severity);
            self.in_gc = false;

            // Keep the hook unless the callback registered a replacement.
            if self.gc_callback.is_none() {
                self.gc_callback = Some(callback);
            }
        }
    }

    /// Allocates `size` bytes, reclaiming and (in segmented mode) growing the
    /// heap as needed. Returns `None` only for a zero-size request.
    ///
    /// When the request cannot be satisfied even after the full escalation
    /// ladder, the process is terminated with [`ERR_OUT_OF_MEMORY`]. Use
    /// [`Heap::try_alloc`] to get `None` instead.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.gc_and_alloc_block(size, false, false)
    }

    /// [`Heap::alloc`], but returns `None` on exhaustion instead of
    /// terminating the process.
    pub fn try_alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.gc_and_alloc_block(size, true, false)
    }

    /// [`Heap::alloc`] for blocks the engine considers small objects. On the
    /// dynamic-emulation backend with slab accounting these are exempt from
    /// the emulated system-allocator overhead; elsewhere the distinction
    /// changes nothing.
    pub fn alloc_small(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.gc_and_alloc_block(size, false, true)
    }

    /// The allocate / reclaim / expand retry ladder:
    ///
    /// 1. zero-size requests are null
    /// 2. optional policy-driven GC before every allocation
    /// 3. GC at low severity when the projected total crosses the trigger
    /// 4. plain allocation attempt
    /// 5. segmented only: attach a segment group, retry
    /// 6. GC at low then high severity, retrying after each
    /// 7. segmented only: attach a segment group, retry
    /// 8. give up: null, or terminate the process
    fn gc_and_alloc_block(&mut self, size: usize, null_on_error: bool, small: bool) -> Pointer<u8> {
        debug_assert!(!self.in_gc, "allocation attempted from inside a GC callback");

        if size == 0 {
            return None;
        }
        let Some(aligned) = size.checked_next_multiple_of(crate::ALIGNMENT) else {
            return if null_on_error { None } else { fatal_out_of_memory() };
        };

        if self.config.gc_before_each_alloc {
            self.run_gc(GcSeverity::High);
        }

        let trigger = if self.config.lazy_gc {
            self.config.total_capacity()
        } else {
            self.heap_limit
        };
        if self.alloc_budget(aligned, small) > trigger {
            self.run_gc(GcSeverity::Low);
        }

        if let Some(block) = self.alloc_block(size, small) {
            self.stats.on_alloc(size);
            return Some(block);
        }

        if self.expand_for(aligned) {
            if let Some(block) = self.alloc_block(size, small) {
                self.stats.on_alloc(size);
                return Some(block);
            }
        }

        for severity in [GcSeverity::Low, GcSeverity::High] {
            self.run_gc(severity);

            if let Some(block) = self.alloc_block(size, small) {
                self.stats.on_alloc(size);
                return Some(block);
            }
        }

        if self.expand_for(aligned) {
            if let Some(block) = self.alloc_block(size, small) {
                self.stats.on_alloc(size);
                return Some(block);
            }
        }

        if null_on_error {
            None
        } else {
            fatal_out_of_memory()
        }
    }

    /// Projected post-allocation total compared against the GC trigger.
    /// Managed fixed-size backends budget the live block bytes; the emulated
    /// and real system-allocator backends budget what the system allocator
    /// would hold, with slab-exempt small blocks not counted.
    fn alloc_budget(&self, aligned: usize, small: bool) -> usize {
        match self.config.backend {
            Backend::Static | Backend::Segmented => self.blocks_size + aligned,
            Backend::DynamicEmul | Backend::System => {
                if self.config.slab_small_blocks && small {
                    self.allocated_heap_size
                } else {
                    self.allocated_heap_size + aligned
                }
            }
        }
    }

    /// Attaches a segment group able to hold `aligned` bytes and splices its
    /// span into the free list. `false` when not segmented, out of segment
    /// slots, or out of backing memory.
    fn expand_for(&mut self, aligned: usize) -> bool {
        let Some(table) = &mut self.segments else {
            return false;
        };
        let Some((offset, length)) = (unsafe { table.acquire_group(aligned) }) else {
            return false;
        };

        self.insert_free_region(offset, length as u32);
        true
    }

    /// Sorted insertion of a brand-new span. Unlike a free, the span cannot
    /// touch existing regions: it covers a whole just-attached group, and
    /// merges never cross group boundaries.
    fn insert_free_region(&mut self, offset: u32, size: u32) {
        let mut prev_offset = 0;
        let mut prev = self.region_at(0);

        while prev.next_offset != END_OF_LIST && prev.next_offset < offset {
            prev_offset = prev.next_offset;
            prev = self.region_at(prev_offset);
        }

        unsafe {
            FreeRegion { size, next_offset: prev.next_offset }.write(self.decompress(offset));
        }
        self.relink(prev_offset, offset);
    }
}

fn fatal_out_of_memory() -> ! {
    // Mirrors the engine's fatal handler: the runtime cannot continue, and
    // the embedder distinguishes this exit from a crash by its code.
    eprintln!("jsmem: out of memory");
    process::exit(ERR_OUT_OF_MEMORY);
}
