use crate::align::ALIGNMENT;

/// Memory-management strategy behind the heap. Chosen at construction so
/// that different heap flavors can live side by side in one process (and one
/// test suite).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// One fixed reservation obtained at init, released at finalize.
    Static,
    /// The logical heap is the union of up to `segment_count` equal-size
    /// segments; backing memory is attached and detached on demand.
    Segmented,
    /// Same managed free list as [`Backend::Static`], plus bookkeeping that
    /// emulates what a general-purpose allocator would have charged for each
    /// block. Used to evaluate dynamic allocation without switching to it.
    DynamicEmul,
    /// Pass every request through to the platform's general-purpose
    /// allocator. Free-list, skip-pointer and segment logic are all inert.
    System,
}

/// Heap construction parameters. Build one with the per-backend constructors
/// and override fields as needed:
///
/// ```rust
/// use jsmem::HeapConfig;
///
/// let mut config = HeapConfig::segmented(1024, 8);
/// config.desired_limit = 2048;
/// ```
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    pub backend: Backend,
    /// Total byte capacity of the heap area, including the granule reserved
    /// for the free-list sentinel. Ignored in segmented and system modes.
    pub heap_size: usize,
    /// Soft-trigger step: `heap_limit` is kept a positive multiple of this,
    /// always above the live block total.
    pub desired_limit: usize,
    /// Segment byte size (segmented mode).
    pub segment_size: usize,
    /// Maximum number of segments (segmented mode).
    pub segment_count: usize,
    /// Per-block overhead charged by the system allocator (system and
    /// dynamic-emulation modes).
    pub sys_metadata_size: usize,
    /// Allocation granularity of the system allocator (system mode).
    pub sys_alignment: usize,
    /// Run the GC callback at high severity before every allocation.
    pub gc_before_each_alloc: bool,
    /// Trigger the pre-allocation GC only when the projected total exceeds
    /// the absolute heap capacity, not the soft `heap_limit`.
    pub lazy_gc: bool,
    /// Exempt small blocks from system-allocator accounting, modelling
    /// slab-backed small objects (dynamic-emulation mode).
    pub slab_small_blocks: bool,
}

impl HeapConfig {
    /// Static reservation of `heap_size` bytes.
    pub fn static_heap(heap_size: usize) -> Self {
        Self {
            backend: Backend::Static,
            heap_size,
            desired_limit: default_desired_limit(heap_size),
            segment_size: 0,
            segment_count: 0,
            sys_metadata_size: DEFAULT_SYS_METADATA_SIZE,
            sys_alignment: DEFAULT_SYS_ALIGNMENT,
            gc_before_each_alloc: false,
            lazy_gc: false,
            slab_small_blocks: false,
        }
    }

    /// Segmented heap of up to `segment_count` segments of `segment_size`
    /// bytes each. One segment is attached at init.
    pub fn segmented(segment_size: usize, segment_count: usize) -> Self {
        Self {
            backend: Backend::Segmented,
            heap_size: 0,
            desired_limit: default_desired_limit(segment_size.saturating_mul(segment_count)),
            segment_size,
            segment_count,
            sys_metadata_size: DEFAULT_SYS_METADATA_SIZE,
            sys_alignment: DEFAULT_SYS_ALIGNMENT,
            gc_before_each_alloc: false,
            lazy_gc: false,
            slab_small_blocks: false,
        }
    }

    /// Managed heap of `heap_size` bytes with dynamic-allocation emulation
    /// counters.
    pub fn dynamic_emul(heap_size: usize) -> Self {
        Self {
            backend: Backend::DynamicEmul,
            ..Self::static_heap(heap_size)
        }
    }

    /// System allocator passthrough.
    pub fn system() -> Self {
        Self {
            backend: Backend::System,
            heap_size: 0,
            desired_limit: DEFAULT_DESIRED_LIMIT,
            segment_size: 0,
            segment_count: 0,
            sys_metadata_size: DEFAULT_SYS_METADATA_SIZE,
            sys_alignment: DEFAULT_SYS_ALIGNMENT,
            gc_before_each_alloc: false,
            lazy_gc: false,
            slab_small_blocks: false,
        }
    }

    /// Total byte capacity of the logical heap space, counting segments that
    /// are not attached yet. The system backend is unbounded.
    pub(crate) fn total_capacity(&self) -> usize {
        match self.backend {
            Backend::Static | Backend::DynamicEmul => self.heap_size,
            Backend::Segmented => self.segment_size * self.segment_count,
            Backend::System => usize::MAX,
        }
    }

    /// Panics on parameter combinations the allocator cannot honor. Called
    /// once by [`crate::Heap::new`].
    pub(crate) fn validate(&self) {
        assert!(self.desired_limit > 0, "desired_limit must be positive");

        match self.backend {
            Backend::Static | Backend::DynamicEmul => {
                assert!(
                    self.heap_size >= 2 * ALIGNMENT && self.heap_size % ALIGNMENT == 0,
                    "heap_size must be a multiple of the granule with room for the sentinel"
                );
                assert!(self.heap_size < u32::MAX as usize, "offsets must fit in 32 bits");
            }
            Backend::Segmented => {
                assert!(
                    self.segment_size >= 2 * ALIGNMENT && self.segment_size % ALIGNMENT == 0,
                    "segment_size must be a multiple of the granule with room for the sentinel"
                );
                assert!(self.segment_count > 0, "at least one segment is required");
                assert!(
                    self.segment_size
                        .checked_mul(self.segment_count)
                        .is_some_and(|total| total < u32::MAX as usize),
                    "offsets must fit in 32 bits"
                );
            }
            Backend::System => {
                assert!(self.sys_alignment > 0, "sys_alignment must be positive");
            }
        }
    }
}

/// Default soft-trigger step: one 32nd of the capacity, never below one
/// granule.
fn default_desired_limit(capacity: usize) -> usize {
    (capacity / 32).max(ALIGNMENT)
}

const DEFAULT_DESIRED_LIMIT: usize = 1024;
const DEFAULT_SYS_METADATA_SIZE: usize = 8;
const DEFAULT_SYS_ALIGNMENT: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_pick_backends() {
        assert_eq!(HeapConfig::static_heap(512).backend, Backend::Static);
        assert_eq!(HeapConfig::segmented(256, 4).backend, Backend::Segmented);
        assert_eq!(HeapConfig::dynamic_emul(512).backend, Backend::DynamicEmul);
        assert_eq!(HeapConfig::system().backend, Backend::System);
    }

    #[test]
    fn capacity_per_backend() {
        assert_eq!(HeapConfig::static_heap(512).total_capacity(), 512);
        assert_eq!(HeapConfig::segmented(256, 4).total_capacity(), 1024);
        assert_eq!(HeapConfig::system().total_capacity(), usize::MAX);
    }

    #[test]
    #[should_panic(expected = "heap_size")]
    fn unaligned_heap_size_is_rejected() {
        HeapConfig::static_heap(100).validate();
    }

    #[test]
    #[should_panic(expected = "at least one segment")]
    fn zero_segments_are_rejected() {
        HeapConfig::segmented(256, 0).validate();
    }
}
