use std::ptr::NonNull;

use crate::{config::HeapConfig, heap::Heap, Pointer};

/// Bytes the system allocator actually takes for a block: the requested size
/// plus its per-block metadata, rounded to its allocation granularity.
fn mapped_size(size: usize, config: &HeapConfig) -> usize {
    (size + config.sys_metadata_size).div_ceil(config.sys_alignment) * config.sys_alignment
}

impl Heap {
    /// Passthrough allocation. The free list, skip pointer and segment table
    /// are all inert on this backend; only the counters move.
    pub(crate) fn system_alloc_block(&mut self, size: usize, _small: bool) -> Pointer<u8> {
        let block = NonNull::new(unsafe { libc::malloc(size) }.cast::<u8>())?;

        self.blocks_size += size;
        self.allocated_heap_size += mapped_size(size, &self.config);
        self.system_metadata_size += self.config.sys_metadata_size;
        self.allocated_blocks_count += 1;

        Some(block)
    }

    /// Passthrough free. `size` must be the value passed at allocation, like
    /// on the managed backends.
    pub(crate) fn system_free_block(&mut self, ptr: NonNull<u8>, size: usize, _small: bool) {
        unsafe { libc::free(ptr.as_ptr().cast()) };

        self.blocks_size -= size;
        self.allocated_heap_size -= mapped_size(size, &self.config);
        self.system_metadata_size -= self.config.sys_metadata_size;
        self.allocated_blocks_count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapConfig;

    #[test]
    fn passthrough_moves_only_counters() {
        let mut heap = Heap::new(HeapConfig::system());

        // Default overhead model: 8 bytes of metadata, 8-byte granularity.
        let block = heap.try_alloc(20).unwrap();
        assert_eq!(heap.blocks_size, 20);
        assert_eq!(heap.allocated_heap_size, 32);
        assert_eq!(heap.system_metadata_size, 8);
        assert_eq!(heap.allocated_blocks_count, 1);
        assert_eq!(heap.stats().alloc_count, 1);

        unsafe {
            block.as_ptr().write_bytes(0xAB, 20);
        }

        heap.free(block, 20);
        assert_eq!(heap.blocks_size, 0);
        assert_eq!(heap.allocated_heap_size, 0);
        assert_eq!(heap.system_metadata_size, 0);
        assert_eq!(heap.allocated_blocks_count, 0);

        heap.finalize();
    }

    #[test]
    fn passthrough_owns_every_pointer_for_assertions() {
        let heap = Heap::new(HeapConfig::system());
        let mut local = 0u8;
        assert!(heap.is_heap_pointer(NonNull::new(&mut local as *mut u8).unwrap()));
        heap.finalize();
    }

    #[test]
    #[should_panic(expected = "managed heaps")]
    fn compression_is_rejected_on_the_system_backend() {
        let heap = Heap::new(HeapConfig::system());
        heap.decompress(0);
    }

    #[test]
    fn emulation_charges_system_overhead() {
        let mut heap = Heap::new(HeapConfig::dynamic_emul(512));

        let p1 = heap.try_alloc(20).unwrap();
        // The emulated charge uses the granule-aligned size, no rounding to
        // the system allocator's granularity.
        assert_eq!(heap.allocated_heap_size, 24);
        assert_eq!(heap.system_metadata_size, 8);

        let p2 = heap.try_alloc(8).unwrap();
        assert_eq!(heap.allocated_heap_size, 32);
        assert_eq!(heap.system_metadata_size, 16);

        heap.free(p1, 20);
        heap.free(p2, 8);
        assert_eq!(heap.allocated_heap_size, 0);
        assert_eq!(heap.system_metadata_size, 0);
        heap.verify_integrity();
        heap.finalize();
    }

    #[test]
    fn slab_exempts_small_blocks_from_the_emulated_charge() {
        let mut config = HeapConfig::dynamic_emul(512);
        config.slab_small_blocks = true;
        let mut heap = Heap::new(config);

        let small = heap.alloc_small(16).unwrap();
        assert_eq!(heap.allocated_heap_size, 0);
        assert_eq!(heap.system_metadata_size, 0);

        let regular = heap.try_alloc(16).unwrap();
        assert_eq!(heap.allocated_heap_size, 16);
        assert_eq!(heap.system_metadata_size, 8);

        // The flag is a pure accounting channel: both live on the same free
        // list and must be freed through the matching variant.
        heap.free_small(small, 16);
        assert_eq!(heap.allocated_heap_size, 16);
        heap.free(regular, 16);
        assert_eq!(heap.allocated_heap_size, 0);
        assert_eq!(heap.system_metadata_size, 0);

        heap.verify_integrity();
        heap.finalize();
    }
}
