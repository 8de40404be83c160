use std::ptr::NonNull;

use crate::{
    align::{align_up, ALIGNMENT},
    config::{Backend, HeapConfig},
    freelist::{FreeRegion, END_OF_LIST},
    gc::GcCallback,
    platform,
    segment::SegmentTable,
    stats::HeapStats,
    Pointer,
};

/// The engine heap. Owns the backing memory, the free list threaded through
/// it, the segment table when segmented, and every accounting counter.
///
/// Allocation serves first-fit from an address-ordered free list, with a fast
/// path for single-granule requests that takes the head region without
/// searching. Freeing inserts in address order and merges with both neighbors
/// eagerly, so no two free regions are ever adjacent. A cached *skip pointer*
/// remembers a recent predecessor; frees at higher offsets start their search
/// there instead of at the head:
///
/// ```text
///  first             skip_offset
///    |                    |
///    v                    v
///  +----+    +------+    +------+    +------+
///  | 0  | -> | 104  | -> | 1280 | -> | 2432 | -> END_OF_LIST
///  +----+    +------+    +------+    +------+
///              free        free        free     <- ascending offsets
/// ```
///
/// Blocks are handed out as raw granule-aligned pointers; the caller owns
/// `[ptr, ptr + align_up(size))` until it returns the block with
/// [`Heap::free`], passing the same size it allocated with.
pub struct Heap {
    pub(crate) config: HeapConfig,
    /// Backing of the static or dynamic-emulation area.
    pub(crate) area: Pointer<u8>,
    /// Segment table, segmented backend only.
    pub(crate) segments: Option<SegmentTable>,
    /// Offset of the free-list node the next free insertion may start its
    /// search from. Either 0 (the sentinel) or a node currently in the list.
    pub(crate) skip_offset: u32,
    /// Sum of the granule-aligned sizes of live blocks.
    pub(crate) blocks_size: usize,
    pub(crate) allocated_blocks_count: usize,
    /// Soft GC trigger. A positive multiple of `desired_limit`, kept above
    /// `blocks_size`.
    pub(crate) heap_limit: usize,
    /// What the system allocator would have mapped for the live blocks
    /// (dynamic-emulation and system backends).
    pub(crate) allocated_heap_size: usize,
    pub(crate) system_metadata_size: usize,
    pub(crate) stats: HeapStats,
    pub(crate) gc_callback: Option<GcCallback>,
    /// Set while the GC callback runs; allocating then is a contract breach.
    pub(crate) in_gc: bool,
}

impl Heap {
    /// Creates the heap: reserves the initial area (or attaches the first
    /// segment) and installs a single free region spanning it.
    ///
    /// # Panics
    ///
    /// On an invalid configuration, or when the platform refuses the initial
    /// backing memory.
    pub fn new(config: HeapConfig) -> Self {
        config.validate();

        let mut heap = Self {
            config,
            area: None,
            segments: None,
            skip_offset: 0,
            blocks_size: 0,
            allocated_blocks_count: 0,
            heap_limit: config.desired_limit,
            allocated_heap_size: 0,
            system_metadata_size: 0,
            stats: HeapStats::default(),
            gc_callback: None,
            in_gc: false,
        };

        match config.backend {
            Backend::Static | Backend::DynamicEmul => {
                let area = unsafe { platform::request_memory(config.heap_size) };
                let Some(area) = area else {
                    panic!("could not reserve the heap area");
                };
                heap.area = Some(area);
                heap.install_first_free_region(config.heap_size);
                heap.stats.size = config.heap_size - ALIGNMENT;
            }
            Backend::Segmented => {
                let mut table = SegmentTable::new(config.segment_size, config.segment_count);
                if unsafe { table.acquire_group(1) }.is_none() {
                    panic!("could not attach the initial segment");
                }
                heap.segments = Some(table);
                heap.install_first_free_region(config.segment_size);
                heap.stats.size = config.total_capacity() - ALIGNMENT;
            }
            Backend::System => {}
        }

        heap
    }

    /// Writes the sentinel head at offset 0 and one free region covering the
    /// rest of the initial area.
    fn install_first_free_region(&mut self, initial_area: usize) {
        unsafe {
            FreeRegion {
                size: (initial_area - ALIGNMENT) as u32,
                next_offset: END_OF_LIST,
            }
            .write(self.decompress(ALIGNMENT as u32));

            FreeRegion::sentinel(ALIGNMENT as u32).write(self.decompress(0));
        }
        self.skip_offset = 0;
    }

    /// Tears the heap down, checking that every block was returned. Backing
    /// memory is released either way (also by `Drop`, so an early `drop` of a
    /// `Heap` only skips the emptiness check).
    pub fn finalize(mut self) {
        self.release_empty_segments();
        debug_assert_eq!(self.blocks_size, 0, "heap finalized with live blocks");
        debug_assert_eq!(self.allocated_blocks_count, 0);
    }

    /// Frees a block previously obtained from this heap. `size` must be the
    /// value passed to the allocation call.
    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        self.free_block(ptr, size, false);
        self.stats.on_free(size);
    }

    /// [`Heap::free`] for blocks allocated with [`Heap::alloc_small`].
    pub fn free_small(&mut self, ptr: NonNull<u8>, size: usize) {
        self.free_block(ptr, size, true);
        self.stats.on_free(size);
    }

    /// Copies the current counter block.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Whether `ptr` points into the heap. Meant for assertions; the system
    /// backend owns the whole address space as far as this check goes.
    pub fn is_heap_pointer(&self, ptr: NonNull<u8>) -> bool {
        match self.config.backend {
            Backend::Static | Backend::DynamicEmul => {
                let Some(base) = self.area else { return false };
                let addr = ptr.as_ptr() as usize;
                let base = base.as_ptr() as usize;

                addr >= base && addr <= base + self.config.heap_size
            }
            Backend::Segmented => self.segments.as_ref().is_some_and(|table| table.contains(ptr)),
            Backend::System => true,
        }
    }

    /// Converts a heap address to its 32-bit offset form.
    ///
    /// # Panics
    ///
    /// When `ptr` is not inside the heap, and always on the system backend,
    /// which keeps full-width pointers.
    pub fn compress(&self, ptr: NonNull<u8>) -> u32 {
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);

        if let Some(table) = &self.segments {
            let Some(offset) = table.compress(ptr) else {
                panic!("pointer does not belong to any attached segment");
            };
            return offset;
        }

        let Some(base) = self.area else {
            panic!("compressed pointers are only meaningful on managed heaps");
        };
        let offset = (ptr.as_ptr() as usize).wrapping_sub(base.as_ptr() as usize);
        assert!(offset < self.config.heap_size, "pointer is outside the heap area");

        offset as u32
    }

    /// Converts a 32-bit offset back to a heap address.
    ///
    /// # Panics
    ///
    /// On the system backend, which keeps full-width pointers.
    pub fn decompress(&self, offset: u32) -> NonNull<u8> {
        debug_assert_ne!(offset, END_OF_LIST);

        if let Some(table) = &self.segments {
            return unsafe { table.decompress(offset) };
        }

        let Some(base) = self.area else {
            panic!("compressed pointers are only meaningful on managed heaps");
        };
        debug_assert!((offset as usize) < self.config.heap_size);

        unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) }
    }

    /// Reads the free-list header at `offset`.
    pub(crate) fn region_at(&self, offset: u32) -> FreeRegion {
        unsafe { FreeRegion::read(self.decompress(offset)) }
    }

    /// Rewrites the link of the node at `offset`.
    pub(crate) fn relink(&mut self, offset: u32, next_offset: u32) {
        unsafe {
            let address = self.decompress(offset);
            let mut region = FreeRegion::read(address);
            region.next_offset = next_offset;
            region.write(address);
        }
    }

    /// Whether the bytes on both sides of `boundary` share backing memory.
    /// Always true on single-area backends; segmented heaps refuse merges
    /// across segment groups.
    fn contiguous_at(&self, boundary: u32) -> bool {
        match &self.segments {
            Some(table) => table.contiguous_at(boundary),
            None => true,
        }
    }

    /// One block allocation attempt: aligns the request, serves it from the
    /// free list and maintains the accounting. No GC, no expansion; that
    /// ladder is driven by [`Heap::alloc`] and friends.
    pub(crate) fn alloc_block(&mut self, size: usize, small: bool) -> Pointer<u8> {
        if self.config.backend == Backend::System {
            return self.system_alloc_block(size, small);
        }

        let required = align_up(size);

        let result = if required == ALIGNMENT && self.region_at(0).next_offset != END_OF_LIST {
            Some(self.alloc_block_fast(small))
        } else {
            self.alloc_block_slow(required, small)
        };

        // Keep the soft limit a desired_limit multiple above the live total.
        while self.blocks_size >= self.heap_limit {
            self.heap_limit += self.config.desired_limit;
        }

        result
    }

    /// Single-granule fast path. Takes the head region without searching:
    /// any free region can hold one granule, so the head always fits.
    fn alloc_block_fast(&mut self, small: bool) -> NonNull<u8> {
        let block_offset = self.region_at(0).next_offset;
        let region = self.region_at(block_offset);

        self.blocks_size += ALIGNMENT;
        self.allocated_blocks_count += 1;
        self.account_emulated_alloc(ALIGNMENT, small);
        if let Some(table) = &mut self.segments {
            table.occupy(block_offset, ALIGNMENT as u32);
        }
        self.stats.alloc_iter_count += 1;

        let new_head = if region.size as usize == ALIGNMENT {
            region.next_offset
        } else {
            // Shrink in place: the header moves one granule forward.
            let remaining_offset = block_offset + ALIGNMENT as u32;
            unsafe {
                FreeRegion {
                    size: region.size - ALIGNMENT as u32,
                    next_offset: region.next_offset,
                }
                .write(self.decompress(remaining_offset));
            }
            remaining_offset
        };
        self.relink(0, new_head);

        if self.skip_offset == block_offset {
            self.skip_offset = if new_head == END_OF_LIST { 0 } else { new_head };
        }

        self.decompress(block_offset)
    }

    /// First-fit walk. On a match the region is either split, leaving the
    /// residual at `match + required`, or unlinked whole.
    fn alloc_block_slow(&mut self, required: usize, small: bool) -> Pointer<u8> {
        let mut prev_offset = 0;
        let mut current_offset = self.region_at(0).next_offset;

        while current_offset != END_OF_LIST {
            let current = self.region_at(current_offset);
            self.stats.alloc_iter_count += 1;

            if current.size as usize >= required {
                self.blocks_size += required;
                self.allocated_blocks_count += 1;
                self.account_emulated_alloc(required, small);
                if let Some(table) = &mut self.segments {
                    table.occupy(current_offset, required as u32);
                }

                let new_link = if current.size as usize > required {
                    let remaining_offset = current_offset + required as u32;
                    unsafe {
                        FreeRegion {
                            size: current.size - required as u32,
                            next_offset: current.next_offset,
                        }
                        .write(self.decompress(remaining_offset));
                    }
                    remaining_offset
                } else {
                    current.next_offset
                };
                self.relink(prev_offset, new_link);
                self.skip_offset = prev_offset;

                return Some(self.decompress(current_offset));
            }

            prev_offset = current_offset;
            current_offset = current.next_offset;
        }

        None
    }

    /// Returns a block to the free list: ordered insert starting from the
    /// skip pointer when the block lies past it, merging with both neighbors
    /// where they touch.
    pub(crate) fn free_block(&mut self, ptr: NonNull<u8>, size: usize, small: bool) {
        if self.config.backend == Backend::System {
            return self.system_free_block(ptr, size, small);
        }

        debug_assert!(self.is_heap_pointer(ptr), "free of a pointer the heap does not own");
        debug_assert!(size > 0);
        debug_assert!(self.heap_limit >= self.blocks_size);

        let block_offset = self.compress(ptr);
        let aligned = align_up(size) as u32;

        self.stats.free_iter_count += 1;
        let mut prev_offset = if block_offset > self.skip_offset {
            self.stats.skip_count += 1;
            self.skip_offset
        } else {
            self.stats.nonskip_count += 1;
            0
        };

        // Find the block's predecessor in offset order. The sentinel's
        // END_OF_LIST link compares greater than any offset.
        let mut prev = self.region_at(prev_offset);
        while prev.next_offset < block_offset {
            prev_offset = prev.next_offset;
            prev = self.region_at(prev_offset);
            self.stats.free_iter_count += 1;
        }
        let next_offset = prev.next_offset;

        // Merge with the predecessor where it ends exactly at the block,
        // otherwise write a fresh header and splice it in. The sentinel's
        // zero size keeps it out of the first case.
        let (merged_offset, mut merged) =
            if prev_offset + prev.size == block_offset && self.contiguous_at(block_offset) {
                (prev_offset, FreeRegion { size: prev.size + aligned, next_offset })
            } else {
                self.relink(prev_offset, block_offset);
                (block_offset, FreeRegion { size: aligned, next_offset })
            };

        // Absorb the successor when the merged region now reaches it.
        if next_offset != END_OF_LIST
            && merged_offset + merged.size == next_offset
            && self.contiguous_at(next_offset)
        {
            let next = self.region_at(next_offset);
            merged.size += next.size;
            merged.next_offset = next.next_offset;
        }
        unsafe { merged.write(self.decompress(merged_offset)) };

        self.skip_offset = prev_offset;

        if let Some(table) = &mut self.segments {
            table.vacate(block_offset, aligned);
        }
        self.blocks_size -= aligned as usize;
        self.allocated_blocks_count -= 1;
        self.account_emulated_free(aligned as usize, small);

        while self.blocks_size + self.config.desired_limit <= self.heap_limit
            && self.heap_limit > self.config.desired_limit
        {
            self.heap_limit -= self.config.desired_limit;
        }
    }

    /// Releases non-initial segment groups that hold no live bytes, removing
    /// their spans from the free list first. A no-op on other backends.
    pub fn release_empty_segments(&mut self) {
        let Some(table) = &self.segments else { return };

        let spans: Vec<(usize, u32, u32)> = table
            .empty_group_heads()
            .into_iter()
            .map(|head| {
                let (start, end) = table.group_span(head);
                (head, start, end)
            })
            .collect();

        for (head, start, end) in spans {
            self.unlink_free_range(start, end);
            if let Some(table) = &mut self.segments {
                unsafe { table.release_group(head) };
            }
        }
    }

    /// Drops every free-list node inside `[start, end)`. The nodes tile the
    /// range exactly when the covered segments hold no live bytes. The skip
    /// pointer is demoted to the last node before the range.
    fn unlink_free_range(&mut self, start: u32, end: u32) {
        let mut prev_offset = 0;
        let mut prev = self.region_at(0);

        while prev.next_offset != END_OF_LIST && prev.next_offset < start {
            prev_offset = prev.next_offset;
            prev = self.region_at(prev_offset);
        }

        let mut link = prev.next_offset;
        while link != END_OF_LIST && link < end {
            link = self.region_at(link).next_offset;
        }

        self.relink(prev_offset, link);
        self.skip_offset = prev_offset;
    }

    /// Dynamic-emulation accounting: what the system allocator would have
    /// mapped for this block. Slab-destined small blocks are exempt.
    fn account_emulated_alloc(&mut self, aligned: usize, small: bool) {
        if self.config.backend == Backend::DynamicEmul && !(self.config.slab_small_blocks && small) {
            self.allocated_heap_size += aligned;
            self.system_metadata_size += self.config.sys_metadata_size;
        }
    }

    fn account_emulated_free(&mut self, aligned: usize, small: bool) {
        if self.config.backend == Backend::DynamicEmul && !(self.config.slab_small_blocks && small) {
            self.allocated_heap_size -= aligned;
            self.system_metadata_size -= self.config.sys_metadata_size;
        }
    }

    /// Per-segment occupied byte counts, `None` for slots with no backing
    /// attached. Empty on non-segmented backends.
    pub fn segment_occupancy(&self) -> Vec<Option<usize>> {
        match &self.segments {
            Some(table) => (0..table.slot_count())
                .map(|sidx| table.is_attached(sidx).then(|| table.occupied(sidx)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Walks every structure and asserts the allocator's invariants: the free
    /// list is strictly ascending with no adjacent regions and no malformed
    /// sizes, the skip pointer references a live node, the soft limit brackets
    /// the live total, and the per-segment occupancy sums to it. Panics on a
    /// violation, which is a bug in the allocator itself. Meant for debug
    /// harnesses; runs after every public call in this crate's tests.
    pub fn verify_integrity(&self) {
        if self.config.backend == Backend::System {
            return;
        }

        assert_eq!(self.region_at(0).size, 0, "sentinel grew a size");
        assert!(self.heap_limit >= self.blocks_size);
        assert!(self.heap_limit >= self.config.desired_limit);
        assert_eq!(self.heap_limit % self.config.desired_limit, 0);

        let mut free_total = 0usize;
        let mut last_offset = 0u32;
        let mut last_end = None;
        let mut skip_seen = self.skip_offset == 0;

        let mut offset = self.region_at(0).next_offset;
        while offset != END_OF_LIST {
            let region = self.region_at(offset);

            assert!(offset > last_offset, "free list is not strictly ascending");
            assert!(
                region.size as usize >= ALIGNMENT && region.size as usize % ALIGNMENT == 0,
                "free region with a malformed size"
            );
            if last_end == Some(offset) {
                assert!(!self.contiguous_at(offset), "adjacent free regions survived coalescing");
            }
            if offset == self.skip_offset {
                skip_seen = true;
            }

            free_total += region.size as usize;
            last_offset = offset;
            last_end = Some(offset + region.size);
            offset = region.next_offset;
        }

        assert!(skip_seen, "skip pointer references a node not in the list");

        match &self.segments {
            Some(table) => {
                assert_eq!(table.occupied_total(), self.blocks_size);
                assert_eq!(
                    free_total + self.blocks_size + ALIGNMENT,
                    table.attached_count() * self.config.segment_size,
                );
            }
            None => {
                assert_eq!(free_total + self.blocks_size + ALIGNMENT, self.config.heap_size);
            }
        }
    }

    /// Free list as `(offset, size)` pairs, for assertions.
    #[cfg(test)]
    pub(crate) fn free_regions(&self) -> Vec<(u32, u32)> {
        let mut regions = Vec::new();
        let mut offset = self.region_at(0).next_offset;

        while offset != END_OF_LIST {
            let region = self.region_at(offset);
            regions.push((offset, region.size));
            offset = region.next_offset;
        }

        regions
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            if let Some(area) = self.area.take() {
                platform::return_memory(area, self.config.heap_size);
            }
            if let Some(table) = &mut self.segments {
                table.release_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_heap(heap_size: usize) -> Heap {
        Heap::new(HeapConfig::static_heap(heap_size))
    }

    fn offset_of(heap: &Heap, ptr: NonNull<u8>) -> usize {
        heap.compress(ptr) as usize
    }

    #[test]
    fn init_installs_single_region() {
        let heap = static_heap(256);

        // Offset 0 is the sentinel; everything after it is one free region.
        assert_eq!(heap.free_regions(), vec![(8, 248)]);
        assert_eq!(heap.stats().size, 248);
        assert_eq!(heap.stats().allocated_bytes, 0);
        heap.verify_integrity();
    }

    #[test]
    fn adjacent_allocations() {
        let mut heap = static_heap(256);

        let p1 = heap.try_alloc(16).unwrap();
        let p2 = heap.try_alloc(16).unwrap();

        assert_eq!(p2.as_ptr() as usize - p1.as_ptr() as usize, 16);
        assert_eq!(offset_of(&heap, p1), 8);
        assert_eq!(heap.free_regions(), vec![(40, 216)]);
        heap.verify_integrity();

        heap.free(p1, 16);
        heap.free(p2, 16);
    }

    #[test]
    fn free_splits_then_coalesces_back() {
        let mut heap = static_heap(256);

        let p1 = heap.try_alloc(16).unwrap();
        let p2 = heap.try_alloc(16).unwrap();

        heap.free(p1, 16);
        assert_eq!(heap.free_regions(), vec![(8, 16), (40, 216)]);
        heap.verify_integrity();

        heap.free(p2, 16);
        assert_eq!(heap.free_regions(), vec![(8, 248)]);
        heap.verify_integrity();
    }

    #[test]
    fn fast_path_relinks_head() {
        let mut heap = static_heap(256);

        let a = heap.try_alloc(8).unwrap();
        let b = heap.try_alloc(16).unwrap();
        heap.free(a, 8);

        // The head region is exactly one granule now.
        assert_eq!(heap.free_regions()[0], (8, 8));

        // A single-granule request takes the fast path: the head is unlinked
        // and the sentinel points at its successor.
        let c = heap.try_alloc(8).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.region_at(0).next_offset, 32);
        assert_eq!(heap.free_regions(), vec![(32, 224)]);
        heap.verify_integrity();

        heap.free(c, 8);
        heap.free(b, 16);
    }

    #[test]
    fn fast_path_shrinks_head_in_place() {
        let mut heap = static_heap(256);

        let p = heap.try_alloc(8).unwrap();
        assert_eq!(offset_of(&heap, p), 8);
        // The spanning region shrank by one granule instead of unlinking.
        assert_eq!(heap.free_regions(), vec![(16, 240)]);
        heap.verify_integrity();

        heap.free(p, 8);
        assert_eq!(heap.free_regions(), vec![(8, 248)]);
    }

    #[test]
    fn compression_roundtrip() {
        let mut heap = static_heap(256);

        let p = heap.try_alloc(24).unwrap();
        for offset in [0u32, 8, 64, 248] {
            assert_eq!(heap.compress(heap.decompress(offset)), offset);
        }
        assert_eq!(heap.decompress(heap.compress(p)), p);

        heap.free(p, 24);
    }

    #[test]
    fn blocks_do_not_overlap() {
        let mut heap = static_heap(512);

        // Fill each block with its own byte pattern, then verify all of them
        // after the heap is fully carved up.
        let sizes = [24usize, 8, 40, 16, 56];
        let blocks: Vec<NonNull<u8>> = sizes.iter().map(|&n| heap.try_alloc(n).unwrap()).collect();

        for (i, (&size, &block)) in sizes.iter().zip(&blocks).enumerate() {
            unsafe {
                block.as_ptr().write_bytes(i as u8 + 1, size);
            }
        }
        for (i, (&size, &block)) in sizes.iter().zip(&blocks).enumerate() {
            for j in 0..size {
                assert_eq!(unsafe { *block.as_ptr().add(j) }, i as u8 + 1);
            }
        }

        for (&size, &block) in sizes.iter().zip(&blocks) {
            heap.free(block, size);
            heap.verify_integrity();
        }
        assert_eq!(heap.free_regions(), vec![(8, 504)]);
    }

    #[test]
    fn coalescing_is_complete_in_any_order() {
        // Freeing blocks covering a contiguous span must leave one region,
        // whatever the order.
        let orders: [[usize; 6]; 4] = [
            [0, 1, 2, 3, 4, 5],
            [5, 4, 3, 2, 1, 0],
            [0, 2, 4, 1, 3, 5],
            [3, 0, 5, 2, 4, 1],
        ];

        for order in orders {
            let mut heap = static_heap(248);
            let blocks: Vec<NonNull<u8>> = (0..6).map(|_| heap.try_alloc(40).unwrap()).collect();
            assert!(heap.free_regions().is_empty());

            for &i in &order {
                heap.free(blocks[i], 40);
                heap.verify_integrity();
            }
            assert_eq!(heap.free_regions(), vec![(8, 240)]);
        }
    }

    #[test]
    fn free_after_alloc_restores_the_list() {
        let mut heap = static_heap(512);

        // Fragment the heap a little first.
        let keep1 = heap.try_alloc(32).unwrap();
        let hole = heap.try_alloc(48).unwrap();
        let keep2 = heap.try_alloc(16).unwrap();
        heap.free(hole, 48);

        let before = heap.free_regions();
        let p = heap.try_alloc(24).unwrap();
        heap.free(p, 24);
        assert_eq!(heap.free_regions(), before);
        heap.verify_integrity();

        heap.free(keep1, 32);
        heap.free(keep2, 16);
    }

    #[test]
    fn skip_pointer_accelerates_ascending_frees() {
        let mut heap = static_heap(512);

        let blocks: Vec<NonNull<u8>> = (0..8).map(|_| heap.try_alloc(32).unwrap()).collect();

        // Freeing in ascending address order rides the skip pointer after the
        // first insertion.
        for &block in &blocks {
            heap.free(block, 32);
            heap.verify_integrity();
        }

        let stats = heap.stats();
        assert_eq!(stats.skip_count + stats.nonskip_count, stats.free_count);
        assert!(stats.skip_count >= stats.free_count - 2);
    }

    #[test]
    fn heap_limit_steps_with_usage() {
        let mut config = HeapConfig::static_heap(512);
        config.desired_limit = 64;
        let mut heap = Heap::new(config);

        assert_eq!(heap.heap_limit, 64);

        let p1 = heap.try_alloc(64).unwrap();
        assert_eq!(heap.heap_limit, 128);

        let p2 = heap.try_alloc(128).unwrap();
        assert_eq!(heap.heap_limit, 256);

        // Lowering steps back down as far as the live total allows.
        heap.free(p2, 128);
        assert_eq!(heap.heap_limit, 64);

        heap.free(p1, 64);
        // Never below one desired_limit step.
        assert_eq!(heap.heap_limit, 64);
        heap.verify_integrity();
    }

    #[test]
    fn stats_track_waste_and_peaks() {
        let mut heap = static_heap(256);

        let p1 = heap.try_alloc(10).unwrap();
        let p2 = heap.try_alloc(17).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.allocated_bytes, 16 + 24);
        assert_eq!(stats.waste_bytes, 6 + 7);
        assert_eq!(stats.alloc_count, 2);

        heap.free(p1, 10);
        heap.free(p2, 17);

        let stats = heap.stats();
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.waste_bytes, 0);
        assert_eq!(stats.free_count, 2);
        assert_eq!(stats.peak_allocated_bytes, 40);
    }

    #[test]
    fn init_finalize_init_is_idempotent() {
        let mut heap = static_heap(256);
        let p = heap.try_alloc(64).unwrap();
        heap.free(p, 64);
        heap.finalize();

        let heap = static_heap(256);
        assert_eq!(heap.free_regions(), vec![(8, 248)]);
        assert_eq!(heap.stats().alloc_count, 0);
        assert_eq!(heap.stats().allocated_bytes, 0);
        heap.finalize();
    }

    #[test]
    fn heap_pointer_bounds() {
        let mut heap = static_heap(256);

        let p = heap.try_alloc(16).unwrap();
        assert!(heap.is_heap_pointer(p));
        assert!(heap.is_heap_pointer(heap.decompress(0)));

        let mut outside = 0u8;
        assert!(!heap.is_heap_pointer(NonNull::new(&mut outside as *mut u8).unwrap()));

        heap.free(p, 16);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not own")]
    fn freeing_a_foreign_pointer_is_detected() {
        let mut heap = static_heap(256);
        let mut outside = 0u64;
        heap.free(NonNull::new(&mut outside as *mut u64 as *mut u8).unwrap(), 8);
    }
}
