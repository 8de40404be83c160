use std::ptr::NonNull;

use crate::{align::ALIGNMENT, platform, Pointer};

/// Bookkeeping for one segment of the logical offset space.
///
/// Segments are attached in *groups*: one backing mapping covering a run of
/// consecutive segment indices, so that a single block or free region may
/// span every segment of its group. Two segments of different groups are
/// never host-contiguous as far as the heap is concerned, even when the
/// kernel happens to place their mappings next to each other.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Segment {
    /// Host address of the segment, `None` while no backing is attached.
    base: Pointer<u8>,
    /// Bytes of this segment currently inside live blocks.
    occupied_size: u32,
    /// Index of the first segment of the owning group.
    group_head: usize,
    /// Number of segments in the owning group.
    group_len: usize,
}

const UNATTACHED: Segment = Segment {
    base: None,
    occupied_size: 0,
    group_head: 0,
    group_len: 0,
};

/// Fixed-capacity table of segments. The logical heap is the union of the
/// attached ones; offsets identify their segment by integer division.
pub(crate) struct SegmentTable {
    segments: Vec<Segment>,
    segment_size: usize,
}

impl SegmentTable {
    pub fn new(segment_size: usize, segment_count: usize) -> Self {
        Self {
            segments: vec![UNATTACHED; segment_count],
            segment_size,
        }
    }

    /// Total number of segment slots, attached or not.
    pub fn slot_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of segments with backing currently attached.
    pub fn attached_count(&self) -> usize {
        self.segments.iter().filter(|s| s.base.is_some()).count()
    }

    pub fn is_attached(&self, sidx: usize) -> bool {
        self.segments[sidx].base.is_some()
    }

    /// Bytes of segment `sidx` inside live blocks.
    pub fn occupied(&self, sidx: usize) -> usize {
        self.segments[sidx].occupied_size as usize
    }

    /// Sum of every segment's occupied bytes. Must equal the heap's live
    /// block total at all times; both sides update through the same fragment
    /// walk.
    pub fn occupied_total(&self) -> usize {
        self.segments.iter().map(|s| s.occupied_size as usize).sum()
    }

    /// Attaches the smallest group of consecutive segments that can hold
    /// `need` bytes. Returns the group's starting offset and byte length, or
    /// `None` when no run of free slots is left or the platform refuses the
    /// backing memory.
    pub unsafe fn acquire_group(&mut self, need: usize) -> Option<(u32, usize)> {
        let needed = need.div_ceil(self.segment_size).max(1);
        let head = self.find_free_run(needed)?;
        let length = needed * self.segment_size;

        let base = platform::request_memory(length)?;

        for i in 0..needed {
            self.segments[head + i] = Segment {
                base: Some(NonNull::new_unchecked(base.as_ptr().add(i * self.segment_size))),
                occupied_size: 0,
                group_head: head,
                group_len: needed,
            };
        }

        Some(((head * self.segment_size) as u32, length))
    }

    /// First index of a run of `needed` consecutive unattached slots.
    fn find_free_run(&self, needed: usize) -> Option<usize> {
        if needed > self.segments.len() {
            return None;
        }

        'candidate: for head in 0..=(self.segments.len() - needed) {
            for i in 0..needed {
                if self.segments[head + i].base.is_some() {
                    continue 'candidate;
                }
            }
            return Some(head);
        }

        None
    }

    /// Heads of non-initial groups whose segments hold no live bytes. The
    /// initial group (head 0) is kept until finalize.
    pub fn empty_group_heads(&self) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(sidx, segment)| {
                segment.base.is_some() && segment.group_head == *sidx && *sidx != 0
            })
            .filter(|(sidx, segment)| {
                (0..segment.group_len).all(|i| self.segments[sidx + i].occupied_size == 0)
            })
            .map(|(sidx, _)| sidx)
            .collect()
    }

    /// Offset range `[start, end)` covered by the group headed at `head`.
    pub fn group_span(&self, head: usize) -> (u32, u32) {
        let len = self.segments[head].group_len;
        (
            (head * self.segment_size) as u32,
            ((head + len) * self.segment_size) as u32,
        )
    }

    /// Detaches the group headed at `head`, returning its backing memory.
    pub unsafe fn release_group(&mut self, head: usize) {
        let segment = self.segments[head];
        debug_assert_eq!(segment.group_head, head, "not a group head");

        if let Some(base) = segment.base {
            platform::return_memory(base, segment.group_len * self.segment_size);
        }

        for i in 0..segment.group_len {
            self.segments[head + i] = UNATTACHED;
        }
    }

    /// Detaches every remaining group. Used on drop.
    pub unsafe fn release_all(&mut self) {
        for head in 0..self.segments.len() {
            if self.segments[head].base.is_some() && self.segments[head].group_head == head {
                self.release_group(head);
            }
        }
    }

    /// Host address for a compressed offset.
    ///
    /// # Safety
    ///
    /// The segment owning `offset` must be attached.
    #[inline]
    pub unsafe fn decompress(&self, offset: u32) -> NonNull<u8> {
        let sidx = offset as usize / self.segment_size;
        let segment = &self.segments[sidx];
        debug_assert!(segment.base.is_some(), "offset inside an unattached segment");

        let base = segment.base.unwrap_unchecked();
        NonNull::new_unchecked(base.as_ptr().add(offset as usize % self.segment_size))
    }

    /// Compressed offset for a host address, by linear search of the segment
    /// base table. `None` when the address is not inside any attached
    /// segment.
    pub fn compress(&self, ptr: NonNull<u8>) -> Option<u32> {
        for (sidx, segment) in self.segments.iter().enumerate() {
            let Some(base) = segment.base else { continue };
            let diff = (ptr.as_ptr() as usize).wrapping_sub(base.as_ptr() as usize);

            if diff < self.segment_size {
                return Some((sidx * self.segment_size + diff) as u32);
            }
        }

        None
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.compress(ptr).is_some()
    }

    /// Whether the byte at `boundary` is host-contiguous with the byte right
    /// before it. True inside a segment; at a segment boundary only when both
    /// sides belong to the same group. Free regions may only merge across
    /// contiguous boundaries.
    pub fn contiguous_at(&self, boundary: u32) -> bool {
        let boundary = boundary as usize;
        if boundary % self.segment_size != 0 {
            return true;
        }

        let sidx = boundary / self.segment_size;
        if sidx == 0 || sidx >= self.segments.len() {
            return false;
        }

        self.segments[sidx].base.is_some()
            && self.segments[sidx - 1].base.is_some()
            && self.segments[sidx].group_head == self.segments[sidx - 1].group_head
    }

    /// Adds `size` bytes starting at `start_offset` to the occupancy of every
    /// touched segment.
    pub fn occupy(&mut self, start_offset: u32, size: u32) {
        let segment_size = self.segment_size;
        self.for_each_fragment(start_offset, size, |segment, fragment| {
            segment.occupied_size += fragment;
            debug_assert!(segment.occupied_size as usize <= segment_size);
        });
    }

    /// Removes `size` bytes starting at `start_offset` from the occupancy of
    /// every touched segment.
    pub fn vacate(&mut self, start_offset: u32, size: u32) {
        self.for_each_fragment(start_offset, size, |segment, fragment| {
            debug_assert!(segment.occupied_size >= fragment);
            segment.occupied_size -= fragment;
        });
    }

    /// Walks the `[start, end]` granule range of a block, handing each
    /// touched segment the length of its intersection. Allocation and free
    /// share this walk, which keeps the occupied sum equal to the live block
    /// total by construction.
    fn for_each_fragment(&mut self, start_offset: u32, size: u32, mut f: impl FnMut(&mut Segment, u32)) {
        debug_assert!(size > 0 && size % ALIGNMENT as u32 == 0);

        let granule = ALIGNMENT as u32;
        let segment_size = self.segment_size as u32;
        // Inclusive offset of the block's last granule.
        let block_end = start_offset + size - granule;
        let mut fragment_start = start_offset;

        loop {
            let sidx = (fragment_start / segment_size) as usize;
            let segment_end = (sidx as u32 + 1) * segment_size - granule;
            let fragment_end = block_end.min(segment_end);

            f(&mut self.segments[sidx], fragment_end - fragment_start + granule);

            if fragment_end == block_end {
                break;
            }
            fragment_start = fragment_end + granule;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached_table(segment_size: usize, segment_count: usize) -> SegmentTable {
        let mut table = SegmentTable::new(segment_size, segment_count);
        unsafe {
            table
                .acquire_group(segment_size * segment_count)
                .expect("backing memory");
        }
        table
    }

    #[test]
    fn fragment_walk_within_one_segment() {
        let mut table = attached_table(128, 2);

        table.occupy(8, 32);
        assert_eq!(table.occupied(0), 32);
        assert_eq!(table.occupied(1), 0);

        table.vacate(8, 32);
        assert_eq!(table.occupied_total(), 0);
        unsafe { table.release_all() }
    }

    #[test]
    fn fragment_walk_straddles_boundary() {
        let mut table = attached_table(128, 3);

        // [120, 280): 8 bytes in segment 0, 128 in segment 1, 24 in segment 2.
        table.occupy(120, 160);
        assert_eq!(table.occupied(0), 8);
        assert_eq!(table.occupied(1), 128);
        assert_eq!(table.occupied(2), 24);
        assert_eq!(table.occupied_total(), 160);

        table.vacate(120, 160);
        assert_eq!(table.occupied_total(), 0);
        unsafe { table.release_all() }
    }

    #[test]
    fn group_acquisition_finds_runs() {
        let mut table = SegmentTable::new(128, 4);

        unsafe {
            let (first, first_len) = table.acquire_group(1).unwrap();
            assert_eq!((first, first_len), (0, 128));

            // 200 bytes need two consecutive segments.
            let (second, second_len) = table.acquire_group(200).unwrap();
            assert_eq!((second, second_len), (128, 256));
            assert_eq!(table.attached_count(), 3);

            // Only one slot left; a two-segment group cannot fit.
            assert!(table.acquire_group(200).is_none());
            assert!(table.acquire_group(1).is_some());
            assert!(table.acquire_group(1).is_none());
            table.release_all();
        }
    }

    #[test]
    fn group_release_reopens_slots() {
        let mut table = SegmentTable::new(128, 4);

        unsafe {
            table.acquire_group(1).unwrap();
            let (offset, _) = table.acquire_group(200).unwrap();
            let head = offset as usize / 128;

            assert_eq!(table.empty_group_heads(), vec![head]);
            assert_eq!(table.group_span(head), (128, 384));

            table.release_group(head);
            assert_eq!(table.attached_count(), 1);
            assert!(!table.is_attached(head));

            // The slots are reusable afterwards.
            assert_eq!(table.acquire_group(200).unwrap().0, 128);
            table.release_all();
        }
    }

    #[test]
    fn initial_group_is_never_reported_empty() {
        let mut table = attached_table(128, 2);
        assert!(table.empty_group_heads().is_empty());
        unsafe { table.release_all() }
    }

    #[test]
    fn boundaries_inside_a_group_are_contiguous() {
        let mut table = SegmentTable::new(128, 4);

        unsafe {
            table.acquire_group(1).unwrap();
            table.acquire_group(200).unwrap();
        }

        // Mid-segment offsets always are.
        assert!(table.contiguous_at(64));
        // Segment 0 and 1 come from different mappings.
        assert!(!table.contiguous_at(128));
        // Segments 1 and 2 share one mapping.
        assert!(table.contiguous_at(256));
        // Nothing is attached past the second group.
        assert!(!table.contiguous_at(384));
        unsafe { table.release_all() }
    }

    #[test]
    fn compression_roundtrip_across_groups() {
        let mut table = SegmentTable::new(128, 4);

        unsafe {
            table.acquire_group(1).unwrap();
            table.acquire_group(200).unwrap();

            for offset in [0u32, 8, 120, 128, 256, 376] {
                let ptr = table.decompress(offset);
                assert_eq!(table.compress(ptr), Some(offset));
            }
        }

        let outside = NonNull::new(&mut 0u8 as *mut u8).unwrap();
        assert_eq!(table.compress(outside), None);
        unsafe { table.release_all() }
    }
}
