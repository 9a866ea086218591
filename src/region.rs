use std::ptr::NonNull;

use crate::{
    freelist::FreeList,
    header::{
        self, AllocationHeader, Block, BLOCK_SIZE, HEADER_BLOCKS, HEADER_SIZE, MIN_ALLOC_BLOCKS,
        UNTAGGED,
    },
    platform, Pointer,
};

/// One contiguous arena of blocks managed by a bump pointer plus a
/// [`FreeList`] of holes behind it:
///
/// ```text
///            memory                      head                end
///              |                           |                  |
///              v                           v                  v
/// +--------+---------+--------+--------+------------------+--------+
/// | Alloc  |  Free   | Alloc  | Alloc  |   Virgin space   |Sentinel|
/// +--------+---------+--------+--------+------------------+--------+
///              ^
///              |
///              +--- freelist entry
/// ```
///
/// Every byte in `[memory, head)` belongs to exactly one allocation, so
/// walking headers with [`AllocationHeader::next_of`] from `memory` lands on
/// `head` exactly. The final header-sized slot at `end` is zeroed once at
/// construction: walking off the last allocation always reads a vacant
/// header instead of uninitialized memory, which is what keeps the
/// coalescing and tail checks branch-free.
pub(crate) struct Region {
    /// First block of the buffer.
    memory: NonNull<Block>,
    /// Bump pointer. Everything before it is allocated (or on the freelist),
    /// everything from here to `end` has never been handed out.
    head: NonNull<Block>,
    /// Upper bound for allocations, one header short of the buffer's true
    /// end. The slot behind it is the zeroed sentinel.
    end: NonNull<Block>,
    /// Holes inside `[memory, head)`.
    freelist: FreeList,
    /// Whether teardown returns the buffer to the host heap.
    owns_memory: bool,
}

impl Region {
    /// Builds a region over a caller-provided buffer of `bytes` bytes.
    /// Panics when the buffer cannot even hold the sentinel header.
    ///
    /// # Safety
    ///
    /// `memory` must be valid for reads and writes of `bytes` bytes, aligned
    /// to [`BLOCK_SIZE`], and must outlive the region. When `owns_memory` is
    /// true it must additionally have come from [`platform::request`].
    pub unsafe fn from_raw_parts(memory: NonNull<u8>, bytes: usize, owns_memory: bool) -> Self {
        let block_count = bytes / BLOCK_SIZE;
        assert!(
            block_count >= HEADER_BLOCKS,
            "region buffer of {bytes} bytes cannot hold an allocation header"
        );

        let memory = memory.cast::<Block>();
        let end = NonNull::new_unchecked(memory.as_ptr().add(block_count - HEADER_BLOCKS));

        // The reserved slot reads as a vacant header forever.
        end.cast::<AllocationHeader>().as_ptr().write(AllocationHeader {
            block_count: 0,
            freelist_tag: UNTAGGED,
        });

        Self {
            memory,
            head: memory,
            end,
            freelist: FreeList::new(),
            owns_memory,
        }
    }

    /// Builds a region over a fresh host-heap buffer big enough that a
    /// single allocation of up to `payload_bytes` bytes always fits. Panics
    /// when the host heap refuses, which is a bookkeeping failure the
    /// process does not recover from.
    pub fn with_capacity(payload_bytes: usize) -> Self {
        let bytes = header::total_size(payload_bytes) + HEADER_SIZE;

        let Some(memory) = (unsafe { platform::request(bytes) }) else {
            panic!("failed to allocate a {bytes} byte buffer for a region");
        };

        unsafe { Self::from_raw_parts(memory, bytes, true) }
    }

    /// Whether `header` points into this region's buffer.
    pub fn contains(&self, header: NonNull<AllocationHeader>) -> bool {
        let block = header.cast::<Block>();
        self.memory <= block && block < self.end
    }

    fn remaining_blocks(&self) -> usize {
        unsafe { self.end.as_ptr().offset_from(self.head.as_ptr()) as usize }
    }

    /// Moves `head` forward by `blocks` if the virgin space allows it.
    fn try_advancing_head(&mut self, blocks: usize) -> bool {
        if blocks > self.remaining_blocks() {
            return false;
        }
        self.head = unsafe { NonNull::new_unchecked(self.head.as_ptr().add(blocks)) };
        true
    }

    /// Carves an allocation of at least `size` bytes out of this region,
    /// trying the freelist first and the bump pointer second. Returns the
    /// header with its tag already zeroed, or `None` when the region is
    /// exhausted.
    ///
    /// # Safety
    ///
    /// The region's buffer must be live. `size` must be non-zero.
    pub unsafe fn make(&mut self, size: usize) -> Pointer<AllocationHeader> {
        debug_assert!(size > 0);

        let needed = header::blocks_for(size) + HEADER_BLOCKS;

        if self.freelist.is_empty() && self.remaining_blocks() < needed {
            return None;
        }

        // First fit over the holes.
        for index in 0..self.freelist.len() {
            let entry = self.freelist.entry(index);

            let taken = self.freelist.take_blocks_from(entry, needed);
            if taken == 0 {
                continue;
            }

            debug_assert!(taken >= needed);
            (*entry.as_ptr()).freelist_tag = UNTAGGED;
            (*entry.as_ptr()).block_count = (taken - HEADER_BLOCKS) as u32;
            return Some(entry);
        }

        // No hole fits, bump the head.
        let allocation = self.head.cast::<AllocationHeader>();
        if self.try_advancing_head(needed) {
            allocation.as_ptr().write(AllocationHeader {
                block_count: (needed - HEADER_BLOCKS) as u32,
                freelist_tag: UNTAGGED,
            });
            return Some(allocation);
        }

        None
    }

    /// Releases an allocation. A tail allocation hands its blocks straight
    /// back to the bump pointer; anything else joins the freelist, merging
    /// with adjacent holes.
    ///
    /// # Safety
    ///
    /// `header` must head a live allocation inside this region.
    pub unsafe fn free(&mut self, header: NonNull<AllocationHeader>) {
        let block_count = (*header.as_ptr()).block_count as usize;

        if AllocationHeader::next_of(header).cast::<Block>() == self.head {
            self.head =
                NonNull::new_unchecked(self.head.as_ptr().sub(HEADER_BLOCKS + block_count));
        } else {
            self.freelist.join(header);
        }
    }

    /// Resizes an allocation without moving it. Returns false when that is
    /// impossible, in which case nothing has changed.
    ///
    /// Shrinking succeeds by retracting the head (tail allocation) or by
    /// carving the surplus into a new hole; a shrink too small to carve
    /// anything out of is reported as success without changes. Growing
    /// succeeds by advancing the head (tail allocation) or by absorbing a
    /// free right neighbour.
    ///
    /// # Safety
    ///
    /// `header` must head a live allocation inside this region. `size` must
    /// be non-zero.
    pub unsafe fn resize_in_place(&mut self, header: NonNull<AllocationHeader>, size: usize) -> bool {
        debug_assert!(size > 0);

        let current = (*header.as_ptr()).block_count as usize;
        let required = header::blocks_for(size);

        if current >= required + MIN_ALLOC_BLOCKS {
            let surplus = current - required;

            if AllocationHeader::next_of(header).cast::<Block>() == self.head {
                self.head = NonNull::new_unchecked(self.head.as_ptr().sub(surplus));
                (*header.as_ptr()).block_count = required as u32;
                return true;
            }

            (*header.as_ptr()).block_count = required as u32;
            let remainder = AllocationHeader::next_of(header);
            remainder.as_ptr().write(AllocationHeader {
                block_count: (surplus - HEADER_BLOCKS) as u32,
                freelist_tag: UNTAGGED,
            });
            self.freelist.join(remainder);
            return true;
        }

        if current < required {
            let extra = required - current;
            let next = AllocationHeader::next_of(header);

            // A tail allocation grows straight into the virgin space.
            if next.cast::<Block>() == self.head {
                if !self.try_advancing_head(extra) {
                    return false;
                }
                (*header.as_ptr()).block_count += extra as u32;
                return true;
            }

            // Otherwise the only option is eating into a free right
            // neighbour.
            if self.freelist.contains(next) {
                let taken = self.freelist.take_blocks_from(next, extra);
                if taken == 0 {
                    return false;
                }
                debug_assert!(taken >= extra);
                (*header.as_ptr()).block_count += taken as u32;
                return true;
            }

            return false;
        }

        // Shrunk by less than a carvable hole, or unchanged.
        true
    }

    /// Resizes an allocation within this region, moving it when in-place
    /// resizing fails. Returns the possibly relocated header, or `None` when
    /// the region cannot hold the new size at all.
    ///
    /// # Safety
    ///
    /// Same contract as [`Region::resize_in_place`].
    pub unsafe fn reallocate(
        &mut self,
        header: NonNull<AllocationHeader>,
        size: usize,
    ) -> Pointer<AllocationHeader> {
        if self.resize_in_place(header, size) {
            return Some(header);
        }

        let moved = self.make(size)?;
        header::copy_payload_prefix(header, moved);
        self.free(header);
        Some(moved)
    }

    /// Tears the region down: the buffer goes back to the host heap if the
    /// region owns it, and the region is left empty and refusing all
    /// further allocations.
    pub fn release(&mut self) {
        if self.owns_memory {
            unsafe { platform::release(self.memory.cast()) };
            self.owns_memory = false;
        }
        self.head = self.memory;
        self.end = self.memory;
        self.freelist.clear();
    }

    #[cfg(test)]
    pub fn head_offset(&self) -> usize {
        unsafe { self.head.as_ptr().offset_from(self.memory.as_ptr()) as usize }
    }

    #[cfg(test)]
    pub fn freelist_len(&self) -> usize {
        self.freelist.len()
    }

    /// Walks the allocation chain from `memory` and asserts it lands on
    /// `head` exactly, returning the number of headers visited.
    #[cfg(test)]
    pub unsafe fn assert_walkable(&self) -> usize {
        let mut current = self.memory;
        let mut visited = 0;

        while current < self.head {
            let header = current.cast::<AllocationHeader>();
            current = AllocationHeader::next_of(header).cast();
            visited += 1;
        }

        assert_eq!(current, self.head, "allocation chain overshoots the head");
        visited
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.owns_memory {
            unsafe { platform::release(self.memory.cast()) };
        }
    }
}
