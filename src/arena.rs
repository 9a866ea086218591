use std::ptr::NonNull;

use log::debug;

use crate::{
    header::{self, AllocationHeader},
    region::Region,
    Pointer,
};

/// Growing-region strategy: an ordered collection of [`Region`]s that gains
/// a fresh one whenever no existing region can serve a request.
///
/// ```text
/// regions[0] -> +--------+--------+------------+
///               | Alloc  | Alloc  |   Virgin   |
///               +--------+--------+------------+
/// regions[1] -> +-----------------+------------+
///               |      Alloc      |   Virgin   |
///               +-----------------+------------+
/// regions[2] -> ...
/// ```
///
/// Regions are appended and never reordered or dropped individually; a
/// pointer is routed to its region by a range test. Requests larger than
/// `region_size` are refused outright so a fallback handle can pick them
/// up. Each fresh region is sized so that any request up to `region_size`
/// fits it, which is what makes the append path infallible short of the
/// host heap running dry.
pub(crate) struct Arena {
    /// Largest payload a single region serves, in bytes.
    region_size: usize,
    regions: Vec<Region>,
}

impl Arena {
    pub const fn new(region_size: usize) -> Self {
        Self {
            region_size,
            regions: Vec::new(),
        }
    }

    /// Allocates from the first region with room, appending a new region
    /// when they are all full. `None` means the request exceeds
    /// `region_size`.
    ///
    /// # Safety
    ///
    /// `size` must be non-zero.
    pub unsafe fn make(&mut self, size: usize) -> Pointer<AllocationHeader> {
        if size > self.region_size {
            return None;
        }

        for region in &mut self.regions {
            if let Some(allocation) = region.make(size) {
                return Some(allocation);
            }
        }

        debug!(
            "all {} regions full, growing the arena by {} bytes",
            self.regions.len(),
            self.region_size
        );

        let mut region = Region::with_capacity(self.region_size);
        let allocation = region.make(size);
        debug_assert!(allocation.is_some());
        self.regions.push(region);

        allocation
    }

    /// Resizes an allocation, preferring in place, then moving it anywhere
    /// in the arena. `None` means the new size exceeds `region_size` or the
    /// host heap refused to grow the arena.
    ///
    /// # Safety
    ///
    /// `header` must head a live allocation owned by this arena.
    pub unsafe fn reallocate(
        &mut self,
        header: NonNull<AllocationHeader>,
        size: usize,
    ) -> Pointer<AllocationHeader> {
        if size > self.region_size {
            return None;
        }

        let owner = self.regions.iter().position(|region| region.contains(header))?;

        if self.regions[owner].resize_in_place(header, size) {
            return Some(header);
        }

        // `make` may append a region and shift the region metadata around,
        // which is why the owner is remembered by index, not by reference.
        let moved = self.make(size)?;
        header::copy_payload_prefix(header, moved);
        self.regions[owner].free(header);
        Some(moved)
    }

    /// # Safety
    ///
    /// `header` must head a live allocation owned by this arena; it must
    /// not be used afterwards.
    pub unsafe fn free(&mut self, header: NonNull<AllocationHeader>) {
        for region in &mut self.regions {
            if region.contains(header) {
                region.free(header);
                return;
            }
        }

        debug_assert!(false, "freeing an allocation this arena does not own");
    }

    pub fn owns(&self, header: NonNull<AllocationHeader>) -> bool {
        self.regions.iter().any(|region| region.contains(header))
    }

    /// Drops every region, returning their buffers to the host heap. The
    /// arena keeps its configuration and may be used again.
    pub fn release_all(&mut self) {
        self.regions.clear();
    }

    #[cfg(test)]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}
