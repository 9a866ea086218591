use std::ptr::NonNull;

use crate::{
    freelist::FreeList,
    header::{self, AllocationHeader, SYSTEM_TAG},
    platform, Pointer,
};

/// Untracked passthrough to the host heap. Carries no state at all: two
/// system handles are interchangeable, and ownership of a block is encoded
/// in the block itself by stamping [`SYSTEM_TAG`] into its header.
pub(crate) struct SystemDirect;

impl SystemDirect {
    /// # Safety
    ///
    /// `size` must be non-zero.
    pub unsafe fn make(size: usize) -> Pointer<AllocationHeader> {
        debug_assert!(size > 0);

        let header = platform::request(header::total_size(size))?.cast::<AllocationHeader>();
        header.as_ptr().write(AllocationHeader {
            block_count: header::blocks_for(size) as u32,
            freelist_tag: SYSTEM_TAG,
        });
        Some(header)
    }

    /// # Safety
    ///
    /// `header` must head a live allocation made by [`SystemDirect::make`].
    pub unsafe fn resize(header: NonNull<AllocationHeader>, size: usize) -> Pointer<AllocationHeader> {
        debug_assert!(size > 0);
        debug_assert_eq!((*header.as_ptr()).freelist_tag, SYSTEM_TAG);

        let moved = platform::resize(header.cast(), header::total_size(size))?
            .cast::<AllocationHeader>();
        (*moved.as_ptr()).block_count = header::blocks_for(size) as u32;
        Some(moved)
    }

    /// # Safety
    ///
    /// Same contract as [`SystemDirect::resize`]; `header` must not be used
    /// afterwards.
    pub unsafe fn free(header: NonNull<AllocationHeader>) {
        debug_assert_eq!((*header.as_ptr()).freelist_tag, SYSTEM_TAG);
        platform::release(header.cast());
    }

    /// # Safety
    ///
    /// `header` must point to a valid [`AllocationHeader`].
    pub unsafe fn owns(header: NonNull<AllocationHeader>) -> bool {
        (*header.as_ptr()).freelist_tag == SYSTEM_TAG
    }
}

/// Host-heap strategy that remembers what it handed out. The [`FreeList`]
/// is used purely as an ownership ledger here: membership is the ownership
/// predicate, and teardown walks the ledger to release every block that was
/// never freed explicitly.
pub(crate) struct TrackedSystem {
    ledger: FreeList,
}

impl TrackedSystem {
    pub const fn new() -> Self {
        Self {
            ledger: FreeList::new(),
        }
    }

    /// # Safety
    ///
    /// `size` must be non-zero.
    pub unsafe fn make(&mut self, size: usize) -> Pointer<AllocationHeader> {
        debug_assert!(size > 0);

        let header = platform::request(header::total_size(size))?.cast::<AllocationHeader>();
        header.as_ptr().write(AllocationHeader {
            block_count: header::blocks_for(size) as u32,
            freelist_tag: header::UNTAGGED,
        });
        self.ledger.append(header);
        Some(header)
    }

    /// Resizes a tracked block. When the host heap moves it, the ledger slot
    /// it occupies is rebound to the new address; the same address means the
    /// same identity and the ledger already points at it.
    ///
    /// # Safety
    ///
    /// `header` must be a member of this strategy's ledger.
    pub unsafe fn resize(
        &mut self,
        header: NonNull<AllocationHeader>,
        size: usize,
    ) -> Pointer<AllocationHeader> {
        debug_assert!(size > 0);
        debug_assert!(self.ledger.contains(header));

        let moved = platform::resize(header.cast(), header::total_size(size))?
            .cast::<AllocationHeader>();
        if moved != header {
            // The heap copied the header, tag included, to the new address.
            self.ledger.rebind(moved);
        }
        (*moved.as_ptr()).block_count = header::blocks_for(size) as u32;
        Some(moved)
    }

    /// # Safety
    ///
    /// `header` must be a member of this strategy's ledger; it must not be
    /// used afterwards.
    pub unsafe fn free(&mut self, header: NonNull<AllocationHeader>) {
        self.ledger.remove(header);
        platform::release(header.cast());
    }

    /// # Safety
    ///
    /// `header` must point to a valid [`AllocationHeader`].
    pub unsafe fn owns(&self, header: NonNull<AllocationHeader>) -> bool {
        self.ledger.contains(header)
    }

    /// Releases every block still on the ledger.
    pub fn release_all(&mut self) {
        for index in 0..self.ledger.len() {
            unsafe { platform::release(self.ledger.entry(index).cast()) };
        }
        self.ledger.clear();
    }

    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.ledger.len()
    }
}

impl Drop for TrackedSystem {
    fn drop(&mut self) {
        self.release_all();
    }
}
