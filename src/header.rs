use std::{cmp, mem, ptr, ptr::NonNull};

use static_assertions::const_assert_eq;

/// The atomic alignment quantum. Every size the allocator handles is rounded
/// up to a whole number of blocks, so any pointer we hand out is aligned to
/// at least `BLOCK_SIZE` bytes, which covers every scalar the consuming
/// libraries store.
pub type Block = u64;

/// Size of one [`Block`] in bytes.
pub const BLOCK_SIZE: usize = mem::size_of::<Block>();

/// Size of an [`AllocationHeader`] in bytes. See [`AllocationHeader`].
pub const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

/// Number of blocks an [`AllocationHeader`] occupies.
pub(crate) const HEADER_BLOCKS: usize = HEADER_SIZE / BLOCK_SIZE;

/// Smallest footprint of any allocation, in blocks: one header plus one
/// payload block. Free space smaller than this cannot be carved into a
/// separate allocation and is handed over wholesale instead.
pub(crate) const MIN_ALLOC_BLOCKS: usize = 1 + HEADER_BLOCKS;

/// Tag of a header that is live in a region, or freshly constructed. Any
/// other value means some strategy's freelist array knows about the header.
pub(crate) const UNTAGGED: u32 = 0;

/// Tag reserved by the system passthrough strategy to mark its ownership.
/// Never a valid one-based freelist index because no freelist grows that far.
pub(crate) const SYSTEM_TAG: u32 = u32::MAX;

// The header must itself be a whole number of blocks, otherwise the payload
// right after it would be misaligned.
const_assert_eq!(HEADER_SIZE % BLOCK_SIZE, 0);

/// In-band metadata written immediately before every payload the allocator
/// hands out, no matter which strategy produced it:
///
/// ```text
/// +--------------+--------------+
/// | block_count  | freelist_tag |  <- AllocationHeader, one block.
/// +--------------+--------------+
/// |           Payload           |  <- User pointer points here.
/// +-----------------------------+
/// |             ...             |     block_count blocks of payload.
/// +-----------------------------+
/// ```
///
/// `freelist_tag` does double duty. Zero means "live, nobody indexes this
/// header". [`SYSTEM_TAG`] marks a block obtained straight from the host
/// heap. Anything else is a one-based index into the owning strategy's
/// freelist array, which lets that array swap-remove entries in O(1) and
/// lets ownership checks run in O(1) without storing pointers in the header.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct AllocationHeader {
    /// Number of payload blocks following this header.
    pub block_count: u32,
    /// See the struct docs. Zero, [`SYSTEM_TAG`], or a one-based index.
    pub freelist_tag: u32,
}

impl AllocationHeader {
    /// Returns the header of an allocation given the pointer the user was
    /// handed out.
    ///
    /// ```text
    /// +----------------------+
    /// |   AllocationHeader   | <- Returned address points here.
    /// +----------------------+
    /// |       Payload        | <- Given address should point here.
    /// +----------------------+
    /// ```
    ///
    /// # Safety
    ///
    /// The given address must point exactly to the first byte after a valid
    /// [`AllocationHeader`]. Every pointer the allocator hands out satisfies
    /// this, so it holds as long as the caller only passes back pointers
    /// they were given.
    #[inline]
    pub unsafe fn from_user_pointer(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address right after the header, which is what the user
    /// receives.
    ///
    /// # Notes
    ///
    /// We use this as `AllocationHeader::user_pointer_of(header)` instead of
    /// `header.user_pointer()` to avoid creating intermediary references to
    /// `self` and keep Miri happy. See
    /// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
    #[inline]
    pub unsafe fn user_pointer_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Address of the header that would sit right after this allocation's
    /// payload. Inside a region this is either a real header, the region's
    /// bump pointer, or the region's zeroed sentinel slot.
    ///
    /// # Safety
    ///
    /// `header` must point to a valid [`AllocationHeader`]. The returned
    /// pointer is only dereferenceable while it stays inside the memory the
    /// owning strategy manages.
    #[inline]
    pub unsafe fn next_of(header: NonNull<Self>) -> NonNull<Self> {
        let payload_blocks = (*header.as_ptr()).block_count as usize;
        NonNull::new_unchecked(
            header
                .as_ptr()
                .cast::<Block>()
                .add(HEADER_BLOCKS + payload_blocks)
                .cast(),
        )
    }
}

/// Number of payload blocks needed to store `size` bytes.
#[inline]
pub(crate) fn blocks_for(size: usize) -> usize {
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// Total footprint in bytes of an allocation holding `size` bytes of
/// payload, header included.
#[inline]
pub(crate) fn total_size(size: usize) -> usize {
    HEADER_SIZE + blocks_for(size) * BLOCK_SIZE
}

/// Copies as much payload from `from` into `to` as the smaller of the two
/// can hold. Used whenever a reallocation has to move bytes to a new block.
///
/// # Safety
///
/// Both pointers must head valid, non-overlapping allocations.
pub(crate) unsafe fn copy_payload_prefix(
    from: NonNull<AllocationHeader>,
    to: NonNull<AllocationHeader>,
) {
    let blocks = cmp::min((*from.as_ptr()).block_count, (*to.as_ptr()).block_count) as usize;
    ptr::copy_nonoverlapping(
        AllocationHeader::user_pointer_of(from).as_ptr(),
        AllocationHeader::user_pointer_of(to).as_ptr(),
        blocks * BLOCK_SIZE,
    );
}
