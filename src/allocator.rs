use std::{cmp, ptr, ptr::NonNull};

use log::debug;

use crate::{
    arena::Arena,
    header::{AllocationHeader, BLOCK_SIZE, HEADER_SIZE},
    region::Region,
    system::{SystemDirect, TrackedSystem},
    Pointer,
};

/// What a handle does when its own strategy cannot serve a request: nothing,
/// or hand the request to the next handle in the chain. Each handle owns its
/// fallback, so a chain is a singly-linked list torn down from the root.
///
/// ```text
/// +--------------+  fallback   +----------------+  fallback   +--------+
/// | fixed region | ----------> | tracked system | ----------> | (none) |
/// +--------------+             +----------------+             +--------+
///       ^
///       |
///     caller
/// ```
///
/// All four strategies stamp the same header in front of every payload, so
/// any handle can recognise what it handed out. Freeing and resizing walk
/// the chain to find the owner; allocating walks the chain until somebody
/// has room.
enum Strategy {
    /// Untracked passthrough to the host heap. Stateless.
    System,
    /// Host heap plus an ownership ledger, released wholesale on teardown.
    TrackedSystem(TrackedSystem),
    /// Exactly one region over a fixed buffer. Never grows.
    FixedRegion(Region),
    /// A list of regions that grows on demand.
    GrowingRegion(Arena),
}

/// A pluggable allocator handle.
///
/// Every handle serves the same operations (allocate, allocate zeroed,
/// copy, reallocate, free and [`destroy`](Allocator::destroy)) and differs
/// only in where the bytes come from. Handles compose through
/// [`with_fallback`](Allocator::with_fallback): when a handle cannot serve
/// an allocation it forwards the request down the chain, and freeing or
/// resizing a pointer is routed back to whichever handle in the chain owns
/// it.
///
/// Allocation returns `None` on exhaustion of the whole chain and for
/// zero-sized requests; handing back a pointer the chain does not own is a
/// bug in the caller and panics.
///
/// # Examples
///
/// A bounded scratch arena that spills into the host heap:
///
/// ```
/// use challoc::Allocator;
///
/// let mut scratch = Allocator::fixed_region(450).with_fallback(Allocator::tracked_system());
///
/// // The region serves three of these; the rest come from the host heap.
/// let pointers: Vec<_> = (0..20).map(|_| scratch.allocate(100).unwrap()).collect();
///
/// unsafe {
///     for pointer in &pointers {
///         pointer.as_ptr().write_bytes(0xAB, 100);
///     }
///     scratch.free(Some(pointers[0]));
/// }
///
/// // Returns the region buffer and every spilled block.
/// scratch.destroy();
/// ```
///
/// A growing arena with in-place resizing:
///
/// ```
/// use challoc::Allocator;
///
/// let mut arena = Allocator::growing(4096);
///
/// let small = arena.allocate(16).unwrap();
/// let grown = unsafe { arena.reallocate(Some(small), 64) }.unwrap();
/// // The allocation sat at the tail of its region, so it grew in place.
/// assert_eq!(small, grown);
///
/// arena.destroy();
/// ```
pub struct Allocator {
    strategy: Strategy,
    fallback: Option<Box<Allocator>>,
}

impl Allocator {
    /// The system passthrough handle. Stateless; two of these are
    /// interchangeable. The one handle that must never be
    /// [`destroy`](Allocator::destroy)ed.
    pub const fn system() -> Self {
        Self {
            strategy: Strategy::System,
            fallback: None,
        }
    }

    /// A host-heap handle that keeps a ledger of its live blocks and
    /// releases all of them on [`destroy`](Allocator::destroy) or drop.
    pub const fn tracked_system() -> Self {
        Self {
            strategy: Strategy::TrackedSystem(TrackedSystem::new()),
            fallback: None,
        }
    }

    /// A fixed-region handle over caller-provided memory. The region never
    /// grows; once it is full, allocations fail locally and flow into the
    /// fallback, if any. Panics when `bytes` cannot hold even one header.
    ///
    /// # Safety
    ///
    /// `memory` must be valid for reads and writes of `bytes` bytes, aligned
    /// to [`BLOCK_SIZE`], unaliased for the handle's lifetime, and must
    /// outlive the handle. When `owns_memory` is true, it must have come
    /// from the host heap so teardown can return it there.
    ///
    /// [`BLOCK_SIZE`]: crate::BLOCK_SIZE
    pub unsafe fn fixed_region_over(memory: NonNull<u8>, bytes: usize, owns_memory: bool) -> Self {
        Self {
            strategy: Strategy::FixedRegion(Region::from_raw_parts(memory, bytes, owns_memory)),
            fallback: None,
        }
    }

    /// A fixed-region handle over a fresh host-heap buffer of `bytes` bytes
    /// that the handle owns. Panics when the host heap refuses the buffer
    /// or when `bytes` cannot hold even one header.
    pub fn fixed_region(bytes: usize) -> Self {
        let Some(memory) = (unsafe { crate::platform::request(bytes) }) else {
            panic!("failed to allocate a {bytes} byte buffer for a fixed region");
        };

        unsafe { Self::fixed_region_over(memory, bytes, true) }
    }

    /// A growing-region handle that serves payloads up to `region_size`
    /// bytes each and adds a region whenever the existing ones are full.
    /// Larger requests fail locally so a fallback can take them. Panics
    /// when `region_size` cannot hold even a minimal allocation.
    pub fn growing(region_size: usize) -> Self {
        assert!(
            region_size >= HEADER_SIZE + BLOCK_SIZE,
            "region size of {region_size} bytes cannot hold a minimal allocation"
        );

        Self {
            strategy: Strategy::GrowingRegion(Arena::new(region_size)),
            fallback: None,
        }
    }

    /// Chains `fallback` behind this handle, consuming both. The handle owns
    /// its fallback and destroys it first on teardown.
    pub fn with_fallback(mut self, fallback: Allocator) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Allocates `size` bytes, walking the fallback chain until some handle
    /// has room. Returns `None` for `size == 0` and when the whole chain is
    /// exhausted. The returned pointer is aligned to [`BLOCK_SIZE`] and
    /// stays valid until freed, resized, or the owning handle is destroyed.
    ///
    /// [`BLOCK_SIZE`]: crate::BLOCK_SIZE
    pub fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        let local = unsafe {
            match &mut self.strategy {
                Strategy::System => SystemDirect::make(size),
                Strategy::TrackedSystem(tracked) => tracked.make(size),
                Strategy::FixedRegion(region) => region.make(size),
                Strategy::GrowingRegion(arena) => arena.make(size),
            }
        };

        if let Some(allocation) = local {
            return Some(unsafe { AllocationHeader::user_pointer_of(allocation) });
        }

        let fallback = self.fallback.as_deref_mut()?;
        debug!("request for {size} bytes spills into the fallback");
        fallback.allocate(size)
    }

    /// Allocates room for `count` elements of `size` bytes each and zeroes
    /// it. Returns `None` under the same conditions as
    /// [`allocate`](Allocator::allocate), and when `count * size` overflows.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let total = count.checked_mul(size)?;
        let address = self.allocate(total)?;
        unsafe { address.as_ptr().write_bytes(0, total) };
        Some(address)
    }

    /// Allocates `size` bytes and fills them from `source`. A `None` source
    /// or a zero size yields `None`.
    ///
    /// # Safety
    ///
    /// `source`, when present, must be valid for reads of `size` bytes.
    pub unsafe fn copy_from(&mut self, source: Pointer<u8>, size: usize) -> Pointer<u8> {
        let source = source?;
        if size == 0 {
            return None;
        }

        let address = self.allocate(size)?;
        ptr::copy_nonoverlapping(source.as_ptr(), address.as_ptr(), size);
        Some(address)
    }

    /// Resizes the allocation at `address` to `size` bytes, preserving the
    /// lesser of the old and new payload. The pointer may move; the
    /// original is only invalidated on success.
    ///
    /// The owning handle tries first, in place where it can. When it cannot,
    /// the payload migrates to a fresh allocation served by the whole chain
    /// starting at this handle, so a block may change strategies over its
    /// lifetime.
    ///
    /// A `None` address behaves as [`allocate`](Allocator::allocate); a zero
    /// size behaves as [`free`](Allocator::free) and returns `None`.
    ///
    /// # Safety
    ///
    /// `address`, when present, must have been produced by a handle in this
    /// chain and still be live. Panics when it was not.
    pub unsafe fn reallocate(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        if size == 0 {
            self.free(address);
            return None;
        }
        let Some(address) = address else {
            return self.allocate(size);
        };

        let header = AllocationHeader::from_user_pointer(address);

        let resized = match self.owner_of(header) {
            Some(owner) => owner.resize_owned(header, size),
            None => panic!("reallocating a pointer that no allocator in the chain owns"),
        };

        if let Some(allocation) = resized {
            return Some(AllocationHeader::user_pointer_of(allocation));
        }

        // The owning strategy is out of room; take the payload to a fresh
        // allocation served by the whole chain.
        let moved = self.allocate(size)?;
        debug!("reallocation to {size} bytes migrates across strategies");

        let payload_bytes = (*header.as_ptr()).block_count as usize * BLOCK_SIZE;
        ptr::copy_nonoverlapping(
            AllocationHeader::user_pointer_of(header).as_ptr(),
            moved.as_ptr(),
            cmp::min(payload_bytes, size),
        );

        match self.owner_of(header) {
            Some(owner) => owner.free_owned(header),
            None => unreachable!("the owning allocator vanished mid-reallocation"),
        }

        Some(moved)
    }

    /// Releases the allocation at `address`. A `None` address is a no-op.
    ///
    /// # Safety
    ///
    /// `address`, when present, must have been produced by a handle in this
    /// chain and still be live; it must not be used afterwards. Panics when
    /// no handle in the chain owns it.
    pub unsafe fn free(&mut self, address: Pointer<u8>) {
        let Some(address) = address else { return };

        let header = AllocationHeader::from_user_pointer(address);
        match self.owner_of(header) {
            Some(owner) => owner.free_owned(header),
            None => panic!("freeing a pointer that no allocator in the chain owns"),
        }
    }

    /// Tears the whole chain down, fallback first: a tracked-system handle
    /// releases every block on its ledger, region handles return their
    /// buffers (when owned) to the host heap. The handle survives
    /// structurally and a growing handle may even allocate again; a
    /// destroyed fixed region refuses everything.
    ///
    /// # Panics
    ///
    /// Panics when the chain contains a [system](Allocator::system) handle:
    /// the passthrough owns nothing and destroying it is always a bug in
    /// the caller.
    pub fn destroy(&mut self) {
        if let Some(fallback) = self.fallback.as_deref_mut() {
            fallback.destroy();
        }

        match &mut self.strategy {
            Strategy::System => panic!("the system allocator cannot be destroyed"),
            Strategy::TrackedSystem(tracked) => tracked.release_all(),
            Strategy::FixedRegion(region) => region.release(),
            Strategy::GrowingRegion(arena) => arena.release_all(),
        }
    }

    /// Whether this handle, ignoring its fallback, owns the allocation.
    unsafe fn owns(&self, header: NonNull<AllocationHeader>) -> bool {
        match &self.strategy {
            Strategy::System => SystemDirect::owns(header),
            Strategy::TrackedSystem(tracked) => tracked.owns(header),
            Strategy::FixedRegion(region) => region.contains(header),
            Strategy::GrowingRegion(arena) => arena.owns(header),
        }
    }

    /// First handle along the chain that owns the allocation.
    unsafe fn owner_of(&mut self, header: NonNull<AllocationHeader>) -> Option<&mut Allocator> {
        if self.owns(header) {
            Some(self)
        } else {
            self.fallback.as_deref_mut()?.owner_of(header)
        }
    }

    /// Releases an allocation this handle is already known to own.
    unsafe fn free_owned(&mut self, header: NonNull<AllocationHeader>) {
        match &mut self.strategy {
            Strategy::System => SystemDirect::free(header),
            Strategy::TrackedSystem(tracked) => tracked.free(header),
            Strategy::FixedRegion(region) => region.free(header),
            Strategy::GrowingRegion(arena) => arena.free(header),
        }
    }

    /// Strategy-local resize. `None` means the strategy cannot hold the new
    /// size and the caller should migrate the payload.
    unsafe fn resize_owned(
        &mut self,
        header: NonNull<AllocationHeader>,
        size: usize,
    ) -> Pointer<AllocationHeader> {
        match &mut self.strategy {
            Strategy::System => SystemDirect::resize(header, size),
            Strategy::TrackedSystem(tracked) => tracked.resize(header, size),
            Strategy::FixedRegion(region) => region.reallocate(header, size),
            Strategy::GrowingRegion(arena) => arena.reallocate(header, size),
        }
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        match &self.strategy {
            Strategy::TrackedSystem(tracked) => tracked.tracked_count(),
            _ => 0,
        }
    }
}

/// The system passthrough, mirroring the convention that no allocator at
/// all means "just use the host heap".
impl Default for Allocator {
    fn default() -> Self {
        Self::system()
    }
}

/// Declares `$name` as a fixed-region handle over a fresh `$capacity` byte
/// buffer on the current stack frame.
///
/// ```
/// use challoc::stack_allocator;
///
/// stack_allocator!(scratch, 450);
///
/// let first = scratch.allocate(100);
/// assert!(first.is_some());
/// ```
///
/// The buffer lives in the enclosing scope, declared before the handle so
/// it is dropped after it. Moving the handle out of that scope would leave
/// it pointing at a dead frame; keep it where it was declared.
#[macro_export]
macro_rules! stack_allocator {
    ($name:ident, $capacity:expr) => {
        let mut buffer = [0 as $crate::Block; ($capacity) / ::core::mem::size_of::<$crate::Block>()];
        #[allow(unused_mut)]
        let mut $name = unsafe {
            $crate::Allocator::fixed_region_over(
                ::core::ptr::NonNull::new_unchecked(buffer.as_mut_ptr().cast::<u8>()),
                $capacity,
                false,
            )
        };
    };
}

/// Like [`stack_allocator!`], with a tracked-system fallback taking the
/// overflow, so allocations never fail and teardown still releases every
/// spilled block.
///
/// ```
/// use challoc::stack_allocator_plus;
///
/// stack_allocator_plus!(scratch, 500);
///
/// for _ in 0..20 {
///     assert!(scratch.allocate(120).is_some());
/// }
/// scratch.destroy();
/// ```
#[macro_export]
macro_rules! stack_allocator_plus {
    ($name:ident, $capacity:expr) => {
        $crate::stack_allocator!($name, $capacity);
        #[allow(unused_mut)]
        let mut $name = $name.with_fallback($crate::Allocator::tracked_system());
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_requests_yield_nothing() {
        let mut system = Allocator::system();

        assert!(system.allocate(0).is_none());
        assert!(system.allocate_zeroed(0, 8).is_none());
        assert!(system.allocate_zeroed(8, 0).is_none());
        unsafe {
            assert!(system.copy_from(None, 16).is_none());
            let source = system.allocate(16).unwrap();
            assert!(system.copy_from(Some(source), 0).is_none());
            system.free(Some(source));
        }
    }

    #[test]
    fn zeroed_allocation_overflow_yields_nothing() {
        let mut system = Allocator::system();
        assert!(system.allocate_zeroed(usize::MAX, 2).is_none());
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let mut system = Allocator::system();
        unsafe { system.free(None) };
    }

    #[test]
    fn reallocate_follows_the_malloc_and_free_laws() {
        let mut arena = Allocator::growing(4096);

        unsafe {
            // A null address allocates.
            let allocation = arena.reallocate(None, 100).unwrap();

            // A zero size frees and yields nothing.
            assert!(arena.reallocate(Some(allocation), 0).is_none());

            // The pair left no trace behind.
            let again = arena.allocate(100).unwrap();
            assert_eq!(again, allocation);
        }

        arena.destroy();
    }

    #[test]
    fn allocate_zeroed_really_zeroes() {
        let mut arena = Allocator::growing(4096);

        unsafe {
            // Dirty a block, free it, then ask for zeroed memory over the
            // same bytes.
            let dirty = arena.allocate(256).unwrap();
            dirty.as_ptr().write_bytes(0xFF, 256);
            arena.free(Some(dirty));

            let zeroed = arena.allocate_zeroed(32, 8).unwrap();
            for offset in 0..256 {
                assert_eq!(*zeroed.as_ptr().add(offset), 0);
            }
        }

        arena.destroy();
    }

    #[test]
    fn copy_duplicates_the_source_bytes() {
        let mut arena = Allocator::growing(4096);

        unsafe {
            let source = arena.allocate(64).unwrap();
            for offset in 0..64 {
                *source.as_ptr().add(offset) = offset as u8;
            }

            let copy = arena.copy_from(Some(source), 64).unwrap();
            assert_ne!(copy, source);
            for offset in 0..64 {
                assert_eq!(*copy.as_ptr().add(offset), offset as u8);
            }
        }

        arena.destroy();
    }

    #[test]
    fn bounded_stack_region_fails_cleanly_when_full() {
        stack_allocator!(scratch, 450);

        for _ in 0..3 {
            assert!(scratch.allocate(100).is_some());
        }
        assert!(scratch.allocate(100).is_none());
    }

    #[test]
    fn full_region_spills_into_the_fallback() {
        stack_allocator_plus!(scratch, 500);

        let pointers: Vec<_> = (0..20)
            .map(|_| scratch.allocate(120).expect("the fallback never fills up"))
            .collect();

        unsafe {
            for (index, pointer) in pointers.iter().enumerate() {
                pointer.as_ptr().write_bytes(index as u8, 120);
            }
            for (index, pointer) in pointers.iter().enumerate() {
                assert_eq!(*pointer.as_ptr(), index as u8);
            }
        }

        // 500 bytes serve three 120 byte blocks; the other 17 spilled.
        assert_eq!(scratch.fallback.as_ref().unwrap().tracked_count(), 17);

        // Destroying the chain releases the region and every spilled block.
        scratch.destroy();
        assert_eq!(scratch.fallback.as_ref().unwrap().tracked_count(), 0);
    }

    #[test]
    fn operations_are_routed_to_the_owning_handle() {
        let mut chain = Allocator::fixed_region(1200).with_fallback(Allocator::tracked_system());

        unsafe {
            let pointers: Vec<_> = (0..10)
                .map(|index| {
                    let pointer = chain.allocate(1000).unwrap();
                    pointer.as_ptr().write_bytes(index as u8, 1000);
                    pointer
                })
                .collect();

            // One 1000 byte block fits the region; the rest live on the
            // fallback's ledger.
            assert_eq!(chain.fallback.as_ref().unwrap().tracked_count(), 9);

            // Shrinking a spilled block goes through the fallback's heap
            // path and keeps the bytes.
            let shrunk = chain.reallocate(Some(pointers[5]), 100).unwrap();
            for offset in 0..100 {
                assert_eq!(*shrunk.as_ptr().add(offset), 5);
            }
            assert_eq!(chain.fallback.as_ref().unwrap().tracked_count(), 9);

            // Frees reach whichever handle owns the block.
            chain.free(Some(pointers[0]));
            chain.free(Some(shrunk));
            assert_eq!(chain.fallback.as_ref().unwrap().tracked_count(), 8);

            for pointer in &pointers[1..5] {
                chain.free(Some(*pointer));
            }
            for pointer in &pointers[6..] {
                chain.free(Some(*pointer));
            }
            assert_eq!(chain.fallback.as_ref().unwrap().tracked_count(), 0);
        }

        chain.destroy();
    }

    #[test]
    fn migration_crosses_from_the_region_to_the_fallback() {
        let mut chain = Allocator::fixed_region(450).with_fallback(Allocator::tracked_system());

        unsafe {
            let small = chain.allocate(100).unwrap();
            small.as_ptr().write_bytes(0x7E, 100);

            // 500 bytes fit neither in place nor anywhere else in the
            // region, so the payload migrates to the fallback.
            let moved = chain.reallocate(Some(small), 500).unwrap();
            assert_eq!(chain.fallback.as_ref().unwrap().tracked_count(), 1);
            for offset in 0..100 {
                assert_eq!(*moved.as_ptr().add(offset), 0x7E);
            }

            // The region got its blocks back.
            let refill = chain.allocate(100).unwrap();
            assert_eq!(refill, small);
            chain.free(Some(refill));
            chain.free(Some(moved));
        }

        chain.destroy();
    }

    #[test]
    fn system_blocks_resize_through_the_host_heap() {
        let mut system = Allocator::system();

        unsafe {
            let allocation = system.allocate(100).unwrap();
            allocation.as_ptr().write_bytes(0x11, 100);

            let grown = system.reallocate(Some(allocation), 1 << 16).unwrap();
            for offset in 0..100 {
                assert_eq!(*grown.as_ptr().add(offset), 0x11);
            }

            system.free(Some(grown));
        }
    }

    #[test]
    #[should_panic(expected = "no allocator in the chain owns")]
    fn freeing_a_foreign_pointer_panics() {
        let mut owner = Allocator::tracked_system();
        let mut stranger = Allocator::fixed_region(256);

        let pointer = owner.allocate(32);
        unsafe { stranger.free(pointer) };
    }

    #[test]
    #[should_panic(expected = "system allocator cannot be destroyed")]
    fn destroying_the_system_handle_panics() {
        Allocator::system().destroy();
    }

    #[test]
    #[should_panic(expected = "cannot hold a minimal allocation")]
    fn growing_handle_rejects_a_useless_region_size() {
        Allocator::growing(HEADER_SIZE);
    }
}
