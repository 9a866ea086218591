//! The one place where the crate talks to the host heap. Every strategy
//! that needs raw bytes from the operating system, and every region backing
//! buffer, goes through these three calls, so swapping the underlying heap
//! means touching exactly this file.

use std::ptr::NonNull;

use crate::Pointer;

/// Asks the host heap for `size` bytes. Returns `None` when the heap is
/// exhausted. The returned pointer is aligned for any scalar type, which
/// the C allocation functions guarantee.
pub(crate) unsafe fn request(size: usize) -> Pointer<u8> {
    NonNull::new(libc::malloc(size).cast())
}

/// Asks the host heap to resize the allocation at `address` to `new_size`
/// bytes, moving it if necessary. On `None` the original allocation is
/// untouched and still valid.
///
/// # Safety
///
/// `address` must have come from [`request`] or a previous [`resize`] and
/// must not have been released.
pub(crate) unsafe fn resize(address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
    NonNull::new(libc::realloc(address.as_ptr().cast(), new_size).cast())
}

/// Returns an allocation to the host heap.
///
/// # Safety
///
/// Same contract as [`resize`], and `address` must not be used afterwards.
pub(crate) unsafe fn release(address: NonNull<u8>) {
    libc::free(address.as_ptr().cast());
}
