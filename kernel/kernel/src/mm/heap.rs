//! Global kernel heap.
//!
//! The heap region is mapped by the VMM out of PMM frames, then handed to
//! the intrusive allocator. On bare metal the same allocator backs `alloc`
//! as the global allocator; host tests use the host's.

use core::ptr::NonNull;

use alos_mm::heap::KernelHeap;

#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: KernelHeap = KernelHeap::new();

/// Maps the initial heap region and initializes the allocator over it.
///
/// # Panics
///
/// Panics if the VMM or PMM are not initialized yet.
pub fn init() {
    let (base, size) = super::vmm::map_initial_heap();
    // SAFETY: The region was just mapped writable and is unused.
    unsafe { HEAP.init(base, size) };
}

/// Allocates `n` bytes from the kernel heap.
pub fn kmalloc(n: usize) -> Option<NonNull<u8>> {
    HEAP.kmalloc(n)
}

/// Frees an allocation returned by [`kmalloc`].
///
/// # Safety
///
/// `ptr` must not be used after this call.
pub unsafe fn kfree(ptr: *mut u8) {
    // SAFETY: Forwarded contract.
    unsafe { HEAP.kfree(ptr) };
}

/// Resizes an allocation returned by [`kmalloc`].
///
/// # Safety
///
/// `ptr` must be null or a live allocation from this heap, and must not be
/// used after this call.
pub unsafe fn krealloc(ptr: *mut u8, n: usize) -> Option<NonNull<u8>> {
    // SAFETY: Forwarded contract.
    unsafe { HEAP.krealloc(ptr, n) }
}

/// Payload bytes currently allocated.
pub fn used_bytes() -> usize {
    HEAP.used_bytes()
}

/// Payload bytes currently free.
pub fn free_bytes() -> usize {
    HEAP.free_bytes()
}
