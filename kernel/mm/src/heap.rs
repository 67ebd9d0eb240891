//! Intrusive kernel heap allocator.
//!
//! The heap is one contiguous region carved out of PMM frames. Every block
//! -- allocated or free -- carries a [`BlockHeader`] (size, free flag, next)
//! immediately followed by its payload, forming a single forward chain from
//! the first block to null. Allocation is a first-fit scan that splits large
//! free blocks; freeing coalesces so that no two adjacent blocks are ever
//! both free.
//!
//! Payload sizes are rounded up to the 16-byte allocation granule (minimum
//! 16 bytes), which keeps every payload 16-aligned and lets the same heap
//! serve as the kernel's `GlobalAlloc`.
//!
//! A single spinlock guards every public operation; nothing is called back
//! while it is held.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use alos_core::sync::SpinLock;

/// Allocation granule: payload sizes and block addresses are multiples of
/// this, so payloads satisfy any alignment up to 16.
pub const ALLOC_ALIGN: usize = 16;

/// Smallest payload handed out.
const MIN_PAYLOAD: usize = 16;

/// Size of the per-block header.
const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// A free block must be able to hold a header plus the minimum payload to
/// be worth splitting off.
const SPLIT_THRESHOLD: usize = HEADER_SIZE + MIN_PAYLOAD;

/// Per-block header. Lives directly before the payload it describes.
#[repr(C)]
struct BlockHeader {
    /// Payload size in bytes (multiple of [`ALLOC_ALIGN`]).
    size: u32,
    /// 1 if the block is free, 0 if allocated.
    free: u32,
    /// Next block in the chain (address order), or null.
    next: *mut BlockHeader,
}

impl BlockHeader {
    #[inline]
    unsafe fn payload(block: *mut BlockHeader) -> *mut u8 {
        unsafe { (block as *mut u8).add(HEADER_SIZE) }
    }
}

struct HeapInner {
    /// First block of the chain, or null before `init`.
    head: *mut BlockHeader,
    /// Start of the managed region.
    start: usize,
    /// One past the end of the managed region.
    end: usize,
    /// Payload bytes currently handed out.
    used: usize,
}

// SAFETY: The inner state is only accessed under the SpinLock.
unsafe impl Send for HeapInner {}

impl HeapInner {
    #[inline]
    fn round_size(n: usize) -> usize {
        n.max(MIN_PAYLOAD).next_multiple_of(ALLOC_ALIGN)
    }

    unsafe fn alloc(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n == 0 || self.head.is_null() {
            return None;
        }
        let size = Self::round_size(n);

        let mut block = self.head;
        while !block.is_null() {
            // SAFETY: Every pointer in the chain points at a header inside
            // the heap region.
            let hdr = unsafe { &mut *block };
            if hdr.free == 1 && hdr.size as usize >= size {
                if hdr.size as usize - size >= SPLIT_THRESHOLD {
                    // Split: write a new free header right after the
                    // allocated payload.
                    let rest = (hdr.size as usize - size - HEADER_SIZE) as u32;
                    // SAFETY: The split point lies inside the old block, so
                    // the new header and its payload stay in bounds.
                    let split = unsafe { BlockHeader::payload(block).add(size) } as *mut BlockHeader;
                    unsafe {
                        (*split).size = rest;
                        (*split).free = 1;
                        (*split).next = hdr.next;
                    }
                    hdr.size = size as u32;
                    hdr.next = split;
                }
                hdr.free = 0;
                self.used += hdr.size as usize;
                // SAFETY: payload of a live block is non-null.
                return Some(unsafe { NonNull::new_unchecked(BlockHeader::payload(block)) });
            }
            block = hdr.next;
        }

        None
    }

    unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr as usize;
        // A valid payload lies strictly inside the region, one header past
        // its block start. Anything else is a stray pointer and is ignored.
        if addr < self.start + HEADER_SIZE || addr >= self.end {
            return;
        }

        let block = (addr - HEADER_SIZE) as *mut BlockHeader;
        // SAFETY: Bounds were checked above; the header precedes the payload.
        let hdr = unsafe { &mut *block };
        if hdr.free == 1 {
            // Stray or double free.
            return;
        }
        hdr.free = 1;
        self.used -= hdr.size as usize;

        // Coalesce forward from the freed block, then re-sweep from the
        // head: the chain is singly linked, so merging a freed block into a
        // free predecessor needs the second pass.
        unsafe {
            Self::absorb_following(block);
            let mut cur = self.head;
            while !cur.is_null() {
                Self::absorb_following(cur);
                cur = (*cur).next;
            }
        }
    }

    /// Merges every directly following free block into `block` while both
    /// are free. Blocks are laid out end-to-end, so chain order is address
    /// order and absorption is pure header arithmetic.
    unsafe fn absorb_following(block: *mut BlockHeader) {
        // SAFETY: Caller guarantees `block` is a live header in the chain.
        unsafe {
            while (*block).free == 1 {
                let next = (*block).next;
                if next.is_null() || (*next).free == 0 {
                    break;
                }
                (*block).size += HEADER_SIZE as u32 + (*next).size;
                (*block).next = (*next).next;
            }
        }
    }

    fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut block = self.head;
        while !block.is_null() {
            // SAFETY: Chain pointers are valid headers.
            let hdr = unsafe { &*block };
            if hdr.free == 1 {
                total += hdr.size as usize;
            }
            block = hdr.next;
        }
        total
    }

    fn is_consistent(&self) -> bool {
        let mut block = self.head;
        let mut prev_free = false;
        while !block.is_null() {
            let addr = block as usize;
            if addr < self.start || addr + HEADER_SIZE > self.end {
                return false;
            }
            // SAFETY: Bounds just checked.
            let hdr = unsafe { &*block };
            let payload_end = addr + HEADER_SIZE + hdr.size as usize;
            if payload_end > self.end {
                return false;
            }
            let free = hdr.free == 1;
            if free && prev_free {
                // Two adjacent free blocks missed coalescing.
                return false;
            }
            prev_free = free;
            block = hdr.next;
        }
        true
    }
}

/// The kernel heap.
///
/// Const-constructable so it can be a `static`; unusable until
/// [`init`](Self::init) hands it a region.
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
}

// SAFETY: Protected by the SpinLock.
unsafe impl Send for KernelHeap {}
unsafe impl Sync for KernelHeap {}

impl KernelHeap {
    /// Creates a new, uninitialized heap.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                head: ptr::null_mut(),
                start: 0,
                end: 0,
                used: 0,
            }),
        }
    }

    /// Initializes the heap over `[base, base + size)`.
    ///
    /// Writes a single free block spanning the whole region.
    ///
    /// # Safety
    ///
    /// - The region must be mapped, writable, and unused.
    /// - Must be called exactly once, before any allocation.
    pub unsafe fn init(&self, base: usize, size: usize) {
        let start = base.next_multiple_of(ALLOC_ALIGN);
        let end = (base + size) & !(ALLOC_ALIGN - 1);
        debug_assert!(
            end > start && end - start >= SPLIT_THRESHOLD,
            "heap region too small"
        );
        debug_assert!(end - start - HEADER_SIZE <= u32::MAX as usize);

        let mut inner = self.inner.lock();
        debug_assert!(inner.head.is_null(), "heap already initialized");

        let block = start as *mut BlockHeader;
        // SAFETY: The caller guarantees the region is mapped and unused.
        unsafe {
            (*block).size = (end - start - HEADER_SIZE) as u32;
            (*block).free = 1;
            (*block).next = ptr::null_mut();
        }
        inner.head = block;
        inner.start = start;
        inner.end = end;
    }

    /// Allocates `n` bytes, rounded up to the 16-byte granule.
    ///
    /// Returns `None` for `n == 0` or when no free block fits.
    pub fn kmalloc(&self, n: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        // SAFETY: The inner chain is only mutated under the lock.
        unsafe { inner.alloc(n) }
    }

    /// Frees an allocation returned by [`kmalloc`](Self::kmalloc).
    ///
    /// A null pointer or a pointer outside the heap bounds is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call.
    pub unsafe fn kfree(&self, ptr: *mut u8) {
        let mut inner = self.inner.lock();
        // SAFETY: The inner chain is only mutated under the lock.
        unsafe { inner.free(ptr) };
    }

    /// Resizes an allocation.
    ///
    /// `ptr == null` behaves like [`kmalloc`](Self::kmalloc); `n == 0` frees
    /// and returns `None`. Otherwise the data is copied into a fresh block
    /// and the old one is released.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this heap, and must not
    /// be used after this call.
    pub unsafe fn krealloc(&self, ptr: *mut u8, n: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.kmalloc(n);
        }
        if n == 0 {
            // SAFETY: Caller guarantees `ptr` is live.
            unsafe { self.kfree(ptr) };
            return None;
        }

        let old_size = {
            let inner = self.inner.lock();
            let addr = ptr as usize;
            if addr < inner.start + HEADER_SIZE || addr >= inner.end {
                return None;
            }
            // SAFETY: Bounds checked; the header precedes the payload.
            unsafe { (*((addr - HEADER_SIZE) as *mut BlockHeader)).size as usize }
        };

        let new = self.kmalloc(n)?;
        // SAFETY: Both payloads are live and at least `min(old_size, n)`
        // bytes long; the blocks are distinct.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new.as_ptr(), old_size.min(n));
            self.kfree(ptr);
        }
        Some(new)
    }

    /// Payload bytes currently allocated.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used
    }

    /// Payload bytes currently on the free list.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free_bytes()
    }

    /// Verifies chain integrity: every block in bounds and no two adjacent
    /// free blocks. The kernel treats a failure as fatal.
    pub fn validate(&self) -> bool {
        self.inner.lock().is_consistent()
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: kmalloc returns 16-aligned payloads of at least the requested
// size; kfree accepts exactly those pointers.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALLOC_ALIGN {
            return ptr::null_mut();
        }
        match self.kmalloc(layout.size().max(1)) {
            Some(p) => p.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `ptr` came from `alloc` above.
        unsafe { self.kfree(ptr) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn with_test_heap<F: FnOnce(&KernelHeap)>(size: usize, f: F) {
        let layout = Layout::from_size_align(size, ALLOC_ALIGN).unwrap();
        // SAFETY: layout is valid, non-zero size.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let heap = KernelHeap::new();
        unsafe { heap.init(buf as usize, size) };
        f(&heap);
        unsafe { std::alloc::dealloc(buf, layout) };
    }

    #[test]
    fn kmalloc_zero_returns_none() {
        with_test_heap(4096, |heap| {
            assert!(heap.kmalloc(0).is_none());
        });
    }

    #[test]
    fn kmalloc_one_rounds_to_sixteen() {
        with_test_heap(4096, |heap| {
            let p = heap.kmalloc(1).unwrap();
            assert_eq!(heap.used_bytes(), 16);
            assert_eq!(p.as_ptr() as usize % ALLOC_ALIGN, 0);
            unsafe { heap.kfree(p.as_ptr()) };
            assert_eq!(heap.used_bytes(), 0);
        });
    }

    #[test]
    fn kmalloc_rounds_to_granule() {
        with_test_heap(4096, |heap| {
            let p = heap.kmalloc(17).unwrap();
            assert_eq!(heap.used_bytes(), 32);
            unsafe { heap.kfree(p.as_ptr()) };
        });
    }

    #[test]
    fn exhaustion_returns_none() {
        with_test_heap(256, |heap| {
            let mut ptrs = Vec::new();
            while let Some(p) = heap.kmalloc(32) {
                ptrs.push(p);
            }
            assert!(!ptrs.is_empty());
            assert!(heap.kmalloc(32).is_none());
            for p in ptrs {
                unsafe { heap.kfree(p.as_ptr()) };
            }
            assert!(heap.validate());
        });
    }

    #[test]
    fn split_leaves_usable_remainder() {
        with_test_heap(4096, |heap| {
            let a = heap.kmalloc(64).unwrap();
            let b = heap.kmalloc(256).unwrap();
            assert!(heap.validate());
            // b starts right after a's payload + header.
            assert_eq!(
                b.as_ptr() as usize,
                a.as_ptr() as usize + 64 + HEADER_SIZE
            );
            unsafe {
                heap.kfree(a.as_ptr());
                heap.kfree(b.as_ptr());
            }
        });
    }

    #[test]
    fn coalescing_restores_full_block() {
        with_test_heap(4096, |heap| {
            let a = heap.kmalloc(64).unwrap();
            let b = heap.kmalloc(64).unwrap();
            let c = heap.kmalloc(64).unwrap();

            // Free middle, then first, then last: every order of adjacency.
            unsafe {
                heap.kfree(b.as_ptr());
                assert!(heap.validate());
                heap.kfree(a.as_ptr());
                assert!(heap.validate());
                heap.kfree(c.as_ptr());
                assert!(heap.validate());
            }

            // Everything coalesced back into one block: a large allocation
            // fits again.
            let big = heap.kmalloc(3500).unwrap();
            unsafe { heap.kfree(big.as_ptr()) };
        });
    }

    #[test]
    fn no_adjacent_free_blocks_invariant() {
        with_test_heap(8192, |heap| {
            let ptrs: Vec<_> = (0..16).map(|_| heap.kmalloc(64).unwrap()).collect();
            // Free every other block, then the rest.
            for p in ptrs.iter().step_by(2) {
                unsafe { heap.kfree(p.as_ptr()) };
                assert!(heap.validate());
            }
            for p in ptrs.iter().skip(1).step_by(2) {
                unsafe { heap.kfree(p.as_ptr()) };
                assert!(heap.validate());
            }
            assert_eq!(heap.used_bytes(), 0);
        });
    }

    #[test]
    fn first_fit_reuses_freed_block() {
        with_test_heap(4096, |heap| {
            let a = heap.kmalloc(64).unwrap();
            let _b = heap.kmalloc(64).unwrap();
            unsafe { heap.kfree(a.as_ptr()) };

            let c = heap.kmalloc(64).unwrap();
            assert_eq!(c.as_ptr(), a.as_ptr());
        });
    }

    #[test]
    fn free_null_and_out_of_bounds_ignored() {
        with_test_heap(4096, |heap| {
            unsafe {
                heap.kfree(ptr::null_mut());
                heap.kfree(0xDEAD_0000 as *mut u8);
            }
            assert!(heap.validate());
        });
    }

    #[test]
    fn double_free_ignored() {
        with_test_heap(4096, |heap| {
            let a = heap.kmalloc(64).unwrap();
            unsafe {
                heap.kfree(a.as_ptr());
                heap.kfree(a.as_ptr());
            }
            assert!(heap.validate());
            assert_eq!(heap.used_bytes(), 0);
        });
    }

    #[test]
    fn krealloc_preserves_contents() {
        with_test_heap(4096, |heap| {
            let p = heap.kmalloc(16).unwrap();
            unsafe {
                p.as_ptr().copy_from_nonoverlapping(b"ALOSALOSALOSALOS".as_ptr(), 16);
                let q = heap.krealloc(p.as_ptr(), 64).unwrap();
                let mut buf = [0u8; 16];
                buf.as_mut_ptr().copy_from_nonoverlapping(q.as_ptr(), 16);
                assert_eq!(&buf, b"ALOSALOSALOSALOS");
                heap.kfree(q.as_ptr());
            }
        });
    }

    #[test]
    fn krealloc_zero_frees() {
        with_test_heap(4096, |heap| {
            let p = heap.kmalloc(64).unwrap();
            assert!(unsafe { heap.krealloc(p.as_ptr(), 0) }.is_none());
            assert_eq!(heap.used_bytes(), 0);
        });
    }

    #[test]
    fn krealloc_null_allocates() {
        with_test_heap(4096, |heap| {
            let p = unsafe { heap.krealloc(ptr::null_mut(), 32) }.unwrap();
            assert_eq!(heap.used_bytes(), 32);
            unsafe { heap.kfree(p.as_ptr()) };
        });
    }

    #[test]
    fn global_alloc_interface() {
        with_test_heap(4096, |heap| {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let p = unsafe { GlobalAlloc::alloc(heap, layout) };
            assert!(!p.is_null());
            assert_eq!(p as usize % 8, 0);
            unsafe { GlobalAlloc::dealloc(heap, p, layout) };

            // Alignments beyond the granule are refused.
            let huge_align = Layout::from_size_align(64, 64).unwrap();
            assert!(unsafe { GlobalAlloc::alloc(heap, huge_align) }.is_null());
        });
    }

    #[test]
    fn used_plus_free_accounts_for_region() {
        with_test_heap(4096, |heap| {
            let total_before = heap.free_bytes();
            let p = heap.kmalloc(100).unwrap();
            // 100 rounds to 112; the split consumed one extra header.
            assert_eq!(heap.used_bytes(), 112);
            assert_eq!(heap.free_bytes(), total_before - 112 - HEADER_SIZE);
            unsafe { heap.kfree(p.as_ptr()) };
            assert_eq!(heap.free_bytes(), total_before);
        });
    }
}
