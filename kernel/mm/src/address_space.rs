//! User address space management.
//!
//! Each process owns an [`AddressSpace`] holding a private PML4. The kernel
//! upper half (entries 256..512) is copied from the kernel root by
//! reference, so all address spaces observe the same kernel mappings; the
//! user lower half is private. Cloning an address space reinstalls every
//! present user leaf against the *same* physical frames (shared-mapping
//! fork; copy-on-write is out of scope).

use alos_core::addr::{PhysAddr, VirtAddr};
use alos_core::paging::{Page, PhysFrame, Size4KiB};

use crate::mapper::{MapFlags, MapFlush, PageMapper, PageTranslator, UnmapError};
use crate::page_table::PageTableMapper;
use crate::{FrameAllocator, VmmError};

/// Callback for deallocating a single physical frame.
///
/// Stored at construction time so that `Drop` can free the PML4 frame
/// without needing access to a frame deallocator parameter.
pub type FrameDeallocFn = fn(PhysFrame<Size4KiB>);

/// A user-mode address space backed by its own PML4.
///
/// On drop, the PML4 frame is freed via the stored deallocation callback.
/// Interior tables of the user half are not tracked individually and are
/// reclaimed with the process's frames by the owner of the address space.
pub struct AddressSpace {
    /// Physical address of this address space's PML4 frame.
    root_phys: PhysAddr,
    /// Page table walker (knows the HHDM offset).
    mapper: PageTableMapper,
    /// Callback to free the root frame on drop.
    dealloc_fn: FrameDeallocFn,
}

impl AddressSpace {
    /// Creates a new user address space.
    ///
    /// Allocates a fresh PML4 frame, zeroes the user half and copies the
    /// kernel upper half (entries 256..512) from `kernel_root`.
    ///
    /// `dealloc_fn` is stored and called in `Drop` to free the PML4 frame.
    ///
    /// # Safety
    ///
    /// `kernel_root` must point to the valid PML4 used by the kernel, and
    /// `mapper` must carry the correct HHDM offset.
    pub unsafe fn new_user(
        kernel_root: PhysAddr,
        mapper: PageTableMapper,
        alloc: &mut impl FrameAllocator<Size4KiB>,
        dealloc_fn: FrameDeallocFn,
    ) -> Result<Self, VmmError> {
        let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
        let root_phys = frame.start_address();

        // SAFETY: The frame is accessible via the HHDM; zeroing it clears
        // the user half, and the kernel half is copied entry-by-entry.
        unsafe {
            let root = (mapper.hhdm_offset() + root_phys.as_u64()) as *mut u8;
            core::ptr::write_bytes(root, 0, crate::PAGE_SIZE);
            mapper.copy_kernel_half(kernel_root, root_phys);
        }

        Ok(Self {
            root_phys,
            mapper,
            dealloc_fn,
        })
    }

    /// Clones this address space.
    ///
    /// The new space gets its own PML4 and private interior tables; every
    /// present user-half leaf is reinstalled referencing the same physical
    /// frame with the same attributes. The kernel half stays shared.
    pub fn clone_space(
        &self,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<Self, VmmError> {
        // SAFETY: `self.root_phys` is a valid PML4 by construction.
        let clone = unsafe {
            Self::new_user(self.root_phys, self.mapper, alloc, self.dealloc_fn)?
        };
        // SAFETY: Both roots are valid; `alloc` provides table frames.
        unsafe {
            self.mapper
                .clone_user_half(self.root_phys, clone.root_phys, &mut || {
                    alloc
                        .allocate_frame()
                        .expect("PMM: out of memory during address space clone")
                });
        }
        Ok(clone)
    }

    /// Maps a single 4 KiB page into the user half.
    ///
    /// The `USER` flag is always added to `flags`.
    ///
    /// Returns a [`MapFlush`] that the caller must handle.
    pub fn map_user_page(
        &self,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<MapFlush, VmmError> {
        let flags = flags | MapFlags::USER;
        // SAFETY: The AddressSpace owns its PML4. The caller provides a
        // valid physical frame and an allocator for page table pages.
        let flush = unsafe {
            self.mapper
                .map(self.root_phys, page, frame, flags, &mut || {
                    alloc
                        .allocate_frame()
                        .expect("PMM: out of memory during user map")
                })
        };
        Ok(flush)
    }

    /// Unmaps a single 4 KiB page from the user half.
    ///
    /// Flushes the TLB internally and returns the freed frame.
    pub fn unmap_user_page(&self, page: Page<Size4KiB>) -> Result<PhysFrame<Size4KiB>, VmmError> {
        // SAFETY: The AddressSpace owns its PML4.
        let (frame, flush) = unsafe {
            self.mapper.unmap(self.root_phys, page).map_err(|e| match e {
                UnmapError::NotMapped => VmmError::NotMapped,
                UnmapError::SizeMismatch => VmmError::SizeMismatch,
            })?
        };
        flush.flush();
        Ok(frame)
    }

    /// ORs the USER bit into every mapped page of `[start, start + size)`,
    /// leaving unmapped pages alone.
    pub fn make_user_accessible(&self, start: VirtAddr, size: u64) {
        if size == 0 {
            return;
        }
        let end = start + size;
        let first = Page::<Size4KiB>::containing_address(start);
        let last = Page::<Size4KiB>::containing_address(end + (crate::PAGE_SIZE as u64 - 1));
        for page in Page::range(first, last) {
            // SAFETY: The AddressSpace owns its PML4.
            let Some((_, flags)) = (unsafe { self.mapper.query(self.root_phys, page) }) else {
                continue;
            };
            if flags.contains(MapFlags::USER) {
                continue;
            }
            // SAFETY: The page was just observed mapped.
            if let Ok(flush) = unsafe {
                self.mapper
                    .update_flags(self.root_phys, page, flags | MapFlags::USER)
            } {
                flush.flush();
            }
        }
    }

    /// Returns the physical address of this address space's PML4.
    ///
    /// This is the value loaded into CR3 on context switch.
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Translates a virtual address within this address space.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: The AddressSpace owns its PML4; a read-only walk is safe.
        unsafe { <PageTableMapper as PageTranslator>::translate_addr(&self.mapper, self.root_phys, virt) }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let frame = PhysFrame::containing_address(self.root_phys);
        (self.dealloc_fn)(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::tests::TestFrames;

    struct TestAlloc<'a>(&'a mut TestFrames);

    // SAFETY: TestFrames hands out fresh host allocations.
    unsafe impl FrameAllocator<Size4KiB> for TestAlloc<'_> {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            Some(self.0.alloc())
        }
    }

    fn noop_dealloc(_frame: PhysFrame<Size4KiB>) {}

    #[test]
    fn new_user_shares_kernel_half() {
        let mut frames = TestFrames::new();
        let mapper = PageTableMapper::new(0);
        let kernel_root = frames.alloc().start_address();
        let kframe = frames.alloc();

        let kvirt = VirtAddr::new(0xFFFF_8000_0010_0000);
        unsafe {
            mapper.map_4k(
                kernel_root,
                kvirt,
                kframe.start_address(),
                alos_core::arch::x86_64::paging::PageTableFlags::WRITABLE,
                &mut frames.alloc_fn(),
            );
        }

        let space = unsafe {
            AddressSpace::new_user(kernel_root, mapper, &mut TestAlloc(&mut frames), noop_dealloc)
        }
        .unwrap();

        // Kernel mapping visible through the user root.
        assert_eq!(
            space.translate(kvirt).unwrap(),
            kframe.start_address()
        );
        // User half starts empty.
        assert!(space.translate(VirtAddr::new(0x40_0000)).is_none());
    }

    #[test]
    fn map_user_page_forces_user_bit() {
        let mut frames = TestFrames::new();
        let mapper = PageTableMapper::new(0);
        let kernel_root = frames.alloc().start_address();

        let space = unsafe {
            AddressSpace::new_user(kernel_root, mapper, &mut TestAlloc(&mut frames), noop_dealloc)
        }
        .unwrap();

        let frame = TestAlloc(&mut frames).allocate_frame().unwrap();
        let page = Page::containing_address(VirtAddr::new(0x40_0000));
        space
            .map_user_page(page, frame, MapFlags::WRITABLE, &mut TestAlloc(&mut frames))
            .unwrap()
            .ignore();

        // SAFETY: root is valid; read-only query.
        let (_, flags) = unsafe { mapper.query(space.root_phys(), page) }.unwrap();
        assert!(flags.contains(MapFlags::USER));
        assert!(flags.contains(MapFlags::WRITABLE));
    }

    #[test]
    fn clone_shares_frames_with_private_tables() {
        let mut frames = TestFrames::new();
        let mapper = PageTableMapper::new(0);
        let kernel_root = frames.alloc().start_address();

        let space = unsafe {
            AddressSpace::new_user(kernel_root, mapper, &mut TestAlloc(&mut frames), noop_dealloc)
        }
        .unwrap();

        let frame = TestAlloc(&mut frames).allocate_frame().unwrap();
        let page = Page::containing_address(VirtAddr::new(0x40_0000));
        space
            .map_user_page(page, frame, MapFlags::WRITABLE, &mut TestAlloc(&mut frames))
            .unwrap()
            .ignore();

        let clone = space.clone_space(&mut TestAlloc(&mut frames)).unwrap();
        assert_ne!(clone.root_phys(), space.root_phys());

        // Same physical frame through both trees.
        assert_eq!(
            clone.translate(page.start_address()).unwrap(),
            frame.start_address()
        );

        // Unmapping in the clone does not affect the original.
        clone.unmap_user_page(page).unwrap();
        assert!(clone.translate(page.start_address()).is_none());
        assert_eq!(
            space.translate(page.start_address()).unwrap(),
            frame.start_address()
        );
    }

    #[test]
    fn unmap_unmapped_user_page_fails() {
        let mut frames = TestFrames::new();
        let mapper = PageTableMapper::new(0);
        let kernel_root = frames.alloc().start_address();
        let space = unsafe {
            AddressSpace::new_user(kernel_root, mapper, &mut TestAlloc(&mut frames), noop_dealloc)
        }
        .unwrap();

        let page = Page::containing_address(VirtAddr::new(0x40_0000));
        assert_eq!(space.unmap_user_page(page), Err(VmmError::NotMapped));
    }
}
