//! Virtual memory manager for the kernel address space.
//!
//! Manages page table mappings and virtual address allocation for the
//! kernel heap and the MMIO aperture. A [`RegionAllocator`] hands out heap
//! addresses (bump-only); a [`FreeRegionAllocator`] backs the MMIO aperture
//! so `iounmap` can recycle ranges. A [`PageMapper`] implementation handles
//! the page table manipulation itself.
//!
//! Device register windows go through [`Vmm::ioremap`] / [`Vmm::iounmap`]:
//! every active window is recorded in a registry so overlapping requests for
//! the same device resolve to the existing mapping instead of double-mapping
//! the registers.

use alloc::vec::Vec;

use alos_core::addr::{PhysAddr, VirtAddr};
use alos_core::paging::{Page, PhysFrame, Size4KiB};

use crate::layout::{INITIAL_HEAP_SIZE, MemoryLayout};
use crate::mapper::{MapFlags, MapFlush, PageMapper, PageTranslator, UnmapError};
use crate::region::{FreeRegionAllocator, RegionAllocator};
use crate::{FrameAllocator, PAGE_SIZE, VmmError};

/// A registered MMIO window.
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    /// Physical base (page-aligned).
    pub phys: PhysAddr,
    /// Virtual base inside the MMIO aperture (page-aligned).
    pub virt: VirtAddr,
    /// Size in bytes (page-aligned).
    pub size: u64,
    /// Owner tag for diagnostics.
    pub name: &'static str,
}

impl MmioRegion {
    fn phys_end(&self) -> u64 {
        self.phys.as_u64() + self.size
    }

    fn contains_virt(&self, virt: VirtAddr) -> bool {
        virt.as_u64() >= self.virt.as_u64() && virt.as_u64() < self.virt.as_u64() + self.size
    }
}

/// The kernel virtual memory manager, generic over the page mapper.
pub struct Vmm<M: PageMapper<Size4KiB> + PageTranslator> {
    root_phys: PhysAddr,
    mapper: M,
    layout: MemoryLayout,
    heap_alloc: RegionAllocator,
    mmio_alloc: FreeRegionAllocator,
    mmio_regions: Vec<MmioRegion>,
}

impl<M: PageMapper<Size4KiB> + PageTranslator> Vmm<M> {
    /// Creates a new VMM wrapping the given root page table.
    pub fn new(root_phys: PhysAddr, mapper: M, hhdm_offset: u64, max_phys: u64) -> Self {
        let layout = MemoryLayout::new(hhdm_offset, max_phys);
        Self {
            root_phys,
            mapper,
            heap_alloc: RegionAllocator::new(layout.heap),
            mmio_alloc: FreeRegionAllocator::new(layout.mmio),
            mmio_regions: Vec::new(),
            layout,
        }
    }

    /// Returns a reference to the memory layout.
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Returns the physical address of the active root page table.
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Maps the initial kernel heap region (4 MiB by default).
    ///
    /// Returns `(base_address, size_in_bytes)`.
    pub fn map_initial_heap(
        &mut self,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(VirtAddr, u64), VmmError> {
        self.grow_heap(INITIAL_HEAP_SIZE, alloc)
    }

    /// Grows the kernel heap by the given number of bytes (rounded to pages).
    ///
    /// Returns `(base_address_of_new_pages, actual_bytes_mapped)`.
    pub fn grow_heap(
        &mut self,
        bytes: u64,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(VirtAddr, u64), VmmError> {
        let page_size = PAGE_SIZE as u64;
        let page_count = bytes.div_ceil(page_size);
        let actual_bytes = page_count * page_size;

        let base = self
            .heap_alloc
            .allocate(actual_bytes)
            .ok_or(VmmError::RegionExhausted)?;

        let flags = MapFlags::WRITABLE | MapFlags::GLOBAL;

        for i in 0..page_count {
            let virt = base + i * page_size;
            let page = Page::containing_address(virt);
            let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
            // SAFETY: The VMM owns the root page table; the target range was
            // just reserved from the heap region so nothing else maps it.
            let flush = unsafe {
                self.mapper
                    .map(self.root_phys, page, frame, flags, &mut || {
                        alloc
                            .allocate_frame()
                            .expect("PMM: out of memory during heap grow")
                    })
            };
            // Fresh mapping, never in TLB.
            flush.ignore();
            // SAFETY: `virt` was just mapped to a valid physical frame;
            // zeroing the page initialises it for heap use.
            unsafe {
                core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
            }
        }

        Ok((base, actual_bytes))
    }

    /// Maps a single 4 KiB page.
    ///
    /// Returns a [`MapFlush`] that the caller must handle (flush or ignore).
    pub fn map_page(
        &mut self,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<MapFlush, VmmError> {
        // SAFETY: The Vmm owns the root page table and the caller provides a
        // valid physical frame and allocator.
        let flush = unsafe {
            self.mapper
                .map(self.root_phys, page, frame, flags, &mut || {
                    alloc
                        .allocate_frame()
                        .expect("PMM: out of memory during map_page")
                })
        };
        Ok(flush)
    }

    /// Unmaps a single 4 KiB page, flushes the TLB, and returns the frame.
    pub fn unmap_page(&mut self, page: Page<Size4KiB>) -> Result<PhysFrame<Size4KiB>, VmmError> {
        // SAFETY: The Vmm owns the root page table. Unmapping returns the
        // previously-mapped frame for the caller to deallocate.
        let (frame, flush) = unsafe {
            self.mapper.unmap(self.root_phys, page).map_err(|e| match e {
                UnmapError::NotMapped => VmmError::NotMapped,
                UnmapError::SizeMismatch => VmmError::SizeMismatch,
            })?
        };
        flush.flush();
        Ok(frame)
    }

    /// Translates a virtual address to a physical address.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: The Vmm owns root_phys; a read-only walk is safe.
        unsafe { <M as PageTranslator>::translate_addr(&self.mapper, self.root_phys, virt) }
    }

    /// Returns `true` if `virt` is mapped in the active tree.
    pub fn is_mapped(&self, virt: VirtAddr) -> bool {
        self.translate(virt).is_some()
    }

    /// ORs the USER bit into every mapped page of `[start, start + size)`.
    ///
    /// Pages that are not mapped are left alone: the ring-3 trampoline maps
    /// them before handing the range to user code.
    pub fn make_user_accessible(&mut self, start: VirtAddr, size: u64) {
        if size == 0 {
            return;
        }
        let end = start + size;
        let first = Page::<Size4KiB>::containing_address(start);
        let last = Page::<Size4KiB>::containing_address(end + (PAGE_SIZE as u64 - 1));
        for page in Page::range(first, last) {
            // SAFETY: The Vmm owns the root page table; the walk is confined
            // to already-present leaves.
            let Some((_, flags)) = (unsafe { self.mapper.query(self.root_phys, page) }) else {
                continue;
            };
            if flags.contains(MapFlags::USER) {
                continue;
            }
            // SAFETY: The page was just observed mapped; only its flags
            // change.
            let flush = unsafe {
                self.mapper
                    .update_flags(self.root_phys, page, flags | MapFlags::USER)
            };
            if let Ok(flush) = flush {
                flush.flush();
            }
        }
    }

    // -----------------------------------------------------------------------
    // MMIO aperture
    // -----------------------------------------------------------------------

    /// Maps a physical device register range into the MMIO aperture.
    ///
    /// The range is rounded out to page boundaries and mapped
    /// writable, cache-disabled and write-through. If the physical range is
    /// already covered by a registered window the existing mapping is
    /// returned; a partial overlap fails with [`VmmError::MmioConflict`].
    ///
    /// Returns the virtual address corresponding to `phys` (offset inside
    /// the first page preserved).
    pub fn ioremap(
        &mut self,
        phys: PhysAddr,
        size: u64,
        name: &'static str,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<VirtAddr, VmmError> {
        if size == 0 {
            return Err(VmmError::InvalidArgument);
        }

        let page_size = PAGE_SIZE as u64;
        let phys_base = phys.align_down(page_size);
        let phys_end = (phys + size).align_up(page_size).as_u64();
        let aligned_size = phys_end - phys_base.as_u64();

        // Reuse or reject overlapping registrations.
        for region in &self.mmio_regions {
            let overlaps = phys_base.as_u64() < region.phys_end() && phys_end > region.phys.as_u64();
            if !overlaps {
                continue;
            }
            if phys_base.as_u64() >= region.phys.as_u64() && phys_end <= region.phys_end() {
                // Fully contained: same attributes by construction, hand out
                // the existing window.
                let offset = phys.as_u64() - region.phys.as_u64();
                return Ok(region.virt + offset);
            }
            return Err(VmmError::MmioConflict);
        }

        let virt_base = self
            .mmio_alloc
            .allocate(aligned_size)
            .ok_or(VmmError::RegionExhausted)?;

        let flags = MapFlags::WRITABLE
            | MapFlags::GLOBAL
            | MapFlags::CACHE_DISABLE
            | MapFlags::WRITE_THROUGH;

        let page_count = aligned_size / page_size;
        for i in 0..page_count {
            let page = Page::containing_address(virt_base + i * page_size);
            let frame = PhysFrame::containing_address(phys_base + i * page_size);
            // SAFETY: The MMIO physical address is provided by firmware or
            // device discovery; mapping it cache-disabled into the reserved
            // aperture is the contract for register access.
            let flush = unsafe {
                self.mapper
                    .map(self.root_phys, page, frame, flags, &mut || {
                        alloc
                            .allocate_frame()
                            .expect("PMM: out of memory during MMIO map")
                    })
            };
            // Fresh mapping, never in TLB.
            flush.ignore();
        }

        self.mmio_regions.push(MmioRegion {
            phys: phys_base,
            virt: virt_base,
            size: aligned_size,
            name,
        });

        Ok(virt_base + phys.page_offset())
    }

    /// Unmaps a window previously returned by [`Vmm::ioremap`].
    ///
    /// `virt` may point anywhere inside the window. Every page is unmapped
    /// and TLB-flushed, the registry entry is removed, and the virtual range
    /// is recycled. The device frames themselves are not RAM and are never
    /// handed to the PMM.
    pub fn iounmap(&mut self, virt: VirtAddr) -> Result<(), VmmError> {
        let idx = self
            .mmio_regions
            .iter()
            .position(|r| r.contains_virt(virt))
            .ok_or(VmmError::MmioNotMapped)?;
        let region = self.mmio_regions.swap_remove(idx);

        let page_size = PAGE_SIZE as u64;
        for i in 0..region.size / page_size {
            let page = Page::containing_address(region.virt + i * page_size);
            // SAFETY: The Vmm owns the root page table; the window was
            // mapped by ioremap.
            match unsafe { self.mapper.unmap(self.root_phys, page) } {
                Ok((_, flush)) => flush.flush(),
                Err(_) => {}
            }
        }

        self.mmio_alloc.deallocate(region.virt, region.size);
        Ok(())
    }

    /// Returns the registered MMIO windows.
    pub fn mmio_regions(&self) -> &[MmioRegion] {
        &self.mmio_regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::PageTableMapper;
    use crate::page_table::tests::TestFrames;

    struct TestAlloc<'a>(&'a mut TestFrames);

    // SAFETY: TestFrames hands out fresh host allocations, never the same
    // frame twice.
    unsafe impl FrameAllocator<Size4KiB> for TestAlloc<'_> {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            Some(self.0.alloc())
        }
    }

    fn test_vmm(frames: &mut TestFrames) -> Vmm<PageTableMapper> {
        let root = frames.alloc().start_address();
        Vmm::new(root, PageTableMapper::new(0), 0, 0x1_0000_0000)
    }

    #[test]
    fn map_translate_unmap_roundtrip() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);
        let target = {
            let mut a = TestAlloc(&mut frames);
            a.allocate_frame().unwrap()
        };

        let virt = VirtAddr::new(0x4000_0000);
        let page = Page::containing_address(virt);
        vmm.map_page(
            page,
            target,
            MapFlags::WRITABLE,
            &mut TestAlloc(&mut frames),
        )
        .unwrap()
        .ignore();

        assert!(vmm.is_mapped(virt));
        assert_eq!(
            vmm.translate(virt + 0xABC).unwrap(),
            target.start_address() + 0xABC
        );

        let freed = vmm.unmap_page(page).unwrap();
        assert_eq!(freed.start_address(), target.start_address());
        assert!(!vmm.is_mapped(virt));
    }

    #[test]
    fn unmap_unmapped_page_fails() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);
        let page = Page::containing_address(VirtAddr::new(0x1000));
        assert_eq!(vmm.unmap_page(page), Err(VmmError::NotMapped));
    }

    #[test]
    fn make_user_accessible_skips_holes() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);

        let base = VirtAddr::new(0x10_0000);
        // Map pages 0 and 2 of a three-page range, leave page 1 a hole.
        for i in [0u64, 2] {
            let frame = TestAlloc(&mut frames).allocate_frame().unwrap();
            vmm.map_page(
                Page::containing_address(base + i * 0x1000),
                frame,
                MapFlags::WRITABLE,
                &mut TestAlloc(&mut frames),
            )
            .unwrap()
            .ignore();
        }

        vmm.make_user_accessible(base, 3 * 0x1000);

        assert!(vmm.is_mapped(base));
        assert!(!vmm.is_mapped(base + 0x1000));
        assert!(vmm.is_mapped(base + 0x2000));
    }

    #[test]
    fn ioremap_translate_iounmap() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);

        let phys = PhysAddr::new(0xFEB0_0000);
        let virt = vmm
            .ioremap(phys, 0x20000, "test-bar", &mut TestAlloc(&mut frames))
            .unwrap();

        // Translating through the page tables lands on the device range.
        assert_eq!(vmm.translate(virt).unwrap(), phys);
        assert_eq!(
            vmm.translate(virt + 0x1FFF0).unwrap(),
            PhysAddr::new(0xFEB1_FFF0)
        );
        assert_eq!(vmm.mmio_regions().len(), 1);

        vmm.iounmap(virt).unwrap();
        assert!(!vmm.is_mapped(virt));
        assert!(!vmm.is_mapped(virt + 0x1F000));
        assert!(vmm.mmio_regions().is_empty());
    }

    #[test]
    fn ioremap_preserves_sub_page_offset() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);

        let virt = vmm
            .ioremap(
                PhysAddr::new(0xFEB0_0010),
                0x100,
                "offset-bar",
                &mut TestAlloc(&mut frames),
            )
            .unwrap();
        assert_eq!(virt.page_offset(), 0x10);
        assert_eq!(vmm.translate(virt).unwrap(), PhysAddr::new(0xFEB0_0010));
    }

    #[test]
    fn ioremap_contained_overlap_reuses_window() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);

        let first = vmm
            .ioremap(
                PhysAddr::new(0xFEB0_0000),
                0x4000,
                "bar0",
                &mut TestAlloc(&mut frames),
            )
            .unwrap();
        let again = vmm
            .ioremap(
                PhysAddr::new(0xFEB0_1000),
                0x1000,
                "bar0-sub",
                &mut TestAlloc(&mut frames),
            )
            .unwrap();

        assert_eq!(again, first + 0x1000);
        assert_eq!(vmm.mmio_regions().len(), 1);
    }

    #[test]
    fn ioremap_partial_overlap_conflicts() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);

        vmm.ioremap(
            PhysAddr::new(0xFEB0_0000),
            0x2000,
            "bar0",
            &mut TestAlloc(&mut frames),
        )
        .unwrap();

        let err = vmm
            .ioremap(
                PhysAddr::new(0xFEB0_1000),
                0x2000,
                "bar1",
                &mut TestAlloc(&mut frames),
            )
            .unwrap_err();
        assert_eq!(err, VmmError::MmioConflict);
    }

    #[test]
    fn ioremap_zero_size_rejected() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);
        let err = vmm
            .ioremap(
                PhysAddr::new(0xFEB0_0000),
                0,
                "empty",
                &mut TestAlloc(&mut frames),
            )
            .unwrap_err();
        assert_eq!(err, VmmError::InvalidArgument);
    }

    #[test]
    fn iounmap_unknown_address_fails() {
        let mut frames = TestFrames::new();
        let mut vmm = test_vmm(&mut frames);
        assert_eq!(
            vmm.iounmap(VirtAddr::new(0x1234_5000)),
            Err(VmmError::MmioNotMapped)
        );
    }
}
