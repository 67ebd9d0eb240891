//! Page table walker: builds and walks x86_64 4-level trees via the HHDM.
//!
//! [`PageTableMapper`] implements the [`PageMapper`]/[`PageTranslator`]
//! traits for 4 KiB pages. All physical addresses are accessed through
//! `hhdm_offset + phys_addr`, so the same code runs against real page table
//! frames in the kernel and against host-allocated buffers in tests
//! (`hhdm_offset == 0`).
//!
//! The kernel itself only installs 4 KiB leaves, but boot loaders map the
//! HHDM with huge pages, so translation stays huge-page aware and unmap
//! refuses to touch entries of a different size.

use alos_core::addr::{PhysAddr, VirtAddr};
use alos_core::arch::x86_64::paging::{PageTable, PageTableEntry, PageTableFlags};
use alos_core::paging::{Page, PhysFrame, Size4KiB};

use crate::PAGE_SIZE;
use crate::mapper::{self, MapFlags, MapFlush};

/// Number of PML4 entries in the user (lower) half.
pub const USER_PML4_ENTRIES: usize = 256;

/// Result of translating a virtual address.
#[derive(Debug, Clone, Copy)]
pub enum TranslateResult {
    /// Mapped via a 4 KiB page.
    Page4KiB {
        /// Physical frame.
        frame: PhysFrame<Size4KiB>,
        /// Page table entry flags.
        flags: PageTableFlags,
    },
    /// Mapped via a 2 MiB huge page (boot loader mappings).
    Huge2MiB {
        /// Physical start address of the 2 MiB page.
        phys_start: PhysAddr,
        /// Page table entry flags.
        flags: PageTableFlags,
    },
    /// Mapped via a 1 GiB huge page (boot loader mappings).
    Huge1GiB {
        /// Physical start address of the 1 GiB page.
        phys_start: PhysAddr,
        /// Page table entry flags.
        flags: PageTableFlags,
    },
    /// The address is not mapped.
    NotMapped,
}

/// Error type for unmap / update operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    /// The page is not mapped.
    NotMapped,
    /// The entry is a huge page and cannot be treated as 4 KiB.
    HugePage,
}

/// Utility for walking and building page tables via the HHDM.
#[derive(Clone, Copy)]
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    /// Creates a new mapper with the given HHDM offset.
    pub fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    /// Returns the HHDM offset this mapper translates through.
    pub fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    /// Converts a physical address to its HHDM virtual address.
    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        let p = phys.as_u64();
        assert!(
            p <= u64::MAX - self.hhdm_offset,
            "phys_to_virt: physical address {:#x} overflows HHDM (offset {:#x})",
            p,
            self.hhdm_offset,
        );
        (self.hhdm_offset + p) as *mut u8
    }

    /// Returns a mutable reference to the [`PageTable`] at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must point to a valid, 4 KiB-aligned physical frame that is
    /// accessible through the HHDM.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures the entry at `table[index]` points to a valid next-level table,
    /// allocating one if it is not present. Returns the physical address of
    /// the next-level table.
    ///
    /// Newly allocated frames are zeroed before use so that no stale data is
    /// misinterpreted as present page table entries. If the entry already
    /// exists, any missing flags from `intermediate_flags` are OR'd in.
    ///
    /// # Safety
    ///
    /// `table_phys` must be valid and accessible through the HHDM.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate_flags: PageTableFlags,
        alloc: &mut (impl FnMut() -> PhysFrame<Size4KiB> + ?Sized),
    ) -> PhysAddr {
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            // OR in any new flags (e.g. USER for mixed kernel/user subtrees).
            let combined = entry.flags() | intermediate_flags;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            entry.address()
        } else {
            let new_frame = alloc().start_address();
            // SAFETY: The frame was just allocated and is accessible through
            // the HHDM. Zeroing ensures no stale PTEs are misinterpreted as
            // present entries.
            unsafe {
                core::ptr::write_bytes(self.phys_to_virt(new_frame), 0, PAGE_SIZE);
            }
            table.entries[index] = PageTableEntry::new(new_frame, intermediate_flags);
            new_frame
        }
    }

    /// Maps a 4 KiB page.
    ///
    /// Walks PML4 -> PDPT -> PD -> PT, allocating intermediate tables as
    /// needed. The leaf entry always carries PRESENT in addition to `flags`.
    ///
    /// # Safety
    ///
    /// - `pml4_phys` must point to a valid PML4 table.
    /// - The caller must ensure the mapping does not conflict with existing
    ///   mappings.
    pub unsafe fn map_4k(
        &self,
        pml4_phys: PhysAddr,
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut (impl FnMut() -> PhysFrame<Size4KiB> + ?Sized),
    ) {
        let flags = flags | PageTableFlags::PRESENT;
        let intermediate = Self::intermediate_flags_for(flags);
        let pdpt_phys =
            unsafe { self.ensure_table(pml4_phys, virt_addr.pml4_index(), intermediate, alloc) };
        let pd_phys =
            unsafe { self.ensure_table(pdpt_phys, virt_addr.pdpt_index(), intermediate, alloc) };
        let pt_phys =
            unsafe { self.ensure_table(pd_phys, virt_addr.pd_index(), intermediate, alloc) };

        let pt = unsafe { self.table_at(pt_phys) };
        pt.entries[virt_addr.pt_index()] = PageTableEntry::new(phys_addr, flags);
    }

    /// Unmaps a 4 KiB page and returns the physical frame that was mapped.
    ///
    /// Only the leaf entry is cleared; interior tables are never reclaimed.
    /// Does NOT flush the TLB -- the caller must do that.
    ///
    /// # Safety
    ///
    /// - `pml4_phys` must point to a valid PML4 table.
    /// - The caller must flush the TLB for `virt_addr` after unmapping.
    pub unsafe fn unmap_4k(
        &self,
        pml4_phys: PhysAddr,
        virt_addr: VirtAddr,
    ) -> Result<PhysFrame<Size4KiB>, WalkError> {
        let pt_phys = unsafe { self.leaf_table(pml4_phys, virt_addr)? };
        let pt = unsafe { self.table_at(pt_phys) };
        let pte = pt.entries[virt_addr.pt_index()];
        if !pte.is_present() {
            return Err(WalkError::NotMapped);
        }

        let frame = PhysFrame::containing_address(pte.address());
        pt.entries[virt_addr.pt_index()] = PageTableEntry::empty();
        Ok(frame)
    }

    /// Walks down to the page table (PT) covering `virt_addr`.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must point to a valid PML4 table.
    unsafe fn leaf_table(
        &self,
        pml4_phys: PhysAddr,
        virt_addr: VirtAddr,
    ) -> Result<PhysAddr, WalkError> {
        let pml4 = unsafe { self.table_at(pml4_phys) };
        let pml4e = pml4.entries[virt_addr.pml4_index()];
        if !pml4e.is_present() {
            return Err(WalkError::NotMapped);
        }

        let pdpt = unsafe { self.table_at(pml4e.address()) };
        let pdpte = pdpt.entries[virt_addr.pdpt_index()];
        if !pdpte.is_present() {
            return Err(WalkError::NotMapped);
        }
        if pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(WalkError::HugePage); // 1 GiB page
        }

        let pd = unsafe { self.table_at(pdpte.address()) };
        let pde = pd.entries[virt_addr.pd_index()];
        if !pde.is_present() {
            return Err(WalkError::NotMapped);
        }
        if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(WalkError::HugePage); // 2 MiB page
        }

        Ok(pde.address())
    }

    /// Translates a virtual address, returning information about the mapping.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must point to a valid PML4 table.
    pub unsafe fn translate(&self, pml4_phys: PhysAddr, virt_addr: VirtAddr) -> TranslateResult {
        let pml4 = unsafe { self.table_at(pml4_phys) };
        let pml4e = pml4.entries[virt_addr.pml4_index()];
        if !pml4e.is_present() {
            return TranslateResult::NotMapped;
        }

        let pdpt = unsafe { self.table_at(pml4e.address()) };
        let pdpte = pdpt.entries[virt_addr.pdpt_index()];
        if !pdpte.is_present() {
            return TranslateResult::NotMapped;
        }
        if pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
            return TranslateResult::Huge1GiB {
                phys_start: pdpte.address(),
                flags: pdpte.flags(),
            };
        }

        let pd = unsafe { self.table_at(pdpte.address()) };
        let pde = pd.entries[virt_addr.pd_index()];
        if !pde.is_present() {
            return TranslateResult::NotMapped;
        }
        if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
            return TranslateResult::Huge2MiB {
                phys_start: pde.address(),
                flags: pde.flags(),
            };
        }

        let pt = unsafe { self.table_at(pde.address()) };
        let pte = pt.entries[virt_addr.pt_index()];
        if !pte.is_present() {
            return TranslateResult::NotMapped;
        }

        TranslateResult::Page4KiB {
            frame: PhysFrame::containing_address(pte.address()),
            flags: pte.flags(),
        }
    }

    /// Translates a virtual address to a physical address, returning `None`
    /// if not mapped. Handles all page sizes.
    ///
    /// # Safety
    ///
    /// `pml4_phys` must point to a valid PML4 table.
    pub unsafe fn translate_addr(
        &self,
        pml4_phys: PhysAddr,
        virt_addr: VirtAddr,
    ) -> Option<PhysAddr> {
        match unsafe { self.translate(pml4_phys, virt_addr) } {
            TranslateResult::Page4KiB { frame, .. } => {
                Some(frame.start_address() + virt_addr.page_offset())
            }
            TranslateResult::Huge2MiB { phys_start, .. } => {
                Some(phys_start + (virt_addr.as_u64() & 0x1F_FFFF))
            }
            TranslateResult::Huge1GiB { phys_start, .. } => {
                Some(phys_start + (virt_addr.as_u64() & 0x3FFF_FFFF))
            }
            TranslateResult::NotMapped => None,
        }
    }

    /// Replaces the flags of a 4 KiB page mapping. PRESENT is always kept.
    ///
    /// Does NOT flush the TLB -- the caller must do that.
    ///
    /// # Safety
    ///
    /// - `pml4_phys` must point to a valid PML4 table.
    /// - The caller must flush the TLB for `virt_addr` after the update.
    pub unsafe fn update_flags_4k(
        &self,
        pml4_phys: PhysAddr,
        virt_addr: VirtAddr,
        new_flags: PageTableFlags,
    ) -> Result<(), WalkError> {
        let pt_phys = unsafe { self.leaf_table(pml4_phys, virt_addr)? };
        let pt = unsafe { self.table_at(pt_phys) };
        let pte = pt.entries[virt_addr.pt_index()];
        if !pte.is_present() {
            return Err(WalkError::NotMapped);
        }

        pt.entries[virt_addr.pt_index()] =
            PageTableEntry::new(pte.address(), new_flags | PageTableFlags::PRESENT);
        Ok(())
    }

    /// Copies the kernel-half PML4 entries (256..512) from `kernel_root`
    /// into `new_root` by reference, sharing the kernel subtree.
    ///
    /// # Safety
    ///
    /// Both roots must point to valid PML4 tables accessible through the
    /// HHDM.
    pub unsafe fn copy_kernel_half(&self, kernel_root: PhysAddr, new_root: PhysAddr) {
        let src = unsafe { self.table_at(kernel_root) };
        let dst = unsafe { self.table_at(new_root) };
        for i in USER_PML4_ENTRIES..PageTable::ENTRY_COUNT {
            dst.entries[i] = src.entries[i];
        }
    }

    /// Reinstalls every present user-half leaf of `src_root` into
    /// `dst_root`, referencing the *same physical frames* with the same
    /// attributes (shared-mapping fork). Fresh interior tables are allocated
    /// for the destination so the two trees stay independent.
    ///
    /// Huge user leaves (never created by this kernel) are copied by entry
    /// value, which shares the huge frame just like the 4 KiB case.
    ///
    /// # Safety
    ///
    /// - Both roots must point to valid PML4 tables.
    /// - `alloc` must return usable 4 KiB frames.
    pub unsafe fn clone_user_half(
        &self,
        src_root: PhysAddr,
        dst_root: PhysAddr,
        alloc: &mut (impl FnMut() -> PhysFrame<Size4KiB> + ?Sized),
    ) {
        for i4 in 0..USER_PML4_ENTRIES {
            let e4 = unsafe { self.table_at(src_root) }.entries[i4];
            if !e4.is_present() {
                continue;
            }
            for i3 in 0..PageTable::ENTRY_COUNT {
                let e3 = unsafe { self.table_at(e4.address()) }.entries[i3];
                if !e3.is_present() {
                    continue;
                }
                if e3.flags().contains(PageTableFlags::HUGE_PAGE) {
                    let dst_pdpt = unsafe { self.ensure_table(dst_root, i4, e4.flags(), alloc) };
                    unsafe { self.table_at(dst_pdpt) }.entries[i3] = e3;
                    continue;
                }
                for i2 in 0..PageTable::ENTRY_COUNT {
                    let e2 = unsafe { self.table_at(e3.address()) }.entries[i2];
                    if !e2.is_present() {
                        continue;
                    }
                    if e2.flags().contains(PageTableFlags::HUGE_PAGE) {
                        let dst_pdpt =
                            unsafe { self.ensure_table(dst_root, i4, e4.flags(), alloc) };
                        let dst_pd = unsafe { self.ensure_table(dst_pdpt, i3, e3.flags(), alloc) };
                        unsafe { self.table_at(dst_pd) }.entries[i2] = e2;
                        continue;
                    }
                    for i1 in 0..PageTable::ENTRY_COUNT {
                        let e1 = unsafe { self.table_at(e2.address()) }.entries[i1];
                        if !e1.is_present() {
                            continue;
                        }
                        let dst_pdpt =
                            unsafe { self.ensure_table(dst_root, i4, e4.flags(), alloc) };
                        let dst_pd = unsafe { self.ensure_table(dst_pdpt, i3, e3.flags(), alloc) };
                        let dst_pt = unsafe { self.ensure_table(dst_pd, i2, e2.flags(), alloc) };
                        unsafe { self.table_at(dst_pt) }.entries[i1] = e1;
                    }
                }
            }
        }
    }

    /// Computes intermediate page table entry flags from leaf flags.
    ///
    /// Intermediate entries are always `PRESENT | WRITABLE`. If the leaf
    /// flags include `USER`, the intermediate entries also get `USER`
    /// so that ring 3 can traverse the walk.
    fn intermediate_flags_for(leaf_flags: PageTableFlags) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if leaf_flags.contains(PageTableFlags::USER) {
            flags |= PageTableFlags::USER;
        }
        flags
    }

    /// Converts arch-independent [`MapFlags`] to x86_64 [`PageTableFlags`].
    fn map_flags_to_native(flags: MapFlags) -> PageTableFlags {
        let mut native = PageTableFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            native |= PageTableFlags::WRITABLE;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            native |= PageTableFlags::NO_EXECUTE;
        }
        if flags.contains(MapFlags::USER) {
            native |= PageTableFlags::USER;
        }
        if flags.contains(MapFlags::GLOBAL) {
            native |= PageTableFlags::GLOBAL;
        }
        if flags.contains(MapFlags::CACHE_DISABLE) {
            native |= PageTableFlags::CACHE_DISABLE;
        }
        if flags.contains(MapFlags::WRITE_THROUGH) {
            native |= PageTableFlags::WRITE_THROUGH;
        }
        native
    }

    /// Converts x86_64 [`PageTableFlags`] back to arch-independent
    /// [`MapFlags`].
    fn native_to_map_flags(native: PageTableFlags) -> MapFlags {
        let mut flags = MapFlags::empty();
        if native.contains(PageTableFlags::WRITABLE) {
            flags |= MapFlags::WRITABLE;
        }
        if !native.contains(PageTableFlags::NO_EXECUTE) {
            flags |= MapFlags::EXECUTABLE;
        }
        if native.contains(PageTableFlags::USER) {
            flags |= MapFlags::USER;
        }
        if native.contains(PageTableFlags::GLOBAL) {
            flags |= MapFlags::GLOBAL;
        }
        if native.contains(PageTableFlags::CACHE_DISABLE) {
            flags |= MapFlags::CACHE_DISABLE;
        }
        if native.contains(PageTableFlags::WRITE_THROUGH) {
            flags |= MapFlags::WRITE_THROUGH;
        }
        flags
    }
}

// SAFETY: `PageTableMapper` correctly manipulates x86_64 4-level page tables
// via the HHDM for 4 KiB pages.
unsafe impl mapper::PageMapper<Size4KiB> for PageTableMapper {
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> MapFlush {
        let native = Self::map_flags_to_native(flags);
        let virt = page.start_address();
        // SAFETY: Caller guarantees root is valid.
        unsafe { self.map_4k(root, virt, frame.start_address(), native, alloc) }
        MapFlush::new(virt)
    }

    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, MapFlush), mapper::UnmapError> {
        let virt = page.start_address();
        // SAFETY: Caller guarantees root is valid.
        let frame = unsafe {
            self.unmap_4k(root, virt).map_err(|e| match e {
                WalkError::NotMapped => mapper::UnmapError::NotMapped,
                WalkError::HugePage => mapper::UnmapError::SizeMismatch,
            })?
        };
        Ok((frame, MapFlush::new(virt)))
    }

    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        flags: MapFlags,
    ) -> Result<MapFlush, mapper::UnmapError> {
        let virt = page.start_address();
        let native = Self::map_flags_to_native(flags);
        // SAFETY: Caller guarantees root is valid.
        unsafe {
            self.update_flags_4k(root, virt, native).map_err(|e| match e {
                WalkError::NotMapped => mapper::UnmapError::NotMapped,
                WalkError::HugePage => mapper::UnmapError::SizeMismatch,
            })?;
        }
        Ok(MapFlush::new(virt))
    }

    unsafe fn query(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> Option<(PhysFrame<Size4KiB>, MapFlags)> {
        // SAFETY: Caller guarantees root is valid.
        match unsafe { self.translate(root, page.start_address()) } {
            TranslateResult::Page4KiB { frame, flags } => {
                Some((frame, Self::native_to_map_flags(flags)))
            }
            _ => None,
        }
    }
}

// SAFETY: `PageTableMapper` correctly walks x86_64 4-level page tables for
// address translation via the HHDM.
unsafe impl mapper::PageTranslator for PageTableMapper {
    unsafe fn translate_addr(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Caller guarantees root is valid.
        unsafe { self.translate_addr(root, virt) }
    }
}
