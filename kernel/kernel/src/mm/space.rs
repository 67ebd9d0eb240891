//! User address space lifecycle.
//!
//! Ties [`AddressSpace`] to the global PMM (frame source and drop-time
//! release) and to CR3 for switching.

use alos_core::paging::{PhysFrame, Size4KiB};
use alos_mm::VmmError;
use alos_mm::address_space::AddressSpace;
use alos_mm::page_table::PageTableMapper;
use alos_mm::pmm::BitmapFrameAllocRef;

/// Releases an address space's root frame back to the PMM.
///
/// Uses `try_with` so a drop on a teardown path that already holds the PMM
/// lock leaks one frame instead of deadlocking.
fn release_root_frame(frame: PhysFrame<Size4KiB>) {
    let _ = super::pmm::try_with(|pmm| {
        // SAFETY: The frame was allocated for this root and is no longer
        // referenced once the address space is dropped.
        let _ = unsafe { pmm.deallocate_frame(frame) };
    });
}

/// Creates a fresh user address space sharing the kernel half.
pub fn create_address_space() -> Result<AddressSpace, VmmError> {
    let kernel_root = super::vmm::with_vmm(|vmm| vmm.root_phys());
    let mapper = PageTableMapper::new(super::hhdm::offset());
    super::pmm::with(|pmm| {
        // SAFETY: The kernel root is the live PML4 and the mapper carries
        // the boot HHDM offset.
        unsafe {
            AddressSpace::new_user(
                kernel_root,
                mapper,
                &mut BitmapFrameAllocRef(pmm),
                release_root_frame,
            )
        }
    })
}

/// Clones `src` into a new address space referencing the same user frames.
pub fn clone_address_space(src: &AddressSpace) -> Result<AddressSpace, VmmError> {
    super::pmm::with(|pmm| src.clone_space(&mut BitmapFrameAllocRef(pmm)))
}

/// Loads the address space's root into CR3.
///
/// # Safety
///
/// The address space must map the currently executing kernel code and
/// stack (guaranteed by the shared kernel half) and must outlive its use
/// as the active tree.
pub unsafe fn switch_address_space(space: &AddressSpace) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: Caller contract above.
    unsafe {
        alos_core::arch::x86_64::instructions::write_cr3(space.root_phys());
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = space;
}
