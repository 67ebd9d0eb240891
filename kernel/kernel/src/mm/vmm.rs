//! Global virtual memory manager.
//!
//! Wraps the core [`Vmm`] in a global static and exposes the kernel-facing
//! mapping and MMIO entry points.

use alos_core::addr::{PhysAddr, VirtAddr};
use alos_core::sync::SpinLock;
use alos_mm::VmmError;
use alos_mm::page_table::PageTableMapper;
use alos_mm::pmm::BitmapFrameAllocRef;
use alos_mm::vmm::Vmm;

use crate::boot::BootInfo;

/// Type alias for the kernel VMM over the x86_64 page table walker.
pub type KernelVmm = Vmm<PageTableMapper>;

/// Global virtual memory manager.
static VMM: SpinLock<Option<KernelVmm>> = SpinLock::new(None);

/// Initializes the VMM from boot info, registering the TLB flush hook.
///
/// # Panics
///
/// Panics if the VMM is already initialized.
pub fn init(boot_info: &impl BootInfo) {
    #[cfg(target_arch = "x86_64")]
    alos_mm::mapper::register_tlb_flush(alos_core::arch::x86_64::instructions::invlpg);

    let hhdm_offset = boot_info.hhdm_offset();
    let root_phys = boot_info.page_table_root();

    // Highest physical address bounds the HHDM region.
    let max_phys = boot_info
        .memory_map()
        .iter()
        .map(|r| r.start.as_u64() + r.size)
        .max()
        .unwrap_or(0);

    let mapper = PageTableMapper::new(hhdm_offset);
    let vmm = KernelVmm::new(root_phys, mapper, hhdm_offset, max_phys);

    let mut global = VMM.lock();
    assert!(global.is_none(), "VMM already initialized");
    *global = Some(vmm);
}

/// Executes a closure with a mutable reference to the global VMM.
///
/// # Panics
///
/// Panics if the VMM has not been initialized.
pub fn with_vmm<R>(f: impl FnOnce(&mut KernelVmm) -> R) -> R {
    let mut vmm = VMM.lock();
    f(vmm.as_mut().expect("VMM not initialized"))
}

/// Maps the initial kernel heap. Returns `(heap_start, heap_size)`.
pub fn map_initial_heap() -> (usize, usize) {
    with_vmm(|vmm| {
        super::pmm::with(|pmm| {
            let mut alloc = BitmapFrameAllocRef(pmm);
            let (base, size) = vmm
                .map_initial_heap(&mut alloc)
                .expect("VMM: failed to map initial heap");
            (base.as_u64() as usize, size as usize)
        })
    })
}

/// Translates a virtual address through the active kernel tree.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    with_vmm(|vmm| vmm.translate(virt))
}

/// Returns `true` if `virt` is mapped in the active kernel tree.
pub fn is_mapped(virt: VirtAddr) -> bool {
    with_vmm(|vmm| vmm.is_mapped(virt))
}

/// ORs the USER bit into every mapped page of `[start, start + size)`.
pub fn make_user_accessible(start: VirtAddr, size: u64) {
    with_vmm(|vmm| vmm.make_user_accessible(start, size));
}

/// Maps a device register window into the MMIO aperture.
pub fn ioremap(phys: PhysAddr, size: u64, name: &'static str) -> Result<VirtAddr, VmmError> {
    with_vmm(|vmm| {
        super::pmm::with(|pmm| {
            let mut alloc = BitmapFrameAllocRef(pmm);
            vmm.ioremap(phys, size, name, &mut alloc)
        })
    })
}

/// Releases a window previously returned by [`ioremap`].
pub fn iounmap(virt: VirtAddr) -> Result<(), VmmError> {
    with_vmm(|vmm| vmm.iounmap(virt))
}
