//! Kernel virtual address space layout.
//!
//! Defines the [`MemoryLayout`] describing where the kernel heap and the
//! MMIO aperture live in the virtual address space, and classifies faulting
//! addresses into regions for the page fault handler.

use alos_core::addr::VirtAddr;

/// Base address for kernel-managed regions.
pub const REGIONS_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Offset from the regions base to the heap region.
pub const HEAP_OFFSET: u64 = 0;
/// Maximum heap size: 64 GiB.
pub const HEAP_MAX_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Offset from the regions base to the MMIO aperture.
pub const MMIO_OFFSET: u64 = 8 * 1024 * 1024 * 1024 * 1024; // +8 TiB
/// Maximum MMIO aperture size: 1 TiB.
pub const MMIO_MAX_SIZE: u64 = 1024 * 1024 * 1024 * 1024;

/// Fixed kernel image base address.
pub const KERNEL_IMAGE_BASE: u64 = 0xFFFF_FFFF_8000_0000;
/// Maximum kernel image size: 128 MiB.
pub const KERNEL_IMAGE_MAX_SIZE: u64 = 128 * 1024 * 1024;

/// Initial heap size: 4 MiB.
pub const INITIAL_HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// First address of the kernel (upper) half.
pub const KERNEL_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// A virtual address region with a base and maximum size.
#[derive(Debug, Clone, Copy)]
pub struct VirtRegion {
    base: VirtAddr,
    max_size: u64,
}

impl VirtRegion {
    /// Creates a new virtual region.
    pub const fn new(base: VirtAddr, max_size: u64) -> Self {
        Self { base, max_size }
    }

    /// Returns the base address of this region.
    #[inline]
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    /// Returns the maximum size of this region.
    #[inline]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Returns the end address (base + max_size).
    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.base + self.max_size
    }

    /// Returns true if `addr` falls within this region.
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.base.as_u64() + self.max_size
    }
}

/// Describes the kernel's virtual address space layout.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// HHDM base (provided by the boot loader).
    pub hhdm_base: VirtAddr,
    /// Size of the HHDM region (covers all physical memory).
    pub hhdm_size: u64,
    /// Kernel heap region.
    pub heap: VirtRegion,
    /// MMIO aperture.
    pub mmio: VirtRegion,
    /// Kernel image region (.text, .rodata, .data, .bss).
    pub kernel_image: VirtRegion,
}

/// Identifies which virtual address region a faulting address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRegion {
    /// Lower-half (user) address.
    UserSpace,
    /// Kernel heap.
    Heap,
    /// MMIO aperture.
    Mmio,
    /// Kernel image (.text, .rodata, .data, .bss).
    KernelImage,
    /// Higher-half direct map.
    Hhdm,
    /// Kernel-half address outside every known region.
    Unknown,
}

impl MemoryLayout {
    /// Creates a new `MemoryLayout` from the HHDM offset and maximum
    /// physical address.
    pub fn new(hhdm_offset: u64, max_phys: u64) -> Self {
        let rb = VirtAddr::new_truncate(REGIONS_BASE);
        Self {
            hhdm_base: VirtAddr::new_truncate(hhdm_offset),
            hhdm_size: max_phys,
            heap: VirtRegion::new(rb + HEAP_OFFSET, HEAP_MAX_SIZE),
            mmio: VirtRegion::new(rb + MMIO_OFFSET, MMIO_MAX_SIZE),
            kernel_image: VirtRegion::new(
                VirtAddr::new_truncate(KERNEL_IMAGE_BASE),
                KERNEL_IMAGE_MAX_SIZE,
            ),
        }
    }

    /// Returns true if `addr` is in the kernel (upper) half.
    #[inline]
    pub fn is_kernel_half(addr: VirtAddr) -> bool {
        addr.as_u64() >= KERNEL_HALF_BASE
    }

    /// Identifies which region contains `addr`.
    pub fn identify_region(&self, addr: VirtAddr) -> FaultRegion {
        if !Self::is_kernel_half(addr) {
            FaultRegion::UserSpace
        } else if self.heap.contains(addr) {
            FaultRegion::Heap
        } else if self.mmio.contains(addr) {
            FaultRegion::Mmio
        } else if self.kernel_image.contains(addr) {
            FaultRegion::KernelImage
        } else if addr.as_u64() >= self.hhdm_base.as_u64()
            && addr.as_u64() < self.hhdm_base.as_u64() + self.hhdm_size
        {
            FaultRegion::Hhdm
        } else {
            FaultRegion::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> MemoryLayout {
        MemoryLayout::new(0xFFFF_8000_0000_0000, 0x1_0000_0000)
    }

    #[test]
    fn virt_region_bounds() {
        let region = VirtRegion::new(VirtAddr::new(0x1000), 0x2000);
        assert!(region.contains(VirtAddr::new(0x1000)));
        assert!(region.contains(VirtAddr::new(0x2FFF)));
        assert!(!region.contains(VirtAddr::new(0x3000)));
        assert!(!region.contains(VirtAddr::new(0x0FFF)));
    }

    #[test]
    fn regions_non_overlapping() {
        let layout = layout();
        assert!(
            layout.heap.end().as_u64() <= layout.mmio.base().as_u64(),
            "heap must end before the MMIO aperture"
        );
        assert!(
            layout.mmio.end().as_u64() <= layout.kernel_image.base().as_u64(),
            "MMIO aperture must end before the kernel image"
        );
    }

    #[test]
    fn identify_heap() {
        let layout = layout();
        let addr = layout.heap.base() + 0x1000;
        assert_eq!(layout.identify_region(addr), FaultRegion::Heap);
    }

    #[test]
    fn identify_mmio() {
        let layout = layout();
        let addr = layout.mmio.base() + 0x1000;
        assert_eq!(layout.identify_region(addr), FaultRegion::Mmio);
    }

    #[test]
    fn identify_kernel_image() {
        let layout = layout();
        let addr = VirtAddr::new_truncate(KERNEL_IMAGE_BASE + 0x1000);
        assert_eq!(layout.identify_region(addr), FaultRegion::KernelImage);
    }

    #[test]
    fn identify_hhdm() {
        let layout = layout();
        let addr = VirtAddr::new_truncate(0xFFFF_8000_0000_1000);
        assert_eq!(layout.identify_region(addr), FaultRegion::Hhdm);
    }

    #[test]
    fn identify_user_space() {
        let layout = layout();
        assert_eq!(
            layout.identify_region(VirtAddr::new(0x40_0000)),
            FaultRegion::UserSpace
        );
    }

    #[test]
    fn kernel_half_split() {
        assert!(!MemoryLayout::is_kernel_half(VirtAddr::new(
            0x0000_7FFF_FFFF_F000
        )));
        assert!(MemoryLayout::is_kernel_half(VirtAddr::new_truncate(
            KERNEL_HALF_BASE
        )));
    }
}
