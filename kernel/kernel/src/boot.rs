//! Boot contract.
//!
//! The loader (Multiboot or Limine) hands the kernel a physical memory map
//! and a higher-half direct-map offset. The bootloader-specific stub
//! translates its tables into this shape; everything downstream consumes
//! only this trait.

use alos_core::addr::PhysAddr;

pub use alos_mm::PhysMemoryRegion;

/// What the kernel needs to know from the boot loader.
///
/// The memory map must stay valid for the kernel's lifetime. Regions
/// covering the kernel image and loader-reserved ranges are reported with
/// `usable == false`; the PMM marks them permanently reserved.
pub trait BootInfo {
    /// The physical memory map.
    fn memory_map(&self) -> &[PhysMemoryRegion];

    /// Virtual offset of the higher-half direct map.
    fn hhdm_offset(&self) -> u64;

    /// Physical address of the page table root the loader installed.
    fn page_table_root(&self) -> PhysAddr;
}
