//! Global physical memory manager.

use alos_core::sync::SpinLock;
use alos_mm::pmm::BitmapAllocator;

use crate::boot::BootInfo;

/// Global physical memory manager.
static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

/// Initializes the PMM from the boot memory map.
///
/// # Panics
///
/// Panics if the PMM is already initialized or the memory map yields no
/// usable frames.
pub fn init(boot_info: &impl BootInfo) {
    // SAFETY: The boot contract guarantees an accurate memory map and HHDM
    // offset, and this runs once on the boot path.
    let allocator = unsafe { BitmapAllocator::new(boot_info.memory_map(), boot_info.hhdm_offset()) }
        .expect("PMM: failed to initialize");

    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Executes a closure with an exclusive reference to the global PMM.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn with<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Attempts to execute a closure with an exclusive reference to the global
/// PMM.
///
/// Returns `None` if the lock is already held (avoiding deadlock in fault
/// handlers) or if the PMM has not been initialized yet.
pub fn try_with<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> Option<R> {
    let mut pmm = PMM.try_lock()?;
    Some(f(pmm.as_mut()?))
}
