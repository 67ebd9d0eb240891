//! Page fault policy.
//!
//! There is no demand paging and no swap: every fault is a bug or a bad
//! access. Faults in the kernel half and faults on unmapped user pages are
//! both fatal; the handler identifies the region for the log and halts.

use alos_core::arch::x86_64::paging::PageFaultErrorCode;
use alos_core::addr::VirtAddr;
use alos_core::kfatal;
use alos_mm::layout::FaultRegion;

/// Entry point called by the trap stub with the CPU's error code and the
/// faulting linear address (CR2).
pub fn handle_page_fault(error_code: PageFaultErrorCode, fault_addr: VirtAddr) -> ! {
    let region = super::vmm::with_vmm(|vmm| vmm.layout().identify_region(fault_addr));

    let access = if error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        "fetch"
    } else if error_code.contains(PageFaultErrorCode::WRITE) {
        "write"
    } else {
        "read"
    };
    let cause = if error_code.contains(PageFaultErrorCode::PRESENT) {
        "protection violation"
    } else {
        "page not present"
    };

    match region {
        FaultRegion::UserSpace => {
            kfatal!("page fault: {access} of unmapped user address {fault_addr} ({cause})");
        }
        region => {
            kfatal!("page fault: {access} at {fault_addr} in {region:?} ({cause})");
        }
    }

    panic!("unrecoverable page fault at {fault_addr}");
}
