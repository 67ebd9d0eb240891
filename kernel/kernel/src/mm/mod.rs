//! Global memory management wiring.

pub mod fault;
pub mod heap;
pub mod hhdm;
pub mod pmm;
pub mod space;
pub mod vmm;
