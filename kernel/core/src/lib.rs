//! Core types for the ALOS kernel.
//!
//! Provides the typed address layer ([`addr`]), page/frame abstractions
//! ([`paging`]), x86_64 page table structures ([`arch`]), spin-based
//! synchronization ([`sync`]) and the kernel logging facade ([`log`]).
//! Everything here is `no_std` and allocation-free so the crate is usable
//! from the earliest point of boot.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod addr;
pub mod arch;
pub mod log;
pub mod paging;
pub mod sync;
