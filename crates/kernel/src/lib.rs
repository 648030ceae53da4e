//! The VesperOS kernel core.
//!
//! This crate carries the machine-independent heart of the kernel: the
//! memory primitives (frame allocator, DMA buffers, the demand-paged
//! mapped-device store), thread synchronization (wait queues, condition
//! variables, the futex table), the xHCI USB host-controller driver and the
//! ELF64 loadable-module loader, plus the syscall layer over them.
//!
//! Boot, page tables, the scheduler run queues and interrupt routing live
//! in the platform layer; it installs implementations of the hook traits
//! ([`memory::paging::PagingOps`], [`thread::SchedOps`], the [`logging`]
//! sink and the [`time`] source) before anything here runs. The unit tests
//! install host-backed hooks and exercise the same code paths.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod logging;
pub mod time;

pub mod memory;
pub mod utils;

pub mod thread;

pub mod drivers;
pub mod modules;
pub mod syscalls;

#[cfg(test)]
pub(crate) mod test_support;

pub use memory::PhysAddr;
pub use memory::VirtAddr;
