//! The boundary to the machine's MMU.
//!
//! Page-table formats and the kernel's address-space layout are the
//! platform's business; this module only defines the operations the core
//! needs from it. The platform installs a [`PagingOps`] at boot, the host
//! tests install an arena-backed one.

use bitflags::bitflags;
use spin::Once;
use thiserror::Error;

use super::{PhysAddr, VirtAddr, frame_allocator::Frame};

pub const PAGE_SIZE: usize = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const WRITE = 1 << 0;
        const EXEC = 1 << 1;
        const USER = 1 << 2;
        /// Strongly uncacheable; MMIO and DMA descriptors.
        const DEVICE_UNCACHEABLE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapToError {
    #[error("frame allocation failed")]
    FrameAllocationFailed,
    #[error("address space exhausted")]
    OutOfVirtualSpace,
}

/// MMU operations the core calls out to.
///
/// Implementations must be safe to call from any thread; `map_page` and
/// `unmap_page` are never called from interrupt context.
pub trait PagingOps: Sync {
    /// Reserve `pages` pages of kernel address space. The span is reserved
    /// but unbacked; faults on it are the caller's to handle.
    fn reserve_span(&self, pages: usize) -> Option<VirtAddr>;

    /// Return a span obtained from [`Self::reserve_span`]. Any still-mapped
    /// pages in it are unmapped first by the caller.
    fn release_span(&self, base: VirtAddr, pages: usize);

    /// Back the page holding `page` with `frame`.
    fn map_page(&self, page: VirtAddr, frame: Frame, flags: EntryFlags) -> Result<(), MapToError>;

    /// Remove the backing of `page`. The frame is not freed.
    fn unmap_page(&self, page: VirtAddr);

    /// Change the permissions of `pages` mapped pages starting at `base`.
    fn protect(&self, base: VirtAddr, pages: usize, flags: EntryFlags);

    /// Resolve a virtual address to the physical address backing it.
    fn translate(&self, addr: VirtAddr) -> Option<PhysAddr>;
}

static PAGING: Once<&'static dyn PagingOps> = Once::new();

pub fn init(ops: &'static dyn PagingOps) {
    PAGING.call_once(|| ops);
}

pub fn ops() -> &'static dyn PagingOps {
    *PAGING
        .get()
        .expect("memory::paging used before the platform installed PagingOps")
}

/// Resolve the physical address a pointer currently maps to. Used by the
/// futex table so that every alias of a shared page lands in one queue.
pub fn virt_to_phys(addr: VirtAddr) -> Option<PhysAddr> {
    ops().translate(addr)
}
