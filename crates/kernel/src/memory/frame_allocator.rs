//! Physical frame allocator.
//!
//! The platform feeds whole usable regions in at boot ([`add_region`]);
//! frames are handed out from an intrusive free list whose links live in
//! the free frames themselves (through the direct map), so the allocator
//! needs no storage of its own.

use core::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use crate::utils::locks::SpinLock;

use super::{AlignToPage, PhysAddr, VirtAddr, paging::PAGE_SIZE};

/// A pointer to data living in a physical frame, reachable through the
/// direct map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FramePtr<T: ?Sized>(*mut T);

impl<T: ?Sized> FramePtr<T> {
    /// # Safety
    /// `ptr` must point into direct-mapped frame memory owned by the caller.
    pub const unsafe fn from_ptr(ptr: *mut T) -> Self {
        Self(ptr)
    }

    pub fn phys_addr(&self) -> PhysAddr {
        VirtAddr::from_ptr(self.0 as *const u8).into_phys()
    }

    pub fn frame(&self) -> Frame {
        Frame::containing_address(self.phys_addr())
    }

    pub const fn as_ptr(&self) -> *mut T {
        self.0
    }
}

impl<T> Deref for FramePtr<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0 }
    }
}

impl<T> DerefMut for FramePtr<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.0 }
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame(PhysAddr);

impl Frame {
    #[inline(always)]
    pub fn containing_address(address: PhysAddr) -> Self {
        Self(address.to_previous_page())
    }

    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.0
    }

    #[inline(always)]
    pub fn virt_addr(&self) -> VirtAddr {
        self.0.into_virt()
    }

    #[inline(always)]
    pub const fn phys_addr(&self) -> PhysAddr {
        self.0
    }

    /// Views the frame as a `T`.
    /// # Safety
    /// The caller must own the frame and `T` must fit in a page.
    pub unsafe fn into_ptr<T>(self) -> FramePtr<T> {
        const { assert!(size_of::<T>() <= PAGE_SIZE) };
        FramePtr(self.virt_addr().into_ptr::<T>())
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Frame")
            .field(&format_args!("{:#x}", self.start_address()))
            .finish()
    }
}

/// A free frame, linked through its own first bytes.
struct FreeNode {
    next: Option<PhysAddr>,
}

struct FreeList {
    head: Option<PhysAddr>,
    free_frames: usize,
    allocations: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            free_frames: 0,
            allocations: 0,
        }
    }

    unsafe fn push(&mut self, frame: Frame) {
        let node = frame.virt_addr().into_ptr::<FreeNode>();
        unsafe {
            node.write(FreeNode { next: self.head });
        }
        self.head = Some(frame.start_address());
        self.free_frames += 1;
    }

    fn pop(&mut self) -> Option<Frame> {
        let head = self.head.take()?;
        let node = head.into_virt().into_ptr::<FreeNode>();
        self.head = unsafe { (*node).next };
        self.free_frames -= 1;
        self.allocations += 1;
        Some(Frame::containing_address(head))
    }
}

static FREE_LIST: SpinLock<FreeList> = SpinLock::new(FreeList::new());

/// Hand a physical region to the allocator. Partial pages at either end
/// are discarded.
///
/// # Safety
/// The region must be usable RAM, covered by the direct map, and never
/// handed in twice.
pub unsafe fn add_region(base: PhysAddr, size: usize) {
    let start = base.to_next_page();
    let end = (base + size).to_previous_page();

    let mut list = FREE_LIST.lock();
    let mut at = start;
    while at < end {
        unsafe {
            list.push(Frame::containing_address(at));
        }
        at += PAGE_SIZE;
    }
}

pub fn allocate_frame() -> Option<Frame> {
    FREE_LIST.lock().pop()
}

pub fn deallocate_frame(frame: Frame) {
    unsafe {
        FREE_LIST.lock().push(frame);
    }
}

pub fn free_frame_count() -> usize {
    FREE_LIST.lock().free_frames
}
