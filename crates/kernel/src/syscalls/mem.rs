//! The memory-mapping syscall family.
//!
//! Mappings live in kernel-tracked regions: a span of address space plus
//! the frames committed into it. Anonymous mappings are committed eagerly
//! unless `MAP_NOCOMMIT` asks for bare address space; `MAP_PHYSICAL` binds
//! the span to a caller-supplied physical range (drivers mapping BARs or
//! DMA windows) whose frames are never owned; `msync`/`madvise` reach
//! through to the mapped-device layer when the range is one of its
//! windows.

use alloc::vec::Vec;

use vesper_abi::{
    Errno,
    errno::SysResult,
    mem::{
        MADV_DONTNEED, MADV_NORMAL, MADV_WILLNEED, MAP_NOCOMMIT, MAP_PHYSICAL, MAP_USER,
        MS_SYNC, PROT_EXEC, PROT_WRITE,
    },
};

use crate::{
    PhysAddr, VirtAddr,
    memory::{
        frame_allocator::{self, Frame},
        mapped_device,
        paging::{self, EntryFlags, PAGE_SIZE},
    },
    utils::locks::RwLock,
};

/// Exclusive top of the user half of the address space.
pub const USER_SPACE_TOP: usize = 0x0000_8000_0000_0000;

#[derive(Debug)]
enum RegionKind {
    Anonymous,
    /// Bound to a fixed physical range; frames are not ours to free.
    Physical(PhysAddr),
    /// Reserved but uncommitted address space.
    Reserved,
}

#[derive(Debug)]
struct Region {
    base: VirtAddr,
    pages: usize,
    prot: u32,
    kind: RegionKind,
    frames: Vec<(VirtAddr, Frame)>,
}

impl Region {
    fn contains(&self, addr: VirtAddr, len: usize) -> bool {
        addr >= self.base && addr + len <= self.base + self.pages * PAGE_SIZE
    }
}

static REGIONS: RwLock<Vec<Region>> = RwLock::new(Vec::new());

fn prot_flags(prot: u32) -> EntryFlags {
    let mut flags = EntryFlags::empty();
    if prot & PROT_WRITE != 0 {
        flags |= EntryFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= EntryFlags::EXEC;
    }
    flags
}

fn validate_user_range(addr: usize, len: usize) -> Result<(), Errno> {
    if addr >= USER_SPACE_TOP || addr.saturating_add(len) > USER_SPACE_TOP {
        return Err(Errno::Inval);
    }
    Ok(())
}

/// `mmap(addr, len, prot, flags, phys)`.
///
/// The address argument is a hint only; it is validated (alignment, and
/// against the user half under `MAP_USER`) but placement comes from the
/// address-space reservation.
pub fn sys_mmap(addr: usize, len: usize, prot: u32, flags: u32, phys: usize) -> SysResult<usize> {
    if len == 0 || addr % PAGE_SIZE != 0 {
        return Err(Errno::Inval);
    }
    if flags & MAP_USER != 0 && addr != 0 {
        validate_user_range(addr, len)?;
    }

    let pages = len.div_ceil(PAGE_SIZE);

    if flags & MAP_PHYSICAL != 0 {
        if phys % PAGE_SIZE != 0 {
            return Err(Errno::Inval);
        }
        return map_physical(pages, prot, PhysAddr::from(phys));
    }

    let base = paging::ops().reserve_span(pages).ok_or(Errno::NoMem)?;

    let mut region = Region {
        base,
        pages,
        prot,
        kind: if flags & MAP_NOCOMMIT != 0 {
            RegionKind::Reserved
        } else {
            RegionKind::Anonymous
        },
        frames: Vec::new(),
    };

    if flags & MAP_NOCOMMIT == 0 {
        let flags = prot_flags(prot);
        for page in 0..pages {
            let va = base + page * PAGE_SIZE;
            let Some(frame) = frame_allocator::allocate_frame() else {
                release_region(&mut region);
                return Err(Errno::NoMem);
            };
            if paging::ops().map_page(va, frame, flags).is_err() {
                frame_allocator::deallocate_frame(frame);
                release_region(&mut region);
                return Err(Errno::NoMem);
            }
            region.frames.push((va, frame));
        }
    }

    REGIONS.write().push(region);
    Ok(base.into_raw())
}

fn map_physical(pages: usize, prot: u32, phys: PhysAddr) -> SysResult<usize> {
    let base = paging::ops().reserve_span(pages).ok_or(Errno::NoMem)?;
    let flags = prot_flags(prot) | EntryFlags::DEVICE_UNCACHEABLE;

    let mut region = Region {
        base,
        pages,
        prot,
        kind: RegionKind::Physical(phys),
        frames: Vec::new(),
    };

    for page in 0..pages {
        let va = base + page * PAGE_SIZE;
        let frame = Frame::containing_address(phys + page * PAGE_SIZE);
        if paging::ops().map_page(va, frame, flags).is_err() {
            release_region(&mut region);
            return Err(Errno::NoMem);
        }
        // Mapped pages are unmapped on munmap; the frames stay the
        // device's.
        region.frames.push((va, frame));
    }

    REGIONS.write().push(region);
    Ok(base.into_raw())
}

fn release_region(region: &mut Region) {
    let owns_frames = matches!(region.kind, RegionKind::Anonymous);
    for (va, frame) in region.frames.drain(..) {
        paging::ops().unmap_page(va);
        if owns_frames {
            frame_allocator::deallocate_frame(frame);
        }
    }
    paging::ops().release_span(region.base, region.pages);
}

/// `munmap(addr, len)`: the range must be exactly one mapped region.
pub fn sys_munmap(addr: usize, len: usize) -> SysResult<usize> {
    if addr % PAGE_SIZE != 0 || len == 0 {
        return Err(Errno::Inval);
    }

    let mut regions = REGIONS.write();
    let index = regions
        .iter()
        .position(|r| r.base.into_raw() == addr && len.div_ceil(PAGE_SIZE) == r.pages)
        .ok_or(Errno::Inval)?;

    let mut region = regions.swap_remove(index);
    drop(regions);

    release_region(&mut region);
    Ok(0)
}

/// `mprotect(addr, len, prot)` over a mapped region (or part of one).
pub fn sys_mprotect(addr: usize, len: usize, prot: u32) -> SysResult<usize> {
    if addr % PAGE_SIZE != 0 || len == 0 {
        return Err(Errno::Inval);
    }
    let addr = VirtAddr::from(addr);

    let mut regions = REGIONS.write();
    let region = regions
        .iter_mut()
        .find(|r| r.contains(addr, len))
        .ok_or(Errno::NoMem)?;

    paging::ops().protect(addr, len.div_ceil(PAGE_SIZE), prot_flags(prot));
    if addr == region.base && len.div_ceil(PAGE_SIZE) == region.pages {
        region.prot = prot;
    }
    Ok(0)
}

/// `msync(addr, len, flags)`: meaningful for mapped-device windows, where
/// it pushes dirty blocks back through the driver.
pub fn sys_msync(addr: usize, len: usize, flags: u32) -> SysResult<usize> {
    if addr % PAGE_SIZE != 0 {
        return Err(Errno::Inval);
    }
    let va = VirtAddr::from(addr);

    if mapped_device::covers(va) {
        mapped_device::msync(va, len, flags & MS_SYNC != 0)?;
        return Ok(0);
    }

    let regions = REGIONS.read();
    regions
        .iter()
        .find(|r| r.contains(va, len))
        .ok_or(Errno::NoMem)?;
    // Anonymous memory has no backing store to sync.
    Ok(0)
}

/// `madvise(addr, len, advice)`. `WILLNEED` pre-faults device-window
/// blocks; everything else is advisory.
pub fn sys_madvise(addr: usize, len: usize, advice: u32) -> SysResult<usize> {
    let va = VirtAddr::from(addr);

    match advice {
        MADV_WILLNEED => {
            if mapped_device::covers(va) {
                let mut off = 0;
                while off < len {
                    mapped_device::handle_fault(va + off, false).map_err(Errno::from)?;
                    off += PAGE_SIZE;
                }
            }
            Ok(0)
        }
        MADV_NORMAL | MADV_DONTNEED => Ok(0),
        _ => Err(Errno::Inval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use alloc::sync::Arc;
    use vesper_abi::mem::{MAP_ANONYMOUS, MAP_POPULATE, PROT_READ};

    #[test]
    fn anonymous_mapping_round_trip() {
        test_support::init();

        let base = sys_mmap(
            0,
            3 * PAGE_SIZE,
            PROT_READ | PROT_WRITE,
            MAP_ANONYMOUS | MAP_POPULATE,
            0,
        )
        .unwrap();

        unsafe {
            let ptr = base as *mut u8;
            ptr.write_bytes(0x5A, 3 * PAGE_SIZE);
            assert_eq!(ptr.add(2 * PAGE_SIZE + 7).read(), 0x5A);
        }

        assert_eq!(sys_mprotect(base, PAGE_SIZE, PROT_READ), Ok(0));
        assert_eq!(sys_msync(base, PAGE_SIZE, 0), Ok(0));
        assert_eq!(sys_munmap(base, 3 * PAGE_SIZE), Ok(0));
        // A second unmap no longer finds the region.
        assert_eq!(sys_munmap(base, 3 * PAGE_SIZE), Err(Errno::Inval));
    }

    #[test]
    fn argument_validation() {
        test_support::init();

        assert_eq!(sys_mmap(0, 0, 0, 0, 0), Err(Errno::Inval));
        assert_eq!(sys_mmap(123, PAGE_SIZE, 0, 0, 0), Err(Errno::Inval));
        // A kernel-half hint is rejected under MAP_USER.
        assert_eq!(
            sys_mmap(0xFFFF_8000_0000_0000, PAGE_SIZE, 0, MAP_USER, 0),
            Err(Errno::Inval)
        );
        assert_eq!(sys_mmap(0, PAGE_SIZE, 0, MAP_PHYSICAL, 0x123), Err(Errno::Inval));
        assert_eq!(sys_madvise(0, PAGE_SIZE, 0x99), Err(Errno::Inval));
        assert_eq!(sys_msync(0x1000, PAGE_SIZE, 0), Err(Errno::NoMem));
    }

    #[test]
    fn physical_mapping_does_not_own_its_frames() {
        test_support::init();

        let frame = frame_allocator::allocate_frame().unwrap();
        unsafe {
            frame.virt_addr().into_ptr::<u64>().write(0xFEED_FACE);
        }

        let base = sys_mmap(
            0,
            PAGE_SIZE,
            PROT_READ | PROT_WRITE,
            MAP_PHYSICAL,
            frame.start_address().into_raw(),
        )
        .unwrap();
        assert_eq!(sys_munmap(base, PAGE_SIZE), Ok(0));

        // The bound frame stayed ours: its contents survived the unmap and
        // it was never handed back to the allocator.
        let value = unsafe { frame.virt_addr().into_ptr::<u64>().read() };
        assert_eq!(value, 0xFEED_FACE);
        frame_allocator::deallocate_frame(frame);
    }

    #[test]
    fn msync_reaches_device_windows() {
        test_support::init();

        struct CountingBacking(core::sync::atomic::AtomicUsize);
        impl mapped_device::DeviceBacking for CountingBacking {
            fn fault(
                &self,
                _addr: VirtAddr,
                _offset: u64,
                _len: usize,
                is_read: bool,
                _flush: bool,
            ) -> Result<(), Errno> {
                if !is_read {
                    self.0.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
                }
                Ok(())
            }
        }

        let backing = Arc::new(CountingBacking(core::sync::atomic::AtomicUsize::new(0)));
        let base = mapped_device::register_device(
            backing.clone(),
            PAGE_SIZE,
            4 * PAGE_SIZE,
            EntryFlags::WRITE,
        )
        .unwrap();

        // Pre-fault through madvise, dirty one block, sync through the
        // syscall surface.
        assert_eq!(
            sys_madvise(base.into_raw(), 2 * PAGE_SIZE, MADV_WILLNEED),
            Ok(0)
        );
        mapped_device::handle_fault(base, true).unwrap();
        assert_eq!(sys_msync(base.into_raw(), 4 * PAGE_SIZE, MS_SYNC), Ok(0));
        assert_eq!(backing.0.load(core::sync::atomic::Ordering::SeqCst), 1);

        mapped_device::unregister_device(base).unwrap();
    }
}
