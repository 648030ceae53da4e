//! Demand-paged, file-backed device windows.
//!
//! A block-device driver registers a byte range and a fault callback and
//! receives a virtual window over the whole device. Filesystems then treat
//! a partition as a flat byte array; the first touch of a page lands in the
//! kernel fault handler, which routes here, commits backing pages and asks
//! the driver to fill them. Writes mark blocks dirty; [`msync`] pushes them
//! back through the same callback with `is_read = false`.

use alloc::{sync::Arc, vec::Vec};
use hashbrown::HashMap;
use thiserror::Error;
use vesper_abi::Errno;

use crate::{
    debug,
    utils::locks::{Mutex, RwLock},
};

use super::{
    VirtAddr,
    frame_allocator::{self, Frame},
    paging::{self, EntryFlags, PAGE_SIZE},
};

/// The driver side of a mapped device window.
pub trait DeviceBacking: Send + Sync {
    /// Populate (`is_read`) or write back `len` bytes at `addr`, covering
    /// `[offset, offset + len)` of the device. `offset` and `len` are
    /// always multiples of the registered block size. Must complete
    /// synchronously and must not touch the window itself.
    fn fault(
        &self,
        addr: VirtAddr,
        offset: u64,
        len: usize,
        is_read: bool,
        flush: bool,
    ) -> Result<(), Errno>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("address is not inside a mapped device window")]
    NotMapped,
    #[error("out of memory while committing backing pages")]
    OutOfMemory,
    #[error("device backing failed: {0:?}")]
    Backing(Errno),
}

impl From<FaultError> for Errno {
    fn from(value: FaultError) -> Self {
        match value {
            FaultError::NotMapped => Errno::Fault,
            FaultError::OutOfMemory => Errno::NoMem,
            FaultError::Backing(err) => err,
        }
    }
}

struct ChunkState {
    frames: Vec<Frame>,
    dirty: bool,
}

struct MappedRange {
    base: VirtAddr,
    len: usize,
    block_size: usize,
    /// Fault granularity: a whole number of pages and of blocks.
    chunk_size: usize,
    flags: EntryFlags,
    backing: Arc<dyn DeviceBacking>,
    chunks: Mutex<HashMap<usize, ChunkState>>,
}

impl MappedRange {
    fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    fn chunk_bounds(&self, index: usize) -> (VirtAddr, u64, usize) {
        let offset = index * self.chunk_size;
        let len = self.chunk_size.min(self.len - offset);
        (self.base + offset, offset as u64, len)
    }

    /// Commits and fills the chunk holding `addr` if absent, then applies
    /// dirty tracking for writes.
    fn fault_in(&self, addr: VirtAddr, is_write: bool) -> Result<(), FaultError> {
        let index = (addr - self.base) / self.chunk_size;
        let (chunk_va, offset, len) = self.chunk_bounds(index);

        let mut chunks = self.chunks.lock();
        if !chunks.contains_key(&index) {
            let mut frames = Vec::new();
            let pages = len.div_ceil(PAGE_SIZE);
            for page in 0..pages {
                let frame =
                    frame_allocator::allocate_frame().ok_or(FaultError::OutOfMemory)?;
                if let Err(err) =
                    paging::ops().map_page(chunk_va + page * PAGE_SIZE, frame, self.flags)
                {
                    debug!(MappedRange, "chunk commit failed: {err}");
                    frame_allocator::deallocate_frame(frame);
                    for (i, frame) in frames.drain(..).enumerate() {
                        paging::ops().unmap_page(chunk_va + i * PAGE_SIZE);
                        frame_allocator::deallocate_frame(frame);
                    }
                    return Err(FaultError::OutOfMemory);
                }
                frames.push(frame);
            }

            self.backing
                .fault(chunk_va, offset, len, true, false)
                .map_err(|err| {
                    for (i, frame) in frames.drain(..).enumerate() {
                        paging::ops().unmap_page(chunk_va + i * PAGE_SIZE);
                        frame_allocator::deallocate_frame(frame);
                    }
                    FaultError::Backing(err)
                })?;

            chunks.insert(index, ChunkState { frames, dirty: false });
        }

        if is_write {
            chunks.get_mut(&index).expect("chunk vanished").dirty = true;
        }

        Ok(())
    }

    /// Pushes dirty chunks intersecting `[start, start + len)` back to the
    /// device.
    fn writeback(&self, start: VirtAddr, len: usize, flush: bool) -> Result<(), FaultError> {
        let first = (start - self.base) / self.chunk_size;
        let last = (start - self.base + len - 1) / self.chunk_size;

        let mut chunks = self.chunks.lock();
        for index in first..=last {
            let Some(state) = chunks.get_mut(&index) else {
                continue;
            };
            if !state.dirty {
                continue;
            }

            let (chunk_va, offset, chunk_len) = self.chunk_bounds(index);
            self.backing
                .fault(chunk_va, offset, chunk_len, false, flush)
                .map_err(FaultError::Backing)?;
            state.dirty = false;
        }
        Ok(())
    }

    fn release(&self) {
        let mut chunks = self.chunks.lock();
        for (index, state) in chunks.drain() {
            let (chunk_va, _, _) = self.chunk_bounds(index);
            for (i, frame) in state.frames.into_iter().enumerate() {
                paging::ops().unmap_page(chunk_va + i * PAGE_SIZE);
                frame_allocator::deallocate_frame(frame);
            }
        }
    }
}

static RANGES: RwLock<Vec<Arc<MappedRange>>> = RwLock::new(Vec::new());

/// Registers a device window of `len` bytes whose pages are populated by
/// `backing`. Returns the window's base address.
///
/// `block_size` must be a power of two and divide `len`.
pub fn register_device(
    backing: Arc<dyn DeviceBacking>,
    block_size: usize,
    len: usize,
    flags: EntryFlags,
) -> Result<VirtAddr, Errno> {
    if !block_size.is_power_of_two() || len == 0 || len % block_size != 0 {
        return Err(Errno::Inval);
    }

    let pages = len.div_ceil(PAGE_SIZE);
    let base = paging::ops().reserve_span(pages).ok_or(Errno::NoMem)?;

    let range = Arc::new(MappedRange {
        base,
        len,
        block_size,
        chunk_size: block_size.max(PAGE_SIZE),
        flags,
        backing,
        chunks: Mutex::new(HashMap::new()),
    });

    debug!(
        MappedRange,
        "registered device window at {base:?}, {len:#x} bytes, block size {block_size:#x}"
    );

    RANGES.write().push(range);
    Ok(base)
}

/// Tears a window down: flushes dirty blocks, frees the committed pages and
/// releases the span.
pub fn unregister_device(base: VirtAddr) -> Result<(), Errno> {
    let range = {
        let mut ranges = RANGES.write();
        let pos = ranges
            .iter()
            .position(|r| r.base == base)
            .ok_or(Errno::Inval)?;
        ranges.swap_remove(pos)
    };

    range.writeback(range.base, range.len, true).map_err(Errno::from)?;
    range.release();
    paging::ops().release_span(range.base, range.len.div_ceil(PAGE_SIZE));
    Ok(())
}

fn find_range(addr: VirtAddr) -> Option<Arc<MappedRange>> {
    RANGES.read().iter().find(|r| r.contains(addr)).cloned()
}

/// Entry point for the page-fault handler: commit and populate the block
/// containing `addr`. Returns [`FaultError::NotMapped`] when the address
/// belongs to no window, so the caller can keep searching other backings.
pub fn handle_fault(addr: VirtAddr, is_write: bool) -> Result<(), FaultError> {
    let range = find_range(addr).ok_or(FaultError::NotMapped)?;
    range.fault_in(addr, is_write)
}

/// Write dirty blocks intersecting `[addr, addr + len)` back to the device.
/// `flush` additionally asks the driver to flush its own caches.
pub fn msync(addr: VirtAddr, len: usize, flush: bool) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let range = find_range(addr).ok_or(Errno::Inval)?;
    let len = len.min(range.base + range.len - addr);
    range.writeback(addr, len, flush).map_err(Errno::from)
}

/// Whether `addr` falls inside any registered window. Used by mmap to keep
/// anonymous mappings away from device windows.
pub fn covers(addr: VirtAddr) -> bool {
    find_range(addr).is_some()
}
