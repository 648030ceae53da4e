//! Memory-mapping protection and flag bits.

pub const PROT_NONE: u32 = 0;
pub const PROT_READ: u32 = 1 << 0;
pub const PROT_WRITE: u32 = 1 << 1;
pub const PROT_EXEC: u32 = 1 << 2;

pub const MAP_ANONYMOUS: u32 = 1 << 0;
/// Commit backing pages eagerly instead of on first touch.
pub const MAP_POPULATE: u32 = 1 << 1;
/// Reserve address space without committing anything.
pub const MAP_NOCOMMIT: u32 = 1 << 2;
/// Bind the mapping to the physical range passed in `phys`; for drivers.
pub const MAP_PHYSICAL: u32 = 1 << 3;
/// The range must lie entirely in the user half of the address space.
pub const MAP_USER: u32 = 1 << 4;

pub const MADV_NORMAL: u32 = 0;
pub const MADV_WILLNEED: u32 = 1;
pub const MADV_DONTNEED: u32 = 2;

pub const MS_ASYNC: u32 = 1 << 0;
pub const MS_SYNC: u32 = 1 << 1;
pub const MS_INVALIDATE: u32 = 1 << 2;
