//! The stable surface shared between the VesperOS kernel and userspace:
//! errno values, the futex operation encoding, memory-mapping bits and the
//! loadable-module entry contract. Everything here is `repr`-stable and
//! allocation free.
#![no_std]

pub mod errno;
pub mod futex;
pub mod mem;
pub mod module;

pub use errno::Errno;
