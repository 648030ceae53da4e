//! Device, endpoint and input contexts.
//!
//! Contexts are 32 or 64 bytes wide depending on the controller's CSZ
//! capability bit. Only the first 16 (slot) or 20 (endpoint) bytes carry
//! data, so the two widths share one field layout and differ in padding;
//! the const-generic structures below encode that, and [`DeviceContext`] /
//! [`InputContext`] pick the stride once at allocation. Every accessor
//! goes through them: handing a 32-byte view of a 64-byte context (or the
//! reverse) would corrupt the neighbors, so the stride never leaks out.

use core::mem::offset_of;

use bitfield_struct::bitfield;

use crate::{PhysAddr, memory::dma::DmaBuffer};

use super::{XhciError, regs::PortSpeed};

#[bitfield(u32)]
pub struct SlotCtxDword0 {
    /// Hub route: four bits per tier, root port first.
    #[bits(20)]
    pub route_string: u32,
    #[bits(4)]
    pub speed: PortSpeed,
    #[bits(1)]
    __: (),
    /// Multi-TT hub, or device behind one.
    pub mtt: bool,
    pub is_hub: bool,
    /// Index of the last valid endpoint context.
    #[bits(5)]
    pub context_entries: u8,
}

#[bitfield(u32)]
pub struct SlotCtxDword1 {
    pub max_exit_latency: u16,
    /// 1-based root-hub port this device hangs off.
    pub root_hub_port: u8,
    /// Downstream port count when this is a hub.
    pub port_count: u8,
}

#[bitfield(u32)]
pub struct SlotCtxDword2 {
    pub parent_hub_slot: u8,
    pub parent_port: u8,
    /// TT think time of a high-speed hub.
    #[bits(2)]
    pub ttt: u8,
    #[bits(4)]
    __: (),
    #[bits(10)]
    pub interrupter_target: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    DisabledEnabled = 0,
    Default = 1,
    Addressed = 2,
    Configured = 3,
    Reserved = 4,
}

impl SlotState {
    pub const fn from_bits(bits: u8) -> Self {
        if bits < Self::Reserved as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::Reserved
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[bitfield(u32)]
pub struct SlotCtxDword3 {
    /// Address the controller assigned; output only.
    pub usb_device_address: u8,
    #[bits(19)]
    __: (),
    #[bits(5)]
    pub slot_state: SlotState,
}

/// Slot context: what applies to the device as a whole.
#[repr(C)]
pub struct SlotCtx<const PAD: usize> {
    pub dword0: SlotCtxDword0,
    pub dword1: SlotCtxDword1,
    pub dword2: SlotCtxDword2,
    pub dword3: SlotCtxDword3,
    __: [u8; PAD],
}

pub type SlotCtx32 = SlotCtx<{ 32 - 16 }>;
pub type SlotCtx64 = SlotCtx<{ 64 - 16 }>;

const _: () = assert!(size_of::<SlotCtx32>() == 32);
const _: () = assert!(size_of::<SlotCtx64>() == 64);
const _: () = assert!(offset_of!(SlotCtx64, dword3) == 0xC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    Disabled = 0,
    Running = 1,
    /// Stall detected; a Reset Endpoint command is required to leave.
    Halted = 2,
    Stopped = 3,
    Error = 4,
    Reserved = 5,
}

impl EndpointState {
    pub const fn from_bits(bits: u8) -> Self {
        if bits < Self::Reserved as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::Reserved
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    NotValid = 0,
    IsochOut = 1,
    BulkOut = 2,
    InterruptOut = 3,
    Control = 4,
    IsochIn = 5,
    BulkIn = 6,
    InterruptIn = 7,
}

impl EndpointType {
    pub const fn from_bits(bits: u8) -> Self {
        if bits <= Self::InterruptIn as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::NotValid
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

#[bitfield(u32)]
pub struct EndpointCtxDword0 {
    #[bits(3)]
    pub endpoint_state: EndpointState,
    #[bits(5)]
    __: (),
    #[bits(2)]
    pub mult: u8,
    #[bits(5)]
    pub max_primary_streams: u8,
    pub lsa: bool,
    /// Service interval, in 125 µs × 2^interval units.
    pub interval: u8,
    pub max_esit_payload_hi: u8,
}

#[bitfield(u32)]
pub struct EndpointCtxDword1 {
    #[bits(1)]
    __: (),
    /// Allowed consecutive bus errors before the endpoint halts.
    #[bits(2)]
    pub error_count: u8,
    #[bits(3)]
    pub endpoint_type: EndpointType,
    #[bits(1)]
    __: (),
    pub host_initiate_disable: bool,
    pub max_burst_size: u8,
    pub max_packet_size: u16,
}

#[bitfield(u64)]
pub struct EndpointCtxQword2 {
    /// Dequeue cycle state: the consumer cycle matching the TR dequeue
    /// pointer.
    #[bits(1)]
    pub dequeue_cycle_state: u8,
    #[bits(3)]
    __: (),
    /// TR dequeue pointer >> 4.
    #[bits(60)]
    pub tr_dequeue: u64,
}

impl EndpointCtxQword2 {
    pub fn with_ring(dequeue: PhysAddr, cycle: u8) -> Self {
        Self::new()
            .with_dequeue_cycle_state(cycle)
            .with_tr_dequeue(dequeue.into_raw() as u64 >> 4)
    }
}

/// Endpoint context: one logical pipe of a device.
#[repr(C)]
pub struct EndpointCtx<const PAD: usize> {
    pub dword0: EndpointCtxDword0,
    pub dword1: EndpointCtxDword1,
    pub qword2: EndpointCtxQword2,
    pub average_trb_length: u16,
    pub max_esit_payload_lo: u16,
    __: [u8; PAD],
}

pub type EndpointCtx32 = EndpointCtx<{ 32 - 20 }>;
pub type EndpointCtx64 = EndpointCtx<{ 64 - 20 }>;

const _: () = assert!(size_of::<EndpointCtx32>() == 32);
const _: () = assert!(size_of::<EndpointCtx64>() == 64);
const _: () = assert!(offset_of!(EndpointCtx64, qword2) == 0x8);

/// A whole device context: the slot context plus up to 31 endpoints,
/// endpoint 0 (the default control pipe) first.
#[repr(C)]
pub struct DeviceCtx<const SLOT_PAD: usize, const EP_PAD: usize> {
    pub slot: SlotCtx<SLOT_PAD>,
    pub endpoints: [EndpointCtx<EP_PAD>; 31],
}

pub type DeviceCtx32 = DeviceCtx<{ 32 - 16 }, { 32 - 20 }>;
pub type DeviceCtx64 = DeviceCtx<{ 64 - 16 }, { 64 - 20 }>;

const _: () = assert!(size_of::<DeviceCtx32>() == 1024);
const _: () = assert!(size_of::<DeviceCtx64>() == 2048);

/// The input-control header in front of an input context: which contexts
/// the next Configure/Evaluate command drops and installs.
#[repr(C)]
pub struct InputControlCtx<const PAD: usize> {
    pub drop_flags: u32,
    pub add_flags: u32,
    __: [u8; PAD],
}

pub type InputControlCtx32 = InputControlCtx<{ 32 - 8 }>;
pub type InputControlCtx64 = InputControlCtx<{ 64 - 8 }>;

#[repr(C)]
pub struct InputCtx<const CTL_PAD: usize, const SLOT_PAD: usize, const EP_PAD: usize> {
    pub control: InputControlCtx<CTL_PAD>,
    pub device: DeviceCtx<SLOT_PAD, EP_PAD>,
}

pub type InputCtx32 = InputCtx<{ 32 - 8 }, { 32 - 16 }, { 32 - 20 }>;
pub type InputCtx64 = InputCtx<{ 64 - 8 }, { 64 - 16 }, { 64 - 20 }>;

const _: () = assert!(size_of::<InputCtx32>() == 32 + 1024);
const _: () = assert!(size_of::<InputCtx64>() == 64 + 2048);

/// Device context index of an endpoint: the control pipe is 1, then
/// `2n` for OUT and `2n + 1` for IN. Doorbell targets use the same value.
pub const fn endpoint_dci(endpoint_number: u8, dir_in: bool) -> u8 {
    if endpoint_number == 0 {
        1
    } else {
        endpoint_number * 2 + dir_in as u8
    }
}

macro_rules! stride_container {
    ($name: ident, $t32: ty, $t64: ty, $doc: literal) => {
        #[doc = $doc]
        pub enum $name {
            Small(DmaBuffer<$t32>),
            Large(DmaBuffer<$t64>),
        }

        impl $name {
            pub fn alloc(csz_64: bool) -> Result<Self, XhciError> {
                if csz_64 {
                    DmaBuffer::alloc(1).map(Self::Large).ok_or(XhciError::OutOfMemory)
                } else {
                    DmaBuffer::alloc(1).map(Self::Small).ok_or(XhciError::OutOfMemory)
                }
            }

            pub fn phys_addr(&self) -> PhysAddr {
                match self {
                    Self::Small(buf) => buf.phys_addr(),
                    Self::Large(buf) => buf.phys_addr(),
                }
            }

            pub const fn is_large_stride(&self) -> bool {
                matches!(self, Self::Large(_))
            }
        }
    };
}

stride_container!(
    DeviceContext,
    DeviceCtx32,
    DeviceCtx64,
    "An output device context, stride-selected at allocation per the controller's CSZ bit."
);

stride_container!(
    InputContext,
    InputCtx32,
    InputCtx64,
    "An input context (control header + device context), stride-selected at allocation."
);

impl DeviceContext {
    /// The data prefix of both strides is identical, so accessors yield the
    /// 32-byte view after stride-correct placement.
    pub fn slot(&self) -> *mut SlotCtx32 {
        match self {
            Self::Small(buf) => unsafe { &raw mut (*buf.as_ptr()).slot },
            Self::Large(buf) => unsafe { (&raw mut (*buf.as_ptr()).slot).cast() },
        }
    }

    /// Endpoint context by DCI (1..=31).
    pub fn endpoint(&self, dci: u8) -> *mut EndpointCtx32 {
        assert!((1..=31).contains(&dci), "endpoint DCI {dci} out of range");
        let index = dci as usize - 1;
        match self {
            Self::Small(buf) => unsafe { &raw mut (*buf.as_ptr()).endpoints[index] },
            Self::Large(buf) => unsafe { (&raw mut (*buf.as_ptr()).endpoints[index]).cast() },
        }
    }
}

impl InputContext {
    pub fn control(&self) -> *mut InputControlCtx32 {
        match self {
            Self::Small(buf) => unsafe { &raw mut (*buf.as_ptr()).control },
            Self::Large(buf) => unsafe { (&raw mut (*buf.as_ptr()).control).cast() },
        }
    }

    pub fn slot(&self) -> *mut SlotCtx32 {
        match self {
            Self::Small(buf) => unsafe { &raw mut (*buf.as_ptr()).device.slot },
            Self::Large(buf) => unsafe { (&raw mut (*buf.as_ptr()).device.slot).cast() },
        }
    }

    /// Endpoint context by DCI (1..=31).
    pub fn endpoint(&self, dci: u8) -> *mut EndpointCtx32 {
        assert!((1..=31).contains(&dci), "endpoint DCI {dci} out of range");
        let index = dci as usize - 1;
        match self {
            Self::Small(buf) => unsafe { &raw mut (*buf.as_ptr()).device.endpoints[index] },
            Self::Large(buf) => unsafe {
                (&raw mut (*buf.as_ptr()).device.endpoints[index]).cast()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn dci_math() {
        assert_eq!(endpoint_dci(0, false), 1);
        assert_eq!(endpoint_dci(1, false), 2);
        assert_eq!(endpoint_dci(1, true), 3);
        assert_eq!(endpoint_dci(15, true), 31);
    }

    #[test]
    fn stride_puts_endpoints_at_the_right_offsets() {
        test_support::init();

        for csz_64 in [false, true] {
            let ctx = InputContext::alloc(csz_64).unwrap();
            let stride = if csz_64 { 64usize } else { 32 };
            let base = ctx.phys_addr().into_raw();

            assert_eq!(ctx.control() as usize, base);
            assert_eq!(ctx.slot() as usize, base + stride);
            // DCI 1 (control pipe) is the second context after the slot.
            assert_eq!(ctx.endpoint(1) as usize, base + 2 * stride);
            assert_eq!(ctx.endpoint(5) as usize, base + 6 * stride);
        }
    }

    #[test]
    fn tr_dequeue_packs_to_16_byte_granularity() {
        let qword = EndpointCtxQword2::with_ring(crate::PhysAddr::from(0xAB_CDE0), 1);
        assert_eq!(qword.dequeue_cycle_state(), 1);
        assert_eq!(qword.tr_dequeue() << 4, 0xAB_CDE0);
    }
}
