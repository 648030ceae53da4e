//! Per-slot device state.
//!
//! A slot is the controller's handle for one attached device: an output
//! context the hardware writes and an input context we stage configuration
//! in. Transfer rings are owned by the controller's endpoint table; the
//! staging methods here only record a ring's dequeue state into the
//! contexts being built.

use alloc::vec::Vec;

use crate::{debug, read_ref, write_ref};

use super::{
    XhciError,
    context::{
        DeviceContext, EndpointCtxDword0, EndpointCtxDword1, EndpointCtxQword2, EndpointType,
        InputContext, SlotCtx32, SlotCtxDword0, SlotCtxDword1, SlotCtxDword2, endpoint_dci,
    },
    regs::PortSpeed,
    ring::TrbRing,
    usb::UsbEndpointDescriptor,
};

/// Ring size for every endpoint ring we allocate, command ring included.
pub const TRANSFER_RING_TRBS: usize = 256;

/// Lifecycle of a device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLifecycle {
    /// Enabled, address pending.
    Starting,
    Addressed,
    Configured,
    /// Device gone; slot awaiting disable.
    Exited,
}

/// What the controller-wide slot table remembers about a slot.
#[derive(Debug, Clone)]
pub struct SlotRecord {
    /// Slot of the hub above us, 0 when on a root port.
    pub parent_slot: u8,
    /// Root-hub port index the device hangs off (through any hubs).
    pub root_port: u8,
    pub route: u32,
    pub is_hub: bool,
    pub is_multi_tt: bool,
    pub state: SlotLifecycle,
}

/// Appends a child port to a route string at the next four-bit tier.
/// Ports past 15 saturate, per the route-string encoding.
pub fn route_append(route: u32, child_port: u8) -> u32 {
    let mut shift = 0;
    while shift < 20 && (route >> shift) & 0xF != 0 {
        shift += 4;
    }
    if shift >= 20 {
        return route;
    }
    route | ((child_port.min(15) as u32) << shift)
}

/// One attached device: its contexts and the endpoint descriptors staged
/// for configuration.
pub struct UsbDevice {
    slot_id: u8,
    port_index: u8,
    route: u32,
    speed: PortSpeed,

    input_ctx: InputContext,
    device_ctx: DeviceContext,

    endpoint_descs: Vec<UsbEndpointDescriptor>,
}

impl UsbDevice {
    pub fn create(
        csz_64: bool,
        slot_id: u8,
        port_index: u8,
        route: u32,
        speed: PortSpeed,
    ) -> Result<Self, XhciError> {
        Ok(Self {
            slot_id,
            port_index,
            route,
            speed,
            input_ctx: InputContext::alloc(csz_64)?,
            device_ctx: DeviceContext::alloc(csz_64)?,
            endpoint_descs: Vec::new(),
        })
    }

    pub const fn slot_id(&self) -> u8 {
        self.slot_id
    }

    /// 1-based port number, as contexts want it.
    pub const fn port_id(&self) -> u8 {
        self.port_index + 1
    }

    pub const fn route(&self) -> u32 {
        self.route
    }

    pub const fn speed(&self) -> PortSpeed {
        self.speed
    }

    pub fn input_ctx_phys(&self) -> crate::PhysAddr {
        self.input_ctx.phys_addr()
    }

    pub fn device_ctx_phys(&self) -> crate::PhysAddr {
        self.device_ctx.phys_addr()
    }

    pub fn endpoint_descriptors(&self) -> &[UsbEndpointDescriptor] {
        &self.endpoint_descs
    }

    /// Stages the input context for the initial Address Device command:
    /// slot context plus the default control endpoint riding
    /// `control_ring`.
    pub fn stage_address(
        &mut self,
        parent_slot: u8,
        parent_port: u8,
        max_packet: u16,
        control_ring: &TrbRing,
    ) {
        let control = self.input_ctx.control();
        let slot = self.input_ctx.slot();
        let ep0 = self.input_ctx.endpoint(1);

        unsafe {
            // Install slot context and endpoint 0.
            write_ref!((*control).add_flags, 0b11);
            write_ref!((*control).drop_flags, 0);

            write_ref!(
                (*slot).dword0,
                SlotCtxDword0::new()
                    .with_route_string(self.route)
                    .with_speed(self.speed)
                    .with_context_entries(1)
            );
            write_ref!(
                (*slot).dword1,
                SlotCtxDword1::new().with_root_hub_port(self.port_id())
            );
            write_ref!(
                (*slot).dword2,
                SlotCtxDword2::new()
                    .with_parent_hub_slot(parent_slot)
                    .with_parent_port(parent_port)
                    .with_interrupter_target(0)
            );

            write_ref!(
                (*ep0).dword1,
                EndpointCtxDword1::new()
                    .with_endpoint_type(EndpointType::Control)
                    .with_error_count(3)
                    .with_max_packet_size(max_packet)
            );
            write_ref!(
                (*ep0).qword2,
                EndpointCtxQword2::with_ring(control_ring.enqueue_phys(), control_ring.cycle())
            );
            write_ref!((*ep0).average_trb_length, 8u16);
        }

        debug!(
            UsbDevice,
            "slot {} staged for addressing: port {}, route {:#07x}, mps {max_packet}",
            self.slot_id,
            self.port_id(),
            self.route
        );
    }

    /// Stages an Evaluate Context that fixes endpoint 0's max packet size
    /// after the first 8 bytes of the device descriptor reveal it.
    pub fn stage_max_packet_update(&mut self, max_packet: u16) {
        let control = self.input_ctx.control();
        let ep0 = self.input_ctx.endpoint(1);
        unsafe {
            write_ref!((*control).add_flags, 1 << 1);
            write_ref!((*control).drop_flags, 0);

            let dword1 = read_ref!((*ep0).dword1).with_max_packet_size(max_packet);
            write_ref!((*ep0).dword1, dword1);
        }
    }

    /// Stages a hub's slot-context update: hub flag, multi-TT, downstream
    /// port count.
    pub fn stage_hub_fields(&mut self, port_count: u8, multi_tt: bool, ttt: u8) {
        let control = self.input_ctx.control();
        let slot = self.input_ctx.slot();
        unsafe {
            write_ref!((*control).add_flags, 1 << 0);
            write_ref!((*control).drop_flags, 0);

            let dword0 = read_dword0(slot).with_is_hub(true).with_mtt(multi_tt);
            write_ref!((*slot).dword0, dword0);

            let dword1 = read_ref!((*slot).dword1).with_port_count(port_count);
            write_ref!((*slot).dword1, dword1);

            let dword2 = read_ref!((*slot).dword2).with_ttt(ttt);
            write_ref!((*slot).dword2, dword2);
        }
    }

    /// Stages `desc`'s endpoint context for the next Configure Endpoint
    /// command, riding `ring`. Returns the endpoint's DCI.
    pub fn stage_endpoint(
        &mut self,
        desc: UsbEndpointDescriptor,
        ring: &TrbRing,
    ) -> Result<u8, XhciError> {
        let dci = endpoint_dci(desc.endpoint_number(), desc.is_in());

        let control = self.input_ctx.control();
        let slot = self.input_ctx.slot();
        let ep = self.input_ctx.endpoint(dci);

        unsafe {
            let add = read_ref!((*control).add_flags) | (1 << dci) | 1;
            write_ref!((*control).add_flags, add);
            write_ref!((*control).drop_flags, 0);

            let dword0 = read_dword0(slot);
            if dci > dword0.context_entries() {
                write_ref!((*slot).dword0, dword0.with_context_entries(dci));
            }

            // High-speed and better encode the interval exponent directly;
            // slower interrupt endpoints carry a frame count instead.
            let interval = match self.speed {
                PortSpeed::High | PortSpeed::Super | PortSpeed::SuperPlus => {
                    desc.b_interval.saturating_sub(1)
                }
                _ => (8 * desc.b_interval.max(1) as u32).ilog2() as u8,
            };

            write_ref!(
                (*ep).dword0,
                EndpointCtxDword0::new().with_interval(interval)
            );
            write_ref!(
                (*ep).dword1,
                EndpointCtxDword1::new()
                    .with_endpoint_type(desc.endpoint_type())
                    .with_error_count(3)
                    .with_max_packet_size(desc.max_packet_size)
            );
            write_ref!(
                (*ep).qword2,
                EndpointCtxQword2::with_ring(ring.enqueue_phys(), ring.cycle())
            );
            write_ref!((*ep).average_trb_length, desc.max_packet_size);
        }

        self.endpoint_descs.push(desc);
        Ok(dci)
    }
}

fn read_dword0(slot: *mut SlotCtx32) -> SlotCtxDword0 {
    unsafe { core::ptr::read_volatile(&raw const (*slot).dword0) }
}
