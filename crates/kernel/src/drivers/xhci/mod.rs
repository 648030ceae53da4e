//! The xHCI USB host-controller driver.
//!
//! The controller and the driver share three kinds of memory: a command
//! ring and per-endpoint transfer rings the driver produces into, event
//! rings the controller produces into, and the context structures
//! describing each device slot. Submission parks the caller on an I/O
//! completion packet keyed (via the pending table) by the physical address
//! of the TRB it is waiting on; the IRQ bottom half pops events, resolves
//! them through that table and wakes the waiters.
//!
//! Locking: one command mutex guards the command ring, the pending table,
//! the endpoint rings and the slot table together. It is coarse, but xHCI
//! controllers are few and the hold times are short. Doorbells are rung
//! after the lock is dropped; the doorbell write is the publication point
//! and the device never observes a half-inserted TD. Event rings take only
//! their own spinlock: each interrupter is drained by exactly one CPU.

pub mod context;
pub mod device;
#[cfg(test)]
mod tests;
pub mod extended_caps;
pub mod iocp;
pub mod regs;
pub mod ring;
pub mod transfer;
pub mod trb;
pub mod usb;

use core::cell::UnsafeCell;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use hashbrown::HashMap;
use thiserror::Error;
use vesper_abi::Errno;

use crate::{
    PhysAddr, VirtAddr, debug,
    drivers::interrupts::{self, InterruptReceiver, IrqBinding},
    error,
    memory::paging::MapToError,
    read_ref,
    thread::{self, work_queue},
    utils::{locks::Mutex, locks::SpinLock, phys_map::PhysMap},
    warn, write_ref,
};

use context::endpoint_dci;
use device::{SlotLifecycle, SlotRecord, TRANSFER_RING_TRBS, UsbDevice, route_append};
use iocp::{Iocp, IocpResult};
use regs::{CapsRegs, Doorbells, Iman, PortSpeed, UsbSts, XhciRegisters};
use ring::{EventRing, TrbRing};
use trb::{
    CompletionCode, DeviceRequestPacket, EventTrb, PacketRecipient, PacketType,
    SlottedCommandTrb, Trb,
};
use transfer::Direction;
use usb::{
    DescriptorWalker, REQUEST_GET_DESCRIPTOR, REQUEST_SET_CONFIGURATION, USB_DESCRIPTOR_BOS,
    USB_DESCRIPTOR_CONFIGURATION, USB_DESCRIPTOR_DEVICE, USB_DESCRIPTOR_HUB, UsbBosDescriptor,
    UsbConfigurationDescriptor, UsbDeviceDescriptor, UsbEndpointDescriptor, UsbHubDescriptor,
};

/// TRBs in the command ring.
pub const MAX_TRB_COUNT: usize = 256;
/// TRBs per event ring; one page.
const EVENT_RING_TRBS: usize = 256;

const COMMAND_TIMEOUT_MS: u64 = 1000;
const TRANSFER_TIMEOUT_MS: u64 = 5000;
/// Configuration descriptors are fetched in one go up to this size.
const CONFIG_DESCRIPTOR_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum XhciError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("initialization timeout waiting for {0}")]
    InitTimeout(&'static str),
    #[error("no response from controller")]
    NoResponse,
    #[error("command failed: {0:?}")]
    Command(CompletionCode),
    #[error("transfer failed: {0:?}")]
    Transfer(CompletionCode),
    #[error("buffer is not mapped")]
    BadBuffer,
    #[error("no such endpoint")]
    UnknownEndpoint,
    #[error("no such slot")]
    UnknownSlot,
    #[error("malformed descriptor")]
    BadDescriptor,
}

impl From<MapToError> for XhciError {
    fn from(_: MapToError) -> Self {
        Self::OutOfMemory
    }
}

impl From<XhciError> for Errno {
    fn from(value: XhciError) -> Self {
        match value {
            XhciError::OutOfMemory => Errno::NoMem,
            XhciError::InitTimeout(_) | XhciError::NoResponse => Errno::TimedOut,
            XhciError::Command(code) | XhciError::Transfer(code) => code.as_errno(),
            XhciError::BadBuffer => Errno::Fault,
            XhciError::UnknownEndpoint | XhciError::UnknownSlot => Errno::NoDev,
            XhciError::BadDescriptor => Errno::Proto,
        }
    }
}

/// A root-hub port connection or disconnection, queued from the event path
/// and handled by [`Xhci::poll`].
pub struct PortConnectionEvent {
    pub port_index: u8,
    pub disconnected: bool,
}

/// A class driver claims devices after enumeration and is told about each
/// non-control endpoint pipe.
pub trait UsbClassDriver: Send + Sync {
    fn probe(&self, descriptor: &UsbDeviceDescriptor) -> bool;
    fn alloc_pipe(&self, slot_id: u8, endpoint: &UsbEndpointDescriptor);
}

static CLASS_DRIVERS: SpinLock<Vec<&'static dyn UsbClassDriver>> = SpinLock::new(Vec::new());

pub fn register_class_driver(driver: &'static dyn UsbClassDriver) {
    CLASS_DRIVERS.lock().push(driver);
}

/// Everything the command lock guards.
struct CommandState {
    ring: TrbRing,
    /// TRB physical address → waiting completion packet.
    pending: PhysMap<Arc<Iocp>>,
    /// `(slot, dci)` → transfer ring.
    endpoints: HashMap<(u8, u8), TrbRing>,
    slots: HashMap<u8, SlotRecord>,
    devices: HashMap<u8, UsbDevice>,
}

/// What to do with the controller after attach: poll for port events and
/// let the IRQ path drive completions.
pub struct Xhci {
    /// Register file; interior mutability because the IRQ path and the
    /// submit path both poke it. Every access is a volatile single word.
    regs: UnsafeCell<XhciRegisters>,
    doorbells: Doorbells,
    cmd: Mutex<CommandState>,
    event_rings: Vec<SpinLock<EventRing>>,
    protocols: Vec<extended_caps::SupportedProtocol>,
    irq: IrqBinding,
    port_events: SpinLock<Vec<PortConnectionEvent>>,
    max_ports: u8,
    csz_64: bool,
}

// The UnsafeCell'd register block is MMIO: every access is volatile and
// word-sized, and the protocol (RW1C bits, doorbells) tolerates concurrent
// writers.
unsafe impl Send for Xhci {}
unsafe impl Sync for Xhci {}

impl core::fmt::Debug for Xhci {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Xhci")
            .field("max_ports", &self.max_ports)
            .field("interrupters", &self.event_rings.len())
            .finish()
    }
}

impl InterruptReceiver for Xhci {
    /// Top half. Runs with interrupts off: acknowledge the sticky status
    /// bits and push the real work to this CPU's worker. No locks that the
    /// bottom half holds while producing may be taken here.
    fn handle_interrupt(&self, vector: u32) {
        let regs = unsafe { self.regs_mut() };
        let op = regs.op();

        let status = read_ref!(op.usbsts);
        let ack = status & UsbSts::ACK_MASK;
        if !ack.is_empty() {
            write_ref!(op.usbsts, ack);
        }

        let irq_ofs = self
            .irq
            .vectors()
            .iter()
            .position(|&v| v == vector)
            .unwrap_or(0);

        // The registration handed out `&'static self`; reborrow it so the
        // closure can outlive this frame.
        let this: &'static Xhci = unsafe { &*(self as *const Xhci) };
        work_queue::enqueue_on(
            thread::current_cpu(),
            Box::new(move || this.handle_events(irq_ofs)),
        );
    }
}

impl Xhci {
    /// Brings a controller up on its mapped MMIO window and leaves it
    /// running with every interrupter armed. The platform maps the BARs
    /// uncached and allocates the IRQ vectors before calling in.
    pub fn attach(mmio_base: VirtAddr, irq: IrqBinding) -> Result<&'static Self, XhciError> {
        let caps_ptr = mmio_base.into_ptr::<CapsRegs>();
        let mut regs = unsafe { XhciRegisters::new(caps_ptr) };

        // Power-up handshake first: no operational writes until CNR clears.
        regs.wait_ready()?;

        // Legacy BIOS handoff and the USB3 port map come from the extended
        // capability chain.
        let protocols = extended_caps::take_ownership_and_enumerate(
            mmio_base,
            regs.caps().xecp_offset(),
        );

        regs.halt_and_reset()?;

        let max_ports = regs.caps().max_ports();
        let max_interrupters = regs.caps().max_interrupters();
        let csz_64 = regs.caps().context_size_64();

        regs.configure_dcbaa()?;

        let cmd_ring = TrbRing::alloc(MAX_TRB_COUNT)?;
        regs.configure_crcr(cmd_ring.base_phys(), cmd_ring.cycle());

        // One interrupter per CPU where MSI-X allows, one otherwise.
        let wanted = if irq.is_msix() {
            max_interrupters
                .min(thread::cpu_count())
                .min(irq.vectors().len())
                .max(1)
        } else {
            1
        };

        let mut event_rings = Vec::with_capacity(wanted);
        for index in 0..wanted {
            let ring = EventRing::alloc(EVENT_RING_TRBS)?;
            regs.configure_interrupter(
                index,
                ring.segment_count(),
                ring.base_phys(),
                ring.segment_table_phys(),
            );
            event_rings.push(SpinLock::new(ring));
        }

        let doorbells = unsafe {
            Doorbells::new(regs.caps().doorbells_base(), regs.caps().max_device_slots())
        };

        let this: &'static Xhci = Box::leak(Box::new(Xhci {
            regs: UnsafeCell::new(regs),
            doorbells,
            cmd: Mutex::new(CommandState {
                ring: cmd_ring,
                pending: PhysMap::new(),
                endpoints: HashMap::new(),
                slots: HashMap::new(),
                devices: HashMap::new(),
            }),
            event_rings,
            protocols,
            irq,
            port_events: SpinLock::new(Vec::new()),
            max_ports,
            csz_64,
        }));

        interrupts::register_irq(&this.irq, this);

        unsafe { this.regs_mut() }.start()?;

        debug!(
            Xhci,
            "controller up\n{}\nusb3 port ranges: {:?}",
            this.caps(),
            this.protocols
        );

        this.scan_ports();
        Ok(this)
    }

    /// # Safety
    /// Register accesses are individually volatile; see the `Sync` note.
    #[allow(clippy::mut_from_ref)]
    unsafe fn regs_mut(&self) -> &mut XhciRegisters {
        unsafe { &mut *self.regs.get() }
    }

    pub fn caps(&self) -> &'static CapsRegs {
        unsafe { self.regs_mut() }.caps()
    }

    fn is_usb3_port(&self, port_index: u8) -> bool {
        self.protocols
            .iter()
            .any(|p| p.major == 3 && p.covers(port_index))
    }

    /// Queues connection events for every port with a device behind it.
    fn scan_ports(&self) {
        let regs = unsafe { self.regs_mut() };
        let op = regs.op();

        for port in 0..self.max_ports {
            let port_sc = read_ref!(unsafe { op.port_regs(port) }.port_sc);
            if port_sc.ccs() {
                self.port_events.lock().push(PortConnectionEvent {
                    port_index: port,
                    disconnected: false,
                });
            }
        }
    }

    /// Drives queued port events: reset and enumerate on connect, tear the
    /// slot down on disconnect. Runs on a driver thread, never the IRQ
    /// path.
    pub fn poll(&'static self) {
        loop {
            let event = self.port_events.lock().pop();
            let Some(event) = event else { return };

            if event.disconnected {
                self.handle_disconnect(event.port_index);
                continue;
            }

            debug!(Xhci, "port {} resetting...", event.port_index);
            let ok = unsafe {
                self.regs_mut()
                    .op()
                    .reset_port(self.is_usb3_port(event.port_index), event.port_index)
            };

            if ok {
                match self.setup_device(event.port_index, 0, 0, 0) {
                    Ok(slot) => debug!(Xhci, "port {} is slot {slot}", event.port_index),
                    Err(err) => {
                        error!(Xhci, "port {} enumeration failed: {err}", event.port_index);
                    }
                }
            }
        }
    }

    fn handle_disconnect(&self, port_index: u8) {
        let mut cmd = self.cmd.lock();
        let slot_id = cmd
            .slots
            .iter_mut()
            .find(|(_, rec)| rec.root_port == port_index && rec.parent_slot == 0)
            .map(|(slot, rec)| {
                rec.state = SlotLifecycle::Exited;
                *slot
            });
        drop(cmd);

        let Some(slot_id) = slot_id else { return };
        debug!(Xhci, "port {port_index} disconnected, disabling slot {slot_id}");

        if let Err(err) = self.issue_command(SlottedCommandTrb::disable_slot(slot_id).into_trb()) {
            warn!(Xhci, "disable of dead slot {slot_id} failed: {err}");
        }

        let mut cmd = self.cmd.lock();
        cmd.slots.remove(&slot_id);
        cmd.devices.remove(&slot_id);
        cmd.endpoints.retain(|(slot, _), _| *slot != slot_id);
        unsafe { self.regs_mut() }.clear_dcbaa_entry(slot_id);
    }

    // ---- command and transfer submission ----------------------------------

    /// Inserts a command, registers its completion packet under the TRB's
    /// physical address and rings doorbell 0 once the lock is dropped.
    fn issue_command(&self, command: Trb) -> Result<IocpResult, XhciError> {
        let iocp = Arc::new(Iocp::new(1));

        {
            let mut cmd = self.cmd.lock();
            let phys = cmd.ring.insert(&command);
            cmd.pending
                .insert(phys, iocp.clone())
                .map_err(|()| XhciError::OutOfMemory)?;
        }
        self.doorbells.ring_command();

        let result = iocp.wait(Some(COMMAND_TIMEOUT_MS)).map_err(|err| {
            warn!(Xhci, "command timed out: {err:?}");
            XhciError::NoResponse
        })?;

        if result.code.is_success() {
            Ok(result)
        } else {
            Err(XhciError::Command(result.code))
        }
    }

    /// Inserts a TD on an endpoint ring. The completion packet is keyed by
    /// the last TRB (the one carrying IOC) and the endpoint doorbell is
    /// rung after the lock is dropped.
    fn submit_td(
        &self,
        slot_id: u8,
        dci: u8,
        trbs: &[Trb],
        iocp: &Arc<Iocp>,
    ) -> Result<(), XhciError> {
        assert!(!trbs.is_empty());

        {
            let mut cmd = self.cmd.lock();

            let ring = cmd
                .endpoints
                .get_mut(&(slot_id, dci))
                .ok_or(XhciError::UnknownEndpoint)?;

            let mut last_phys = PhysAddr::null();
            for trb in trbs {
                last_phys = ring.insert(trb);
            }

            cmd.pending
                .insert(last_phys, iocp.clone())
                .map_err(|()| XhciError::OutOfMemory)?;
        }

        self.doorbells.ring(slot_id, dci, 0);
        Ok(())
    }

    /// A blocking control transfer on an endpoint's default pipe. Returns
    /// the residual byte count (0 on a full transfer).
    pub fn control_transfer(
        &self,
        slot_id: u8,
        packet: DeviceRequestPacket,
        buffer: Option<(VirtAddr, usize)>,
        dir: Direction,
    ) -> Result<usize, XhciError> {
        let interrupter = (thread::current_cpu() % self.event_rings.len()) as u16;
        let trbs = transfer::make_setup_trbs(packet, buffer, dir, interrupter)?;

        let iocp = Arc::new(Iocp::new(1));
        self.submit_td(slot_id, 1, &trbs, &iocp)?;

        let result = iocp
            .wait(Some(TRANSFER_TIMEOUT_MS))
            .map_err(|_| XhciError::NoResponse)?;

        if result.code.is_success() {
            Ok(result.remaining as usize)
        } else {
            Err(XhciError::Transfer(result.code))
        }
    }

    /// A blocking bulk or interrupt transfer. Returns bytes transferred.
    pub fn normal_transfer(
        &self,
        slot_id: u8,
        endpoint: &UsbEndpointDescriptor,
        buffer: VirtAddr,
        len: usize,
    ) -> Result<usize, XhciError> {
        let dci = endpoint_dci(endpoint.endpoint_number(), endpoint.is_in());
        let interrupter = (thread::current_cpu() % self.event_rings.len()) as u16;
        let trbs = transfer::make_normal_trbs(buffer, len, interrupter)?;

        let iocp = Arc::new(Iocp::new(1));
        self.submit_td(slot_id, dci, &trbs, &iocp)?;

        let result = iocp
            .wait(Some(TRANSFER_TIMEOUT_MS))
            .map_err(|_| XhciError::NoResponse)?;

        if result.code.is_success() {
            Ok(len - result.remaining as usize)
        } else {
            Err(XhciError::Transfer(result.code))
        }
    }

    /// Recovers a halted endpoint: Reset Endpoint, then reposition the
    /// dequeue pointer at the ring's current enqueue point.
    pub fn reset_ep(&self, slot_id: u8, dci: u8) -> Result<(), XhciError> {
        self.issue_command(SlottedCommandTrb::reset_endpoint(slot_id, dci).into_trb())?;

        let (dequeue, cycle) = {
            let cmd = self.cmd.lock();
            let ring = cmd
                .endpoints
                .get(&(slot_id, dci))
                .ok_or(XhciError::UnknownEndpoint)?;
            (ring.enqueue_phys(), ring.cycle())
        };

        self.issue_command(
            SlottedCommandTrb::set_tr_dequeue(dequeue, cycle, slot_id, dci).into_trb(),
        )?;
        Ok(())
    }

    // ---- enumeration ------------------------------------------------------

    /// The full ladder for a newly reset port (or hub downstream port):
    /// slot, address, descriptors, endpoints, and hub recursion.
    pub fn setup_device(
        &'static self,
        port_index: u8,
        parent_slot: u8,
        parent_port: u8,
        route: u32,
    ) -> Result<u8, XhciError> {
        let speed = if parent_slot == 0 {
            let regs = unsafe { self.regs_mut() };
            read_ref!(unsafe { regs.op().port_regs(port_index) }.port_sc).port_speed()
        } else {
            // Behind a hub the parent reported the speed via port status.
            PortSpeed::High
        };

        debug!(
            Xhci,
            "setting up device at port {port_index}, speed {speed:?}, route {route:#x}"
        );

        // Enable a slot and stage the address.
        let result = self.issue_command(SlottedCommandTrb::enable_slot().into_trb())?;
        let slot_id = result.slot_id;
        if slot_id == 0 {
            return Err(XhciError::Command(CompletionCode::NoSlotsAvailable));
        }

        let mut dev = UsbDevice::create(self.csz_64, slot_id, port_index, route, speed)?;
        let control_ring = TrbRing::alloc(TRANSFER_RING_TRBS)?;
        dev.stage_address(
            parent_slot,
            parent_port,
            speed.default_max_packet(),
            &control_ring,
        );

        {
            let mut cmd = self.cmd.lock();
            cmd.endpoints.insert((slot_id, 1), control_ring);
            cmd.slots.insert(
                slot_id,
                SlotRecord {
                    parent_slot,
                    root_port: port_index,
                    route,
                    is_hub: false,
                    is_multi_tt: false,
                    state: SlotLifecycle::Starting,
                },
            );
            unsafe { self.regs_mut() }.set_dcbaa_entry(slot_id, dev.device_ctx_phys());
        }

        let input_ctx = dev.input_ctx_phys();
        if let Err(err) =
            self.issue_command(SlottedCommandTrb::address_device(input_ctx, slot_id, false).into_trb())
        {
            // Set Address failed: back out so the slot ends up disabled.
            error!(Xhci, "slot {slot_id}: address device failed: {err}");
            let _ = self.issue_command(SlottedCommandTrb::disable_slot(slot_id).into_trb());
            let mut cmd = self.cmd.lock();
            cmd.slots.remove(&slot_id);
            cmd.endpoints.remove(&(slot_id, 1));
            unsafe { self.regs_mut() }.clear_dcbaa_entry(slot_id);
            return Err(err);
        }

        {
            let mut cmd = self.cmd.lock();
            cmd.slots.get_mut(&slot_id).expect("slot vanished").state =
                SlotLifecycle::Addressed;
            cmd.devices.insert(slot_id, dev);
        }

        self.read_descriptors_and_configure(slot_id)?;
        Ok(slot_id)
    }

    fn get_descriptor(
        &self,
        slot_id: u8,
        p_type: PacketType,
        recipient: PacketRecipient,
        desc_type: u8,
        desc_index: u8,
        buffer: &mut [u8],
    ) -> Result<usize, XhciError> {
        let packet = DeviceRequestPacket::new()
            .with_p_type(p_type)
            .with_recipient(recipient)
            .with_device_to_host(true)
            .with_b_request(REQUEST_GET_DESCRIPTOR)
            .with_w_value(((desc_type as u16) << 8) | desc_index as u16)
            .with_w_index(0)
            .with_w_length(buffer.len() as u16);

        let remaining = self.control_transfer(
            slot_id,
            packet,
            Some((VirtAddr::from_ptr(buffer.as_ptr()), buffer.len())),
            Direction::In,
        )?;
        Ok(buffer.len() - remaining)
    }

    fn set_configuration(&self, slot_id: u8, configuration: u8) -> Result<(), XhciError> {
        let packet = DeviceRequestPacket::new()
            .with_p_type(PacketType::Standard)
            .with_recipient(PacketRecipient::Device)
            .with_device_to_host(false)
            .with_b_request(REQUEST_SET_CONFIGURATION)
            .with_w_value(configuration as u16)
            .with_w_index(0)
            .with_w_length(0);

        self.control_transfer(slot_id, packet, None, Direction::Out)?;
        Ok(())
    }

    fn read_descriptors_and_configure(&'static self, slot_id: u8) -> Result<(), XhciError> {
        // First 8 bytes: enough for bMaxPacketSize0.
        let mut probe = [0u8; 8];
        self.get_descriptor(
            slot_id,
            PacketType::Standard,
            PacketRecipient::Device,
            USB_DESCRIPTOR_DEVICE,
            0,
            &mut probe,
        )?;

        let speed = {
            let cmd = self.cmd.lock();
            cmd.devices
                .get(&slot_id)
                .ok_or(XhciError::UnknownSlot)?
                .speed()
        };

        let max_packet = match speed {
            // USB3 encodes an exponent.
            PortSpeed::Super | PortSpeed::SuperPlus => 1u16 << probe[7].min(15),
            _ => probe[7] as u16,
        };

        if max_packet != speed.default_max_packet() {
            debug!(Xhci, "slot {slot_id}: fixing ep0 max packet to {max_packet}");
            let input_ctx = {
                let mut cmd = self.cmd.lock();
                let dev = cmd.devices.get_mut(&slot_id).ok_or(XhciError::UnknownSlot)?;
                dev.stage_max_packet_update(max_packet);
                dev.input_ctx_phys()
            };
            self.issue_command(
                SlottedCommandTrb::evaluate_context(input_ctx, slot_id).into_trb(),
            )?;
        }

        // Full device descriptor.
        let mut desc = UsbDeviceDescriptor::zeroed();
        let desc_bytes = unsafe {
            core::slice::from_raw_parts_mut(
                &raw mut desc as *mut u8,
                size_of::<UsbDeviceDescriptor>(),
            )
        };
        self.get_descriptor(
            slot_id,
            PacketType::Standard,
            PacketRecipient::Device,
            USB_DESCRIPTOR_DEVICE,
            0,
            desc_bytes,
        )?;

        // Configuration blob: header plus interfaces and endpoints.
        let mut config = [0u8; CONFIG_DESCRIPTOR_MAX];
        let read = self.get_descriptor(
            slot_id,
            PacketType::Standard,
            PacketRecipient::Device,
            USB_DESCRIPTOR_CONFIGURATION,
            0,
            &mut config,
        )?;
        if read < size_of::<UsbConfigurationDescriptor>() {
            return Err(XhciError::BadDescriptor);
        }
        let config_value = config[5];

        // Newer devices advertise capabilities through a BOS descriptor.
        if desc.has_bos() {
            let mut bos = [0u8; size_of::<UsbBosDescriptor>()];
            if let Err(err) = self.get_descriptor(
                slot_id,
                PacketType::Standard,
                PacketRecipient::Device,
                USB_DESCRIPTOR_BOS,
                0,
                &mut bos,
            ) {
                warn!(Xhci, "slot {slot_id}: BOS read failed: {err}");
            }
        }

        // Stage every endpoint the configuration names.
        let endpoints = DescriptorWalker::new(&config[..read]).endpoints();
        if !endpoints.is_empty() {
            let input_ctx = {
                let mut cmd = self.cmd.lock();
                let CommandState {
                    devices, endpoints: ep_rings, ..
                } = &mut *cmd;
                let dev = devices.get_mut(&slot_id).ok_or(XhciError::UnknownSlot)?;

                for ep in &endpoints {
                    let ring = TrbRing::alloc(TRANSFER_RING_TRBS)?;
                    let dci = dev.stage_endpoint(*ep, &ring)?;
                    ep_rings.insert((slot_id, dci), ring);
                }
                dev.input_ctx_phys()
            };

            self.issue_command(
                SlottedCommandTrb::configure_endpoint(input_ctx, slot_id).into_trb(),
            )?;
        }

        self.set_configuration(slot_id, config_value)?;

        {
            let mut cmd = self.cmd.lock();
            let record = cmd.slots.get_mut(&slot_id).ok_or(XhciError::UnknownSlot)?;
            record.state = SlotLifecycle::Configured;
            record.is_hub = desc.is_hub();
        }

        // Hand the device to whoever claims it.
        for driver in CLASS_DRIVERS.lock().iter() {
            if driver.probe(&desc) {
                for ep in &endpoints {
                    driver.alloc_pipe(slot_id, ep);
                }
            }
        }

        if desc.is_hub() {
            self.configure_hub(slot_id)?;
        }

        Ok(())
    }

    // ---- hubs -------------------------------------------------------------

    /// Tells the controller about a hub's fan-out and walks its downstream
    /// ports, recursing into [`Self::setup_device`] with an extended route.
    fn configure_hub(&'static self, slot_id: u8) -> Result<(), XhciError> {
        let mut hub_desc_bytes = [0u8; 8];
        let read = self.get_descriptor(
            slot_id,
            PacketType::Class,
            PacketRecipient::Device,
            USB_DESCRIPTOR_HUB,
            0,
            &mut hub_desc_bytes,
        )?;
        if read < size_of::<UsbHubDescriptor>() {
            return Err(XhciError::BadDescriptor);
        }

        let port_count = hub_desc_bytes[2];
        let characteristics = u16::from_le_bytes([hub_desc_bytes[3], hub_desc_bytes[4]]);
        let multi_tt = characteristics & (1 << 7) != 0;
        let ttt = ((characteristics >> 5) & 0x3) as u8;

        debug!(Xhci, "slot {slot_id} is a hub with {port_count} ports");

        let (input_ctx, route, root_port) = {
            let mut cmd = self.cmd.lock();
            let record = cmd.slots.get_mut(&slot_id).ok_or(XhciError::UnknownSlot)?;
            record.is_hub = true;
            record.is_multi_tt = multi_tt;
            let (route, root_port) = (record.route, record.root_port);

            let dev = cmd.devices.get_mut(&slot_id).ok_or(XhciError::UnknownSlot)?;
            dev.stage_hub_fields(port_count, multi_tt, ttt);
            (dev.input_ctx_phys(), route, root_port)
        };

        self.issue_command(SlottedCommandTrb::evaluate_context(input_ctx, slot_id).into_trb())?;

        for hub_port in 1..=port_count {
            match self.probe_hub_port(slot_id, hub_port) {
                Ok(true) => {
                    let child_route = route_append(route, hub_port);
                    if let Err(err) =
                        self.setup_device(root_port, slot_id, hub_port, child_route)
                    {
                        warn!(
                            Xhci,
                            "hub slot {slot_id} port {hub_port}: child setup failed: {err}"
                        );
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(Xhci, "hub slot {slot_id} port {hub_port}: probe failed: {err}");
                }
            }
        }

        Ok(())
    }

    /// Powers and resets one hub port; reports whether a device answered.
    fn probe_hub_port(&self, slot_id: u8, port: u8) -> Result<bool, XhciError> {
        const SET_FEATURE: u8 = 3;
        const CLEAR_FEATURE: u8 = 1;
        const GET_STATUS: u8 = 0;
        const PORT_RESET: u16 = 4;
        const PORT_POWER: u16 = 8;
        const C_PORT_RESET: u16 = 20;

        let feature = |request: u8, value: u16| {
            DeviceRequestPacket::new()
                .with_p_type(PacketType::Class)
                .with_recipient(PacketRecipient::Other)
                .with_device_to_host(false)
                .with_b_request(request)
                .with_w_value(value)
                .with_w_index(port as u16)
                .with_w_length(0)
        };

        self.control_transfer(slot_id, feature(SET_FEATURE, PORT_POWER), None, Direction::Out)?;
        crate::thread::sleep_ms(20);

        let mut status = [0u8; 4];
        let status_packet = DeviceRequestPacket::new()
            .with_p_type(PacketType::Class)
            .with_recipient(PacketRecipient::Other)
            .with_device_to_host(true)
            .with_b_request(GET_STATUS)
            .with_w_index(port as u16)
            .with_w_length(4);

        self.control_transfer(
            slot_id,
            status_packet,
            Some((VirtAddr::from_ptr(status.as_ptr()), 4)),
            Direction::In,
        )?;
        let connected = status[0] & 1 != 0;
        if !connected {
            return Ok(false);
        }

        self.control_transfer(slot_id, feature(SET_FEATURE, PORT_RESET), None, Direction::Out)?;
        crate::thread::sleep_ms(50);
        self.control_transfer(
            slot_id,
            feature(CLEAR_FEATURE, C_PORT_RESET),
            None,
            Direction::Out,
        )?;

        Ok(true)
    }

    // ---- event handling ---------------------------------------------------

    /// Bottom half: walks every interrupter striped onto this vector,
    /// consumes events, updates ERDP, then invokes the completions it
    /// collected. Runs on a worker thread.
    pub fn handle_events(&self, irq_ofs: usize) {
        let stripe = self.irq.vectors().len().max(1);

        for index in (irq_ofs..self.event_rings.len()).step_by(stripe) {
            let regs = unsafe { self.regs_mut() };
            let ir = regs.interrupter(index);

            let iman = read_ref!(ir.iman);
            if iman.contains(Iman::INTERRUPT_PENDING) && !self.irq.is_msix() {
                // Pin-based: IP is not self-clearing.
                write_ref!(ir.iman, iman | Iman::INTERRUPT_PENDING);
            }

            let mut completions: Vec<(Arc<Iocp>, IocpResult)> = Vec::new();
            let mut consumed = false;

            {
                let mut ring = self.event_rings[index].lock();
                while let Some(event) = ring.pop() {
                    consumed = true;
                    self.dispatch_event(event, &mut completions);
                }

                if consumed {
                    let erdp = ring.erdp_value();
                    unsafe { self.regs_mut() }.write_erdp(index, erdp);
                }
            }

            // Waiters run only after the dequeue pointer is published.
            for (iocp, result) in completions {
                iocp.invoke(result);
            }
        }
    }

    /// Routes one event. Referenced-TRB events resolve through the pending
    /// table; a missing entry there means our bookkeeping is corrupt and is
    /// fatal.
    fn dispatch_event(&self, event: Trb, completions: &mut Vec<(Arc<Iocp>, IocpResult)>) {
        let Some(event) = event.into_event_trb() else {
            warn!(Xhci, "unrecognized event type {}", event.control.trb_type());
            return;
        };

        match event {
            EventTrb::CommandCompletion(completion) => {
                debug!(
                    Xhci,
                    "command completed with code {:?}, slot {}",
                    completion.status.code(),
                    completion.info.slot_id(),
                );
                let result = IocpResult {
                    code: completion.status.code(),
                    parameter: completion.status.parameter(),
                    slot_id: completion.info.slot_id(),
                    remaining: 0,
                };
                self.complete_pending(PhysAddr::from(completion.trb_ptr as usize), result, completions);
            }
            EventTrb::Transfer(xfer) => {
                let result = IocpResult {
                    code: xfer.status.code(),
                    parameter: xfer.status.parameter(),
                    slot_id: xfer.info.slot_id(),
                    remaining: xfer.status.parameter(),
                };
                self.complete_pending(PhysAddr::from(xfer.trb_ptr as usize), result, completions);
            }
            EventTrb::PortStatusChange(change) => {
                let port_index = change.parameter.port_index();
                debug!(
                    Xhci,
                    "port status change for port {port_index}, code {:?}",
                    change.status.code()
                );
                self.ack_port_change(port_index);
            }
            EventTrb::Other(_) => {}
        }
    }

    fn complete_pending(
        &self,
        trb_phys: PhysAddr,
        result: IocpResult,
        completions: &mut Vec<(Arc<Iocp>, IocpResult)>,
    ) {
        let mut cmd = self.cmd.lock();
        let Some(iocp) = cmd.pending.remove(trb_phys) else {
            // An acknowledged event must match a submission; anything else
            // means the table or the rings are corrupt.
            panic!("xHCI: no pending command for acknowledged TRB at {trb_phys:?}");
        };
        drop(cmd);
        completions.push((iocp, result));
    }

    /// Reads PORTSC, acknowledges its change bits and queues the connect /
    /// disconnect for [`Self::poll`].
    fn ack_port_change(&self, port_index: u8) {
        let regs = unsafe { self.regs_mut() };
        let port_regs = unsafe { regs.op().port_regs(port_index) };

        let port_sc = read_ref!(port_regs.port_sc);
        write_ref!(port_regs.port_sc, port_sc.ack_changes());

        if port_sc.csc() {
            self.port_events.lock().push(PortConnectionEvent {
                port_index,
                disconnected: !port_sc.ccs(),
            });
        }
    }
}
