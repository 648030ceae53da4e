//! Controller-level tests against a software model of an xHC.
//!
//! The model drives the same MMIO window the driver programs: it honors the
//! halt/reset/run handshake, consumes command and transfer rings by cycle
//! bit (following link TRBs), produces completion events with the cycle
//! published last and raises the interrupt path the way hardware would:
//! by setting EINT/IP and hitting the registered vector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::*;
use crate::drivers::xhci::trb::{
    TRB_TYPE_ADDRESS_DEVICE_CMD, TRB_TYPE_CMD_COMPLETION, TRB_TYPE_CONFIGURE_ENDPOINT_CMD,
    TRB_TYPE_DISABLE_SLOT_CMD, TRB_TYPE_ENABLE_SLOT_CMD, TRB_TYPE_EVALUATE_CONTEXT_CMD,
    TRB_TYPE_LINK, TRB_TYPE_NOOP_CMD, TRB_TYPE_RESET_ENDPOINT_CMD, TRB_TYPE_SETUP_STAGE,
    TRB_TYPE_SET_TR_DEQUEUE_CMD, TRB_TYPE_STATUS_STAGE, TRB_TYPE_TRANSFER_EVENT,
};
use crate::test_support;

const WINDOW_BYTES: usize = 0x10000;
const OP_OFFSET: usize = 0x40;
const DB_OFFSET: usize = 0x3000;
const RT_OFFSET: usize = 0x4000;
const FAKE_VECTOR: u32 = 77;
const FAKE_SLOT: u8 = 1;

const USBCMD: usize = OP_OFFSET;
const USBSTS: usize = OP_OFFSET + 0x04;
const CRCR: usize = OP_OFFSET + 0x18;
const PORTSC0: usize = OP_OFFSET + 0x400;
const IMAN0: usize = RT_OFFSET + 0x20;
const ERSTBA0: usize = RT_OFFSET + 0x20 + 0x10;

struct Window(usize);

impl Window {
    fn alloc() -> Self {
        let layout = std::alloc::Layout::from_size_align(WINDOW_BYTES, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self(ptr.addr())
    }

    fn r32(&self, off: usize) -> u32 {
        unsafe { ((self.0 + off) as *const u32).read_volatile() }
    }

    fn w32(&self, off: usize, value: u32) {
        unsafe { ((self.0 + off) as *mut u32).write_volatile(value) }
    }

    fn r64(&self, off: usize) -> u64 {
        unsafe { ((self.0 + off) as *const u64).read_volatile() }
    }

    fn w8(&self, off: usize, value: u8) {
        unsafe { ((self.0 + off) as *mut u8).write_volatile(value) }
    }

    /// Lays down the capability block and power-on register state for a
    /// one-port, one-interrupter, 32-byte-context controller.
    fn install_capabilities(&self) {
        self.w8(0, OP_OFFSET as u8); // CAPLENGTH
        self.w32(0x04, 8 | (1 << 8) | (1 << 24)); // HCSPARAMS1
        self.w32(0x08, 0); // HCSPARAMS2: no scratchpads
        self.w32(0x10, 0); // HCCPARAMS1: CSZ=0, no xECP
        self.w32(0x14, DB_OFFSET as u32); // DBOFF
        self.w32(0x18, RT_OFFSET as u32); // RTSOFF

        self.w32(USBSTS, 1); // HCHalted
        // Port 0: connected, connect change, powered, high speed.
        let portsc = 1 | (1 << 17) | (1 << 9) | (3 << 10);
        self.w32(PORTSC0, portsc);
    }
}

/// One consumer cursor over a producer ring, link-TRB aware.
struct RingCursor {
    at: usize,
    cycle: u8,
}

impl RingCursor {
    fn new(base: u64, cycle: u8) -> Self {
        Self {
            at: base as usize,
            cycle,
        }
    }

    /// Consumes the next cycle-owned TRB, reporting its address for event
    /// `trb_ptr` fields. Follows link TRBs, honoring toggle-cycle.
    fn pop_with_addr(&mut self) -> Option<(u64, Trb)> {
        loop {
            let trb = unsafe { (self.at as *const Trb).read_volatile() };
            if trb.control.cycle_bit() != self.cycle {
                return None;
            }
            if trb.control.trb_type() == TRB_TYPE_LINK {
                self.at = trb.parameter as usize;
                if trb.control.toggle_cycle() {
                    self.cycle = !self.cycle & 1;
                }
                continue;
            }
            let addr = self.at as u64;
            self.at += 16;
            return Some((addr, trb));
        }
    }
}

/// Producer cursor over the driver's event ring.
struct EventProducer {
    base: usize,
    size: usize,
    at: usize,
    cycle: u8,
}

impl EventProducer {
    fn new(window: &Window) -> Self {
        // ERSTBA points at the segment table; its first entry carries the
        // ring base and size.
        let segtab = window.r64(ERSTBA0) as usize;
        let base = unsafe { (segtab as *const u64).read_volatile() } as usize;
        let size = unsafe { ((segtab + 8) as *const u32).read_volatile() } as usize;
        Self {
            base,
            size,
            at: 0,
            cycle: 1,
        }
    }

    fn push(&mut self, window: &Window, mut event: Trb) {
        let slot = self.base + self.at * 16;
        event.control.set_cycle_bit(0);
        unsafe {
            // Payload first, cycle bit last.
            (slot as *mut Trb).write_volatile(event);
            event.control.set_cycle_bit(self.cycle);
            ((slot + 12) as *mut u32).write_volatile(event.control.into_bits());
        }

        self.at += 1;
        if self.at >= self.size {
            self.at = 0;
            self.cycle = !self.cycle & 1;
        }

        // EINT + IP, then the vector.
        window.w32(USBSTS, window.r32(USBSTS) | (1 << 3));
        window.w32(IMAN0, window.r32(IMAN0) | 1);
        interrupts::dispatch(FAKE_VECTOR);
    }

    fn command_completion(&mut self, window: &Window, trb_addr: u64, slot: u8) {
        let mut event = Trb::zeroed();
        event.parameter = trb_addr;
        event.status = (CompletionCode::Success as u32) << 24;
        event.control.set_trb_type(TRB_TYPE_CMD_COMPLETION);
        event.control.set_rest((slot as u16) << 8);
        self.push(window, event);
    }

    fn transfer_success(&mut self, window: &Window, trb_addr: u64, slot: u8, remaining: u32) {
        let mut event = Trb::zeroed();
        event.parameter = trb_addr;
        event.status = ((CompletionCode::Success as u32) << 24) | (remaining & 0xFF_FFFF);
        event.control.set_trb_type(TRB_TYPE_TRANSFER_EVENT);
        event.control.set_rest(((slot as u16) << 8) | 1);
        self.push(window, event);
    }
}

fn device_descriptor_bytes() -> [u8; 18] {
    let mut bytes = [0u8; 18];
    bytes[0] = 18;
    bytes[1] = usb::USB_DESCRIPTOR_DEVICE;
    bytes[2..4].copy_from_slice(&0x0200u16.to_le_bytes()); // bcdUSB
    bytes[7] = 64; // bMaxPacketSize0, matches high speed
    bytes[8..10].copy_from_slice(&0x1234u16.to_le_bytes());
    bytes[10..12].copy_from_slice(&0xabcdu16.to_le_bytes());
    bytes[17] = 1; // one configuration
    bytes
}

fn config_descriptor_bytes() -> [u8; 18] {
    let mut bytes = [0u8; 18];
    bytes[0] = 9;
    bytes[1] = usb::USB_DESCRIPTOR_CONFIGURATION;
    bytes[2..4].copy_from_slice(&18u16.to_le_bytes()); // wTotalLength
    bytes[4] = 1; // one interface
    bytes[5] = 5; // bConfigurationValue
    // Interface descriptor, zero endpoints.
    bytes[9] = 9;
    bytes[10] = usb::USB_DESCRIPTOR_INTERFACE;
    bytes[13] = 0; // bNumEndpoints
    bytes[14] = 0xFF;
    bytes
}

/// The controller model. Ticks until the test process exits.
fn run_fake_hc(window: &'static Window, stop: &'static AtomicBool) {
    test_support::register_thread();

    let mut cmd_ring: Option<RingCursor> = None;
    let mut ep0_ring: Option<RingCursor> = None;
    let mut events: Option<EventProducer> = None;
    let mut pending_request: Option<DeviceRequestPacket> = None;

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(1));

        let usbcmd = window.r32(USBCMD);

        // Host controller reset: self-clearing, back to halted.
        if usbcmd & 0x2 != 0 {
            window.w32(USBCMD, usbcmd & !0x2);
            window.w32(USBSTS, 1);
            cmd_ring = None;
            events = None;
            continue;
        }

        // Run/stop mirrors into HCHalted.
        let usbsts = window.r32(USBSTS);
        if usbcmd & 0x1 != 0 {
            window.w32(USBSTS, usbsts & !1);
        } else {
            window.w32(USBSTS, usbsts | 1);
            continue;
        }

        // Port reset: PR self-clears, the port comes back enabled with the
        // reset-change flag up.
        let portsc = window.r32(PORTSC0);
        if portsc & (1 << 4) != 0 {
            window.w32(PORTSC0, (portsc & !(1 << 4)) | (1 << 1) | (1 << 21));
        }

        if cmd_ring.is_none() {
            let crcr = window.r64(CRCR);
            if crcr != 0 {
                cmd_ring = Some(RingCursor::new(crcr & !0xF, (crcr & 1) as u8));
            }
        }
        if events.is_none() && window.r64(ERSTBA0) != 0 {
            events = Some(EventProducer::new(window));
        }

        let (Some(cmd), Some(evt)) = (cmd_ring.as_mut(), events.as_mut()) else {
            continue;
        };

        // Consume commands.
        while let Some((addr, trb)) = cmd.pop_with_addr() {
            match trb.control.trb_type() {
                TRB_TYPE_ENABLE_SLOT_CMD => evt.command_completion(window, addr, FAKE_SLOT),
                TRB_TYPE_ADDRESS_DEVICE_CMD => {
                    // Learn endpoint 0's ring from the input context:
                    // 32-byte stride, ep0 context behind control + slot.
                    let input_ctx = trb.parameter as usize;
                    let qword2 = unsafe { ((input_ctx + 64 + 8) as *const u64).read_volatile() };
                    ep0_ring = Some(RingCursor::new(qword2 & !0xF, (qword2 & 1) as u8));
                    evt.command_completion(window, addr, FAKE_SLOT);
                }
                TRB_TYPE_EVALUATE_CONTEXT_CMD
                | TRB_TYPE_CONFIGURE_ENDPOINT_CMD
                | TRB_TYPE_RESET_ENDPOINT_CMD
                | TRB_TYPE_SET_TR_DEQUEUE_CMD
                | TRB_TYPE_DISABLE_SLOT_CMD
                | TRB_TYPE_NOOP_CMD => evt.command_completion(window, addr, FAKE_SLOT),
                other => panic!("fake hc: unexpected command type {other}"),
            }
        }

        // Consume endpoint 0 TDs.
        if let Some(ep0) = ep0_ring.as_mut() {
            while let Some((addr, trb)) = ep0.pop_with_addr() {
                match trb.control.trb_type() {
                    TRB_TYPE_SETUP_STAGE => {
                        pending_request = Some(DeviceRequestPacket::from_bits(trb.parameter));
                    }
                    trb::TRB_TYPE_DATA_STAGE => {
                        let request = pending_request.expect("data stage without setup");
                        let buffer = trb.parameter as usize;
                        let len = (trb.status & 0x1FFFF) as usize;
                        if request.b_request() == usb::REQUEST_GET_DESCRIPTOR {
                            let device = device_descriptor_bytes();
                            let config = config_descriptor_bytes();
                            let bytes: &[u8] = match (request.w_value() >> 8) as u8 {
                                usb::USB_DESCRIPTOR_DEVICE => &device,
                                usb::USB_DESCRIPTOR_CONFIGURATION => &config,
                                other => panic!("fake hc: descriptor type {other}"),
                            };
                            let n = len.min(bytes.len());
                            unsafe {
                                core::ptr::copy_nonoverlapping(
                                    bytes.as_ptr(),
                                    buffer as *mut u8,
                                    n,
                                );
                            }
                        }
                    }
                    TRB_TYPE_STATUS_STAGE => {
                        pending_request = None;
                        evt.transfer_success(window, addr, FAKE_SLOT, 0);
                    }
                    other => panic!("fake hc: unexpected transfer type {other}"),
                }
            }
        }
    }
}

fn spawn_worker() {
    std::thread::spawn(|| {
        test_support::register_thread();
        work_queue::worker_main(0);
    });
}

#[test]
fn enumerates_a_device_end_to_end() {
    test_support::init();
    spawn_worker();

    let window: &'static Window = Box::leak(Box::new(Window::alloc()));
    window.install_capabilities();

    static STOP: AtomicBool = AtomicBool::new(false);
    std::thread::spawn(move || run_fake_hc(window, &STOP));

    let controller = Xhci::attach(
        VirtAddr::from(window.0),
        IrqBinding::MsiX {
            vectors: alloc::vec![FAKE_VECTOR],
        },
    )
    .expect("attach failed");

    // The connected port was queued at attach; poll resets and enumerates.
    controller.poll();

    {
        let cmd = controller.cmd.lock();
        let record = cmd.slots.get(&FAKE_SLOT).expect("slot record missing");
        assert_eq!(record.state, SlotLifecycle::Configured);
        assert!(!record.is_hub);
        assert_eq!(record.root_port, 0);
        // The default control pipe ring exists.
        assert!(cmd.endpoints.contains_key(&(FAKE_SLOT, 1)));
        // Every submission was answered and unhooked from the table.
        assert!(cmd.pending.is_empty());
    }

    // A device descriptor fetched through the public path round-trips the
    // bytes the model serves.
    let mut desc = [0u8; 18];
    let packet = DeviceRequestPacket::new()
        .with_p_type(PacketType::Standard)
        .with_recipient(PacketRecipient::Device)
        .with_device_to_host(true)
        .with_b_request(usb::REQUEST_GET_DESCRIPTOR)
        .with_w_value((usb::USB_DESCRIPTOR_DEVICE as u16) << 8)
        .with_w_length(18);
    let remaining = controller
        .control_transfer(
            FAKE_SLOT,
            packet,
            Some((VirtAddr::from_ptr(desc.as_ptr()), 18)),
            Direction::In,
        )
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(desc, device_descriptor_bytes());

    // Endpoint recovery issues Reset Endpoint + Set TR Dequeue.
    controller.reset_ep(FAKE_SLOT, 1).unwrap();

    STOP.store(true, Ordering::Release);
}
