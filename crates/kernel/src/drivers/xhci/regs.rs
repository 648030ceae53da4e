//! The controller's MMIO register file.
//!
//! The capability block sits at BAR0; the operational, runtime and doorbell
//! blocks are found through offsets it carries. All accesses go through
//! `read_ref!`/`write_ref!` so nothing is coalesced, and the handful of
//! ordered handshakes (status acknowledge) use explicit release stores.

use core::fmt::Display;

use bitflags::bitflags;
use bitfield_struct::bitfield;

use crate::{
    PhysAddr, VirtAddr, debug,
    drivers::{read_ref, write_ref},
    error,
    memory::dma::DmaBuffer,
    memory::frame_allocator::{self, Frame},
    sleep, sleep_until, warn,
};

use super::XhciError;

/// Interrupt moderation: ~250 µs between interrupts (the field counts
/// 250 ns ticks).
pub const IMOD_DEFAULT: u32 = 1000;

#[repr(C)]
pub struct CapsRegs {
    cap_length: u8,
    _reserved0: u8,
    hci_version: u16,
    hcsparams_1: u32,
    hcsparams_2: u32,
    hcsparams_3: u32,
    hccparams_1: u32,
    doorbell_off: u32,
    runtime_off: u32,
    hccparams_2: u32,
}

impl CapsRegs {
    pub fn operational_ptr(&self) -> *mut OperationalRegs {
        let base = self as *const _ as *const u8;
        unsafe { base.add(read_ref!(self.cap_length) as usize) as *mut OperationalRegs }
    }

    pub fn runtime_ptr(&self) -> *mut RuntimeRegs {
        let base = self as *const _ as *const u8;
        unsafe { base.add((read_ref!(self.runtime_off) & !31) as usize) as *mut RuntimeRegs }
    }

    pub fn doorbells_base(&self) -> VirtAddr {
        let base = self as *const _ as *const u8;
        unsafe { VirtAddr::from_ptr(base.add((read_ref!(self.doorbell_off) & !3) as usize)) }
    }

    pub fn hci_version(&self) -> u16 {
        read_ref!(self.hci_version)
    }

    pub fn max_device_slots(&self) -> usize {
        (read_ref!(self.hcsparams_1) & 0xFF) as usize
    }

    pub fn max_interrupters(&self) -> usize {
        ((read_ref!(self.hcsparams_1) >> 8) & 0x7FF) as usize
    }

    pub fn max_ports(&self) -> u8 {
        (read_ref!(self.hcsparams_1) >> 24) as u8
    }

    pub fn max_scratchpad_buffers(&self) -> usize {
        let hcs2 = read_ref!(self.hcsparams_2);
        let hi = (hcs2 >> 21) & 0x1F;
        let lo = (hcs2 >> 27) & 0x1F;
        ((hi << 5) | lo) as usize
    }

    /// CSZ: device and input contexts are 64 bytes instead of 32.
    pub fn context_size_64(&self) -> bool {
        (read_ref!(self.hccparams_1) >> 2) & 1 != 0
    }

    /// Offset of the extended capability chain in 32-bit words, or `None`.
    pub fn xecp_offset(&self) -> Option<usize> {
        let words = (read_ref!(self.hccparams_1) >> 16) as usize;
        (words != 0).then_some(words << 2)
    }
}

impl Display for CapsRegs {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "xHCI capabilities @{:?}:", VirtAddr::from_ptr(self as *const _))?;
        writeln!(f, "\tHCI version       : {:#x}", self.hci_version())?;
        writeln!(f, "\tMax device slots  : {}", self.max_device_slots())?;
        writeln!(f, "\tMax interrupters  : {}", self.max_interrupters())?;
        writeln!(f, "\tMax ports         : {}", self.max_ports())?;
        writeln!(f, "\tScratchpad buffers: {}", self.max_scratchpad_buffers())?;
        write!(f,   "\t64-byte contexts  : {}", self.context_size_64())
    }
}

bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop; the controller halts within 16 ms of clearing.
        const RUN = 1 << 0;
        /// Host controller reset; self-clears when done.
        const HCRESET = 1 << 1;
        /// Interrupter enable.
        const INTE = 1 << 2;
        /// Host system error enable.
        const HSEE = 1 << 3;
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct UsbSts: u32 {
        /// Halted; set once Run/Stop has been honored.
        const HCHALTED = 1 << 0;
        /// Host system error. RW1C.
        const HSE = 1 << 2;
        /// Event interrupt: some interrupter's IP went 0→1. RW1C.
        const EINT = 1 << 3;
        /// Port change detect. RW1C.
        const PCD = 1 << 4;
        /// Save/restore error. RW1C.
        const SRE = 1 << 10;
        /// Controller not ready; no operational writes until clear.
        const CNR = 1 << 11;
        /// Internal error; requires reinit.
        const HCE = 1 << 12;
    }
}

impl UsbSts {
    /// The write-1-to-clear bits we acknowledge in the IRQ top half.
    pub const ACK_MASK: UsbSts = UsbSts::HSE.union(UsbSts::EINT).union(UsbSts::PCD).union(UsbSts::SRE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortSpeed {
    Undefined = 0,
    /// 12 Mb/s USB 2.0
    Full = 1,
    /// 1.5 Mb/s USB 2.0
    Low = 2,
    /// 480 Mb/s USB 2.0
    High = 3,
    /// 5 Gb/s USB 3.0
    Super = 4,
    /// 10 Gb/s USB 3.1
    SuperPlus = 5,
}

impl PortSpeed {
    pub const fn from_bits(bits: u8) -> Self {
        if bits > Self::SuperPlus as u8 {
            Self::Undefined
        } else {
            unsafe { core::mem::transmute(bits) }
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Max packet size endpoint 0 starts out with at this speed.
    pub const fn default_max_packet(&self) -> u16 {
        match self {
            Self::Low => 8,
            Self::Full | Self::High => 64,
            Self::Super | Self::SuperPlus => 512,
            Self::Undefined => 0,
        }
    }
}

/// Port Status & Control. The change bits are RW1C: writing the register
/// back with them set acknowledges them.
#[bitfield(u32)]
pub struct PortSc {
    /// Current connect status.
    pub ccs: bool,
    /// Port enabled; cleared by the port, set only via reset.
    pub ped: bool,
    #[bits(2)]
    __: (),
    /// Port reset; self-clears when the bus reset sequence finishes.
    pub pr: bool,
    #[bits(4)]
    pub pls: u8,
    /// Port power.
    pub pp: bool,
    #[bits(4)]
    pub port_speed: PortSpeed,
    #[bits(3)]
    __: (),
    /// Connect status change. RW1C.
    pub csc: bool,
    /// Port enabled/disabled change. RW1C.
    pub pec: bool,
    /// Warm reset change. RW1C.
    pub wrc: bool,
    /// Over-current change. RW1C.
    pub occ: bool,
    /// Port reset change. RW1C.
    pub prc: bool,
    /// Port link state change. RW1C.
    pub plc: bool,
    /// Config error change. RW1C.
    pub cec: bool,
    #[bits(7)]
    __: (),
    /// Warm port reset (USB3 only). RW1S, reads as zero.
    pub wpr: bool,
}

impl PortSc {
    /// All RW1C change bits, for acknowledge writes.
    pub fn ack_changes(self) -> Self {
        self.with_csc(true)
            .with_pec(true)
            .with_wrc(true)
            .with_occ(true)
            .with_prc(true)
            .with_plc(true)
            .with_cec(true)
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct PortRegs {
    pub port_sc: PortSc,
    port_pmsc: u32,
    port_li: u32,
    port_hlpmc: u32,
}

const _: () = assert!(size_of::<PortRegs>() == 0x10);

#[repr(C)]
pub struct OperationalRegs {
    pub usbcmd: UsbCmd,
    pub usbsts: UsbSts,
    page_size: u32,
    _reserved0: [u32; 2],
    pub dnctrl: u32,
    pub crcr: u64,
    _reserved1: [u32; 4],
    pub dcbaap: u64,
    pub config: u32,
    _reserved2: [u32; 241],
    ports: [PortRegs; 256],
}

const _: () = assert!(core::mem::offset_of!(OperationalRegs, crcr) == 0x18);
const _: () = assert!(core::mem::offset_of!(OperationalRegs, dcbaap) == 0x30);
const _: () = assert!(core::mem::offset_of!(OperationalRegs, ports) == 0x400);

impl OperationalRegs {
    /// # Safety
    /// `port_index` must be below the controller's max-ports.
    pub unsafe fn port_regs(&mut self, port_index: u8) -> &'static mut PortRegs {
        unsafe { &mut *(&raw mut self.ports[port_index as usize]) }
    }

    /// Resets the port and waits for it to come back enabled. USB3 ports
    /// take a warm reset. Returns whether a device is behind an enabled
    /// port afterwards.
    pub unsafe fn reset_port(&mut self, is_usb3: bool, port_index: u8) -> bool {
        let port_regs = unsafe { self.port_regs(port_index) };
        let mut port_sc = read_ref!(port_regs.port_sc);

        if !port_sc.pp() {
            write_ref!(port_regs.port_sc, port_sc.with_pp(true));

            // Power settle time.
            sleep!(20 ms);

            port_sc = read_ref!(port_regs.port_sc);
            if !port_sc.pp() {
                warn!("xHCI port {port_index} did not power up, skipping reset");
                return false;
            }
        }

        // Drop stale change bits so the ones we wait on are ours.
        write_ref!(port_regs.port_sc, read_ref!(port_regs.port_sc).ack_changes());

        let mut port_sc = read_ref!(port_regs.port_sc);
        if is_usb3 {
            port_sc.set_wpr(true);
        } else {
            port_sc.set_pr(true);
        }
        write_ref!(port_regs.port_sc, port_sc);

        if !sleep_until!(
            100 ms,
            (!is_usb3 && read_ref!(port_regs.port_sc).prc())
                || (is_usb3 && read_ref!(port_regs.port_sc).wrc())
        ) {
            warn!("xHCI port {port_index}: reset timeout after 100ms");
            return false;
        }

        sleep!(5 ms);

        // Acknowledge the reset-completion changes.
        write_ref!(port_regs.port_sc, read_ref!(port_regs.port_sc).ack_changes());

        sleep!(5 ms);

        let port_sc = read_ref!(port_regs.port_sc);
        if !port_sc.ped() {
            warn!("xHCI port {port_index} did not enable after reset (usb3: {is_usb3})");
            false
        } else {
            true
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct Iman: u32 {
        /// Interrupt pending. RW1C; cleared by hardware under MSI-X.
        const INTERRUPT_PENDING = 1 << 0;
        const INTERRUPT_ENABLE = 1 << 1;
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct InterrupterRegs {
    pub iman: Iman,
    pub imod: u32,
    pub erst_sz: u32,
    __: u32,
    pub erst_base: u64,
    pub erdp: u64,
}

const _: () = assert!(size_of::<InterrupterRegs>() == 32);

#[repr(C)]
pub struct RuntimeRegs {
    mf_index: u32,
    __: [u32; 7],
    interrupters: [InterrupterRegs; 1024],
}

impl RuntimeRegs {
    pub fn interrupter_ptr(&mut self, index: usize) -> *mut InterrupterRegs {
        &raw mut self.interrupters[index]
    }
}

#[bitfield(u32)]
pub struct DoorbellValue {
    /// 0 on the command doorbell; `2n`/`2n+1` for OUT/IN endpoint `n` on
    /// device doorbells, 1 for the control endpoint.
    pub target: u8,
    __: u8,
    pub stream_id: u16,
}

/// The doorbell array: one word for the command ring plus one per device
/// slot. A doorbell write is a single volatile store, performed after the
/// ring lock is dropped so the device never races a second producer.
#[derive(Debug)]
pub struct Doorbells {
    base: VirtAddr,
    len: usize,
}

impl Doorbells {
    /// # Safety
    /// `base` must point at the controller's doorbell array.
    pub unsafe fn new(base: VirtAddr, max_slots: usize) -> Self {
        Self {
            base,
            len: max_slots + 1,
        }
    }

    pub fn ring(&self, doorbell: u8, target: u8, stream_id: u16) {
        assert!((doorbell as usize) < self.len);
        let value = DoorbellValue::new()
            .with_target(target)
            .with_stream_id(stream_id);
        unsafe {
            self.base
                .into_ptr::<u32>()
                .add(doorbell as usize)
                .write_volatile(value.into_bits());
        }
    }

    pub fn ring_command(&self) {
        self.ring(0, 0, 0);
    }
}

/// Owner of the whole register window plus the DCBAA and scratchpad
/// storage the controller gets pointed at.
pub struct XhciRegisters {
    caps: *mut CapsRegs,
    op: *mut OperationalRegs,
    runtime: *mut RuntimeRegs,
    dcbaa: Option<DmaBuffer<u64>>,
    scratchpad_array: Option<DmaBuffer<u64>>,
    scratchpad_frames: alloc::vec::Vec<Frame>,
}

unsafe impl Send for XhciRegisters {}

impl XhciRegisters {
    /// Takes ownership of the MMIO window rooted at `caps`.
    ///
    /// # Safety
    /// `caps` must point at a mapped, uncached xHCI capability block that
    /// nothing else drives.
    pub unsafe fn new(caps: *mut CapsRegs) -> Self {
        unsafe {
            Self {
                caps,
                op: (*caps).operational_ptr(),
                runtime: (*caps).runtime_ptr(),
                dcbaa: None,
                scratchpad_array: None,
                scratchpad_frames: alloc::vec::Vec::new(),
            }
        }
    }

    pub fn caps(&self) -> &'static CapsRegs {
        unsafe { &*self.caps }
    }

    pub fn op(&mut self) -> &'static mut OperationalRegs {
        unsafe { &mut *self.op }
    }

    fn runtime(&mut self) -> &'static mut RuntimeRegs {
        unsafe { &mut *self.runtime }
    }

    pub fn interrupter(&mut self, index: usize) -> &'static mut InterrupterRegs {
        unsafe { &mut *self.runtime().interrupter_ptr(index) }
    }

    /// Waits out Controller Not Ready after power-up or reset.
    pub fn wait_ready(&mut self) -> Result<(), XhciError> {
        let op = self.op();
        if !sleep_until!(20000 ms, !read_ref!(op.usbsts).contains(UsbSts::CNR)) {
            error!(XhciRegisters, "controller never became ready (CNR stuck)");
            return Err(XhciError::InitTimeout("CNR clear"));
        }
        Ok(())
    }

    /// Stops and resets the controller to its power-on state.
    pub fn halt_and_reset(&mut self) -> Result<(), XhciError> {
        let op = self.op();

        write_ref!(op.usbcmd, read_ref!(op.usbcmd) - UsbCmd::RUN);
        if !sleep_until!(200 ms, read_ref!(op.usbsts).contains(UsbSts::HCHALTED)) {
            error!(XhciRegisters, "HCHALTED did not set: {:?}", read_ref!(op.usbsts));
            return Err(XhciError::InitTimeout("controller halt"));
        }

        write_ref!(op.usbcmd, read_ref!(op.usbcmd) | UsbCmd::HCRESET);
        if !sleep_until!(
            1000 ms,
            !read_ref!(op.usbcmd).contains(UsbCmd::HCRESET)
                && !read_ref!(op.usbsts).contains(UsbSts::CNR)
        ) {
            error!(XhciRegisters, "reset never completed: {:?}", read_ref!(op.usbcmd));
            return Err(XhciError::InitTimeout("controller reset"));
        }

        debug!(XhciRegisters, "controller reset\n{}", self.caps());
        Ok(())
    }

    /// Builds the device-context base-address array. Entry 0 points at the
    /// scratchpad pointer array when the controller asks for scratchpads.
    pub fn configure_dcbaa(&mut self) -> Result<(), XhciError> {
        let max_slots = self.caps().max_device_slots();
        let scratch_count = self.caps().max_scratchpad_buffers();

        let mut dcbaa: DmaBuffer<u64> =
            DmaBuffer::alloc(max_slots + 1).ok_or(XhciError::OutOfMemory)?;

        if scratch_count > 0 {
            let mut array: DmaBuffer<u64> =
                DmaBuffer::alloc(scratch_count).ok_or(XhciError::OutOfMemory)?;

            for i in 0..scratch_count {
                let frame = frame_allocator::allocate_frame().ok_or(XhciError::OutOfMemory)?;
                unsafe {
                    array.as_mut_slice()[i] = frame.phys_addr().into_raw() as u64;
                }
                self.scratchpad_frames.push(frame);
            }

            unsafe {
                dcbaa.as_mut_slice()[0] = array.phys_addr().into_raw() as u64;
            }
            self.scratchpad_array = Some(array);
        }

        let op = self.op();
        write_ref!(op.config, max_slots as u32);
        write_ref!(op.dnctrl, 0xFFFF);
        write_ref!(op.dcbaap, dcbaa.phys_addr().into_raw() as u64);
        self.dcbaa = Some(dcbaa);
        Ok(())
    }

    /// Points slot `slot_id`'s DCBAA entry at a device context.
    pub fn set_dcbaa_entry(&mut self, slot_id: u8, context: PhysAddr) {
        let dcbaa = self.dcbaa.as_mut().expect("DCBAA not configured");
        assert!(slot_id != 0 && (slot_id as usize) < dcbaa.len());
        unsafe {
            dcbaa
                .as_ptr()
                .add(slot_id as usize)
                .write_volatile(context.into_raw() as u64);
        }
    }

    pub fn clear_dcbaa_entry(&mut self, slot_id: u8) {
        let dcbaa = self.dcbaa.as_mut().expect("DCBAA not configured");
        assert!(slot_id != 0 && (slot_id as usize) < dcbaa.len());
        unsafe {
            dcbaa.as_ptr().add(slot_id as usize).write_volatile(0);
        }
    }

    /// Programs the command ring pointer with the producer cycle state.
    pub fn configure_crcr(&mut self, ring_base: PhysAddr, cycle: u8) {
        let op = self.op();
        write_ref!(op.crcr, (ring_base.into_raw() | cycle as usize) as u64);
    }

    /// Programs one interrupter against an event ring: size, dequeue,
    /// segment base, moderation, enable. The order matters to hardware.
    pub fn configure_interrupter(
        &mut self,
        index: usize,
        segment_count: u32,
        ring_base: PhysAddr,
        segment_table: PhysAddr,
    ) {
        let ir = self.interrupter(index);
        write_ref!(ir.erst_sz, segment_count);
        write_ref!(ir.erdp, ring_base.into_raw() as u64);
        write_ref!(ir.erst_base, segment_table.into_raw() as u64);
        write_ref!(ir.imod, IMOD_DEFAULT);
        write_ref!(ir.iman, Iman::INTERRUPT_ENABLE);
    }

    pub fn write_erdp(&mut self, index: usize, value: u64) {
        let ir = self.interrupter(index);
        write_ref!(ir.erdp, value);
    }

    /// Clears the sticky status bits and an interrupter's pending flag.
    pub fn acknowledge_irq(&mut self, interrupter: usize) {
        let op = self.op();
        write_ref!(op.usbsts, UsbSts::EINT);

        let ir = self.interrupter(interrupter);
        let iman = read_ref!(ir.iman) | Iman::INTERRUPT_PENDING;
        write_ref!(ir.iman, iman);
    }

    /// Flips the controller on and waits for it to leave the halted state.
    pub fn start(&mut self) -> Result<(), XhciError> {
        let op = self.op();
        write_ref!(op.usbsts, UsbSts::EINT);
        write_ref!(op.usbcmd, read_ref!(op.usbcmd) | UsbCmd::RUN | UsbCmd::INTE);

        if !sleep_until!(1000 ms, !read_ref!(op.usbsts).contains(UsbSts::HCHALTED)) {
            error!(
                XhciRegisters,
                "controller refused to run: {:?}",
                read_ref!(op.usbsts)
            );
            return Err(XhciError::InitTimeout("controller start"));
        }
        Ok(())
    }
}
