//! Transfer Request Blocks.
//!
//! Every descriptor the controller touches is 16 bytes: a 64-bit parameter,
//! a 32-bit status word and a 32-bit control word whose low bit is the
//! cycle bit and whose bits 10..15 carry the TRB type. The typed structures
//! here all share that layout and convert to the raw [`Trb`] by transmute,
//! with size asserts pinning each one to 16 bytes.

use bitfield_struct::bitfield;
use vesper_abi::Errno;

use crate::PhysAddr;

pub const TRB_TYPE_NORMAL: u8 = 0x1;
pub const TRB_TYPE_SETUP_STAGE: u8 = 0x2;
pub const TRB_TYPE_DATA_STAGE: u8 = 0x3;
pub const TRB_TYPE_STATUS_STAGE: u8 = 0x4;
pub const TRB_TYPE_LINK: u8 = 0x6;
pub const TRB_TYPE_EVENT_DATA: u8 = 0x7;
pub const TRB_TYPE_NOOP: u8 = 0x8;

pub const TRB_TYPE_ENABLE_SLOT_CMD: u8 = 0x9;
pub const TRB_TYPE_DISABLE_SLOT_CMD: u8 = 0xA;
pub const TRB_TYPE_ADDRESS_DEVICE_CMD: u8 = 0xB;
pub const TRB_TYPE_CONFIGURE_ENDPOINT_CMD: u8 = 0xC;
pub const TRB_TYPE_EVALUATE_CONTEXT_CMD: u8 = 0xD;
pub const TRB_TYPE_RESET_ENDPOINT_CMD: u8 = 0xE;
pub const TRB_TYPE_STOP_ENDPOINT_CMD: u8 = 0xF;
pub const TRB_TYPE_SET_TR_DEQUEUE_CMD: u8 = 0x10;
pub const TRB_TYPE_NOOP_CMD: u8 = 0x17;

pub const TRB_TYPE_TRANSFER_EVENT: u8 = 0x20;
pub const TRB_TYPE_CMD_COMPLETION: u8 = 0x21;
pub const TRB_TYPE_PORT_STATUS_CHANGE_EVENT: u8 = 0x22;
pub const TRB_TYPE_DOORBELL_EVENT: u8 = 0x24;
pub const TRB_TYPE_MFINDEX_WRAP_EVENT: u8 = 0x27;

/// The control word common to every TRB.
#[bitfield(u32)]
pub struct TrbControl {
    #[bits(1)]
    pub cycle_bit: u8,
    /// Toggle-cycle on link TRBs, evaluate-next on transfer TRBs.
    pub toggle_cycle: bool,
    #[bits(2)]
    __: (),
    /// Chain: this TRB and the next belong to one TD; link TRBs inherit it
    /// so a chained TD survives the wrap.
    pub chain: bool,
    pub ioc: bool,
    #[bits(4)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    /// Type-specific upper half (slot/endpoint ids, TRT, direction).
    pub rest: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: TrbControl,
}

const _: () = assert!(size_of::<Trb>() == 16);

impl Trb {
    pub const fn new(control: TrbControl, status: u32, parameter: u64) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    pub const fn zeroed() -> Self {
        Self::new(TrbControl::new(), 0, 0)
    }

    pub fn noop_cmd() -> Self {
        Self::new(TrbControl::new().with_trb_type(TRB_TYPE_NOOP_CMD), 0, 0)
    }

    /// A link TRB pointing back at `ring_base`, with toggle-cycle set.
    pub fn new_link(ring_base: PhysAddr, cycle_bit: u8) -> Self {
        assert!(cycle_bit <= 1);
        Self::new(
            TrbControl::new()
                .with_trb_type(TRB_TYPE_LINK)
                .with_toggle_cycle(true)
                .with_cycle_bit(cycle_bit),
            0,
            ring_base.into_raw() as u64,
        )
    }

    /// Attempts to convert self into a known event TRB.
    pub fn into_event_trb(self) -> Option<EventTrb> {
        macro_rules! decided {
            ($variant: ident) => {
                Some(EventTrb::$variant(unsafe { core::mem::transmute(self) }))
            };
        }
        match self.control.trb_type() {
            TRB_TYPE_CMD_COMPLETION => decided!(CommandCompletion),
            TRB_TYPE_TRANSFER_EVENT => decided!(Transfer),
            TRB_TYPE_PORT_STATUS_CHANGE_EVENT => decided!(PortStatusChange),
            TRB_TYPE_DOORBELL_EVENT | TRB_TYPE_MFINDEX_WRAP_EVENT => Some(EventTrb::Other(self)),
            _ => None,
        }
    }
}

pub enum EventTrb {
    CommandCompletion(CommandCompletionTrb),
    Transfer(TransferEventTrb),
    PortStatusChange(PortStatusChangeTrb),
    /// Carried for completeness; consumed without dispatch.
    Other(Trb),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferErr = 2,
    BabbleDetectedErr = 3,
    UsbTransactionErr = 4,
    TrbErr = 5,
    StallErr = 6,
    ResourceErr = 7,
    BandwidthErr = 8,
    NoSlotsAvailable = 9,
    InvalidStreamType = 0xA,
    SlotNotEnabled = 0xB,
    EndpointNotEnabled = 0xC,
    ShortPacket = 0xD,
    RingUnderrun = 0xE,
    RingOverrun = 0xF,
    VfEventRingFull = 0x10,
    ParameterErr = 0x11,
    BandwidthOverrun = 0x12,
    ContextStateErr = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
    StoppedShortPacket = 0x1C,
    MaxExitLatencyErr = 0x1D,
    Other,
}

impl CompletionCode {
    pub const fn from_bits(bits: u8) -> Self {
        if bits >= Self::Other as u8 {
            Self::Other
        } else {
            unsafe { core::mem::transmute(bits) }
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    pub const fn is_success(self) -> bool {
        // A short packet retires the TD without error.
        matches!(self, Self::Success | Self::ShortPacket)
    }

    /// The errno a failed completion surfaces as.
    pub const fn as_errno(self) -> Errno {
        match self {
            Self::StallErr => Errno::Pipe,
            Self::ResourceErr | Self::NoSlotsAvailable | Self::BandwidthErr => Errno::Busy,
            Self::ParameterErr | Self::TrbErr | Self::ContextStateErr => Errno::Inval,
            Self::IncompatibleDevice | Self::SlotNotEnabled | Self::EndpointNotEnabled => {
                Errno::NoDev
            }
            Self::NoPingResponse | Self::MissedService => Errno::TimedOut,
            _ => Errno::Proto,
        }
    }
}

#[bitfield(u32)]
pub struct EventStatus {
    /// Residual transfer length on transfer events, completion parameter on
    /// command completions.
    #[bits(24)]
    pub parameter: u32,
    #[bits(8)]
    pub code: CompletionCode,
}

#[bitfield(u32)]
pub struct CommandCompletionInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(9)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    pub vfid: u8,
    pub slot_id: u8,
}

/// Command Completion event (type 33).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CommandCompletionTrb {
    /// Physical address of the command TRB this event answers.
    pub trb_ptr: u64,
    pub status: EventStatus,
    pub info: CommandCompletionInfo,
}

const _: () = assert!(size_of::<CommandCompletionTrb>() == 16);

#[bitfield(u32)]
pub struct TransferEventInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(1)]
    __: (),
    /// Set when the TRB pointer refers to an event-data TRB's payload.
    pub event_data: bool,
    #[bits(7)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    #[bits(5)]
    pub endpoint_id: u8,
    #[bits(3)]
    __: (),
    pub slot_id: u8,
}

/// Transfer event (type 32).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TransferEventTrb {
    /// Physical address of the transfer TRB (usually the IOC one).
    pub trb_ptr: u64,
    pub status: EventStatus,
    pub info: TransferEventInfo,
}

const _: () = assert!(size_of::<TransferEventTrb>() == 16);

#[bitfield(u64)]
pub struct PortStatusChangeParameter {
    #[bits(24)]
    __: (),
    pub port_id: u8,
    __: u32,
}

impl PortStatusChangeParameter {
    /// Ports are reported 1-based.
    pub fn port_index(&self) -> u8 {
        self.port_id() - 1
    }
}

/// Port Status Change event (type 34).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PortStatusChangeTrb {
    pub parameter: PortStatusChangeParameter,
    pub status: EventStatus,
    pub info: CommandCompletionInfo,
}

const _: () = assert!(size_of::<PortStatusChangeTrb>() == 16);

#[bitfield(u32)]
pub struct SlottedCommandInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(8)]
    __: (),
    /// Block Set Address Request on Address Device; deconfigure on
    /// Configure Endpoint.
    pub flag: bool,
    #[bits(6)]
    pub trb_type: u8,
    #[bits(5)]
    pub endpoint_id: u8,
    #[bits(3)]
    __: (),
    pub slot_id: u8,
}

/// The slot-addressed command shape shared by Address Device, Configure
/// Endpoint, Evaluate Context, Reset Endpoint, Stop Endpoint and Set TR
/// Dequeue Pointer.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SlottedCommandTrb {
    pub parameter: u64,
    __: u32,
    pub info: SlottedCommandInfo,
}

const _: () = assert!(size_of::<SlottedCommandTrb>() == 16);

impl SlottedCommandTrb {
    pub const fn into_trb(self) -> Trb {
        unsafe { core::mem::transmute(self) }
    }

    fn new(trb_type: u8, parameter: u64, slot_id: u8) -> Self {
        Self {
            parameter,
            __: 0,
            info: SlottedCommandInfo::new()
                .with_trb_type(trb_type)
                .with_slot_id(slot_id),
        }
    }

    pub fn enable_slot() -> Self {
        Self::new(TRB_TYPE_ENABLE_SLOT_CMD, 0, 0)
    }

    pub fn disable_slot(slot_id: u8) -> Self {
        Self::new(TRB_TYPE_DISABLE_SLOT_CMD, 0, slot_id)
    }

    /// `bsr` suppresses the USB SET_ADDRESS request and only updates the
    /// controller's context.
    pub fn address_device(input_ctx: PhysAddr, slot_id: u8, bsr: bool) -> Self {
        let mut cmd = Self::new(
            TRB_TYPE_ADDRESS_DEVICE_CMD,
            input_ctx.into_raw() as u64,
            slot_id,
        );
        cmd.info.set_flag(bsr);
        cmd
    }

    pub fn configure_endpoint(input_ctx: PhysAddr, slot_id: u8) -> Self {
        Self::new(
            TRB_TYPE_CONFIGURE_ENDPOINT_CMD,
            input_ctx.into_raw() as u64,
            slot_id,
        )
    }

    pub fn evaluate_context(input_ctx: PhysAddr, slot_id: u8) -> Self {
        Self::new(
            TRB_TYPE_EVALUATE_CONTEXT_CMD,
            input_ctx.into_raw() as u64,
            slot_id,
        )
    }

    pub fn reset_endpoint(slot_id: u8, endpoint_id: u8) -> Self {
        let mut cmd = Self::new(TRB_TYPE_RESET_ENDPOINT_CMD, 0, slot_id);
        cmd.info.set_endpoint_id(endpoint_id);
        cmd
    }

    pub fn stop_endpoint(slot_id: u8, endpoint_id: u8) -> Self {
        let mut cmd = Self::new(TRB_TYPE_STOP_ENDPOINT_CMD, 0, slot_id);
        cmd.info.set_endpoint_id(endpoint_id);
        cmd
    }

    /// `dequeue` carries the dequeue cycle state in bit 0.
    pub fn set_tr_dequeue(dequeue: PhysAddr, cycle: u8, slot_id: u8, endpoint_id: u8) -> Self {
        let mut cmd = Self::new(
            TRB_TYPE_SET_TR_DEQUEUE_CMD,
            (dequeue.into_raw() | cycle as usize) as u64,
            slot_id,
        );
        cmd.info.set_endpoint_id(endpoint_id);
        cmd
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    Reserved = 4,
}

impl PacketRecipient {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    pub const fn from_bits(bits: u8) -> Self {
        if bits < Self::Reserved as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::Reserved
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

impl PacketType {
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    pub const fn from_bits(bits: u8) -> Self {
        if bits < Self::Reserved as u8 {
            unsafe { core::mem::transmute(bits) }
        } else {
            Self::Reserved
        }
    }
}

/// The 8-byte USB SETUP packet, carried immediate in a setup-stage TRB.
#[bitfield(u64)]
pub struct DeviceRequestPacket {
    #[bits(5)]
    pub recipient: PacketRecipient,
    #[bits(2)]
    pub p_type: PacketType,
    pub device_to_host: bool,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

/// Transfer type of a setup stage TRB.
pub const TRT_NO_DATA: u8 = 0;
pub const TRT_OUT: u8 = 2;
pub const TRT_IN: u8 = 3;

#[bitfield(u32)]
pub struct TransferStatus {
    #[bits(17)]
    pub trb_transfer_length: u32,
    /// Remaining fragments of the TD, clamped to the field width.
    #[bits(5)]
    pub td_size: u8,
    #[bits(10)]
    pub interrupter_target: u16,
}

#[bitfield(u32)]
pub struct SetupStageInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    #[bits(4)]
    __: (),
    pub ioc: bool,
    /// Immediate data; always set on a setup stage.
    pub idt: bool,
    #[bits(3)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    #[bits(2)]
    pub trt: u8,
    #[bits(14)]
    __: (),
}

/// Setup Stage TRB; initiates a control transfer.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SetupStageTrb {
    pub parameter: DeviceRequestPacket,
    pub status: TransferStatus,
    pub info: SetupStageInfo,
}

const _: () = assert!(size_of::<SetupStageTrb>() == 16);

impl SetupStageTrb {
    pub fn new(packet: DeviceRequestPacket, trt: u8, interrupter: u16) -> Self {
        Self {
            parameter: packet,
            status: TransferStatus::new()
                .with_trb_transfer_length(8)
                .with_interrupter_target(interrupter),
            info: SetupStageInfo::new()
                .with_idt(true)
                .with_trt(trt)
                .with_trb_type(TRB_TYPE_SETUP_STAGE),
        }
    }

    pub const fn into_trb(self) -> Trb {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
pub struct DataStageInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    /// Evaluate next TRB before saving endpoint state.
    pub ent: bool,
    /// Interrupt on short packet.
    pub isp: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub ioc: bool,
    pub idt: bool,
    #[bits(3)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    pub dir_in: bool,
    #[bits(15)]
    __: (),
}

/// Data Stage TRB; also the layout of the Normal TRBs chained behind it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DataStageTrb {
    pub buffer: u64,
    pub status: TransferStatus,
    pub info: DataStageInfo,
}

const _: () = assert!(size_of::<DataStageTrb>() == 16);

impl DataStageTrb {
    pub fn new(buffer: PhysAddr, len: u32, interrupter: u16) -> Self {
        Self {
            buffer: buffer.into_raw() as u64,
            status: TransferStatus::new()
                .with_trb_transfer_length(len)
                .with_interrupter_target(interrupter),
            info: DataStageInfo::new().with_trb_type(TRB_TYPE_DATA_STAGE),
        }
    }

    pub const fn into_trb(self) -> Trb {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
pub struct StatusStageInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    pub ent: bool,
    #[bits(2)]
    __: (),
    pub chain: bool,
    pub ioc: bool,
    #[bits(4)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    pub dir_in: bool,
    #[bits(15)]
    __: (),
}

/// Status Stage TRB; completes a control transfer.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct StatusStageTrb {
    __: u64,
    pub status: TransferStatus,
    pub info: StatusStageInfo,
}

const _: () = assert!(size_of::<StatusStageTrb>() == 16);

impl StatusStageTrb {
    pub fn new(dir_in: bool, interrupter: u16) -> Self {
        Self {
            __: 0,
            status: TransferStatus::new().with_interrupter_target(interrupter),
            info: StatusStageInfo::new()
                .with_dir_in(dir_in)
                .with_ioc(true)
                .with_trb_type(TRB_TYPE_STATUS_STAGE),
        }
    }

    pub const fn into_trb(self) -> Trb {
        unsafe { core::mem::transmute(self) }
    }
}

#[bitfield(u32)]
pub struct NormalInfo {
    #[bits(1)]
    pub cycle_bit: u8,
    pub ent: bool,
    pub isp: bool,
    pub no_snoop: bool,
    pub chain: bool,
    pub ioc: bool,
    pub idt: bool,
    #[bits(3)]
    __: (),
    #[bits(6)]
    pub trb_type: u8,
    #[bits(16)]
    __: (),
}

/// Normal TRB; the workhorse of bulk and interrupt transfers.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NormalTrb {
    pub buffer: u64,
    pub status: TransferStatus,
    pub info: NormalInfo,
}

const _: () = assert!(size_of::<NormalTrb>() == 16);

impl NormalTrb {
    pub fn new(buffer: PhysAddr, len: u32, interrupter: u16) -> Self {
        Self {
            buffer: buffer.into_raw() as u64,
            status: TransferStatus::new()
                .with_trb_transfer_length(len)
                .with_interrupter_target(interrupter),
            info: NormalInfo::new().with_trb_type(TRB_TYPE_NORMAL),
        }
    }

    pub const fn into_trb(self) -> Trb {
        unsafe { core::mem::transmute(self) }
    }
}
