//! Transfer descriptor assembly.
//!
//! A control transfer is a setup TRB, zero or more data TRBs and a status
//! TRB with IOC. Data buffers are walked as physical ranges and split so no
//! TRB crosses a 64 KiB line; every fragment but the last carries the chain
//! bit, and `TD Size` counts the fragments still to come, clamped to the
//! width of the field. The last TRB targets the submitting CPU's
//! interrupter, so completion lands on the CPU that is waiting for it.

use alloc::vec::Vec;

use crate::{
    VirtAddr,
    memory::dma::{self, PhysRange},
};

use super::{
    XhciError,
    trb::{
        DataStageTrb, DeviceRequestPacket, NormalTrb, SetupStageTrb, StatusStageTrb, TRT_IN,
        TRT_NO_DATA, TRT_OUT, Trb,
    },
};

/// TRBs must not span a 64 KiB boundary.
const TRB_BOUNDARY: usize = 64 << 10;

/// TD Size saturates at its 5-bit field width.
const TD_SIZE_MAX: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub const fn is_in(self) -> bool {
        matches!(self, Self::In)
    }
}

/// Data-stage TRBs for `[buffer, buffer + len)`, chained into one TD.
/// `interrupt_short` sets ISP so an IN transfer that comes up short still
/// raises its event.
pub fn make_data_trbs(
    buffer: VirtAddr,
    len: usize,
    dir: Direction,
    interrupter: u16,
    interrupt_short: bool,
) -> Result<Vec<Trb>, XhciError> {
    if len == 0 {
        return Ok(Vec::new());
    }

    let ranges: Vec<PhysRange> =
        dma::phys_ranges(buffer, len, TRB_BOUNDARY).ok_or(XhciError::BadBuffer)?;

    let mut trbs = Vec::with_capacity(ranges.len());
    let count = ranges.len();

    for (i, range) in ranges.iter().enumerate() {
        let last = i + 1 == count;
        let mut data = DataStageTrb::new(range.addr, range.len as u32, interrupter);
        data.status
            .set_td_size((count - i - 1).min(TD_SIZE_MAX) as u8);
        data.info.set_dir_in(dir.is_in());
        data.info.set_chain(!last);
        data.info.set_isp(interrupt_short);
        data.info.set_ioc(interrupt_short && last);
        trbs.push(data.into_trb());
    }

    Ok(trbs)
}

/// A complete control TD: setup, optional data stages, status stage.
/// The status stage runs opposite to the data direction and carries IOC.
pub fn make_setup_trbs(
    packet: DeviceRequestPacket,
    buffer: Option<(VirtAddr, usize)>,
    dir: Direction,
    interrupter: u16,
) -> Result<Vec<Trb>, XhciError> {
    let (data_len, data_trbs) = match buffer {
        Some((addr, len)) if len > 0 => (len, make_data_trbs(addr, len, dir, interrupter, false)?),
        _ => (0, Vec::new()),
    };

    let trt = if data_len == 0 {
        TRT_NO_DATA
    } else if dir.is_in() {
        TRT_IN
    } else {
        TRT_OUT
    };

    let mut trbs = Vec::with_capacity(data_trbs.len() + 2);
    trbs.push(SetupStageTrb::new(packet, trt, interrupter).into_trb());
    trbs.extend(data_trbs);

    let status_in = !(data_len > 0 && dir.is_in());
    trbs.push(StatusStageTrb::new(status_in, interrupter).into_trb());

    Ok(trbs)
}

/// A bulk or interrupt TD over `[buffer, buffer + len)`; the final
/// fragment interrupts on completion.
pub fn make_normal_trbs(
    buffer: VirtAddr,
    len: usize,
    interrupter: u16,
) -> Result<Vec<Trb>, XhciError> {
    let ranges: Vec<PhysRange> =
        dma::phys_ranges(buffer, len, TRB_BOUNDARY).ok_or(XhciError::BadBuffer)?;

    let mut trbs = Vec::with_capacity(ranges.len());
    let count = ranges.len();

    for (i, range) in ranges.iter().enumerate() {
        let last = i + 1 == count;
        let mut normal = NormalTrb::new(range.addr, range.len as u32, interrupter);
        normal
            .status
            .set_td_size((count - i - 1).min(TD_SIZE_MAX) as u8);
        normal.info.set_chain(!last);
        normal.info.set_isp(true);
        normal.info.set_ioc(last);
        trbs.push(normal.into_trb());
    }

    Ok(trbs)
}
