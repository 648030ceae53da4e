//! Producer and consumer TRB rings.
//!
//! Ownership of a slot is carried entirely by its cycle bit: the device
//! owns a slot once the slot's cycle equals the producer's current cycle.
//! The producer therefore writes the first three words of a TRB while the
//! slot still looks stale to the device, and publishes the cycle bit last
//! with a release store. The ordering is the contract; volatile access
//! alone would not be enough.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{PhysAddr, memory::dma::DmaBuffer};

use super::{XhciError, trb::Trb};

/// A producer ring (command or transfer). The last slot is reserved for a
/// link TRB pointing back at the base; traversing it flips the consumer's
/// cycle, so the producer flips its own in step when it wraps.
#[derive(Debug)]
pub struct TrbRing {
    trbs: DmaBuffer<Trb>,
    /// Usable slots; one less than allocated once the link is reserved.
    count: usize,
    next: usize,
    cycle: u8,
}

impl TrbRing {
    /// Allocates `trb_count` zeroed TRBs of pinned memory with the producer
    /// cycle at 1, then reserves the trailing link TRB.
    pub fn alloc(trb_count: usize) -> Result<Self, XhciError> {
        assert!(trb_count >= 2);
        let trbs = DmaBuffer::alloc(trb_count).ok_or(XhciError::OutOfMemory)?;

        let mut ring = Self {
            trbs,
            count: trb_count,
            next: 0,
            cycle: 1,
        };
        ring.reserve_link();
        Ok(ring)
    }

    /// Takes the last slot for the link TRB. Its cycle starts out *stale*
    /// (the complement of the producer cycle) so the consumer cannot chase
    /// it around before the first wrap publishes it.
    fn reserve_link(&mut self) {
        self.count -= 1;
        let link = Trb::new_link(self.trbs.phys_addr(), !self.cycle & 1);
        unsafe {
            self.trb_ptr(self.count).write_volatile(link);
        }
    }

    fn trb_ptr(&self, index: usize) -> *mut Trb {
        assert!(index < self.trbs.len());
        unsafe { self.trbs.as_ptr().add(index) }
    }

    /// Word 3 of a slot, as the atomic the device synchronizes on.
    fn control_word(&self, index: usize) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.trb_ptr(index).cast::<u32>().add(3)) }
    }

    /// Writes `src` into the next slot, publishing the cycle bit last, and
    /// returns the slot's physical address for pending-command tracking.
    /// On wrap the link TRB inherits `src`'s chain bit, its cycle is
    /// published the same way, and the producer cycle flips.
    ///
    /// There is no back-pressure here: overrunning the ring is a caller
    /// bug, bounded by counting outstanding completions.
    pub fn insert(&mut self, src: &Trb) -> PhysAddr {
        let slot = self.next;
        let dst = self.trb_ptr(slot);
        let control = self.control_word(slot);

        // The slot must still carry the stale cycle; otherwise the producer
        // lapped the consumer.
        debug_assert_eq!(
            (control.load(Ordering::Relaxed) & 1) as u8,
            !self.cycle & 1,
            "ring overrun at slot {slot}"
        );

        let staged = src
            .control
            .with_cycle_bit(!self.cycle & 1);
        let published = src.control.with_cycle_bit(self.cycle);

        unsafe {
            let words = dst.cast::<u32>();
            words.add(0).write_volatile(src.parameter as u32);
            words.add(1).write_volatile((src.parameter >> 32) as u32);
            words.add(2).write_volatile(src.status);
            // Stage word 3 with the non-executing cycle first, then flip it
            // visible with release ordering.
            words.add(3).write_volatile(staged.into_bits());
        }
        control.store(published.into_bits(), Ordering::Release);

        let phys = self.trbs.phys_addr_of(slot);

        self.next += 1;
        if self.next >= self.count {
            let link_control = self.control_word(self.count);
            let mut link_word = link_control.load(Ordering::Relaxed);

            debug_assert_eq!((link_word & 1) as u8, !self.cycle & 1);

            // Propagate a chain across the link so a TD spanning the wrap
            // stays one TD, then hand the link to the consumer.
            const CHAIN: u32 = 1 << 4;
            link_word = (link_word & !(CHAIN | 1)) | (src.control.chain() as u32 * CHAIN);
            link_control.store(link_word | self.cycle as u32, Ordering::Release);

            self.cycle = !self.cycle & 1;
            self.next = 0;
        }

        phys
    }

    pub fn base_phys(&self) -> PhysAddr {
        self.trbs.phys_addr()
    }

    /// Physical address of the next slot to be produced; endpoint contexts
    /// use it as the initial TR dequeue pointer.
    pub fn enqueue_phys(&self) -> PhysAddr {
        self.trbs.phys_addr_of(self.next)
    }

    pub const fn cycle(&self) -> u8 {
        self.cycle
    }

    pub const fn usable_slots(&self) -> usize {
        self.count
    }

    pub const fn next_index(&self) -> usize {
        self.next
    }

    /// Raw view of a slot; tests and the event path peek at produced TRBs.
    pub fn peek(&self, index: usize) -> Trb {
        unsafe { self.trb_ptr(index).read_volatile() }
    }
}

/// One entry of an Event Ring Segment Table.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ErstEntry {
    ring_segment_base: u64,
    /// Only the low 16 bits are valid.
    ring_segment_size: u32,
    __: u32,
}

const _: () = assert!(size_of::<ErstEntry>() == 16);

/// Bottom bit of ERDP: event handler busy, cleared by the ERDP write.
pub const ERDP_EHB: u64 = 1 << 3;

/// A consumer ring the controller produces events into, plus its one-entry
/// segment table. Consumption is single threaded per interrupter, so no
/// lock is needed on the ring itself.
#[derive(Debug)]
pub struct EventRing {
    trbs: DmaBuffer<Trb>,
    segment_table: DmaBuffer<ErstEntry>,
    next: usize,
    cycle: u8,
}

impl EventRing {
    pub fn alloc(trb_count: usize) -> Result<Self, XhciError> {
        let trbs: DmaBuffer<Trb> = DmaBuffer::alloc(trb_count).ok_or(XhciError::OutOfMemory)?;
        let segment_table: DmaBuffer<ErstEntry> =
            DmaBuffer::alloc(1).ok_or(XhciError::OutOfMemory)?;

        let entry = ErstEntry {
            ring_segment_base: trbs.phys_addr().into_raw() as u64,
            ring_segment_size: trb_count as u32,
            __: 0,
        };
        unsafe { segment_table.as_ptr().write_volatile(entry) };

        Ok(Self {
            trbs,
            segment_table,
            next: 0,
            cycle: 1,
        })
    }

    pub fn base_phys(&self) -> PhysAddr {
        self.trbs.phys_addr()
    }

    pub fn segment_table_phys(&self) -> PhysAddr {
        self.segment_table.phys_addr()
    }

    pub const fn segment_count(&self) -> u32 {
        1
    }

    /// Consumes the next event if the controller has produced one: its
    /// cycle bit must match our expected cycle.
    pub fn pop(&mut self) -> Option<Trb> {
        let slot = unsafe { self.trbs.as_ptr().add(self.next) };
        let control = unsafe { AtomicU32::from_ptr(slot.cast::<u32>().add(3)) };
        if (control.load(Ordering::Acquire) & 1) as u8 != self.cycle {
            return None;
        }

        let event = unsafe { slot.read_volatile() };

        self.next += 1;
        if self.next >= self.trbs.len() {
            self.next = 0;
            self.cycle = !self.cycle & 1;
        }

        Some(event)
    }

    /// The value to write to ERDP after consuming: the next dequeue slot,
    /// with the handler-busy bit to clear it.
    pub fn erdp_value(&self) -> u64 {
        (self.trbs.phys_addr_of(self.next).into_raw() as u64) | ERDP_EHB
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::xhci::trb::{TRB_TYPE_LINK, TRB_TYPE_NOOP_CMD};
    use crate::test_support;

    #[test]
    fn wrap_flips_cycle_and_publishes_link() {
        test_support::init();

        // 4 TRBs: 3 usable plus the trailing link.
        let mut ring = TrbRing::alloc(4).unwrap();
        assert_eq!(ring.usable_slots(), 3);
        assert_eq!(ring.cycle(), 1);

        let link = ring.peek(3);
        assert_eq!(link.control.trb_type(), TRB_TYPE_LINK);
        assert!(link.control.toggle_cycle());
        // Stale until the first wrap.
        assert_eq!(link.control.cycle_bit(), 0);
        assert_eq!(link.parameter, ring.base_phys().into_raw() as u64);

        for _ in 0..3 {
            ring.insert(&Trb::noop_cmd());
        }

        // Filling the last usable slot published the link with the old
        // cycle and flipped the producer cycle.
        assert_eq!(ring.peek(3).control.cycle_bit(), 1);
        assert_eq!(ring.cycle(), 0);
        assert_eq!(ring.next_index(), 0);

        // Two more inserts land on slots 0 and 1 with the flipped cycle.
        ring.insert(&Trb::noop_cmd());
        ring.insert(&Trb::noop_cmd());
        assert_eq!(ring.peek(0).control.cycle_bit(), 0);
        assert_eq!(ring.peek(0).control.trb_type(), TRB_TYPE_NOOP_CMD);
        assert_eq!(ring.peek(1).control.cycle_bit(), 0);
        // Slot 2 still carries the previous lap's cycle.
        assert_eq!(ring.peek(2).control.cycle_bit(), 1);
        assert_eq!(ring.next_index(), 2);
    }

    #[test]
    fn insert_reports_slot_physical_addresses() {
        test_support::init();

        let mut ring = TrbRing::alloc(8).unwrap();
        let base = ring.base_phys();
        for i in 0..7 {
            let phys = ring.insert(&Trb::noop_cmd());
            assert_eq!(phys, base + i * 16);
        }
        // Wrapped: the next insert is slot 0 again.
        let phys = ring.insert(&Trb::noop_cmd());
        assert_eq!(phys, base);
    }

    #[test]
    fn chain_bit_propagates_across_the_link() {
        test_support::init();

        let mut ring = TrbRing::alloc(3).unwrap();
        let mut chained = Trb::noop_cmd();
        chained.control.set_chain(true);

        ring.insert(&Trb::noop_cmd());
        ring.insert(&chained);

        let link = ring.peek(2);
        assert!(link.control.chain());
        assert_eq!(link.control.cycle_bit(), 1);
    }

    #[test]
    fn event_ring_consumption_follows_cycle() {
        test_support::init();

        let mut ring = EventRing::alloc(4).unwrap();
        assert!(ring.pop().is_none());

        // Produce two events the way the controller would: payload first,
        // cycle bit last.
        let slots = ring.trbs.as_ptr();
        for i in 0..2u64 {
            let mut event = Trb::zeroed();
            event.parameter = 0x1000 + i;
            event.control.set_cycle_bit(1);
            unsafe { slots.add(i as usize).write_volatile(event) };
        }

        assert_eq!(ring.pop().unwrap().parameter, 0x1000);
        assert_eq!(ring.pop().unwrap().parameter, 0x1001);
        assert!(ring.pop().is_none());
        assert_eq!(
            ring.erdp_value(),
            (ring.base_phys().into_raw() as u64 + 2 * 16) | ERDP_EHB
        );
    }
}
