//! Interrupt receiver registry.
//!
//! Vector allocation and controller programming (MSI-X tables, the I/O
//! APIC) are the platform's business; drivers register a receiver per
//! vector here, and the platform's IRQ stubs call [`dispatch`]. Receivers
//! run with interrupts disabled and must only acknowledge hardware and
//! hand off work.

use core::fmt::Debug;

use alloc::vec::Vec;

use crate::utils::locks::SpinLock;

pub trait InterruptReceiver: Send + Sync + Debug {
    fn handle_interrupt(&self, vector: u32);
}

/// How a device's interrupts reach us; produced by the PCI layer.
#[derive(Debug, Clone)]
pub enum IrqBinding {
    /// Message-signaled, one entry per allocated vector.
    MsiX { vectors: Vec<u32> },
    /// Legacy pin routed to a single vector.
    Pin { vector: u32 },
}

impl IrqBinding {
    pub fn vectors(&self) -> &[u32] {
        match self {
            Self::MsiX { vectors } => vectors,
            Self::Pin { vector } => core::slice::from_ref(vector),
        }
    }

    pub const fn is_msix(&self) -> bool {
        matches!(self, Self::MsiX { .. })
    }
}

struct Registration {
    vector: u32,
    handler: &'static dyn InterruptReceiver,
}

static RECEIVERS: SpinLock<Vec<Registration>> = SpinLock::new(Vec::new());

/// Attach `handler` to every vector of `binding`.
pub fn register_irq(binding: &IrqBinding, handler: &'static dyn InterruptReceiver) {
    let mut receivers = RECEIVERS.lock();
    for &vector in binding.vectors() {
        receivers.push(Registration { vector, handler });
    }
}

/// Called by the platform's interrupt stubs with the faulting vector.
pub fn dispatch(vector: u32) {
    // Handlers are registered once at driver attach; the snapshot keeps the
    // registry lock out of the handler's runtime.
    let handler = RECEIVERS
        .lock()
        .iter()
        .find(|r| r.vector == vector)
        .map(|r| r.handler);

    if let Some(handler) = handler {
        handler.handle_interrupt(vector);
    }
}
