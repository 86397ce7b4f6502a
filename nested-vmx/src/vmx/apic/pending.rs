use crate::vmx::{events::ForceFlags, vcpu::Vcpu};

/// A virtualized write to the virtual-APIC page that still needs APIC-write emulation.
///
/// Latched when the write is stored and taken exactly once when the instruction that made it
/// retires. At most one write can be outstanding, a second access to the APIC-access page exits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingApicWrite {
    /// Offset of the written register in the virtual-APIC page.
    pub offset: u16,
}

impl Vcpu {
    pub fn has_pending_apic_write(&self) -> bool {
        self.data.pending_apic_write.is_some()
    }

    pub(crate) fn latch_apic_write(&mut self, offset: u16) {
        log::trace!("Latching APIC write at offset {:#x}", offset);

        self.data.pending_apic_write = Some(PendingApicWrite { offset });
        self.data.force_flags.insert(ForceFlags::APIC_WRITE);
    }

    pub(crate) fn take_pending_apic_write(&mut self) -> Option<PendingApicWrite> {
        self.data.force_flags.remove(ForceFlags::APIC_WRITE);
        self.data.pending_apic_write.take()
    }
}
