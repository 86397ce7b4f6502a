//! The outer emulator as seen by the nested VMX engine.

use crate::{
    cpu::CpuContext,
    vmx::{error::VmxResult, events::TrapEvent},
};

/// What backs a guest-physical page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageKind {
    /// Ordinary RAM, the only kind VMX structures may live in.
    Ram,
    Mmio,
    Rom,
    Unassigned,
}

/// Failure of a guest MSR access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsrAccessError {
    /// The MSR does not exist or the value is invalid (#GP in the guest).
    Reserved,
    /// The access must be completed outside the emulator thread.
    NeedsHost,
}

/// Collaborators of the engine. Implemented by the instruction emulator of the outer virtual machine.
///
/// Memory accesses copy explicitly, the engine never holds references into guest memory.
pub trait Platform {
    fn read_phys(&self, gpa: u64, buf: &mut [u8]) -> VmxResult<()>;

    fn write_phys(&mut self, gpa: u64, buf: &[u8]) -> VmxResult<()>;

    fn page_kind(&self, gpa: u64) -> PageKind;

    /// Reads from a linear address of the current guest (segmentation already applied).
    fn read_linear(&self, addr: u64, buf: &mut [u8]) -> VmxResult<()>;

    fn write_linear(&mut self, addr: u64, buf: &[u8]) -> VmxResult<()>;

    fn read_msr(&self, msr: u32) -> Result<u64, MsrAccessError>;

    fn write_msr(&mut self, msr: u32, value: u64) -> Result<(), MsrAccessError>;

    /// Hands an event to the injection sink; it is delivered before the next guest instruction.
    fn inject_event(&mut self, event: TrapEvent);

    /// Invoked on every VMX transition after the new CR0/CR3/CR4/EFER are in place.
    fn paging_mode_changed(&mut self, ctx: &CpuContext);

    fn flush_tlb(&mut self);

    /// Routes raw accesses to the page into the virtual-APIC engine.
    fn register_apic_access_page(&mut self, gpa: u64);

    fn deregister_apic_access_page(&mut self, gpa: u64);

    /// Current value of the guest TSC.
    fn tsc(&self) -> u64;

    fn read_phys_u32(&self, gpa: u64) -> VmxResult<u32> {
        let mut buf = [0u8; 4];
        self.read_phys(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_phys_u64(&self, gpa: u64) -> VmxResult<u64> {
        let mut buf = [0u8; 8];
        self.read_phys(gpa, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_phys_u32(&mut self, gpa: u64, value: u32) -> VmxResult<()> {
        self.write_phys(gpa, &value.to_le_bytes())
    }

    fn write_phys_u64(&mut self, gpa: u64, value: u64) -> VmxResult<()> {
        self.write_phys(gpa, &value.to_le_bytes())
    }

    /// Whether every byte of `[gpa, gpa + len)` is ordinary RAM.
    fn is_ram(&self, gpa: u64, len: u64) -> bool {
        let first = gpa >> 12;
        let last = gpa.saturating_add(len.max(1) - 1) >> 12;
        (first..=last).all(|page| self.page_kind(page << 12) == PageKind::Ram)
    }
}

