//! xAPIC register offsets and the access allow-lists of the virtualization tiers.
//!
//! See `30.4 Virtualizing Memory-Mapped APIC Accesses`.

use crate::vmx::vmcs::controls::{ProcControls, ProcControls2};

pub const XAPIC_OFF_ID: u16 = 0x020;
pub const XAPIC_OFF_VERSION: u16 = 0x030;
pub const XAPIC_OFF_TPR: u16 = 0x080;
pub const XAPIC_OFF_PPR: u16 = 0x0a0;
pub const XAPIC_OFF_EOI: u16 = 0x0b0;
pub const XAPIC_OFF_LDR: u16 = 0x0d0;
pub const XAPIC_OFF_DFR: u16 = 0x0e0;
pub const XAPIC_OFF_SVR: u16 = 0x0f0;
pub const XAPIC_OFF_ISR0: u16 = 0x100;
pub const XAPIC_OFF_ISR7: u16 = 0x170;
pub const XAPIC_OFF_TMR0: u16 = 0x180;
pub const XAPIC_OFF_TMR7: u16 = 0x1f0;
pub const XAPIC_OFF_IRR0: u16 = 0x200;
pub const XAPIC_OFF_IRR7: u16 = 0x270;
pub const XAPIC_OFF_ESR: u16 = 0x280;
pub const XAPIC_OFF_LVT_CMCI: u16 = 0x2f0;
pub const XAPIC_OFF_ICR_LO: u16 = 0x300;
pub const XAPIC_OFF_ICR_HI: u16 = 0x310;
pub const XAPIC_OFF_LVT_TIMER: u16 = 0x320;
pub const XAPIC_OFF_LVT_ERROR: u16 = 0x370;
pub const XAPIC_OFF_TIMER_ICR: u16 = 0x380;
pub const XAPIC_OFF_TIMER_DCR: u16 = 0x3e0;
/// Only reachable through the x2APIC SELF_IPI MSR.
pub const XAPIC_OFF_SELF_IPI: u16 = 0x3f0;

/// How much of the APIC the VM-execution controls virtualize. Each tier includes the previous one.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
pub enum ApicVirtTier {
    /// Every access to the APIC-access page exits.
    None,
    TprOnly,
    ApicRegVirt,
    VirtIntDelivery,
}

impl ApicVirtTier {
    pub const ALL: [ApicVirtTier; 4] = [
        ApicVirtTier::None,
        ApicVirtTier::TprOnly,
        ApicVirtTier::ApicRegVirt,
        ApicVirtTier::VirtIntDelivery,
    ];

    pub fn from_ctls(proc: ProcControls, proc2: ProcControls2) -> Self {
        if !proc.contains(ProcControls::USE_TPR_SHADOW) {
            Self::None
        } else if proc2.contains(ProcControls2::VIRT_INT_DELIVERY) {
            Self::VirtIntDelivery
        } else if proc2.contains(ProcControls2::APIC_REG_VIRT) {
            Self::ApicRegVirt
        } else {
            Self::TprOnly
        }
    }
}

/// Registers whose reads are satisfied from the virtual-APIC page once register virtualization is on.
fn is_reg_virt_readable(offset: u16) -> bool {
    matches!(
        offset,
        XAPIC_OFF_ID
            | XAPIC_OFF_VERSION
            | XAPIC_OFF_TPR
            | XAPIC_OFF_EOI
            | XAPIC_OFF_LDR
            | XAPIC_OFF_DFR
            | XAPIC_OFF_SVR
            | XAPIC_OFF_ISR0..=XAPIC_OFF_ISR7
            | XAPIC_OFF_TMR0..=XAPIC_OFF_TMR7
            | XAPIC_OFF_IRR0..=XAPIC_OFF_IRR7
            | XAPIC_OFF_ESR
            | XAPIC_OFF_LVT_CMCI
            | XAPIC_OFF_ICR_LO
            | XAPIC_OFF_ICR_HI
            | XAPIC_OFF_LVT_TIMER..=XAPIC_OFF_LVT_ERROR
            | XAPIC_OFF_TIMER_ICR
            | XAPIC_OFF_TIMER_DCR
    )
}

fn is_reg_virt_writable(offset: u16) -> bool {
    matches!(
        offset,
        XAPIC_OFF_ID
            | XAPIC_OFF_TPR
            | XAPIC_OFF_EOI
            | XAPIC_OFF_LDR
            | XAPIC_OFF_DFR
            | XAPIC_OFF_SVR
            | XAPIC_OFF_ESR
            | XAPIC_OFF_LVT_CMCI
            | XAPIC_OFF_ICR_LO
            | XAPIC_OFF_ICR_HI
            | XAPIC_OFF_LVT_TIMER..=XAPIC_OFF_LVT_ERROR
            | XAPIC_OFF_TIMER_ICR
            | XAPIC_OFF_TIMER_DCR
    )
}

/// Whether a read of the 16-byte aligned register at `offset` is virtualized.
pub fn is_read_virtualized(tier: ApicVirtTier, offset: u16) -> bool {
    match tier {
        ApicVirtTier::None => false,
        ApicVirtTier::TprOnly => offset == XAPIC_OFF_TPR,
        ApicVirtTier::ApicRegVirt | ApicVirtTier::VirtIntDelivery => is_reg_virt_readable(offset),
    }
}

/// Whether a write of the 16-byte aligned register at `offset` is virtualized.
pub fn is_write_virtualized(tier: ApicVirtTier, offset: u16) -> bool {
    match tier {
        ApicVirtTier::None => false,
        ApicVirtTier::TprOnly => offset == XAPIC_OFF_TPR,
        ApicVirtTier::ApicRegVirt | ApicVirtTier::VirtIntDelivery => is_reg_virt_writable(offset),
    }
}

/// Whether the access stays within one aligned 4-byte slot of a 16-byte register.
pub fn is_access_aligned(offset: u16, size: usize) -> bool {
    (offset as usize & 3) + size <= 4 && offset & 0xc == 0
}
