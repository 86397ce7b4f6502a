//! APIC virtualization for the nested guest.
//!
//! Decides which APIC accesses of the nested guest exit to the guest hypervisor and emulates the
//! rest on the virtual-APIC page: TPR, PPR, EOI and self-IPI virtualization and the evaluation and
//! delivery of pending virtual interrupts.
//!
//! See `Chapter 30 APIC Virtualization and Virtual Interrupts`.

use crate::{
    cpu::CpuContext,
    platform::Platform,
    vmx::{
        apic::offsets::*,
        error::{VmxResult, VmxStatus},
        events::{ForceFlags, TrapEvent},
        vcpu::Vcpu,
        vmcs::{
            controls::{ProcControls2, TPR_THRESHOLD_MASK},
            field::VmcsField,
            info::{ApicAccessQual, ApicAccessType, GuestIntStatus},
        },
    },
};
use crate::utils::paging::PAGE_OFFSET_MASK;

pub mod offsets;
pub mod pending;
pub mod x2apic;

/// What happened to an access that hit an APIC-access page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApicAccessOutcome {
    /// Not an access of the nested guest, the caller performs it as usual.
    Passthrough,
    /// Satisfied from the virtual-APIC page.
    Virtualized,
    /// Caused an APIC-access VM-exit.
    VmExit,
}

/// ICR bits that must be clear for a virtualized self-IPI: 31:20, 17:16, 15 (level trigger), 13 and
/// 10:8 (delivery mode).
const ICR_SELF_IPI_RSVD_MASK: u32 = 0xfff3_a700;
const ICR_DEST_SHORTHAND_MASK: u32 = 0b11 << 18;
const ICR_DEST_SHORTHAND_SELF: u32 = 0b01 << 18;

impl Vcpu {
    /// The tier of APIC virtualization enabled for the nested guest.
    pub fn apic_virt_tier(&self) -> ApicVirtTier {
        let vmcs = self.vmcs();
        ApicVirtTier::from_ctls(vmcs.proc_ctls(), vmcs.proc_ctls2())
    }

    fn virt_int_delivery(&self) -> bool {
        self.vmcs().proc_ctls2().contains(ProcControls2::VIRT_INT_DELIVERY)
    }

    /// Whether a data access to the APIC-access page must cause an APIC-access VM-exit.
    pub fn is_apic_access_intercepted(&self, offset: u16, size: usize, write: bool) -> bool {
        if !self.data.in_non_root || self.has_pending_apic_write() {
            return true;
        }

        if !is_access_aligned(offset, size) {
            return true;
        }

        let tier = self.apic_virt_tier();
        let reg = offset & !0xf;
        if write {
            !is_write_virtualized(tier, reg)
        } else {
            !is_read_virtualized(tier, reg)
        }
    }

    /// Handles an access that hit a registered APIC-access page.
    ///
    /// Reads fill `buf`, writes take their data from it.
    pub fn apic_access(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, gpa: u64, buf: &mut [u8],
        access: ApicAccessType,
    ) -> VmxResult<ApicAccessOutcome> {
        let page = gpa & !PAGE_OFFSET_MASK;

        if !self.data.in_non_root || self.data.apic_access_gpa != Some(page) {
            if self.shared.apic_access.is_owner(page, self.id()) {
                log::trace!("Dropping stale APIC-access page registration at {:#x}", page);
                if self.shared.apic_access.deregister(page, self.id()) {
                    platform.deregister_apic_access_page(page);
                }
            }
            return Ok(ApicAccessOutcome::Passthrough);
        }

        let offset = (gpa & PAGE_OFFSET_MASK) as u16;
        let intercepted = match access {
            ApicAccessType::LinearRead => self.is_apic_access_intercepted(offset, buf.len(), false),
            ApicAccessType::LinearWrite => self.is_apic_access_intercepted(offset, buf.len(), true),
            _ => true,
        };

        if intercepted {
            self.exit_apic_access(ctx, platform, ApicAccessQual::new(offset, access))?;
            return Ok(ApicAccessOutcome::VmExit);
        }

        let vapic = self.vmcs().get(VmcsField::VirtApicAddr) + offset as u64;
        if access == ApicAccessType::LinearWrite {
            platform.write_phys(vapic, buf)?;
            self.latch_apic_write(offset & !0xf);
        } else {
            platform.read_phys(vapic, buf)?;
        }

        Ok(ApicAccessOutcome::Virtualized)
    }

    pub(crate) fn vapic_read(&self, platform: &dyn Platform, offset: u16) -> VmxResult<u32> {
        platform.read_phys_u32(self.vmcs().get(VmcsField::VirtApicAddr) + offset as u64)
    }

    pub(crate) fn vapic_write(&self, platform: &mut dyn Platform, offset: u16, value: u32) -> VmxResult<()> {
        platform.write_phys_u32(self.vmcs().get(VmcsField::VirtApicAddr) + offset as u64, value)
    }

    /// Sets or clears the bit of `vector` in one of the 256-bit ISR/TMR/IRR arrays.
    fn vapic_update_vector(
        &self, platform: &mut dyn Platform, base: u16, vector: u8, set: bool,
    ) -> VmxResult<()> {
        let offset = base + (vector as u16 >> 5) * 0x10;
        let bit = 1u32 << (vector & 0x1f);
        let value = self.vapic_read(platform, offset)?;

        self.vapic_write(platform, offset, if set { value | bit } else { value & !bit })
    }

    /// Highest vector set in one of the 256-bit ISR/TMR/IRR arrays.
    fn vapic_highest_vector(&self, platform: &dyn Platform, base: u16) -> VmxResult<Option<u8>> {
        for index in (0..8u16).rev() {
            let value = self.vapic_read(platform, base + index * 0x10)?;
            if value != 0 {
                let bit = 31 - value.leading_zeros() as u16;
                return Ok(Some((index * 32 + bit) as u8));
            }
        }

        Ok(None)
    }

    pub(crate) fn guest_int_status(&self) -> GuestIntStatus {
        GuestIntStatus::from_raw(self.vmcs().get(VmcsField::GuestIntStatus) as u16)
    }

    fn set_guest_int_status(&mut self, status: GuestIntStatus) {
        self.vmcs_mut().set(VmcsField::GuestIntStatus, status.to_raw() as u64);
    }

    /// Runs APIC-write emulation for the write latched by the last instruction.
    ///
    /// Returns the VM-exit status if the emulation caused one.
    pub fn process_pending_apic_write(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform,
    ) -> VmxResult<Option<VmxStatus>> {
        let Some(pending) = self.take_pending_apic_write() else { return Ok(None) };
        if !self.data.in_non_root {
            return Ok(None);
        }

        let vid = self.virt_int_delivery();
        log::trace!("APIC-write emulation at offset {:#x}", pending.offset);

        match pending.offset {
            XAPIC_OFF_TPR => {
                let vtpr = self.vapic_read(platform, XAPIC_OFF_TPR)? & 0xff;
                self.vapic_write(platform, XAPIC_OFF_TPR, vtpr)?;
                self.virtualize_tpr(ctx, platform)
            }
            XAPIC_OFF_EOI if vid => self.virtualize_eoi(ctx, platform),
            XAPIC_OFF_ICR_LO if vid => {
                let icr = self.vapic_read(platform, XAPIC_OFF_ICR_LO)?;
                match self_ipi_vector(icr) {
                    Some(vector) => self.virtualize_self_ipi(platform, vector),
                    None => self.exit_apic_write(ctx, platform, pending.offset).map(Some),
                }
            }
            XAPIC_OFF_SELF_IPI if vid => {
                let vector = self.vapic_read(platform, XAPIC_OFF_SELF_IPI)? as u8;
                self.virtualize_self_ipi(platform, vector)
            }
            XAPIC_OFF_ICR_HI => {
                let value = self.vapic_read(platform, XAPIC_OFF_ICR_HI)?;
                self.vapic_write(platform, XAPIC_OFF_ICR_HI, value & 0xff00_0000)?;
                Ok(None)
            }
            offset => self.exit_apic_write(ctx, platform, offset).map(Some),
        }
    }

    /// See `30.1.2 TPR Virtualization`.
    pub(crate) fn virtualize_tpr(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform,
    ) -> VmxResult<Option<VmxStatus>> {
        if self.virt_int_delivery() {
            self.virtualize_ppr(platform)?;
            self.evaluate_pending_virt_int(platform)?;
            return Ok(None);
        }

        let vtpr = self.vapic_read(platform, XAPIC_OFF_TPR)?;
        let threshold = self.vmcs().get32(VmcsField::TprThreshold) & TPR_THRESHOLD_MASK;
        if (vtpr >> 4) & 0xf < threshold {
            return self.exit_tpr_below_threshold(ctx, platform).map(Some);
        }

        Ok(None)
    }

    /// See `30.1.3 PPR Virtualization`.
    pub(crate) fn virtualize_ppr(&mut self, platform: &mut dyn Platform) -> VmxResult<u8> {
        let vtpr = self.vapic_read(platform, XAPIC_OFF_TPR)? as u8;
        let svi = self.guest_int_status().svi;

        let vppr = if vtpr & 0xf0 >= svi & 0xf0 { vtpr } else { svi & 0xf0 };
        self.vapic_write(platform, XAPIC_OFF_PPR, vppr as u32)?;

        Ok(vppr)
    }

    /// See `30.1.4 EOI Virtualization`.
    fn virtualize_eoi(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform,
    ) -> VmxResult<Option<VmxStatus>> {
        let mut status = self.guest_int_status();
        let vector = status.svi;

        self.vapic_update_vector(platform, XAPIC_OFF_ISR0, vector, false)?;
        status.svi = self.vapic_highest_vector(platform, XAPIC_OFF_ISR0)?.unwrap_or(0);
        self.set_guest_int_status(status);
        self.virtualize_ppr(platform)?;

        let eoi_exit = self.vmcs().eoi_exit_bitmap();
        if eoi_exit[vector as usize >> 6] & (1 << (vector & 0x3f)) != 0 {
            return self.exit_virtualized_eoi(ctx, platform, vector).map(Some);
        }

        self.evaluate_pending_virt_int(platform)?;
        Ok(None)
    }

    /// See `30.1.5 Self-IPI Virtualization`.
    fn virtualize_self_ipi(&mut self, platform: &mut dyn Platform, vector: u8) -> VmxResult<Option<VmxStatus>> {
        self.vapic_update_vector(platform, XAPIC_OFF_IRR0, vector, true)?;

        let mut status = self.guest_int_status();
        status.rvi = status.rvi.max(vector);
        self.set_guest_int_status(status);

        self.evaluate_pending_virt_int(platform)?;
        Ok(None)
    }

    /// Recognizes a pending virtual interrupt if RVI has a higher priority class than VPPR.
    ///
    /// See `30.2.1 Evaluation of Pending Virtual Interrupts`.
    pub(crate) fn evaluate_pending_virt_int(&mut self, platform: &dyn Platform) -> VmxResult<bool> {
        let rvi = self.guest_int_status().rvi;
        let vppr = self.vapic_read(platform, XAPIC_OFF_PPR)? as u8;

        let pending = rvi >> 4 > vppr >> 4;
        self.data.force_flags.set(ForceFlags::VIRT_INT, pending);

        Ok(pending)
    }

    /// Delivers the recognized virtual interrupt if the nested guest is interruptible.
    ///
    /// See `30.2.2 Virtual-Interrupt Delivery`.
    pub fn deliver_virt_int(&mut self, ctx: &CpuContext, platform: &mut dyn Platform) -> VmxResult<bool> {
        if !self.data.in_non_root || !self.data.force_flags.contains(ForceFlags::VIRT_INT) {
            return Ok(false);
        }

        if !ctx.interrupts_enabled() || !ctx.interrupt_shadow.is_empty() {
            return Ok(false);
        }

        self.data.force_flags.remove(ForceFlags::VIRT_INT);

        let mut status = self.guest_int_status();
        let vector = status.rvi;
        log::trace!("Delivering virtual interrupt {:#x}", vector);

        self.vapic_update_vector(platform, XAPIC_OFF_ISR0, vector, true)?;
        self.vapic_update_vector(platform, XAPIC_OFF_IRR0, vector, false)?;
        status.svi = vector;
        status.rvi = self.vapic_highest_vector(platform, XAPIC_OFF_IRR0)?.unwrap_or(0);
        self.set_guest_int_status(status);
        self.vapic_write(platform, XAPIC_OFF_PPR, (vector & 0xf0) as u32)?;
        self.evaluate_pending_virt_int(platform)?;

        platform.inject_event(TrapEvent::ext_int(vector));
        Ok(true)
    }

    /// MOV from CR8 with the TPR shadow active: VTPR[7:4].
    pub fn virt_cr8_read(&self, platform: &dyn Platform) -> VmxResult<u64> {
        Ok(((self.vapic_read(platform, XAPIC_OFF_TPR)? >> 4) & 0xf) as u64)
    }

    /// MOV to CR8 with the TPR shadow active, followed by TPR virtualization.
    pub fn virt_cr8_write(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, value: u64,
    ) -> VmxResult<Option<VmxStatus>> {
        self.vapic_write(platform, XAPIC_OFF_TPR, ((value & 0xf) << 4) as u32)?;
        self.virtualize_tpr(ctx, platform)
    }
}

/// Returns the vector of an ICR value that describes a valid self-IPI.
fn self_ipi_vector(icr: u32) -> Option<u8> {
    let vector = icr as u8;

    let valid = icr & ICR_SELF_IPI_RSVD_MASK == 0
        && icr & ICR_DEST_SHORTHAND_MASK == ICR_DEST_SHORTHAND_SELF
        && vector >> 4 != 0;

    valid.then_some(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{self, MockPlatform, VIRT_APIC_GPA},
        vmx::{
            vmcs::controls::ProcControls,
            vmexit::reason::VmExitReason,
        },
    };

    fn enable_vid(vcpu: &mut Vcpu) {
        let vmcs = vcpu.vmcs_mut();
        let proc = vmcs.get(VmcsField::ProcControls)
            | (ProcControls::USE_TPR_SHADOW | ProcControls::SECONDARY_CONTROLS).bits() as u64;
        vmcs.set(VmcsField::ProcControls, proc);
        let proc2 = vmcs.get(VmcsField::ProcControls2)
            | (ProcControls2::VIRT_APIC_ACCESS | ProcControls2::APIC_REG_VIRT | ProcControls2::VIRT_INT_DELIVERY)
                .bits() as u64;
        vmcs.set(VmcsField::ProcControls2, proc2);
    }

    #[test]
    fn test_self_ipi_vector() {
        assert_eq!(self_ipi_vector(0x0004_0030), Some(0x30));
        // Vector below 16.
        assert_eq!(self_ipi_vector(0x0004_0005), None);
        // All-excluding-self shorthand.
        assert_eq!(self_ipi_vector(0x000c_0030), None);
        // Level triggered.
        assert_eq!(self_ipi_vector(0x0004_8030), None);
        // NMI delivery mode.
        assert_eq!(self_ipi_vector(0x0004_0430), None);
    }

    #[test]
    fn test_intercepted_outside_non_root() {
        let (vcpu, _, _) = test_utils::vcpu_with_vmcs();
        assert!(vcpu.is_apic_access_intercepted(XAPIC_OFF_TPR, 4, false));
    }

    #[test]
    fn test_eoi_exit_bitmap_causes_virtualized_eoi_exit() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_vid(&mut vcpu);

        let vector = 0x85u8;
        vcpu.vmcs_mut().set(VmcsField::EoiExitBitmap2, 1 << (vector & 0x3f));
        vcpu.set_guest_int_status(GuestIntStatus { rvi: 0, svi: vector });
        vcpu.vapic_update_vector(&mut platform, XAPIC_OFF_ISR0, vector, true).unwrap();

        vcpu.latch_apic_write(XAPIC_OFF_EOI);
        let status = vcpu.process_pending_apic_write(&mut ctx, &mut platform).unwrap();

        assert_eq!(status, Some(VmxStatus::VmExit));
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitReason), VmExitReason::VirtualizedEoi as u64);
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitQualification), vector as u64);
        assert!(!vcpu.has_pending_apic_write());
    }

    #[test]
    fn test_eoi_without_exit_bit_updates_svi() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_vid(&mut vcpu);

        vcpu.set_guest_int_status(GuestIntStatus { rvi: 0, svi: 0x51 });
        vcpu.vapic_update_vector(&mut platform, XAPIC_OFF_ISR0, 0x31, true).unwrap();
        vcpu.vapic_update_vector(&mut platform, XAPIC_OFF_ISR0, 0x51, true).unwrap();

        vcpu.latch_apic_write(XAPIC_OFF_EOI);
        let status = vcpu.process_pending_apic_write(&mut ctx, &mut platform).unwrap();

        assert_eq!(status, None);
        assert_eq!(vcpu.guest_int_status().svi, 0x31);
        assert_eq!(vcpu.vapic_read(&platform, XAPIC_OFF_PPR).unwrap(), 0x30);
    }

    #[test]
    fn test_self_ipi_raises_rvi_and_pending_flag() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_vid(&mut vcpu);

        vcpu.vapic_write(&mut platform, XAPIC_OFF_ICR_LO, 0x0004_0041).unwrap();
        vcpu.latch_apic_write(XAPIC_OFF_ICR_LO);
        let status = vcpu.process_pending_apic_write(&mut ctx, &mut platform).unwrap();

        assert_eq!(status, None);
        assert_eq!(vcpu.guest_int_status().rvi, 0x41);
        assert!(vcpu.force_flags().contains(ForceFlags::VIRT_INT));
        assert_eq!(vcpu.vapic_read(&platform, XAPIC_OFF_IRR0 + 0x20).unwrap(), 1 << 1);
    }

    #[test]
    fn test_invalid_icr_write_exits() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_vid(&mut vcpu);

        vcpu.vapic_write(&mut platform, XAPIC_OFF_ICR_LO, 0x0000_4041).unwrap();
        vcpu.latch_apic_write(XAPIC_OFF_ICR_LO);
        let status = vcpu.process_pending_apic_write(&mut ctx, &mut platform).unwrap();

        assert_eq!(status, Some(VmxStatus::VmExit));
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitReason), VmExitReason::ApicWrite as u64);
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitQualification), XAPIC_OFF_ICR_LO as u64);
    }

    #[test]
    fn test_tpr_below_threshold_exits() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        let proc = vcpu.vmcs().get(VmcsField::ProcControls) | ProcControls::USE_TPR_SHADOW.bits() as u64;
        vcpu.vmcs_mut().set(VmcsField::ProcControls, proc);
        vcpu.vmcs_mut().set(VmcsField::TprThreshold, 5);

        let status = vcpu.virt_cr8_write(&mut ctx, &mut platform, 4).unwrap();
        assert_eq!(status, Some(VmxStatus::VmExit));
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitReason), VmExitReason::TprBelowThreshold as u64);
    }

    #[test]
    fn test_tpr_write_is_virtualized() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_vid(&mut vcpu);
        let apic_page = vcpu.vmcs().get(VmcsField::ApicAccessAddr);
        vcpu.data.apic_access_gpa = Some(apic_page);

        let mut buf = 0x20u32.to_le_bytes();
        let outcome = vcpu
            .apic_access(&mut ctx, &mut platform, apic_page + 0x80, &mut buf, ApicAccessType::LinearWrite)
            .unwrap();

        assert_eq!(outcome, ApicAccessOutcome::Virtualized);
        assert!(vcpu.has_pending_apic_write());
        assert_eq!(platform.read_phys_u32(VIRT_APIC_GPA + 0x80).unwrap(), 0x20);

        assert_eq!(vcpu.process_pending_apic_write(&mut ctx, &mut platform).unwrap(), None);
        assert_eq!(vcpu.vapic_read(&platform, XAPIC_OFF_PPR).unwrap(), 0x20);
    }

    #[test]
    fn test_unaligned_access_exits() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_vid(&mut vcpu);
        let apic_page = vcpu.vmcs().get(VmcsField::ApicAccessAddr);
        vcpu.data.apic_access_gpa = Some(apic_page);

        let mut buf = [0u8; 4];
        let outcome = vcpu
            .apic_access(&mut ctx, &mut platform, apic_page + 0x82, &mut buf, ApicAccessType::LinearRead)
            .unwrap();

        assert_eq!(outcome, ApicAccessOutcome::VmExit);
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitReason), VmExitReason::ApicAccess as u64);
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitQualification), 0x82);
    }
}
