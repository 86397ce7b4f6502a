//! Virtualization of x2APIC MSR accesses.
//!
//! See `30.5 Virtualizing MSR-Based APIC Accesses`.

use crate::{
    cpu::CpuContext,
    platform::Platform,
    utils::msr::{is_x2apic_msr, x2apic_msr_to_offset},
    vmx::{
        apic::{offsets::*, ApicAccessOutcome},
        error::{gp0, VmxResult},
        vcpu::Vcpu,
        vmcs::controls::ProcControls2,
    },
};

impl Vcpu {
    /// Whether RDMSR/WRMSR of the x2APIC MSR is satisfied from the virtual-APIC page.
    pub fn is_x2apic_msr_virtualized(&self, msr: u32, write: bool) -> bool {
        if !self.data.in_non_root || !is_x2apic_msr(msr) {
            return false;
        }

        let proc2 = self.vmcs().proc_ctls2();
        if !proc2.contains(ProcControls2::VIRT_X2APIC_MODE) {
            return false;
        }

        let offset = x2apic_msr_to_offset(msr);
        let vid = proc2.contains(ProcControls2::VIRT_INT_DELIVERY);

        if write {
            return match offset {
                XAPIC_OFF_TPR => true,
                XAPIC_OFF_EOI | XAPIC_OFF_SELF_IPI => vid,
                _ => false,
            };
        }

        if proc2.contains(ProcControls2::APIC_REG_VIRT) {
            // DFR and ICR high do not exist in x2APIC mode.
            is_read_virtualized(ApicVirtTier::ApicRegVirt, offset)
                && !matches!(offset, XAPIC_OFF_DFR | XAPIC_OFF_ICR_HI)
        } else {
            offset == XAPIC_OFF_TPR
        }
    }

    /// RDMSR of an x2APIC MSR by the nested guest. Returns `None` if the read is not virtualized.
    pub fn read_x2apic_msr(&self, platform: &dyn Platform, msr: u32) -> VmxResult<Option<u64>> {
        if !self.is_x2apic_msr_virtualized(msr, false) {
            return Ok(None);
        }

        let offset = x2apic_msr_to_offset(msr);
        let mut value = self.vapic_read(platform, offset)? as u64;
        if offset == XAPIC_OFF_ICR_LO {
            value |= (self.vapic_read(platform, XAPIC_OFF_ICR_HI)? as u64) << 32;
        }

        Ok(Some(value))
    }

    /// WRMSR of an x2APIC MSR by the nested guest.
    ///
    /// Values with reserved bits set raise #GP(0) before anything is stored.
    pub fn write_x2apic_msr(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, msr: u32, value: u64,
    ) -> VmxResult<ApicAccessOutcome> {
        if !self.is_x2apic_msr_virtualized(msr, true) {
            return Ok(ApicAccessOutcome::Passthrough);
        }

        let offset = x2apic_msr_to_offset(msr);
        let valid = match offset {
            XAPIC_OFF_EOI => value == 0,
            _ => value >> 8 == 0,
        };
        if !valid {
            log::debug!("x2APIC write of {:#x} to MSR {:#x} has reserved bits set", value, msr);
            return gp0();
        }

        self.vapic_write(platform, offset, value as u32)?;
        self.latch_apic_write(offset);

        match self.process_pending_apic_write(ctx, platform)? {
            Some(_) => Ok(ApicAccessOutcome::VmExit),
            None => Ok(ApicAccessOutcome::Virtualized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils,
        utils::msr::{IA32_X2APIC_EOI, IA32_X2APIC_SELF_IPI, IA32_X2APIC_TPR},
        vmx::{
            error::VmxError,
            events::ForceFlags,
            vmcs::{controls::ProcControls, field::VmcsField},
        },
    };

    fn enable_x2apic_virt(vcpu: &mut Vcpu, vid: bool) {
        let vmcs = vcpu.vmcs_mut();
        let proc = vmcs.get(VmcsField::ProcControls)
            | (ProcControls::USE_TPR_SHADOW | ProcControls::SECONDARY_CONTROLS).bits() as u64;
        vmcs.set(VmcsField::ProcControls, proc);

        let mut proc2 = ProcControls2::VIRT_X2APIC_MODE;
        proc2.set(ProcControls2::APIC_REG_VIRT | ProcControls2::VIRT_INT_DELIVERY, vid);
        vmcs.set(VmcsField::ProcControls2, proc2.bits() as u64);
    }

    #[test]
    fn test_tpr_only_without_vid() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();
        enable_x2apic_virt(&mut vcpu, false);

        assert!(vcpu.is_x2apic_msr_virtualized(IA32_X2APIC_TPR, true));
        assert!(vcpu.is_x2apic_msr_virtualized(IA32_X2APIC_TPR, false));
        assert!(!vcpu.is_x2apic_msr_virtualized(IA32_X2APIC_EOI, true));
        assert!(!vcpu.is_x2apic_msr_virtualized(IA32_X2APIC_SELF_IPI, true));
    }

    #[test]
    fn test_reserved_bits_raise_gp() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_x2apic_virt(&mut vcpu, true);

        let gp = Err(VmxError::Exception {
            vector: 13,
            error_code: Some(0),
        });
        assert_eq!(vcpu.write_x2apic_msr(&mut ctx, &mut platform, IA32_X2APIC_TPR, 0x100), gp);
        assert_eq!(vcpu.write_x2apic_msr(&mut ctx, &mut platform, IA32_X2APIC_EOI, 1), gp);
        assert_eq!(vcpu.write_x2apic_msr(&mut ctx, &mut platform, IA32_X2APIC_SELF_IPI, 0x1_0030), gp);
        assert!(!vcpu.has_pending_apic_write());
    }

    #[test]
    fn test_self_ipi() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_x2apic_virt(&mut vcpu, true);

        let outcome = vcpu
            .write_x2apic_msr(&mut ctx, &mut platform, IA32_X2APIC_SELF_IPI, 0x60)
            .unwrap();

        assert_eq!(outcome, ApicAccessOutcome::Virtualized);
        assert_eq!(vcpu.guest_int_status().rvi, 0x60);
        assert!(vcpu.force_flags().contains(ForceFlags::VIRT_INT));
    }

    #[test]
    fn test_tpr_round_trip() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        enable_x2apic_virt(&mut vcpu, true);

        vcpu.write_x2apic_msr(&mut ctx, &mut platform, IA32_X2APIC_TPR, 0x30)
            .unwrap();
        assert_eq!(vcpu.read_x2apic_msr(&platform, IA32_X2APIC_TPR).unwrap(), Some(0x30));
    }
}
