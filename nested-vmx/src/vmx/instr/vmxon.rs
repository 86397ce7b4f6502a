//! VMXON and VMXOFF.

use crate::{
    cpu::CpuContext,
    platform::Platform,
    utils::{
        msr::{FEATURE_CONTROL_LOCK, FEATURE_CONTROL_VMXON_OUTSIDE_SMX, IA32_FEATURE_CONTROL},
        paging::{fits_phys_width, is_page_aligned, PAGE_SIZE},
    },
    vmx::{
        diag::{InstrDiag, VmxDiag, VmxInstr},
        error::{gp0, ud, VmInstrError, VmxResult, VmxStatus},
        events::ForceFlags,
        features::{CR0_FIXED0, CR0_FIXED1, CR4_FIXED0},
        instr::{read_mem_u64, DecodedInstr},
        vcpu::Vcpu,
        vmcs::{VMCS_REVISION_ID, VMCS_SHADOW_BIT},
        vmexit::reason::VmExitReason,
    },
};

impl Vcpu {
    /// See `31.3 VMX Instructions > VMXON`.
    pub fn vmxon(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmxon;

        self.check_vmx_mode(ctx, INSTR)?;

        if self.data.in_non_root {
            return self.exit_instr_with_info(ctx, platform, VmExitReason::Vmxon, decoded);
        }

        if self.data.in_vmx {
            if ctx.cpl() != 0 {
                self.set_diag(VmxDiag::Instr {
                    instr: INSTR,
                    cause: InstrDiag::Cpl,
                });
                return gp0();
            }

            return Ok(self.vmfail_diag(
                ctx,
                INSTR,
                decoded.len,
                InstrDiag::VmxAlreadyRoot,
                VmInstrError::VmxonInRoot,
            ));
        }

        if let Some(cause) = self.vmxon_gp_cause(ctx, platform) {
            self.set_diag(VmxDiag::Instr { instr: INSTR, cause });
            return gp0();
        }

        let Some(mem) = decoded.mem() else {
            return ud();
        };
        let ptr = read_mem_u64(ctx, platform, mem)?;

        let cause = if !is_page_aligned(ptr) {
            Some(InstrDiag::PtrAlign)
        } else if !fits_phys_width(ptr, self.features().phys_addr_width) {
            Some(InstrDiag::PtrWidth)
        } else if !platform.is_ram(ptr, PAGE_SIZE) {
            Some(InstrDiag::PtrAbnormal)
        } else {
            match platform.read_phys_u32(ptr) {
                Err(_) => Some(InstrDiag::PtrReadPhys),
                Ok(rev) if rev & VMCS_SHADOW_BIT != 0 || rev != VMCS_REVISION_ID => Some(InstrDiag::VmcsRevId),
                Ok(_) => None,
            }
        };

        if let Some(cause) = cause {
            self.set_diag(VmxDiag::Instr { instr: INSTR, cause });
            return Ok(self.vmfail_invalid(ctx, decoded.len));
        }

        log::trace!("Entering VMX root operation, VMXON region at {:#x}", ptr);

        self.data.in_vmx = true;
        self.data.in_non_root = false;
        self.data.vmxon_ptr = ptr;
        self.data.vmcs.evict();
        self.data.shadow_vmcs.evict();
        self.data.force_flags = ForceFlags::empty();

        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }

    /// Conditions that make VMXON outside VMX operation raise #GP(0).
    fn vmxon_gp_cause(&self, ctx: &CpuContext, platform: &dyn Platform) -> Option<InstrDiag> {
        if ctx.cpl() != 0 {
            return Some(InstrDiag::Cpl);
        }

        if ctx.a20_masked {
            return Some(InstrDiag::A20m);
        }

        if ctx.cr0 & CR0_FIXED0 != CR0_FIXED0 {
            return Some(InstrDiag::Cr0Fixed0);
        }
        if ctx.cr0 & !CR0_FIXED1 != 0 {
            return Some(InstrDiag::Cr0Fixed1);
        }
        if ctx.cr4 & CR4_FIXED0 != CR4_FIXED0 {
            return Some(InstrDiag::Cr4Fixed0);
        }
        if ctx.cr4 & !self.features().cr4_fixed1() != 0 {
            return Some(InstrDiag::Cr4Fixed1);
        }

        let required = FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMXON_OUTSIDE_SMX;
        match platform.read_msr(IA32_FEATURE_CONTROL) {
            Ok(value) if value & required == required => None,
            _ => Some(InstrDiag::MsrFeatCtl),
        }
    }

    /// See `31.3 VMX Instructions > VMXOFF`.
    pub fn vmxoff(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmxoff;

        if let Some(status) = self.vmx_instr_checks(ctx, platform, INSTR, decoded, VmExitReason::Vmxoff)? {
            return Ok(status);
        }

        log::trace!("Leaving VMX operation");

        self.data.vmcs.flush(platform)?;
        self.data.vmcs.evict();
        self.data.shadow_vmcs.evict();

        self.data.in_vmx = false;
        self.data.vmxon_ptr = 0;
        self.data.force_flags = ForceFlags::empty();
        self.data.pending_apic_write = None;

        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, VMXON_GPA};
    use x86_64::registers::rflags::RFlags;

    #[test]
    fn test_vmxon_succeeds() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu();
        let rip = ctx.rip;
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        let status = vcpu.vmxon(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::Succeeded);
        assert!(vcpu.in_vmx_root());
        assert_eq!(vcpu.data().vmxon_ptr, VMXON_GPA);
        assert_eq!(ctx.rip, rip + decoded.len as u64);
        assert_eq!(ctx.rflags & RFlags::CARRY_FLAG.bits(), 0);
    }

    #[test]
    fn test_vmxon_in_root_fails() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_vmx();
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        let status = vcpu.vmxon(&mut ctx, &mut platform, &decoded).unwrap();

        // No current VMCS, so the error number cannot be stored.
        assert_eq!(status, VmxStatus::FailedInvalid);
        assert_eq!(
            vcpu.diag(),
            VmxDiag::Instr {
                instr: VmxInstr::Vmxon,
                cause: InstrDiag::VmxAlreadyRoot
            }
        );
    }

    #[test]
    fn test_vmxon_in_root_with_current_vmcs_fails_valid() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        let status = vcpu.vmxon(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::FailedValid(VmInstrError::VmxonInRoot));
        assert_ne!(ctx.rflags & RFlags::ZERO_FLAG.bits(), 0);
    }

    #[test]
    fn test_vmxon_requires_vmxe() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu();
        ctx.cr4 &= !crate::vmx::features::CR4_VMXE;
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        assert_eq!(vcpu.vmxon(&mut ctx, &mut platform, &decoded), ud());
        assert!(!vcpu.in_vmx_operation());
    }

    #[test]
    fn test_vmxon_unlocked_feature_control_raises_gp() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu();
        platform.msrs.insert(IA32_FEATURE_CONTROL, FEATURE_CONTROL_VMXON_OUTSIDE_SMX);
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        assert_eq!(vcpu.vmxon(&mut ctx, &mut platform, &decoded), gp0());
        assert_eq!(
            vcpu.diag(),
            VmxDiag::Instr {
                instr: VmxInstr::Vmxon,
                cause: InstrDiag::MsrFeatCtl
            }
        );
    }

    #[test]
    fn test_vmxon_bad_revision_fails_invalid() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu();
        platform.write_phys_u32(VMXON_GPA, VMCS_REVISION_ID + 1).unwrap();
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        let status = vcpu.vmxon(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::FailedInvalid);
        assert_ne!(ctx.rflags & RFlags::CARRY_FLAG.bits(), 0);
        assert!(!vcpu.in_vmx_operation());
    }

    #[test]
    fn test_vmxoff_leaves_vmx_operation() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        let decoded = DecodedInstr::no_operands(3);

        let status = vcpu.vmxoff(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::Succeeded);
        assert!(!vcpu.in_vmx_operation());
        assert_eq!(vcpu.current_vmcs_ptr(), None);
    }
}
