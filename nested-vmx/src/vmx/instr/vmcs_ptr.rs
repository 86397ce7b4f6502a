//! VMPTRLD, VMPTRST and VMCLEAR.

use crate::{
    cpu::CpuContext,
    platform::Platform,
    utils::paging::{fits_phys_width, is_page_aligned, PAGE_SIZE},
    vmx::{
        diag::{InstrDiag, VmxInstr},
        error::{ud, VmInstrError, VmxResult, VmxStatus},
        instr::{read_mem_u64, write_mem, DecodedInstr},
        vcpu::Vcpu,
        vmcs::{VMCS_REVISION_ID, VMCS_SHADOW_BIT},
        vmexit::reason::VmExitReason,
    },
};

/// Value VMPTRST stores when there is no current VMCS.
pub const VMCS_PTR_INVALID: u64 = u64::MAX;

impl Vcpu {
    /// Reads the VMCS pointer operand and runs the address checks shared by VMPTRLD and VMCLEAR.
    fn read_vmcs_ptr(
        &self, ctx: &CpuContext, platform: &dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<Result<u64, InstrDiag>> {
        let Some(mem) = decoded.mem() else {
            return ud();
        };
        let ptr = read_mem_u64(ctx, platform, mem)?;

        let check = if !is_page_aligned(ptr) {
            Err(InstrDiag::PtrAlign)
        } else if !fits_phys_width(ptr, self.features().phys_addr_width) {
            Err(InstrDiag::PtrWidth)
        } else if !platform.is_ram(ptr, PAGE_SIZE) {
            Err(InstrDiag::PtrAbnormal)
        } else if ptr == self.data.vmxon_ptr {
            Err(InstrDiag::PtrVmxon)
        } else {
            Ok(ptr)
        };

        Ok(check)
    }

    /// See `31.3 VMX Instructions > VMPTRLD`.
    pub fn vmptrld(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmptrld;

        if let Some(status) = self.vmx_instr_checks(ctx, platform, INSTR, decoded, VmExitReason::Vmptrld)? {
            return Ok(status);
        }

        let ptr = match self.read_vmcs_ptr(ctx, platform, decoded)? {
            Ok(ptr) => ptr,
            Err(InstrDiag::PtrVmxon) => {
                return Ok(self.vmfail_diag(
                    ctx,
                    INSTR,
                    decoded.len,
                    InstrDiag::PtrVmxon,
                    VmInstrError::VmptrldWithVmxonPtr,
                ))
            }
            Err(cause) => {
                return Ok(self.vmfail_diag(ctx, INSTR, decoded.len, cause, VmInstrError::VmptrldInvalidPhysAddr))
            }
        };

        let revision = match platform.read_phys_u32(ptr) {
            Ok(revision) => revision,
            Err(_) => {
                return Ok(self.vmfail_diag(
                    ctx,
                    INSTR,
                    decoded.len,
                    InstrDiag::PtrReadPhys,
                    VmInstrError::VmptrldInvalidPhysAddr,
                ))
            }
        };

        let cause = if revision & !VMCS_SHADOW_BIT != VMCS_REVISION_ID {
            Some(InstrDiag::VmcsRevId)
        } else if revision & VMCS_SHADOW_BIT != 0 && !self.features().vmcs_shadowing {
            Some(InstrDiag::ShadowVmcs)
        } else {
            None
        };
        if let Some(cause) = cause {
            return Ok(self.vmfail_diag(ctx, INSTR, decoded.len, cause, VmInstrError::VmptrldIncorrectVmcsRev));
        }

        if self.data.vmcs.load(platform, ptr).is_err() {
            return Ok(self.vmfail_diag(
                ctx,
                INSTR,
                decoded.len,
                InstrDiag::PtrReadPhys,
                VmInstrError::VmptrldInvalidPhysAddr,
            ));
        }

        log::trace!("Current VMCS is now {:#x}", ptr);
        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }

    /// See `31.3 VMX Instructions > VMPTRST`.
    pub fn vmptrst(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmptrst;

        if let Some(status) = self.vmx_instr_checks(ctx, platform, INSTR, decoded, VmExitReason::Vmptrst)? {
            return Ok(status);
        }

        let Some(mem) = decoded.mem() else {
            return ud();
        };
        let ptr = self.data.vmcs.gpa().unwrap_or(VMCS_PTR_INVALID);
        write_mem(ctx, platform, mem, &ptr.to_le_bytes())?;

        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }

    /// See `31.3 VMX Instructions > VMCLEAR`.
    ///
    /// The VMCS does not have to be current. Clearing an already clear VMCS succeeds.
    pub fn vmclear(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmclear;

        if let Some(status) = self.vmx_instr_checks(ctx, platform, INSTR, decoded, VmExitReason::Vmclear)? {
            return Ok(status);
        }

        let ptr = match self.read_vmcs_ptr(ctx, platform, decoded)? {
            Ok(ptr) => ptr,
            Err(InstrDiag::PtrVmxon) => {
                return Ok(self.vmfail_diag(
                    ctx,
                    INSTR,
                    decoded.len,
                    InstrDiag::PtrVmxon,
                    VmInstrError::VmclearWithVmxonPtr,
                ))
            }
            Err(cause) => {
                return Ok(self.vmfail_diag(ctx, INSTR, decoded.len, cause, VmInstrError::VmclearInvalidPhysAddr))
            }
        };

        if self.data.shadow_vmcs.gpa() == Some(ptr) {
            self.data.shadow_vmcs.flush(platform)?;
            self.data.shadow_vmcs.evict();
        }

        if self.data.vmcs.clear(platform, ptr).is_err() {
            return Ok(self.vmfail_diag(
                ctx,
                INSTR,
                decoded.len,
                InstrDiag::PtrWritePhys,
                VmInstrError::VmclearInvalidPhysAddr,
            ));
        }

        log::trace!("Cleared VMCS at {:#x}", ptr);
        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{self, MockPlatform, VMCS_GPA, VMXON_GPA},
        vmx::{
            diag::VmxDiag,
            vmcs::{field::VmcsField, LaunchState, Vmcs},
        },
    };
    use x86::bits64::paging::BASE_PAGE_SIZE;

    const OTHER_VMCS_GPA: u64 = 0x0001_0000;

    fn read_vmcs(platform: &MockPlatform, gpa: u64) -> Vmcs {
        let mut bytes = [0u8; BASE_PAGE_SIZE];
        platform.read_phys(gpa, &mut bytes).unwrap();
        Vmcs::from_bytes(&bytes)
    }

    #[test]
    fn test_vmptrld_vmxon_pointer_fails() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_vmx();
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        let status = vcpu.vmptrld(&mut ctx, &mut platform, &decoded).unwrap();

        // There is no current VMCS to hold the error number.
        assert_eq!(status, VmxStatus::FailedInvalid);
        assert_eq!(
            vcpu.diag(),
            VmxDiag::Instr {
                instr: VmxInstr::Vmptrld,
                cause: InstrDiag::PtrVmxon
            }
        );
    }

    #[test]
    fn test_vmptrld_vmxon_pointer_reports_error_number() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        let decoded = test_utils::mem_operand(&mut platform, VMXON_GPA);

        let status = vcpu.vmptrld(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::FailedValid(VmInstrError::VmptrldWithVmxonPtr));
        assert_eq!(
            vcpu.vmcs().get(VmcsField::VmInstrError),
            VmInstrError::VmptrldWithVmxonPtr as u64
        );
        assert_eq!(vcpu.current_vmcs_ptr(), Some(VMCS_GPA));
    }

    #[test]
    fn test_vmptrld_flushes_previous_vmcs() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        test_utils::init_vmcs_region(&mut platform, OTHER_VMCS_GPA);
        vcpu.vmcs_mut().set(VmcsField::GuestRip, 0x1234);

        let decoded = test_utils::mem_operand(&mut platform, OTHER_VMCS_GPA);
        let status = vcpu.vmptrld(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::Succeeded);
        assert_eq!(vcpu.current_vmcs_ptr(), Some(OTHER_VMCS_GPA));
        assert_eq!(read_vmcs(&platform, VMCS_GPA).get(VmcsField::GuestRip), 0x1234);
    }

    #[test]
    fn test_vmptrld_bad_revision() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        platform.write_phys_u32(OTHER_VMCS_GPA, 0x1234).unwrap();

        let decoded = test_utils::mem_operand(&mut platform, OTHER_VMCS_GPA);
        let status = vcpu.vmptrld(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::FailedValid(VmInstrError::VmptrldIncorrectVmcsRev));
    }

    #[test]
    fn test_vmptrst_stores_current_pointer() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        let decoded = test_utils::mem_operand(&mut platform, 0);

        vcpu.vmptrst(&mut ctx, &mut platform, &decoded).unwrap();
        assert_eq!(platform.read_phys_u64(test_utils::OPERAND_GPA).unwrap(), VMCS_GPA);
    }

    #[test]
    fn test_vmclear_is_idempotent() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();

        for _ in 0..2 {
            let decoded = test_utils::mem_operand(&mut platform, VMCS_GPA);
            let status = vcpu.vmclear(&mut ctx, &mut platform, &decoded).unwrap();

            assert_eq!(status, VmxStatus::Succeeded);
            assert_eq!(vcpu.current_vmcs_ptr(), None);
            assert_eq!(read_vmcs(&platform, VMCS_GPA).launch_state(), Some(LaunchState::Clear));
        }
    }

    #[test]
    fn test_vmclear_unaligned_pointer_fails() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        let decoded = test_utils::mem_operand(&mut platform, VMCS_GPA + 8);

        let status = vcpu.vmclear(&mut ctx, &mut platform, &decoded).unwrap();
        assert_eq!(status, VmxStatus::FailedValid(VmInstrError::VmclearInvalidPhysAddr));
    }
}
