//! INVEPT and INVVPID.
//!
//! Translations are not tagged by EPTP or VPID, so every successful invalidation flushes the whole
//! TLB of the virtual CPU.

use crate::{
    cpu::CpuContext,
    platform::Platform,
    utils::paging::is_canonical,
    vmx::{
        checks::controls::check_eptp,
        diag::{InstrDiag, VmxInstr},
        error::{ud, VmInstrError, VmxResult, VmxStatus},
        features::{
            INVEPT_SINGLE_CONTEXT, INVVPID_INDIV_ADDR, INVVPID_SINGLE_CONTEXT, INVVPID_SINGLE_CONTEXT_RETAIN_GLOBALS,
        },
        instr::{read_mem, DecodedInstr},
        vcpu::Vcpu,
        vmexit::reason::VmExitReason,
    },
};

/// The 128-bit descriptor of INVEPT and INVVPID.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InvDescriptor {
    pub lo: u64,
    pub hi: u64,
}

impl InvDescriptor {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[..8]);
        hi.copy_from_slice(&bytes[8..]);

        Self {
            lo: u64::from_le_bytes(lo),
            hi: u64::from_le_bytes(hi),
        }
    }
}

impl Vcpu {
    /// Reads the invalidation type from the register operand and the descriptor from memory.
    fn read_inv_operands(
        &self, ctx: &CpuContext, platform: &dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<(u64, InvDescriptor)> {
        let Some(mem) = decoded.mem() else {
            return ud();
        };

        let ty = ctx.gpr(decoded.reg);
        let ty = if ctx.is_64bit_code() { ty } else { ty & 0xffff_ffff };

        let mut bytes = [0u8; 16];
        read_mem(ctx, platform, mem, &mut bytes)?;

        Ok((ty, InvDescriptor::from_bytes(bytes)))
    }

    /// See `31.3 VMX Instructions > INVEPT`.
    pub fn invept(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Invept;

        if !self.features().ept {
            return ud();
        }

        if let Some(status) = self.vmx_instr_checks(ctx, platform, INSTR, decoded, VmExitReason::Invept)? {
            return Ok(status);
        }

        let (ty, desc) = self.read_inv_operands(ctx, platform, decoded)?;
        let features = self.features();

        let cause = if !features.is_invept_type_supported(ty) {
            Some(InstrDiag::TypeInvalid)
        } else if desc.hi != 0 {
            Some(InstrDiag::DescRsvd)
        } else if ty == INVEPT_SINGLE_CONTEXT && check_eptp(features, desc.lo).is_err() {
            Some(InstrDiag::EptpInvalid)
        } else {
            None
        };

        if let Some(cause) = cause {
            return Ok(self.vmfail_diag(ctx, INSTR, decoded.len, cause, VmInstrError::InveptInvvpidInvalidOperand));
        }

        log::trace!("INVEPT type {} eptp {:#x}", ty, desc.lo);
        platform.flush_tlb();

        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }

    /// See `31.3 VMX Instructions > INVVPID`.
    pub fn invvpid(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Invvpid;

        if !self.features().vpid {
            return ud();
        }

        if let Some(status) = self.vmx_instr_checks(ctx, platform, INSTR, decoded, VmExitReason::Invvpid)? {
            return Ok(status);
        }

        let (ty, desc) = self.read_inv_operands(ctx, platform, decoded)?;
        let vpid = desc.lo & 0xffff;
        let addr = desc.hi;

        let cause = if !self.features().is_invvpid_type_supported(ty) {
            Some(InstrDiag::TypeInvalid)
        } else if desc.lo >> 16 != 0 {
            Some(InstrDiag::DescRsvd)
        } else {
            match ty {
                INVVPID_INDIV_ADDR if vpid == 0 => Some(InstrDiag::Type0InvalidVpid),
                INVVPID_INDIV_ADDR if !is_canonical(addr) => Some(InstrDiag::Type0InvalidAddr),
                INVVPID_SINGLE_CONTEXT if vpid == 0 => Some(InstrDiag::Type1InvalidVpid),
                INVVPID_SINGLE_CONTEXT_RETAIN_GLOBALS if vpid == 0 => Some(InstrDiag::Type3InvalidVpid),
                _ => None,
            }
        };

        if let Some(cause) = cause {
            return Ok(self.vmfail_diag(ctx, INSTR, decoded.len, cause, VmInstrError::InveptInvvpidInvalidOperand));
        }

        log::trace!("INVVPID type {} vpid {} addr {:#x}", ty, vpid, addr);
        platform.flush_tlb();

        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::gpr,
        test_utils::{self, MockPlatform, OPERAND_GPA},
        vmx::{
            diag::VmxDiag,
            features::{INVEPT_ALL_CONTEXT, INVVPID_ALL_CONTEXT},
            instr::MemOperand,
            vmcs::field::VmcsField,
        },
    };

    fn inv_operands(platform: &mut MockPlatform, lo: u64, hi: u64) -> DecodedInstr {
        platform.write_phys_u64(OPERAND_GPA, lo).unwrap();
        platform.write_phys_u64(OPERAND_GPA + 8, hi).unwrap();

        let mut decoded = DecodedInstr::with_mem(5, MemOperand::flat(OPERAND_GPA));
        decoded.reg = gpr::RCX;
        decoded
    }

    #[test]
    fn test_invept_all_context_flushes() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        ctx.set_gpr(gpr::RCX, INVEPT_ALL_CONTEXT);
        let decoded = inv_operands(&mut platform, 0, 0);

        let status = vcpu.invept(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::Succeeded);
        assert_eq!(platform.tlb_flushes, 1);
    }

    #[test]
    fn test_invept_single_context_checks_eptp() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        ctx.set_gpr(gpr::RCX, INVEPT_SINGLE_CONTEXT);

        // Memory type 1 (WC) is not supported.
        let decoded = inv_operands(&mut platform, 0x10_0000 | 3 << 3 | 1, 0);
        let status = vcpu.invept(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::FailedValid(VmInstrError::InveptInvvpidInvalidOperand));
        assert_eq!(
            vcpu.diag(),
            VmxDiag::Instr {
                instr: VmxInstr::Invept,
                cause: InstrDiag::EptpInvalid
            }
        );
        assert_eq!(platform.tlb_flushes, 0);

        let decoded = inv_operands(&mut platform, 0x10_0000 | 3 << 3 | 6, 0);
        let status = vcpu.invept(&mut ctx, &mut platform, &decoded).unwrap();
        assert_eq!(status, VmxStatus::Succeeded);
    }

    #[test]
    fn test_invept_unsupported_type() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        ctx.set_gpr(gpr::RCX, 3);
        let decoded = inv_operands(&mut platform, 0, 0);

        let status = vcpu.invept(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::FailedValid(VmInstrError::InveptInvvpidInvalidOperand));
        assert_eq!(
            vcpu.vmcs().get(VmcsField::VmInstrError),
            VmInstrError::InveptInvvpidInvalidOperand as u64
        );
    }

    #[test]
    fn test_invvpid_descriptor_checks() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();

        ctx.set_gpr(gpr::RCX, INVVPID_INDIV_ADDR);
        let decoded = inv_operands(&mut platform, 1, 0x0000_8000_0000_0000);
        assert_eq!(
            vcpu.invvpid(&mut ctx, &mut platform, &decoded).unwrap(),
            VmxStatus::FailedValid(VmInstrError::InveptInvvpidInvalidOperand)
        );
        assert_eq!(
            vcpu.diag(),
            VmxDiag::Instr {
                instr: VmxInstr::Invvpid,
                cause: InstrDiag::Type0InvalidAddr
            }
        );

        ctx.set_gpr(gpr::RCX, INVVPID_SINGLE_CONTEXT);
        let decoded = inv_operands(&mut platform, 0, 0);
        assert_eq!(
            vcpu.invvpid(&mut ctx, &mut platform, &decoded).unwrap(),
            VmxStatus::FailedValid(VmInstrError::InveptInvvpidInvalidOperand)
        );

        ctx.set_gpr(gpr::RCX, INVVPID_ALL_CONTEXT);
        let decoded = inv_operands(&mut platform, 1 << 16, 0);
        assert_eq!(
            vcpu.invvpid(&mut ctx, &mut platform, &decoded).unwrap(),
            VmxStatus::FailedValid(VmInstrError::InveptInvvpidInvalidOperand)
        );

        let decoded = inv_operands(&mut platform, 0, 0);
        assert_eq!(vcpu.invvpid(&mut ctx, &mut platform, &decoded).unwrap(), VmxStatus::Succeeded);
        assert_eq!(platform.tlb_flushes, 1);
    }

    #[test]
    fn test_invvpid_in_non_root_exits() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        ctx.set_gpr(gpr::RCX, INVVPID_ALL_CONTEXT);
        let decoded = inv_operands(&mut platform, 0, 0);

        let status = vcpu.invvpid(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::VmExit);
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitReason), VmExitReason::Invvpid as u64);
    }
}
