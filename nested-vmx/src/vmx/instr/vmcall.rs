use crate::{
    cpu::{CpuContext, SegReg},
    platform::Platform,
    vmx::{
        diag::{InstrDiag, VmxDiag, VmxInstr},
        error::{gp0, ud, VmInstrError, VmxResult, VmxStatus},
        instr::DecodedInstr,
        vcpu::Vcpu,
        vmexit::reason::VmExitReason,
    },
};

impl Vcpu {
    /// See `31.3 VMX Instructions > VMCALL`.
    ///
    /// Always exits in non-root mode. There is no SMM monitor, so in root mode it can only fail.
    pub fn vmcall(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmcall;

        if self.data.in_non_root {
            return self.exit_instr(ctx, platform, VmExitReason::Vmcall, decoded.len);
        }

        let cause = if !self.data.in_vmx {
            Some(InstrDiag::VmxRoot)
        } else if ctx.is_v86() {
            Some(InstrDiag::RealOrV86Mode)
        } else if ctx.is_long_mode() && !ctx.seg(SegReg::Cs).attr.long() {
            Some(InstrDiag::LongModeCs)
        } else {
            None
        };
        if let Some(cause) = cause {
            self.set_diag(VmxDiag::Instr { instr: INSTR, cause });
            return ud();
        }

        if ctx.cpl() != 0 {
            self.set_diag(VmxDiag::Instr {
                instr: INSTR,
                cause: InstrDiag::Cpl,
            });
            return gp0();
        }

        Ok(self.vmfail(ctx, decoded.len, VmInstrError::VmcallInRoot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils, vmx::vmcs::field::VmcsField};

    #[test]
    fn test_vmcall_outside_vmx_raises_ud() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu();
        let decoded = DecodedInstr::no_operands(3);

        assert_eq!(vcpu.vmcall(&mut ctx, &mut platform, &decoded), ud());
    }

    #[test]
    fn test_vmcall_in_root_fails() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        let decoded = DecodedInstr::no_operands(3);

        let status = vcpu.vmcall(&mut ctx, &mut platform, &decoded).unwrap();
        assert_eq!(status, VmxStatus::FailedValid(VmInstrError::VmcallInRoot));
    }

    #[test]
    fn test_vmcall_in_non_root_exits() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        let decoded = DecodedInstr::no_operands(3);

        let status = vcpu.vmcall(&mut ctx, &mut platform, &decoded).unwrap();

        assert_eq!(status, VmxStatus::VmExit);
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitReason), VmExitReason::Vmcall as u64);
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitInstrLen), 3);
    }
}
