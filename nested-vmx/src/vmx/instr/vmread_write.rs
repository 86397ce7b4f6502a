//! VMREAD and VMWRITE, including VMCS shadowing.
//!
//! See `25.10 VMCS Types: Ordinary and Shadow` and `31.3 VMX Instructions > VMREAD/VMWRITE`.

use crate::{
    cpu::CpuContext,
    platform::Platform,
    vmx::{
        diag::{InstrDiag, VmxDiag, VmxInstr},
        error::{gp0, ud, VmInstrError, VmxResult, VmxStatus},
        instr::{read_mem, write_mem, DecodedInstr, Operand},
        vcpu::Vcpu,
        vmcs::{controls::ProcControls2, field::FieldRef, Vmcs},
        vmexit::reason::VmExitReason,
    },
};

/// Which VMCS a VMREAD/VMWRITE operates on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Target {
    Current,
    Shadow,
}

impl Vcpu {
    /// Operand size in bytes: 8 in 64-bit code, 4 otherwise.
    fn vmx_operand_size(ctx: &CpuContext) -> usize {
        if ctx.is_64bit_code() {
            8
        } else {
            4
        }
    }

    fn field_encoding(ctx: &CpuContext, decoded: &DecodedInstr) -> u64 {
        let value = ctx.gpr(decoded.reg);
        if ctx.is_64bit_code() {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    /// Runs the common checks and picks the VMCS to operate on.
    ///
    /// In non-root mode the access goes to the shadow VMCS when shadowing is enabled and the bitmap
    /// does not intercept the field, otherwise it causes a VM-exit.
    fn vmread_write_target(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, instr: VmxInstr, decoded: &DecodedInstr,
    ) -> VmxResult<Result<Target, VmxStatus>> {
        let reason = match instr {
            VmxInstr::Vmread => VmExitReason::Vmread,
            _ => VmExitReason::Vmwrite,
        };

        self.check_vmx_mode(ctx, instr)?;

        if !self.data.in_vmx {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::VmxRoot,
            });
            return ud();
        }

        if self.data.in_non_root {
            let encoding = Self::field_encoding(ctx, decoded);
            let bitmap = match instr {
                VmxInstr::Vmread => &self.data.vmread_bitmap,
                _ => &self.data.vmwrite_bitmap,
            };
            let shadowing = self.vmcs().proc_ctls2().contains(ProcControls2::VMCS_SHADOWING);

            if !shadowing || bitmap.is_intercepted(encoding) {
                self.set_diag(VmxDiag::Instr {
                    instr,
                    cause: InstrDiag::Intercept,
                });
                return self
                    .exit_instr_with_info(ctx, platform, reason, decoded)
                    .map(Err);
            }
        }

        if ctx.cpl() != 0 {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::Cpl,
            });
            return gp0();
        }

        if self.data.in_non_root {
            if !self.data.shadow_vmcs.is_current() {
                self.set_diag(VmxDiag::Instr {
                    instr,
                    cause: InstrDiag::LinkPtrInvalid,
                });
                return Ok(Err(self.vmfail_invalid(ctx, decoded.len)));
            }
            return Ok(Ok(Target::Shadow));
        }

        if !self.data.vmcs.is_current() {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::PtrInvalid,
            });
            return Ok(Err(self.vmfail_invalid(ctx, decoded.len)));
        }

        Ok(Ok(Target::Current))
    }

    fn target_vmcs(&self, target: Target) -> &Vmcs {
        match target {
            Target::Current => self.data.vmcs.vmcs(),
            Target::Shadow => self.data.shadow_vmcs.vmcs(),
        }
    }

    fn target_vmcs_mut(&mut self, target: Target) -> &mut Vmcs {
        match target {
            Target::Current => self.data.vmcs.vmcs_mut(),
            Target::Shadow => self.data.shadow_vmcs.vmcs_mut(),
        }
    }

    /// See `31.3 VMX Instructions > VMREAD`.
    ///
    /// The destination is left untouched when the instruction fails.
    pub fn vmread(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmread;

        let target = match self.vmread_write_target(ctx, platform, INSTR, decoded)? {
            Ok(target) => target,
            Err(status) => return Ok(status),
        };

        let encoding = Self::field_encoding(ctx, decoded);
        let Some(field) = FieldRef::decode(encoding) else {
            return Ok(self.vmfail_diag(
                ctx,
                INSTR,
                decoded.len,
                InstrDiag::FieldInvalid,
                VmInstrError::VmreadVmwriteInvalidComponent,
            ));
        };

        let value = self.target_vmcs(target).read(field);
        let size = Self::vmx_operand_size(ctx);

        match &decoded.rm {
            Operand::Reg(reg) => ctx.set_gpr(*reg, if size == 8 { value } else { value & 0xffff_ffff }),
            Operand::Mem(mem) => write_mem(ctx, platform, mem, &value.to_le_bytes()[..size])?,
        }

        log::trace!("VMREAD {:#x} -> {:#x}", encoding, value);
        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }

    /// See `31.3 VMX Instructions > VMWRITE`.
    ///
    /// Read-only fields can only be written when IA32_VMX_MISC reports VMWRITE to all fields.
    pub fn vmwrite(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        const INSTR: VmxInstr = VmxInstr::Vmwrite;

        let target = match self.vmread_write_target(ctx, platform, INSTR, decoded)? {
            Ok(target) => target,
            Err(status) => return Ok(status),
        };

        let size = Self::vmx_operand_size(ctx);
        let value = match &decoded.rm {
            Operand::Reg(reg) => ctx.gpr(*reg),
            Operand::Mem(mem) => {
                let mut buf = [0u8; 8];
                read_mem(ctx, platform, mem, &mut buf[..size])?;
                u64::from_le_bytes(buf)
            }
        };
        let value = if size == 8 { value } else { value & 0xffff_ffff };

        let encoding = Self::field_encoding(ctx, decoded);
        let Some(field) = FieldRef::decode(encoding) else {
            return Ok(self.vmfail_diag(
                ctx,
                INSTR,
                decoded.len,
                InstrDiag::FieldInvalid,
                VmInstrError::VmreadVmwriteInvalidComponent,
            ));
        };

        if field.field.is_read_only() && !self.features().vmwrite_all() {
            return Ok(self.vmfail_diag(ctx, INSTR, decoded.len, InstrDiag::FieldRo, VmInstrError::VmwriteRoComponent));
        }

        self.target_vmcs_mut(target).write(field, value);

        log::trace!("VMWRITE {:#x} <- {:#x}", encoding, value);
        Ok(self.vmsucceed(ctx, INSTR, decoded.len))
    }
}
