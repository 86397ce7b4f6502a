//! Emulation of the VMX instructions.
//!
//! The instruction emulator decodes the instruction and hands the operands over in a
//! [`DecodedInstr`]. Each instruction returns the architectural outcome as [`VmxStatus`] or raises a
//! guest exception through [`VmxError::Exception`].

use crate::{
    cpu::{CpuContext, SegReg},
    platform::Platform,
    vmx::{
        diag::{InstrDiag, VmxDiag, VmxInstr},
        error::{gp0, ss0, ud, VmInstrError, VmxResult, VmxStatus},
        features::CR4_VMXE,
        vcpu::Vcpu,
        vmcs::{field::VmcsField, info::AddrSize},
        vmexit::reason::VmExitReason,
    },
};
use crate::utils::paging::is_canonical;
use x86_64::registers::rflags::RFlags;

pub mod invalidate;
pub mod vmcall;
pub mod vmcs_ptr;
pub mod vmread_write;
pub mod vmxon;

/// A memory operand as encoded by ModR/M and SIB.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemOperand {
    pub seg: SegReg,
    pub base: Option<u8>,
    pub index: Option<u8>,
    /// log2 of the index scale.
    pub scale: u8,
    pub disp: u64,
    pub addr_size: AddrSize,
}

impl MemOperand {
    /// A flat operand at `addr` through DS with 64-bit addressing.
    pub fn flat(addr: u64) -> Self {
        Self {
            seg: SegReg::Ds,
            base: None,
            index: None,
            scale: 0,
            disp: addr,
            addr_size: AddrSize::Bits64,
        }
    }

    pub fn effective_addr(&self, ctx: &CpuContext) -> u64 {
        let base = self.base.map(|reg| ctx.gpr(reg)).unwrap_or_default();
        let index = self.index.map(|reg| ctx.gpr(reg) << (self.scale & 0b11)).unwrap_or_default();

        base.wrapping_add(index).wrapping_add(self.disp) & self.addr_size.mask()
    }

    /// Applies segmentation. In 64-bit mode only FS and GS have a base.
    pub fn linear_addr(&self, ctx: &CpuContext) -> u64 {
        let addr = self.effective_addr(ctx);
        let seg = ctx.seg(self.seg);

        if ctx.is_64bit_code() {
            match self.seg {
                SegReg::Fs | SegReg::Gs => seg.base.wrapping_add(addr),
                _ => addr,
            }
        } else {
            seg.base.wrapping_add(addr) & 0xffff_ffff
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    Mem(MemOperand),
}

/// A decoded VMX instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DecodedInstr {
    /// Instruction length in bytes.
    pub len: u8,
    /// The ModR/M r/m operand.
    pub rm: Operand,
    /// The ModR/M reg operand.
    pub reg: u8,
}

impl DecodedInstr {
    /// An instruction without operands (VMXOFF, VMLAUNCH, VMRESUME, VMCALL).
    pub fn no_operands(len: u8) -> Self {
        Self {
            len,
            rm: Operand::Reg(0),
            reg: 0,
        }
    }

    pub fn with_mem(len: u8, mem: MemOperand) -> Self {
        Self {
            len,
            rm: Operand::Mem(mem),
            reg: 0,
        }
    }

    pub fn mem(&self) -> Option<&MemOperand> {
        match &self.rm {
            Operand::Mem(mem) => Some(mem),
            Operand::Reg(_) => None,
        }
    }
}

fn check_linear(ctx: &CpuContext, mem: &MemOperand, addr: u64) -> VmxResult<()> {
    if ctx.is_64bit_code() && !is_canonical(addr) {
        return match mem.seg {
            SegReg::Ss => ss0(),
            _ => gp0(),
        };
    }

    Ok(())
}

pub(crate) fn read_mem(
    ctx: &CpuContext, platform: &dyn Platform, mem: &MemOperand, buf: &mut [u8],
) -> VmxResult<()> {
    let addr = mem.linear_addr(ctx);
    check_linear(ctx, mem, addr)?;
    platform.read_linear(addr, buf)
}

pub(crate) fn write_mem(
    ctx: &CpuContext, platform: &mut dyn Platform, mem: &MemOperand, buf: &[u8],
) -> VmxResult<()> {
    let addr = mem.linear_addr(ctx);
    check_linear(ctx, mem, addr)?;
    platform.write_linear(addr, buf)
}

pub(crate) fn read_mem_u64(ctx: &CpuContext, platform: &dyn Platform, mem: &MemOperand) -> VmxResult<u64> {
    let mut buf = [0u8; 8];
    read_mem(ctx, platform, mem, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

const ARITH_FLAGS: u64 = RFlags::CARRY_FLAG.bits()
    | RFlags::PARITY_FLAG.bits()
    | RFlags::AUXILIARY_CARRY_FLAG.bits()
    | RFlags::ZERO_FLAG.bits()
    | RFlags::SIGN_FLAG.bits()
    | RFlags::OVERFLOW_FLAG.bits();

impl Vcpu {
    /// Raises #UD for the mode checks every VMX instruction starts with.
    pub(crate) fn check_vmx_mode(&mut self, ctx: &CpuContext, instr: VmxInstr) -> VmxResult<()> {
        let cause = if ctx.cr4 & CR4_VMXE == 0 {
            Some(InstrDiag::Vmxe)
        } else if !ctx.is_protected() || ctx.is_v86() {
            Some(InstrDiag::RealOrV86Mode)
        } else if ctx.is_long_mode() && !ctx.seg(SegReg::Cs).attr.long() {
            Some(InstrDiag::LongModeCs)
        } else {
            None
        };

        match cause {
            Some(cause) => {
                self.set_diag(VmxDiag::Instr { instr, cause });
                ud()
            }
            None => Ok(()),
        }
    }

    /// Checks shared by every VMX instruction but VMXON: #UD outside VMX operation, VM-exit in
    /// non-root mode and #GP(0) at CPL > 0.
    ///
    /// Returns `Some(status)` when the instruction was handled by a VM-exit.
    pub(crate) fn vmx_instr_checks(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, instr: VmxInstr,
        decoded: &DecodedInstr, reason: VmExitReason,
    ) -> VmxResult<Option<VmxStatus>> {
        self.check_vmx_mode(ctx, instr)?;

        if !self.data.in_vmx {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::VmxRoot,
            });
            return ud();
        }

        if self.data.in_non_root {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::Intercept,
            });
            return self.exit_instr_with_info(ctx, platform, reason, decoded).map(Some);
        }

        if ctx.cpl() != 0 {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::Cpl,
            });
            return gp0();
        }

        Ok(None)
    }

    /// VMsucceed: clears the arithmetic flags and retires the instruction.
    pub(crate) fn vmsucceed(&mut self, ctx: &mut CpuContext, instr: VmxInstr, len: u8) -> VmxStatus {
        log::trace!("{} succeeded", instr.mnemonic());

        ctx.rflags &= !ARITH_FLAGS;
        ctx.advance_rip(len);
        self.set_diag(VmxDiag::Instr {
            instr,
            cause: InstrDiag::Success,
        });

        VmxStatus::Succeeded
    }

    /// VMfailInvalid: sets CF and retires the instruction.
    pub(crate) fn vmfail_invalid(&mut self, ctx: &mut CpuContext, len: u8) -> VmxStatus {
        ctx.rflags = ctx.rflags & !ARITH_FLAGS | RFlags::CARRY_FLAG.bits();
        ctx.advance_rip(len);

        VmxStatus::FailedInvalid
    }

    /// VMfailValid if there is a current VMCS to record the error in, VMfailInvalid otherwise.
    pub(crate) fn vmfail(&mut self, ctx: &mut CpuContext, len: u8, error: VmInstrError) -> VmxStatus {
        log::debug!("VMfail: {}", error);

        if !self.data.vmcs.is_current() {
            return self.vmfail_invalid(ctx, len);
        }

        ctx.rflags = ctx.rflags & !ARITH_FLAGS | RFlags::ZERO_FLAG.bits();
        ctx.advance_rip(len);
        self.vmcs_mut().set(VmcsField::VmInstrError, error as u64);

        VmxStatus::FailedValid(error)
    }

    /// Records the diagnostic and fails the instruction.
    pub(crate) fn vmfail_diag(
        &mut self, ctx: &mut CpuContext, instr: VmxInstr, len: u8, cause: InstrDiag, error: VmInstrError,
    ) -> VmxStatus {
        self.set_diag(VmxDiag::Instr { instr, cause });
        self.vmfail(ctx, len, error)
    }
}
