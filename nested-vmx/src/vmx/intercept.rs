//! Predicates the instruction layer consults before executing an instruction of the nested guest.
//!
//! Each predicate answers whether the operation causes a VM-exit to the guest hypervisor. All of them
//! are false outside non-root operation.
//!
//! See `26.1 Instructions That Cause VM Exits` and `26.2 Other Causes of VM Exits`.

use crate::vmx::{
    events::X86_XCPT_PF,
    vcpu::Vcpu,
    vmcs::{
        controls::{PinControls, ProcControls, ProcControls2},
        field::VmcsField,
    },
    vmexit::reason::VmExitReason,
};

/// CR0 bits LMSW can modify: PE, MP, EM and TS.
const LMSW_MASK: u64 = 0xf;
const CR0_PE: u64 = 1 << 0;
const CR0_TS: u64 = 1 << 3;

impl Vcpu {
    /// Whether executing the instruction that would exit with `reason` causes a VM-exit.
    ///
    /// Covers the instructions controlled by a single execution control, and those that exit
    /// unconditionally.
    pub fn is_instr_intercepted(&self, reason: VmExitReason) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        let proc = self.vmcs().proc_ctls();
        let proc2 = self.vmcs().proc_ctls2();

        match reason {
            VmExitReason::Cpuid
            | VmExitReason::Getsec
            | VmExitReason::Invd
            | VmExitReason::Xsetbv
            | VmExitReason::Vmcall
            | VmExitReason::Vmclear
            | VmExitReason::Vmlaunch
            | VmExitReason::Vmptrld
            | VmExitReason::Vmptrst
            | VmExitReason::Vmresume
            | VmExitReason::Vmxoff
            | VmExitReason::Vmxon
            | VmExitReason::Invept
            | VmExitReason::Invvpid => true,
            VmExitReason::Hlt => proc.contains(ProcControls::HLT_EXIT),
            VmExitReason::Invlpg => proc.contains(ProcControls::INVLPG_EXIT),
            VmExitReason::Rdpmc => proc.contains(ProcControls::RDPMC_EXIT),
            VmExitReason::Rdtsc | VmExitReason::Rdtscp => proc.contains(ProcControls::RDTSC_EXIT),
            VmExitReason::Mwait => proc.contains(ProcControls::MWAIT_EXIT),
            VmExitReason::Monitor => proc.contains(ProcControls::MONITOR_EXIT),
            VmExitReason::Pause => proc.contains(ProcControls::PAUSE_EXIT),
            VmExitReason::MovDr => proc.contains(ProcControls::MOV_DR_EXIT),
            VmExitReason::Wbinvd => proc2.contains(ProcControls2::WBINVD_EXIT),
            VmExitReason::Rdrand => proc2.contains(ProcControls2::RDRAND_EXIT),
            VmExitReason::Rdseed => proc2.contains(ProcControls2::RDSEED_EXIT),
            VmExitReason::GdtrIdtrAccess | VmExitReason::LdtrTrAccess => {
                proc2.contains(ProcControls2::DESC_TABLE_EXIT)
            }
            // INVPCID is gated by "enable INVPCID" and then follows "INVLPG exiting".
            VmExitReason::Invpcid => {
                proc2.contains(ProcControls2::INVPCID) && proc.contains(ProcControls::INVLPG_EXIT)
            }
            _ => false,
        }
    }

    /// Whether XSAVES/XRSTORS exits for the requested-feature bitmap `xss` (XINUSE & IA32_XSS).
    pub fn is_xsaves_intercepted(&self, xss: u64) -> bool {
        self.data.in_non_root
            && self.vmcs().proc_ctls2().contains(ProcControls2::XSAVES_XRSTORS)
            && self.vmcs().get(VmcsField::XssExitBitmap) & xss != 0
    }

    pub fn is_rdmsr_intercepted(&self, msr: u32) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        !self.vmcs().proc_ctls().contains(ProcControls::USE_MSR_BITMAPS)
            || self.data.msr_bitmap.is_rdmsr_intercepted(msr)
    }

    pub fn is_wrmsr_intercepted(&self, msr: u32) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        !self.vmcs().proc_ctls().contains(ProcControls::USE_MSR_BITMAPS)
            || self.data.msr_bitmap.is_wrmsr_intercepted(msr)
    }

    /// Whether an I/O instruction accessing `size` bytes at `port` exits. The I/O bitmaps take
    /// precedence over unconditional I/O exiting.
    pub fn is_io_intercepted(&self, port: u16, size: u8) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        let proc = self.vmcs().proc_ctls();
        if proc.contains(ProcControls::USE_IO_BITMAPS) {
            self.data.io_bitmaps.is_intercepted(port, size)
        } else {
            proc.contains(ProcControls::UNCOND_IO_EXIT)
        }
    }

    /// Whether MOV to CR0, CR3, CR4 or CR8 with `value` exits.
    ///
    /// See `26.1.3 Instructions That Cause VM Exits Conditionally`.
    pub fn is_mov_to_cr_intercepted(&self, cr: u8, value: u64) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        let vmcs = self.vmcs();
        match cr {
            0 => (value ^ vmcs.get(VmcsField::Cr0ReadShadow)) & vmcs.get(VmcsField::Cr0Mask) != 0,
            4 => (value ^ vmcs.get(VmcsField::Cr4ReadShadow)) & vmcs.get(VmcsField::Cr4Mask) != 0,
            3 => {
                if !vmcs.proc_ctls().contains(ProcControls::CR3_LOAD_EXIT) {
                    return false;
                }

                let count = (vmcs.get32(VmcsField::Cr3TargetCount) as usize).min(4);
                !vmcs.cr3_targets()[..count].contains(&value)
            }
            8 => vmcs.proc_ctls().contains(ProcControls::CR8_LOAD_EXIT),
            _ => false,
        }
    }

    /// Whether MOV from CR3 or CR8 exits. Reads of CR0 and CR4 never exit, see
    /// [`Vcpu::read_cr_shadowed`].
    pub fn is_mov_from_cr_intercepted(&self, cr: u8) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        let proc = self.vmcs().proc_ctls();
        match cr {
            3 => proc.contains(ProcControls::CR3_STORE_EXIT),
            8 => proc.contains(ProcControls::CR8_STORE_EXIT),
            _ => false,
        }
    }

    /// The value MOV from CR0/CR4 (and SMSW) returns: host-owned bits come from the read shadow.
    pub fn read_cr_shadowed(&self, cr: u8, value: u64) -> u64 {
        if !self.data.in_non_root {
            return value;
        }

        let vmcs = self.vmcs();
        let (mask, shadow) = match cr {
            0 => (vmcs.get(VmcsField::Cr0Mask), vmcs.get(VmcsField::Cr0ReadShadow)),
            4 => (vmcs.get(VmcsField::Cr4Mask), vmcs.get(VmcsField::Cr4ReadShadow)),
            _ => return value,
        };

        value & !mask | shadow & mask
    }

    /// CLTS exits if the guest hypervisor owns CR0.TS and its shadow has TS set.
    pub fn is_clts_intercepted(&self) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        let vmcs = self.vmcs();
        vmcs.get(VmcsField::Cr0Mask) & CR0_TS != 0 && vmcs.get(VmcsField::Cr0ReadShadow) & CR0_TS != 0
    }

    /// LMSW exits if it changes an owned bit of MP, EM or TS, or sets an owned PE that reads as clear.
    pub fn is_lmsw_intercepted(&self, value: u16) -> bool {
        if !self.data.in_non_root {
            return false;
        }

        let vmcs = self.vmcs();
        let mask = vmcs.get(VmcsField::Cr0Mask) & LMSW_MASK;
        let shadow = vmcs.get(VmcsField::Cr0ReadShadow);
        let value = value as u64;

        let changes_owned = (value ^ shadow) & mask & !CR0_PE != 0;
        let sets_pe = mask & CR0_PE != 0 && shadow & CR0_PE == 0 && value & CR0_PE != 0;

        changes_owned || sets_pe
    }

    /// Whether the exception causes a VM-exit through the exception bitmap. A #PF consults the
    /// error-code mask and match.
    ///
    /// See `26.2 Other Causes of VM Exits > Exceptions`.
    pub fn is_xcpt_intercepted(&self, vector: u8, error_code: Option<u32>) -> bool {
        if !self.data.in_non_root || vector >= 32 {
            return false;
        }

        let vmcs = self.vmcs();
        let bit = vmcs.get32(VmcsField::ExceptionBitmap) & (1 << vector) != 0;
        if vector != X86_XCPT_PF {
            return bit;
        }

        let mask = vmcs.get32(VmcsField::PageFaultErrorMask);
        let matched = vmcs.get32(VmcsField::PageFaultErrorMatch);
        let matches = error_code.unwrap_or_default() & mask == matched;

        bit == matches
    }

    pub fn is_nmi_intercepted(&self) -> bool {
        self.data.in_non_root && self.vmcs().pin_ctls().contains(PinControls::NMI_EXIT)
    }

    pub fn is_ext_int_intercepted(&self) -> bool {
        self.data.in_non_root && self.vmcs().pin_ctls().contains(PinControls::EXT_INT_EXIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils, utils::msr::IA32_EFER};

    fn set_proc(vcpu: &mut Vcpu, ctls: ProcControls) {
        let proc = vcpu.vmcs().get(VmcsField::ProcControls) | ctls.bits() as u64;
        vcpu.vmcs_mut().set(VmcsField::ProcControls, proc);
    }

    #[test]
    fn test_nothing_is_intercepted_in_root_mode() {
        let (vcpu, _, _) = test_utils::vcpu_with_vmcs();

        assert!(!vcpu.is_instr_intercepted(VmExitReason::Cpuid));
        assert!(!vcpu.is_rdmsr_intercepted(IA32_EFER));
        assert!(!vcpu.is_io_intercepted(0x60, 1));
    }

    #[test]
    fn test_instruction_controls() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();

        assert!(vcpu.is_instr_intercepted(VmExitReason::Cpuid));
        assert!(vcpu.is_instr_intercepted(VmExitReason::Vmptrld));
        assert!(!vcpu.is_instr_intercepted(VmExitReason::Rdtsc));

        set_proc(&mut vcpu, ProcControls::RDTSC_EXIT | ProcControls::HLT_EXIT);
        assert!(vcpu.is_instr_intercepted(VmExitReason::Rdtsc));
        assert!(vcpu.is_instr_intercepted(VmExitReason::Rdtscp));
        assert!(vcpu.is_instr_intercepted(VmExitReason::Hlt));
    }

    #[test]
    fn test_msr_bitmap() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();
        assert!(vcpu.is_rdmsr_intercepted(IA32_EFER));

        set_proc(&mut vcpu, ProcControls::USE_MSR_BITMAPS);
        vcpu.data.msr_bitmap.hook_wrmsr(IA32_EFER);

        assert!(!vcpu.is_rdmsr_intercepted(IA32_EFER));
        assert!(vcpu.is_wrmsr_intercepted(IA32_EFER));
        assert!(vcpu.is_rdmsr_intercepted(0x4000_0000));
    }

    #[test]
    fn test_io_bitmaps_override_unconditional_exiting() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();
        set_proc(&mut vcpu, ProcControls::UNCOND_IO_EXIT);
        assert!(vcpu.is_io_intercepted(0x80, 1));

        set_proc(&mut vcpu, ProcControls::USE_IO_BITMAPS);
        vcpu.data.io_bitmaps.hook_port(0x64);
        assert!(!vcpu.is_io_intercepted(0x80, 1));
        assert!(vcpu.is_io_intercepted(0x63, 2));
    }

    #[test]
    fn test_cr0_guest_host_mask() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();
        vcpu.vmcs_mut().set(VmcsField::Cr0Mask, CR0_TS);
        vcpu.vmcs_mut().set(VmcsField::Cr0ReadShadow, CR0_TS);

        assert!(!vcpu.is_mov_to_cr_intercepted(0, 0x8000_0039));
        assert!(vcpu.is_mov_to_cr_intercepted(0, 0x8000_0031));
        assert!(vcpu.is_clts_intercepted());
        assert_eq!(vcpu.read_cr_shadowed(0, 0x8000_0031), 0x8000_0039);

        assert!(vcpu.is_lmsw_intercepted(0x1));
        assert!(!vcpu.is_lmsw_intercepted(0x9));
    }

    #[test]
    fn test_lmsw_setting_owned_pe() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();
        vcpu.vmcs_mut().set(VmcsField::Cr0Mask, CR0_PE);
        vcpu.vmcs_mut().set(VmcsField::Cr0ReadShadow, 0);

        assert!(vcpu.is_lmsw_intercepted(0x1));
        assert!(!vcpu.is_lmsw_intercepted(0x0));
    }

    #[test]
    fn test_cr3_targets() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();
        set_proc(&mut vcpu, ProcControls::CR3_LOAD_EXIT);
        vcpu.vmcs_mut().set(VmcsField::Cr3Target0, 0x5000);
        vcpu.vmcs_mut().set(VmcsField::Cr3Target1, 0x6000);
        vcpu.vmcs_mut().set(VmcsField::Cr3TargetCount, 1);

        assert!(!vcpu.is_mov_to_cr_intercepted(3, 0x5000));
        assert!(vcpu.is_mov_to_cr_intercepted(3, 0x6000));
    }

    #[test]
    fn test_page_fault_error_code_filter() {
        let (mut vcpu, _, _) = test_utils::vcpu_in_non_root();
        vcpu.vmcs_mut().set(VmcsField::ExceptionBitmap, 1 << X86_XCPT_PF);
        vcpu.vmcs_mut().set(VmcsField::PageFaultErrorMask, 0b10);
        vcpu.vmcs_mut().set(VmcsField::PageFaultErrorMatch, 0b10);

        assert!(vcpu.is_xcpt_intercepted(X86_XCPT_PF, Some(0b11)));
        assert!(!vcpu.is_xcpt_intercepted(X86_XCPT_PF, Some(0b01)));

        // With the bit clear, only non-matching error codes exit.
        vcpu.vmcs_mut().set(VmcsField::ExceptionBitmap, 0);
        assert!(vcpu.is_xcpt_intercepted(X86_XCPT_PF, Some(0b01)));
        assert!(!vcpu.is_xcpt_intercepted(13, Some(0)));
    }
}
