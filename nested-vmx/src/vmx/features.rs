//! VMX features exposed to the guest hypervisor and the capability MSRs derived from them.
//!
//! The capability MSRs are the single source of truth: the VM-entry checks validate against them and
//! guest RDMSR of `IA32_VMX_*` returns them.

use crate::{
    utils::msr::*,
    vmx::vmcs::{
        controls::*,
        field::VMCS_MAX_INDEX,
        info::{EPT_MEMTYPE_UC, EPT_MEMTYPE_WB},
        VMCS_REVISION_ID,
    },
};

/// CR0 bits that must be set in VMX operation: PE, NE and PG.
pub const CR0_FIXED0: u64 = 0x8000_0021;
/// CR0 bits that may be set in VMX operation.
pub const CR0_FIXED1: u64 = 0xffff_ffff;
pub const CR0_PE: u64 = 1 << 0;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_PG: u64 = 1 << 31;

/// CR4 bits that must be set in VMX operation: VMXE.
pub const CR4_FIXED0: u64 = CR4_VMXE;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_VMXE: u64 = 1 << 13;
pub const CR4_PCIDE: u64 = 1 << 17;

/// CR4 bits the virtual CPU implements (VME..UMIP, VMXE, FSGSBASE, PCIDE, OSXSAVE, SMEP, SMAP, PKE).
const CR4_SUPPORTED: u64 = 0x0077_2fff;

/// INVEPT types.
pub const INVEPT_SINGLE_CONTEXT: u64 = 1;
pub const INVEPT_ALL_CONTEXT: u64 = 2;

/// INVVPID types.
pub const INVVPID_INDIV_ADDR: u64 = 0;
pub const INVVPID_SINGLE_CONTEXT: u64 = 1;
pub const INVVPID_ALL_CONTEXT: u64 = 2;
pub const INVVPID_SINGLE_CONTEXT_RETAIN_GLOBALS: u64 = 3;

/// The allowed-0/allowed-1 halves of a control capability MSR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CtlsMsr {
    /// Bits that must be 1.
    pub allowed0: u32,
    /// Bits that may be 1.
    pub allowed1: u32,
}

/// How a control value violates its capability MSR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtlsViolation {
    /// A bit that must be 1 is 0.
    Disallowed0,
    /// A bit that must be 0 is 1.
    Allowed1,
}

impl CtlsMsr {
    pub const fn from_raw(value: u64) -> Self {
        Self {
            allowed0: value as u32,
            allowed1: (value >> 32) as u32,
        }
    }

    pub const fn to_raw(self) -> u64 {
        self.allowed0 as u64 | (self.allowed1 as u64) << 32
    }

    pub fn check(self, value: u32) -> Result<(), CtlsViolation> {
        if value & self.allowed0 != self.allowed0 {
            return Err(CtlsViolation::Disallowed0);
        }

        if value & !self.allowed1 != 0 {
            return Err(CtlsViolation::Allowed1);
        }

        Ok(())
    }
}

/// The VMX features of the virtual CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmxFeatures {
    pub ept: bool,
    pub ept_access_dirty: bool,
    pub vpid: bool,
    pub unrestricted_guest: bool,
    pub vmcs_shadowing: bool,
    pub tpr_shadow: bool,
    pub virt_apic_access: bool,
    pub virt_x2apic: bool,
    pub apic_reg_virt: bool,
    pub virt_int_delivery: bool,
    pub virt_nmi: bool,
    pub preempt_timer: bool,
    pub mtf: bool,
    pub pause_loop_exit: bool,
    pub rdtscp: bool,
    pub invpcid: bool,
    pub xsaves: bool,
    pub load_efer: bool,
    pub load_pat: bool,
    pub load_perf_global_ctrl: bool,
    /// The virtual CPU supports IA-32e mode (64-bit hosts and guests).
    pub long_mode: bool,
    /// Guest physical-address width in bits.
    pub phys_addr_width: u8,
}

impl Default for VmxFeatures {
    /// A minimal VMX implementation: no secondary controls beyond descriptor-table exiting.
    fn default() -> Self {
        Self {
            ept: false,
            ept_access_dirty: false,
            vpid: false,
            unrestricted_guest: false,
            vmcs_shadowing: false,
            tpr_shadow: true,
            virt_apic_access: false,
            virt_x2apic: false,
            apic_reg_virt: false,
            virt_int_delivery: false,
            virt_nmi: true,
            preempt_timer: false,
            mtf: true,
            pause_loop_exit: false,
            rdtscp: false,
            invpcid: false,
            xsaves: false,
            load_efer: true,
            load_pat: true,
            load_perf_global_ctrl: false,
            long_mode: true,
            phys_addr_width: 39,
        }
    }
}

impl VmxFeatures {
    /// Every feature the engine can emulate.
    pub fn full() -> Self {
        Self {
            ept: true,
            ept_access_dirty: false,
            vpid: true,
            unrestricted_guest: true,
            vmcs_shadowing: true,
            tpr_shadow: true,
            virt_apic_access: true,
            virt_x2apic: true,
            apic_reg_virt: true,
            virt_int_delivery: true,
            virt_nmi: true,
            preempt_timer: true,
            mtf: true,
            pause_loop_exit: true,
            rdtscp: true,
            invpcid: true,
            xsaves: true,
            load_efer: true,
            load_pat: true,
            load_perf_global_ctrl: true,
            long_mode: true,
            phys_addr_width: 39,
        }
    }

    /// Rejects feature combinations the architecture does not allow.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(36..=52).contains(&self.phys_addr_width) {
            return Err("physical-address width must be within 36..=52");
        }

        if (self.virt_x2apic || self.apic_reg_virt || self.virt_int_delivery) && !self.tpr_shadow {
            return Err("APIC virtualization requires the TPR shadow");
        }

        if self.unrestricted_guest && !self.ept {
            return Err("unrestricted guest requires EPT");
        }

        if self.ept_access_dirty && !self.ept {
            return Err("EPT accessed/dirty flags require EPT");
        }

        Ok(())
    }

    pub fn basic(&self) -> u64 {
        const VMCS_SIZE: u64 = 4096;
        const MEMTYPE_WB: u64 = 6;

        VMCS_REVISION_ID as u64
            | VMCS_SIZE << 32
            | MEMTYPE_WB << 50
            | 1 << 54 // INS/OUTS instruction information
            | 1 << 55 // TRUE_* control MSRs
    }

    pub fn pin_ctls(&self) -> CtlsMsr {
        let mut allowed1 = PinControls::EXT_INT_EXIT | PinControls::NMI_EXIT;
        allowed1.set(PinControls::VIRT_NMI, self.virt_nmi);
        allowed1.set(PinControls::PREEMPT_TIMER, self.preempt_timer);

        CtlsMsr {
            allowed0: PIN_CONTROLS_DEFAULT1,
            allowed1: PIN_CONTROLS_DEFAULT1 | allowed1.bits(),
        }
    }

    pub fn proc_ctls(&self) -> CtlsMsr {
        let mut allowed1 = ProcControls::INT_WINDOW_EXIT
            | ProcControls::USE_TSC_OFFSETTING
            | ProcControls::HLT_EXIT
            | ProcControls::INVLPG_EXIT
            | ProcControls::MWAIT_EXIT
            | ProcControls::RDPMC_EXIT
            | ProcControls::RDTSC_EXIT
            | ProcControls::CR3_LOAD_EXIT
            | ProcControls::CR3_STORE_EXIT
            | ProcControls::CR8_LOAD_EXIT
            | ProcControls::CR8_STORE_EXIT
            | ProcControls::MOV_DR_EXIT
            | ProcControls::UNCOND_IO_EXIT
            | ProcControls::USE_IO_BITMAPS
            | ProcControls::USE_MSR_BITMAPS
            | ProcControls::MONITOR_EXIT
            | ProcControls::PAUSE_EXIT
            | ProcControls::SECONDARY_CONTROLS;
        allowed1.set(ProcControls::USE_TPR_SHADOW, self.tpr_shadow);
        allowed1.set(ProcControls::NMI_WINDOW_EXIT, self.virt_nmi);
        allowed1.set(ProcControls::MONITOR_TRAP_FLAG, self.mtf);

        CtlsMsr {
            allowed0: PROC_CONTROLS_DEFAULT1,
            allowed1: PROC_CONTROLS_DEFAULT1 | allowed1.bits(),
        }
    }

    pub fn proc_ctls2(&self) -> CtlsMsr {
        let mut allowed1 = ProcControls2::DESC_TABLE_EXIT
            | ProcControls2::WBINVD_EXIT
            | ProcControls2::RDRAND_EXIT
            | ProcControls2::RDSEED_EXIT;
        allowed1.set(ProcControls2::VIRT_APIC_ACCESS, self.virt_apic_access);
        allowed1.set(ProcControls2::EPT, self.ept);
        allowed1.set(ProcControls2::RDTSCP, self.rdtscp);
        allowed1.set(ProcControls2::VIRT_X2APIC_MODE, self.virt_x2apic);
        allowed1.set(ProcControls2::VPID, self.vpid);
        allowed1.set(ProcControls2::UNRESTRICTED_GUEST, self.unrestricted_guest);
        allowed1.set(ProcControls2::APIC_REG_VIRT, self.apic_reg_virt);
        allowed1.set(ProcControls2::VIRT_INT_DELIVERY, self.virt_int_delivery);
        allowed1.set(ProcControls2::PAUSE_LOOP_EXIT, self.pause_loop_exit);
        allowed1.set(ProcControls2::INVPCID, self.invpcid);
        allowed1.set(ProcControls2::VMCS_SHADOWING, self.vmcs_shadowing);
        allowed1.set(ProcControls2::XSAVES_XRSTORS, self.xsaves);

        CtlsMsr {
            allowed0: 0,
            allowed1: allowed1.bits(),
        }
    }

    pub fn exit_ctls(&self) -> CtlsMsr {
        let mut allowed1 = ExitControls::SAVE_DEBUG | ExitControls::ACK_EXT_INT;
        allowed1.set(ExitControls::HOST_ADDR_SPACE_SIZE, self.long_mode);
        allowed1.set(ExitControls::SAVE_PAT | ExitControls::LOAD_PAT, self.load_pat);
        allowed1.set(ExitControls::SAVE_EFER | ExitControls::LOAD_EFER, self.load_efer);
        allowed1.set(ExitControls::SAVE_PREEMPT_TIMER, self.preempt_timer);
        allowed1.set(ExitControls::LOAD_PERF_GLOBAL_CTRL, self.load_perf_global_ctrl);

        CtlsMsr {
            allowed0: EXIT_CONTROLS_DEFAULT1,
            allowed1: EXIT_CONTROLS_DEFAULT1 | allowed1.bits(),
        }
    }

    pub fn entry_ctls(&self) -> CtlsMsr {
        let mut allowed1 = EntryControls::LOAD_DEBUG;
        allowed1.set(EntryControls::IA32E_MODE_GUEST, self.long_mode);
        allowed1.set(EntryControls::LOAD_PAT, self.load_pat);
        allowed1.set(EntryControls::LOAD_EFER, self.load_efer);
        allowed1.set(EntryControls::LOAD_PERF_GLOBAL_CTRL, self.load_perf_global_ctrl);

        CtlsMsr {
            allowed0: ENTRY_CONTROLS_DEFAULT1,
            allowed1: ENTRY_CONTROLS_DEFAULT1 | allowed1.bits(),
        }
    }

    /// The "true" variants only differ in the default1 bits that may be cleared.
    pub fn true_pin_ctls(&self) -> CtlsMsr {
        self.pin_ctls()
    }

    pub fn true_proc_ctls(&self) -> CtlsMsr {
        let ctls = self.proc_ctls();
        let clearable = ProcControls::CR3_LOAD_EXIT | ProcControls::CR3_STORE_EXIT;

        CtlsMsr {
            allowed0: ctls.allowed0 & !clearable.bits(),
            ..ctls
        }
    }

    pub fn true_exit_ctls(&self) -> CtlsMsr {
        let ctls = self.exit_ctls();

        CtlsMsr {
            allowed0: ctls.allowed0 & !ExitControls::SAVE_DEBUG.bits(),
            ..ctls
        }
    }

    pub fn true_entry_ctls(&self) -> CtlsMsr {
        let ctls = self.entry_ctls();

        CtlsMsr {
            allowed0: ctls.allowed0 & !EntryControls::LOAD_DEBUG.bits(),
            ..ctls
        }
    }

    pub fn misc(&self) -> u64 {
        // Activity states HLT, shutdown and wait-for-SIPI.
        const ACTIVITY_STATES: u64 = 0b111 << 6;
        const STORE_LMA_IN_ENTRY_CTLS: u64 = 1 << 5;
        // (N + 1) * 512 MSRs.
        const MSR_COUNT_FIELD: u64 = (AUTO_MSR_COUNT_MAX as u64 / 512 - 1) << 25;

        let vmwrite_all = if cfg!(feature = "vmwrite-all") { 1 << 29 } else { 0 };

        PREEMPT_TIMER_SHIFT as u64
            | STORE_LMA_IN_ENTRY_CTLS
            | ACTIVITY_STATES
            | (CR3_TARGET_COUNT as u64) << 16
            | MSR_COUNT_FIELD
            | vmwrite_all
    }

    /// Whether VMWRITE may modify the VM-exit information fields.
    pub fn vmwrite_all(&self) -> bool {
        self.misc() & (1 << 29) != 0
    }

    /// CR0 bits that must be set on VMXON and in the guest on VM-entry. Unrestricted guests may clear
    /// PE and PG.
    pub fn cr0_fixed0(&self, unrestricted: bool) -> u64 {
        if unrestricted {
            CR0_FIXED0 & !(CR0_PE | CR0_PG)
        } else {
            CR0_FIXED0
        }
    }

    pub fn cr4_fixed1(&self) -> u64 {
        CR4_SUPPORTED
    }

    pub fn vmcs_enum(&self) -> u64 {
        (VMCS_MAX_INDEX as u64) << 1
    }

    pub fn ept_vpid_cap(&self) -> u64 {
        let mut cap = 0;

        if self.ept {
            cap |= 1 << 6; // Page-walk length of 4
            cap |= 1 << 8; // UC
            cap |= 1 << 14; // WB
            cap |= 1 << 16; // 2MB pages
            cap |= 1 << 20; // INVEPT
            cap |= 1 << 25; // Single-context INVEPT
            cap |= 1 << 26; // All-context INVEPT
            if self.ept_access_dirty {
                cap |= 1 << 21;
            }
        }

        if self.vpid {
            cap |= 1 << 32; // INVVPID
            cap |= 1 << 40; // Individual-address
            cap |= 1 << 41; // Single-context
            cap |= 1 << 42; // All-context
            cap |= 1 << 43; // Single-context-retaining-globals
        }

        cap
    }

    pub fn is_ept_memtype_supported(&self, memtype: u8) -> bool {
        let cap = self.ept_vpid_cap();
        match memtype {
            EPT_MEMTYPE_UC => cap & (1 << 8) != 0,
            EPT_MEMTYPE_WB => cap & (1 << 14) != 0,
            _ => false,
        }
    }

    pub fn is_invept_type_supported(&self, ty: u64) -> bool {
        let cap = self.ept_vpid_cap();
        match ty {
            INVEPT_SINGLE_CONTEXT => cap & (1 << 25) != 0,
            INVEPT_ALL_CONTEXT => cap & (1 << 26) != 0,
            _ => false,
        }
    }

    pub fn is_invvpid_type_supported(&self, ty: u64) -> bool {
        ty <= INVVPID_SINGLE_CONTEXT_RETAIN_GLOBALS && self.ept_vpid_cap() & (1 << (40 + ty)) != 0
    }

    /// Answers RDMSR of a VMX capability MSR. Returns `None` for any other MSR.
    pub fn read_msr(&self, msr: u32) -> Option<u64> {
        let value = match msr {
            IA32_VMX_BASIC => self.basic(),
            IA32_VMX_PINBASED_CTLS => self.pin_ctls().to_raw(),
            IA32_VMX_PROCBASED_CTLS => self.proc_ctls().to_raw(),
            IA32_VMX_EXIT_CTLS => self.exit_ctls().to_raw(),
            IA32_VMX_ENTRY_CTLS => self.entry_ctls().to_raw(),
            IA32_VMX_MISC => self.misc(),
            IA32_VMX_CR0_FIXED0 => CR0_FIXED0,
            IA32_VMX_CR0_FIXED1 => CR0_FIXED1,
            IA32_VMX_CR4_FIXED0 => CR4_FIXED0,
            IA32_VMX_CR4_FIXED1 => self.cr4_fixed1(),
            IA32_VMX_VMCS_ENUM => self.vmcs_enum(),
            IA32_VMX_PROCBASED_CTLS2 => self.proc_ctls2().to_raw(),
            IA32_VMX_EPT_VPID_CAP => self.ept_vpid_cap(),
            IA32_VMX_TRUE_PINBASED_CTLS => self.true_pin_ctls().to_raw(),
            IA32_VMX_TRUE_PROCBASED_CTLS => self.true_proc_ctls().to_raw(),
            IA32_VMX_TRUE_EXIT_CTLS => self.true_exit_ctls().to_raw(),
            IA32_VMX_TRUE_ENTRY_CTLS => self.true_entry_ctls().to_raw(),
            IA32_VMX_VMFUNC => 0,
            _ => return None,
        };

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctls_check() {
        let msr = CtlsMsr {
            allowed0: 0b0001,
            allowed1: 0b0111,
        };

        assert_eq!(msr.check(0b0011), Ok(()));
        assert_eq!(msr.check(0b0010), Err(CtlsViolation::Disallowed0));
        assert_eq!(msr.check(0b1001), Err(CtlsViolation::Allowed1));
        assert_eq!(CtlsMsr::from_raw(msr.to_raw()), msr);
    }

    #[test]
    fn test_validate() {
        assert!(VmxFeatures::full().validate().is_ok());
        assert!(VmxFeatures::default().validate().is_ok());

        let mut features = VmxFeatures::full();
        features.tpr_shadow = false;
        assert!(features.validate().is_err());

        let mut features = VmxFeatures::default();
        features.phys_addr_width = 64;
        assert!(features.validate().is_err());
    }

    #[test]
    fn test_default1_bits_are_allowed() {
        let features = VmxFeatures::full();
        for ctls in [
            features.pin_ctls(),
            features.proc_ctls(),
            features.exit_ctls(),
            features.entry_ctls(),
        ] {
            assert_eq!(ctls.allowed0 & ctls.allowed1, ctls.allowed0);
        }
    }

    #[test]
    fn test_disabled_features_are_not_advertised() {
        let features = VmxFeatures::default();
        let proc2 = ProcControls2::from_bits_truncate(features.proc_ctls2().allowed1);

        assert!(!proc2.contains(ProcControls2::EPT));
        assert!(!proc2.contains(ProcControls2::VMCS_SHADOWING));
        assert_eq!(features.ept_vpid_cap(), 0);
        assert!(!features.is_invept_type_supported(INVEPT_ALL_CONTEXT));
    }

    #[test]
    fn test_capability_msrs() {
        let features = VmxFeatures::full();

        let basic = features.read_msr(IA32_VMX_BASIC).unwrap();
        assert_eq!(basic as u32, VMCS_REVISION_ID);
        assert_eq!((basic >> 32) & 0x1fff, 4096);
        assert_eq!(features.read_msr(IA32_VMX_VMCS_ENUM), Some(0x44));
        assert_eq!(features.read_msr(IA32_VMX_MISC).unwrap() & 0x1f, 5);
        assert_eq!((features.misc() >> 16) & 0x1ff, 4);
        assert!(features.is_invvpid_type_supported(INVVPID_INDIV_ADDR));
        assert!(!features.is_invvpid_type_supported(4));
        assert_eq!(features.read_msr(IA32_EFER), None);
    }
}
