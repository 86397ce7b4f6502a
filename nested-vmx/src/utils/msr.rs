//! MSR numbers and bits the engine needs beyond what `x86::msr` provides.

pub use x86::msr::{
    IA32_DEBUGCTL, IA32_EFER, IA32_FEATURE_CONTROL, IA32_FS_BASE, IA32_GS_BASE, IA32_PAT,
    IA32_SYSENTER_CS, IA32_SYSENTER_EIP, IA32_SYSENTER_ESP, IA32_X2APIC_EOI, IA32_X2APIC_SELF_IPI,
    IA32_X2APIC_TPR,
};

pub const IA32_SMBASE: u32 = 0x0000_009e;
pub const IA32_BIOS_UPDT_TRIG: u32 = 0x0000_0079;
pub const IA32_SMM_MONITOR_CTL: u32 = 0x0000_009b;
pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x0000_038f;
pub const IA32_BNDCFGS: u32 = 0x0000_0d90;
pub const IA32_RTIT_CTL: u32 = 0x0000_0570;
pub const IA32_S_CET: u32 = 0x0000_06a2;
pub const IA32_PKRS: u32 = 0x0000_06e1;

/// VMX capability MSRs.
pub const IA32_VMX_BASIC: u32 = 0x0000_0480;
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x0000_0481;
pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x0000_0482;
pub const IA32_VMX_EXIT_CTLS: u32 = 0x0000_0483;
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x0000_0484;
pub const IA32_VMX_MISC: u32 = 0x0000_0485;
pub const IA32_VMX_CR0_FIXED0: u32 = 0x0000_0486;
pub const IA32_VMX_CR0_FIXED1: u32 = 0x0000_0487;
pub const IA32_VMX_CR4_FIXED0: u32 = 0x0000_0488;
pub const IA32_VMX_CR4_FIXED1: u32 = 0x0000_0489;
pub const IA32_VMX_VMCS_ENUM: u32 = 0x0000_048a;
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x0000_048b;
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x0000_048c;
pub const IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x0000_048d;
pub const IA32_VMX_TRUE_PROCBASED_CTLS: u32 = 0x0000_048e;
pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x0000_048f;
pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x0000_0490;
pub const IA32_VMX_VMFUNC: u32 = 0x0000_0491;

/// IA32_FEATURE_CONTROL bits.
pub const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
pub const FEATURE_CONTROL_VMXON_INSIDE_SMX: u64 = 1 << 1;
pub const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

/// x2APIC MSRs live in 0x800..=0x8ff; the register offset is `(msr - 0x800) << 4`.
pub const X2APIC_MSR_FIRST: u32 = 0x0000_0800;
pub const X2APIC_MSR_LAST: u32 = 0x0000_08ff;

/// Returns whether the MSR belongs to the x2APIC range.
pub fn is_x2apic_msr(msr: u32) -> bool {
    (X2APIC_MSR_FIRST..=X2APIC_MSR_LAST).contains(&msr)
}

/// Converts an x2APIC MSR into the matching xAPIC register offset.
pub fn x2apic_msr_to_offset(msr: u32) -> u16 {
    ((msr - X2APIC_MSR_FIRST) << 4) as u16
}

/// EFER bits with a meaning for VM-entry checks.
pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

/// Bits of IA32_EFER that may be set.
pub const EFER_VALID_MASK: u64 = EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE;

/// Bits of IA32_DEBUGCTL that may be set.
pub const DEBUGCTL_VALID_MASK: u64 = 0x0000_0000_0000_d3c3;

/// Returns whether every byte of the PAT holds a valid memory type (0, 1, 4, 5, 6 or 7).
pub fn is_pat_valid(pat: u64) -> bool {
    pat.to_le_bytes()
        .iter()
        .all(|ty| matches!(ty, 0 | 1 | 4 | 5 | 6 | 7))
}

/// MSRs that may not appear in the VM-entry/VM-exit MSR-load areas.
pub fn is_msr_load_reserved(msr: u32) -> bool {
    msr == IA32_FS_BASE
        || msr == IA32_GS_BASE
        || msr == IA32_SMM_MONITOR_CTL
        || msr == IA32_BIOS_UPDT_TRIG
        || msr >> 8 == 0x8
}

/// MSRs that may not appear in the VM-exit MSR-store area.
pub fn is_msr_store_reserved(msr: u32) -> bool {
    msr == IA32_SMBASE || msr >> 8 == 0x8
}
