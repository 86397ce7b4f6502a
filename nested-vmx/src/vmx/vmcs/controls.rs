//! VM-execution, VM-exit and VM-entry controls.
//!
//! See `25.6 VM-Execution Control Fields`, `25.7 VM-Exit Control Fields` and
//! `25.8 VM-Entry Control Fields`.

use bitflags::bitflags;

bitflags! {
    /// Pin-based VM-execution controls.
    pub struct PinControls: u32 {
        const EXT_INT_EXIT   = 1 << 0;
        const NMI_EXIT       = 1 << 3;
        const VIRT_NMI       = 1 << 5;
        const PREEMPT_TIMER  = 1 << 6;
        const POSTED_INT     = 1 << 7;
    }

    /// Primary processor-based VM-execution controls.
    pub struct ProcControls: u32 {
        const INT_WINDOW_EXIT    = 1 << 2;
        const USE_TSC_OFFSETTING = 1 << 3;
        const HLT_EXIT           = 1 << 7;
        const INVLPG_EXIT        = 1 << 9;
        const MWAIT_EXIT         = 1 << 10;
        const RDPMC_EXIT         = 1 << 11;
        const RDTSC_EXIT         = 1 << 12;
        const CR3_LOAD_EXIT      = 1 << 15;
        const CR3_STORE_EXIT     = 1 << 16;
        const TERTIARY_CONTROLS  = 1 << 17;
        const CR8_LOAD_EXIT      = 1 << 19;
        const CR8_STORE_EXIT     = 1 << 20;
        const USE_TPR_SHADOW     = 1 << 21;
        const NMI_WINDOW_EXIT    = 1 << 22;
        const MOV_DR_EXIT        = 1 << 23;
        const UNCOND_IO_EXIT     = 1 << 24;
        const USE_IO_BITMAPS     = 1 << 25;
        const MONITOR_TRAP_FLAG  = 1 << 27;
        const USE_MSR_BITMAPS    = 1 << 28;
        const MONITOR_EXIT       = 1 << 29;
        const PAUSE_EXIT         = 1 << 30;
        const SECONDARY_CONTROLS = 1 << 31;
    }

    /// Secondary processor-based VM-execution controls.
    pub struct ProcControls2: u32 {
        const VIRT_APIC_ACCESS    = 1 << 0;
        const EPT                 = 1 << 1;
        const DESC_TABLE_EXIT     = 1 << 2;
        const RDTSCP              = 1 << 3;
        const VIRT_X2APIC_MODE    = 1 << 4;
        const VPID                = 1 << 5;
        const WBINVD_EXIT         = 1 << 6;
        const UNRESTRICTED_GUEST  = 1 << 7;
        const APIC_REG_VIRT       = 1 << 8;
        const VIRT_INT_DELIVERY   = 1 << 9;
        const PAUSE_LOOP_EXIT     = 1 << 10;
        const RDRAND_EXIT         = 1 << 11;
        const INVPCID             = 1 << 12;
        const VMFUNC              = 1 << 13;
        const VMCS_SHADOWING      = 1 << 14;
        const ENCLS_EXIT          = 1 << 15;
        const RDSEED_EXIT         = 1 << 16;
        const PML                 = 1 << 17;
        const EPT_XCPT_VE         = 1 << 18;
        const CONCEAL_VMX_FROM_PT = 1 << 19;
        const XSAVES_XRSTORS      = 1 << 20;
        const MODE_BASED_EPT_PERM = 1 << 22;
        const SPP_EPT             = 1 << 23;
        const PT_EPT              = 1 << 24;
        const TSC_SCALING         = 1 << 25;
        const USER_WAIT_PAUSE     = 1 << 26;
        const ENCLV_EXIT          = 1 << 28;
    }

    /// Primary VM-exit controls.
    pub struct ExitControls: u32 {
        const SAVE_DEBUG            = 1 << 2;
        const HOST_ADDR_SPACE_SIZE  = 1 << 9;
        const LOAD_PERF_GLOBAL_CTRL = 1 << 12;
        const ACK_EXT_INT           = 1 << 15;
        const SAVE_PAT              = 1 << 18;
        const LOAD_PAT              = 1 << 19;
        const SAVE_EFER             = 1 << 20;
        const LOAD_EFER             = 1 << 21;
        const SAVE_PREEMPT_TIMER    = 1 << 22;
        const CLEAR_BNDCFGS         = 1 << 23;
        const CONCEAL_VMX_FROM_PT   = 1 << 24;
        const CLEAR_RTIT_CTL        = 1 << 25;
        const LOAD_CET              = 1 << 28;
        const LOAD_PKRS             = 1 << 29;
    }

    /// VM-entry controls.
    pub struct EntryControls: u32 {
        const LOAD_DEBUG              = 1 << 2;
        const IA32E_MODE_GUEST        = 1 << 9;
        const ENTRY_TO_SMM            = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        const LOAD_PERF_GLOBAL_CTRL   = 1 << 13;
        const LOAD_PAT                = 1 << 14;
        const LOAD_EFER               = 1 << 15;
        const LOAD_BNDCFGS            = 1 << 16;
        const CONCEAL_VMX_FROM_PT     = 1 << 17;
        const LOAD_RTIT_CTL           = 1 << 18;
        const LOAD_CET                = 1 << 20;
        const LOAD_PKRS               = 1 << 22;
    }
}

/// Default1 class bits of each control group. These read as 1 in the non-"true" capability MSRs.
pub const PIN_CONTROLS_DEFAULT1: u32 = 0x0000_0016;
pub const PROC_CONTROLS_DEFAULT1: u32 = 0x0401_e172;
pub const EXIT_CONTROLS_DEFAULT1: u32 = 0x0003_6dff;
pub const ENTRY_CONTROLS_DEFAULT1: u32 = 0x0000_11ff;

/// Number of CR3-target values supported.
pub const CR3_TARGET_COUNT: u32 = 4;

/// Bits of the TPR-threshold field that may be set.
pub const TPR_THRESHOLD_MASK: u32 = 0xf;

/// Maximum number of MSRs in the VM-entry/VM-exit MSR areas, as advertised in IA32_VMX_MISC.
pub const AUTO_MSR_COUNT_MAX: u32 = 512;

/// Rate of the preemption timer relative to the TSC (TSC >> shift).
pub const PREEMPT_TIMER_SHIFT: u32 = 5;
