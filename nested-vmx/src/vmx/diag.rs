//! Diagnostic tags recorded for every failed VMX instruction, VM-entry check and VM-exit step.
//!
//! The tags are host-side tracing only, the guest never observes them.

use crate::cpu::SegReg;
use core::fmt;

/// The VMX instruction that produced a diagnostic.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
pub enum VmxInstr {
    Vmxon,
    Vmxoff,
    Vmlaunch,
    Vmresume,
    Vmclear,
    Vmptrld,
    Vmptrst,
    Vmread,
    Vmwrite,
    Invept,
    Invvpid,
    Vmcall,
}

impl VmxInstr {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Vmxon => "vmxon",
            Self::Vmxoff => "vmxoff",
            Self::Vmlaunch => "vmlaunch",
            Self::Vmresume => "vmresume",
            Self::Vmclear => "vmclear",
            Self::Vmptrld => "vmptrld",
            Self::Vmptrst => "vmptrst",
            Self::Vmread => "vmread",
            Self::Vmwrite => "vmwrite",
            Self::Invept => "invept",
            Self::Invvpid => "invvpid",
            Self::Vmcall => "vmcall",
        }
    }
}

/// Instruction-level diagnostics shared by all VMX instructions.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
pub enum InstrDiag {
    Success,
    Cpl,
    LongModeCs,
    RealOrV86Mode,
    VmxRoot,
    Intercept,
    Vmxe,
    A20m,
    Cr0Fixed0,
    Cr0Fixed1,
    Cr4Fixed0,
    Cr4Fixed1,
    MsrFeatCtl,
    PtrAlign,
    PtrWidth,
    PtrAbnormal,
    PtrReadPhys,
    PtrWritePhys,
    PtrVmxon,
    PtrInvalid,
    VmcsRevId,
    ShadowVmcs,
    VmxAlreadyRoot,
    LinkPtrInvalid,
    FieldInvalid,
    FieldRo,
    TypeInvalid,
    DescRsvd,
    EptpInvalid,
    Type0InvalidAddr,
    Type0InvalidVpid,
    Type1InvalidVpid,
    Type3InvalidVpid,
    VmcsClear,
    VmcsLaunch,
    BlockMovSs,
}

impl InstrDiag {
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Cpl => "CPL is not 0",
            Self::LongModeCs => "long mode without 64-bit code segment",
            Self::RealOrV86Mode => "real or virtual-8086 mode",
            Self::VmxRoot => "not in VMX operation",
            Self::Intercept => "intercepted by the outer hypervisor",
            Self::Vmxe => "CR4.VMXE not set",
            Self::A20m => "A20M asserted",
            Self::Cr0Fixed0 => "CR0 fixed-0 bit clear",
            Self::Cr0Fixed1 => "CR0 fixed-1 bit set",
            Self::Cr4Fixed0 => "CR4 fixed-0 bit clear",
            Self::Cr4Fixed1 => "CR4 fixed-1 bit set",
            Self::MsrFeatCtl => "IA32_FEATURE_CONTROL not locked or VMX disabled",
            Self::PtrAlign => "pointer not page aligned",
            Self::PtrWidth => "pointer exceeds the physical-address width",
            Self::PtrAbnormal => "pointer does not refer to ordinary memory",
            Self::PtrReadPhys => "failed to read through pointer",
            Self::PtrWritePhys => "failed to write through pointer",
            Self::PtrVmxon => "pointer equals the VMXON pointer",
            Self::PtrInvalid => "no current VMCS",
            Self::VmcsRevId => "VMCS revision identifier mismatch",
            Self::ShadowVmcs => "shadow VMCS not allowed",
            Self::VmxAlreadyRoot => "already in VMX root operation",
            Self::LinkPtrInvalid => "VMCS link pointer invalid",
            Self::FieldInvalid => "unsupported VMCS component",
            Self::FieldRo => "read-only VMCS component",
            Self::TypeInvalid => "invalidation type not supported",
            Self::DescRsvd => "descriptor reserved bits set",
            Self::EptpInvalid => "EPT pointer invalid",
            Self::Type0InvalidAddr => "individual-address invalidation with non-canonical address",
            Self::Type0InvalidVpid => "individual-address invalidation with VPID 0",
            Self::Type1InvalidVpid => "single-context invalidation with VPID 0",
            Self::Type3InvalidVpid => "single-context-retaining-globals invalidation with VPID 0",
            Self::VmcsClear => "VMCS launch state is not clear",
            Self::VmcsLaunch => "VMCS launch state is not launched",
            Self::BlockMovSs => "events blocked by MOV SS",
        }
    }
}

/// VM-entry check diagnostics. Segment-register checks carry the register that failed.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
pub enum EntryDiag {
    // Control fields.
    PinCtlsAllowed1,
    PinCtlsDisallowed0,
    ProcCtlsAllowed1,
    ProcCtlsDisallowed0,
    ProcCtls2Allowed1,
    ProcCtls2Disallowed0,
    ExitCtlsAllowed1,
    ExitCtlsDisallowed0,
    EntryCtlsAllowed1,
    EntryCtlsDisallowed0,
    Cr3TargetCount,
    AddrIoBitmapA,
    AddrIoBitmapB,
    AddrMsrBitmap,
    AddrVirtApicPage,
    VirtApicPagePtrReadPhys,
    TprThresholdRsvd,
    TprThresholdVTpr,
    VirtNmi,
    VirtNmiWindowExit,
    AddrApicAccess,
    AddrApicAccessEqVirtApic,
    VirtX2ApicTprShadow,
    VirtX2ApicVirtApic,
    ApicRegVirt,
    VirtIntDelivery,
    VirtIntDeliveryExtInt,
    Vpid,
    EptpMemType,
    EptpPageWalkLength,
    EptpAccessDirty,
    EptpRsvd,
    UnrestrictedGuestEpt,
    AddrVmreadBitmap,
    AddrVmwriteBitmap,
    SavePreemptTimer,
    AddrExitMsrStore,
    AddrExitMsrLoad,
    AddrEntryMsrLoad,
    ExitMsrStoreCount,
    ExitMsrLoadCount,
    EntryMsrLoadCount,
    EntryIntInfoTypeVecRsvd,
    EntryIntInfoErrCodePe,
    EntryIntInfoErrCodeVec,
    EntryXcptErrCodeRsvd,
    EntryInstrLen,
    EntrySmm,

    // Host-state area.
    HostCr0Fixed0,
    HostCr0Fixed1,
    HostCr4Fixed0,
    HostCr4Fixed1,
    HostCr4Pae,
    HostCr4Pcide,
    HostCr3,
    HostSysenterEspEip,
    HostPatMsr,
    HostEferMsrRsvd,
    HostEferMsr,
    HostSel(SegReg),
    HostTrSel,
    HostCsTr,
    HostSs,
    HostSegBase(SegReg),
    HostTrBase,
    HostGdtrIdtrBase,
    HostGuestLongMode,
    HostLongMode,
    HostRip,

    // Guest-state area.
    GuestCr0Fixed0,
    GuestCr0Fixed1,
    GuestCr0PgPe,
    GuestCr4Fixed0,
    GuestCr4Fixed1,
    GuestCr4PaeLongMode,
    GuestCr3,
    GuestDebugCtl,
    GuestDr7,
    GuestSysenterEspEip,
    GuestPatMsr,
    GuestEferMsrRsvd,
    GuestEferMsr,
    GuestSegBaseV86(SegReg),
    GuestSegLimitV86(SegReg),
    GuestSegAttrV86(SegReg),
    GuestSegBase(SegReg),
    GuestSegAttrDescType(SegReg),
    GuestSegAttrPresent(SegReg),
    GuestSegAttrRsvd(SegReg),
    GuestSegAttrGran(SegReg),
    GuestSegAttrTypeAcc(SegReg),
    GuestSegAttrDplRpl(SegReg),
    GuestSegAttrCsType,
    GuestSegAttrCsDplEqSs,
    GuestSegAttrCsDplLtSs,
    GuestSegAttrCsDplZero,
    GuestSegAttrCsDefBig,
    GuestSegAttrSsType,
    GuestSegAttrSsDplZero,
    GuestSegSelCsSsRpl,
    GuestSegSelLdtr,
    GuestSegSelTr,
    GuestLdtrAttrType,
    GuestLdtrAttrDescType,
    GuestLdtrAttrPresent,
    GuestLdtrAttrRsvd,
    GuestLdtrAttrGran,
    GuestLdtrBase,
    GuestTrAttrType,
    GuestTrAttrDescType,
    GuestTrAttrPresent,
    GuestTrAttrRsvd,
    GuestTrAttrGran,
    GuestTrAttrUnusable,
    GuestTrBase,
    GuestGdtrIdtrBase,
    GuestGdtrIdtrLimit,
    GuestRip,
    GuestRipRsvd,
    GuestRflagsRsvd,
    GuestRflagsVm,
    GuestRflagsIf,
    GuestActStateRsvd,
    GuestActStateHltSsDpl,
    GuestActStateStiMovSs,
    GuestActStateEvent,
    GuestIntStateRsvd,
    GuestIntStateStiMovSs,
    GuestIntStateRflagsSti,
    GuestIntStateExtInt,
    GuestIntStateNmi,
    GuestIntStateVirtNmi,
    GuestIntStateSmi,
    GuestIntStateEnclave,
    GuestPndDbgXcptRsvd,
    GuestPndDbgXcptBsTf,
    GuestPndDbgXcptBsNoTf,
    VmcsLinkPtrCurVmcs,
    VmcsLinkPtrAlign,
    VmcsLinkPtrWidth,
    VmcsLinkPtrAbnormal,
    VmcsLinkPtrReadPhys,
    VmcsLinkPtrRevId,
    VmcsLinkPtrShadow,
    GuestPdpte,

    // Loading guest state.
    MsrLoad,
    MsrLoadRing3,
    MsrLoadRsvd,
    MsrLoadPtrReadPhys,
    VmcsReadPhys,
}

impl EntryDiag {
    pub fn description(self) -> &'static str {
        match self {
            Self::PinCtlsAllowed1 => "pin-based controls: allowed-1 bit violated",
            Self::PinCtlsDisallowed0 => "pin-based controls: required-1 bit clear",
            Self::ProcCtlsAllowed1 => "processor-based controls: allowed-1 bit violated",
            Self::ProcCtlsDisallowed0 => "processor-based controls: required-1 bit clear",
            Self::ProcCtls2Allowed1 => "secondary controls: allowed-1 bit violated",
            Self::ProcCtls2Disallowed0 => "secondary controls: required-1 bit clear",
            Self::ExitCtlsAllowed1 => "VM-exit controls: allowed-1 bit violated",
            Self::ExitCtlsDisallowed0 => "VM-exit controls: required-1 bit clear",
            Self::EntryCtlsAllowed1 => "VM-entry controls: allowed-1 bit violated",
            Self::EntryCtlsDisallowed0 => "VM-entry controls: required-1 bit clear",
            Self::Cr3TargetCount => "CR3-target count too large",
            Self::AddrIoBitmapA => "I/O bitmap A address invalid",
            Self::AddrIoBitmapB => "I/O bitmap B address invalid",
            Self::AddrMsrBitmap => "MSR bitmap address invalid",
            Self::AddrVirtApicPage => "virtual-APIC page address invalid",
            Self::VirtApicPagePtrReadPhys => "failed to read the virtual-APIC page",
            Self::TprThresholdRsvd => "TPR threshold reserved bits set",
            Self::TprThresholdVTpr => "TPR threshold above VTPR[7:4]",
            Self::VirtNmi => "virtual NMIs without NMI exiting",
            Self::VirtNmiWindowExit => "NMI-window exiting without virtual NMIs",
            Self::AddrApicAccess => "APIC-access address invalid",
            Self::AddrApicAccessEqVirtApic => "APIC-access address equals virtual-APIC address",
            Self::VirtX2ApicTprShadow => "x2APIC virtualization without TPR shadow",
            Self::VirtX2ApicVirtApic => "x2APIC virtualization with APIC-access virtualization",
            Self::ApicRegVirt => "APIC-register virtualization without TPR shadow",
            Self::VirtIntDelivery => "virtual-interrupt delivery without TPR shadow",
            Self::VirtIntDeliveryExtInt => "virtual-interrupt delivery without external-interrupt exiting",
            Self::Vpid => "VPID is zero",
            Self::EptpMemType => "EPT pointer memory type unsupported",
            Self::EptpPageWalkLength => "EPT pointer page-walk length unsupported",
            Self::EptpAccessDirty => "EPT accessed/dirty flags unsupported",
            Self::EptpRsvd => "EPT pointer reserved bits set",
            Self::UnrestrictedGuestEpt => "unrestricted guest without EPT",
            Self::AddrVmreadBitmap => "VMREAD bitmap address invalid",
            Self::AddrVmwriteBitmap => "VMWRITE bitmap address invalid",
            Self::SavePreemptTimer => "save preemption timer without activation",
            Self::AddrExitMsrStore => "VM-exit MSR-store area address invalid",
            Self::AddrExitMsrLoad => "VM-exit MSR-load area address invalid",
            Self::AddrEntryMsrLoad => "VM-entry MSR-load area address invalid",
            Self::ExitMsrStoreCount => "VM-exit MSR-store count too large",
            Self::ExitMsrLoadCount => "VM-exit MSR-load count too large",
            Self::EntryMsrLoadCount => "VM-entry MSR-load count too large",
            Self::EntryIntInfoTypeVecRsvd => "entry interruption info: reserved type, vector or bits",
            Self::EntryIntInfoErrCodePe => "entry interruption info: error code without protected mode",
            Self::EntryIntInfoErrCodeVec => "entry interruption info: error code for vector without one",
            Self::EntryXcptErrCodeRsvd => "entry exception error code reserved bits set",
            Self::EntryInstrLen => "entry instruction length out of range",
            Self::EntrySmm => "entry to SMM outside SMM",
            Self::HostCr0Fixed0 => "host CR0 fixed-0 bit clear",
            Self::HostCr0Fixed1 => "host CR0 fixed-1 bit set",
            Self::HostCr4Fixed0 => "host CR4 fixed-0 bit clear",
            Self::HostCr4Fixed1 => "host CR4 fixed-1 bit set",
            Self::HostCr4Pae => "64-bit host without CR4.PAE",
            Self::HostCr4Pcide => "32-bit host with CR4.PCIDE",
            Self::HostCr3 => "host CR3 beyond the physical-address width",
            Self::HostSysenterEspEip => "host SYSENTER ESP/EIP not canonical",
            Self::HostPatMsr => "host PAT invalid",
            Self::HostEferMsrRsvd => "host EFER reserved bits set",
            Self::HostEferMsr => "host EFER.LMA/LME inconsistent with address-space size",
            Self::HostSel(_) => "host selector RPL or TI set",
            Self::HostTrSel => "host TR selector RPL or TI set",
            Self::HostCsTr => "host CS or TR selector null",
            Self::HostSs => "host SS selector null outside 64-bit mode",
            Self::HostSegBase(_) => "host segment base not canonical",
            Self::HostTrBase => "host TR base not canonical",
            Self::HostGdtrIdtrBase => "host GDTR/IDTR base not canonical",
            Self::HostGuestLongMode => "IA-32e guest with a 32-bit host",
            Self::HostLongMode => "host address-space size set on a 32-bit CPU",
            Self::HostRip => "host RIP invalid for the address-space size",
            Self::GuestCr0Fixed0 => "guest CR0 fixed-0 bit clear",
            Self::GuestCr0Fixed1 => "guest CR0 fixed-1 bit set",
            Self::GuestCr0PgPe => "guest CR0.PG without CR0.PE",
            Self::GuestCr4Fixed0 => "guest CR4 fixed-0 bit clear",
            Self::GuestCr4Fixed1 => "guest CR4 fixed-1 bit set",
            Self::GuestCr4PaeLongMode => "IA-32e guest without CR0.PG and CR4.PAE",
            Self::GuestCr3 => "guest CR3 beyond the physical-address width",
            Self::GuestDebugCtl => "guest IA32_DEBUGCTL reserved bits set",
            Self::GuestDr7 => "guest DR7 upper half set",
            Self::GuestSysenterEspEip => "guest SYSENTER ESP/EIP not canonical",
            Self::GuestPatMsr => "guest PAT invalid",
            Self::GuestEferMsrRsvd => "guest EFER reserved bits set",
            Self::GuestEferMsr => "guest EFER.LMA/LME inconsistent",
            Self::GuestSegBaseV86(_) => "virtual-8086 segment base is not selector << 4",
            Self::GuestSegLimitV86(_) => "virtual-8086 segment limit is not 0xffff",
            Self::GuestSegAttrV86(_) => "virtual-8086 segment attributes are not 0xf3",
            Self::GuestSegBase(_) => "guest segment base invalid",
            Self::GuestSegAttrDescType(_) => "guest segment is a system descriptor",
            Self::GuestSegAttrPresent(_) => "guest segment not present",
            Self::GuestSegAttrRsvd(_) => "guest segment attribute reserved bits set",
            Self::GuestSegAttrGran(_) => "guest segment granularity inconsistent with limit",
            Self::GuestSegAttrTypeAcc(_) => "guest segment type not accessed or not readable",
            Self::GuestSegAttrDplRpl(_) => "guest segment DPL below RPL",
            Self::GuestSegAttrCsType => "guest CS type invalid",
            Self::GuestSegAttrCsDplEqSs => "guest non-conforming CS DPL differs from SS DPL",
            Self::GuestSegAttrCsDplLtSs => "guest conforming CS DPL above SS DPL",
            Self::GuestSegAttrCsDplZero => "guest read/write accessed CS DPL not zero",
            Self::GuestSegAttrCsDefBig => "guest 64-bit CS with D bit set",
            Self::GuestSegAttrSsType => "guest SS type invalid",
            Self::GuestSegAttrSsDplZero => "guest SS DPL not zero in real mode",
            Self::GuestSegSelCsSsRpl => "guest CS.RPL differs from SS.RPL",
            Self::GuestSegSelLdtr => "guest LDTR selector TI set",
            Self::GuestSegSelTr => "guest TR selector TI set",
            Self::GuestLdtrAttrType => "guest LDTR type invalid",
            Self::GuestLdtrAttrDescType => "guest LDTR not a system descriptor",
            Self::GuestLdtrAttrPresent => "guest LDTR not present",
            Self::GuestLdtrAttrRsvd => "guest LDTR attribute reserved bits set",
            Self::GuestLdtrAttrGran => "guest LDTR granularity inconsistent with limit",
            Self::GuestLdtrBase => "guest LDTR base not canonical",
            Self::GuestTrAttrType => "guest TR type invalid",
            Self::GuestTrAttrDescType => "guest TR not a system descriptor",
            Self::GuestTrAttrPresent => "guest TR not present",
            Self::GuestTrAttrRsvd => "guest TR attribute reserved bits set",
            Self::GuestTrAttrGran => "guest TR granularity inconsistent with limit",
            Self::GuestTrAttrUnusable => "guest TR unusable",
            Self::GuestTrBase => "guest TR base not canonical",
            Self::GuestGdtrIdtrBase => "guest GDTR/IDTR base not canonical",
            Self::GuestGdtrIdtrLimit => "guest GDTR/IDTR limit above 0xffff",
            Self::GuestRip => "guest RIP not canonical",
            Self::GuestRipRsvd => "guest RIP upper half set outside 64-bit code",
            Self::GuestRflagsRsvd => "guest RFLAGS reserved bits set",
            Self::GuestRflagsVm => "guest RFLAGS.VM set in IA-32e mode or without CR0.PE",
            Self::GuestRflagsIf => "external interrupt injected with RFLAGS.IF clear",
            Self::GuestActStateRsvd => "guest activity state unsupported",
            Self::GuestActStateHltSsDpl => "guest HLT state with SS.DPL not zero",
            Self::GuestActStateStiMovSs => "guest activity state not active while blocked by STI or MOV SS",
            Self::GuestActStateEvent => "injected event not allowed in guest activity state",
            Self::GuestIntStateRsvd => "guest interruptibility reserved bits set",
            Self::GuestIntStateStiMovSs => "guest blocked by both STI and MOV SS",
            Self::GuestIntStateRflagsSti => "guest blocked by STI with RFLAGS.IF clear",
            Self::GuestIntStateExtInt => "external interrupt injected while blocked by STI or MOV SS",
            Self::GuestIntStateNmi => "NMI injected while blocked by MOV SS",
            Self::GuestIntStateVirtNmi => "virtual NMI injected while blocked by NMI",
            Self::GuestIntStateSmi => "guest blocked by SMI outside SMM",
            Self::GuestIntStateEnclave => "guest enclave interruption inconsistent",
            Self::GuestPndDbgXcptRsvd => "guest pending debug exceptions reserved bits set",
            Self::GuestPndDbgXcptBsTf => "guest pending BS clear with TF set and BTF clear",
            Self::GuestPndDbgXcptBsNoTf => "guest pending BS set with TF clear or BTF set",
            Self::VmcsLinkPtrCurVmcs => "VMCS link pointer equals the current VMCS",
            Self::VmcsLinkPtrAlign => "VMCS link pointer not page aligned",
            Self::VmcsLinkPtrWidth => "VMCS link pointer beyond the physical-address width",
            Self::VmcsLinkPtrAbnormal => "VMCS link pointer not ordinary memory",
            Self::VmcsLinkPtrReadPhys => "failed to read the VMCS link pointer target",
            Self::VmcsLinkPtrRevId => "VMCS link pointer revision mismatch",
            Self::VmcsLinkPtrShadow => "VMCS link pointer shadow bit mismatch",
            Self::GuestPdpte => "guest PDPTE reserved bits set",
            Self::MsrLoad => "VM-entry MSR load failed",
            Self::MsrLoadRing3 => "VM-entry MSR load needs host completion",
            Self::MsrLoadRsvd => "VM-entry MSR-load entry reserved",
            Self::MsrLoadPtrReadPhys => "failed to read the VM-entry MSR-load area",
            Self::VmcsReadPhys => "failed to read a VMCS-referenced structure",
        }
    }

    /// The segment register a per-register check failed on.
    pub fn segment(self) -> Option<SegReg> {
        match self {
            Self::HostSel(reg)
            | Self::HostSegBase(reg)
            | Self::GuestSegBaseV86(reg)
            | Self::GuestSegLimitV86(reg)
            | Self::GuestSegAttrV86(reg)
            | Self::GuestSegBase(reg)
            | Self::GuestSegAttrDescType(reg)
            | Self::GuestSegAttrPresent(reg)
            | Self::GuestSegAttrRsvd(reg)
            | Self::GuestSegAttrGran(reg)
            | Self::GuestSegAttrTypeAcc(reg)
            | Self::GuestSegAttrDplRpl(reg) => Some(reg),
            _ => None,
        }
    }
}

/// VM-exit step diagnostics.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
pub enum ExitDiag {
    HostPdpte,
    MsrLoad,
    MsrLoadRing3,
    MsrLoadRsvd,
    MsrLoadCount,
    MsrLoadPtrReadPhys,
    MsrStore,
    MsrStoreRing3,
    MsrStoreRsvd,
    MsrStoreCount,
    MsrStorePtrWritePhys,
    VirtApicPagePtrWritePhys,
    VmcsWritePhys,
    Nested,
}

impl ExitDiag {
    pub fn description(self) -> &'static str {
        match self {
            Self::HostPdpte => "host PDPTE invalid",
            Self::MsrLoad => "VM-exit MSR load failed",
            Self::MsrLoadRing3 => "VM-exit MSR load needs host completion",
            Self::MsrLoadRsvd => "VM-exit MSR-load entry reserved",
            Self::MsrLoadCount => "VM-exit MSR-load count too large",
            Self::MsrLoadPtrReadPhys => "failed to read the VM-exit MSR-load area",
            Self::MsrStore => "VM-exit MSR store failed",
            Self::MsrStoreRing3 => "VM-exit MSR store needs host completion",
            Self::MsrStoreRsvd => "VM-exit MSR-store entry reserved",
            Self::MsrStoreCount => "VM-exit MSR-store count too large",
            Self::MsrStorePtrWritePhys => "failed to write the VM-exit MSR-store area",
            Self::VirtApicPagePtrWritePhys => "failed to write the virtual-APIC page",
            Self::VmcsWritePhys => "failed to write the VMCS back to guest memory",
            Self::Nested => "VM-exit raised while constructing another VM-exit",
        }
    }
}

/// The last diagnostic recorded on a virtual CPU.
#[derive(Hash, Eq, PartialEq, Debug, Copy, Clone)]
pub enum VmxDiag {
    None,
    Instr { instr: VmxInstr, cause: InstrDiag },
    Entry(EntryDiag),
    Exit(ExitDiag),
}

impl Default for VmxDiag {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for VmxDiag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Instr { instr, cause } => write!(f, "{}: {}", instr.mnemonic(), cause.description()),
            Self::Entry(diag) => match diag.segment() {
                Some(reg) => write!(f, "vmentry: {} ({:?})", diag.description(), reg),
                None => write!(f, "vmentry: {}", diag.description()),
            },
            Self::Exit(diag) => write!(f, "vmexit: {}", diag.description()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_includes_segment() {
        let diag = VmxDiag::Entry(EntryDiag::GuestSegBaseV86(SegReg::Fs));
        assert_eq!(
            diag.to_string(),
            "vmentry: virtual-8086 segment base is not selector << 4 (Fs)"
        );
    }

    #[test]
    fn test_per_register_tags_differ() {
        let es = EntryDiag::GuestSegLimitV86(SegReg::Es);
        let gs = EntryDiag::GuestSegLimitV86(SegReg::Gs);
        assert_ne!(es, gs);
        assert_eq!(gs.segment(), Some(SegReg::Gs));
    }

    #[test]
    fn test_instr_display() {
        let diag = VmxDiag::Instr {
            instr: VmxInstr::Vmptrld,
            cause: InstrDiag::PtrVmxon,
        };
        assert_eq!(diag.to_string(), "vmptrld: pointer equals the VMXON pointer");
    }
}
