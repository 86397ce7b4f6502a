//! Failure channels of the nested VMX engine.
//!
//! Architectural outcomes of VMX instructions ([`VmxStatus`]) are not errors: a VMfail is reported to
//! the guest through RFLAGS and the VM-instruction error field. [`VmxError`] is reserved for conditions
//! that leave the normal instruction flow (a guest exception, a VMX-abort, a broken memory access).

use snafu::prelude::*;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum VmxError {
    /// The instruction raises an exception in the guest instead of completing.
    #[snafu(display("Guest exception {} (error code {:?})", vector, error_code))]
    Exception { vector: u8, error_code: Option<u32> },

    /// Host state could not be restored during a VM-exit. Always ends in a triple fault.
    #[snafu(display("VMX-abort: {}", reason))]
    Abort { reason: VmxAbort },

    #[snafu(display("Failed to access guest-physical memory at {:#x}", gpa))]
    PhysAccess { gpa: u64 },
}

pub type VmxResult<T> = Result<T, VmxError>;

/// Raises #UD in the guest.
pub fn ud<T>() -> VmxResult<T> {
    Err(VmxError::Exception {
        vector: 6,
        error_code: None,
    })
}

/// Raises #GP(0) in the guest.
pub fn gp0<T>() -> VmxResult<T> {
    Err(VmxError::Exception {
        vector: 13,
        error_code: Some(0),
    })
}

/// Raises #SS(0) in the guest.
pub fn ss0<T>() -> VmxResult<T> {
    Err(VmxError::Exception {
        vector: 12,
        error_code: Some(0),
    })
}

/// Architectural VM-instruction error numbers.
///
/// See `31.4 VM Instruction Error Numbers`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum VmInstrError {
    VmcallInRoot = 1,
    VmclearInvalidPhysAddr = 2,
    VmclearWithVmxonPtr = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    EntryInvalidControls = 7,
    EntryInvalidHostState = 8,
    VmptrldInvalidPhysAddr = 9,
    VmptrldWithVmxonPtr = 10,
    VmptrldIncorrectVmcsRev = 11,
    VmreadVmwriteInvalidComponent = 12,
    VmwriteRoComponent = 13,
    VmxonInRoot = 15,
    EntryInvalidExecVmcsPtr = 16,
    EntryNonLaunchedExecVmcs = 17,
    EntryExecVmcsPtr = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidExitCtls = 20,
    VmcallIncorrectMsegRev = 22,
    VmxoffDualMon = 23,
    VmcallInvalidSmmCtls = 24,
    EntryInvalidVmExecCtls = 25,
    EntryMovSsBlocking = 26,
    InveptInvvpidInvalidOperand = 28,
}

impl VmInstrError {
    pub fn description(self) -> &'static str {
        match self {
            Self::VmcallInRoot => "VMCALL executed in VMX root operation",
            Self::VmclearInvalidPhysAddr => "VMCLEAR with invalid physical address",
            Self::VmclearWithVmxonPtr => "VMCLEAR with VMXON pointer",
            Self::VmlaunchNonClearVmcs => "VMLAUNCH with non-clear VMCS",
            Self::VmresumeNonLaunchedVmcs => "VMRESUME with non-launched VMCS",
            Self::VmresumeAfterVmxoff => "VMRESUME after VMXOFF",
            Self::EntryInvalidControls => "VM entry with invalid control field(s)",
            Self::EntryInvalidHostState => "VM entry with invalid host-state field(s)",
            Self::VmptrldInvalidPhysAddr => "VMPTRLD with invalid physical address",
            Self::VmptrldWithVmxonPtr => "VMPTRLD with VMXON pointer",
            Self::VmptrldIncorrectVmcsRev => "VMPTRLD with incorrect VMCS revision identifier",
            Self::VmreadVmwriteInvalidComponent => "VMREAD/VMWRITE from/to unsupported VMCS component",
            Self::VmwriteRoComponent => "VMWRITE to read-only VMCS component",
            Self::VmxonInRoot => "VMXON executed in VMX root operation",
            Self::EntryInvalidExecVmcsPtr => "VM entry with invalid executive-VMCS pointer",
            Self::EntryNonLaunchedExecVmcs => "VM entry with non-launched executive VMCS",
            Self::EntryExecVmcsPtr => "VM entry with executive-VMCS pointer not VMXON pointer",
            Self::VmcallNonClearVmcs => "VMCALL with non-clear VMCS",
            Self::VmcallInvalidExitCtls => "VMCALL with invalid VM-exit control fields",
            Self::VmcallIncorrectMsegRev => "VMCALL with incorrect MSEG revision identifier",
            Self::VmxoffDualMon => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            Self::VmcallInvalidSmmCtls => "VMCALL with invalid SMM-monitor features",
            Self::EntryInvalidVmExecCtls => "VM entry with invalid VM-execution control fields in executive VMCS",
            Self::EntryMovSsBlocking => "VM entry with events blocked by MOV SS",
            Self::InveptInvvpidInvalidOperand => "Invalid operand to INVEPT/INVVPID",
        }
    }
}

impl core::fmt::Display for VmInstrError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.description(), *self as u32)
    }
}

/// VMX-abort indicator stored in the VMCS header.
///
/// See `28.7 VMX Aborts`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum VmxAbort {
    None = 0,
    SaveGuestMsrs = 1,
    HostPdpte = 2,
    CurrentVmcsCorrupt = 3,
    LoadHostMsrs = 4,
    MachineCheckXcpt = 5,
    HostNotInLongMode = 6,
}

impl core::fmt::Display for VmxAbort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let desc = match self {
            Self::None => "none",
            Self::SaveGuestMsrs => "failed to save guest MSRs",
            Self::HostPdpte => "host PDPTE invalid",
            Self::CurrentVmcsCorrupt => "current VMCS corrupted",
            Self::LoadHostMsrs => "failed to load host MSRs",
            Self::MachineCheckXcpt => "machine-check exception",
            Self::HostNotInLongMode => "host not in long mode",
        };

        write!(f, "{} ({})", desc, *self as u32)
    }
}

/// Outcome of an emulated VMX instruction or transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxStatus {
    /// VMsucceed: all arithmetic flags cleared.
    Succeeded,
    /// VMfailValid: ZF set, error number stored in the current VMCS.
    FailedValid(VmInstrError),
    /// VMfailInvalid: CF set, there is no current VMCS to hold an error number.
    FailedInvalid,
    /// The instruction caused a VM-exit to the guest hypervisor.
    VmExit,
    /// VMLAUNCH/VMRESUME entered the nested guest.
    Entered,
}

impl VmxStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Entered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_numbers() {
        assert_eq!(VmInstrError::VmcallInRoot as u32, 1);
        assert_eq!(VmInstrError::VmresumeNonLaunchedVmcs as u32, 5);
        assert_eq!(VmInstrError::VmxonInRoot as u32, 15);
        assert_eq!(VmInstrError::EntryMovSsBlocking as u32, 26);
        assert_eq!(VmInstrError::InveptInvvpidInvalidOperand as u32, 28);
    }

    #[test]
    fn test_exception_helpers() {
        assert_eq!(
            gp0::<()>(),
            Err(VmxError::Exception {
                vector: 13,
                error_code: Some(0)
            })
        );
        assert_eq!(
            ud::<()>(),
            Err(VmxError::Exception {
                vector: 6,
                error_code: None
            })
        );
    }
}
