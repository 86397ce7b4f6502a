/// Basic VM-exit reasons.
///
/// See `Appendix C VMX Basic Exit Reasons`.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
#[repr(u16)]
pub enum VmExitReason {
    ExceptionOrNmi = 0,
    ExtInt = 1,
    TripleFault = 2,
    InitSignal = 3,
    Sipi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    IntWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    MovCr = 28,
    MovDr = 29,
    IoInstr = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    ErrInvalidGuestState = 33,
    ErrMsrLoad = 34,
    Mwait = 36,
    Mtf = 37,
    Monitor = 39,
    Pause = 40,
    ErrMachineCheck = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfig = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PmlFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    Pconfig = 65,
    SppEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
}

impl VmExitReason {
    /// Exits that report a failed VM-entry (bit 31 of the exit-reason field).
    pub fn is_entry_failure(self) -> bool {
        matches!(
            self,
            Self::ErrInvalidGuestState | Self::ErrMsrLoad | Self::ErrMachineCheck
        )
    }

    /// Instruction exits that report the instruction length.
    pub fn has_instr_len(self) -> bool {
        matches!(
            self,
            Self::Cpuid
                | Self::Getsec
                | Self::Hlt
                | Self::Invd
                | Self::Invlpg
                | Self::Rdpmc
                | Self::Rdtsc
                | Self::Rsm
                | Self::Vmcall
                | Self::Vmclear
                | Self::Vmlaunch
                | Self::Vmptrld
                | Self::Vmptrst
                | Self::Vmread
                | Self::Vmresume
                | Self::Vmwrite
                | Self::Vmxoff
                | Self::Vmxon
                | Self::MovCr
                | Self::MovDr
                | Self::IoInstr
                | Self::Rdmsr
                | Self::Wrmsr
                | Self::Mwait
                | Self::Monitor
                | Self::Pause
                | Self::GdtrIdtrAccess
                | Self::LdtrTrAccess
                | Self::Invept
                | Self::Rdtscp
                | Self::Invvpid
                | Self::Wbinvd
                | Self::Xsetbv
                | Self::Rdrand
                | Self::Invpcid
                | Self::Vmfunc
                | Self::Encls
                | Self::Rdseed
                | Self::Xsaves
                | Self::Xrstors
                | Self::Pconfig
                | Self::Umwait
                | Self::Tpause
                | Self::Loadiwkey
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_numbers() {
        assert_eq!(VmExitReason::ErrInvalidGuestState as u16, 33);
        assert_eq!(VmExitReason::VirtualizedEoi as u16, 45);
        assert_eq!(VmExitReason::ApicWrite as u16, 56);
        assert!(VmExitReason::ErrMsrLoad.is_entry_failure());
        assert!(!VmExitReason::Vmcall.is_entry_failure());
    }
}
