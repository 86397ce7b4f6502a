use crate::vmx::vmcs::info::{IntType, InterruptionInfo};
use bitflags::bitflags;

pub const X86_XCPT_DE: u8 = 0;
pub const X86_XCPT_DB: u8 = 1;
pub const X86_XCPT_NMI: u8 = 2;
pub const X86_XCPT_BP: u8 = 3;
pub const X86_XCPT_OF: u8 = 4;
pub const X86_XCPT_UD: u8 = 6;
pub const X86_XCPT_DF: u8 = 8;
pub const X86_XCPT_TS: u8 = 10;
pub const X86_XCPT_NP: u8 = 11;
pub const X86_XCPT_SS: u8 = 12;
pub const X86_XCPT_GP: u8 = 13;
pub const X86_XCPT_PF: u8 = 14;
pub const X86_XCPT_AC: u8 = 17;
pub const X86_XCPT_MC: u8 = 18;
pub const X86_XCPT_CP: u8 = 21;

/// Returns whether the exception pushes an error code.
pub fn xcpt_has_error_code(vector: u8) -> bool {
    matches!(
        vector,
        X86_XCPT_DF
            | X86_XCPT_TS
            | X86_XCPT_NP
            | X86_XCPT_SS
            | X86_XCPT_GP
            | X86_XCPT_PF
            | X86_XCPT_AC
            | X86_XCPT_CP
    )
}

/// The event kinds understood by the generic event-injection sink.
#[derive(Hash, Eq, PartialEq, Debug, Copy, Clone)]
pub enum EventKind {
    /// External interrupt.
    HardwareInt,
    /// NMI or hardware exception.
    Trap,
    /// INT n, INT3, INTO or INT1.
    SoftwareInt,
}

/// An event handed to the injection sink of the outer emulator.
///
/// See `27.6 Event Injection`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrapEvent {
    pub vector: u8,
    pub kind: EventKind,
    pub error_code: Option<u32>,
    /// Length of the instruction that raised a software event.
    pub instr_len: u8,
    /// Faulting address for #PF.
    pub cr2: Option<u64>,
    /// INT1 (ICEBP) rather than a #DB trap.
    pub icebp: bool,
}

impl TrapEvent {
    pub fn xcpt(vector: u8, error_code: Option<u32>) -> Self {
        Self {
            vector,
            kind: EventKind::Trap,
            error_code,
            instr_len: 0,
            cr2: None,
            icebp: false,
        }
    }

    /// See `6.15 Exception and Interrupt Reference > Interrupt 13 #GP`.
    pub fn gp() -> Self {
        Self::xcpt(X86_XCPT_GP, Some(0))
    }

    pub fn ud() -> Self {
        Self::xcpt(X86_XCPT_UD, None)
    }

    pub fn db() -> Self {
        Self::xcpt(X86_XCPT_DB, None)
    }

    /// Triple fault is modeled as a #DF escalation by the sink.
    pub fn df() -> Self {
        Self::xcpt(X86_XCPT_DF, Some(0))
    }

    pub fn nmi() -> Self {
        Self::xcpt(X86_XCPT_NMI, None)
    }

    pub fn ext_int(vector: u8) -> Self {
        Self {
            kind: EventKind::HardwareInt,
            ..Self::xcpt(vector, None)
        }
    }

    /// Builds the event described by a VM-entry interruption-information field.
    pub fn from_int_info(info: InterruptionInfo, error_code: u32, instr_len: u8) -> Self {
        let kind = vmx_to_event_kind(info);
        let ty = info.int_type();

        Self {
            vector: info.vector(),
            kind,
            error_code: info.error_code_valid().then_some(error_code),
            instr_len: if ty.is_software() { instr_len } else { 0 },
            cr2: None,
            icebp: ty == IntType::PrivSwXcpt,
        }
    }

    /// Encodes the event as IDT-vectoring or exit interruption information.
    pub fn to_int_info(&self) -> InterruptionInfo {
        let ty = event_kind_to_vmx(self.vector, self.kind, self.icebp);
        let error_code_valid = ty == IntType::HwXcpt && self.error_code.is_some();

        InterruptionInfo::new(self.vector, ty, error_code_valid)
    }
}

/// Converts a VMX event type to the event kind of the injection sink.
pub fn vmx_to_event_kind(info: InterruptionInfo) -> EventKind {
    match info.int_type() {
        IntType::ExtInt => EventKind::HardwareInt,
        IntType::Nmi | IntType::HwXcpt => EventKind::Trap,
        IntType::PrivSwXcpt | IntType::SwXcpt | IntType::SwInt => EventKind::SoftwareInt,
        IntType::Reserved | IntType::Other => {
            log::warn!("Unexpected event type in {:?}", info);
            EventKind::Trap
        }
    }
}

/// Converts an event of the injection sink to a VMX event type.
pub fn event_kind_to_vmx(vector: u8, kind: EventKind, icebp: bool) -> IntType {
    match kind {
        EventKind::Trap => match vector {
            X86_XCPT_NMI => IntType::Nmi,
            X86_XCPT_BP | X86_XCPT_OF => IntType::SwXcpt,
            _ => IntType::HwXcpt,
        },
        EventKind::HardwareInt => IntType::ExtInt,
        EventKind::SoftwareInt => match vector {
            X86_XCPT_BP | X86_XCPT_OF => IntType::SwXcpt,
            X86_XCPT_DB if icebp => IntType::PrivSwXcpt,
            _ => IntType::SwInt,
        },
    }
}

bitflags! {
    /// Per-vCPU nested-guest force flags, armed at VM-entry and consumed by the outer loop.
    #[derive(Default)]
    pub struct ForceFlags: u32 {
        const MTF            = 1 << 0;
        const NMI_WINDOW     = 1 << 1;
        const INT_WINDOW     = 1 << 2;
        const PREEMPT_TIMER  = 1 << 3;
        const APIC_WRITE     = 1 << 4;
        /// A virtual interrupt (RVI above PPR) is pending delivery.
        const VIRT_INT       = 1 << 5;
    }
}
