//! Bit layouts of the event and VM-exit information fields.

use bitfield::bitfield;

/// Event type of an interruption-information field.
///
/// See `25.8.3 VM-Entry Controls for Event Injection`.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum IntType {
    ExtInt = 0,
    Reserved = 1,
    Nmi = 2,
    HwXcpt = 3,
    SwInt = 4,
    PrivSwXcpt = 5,
    SwXcpt = 6,
    /// Pending MTF VM-exit when the vector is 0.
    Other = 7,
}

impl IntType {
    pub fn from_raw(value: u8) -> Self {
        match value & 0b111 {
            0 => Self::ExtInt,
            1 => Self::Reserved,
            2 => Self::Nmi,
            3 => Self::HwXcpt,
            4 => Self::SwInt,
            5 => Self::PrivSwXcpt,
            6 => Self::SwXcpt,
            _ => Self::Other,
        }
    }

    /// Whether the event is caused by an instruction and carries an instruction length.
    pub fn is_software(self) -> bool {
        matches!(self, Self::SwInt | Self::PrivSwXcpt | Self::SwXcpt)
    }
}

bitfield! {
    /// VM-entry/VM-exit interruption information and IDT-vectoring information.
    ///
    /// ## Fields
    ///
    /// - `Vector`: The vector of the interrupt or exception.
    /// - `Type`: See [`IntType`].
    /// - `Error Code Valid`: Set if an error code is delivered (VM-entry) or was pushed (VM-exit).
    /// - `NMI Unblocking IRET`: VM-exit only; the exit happened during an IRET that unblocked NMIs.
    /// - `Valid`: Set if the field describes an event.
    ///
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct InterruptionInfo(u32);
    impl Debug;
    pub u8, vector, set_vector: 7, 0;                 // [0-7]
    pub u8, raw_type, set_raw_type: 10, 8;            // [8-10]
    pub error_code_valid, set_error_code_valid: 11;   // [11]
    pub nmi_unblock_iret, set_nmi_unblock_iret: 12;   // [12]
    // Reserved                                       // [13-30]
    pub valid, set_valid: 31;                         // [31]
}

impl InterruptionInfo {
    /// Bits 30:12 must be zero in the VM-entry interruption-information field.
    pub const ENTRY_RSVD_MASK: u32 = 0x7fff_f000;

    pub fn new(vector: u8, ty: IntType, error_code_valid: bool) -> Self {
        let mut info = InterruptionInfo(0);
        info.set_vector(vector);
        info.set_raw_type(ty as u8);
        info.set_error_code_valid(error_code_valid);
        info.set_valid(true);

        info
    }

    pub fn int_type(&self) -> IntType {
        IntType::from_raw(self.raw_type())
    }

    /// Whether the event is the pending-MTF pseudo event (type other, vector 0).
    pub fn is_mtf(&self) -> bool {
        self.int_type() == IntType::Other && self.vector() == 0
    }
}

bitfield! {
    /// The exit-reason field.
    ///
    /// See `25.9.1 Basic VM-Exit Information`.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct ExitReasonField(u32);
    impl Debug;
    pub u16, basic, set_basic: 15, 0;                 // [0-15]
    // Reserved                                       // [16-26]
    pub enclave, set_enclave: 27;                     // [27]
    pub pending_mtf, set_pending_mtf: 28;             // [28]
    pub from_root, set_from_root: 29;                 // [29]
    // Reserved                                       // [30]
    pub entry_failed, set_entry_failed: 31;           // [31]
}

bitfield! {
    /// VM-exit instruction information for instructions with a memory or register operand
    /// (VMREAD, VMWRITE, VMPTRLD, INVEPT, LGDT, ...).
    ///
    /// See `Table 28-13 Format of the VM-Exit Instruction-Information Field as Used for VMREAD and
    /// VMWRITE`.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct ExitInstrInfo(u32);
    impl Debug;
    pub u8, scaling, set_scaling: 1, 0;               // [0-1]
    // Undefined                                      // [2]
    pub u8, reg1, set_reg1: 6, 3;                     // [3-6]
    pub u8, addr_size, set_addr_size: 9, 7;           // [7-9]
    pub is_reg_operand, set_is_reg_operand: 10;       // [10]
    pub u8, op_size, set_op_size: 12, 11;             // [11-12]
    // Undefined                                      // [13-14]
    pub u8, segment, set_segment: 17, 15;             // [15-17]
    pub u8, index_reg, set_index_reg: 21, 18;         // [18-21]
    pub index_invalid, set_index_invalid: 22;         // [22]
    pub u8, base_reg, set_base_reg: 26, 23;           // [23-26]
    pub base_invalid, set_base_invalid: 27;           // [27]
    pub u8, reg2, set_reg2: 31, 28;                   // [28-31]
}

/// Address size of an instruction-information field.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum AddrSize {
    Bits16 = 0,
    Bits32 = 1,
    Bits64 = 2,
}

impl AddrSize {
    pub fn mask(self) -> u64 {
        match self {
            Self::Bits16 => 0xffff,
            Self::Bits32 => 0xffff_ffff,
            Self::Bits64 => u64::MAX,
        }
    }
}

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// See `Table 28-3 Exit Qualification for Control-Register Accesses`.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct MovCrQual(u64);
    impl Debug;
    pub u8, cr, set_cr: 3, 0;                         // [0-3]
    pub u8, access, set_access: 5, 4;                 // [4-5] 0 = to CR, 1 = from CR, 2 = CLTS, 3 = LMSW
    pub lmsw_memory, set_lmsw_memory: 6;              // [6]
    pub u8, gpr, set_gpr: 11, 8;                      // [8-11]
    pub u16, lmsw_source, set_lmsw_source: 31, 16;    // [16-31]
}

pub const MOV_CR_ACCESS_WRITE: u8 = 0;
pub const MOV_CR_ACCESS_READ: u8 = 1;
pub const MOV_CR_ACCESS_CLTS: u8 = 2;
pub const MOV_CR_ACCESS_LMSW: u8 = 3;

bitfield! {
    /// Exit qualification for MOV DR.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct MovDrQual(u64);
    impl Debug;
    pub u8, dr, set_dr: 2, 0;                         // [0-2]
    pub from_dr, set_from_dr: 4;                      // [4]
    pub u8, gpr, set_gpr: 11, 8;                      // [8-11]
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// See `Table 28-5 Exit Qualification for I/O Instructions`.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct IoQual(u64);
    impl Debug;
    pub u8, size_minus_one, set_size_minus_one: 2, 0; // [0-2]
    pub is_in, set_is_in: 3;                          // [3]
    pub string, set_string: 4;                        // [4]
    pub rep, set_rep: 5;                              // [5]
    pub imm_operand, set_imm_operand: 6;              // [6]
    pub u16, port, set_port: 31, 16;                  // [16-31]
}

/// How an APIC-access VM-exit accessed the APIC-access page.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum ApicAccessType {
    LinearRead = 0,
    LinearWrite = 1,
    LinearFetch = 2,
    LinearEventDelivery = 3,
    PhysEventDelivery = 10,
    PhysFetch = 15,
}

bitfield! {
    /// Exit qualification for APIC-access VM-exits.
    ///
    /// See `Table 28-6 Exit Qualification for APIC-Access VM Exits`.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct ApicAccessQual(u64);
    impl Debug;
    pub u16, offset, set_offset: 11, 0;               // [0-11]
    pub u8, access_type, set_access_type: 15, 12;     // [12-15]
    pub async_event, set_async_event: 16;             // [16]
}

impl ApicAccessQual {
    pub fn new(offset: u16, access: ApicAccessType) -> Self {
        let mut qual = ApicAccessQual(0);
        qual.set_offset(offset & 0xfff);
        qual.set_access_type(access as u8);

        qual
    }
}

bitfield! {
    /// Extended-page-table pointer.
    ///
    /// See `25.6.11 Extended-Page-Table Pointer (EPTP)`.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EptPointer(u64);
    impl Debug;
    pub u8, memory_type, set_memory_type: 2, 0;       // [0-2]
    pub u8, walk_length_minus_one, set_walk_length_minus_one: 5, 3; // [3-5]
    pub access_dirty, set_access_dirty: 6;            // [6]
    pub supervisor_shadow_stack, set_supervisor_shadow_stack: 7; // [7]
    pub u8, reserved_low, _: 11, 8;                   // [8-11]
    pub pfn, set_pfn: 63, 12;                         // [12-63]
}

pub const EPT_MEMTYPE_UC: u8 = 0;
pub const EPT_MEMTYPE_WB: u8 = 6;

/// Guest-interrupt status: RVI in the low byte, SVI in the high byte.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GuestIntStatus {
    pub rvi: u8,
    pub svi: u8,
}

impl GuestIntStatus {
    pub fn from_raw(value: u16) -> Self {
        Self {
            rvi: value as u8,
            svi: (value >> 8) as u8,
        }
    }

    pub fn to_raw(self) -> u16 {
        self.rvi as u16 | (self.svi as u16) << 8
    }
}

/// Entry-failure exit qualifications.
pub const ENTRY_FAIL_QUAL_NONE: u64 = 0;
pub const ENTRY_FAIL_QUAL_PDPTE: u64 = 2;
pub const ENTRY_FAIL_QUAL_NMI_INJECT: u64 = 3;
pub const ENTRY_FAIL_QUAL_LINK_PTR: u64 = 4;
