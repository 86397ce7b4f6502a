//! VMCS field encodings.
//!
//! See `Appendix B Field Encoding in VMCS` and `25.11.2 VMREAD, VMWRITE, and Encodings of VMCS Fields`.

use bitfield::bitfield;

/// Bits of a VMREAD/VMWRITE field operand that must be zero.
pub const FIELD_RSVD_MASK: u64 = 0xffff_ffff_ffff_8000;

bitfield! {
    /// A raw VMCS field encoding as supplied to VMREAD/VMWRITE.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct FieldEncoding(u64);
    impl Debug;
    pub high, set_high: 0;                  // [0] access type
    pub u16, index, set_index: 9, 1;        // [1-9]
    pub u8, field_type, set_field_type: 11, 10; // [10-11]
    pub reserved_12, _: 12;                 // [12]
    pub u8, width, set_width: 14, 13;       // [13-14]
    // Reserved                             // [15-63]
}

#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum FieldWidth {
    Bits16 = 0,
    Bits64 = 1,
    Bits32 = 2,
    Natural = 3,
}

impl FieldWidth {
    pub const fn from_raw(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Bits16,
            1 => Self::Bits64,
            2 => Self::Bits32,
            _ => Self::Natural,
        }
    }

    /// Size of a slot of this width in the VMCS image. Natural-width fields are stored as 64 bits.
    pub const fn size(self) -> usize {
        match self {
            Self::Bits16 => 2,
            Self::Bits32 => 4,
            Self::Bits64 | Self::Natural => 8,
        }
    }

    pub const fn mask(self) -> u64 {
        match self {
            Self::Bits16 => 0xffff,
            Self::Bits32 => 0xffff_ffff,
            Self::Bits64 | Self::Natural => u64::MAX,
        }
    }

    /// Number of slots reserved per field type in the VMCS image.
    pub const fn capacity(self) -> usize {
        match self {
            Self::Bits16 => 16,
            Self::Bits64 => 48,
            Self::Bits32 => 32,
            Self::Natural => 32,
        }
    }
}

#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum FieldType {
    Control = 0,
    ExitInfo = 1,
    Guest = 2,
    Host = 3,
}

impl FieldType {
    pub const fn from_raw(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Control,
            1 => Self::ExitInfo,
            2 => Self::Guest,
            _ => Self::Host,
        }
    }
}

/// Size of the launch-state/revision header at the start of the VMCS image.
pub const VMCS_HEADER_SIZE: usize = 16;

/// Byte offset of the first slot of the given (width, type) group.
const fn group_offset(width: FieldWidth, ty: FieldType) -> usize {
    const ORDER: [FieldWidth; 4] = [
        FieldWidth::Bits16,
        FieldWidth::Bits32,
        FieldWidth::Bits64,
        FieldWidth::Natural,
    ];

    let mut offset = VMCS_HEADER_SIZE;
    let mut i = 0;
    while i < ORDER.len() {
        let w = ORDER[i];
        if w as u8 == width as u8 {
            return offset + (ty as usize) * w.capacity() * w.size();
        }
        offset += 4 * w.capacity() * w.size();
        i += 1;
    }

    offset
}

/// End of the field area in the VMCS image.
pub const VMCS_DATA_END: usize = group_offset(FieldWidth::Natural, FieldType::Host)
    + FieldWidth::Natural.capacity() * FieldWidth::Natural.size();

const_assert!(VMCS_DATA_END <= 4096);

macro_rules! vmcs_fields {
    ($($(#[$meta:meta])* $name:ident = $encoding:literal,)*) => {
        /// Every VMCS field known to the virtual VMCS, keyed by its full encoding.
        #[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
        #[repr(u32)]
        pub enum VmcsField {
            $($(#[$meta])* $name = $encoding,)*
        }

        impl VmcsField {
            pub const ALL: &'static [VmcsField] = &[$(VmcsField::$name,)*];

            /// Looks up a field by its full (access type 0) encoding.
            pub const fn from_full_encoding(encoding: u32) -> Option<Self> {
                match encoding {
                    $($encoding => Some(VmcsField::$name),)*
                    _ => None,
                }
            }
        }
    };
}

vmcs_fields! {
    // 16-bit control fields.
    Vpid = 0x0000,
    PostedIntNotifyVector = 0x0002,
    EptpIndex = 0x0004,
    HlatPrefixSize = 0x0006,

    // 16-bit guest-state fields.
    GuestEsSel = 0x0800,
    GuestCsSel = 0x0802,
    GuestSsSel = 0x0804,
    GuestDsSel = 0x0806,
    GuestFsSel = 0x0808,
    GuestGsSel = 0x080a,
    GuestLdtrSel = 0x080c,
    GuestTrSel = 0x080e,
    GuestIntStatus = 0x0810,
    GuestPmlIndex = 0x0812,

    // 16-bit host-state fields.
    HostEsSel = 0x0c00,
    HostCsSel = 0x0c02,
    HostSsSel = 0x0c04,
    HostDsSel = 0x0c06,
    HostFsSel = 0x0c08,
    HostGsSel = 0x0c0a,
    HostTrSel = 0x0c0c,

    // 64-bit control fields.
    IoBitmapA = 0x2000,
    IoBitmapB = 0x2002,
    MsrBitmap = 0x2004,
    ExitMsrStoreAddr = 0x2006,
    ExitMsrLoadAddr = 0x2008,
    EntryMsrLoadAddr = 0x200a,
    ExecVmcsPtr = 0x200c,
    PmlAddr = 0x200e,
    TscOffset = 0x2010,
    VirtApicAddr = 0x2012,
    ApicAccessAddr = 0x2014,
    PostedIntDescAddr = 0x2016,
    VmFuncControls = 0x2018,
    EptPointer = 0x201a,
    EoiExitBitmap0 = 0x201c,
    EoiExitBitmap1 = 0x201e,
    EoiExitBitmap2 = 0x2020,
    EoiExitBitmap3 = 0x2022,
    EptpListAddr = 0x2024,
    VmreadBitmapAddr = 0x2026,
    VmwriteBitmapAddr = 0x2028,
    VeInfoAddr = 0x202a,
    XssExitBitmap = 0x202c,
    EnclsExitBitmap = 0x202e,
    SppTablePtr = 0x2030,
    TscMultiplier = 0x2032,
    ProcControls3 = 0x2034,
    EnclvExitBitmap = 0x2036,
    PconfigExitBitmap = 0x203e,
    HlatPtr = 0x2040,
    ExitControls2 = 0x2044,

    // 64-bit read-only data fields.
    GuestPhysAddr = 0x2400,

    // 64-bit guest-state fields.
    VmcsLinkPtr = 0x2800,
    GuestDebugCtl = 0x2802,
    GuestPat = 0x2804,
    GuestEfer = 0x2806,
    GuestPerfGlobalCtrl = 0x2808,
    GuestPdpte0 = 0x280a,
    GuestPdpte1 = 0x280c,
    GuestPdpte2 = 0x280e,
    GuestPdpte3 = 0x2810,
    GuestBndcfgs = 0x2812,
    GuestRtitCtl = 0x2814,
    GuestPkrs = 0x2818,

    // 64-bit host-state fields.
    HostPat = 0x2c00,
    HostEfer = 0x2c02,
    HostPerfGlobalCtrl = 0x2c04,
    HostPkrs = 0x2c06,

    // 32-bit control fields.
    PinControls = 0x4000,
    ProcControls = 0x4002,
    ExceptionBitmap = 0x4004,
    PageFaultErrorMask = 0x4006,
    PageFaultErrorMatch = 0x4008,
    Cr3TargetCount = 0x400a,
    ExitControls = 0x400c,
    ExitMsrStoreCount = 0x400e,
    ExitMsrLoadCount = 0x4010,
    EntryControls = 0x4012,
    EntryMsrLoadCount = 0x4014,
    EntryIntInfo = 0x4016,
    EntryExceptionErrorCode = 0x4018,
    EntryInstrLen = 0x401a,
    TprThreshold = 0x401c,
    ProcControls2 = 0x401e,
    PleGap = 0x4020,
    PleWindow = 0x4022,

    // 32-bit read-only data fields.
    VmInstrError = 0x4400,
    ExitReason = 0x4402,
    ExitIntInfo = 0x4404,
    ExitIntErrorCode = 0x4406,
    IdtVectoringInfo = 0x4408,
    IdtVectoringErrorCode = 0x440a,
    ExitInstrLen = 0x440c,
    ExitInstrInfo = 0x440e,

    // 32-bit guest-state fields.
    GuestEsLimit = 0x4800,
    GuestCsLimit = 0x4802,
    GuestSsLimit = 0x4804,
    GuestDsLimit = 0x4806,
    GuestFsLimit = 0x4808,
    GuestGsLimit = 0x480a,
    GuestLdtrLimit = 0x480c,
    GuestTrLimit = 0x480e,
    GuestGdtrLimit = 0x4810,
    GuestIdtrLimit = 0x4812,
    GuestEsAttr = 0x4814,
    GuestCsAttr = 0x4816,
    GuestSsAttr = 0x4818,
    GuestDsAttr = 0x481a,
    GuestFsAttr = 0x481c,
    GuestGsAttr = 0x481e,
    GuestLdtrAttr = 0x4820,
    GuestTrAttr = 0x4822,
    GuestIntState = 0x4824,
    GuestActivityState = 0x4826,
    GuestSmbase = 0x4828,
    GuestSysenterCs = 0x482a,
    PreemptTimerValue = 0x482e,

    // 32-bit host-state fields.
    HostSysenterCs = 0x4c00,

    // Natural-width control fields.
    Cr0Mask = 0x6000,
    Cr4Mask = 0x6002,
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    Cr3Target0 = 0x6008,
    Cr3Target1 = 0x600a,
    Cr3Target2 = 0x600c,
    Cr3Target3 = 0x600e,

    // Natural-width read-only data fields.
    ExitQualification = 0x6400,
    IoRcx = 0x6402,
    IoRsi = 0x6404,
    IoRdi = 0x6406,
    IoRip = 0x6408,
    GuestLinearAddr = 0x640a,

    // Natural-width guest-state fields.
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestEsBase = 0x6806,
    GuestCsBase = 0x6808,
    GuestSsBase = 0x680a,
    GuestDsBase = 0x680c,
    GuestFsBase = 0x680e,
    GuestGsBase = 0x6810,
    GuestLdtrBase = 0x6812,
    GuestTrBase = 0x6814,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestDr7 = 0x681a,
    GuestRsp = 0x681c,
    GuestRip = 0x681e,
    GuestRflags = 0x6820,
    GuestPendingDbgXcpts = 0x6822,
    GuestSysenterEsp = 0x6824,
    GuestSysenterEip = 0x6826,
    GuestSCet = 0x6828,
    GuestSsp = 0x682a,
    GuestIntrSspTableAddr = 0x682c,

    // Natural-width host-state fields.
    HostCr0 = 0x6c00,
    HostCr3 = 0x6c02,
    HostCr4 = 0x6c04,
    HostFsBase = 0x6c06,
    HostGsBase = 0x6c08,
    HostTrBase = 0x6c0a,
    HostGdtrBase = 0x6c0c,
    HostIdtrBase = 0x6c0e,
    HostSysenterEsp = 0x6c10,
    HostSysenterEip = 0x6c12,
    HostRsp = 0x6c14,
    HostRip = 0x6c16,
    HostSCet = 0x6c18,
    HostSsp = 0x6c1a,
    HostIntrSspTableAddr = 0x6c1c,
}

/// Highest field index of the virtual VMCS, as reported by IA32_VMX_VMCS_ENUM.
pub const VMCS_MAX_INDEX: u16 = (VmcsField::ExitControls2 as u32 >> 1 & 0x1ff) as u16;

impl VmcsField {
    pub const fn encoding(self) -> u32 {
        self as u32
    }

    pub const fn width(self) -> FieldWidth {
        FieldWidth::from_raw(((self as u32) >> 13) as u8)
    }

    pub const fn field_type(self) -> FieldType {
        FieldType::from_raw(((self as u32) >> 10) as u8)
    }

    pub const fn index(self) -> usize {
        ((self as u32 >> 1) & 0x1ff) as usize
    }

    pub const fn is_read_only(self) -> bool {
        matches!(self.field_type(), FieldType::ExitInfo)
    }

    /// Byte offset of the field in the VMCS image.
    pub const fn offset(self) -> usize {
        let width = self.width();
        group_offset(width, self.field_type()) + self.index() * width.size()
    }

    /// Guest selector, base, limit and access-rights fields of a segment register, in that order.
    pub const fn guest_segment(reg: crate::cpu::SegReg) -> [VmcsField; 4] {
        use crate::cpu::SegReg;

        match reg {
            SegReg::Es => [Self::GuestEsSel, Self::GuestEsBase, Self::GuestEsLimit, Self::GuestEsAttr],
            SegReg::Cs => [Self::GuestCsSel, Self::GuestCsBase, Self::GuestCsLimit, Self::GuestCsAttr],
            SegReg::Ss => [Self::GuestSsSel, Self::GuestSsBase, Self::GuestSsLimit, Self::GuestSsAttr],
            SegReg::Ds => [Self::GuestDsSel, Self::GuestDsBase, Self::GuestDsLimit, Self::GuestDsAttr],
            SegReg::Fs => [Self::GuestFsSel, Self::GuestFsBase, Self::GuestFsLimit, Self::GuestFsAttr],
            SegReg::Gs => [Self::GuestGsSel, Self::GuestGsBase, Self::GuestGsLimit, Self::GuestGsAttr],
        }
    }

    /// Host selector field of a segment register.
    pub const fn host_selector(reg: crate::cpu::SegReg) -> VmcsField {
        use crate::cpu::SegReg;

        match reg {
            SegReg::Es => Self::HostEsSel,
            SegReg::Cs => Self::HostCsSel,
            SegReg::Ss => Self::HostSsSel,
            SegReg::Ds => Self::HostDsSel,
            SegReg::Fs => Self::HostFsSel,
            SegReg::Gs => Self::HostGsSel,
        }
    }
}

/// Which half of a 64-bit field an encoding addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldAccess {
    Full,
    High,
}

/// A decoded VMREAD/VMWRITE operand: the field and the part of it being accessed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub field: VmcsField,
    pub access: FieldAccess,
}

impl FieldRef {
    pub const fn full(field: VmcsField) -> Self {
        Self {
            field,
            access: FieldAccess::Full,
        }
    }

    /// Decodes a field operand. Returns `None` for reserved bits, unknown fields and "high" accesses
    /// to fields that are not 64 bits wide.
    pub fn decode(encoding: u64) -> Option<Self> {
        if encoding & FIELD_RSVD_MASK != 0 {
            return None;
        }

        let raw = FieldEncoding(encoding);
        let field = VmcsField::from_full_encoding((encoding & !1) as u32)?;
        if !raw.high() {
            return Some(Self::full(field));
        }

        match field.width() {
            FieldWidth::Bits64 => Some(Self {
                field,
                access: FieldAccess::High,
            }),
            _ => None,
        }
    }

    pub fn encoding(&self) -> u64 {
        let high = matches!(self.access, FieldAccess::High) as u64;
        self.field.encoding() as u64 | high
    }

    /// Value mask of the accessed part.
    pub fn mask(&self) -> u64 {
        match self.access {
            FieldAccess::Full => self.field.width().mask(),
            FieldAccess::High => 0xffff_ffff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_properties() {
        assert_eq!(VmcsField::GuestRip.width(), FieldWidth::Natural);
        assert_eq!(VmcsField::GuestRip.field_type(), FieldType::Guest);
        assert_eq!(VmcsField::ExitReason.field_type(), FieldType::ExitInfo);
        assert_eq!(VmcsField::IoBitmapB.index(), 1);
        assert_eq!(VmcsField::HostTrSel.width(), FieldWidth::Bits16);
        assert_eq!(VMCS_MAX_INDEX, 0x22);
    }

    #[test]
    fn test_indices_fit_capacity() {
        for field in VmcsField::ALL {
            assert!(
                field.index() < field.width().capacity(),
                "{:?} does not fit its group",
                field
            );
        }
    }

    #[test]
    fn test_offsets_are_unique_and_in_bounds() {
        let mut used = [false; 4096];
        for field in VmcsField::ALL {
            let offset = field.offset();
            assert!(offset >= VMCS_HEADER_SIZE);
            assert!(offset + field.width().size() <= VMCS_DATA_END);

            for byte in &mut used[offset..offset + field.width().size()] {
                assert!(!*byte, "{:?} overlaps another field", field);
                *byte = true;
            }
        }
    }

    #[test]
    fn test_decode_high_access() {
        let high = FieldRef::decode(0x2001).unwrap();
        assert_eq!(high.field, VmcsField::IoBitmapA);
        assert_eq!(high.access, FieldAccess::High);

        // Only 64-bit fields have a high part.
        assert_eq!(FieldRef::decode(0x6801), None);
        assert_eq!(FieldRef::decode(0x4001), None);
    }

    #[test]
    fn test_decode_invalid() {
        assert_eq!(FieldRef::decode(0x0000_0001_0000_0000 | 0x681e), None);
        assert_eq!(FieldRef::decode(0x8000 | 0x681e), None);
        assert_eq!(FieldRef::decode(0x1000 | 0x681e), None);
        assert_eq!(FieldRef::decode(0x6830), None);
    }

    #[test]
    fn test_every_field_decodes_to_itself() {
        for field in VmcsField::ALL {
            let decoded = FieldRef::decode(field.encoding() as u64).unwrap();
            assert_eq!(decoded.field, *field);
            assert_eq!(decoded.access, FieldAccess::Full);
        }
    }
}
