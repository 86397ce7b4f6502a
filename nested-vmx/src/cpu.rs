//! Architectural CPU state of a virtual CPU as seen by the nested VMX engine.
//!
//! The instruction emulator owns the real context; VM-entry and VM-exit load and save it through
//! the types in here.

use crate::utils::msr::{EFER_LMA, EFER_LME};
use bitfield::bitfield;
use bitflags::bitflags;
use x86_64::registers::{control::Cr0Flags, rflags::RFlags};

/// The six data/code segment registers in VMCS encoding order.
#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

bitfield! {
    /// Segment access rights in the VMCS format.
    ///
    /// This is bits 8-23 of the second dword of a descriptor shifted down by 8, with bit 16 used
    /// as the "unusable" flag.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct SegAttr(u32);
    impl Debug;
    pub u8, seg_type, set_seg_type: 3, 0;        // [0-3]
    pub desc_type, set_desc_type: 4;             // [4] 1 = code/data
    pub u8, dpl, set_dpl: 6, 5;                  // [5-6]
    pub present, set_present: 7;                 // [7]
    // Reserved                                  // [8-11]
    pub avl, set_avl: 12;                        // [12]
    pub long, set_long: 13;                      // [13]
    pub default_big, set_default_big: 14;        // [14]
    pub granularity, set_granularity: 15;        // [15]
    pub unusable, set_unusable: 16;              // [16]
    // Reserved                                  // [17-31]
}

impl SegAttr {
    /// Bits that must be zero for a usable segment.
    pub const RSVD_MASK: u32 = 0xfffe_0f00;

    /// Accessed bit of the type field.
    pub const TYPE_ACCESSED: u8 = 1 << 0;
    /// Readable (code) or writable (data) bit of the type field.
    pub const TYPE_RW: u8 = 1 << 1;
    /// Conforming (code) or expand-down (data) bit of the type field.
    pub const TYPE_DC: u8 = 1 << 2;
    /// Code bit of the type field.
    pub const TYPE_CODE: u8 = 1 << 3;

    /// Access rights of a virtual-8086 mode segment.
    pub const V86: SegAttr = SegAttr(0xf3);
    pub const UNUSABLE: SegAttr = SegAttr(1 << 16);

    pub fn is_code(&self) -> bool {
        self.seg_type() & Self::TYPE_CODE != 0
    }
}

/// A cached segment register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attr: SegAttr,
}

impl Segment {
    /// Requested privilege level of the selector.
    pub fn rpl(&self) -> u8 {
        (self.selector & 0b11) as u8
    }

    /// Table-indicator bit of the selector.
    pub fn ti(&self) -> bool {
        self.selector & 0b100 != 0
    }

    pub fn is_usable(&self) -> bool {
        !self.attr.unusable()
    }

    /// A segment as loaded in virtual-8086 mode.
    pub fn v86(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u64) << 4,
            limit: 0xffff,
            attr: SegAttr::V86,
        }
    }
}

/// GDTR or IDTR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescTable {
    pub base: u64,
    pub limit: u32,
}

bitflags! {
    /// Guest interruptibility state.
    ///
    /// See `25.4.2 Guest Non-Register State`.
    #[derive(Default)]
    pub struct Interruptibility: u32 {
        const BLOCK_STI = 1 << 0;
        const BLOCK_MOVSS = 1 << 1;
        const BLOCK_SMI = 1 << 2;
        const BLOCK_NMI = 1 << 3;
        const ENCLAVE = 1 << 4;
    }
}

/// Guest activity state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ActivityState {
    Active = 0,
    Hlt = 1,
    Shutdown = 2,
    WaitSipi = 3,
}

impl ActivityState {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Active),
            1 => Some(Self::Hlt),
            2 => Some(Self::Shutdown),
            3 => Some(Self::WaitSipi),
            _ => None,
        }
    }
}

impl Default for ActivityState {
    fn default() -> Self {
        Self::Active
    }
}

/// General purpose register numbers as used in ModR/M and the instruction-information field.
pub mod gpr {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
}

/// The register file and the non-register state VMX transitions touch.
#[derive(Debug, Clone)]
pub struct CpuContext {
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub segs: [Segment; 6],
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: DescTable,
    pub idtr: DescTable,

    pub efer: u64,
    pub pat: u64,
    pub debugctl: u64,
    pub perf_global_ctrl: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pdptes: [u64; 4],

    /// Blocking by STI or MOV SS, if any.
    pub interrupt_shadow: Interruptibility,
    pub nmi_blocked: bool,
    pub activity: ActivityState,
    /// Debug exceptions that are pending delivery (DR6 format).
    pub pending_dbg: u64,
    pub a20_masked: bool,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            gprs: [0; 16],
            rip: 0xfff0,
            rflags: 0x2,
            cr0: 0x6000_0010,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr6: 0xffff_0ff0,
            dr7: 0x400,
            segs: [Segment::default(); 6],
            ldtr: Segment::default(),
            tr: Segment::default(),
            gdtr: DescTable::default(),
            idtr: DescTable::default(),
            efer: 0,
            pat: 0x0007_0406_0007_0406,
            debugctl: 0,
            perf_global_ctrl: 0,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            pdptes: [0; 4],
            interrupt_shadow: Interruptibility::empty(),
            nmi_blocked: false,
            activity: ActivityState::Active,
            pending_dbg: 0,
            a20_masked: false,
        }
    }
}

impl CpuContext {
    pub fn seg(&self, reg: SegReg) -> &Segment {
        &self.segs[reg.index()]
    }

    pub fn seg_mut(&mut self, reg: SegReg) -> &mut Segment {
        &mut self.segs[reg.index()]
    }

    pub fn gpr(&self, reg: u8) -> u64 {
        self.gprs[(reg & 0xf) as usize]
    }

    pub fn set_gpr(&mut self, reg: u8, value: u64) {
        self.gprs[(reg & 0xf) as usize] = value;
    }

    /// Current privilege level, taken from SS.DPL like the hardware does.
    pub fn cpl(&self) -> u8 {
        if self.is_v86() {
            return 3;
        }

        if !self.is_protected() {
            return 0;
        }

        self.seg(SegReg::Ss).attr.dpl()
    }

    pub fn is_protected(&self) -> bool {
        self.cr0 & Cr0Flags::PROTECTED_MODE_ENABLE.bits() != 0
    }

    pub fn is_paging(&self) -> bool {
        self.cr0 & Cr0Flags::PAGING.bits() != 0
    }

    pub fn is_v86(&self) -> bool {
        self.is_protected() && self.rflags & RFlags::VIRTUAL_8086_MODE.bits() != 0
    }

    pub fn is_long_mode(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    pub fn is_long_mode_enabled(&self) -> bool {
        self.efer & EFER_LME != 0
    }

    /// Whether code executes in 64-bit mode (long mode with CS.L set).
    pub fn is_64bit_code(&self) -> bool {
        self.is_long_mode() && self.seg(SegReg::Cs).attr.long()
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.rflags & RFlags::INTERRUPT_FLAG.bits() != 0
    }

    /// Advances RIP past the current instruction and drops any interrupt shadow.
    pub fn advance_rip(&mut self, len: u8) {
        let rip = self.rip.wrapping_add(len as u64);
        self.rip = if self.is_64bit_code() { rip } else { rip & 0xffff_ffff };
        self.rflags &= !RFlags::RESUME_FLAG.bits();
        self.interrupt_shadow = Interruptibility::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seg_attr_layout() {
        let mut attr = SegAttr(0);
        attr.set_seg_type(0xb);
        attr.set_desc_type(true);
        attr.set_present(true);
        attr.set_long(true);
        attr.set_granularity(true);
        assert_eq!(attr.0, 0xa09b);
        assert!(attr.is_code());
        assert_eq!(SegAttr::V86.dpl(), 3);
    }

    #[test]
    fn test_cpl() {
        let mut ctx = CpuContext::default();
        assert_eq!(ctx.cpl(), 0);

        ctx.cr0 |= Cr0Flags::PROTECTED_MODE_ENABLE.bits();
        ctx.seg_mut(SegReg::Ss).attr.set_dpl(3);
        assert_eq!(ctx.cpl(), 3);

        ctx.seg_mut(SegReg::Ss).attr.set_dpl(0);
        ctx.rflags |= RFlags::VIRTUAL_8086_MODE.bits();
        assert_eq!(ctx.cpl(), 3);
    }

    #[test]
    fn test_advance_rip_truncates_outside_64bit() {
        let mut ctx = CpuContext::default();
        ctx.rip = 0xffff_fffe;
        ctx.interrupt_shadow = Interruptibility::BLOCK_STI;
        ctx.advance_rip(3);

        assert_eq!(ctx.rip, 1);
        assert!(ctx.interrupt_shadow.is_empty());
    }
}
