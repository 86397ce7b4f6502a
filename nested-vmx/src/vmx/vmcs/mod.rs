//! The virtual VMCS.
//!
//! The image is one 4K page laid out by [`VmcsField::offset`]. Fields are only ever accessed through
//! [`Vmcs::read`]/[`Vmcs::write`] and the typed accessors built on them, byte offsets never leave this
//! module.

use crate::{
    cpu::{SegAttr, SegReg, Segment},
    vmx::vmcs::{
        controls::{EntryControls, ExitControls, PinControls, ProcControls, ProcControls2},
        field::{FieldAccess, FieldRef, FieldType, VmcsField},
        info::InterruptionInfo,
    },
};
use x86::bits64::paging::BASE_PAGE_SIZE;

pub mod cache;
pub mod controls;
pub mod dump;
pub mod field;
pub mod info;

/// VMCS revision identifier reported in IA32_VMX_BASIC.
pub const VMCS_REVISION_ID: u32 = 0x4000_0001;

/// Bit 31 of the revision dword marks a shadow VMCS.
pub const VMCS_SHADOW_BIT: u32 = 1 << 31;

/// Launch state of a VMCS.
///
/// See `25.1 Overview` and `Figure 25-1 States of VMCS X`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum LaunchState {
    Clear = 1,
    Active = 2,
    Current = 4,
    Launched = 8,
}

impl LaunchState {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Clear),
            2 => Some(Self::Active),
            4 => Some(Self::Current),
            8 => Some(Self::Launched),
            _ => None,
        }
    }
}

const REVISION_OFFSET: usize = 0;
const ABORT_OFFSET: usize = 4;
const LAUNCH_STATE_OFFSET: usize = 8;

#[repr(C, align(4096))]
#[derive(Clone)]
pub struct Vmcs {
    data: [u8; BASE_PAGE_SIZE],
}
const_assert_eq!(core::mem::size_of::<Vmcs>(), BASE_PAGE_SIZE);

impl Default for Vmcs {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Vmcs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vmcs")
            .field("revision", &self.revision_id())
            .field("shadow", &self.is_shadow())
            .field("launch_state", &self.launch_state())
            .finish_non_exhaustive()
    }
}

impl Vmcs {
    pub const fn new() -> Self {
        Self {
            data: [0; BASE_PAGE_SIZE],
        }
    }

    pub fn from_bytes(bytes: &[u8; BASE_PAGE_SIZE]) -> Self {
        Self { data: *bytes }
    }

    pub fn as_bytes(&self) -> &[u8; BASE_PAGE_SIZE] {
        &self.data
    }

    fn load(&self, offset: usize, size: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&self.data[offset..offset + size]);
        u64::from_le_bytes(buf)
    }

    fn store(&mut self, offset: usize, size: usize, value: u64) {
        self.data[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
    }

    /// Reads a field or the high half of a 64-bit field, zero-extended.
    pub fn read(&self, field: FieldRef) -> u64 {
        let width = field.field.width();
        let value = self.load(field.field.offset(), width.size());

        match field.access {
            FieldAccess::Full => value & width.mask(),
            FieldAccess::High => value >> 32,
        }
    }

    /// Writes a field or the high half of a 64-bit field. Bits beyond the field width are dropped.
    pub fn write(&mut self, field: FieldRef, value: u64) {
        let width = field.field.width();
        let offset = field.field.offset();

        match field.access {
            FieldAccess::Full => self.store(offset, width.size(), value & width.mask()),
            FieldAccess::High => self.store(offset + 4, 4, value & 0xffff_ffff),
        }
    }

    pub fn get(&self, field: VmcsField) -> u64 {
        self.read(FieldRef::full(field))
    }

    pub fn set(&mut self, field: VmcsField, value: u64) {
        self.write(FieldRef::full(field), value)
    }

    pub fn get32(&self, field: VmcsField) -> u32 {
        self.get(field) as u32
    }

    pub fn revision_id(&self) -> u32 {
        self.load(REVISION_OFFSET, 4) as u32 & !VMCS_SHADOW_BIT
    }

    pub fn is_shadow(&self) -> bool {
        self.load(REVISION_OFFSET, 4) as u32 & VMCS_SHADOW_BIT != 0
    }

    pub fn set_revision(&mut self, revision: u32, shadow: bool) {
        let value = revision & !VMCS_SHADOW_BIT | if shadow { VMCS_SHADOW_BIT } else { 0 };
        self.store(REVISION_OFFSET, 4, value as u64);
    }

    pub fn abort_indicator(&self) -> u32 {
        self.load(ABORT_OFFSET, 4) as u32
    }

    pub fn set_abort_indicator(&mut self, abort: u32) {
        self.store(ABORT_OFFSET, 4, abort as u64);
    }

    pub fn launch_state(&self) -> Option<LaunchState> {
        LaunchState::from_raw(self.data[LAUNCH_STATE_OFFSET])
    }

    pub fn set_launch_state(&mut self, state: LaunchState) {
        self.data[LAUNCH_STATE_OFFSET] = state as u8;
    }

    pub fn is_launch_state(&self, state: LaunchState) -> bool {
        self.launch_state() == Some(state)
    }

    /// Zeroes every read-only (VM-exit information) field.
    pub fn clear_exit_info(&mut self) {
        for field in VmcsField::ALL {
            if field.field_type() == FieldType::ExitInfo {
                self.set(*field, 0);
            }
        }
    }

    pub fn pin_ctls(&self) -> PinControls {
        PinControls::from_bits_truncate(self.get32(VmcsField::PinControls))
    }

    pub fn proc_ctls(&self) -> ProcControls {
        ProcControls::from_bits_truncate(self.get32(VmcsField::ProcControls))
    }

    /// Secondary controls, read as empty unless activated through the primary controls.
    pub fn proc_ctls2(&self) -> ProcControls2 {
        if !self.proc_ctls().contains(ProcControls::SECONDARY_CONTROLS) {
            return ProcControls2::empty();
        }

        ProcControls2::from_bits_truncate(self.get32(VmcsField::ProcControls2))
    }

    pub fn exit_ctls(&self) -> ExitControls {
        ExitControls::from_bits_truncate(self.get32(VmcsField::ExitControls))
    }

    pub fn entry_ctls(&self) -> EntryControls {
        EntryControls::from_bits_truncate(self.get32(VmcsField::EntryControls))
    }

    pub fn set_entry_ctls(&mut self, ctls: EntryControls) {
        let raw = self.get32(VmcsField::EntryControls) & !EntryControls::all().bits() | ctls.bits();
        self.set(VmcsField::EntryControls, raw as u64);
    }

    pub fn entry_int_info(&self) -> InterruptionInfo {
        InterruptionInfo(self.get32(VmcsField::EntryIntInfo))
    }

    /// Clears the valid bit of the VM-entry interruption-information field.
    pub fn consume_entry_int_info(&mut self) {
        let mut info = self.entry_int_info();
        info.set_valid(false);
        self.set(VmcsField::EntryIntInfo, info.0 as u64);
    }

    pub fn guest_segment(&self, reg: SegReg) -> Segment {
        let [sel, base, limit, attr] = VmcsField::guest_segment(reg);
        self.segment_from(sel, base, limit, attr)
    }

    pub fn set_guest_segment(&mut self, reg: SegReg, seg: &Segment) {
        let [sel, base, limit, attr] = VmcsField::guest_segment(reg);
        self.segment_into(sel, base, limit, attr, seg);
    }

    pub fn guest_ldtr(&self) -> Segment {
        self.segment_from(
            VmcsField::GuestLdtrSel,
            VmcsField::GuestLdtrBase,
            VmcsField::GuestLdtrLimit,
            VmcsField::GuestLdtrAttr,
        )
    }

    pub fn set_guest_ldtr(&mut self, seg: &Segment) {
        self.segment_into(
            VmcsField::GuestLdtrSel,
            VmcsField::GuestLdtrBase,
            VmcsField::GuestLdtrLimit,
            VmcsField::GuestLdtrAttr,
            seg,
        );
    }

    pub fn guest_tr(&self) -> Segment {
        self.segment_from(
            VmcsField::GuestTrSel,
            VmcsField::GuestTrBase,
            VmcsField::GuestTrLimit,
            VmcsField::GuestTrAttr,
        )
    }

    pub fn set_guest_tr(&mut self, seg: &Segment) {
        self.segment_into(
            VmcsField::GuestTrSel,
            VmcsField::GuestTrBase,
            VmcsField::GuestTrLimit,
            VmcsField::GuestTrAttr,
            seg,
        );
    }

    fn segment_from(&self, sel: VmcsField, base: VmcsField, limit: VmcsField, attr: VmcsField) -> Segment {
        Segment {
            selector: self.get(sel) as u16,
            base: self.get(base),
            limit: self.get32(limit),
            attr: SegAttr(self.get32(attr)),
        }
    }

    fn segment_into(
        &mut self, sel: VmcsField, base: VmcsField, limit: VmcsField, attr: VmcsField, seg: &Segment,
    ) {
        self.set(sel, seg.selector as u64);
        self.set(base, seg.base);
        self.set(limit, seg.limit as u64);
        self.set(attr, seg.attr.0 as u64);
    }

    /// The four 64-bit EOI-exit bitmap fields as one 256-bit bitmap.
    pub fn eoi_exit_bitmap(&self) -> [u64; 4] {
        [
            self.get(VmcsField::EoiExitBitmap0),
            self.get(VmcsField::EoiExitBitmap1),
            self.get(VmcsField::EoiExitBitmap2),
            self.get(VmcsField::EoiExitBitmap3),
        ]
    }

    pub fn cr3_targets(&self) -> [u64; 4] {
        [
            self.get(VmcsField::Cr3Target0),
            self.get(VmcsField::Cr3Target1),
            self.get(VmcsField::Cr3Target2),
            self.get(VmcsField::Cr3Target3),
        ]
    }

    pub fn guest_pdptes(&self) -> [u64; 4] {
        [
            self.get(VmcsField::GuestPdpte0),
            self.get(VmcsField::GuestPdpte1),
            self.get(VmcsField::GuestPdpte2),
            self.get(VmcsField::GuestPdpte3),
        ]
    }

    pub fn set_guest_pdptes(&mut self, pdptes: &[u64; 4]) {
        self.set(VmcsField::GuestPdpte0, pdptes[0]);
        self.set(VmcsField::GuestPdpte1, pdptes[1]);
        self.set(VmcsField::GuestPdpte2, pdptes[2]);
        self.set(VmcsField::GuestPdpte3, pdptes[3]);
    }
}
