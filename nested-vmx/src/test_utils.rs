//! An in-memory platform and ready-made guest hypervisor states for the unit tests.

use crate::{
    cpu::{gpr, CpuContext, DescTable, SegAttr, SegReg, Segment},
    platform::{MsrAccessError, PageKind, Platform},
    utils::{
        msr::{
            EFER_LMA, EFER_LME, FEATURE_CONTROL_LOCK, FEATURE_CONTROL_VMXON_OUTSIDE_SMX,
            IA32_FEATURE_CONTROL,
        },
        paging::{PAGE_OFFSET_MASK, PAGE_SHIFT},
    },
    vmx::{
        checks::guest::VMCS_LINK_PTR_NONE,
        data::shared_data::SharedData,
        diag::EntryDiag,
        error::{VmxError, VmxResult},
        events::TrapEvent,
        features::{VmxFeatures, CR0_FIXED0, CR4_FIXED0, CR4_PAE, CR4_VMXE},
        instr::{DecodedInstr, MemOperand},
        vcpu::Vcpu,
        vmcs::{
            controls::{
                EntryControls, ExitControls, ENTRY_CONTROLS_DEFAULT1, EXIT_CONTROLS_DEFAULT1,
                PIN_CONTROLS_DEFAULT1, PROC_CONTROLS_DEFAULT1,
            },
            field::VmcsField,
            LaunchState, Vmcs, VMCS_REVISION_ID,
        },
    },
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use hashbrown::HashMap;
use x86::bits64::paging::BASE_PAGE_SIZE;
use x86_64::registers::rflags::RFlags;

pub const VMXON_GPA: u64 = 0x1000;
pub const VMCS_GPA: u64 = 0x2000;
pub const SHADOW_VMCS_GPA: u64 = 0x3000;
pub const VIRT_APIC_GPA: u64 = 0x4000;
pub const APIC_ACCESS_GPA: u64 = 0x5000;
pub const MSR_AREA_GPA: u64 = 0x6000;
pub const PDPT_GPA: u64 = 0x7000;
pub const HOST_CR3: u64 = 0x8000;
pub const GUEST_CR3: u64 = 0xd000;
pub const OPERAND_GPA: u64 = 0xc000;

pub const HOST_RIP: u64 = 0x0010_0000;
pub const HOST_RSP: u64 = 0x0020_0000;
pub const GUEST_RIP: u64 = 0x0040_0000;
pub const GUEST_RSP: u64 = 0x0050_0000;

/// End of the RAM backing the mock platform.
pub const RAM_END: u64 = 0x0100_0000;
/// The only MMIO page of the mock platform.
pub const MMIO_GPA: u64 = 0xfee0_0000;

/// Length of the memory-operand instructions built by [`mem_operand`].
const MEM_INSTR_LEN: u8 = 4;

const CODE_SEL: u16 = 0x8;
const DATA_SEL: u16 = 0x10;
const TSS_SEL: u16 = 0x18;

/// Guest memory and CPU-side collaborators, recording everything the engine asks for.
pub struct MockPlatform {
    pages: HashMap<u64, Box<[u8; BASE_PAGE_SIZE]>>,
    pub msrs: HashMap<u32, u64>,
    pub events: Vec<TrapEvent>,
    pub paging_changes: u32,
    pub tlb_flushes: u32,
    pub apic_access_pages: Vec<u64>,
    pub tsc: u64,
}

impl MockPlatform {
    pub fn new() -> Self {
        let mut msrs = HashMap::new();
        msrs.insert(
            IA32_FEATURE_CONTROL,
            FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMXON_OUTSIDE_SMX,
        );

        Self {
            pages: HashMap::new(),
            msrs,
            events: Vec::new(),
            paging_changes: 0,
            tlb_flushes: 0,
            apic_access_pages: Vec::new(),
            tsc: 0,
        }
    }

    /// Splits `[gpa, gpa + len)` into per-page chunks of (page number, offset, chunk start, chunk length).
    fn chunks(gpa: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize, usize)> {
        let mut done = 0;
        core::iter::from_fn(move || {
            if done >= len {
                return None;
            }

            let addr = gpa + done as u64;
            let offset = (addr & PAGE_OFFSET_MASK) as usize;
            let size = (BASE_PAGE_SIZE - offset).min(len - done);
            let chunk = (addr >> PAGE_SHIFT, offset, done, size);
            done += size;
            Some(chunk)
        })
    }
}

impl Platform for MockPlatform {
    fn read_phys(&self, gpa: u64, buf: &mut [u8]) -> VmxResult<()> {
        if !self.is_ram(gpa, buf.len() as u64) {
            return Err(VmxError::PhysAccess { gpa });
        }

        for (page, offset, start, size) in Self::chunks(gpa, buf.len()) {
            let dst = &mut buf[start..start + size];
            match self.pages.get(&page) {
                Some(data) => dst.copy_from_slice(&data[offset..offset + size]),
                None => dst.fill(0),
            }
        }

        Ok(())
    }

    fn write_phys(&mut self, gpa: u64, buf: &[u8]) -> VmxResult<()> {
        if !self.is_ram(gpa, buf.len() as u64) {
            return Err(VmxError::PhysAccess { gpa });
        }

        for (page, offset, start, size) in Self::chunks(gpa, buf.len()) {
            let data = self
                .pages
                .entry(page)
                .or_insert_with(|| Box::new([0; BASE_PAGE_SIZE]));
            data[offset..offset + size].copy_from_slice(&buf[start..start + size]);
        }

        Ok(())
    }

    fn page_kind(&self, gpa: u64) -> PageKind {
        match gpa & !PAGE_OFFSET_MASK {
            MMIO_GPA => PageKind::Mmio,
            page if page < RAM_END => PageKind::Ram,
            _ => PageKind::Unassigned,
        }
    }

    fn read_linear(&self, addr: u64, buf: &mut [u8]) -> VmxResult<()> {
        self.read_phys(addr, buf)
    }

    fn write_linear(&mut self, addr: u64, buf: &[u8]) -> VmxResult<()> {
        self.write_phys(addr, buf)
    }

    fn read_msr(&self, msr: u32) -> Result<u64, MsrAccessError> {
        self.msrs.get(&msr).copied().ok_or(MsrAccessError::Reserved)
    }

    fn write_msr(&mut self, msr: u32, value: u64) -> Result<(), MsrAccessError> {
        self.msrs.insert(msr, value);
        Ok(())
    }

    fn inject_event(&mut self, event: TrapEvent) {
        self.events.push(event);
    }

    fn paging_mode_changed(&mut self, _ctx: &CpuContext) {
        self.paging_changes += 1;
    }

    fn flush_tlb(&mut self) {
        self.tlb_flushes += 1;
    }

    fn register_apic_access_page(&mut self, gpa: u64) {
        self.apic_access_pages.push(gpa);
    }

    fn deregister_apic_access_page(&mut self, gpa: u64) {
        self.apic_access_pages.retain(|&page| page != gpa);
    }

    fn tsc(&self) -> u64 {
        self.tsc
    }
}

fn code64_segment() -> Segment {
    let mut attr = SegAttr::default();
    attr.set_seg_type(11);
    attr.set_desc_type(true);
    attr.set_present(true);
    attr.set_long(true);
    attr.set_granularity(true);

    Segment {
        selector: CODE_SEL,
        base: 0,
        limit: 0xffff_ffff,
        attr,
    }
}

fn data_segment() -> Segment {
    let mut attr = SegAttr::default();
    attr.set_seg_type(3);
    attr.set_desc_type(true);
    attr.set_present(true);
    attr.set_default_big(true);
    attr.set_granularity(true);

    Segment {
        selector: DATA_SEL,
        base: 0,
        limit: 0xffff_ffff,
        attr,
    }
}

fn tss_segment() -> Segment {
    let mut attr = SegAttr::default();
    attr.set_seg_type(11);
    attr.set_present(true);

    Segment {
        selector: TSS_SEL,
        base: 0x9000,
        limit: 0x67,
        attr,
    }
}

fn unusable_segment() -> Segment {
    Segment {
        attr: SegAttr::UNUSABLE,
        ..Segment::default()
    }
}

/// A guest hypervisor running in 64-bit mode at CPL 0 with CR4.VMXE set.
pub fn long_mode_ctx() -> CpuContext {
    let mut ctx = CpuContext::default();
    ctx.cr0 = CR0_FIXED0;
    ctx.cr3 = HOST_CR3;
    ctx.cr4 = CR4_VMXE | CR4_PAE;
    ctx.efer = EFER_LMA | EFER_LME;
    ctx.rip = 0x0008_0000;

    for reg in SegReg::ALL {
        *ctx.seg_mut(reg) = data_segment();
    }
    *ctx.seg_mut(SegReg::Cs) = code64_segment();
    ctx.ldtr = unusable_segment();
    ctx.tr = tss_segment();
    ctx.gdtr = DescTable {
        base: 0xa000,
        limit: 0xff,
    };
    ctx.idtr = DescTable {
        base: 0xb000,
        limit: 0xfff,
    };
    ctx.set_gpr(gpr::RSP, HOST_RSP);

    ctx
}

/// Writes an empty VMCS region with the supported revision identifier.
pub fn init_vmcs_region(platform: &mut MockPlatform, gpa: u64) {
    platform.write_phys_u32(gpa, VMCS_REVISION_ID).unwrap();
}

/// A VMCS that passes every VM-entry check: a 64-bit host and a 64-bit guest without secondary
/// controls.
pub fn valid_vmcs() -> Vmcs {
    let mut vmcs = Vmcs::new();
    vmcs.set_revision(VMCS_REVISION_ID, false);
    vmcs.set_launch_state(LaunchState::Clear);

    vmcs.set(VmcsField::PinControls, PIN_CONTROLS_DEFAULT1 as u64);
    vmcs.set(VmcsField::ProcControls, PROC_CONTROLS_DEFAULT1 as u64);
    vmcs.set(
        VmcsField::ExitControls,
        (EXIT_CONTROLS_DEFAULT1 | ExitControls::HOST_ADDR_SPACE_SIZE.bits()) as u64,
    );
    vmcs.set(
        VmcsField::EntryControls,
        (ENTRY_CONTROLS_DEFAULT1 | EntryControls::IA32E_MODE_GUEST.bits()) as u64,
    );

    // Host state.
    vmcs.set(VmcsField::HostCr0, CR0_FIXED0);
    vmcs.set(VmcsField::HostCr3, HOST_CR3);
    vmcs.set(VmcsField::HostCr4, CR4_VMXE | CR4_PAE);
    for reg in SegReg::ALL {
        vmcs.set(VmcsField::host_selector(reg), DATA_SEL as u64);
    }
    vmcs.set(VmcsField::host_selector(SegReg::Cs), CODE_SEL as u64);
    vmcs.set(VmcsField::HostTrSel, TSS_SEL as u64);
    vmcs.set(VmcsField::HostTrBase, 0x9000);
    vmcs.set(VmcsField::HostGdtrBase, 0xa000);
    vmcs.set(VmcsField::HostIdtrBase, 0xb000);
    vmcs.set(VmcsField::HostRip, HOST_RIP);
    vmcs.set(VmcsField::HostRsp, HOST_RSP);

    // Guest state.
    vmcs.set(VmcsField::GuestCr0, CR0_FIXED0);
    vmcs.set(VmcsField::GuestCr3, GUEST_CR3);
    vmcs.set(VmcsField::GuestCr4, CR4_VMXE | CR4_PAE);
    vmcs.set(VmcsField::GuestDr7, 0x400);
    vmcs.set(VmcsField::GuestEfer, EFER_LMA | EFER_LME);
    for reg in SegReg::ALL {
        vmcs.set_guest_segment(reg, &data_segment());
    }
    vmcs.set_guest_segment(SegReg::Cs, &code64_segment());
    vmcs.set_guest_ldtr(&unusable_segment());
    vmcs.set_guest_tr(&tss_segment());
    vmcs.set(VmcsField::GuestGdtrLimit, 0xff);
    vmcs.set(VmcsField::GuestIdtrLimit, 0xfff);
    vmcs.set(VmcsField::GuestRip, GUEST_RIP);
    vmcs.set(VmcsField::GuestRsp, GUEST_RSP);
    vmcs.set(VmcsField::GuestRflags, 0x202);

    vmcs.set(VmcsField::VmcsLinkPtr, VMCS_LINK_PTR_NONE);
    vmcs.set(VmcsField::VirtApicAddr, VIRT_APIC_GPA);
    vmcs.set(VmcsField::ApicAccessAddr, APIC_ACCESS_GPA);

    vmcs
}

/// A protected-mode guest of [`valid_vmcs`] switched to virtual-8086 mode, with every segment at
/// `selector << 4`.
pub fn v86_vmcs() -> Vmcs {
    let mut vmcs = valid_vmcs();
    vmcs.set_entry_ctls(vmcs.entry_ctls() - EntryControls::IA32E_MODE_GUEST);
    vmcs.set(VmcsField::GuestCr0, VmxFeatures::full().cr0_fixed0(false));
    vmcs.set(VmcsField::GuestCr4, CR4_FIXED0);
    vmcs.set(VmcsField::GuestEfer, 0);
    vmcs.set(VmcsField::GuestRflags, 0x2 | RFlags::VIRTUAL_8086_MODE.bits());
    vmcs.set(VmcsField::GuestRip, 0x100);
    for reg in SegReg::ALL {
        vmcs.set_guest_segment(reg, &Segment::v86(0x1000 + reg as u16));
    }

    let mut tr = vmcs.guest_tr();
    tr.attr.set_seg_type(11);
    vmcs.set_guest_tr(&tr);
    vmcs
}

/// Breaks virtual-8086 segment rule `rule` (base, limit, attributes) of `reg` and returns the diagnostic
/// the guest-state checks report for it.
pub fn break_v86_rule(vmcs: &mut Vmcs, reg: SegReg, rule: usize) -> EntryDiag {
    let mut seg = vmcs.guest_segment(reg);
    let diag = match rule {
        0 => {
            seg.base += 0x10;
            EntryDiag::GuestSegBaseV86(reg)
        }
        1 => {
            seg.limit = 0xfffff;
            EntryDiag::GuestSegLimitV86(reg)
        }
        _ => {
            seg.attr = SegAttr(0x93);
            EntryDiag::GuestSegAttrV86(reg)
        }
    };
    vmcs.set_guest_segment(reg, &seg);
    diag
}

/// A virtual CPU outside VMX operation with a valid VMXON region at [`VMXON_GPA`].
pub fn vcpu() -> (Vcpu, CpuContext, MockPlatform) {
    let mut platform = MockPlatform::new();
    init_vmcs_region(&mut platform, VMXON_GPA);

    let vcpu = Vcpu::new(0, Arc::new(SharedData::new(VmxFeatures::full())));
    (vcpu, long_mode_ctx(), platform)
}

/// In VMX root operation without a current VMCS.
pub fn vcpu_in_vmx() -> (Vcpu, CpuContext, MockPlatform) {
    let (mut vcpu, ctx, platform) = vcpu();
    vcpu.data.in_vmx = true;
    vcpu.data.vmxon_ptr = VMXON_GPA;

    (vcpu, ctx, platform)
}

/// In VMX root operation with [`valid_vmcs`] current at [`VMCS_GPA`].
pub fn vcpu_with_vmcs() -> (Vcpu, CpuContext, MockPlatform) {
    let (mut vcpu, ctx, mut platform) = vcpu_in_vmx();
    platform.write_phys(VMCS_GPA, valid_vmcs().as_bytes()).unwrap();
    vcpu.data.vmcs.load(&mut platform, VMCS_GPA).unwrap();

    (vcpu, ctx, platform)
}

/// Running the nested guest of [`valid_vmcs`]. The platform has not seen a paging-mode change yet.
pub fn vcpu_in_non_root() -> (Vcpu, CpuContext, MockPlatform) {
    let (mut vcpu, mut ctx, platform) = vcpu_with_vmcs();
    vcpu.vmcs_mut().set_launch_state(LaunchState::Launched);
    vcpu.load_guest_state(&mut ctx, &platform).unwrap();
    vcpu.data.in_non_root = true;

    (vcpu, ctx, platform)
}

/// Places `value` at [`OPERAND_GPA`] and returns an instruction whose memory operand points at it.
pub fn mem_operand(platform: &mut MockPlatform, value: u64) -> DecodedInstr {
    platform.write_phys_u64(OPERAND_GPA, value).unwrap();
    DecodedInstr::with_mem(MEM_INSTR_LEN, MemOperand::flat(OPERAND_GPA))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_crosses_pages() {
        let mut platform = MockPlatform::new();
        let gpa = 0x1ffc;
        platform.write_phys_u64(gpa, 0x1122_3344_5566_7788).unwrap();

        assert_eq!(platform.read_phys_u64(gpa).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(platform.read_phys_u32(0x2000).unwrap(), 0x1122_3344);
        assert_eq!(platform.read_phys_u32(0x3000).unwrap(), 0);
    }

    #[test]
    fn test_non_ram_is_rejected() {
        let mut platform = MockPlatform::new();

        assert!(!platform.is_ram(MMIO_GPA, 4));
        assert!(!platform.is_ram(RAM_END - 4, 8));
        assert_eq!(
            platform.write_phys_u32(MMIO_GPA, 1),
            Err(VmxError::PhysAccess { gpa: MMIO_GPA })
        );
    }
}
