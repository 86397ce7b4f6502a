//! VM-entry checks.
//!
//! Each battery is an ordered table of independent predicates, each paired with the diagnostic that
//! is recorded when it fails. The first failing predicate ends the battery. The batteries run in the
//! architectural order: controls, host state, guest state.
//!
//! See `Chapter 27 VM Entries`.

use crate::{
    cpu::{SegReg, Segment},
    platform::Platform,
    utils::paging::{fits_phys_width, is_page_aligned, PAGE_SIZE},
    vmx::{
        diag::EntryDiag,
        features::VmxFeatures,
        vmcs::{
            controls::{EntryControls, ExitControls, PinControls, ProcControls, ProcControls2},
            field::VmcsField,
            Vmcs,
        },
    },
};

pub mod controls;
pub mod guest;
pub mod host;

/// Everything the checks look at.
pub struct EntryCtx<'a> {
    pub vmcs: &'a Vmcs,
    pub features: &'a VmxFeatures,
    pub platform: &'a dyn Platform,
    /// Address of the VMCS being entered.
    pub vmcs_ptr: u64,
    /// The guest hypervisor runs in IA-32e mode.
    pub host_long_mode: bool,
}

impl<'a> EntryCtx<'a> {
    pub fn get(&self, field: VmcsField) -> u64 {
        self.vmcs.get(field)
    }

    pub fn pin(&self) -> PinControls {
        self.vmcs.pin_ctls()
    }

    pub fn proc(&self) -> ProcControls {
        self.vmcs.proc_ctls()
    }

    pub fn proc2(&self) -> ProcControls2 {
        self.vmcs.proc_ctls2()
    }

    pub fn exit(&self) -> ExitControls {
        self.vmcs.exit_ctls()
    }

    pub fn entry(&self) -> EntryControls {
        self.vmcs.entry_ctls()
    }

    /// Whether `gpa` is a page-aligned address of ordinary memory within the physical-address width.
    pub fn is_valid_page(&self, gpa: u64) -> bool {
        is_page_aligned(gpa)
            && fits_phys_width(gpa, self.features.phys_addr_width)
            && self.platform.is_ram(gpa, PAGE_SIZE)
    }
}

/// A predicate on the whole VMCS.
pub struct Check {
    pub diag: EntryDiag,
    /// Returns `true` when the state is valid.
    pub ok: fn(&EntryCtx<'_>) -> bool,
}

/// A predicate applied to each segment register in turn.
pub struct SegCheck {
    pub diag: fn(SegReg) -> EntryDiag,
    pub ok: fn(&EntryCtx<'_>, SegReg, &Segment) -> bool,
}

macro_rules! check {
    ($diag:expr, $ok:expr) => {
        $crate::vmx::checks::Check { diag: $diag, ok: $ok }
    };
}
pub(crate) use check;

/// Runs `checks` in order and returns the diagnostic of the first failure.
pub fn run(ctx: &EntryCtx<'_>, checks: &[Check]) -> Result<(), EntryDiag> {
    match checks.iter().find(|check| !(check.ok)(ctx)) {
        Some(check) => Err(check.diag),
        None => Ok(()),
    }
}

/// Runs each check for every register of `regs`, register by register.
pub fn run_segments(
    ctx: &EntryCtx<'_>, regs: &[SegReg], segment: fn(&EntryCtx<'_>, SegReg) -> Segment, checks: &[SegCheck],
) -> Result<(), EntryDiag> {
    for &reg in regs {
        let seg = segment(ctx, reg);
        if let Some(check) = checks.iter().find(|check| !(check.ok)(ctx, reg, &seg)) {
            return Err((check.diag)(reg));
        }
    }

    Ok(())
}

/// Checks a VM-entry or VM-exit MSR area: 16-byte aligned, within the physical-address width and backed
/// by ordinary memory.
pub fn is_msr_area_valid(ctx: &EntryCtx<'_>, addr: u64, count: u32) -> bool {
    if count == 0 {
        return true;
    }

    let size = count as u64 * 16;
    let last = addr.wrapping_add(size - 1);
    addr & 0xf == 0
        && last >= addr
        && fits_phys_width(last, ctx.features.phys_addr_width)
        && ctx.platform.is_ram(addr, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::SegAttr,
        test_utils::{MockPlatform, MMIO_GPA, RAM_END},
    };

    fn never(_: &EntryCtx<'_>) -> bool {
        false
    }

    fn always(_: &EntryCtx<'_>) -> bool {
        true
    }

    #[test]
    fn test_first_failure_wins() {
        let vmcs = Vmcs::new();
        let features = VmxFeatures::full();
        let platform = MockPlatform::new();
        let ctx = EntryCtx {
            vmcs: &vmcs,
            features: &features,
            platform: &platform,
            vmcs_ptr: 0,
            host_long_mode: true,
        };

        let checks = [
            check!(EntryDiag::Cr3TargetCount, always),
            check!(EntryDiag::AddrIoBitmapA, never),
            check!(EntryDiag::AddrIoBitmapB, never),
        ];
        assert_eq!(run(&ctx, &checks), Err(EntryDiag::AddrIoBitmapA));
        assert_eq!(run(&ctx, &checks[..1]), Ok(()));
    }

    #[test]
    fn test_segment_checks_report_register() {
        let mut vmcs = Vmcs::new();
        let features = VmxFeatures::full();
        let platform = MockPlatform::new();

        vmcs.set_guest_segment(
            SegReg::Fs,
            &Segment {
                attr: SegAttr(0x93),
                ..Segment::default()
            },
        );
        let ctx = EntryCtx {
            vmcs: &vmcs,
            features: &features,
            platform: &platform,
            vmcs_ptr: 0,
            host_long_mode: true,
        };

        let checks = [SegCheck {
            diag: EntryDiag::GuestSegAttrPresent,
            ok: |_, _, seg| !seg.attr.present(),
        }];
        let result = run_segments(&ctx, &SegReg::ALL, |ctx, reg| ctx.vmcs.guest_segment(reg), &checks);
        assert_eq!(result, Err(EntryDiag::GuestSegAttrPresent(SegReg::Fs)));
    }

    #[test]
    fn test_msr_area() {
        let vmcs = Vmcs::new();
        let features = VmxFeatures::full();
        let platform = MockPlatform::new();
        let ctx = EntryCtx {
            vmcs: &vmcs,
            features: &features,
            platform: &platform,
            vmcs_ptr: 0,
            host_long_mode: true,
        };

        assert!(is_msr_area_valid(&ctx, 0x1008, 0));
        assert!(is_msr_area_valid(&ctx, 0x1010, 2));
        assert!(!is_msr_area_valid(&ctx, 0x1008, 1));
        assert!(!is_msr_area_valid(&ctx, (1 << 39) - 16, 2));
        assert!(!is_msr_area_valid(&ctx, MMIO_GPA, 1));
        assert!(!is_msr_area_valid(&ctx, RAM_END - 16, 2));
    }
}
