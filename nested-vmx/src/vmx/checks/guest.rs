//! Checks on the guest-state area.
//!
//! A failure here is reported to the guest hypervisor as a VM-exit with reason "invalid guest state",
//! see [`exit_qualification`] for the qualification that goes with each diagnostic.
//!
//! See `27.3.1 Checks on the Guest State Area`.

use crate::{
    cpu::{ActivityState, Interruptibility, SegAttr, SegReg, Segment},
    utils::{
        msr::{is_pat_valid, DEBUGCTL_VALID_MASK, EFER_LMA, EFER_LME, EFER_VALID_MASK},
        paging::{fits_phys_width, is_canonical, is_page_aligned, is_pdpte_valid, PAGE_SIZE},
    },
    vmx::{
        checks::{check, run, run_segments, Check, EntryCtx, SegCheck},
        diag::EntryDiag,
        events::{X86_XCPT_DB, X86_XCPT_MC},
        features::{CR0_FIXED1, CR0_PE, CR0_PG, CR4_FIXED0, CR4_PAE, CR4_PCIDE},
        vmcs::{
            controls::{EntryControls, PinControls, ProcControls2},
            field::VmcsField,
            info::{
                IntType, ENTRY_FAIL_QUAL_LINK_PTR, ENTRY_FAIL_QUAL_NMI_INJECT, ENTRY_FAIL_QUAL_NONE,
                ENTRY_FAIL_QUAL_PDPTE,
            },
            VMCS_REVISION_ID, VMCS_SHADOW_BIT,
        },
    },
};
use x86_64::registers::rflags::RFlags;

/// The VMCS link pointer value that disables it.
pub const VMCS_LINK_PTR_NONE: u64 = u64::MAX;

/// RFLAGS bits that may be set: 21:16, 14:6, 4, 2, 1 and 0.
const RFLAGS_VALID_MASK: u64 = 0x003f_7fd7;
/// RFLAGS bit 1 is always set.
const RFLAGS_FIXED1: u64 = 1 << 1;

/// Pending debug exceptions: B3-B0, enabled breakpoint, BS and RTM.
const PENDING_DBG_VALID_MASK: u64 = 0xf | 1 << 12 | 1 << 14 | 1 << 16;
const PENDING_DBG_BS: u64 = 1 << 14;

const DEBUGCTL_BTF: u64 = 1 << 1;

const CR3_PAE_MASK: u64 = 0xffff_ffe0;

fn cr0(ctx: &EntryCtx<'_>) -> u64 {
    ctx.get(VmcsField::GuestCr0)
}

fn cr4(ctx: &EntryCtx<'_>) -> u64 {
    ctx.get(VmcsField::GuestCr4)
}

fn rflags(ctx: &EntryCtx<'_>) -> u64 {
    ctx.get(VmcsField::GuestRflags)
}

fn unrestricted(ctx: &EntryCtx<'_>) -> bool {
    ctx.proc2().contains(ProcControls2::UNRESTRICTED_GUEST)
}

fn ia32e_guest(ctx: &EntryCtx<'_>) -> bool {
    ctx.entry().contains(EntryControls::IA32E_MODE_GUEST)
}

fn v86(ctx: &EntryCtx<'_>) -> bool {
    rflags(ctx) & RFlags::VIRTUAL_8086_MODE.bits() != 0
}

fn seg(ctx: &EntryCtx<'_>, reg: SegReg) -> Segment {
    ctx.vmcs.guest_segment(reg)
}

fn int_state(ctx: &EntryCtx<'_>) -> Interruptibility {
    Interruptibility::from_bits_truncate(ctx.vmcs.get32(VmcsField::GuestIntState))
}

fn activity(ctx: &EntryCtx<'_>) -> Option<ActivityState> {
    ActivityState::from_raw(ctx.vmcs.get32(VmcsField::GuestActivityState))
}

/// Type of the event being injected, if any.
fn injected(ctx: &EntryCtx<'_>) -> Option<(IntType, u8)> {
    let info = ctx.vmcs.entry_int_info();
    info.valid().then(|| (info.int_type(), info.vector()))
}

/// Bits 11:8 and 31:17 are reserved. The granularity bit must agree with the limit.
fn is_attr_rsvd_clear(attr: SegAttr) -> bool {
    attr.0 & SegAttr::RSVD_MASK == 0
}

fn is_granularity_valid(seg: &Segment) -> bool {
    let low_set = seg.limit & 0xfff == 0xfff;
    let high_clear = seg.limit & 0xfff0_0000 == 0;

    (low_set || !seg.attr.granularity()) && (high_clear || seg.attr.granularity())
}

static CR_MSR_CHECKS: &[Check] = &[
    check!(EntryDiag::GuestCr0Fixed0, |ctx| {
        let fixed0 = ctx.features.cr0_fixed0(unrestricted(ctx));
        cr0(ctx) & fixed0 == fixed0
    }),
    check!(EntryDiag::GuestCr0Fixed1, |ctx| cr0(ctx) & !CR0_FIXED1 == 0),
    check!(EntryDiag::GuestCr0PgPe, |ctx| cr0(ctx) & CR0_PG == 0 || cr0(ctx) & CR0_PE != 0),
    check!(EntryDiag::GuestCr4Fixed0, |ctx| cr4(ctx) & CR4_FIXED0 == CR4_FIXED0),
    check!(EntryDiag::GuestCr4Fixed1, |ctx| cr4(ctx) & !ctx.features.cr4_fixed1() == 0),
    check!(EntryDiag::GuestCr4PaeLongMode, |ctx| {
        if ia32e_guest(ctx) {
            cr0(ctx) & CR0_PG != 0 && cr4(ctx) & CR4_PAE != 0
        } else {
            cr4(ctx) & CR4_PCIDE == 0
        }
    }),
    check!(EntryDiag::GuestCr3, |ctx| fits_phys_width(
        ctx.get(VmcsField::GuestCr3),
        ctx.features.phys_addr_width
    )),
    check!(EntryDiag::GuestDebugCtl, |ctx| !ctx.entry().contains(EntryControls::LOAD_DEBUG)
        || ctx.get(VmcsField::GuestDebugCtl) & !DEBUGCTL_VALID_MASK == 0),
    check!(EntryDiag::GuestDr7, |ctx| !ctx.entry().contains(EntryControls::LOAD_DEBUG)
        || ctx.get(VmcsField::GuestDr7) >> 32 == 0),
    check!(EntryDiag::GuestSysenterEspEip, |ctx| is_canonical(ctx.get(VmcsField::GuestSysenterEsp))
        && is_canonical(ctx.get(VmcsField::GuestSysenterEip))),
    check!(EntryDiag::GuestPatMsr, |ctx| !ctx.entry().contains(EntryControls::LOAD_PAT)
        || is_pat_valid(ctx.get(VmcsField::GuestPat))),
    check!(EntryDiag::GuestEferMsrRsvd, |ctx| !ctx.entry().contains(EntryControls::LOAD_EFER)
        || ctx.get(VmcsField::GuestEfer) & !EFER_VALID_MASK == 0),
    check!(EntryDiag::GuestEferMsr, |ctx| {
        if !ctx.entry().contains(EntryControls::LOAD_EFER) {
            return true;
        }

        let efer = ctx.get(VmcsField::GuestEfer);
        let long = ia32e_guest(ctx);
        (efer & EFER_LMA != 0) == long && (cr0(ctx) & CR0_PG == 0 || (efer & EFER_LME != 0) == long)
    }),
];

/// Virtual-8086 mode: every segment looks like it was loaded from a real-mode selector.
static V86_SEG_CHECKS: &[SegCheck] = &[
    SegCheck {
        diag: EntryDiag::GuestSegBaseV86,
        ok: |_, _, seg| seg.base == (seg.selector as u64) << 4,
    },
    SegCheck {
        diag: EntryDiag::GuestSegLimitV86,
        ok: |_, _, seg| seg.limit == 0xffff,
    },
    SegCheck {
        diag: EntryDiag::GuestSegAttrV86,
        ok: |_, _, seg| seg.attr == SegAttr::V86,
    },
];

/// Protected mode. Unusable segments other than CS are only checked for their base.
static PROT_SEG_CHECKS: &[SegCheck] = &[
    SegCheck {
        diag: EntryDiag::GuestSegBase,
        ok: |_, reg, seg| match reg {
            SegReg::Fs | SegReg::Gs => is_canonical(seg.base),
            SegReg::Cs => seg.base >> 32 == 0,
            _ => !seg.is_usable() || seg.base >> 32 == 0,
        },
    },
    SegCheck {
        diag: EntryDiag::GuestSegAttrTypeAcc,
        ok: |_, reg, seg| {
            if !matches!(reg, SegReg::Es | SegReg::Ds | SegReg::Fs | SegReg::Gs) || !seg.is_usable() {
                return true;
            }

            let ty = seg.attr.seg_type();
            let accessed = ty & SegAttr::TYPE_ACCESSED != 0;
            let readable_code = !seg.attr.is_code() || ty & SegAttr::TYPE_RW != 0;
            accessed && readable_code
        },
    },
    SegCheck {
        diag: EntryDiag::GuestSegAttrDescType,
        ok: |_, reg, seg| (reg != SegReg::Cs && !seg.is_usable()) || seg.attr.desc_type(),
    },
    SegCheck {
        diag: EntryDiag::GuestSegAttrDplRpl,
        ok: |ctx, reg, seg| {
            if unrestricted(ctx) || !seg.is_usable() {
                return true;
            }

            match reg {
                SegReg::Cs => true,
                SegReg::Ss => seg.attr.dpl() == seg.rpl(),
                // Data and non-conforming code segments.
                _ => seg.attr.seg_type() > 11 || seg.attr.dpl() >= seg.rpl(),
            }
        },
    },
    SegCheck {
        diag: EntryDiag::GuestSegAttrPresent,
        ok: |_, reg, seg| (reg != SegReg::Cs && !seg.is_usable()) || seg.attr.present(),
    },
    SegCheck {
        diag: EntryDiag::GuestSegAttrRsvd,
        ok: |_, reg, seg| (reg != SegReg::Cs && !seg.is_usable()) || is_attr_rsvd_clear(seg.attr),
    },
    SegCheck {
        diag: EntryDiag::GuestSegAttrGran,
        ok: |_, reg, seg| (reg != SegReg::Cs && !seg.is_usable()) || is_granularity_valid(seg),
    },
];

/// Rules that relate CS and SS.
static CS_SS_CHECKS: &[Check] = &[
    check!(EntryDiag::GuestSegSelCsSsRpl, |ctx| unrestricted(ctx)
        || seg(ctx, SegReg::Ss).rpl() == seg(ctx, SegReg::Cs).rpl()),
    check!(EntryDiag::GuestSegAttrCsType, |ctx| {
        match seg(ctx, SegReg::Cs).attr.seg_type() {
            9 | 11 | 13 | 15 => true,
            3 => unrestricted(ctx),
            _ => false,
        }
    }),
    check!(EntryDiag::GuestSegAttrCsDplZero, |ctx| {
        let cs = seg(ctx, SegReg::Cs);
        cs.attr.seg_type() != 3 || cs.attr.dpl() == 0
    }),
    check!(EntryDiag::GuestSegAttrCsDplEqSs, |ctx| {
        let cs = seg(ctx, SegReg::Cs);
        !matches!(cs.attr.seg_type(), 9 | 11) || cs.attr.dpl() == seg(ctx, SegReg::Ss).attr.dpl()
    }),
    check!(EntryDiag::GuestSegAttrCsDplLtSs, |ctx| {
        let cs = seg(ctx, SegReg::Cs);
        !matches!(cs.attr.seg_type(), 13 | 15) || cs.attr.dpl() <= seg(ctx, SegReg::Ss).attr.dpl()
    }),
    check!(EntryDiag::GuestSegAttrCsDefBig, |ctx| {
        let cs = seg(ctx, SegReg::Cs);
        !(ia32e_guest(ctx) && cs.attr.long() && cs.attr.default_big())
    }),
    check!(EntryDiag::GuestSegAttrSsType, |ctx| {
        let ss = seg(ctx, SegReg::Ss);
        !ss.is_usable() || matches!(ss.attr.seg_type(), 3 | 7)
    }),
    check!(EntryDiag::GuestSegAttrSsDplZero, |ctx| {
        let ss = seg(ctx, SegReg::Ss);
        let real_like = seg(ctx, SegReg::Cs).attr.seg_type() == 3 || cr0(ctx) & CR0_PE == 0;
        !real_like || ss.attr.dpl() == 0
    }),
];

static SYSTEM_SEG_CHECKS: &[Check] = &[
    check!(EntryDiag::GuestSegSelTr, |ctx| !ctx.vmcs.guest_tr().ti()),
    check!(EntryDiag::GuestTrBase, |ctx| is_canonical(ctx.vmcs.guest_tr().base)),
    check!(EntryDiag::GuestTrAttrType, |ctx| {
        match ctx.vmcs.guest_tr().attr.seg_type() {
            11 => true,
            3 => !ia32e_guest(ctx),
            _ => false,
        }
    }),
    check!(EntryDiag::GuestTrAttrDescType, |ctx| !ctx.vmcs.guest_tr().attr.desc_type()),
    check!(EntryDiag::GuestTrAttrPresent, |ctx| ctx.vmcs.guest_tr().attr.present()),
    check!(EntryDiag::GuestTrAttrRsvd, |ctx| is_attr_rsvd_clear(ctx.vmcs.guest_tr().attr)),
    check!(EntryDiag::GuestTrAttrGran, |ctx| is_granularity_valid(&ctx.vmcs.guest_tr())),
    check!(EntryDiag::GuestTrAttrUnusable, |ctx| ctx.vmcs.guest_tr().is_usable()),
    check!(EntryDiag::GuestSegSelLdtr, |ctx| {
        let ldtr = ctx.vmcs.guest_ldtr();
        !ldtr.is_usable() || !ldtr.ti()
    }),
    check!(EntryDiag::GuestLdtrBase, |ctx| {
        let ldtr = ctx.vmcs.guest_ldtr();
        !ldtr.is_usable() || is_canonical(ldtr.base)
    }),
    check!(EntryDiag::GuestLdtrAttrType, |ctx| {
        let ldtr = ctx.vmcs.guest_ldtr();
        !ldtr.is_usable() || ldtr.attr.seg_type() == 2
    }),
    check!(EntryDiag::GuestLdtrAttrDescType, |ctx| {
        let ldtr = ctx.vmcs.guest_ldtr();
        !ldtr.is_usable() || !ldtr.attr.desc_type()
    }),
    check!(EntryDiag::GuestLdtrAttrPresent, |ctx| {
        let ldtr = ctx.vmcs.guest_ldtr();
        !ldtr.is_usable() || ldtr.attr.present()
    }),
    check!(EntryDiag::GuestLdtrAttrRsvd, |ctx| {
        let ldtr = ctx.vmcs.guest_ldtr();
        !ldtr.is_usable() || is_attr_rsvd_clear(ldtr.attr)
    }),
    check!(EntryDiag::GuestLdtrAttrGran, |ctx| {
        let ldtr = ctx.vmcs.guest_ldtr();
        !ldtr.is_usable() || is_granularity_valid(&ldtr)
    }),
    check!(EntryDiag::GuestGdtrIdtrBase, |ctx| is_canonical(ctx.get(VmcsField::GuestGdtrBase))
        && is_canonical(ctx.get(VmcsField::GuestIdtrBase))),
    check!(EntryDiag::GuestGdtrIdtrLimit, |ctx| ctx.get(VmcsField::GuestGdtrLimit) >> 16 == 0
        && ctx.get(VmcsField::GuestIdtrLimit) >> 16 == 0),
];

static RIP_RFLAGS_CHECKS: &[Check] = &[
    check!(EntryDiag::GuestRipRsvd, |ctx| {
        (ia32e_guest(ctx) && seg(ctx, SegReg::Cs).attr.long()) || ctx.get(VmcsField::GuestRip) >> 32 == 0
    }),
    check!(EntryDiag::GuestRip, |ctx| !(ia32e_guest(ctx) && seg(ctx, SegReg::Cs).attr.long())
        || is_canonical(ctx.get(VmcsField::GuestRip))),
    check!(EntryDiag::GuestRflagsRsvd, |ctx| rflags(ctx) & !RFLAGS_VALID_MASK == 0
        && rflags(ctx) & RFLAGS_FIXED1 != 0),
    check!(EntryDiag::GuestRflagsVm, |ctx| !v86(ctx)
        || (!ia32e_guest(ctx) && cr0(ctx) & CR0_PE != 0)),
    check!(EntryDiag::GuestRflagsIf, |ctx| {
        !matches!(injected(ctx), Some((IntType::ExtInt, _))) || rflags(ctx) & RFlags::INTERRUPT_FLAG.bits() != 0
    }),
];

static NON_REGISTER_CHECKS: &[Check] = &[
    check!(EntryDiag::GuestActStateRsvd, |ctx| activity(ctx).is_some()),
    check!(EntryDiag::GuestActStateHltSsDpl, |ctx| activity(ctx) != Some(ActivityState::Hlt)
        || seg(ctx, SegReg::Ss).attr.dpl() == 0),
    check!(EntryDiag::GuestActStateStiMovSs, |ctx| activity(ctx) == Some(ActivityState::Active)
        || !int_state(ctx).intersects(Interruptibility::BLOCK_STI | Interruptibility::BLOCK_MOVSS)),
    check!(EntryDiag::GuestActStateEvent, |ctx| {
        let Some((ty, vector)) = injected(ctx) else {
            return true;
        };

        match activity(ctx) {
            Some(ActivityState::Hlt) => match ty {
                IntType::ExtInt | IntType::Nmi => true,
                IntType::HwXcpt => vector == X86_XCPT_DB || vector == X86_XCPT_MC,
                IntType::Other => vector == 0,
                _ => false,
            },
            Some(ActivityState::Shutdown) => {
                ty == IntType::Nmi || (ty == IntType::HwXcpt && vector == X86_XCPT_MC)
            }
            Some(ActivityState::WaitSipi) => false,
            _ => true,
        }
    }),
    check!(EntryDiag::GuestIntStateRsvd, |ctx| ctx.vmcs.get32(VmcsField::GuestIntState)
        & !Interruptibility::all().bits()
        == 0),
    check!(EntryDiag::GuestIntStateStiMovSs, |ctx| !int_state(ctx)
        .contains(Interruptibility::BLOCK_STI | Interruptibility::BLOCK_MOVSS)),
    check!(EntryDiag::GuestIntStateRflagsSti, |ctx| !int_state(ctx).contains(Interruptibility::BLOCK_STI)
        || rflags(ctx) & RFlags::INTERRUPT_FLAG.bits() != 0),
    check!(EntryDiag::GuestIntStateExtInt, |ctx| !matches!(injected(ctx), Some((IntType::ExtInt, _)))
        || !int_state(ctx).intersects(Interruptibility::BLOCK_STI | Interruptibility::BLOCK_MOVSS)),
    check!(EntryDiag::GuestIntStateNmi, |ctx| !matches!(injected(ctx), Some((IntType::Nmi, _)))
        || !int_state(ctx).intersects(Interruptibility::BLOCK_STI | Interruptibility::BLOCK_MOVSS)),
    check!(EntryDiag::GuestIntStateSmi, |ctx| !int_state(ctx).contains(Interruptibility::BLOCK_SMI)),
    check!(EntryDiag::GuestIntStateVirtNmi, |ctx| {
        !ctx.pin().contains(PinControls::VIRT_NMI)
            || !matches!(injected(ctx), Some((IntType::Nmi, _)))
            || !int_state(ctx).contains(Interruptibility::BLOCK_NMI)
    }),
    check!(EntryDiag::GuestIntStateEnclave, |ctx| !int_state(ctx).contains(Interruptibility::ENCLAVE)),
    check!(EntryDiag::GuestPndDbgXcptRsvd, |ctx| ctx.get(VmcsField::GuestPendingDbgXcpts)
        & !PENDING_DBG_VALID_MASK
        == 0),
    check!(EntryDiag::GuestPndDbgXcptBsTf, |ctx| !single_step_pending(ctx)
        || ctx.get(VmcsField::GuestPendingDbgXcpts) & PENDING_DBG_BS != 0),
    check!(EntryDiag::GuestPndDbgXcptBsNoTf, |ctx| !blocked_or_halted(ctx)
        || single_step_pending(ctx)
        || ctx.get(VmcsField::GuestPendingDbgXcpts) & PENDING_DBG_BS == 0),
];

fn blocked_or_halted(ctx: &EntryCtx<'_>) -> bool {
    int_state(ctx).intersects(Interruptibility::BLOCK_STI | Interruptibility::BLOCK_MOVSS)
        || activity(ctx) == Some(ActivityState::Hlt)
}

/// A single-step trap is pending behind an interrupt shadow or HLT: TF set and branch tracing off.
fn single_step_pending(ctx: &EntryCtx<'_>) -> bool {
    blocked_or_halted(ctx)
        && rflags(ctx) & RFlags::TRAP_FLAG.bits() != 0
        && ctx.get(VmcsField::GuestDebugCtl) & DEBUGCTL_BTF == 0
}

fn check_link_ptr(ctx: &EntryCtx<'_>) -> Result<(), EntryDiag> {
    let ptr = ctx.get(VmcsField::VmcsLinkPtr);
    if ptr == VMCS_LINK_PTR_NONE {
        return Ok(());
    }

    if !is_page_aligned(ptr) {
        return Err(EntryDiag::VmcsLinkPtrAlign);
    }
    if !fits_phys_width(ptr, ctx.features.phys_addr_width) {
        return Err(EntryDiag::VmcsLinkPtrWidth);
    }
    if !ctx.platform.is_ram(ptr, PAGE_SIZE) {
        return Err(EntryDiag::VmcsLinkPtrAbnormal);
    }
    if ptr == ctx.vmcs_ptr {
        return Err(EntryDiag::VmcsLinkPtrCurVmcs);
    }

    let Ok(revision) = ctx.platform.read_phys_u32(ptr) else {
        return Err(EntryDiag::VmcsLinkPtrReadPhys);
    };
    if revision & !VMCS_SHADOW_BIT != VMCS_REVISION_ID {
        return Err(EntryDiag::VmcsLinkPtrRevId);
    }

    let shadowing = ctx.proc2().contains(ProcControls2::VMCS_SHADOWING);
    if (revision & VMCS_SHADOW_BIT != 0) != shadowing {
        return Err(EntryDiag::VmcsLinkPtrShadow);
    }

    Ok(())
}

/// With PAE paging the PDPTEs are loaded on entry. They come from the VMCS with EPT, otherwise from
/// the page-directory-pointer table referenced by the guest CR3.
fn check_pdptes(ctx: &EntryCtx<'_>) -> Result<(), EntryDiag> {
    let pae_paging = cr0(ctx) & CR0_PG != 0 && cr4(ctx) & CR4_PAE != 0 && !ia32e_guest(ctx);
    if !pae_paging {
        return Ok(());
    }

    let pdptes = if ctx.proc2().contains(ProcControls2::EPT) {
        ctx.vmcs.guest_pdptes()
    } else {
        let base = ctx.get(VmcsField::GuestCr3) & CR3_PAE_MASK;
        let mut pdptes = [0u64; 4];
        for (i, pdpte) in pdptes.iter_mut().enumerate() {
            *pdpte = ctx
                .platform
                .read_phys_u64(base + i as u64 * 8)
                .map_err(|_| EntryDiag::GuestPdpte)?;
        }
        pdptes
    };

    if pdptes
        .iter()
        .all(|&pdpte| is_pdpte_valid(pdpte, ctx.features.phys_addr_width))
    {
        Ok(())
    } else {
        Err(EntryDiag::GuestPdpte)
    }
}

/// Runs the guest-state checks.
pub fn check_guest(ctx: &EntryCtx<'_>) -> Result<(), EntryDiag> {
    run(ctx, CR_MSR_CHECKS)?;

    if v86(ctx) {
        run_segments(ctx, &SegReg::ALL, seg, V86_SEG_CHECKS)?;
    } else {
        run_segments(ctx, &SegReg::ALL, seg, PROT_SEG_CHECKS)?;
        run(ctx, CS_SS_CHECKS)?;
    }

    run(ctx, SYSTEM_SEG_CHECKS)?;
    run(ctx, RIP_RFLAGS_CHECKS)?;
    run(ctx, NON_REGISTER_CHECKS)?;
    check_link_ptr(ctx)?;
    check_pdptes(ctx)
}

/// Exit qualification of the "invalid guest state" VM-exit caused by `diag`.
///
/// See `Table 28-1 Exit Qualification for VM-Entry Failures`.
pub fn exit_qualification(diag: EntryDiag) -> u64 {
    match diag {
        EntryDiag::GuestPdpte => ENTRY_FAIL_QUAL_PDPTE,
        EntryDiag::GuestIntStateNmi => ENTRY_FAIL_QUAL_NMI_INJECT,
        EntryDiag::VmcsLinkPtrCurVmcs
        | EntryDiag::VmcsLinkPtrAlign
        | EntryDiag::VmcsLinkPtrWidth
        | EntryDiag::VmcsLinkPtrAbnormal
        | EntryDiag::VmcsLinkPtrReadPhys
        | EntryDiag::VmcsLinkPtrRevId
        | EntryDiag::VmcsLinkPtrShadow => ENTRY_FAIL_QUAL_LINK_PTR,
        _ => ENTRY_FAIL_QUAL_NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::Platform,
        test_utils::{self, MockPlatform, SHADOW_VMCS_GPA, VMCS_GPA},
        vmx::{
            features::VmxFeatures,
            vmcs::{controls::ProcControls, info::InterruptionInfo, Vmcs},
        },
    };

    fn run_on(vmcs: &Vmcs, platform: &MockPlatform) -> Result<(), EntryDiag> {
        let features = VmxFeatures::full();
        let ctx = EntryCtx {
            vmcs,
            features: &features,
            platform,
            vmcs_ptr: VMCS_GPA,
            host_long_mode: true,
        };
        check_guest(&ctx)
    }

    #[test]
    fn test_valid_guest_passes() {
        let platform = MockPlatform::new();
        assert_eq!(run_on(&test_utils::valid_vmcs(), &platform), Ok(()));
        assert_eq!(run_on(&test_utils::v86_vmcs(), &platform), Ok(()));
    }

    #[test]
    fn test_pg_without_pe() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        let proc = vmcs.get(VmcsField::ProcControls) | ProcControls::SECONDARY_CONTROLS.bits() as u64;
        vmcs.set(VmcsField::ProcControls, proc);
        vmcs.set(
            VmcsField::ProcControls2,
            (ProcControls2::EPT | ProcControls2::UNRESTRICTED_GUEST).bits() as u64,
        );
        vmcs.set(VmcsField::GuestCr0, vmcs.get(VmcsField::GuestCr0) & !CR0_PE);

        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestCr0PgPe));
    }

    #[test]
    fn test_v86_segment_diagnostics_name_register() {
        let platform = MockPlatform::new();

        for reg in SegReg::ALL {
            for rule in 0..3 {
                let mut vmcs = test_utils::v86_vmcs();
                let diag = test_utils::break_v86_rule(&mut vmcs, reg, rule);
                assert_eq!(run_on(&vmcs, &platform), Err(diag), "{:?} rule {}", reg, rule);
            }
        }
    }

    #[test]
    fn test_v86_not_allowed_in_long_mode() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        vmcs.set(VmcsField::GuestRflags, RFLAGS_FIXED1 | RFlags::VIRTUAL_8086_MODE.bits());
        for reg in SegReg::ALL {
            vmcs.set_guest_segment(reg, &Segment::v86(0));
        }

        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestRflagsVm));
    }

    #[test]
    fn test_unusable_data_segment_skips_attr_checks() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        vmcs.set_guest_segment(
            SegReg::Fs,
            &Segment {
                attr: SegAttr::UNUSABLE,
                ..Segment::default()
            },
        );
        assert_eq!(run_on(&vmcs, &platform), Ok(()));

        vmcs.set_guest_segment(
            SegReg::Fs,
            &Segment {
                attr: SegAttr(0x92),
                ..Segment::default()
            },
        );
        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestSegAttrTypeAcc(SegReg::Fs)));
    }

    #[test]
    fn test_granularity_must_match_limit() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        let mut ds = vmcs.guest_segment(SegReg::Ds);
        ds.limit = 0xffe;
        ds.attr.set_granularity(true);
        vmcs.set_guest_segment(SegReg::Ds, &ds);

        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestSegAttrGran(SegReg::Ds)));
    }

    #[test]
    fn test_tr_must_be_usable() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        let mut tr = vmcs.guest_tr();
        tr.attr.set_unusable(true);
        vmcs.set_guest_tr(&tr);

        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestTrAttrUnusable));
    }

    #[test]
    fn test_sti_blocking_needs_if() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        vmcs.set(VmcsField::GuestIntState, Interruptibility::BLOCK_STI.bits() as u64);
        vmcs.set(VmcsField::GuestRflags, RFLAGS_FIXED1);

        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestIntStateRflagsSti));
    }

    #[test]
    fn test_nmi_injection_under_sti_blocking() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        vmcs.set(VmcsField::GuestIntState, Interruptibility::BLOCK_STI.bits() as u64);
        vmcs.set(VmcsField::GuestRflags, RFLAGS_FIXED1 | RFlags::INTERRUPT_FLAG.bits());
        vmcs.set(VmcsField::EntryIntInfo, InterruptionInfo::new(2, IntType::Nmi, false).0 as u64);

        let diag = run_on(&vmcs, &platform).unwrap_err();
        assert_eq!(diag, EntryDiag::GuestIntStateNmi);
        assert_eq!(exit_qualification(diag), ENTRY_FAIL_QUAL_NMI_INJECT);
    }

    #[test]
    fn test_wait_for_sipi_rejects_injection() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        vmcs.set(VmcsField::GuestActivityState, ActivityState::WaitSipi as u64);
        vmcs.set(VmcsField::EntryIntInfo, InterruptionInfo::new(2, IntType::Nmi, false).0 as u64);

        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestActStateEvent));
    }

    #[test]
    fn test_pending_single_step_needs_bs() {
        let platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        vmcs.set(VmcsField::GuestIntState, Interruptibility::BLOCK_MOVSS.bits() as u64);
        vmcs.set(VmcsField::GuestRflags, RFLAGS_FIXED1 | RFlags::TRAP_FLAG.bits());

        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::GuestPndDbgXcptBsTf));

        vmcs.set(VmcsField::GuestPendingDbgXcpts, PENDING_DBG_BS);
        assert_eq!(run_on(&vmcs, &platform), Ok(()));
    }

    #[test]
    fn test_link_pointer() {
        let mut platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();

        vmcs.set(VmcsField::VmcsLinkPtr, VMCS_GPA);
        let diag = run_on(&vmcs, &platform).unwrap_err();
        assert_eq!(diag, EntryDiag::VmcsLinkPtrCurVmcs);
        assert_eq!(exit_qualification(diag), ENTRY_FAIL_QUAL_LINK_PTR);

        vmcs.set(VmcsField::VmcsLinkPtr, SHADOW_VMCS_GPA + 8);
        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::VmcsLinkPtrAlign));

        vmcs.set(VmcsField::VmcsLinkPtr, SHADOW_VMCS_GPA);
        platform.write_phys_u32(SHADOW_VMCS_GPA, 0xdead).unwrap();
        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::VmcsLinkPtrRevId));

        // A shadow VMCS without shadowing enabled.
        platform
            .write_phys_u32(SHADOW_VMCS_GPA, VMCS_REVISION_ID | VMCS_SHADOW_BIT)
            .unwrap();
        assert_eq!(run_on(&vmcs, &platform), Err(EntryDiag::VmcsLinkPtrShadow));

        platform.write_phys_u32(SHADOW_VMCS_GPA, VMCS_REVISION_ID).unwrap();
        assert_eq!(run_on(&vmcs, &platform), Ok(()));
    }

    #[test]
    fn test_pae_pdptes_from_guest_memory() {
        let mut platform = MockPlatform::new();
        let mut vmcs = test_utils::valid_vmcs();
        vmcs.set_entry_ctls(vmcs.entry_ctls() - EntryControls::IA32E_MODE_GUEST);
        vmcs.set(VmcsField::GuestEfer, 0);
        let mut cs = vmcs.guest_segment(SegReg::Cs);
        cs.attr.set_long(false);
        cs.attr.set_default_big(true);
        vmcs.set_guest_segment(SegReg::Cs, &cs);
        vmcs.set(VmcsField::GuestCr3, test_utils::PDPT_GPA);

        // Bit 1 is reserved in a present PDPTE.
        platform.write_phys_u64(test_utils::PDPT_GPA + 16, 0x10_0003).unwrap();
        let diag = run_on(&vmcs, &platform).unwrap_err();
        assert_eq!(diag, EntryDiag::GuestPdpte);
        assert_eq!(exit_qualification(diag), ENTRY_FAIL_QUAL_PDPTE);

        platform.write_phys_u64(test_utils::PDPT_GPA + 16, 0x10_0001).unwrap();
        assert_eq!(run_on(&vmcs, &platform), Ok(()));
    }
}
