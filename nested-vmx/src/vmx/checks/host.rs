//! Checks on the host-state area.
//!
//! See `27.2.2 Checks on Host Control Registers, MSRs, and SSP` and `27.2.3 Checks on Host Segment
//! and Descriptor-Table Registers`.

use crate::{
    cpu::SegReg,
    utils::{
        msr::{is_pat_valid, EFER_LMA, EFER_LME, EFER_VALID_MASK},
        paging::{fits_phys_width, is_canonical},
    },
    vmx::{
        checks::{check, Check, EntryCtx},
        diag::EntryDiag,
        features::{CR0_FIXED1, CR4_FIXED0, CR4_PAE, CR4_PCIDE},
        vmcs::{
            controls::{EntryControls, ExitControls},
            field::VmcsField,
        },
    },
};

/// Selector RPL and TI bits.
const SEL_RPL_TI: u64 = 0b111;

fn host_64bit(ctx: &EntryCtx<'_>) -> bool {
    ctx.exit().contains(ExitControls::HOST_ADDR_SPACE_SIZE)
}

static CR_MSR_CHECKS: &[Check] = &[
    check!(EntryDiag::HostCr0Fixed0, |ctx| {
        let fixed0 = ctx.features.cr0_fixed0(false);
        ctx.get(VmcsField::HostCr0) & fixed0 == fixed0
    }),
    check!(EntryDiag::HostCr0Fixed1, |ctx| ctx.get(VmcsField::HostCr0) & !CR0_FIXED1 == 0),
    check!(EntryDiag::HostCr4Fixed0, |ctx| ctx.get(VmcsField::HostCr4) & CR4_FIXED0 == CR4_FIXED0),
    check!(EntryDiag::HostCr4Fixed1, |ctx| ctx.get(VmcsField::HostCr4)
        & !ctx.features.cr4_fixed1()
        == 0),
    check!(EntryDiag::HostCr3, |ctx| fits_phys_width(
        ctx.get(VmcsField::HostCr3),
        ctx.features.phys_addr_width
    )),
    check!(EntryDiag::HostSysenterEspEip, |ctx| is_canonical(ctx.get(VmcsField::HostSysenterEsp))
        && is_canonical(ctx.get(VmcsField::HostSysenterEip))),
    check!(EntryDiag::HostPatMsr, |ctx| !ctx.exit().contains(ExitControls::LOAD_PAT)
        || is_pat_valid(ctx.get(VmcsField::HostPat))),
    check!(EntryDiag::HostEferMsrRsvd, |ctx| !ctx.exit().contains(ExitControls::LOAD_EFER)
        || ctx.get(VmcsField::HostEfer) & !EFER_VALID_MASK == 0),
    check!(EntryDiag::HostEferMsr, |ctx| {
        if !ctx.exit().contains(ExitControls::LOAD_EFER) {
            return true;
        }

        let efer = ctx.get(VmcsField::HostEfer);
        let long = host_64bit(ctx);
        (efer & EFER_LMA != 0) == long && (efer & EFER_LME != 0) == long
    }),
];

static SEGMENT_CHECKS: &[Check] = &[
    check!(EntryDiag::HostTrSel, |ctx| ctx.get(VmcsField::HostTrSel) & SEL_RPL_TI == 0),
    check!(EntryDiag::HostCsTr, |ctx| ctx.get(VmcsField::HostCsSel) != 0
        && ctx.get(VmcsField::HostTrSel) != 0),
    check!(EntryDiag::HostSs, |ctx| host_64bit(ctx) || ctx.get(VmcsField::HostSsSel) != 0),
    check!(EntryDiag::HostTrBase, |ctx| is_canonical(ctx.get(VmcsField::HostTrBase))),
    check!(EntryDiag::HostGdtrIdtrBase, |ctx| is_canonical(ctx.get(VmcsField::HostGdtrBase))
        && is_canonical(ctx.get(VmcsField::HostIdtrBase))),
];

static ADDR_SPACE_CHECKS: &[Check] = &[
    check!(EntryDiag::HostGuestLongMode, |ctx| ctx.host_long_mode
        || !(host_64bit(ctx) || ctx.entry().contains(EntryControls::IA32E_MODE_GUEST))),
    check!(EntryDiag::HostLongMode, |ctx| !ctx.host_long_mode || host_64bit(ctx)),
    check!(EntryDiag::HostCr4Pae, |ctx| !host_64bit(ctx) || ctx.get(VmcsField::HostCr4) & CR4_PAE != 0),
    check!(EntryDiag::HostCr4Pcide, |ctx| host_64bit(ctx) || ctx.get(VmcsField::HostCr4) & CR4_PCIDE == 0),
    check!(EntryDiag::HostRip, |ctx| {
        let rip = ctx.get(VmcsField::HostRip);
        if host_64bit(ctx) {
            is_canonical(rip)
        } else {
            rip >> 32 == 0
        }
    }),
];

/// Runs the host-state checks.
pub fn check_host(ctx: &EntryCtx<'_>) -> Result<(), EntryDiag> {
    super::run(ctx, CR_MSR_CHECKS)?;

    for reg in SegReg::ALL {
        if ctx.get(VmcsField::host_selector(reg)) & SEL_RPL_TI != 0 {
            return Err(EntryDiag::HostSel(reg));
        }
    }
    super::run(ctx, SEGMENT_CHECKS)?;

    for (reg, base) in [(SegReg::Fs, VmcsField::HostFsBase), (SegReg::Gs, VmcsField::HostGsBase)] {
        if !is_canonical(ctx.get(base)) {
            return Err(EntryDiag::HostSegBase(reg));
        }
    }

    super::run(ctx, ADDR_SPACE_CHECKS)
}
