//! Checks on the VM-execution, VM-exit and VM-entry control fields.
//!
//! See `27.2.1 Checks on VMX Controls`.

use crate::{
    utils::paging::fits_phys_width,
    vmx::{
        apic::offsets::XAPIC_OFF_TPR,
        checks::{check, is_msr_area_valid, Check, EntryCtx},
        diag::EntryDiag,
        events::xcpt_has_error_code,
        features::{CtlsMsr, VmxFeatures, CR0_PE},
        vmcs::{
            controls::{
                EntryControls, ExitControls, PinControls, ProcControls, ProcControls2, AUTO_MSR_COUNT_MAX,
                CR3_TARGET_COUNT, TPR_THRESHOLD_MASK,
            },
            field::VmcsField,
            info::{EptPointer, IntType, InterruptionInfo},
        },
    },
};

/// Page-walk length of the only supported EPT paging structure (4 levels).
const EPT_WALK_LENGTH_MINUS_ONE: u8 = 3;

/// Validates an EPT pointer against the EPT capabilities.
///
/// Also used by single-context INVEPT.
pub fn check_eptp(features: &VmxFeatures, eptp: u64) -> Result<(), EntryDiag> {
    let ptr = EptPointer(eptp);

    if !features.is_ept_memtype_supported(ptr.memory_type()) {
        return Err(EntryDiag::EptpMemType);
    }
    if ptr.walk_length_minus_one() != EPT_WALK_LENGTH_MINUS_ONE {
        return Err(EntryDiag::EptpPageWalkLength);
    }
    if ptr.access_dirty() && !features.ept_access_dirty {
        return Err(EntryDiag::EptpAccessDirty);
    }
    if ptr.supervisor_shadow_stack() || ptr.reserved_low() != 0 || !fits_phys_width(eptp, features.phys_addr_width) {
        return Err(EntryDiag::EptpRsvd);
    }

    Ok(())
}

fn ctls_allowed0(msr: CtlsMsr, value: u32) -> bool {
    value & msr.allowed0 == msr.allowed0
}

fn ctls_allowed1(msr: CtlsMsr, value: u32) -> bool {
    value & !msr.allowed1 == 0
}

/// The raw secondary controls, zero unless activated.
fn proc2_raw(ctx: &EntryCtx<'_>) -> u32 {
    if ctx.proc().contains(ProcControls::SECONDARY_CONTROLS) {
        ctx.vmcs.get32(VmcsField::ProcControls2)
    } else {
        0
    }
}

fn tpr_shadow(ctx: &EntryCtx<'_>) -> bool {
    ctx.proc().contains(ProcControls::USE_TPR_SHADOW)
}

fn vtpr(ctx: &EntryCtx<'_>) -> Option<u32> {
    let addr = ctx.get(VmcsField::VirtApicAddr);
    ctx.platform.read_phys_u32(addr + XAPIC_OFF_TPR as u64).ok()
}

fn entry_int_info(ctx: &EntryCtx<'_>) -> InterruptionInfo {
    ctx.vmcs.entry_int_info()
}

/// Whether the event type/vector combination of a valid entry-interruption field is allowed.
fn is_entry_event_valid(ctx: &EntryCtx<'_>, info: InterruptionInfo) -> bool {
    match info.int_type() {
        IntType::Reserved => false,
        IntType::Nmi => info.vector() == 2,
        IntType::HwXcpt => info.vector() <= 31,
        IntType::Other => info.vector() == 0 && ctx.features.mtf,
        IntType::ExtInt | IntType::SwInt | IntType::PrivSwXcpt | IntType::SwXcpt => true,
    }
}

/// The error-code bit must be set exactly for hardware exceptions that push one, and only in
/// protected mode.
fn needs_error_code(ctx: &EntryCtx<'_>, info: InterruptionInfo) -> bool {
    let protected = ctx.get(VmcsField::GuestCr0) & CR0_PE != 0;
    protected && info.int_type() == IntType::HwXcpt && xcpt_has_error_code(info.vector())
}

pub static CONTROL_CHECKS: &[Check] = &[
    // Capability MSRs.
    check!(EntryDiag::PinCtlsDisallowed0, |ctx| ctls_allowed0(
        ctx.features.true_pin_ctls(),
        ctx.vmcs.get32(VmcsField::PinControls)
    )),
    check!(EntryDiag::PinCtlsAllowed1, |ctx| ctls_allowed1(
        ctx.features.true_pin_ctls(),
        ctx.vmcs.get32(VmcsField::PinControls)
    )),
    check!(EntryDiag::ProcCtlsDisallowed0, |ctx| ctls_allowed0(
        ctx.features.true_proc_ctls(),
        ctx.vmcs.get32(VmcsField::ProcControls)
    )),
    check!(EntryDiag::ProcCtlsAllowed1, |ctx| ctls_allowed1(
        ctx.features.true_proc_ctls(),
        ctx.vmcs.get32(VmcsField::ProcControls)
    )),
    check!(EntryDiag::ProcCtls2Disallowed0, |ctx| ctls_allowed0(
        ctx.features.proc_ctls2(),
        proc2_raw(ctx)
    )),
    check!(EntryDiag::ProcCtls2Allowed1, |ctx| ctls_allowed1(
        ctx.features.proc_ctls2(),
        proc2_raw(ctx)
    )),
    check!(EntryDiag::ExitCtlsDisallowed0, |ctx| ctls_allowed0(
        ctx.features.true_exit_ctls(),
        ctx.vmcs.get32(VmcsField::ExitControls)
    )),
    check!(EntryDiag::ExitCtlsAllowed1, |ctx| ctls_allowed1(
        ctx.features.true_exit_ctls(),
        ctx.vmcs.get32(VmcsField::ExitControls)
    )),
    check!(EntryDiag::EntryCtlsDisallowed0, |ctx| ctls_allowed0(
        ctx.features.true_entry_ctls(),
        ctx.vmcs.get32(VmcsField::EntryControls)
    )),
    check!(EntryDiag::EntryCtlsAllowed1, |ctx| ctls_allowed1(
        ctx.features.true_entry_ctls(),
        ctx.vmcs.get32(VmcsField::EntryControls)
    )),
    check!(EntryDiag::Cr3TargetCount, |ctx| ctx.get(VmcsField::Cr3TargetCount)
        <= CR3_TARGET_COUNT as u64),
    // Bitmaps.
    check!(EntryDiag::AddrIoBitmapA, |ctx| !ctx.proc().contains(ProcControls::USE_IO_BITMAPS)
        || ctx.is_valid_page(ctx.get(VmcsField::IoBitmapA))),
    check!(EntryDiag::AddrIoBitmapB, |ctx| !ctx.proc().contains(ProcControls::USE_IO_BITMAPS)
        || ctx.is_valid_page(ctx.get(VmcsField::IoBitmapB))),
    check!(EntryDiag::AddrMsrBitmap, |ctx| !ctx.proc().contains(ProcControls::USE_MSR_BITMAPS)
        || ctx.is_valid_page(ctx.get(VmcsField::MsrBitmap))),
    // TPR shadow.
    check!(EntryDiag::AddrVirtApicPage, |ctx| !tpr_shadow(ctx)
        || ctx.is_valid_page(ctx.get(VmcsField::VirtApicAddr))),
    check!(EntryDiag::VirtApicPagePtrReadPhys, |ctx| !tpr_shadow(ctx) || vtpr(ctx).is_some()),
    check!(EntryDiag::TprThresholdRsvd, |ctx| !tpr_shadow(ctx)
        || ctx.proc2().contains(ProcControls2::VIRT_INT_DELIVERY)
        || ctx.vmcs.get32(VmcsField::TprThreshold) & !TPR_THRESHOLD_MASK == 0),
    check!(EntryDiag::TprThresholdVTpr, |ctx| {
        let proc2 = ctx.proc2();
        if !tpr_shadow(ctx)
            || proc2.intersects(ProcControls2::VIRT_INT_DELIVERY | ProcControls2::VIRT_APIC_ACCESS)
        {
            return true;
        }

        let threshold = ctx.vmcs.get32(VmcsField::TprThreshold) & TPR_THRESHOLD_MASK;
        vtpr(ctx).map_or(false, |vtpr| threshold <= (vtpr >> 4) & 0xf)
    }),
    check!(EntryDiag::VirtX2ApicTprShadow, |ctx| tpr_shadow(ctx)
        || !ctx.proc2().contains(ProcControls2::VIRT_X2APIC_MODE)),
    check!(EntryDiag::ApicRegVirt, |ctx| tpr_shadow(ctx)
        || !ctx.proc2().contains(ProcControls2::APIC_REG_VIRT)),
    check!(EntryDiag::VirtIntDelivery, |ctx| tpr_shadow(ctx)
        || !ctx.proc2().contains(ProcControls2::VIRT_INT_DELIVERY)),
    // NMIs.
    check!(EntryDiag::VirtNmi, |ctx| !ctx.pin().contains(PinControls::VIRT_NMI)
        || ctx.pin().contains(PinControls::NMI_EXIT)),
    check!(EntryDiag::VirtNmiWindowExit, |ctx| !ctx.proc().contains(ProcControls::NMI_WINDOW_EXIT)
        || ctx.pin().contains(PinControls::VIRT_NMI)),
    // APIC virtualization.
    check!(EntryDiag::AddrApicAccess, |ctx| !ctx.proc2().contains(ProcControls2::VIRT_APIC_ACCESS)
        || ctx.is_valid_page(ctx.get(VmcsField::ApicAccessAddr))),
    check!(EntryDiag::AddrApicAccessEqVirtApic, |ctx| {
        !ctx.proc2().contains(ProcControls2::VIRT_APIC_ACCESS)
            || !tpr_shadow(ctx)
            || ctx.get(VmcsField::ApicAccessAddr) != ctx.get(VmcsField::VirtApicAddr)
    }),
    check!(EntryDiag::VirtX2ApicVirtApic, |ctx| !ctx
        .proc2()
        .contains(ProcControls2::VIRT_X2APIC_MODE | ProcControls2::VIRT_APIC_ACCESS)),
    check!(EntryDiag::VirtIntDeliveryExtInt, |ctx| !ctx.proc2().contains(ProcControls2::VIRT_INT_DELIVERY)
        || ctx.pin().contains(PinControls::EXT_INT_EXIT)),
    // VPID and EPT.
    check!(EntryDiag::Vpid, |ctx| !ctx.proc2().contains(ProcControls2::VPID)
        || ctx.get(VmcsField::Vpid) != 0),
    check!(EntryDiag::EptpRsvd, |ctx| !ctx.proc2().contains(ProcControls2::EPT)
        || check_eptp(ctx.features, ctx.get(VmcsField::EptPointer)).is_ok()),
    check!(EntryDiag::UnrestrictedGuestEpt, |ctx| !ctx
        .proc2()
        .contains(ProcControls2::UNRESTRICTED_GUEST)
        || ctx.proc2().contains(ProcControls2::EPT)),
    // VMCS shadowing.
    check!(EntryDiag::AddrVmreadBitmap, |ctx| !ctx.proc2().contains(ProcControls2::VMCS_SHADOWING)
        || ctx.is_valid_page(ctx.get(VmcsField::VmreadBitmapAddr))),
    check!(EntryDiag::AddrVmwriteBitmap, |ctx| !ctx.proc2().contains(ProcControls2::VMCS_SHADOWING)
        || ctx.is_valid_page(ctx.get(VmcsField::VmwriteBitmapAddr))),
    // VM-exit controls.
    check!(EntryDiag::SavePreemptTimer, |ctx| !ctx.exit().contains(ExitControls::SAVE_PREEMPT_TIMER)
        || ctx.pin().contains(PinControls::PREEMPT_TIMER)),
    check!(EntryDiag::ExitMsrStoreCount, |ctx| ctx.vmcs.get32(VmcsField::ExitMsrStoreCount)
        <= AUTO_MSR_COUNT_MAX),
    check!(EntryDiag::AddrExitMsrStore, |ctx| is_msr_area_valid(
        ctx,
        ctx.get(VmcsField::ExitMsrStoreAddr),
        ctx.vmcs.get32(VmcsField::ExitMsrStoreCount)
    )),
    check!(EntryDiag::ExitMsrLoadCount, |ctx| ctx.vmcs.get32(VmcsField::ExitMsrLoadCount)
        <= AUTO_MSR_COUNT_MAX),
    check!(EntryDiag::AddrExitMsrLoad, |ctx| is_msr_area_valid(
        ctx,
        ctx.get(VmcsField::ExitMsrLoadAddr),
        ctx.vmcs.get32(VmcsField::ExitMsrLoadCount)
    )),
    // VM-entry controls.
    check!(EntryDiag::EntrySmm, |ctx| !ctx
        .entry()
        .intersects(EntryControls::ENTRY_TO_SMM | EntryControls::DEACTIVATE_DUAL_MONITOR)),
    check!(EntryDiag::EntryIntInfoTypeVecRsvd, |ctx| {
        let info = entry_int_info(ctx);
        !info.valid() || (info.0 & InterruptionInfo::ENTRY_RSVD_MASK == 0 && is_entry_event_valid(ctx, info))
    }),
    check!(EntryDiag::EntryIntInfoErrCodePe, |ctx| {
        let info = entry_int_info(ctx);
        !info.valid() || !info.error_code_valid() || ctx.get(VmcsField::GuestCr0) & CR0_PE != 0
    }),
    check!(EntryDiag::EntryIntInfoErrCodeVec, |ctx| {
        let info = entry_int_info(ctx);
        !info.valid() || info.error_code_valid() == needs_error_code(ctx, info)
    }),
    check!(EntryDiag::EntryXcptErrCodeRsvd, |ctx| {
        let info = entry_int_info(ctx);
        !info.valid() || !info.error_code_valid() || ctx.get(VmcsField::EntryExceptionErrorCode) >> 16 == 0
    }),
    check!(EntryDiag::EntryInstrLen, |ctx| {
        let info = entry_int_info(ctx);
        let len = ctx.get(VmcsField::EntryInstrLen);
        !info.valid() || !info.int_type().is_software() || (1..=15).contains(&len)
    }),
    check!(EntryDiag::EntryMsrLoadCount, |ctx| ctx.vmcs.get32(VmcsField::EntryMsrLoadCount)
        <= AUTO_MSR_COUNT_MAX),
    check!(EntryDiag::AddrEntryMsrLoad, |ctx| is_msr_area_valid(
        ctx,
        ctx.get(VmcsField::EntryMsrLoadAddr),
        ctx.vmcs.get32(VmcsField::EntryMsrLoadCount)
    )),
];

/// Runs the control-field checks. The EPT pointer reports the precise reason it is invalid.
pub fn check_controls(ctx: &EntryCtx<'_>) -> Result<(), EntryDiag> {
    super::run(ctx, CONTROL_CHECKS).map_err(|diag| match diag {
        EntryDiag::EptpRsvd => check_eptp(ctx.features, ctx.get(VmcsField::EptPointer)).err().unwrap_or(diag),
        diag => diag,
    })
}
