//! VM-exits from the nested guest to the guest hypervisor.
//!
//! See `Chapter 28 VM Exits`.

use crate::{
    cpu::{gpr, ActivityState, CpuContext, Interruptibility, SegAttr, SegReg, Segment},
    platform::{MsrAccessError, Platform},
    utils::{
        msr::{is_msr_load_reserved, is_msr_store_reserved, EFER_LMA, EFER_LME},
        paging::is_pdpte_valid,
    },
    vmx::{
        data::auto_msr::{self, AutoMsr},
        diag::{ExitDiag, VmxDiag},
        error::{VmxAbort, VmxError, VmxResult, VmxStatus},
        events::{EventKind, ForceFlags, TrapEvent, X86_XCPT_DF},
        features::{CR0_PG, CR4_PAE, CR4_VMXE},
        instr::DecodedInstr,
        vcpu::Vcpu,
        vmcs::{
            controls::{EntryControls, ExitControls, PinControls, ProcControls2, AUTO_MSR_COUNT_MAX},
            field::VmcsField,
            info::{ApicAccessQual, ExitReasonField, IntType, InterruptionInfo, IoQual, MovCrQual, MovDrQual},
        },
        vmexit::{
            instr_info::{build_instr_info, instr_qualification},
            reason::VmExitReason,
        },
    },
};

pub mod instr_info;
pub mod reason;

/// Bits of RFLAGS that are always 1.
const RFLAGS_FIXED: u64 = 1 << 1;

/// Source of a task switch in the exit qualification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskSwitchSource {
    Call = 0,
    Iret = 1,
    Jmp = 2,
    IdtGate = 3,
}

impl Vcpu {
    /// Performs a VM-exit: records the exit information, saves the nested-guest state into the current
    /// VMCS and loads the host state of the guest hypervisor into `ctx`.
    ///
    /// Returns [`VmxError::Abort`] if the host state cannot be restored.
    pub fn vmexit(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, reason: VmExitReason, qual: u64,
    ) -> VmxResult<VmxStatus> {
        if self.data.in_vmexit || !self.data.in_non_root {
            log::warn!("VM-exit {:?} outside of non-root operation", reason);
            self.set_diag(VmxDiag::Exit(ExitDiag::Nested));
            return self.vmx_abort(platform, VmxAbort::CurrentVmcsCorrupt);
        }

        log::trace!("VM-exit: {:?}, qualification {:#x}", reason, qual);
        self.data.in_vmexit = true;

        let entry_failed = reason.is_entry_failure();
        self.record_exit_info(reason, qual);

        if !entry_failed {
            self.save_guest_state(ctx, platform, reason);

            if let Err(diag) = self.store_guest_msrs(platform) {
                self.set_diag(VmxDiag::Exit(diag));
                return self.vmx_abort(platform, VmxAbort::SaveGuestMsrs);
            }

            self.data.saved_nmi_blocked = None;
        } else if let Some(blocked) = self.data.saved_nmi_blocked.take() {
            ctx.nmi_blocked = blocked;
        }

        self.data.preempt_deadline = None;
        self.data.force_flags = ForceFlags::empty();
        self.data.pending_apic_write = None;
        self.data.apic_access_gpa = None;
        self.data.in_non_root = false;

        if let Err(abort) = self.load_host_state(ctx, platform) {
            return self.vmx_abort(platform, abort);
        }

        platform.paging_mode_changed(ctx);

        let flushed = self
            .data
            .vmcs
            .flush(platform)
            .and_then(|_| self.data.shadow_vmcs.flush(platform));
        if flushed.is_err() {
            self.set_diag(VmxDiag::Exit(ExitDiag::VmcsWritePhys));
            return self.vmx_abort(platform, VmxAbort::CurrentVmcsCorrupt);
        }

        self.data.in_vmexit = false;
        Ok(VmxStatus::VmExit)
    }

    fn record_exit_info(&mut self, reason: VmExitReason, qual: u64) {
        let inflight = self.data.inflight_event.take();
        let vmcs = self.vmcs_mut();

        vmcs.consume_entry_int_info();

        let mut exit_reason = ExitReasonField(0);
        exit_reason.set_basic(reason as u16);
        exit_reason.set_entry_failed(reason.is_entry_failure());
        vmcs.set(VmcsField::ExitReason, exit_reason.0 as u64);
        vmcs.set(VmcsField::ExitQualification, qual);

        // An event that was being delivered is reported unless the exit itself escalated it.
        let exit_int = InterruptionInfo(vmcs.get32(VmcsField::ExitIntInfo));
        let causes_df = exit_int.valid() && exit_int.int_type() == IntType::HwXcpt && exit_int.vector() == X86_XCPT_DF;

        if let Some(event) = inflight {
            if reason != VmExitReason::TripleFault && !reason.is_entry_failure() && !causes_df {
                vmcs.set(VmcsField::IdtVectoringInfo, event.to_int_info().0 as u64);
                vmcs.set(VmcsField::IdtVectoringErrorCode, event.error_code.unwrap_or_default() as u64);
            }
        }
    }

    /// See `28.3 Saving Guest State`.
    fn save_guest_state(&mut self, ctx: &CpuContext, platform: &dyn Platform, reason: VmExitReason) {
        let preempt_remaining = match reason {
            VmExitReason::PreemptTimer => 0,
            _ => self.preempt_timer_remaining(platform),
        };
        let ept = self.vmcs().proc_ctls2().contains(ProcControls2::EPT);
        let vmcs = self.vmcs_mut();
        let exit_ctls = vmcs.exit_ctls();

        let mut entry_ctls = vmcs.entry_ctls();
        entry_ctls.set(EntryControls::IA32E_MODE_GUEST, ctx.is_long_mode());
        vmcs.set_entry_ctls(entry_ctls);

        vmcs.set(VmcsField::GuestCr0, ctx.cr0);
        vmcs.set(VmcsField::GuestCr3, ctx.cr3);
        vmcs.set(VmcsField::GuestCr4, ctx.cr4);
        if exit_ctls.contains(ExitControls::SAVE_DEBUG) {
            vmcs.set(VmcsField::GuestDr7, ctx.dr7);
            vmcs.set(VmcsField::GuestDebugCtl, ctx.debugctl);
        }

        vmcs.set(VmcsField::GuestRsp, ctx.gpr(gpr::RSP));
        vmcs.set(VmcsField::GuestRip, ctx.rip);
        vmcs.set(VmcsField::GuestRflags, ctx.rflags);

        for reg in SegReg::ALL {
            vmcs.set_guest_segment(reg, ctx.seg(reg));
        }
        vmcs.set_guest_ldtr(&ctx.ldtr);
        vmcs.set_guest_tr(&ctx.tr);
        vmcs.set(VmcsField::GuestGdtrBase, ctx.gdtr.base);
        vmcs.set(VmcsField::GuestGdtrLimit, ctx.gdtr.limit as u64);
        vmcs.set(VmcsField::GuestIdtrBase, ctx.idtr.base);
        vmcs.set(VmcsField::GuestIdtrLimit, ctx.idtr.limit as u64);

        vmcs.set(VmcsField::GuestSysenterCs, ctx.sysenter_cs);
        vmcs.set(VmcsField::GuestSysenterEsp, ctx.sysenter_esp);
        vmcs.set(VmcsField::GuestSysenterEip, ctx.sysenter_eip);
        if exit_ctls.contains(ExitControls::SAVE_PAT) {
            vmcs.set(VmcsField::GuestPat, ctx.pat);
        }
        if exit_ctls.contains(ExitControls::SAVE_EFER) {
            vmcs.set(VmcsField::GuestEfer, ctx.efer);
        }

        let mut int_state = ctx.interrupt_shadow & (Interruptibility::BLOCK_STI | Interruptibility::BLOCK_MOVSS);
        int_state.set(Interruptibility::BLOCK_NMI, ctx.nmi_blocked);
        vmcs.set(VmcsField::GuestIntState, int_state.bits() as u64);
        vmcs.set(VmcsField::GuestActivityState, ctx.activity as u64);
        vmcs.set(VmcsField::GuestPendingDbgXcpts, ctx.pending_dbg);

        if exit_ctls.contains(ExitControls::SAVE_PREEMPT_TIMER) {
            vmcs.set(VmcsField::PreemptTimerValue, preempt_remaining);
        }

        let pae_paging = ctx.is_paging() && ctx.cr4 & CR4_PAE != 0 && !ctx.is_long_mode();
        if ept && pae_paging {
            vmcs.set_guest_pdptes(&ctx.pdptes);
        }
    }

    /// Stores guest MSRs into the VM-exit MSR-store area.
    ///
    /// See `28.4 Saving MSRs`.
    fn store_guest_msrs(&mut self, platform: &mut dyn Platform) -> Result<(), ExitDiag> {
        let count = self.vmcs().get32(VmcsField::ExitMsrStoreCount);
        if count == 0 {
            return Ok(());
        }
        if count > AUTO_MSR_COUNT_MAX {
            return Err(ExitDiag::MsrStoreCount);
        }

        let gpa = self.vmcs().get(VmcsField::ExitMsrStoreAddr);
        let area = auto_msr::read_area(platform, gpa, count).map_err(|_| ExitDiag::MsrStorePtrWritePhys)?;

        for (index, entry) in area.iter().enumerate() {
            if entry.reserved != 0 || is_msr_store_reserved(entry.msr) {
                log::debug!("Reserved MSR {:#x} in the VM-exit MSR-store area", entry.msr);
                return Err(ExitDiag::MsrStoreRsvd);
            }

            let value = platform.read_msr(entry.msr).map_err(|err| match err {
                MsrAccessError::Reserved => ExitDiag::MsrStore,
                MsrAccessError::NeedsHost => ExitDiag::MsrStoreRing3,
            })?;

            auto_msr::write_entry(platform, gpa, index, AutoMsr::new(entry.msr, value))
                .map_err(|_| ExitDiag::MsrStorePtrWritePhys)?;
        }

        Ok(())
    }

    /// See `28.5 Loading Host State`.
    fn load_host_state(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) -> Result<(), VmxAbort> {
        let vmcs = self.vmcs();
        let exit_ctls = vmcs.exit_ctls();
        let host_long_mode = exit_ctls.contains(ExitControls::HOST_ADDR_SPACE_SIZE);

        ctx.cr0 = vmcs.get(VmcsField::HostCr0);
        ctx.cr3 = vmcs.get(VmcsField::HostCr3);
        ctx.cr4 = vmcs.get(VmcsField::HostCr4) | CR4_VMXE;
        ctx.dr7 = 0x400;
        ctx.debugctl = 0;

        ctx.sysenter_cs = vmcs.get(VmcsField::HostSysenterCs);
        ctx.sysenter_esp = vmcs.get(VmcsField::HostSysenterEsp);
        ctx.sysenter_eip = vmcs.get(VmcsField::HostSysenterEip);

        if exit_ctls.contains(ExitControls::LOAD_EFER) {
            ctx.efer = vmcs.get(VmcsField::HostEfer);
        }
        if host_long_mode {
            ctx.efer |= EFER_LMA | EFER_LME;
        } else {
            ctx.efer &= !(EFER_LMA | EFER_LME);
        }
        if exit_ctls.contains(ExitControls::LOAD_PAT) {
            ctx.pat = vmcs.get(VmcsField::HostPat);
        }
        if exit_ctls.contains(ExitControls::LOAD_PERF_GLOBAL_CTRL) {
            ctx.perf_global_ctrl = vmcs.get(VmcsField::HostPerfGlobalCtrl);
        }

        for reg in SegReg::ALL {
            let selector = vmcs.get(VmcsField::host_selector(reg)) as u16;
            let base = match reg {
                SegReg::Fs => vmcs.get(VmcsField::HostFsBase),
                SegReg::Gs => vmcs.get(VmcsField::HostGsBase),
                _ => 0,
            };
            *ctx.seg_mut(reg) = host_segment(reg, selector, base, host_long_mode);
        }

        let mut tr_attr = SegAttr(0);
        tr_attr.set_seg_type(11);
        tr_attr.set_present(true);
        ctx.tr = Segment {
            selector: vmcs.get(VmcsField::HostTrSel) as u16,
            base: vmcs.get(VmcsField::HostTrBase),
            limit: 0x67,
            attr: tr_attr,
        };
        ctx.ldtr = Segment {
            attr: SegAttr::UNUSABLE,
            ..Segment::default()
        };
        ctx.gdtr.base = vmcs.get(VmcsField::HostGdtrBase);
        ctx.gdtr.limit = 0xffff;
        ctx.idtr.base = vmcs.get(VmcsField::HostIdtrBase);
        ctx.idtr.limit = 0xffff;

        ctx.rip = vmcs.get(VmcsField::HostRip);
        ctx.set_gpr(gpr::RSP, vmcs.get(VmcsField::HostRsp));
        ctx.rflags = RFLAGS_FIXED;

        ctx.interrupt_shadow = Interruptibility::empty();
        ctx.activity = ActivityState::Active;
        ctx.pending_dbg = 0;

        let pae_paging = ctx.cr0 & CR0_PG != 0 && ctx.cr4 & CR4_PAE != 0 && !host_long_mode;
        if pae_paging {
            self.load_host_pdptes(ctx, platform)?;
        }

        if let Err(diag) = self.load_host_msrs(platform) {
            self.set_diag(VmxDiag::Exit(diag));
            return Err(VmxAbort::LoadHostMsrs);
        }

        Ok(())
    }

    fn load_host_pdptes(&mut self, ctx: &mut CpuContext, platform: &dyn Platform) -> Result<(), VmxAbort> {
        let table = ctx.cr3 & 0xffff_ffe0;
        let width = self.features().phys_addr_width;

        for (i, pdpte) in ctx.pdptes.iter_mut().enumerate() {
            let value = platform.read_phys_u64(table + i as u64 * 8).unwrap_or(u64::MAX);
            if !is_pdpte_valid(value, width) {
                self.data.diag = VmxDiag::Exit(ExitDiag::HostPdpte);
                return Err(VmxAbort::HostPdpte);
            }
            *pdpte = value;
        }

        Ok(())
    }

    /// Loads host MSRs from the VM-exit MSR-load area. Already loaded MSRs stay loaded on failure.
    ///
    /// See `28.6 Loading MSRs`.
    fn load_host_msrs(&mut self, platform: &mut dyn Platform) -> Result<(), ExitDiag> {
        let count = self.vmcs().get32(VmcsField::ExitMsrLoadCount);
        if count == 0 {
            return Ok(());
        }
        if count > AUTO_MSR_COUNT_MAX {
            return Err(ExitDiag::MsrLoadCount);
        }

        let gpa = self.vmcs().get(VmcsField::ExitMsrLoadAddr);
        let area = auto_msr::read_area(platform, gpa, count).map_err(|_| ExitDiag::MsrLoadPtrReadPhys)?;

        for entry in area.iter() {
            if entry.reserved != 0 || is_msr_load_reserved(entry.msr) {
                log::debug!("Reserved MSR {:#x} in the VM-exit MSR-load area", entry.msr);
                return Err(ExitDiag::MsrLoadRsvd);
            }

            platform.write_msr(entry.msr, entry.value).map_err(|err| match err {
                MsrAccessError::Reserved => ExitDiag::MsrLoad,
                MsrAccessError::NeedsHost => ExitDiag::MsrLoadRing3,
            })?;
        }

        Ok(())
    }

    /// Records the abort indicator in the current VMCS and gives up on the guest hypervisor.
    ///
    /// See `28.7 VMX Aborts`.
    fn vmx_abort(&mut self, platform: &mut dyn Platform, abort: VmxAbort) -> VmxResult<VmxStatus> {
        log::warn!("VMX-abort: {}", abort);

        self.data.abort = abort;
        self.data.in_vmexit = false;
        self.data.in_non_root = false;
        self.data.force_flags = ForceFlags::empty();

        if self.data.vmcs.is_current() {
            self.vmcs_mut().set_abort_indicator(abort as u32);
            if let Err(err) = self.data.vmcs.flush(platform) {
                log::warn!("Failed to write the VMX-abort indicator: {}", err);
            }
        }

        Err(VmxError::Abort { reason: abort })
    }

    /// VM-exit for an instruction without instruction information (CPUID, HLT, RDTSC, ...).
    pub fn exit_instr(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, reason: VmExitReason, len: u8,
    ) -> VmxResult<VmxStatus> {
        self.exit_instr_with_qual(ctx, platform, reason, len, 0)
    }

    /// VM-exit for an instruction with an exit qualification (INVLPG, MOV CR, ...).
    pub fn exit_instr_with_qual(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, reason: VmExitReason, len: u8, qual: u64,
    ) -> VmxResult<VmxStatus> {
        self.complete_event_delivery();
        self.instr_vmexit(ctx, platform, reason, len, qual)
    }

    fn instr_vmexit(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, reason: VmExitReason, len: u8, qual: u64,
    ) -> VmxResult<VmxStatus> {
        if reason.has_instr_len() {
            self.vmcs_mut().set(VmcsField::ExitInstrLen, len as u64);
        }
        self.vmexit(ctx, platform, reason, qual)
    }

    /// VM-exit for an instruction with a ModR/M operand (VMX instructions, INVPCID, descriptor-table
    /// instructions).
    pub fn exit_instr_with_info(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, reason: VmExitReason,
        decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        self.complete_event_delivery();

        let info = build_instr_info(decoded);
        let vmcs = self.vmcs_mut();
        vmcs.set(VmcsField::ExitInstrInfo, info.0 as u64);
        vmcs.set(VmcsField::ExitInstrLen, decoded.len as u64);

        self.vmexit(ctx, platform, reason, instr_qualification(decoded))
    }

    /// VM-exit for an exception or NMI intercepted through the exception bitmap or NMI exiting.
    ///
    /// `qual` is the faulting address for #PF and the DR6 bits for #DB.
    pub fn exit_xcpt(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, event: &TrapEvent, qual: u64,
    ) -> VmxResult<VmxStatus> {
        let info = event.to_int_info();
        let is_nmi = info.int_type() == IntType::Nmi;
        let virt_nmi = self.vmcs().pin_ctls().contains(PinControls::VIRT_NMI);

        let vmcs = self.vmcs_mut();
        vmcs.set(VmcsField::ExitIntInfo, info.0 as u64);
        if info.error_code_valid() {
            vmcs.set(VmcsField::ExitIntErrorCode, event.error_code.unwrap_or_default() as u64);
        }
        if event.kind == EventKind::SoftwareInt {
            vmcs.set(VmcsField::ExitInstrLen, event.instr_len as u64);
        }

        let status = self.vmexit(ctx, platform, VmExitReason::ExceptionOrNmi, qual)?;
        if is_nmi && !virt_nmi {
            ctx.nmi_blocked = true;
        }

        Ok(status)
    }

    /// VM-exit for an external interrupt. The vector is reported if the interrupt is acknowledged on
    /// exit.
    pub fn exit_ext_int(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, vector: u8,
    ) -> VmxResult<VmxStatus> {
        if self.vmcs().exit_ctls().contains(ExitControls::ACK_EXT_INT) {
            let info = InterruptionInfo::new(vector, IntType::ExtInt, false);
            self.vmcs_mut().set(VmcsField::ExitIntInfo, info.0 as u64);
        }

        self.vmexit(ctx, platform, VmExitReason::ExtInt, 0)
    }

    pub fn exit_triple_fault(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::TripleFault, 0)
    }

    pub fn exit_init(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::InitSignal, 0)
    }

    /// The start-up IPI vector is the exit qualification.
    pub fn exit_sipi(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, vector: u8,
    ) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::Sipi, vector as u64)
    }

    pub fn exit_mtf(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::Mtf, 0)
    }

    pub fn exit_preempt_timer(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::PreemptTimer, 0)
    }

    pub fn exit_nmi_window(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::NmiWindow, 0)
    }

    pub fn exit_int_window(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::IntWindow, 0)
    }

    pub fn exit_tpr_below_threshold(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform,
    ) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::TprBelowThreshold, 0)
    }

    pub fn exit_apic_access(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, qual: ApicAccessQual,
    ) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::ApicAccess, qual.0)
    }

    /// The vector whose EOI was virtualized is the exit qualification.
    pub fn exit_virtualized_eoi(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, vector: u8,
    ) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::VirtualizedEoi, vector as u64)
    }

    /// The offset of the written APIC register is the exit qualification.
    pub fn exit_apic_write(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, offset: u16,
    ) -> VmxResult<VmxStatus> {
        self.vmexit(ctx, platform, VmExitReason::ApicWrite, offset as u64 & 0xfff)
    }

    pub fn exit_mov_cr(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, qual: MovCrQual, len: u8,
    ) -> VmxResult<VmxStatus> {
        self.exit_instr_with_qual(ctx, platform, VmExitReason::MovCr, len, qual.0)
    }

    pub fn exit_mov_dr(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, qual: MovDrQual, len: u8,
    ) -> VmxResult<VmxStatus> {
        self.exit_instr_with_qual(ctx, platform, VmExitReason::MovDr, len, qual.0)
    }

    /// VM-exit for IN/OUT/INS/OUTS. String instructions report the linear address of the memory operand.
    pub fn exit_io(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, qual: IoQual, len: u8,
        linear: Option<u64>,
    ) -> VmxResult<VmxStatus> {
        if let Some(addr) = linear {
            self.vmcs_mut().set(VmcsField::GuestLinearAddr, addr);
        }

        self.exit_instr_with_qual(ctx, platform, VmExitReason::IoInstr, len, qual.0)
    }

    /// VM-exit for a task switch to the TSS selected by `selector`. A switch through an IDT task gate
    /// happens while delivering an event, which is then reported as IDT-vectoring information.
    pub fn exit_task_switch(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, selector: u16, source: TaskSwitchSource,
        len: u8,
    ) -> VmxResult<VmxStatus> {
        if source != TaskSwitchSource::IdtGate {
            self.complete_event_delivery();
        }

        let qual = selector as u64 | (source as u64) << 30;
        self.instr_vmexit(ctx, platform, VmExitReason::TaskSwitch, len, qual)
    }

    /// Services the nested force flags after an instruction of the nested guest retired, in
    /// architectural priority order. Returns the VM-exit status if one happened.
    pub fn process_force_flags(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform,
    ) -> VmxResult<Option<VmxStatus>> {
        if !self.data.in_non_root {
            return Ok(None);
        }

        self.complete_event_delivery();

        if let Some(status) = self.process_pending_apic_write(ctx, platform)? {
            return Ok(Some(status));
        }

        let flags = self.data.force_flags;
        let blocked_by_shadow = !ctx.interrupt_shadow.is_empty();

        if flags.contains(ForceFlags::MTF) {
            return self.exit_mtf(ctx, platform).map(Some);
        }

        if flags.contains(ForceFlags::PREEMPT_TIMER) && self.preempt_timer_expired(platform) {
            return self.exit_preempt_timer(ctx, platform).map(Some);
        }

        if flags.contains(ForceFlags::NMI_WINDOW)
            && !ctx.nmi_blocked
            && !ctx.interrupt_shadow.contains(Interruptibility::BLOCK_MOVSS)
        {
            return self.exit_nmi_window(ctx, platform).map(Some);
        }

        if flags.contains(ForceFlags::INT_WINDOW) && ctx.interrupts_enabled() && !blocked_by_shadow {
            return self.exit_int_window(ctx, platform).map(Some);
        }

        self.deliver_virt_int(ctx, platform)?;
        Ok(None)
    }
}

/// A data or code segment as loaded from the host-state area.
fn host_segment(reg: SegReg, selector: u16, base: u64, host_long_mode: bool) -> Segment {
    let mut attr = SegAttr(0);
    attr.set_desc_type(true);
    attr.set_present(true);
    attr.set_granularity(true);

    match reg {
        SegReg::Cs => {
            attr.set_seg_type(11);
            attr.set_long(host_long_mode);
            attr.set_default_big(!host_long_mode);
        }
        _ => {
            attr.set_seg_type(3);
            attr.set_default_big(true);
            attr.set_unusable(selector == 0);
        }
    }

    Segment {
        selector,
        base,
        limit: 0xffff_ffff,
        attr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{self, GUEST_RIP, HOST_RIP, HOST_RSP},
        vmx::vmcs::info::ENTRY_FAIL_QUAL_NONE,
    };
    use x86_64::registers::rflags::RFlags;

    #[test]
    fn test_exit_loads_host_state() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        ctx.rip = GUEST_RIP + 0x10;

        let status = vcpu.exit_instr(&mut ctx, &mut platform, VmExitReason::Cpuid, 2).unwrap();

        assert_eq!(status, VmxStatus::VmExit);
        assert!(vcpu.in_vmx_root());
        assert_eq!(ctx.rip, HOST_RIP);
        assert_eq!(ctx.gpr(gpr::RSP), HOST_RSP);
        assert_eq!(ctx.rflags, RFLAGS_FIXED);
        assert!(ctx.seg(SegReg::Cs).attr.long());

        let vmcs = vcpu.vmcs();
        assert_eq!(vmcs.get(VmcsField::ExitReason), VmExitReason::Cpuid as u64);
        assert_eq!(vmcs.get(VmcsField::ExitInstrLen), 2);
        assert_eq!(vmcs.get(VmcsField::GuestRip), GUEST_RIP + 0x10);
        assert_eq!(vcpu.force_flags(), ForceFlags::empty());
        assert_eq!(platform.paging_changes, 1);
    }

    #[test]
    fn test_exit_clears_entry_int_info_valid_bit() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        let info = InterruptionInfo::new(0x30, IntType::ExtInt, false);
        vcpu.vmcs_mut().set(VmcsField::EntryIntInfo, info.0 as u64);

        vcpu.exit_triple_fault(&mut ctx, &mut platform).unwrap();
        assert!(!vcpu.vmcs().entry_int_info().valid());
    }

    #[test]
    fn test_entry_failure_sets_bit_31_and_restores_nmi_blocking() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        vcpu.data.saved_nmi_blocked = Some(true);
        ctx.nmi_blocked = false;

        vcpu.vmexit(&mut ctx, &mut platform, VmExitReason::ErrInvalidGuestState, ENTRY_FAIL_QUAL_NONE)
            .unwrap();

        let reason = ExitReasonField(vcpu.vmcs().get32(VmcsField::ExitReason));
        assert!(reason.entry_failed());
        assert_eq!(reason.basic(), VmExitReason::ErrInvalidGuestState as u16);
        assert!(ctx.nmi_blocked);
        assert_eq!(vcpu.data.saved_nmi_blocked, None);
    }

    #[test]
    fn test_inflight_event_becomes_idt_vectoring_info() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        vcpu.data.inflight_event = Some(TrapEvent::xcpt(14, Some(2)));

        vcpu.exit_xcpt(&mut ctx, &mut platform, &TrapEvent::gp(), 0).unwrap();

        let idt = InterruptionInfo(vcpu.vmcs().get32(VmcsField::IdtVectoringInfo));
        assert!(idt.valid());
        assert_eq!(idt.vector(), 14);
        assert_eq!(vcpu.vmcs().get(VmcsField::IdtVectoringErrorCode), 2);

        let exit = InterruptionInfo(vcpu.vmcs().get32(VmcsField::ExitIntInfo));
        assert_eq!(exit.vector(), 13);
        assert!(exit.error_code_valid());
    }

    #[test]
    fn test_msr_load_failure_aborts() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        let area = test_utils::MSR_AREA_GPA;
        auto_msr::write_entry(&mut platform, area, 0, AutoMsr::new(crate::utils::msr::IA32_FS_BASE, 0)).unwrap();
        vcpu.vmcs_mut().set(VmcsField::ExitMsrLoadAddr, area);
        vcpu.vmcs_mut().set(VmcsField::ExitMsrLoadCount, 1);

        let result = vcpu.exit_instr(&mut ctx, &mut platform, VmExitReason::Hlt, 1);

        assert_eq!(
            result,
            Err(VmxError::Abort {
                reason: VmxAbort::LoadHostMsrs
            })
        );
        assert_eq!(vcpu.diag(), VmxDiag::Exit(ExitDiag::MsrLoadRsvd));
        assert_eq!(vcpu.vmcs().abort_indicator(), VmxAbort::LoadHostMsrs as u32);
        assert!(!vcpu.in_vmx_non_root());
    }

    #[test]
    fn test_msr_store_saves_guest_values() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        let area = test_utils::MSR_AREA_GPA;
        platform.msrs.insert(0xc000_0102, 0x1234);
        auto_msr::write_entry(&mut platform, area, 0, AutoMsr::new(0xc000_0102, 0)).unwrap();
        vcpu.vmcs_mut().set(VmcsField::ExitMsrStoreAddr, area);
        vcpu.vmcs_mut().set(VmcsField::ExitMsrStoreCount, 1);

        vcpu.exit_instr(&mut ctx, &mut platform, VmExitReason::Hlt, 1).unwrap();

        let stored = auto_msr::read_area(&platform, area, 1).unwrap();
        assert_eq!(stored[0].value, 0x1234);
    }

    #[test]
    fn test_exit_outside_non_root_aborts() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_with_vmcs();
        let result = vcpu.exit_mtf(&mut ctx, &mut platform);
        assert!(matches!(result, Err(VmxError::Abort { .. })));
    }

    #[test]
    fn test_force_flag_priority() {
        let (mut vcpu, mut ctx, mut platform) = test_utils::vcpu_in_non_root();
        vcpu.data.force_flags = ForceFlags::MTF | ForceFlags::INT_WINDOW;
        ctx.rflags |= RFlags::INTERRUPT_FLAG.bits();

        let status = vcpu.process_force_flags(&mut ctx, &mut platform).unwrap();
        assert_eq!(status, Some(VmxStatus::VmExit));
        assert_eq!(vcpu.vmcs().get(VmcsField::ExitReason), VmExitReason::Mtf as u64);
    }
}
