//! VM-entries from the guest hypervisor into the nested guest.
//!
//! See `Chapter 27 VM Entries`.

use crate::{
    cpu::{gpr, ActivityState, CpuContext, Interruptibility, SegReg},
    platform::{MsrAccessError, Platform},
    utils::{
        msr::{is_msr_load_reserved, EFER_LMA, EFER_LME},
        paging::PAGE_OFFSET_MASK,
    },
    vmx::{
        checks::{
            controls::check_controls,
            guest::{check_guest, exit_qualification, VMCS_LINK_PTR_NONE},
            host::check_host,
            EntryCtx,
        },
        data::auto_msr,
        diag::{EntryDiag, InstrDiag, VmxDiag, VmxInstr},
        error::{VmInstrError, VmxResult, VmxStatus},
        events::{ForceFlags, TrapEvent},
        features::{CR0_PG, CR4_PAE},
        instr::DecodedInstr,
        vcpu::Vcpu,
        vmcs::{
            controls::{EntryControls, PinControls, ProcControls, ProcControls2},
            field::VmcsField,
            LaunchState,
        },
        vmexit::reason::VmExitReason,
    },
};

/// DR6 bits of a pending debug exception that trigger a #DB: B3:B0 and BS.
const PENDING_DBG_TRIGGER_MASK: u64 = 0xf | 1 << 14;

/// PDPTE base in CR3 with PAE paging.
const CR3_PAE_MASK: u64 = 0xffff_ffe0;

impl Vcpu {
    /// See `31.3 VMX Instructions > VMLAUNCH/VMRESUME`.
    pub fn vmlaunch(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        self.vmentry(ctx, platform, decoded, true)
    }

    /// See `31.3 VMX Instructions > VMLAUNCH/VMRESUME`.
    pub fn vmresume(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr,
    ) -> VmxResult<VmxStatus> {
        self.vmentry(ctx, platform, decoded, false)
    }

    /// Reports the event whose delivery is in progress, so that a VM-exit during its delivery records
    /// it as IDT-vectoring information.
    ///
    /// The event stays in flight until [`Vcpu::complete_event_delivery`] is called, or until the nested
    /// guest retires an instruction: instruction VM-exits and [`Vcpu::process_force_flags`] complete the
    /// delivery themselves. A VM-exit consumes the event either way.
    pub fn set_inflight_event(&mut self, event: Option<TrapEvent>) {
        self.data.inflight_event = event;
    }

    /// Called once the injection sink has delivered the in-flight event, so later VM-exits do not report
    /// it as IDT-vectoring information.
    pub fn complete_event_delivery(&mut self) {
        if let Some(event) = self.data.inflight_event.take() {
            log::trace!("Delivered {:?}", event);
        }
    }

    fn vmentry(
        &mut self, ctx: &mut CpuContext, platform: &mut dyn Platform, decoded: &DecodedInstr, launch: bool,
    ) -> VmxResult<VmxStatus> {
        let (instr, reason) = match launch {
            true => (VmxInstr::Vmlaunch, VmExitReason::Vmlaunch),
            false => (VmxInstr::Vmresume, VmExitReason::Vmresume),
        };

        if let Some(status) = self.vmx_instr_checks(ctx, platform, instr, decoded, reason)? {
            return Ok(status);
        }

        let Some(vmcs_ptr) = self.data.vmcs.gpa() else {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::PtrInvalid,
            });
            return Ok(self.vmfail_invalid(ctx, decoded.len));
        };
        if self.vmcs().is_shadow() {
            self.set_diag(VmxDiag::Instr {
                instr,
                cause: InstrDiag::ShadowVmcs,
            });
            return Ok(self.vmfail_invalid(ctx, decoded.len));
        }

        if ctx.interrupt_shadow.contains(Interruptibility::BLOCK_MOVSS) {
            return Ok(self.vmfail_diag(
                ctx,
                instr,
                decoded.len,
                InstrDiag::BlockMovSs,
                VmInstrError::EntryMovSsBlocking,
            ));
        }

        if launch && !self.vmcs().is_launch_state(LaunchState::Clear) {
            return Ok(self.vmfail_diag(
                ctx,
                instr,
                decoded.len,
                InstrDiag::VmcsClear,
                VmInstrError::VmlaunchNonClearVmcs,
            ));
        }
        if !launch && !self.vmcs().is_launch_state(LaunchState::Launched) {
            return Ok(self.vmfail_diag(
                ctx,
                instr,
                decoded.len,
                InstrDiag::VmcsLaunch,
                VmInstrError::VmresumeNonLaunchedVmcs,
            ));
        }

        let checked = {
            let entry_ctx = EntryCtx {
                vmcs: self.vmcs(),
                features: self.features(),
                platform: &*platform,
                vmcs_ptr,
                host_long_mode: ctx.is_long_mode(),
            };
            check_controls(&entry_ctx)
                .map_err(|diag| (diag, VmInstrError::EntryInvalidControls))
                .and_then(|_| check_host(&entry_ctx).map_err(|diag| (diag, VmInstrError::EntryInvalidHostState)))
        };
        if let Err((diag, error)) = checked {
            self.set_diag(VmxDiag::Entry(diag));
            return Ok(self.vmfail(ctx, decoded.len, error));
        }

        log::trace!("{} of the VMCS at {:#x}", instr.mnemonic(), vmcs_ptr);

        self.vmcs_mut().clear_exit_info();
        self.data.saved_nmi_blocked = Some(ctx.nmi_blocked);

        let guest = {
            let entry_ctx = EntryCtx {
                vmcs: self.vmcs(),
                features: self.features(),
                platform: &*platform,
                vmcs_ptr,
                host_long_mode: ctx.is_long_mode(),
            };
            check_guest(&entry_ctx)
        };

        // From here on, failures are reported through a VM-exit to the guest hypervisor.
        self.data.in_non_root = true;

        if let Err(diag) = guest {
            self.set_diag(VmxDiag::Entry(diag));
            return self.vmexit(ctx, platform, VmExitReason::ErrInvalidGuestState, exit_qualification(diag));
        }

        if let Err(diag) = self.load_guest_state(ctx, platform) {
            self.set_diag(VmxDiag::Entry(diag));
            return self.vmexit(ctx, platform, VmExitReason::ErrInvalidGuestState, exit_qualification(diag));
        }

        if let Err(diag) = self.load_vmcs_structures(platform) {
            self.set_diag(VmxDiag::Entry(diag));
            return self.vmexit(ctx, platform, VmExitReason::ErrInvalidGuestState, exit_qualification(diag));
        }

        if let Err((diag, index)) = self.load_guest_msrs(platform) {
            self.set_diag(VmxDiag::Entry(diag));
            return self.vmexit(ctx, platform, VmExitReason::ErrMsrLoad, index as u64 + 1);
        }

        platform.paging_mode_changed(ctx);

        if launch {
            self.vmcs_mut().set_launch_state(LaunchState::Launched);
        }

        self.arm_force_flags(ctx, platform)?;
        self.inject_entry_event(ctx, platform);

        self.set_diag(VmxDiag::Instr {
            instr,
            cause: InstrDiag::Success,
        });
        Ok(VmxStatus::Entered)
    }

    /// See `27.3 Loading Guest State`.
    pub(crate) fn load_guest_state(&mut self, ctx: &mut CpuContext, platform: &dyn Platform) -> Result<(), EntryDiag> {
        let vmcs = self.vmcs();
        let entry_ctls = vmcs.entry_ctls();
        let ia32e = entry_ctls.contains(EntryControls::IA32E_MODE_GUEST);

        ctx.cr0 = vmcs.get(VmcsField::GuestCr0);
        ctx.cr3 = vmcs.get(VmcsField::GuestCr3);
        ctx.cr4 = vmcs.get(VmcsField::GuestCr4);
        if entry_ctls.contains(EntryControls::LOAD_DEBUG) {
            ctx.dr7 = vmcs.get(VmcsField::GuestDr7);
            ctx.debugctl = vmcs.get(VmcsField::GuestDebugCtl);
        }

        ctx.sysenter_cs = vmcs.get(VmcsField::GuestSysenterCs);
        ctx.sysenter_esp = vmcs.get(VmcsField::GuestSysenterEsp);
        ctx.sysenter_eip = vmcs.get(VmcsField::GuestSysenterEip);

        if entry_ctls.contains(EntryControls::LOAD_EFER) {
            ctx.efer = vmcs.get(VmcsField::GuestEfer);
        } else {
            ctx.efer &= !(EFER_LMA | EFER_LME);
            if ia32e {
                ctx.efer |= EFER_LMA | EFER_LME;
            }
        }
        if entry_ctls.contains(EntryControls::LOAD_PAT) {
            ctx.pat = vmcs.get(VmcsField::GuestPat);
        }
        if entry_ctls.contains(EntryControls::LOAD_PERF_GLOBAL_CTRL) {
            ctx.perf_global_ctrl = vmcs.get(VmcsField::GuestPerfGlobalCtrl);
        }

        for reg in SegReg::ALL {
            *ctx.seg_mut(reg) = vmcs.guest_segment(reg);
        }
        ctx.ldtr = vmcs.guest_ldtr();
        ctx.tr = vmcs.guest_tr();
        ctx.gdtr.base = vmcs.get(VmcsField::GuestGdtrBase);
        ctx.gdtr.limit = vmcs.get32(VmcsField::GuestGdtrLimit);
        ctx.idtr.base = vmcs.get(VmcsField::GuestIdtrBase);
        ctx.idtr.limit = vmcs.get32(VmcsField::GuestIdtrLimit);

        ctx.rip = vmcs.get(VmcsField::GuestRip);
        ctx.set_gpr(gpr::RSP, vmcs.get(VmcsField::GuestRsp));
        ctx.rflags = vmcs.get(VmcsField::GuestRflags);

        let int_state = Interruptibility::from_bits_truncate(vmcs.get32(VmcsField::GuestIntState));
        ctx.interrupt_shadow = int_state & (Interruptibility::BLOCK_STI | Interruptibility::BLOCK_MOVSS);
        ctx.nmi_blocked = int_state.contains(Interruptibility::BLOCK_NMI);
        ctx.activity = ActivityState::from_raw(vmcs.get32(VmcsField::GuestActivityState)).unwrap_or_default();
        ctx.pending_dbg = vmcs.get(VmcsField::GuestPendingDbgXcpts);

        let pae_paging = ctx.cr0 & CR0_PG != 0 && ctx.cr4 & CR4_PAE != 0 && !ia32e;
        if pae_paging {
            ctx.pdptes = if vmcs.proc_ctls2().contains(ProcControls2::EPT) {
                vmcs.guest_pdptes()
            } else {
                let base = ctx.cr3 & CR3_PAE_MASK;
                let mut pdptes = [0u64; 4];
                for (i, pdpte) in pdptes.iter_mut().enumerate() {
                    *pdpte = platform
                        .read_phys_u64(base + i as u64 * 8)
                        .map_err(|_| EntryDiag::GuestPdpte)?;
                }
                pdptes
            };
        }

        Ok(())
    }

    /// Loads the bitmaps and the shadow VMCS referenced by the VMCS and registers the APIC-access
    /// page.
    fn load_vmcs_structures(&mut self, platform: &mut dyn Platform) -> Result<(), EntryDiag> {
        let vmcs = self.vmcs();
        let proc = vmcs.proc_ctls();
        let proc2 = vmcs.proc_ctls2();
        let io_bitmaps = (vmcs.get(VmcsField::IoBitmapA), vmcs.get(VmcsField::IoBitmapB));
        let msr_bitmap = vmcs.get(VmcsField::MsrBitmap);
        let vmread_bitmap = vmcs.get(VmcsField::VmreadBitmapAddr);
        let vmwrite_bitmap = vmcs.get(VmcsField::VmwriteBitmapAddr);
        let link_ptr = vmcs.get(VmcsField::VmcsLinkPtr);
        let apic_access = vmcs.get(VmcsField::ApicAccessAddr) & !PAGE_OFFSET_MASK;

        if proc.contains(ProcControls::USE_IO_BITMAPS) {
            self.data
                .io_bitmaps
                .load(platform, io_bitmaps.0, io_bitmaps.1)
                .map_err(|_| EntryDiag::VmcsReadPhys)?;
        }
        if proc.contains(ProcControls::USE_MSR_BITMAPS) {
            self.data
                .msr_bitmap
                .load(platform, msr_bitmap)
                .map_err(|_| EntryDiag::VmcsReadPhys)?;
        }

        if proc2.contains(ProcControls2::VMCS_SHADOWING) {
            self.data
                .vmread_bitmap
                .load(platform, vmread_bitmap)
                .map_err(|_| EntryDiag::VmcsReadPhys)?;
            self.data
                .vmwrite_bitmap
                .load(platform, vmwrite_bitmap)
                .map_err(|_| EntryDiag::VmcsReadPhys)?;

            if link_ptr != VMCS_LINK_PTR_NONE {
                self.data
                    .shadow_vmcs
                    .load(platform, link_ptr)
                    .map_err(|_| EntryDiag::VmcsLinkPtrReadPhys)?;
            }
        }

        if proc2.contains(ProcControls2::VIRT_APIC_ACCESS) {
            self.data.apic_access_gpa = Some(apic_access);
            if self.shared.apic_access.register(apic_access, self.id()) {
                log::trace!("Registering the APIC-access page at {:#x}", apic_access);
                platform.register_apic_access_page(apic_access);
            }
        }

        Ok(())
    }

    /// Loads guest MSRs from the VM-entry MSR-load area. Returns the index of the failing entry.
    ///
    /// See `27.4 Loading MSRs`.
    fn load_guest_msrs(&mut self, platform: &mut dyn Platform) -> Result<(), (EntryDiag, usize)> {
        let count = self.vmcs().get32(VmcsField::EntryMsrLoadCount);
        if count == 0 {
            return Ok(());
        }

        let gpa = self.vmcs().get(VmcsField::EntryMsrLoadAddr);
        let area = auto_msr::read_area(platform, gpa, count).map_err(|_| (EntryDiag::MsrLoadPtrReadPhys, 0))?;

        for (index, entry) in area.iter().enumerate() {
            if entry.reserved != 0 || is_msr_load_reserved(entry.msr) {
                log::debug!("Reserved MSR {:#x} in the VM-entry MSR-load area", entry.msr);
                return Err((EntryDiag::MsrLoadRsvd, index));
            }

            platform.write_msr(entry.msr, entry.value).map_err(|err| match err {
                MsrAccessError::Reserved => (EntryDiag::MsrLoad, index),
                MsrAccessError::NeedsHost => (EntryDiag::MsrLoadRing3, index),
            })?;
        }

        Ok(())
    }

    /// Arms the force flags requested by the execution controls.
    fn arm_force_flags(&mut self, ctx: &CpuContext, platform: &dyn Platform) -> VmxResult<()> {
        let vmcs = self.vmcs();
        let pin = vmcs.pin_ctls();
        let proc = vmcs.proc_ctls();
        let virt_int_delivery = vmcs.proc_ctls2().contains(ProcControls2::VIRT_INT_DELIVERY);
        let entry_mtf = vmcs.entry_int_info().valid() && vmcs.entry_int_info().is_mtf();

        if pin.contains(PinControls::PREEMPT_TIMER) {
            self.arm_preempt_timer(platform);
        }

        let flags = &mut self.data.force_flags;
        flags.set(ForceFlags::MTF, proc.contains(ProcControls::MONITOR_TRAP_FLAG) || entry_mtf);
        flags.set(ForceFlags::NMI_WINDOW, proc.contains(ProcControls::NMI_WINDOW_EXIT));
        flags.set(ForceFlags::INT_WINDOW, proc.contains(ProcControls::INT_WINDOW_EXIT));

        if virt_int_delivery {
            self.evaluate_pending_virt_int(platform)?;
        }

        log::trace!("Force flags after VM-entry: {:?} (RIP {:#x})", self.data.force_flags, ctx.rip);
        Ok(())
    }

    /// Injects the event from the VM-entry interruption-information field, or a pending debug
    /// exception of the nested guest, and consumes the field.
    ///
    /// See `27.6 Event Injection` and `27.7.3 Delivery of Pending Debug Exceptions after VM Entry`.
    fn inject_entry_event(&mut self, ctx: &mut CpuContext, platform: &mut dyn Platform) {
        let vmcs = self.vmcs();
        let info = vmcs.entry_int_info();

        if info.valid() && !info.is_mtf() {
            let event = TrapEvent::from_int_info(
                info,
                vmcs.get32(VmcsField::EntryExceptionErrorCode),
                vmcs.get32(VmcsField::EntryInstrLen) as u8,
            );
            log::trace!("Injecting {:?} on VM-entry", event);

            // Delivery starts in the nested guest, so an exit on the way reports the event.
            self.data.inflight_event = Some(event);
            ctx.activity = ActivityState::Active;
            platform.inject_event(event);
        } else if ctx.pending_dbg & PENDING_DBG_TRIGGER_MASK != 0
            && ctx.interrupt_shadow.is_empty()
            && ctx.activity == ActivityState::Active
        {
            log::trace!("Delivering pending debug exceptions {:#x}", ctx.pending_dbg);

            ctx.dr6 |= ctx.pending_dbg & PENDING_DBG_TRIGGER_MASK;
            ctx.pending_dbg = 0;
            platform.inject_event(TrapEvent::db());
        }

        self.vmcs_mut().consume_entry_int_info();
    }
}
