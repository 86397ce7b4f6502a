use crate::{
    platform::Platform,
    vmx::{
        data::{shared_data::SharedData, vcpu_data::VcpuData},
        diag::VmxDiag,
        events::ForceFlags,
        features::VmxFeatures,
        vmcs::{controls::PREEMPT_TIMER_SHIFT, dump, field::VmcsField, Vmcs},
    },
};
use alloc::{boxed::Box, sync::Arc};

/// A virtual CPU with nested VMX support.
///
/// Every VMX instruction, VM-entry, VM-exit and virtual-APIC operation runs on the owning emulation
/// thread and completes within the call.
pub struct Vcpu {
    /// The index of the virtual CPU.
    id: u32,

    pub(crate) shared: Arc<SharedData>,
    pub(crate) data: Box<VcpuData>,
}

impl Vcpu {
    pub fn new(id: u32, shared: Arc<SharedData>) -> Self {
        log::trace!("Creating virtual CPU {}", id);

        Self {
            id,
            shared,
            data: VcpuData::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn features(&self) -> &VmxFeatures {
        &self.shared.features
    }

    pub fn data(&self) -> &VcpuData {
        &self.data
    }

    /// In VMX operation, root or non-root.
    pub fn in_vmx_operation(&self) -> bool {
        self.data.in_vmx
    }

    pub fn in_vmx_root(&self) -> bool {
        self.data.in_root()
    }

    pub fn in_vmx_non_root(&self) -> bool {
        self.data.in_non_root
    }

    pub fn force_flags(&self) -> ForceFlags {
        self.data.force_flags
    }

    /// The last recorded diagnostic.
    pub fn diag(&self) -> VmxDiag {
        self.data.diag
    }

    pub(crate) fn set_diag(&mut self, diag: VmxDiag) {
        if diag != VmxDiag::None {
            log::debug!("VMX diagnostic: {}", diag);
        }
        self.data.diag = diag;
    }

    /// The current VMCS, if any.
    pub fn current_vmcs(&self) -> Option<&Vmcs> {
        self.data.vmcs.is_current().then(|| self.data.vmcs.vmcs())
    }

    pub fn current_vmcs_ptr(&self) -> Option<u64> {
        self.data.vmcs.gpa()
    }

    pub(crate) fn vmcs(&self) -> &Vmcs {
        self.data.vmcs.vmcs()
    }

    pub(crate) fn vmcs_mut(&mut self) -> &mut Vmcs {
        self.data.vmcs.vmcs_mut()
    }

    /// Arms the preemption timer from the value in the VMCS.
    pub(crate) fn arm_preempt_timer(&mut self, platform: &dyn Platform) {
        let value = self.vmcs().get(VmcsField::PreemptTimerValue);
        let deadline = platform.tsc().wrapping_add(value << PREEMPT_TIMER_SHIFT);
        self.data.preempt_deadline = Some(deadline);
        self.data.force_flags.insert(ForceFlags::PREEMPT_TIMER);
    }

    /// Remaining preemption-timer value, as saved into the VMCS on VM-exit.
    pub(crate) fn preempt_timer_remaining(&self, platform: &dyn Platform) -> u64 {
        let Some(deadline) = self.data.preempt_deadline else { return 0 };
        deadline.saturating_sub(platform.tsc()) >> PREEMPT_TIMER_SHIFT
    }

    /// Polled by the outer loop while the preemption timer is armed.
    pub fn preempt_timer_expired(&self, platform: &dyn Platform) -> bool {
        match self.data.preempt_deadline {
            Some(deadline) => platform.tsc() >= deadline,
            None => false,
        }
    }

    /// Logs the VMX state of the virtual CPU.
    pub fn dump_state(&self) {
        log::info!("VMX state of virtual CPU {}:", self.id);
        log::info!("  In VMX operation:   {}", self.data.in_vmx);
        log::info!("  In non-root mode:   {}", self.data.in_non_root);
        log::info!("  VMXON pointer:      {:#x}", self.data.vmxon_ptr);
        log::info!("  Current VMCS:       {:x?}", self.data.vmcs.gpa());
        log::info!("  Shadow VMCS:        {:x?}", self.data.shadow_vmcs.gpa());
        log::info!("  Force flags:        {:?}", self.data.force_flags);
        log::info!("  Pending APIC write: {:x?}", self.data.pending_apic_write);
        log::info!("  Diagnostic:         {}", self.data.diag);
        log::info!("  Abort indicator:    {}", self.data.abort);

        if self.data.vmcs.is_current() {
            dump::dump_vmcs(self.vmcs());
        }
    }
}
