use crate::vmx::{
    apic::pending::PendingApicWrite,
    data::{io_bitmap::IoBitmaps, msr_bitmap::MsrBitmap, vmcs_bitmap::VmcsBitmap},
    diag::VmxDiag,
    error::VmxAbort,
    events::{ForceFlags, TrapEvent},
    vmcs::cache::VmcsCache,
};
use alloc::boxed::Box;

/// Nested VMX state of one virtual CPU.
pub struct VcpuData {
    /// In VMX operation (between VMXON and VMXOFF), root or non-root.
    pub in_vmx: bool,
    /// Executing the nested guest.
    pub in_non_root: bool,
    pub vmxon_ptr: u64,

    pub vmcs: VmcsCache,
    pub shadow_vmcs: VmcsCache,

    pub msr_bitmap: Box<MsrBitmap>,
    pub io_bitmaps: Box<IoBitmaps>,
    pub vmread_bitmap: Box<VmcsBitmap>,
    pub vmwrite_bitmap: Box<VmcsBitmap>,

    pub force_flags: ForceFlags,
    pub pending_apic_write: Option<PendingApicWrite>,
    /// APIC-access page registered with the platform while in non-root mode.
    pub apic_access_gpa: Option<u64>,

    /// TSC value at which the preemption timer fires.
    pub preempt_deadline: Option<u64>,

    /// NMI blocking at VM-entry, restored if the entry fails after loading guest state.
    pub saved_nmi_blocked: Option<bool>,
    /// Event that was being delivered when a VM-exit happened, reported as IDT-vectoring information.
    pub inflight_event: Option<TrapEvent>,
    /// A VM-exit is being constructed.
    pub in_vmexit: bool,

    pub diag: VmxDiag,
    pub abort: VmxAbort,
}

impl VcpuData {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            in_vmx: false,
            in_non_root: false,
            vmxon_ptr: 0,
            vmcs: VmcsCache::new(),
            shadow_vmcs: VmcsCache::new(),
            msr_bitmap: MsrBitmap::new(),
            io_bitmaps: IoBitmaps::new(),
            vmread_bitmap: VmcsBitmap::new(),
            vmwrite_bitmap: VmcsBitmap::new(),
            force_flags: ForceFlags::empty(),
            pending_apic_write: None,
            apic_access_gpa: None,
            preempt_deadline: None,
            saved_nmi_blocked: None,
            inflight_event: None,
            in_vmexit: false,
            diag: VmxDiag::None,
            abort: VmxAbort::None,
        })
    }

    /// In VMX root operation.
    pub fn in_root(&self) -> bool {
        self.in_vmx && !self.in_non_root
    }
}
